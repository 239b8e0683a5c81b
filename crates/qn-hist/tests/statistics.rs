//! Integration tests: validation threshold, closed-form statistics and
//! attach/persist behaviour across accumulator shapes.

use approx::assert_relative_eq;
use qn_core::{EventClassVariable, EventClassVariableSet, HarmonicSet};
use qn_hist::{
    AccumulatorList, AccumulatorStorage, ComponentsProfile, CorrelationProfile, ErrorMode, Profile,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn event_classes() -> EventClassVariableSet {
    EventClassVariableSet::with_variables(
        "cent_vz",
        vec![
            EventClassVariable::uniform(0, "centrality", 5, 0.0, 50.0).unwrap(),
            EventClassVariable::from_edges(1, "vz", vec![-10.0, -2.0, 2.0, 10.0]).unwrap(),
        ],
    )
}

#[test]
fn below_threshold_bins_read_zero_everywhere() {
    let set = event_classes();
    let mut p = Profile::new("p", &set).with_validation_threshold(3);
    p.create_storage().unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..40 {
        let ev = [rng.gen_range(0.0..50.0), rng.gen_range(-10.0..10.0)];
        p.fill(&ev, rng.gen_range(0.0..5.0)).unwrap();
    }
    for bin in 0..set.n_cells() {
        if p.entries(bin) < 3 {
            assert_eq!(p.content(bin), 0.0);
            assert_eq!(p.error(bin), 0.0);
        } else {
            assert!(p.is_validated(bin));
        }
    }
}

#[test]
fn content_and_error_match_closed_form() {
    let set = event_classes();
    let mut mean_mode = Profile::new("m", &set);
    let mut spread_mode = Profile::new("s", &set).with_error_mode(ErrorMode::Spread);
    mean_mode.create_storage().unwrap();
    spread_mode.create_storage().unwrap();

    let mut rng = StdRng::seed_from_u64(5);
    let ev = [25.0, 0.0];
    let samples: Vec<f64> = (0..200).map(|_| rng.gen_range(-3.0..7.0)).collect();
    for &v in &samples {
        mean_mode.fill(&ev, v).unwrap();
        spread_mode.fill(&ev, v).unwrap();
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let var = samples.iter().map(|v| v * v).sum::<f64>() / n - mean * mean;

    let bin = mean_mode.bin_index(&ev).unwrap();
    assert_relative_eq!(mean_mode.content(bin), mean, epsilon = 1e-10);
    assert_relative_eq!(mean_mode.error(bin), var.sqrt() / n.sqrt(), epsilon = 1e-10);
    assert_relative_eq!(spread_mode.error(bin), var.sqrt(), epsilon = 1e-10);
}

#[test]
fn reattaching_same_storage_is_idempotent() {
    let set = event_classes();
    let harmonics = HarmonicSet::new(&[1, 2, 3]).unwrap();
    let mut writer = ComponentsProfile::new("rec", &set, harmonics).unwrap();
    writer.create_storage().unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..500 {
        let ev = [rng.gen_range(0.0..50.0), rng.gen_range(-10.0..10.0)];
        for h in harmonics.iter() {
            writer.fill_xy(&ev, h, rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)).unwrap();
        }
    }
    let stored = writer.storage().unwrap().clone();

    let read_all = |p: &ComponentsProfile| -> Vec<f64> {
        let mut out = Vec::new();
        for bin in 0..set.n_cells() {
            for h in harmonics.iter() {
                out.push(p.x_content(bin, h).unwrap());
                out.push(p.y_content(bin, h).unwrap());
                out.push(p.x_error(bin, h).unwrap());
                out.push(p.y_error(bin, h).unwrap());
            }
        }
        out
    };

    let mut reader = ComponentsProfile::new("rec", &set, harmonics).unwrap();
    reader.attach(&stored).unwrap();
    let first = read_all(&reader);
    reader.attach(&stored).unwrap();
    assert_eq!(first, read_all(&reader));
}

#[test]
fn attach_rejects_other_dimensionality() {
    let set = event_classes();
    let mut writer =
        CorrelationProfile::new("corr", &set, HarmonicSet::new(&[2]).unwrap()).unwrap();
    writer.create_storage().unwrap();
    let stored = writer.storage().unwrap().clone();

    let mut wrong_harmonics =
        CorrelationProfile::new("corr", &set, HarmonicSet::new(&[2, 3]).unwrap()).unwrap();
    assert!(wrong_harmonics.attach(&stored).is_err());

    let coarse = EventClassVariableSet::with_variables(
        "cent",
        vec![EventClassVariable::uniform(0, "centrality", 5, 0.0, 50.0).unwrap()],
    );
    let mut wrong_axes =
        CorrelationProfile::new("corr", &coarse, HarmonicSet::new(&[2]).unwrap()).unwrap();
    assert!(wrong_axes.attach(&stored).is_err());
}

#[test]
fn storage_list_survives_json() {
    let set = event_classes();
    let mut p = Profile::new("p", &set);
    p.create_storage().unwrap();
    p.fill(&[5.0, 0.0], 2.0).unwrap();
    p.fill(&[5.0, 0.0], 4.0).unwrap();

    let list: AccumulatorList = [p.storage().unwrap().clone()].into_iter().collect();
    let json = serde_json::to_string(&list).unwrap();
    let back: AccumulatorList = serde_json::from_str(&json).unwrap();
    let stored: &AccumulatorStorage = back.get("p").unwrap();

    let mut reader = Profile::new("p", &set);
    reader.attach(stored).unwrap();
    let bin = reader.bin_index(&[5.0, 0.0]).unwrap();
    assert_relative_eq!(reader.content(bin), 3.0);
}
