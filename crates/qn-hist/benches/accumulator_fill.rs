use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use qn_core::{EventClassVariable, EventClassVariableSet, HarmonicSet};
use qn_hist::{ChannelizedProfile, ComponentsProfile};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;

fn event_classes() -> EventClassVariableSet {
    EventClassVariableSet::with_variables(
        "bench",
        vec![
            EventClassVariable::uniform(0, "centrality", 10, 0.0, 100.0).unwrap(),
            EventClassVariable::uniform(1, "vz", 10, -10.0, 10.0).unwrap(),
        ],
    )
}

fn make_events(n: usize, seed: u64) -> Vec<[f64; 4]> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            [
                rng.gen_range(0.0..100.0),
                rng.gen_range(-10.0..10.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            ]
        })
        .collect()
}

fn bench_components_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("components_fill");
    let set = event_classes();

    for n_harmonics in [1u32, 4, 8] {
        let harmonics = HarmonicSet::new(&(1..=n_harmonics).collect::<Vec<_>>()).unwrap();
        let events = make_events(10_000, 42);
        group.bench_with_input(
            BenchmarkId::new("fill_xy", n_harmonics),
            &harmonics,
            |b, harmonics| {
                b.iter(|| {
                    let mut p = ComponentsProfile::new("rec", &set, *harmonics).unwrap();
                    p.create_storage().unwrap();
                    for ev in &events {
                        for h in harmonics.iter() {
                            p.fill_xy(ev, h, ev[2], ev[3]).unwrap();
                        }
                    }
                    black_box(p.storage().map(|s| s.total_entries()))
                })
            },
        );
    }

    group.finish();
}

fn bench_channelized_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("channelized_fill");
    let set = event_classes();
    let events = make_events(2_000, 7);

    for n_channels in [32usize, 64] {
        group.bench_with_input(BenchmarkId::new("fill", n_channels), &n_channels, |b, &nc| {
            b.iter(|| {
                let mut p = ChannelizedProfile::new("gain", &set, nc, None).unwrap();
                p.create_storage().unwrap();
                for ev in &events {
                    for ch in 0..nc {
                        p.fill(ev, ch, ev[2].abs() * ch as f64).unwrap();
                    }
                }
                black_box(p.storage().map(|s| s.total_entries()))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_components_fill, bench_channelized_fill);
criterion_main!(benches);
