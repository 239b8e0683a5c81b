use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_qncorr"))
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

const CONFIG: &str = r#"
n_variables: 2
event_classes:
  centrality:
    - { id: 0, label: centrality, bins: 2, min: 0.0, max: 100.0 }
detectors:
  - id: 0
    name: TPC
    configurations:
      - name: TPC
        event_classes: centrality
        harmonics: [1, 2]
        normalization: q_over_m
        cuts:
          - { variable: 1, kind: above, threshold: 0.0 }
        corrections:
          - { type: recentering }
"#;

/// Deterministic events with a preferred direction so that <Qx> is not zero.
fn write_events(path: &Path, n: usize) {
    let mut lines = String::new();
    for i in 0..n {
        let centrality = (i * 37 % 100) as f64 + 0.5;
        let data: Vec<String> = (0..12)
            .map(|j| {
                let phi = 0.3 + 0.5 * j as f64 + 0.01 * i as f64;
                format!(r#"{{"detector":0,"phi":{phi}}}"#)
            })
            .collect();
        lines.push_str(&format!(
            r#"{{"variables":{{"0":{centrality},"1":1.0}},"data":[{}]}}"#,
            data.join(",")
        ));
        lines.push('\n');
    }
    fs::write(path, lines).unwrap();
}

fn read_qx(path: &Path, stage_config: &str) -> Vec<f64> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| {
            let v: serde_json::Value = serde_json::from_str(l).unwrap();
            v["qn"][stage_config]["qx"][0].as_f64().unwrap()
        })
        .collect()
}

#[test]
fn two_pass_run_recenters() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("run.yaml");
    let events = dir.path().join("events.jsonl");
    let calib = dir.path().join("calib.json");
    let out1 = dir.path().join("pass1.jsonl");
    let out2 = dir.path().join("pass2.jsonl");
    let qa = dir.path().join("qa.json");
    fs::write(&config, CONFIG).unwrap();
    write_events(&events, 200);

    let out = run(&[
        "run",
        "--config",
        config.to_str().unwrap(),
        "--events",
        events.to_str().unwrap(),
        "--process",
        "period1",
        "--output",
        out1.to_str().unwrap(),
        "--calibration-out",
        calib.to_str().unwrap(),
    ]);
    assert!(out.status.success(), "pass 1 failed, stderr={}", String::from_utf8_lossy(&out.stderr));
    let plain = read_qx(&out1, "TPC");
    assert_eq!(plain.len(), 200);

    let out = run(&[
        "run",
        "--config",
        config.to_str().unwrap(),
        "--events",
        events.to_str().unwrap(),
        "--calibration",
        calib.to_str().unwrap(),
        "--process",
        "period1",
        "--stage",
        "rec",
        "--output",
        out2.to_str().unwrap(),
        "--qa",
        qa.to_str().unwrap(),
    ]);
    assert!(out.status.success(), "pass 2 failed, stderr={}", String::from_utf8_lossy(&out.stderr));
    let rec = read_qx(&out2, "TPC");
    let mean = rec.iter().sum::<f64>() / rec.len() as f64;
    assert!(mean.abs() < 1e-9, "recentered <Qx> = {mean}");

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&qa).unwrap()).unwrap();
    assert_eq!(report["events"], 200);
    assert_eq!(report["steps"][0]["state"], "applying");

    let out = run(&["inspect", "--calibration", calib.to_str().unwrap()]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("[period1]"));
    assert!(stdout.contains("[all]"));
    assert!(stdout.contains("TPC_rec"));
}

#[test]
fn bad_event_line_fails_with_location() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("run.yaml");
    let events = dir.path().join("events.jsonl");
    fs::write(&config, CONFIG).unwrap();
    let lines = concat!(
        "{\"variables\":{\"0\":10.0,\"1\":1.0},\"data\":[]}\n",
        "{\"data\":[{\"detector\":7,\"phi\":0.1}]}\n",
    );
    fs::write(&events, lines).unwrap();
    let out = run(&[
        "run",
        "--config",
        config.to_str().unwrap(),
        "--events",
        events.to_str().unwrap(),
    ]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("events.jsonl:2"), "stderr={stderr}");
}
