//! End-to-end runs of the experiment loop against a scripted host.
//!
//! The scripted runner stands in for `tc`, `ping` and the timing program:
//! `ping` reports an average RTT of twice the last applied netem delay (plus
//! an optional jitter), and
//! the timer answers with as many samples as requested unless told otherwise.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kex_bench::checkpoint::{Checkpoint, CHECKPOINT_FILE};
use kex_bench::orchestrator::MANIFEST_FILE;
use kex_bench::{ExperimentError, ExperimentOrchestrator, Phase, RunConfig, StageFailure, TimerFailure};
use kex_netem::test_util::{ping_output, ScriptedRunner};
use kex_netem::{CommandFailure, ProbeFailure};

const TIMER: &str = "./s_timer.o";

#[derive(Clone, Copy, Default)]
struct Faults {
    /// 1-based timer call that answers one sample short.
    short_timer_call: Option<usize>,
    malformed_ping: bool,
    /// 1-based `tc` call that fails.
    failing_tc_call: Option<usize>,
    /// Added to every reported RTT average, in ms.
    rtt_jitter_ms: f64,
}

fn host(faults: Faults) -> Arc<ScriptedRunner> {
    let delay = Mutex::new(String::from("0ms"));
    let timer_calls = AtomicUsize::new(0);
    let tc_calls = AtomicUsize::new(0);

    Arc::new(ScriptedRunner::new(move |argv| {
        let has = |s: &str| argv.iter().any(|a| a == s);

        if has("tc") {
            let n = tc_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if faults.failing_tc_call == Some(n) {
                return Err(CommandFailure::Status {
                    command: argv.join(" "),
                    expected: 0,
                    actual: Some(2),
                    stderr: "Error: Specified qdisc kind is unknown.".into(),
                });
            }
            if let Some(pos) = argv.iter().position(|a| a == "delay") {
                *delay.lock().unwrap() = argv[pos + 1].clone();
            }
            return Ok(String::new());
        }

        if has("ping") {
            if faults.malformed_ping {
                return Ok("30 packets transmitted, 0 received, 100% packet loss\n".into());
            }
            let one_way: f64 = delay
                .lock()
                .unwrap()
                .trim_end_matches("ms")
                .parse()
                .unwrap();
            let avg = one_way * 2.0 + faults.rtt_jitter_ms;
            return Ok(ping_output("10.0.0.1", 30, &format!("{avg:.3}")));
        }

        if has(TIMER) {
            let n = timer_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut count: usize = argv.last().unwrap().parse().unwrap();
            if faults.short_timer_call == Some(n) {
                count -= 1;
            }
            return Ok(vec!["1.25"; count].join(","));
        }

        Ok(String::new())
    }))
}

fn config(dir: &Path, latencies: &[&str], configurations: &[&str], loss_rates: &[f64]) -> RunConfig {
    RunConfig {
        output_dir: dir.to_path_buf(),
        pool_size: 3,
        timers: 4,
        measurements_per_timer: 5,
        latencies: latencies.iter().map(|s| s.to_string()).collect(),
        configurations: configurations.iter().map(|s| s.to_string()).collect(),
        loss_rates: loss_rates.to_vec(),
        ..RunConfig::default()
    }
}

fn csv_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".csv"))
        .collect();
    names.sort();
    names
}

fn rows(path: &Path) -> Vec<Vec<String>> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| l.split(',').map(str::to_string).collect())
        .collect()
}

#[test]
fn single_tier_writes_one_table_with_one_row_per_loss_rate() {
    let dir = tempfile::tempdir().unwrap();
    let runner = host(Faults::default());
    let cfg = config(dir.path(), &["0.69ms"], &["CFG-A"], &[0.0, 1.0]);

    let mut orch = ExperimentOrchestrator::new(cfg, runner).unwrap();
    let summary = orch.run().unwrap();
    assert_eq!(orch.phase(), Phase::Done);

    assert_eq!(csv_files(dir.path()), ["CFG-A_1p380ms.csv"]);
    let table = rows(&dir.path().join("CFG-A_1p380ms.csv"));
    assert_eq!(table.len(), 2);
    assert_eq!(table[0][0], "0");
    assert_eq!(table[1][0], "1");
    for row in &table {
        assert_eq!(row.len(), 1 + 4 * 5);
        assert!(row[1..].iter().all(|v| v == "1.25"));
    }

    assert_eq!(summary.files.len(), 1);
    assert_eq!(summary.files[0].file.rows, 2);
    assert_eq!(summary.files[0].latency, "0.69ms");
}

#[test]
fn every_tier_gets_its_own_tables_in_loss_order() {
    let dir = tempfile::tempdir().unwrap();
    let runner = host(Faults::default());
    let loss_rates = [0.0, 0.1, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0];
    let cfg = config(
        dir.path(),
        &["0.08ms", "21ms"],
        &["CFG-A", "CFG-B"],
        &loss_rates,
    );

    ExperimentOrchestrator::new(cfg, runner.clone())
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(
        csv_files(dir.path()),
        [
            "CFG-A_0p160ms.csv",
            "CFG-A_42p000ms.csv",
            "CFG-B_0p160ms.csv",
            "CFG-B_42p000ms.csv",
        ]
    );
    for name in csv_files(dir.path()) {
        let table = rows(&dir.path().join(&name));
        let written: Vec<f64> = table.iter().map(|r| r[0].parse().unwrap()).collect();
        assert_eq!(written, loss_rates, "{name}");
        assert!(table.iter().all(|r| r.len() == 21), "{name}");
    }

    // 2 tiers × (1 baseline + 2 configurations × 8 loss rates) × 2 scopes.
    let tc = runner
        .commands()
        .iter()
        .filter(|c| c.iter().any(|a| a == "tc"))
        .count();
    assert_eq!(tc, 2 * (1 + 2 * 8) * 2);

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap())
            .unwrap();
    assert_eq!(manifest["files"].as_array().unwrap().len(), 4);
    assert_eq!(manifest["files"][0]["rtt_label"], "0p160");
    assert_eq!(manifest["files"][0]["resumed"], false);
}

#[test]
fn short_timer_response_aborts_without_writing_that_row() {
    let dir = tempfile::tempdir().unwrap();
    // Loss 0 uses timer calls 1..=4, loss 1 starts at call 5.
    let runner = host(Faults {
        short_timer_call: Some(6),
        ..Faults::default()
    });
    let mut cfg = config(dir.path(), &["0.69ms"], &["CFG-A"], &[0.0, 1.0]);
    cfg.pool_size = 1;
    cfg.measurements_per_timer = 100;

    let mut orch = ExperimentOrchestrator::new(cfg, runner).unwrap();
    let err = orch.run().unwrap_err();

    match &err {
        ExperimentError::Aborted {
            latency,
            configuration,
            loss_rate,
            source: StageFailure::Timer(TimerFailure::CountMismatch { expected, actual }),
        } => {
            assert_eq!(latency, "0.69ms");
            assert_eq!(configuration.as_deref(), Some("CFG-A"));
            assert_eq!(*loss_rate, Some(1.0));
            assert_eq!((*expected, *actual), (100, 99));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(csv_files(dir.path()).is_empty());
    let partial = rows(&dir.path().join("CFG-A_1p380ms.csv.partial"));
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0][0], "0");
    assert!(!dir.path().join(MANIFEST_FILE).exists());
}

#[test]
fn malformed_probe_aborts_before_any_table_exists() {
    let dir = tempfile::tempdir().unwrap();
    let runner = host(Faults {
        malformed_ping: true,
        ..Faults::default()
    });
    let cfg = config(dir.path(), &["0.69ms"], &["CFG-A"], &[0.0, 1.0]);

    let mut orch = ExperimentOrchestrator::new(cfg, runner.clone()).unwrap();
    let err = orch.run().unwrap_err();

    assert!(matches!(
        err.stage(),
        Some(StageFailure::Probe(ProbeFailure::Malformed { .. }))
    ));
    assert!(matches!(
        err,
        ExperimentError::Aborted {
            configuration: None,
            loss_rate: None,
            ..
        }
    ));
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    assert!(!runner
        .commands()
        .iter()
        .any(|c| c.iter().any(|a| a == TIMER)));
}

#[test]
fn shaping_failure_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    // Calls 1-2 set the tier baseline, 4 is the server side of loss 0.
    let runner = host(Faults {
        failing_tc_call: Some(4),
        ..Faults::default()
    });
    let cfg = config(dir.path(), &["21ms"], &["CFG-A"], &[0.0, 1.0]);

    let mut orch = ExperimentOrchestrator::new(cfg, runner.clone()).unwrap();
    let err = orch.run().unwrap_err();

    assert!(matches!(err.stage(), Some(StageFailure::Shaping(_))));
    assert!(orch.condition().in_effect().is_none());
    assert!(!runner
        .commands()
        .iter()
        .any(|c| c.iter().any(|a| a == TIMER)));
}

#[test]
fn pool_is_torn_down_on_every_exit_path() {
    let cases = [
        Faults::default(),
        Faults {
            failing_tc_call: Some(1),
            ..Faults::default()
        },
        Faults {
            malformed_ping: true,
            ..Faults::default()
        },
        Faults {
            short_timer_call: Some(1),
            ..Faults::default()
        },
    ];

    for (i, faults) in cases.into_iter().enumerate() {
        let dir = tempfile::tempdir().unwrap();
        let runner = host(faults);
        let cfg = config(dir.path(), &["0.69ms"], &["CFG-A"], &[0.0, 1.0]);

        let mut orch = ExperimentOrchestrator::new(cfg, runner.clone()).unwrap();
        assert_eq!(orch.pool_size(), 3);
        let result = orch.run();

        assert_eq!(result.is_ok(), i == 0, "case {i}");
        assert_eq!(orch.pool_size(), 0, "case {i}");
        let expected = if i == 0 { Phase::Done } else { Phase::Failed };
        assert_eq!(orch.phase(), expected, "case {i}");

        drop(orch);
        assert_eq!(Arc::strong_count(&runner), 1, "case {i}: runner still shared");
    }
}

#[test]
fn resume_skips_complete_tables() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), &["0.69ms"], &["CFG-A", "CFG-B"], &[0.0, 1.0]);

    fs::write(
        dir.path().join("CFG-A_1p380ms.csv"),
        "0,9,9,9\n1,9,9,9\n",
    )
    .unwrap();
    let mut checkpoint = Checkpoint::default();
    checkpoint.set_tier_label("0.69ms", "1p380");
    checkpoint.mark_complete("0.69ms", "CFG-A");
    checkpoint.save(dir.path()).unwrap();

    let runner = host(Faults::default());
    let summary = ExperimentOrchestrator::new(cfg, runner.clone())
        .unwrap()
        .with_resume(true)
        .run()
        .unwrap();

    let timer_configs: Vec<String> = runner
        .commands()
        .iter()
        .filter(|c| c.iter().any(|a| a == TIMER))
        .map(|c| c[c.len() - 2].clone())
        .collect();
    assert!(!timer_configs.is_empty());
    assert!(timer_configs.iter().all(|c| c == "CFG-B"));

    assert!(summary.files[0].resumed);
    assert!(!summary.files[1].resumed);
    // The existing table is left untouched.
    assert_eq!(
        fs::read_to_string(dir.path().join("CFG-A_1p380ms.csv")).unwrap(),
        "0,9,9,9\n1,9,9,9\n"
    );

    let saved = Checkpoint::load(dir.path()).unwrap();
    assert!(saved.is_complete("0.69ms", "CFG-A"));
    assert!(saved.is_complete("0.69ms", "CFG-B"));
}

#[test]
fn resumed_tier_keeps_its_first_label_despite_jitter() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), &["0.69ms"], &["CFG-A", "CFG-B"], &[0.0, 1.0]);

    // CFG-A takes timer calls 1..=8, so call 9 fails CFG-B at loss 0.
    let first = host(Faults {
        short_timer_call: Some(9),
        ..Faults::default()
    });
    let err = ExperimentOrchestrator::new(cfg.clone(), first)
        .unwrap()
        .run()
        .unwrap_err();
    assert!(matches!(
        err,
        ExperimentError::Aborted { ref configuration, .. } if configuration.as_deref() == Some("CFG-B")
    ));

    // The link now measures 1.381ms, which would label the tier 1p381.
    let second = host(Faults {
        rtt_jitter_ms: 0.001,
        ..Faults::default()
    });
    let summary = ExperimentOrchestrator::new(cfg, second.clone())
        .unwrap()
        .with_resume(true)
        .run()
        .unwrap();

    assert!(!second
        .commands()
        .iter()
        .any(|c| c.iter().any(|a| a == "ping")));
    let timer_configs: Vec<String> = second
        .commands()
        .iter()
        .filter(|c| c.iter().any(|a| a == TIMER))
        .map(|c| c[c.len() - 2].clone())
        .collect();
    assert_eq!(timer_configs.len(), 8);
    assert!(timer_configs.iter().all(|c| c == "CFG-B"));

    assert_eq!(
        csv_files(dir.path()),
        ["CFG-A_1p380ms.csv", "CFG-B_1p380ms.csv"]
    );
    assert!(summary.files[0].resumed);
    assert_eq!(summary.files[1].file.rtt_label, "1p380");
    assert!(!summary.files[1].resumed);
}

#[test]
fn fully_completed_run_resumes_without_measuring() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), &["0.69ms", "21ms"], &["CFG-A"], &[0.0, 1.0]);

    ExperimentOrchestrator::new(cfg.clone(), host(Faults::default()))
        .unwrap()
        .run()
        .unwrap();

    let second = host(Faults {
        rtt_jitter_ms: 0.001,
        ..Faults::default()
    });
    let summary = ExperimentOrchestrator::new(cfg, second.clone())
        .unwrap()
        .with_resume(true)
        .run()
        .unwrap();

    assert!(summary.files.iter().all(|f| f.resumed));
    assert!(!second
        .commands()
        .iter()
        .any(|c| c.iter().any(|a| a == TIMER)));
    assert_eq!(
        csv_files(dir.path()),
        ["CFG-A_1p380ms.csv", "CFG-A_42p000ms.csv"]
    );
    assert!(dir.path().join(CHECKPOINT_FILE).exists());
}

#[test]
fn tiers_measuring_the_same_label_abort_before_overwriting() {
    let dir = tempfile::tempdir().unwrap();
    // Both delays put the link at 1.380ms.
    let cfg = config(dir.path(), &["0.69ms", "0.690ms"], &["CFG-A"], &[0.0, 1.0]);
    let runner = host(Faults::default());

    let err = ExperimentOrchestrator::new(cfg, runner.clone())
        .unwrap()
        .run()
        .unwrap_err();

    match &err {
        ExperimentError::Aborted {
            latency,
            configuration: None,
            source: StageFailure::DuplicateLabel { rtt_label, earlier },
            ..
        } => {
            assert_eq!(latency, "0.690ms");
            assert_eq!(rtt_label, "1p380");
            assert_eq!(earlier, "0.69ms");
        }
        other => panic!("unexpected error: {other}"),
    }

    // The first tier's table is intact and nothing ran for the second tier.
    let table = rows(&dir.path().join("CFG-A_1p380ms.csv"));
    assert_eq!(table.len(), 2);
    let timer_calls = runner
        .commands()
        .iter()
        .filter(|c| c.iter().any(|a| a == TIMER))
        .count();
    assert_eq!(timer_calls, 2 * 4);
}

#[test]
fn without_resume_existing_tables_are_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), &["0.69ms"], &["CFG-A"], &[0.0, 1.0]);
    fs::write(dir.path().join("CFG-A_1p380ms.csv"), "stale\n").unwrap();

    ExperimentOrchestrator::new(cfg, host(Faults::default()))
        .unwrap()
        .run()
        .unwrap();

    let table = rows(&dir.path().join("CFG-A_1p380ms.csv"));
    assert_eq!(table.len(), 2);
    assert_eq!(table[0].len(), 21);
}
