use std::fs::File;

use proptest::prelude::*;
use ring_resize::config::SuiteConfig;
use ring_resize::error::{ScenarioError, Verdict, Violation};
use ring_resize::io::sim::{SimConfig, SimEngine, SimFault};
use ring_resize::io::{Dispatch, RingEngine, RingMode, RingParams, RingSize};
use ring_resize::scenario::{self, ScenarioKind, ScenarioReport};
use ring_resize::suite;
use ring_resize::test_utils::{proptest_cases, small_config};
use ring_resize::tracker::BatchWindow;

fn ring(config: &SuiteConfig, sim: SimConfig) -> SimEngine {
    SimEngine::with_config(
        RingParams {
            size: config.setup_size,
            mode: RingMode::Default,
        },
        sim,
    )
    .unwrap()
}

fn source_for(config: &SuiteConfig) -> File {
    let file = tempfile::tempfile().unwrap();
    file.set_len(config.positional_ops() * config.read_offset_stride)
        .unwrap();
    file
}

fn positional(
    config: &SuiteConfig,
    sim: SimConfig,
) -> (SimEngine, Result<ScenarioReport, ScenarioError>) {
    let file = source_for(config);
    let mut ring = ring(config, sim);
    let result = scenario::run_positional(&mut ring, config, Dispatch::NonBlocking, &file);
    (ring, result)
}

#[test]
fn shrink_below_fan_out_yields_smaller_round_and_reconciles() {
    let config = small_config();
    let (ring, result) = positional(&config, SimConfig::default());
    let report = result.unwrap();

    // The ring drops to 16 submission entries while a 32-op round is in flight;
    // the next round is capped at 16.
    assert!(ring.flush_log().contains(&16));
    assert!(report.smallest_round.is_some_and(|n| n <= 16));
    assert_eq!(report.largest_round, config.fan_out);
    assert!(report.reconciled());
    assert_eq!(report.completed, config.positional_ops());
    let flushed: u64 = ring.flush_log().iter().map(|&n| u64::from(n)).sum();
    assert_eq!(flushed, report.completed);
}

#[test]
fn schedule_cycles_through_every_target() {
    let config = small_config();
    let (ring, result) = positional(&config, SimConfig::default());
    let report = result.unwrap();

    let log = ring.resize_log();
    assert_eq!(log.len() as u64, report.resizes);
    assert_eq!(log[0], config.prelude_size);
    for target in config.schedule.targets() {
        assert!(log.contains(target), "{target} never applied");
    }
}

#[test]
fn empty_round_is_legal_and_progress_continues() {
    let config = small_config();
    let sim = SimConfig::default().with_fault(SimFault::SqBusy { round: 2 });
    let (ring, result) = positional(&config, sim);
    let report = result.unwrap();

    assert_eq!(ring.flush_log()[1], 0);
    assert_eq!(report.empty_rounds, 1);
    assert_eq!(report.completed, config.positional_ops());
}

#[test]
fn dropped_completion_is_reported_as_stall() {
    let config = small_config();
    let sim = SimConfig::default().with_fault(SimFault::DropCompletion { nth: 10 });
    let (_, result) = positional(&config, sim);
    assert_eq!(
        result.unwrap_err().violation(),
        Some(&Violation::Stalled {
            window: BatchWindow::new(1, 32),
            drained: 31,
            expected: 32
        })
    );
}

#[test]
fn duplicated_completion_is_caught_in_its_window() {
    let config = small_config();
    let sim = SimConfig::default().with_fault(SimFault::DuplicateCompletion { nth: 40 });
    let (_, result) = positional(&config, sim);
    assert_eq!(
        result.unwrap_err().violation(),
        Some(&Violation::Duplicate {
            window: BatchWindow::new(33, 64),
            observed: 40
        })
    );
}

#[test]
fn stale_id_from_previous_round_is_out_of_window() {
    let config = small_config();
    // First completion of round two carries the last id of round one.
    let fault = SimFault::ForeignTag {
        nth: 33,
        offset: u64::MAX,
    };
    let (_, result) = positional(&config, SimConfig::default().with_fault(fault));
    let err = result.unwrap_err();
    assert_eq!(
        err.violation(),
        Some(&Violation::OutOfWindow {
            window: BatchWindow::new(33, 64),
            observed: 32
        })
    );
    assert_eq!(err.root().to_string(), "user_data out-of-range: <33-64>: 32");
    assert_eq!(err.abandoned(), 32);
}

#[test]
fn misattribution_inside_the_window_surfaces_as_duplicate() {
    let config = small_config();
    let fault = SimFault::ForeignTag { nth: 1, offset: 1 };
    let (_, result) = positional(&config, SimConfig::default().with_fault(fault));
    assert!(matches!(
        result.unwrap_err().violation(),
        Some(Violation::Duplicate { observed: 2, .. })
    ));
}

#[test]
fn negative_result_is_fatal() {
    let config = small_config();
    let fault = SimFault::NegativeResult {
        nth: 5,
        errno: libc::EIO,
    };
    let (_, result) = positional(&config, SimConfig::default().with_fault(fault));
    assert_eq!(
        result.unwrap_err().violation(),
        Some(&Violation::NegativeResult {
            user_data: 5,
            result: -libc::EIO
        })
    );
}

#[test]
fn flush_shortfall_is_a_submit_mismatch() {
    let config = small_config();
    let sim = SimConfig::default().with_fault(SimFault::FlushShortfall { nth: 1 });
    let (_, result) = positional(&config, sim);
    assert_eq!(
        result.unwrap_err().violation(),
        Some(&Violation::SubmitMismatch {
            placed: 32,
            accepted: 31
        })
    );
}

#[test]
fn resize_failure_other_than_unsupported_fails() {
    let config = small_config();
    let fault = SimFault::ResizeFails {
        nth: 3,
        errno: libc::EOVERFLOW,
    };
    let (_, result) = positional(&config, SimConfig::default().with_fault(fault));
    let err = result.unwrap_err();
    assert!(!err.is_skip());
    match err.root() {
        ScenarioError::Resize { size, source } => {
            assert_eq!(*size, RingSize::new(64, 256));
            assert_eq!(source.raw_os_error(), Some(libc::EOVERFLOW));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn unsupported_resize_mid_scenario_reports_reads_left_in_flight() {
    let config = small_config();
    // Attempt 1 is the prelude; attempt 2 precedes the first drain.
    let fault = SimFault::ResizeFails {
        nth: 2,
        errno: libc::EINVAL,
    };
    let (ring, result) = positional(&config, SimConfig::default().with_fault(fault));
    let err = result.unwrap_err();
    assert!(err.is_skip());
    assert_eq!(err.abandoned(), 32);
    assert_eq!(ring.in_flight(), 32);
}

#[test]
fn unsupported_resize_is_an_idempotent_skip() {
    let config = small_config();
    let mut ring = ring(&config, SimConfig::default().with_fault(SimFault::ResizeUnsupported));
    let before = ring.size();

    for _ in 0..2 {
        let err = scenario::run_basic(&mut ring, &config, Dispatch::Immediate).unwrap_err();
        assert!(err.is_skip());
        assert_eq!(ring.size(), before);
        assert!(ring.resize_log().is_empty());
    }
}

#[test]
fn stream_reads_reconcile_under_concurrent_production() {
    let config = small_config();
    let mut ring = ring(&config, SimConfig::reordered(99));
    let report = scenario::run_stream(&mut ring, &config, Dispatch::NonBlocking).unwrap();
    assert_eq!(report.completed, config.stream_ops());
    assert!(report.reconciled());
    assert!(report.resizes > 0);
}

#[test]
fn suite_with_device_runs_every_scenario() {
    let mut config = small_config();
    let device = tempfile::NamedTempFile::new().unwrap();
    device
        .as_file()
        .set_len(config.positional_ops() * config.read_offset_stride)
        .unwrap();
    config.device = Some(device.path().to_path_buf());
    config.modes = vec![RingMode::Default, RingMode::SingleIssuerDeferTaskrun];

    let sim = SimConfig::reordered(5).with_fault(SimFault::SetupUnsupported {
        mode: RingMode::SingleIssuerDeferTaskrun,
    });
    let report = suite::run(&config, |params| SimEngine::with_config(params, sim.clone()));

    assert_eq!(report.verdict(), Verdict::Pass);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.cells.len(), 4);
    for cell in &report.cells {
        if cell.mode == RingMode::Default {
            let kinds: Vec<_> = cell.scenarios.iter().map(|s| s.kind).collect();
            assert_eq!(kinds, ScenarioKind::ALL.to_vec());
            assert!(cell.scenarios.iter().all(|s| s.outcome.is_pass()));
        } else {
            assert_eq!(cell.verdict(), Verdict::Skip);
        }
    }
}

#[test]
fn unopenable_device_skips_positional_reads_only() {
    let mut config = small_config();
    config.device = Some("/nonexistent/ring-resize-device".into());
    config.modes = vec![RingMode::Default];
    config.dispatches = vec![Dispatch::Immediate];

    let report = suite::run(&config, |params| {
        SimEngine::with_config(params, SimConfig::default())
    });
    assert_eq!(report.verdict(), Verdict::Pass);
    let cell = &report.cells[0];
    assert!(cell.scenarios[0].outcome.is_pass());
    assert!(cell.scenarios[1].outcome.is_skip());
    assert!(cell.scenarios[2].outcome.is_pass());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(proptest_cases(16)))]

    #[test]
    fn totals_reconcile_for_any_seed_and_fan_out(
        seed in any::<u64>(),
        fan_out in 1u32..=64,
        ops in 1u64..400,
    ) {
        let mut config = small_config();
        config.fan_out = fan_out;
        config.read_budget_bytes = ops * u64::from(config.record_len);

        let (ring, result) = positional(&config, SimConfig::reordered(seed));
        let report = result.unwrap();
        prop_assert_eq!(report.completed, ops);
        prop_assert!(report.reconciled());
        prop_assert!(report.largest_round <= fan_out);
        let flushed: u64 = ring.flush_log().iter().map(|&n| u64::from(n)).sum();
        prop_assert_eq!(flushed, ops);
        prop_assert_eq!(ring.in_flight(), 0);
    }
}
