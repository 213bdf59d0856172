//! The mode x dispatch matrix.
//!
//! Every cell gets a fresh ring that all of its scenarios share. A cell whose
//! ring cannot be set up in the requested mode is skipped; a cell whose baseline
//! scenario finds resizing unsupported skips the rest of its scenarios, and so does
//! any scenario that stops with operations still in flight: that ring is dropped,
//! never handed to the next scenario. The first failure stops the run.

use core::fmt;
use std::fs::File;
use std::io;

use log::{error, info, warn};

use crate::config::SuiteConfig;
use crate::error::{Outcome, ScenarioError, Verdict};
use crate::io::{Dispatch, RingEngine, RingMode, RingParams, is_unsupported};
use crate::scenario::{self, ScenarioKind, ScenarioReport, open_source};

/// Outcome of one scenario within a cell.
#[derive(Debug)]
pub struct ScenarioResult {
    pub kind: ScenarioKind,
    pub outcome: Outcome,
    /// Present when the scenario passed.
    pub report: Option<ScenarioReport>,
}

/// One (mode, dispatch) cell.
#[derive(Debug)]
pub struct CellReport {
    pub mode: RingMode,
    pub dispatch: Dispatch,
    /// Set when the ring could not be created; no scenario ran.
    pub setup: Option<Outcome>,
    pub scenarios: Vec<ScenarioResult>,
}

impl CellReport {
    pub fn verdict(&self) -> Verdict {
        let setup = self.setup.iter().map(Outcome::verdict);
        let scenarios = self.scenarios.iter().map(|s| s.outcome.verdict());
        setup
            .chain(scenarios)
            .fold(Verdict::Skip, Verdict::combine)
    }
}

impl fmt::Display for CellReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}: {}", self.mode, self.dispatch, self.verdict())?;
        if let Some(setup) = &self.setup {
            write!(f, "\n  setup: {setup}")?;
        }
        for s in &self.scenarios {
            write!(f, "\n  {}: {}", s.kind, s.outcome)?;
            if let Some(report) = &s.report {
                write!(f, " [{report}]")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SuiteReport {
    pub cells: Vec<CellReport>,
}

impl SuiteReport {
    /// Any failure fails the run; otherwise any pass passes it; all skips skip.
    pub fn verdict(&self) -> Verdict {
        self.cells
            .iter()
            .map(CellReport::verdict)
            .fold(Verdict::Skip, Verdict::combine)
    }

    pub fn exit_code(&self) -> i32 {
        self.verdict().exit_code()
    }

    /// Every failed scenario or setup, with its cell.
    pub fn failures(&self) -> impl Iterator<Item = (&CellReport, &ScenarioError)> {
        self.cells.iter().flat_map(|cell| {
            let setup = cell.setup.iter().filter_map(Outcome::error);
            let scenarios = cell.scenarios.iter().filter_map(|s| s.outcome.error());
            setup.chain(scenarios).map(move |e| (cell, e))
        })
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for cell in &self.cells {
            writeln!(f, "{cell}")?;
        }
        write!(f, "result: {}", self.verdict())
    }
}

/// Setup errors that mean "this kernel or this process cannot use the mode".
fn setup_unsupported(err: &io::Error) -> bool {
    // SQPOLL needs privileges on older kernels.
    is_unsupported(err) || err.raw_os_error() == Some(libc::EPERM)
}

/// Runs every selected cell, creating each cell's ring through `open`.
///
/// # Panics
///
/// Panics if `config` is invalid.
pub fn run<E, F>(config: &SuiteConfig, mut open: F) -> SuiteReport
where
    E: RingEngine,
    F: FnMut(RingParams) -> io::Result<E>,
{
    config.validate();

    let source = config.device.as_deref().and_then(|path| {
        match open_source(path, config.buffered) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("cannot open {}: {e}; positional reads will skip", path.display());
                None
            }
        }
    });

    let mut report = SuiteReport::default();
    'matrix: for &mode in &config.modes {
        for &dispatch in &config.dispatches {
            let cell = run_cell(config, &mut open, mode, dispatch, source.as_ref());
            let failed = cell.verdict() == Verdict::Fail;
            report.cells.push(cell);
            if failed {
                break 'matrix;
            }
        }
    }
    report
}

fn run_cell<E, F>(
    config: &SuiteConfig,
    open: &mut F,
    mode: RingMode,
    dispatch: Dispatch,
    source: Option<&File>,
) -> CellReport
where
    E: RingEngine,
    F: FnMut(RingParams) -> io::Result<E>,
{
    let mut cell = CellReport {
        mode,
        dispatch,
        setup: None,
        scenarios: Vec::new(),
    };

    let params = RingParams {
        size: config.setup_size,
        mode,
    };
    let mut ring = match open(params) {
        Ok(ring) => ring,
        Err(e) if setup_unsupported(&e) => {
            warn!("{mode}: ring setup unsupported: {e}");
            cell.setup = Some(Outcome::Skip(format!("ring setup: {e}")));
            return cell;
        }
        Err(e) => {
            error!("{mode}: ring setup failed: {e}");
            cell.setup = Some(Outcome::Fail(ScenarioError::io("ring setup", e)));
            return cell;
        }
    };

    let mut kinds = config.scenarios.iter().copied();
    while let Some(kind) = kinds.next() {
        let result = scenario::run(kind, &mut ring, config, dispatch, source);
        let abandoned = result.as_ref().err().map_or(0, ScenarioError::abandoned);
        let (outcome, report) = match result {
            Ok(report) => (Outcome::Pass, Some(report)),
            Err(e) => (Outcome::from_result::<()>(Err(e)), None),
        };

        match &outcome {
            Outcome::Fail(e) => error!("{mode} / {dispatch} / {kind}: {e}"),
            Outcome::Skip(reason) => info!("{mode} / {dispatch} / {kind}: skipped ({reason})"),
            Outcome::Pass => {}
        }

        let stop = outcome.is_fail();
        let skip_reason = if abandoned > 0 {
            Some(format!("ring left with {abandoned} operations in flight by {kind}"))
        } else if kind == ScenarioKind::Basic && outcome.is_skip() {
            Some("ring resize unsupported".to_string())
        } else {
            None
        };
        cell.scenarios.push(ScenarioResult {
            kind,
            outcome,
            report,
        });
        if stop {
            break;
        }
        if let Some(reason) = skip_reason {
            for rest in kinds.by_ref() {
                cell.scenarios.push(ScenarioResult {
                    kind: rest,
                    outcome: Outcome::Skip(reason.clone()),
                    report: None,
                });
            }
        }
    }

    cell
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::sim::{SimConfig, SimEngine, SimFault};
    use crate::test_utils::small_config;

    fn sim_with(config: SimConfig) -> impl FnMut(RingParams) -> io::Result<SimEngine> {
        move |params| SimEngine::with_config(params, config.clone())
    }

    #[test]
    fn clean_engine_passes_every_cell() {
        let config = small_config();
        let report = run(&config, sim_with(SimConfig::reordered(11)));
        assert_eq!(report.cells.len(), 6);
        assert_eq!(report.verdict(), Verdict::Pass);
        for cell in &report.cells {
            // No source configured: positional reads skip, the rest pass.
            assert_eq!(cell.scenarios.len(), 3);
            assert!(cell.scenarios[0].outcome.is_pass());
            assert!(cell.scenarios[1].outcome.is_skip());
            assert!(cell.scenarios[2].outcome.is_pass());
        }
    }

    #[test]
    fn unsupported_resize_skips_whole_run() {
        let config = small_config();
        let sim = SimConfig::default().with_fault(SimFault::ResizeUnsupported);
        let report = run(&config, sim_with(sim));
        assert_eq!(report.verdict(), Verdict::Skip);
        assert_eq!(report.exit_code(), 77);
        for cell in &report.cells {
            assert_eq!(cell.scenarios.len(), 3);
            assert!(cell.scenarios.iter().all(|s| s.outcome.is_skip()));
        }
    }

    #[test]
    fn setup_unsupported_skips_only_that_mode() {
        let config = small_config();
        let sim = SimConfig::default().with_fault(SimFault::SetupUnsupported {
            mode: RingMode::SqPoll,
        });
        let report = run(&config, sim_with(sim));
        assert_eq!(report.verdict(), Verdict::Pass);
        for cell in &report.cells {
            if cell.mode == RingMode::SqPoll {
                assert!(cell.setup.as_ref().is_some_and(Outcome::is_skip));
                assert!(cell.scenarios.is_empty());
            } else {
                assert!(cell.setup.is_none());
            }
        }
    }

    #[test]
    fn first_failure_stops_the_run() {
        let config = small_config();
        let sim = SimConfig::default().with_fault(SimFault::DropCompletion { nth: 2 });
        let report = run(&config, sim_with(sim));
        assert_eq!(report.verdict(), Verdict::Fail);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.cells.len(), 1);
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.scenarios[0].kind, ScenarioKind::Basic);
    }

    #[test]
    fn setup_errors_other_than_unsupported_fail() {
        let config = small_config();
        let report = run(&config, |_params: RingParams| -> io::Result<SimEngine> {
            Err(io::Error::from_raw_os_error(libc::ENOMEM))
        });
        assert_eq!(report.verdict(), Verdict::Fail);
        assert!(report.cells[0].setup.as_ref().is_some_and(Outcome::is_fail));
    }

    #[test]
    fn skip_with_reads_in_flight_retires_the_ring() {
        let mut config = small_config();
        let device = tempfile::NamedTempFile::new().unwrap();
        device
            .as_file()
            .set_len(config.positional_ops() * config.read_offset_stride)
            .unwrap();
        config.device = Some(device.path().to_path_buf());
        config.buffered = true;

        // Attempt 1 is the baseline resize, 2 the bulk prelude; 3 hits the first
        // drain with a full round in flight.
        let sim = SimConfig::default().with_fault(SimFault::ResizeFails {
            nth: 3,
            errno: libc::EINVAL,
        });
        let mut opened = 0;
        let report = run(&config, |params| {
            opened += 1;
            SimEngine::with_config(params, sim.clone())
        });

        assert_eq!(report.verdict(), Verdict::Pass);
        assert_eq!(opened, report.cells.len());
        for cell in &report.cells {
            assert!(cell.scenarios[0].outcome.is_pass());
            match &cell.scenarios[1].outcome {
                Outcome::Skip(reason) => assert!(reason.contains("abandoned in flight")),
                other => panic!("positional reads: {other}"),
            }
            match &cell.scenarios[2].outcome {
                Outcome::Skip(reason) => assert!(reason.contains("operations in flight")),
                other => panic!("stream reads: {other}"),
            }
        }
    }

    #[test]
    fn eperm_setup_is_a_skip() {
        assert!(setup_unsupported(&io::Error::from_raw_os_error(libc::EPERM)));
        assert!(!setup_unsupported(&io::Error::from_raw_os_error(libc::ENOMEM)));
    }
}
