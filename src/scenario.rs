//! The three verification scenarios.
//!
//! Each runs against a ring the caller owns and reuses across scenarios of one
//! matrix cell, so a later scenario starts from whatever size the previous one
//! left behind.
//!
//! - [`ScenarioKind::Basic`]: two NOPs around a resize, reaped in order
//! - [`ScenarioKind::PositionalReads`]: bulk reads from a random-access source
//! - [`ScenarioKind::StreamReads`]: bulk reads from a pipe fed by the stimulus actor

use core::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread;

use log::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::capacity::{CapacityController, CapacitySchedule};
use crate::config::SuiteConfig;
use crate::constants::{EMPTY_ROUNDS_MAX, PAGE_SIZE};
use crate::drain::{Drain, DrainStats, wait_for};
use crate::error::{ScenarioError, Violation};
use crate::io::{Dispatch, RingEngine, RingSize};
use crate::stimulus::{STREAM_PATTERN, StimulusActor};
use crate::submit::{ReadSource, Round, SubmissionDriver, submit_nop};
use crate::tracker::{self, BatchWindow, CompletionTracker, IdAllocator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    Basic,
    PositionalReads,
    StreamReads,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 3] = [
        ScenarioKind::Basic,
        ScenarioKind::PositionalReads,
        ScenarioKind::StreamReads,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioKind::Basic => "basic",
            ScenarioKind::PositionalReads => "positional-reads",
            ScenarioKind::StreamReads => "stream-reads",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Totals for one scenario run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub kind: ScenarioKind,
    pub rounds: u64,
    /// Rounds in which the ring refused the very first slot.
    pub empty_rounds: u64,
    pub submitted: u64,
    pub completed: u64,
    pub resizes: u64,
    pub short_reads: u64,
    pub empty_reads: u64,
    pub bytes: u64,
    /// Smallest non-empty round, if any.
    pub smallest_round: Option<u32>,
    /// Largest round.
    pub largest_round: u32,
    /// Ring size when the scenario ended.
    pub final_size: RingSize,
}

impl ScenarioReport {
    pub fn new(kind: ScenarioKind, size: RingSize) -> Self {
        Self {
            kind,
            rounds: 0,
            empty_rounds: 0,
            submitted: 0,
            completed: 0,
            resizes: 0,
            short_reads: 0,
            empty_reads: 0,
            bytes: 0,
            smallest_round: None,
            largest_round: 0,
            final_size: size,
        }
    }

    fn absorb(&mut self, round: &Round, stats: &DrainStats) {
        self.rounds += 1;
        if round.is_empty() {
            self.empty_rounds += 1;
        } else {
            self.smallest_round = Some(
                self.smallest_round
                    .map_or(round.accepted, |s| s.min(round.accepted)),
            );
        }
        self.largest_round = self.largest_round.max(round.accepted);
        self.submitted += u64::from(round.accepted);
        self.completed += u64::from(stats.completed);
        self.short_reads += u64::from(stats.short_reads);
        self.empty_reads += u64::from(stats.empty_reads);
        self.bytes += stats.bytes;
    }

    /// Every accepted op was reaped exactly once.
    pub fn reconciled(&self) -> bool {
        self.submitted == self.completed
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} rounds ({} empty), {}/{} completed, {} resizes, ",
            self.kind, self.rounds, self.empty_rounds, self.completed, self.submitted, self.resizes,
        )?;
        write!(
            f,
            "{} bytes, {} short reads, final {}",
            self.bytes, self.short_reads, self.final_size,
        )
    }
}

/// Opens the random-access source read-only, with `O_DIRECT` unless `buffered`.
pub fn open_source(path: &Path, buffered: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if !buffered {
        options.custom_flags(libc::O_DIRECT);
    }
    options.open(path)
}

/// Runs one scenario. `source` is the already-opened random-access source for
/// [`ScenarioKind::PositionalReads`]; without one that scenario is unsupported.
pub fn run<E: RingEngine>(
    kind: ScenarioKind,
    ring: &mut E,
    config: &SuiteConfig,
    dispatch: Dispatch,
    source: Option<&File>,
) -> Result<ScenarioReport, ScenarioError> {
    let report = match kind {
        ScenarioKind::Basic => run_basic(ring, config, dispatch)?,
        ScenarioKind::PositionalReads => {
            let Some(file) = source else {
                return Err(ScenarioError::Unsupported(
                    "no random-access source configured".into(),
                ));
            };
            run_positional(ring, config, dispatch, file)?
        }
        ScenarioKind::StreamReads => run_stream(ring, config, dispatch)?,
    };
    info!("{} / {} / {}: {report}", ring.mode(), dispatch, kind);
    Ok(report)
}

/// Two-op baseline: NOP 1, resize, NOP 2, then both completions in order.
///
/// A resize the engine rejects as unsupported makes the whole scenario a skip.
pub fn run_basic<E: RingEngine>(
    ring: &mut E,
    config: &SuiteConfig,
    dispatch: Dispatch,
) -> Result<ScenarioReport, ScenarioError> {
    let mut report = ScenarioReport::new(ScenarioKind::Basic, ring.size());
    let mut ids = IdAllocator::new();
    let mut controller = CapacityController::new(
        CapacitySchedule::new(vec![config.basic_size]),
        config.resize_stride,
    );

    let first = ids.allocate();
    submit_nop(ring, first, dispatch)?;
    controller.resize(ring, config.basic_size)?;
    let second = ids.allocate();
    submit_nop(ring, second, dispatch)?;
    report.submitted = 2;

    for (reaped, expected) in [first, second].into_iter().enumerate() {
        let window = BatchWindow::single(expected);
        let cqe = wait_for(ring, window, reaped as u32, 2)?;
        if cqe.result < 0 {
            return Err(Violation::NegativeResult {
                user_data: cqe.user_data,
                result: cqe.result,
            }
            .into());
        }
        tracker::validate(cqe.user_data, &window)?;
        ring.cqe_seen();
        report.completed += 1;
    }

    report.rounds = 2;
    report.smallest_round = Some(1);
    report.largest_round = 1;
    report.resizes = controller.resizes();
    report.final_size = ring.size();
    Ok(report)
}

/// Bulk reads at fixed offsets until the read budget is accounted for.
pub fn run_positional<E: RingEngine>(
    ring: &mut E,
    config: &SuiteConfig,
    dispatch: Dispatch,
    file: &File,
) -> Result<ScenarioReport, ScenarioError> {
    let source = ReadSource::positional(file.as_raw_fd(), config.read_offset_stride);
    let mut bulk = Bulk::new(ScenarioKind::PositionalReads, ring, config, dispatch);
    let result = bulk.run(ring, source, config.positional_ops(), || Ok(()));
    bulk.finish(ring, result)
}

/// Bulk reads from a pipe while the stimulus actor writes into it.
pub fn run_stream<E: RingEngine>(
    ring: &mut E,
    config: &SuiteConfig,
    dispatch: Dispatch,
) -> Result<ScenarioReport, ScenarioError> {
    let actor = StimulusActor::spawn(config.stimulus)?;
    let source = ReadSource::stream(actor.reader_fd(), STREAM_PATTERN);

    let mut bulk = Bulk::new(ScenarioKind::StreamReads, ring, config, dispatch);
    let result = bulk.run(ring, source, config.stream_ops(), || actor.check());
    let report = bulk.finish(ring, result)?;

    let summary = actor.finish()?;
    debug!(
        "stimulus: {} writes, {} bytes, {} short",
        summary.writes, summary.bytes, summary.short_writes
    );
    Ok(report)
}

/// Shared state of a bulk-read scenario.
struct Bulk {
    report: ScenarioReport,
    tracker: CompletionTracker,
    pool: BufferPool,
    controller: CapacityController,
    driver: SubmissionDriver,
    prelude: RingSize,
}

impl Bulk {
    fn new<E: RingEngine>(
        kind: ScenarioKind,
        ring: &E,
        config: &SuiteConfig,
        dispatch: Dispatch,
    ) -> Self {
        Self {
            report: ScenarioReport::new(kind, ring.size()),
            tracker: CompletionTracker::new(),
            pool: BufferPool::new(config.fan_out as usize, config.record_len, PAGE_SIZE),
            controller: CapacityController::new(config.schedule.clone(), config.resize_stride),
            driver: SubmissionDriver::new(config.fan_out, dispatch),
            prelude: config.prelude_size,
        }
    }

    /// Submit/drain rounds until `total` ops have completed.
    fn run<E, H>(
        &mut self,
        ring: &mut E,
        mut source: ReadSource,
        total: u64,
        mut health: H,
    ) -> Result<(), ScenarioError>
    where
        E: RingEngine,
        H: FnMut() -> Result<(), ScenarioError>,
    {
        self.controller.resize(ring, self.prelude)?;

        let mut remaining = total;
        let mut idle = 0u32;
        while remaining > 0 {
            health()?;

            let limit = remaining.min(u64::from(self.driver.fan_out())) as u32;
            let round = self.driver.submit_round(
                ring,
                &mut self.tracker,
                &mut self.pool,
                &mut source,
                limit,
            )?;
            let stats = Drain {
                tracker: &mut self.tracker,
                pool: &mut self.pool,
                controller: &mut self.controller,
                pattern: source.pattern(),
            }
            .run(ring, &round, &mut health)?;

            self.report.absorb(&round, &stats);
            remaining -= u64::from(round.accepted);

            if round.is_empty() {
                idle += 1;
                if idle >= EMPTY_ROUNDS_MAX {
                    return Err(Violation::NoProgress { rounds: idle }.into());
                }
                thread::yield_now();
            } else {
                idle = 0;
            }
        }

        self.tracker.finish()?;
        Ok(())
    }

    fn finish<E: RingEngine>(
        self,
        ring: &E,
        result: Result<(), ScenarioError>,
    ) -> Result<ScenarioReport, ScenarioError> {
        let Bulk {
            mut report,
            tracker,
            pool,
            controller,
            ..
        } = self;

        if let Err(e) = result {
            let in_flight = pool.in_flight();
            if in_flight == 0 {
                return Err(e);
            }
            // The engine may still write into these buffers.
            warn!(
                "{} reads unresolved after failure; leaking their buffers",
                tracker.outstanding()
            );
            std::mem::forget(pool);
            return Err(ScenarioError::Abandoned {
                in_flight,
                source: Box::new(e),
            });
        }

        assert!(report.reconciled());
        assert_eq!(report.completed, tracker.observed());
        report.resizes = controller.resizes();
        report.final_size = ring.size();
        Ok(report)
    }
}
