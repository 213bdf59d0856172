//! Per-round completion draining.
//!
//! The loop is driven by the round's accepted count, never by polling until the
//! ring looks empty: a lost completion shows up as a stall, an extra one as a
//! window or duplicate violation.
//!
//! Round state machine:
//!
//! ```text
//! SUBMIT -> RESIZE (non-empty round) -> DRAIN(k) -> ... -> done
//!                                          |
//!                                          +-> RESIZE at k = stride, 2*stride, ...
//! ```

use std::io;

use log::{debug, warn};

use crate::buffer::BufferPool;
use crate::capacity::CapacityController;
use crate::error::{ScenarioError, Violation};
use crate::io::{Cqe, RingEngine};
use crate::submit::Round;
use crate::tracker::{BatchWindow, CompletionTracker};

/// Counters for the completions of one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub completed: u32,
    pub bytes: u64,
    /// Reads that returned fewer bytes than requested (including zero).
    pub short_reads: u32,
    /// Reads that returned zero bytes.
    pub empty_reads: u32,
}

/// Everything a round's drain touches besides the engine.
pub struct Drain<'a> {
    pub tracker: &'a mut CompletionTracker,
    pub pool: &'a mut BufferPool,
    pub controller: &'a mut CapacityController,
    /// Byte every successfully read byte must equal, if known.
    pub pattern: Option<u8>,
}

impl Drain<'_> {
    /// Reaps exactly `round.accepted` completions.
    ///
    /// `health` is polled before every wait; its error aborts the drain.
    pub fn run<E, H>(
        &mut self,
        ring: &mut E,
        round: &Round,
        mut health: H,
    ) -> Result<DrainStats, ScenarioError>
    where
        E: RingEngine,
        H: FnMut() -> Result<(), ScenarioError>,
    {
        let mut stats = DrainStats::default();
        let Some(window) = round.window else {
            assert_eq!(round.accepted, 0);
            return Ok(stats);
        };
        assert_eq!(window.len(), u64::from(round.accepted));

        self.controller.before_drain(ring)?;

        for drained in 1..=round.accepted {
            health()?;

            let cqe = wait_for(ring, window, drained - 1, round.accepted)?;
            if cqe.result < 0 {
                return Err(Violation::NegativeResult {
                    user_data: cqe.user_data,
                    result: cqe.result,
                }
                .into());
            }
            self.tracker.observe(cqe.user_data)?;
            ring.cqe_seen();

            let index = self
                .pool
                .index_after(round.first_buffer, cqe.user_data - window.start);
            let outcome = self.check_read(index, &cqe);
            self.pool.release(index);
            let n = outcome?;

            stats.completed += 1;
            stats.bytes += n as u64;
            if n < self.pool.get(index).len() {
                stats.short_reads += 1;
                if n == 0 {
                    stats.empty_reads += 1;
                    warn!("user_data {}: zero-byte read", cqe.user_data);
                } else {
                    debug!("user_data {}: short read {n}", cqe.user_data);
                }
            }

            self.controller.after_completion(ring, drained)?;
        }

        Ok(stats)
    }

    /// Returns the byte count, after checking it against the expected pattern.
    fn check_read(&self, index: usize, cqe: &Cqe) -> Result<usize, Violation> {
        let n = cqe.result as usize;
        let buf = self.pool.get(index).as_slice();
        assert!(n <= buf.len(), "read returned more bytes than requested");

        if let Some(expected) = self.pattern
            && let Some(offset) = buf[..n].iter().position(|&b| b != expected)
        {
            return Err(Violation::Corrupted {
                user_data: cqe.user_data,
                offset,
                expected,
                found: buf[offset],
            });
        }
        Ok(n)
    }
}

/// Blocks for the next completion. An engine that reports it would block forever
/// has lost a completion of `window`.
pub(crate) fn wait_for<E: RingEngine>(
    ring: &mut E,
    window: BatchWindow,
    drained: u32,
    expected: u32,
) -> Result<Cqe, ScenarioError> {
    match ring.wait_cqe() {
        Ok(cqe) => Ok(cqe),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(Violation::Stalled {
            window,
            drained,
            expected,
        }
        .into()),
        Err(e) => Err(ScenarioError::io("wait for completion", e)),
    }
}
