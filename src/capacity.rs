//! Resize scheduling.
//!
//! [`CapacitySchedule`] is the ordered cycle of ring sizes a scenario walks through;
//! [`CapacityController`] decides *when* to take the next step and classifies
//! resize failures.

use log::{debug, warn};

use crate::error::ScenarioError;
use crate::io::{RingEngine, RingSize, is_unsupported};

/// Finite cycle of resize targets, advanced by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacitySchedule {
    targets: Vec<RingSize>,
    cursor: usize,
}

impl CapacitySchedule {
    /// # Panics
    ///
    /// Panics if `targets` is empty or any target is invalid.
    pub fn new(targets: Vec<RingSize>) -> Self {
        assert!(!targets.is_empty(), "schedule needs at least one target");
        for target in &targets {
            target.validate();
        }
        Self { targets, cursor: 0 }
    }

    /// Builds the lockstep cycle of two independent SQ and CQ cycles. Its period
    /// is the least common multiple of the two lengths.
    pub fn lockstep(sq: &[u32], cq: &[u32]) -> Self {
        assert!(!sq.is_empty() && !cq.is_empty());
        let period = lcm(sq.len(), cq.len());
        let targets = (0..period)
            .map(|i| RingSize::new(sq[i % sq.len()], cq[i % cq.len()]))
            .collect();
        Self::new(targets)
    }

    /// SQ 32 -> 64 -> 16, CQ 128 <-> 256: six distinct sizes mixing growth and
    /// shrinkage on both rings.
    pub fn cycle_default() -> Self {
        Self::lockstep(&[32, 64, 16], &[128, 256])
    }

    /// Target the next [`advance`](Self::advance) returns.
    pub fn peek(&self) -> RingSize {
        self.targets[self.cursor]
    }

    /// Returns the current target and moves to the next, wrapping.
    pub fn advance(&mut self) -> RingSize {
        let target = self.targets[self.cursor];
        self.cursor = (self.cursor + 1) % self.targets.len();
        target
    }

    pub fn targets(&self) -> &[RingSize] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Always `false`: a schedule holds at least one target.
    pub fn is_empty(&self) -> bool {
        false
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

/// Issues resizes at the protocol's scheduled points.
///
/// Only the orchestrator context holds the engine, so a resize never overlaps a
/// submit or a wait.
#[derive(Debug)]
pub struct CapacityController {
    schedule: CapacitySchedule,
    stride: u32,
    resizes: u64,
}

impl CapacityController {
    pub fn new(schedule: CapacitySchedule, stride: u32) -> Self {
        assert!(stride > 0);
        Self {
            schedule,
            stride,
            resizes: 0,
        }
    }

    /// Resizes to `size`.
    ///
    /// An engine that does not support the request yields
    /// [`ScenarioError::Unsupported`]; any other failure is fatal.
    pub fn resize<E: RingEngine>(
        &mut self,
        ring: &mut E,
        size: RingSize,
    ) -> Result<(), ScenarioError> {
        let before = ring.size();
        match ring.resize(size) {
            Ok(()) => {
                self.resizes += 1;
                debug!("resize {} -> {} (now {})", before, size, ring.size());
                Ok(())
            }
            Err(e) if is_unsupported(&e) => {
                warn!("resize to {size} unsupported in {} mode: {e}", ring.mode());
                Err(ScenarioError::Unsupported(format!(
                    "resize to {size} in {} mode: {e}",
                    ring.mode()
                )))
            }
            Err(source) => Err(ScenarioError::Resize { size, source }),
        }
    }

    /// Resize issued once a round has been flushed, before its first wait.
    pub fn before_drain<E: RingEngine>(&mut self, ring: &mut E) -> Result<(), ScenarioError> {
        let target = self.schedule.advance();
        self.resize(ring, target)
    }

    /// Called after each completion is acknowledged; `drained` counts completions
    /// reaped so far in this round, starting at 1.
    pub fn after_completion<E: RingEngine>(
        &mut self,
        ring: &mut E,
        drained: u32,
    ) -> Result<(), ScenarioError> {
        if !self.due(drained) {
            return Ok(());
        }
        let target = self.schedule.advance();
        self.resize(ring, target)
    }

    /// Whether a resize follows the `drained`th completion of a round.
    #[inline]
    pub fn due(&self, drained: u32) -> bool {
        drained > 0 && drained.is_multiple_of(self.stride)
    }

    /// Successful resizes so far.
    pub fn resizes(&self) -> u64 {
        self.resizes
    }

    pub fn schedule(&self) -> &CapacitySchedule {
        &self.schedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::sim::{SimConfig, SimEngine, SimFault};
    use crate::io::{RingMode, RingParams};

    fn sim(config: SimConfig) -> SimEngine {
        SimEngine::with_config(
            RingParams {
                size: RingSize::new(8, 8),
                mode: RingMode::Default,
            },
            config,
        )
        .unwrap()
    }

    #[test]
    fn default_cycle_matches_lockstep_walk() {
        let schedule = CapacitySchedule::cycle_default();
        assert_eq!(
            schedule.targets(),
            &[
                RingSize::new(32, 128),
                RingSize::new(64, 256),
                RingSize::new(16, 128),
                RingSize::new(32, 256),
                RingSize::new(64, 128),
                RingSize::new(16, 256),
            ]
        );
    }

    #[test]
    fn advance_wraps() {
        let mut schedule =
            CapacitySchedule::new(vec![RingSize::new(16, 32), RingSize::new(32, 64)]);
        assert_eq!(schedule.advance(), RingSize::new(16, 32));
        assert_eq!(schedule.advance(), RingSize::new(32, 64));
        assert_eq!(schedule.peek(), RingSize::new(16, 32));
        assert_eq!(schedule.advance(), RingSize::new(16, 32));
    }

    #[test]
    #[should_panic(expected = "schedule needs at least one target")]
    fn empty_schedule_panics() {
        let _ = CapacitySchedule::new(Vec::new());
    }

    #[test]
    fn cadence_is_every_stride_completions() {
        let controller = CapacityController::new(CapacitySchedule::cycle_default(), 17);
        let due: Vec<u32> = (0..=60).filter(|&k| controller.due(k)).collect();
        assert_eq!(due, vec![17, 34, 51]);
    }

    #[test]
    fn controller_walks_schedule() {
        let mut ring = sim(SimConfig::default());
        let mut controller = CapacityController::new(CapacitySchedule::cycle_default(), 17);
        controller.before_drain(&mut ring).unwrap();
        for k in 1..=34 {
            controller.after_completion(&mut ring, k).unwrap();
        }
        assert_eq!(controller.resizes(), 3);
        assert_eq!(
            ring.resize_log(),
            &[
                RingSize::new(32, 128),
                RingSize::new(64, 256),
                RingSize::new(16, 128),
            ]
        );
    }

    #[test]
    fn unsupported_resize_is_skip_and_leaves_ring() {
        let mut ring = sim(SimConfig::default().with_fault(SimFault::ResizeUnsupported));
        let mut controller = CapacityController::new(CapacitySchedule::cycle_default(), 17);
        let err = controller.before_drain(&mut ring).unwrap_err();
        assert!(err.is_skip());
        assert_eq!(ring.size(), RingSize::new(8, 8));
        assert_eq!(controller.resizes(), 0);
    }

    #[test]
    fn other_resize_failure_is_fatal() {
        let mut ring = sim(SimConfig::default().with_fault(SimFault::ResizeFails {
            nth: 1,
            errno: libc::ENOMEM,
        }));
        let mut controller = CapacityController::new(CapacitySchedule::cycle_default(), 17);
        match controller.before_drain(&mut ring).unwrap_err() {
            ScenarioError::Resize { size, source } => {
                assert_eq!(size, RingSize::new(32, 128));
                assert_eq!(source.raw_os_error(), Some(libc::ENOMEM));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
