//! Identifier allocation and completion accounting.
//!
//! Every op carries a `user_data` drawn from one [`IdAllocator`] per scenario.
//! A round's accepted ids form a contiguous [`BatchWindow`]; every completion
//! drained in that round must fall inside it, exactly once.
//!
//! # Invariants
//!
//! - Ids are strictly increasing from 1 and never reused
//! - `observed <= issued` at all times
//! - A new round only opens once the previous window is fully drained

use core::fmt;

use crate::error::Violation;

/// Monotonic `user_data` source.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last: u64,
}

impl IdAllocator {
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Returns an id strictly greater than every id returned before.
    pub fn allocate(&mut self) -> u64 {
        assert!(self.last < u64::MAX, "user_data space exhausted");
        self.last += 1;
        self.last
    }

    /// Most recently issued id, or 0 before the first allocation.
    #[inline]
    pub fn last(&self) -> u64 {
        self.last
    }
}

/// Inclusive id range accepted by the engine in one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub start: u64,
    pub end: u64,
}

impl BatchWindow {
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start > 0, "user_data 0 is never issued");
        assert!(start <= end);
        Self { start, end }
    }

    pub fn single(id: u64) -> Self {
        Self::new(id, id)
    }

    #[inline]
    pub fn contains(&self, id: u64) -> bool {
        self.start <= id && id <= self.end
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always `false`: a window holds at least one id.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for BatchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Fails if `completion_id` is outside `window`.
pub fn validate(completion_id: u64, window: &BatchWindow) -> Result<(), Violation> {
    if window.contains(completion_id) {
        Ok(())
    } else {
        Err(Violation::OutOfWindow {
            window: *window,
            observed: completion_id,
        })
    }
}

/// Per-scenario accounting of issued and observed operations.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    ids: IdAllocator,
    /// First id of the round being built; `Some` between begin and end.
    round_start: Option<u64>,
    window: Option<BatchWindow>,
    /// One bit per id in `window`.
    seen: Vec<u64>,
    issued: u64,
    observed: u64,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a submission round.
    ///
    /// # Panics
    ///
    /// Panics if a round is already open or the previous window still has ops
    /// outstanding.
    pub fn begin_round(&mut self) {
        assert!(self.round_start.is_none(), "round already open");
        assert!(self.outstanding() == 0, "previous window not drained");
        self.round_start = Some(self.ids.last() + 1);
    }

    /// Tags one op of the open round.
    pub fn allocate(&mut self) -> u64 {
        assert!(self.round_start.is_some(), "allocate outside a round");
        self.ids.allocate()
    }

    /// Closes the round; the ids allocated since [`begin_round`](Self::begin_round)
    /// become the active window. Returns `None` for an empty round.
    pub fn end_round(&mut self) -> Option<BatchWindow> {
        let Some(start) = self.round_start.take() else {
            panic!("end_round without begin_round");
        };
        let end = self.ids.last();
        if end < start {
            self.window = None;
            return None;
        }

        let window = BatchWindow::new(start, end);
        self.issued += window.len();
        self.seen.clear();
        self.seen.resize(window.len().div_ceil(64) as usize, 0);
        self.window = Some(window);
        Some(window)
    }

    /// Accounts one completion against the active window.
    pub fn observe(&mut self, completion_id: u64) -> Result<(), Violation> {
        let Some(window) = self.window else {
            return Err(Violation::NoWindow {
                observed: completion_id,
            });
        };
        validate(completion_id, &window)?;

        if self.outstanding() == 0 {
            return Err(Violation::Underflow {
                issued: self.issued,
            });
        }

        let bit = completion_id - window.start;
        let word = (bit / 64) as usize;
        let mask = 1u64 << (bit % 64);
        if self.seen[word] & mask != 0 {
            return Err(Violation::Duplicate {
                window,
                observed: completion_id,
            });
        }
        self.seen[word] |= mask;
        self.observed += 1;

        assert!(self.observed <= self.issued);
        Ok(())
    }

    /// Fails unless every issued op has been observed.
    pub fn finish(&self) -> Result<(), Violation> {
        match self.outstanding() {
            0 => Ok(()),
            outstanding => Err(Violation::Unresolved {
                outstanding,
                issued: self.issued,
            }),
        }
    }

    #[inline]
    pub fn outstanding(&self) -> u64 {
        assert!(self.observed <= self.issued);
        self.issued - self.observed
    }

    #[inline]
    pub fn issued(&self) -> u64 {
        self.issued
    }

    #[inline]
    pub fn observed(&self) -> u64 {
        self.observed
    }

    #[inline]
    pub fn window(&self) -> Option<BatchWindow> {
        self.window
    }

    /// Last id handed out in this scenario.
    #[inline]
    pub fn last_id(&self) -> u64 {
        self.ids.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(tracker: &mut CompletionTracker, n: u32) -> Option<BatchWindow> {
        tracker.begin_round();
        for _ in 0..n {
            tracker.allocate();
        }
        tracker.end_round()
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.last(), 0);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 2);
        assert_eq!(ids.last(), 2);
    }

    #[test]
    fn windows_are_contiguous_across_rounds() {
        let mut t = CompletionTracker::new();
        let w1 = round(&mut t, 3).unwrap();
        assert_eq!(w1, BatchWindow::new(1, 3));
        for id in 1..=3 {
            t.observe(id).unwrap();
        }
        let w2 = round(&mut t, 2).unwrap();
        assert_eq!(w2, BatchWindow::new(4, 5));
        assert_eq!(t.issued(), 5);
    }

    #[test]
    fn empty_round_has_no_window() {
        let mut t = CompletionTracker::new();
        assert!(round(&mut t, 0).is_none());
        assert!(t.window().is_none());
        assert_eq!(
            t.observe(1).unwrap_err(),
            Violation::NoWindow { observed: 1 }
        );
        assert!(t.finish().is_ok());
    }

    #[test]
    fn stale_id_is_out_of_window() {
        let mut t = CompletionTracker::new();
        round(&mut t, 2).unwrap();
        t.observe(1).unwrap();
        t.observe(2).unwrap();
        let w = round(&mut t, 2).unwrap();
        assert_eq!(
            t.observe(2).unwrap_err(),
            Violation::OutOfWindow {
                window: w,
                observed: 2
            }
        );
    }

    #[test]
    fn duplicate_is_detected() {
        let mut t = CompletionTracker::new();
        let w = round(&mut t, 4).unwrap();
        t.observe(3).unwrap();
        assert_eq!(
            t.observe(3).unwrap_err(),
            Violation::Duplicate {
                window: w,
                observed: 3
            }
        );
    }

    #[test]
    fn extra_completion_underflows() {
        let mut t = CompletionTracker::new();
        round(&mut t, 1).unwrap();
        t.observe(1).unwrap();
        assert_eq!(
            t.observe(1).unwrap_err(),
            Violation::Underflow { issued: 1 }
        );
    }

    #[test]
    fn finish_reports_unresolved() {
        let mut t = CompletionTracker::new();
        round(&mut t, 3).unwrap();
        t.observe(2).unwrap();
        assert_eq!(
            t.finish().unwrap_err(),
            Violation::Unresolved {
                outstanding: 2,
                issued: 3
            }
        );
    }

    #[test]
    #[should_panic(expected = "previous window not drained")]
    fn round_cannot_open_over_outstanding_ops() {
        let mut t = CompletionTracker::new();
        round(&mut t, 2).unwrap();
        t.begin_round();
    }

    #[test]
    fn validate_singleton_window() {
        let w = BatchWindow::single(2);
        assert!(validate(2, &w).is_ok());
        assert!(validate(1, &w).is_err());
        assert!(validate(3, &w).is_err());
    }

    #[test]
    fn window_bits_span_multiple_words() {
        let mut t = CompletionTracker::new();
        round(&mut t, 130).unwrap();
        for id in (1..=130).rev() {
            t.observe(id).unwrap();
        }
        assert!(t.finish().is_ok());
    }
}
