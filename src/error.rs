//! Failure taxonomy and per-scenario outcomes.
//!
//! [`Violation`]s are protocol breaches by the engine and always fail the scenario.
//! [`ScenarioError::Unsupported`] is the only error that turns into a skip, also
//! when it arrives wrapped in [`ScenarioError::Abandoned`].

use std::fmt;
use std::io;

use thiserror::Error;

use crate::constants::{EXIT_FAIL, EXIT_PASS, EXIT_SKIP};
use crate::io::RingSize;
use crate::tracker::BatchWindow;

/// A broken ordering or accounting guarantee.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("submitted {accepted} but placed {placed}")]
    SubmitMismatch { placed: u32, accepted: u32 },

    #[error("user_data out-of-range: <{window}>: {observed}")]
    OutOfWindow { window: BatchWindow, observed: u64 },

    #[error("user_data {observed} completed with no window open")]
    NoWindow { observed: u64 },

    #[error("duplicate completion for user_data {observed} in <{window}>")]
    Duplicate { window: BatchWindow, observed: u64 },

    #[error("cqe res {result} for user_data {user_data}")]
    NegativeResult { user_data: u64, result: i32 },

    #[error("completion observed with none outstanding ({issued} issued)")]
    Underflow { issued: u64 },

    #[error("{outstanding} operations unresolved at scenario end ({issued} issued)")]
    Unresolved { outstanding: u64, issued: u64 },

    #[error("engine stalled after {drained} of {expected} completions in <{window}>")]
    Stalled {
        window: BatchWindow,
        drained: u32,
        expected: u32,
    },

    #[error("user_data {user_data}: byte {offset} is {found:#04x}, expected {expected:#04x}")]
    Corrupted {
        user_data: u64,
        offset: usize,
        expected: u8,
        found: u8,
    },

    #[error("no op accepted in {rounds} consecutive rounds")]
    NoProgress { rounds: u32 },

    #[error("buffer {index} leased while still in flight")]
    BufferAliased { index: usize },
}

/// Why a scenario stopped early.
#[derive(Error, Debug)]
pub enum ScenarioError {
    /// The engine rejected a mode or resize outright.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Violation(#[from] Violation),

    #[error("resize to {size} failed: {source}")]
    Resize {
        size: RingSize,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("stimulus actor failed: {0}")]
    Stimulus(String),

    /// The scenario stopped with operations still owned by the engine. The ring
    /// must not be reused.
    #[error("{source} ({in_flight} operations abandoned in flight)")]
    Abandoned {
        in_flight: usize,
        #[source]
        source: Box<ScenarioError>,
    },
}

impl ScenarioError {
    pub fn io(context: &'static str, source: io::Error) -> Self {
        ScenarioError::Io { context, source }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self.root(), ScenarioError::Unsupported(_))
    }

    /// The error that stopped the scenario, without the abandonment wrapper.
    pub fn root(&self) -> &ScenarioError {
        match self {
            ScenarioError::Abandoned { source, .. } => source,
            other => other,
        }
    }

    /// Operations the engine still owned when the scenario stopped.
    pub fn abandoned(&self) -> usize {
        match self {
            ScenarioError::Abandoned { in_flight, .. } => *in_flight,
            _ => 0,
        }
    }

    /// The violation behind this error, if any.
    pub fn violation(&self) -> Option<&Violation> {
        match self.root() {
            ScenarioError::Violation(v) => Some(v),
            _ => None,
        }
    }
}

/// Outcome without its payload, for aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Pass,
    Skip,
    Fail,
}

impl Verdict {
    /// Any failure fails; otherwise any pass passes; all skips stay a skip.
    pub fn combine(self, other: Verdict) -> Verdict {
        match (self, other) {
            (Verdict::Fail, _) | (_, Verdict::Fail) => Verdict::Fail,
            (Verdict::Pass, _) | (_, Verdict::Pass) => Verdict::Pass,
            (Verdict::Skip, Verdict::Skip) => Verdict::Skip,
        }
    }

    /// Process exit status for an outer test runner.
    pub fn exit_code(self) -> i32 {
        match self {
            Verdict::Pass => EXIT_PASS,
            Verdict::Skip => EXIT_SKIP,
            Verdict::Fail => EXIT_FAIL,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Pass => "PASS",
            Verdict::Skip => "SKIP",
            Verdict::Fail => "FAIL",
        })
    }
}

/// Result of one scenario.
#[derive(Debug)]
pub enum Outcome {
    Pass,
    Skip(String),
    Fail(ScenarioError),
}

impl Outcome {
    pub fn from_result<T>(result: Result<T, ScenarioError>) -> Self {
        match result {
            Ok(_) => Outcome::Pass,
            Err(ScenarioError::Unsupported(reason)) => Outcome::Skip(reason),
            Err(e) if e.is_skip() => Outcome::Skip(e.to_string()),
            Err(e) => Outcome::Fail(e),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass)
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Outcome::Skip(_))
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, Outcome::Fail(_))
    }

    pub fn error(&self) -> Option<&ScenarioError> {
        match self {
            Outcome::Fail(e) => Some(e),
            _ => None,
        }
    }

    pub fn verdict(&self) -> Verdict {
        match self {
            Outcome::Pass => Verdict::Pass,
            Outcome::Skip(_) => Verdict::Skip,
            Outcome::Fail(_) => Verdict::Fail,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.verdict().exit_code()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass => f.write_str("pass"),
            Outcome::Skip(reason) => write!(f, "skip ({reason})"),
            Outcome::Fail(e) => write!(f, "FAIL: {e}"),
        }
    }
}
