//! Ring engine contract.
//!
//! The verifier never talks to `io_uring` directly. It drives a [`RingEngine`]:
//! - [`RingEngine::try_push`]: claim a submission slot and describe one op
//! - [`RingEngine::flush`]: hand every described op to the engine
//! - [`RingEngine::wait_cqe`] / [`RingEngine::cqe_seen`]: reap one completion at a time
//! - [`RingEngine::resize`]: change SQ/CQ capacity with ops in flight
//!
//! Two engines implement it: the kernel ring ([`uring::UringEngine`], Linux only)
//! and a deterministic model with fault injection ([`sim::SimEngine`]).
//!
//! # Safety / Ownership
//!
//! Buffers are caller-owned. [`Operation::Read`] stores a raw pointer that must stay
//! valid and unaliased until the completion carrying the op's `user_data` is seen.

pub mod sim;
#[cfg(target_os = "linux")]
mod sys;
#[cfg(target_os = "linux")]
pub mod uring;

#[cfg(not(target_os = "linux"))]
compile_error!("Ring resizing is an io_uring feature; only Linux is supported.");

use core::fmt;
use core::ptr::NonNull;
use std::io;
use std::os::unix::io::RawFd;

use crate::constants::{CQ_ENTRIES_MAX, SQ_ENTRIES_MAX};

/// Engine abstraction for a resizable submission/completion ring pair.
///
/// All methods take `&mut self`: whoever holds the engine is the only issuer of
/// submit, wait and resize calls.
#[allow(clippy::result_unit_err)] // Ring-full carries no detail; matches kernel `get_sqe`.
pub trait RingEngine {
    /// Creates the ring with the requested initial capacity and setup mode.
    fn setup(params: RingParams) -> io::Result<Self>
    where
        Self: Sized;

    /// Current capacity as last reported by the engine.
    fn size(&self) -> RingSize;

    /// Setup mode the ring was created with.
    fn mode(&self) -> RingMode;

    /// Claims a submission slot and fills it from `sub`.
    ///
    /// # Safety
    ///
    /// Any buffer in `sub.op` must remain valid, and not be touched by the caller,
    /// until the completion tagged `sub.user_data` has been reaped.
    ///
    /// Returns `Err(())` if no slot is free. This is how a shrink becomes visible
    /// to the submitter and is not an error.
    unsafe fn try_push(&mut self, sub: &Submission) -> Result<(), ()>;

    /// Submits every op pushed since the last flush.
    ///
    /// Returns how many the engine accepted.
    fn flush(&mut self) -> io::Result<u32>;

    /// Blocks until a completion is available and returns a copy of it.
    ///
    /// Repeated calls without [`cqe_seen`](Self::cqe_seen) return the same entry.
    fn wait_cqe(&mut self) -> io::Result<Cqe>;

    /// Releases the completion last returned by [`wait_cqe`](Self::wait_cqe).
    fn cqe_seen(&mut self);

    /// Changes ring capacity. On error the ring is left exactly as it was.
    fn resize(&mut self, size: RingSize) -> io::Result<()>;
}

/// SQ/CQ capacity pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingSize {
    pub sq: u32,
    pub cq: u32,
}

impl RingSize {
    pub const fn new(sq: u32, cq: u32) -> Self {
        Self { sq, cq }
    }

    /// Asserts the pair is something the kernel could accept.
    ///
    /// # Panics
    ///
    /// Panics on zero entries, entries above the kernel maximum, or `cq < sq`.
    pub fn validate(&self) {
        assert!(self.sq > 0, "SQ entries must be positive");
        assert!(self.cq > 0, "CQ entries must be positive");
        assert!(self.sq <= SQ_ENTRIES_MAX, "SQ entries above kernel maximum");
        assert!(self.cq <= CQ_ENTRIES_MAX, "CQ entries above kernel maximum");
        assert!(self.cq >= self.sq, "CQ must hold at least one entry per SQ slot");
    }

    /// The capacity the kernel actually allocates: both sides round up to a power of two.
    pub fn rounded(&self) -> Self {
        Self {
            sq: self.sq.next_power_of_two(),
            cq: self.cq.next_power_of_two(),
        }
    }
}

impl fmt::Display for RingSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sq={} cq={}", self.sq, self.cq)
    }
}

/// Ring setup mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingMode {
    /// No setup flags.
    Default,
    /// Kernel thread polls the SQ (`IORING_SETUP_SQPOLL`).
    SqPoll,
    /// `IORING_SETUP_SINGLE_ISSUER | IORING_SETUP_DEFER_TASKRUN`: completions are only
    /// posted when the issuer enters the kernel to wait.
    SingleIssuerDeferTaskrun,
}

impl RingMode {
    pub const ALL: [RingMode; 3] = [
        RingMode::Default,
        RingMode::SqPoll,
        RingMode::SingleIssuerDeferTaskrun,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RingMode::Default => "default",
            RingMode::SqPoll => "sqpoll",
            RingMode::SingleIssuerDeferTaskrun => "single-issuer-defer-taskrun",
        }
    }
}

impl fmt::Display for RingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the engine should dispatch an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dispatch {
    /// Attempt inline execution first.
    #[default]
    Immediate,
    /// Force the deferred worker path (`IOSQE_ASYNC`).
    NonBlocking,
}

impl Dispatch {
    pub const ALL: [Dispatch; 2] = [Dispatch::Immediate, Dispatch::NonBlocking];

    pub fn name(&self) -> &'static str {
        match self {
            Dispatch::Immediate => "immediate",
            Dispatch::NonBlocking => "non-blocking",
        }
    }
}

impl fmt::Display for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Initial ring configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingParams {
    pub size: RingSize,
    pub mode: RingMode,
}

/// Describes a single ring operation.
///
/// # Buffer Ownership
///
/// `Read` holds a raw pointer into a caller-owned buffer that must stay valid until
/// completion. `len` is `u32` to match the SQE field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Completes with result 0 and touches nothing.
    Nop,
    /// Read from `fd` at `offset` into `buf[0..len]`. Stream fds ignore `offset`.
    Read {
        fd: RawFd,
        buf: NonNull<u8>,
        len: u32,
        offset: u64,
    },
}

impl Operation {
    /// Asserts basic invariants for this operation.
    ///
    /// # Panics
    ///
    /// Panics on invalid fd or zero-length buffer.
    pub fn validate(&self) {
        match *self {
            Operation::Read { fd, len, .. } => {
                assert!(fd >= 0, "File descriptor must be non-negative");
                assert!(len > 0, "Length must be positive");
                assert!(len <= i32::MAX as u32, "Length must fit in i32");
            }
            Operation::Nop => {}
        }
    }
}

/// One SQE worth of intent: what to do, how to dispatch it, and its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub op: Operation,
    pub dispatch: Dispatch,
    /// Opaque value round-tripped verbatim to the matching [`Cqe`].
    pub user_data: u64,
}

/// A reaped completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cqe {
    pub user_data: u64,
    /// Byte count (or 0 for NOP) on success, negated errno on failure.
    pub result: i32,
}

/// Returns `true` when `err` means the engine does not support the request at all,
/// as opposed to failing it.
pub fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS)
    ) || err.kind() == io::ErrorKind::Unsupported
}
