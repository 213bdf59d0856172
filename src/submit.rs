//! Bounded submission rounds.
//!
//! A round places up to `limit` reads, stops early when the ring refuses a slot
//! (a shrink left fewer free entries than asked for), and flushes once. The ids
//! placed become the round's window.

use std::os::unix::io::RawFd;

use log::debug;

use crate::buffer::BufferPool;
use crate::error::{ScenarioError, Violation};
use crate::io::{Dispatch, Operation, RingEngine, Submission};
use crate::tracker::{BatchWindow, CompletionTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Offsets advance by `stride` per placed read.
    Positional { next: u64, stride: u64 },
    /// Every read is issued at offset 0.
    Stream,
}

/// Where reads come from.
#[derive(Debug, Clone, Copy)]
pub struct ReadSource {
    fd: RawFd,
    cursor: Cursor,
    pattern: Option<u8>,
}

impl ReadSource {
    /// Random-access source read at 0, `stride`, `2 * stride`, ...
    pub fn positional(fd: RawFd, stride: u64) -> Self {
        assert!(fd >= 0);
        assert!(stride > 0);
        Self {
            fd,
            cursor: Cursor::Positional { next: 0, stride },
            pattern: None,
        }
    }

    /// Stream source whose every byte is `pattern`.
    pub fn stream(fd: RawFd, pattern: u8) -> Self {
        assert!(fd >= 0);
        Self {
            fd,
            cursor: Cursor::Stream,
            pattern: Some(pattern),
        }
    }

    /// Byte every successfully read byte must equal, if known.
    pub fn pattern(&self) -> Option<u8> {
        self.pattern
    }

    fn offset(&self) -> u64 {
        match self.cursor {
            Cursor::Positional { next, .. } => next,
            Cursor::Stream => 0,
        }
    }

    fn advance(&mut self) {
        if let Cursor::Positional { next, stride } = &mut self.cursor {
            *next += *stride;
        }
    }
}

/// What one round put in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Round {
    /// `None` when nothing was placed.
    pub window: Option<BatchWindow>,
    /// Ops the engine accepted; always equal to the number placed.
    pub accepted: u32,
    /// Pool index leased to the window's first op.
    pub first_buffer: usize,
}

impl Round {
    pub fn is_empty(&self) -> bool {
        self.accepted == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubmissionDriver {
    fan_out: u32,
    dispatch: Dispatch,
}

impl SubmissionDriver {
    pub fn new(fan_out: u32, dispatch: Dispatch) -> Self {
        Self { fan_out, dispatch }
    }

    pub fn fan_out(&self) -> u32 {
        self.fan_out
    }

    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    /// Places up to `min(limit, fan_out)` reads and flushes them.
    ///
    /// A refused slot ends the round early and is not an error. The flush must
    /// accept exactly what was placed.
    ///
    /// # Panics
    ///
    /// Panics if `tracker` still has a window outstanding.
    pub fn submit_round<E: RingEngine>(
        &self,
        ring: &mut E,
        tracker: &mut CompletionTracker,
        pool: &mut BufferPool,
        source: &mut ReadSource,
        limit: u32,
    ) -> Result<Round, ScenarioError> {
        let want = limit.min(self.fan_out);
        assert!(want as usize <= pool.capacity(), "round larger than the pool");

        tracker.begin_round();
        let first_buffer = pool.cursor();
        let mut placed = 0u32;

        while placed < want {
            let lease = pool.lease()?;
            if let Some(byte) = source.pattern {
                pool.scrub(&lease, !byte);
            }
            let sub = Submission {
                op: Operation::Read {
                    fd: source.fd,
                    buf: lease.ptr,
                    len: lease.len,
                    offset: source.offset(),
                },
                dispatch: self.dispatch,
                user_data: tracker.last_id() + 1,
            };

            // SAFETY: The leased buffer stays checked out of the pool, and is not
            // touched, until the drain loop reaps this op's completion and
            // releases it.
            if unsafe { ring.try_push(&sub) }.is_err() {
                pool.unlease(lease);
                break;
            }

            let id = tracker.allocate();
            assert_eq!(id, sub.user_data);
            source.advance();
            placed += 1;
        }

        let accepted = ring
            .flush()
            .map_err(|e| ScenarioError::io("flush submission round", e))?;
        let window = tracker.end_round();
        if accepted != placed {
            return Err(Violation::SubmitMismatch { placed, accepted }.into());
        }

        match window {
            Some(w) => debug!("round <{w}>: {placed}/{want} placed ({})", ring.size()),
            None => debug!("empty round: 0/{want} placed ({})", ring.size()),
        }
        Ok(Round {
            window,
            accepted,
            first_buffer,
        })
    }
}

/// Pushes one NOP tagged `user_data` and flushes it on its own.
pub fn submit_nop<E: RingEngine>(
    ring: &mut E,
    user_data: u64,
    dispatch: Dispatch,
) -> Result<(), ScenarioError> {
    let sub = Submission {
        op: Operation::Nop,
        dispatch,
        user_data,
    };
    // SAFETY: A NOP references no memory.
    let placed = match unsafe { ring.try_push(&sub) } {
        Ok(()) => 1,
        Err(()) => 0,
    };
    let accepted = ring
        .flush()
        .map_err(|e| ScenarioError::io("flush nop", e))?;
    if placed != 1 || accepted != 1 {
        return Err(Violation::SubmitMismatch {
            placed: 1,
            accepted,
        }
        .into());
    }
    Ok(())
}
