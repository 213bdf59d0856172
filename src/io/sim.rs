//! Deterministic in-process model of a resizable ring.
//!
//! Ops are executed synchronously with `pread`/`read` when the caller waits, so
//! the model exercises real buffers and real pipes while keeping completion
//! order under the control of a seeded RNG. Faults let tests prove that each
//! protocol violation is detected.
//!
//! Model rules, matching the kernel ring:
//! - at most `size.sq` ops may be pushed between flushes
//! - NOPs complete inline during flush, reads complete lazily in `wait_cqe`
//! - resize fails with `EOVERFLOW` if pending entries do not fit the new rings
//! - a failed resize leaves the ring untouched

use core::ffi::c_void;
use std::collections::VecDeque;
use std::io;

use super::{Cqe, Operation, RingEngine, RingMode, RingParams, RingSize, Submission};

/// Fault injected into the model. Counters are 1-based over the ring's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// The `nth` completion is never posted.
    DropCompletion { nth: u64 },
    /// The `nth` completion is posted twice.
    DuplicateCompletion { nth: u64 },
    /// The `nth` completion carries `user_data + offset`.
    ForeignTag { nth: u64, offset: u64 },
    /// The `nth` completion reports `-errno`.
    NegativeResult { nth: u64, errno: i32 },
    /// The `nth` flush silently discards its last entry.
    FlushShortfall { nth: u64 },
    /// Every push before the `round`th flush is refused.
    SqBusy { round: u64 },
    /// Every resize fails with `EINVAL`.
    ResizeUnsupported,
    /// The `nth` resize attempt fails with `errno`.
    ResizeFails { nth: u64, errno: i32 },
    /// Setup in `mode` fails with `EINVAL`.
    SetupUnsupported { mode: RingMode },
}

#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    /// Seed for completion reordering. Zero is remapped to a fixed non-zero seed.
    pub seed: u64,
    /// Complete in-flight reads in random order instead of FIFO.
    pub reorder: bool,
    pub faults: Vec<SimFault>,
}

impl SimConfig {
    pub fn reordered(seed: u64) -> Self {
        Self {
            seed,
            reorder: true,
            faults: Vec::new(),
        }
    }

    pub fn with_fault(mut self, fault: SimFault) -> Self {
        self.faults.push(fault);
        self
    }
}

#[derive(Clone)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        let seed = if seed == 0 {
            0x9E37_79B9_7F4A_7C15
        } else {
            seed
        };
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn below(&mut self, bound: usize) -> usize {
        assert!(bound > 0);
        (self.next_u64() % bound as u64) as usize
    }
}

/// Simulated ring engine.
pub struct SimEngine {
    size: RingSize,
    mode: RingMode,
    config: SimConfig,
    rng: XorShift64,

    /// Pushed but not yet flushed.
    sq: Vec<Submission>,
    /// Flushed reads awaiting execution.
    inflight: VecDeque<Submission>,
    /// Posted, not yet seen.
    cq: VecDeque<Cqe>,

    flushes: u64,
    resize_attempts: u64,
    posted: u64,

    resize_log: Vec<RingSize>,
    flush_log: Vec<u32>,
}

impl SimEngine {
    pub fn with_config(params: RingParams, config: SimConfig) -> io::Result<Self> {
        params.size.validate();

        let unsupported = config
            .faults
            .iter()
            .any(|f| *f == SimFault::SetupUnsupported { mode: params.mode });
        if unsupported {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        Ok(Self {
            size: params.size.rounded(),
            mode: params.mode,
            rng: XorShift64::new(config.seed),
            config,
            sq: Vec::new(),
            inflight: VecDeque::new(),
            cq: VecDeque::new(),
            flushes: 0,
            resize_attempts: 0,
            posted: 0,
            resize_log: Vec::new(),
            flush_log: Vec::new(),
        })
    }

    /// Sizes of every successful resize, in order.
    pub fn resize_log(&self) -> &[RingSize] {
        &self.resize_log
    }

    /// Accepted count of every flush, in order.
    pub fn flush_log(&self) -> &[u32] {
        &self.flush_log
    }

    /// Flushed ops not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.inflight.len() + self.cq.len()
    }

    fn has_fault(&self, fault: SimFault) -> bool {
        self.config.faults.contains(&fault)
    }

    fn post(&mut self, user_data: u64, result: i32) {
        self.posted += 1;
        let nth = self.posted;

        if self.has_fault(SimFault::DropCompletion { nth }) {
            return;
        }

        let mut cqe = Cqe { user_data, result };
        for fault in &self.config.faults {
            match *fault {
                SimFault::ForeignTag { nth: n, offset } if n == nth => {
                    cqe.user_data = cqe.user_data.wrapping_add(offset);
                }
                SimFault::NegativeResult { nth: n, errno } if n == nth => {
                    cqe.result = -errno;
                }
                _ => {}
            }
        }

        self.cq.push_back(cqe);
        if self.has_fault(SimFault::DuplicateCompletion { nth }) {
            self.cq.push_back(cqe);
        }
    }

    fn execute(op: &Operation) -> i32 {
        match *op {
            Operation::Nop => 0,
            Operation::Read {
                fd,
                buf,
                len,
                offset,
            } => loop {
                let ptr = buf.as_ptr() as *mut c_void;
                // SAFETY: The submitter guarantees `buf[0..len]` is valid and unaliased
                // until this op's completion is reaped.
                let mut ret =
                    unsafe { libc::pread(fd, ptr, len as usize, offset as libc::off_t) };
                if ret < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ESPIPE) {
                    // Stream fds have no position.
                    // SAFETY: As above.
                    ret = unsafe { libc::read(fd, ptr, len as usize) };
                }
                if ret >= 0 {
                    break ret as i32;
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    break -err.raw_os_error().unwrap_or(libc::EIO);
                }
            },
        }
    }
}

impl RingEngine for SimEngine {
    fn setup(params: RingParams) -> io::Result<Self> {
        Self::with_config(params, SimConfig::default())
    }

    fn size(&self) -> RingSize {
        self.size
    }

    fn mode(&self) -> RingMode {
        self.mode
    }

    unsafe fn try_push(&mut self, sub: &Submission) -> Result<(), ()> {
        sub.op.validate();

        let round = self.flushes + 1;
        if self.has_fault(SimFault::SqBusy { round }) {
            return Err(());
        }
        if self.sq.len() >= self.size.sq as usize {
            return Err(());
        }
        self.sq.push(*sub);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<u32> {
        self.flushes += 1;

        let mut batch = std::mem::take(&mut self.sq);
        if self.has_fault(SimFault::FlushShortfall { nth: self.flushes }) {
            batch.pop();
        }

        let accepted = batch.len() as u32;
        for sub in batch {
            match sub.op {
                Operation::Nop => self.post(sub.user_data, 0),
                Operation::Read { .. } => self.inflight.push_back(sub),
            }
        }

        self.flush_log.push(accepted);
        Ok(accepted)
    }

    fn wait_cqe(&mut self) -> io::Result<Cqe> {
        loop {
            if let Some(cqe) = self.cq.front() {
                return Ok(*cqe);
            }
            if self.inflight.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "wait_cqe with nothing in flight would block forever",
                ));
            }

            let index = if self.config.reorder {
                self.rng.below(self.inflight.len())
            } else {
                0
            };
            let sub = self
                .inflight
                .remove(index)
                .ok_or_else(|| io::Error::other("in-flight index out of range"))?;
            let result = Self::execute(&sub.op);
            self.post(sub.user_data, result);
        }
    }

    fn cqe_seen(&mut self) {
        let seen = self.cq.pop_front();
        assert!(seen.is_some(), "cqe_seen with an empty completion queue");
    }

    fn resize(&mut self, size: RingSize) -> io::Result<()> {
        size.validate();
        self.resize_attempts += 1;

        if self.has_fault(SimFault::ResizeUnsupported) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        for fault in &self.config.faults {
            if let SimFault::ResizeFails { nth, errno } = *fault
                && nth == self.resize_attempts
            {
                return Err(io::Error::from_raw_os_error(errno));
            }
        }

        let size = size.rounded();
        if self.sq.len() > size.sq as usize || self.cq.len() > size.cq as usize {
            return Err(io::Error::from_raw_os_error(libc::EOVERFLOW));
        }

        self.size = size;
        self.resize_log.push(size);
        Ok(())
    }
}
