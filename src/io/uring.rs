//! Kernel `io_uring` engine with live ring resizing.
//!
//! The rings are mapped by hand: `IORING_REGISTER_RESIZE_RINGS` replaces the SQ/CQ
//! memory, so every pointer into the old regions must be dropped and re-derived
//! from the offsets the kernel hands back.
//!
//! # Invariants
//!
//! - `sqe_head <= sqe_tail` (mod 2^32) and `sqe_tail - khead <= sq entries`
//! - `cq khead` is only written here; `cq ktail` only by the kernel
//! - Resize is only issued with no locally-queued SQEs (`sqe_head == sqe_tail`)
//! - Rings are created with `IORING_SETUP_NO_SQARRAY` when the kernel knows it.
//!   Resize inherits the flag and reports no SQ array offset, so an SQ index
//!   array is only ever written for rings set up without it.

use core::sync::atomic::{AtomicU32, Ordering, fence};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use log::debug;

use super::sys::{self, KernelTimespec, Mmap, Params, RawCqe, Sqe};
use crate::constants::CQE_WAIT_TIMEOUT_MS;
use super::{Cqe, Dispatch, Operation, RingEngine, RingMode, RingParams, RingSize, Submission};

struct SqRing {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    kflags: *const AtomicU32,
    mask: u32,
    entries: u32,
    sqes: *mut Sqe,
}

struct CqRing {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    mask: u32,
    entries: u32,
    cqes: *const RawCqe,
}

/// The three mapped regions plus pointers derived from them.
///
/// Field order matters: pointers are plain values, mappings unmap on drop.
struct Mapping {
    sq: SqRing,
    cq: CqRing,
    _sq_ring: Mmap,
    _cq_ring: Option<Mmap>,
    _sqes: Mmap,
}

impl Mapping {
    fn new(fd: &OwnedFd, p: &Params, sq_array: bool) -> io::Result<Self> {
        let raw = fd.as_raw_fd();
        let sq_len = if sq_array {
            p.sq_off.array as usize + p.sq_entries as usize * size_of::<u32>()
        } else {
            let o = &p.sq_off;
            let last = [o.head, o.tail, o.ring_mask, o.ring_entries, o.flags, o.dropped];
            last.into_iter().max().unwrap_or(0) as usize + size_of::<u32>()
        };
        let cq_len = p.cq_off.cqes as usize + p.cq_entries as usize * size_of::<RawCqe>();

        let single = p.features & sys::IORING_FEAT_SINGLE_MMAP != 0;
        let (sq_ring, cq_ring) = if single {
            (Mmap::map(raw, sq_len.max(cq_len), sys::IORING_OFF_SQ_RING)?, None)
        } else {
            (
                Mmap::map(raw, sq_len, sys::IORING_OFF_SQ_RING)?,
                Some(Mmap::map(raw, cq_len, sys::IORING_OFF_CQ_RING)?),
            )
        };
        let sqes = Mmap::map(
            raw,
            p.sq_entries as usize * size_of::<Sqe>(),
            sys::IORING_OFF_SQES,
        )?;

        let cq_base = cq_ring.as_ref().unwrap_or(&sq_ring);

        // SAFETY: Offsets come from the kernel for these exact mappings.
        let (sq, cq) = unsafe {
            let sq = SqRing {
                khead: sq_ring.at::<AtomicU32>(p.sq_off.head),
                ktail: sq_ring.at::<AtomicU32>(p.sq_off.tail),
                kflags: sq_ring.at::<AtomicU32>(p.sq_off.flags),
                mask: *sq_ring.at::<u32>(p.sq_off.ring_mask),
                entries: *sq_ring.at::<u32>(p.sq_off.ring_entries),
                sqes: sqes.at::<Sqe>(0),
            };
            let cq = CqRing {
                khead: cq_base.at::<AtomicU32>(p.cq_off.head),
                ktail: cq_base.at::<AtomicU32>(p.cq_off.tail),
                mask: *cq_base.at::<u32>(p.cq_off.ring_mask),
                entries: *cq_base.at::<u32>(p.cq_off.ring_entries),
                cqes: cq_base.at::<RawCqe>(p.cq_off.cqes),
            };

            // Identity-map SQ slots to SQEs.
            if sq_array {
                let array = sq_ring.at::<u32>(p.sq_off.array);
                for i in 0..sq.entries {
                    *array.add(i as usize) = i;
                }
            }

            (sq, cq)
        };

        assert!(sq.entries == p.sq_entries);
        assert!(cq.entries == p.cq_entries);
        assert!(sq.mask == sq.entries - 1);
        assert!(cq.mask == cq.entries - 1);

        Ok(Self {
            sq,
            cq,
            _sq_ring: sq_ring,
            _cq_ring: cq_ring,
            _sqes: sqes,
        })
    }
}

/// `io_uring` instance driven from a single thread.
///
/// Not `Send`: the raw ring pointers pin it to its creator, which is also what
/// `IORING_SETUP_SINGLE_ISSUER` requires.
pub struct UringEngine {
    // Mapping is declared before `fd` so it unmaps before the ring closes.
    map: Mapping,
    fd: OwnedFd,
    flags: u32,
    features: u32,
    mode: RingMode,
    /// Oldest SQE not yet published to the kernel.
    sqe_head: u32,
    /// Next SQE to hand out.
    sqe_tail: u32,
}

impl UringEngine {
    fn setup_flags(mode: RingMode) -> u32 {
        match mode {
            RingMode::Default => 0,
            RingMode::SqPoll => sys::IORING_SETUP_SQPOLL,
            RingMode::SingleIssuerDeferTaskrun => {
                sys::IORING_SETUP_SINGLE_ISSUER | sys::IORING_SETUP_DEFER_TASKRUN
            }
        }
    }

    #[inline]
    fn sqpoll(&self) -> bool {
        self.flags & sys::IORING_SETUP_SQPOLL != 0
    }

    #[inline]
    fn sq_array(&self) -> bool {
        self.flags & sys::IORING_SETUP_NO_SQARRAY == 0
    }

    #[inline]
    fn defer_taskrun(&self) -> bool {
        self.flags & sys::IORING_SETUP_DEFER_TASKRUN != 0
    }

    #[inline]
    fn sq_flags(&self) -> u32 {
        // SAFETY: `kflags` points into the live SQ mapping.
        unsafe { (*self.map.sq.kflags).load(Ordering::Relaxed) }
    }

    #[inline]
    fn sq_khead(&self) -> u32 {
        // SAFETY: `khead` points into the live SQ mapping.
        unsafe { (*self.map.sq.khead).load(Ordering::Acquire) }
    }

    /// Publishes locally-filled SQEs.
    ///
    /// Returns `(published, pending)`: entries published by this call, and
    /// entries the kernel has yet to consume.
    fn flush_sq(&mut self) -> (u32, u32) {
        let tail = self.sqe_tail;
        let published = tail.wrapping_sub(self.sqe_head);
        if published != 0 {
            self.sqe_head = tail;
            // SAFETY: `ktail` points into the live SQ mapping; release pairs with the
            // kernel's acquire of the tail.
            unsafe { (*self.map.sq.ktail).store(tail, Ordering::Release) };
        }
        (published, tail.wrapping_sub(self.sq_khead()))
    }

    /// Oldest posted completion, if any.
    fn peek_cqe(&self) -> Option<Cqe> {
        // SAFETY: CQ pointers point into the live CQ mapping. We are the only
        // writer of khead; ktail acquire pairs with the kernel's release.
        let (head, tail) = unsafe {
            (
                (*self.map.cq.khead).load(Ordering::Relaxed),
                (*self.map.cq.ktail).load(Ordering::Acquire),
            )
        };
        if head == tail {
            return None;
        }
        let index = (head & self.map.cq.mask) as usize;
        // SAFETY: Entries in [head, tail) are published by the kernel.
        let raw = unsafe { *self.map.cq.cqes.add(index) };
        Some(Cqe {
            user_data: raw.user_data,
            result: raw.res,
        })
    }

    fn fill_sqe(sqe: &mut Sqe, sub: &Submission) {
        *sqe = Sqe::default();
        match sub.op {
            Operation::Nop => {
                sqe.opcode = sys::IORING_OP_NOP;
                sqe.fd = -1;
            }
            Operation::Read {
                fd,
                buf,
                len,
                offset,
            } => {
                sqe.opcode = sys::IORING_OP_READ;
                sqe.fd = fd;
                sqe.addr = buf.as_ptr() as u64;
                sqe.len = len;
                sqe.off = offset;
            }
        }
        if sub.dispatch == Dispatch::NonBlocking {
            sqe.flags |= sys::IOSQE_ASYNC;
        }
        sqe.user_data = sub.user_data;
    }
}

impl RingEngine for UringEngine {
    fn setup(params: RingParams) -> io::Result<Self> {
        params.size.validate();

        let flags = Self::setup_flags(params.mode) | sys::IORING_SETUP_CQSIZE;
        let mut p = Params {
            flags: flags | sys::IORING_SETUP_NO_SQARRAY,
            cq_entries: params.size.cq,
            ..Params::default()
        };
        let raw = match sys::setup(params.size.sq, &mut p) {
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                // Kernels before 6.6 reject NO_SQARRAY; they cannot resize either.
                debug!("ring setup without NO_SQARRAY: {e}");
                p = Params {
                    flags,
                    cq_entries: params.size.cq,
                    ..Params::default()
                };
                sys::setup(params.size.sq, &mut p)?
            }
            other => other?,
        };
        // SAFETY: `raw` is a freshly created fd we exclusively own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let sq_array = p.flags & sys::IORING_SETUP_NO_SQARRAY == 0;
        let map = Mapping::new(&fd, &p, sq_array)?;

        debug!(
            "ring setup: mode={} sq={} cq={} flags={:#x} features={:#x}",
            params.mode, p.sq_entries, p.cq_entries, p.flags, p.features
        );

        Ok(Self {
            map,
            fd,
            flags: p.flags,
            features: p.features,
            mode: params.mode,
            sqe_head: 0,
            sqe_tail: 0,
        })
    }

    fn size(&self) -> RingSize {
        RingSize::new(self.map.sq.entries, self.map.cq.entries)
    }

    fn mode(&self) -> RingMode {
        self.mode
    }

    unsafe fn try_push(&mut self, sub: &Submission) -> Result<(), ()> {
        sub.op.validate();

        let head = if self.sqpoll() {
            self.sq_khead()
        } else {
            // SAFETY: `khead` points into the live SQ mapping.
            unsafe { (*self.map.sq.khead).load(Ordering::Relaxed) }
        };
        let next = self.sqe_tail.wrapping_add(1);
        if next.wrapping_sub(head) > self.map.sq.entries {
            return Err(());
        }

        let index = (self.sqe_tail & self.map.sq.mask) as usize;
        // SAFETY: `index` is masked into the SQE array, and the slot is ours until the
        // tail is published in `flush_sq`.
        let sqe = unsafe { &mut *self.map.sq.sqes.add(index) };
        Self::fill_sqe(sqe, sub);
        self.sqe_tail = next;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<u32> {
        let (published, pending) = self.flush_sq();
        let mut flags = 0;

        let mut needs_enter = if self.sqpoll() {
            // Order the tail store before reading the wakeup flag.
            fence(Ordering::SeqCst);
            if self.sq_flags() & sys::IORING_SQ_NEED_WAKEUP != 0 {
                flags |= sys::IORING_ENTER_SQ_WAKEUP;
                true
            } else {
                false
            }
        } else {
            pending > 0
        };

        if self.defer_taskrun()
            && self.sq_flags() & (sys::IORING_SQ_CQ_OVERFLOW | sys::IORING_SQ_TASKRUN) != 0
        {
            flags |= sys::IORING_ENTER_GETEVENTS;
            needs_enter = true;
        }

        // The SQ thread may consume entries at any moment, so only the count this
        // call published is stable.
        if self.sqpoll() && !needs_enter {
            return Ok(published);
        }
        if !needs_enter {
            return Ok(pending);
        }

        loop {
            match sys::enter(self.fd.as_raw_fd(), pending, 0, flags) {
                // SQPOLL consumes entries itself; the syscall only wakes the thread.
                Ok(_) if self.sqpoll() => return Ok(published),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Waits at most [`CQE_WAIT_TIMEOUT_MS`] (when the kernel supports timed
    /// waits) and reports expiry as [`io::ErrorKind::TimedOut`].
    fn wait_cqe(&mut self) -> io::Result<Cqe> {
        let timeout = Duration::from_millis(CQE_WAIT_TIMEOUT_MS);
        let ts = KernelTimespec {
            tv_sec: timeout.as_secs() as i64,
            tv_nsec: i64::from(timeout.subsec_nanos()),
        };
        let timed = self.features & sys::IORING_FEAT_EXT_ARG != 0;

        loop {
            if let Some(cqe) = self.peek_cqe() {
                return Ok(cqe);
            }

            let mut flags = sys::IORING_ENTER_GETEVENTS;
            if self.sqpoll() && self.sq_flags() & sys::IORING_SQ_NEED_WAKEUP != 0 {
                flags |= sys::IORING_ENTER_SQ_WAKEUP;
            }
            let fd = self.fd.as_raw_fd();
            let ret = if timed {
                sys::enter_timeout(fd, 1, flags, &ts)
            } else {
                sys::enter(fd, 0, 1, flags)
            };
            match ret {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.raw_os_error() == Some(libc::ETIME) => {
                    return self.peek_cqe().ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("no completion within {timeout:?}"),
                        )
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn cqe_seen(&mut self) {
        // SAFETY: CQ pointers point into the live CQ mapping.
        unsafe {
            let head = (*self.map.cq.khead).load(Ordering::Relaxed);
            let tail = (*self.map.cq.ktail).load(Ordering::Acquire);
            assert!(head != tail, "cqe_seen with an empty completion queue");
            (*self.map.cq.khead).store(head.wrapping_add(1), Ordering::Release);
        }
    }

    fn resize(&mut self, size: RingSize) -> io::Result<()> {
        size.validate();
        assert!(
            self.sqe_head == self.sqe_tail,
            "resize with unflushed submissions"
        );

        let mut p = Params {
            sq_entries: size.sq,
            cq_entries: size.cq,
            flags: sys::IORING_SETUP_CQSIZE,
            ..Params::default()
        };
        sys::register_resize(self.fd.as_raw_fd(), &mut p)?;

        // The kernel copied head/tail into the new rings; the old mappings are dead.
        // Resize reports no features, and no SQ array offset for NO_SQARRAY rings.
        p.features = self.features;
        if self.sq_array() && p.sq_off.array == 0 {
            return Err(io::Error::other("resized ring reports no SQ array offset"));
        }
        let map = Mapping::new(&self.fd, &p, self.sq_array())?;
        self.map = map;

        debug!(
            "ring resized: requested {} got sq={} cq={}",
            size, p.sq_entries, p.cq_entries
        );
        Ok(())
    }
}

