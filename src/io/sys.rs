//! Raw `io_uring` ABI: structures, constants and the three syscalls.
//!
//! Layouts mirror `include/uapi/linux/io_uring.h`. Only the pieces the resize
//! verifier needs are declared.

use core::ffi::c_void;
use core::ptr::{self, NonNull};
use std::io;
use std::os::unix::io::RawFd;

// Setup flags.
pub const IORING_SETUP_SQPOLL: u32 = 1 << 1;
pub const IORING_SETUP_CQSIZE: u32 = 1 << 3;
pub const IORING_SETUP_SINGLE_ISSUER: u32 = 1 << 12;
pub const IORING_SETUP_DEFER_TASKRUN: u32 = 1 << 13;
pub const IORING_SETUP_NO_SQARRAY: u32 = 1 << 16;

// Features reported back by setup.
pub const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;
pub const IORING_FEAT_EXT_ARG: u32 = 1 << 8;

// Enter flags.
pub const IORING_ENTER_GETEVENTS: u32 = 1 << 0;
pub const IORING_ENTER_SQ_WAKEUP: u32 = 1 << 1;
pub const IORING_ENTER_EXT_ARG: u32 = 1 << 3;

// SQ ring flags written by the kernel.
pub const IORING_SQ_NEED_WAKEUP: u32 = 1 << 0;
pub const IORING_SQ_CQ_OVERFLOW: u32 = 1 << 1;
pub const IORING_SQ_TASKRUN: u32 = 1 << 2;

// mmap offsets.
pub const IORING_OFF_SQ_RING: i64 = 0;
pub const IORING_OFF_CQ_RING: i64 = 0x0800_0000;
pub const IORING_OFF_SQES: i64 = 0x1000_0000;

// Opcodes.
pub const IORING_OP_NOP: u8 = 0;
pub const IORING_OP_READ: u8 = 22;

// SQE flags.
pub const IOSQE_ASYNC: u8 = 1 << 4;

// Register opcodes.
pub const IORING_REGISTER_RESIZE_RINGS: u32 = 33;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SqringOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CqringOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Params {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqringOffsets,
    pub cq_off: CqringOffsets,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub rw_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub addr3: u64,
    pub pad: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelTimespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

/// `io_uring_getevents_arg`, passed with `IORING_ENTER_EXT_ARG`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GeteventsArg {
    pub sigmask: u64,
    pub sigmask_sz: u32,
    pub min_wait_usec: u32,
    pub ts: u64,
}

const _: () = assert!(size_of::<SqringOffsets>() == 40);
const _: () = assert!(size_of::<CqringOffsets>() == 40);
const _: () = assert!(size_of::<Params>() == 120);
const _: () = assert!(size_of::<Sqe>() == 64);
const _: () = assert!(size_of::<RawCqe>() == 16);
const _: () = assert!(size_of::<GeteventsArg>() == 24);

fn cvt(ret: libc::c_long) -> io::Result<libc::c_long> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// `io_uring_setup(2)`. Returns the ring fd; the kernel fills `params`.
pub fn setup(entries: u32, params: &mut Params) -> io::Result<RawFd> {
    // SAFETY: `params` is a valid, exclusively borrowed `io_uring_params`.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries as libc::c_uint,
            params as *mut Params,
        )
    };
    cvt(ret).map(|fd| fd as RawFd)
}

/// `io_uring_enter(2)` without extended arguments.
pub fn enter(fd: RawFd, to_submit: u32, min_complete: u32, flags: u32) -> io::Result<u32> {
    // SAFETY: No pointer arguments besides the null sigset.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            fd,
            to_submit as libc::c_uint,
            min_complete as libc::c_uint,
            flags as libc::c_uint,
            ptr::null::<c_void>(),
            0usize,
        )
    };
    cvt(ret).map(|n| n as u32)
}

/// `io_uring_enter(2)` waiting for `min_complete` completions for at most
/// `timeout`. Expiry surfaces as `ETIME`.
pub fn enter_timeout(
    fd: RawFd,
    min_complete: u32,
    flags: u32,
    timeout: &KernelTimespec,
) -> io::Result<u32> {
    let arg = GeteventsArg {
        ts: timeout as *const KernelTimespec as u64,
        ..GeteventsArg::default()
    };
    // SAFETY: `arg` and the timespec it points to outlive the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            fd,
            0 as libc::c_uint,
            min_complete as libc::c_uint,
            (flags | IORING_ENTER_EXT_ARG) as libc::c_uint,
            &arg as *const GeteventsArg as *const c_void,
            size_of::<GeteventsArg>(),
        )
    };
    cvt(ret).map(|n| n as u32)
}

/// `IORING_REGISTER_RESIZE_RINGS`. On success the kernel rewrites the offsets and
/// entry counts in `params`.
pub fn register_resize(fd: RawFd, params: &mut Params) -> io::Result<()> {
    // SAFETY: `params` is a valid, exclusively borrowed `io_uring_params`.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_register,
            fd,
            IORING_REGISTER_RESIZE_RINGS as libc::c_uint,
            params as *mut Params as *mut c_void,
            1 as libc::c_uint,
        )
    };
    cvt(ret).map(|_| ())
}

/// Shared mapping of one ring region. Unmapped on drop.
pub struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mmap {
    pub fn map(fd: RawFd, len: usize, offset: i64) -> io::Result<Self> {
        assert!(len > 0);

        // SAFETY: Fresh shared mapping of a ring fd; the kernel validates offset/len.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset as libc::off_t,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(raw as *mut u8)
            .ok_or_else(|| io::Error::other("mmap returned null"))?;

        Ok(Self { ptr, len })
    }

    /// Pointer `offset` bytes into the mapping.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is past the end of the mapping.
    pub fn at<T>(&self, offset: u32) -> *mut T {
        let offset = offset as usize;
        assert!(offset < self.len, "ring offset outside mapping");
        // SAFETY: Bounds checked above.
        unsafe { self.ptr.as_ptr().add(offset) as *mut T }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from a successful mmap and are unmapped once.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut c_void, self.len) };
        assert!(ret == 0, "munmap of ring region failed");
    }
}
