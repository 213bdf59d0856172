//! Page-aligned read buffers and the round-robin pool that owns them.
//!
//! A buffer handed to a read belongs to the engine until that read's completion
//! is reaped. The pool hands buffers out strictly in rotation and refuses to
//! re-lease one that is still in flight, so two in-flight reads can never alias.

use core::ptr::NonNull;
use std::alloc;

use crate::constants::BUFFER_ALIGN_MAX;
use crate::error::Violation;

/// Heap buffer aligned for direct I/O.
///
/// # Invariants
///
/// - `len > 0`
/// - `align` is a power of two and at most [`BUFFER_ALIGN_MAX`]
/// - `ptr` is aligned to `align`
pub struct RecordBuf {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
}

impl RecordBuf {
    /// Allocates a zeroed buffer.
    ///
    /// # Panics
    ///
    /// Panics on zero length, invalid alignment, or allocation failure.
    pub fn new_zeroed(len: usize, align: usize) -> Self {
        assert!(len > 0);
        assert!(align.is_power_of_two());
        assert!(align <= BUFFER_ALIGN_MAX);
        assert!(len <= isize::MAX as usize);

        let layout = alloc::Layout::from_size_align(len, align).expect("bad layout");
        // SAFETY: Layout has non-zero size and power-of-two alignment.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };

        let buf = Self { ptr, len, align };
        assert!((buf.ptr.as_ptr() as usize).is_multiple_of(buf.align));
        buf
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: We own `len` initialized bytes at `ptr`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn fill(&mut self, byte: u8) {
        // SAFETY: We own `len` bytes at `ptr` and hold `&mut self`.
        unsafe { core::ptr::write_bytes(self.ptr.as_ptr(), byte, self.len) }
    }

    /// Raw pointer handed to the engine.
    pub fn as_non_null(&mut self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false` (empty buffers are disallowed by construction).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn align(&self) -> usize {
        self.align
    }
}

impl Drop for RecordBuf {
    fn drop(&mut self) {
        let layout =
            alloc::Layout::from_size_align(self.len, self.align).expect("bad layout in drop");
        // SAFETY: `ptr` was allocated with this exact layout in `new_zeroed`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) }
    }
}

// SAFETY: The buffer owns its allocation exclusively.
unsafe impl Send for RecordBuf {}

/// A buffer checked out for one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub index: usize,
    pub ptr: NonNull<u8>,
    pub len: u32,
}

/// Fixed set of equally sized buffers, leased in rotation.
pub struct BufferPool {
    bufs: Vec<RecordBuf>,
    busy: Vec<bool>,
    next: usize,
    leased: usize,
}

impl BufferPool {
    pub fn new(count: usize, len: u32, align: usize) -> Self {
        assert!(count > 0);
        assert!(len > 0);

        let bufs = (0..count)
            .map(|_| RecordBuf::new_zeroed(len as usize, align))
            .collect();
        Self {
            bufs,
            busy: vec![false; count],
            next: 0,
            leased: 0,
        }
    }

    /// Index the next [`lease`](Self::lease) will hand out.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.next
    }

    /// Leases the next buffer in rotation.
    ///
    /// Fails if that buffer's previous read has not completed.
    pub fn lease(&mut self) -> Result<Lease, Violation> {
        let index = self.next;
        if self.busy[index] {
            return Err(Violation::BufferAliased { index });
        }

        self.busy[index] = true;
        self.leased += 1;
        self.next = (index + 1) % self.bufs.len();

        let buf = &mut self.bufs[index];
        Ok(Lease {
            index,
            ptr: buf.as_non_null(),
            len: buf.len() as u32,
        })
    }

    /// Overwrites a leased buffer before it reaches the engine, so stale bytes
    /// from an earlier read cannot pass for fresh data.
    pub fn scrub(&mut self, lease: &Lease, byte: u8) {
        assert!(self.busy[lease.index], "scrub of a buffer that was not leased");
        self.bufs[lease.index].fill(byte);
    }

    /// Takes back the most recent lease without it ever reaching the engine.
    pub fn unlease(&mut self, lease: Lease) {
        let prev = (self.next + self.bufs.len() - 1) % self.bufs.len();
        assert!(prev == lease.index, "only the most recent lease can be returned");
        self.release(lease.index);
        self.next = prev;
    }

    /// Returns a buffer whose read has completed.
    pub fn release(&mut self, index: usize) {
        assert!(self.busy[index], "release of a buffer that was not leased");
        self.busy[index] = false;
        self.leased -= 1;
    }

    /// Buffer index `offset` leases after `first`, wrapping.
    #[inline]
    pub fn index_after(&self, first: usize, offset: u64) -> usize {
        (first + (offset % self.bufs.len() as u64) as usize) % self.bufs.len()
    }

    pub fn get(&self, index: usize) -> &RecordBuf {
        &self.bufs[index]
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.leased
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.bufs.len()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::test_utils::proptest_cases;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(proptest_cases(64)))]

        #[test]
        fn full_rounds_never_alias(
            count in 1usize..16,
            rounds in proptest::collection::vec(0usize..16, 1..10),
        ) {
            let mut pool = BufferPool::new(count, 512, 512);
            for n in rounds {
                let n = n.min(count);
                let first = pool.cursor();
                let leases: Vec<Lease> = (0..n).map(|_| pool.lease().unwrap()).collect();
                for (i, lease) in leases.iter().enumerate() {
                    prop_assert_eq!(lease.index, pool.index_after(first, i as u64));
                }
                let mut ptrs: Vec<_> = leases.iter().map(|l| l.ptr).collect();
                ptrs.sort();
                ptrs.dedup();
                prop_assert_eq!(ptrs.len(), n);
                for lease in leases {
                    pool.release(lease.index);
                }
                prop_assert_eq!(pool.in_flight(), 0);
            }
        }
    }
}
