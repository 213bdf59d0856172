//! Protocol constants for the resize-under-load verifier.
//!
//! # Design Decisions
//!
//! Counts and sizes use `u32` to match the kernel ABI (`sq_entries`, `cq_entries`,
//! `len`). Byte budgets use `u64`.
//!
//! All invariants verified at compile time via `const` assertions.

// =============================================================================
// Platform verification
// =============================================================================

// Compile-time proof that u32 -> usize is safe on this platform.
const _: () = assert!(
    size_of::<usize>() >= size_of::<u32>(),
    "Platform must have at least 32-bit addressing"
);

// =============================================================================
// Round shape
// =============================================================================

/// Maximum operations placed per submission round.
pub const FAN_OUT_DEFAULT: u32 = 128;

/// A resize is issued after every `RESIZE_STRIDE`th completion drained in a round.
///
/// Prime so it never lines up with power-of-two fan-outs or pool sizes.
pub const RESIZE_STRIDE: u32 = 17;

/// Consecutive rounds with no accepted op before a scenario is declared stuck.
pub const EMPTY_ROUNDS_MAX: u32 = 1 << 16;

/// Ring size requested at setup; the CQ gets the kernel's default of twice the SQ.
pub const SETUP_SQ_ENTRIES: u32 = 8;
pub const SETUP_CQ_ENTRIES: u32 = 2 * SETUP_SQ_ENTRIES;

/// Ring size every bulk scenario grows to before its first round.
pub const PRELUDE_SQ_ENTRIES: u32 = 128;
pub const PRELUDE_CQ_ENTRIES: u32 = 128;

/// Target the baseline scenario resizes to between its two operations.
pub const BASIC_SQ_ENTRIES: u32 = 32;
pub const BASIC_CQ_ENTRIES: u32 = 64;

// =============================================================================
// Buffers and reads
// =============================================================================

/// Page size used for buffer alignment (direct I/O friendly).
pub const PAGE_SIZE: usize = 4096;

/// Largest alignment a record buffer may request.
pub const BUFFER_ALIGN_MAX: usize = 64 * 1024;

/// Bytes per read operation.
pub const RECORD_LEN: u32 = 4096;

/// Offset advance between consecutive positional reads.
pub const READ_OFFSET_STRIDE: u64 = 8192;

/// Total bytes the positional-read scenario accounts for (one record per completion).
pub const READ_BUDGET_BYTES: u64 = 64 * 1024 * 1024;

// =============================================================================
// Stimulus actor
// =============================================================================

/// Number of writes the stimulus actor issues into the pipe.
pub const STREAM_WRITES: u32 = 4096;

/// Bytes per stimulus write.
pub const STREAM_WRITE_LEN: u32 = 4096;

/// Pause between stimulus writes, in microseconds.
pub const STREAM_WRITE_INTERVAL_US: u64 = 5;

/// Delay before the stimulus actor's first write, in milliseconds.
pub const STREAM_WARMUP_MS: u64 = 10;

// =============================================================================
// Kernel limits
// =============================================================================

/// Largest SQ size the kernel accepts (`IORING_MAX_ENTRIES`).
pub const SQ_ENTRIES_MAX: u32 = 32768;

/// Largest CQ size the kernel accepts (`IORING_MAX_CQ_ENTRIES`).
pub const CQ_ENTRIES_MAX: u32 = 2 * SQ_ENTRIES_MAX;

/// Longest the kernel engine waits for one completion before reporting a stall.
pub const CQE_WAIT_TIMEOUT_MS: u64 = 5_000;

const _: () = assert!(CQE_WAIT_TIMEOUT_MS > 0);

// =============================================================================
// Runner exit codes
// =============================================================================

pub const EXIT_PASS: i32 = 0;
pub const EXIT_FAIL: i32 = 1;
pub const EXIT_SKIP: i32 = 77;

// =============================================================================
// Compile-time design integrity assertions
// =============================================================================

const _: () = assert!(FAN_OUT_DEFAULT > 0);
const _: () = assert!(FAN_OUT_DEFAULT <= PRELUDE_SQ_ENTRIES);
const _: () = assert!(
    !RESIZE_STRIDE.is_power_of_two(),
    "Resize stride must not alias power-of-two periodicities"
);
const _: () = assert!(RESIZE_STRIDE > 1);

const _: () = assert!(EMPTY_ROUNDS_MAX > 0);

const _: () = assert!(SETUP_SQ_ENTRIES.is_power_of_two());
const _: () = assert!(SETUP_CQ_ENTRIES >= SETUP_SQ_ENTRIES);
const _: () = assert!(PRELUDE_SQ_ENTRIES.is_power_of_two());
const _: () = assert!(PRELUDE_CQ_ENTRIES >= PRELUDE_SQ_ENTRIES);
const _: () = assert!(BASIC_CQ_ENTRIES >= BASIC_SQ_ENTRIES);

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(BUFFER_ALIGN_MAX.is_power_of_two());
const _: () = assert!(PAGE_SIZE <= BUFFER_ALIGN_MAX);
const _: () = assert!(RECORD_LEN > 0);
const _: () = assert!(
    (RECORD_LEN as usize).is_multiple_of(PAGE_SIZE),
    "Records must be page multiples for O_DIRECT"
);
const _: () = assert!(
    READ_OFFSET_STRIDE >= RECORD_LEN as u64,
    "Positional reads must not overlap"
);
const _: () = assert!(READ_OFFSET_STRIDE.is_multiple_of(PAGE_SIZE as u64));
const _: () = assert!(READ_BUDGET_BYTES.is_multiple_of(RECORD_LEN as u64));

const _: () = assert!(
    STREAM_WRITES > FAN_OUT_DEFAULT,
    "Stream reads are sized as writes minus one full round"
);
const _: () = assert!(STREAM_WRITE_LEN > 0);

const _: () = assert!(SQ_ENTRIES_MAX.is_power_of_two());
const _: () = assert!(CQ_ENTRIES_MAX.is_power_of_two());

const _: () = assert!(EXIT_PASS != EXIT_FAIL);
const _: () = assert!(EXIT_SKIP != EXIT_FAIL && EXIT_SKIP != EXIT_PASS);
