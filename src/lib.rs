//! Executable code allocator for JIT compilers.
//!
//! Machine code and its read-only data are published into large page-aligned
//! blocks of virtual memory. Freshly written ranges are flipped from
//! `READ|WRITE` to `READ|EXECUTE` a whole page at a time, the instruction
//! cache is flushed over the code, and an optional per-block hook can attach
//! unwind metadata for the platform stack unwinder.

pub mod allocator;
pub mod util;
pub mod virtual_memory;

/// Errors surfaced by the allocator and the underlying platform layer.
///
/// Every failure leaves the allocator untouched; there is no partial state
/// to clean up and no retry happens internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Error {
    InvalidState,
    OutOfMemory,
    InvalidArgument,
    /// The request can never fit into a single block.
    TooLarge,
    /// Reserving another block would exceed the configured total-size cap.
    CapacityExhausted,
    /// The unwind registry refused to produce metadata for a new block.
    UnwindInfoRejected,
}

pub use {
    allocator::{Allocation, CodeAllocator, UnwindHandle, UnwindRegistry, MAX_UNWIND_DATA_SIZE},
    virtual_memory::flush_instruction_cache,
};
