use core::ffi::c_void;

use crate::util::{align_up, is_aligned};
use crate::virtual_memory::{self, MemoryFlags};
use crate::Error;

/// Space reserved at the start of every block for the unwind prelude. The
/// registry discovers the real size only after a block exists, so this upper
/// bound is what the capacity check has to assume.
pub const MAX_UNWIND_DATA_SIZE: usize = 256;

/// Alignment of the data and code regions inside a block.
const CODE_ALIGNMENT: usize = 16;

/// Opaque per-block unwind metadata handle, produced by
/// [`UnwindRegistry::register_block`] and handed back to
/// [`UnwindRegistry::deregister_block`] at teardown.
pub type UnwindHandle = *mut c_void;

/// Per-block unwind metadata hook.
///
/// Unwind encoding is ABI-specific (`RUNTIME_FUNCTION` tables on x64 Windows,
/// `.eh_frame` FDE registration on System V), so the allocator does not embed
/// it. Instead, a registry is invoked once for every freshly reserved block
/// and may write its metadata into the block's first bytes.
pub trait UnwindRegistry {
    /// Writes unwind metadata at `block` and registers it with the platform
    /// unwinder. At most [`MAX_UNWIND_DATA_SIZE`] bytes may be written; the
    /// returned count is rounded up to a 16-byte multiple by the allocator.
    ///
    /// Returning `None` vetoes the block: the allocator releases it and the
    /// triggering allocation fails with [`Error::UnwindInfoRejected`].
    fn register_block(&mut self, block: *mut u8, block_size: usize)
        -> Option<(UnwindHandle, usize)>;

    /// Called for every stored handle at teardown, before the corresponding
    /// block is unreserved.
    fn deregister_block(&mut self, handle: UnwindHandle);
}

/// A span published by [`CodeAllocator::allocate`]. The pages behind it are
/// `READ|EXECUTE` and stay valid until the allocator is dropped.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    /// First byte owned by the allocation, right after the block's unwind
    /// prelude if this allocation created the block.
    pub base: *const u8,
    /// Data bytes rounded up to 16 plus code bytes.
    pub size: usize,
    /// 16-byte-aligned start of the executable region.
    pub code_start: *const u8,
}

/// Publishes machine code into executable memory.
///
/// Memory is reserved in `block_size` chunks and bump-allocated at page
/// granularity: every published allocation consumes whole pages, so the
/// cursor always sits on a protection boundary and a page is never writable
/// and executable at the same time. Individual allocations are never freed;
/// everything is released when the allocator is dropped.
///
/// The allocator assumes exclusive access. Callers that publish code from
/// several threads must serialize externally or keep one allocator per
/// thread.
pub struct CodeAllocator {
    block_size: usize,
    max_total_size: usize,

    blocks: Vec<*mut u8>,
    unwind_infos: Vec<UnwindHandle>,

    block_pos: *mut u8,
    block_end: *mut u8,

    unwind_registry: Option<Box<dyn UnwindRegistry>>,
}

impl CodeAllocator {
    /// Creates an allocator that reserves memory in `block_size` chunks and
    /// never holds more than `max_total_size` bytes in total.
    ///
    /// # Panics
    ///
    /// Panics unless `block_size > MAX_UNWIND_DATA_SIZE` and
    /// `max_total_size >= block_size`.
    pub fn new(block_size: usize, max_total_size: usize) -> Self {
        assert!(block_size > MAX_UNWIND_DATA_SIZE);
        assert!(max_total_size >= block_size);

        Self {
            block_size,
            max_total_size,
            blocks: Vec::new(),
            unwind_infos: Vec::new(),
            block_pos: core::ptr::null_mut(),
            block_end: core::ptr::null_mut(),
            unwind_registry: None,
        }
    }

    /// Installs the unwind hook. Must happen before the first allocation so
    /// that every block carries a prelude.
    pub fn set_unwind_registry(&mut self, registry: Box<dyn UnwindRegistry>) {
        assert!(self.blocks.is_empty());
        self.unwind_registry = Some(registry);
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn max_total_size(&self) -> usize {
        self.max_total_size
    }

    /// Copies `data` and `code` into executable memory and returns where they
    /// ended up.
    ///
    /// Layout within the block, starting at the page-aligned cursor: unwind
    /// prelude (only when this call reserved a fresh block), left-padding so
    /// that the data region ends on a 16-byte boundary, `data`, `code`,
    /// padding up to the next page boundary. Left-padding the data is what
    /// makes the code start 16-byte-aligned without any help from the caller.
    ///
    /// On success the written pages are `READ|EXECUTE` and the instruction
    /// cache has been flushed over the code range. On failure nothing
    /// changed: no cursor movement, no new block, no partial copy.
    pub fn allocate(&mut self, data: &[u8], code: &[u8]) -> Result<Allocation, Error> {
        let page_size = virtual_memory::info().page_size as usize;

        let aligned_data_size = align_up(data.len(), CODE_ALIGNMENT);
        let total_size = aligned_data_size + code.len();

        if total_size == 0 {
            return Err(Error::InvalidArgument);
        }

        // Has to fit into a single block together with the unwind prelude.
        if total_size > self.block_size - MAX_UNWIND_DATA_SIZE {
            return Err(Error::TooLarge);
        }

        let mut unwind_info_size = 0;

        if total_size > self.remaining() {
            unwind_info_size = self.allocate_new_block()?;
            assert!(unwind_info_size + total_size <= self.remaining());
        }

        debug_assert!(is_aligned(self.block_pos as usize, page_size));

        let data_offset = unwind_info_size + aligned_data_size - data.len();
        let code_offset = unwind_info_size + aligned_data_size;

        unsafe {
            if !data.is_empty() {
                core::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    self.block_pos.add(data_offset),
                    data.len(),
                );
            }
            if !code.is_empty() {
                core::ptr::copy_nonoverlapping(
                    code.as_ptr(),
                    self.block_pos.add(code_offset),
                    code.len(),
                );
            }
        }

        let page_span = align_up(unwind_info_size + total_size, page_size);

        // A failed transition would leave pages that are writable here and
        // executable to the CPU; there is no way to recover from that.
        virtual_memory::protect(self.block_pos, page_span, MemoryFlags::ACCESS_RX.into())
            .expect("failed to change page protection");
        virtual_memory::flush_instruction_cache(
            unsafe { self.block_pos.add(code_offset) },
            code.len(),
        );

        let allocation = Allocation {
            base: unsafe { self.block_pos.add(unwind_info_size) },
            size: total_size,
            code_start: unsafe { self.block_pos.add(code_offset) },
        };

        self.block_pos = unsafe { self.block_pos.add(page_span) };
        debug_assert!(is_aligned(self.block_pos as usize, page_size));
        debug_assert!(self.block_pos <= self.block_end);

        Ok(allocation)
    }

    fn remaining(&self) -> usize {
        self.block_end as usize - self.block_pos as usize
    }

    /// Reserves the next block and, when a registry is installed, lets it
    /// write the block's unwind prelude. Returns the rounded prelude size.
    ///
    /// Nothing is committed until every step has succeeded: a vetoed block is
    /// released on the spot and the cursor, block list and handle list stay
    /// exactly as they were.
    fn allocate_new_block(&mut self) -> Result<usize, Error> {
        // Hard cap, counting the block about to be created.
        if (self.blocks.len() + 1) * self.block_size > self.max_total_size {
            return Err(Error::CapacityExhausted);
        }

        let block = virtual_memory::alloc(self.block_size, MemoryFlags::ACCESS_RW.into())?;

        let mut unwind_info_size = 0;

        if let Some(registry) = self.unwind_registry.as_mut() {
            match registry.register_block(block, self.block_size) {
                Some((handle, size_written)) => {
                    // Round up so the data and code that follow keep their
                    // 16-byte alignment.
                    unwind_info_size = align_up(size_written, CODE_ALIGNMENT);
                    assert!(unwind_info_size <= MAX_UNWIND_DATA_SIZE);

                    self.unwind_infos.push(handle);
                }
                None => {
                    let released = virtual_memory::release(block, self.block_size);
                    debug_assert!(released.is_ok());

                    return Err(Error::UnwindInfoRejected);
                }
            }
        }

        self.blocks.push(block);
        self.block_pos = block;
        self.block_end = unsafe { block.add(self.block_size) };

        Ok(unwind_info_size)
    }
}

impl Drop for CodeAllocator {
    fn drop(&mut self) {
        // Unwind tables can be keyed by block address; deregister every
        // handle before the addresses are reused.
        if let Some(registry) = self.unwind_registry.as_mut() {
            for handle in self.unwind_infos.drain(..) {
                registry.deregister_block(handle);
            }
        }

        for block in self.blocks.drain(..) {
            let released = virtual_memory::release(block, self.block_size);
            debug_assert!(released.is_ok());
        }
    }
}
