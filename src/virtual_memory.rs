//! The platform seam: page-size query, anonymous reserve+commit, protection
//! transitions, range release and instruction-cache flush. Nothing outside
//! this module talks to the OS.

use crate::Error;

/// Virtual memory information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Info {
    /// The size of a page of virtual memory.
    pub page_size: u32,
    /// The granularity at which ranges can be reserved.
    pub page_granularity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MemoryFlags(pub u32);

impl MemoryFlags {
    /// Memory is readable.
    pub const ACCESS_READ: u32 = 0x00000001;

    /// Memory is writable.
    pub const ACCESS_WRITE: u32 = 0x00000002;

    /// Memory is executable.
    pub const ACCESS_EXECUTE: u32 = 0x00000004;

    /// Memory is readable and writable.
    pub const ACCESS_RW: u32 = Self::ACCESS_READ | Self::ACCESS_WRITE;

    /// Memory is readable and executable.
    pub const ACCESS_RX: u32 = Self::ACCESS_READ | Self::ACCESS_EXECUTE;

    pub fn contains(self, other: u32) -> bool {
        (self.0 & other) != 0
    }
}

impl From<MemoryFlags> for u32 {
    fn from(val: MemoryFlags) -> Self {
        val.0
    }
}

impl From<u32> for MemoryFlags {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

cfgenius::cond! {
    if cfg(not(windows)) {

        use errno::errno;
        use libc::{EACCES, EAGAIN, ENODEV, ENOMEM, EOVERFLOW, EPERM};

        fn error_from_errno() -> Error {
            match errno().0 {
                EACCES | EAGAIN | ENODEV | EPERM => Error::InvalidState,
                ENOMEM | EOVERFLOW => Error::OutOfMemory,

                _ => Error::InvalidArgument,
            }
        }

        fn get_vm_info() -> Info {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };

            Info {
                page_size: page_size as _,
                page_granularity: page_size as _,
            }
        }

        fn mm_prot_from_memory_flags(memory_flags: MemoryFlags) -> i32 {
            let mut prot = 0;

            let x = memory_flags;
            if x.contains(MemoryFlags::ACCESS_READ) { prot |= libc::PROT_READ }
            if x.contains(MemoryFlags::ACCESS_WRITE) { prot |= libc::PROT_WRITE }
            if x.contains(MemoryFlags::ACCESS_EXECUTE) { prot |= libc::PROT_EXEC }

            prot
        }

        /// Reserves and commits `size` bytes of anonymous virtual memory.
        ///
        /// The mapping is private, not backed by a file, populated lazily by
        /// the OS, and the returned address is page-aligned.
        pub fn alloc(size: usize, memory_flags: MemoryFlags) -> Result<*mut u8, Error> {
            if size == 0 {
                return Err(Error::InvalidArgument);
            }

            let protection = mm_prot_from_memory_flags(memory_flags);

            unsafe {
                let ptr = libc::mmap(
                    core::ptr::null_mut(),
                    size as _,
                    protection,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );

                if ptr == libc::MAP_FAILED {
                    return Err(error_from_errno());
                }

                Ok(ptr.cast())
            }
        }

        /// Releases a range previously obtained from [`alloc`].
        pub fn release(ptr: *mut u8, size: usize) -> Result<(), Error> {
            if size == 0 {
                return Err(Error::InvalidArgument);
            }

            unsafe {
                if libc::munmap(ptr.cast(), size as _) == 0 {
                    Ok(())
                } else {
                    Err(error_from_errno())
                }
            }
        }

        /// Changes the protection of `[p, p + size)`. The range must be
        /// page-aligned at both ends.
        pub fn protect(p: *mut u8, size: usize, memory_flags: MemoryFlags) -> Result<(), Error> {
            let protection = mm_prot_from_memory_flags(memory_flags);

            unsafe {
                if libc::mprotect(p.cast(), size as _, protection) == 0 {
                    Ok(())
                } else {
                    Err(error_from_errno())
                }
            }
        }

    }
}

cfgenius::cond! {
    if cfg(windows) {

        use core::mem::MaybeUninit;

        use winapi::shared::minwindef::DWORD;
        use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
        use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
        use winapi::um::winnt::{
            MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
            PAGE_READONLY, PAGE_READWRITE,
        };

        fn get_vm_info() -> Info {
            let mut system_info = MaybeUninit::<SYSTEM_INFO>::uninit();
            unsafe {
                GetSystemInfo(system_info.as_mut_ptr());

                let system_info = system_info.assume_init();

                Info {
                    page_size: system_info.dwPageSize as u32,
                    page_granularity: system_info.dwAllocationGranularity as u32,
                }
            }
        }

        fn protect_flags_from_memory_flags(memory_flags: MemoryFlags) -> DWORD {
            if memory_flags.contains(MemoryFlags::ACCESS_EXECUTE) {
                if memory_flags.contains(MemoryFlags::ACCESS_WRITE) {
                    PAGE_EXECUTE_READWRITE
                } else {
                    PAGE_EXECUTE_READ
                }
            } else if memory_flags.contains(MemoryFlags::ACCESS_WRITE) {
                PAGE_READWRITE
            } else {
                PAGE_READONLY
            }
        }

        /// Reserves and commits `size` bytes of anonymous virtual memory.
        ///
        /// Reserve and commit happen in one call so that the first write into
        /// the range cannot fault later. The returned address is aligned to
        /// the allocation granularity, which is at least a page.
        pub fn alloc(size: usize, memory_flags: MemoryFlags) -> Result<*mut u8, Error> {
            if size == 0 {
                return Err(Error::InvalidArgument);
            }

            unsafe {
                let protect = protect_flags_from_memory_flags(memory_flags);
                let result = VirtualAlloc(core::ptr::null_mut(), size, MEM_COMMIT | MEM_RESERVE, protect);

                if result.is_null() {
                    return Err(Error::OutOfMemory);
                }

                Ok(result as *mut u8)
            }
        }

        /// Releases a range previously obtained from [`alloc`].
        pub fn release(ptr: *mut u8, size: usize) -> Result<(), Error> {
            if size == 0 || ptr.is_null() {
                return Err(Error::InvalidArgument);
            }

            unsafe {
                if VirtualFree(ptr as *mut _, 0, MEM_RELEASE) == 0 {
                    return Err(Error::InvalidArgument);
                }
            }

            Ok(())
        }

        /// Changes the protection of `[p, p + size)`. The range must be
        /// page-aligned at both ends.
        pub fn protect(p: *mut u8, size: usize, memory_flags: MemoryFlags) -> Result<(), Error> {
            let protect_flags = protect_flags_from_memory_flags(memory_flags);
            let mut old_flags = 0;

            unsafe {
                if VirtualProtect(p as _, size, protect_flags, &mut old_flags) != 0 {
                    return Ok(());
                }

                Err(Error::InvalidArgument)
            }
        }

    }
}

pub fn info() -> Info {
    static INFO: once_cell::sync::Lazy<Info> = once_cell::sync::Lazy::new(get_vm_info);

    *INFO
}

/// Flushes the instruction cache in the given region.
///
/// A no-op on x86/x64 where the caches are coherent; mandatory on
/// architectures with split instruction and data caches.
pub fn flush_instruction_cache(p: *const u8, size: usize) {
    cfgenius::cond! {
        if cfg(any(target_arch = "x86", target_arch = "x86_64")) {
            let _ = p;
            let _ = size;
        } else if cfg(target_vendor = "apple") {
            extern "C" {
                fn sys_icache_invalidate(p: *const u8, size: usize);
            }

            unsafe {
                sys_icache_invalidate(p, size);
            }
        } else if cfg(windows) {
            unsafe {
                let process = winapi::um::processthreadsapi::GetCurrentProcess();
                let ok = winapi::um::processthreadsapi::FlushInstructionCache(process, p.cast(), size);
                assert!(ok != 0, "failed to flush instruction cache");
            }
        } else if cfg(target_arch = "aarch64") {
            use core::arch::asm;

            use crate::util::align_down;

            const CACHE_LINE_SIZE: usize = 64;

            let start = p as usize;
            let end = start + size;

            // Clean the data cache to the point of unification, then
            // invalidate the instruction cache over the same lines.
            let mut addr = align_down(start, CACHE_LINE_SIZE);
            while addr < end {
                unsafe {
                    asm!("dc cvau, {}", in(reg) addr);
                }
                addr += CACHE_LINE_SIZE;
            }

            unsafe {
                asm!("dsb ish");
            }

            addr = align_down(start, CACHE_LINE_SIZE);
            while addr < end {
                unsafe {
                    asm!("ic ivau, {}", in(reg) addr);
                }
                addr += CACHE_LINE_SIZE;
            }

            unsafe {
                asm!("dsb ish");
                asm!("isb");
            }
        } else if cfg(target_arch = "riscv64") {
            unsafe {
                let _ = wasmtime_jit_icache_coherence::clear_cache(p.cast(), size);
                let _ = wasmtime_jit_icache_coherence::pipeline_flush_mt();
            }
        } else {
            let _ = p;
            let _ = size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_reports_a_sane_page_size() {
        let info = info();

        assert!(info.page_size.is_power_of_two());
        assert!(info.page_granularity >= info.page_size);
    }

    #[test]
    fn alloc_write_protect_read_release_roundtrip() {
        let page_size = info().page_size as usize;
        let ptr = alloc(page_size, MemoryFlags::ACCESS_RW.into()).unwrap();

        assert_eq!(ptr as usize % page_size, 0);

        unsafe {
            ptr.write_bytes(0x5A, page_size);
        }

        protect(ptr, page_size, MemoryFlags::ACCESS_RX.into()).unwrap();
        flush_instruction_cache(ptr, page_size);

        let contents = unsafe { core::slice::from_raw_parts(ptr, page_size) };
        assert!(contents.iter().all(|&b| b == 0x5A));

        release(ptr, page_size).unwrap();
    }

    #[test]
    fn zero_sized_requests_are_rejected() {
        assert_eq!(
            alloc(0, MemoryFlags::ACCESS_RW.into()),
            Err(crate::Error::InvalidArgument)
        );
        assert_eq!(
            release(core::ptr::null_mut(), 0),
            Err(crate::Error::InvalidArgument)
        );
    }
}
