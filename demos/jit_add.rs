//! Publishes a hand-assembled `add` function and calls it.

use code_alloc::CodeAllocator;

#[cfg(all(target_arch = "x86_64", unix))]
// mov rax, rdi; add rax, rsi; ret
const ADD: &[u8] = &[0x48, 0x89, 0xf8, 0x48, 0x01, 0xf0, 0xc3];

#[cfg(all(target_arch = "x86_64", windows))]
// mov rax, rcx; add rax, rdx; ret
const ADD: &[u8] = &[0x48, 0x89, 0xc8, 0x48, 0x01, 0xd0, 0xc3];

#[cfg(target_arch = "aarch64")]
// add x0, x1, x0; ret
const ADD: &[u8] = &[0x20, 0x00, 0x00, 0x8b, 0xc0, 0x03, 0x5f, 0xd6];

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn main() {
    let mut allocator = CodeAllocator::new(64 * 1024, 1024 * 1024);

    let allocation = allocator.allocate(&[], ADD).unwrap();

    println!(
        "published {} code bytes at {:p}",
        allocation.size, allocation.code_start
    );

    let add: extern "C" fn(u64, u64) -> u64 =
        unsafe { std::mem::transmute(allocation.code_start) };

    println!("add(1, 2) = {}", add(1, 2));
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn main() {
    println!("no canned machine code for this architecture");
}
