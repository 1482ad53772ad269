use std::cell::{Cell, RefCell};
use std::rc::Rc;

use code_alloc::{CodeAllocator, Error, UnwindHandle, UnwindRegistry};

fn page_size() -> usize {
    code_alloc::virtual_memory::info().page_size as usize
}

fn round_up(x: usize, alignment: usize) -> usize {
    (x + alignment - 1) & !(alignment - 1)
}

#[test]
fn published_spans_are_aligned_disjoint_and_faithful() {
    let page = page_size();
    let mut allocator = CodeAllocator::new(4 * page, 16 * page);

    let requests: &[(usize, usize)] = &[
        (0, 17),
        (3, 1),
        (16, 64),
        (1, 0),
        (40, 2 * page),
        (0, page + 5),
        (129, 333),
    ];

    let mut spans = Vec::new();

    for (i, &(data_len, code_len)) in requests.iter().enumerate() {
        let data: Vec<u8> = (0..data_len).map(|j| (i + j) as u8).collect();
        let code: Vec<u8> = (0..code_len).map(|j| (i ^ j) as u8).collect();

        let allocation = allocator.allocate(&data, &code).unwrap();

        assert_eq!(allocation.size, round_up(data_len, 16) + code_len);
        assert_eq!(allocation.code_start as usize % 16, 0);
        // No unwind registry, so every span starts at the page-aligned cursor.
        assert_eq!(allocation.base as usize % page, 0);

        let base = allocation.base as usize;
        let data_start = base + round_up(data_len, 16) - data_len;
        unsafe {
            let published_data = core::slice::from_raw_parts(data_start as *const u8, data_len);
            assert_eq!(published_data, &data[..]);

            let published_code = core::slice::from_raw_parts(allocation.code_start, code_len);
            assert_eq!(published_code, &code[..]);
        }

        spans.push((base, base + allocation.size));
    }

    for (i, &(a_start, a_end)) in spans.iter().enumerate() {
        for &(b_start, b_end) in &spans[i + 1..] {
            assert!(a_end <= b_start || b_end <= a_start, "spans overlap");
        }
    }
}

#[test]
fn total_size_cap_is_a_hard_upper_bound() {
    let page = page_size();
    let mut allocator = CodeAllocator::new(4 * page, 16 * page);

    // Each request leaves less than a request's worth of tail in its block,
    // so every one of them consumes a fresh block.
    let code = vec![0x90u8; 4 * page - page];

    for _ in 0..4 {
        allocator.allocate(&[], &code).unwrap();
    }
    assert_eq!(allocator.block_count(), 4);

    assert_eq!(
        allocator.allocate(&[], &code).unwrap_err(),
        Error::CapacityExhausted
    );
    assert_eq!(allocator.block_count(), 4);

    // The failure had no side effects: the last block's tail page is still
    // there for a request that fits it.
    allocator.allocate(&[], &[0xC3]).unwrap();
    assert_eq!(allocator.block_count(), 4);
}

#[cfg(target_os = "linux")]
#[test]
fn published_pages_are_mapped_read_execute() {
    let page = page_size();
    let mut allocator = CodeAllocator::new(4 * page, 16 * page);

    let allocation = allocator.allocate(&[], &[0xC3u8; 32]).unwrap();
    let addr = allocation.code_start as usize;

    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
    let perms = maps
        .lines()
        .find_map(|line| {
            let (range, rest) = line.split_once(' ')?;
            let (start, end) = range.split_once('-')?;
            let start = usize::from_str_radix(start, 16).ok()?;
            let end = usize::from_str_radix(end, 16).ok()?;
            (start..end).contains(&addr).then(|| &rest[..4])
        })
        .expect("code address not found in /proc/self/maps");

    assert_eq!(perms, "r-xp");
}

struct RecordingRegistry {
    prelude_len: usize,
    registered: Rc<RefCell<Vec<usize>>>,
    deregistered: Rc<RefCell<Vec<usize>>>,
}

impl UnwindRegistry for RecordingRegistry {
    fn register_block(
        &mut self,
        block: *mut u8,
        _block_size: usize,
    ) -> Option<(UnwindHandle, usize)> {
        unsafe {
            core::ptr::write_bytes(block, 0xEE, self.prelude_len);
        }
        self.registered.borrow_mut().push(block as usize);
        Some((block.cast(), self.prelude_len))
    }

    fn deregister_block(&mut self, handle: UnwindHandle) {
        self.deregistered.borrow_mut().push(handle as usize);
    }
}

#[test]
fn unwind_preludes_are_written_once_per_block_and_torn_down_in_order() {
    let page = page_size();
    let registered = Rc::new(RefCell::new(Vec::new()));
    let deregistered = Rc::new(RefCell::new(Vec::new()));

    {
        let mut allocator = CodeAllocator::new(4 * page, 16 * page);
        allocator.set_unwind_registry(Box::new(RecordingRegistry {
            prelude_len: 40,
            registered: Rc::clone(&registered),
            deregistered: Rc::clone(&deregistered),
        }));

        // Three allocations, two blocks: the first two each need three pages,
        // the third packs into the second block's tail.
        let big = vec![0x90u8; 2 * page + 1];
        let first = allocator.allocate(&[], &big).unwrap();
        let second = allocator.allocate(&[], &big).unwrap();
        let third = allocator.allocate(&[], &[0xC3]).unwrap();

        assert_eq!(allocator.block_count(), 2);

        let blocks = registered.borrow().clone();
        assert_eq!(blocks.len(), 2);

        // 40 prelude bytes round up to 48; the block-opening allocations sit
        // right behind them, later ones on the next page boundary.
        assert_eq!(first.base as usize, blocks[0] + 48);
        assert_eq!(second.base as usize, blocks[1] + 48);
        assert_eq!(third.base as usize, blocks[1] + 3 * page);

        for &block in &blocks {
            let prelude = unsafe { core::slice::from_raw_parts(block as *const u8, 40) };
            assert!(prelude.iter().all(|&b| b == 0xEE));
        }

        assert!(deregistered.borrow().is_empty());
    }

    // Teardown hands every handle back exactly once.
    assert_eq!(*deregistered.borrow(), *registered.borrow());
}

struct VetoOnSecondBlock {
    calls: usize,
    deregistered: Rc<Cell<usize>>,
}

impl UnwindRegistry for VetoOnSecondBlock {
    fn register_block(
        &mut self,
        block: *mut u8,
        _block_size: usize,
    ) -> Option<(UnwindHandle, usize)> {
        self.calls += 1;
        if self.calls > 1 {
            return None;
        }
        Some((block.cast(), 16))
    }

    fn deregister_block(&mut self, _handle: UnwindHandle) {
        self.deregistered.set(self.deregistered.get() + 1);
    }
}

#[test]
fn vetoed_block_fails_the_allocation_and_leaves_the_rest_intact() {
    let page = page_size();
    let deregistered = Rc::new(Cell::new(0));

    {
        let mut allocator = CodeAllocator::new(4 * page, 16 * page);
        allocator.set_unwind_registry(Box::new(VetoOnSecondBlock {
            calls: 0,
            deregistered: Rc::clone(&deregistered),
        }));

        let code: Vec<u8> = (0..2 * page + 200).map(|i| i as u8).collect();
        let first = allocator.allocate(&[], &code).unwrap();

        // The next big request needs a second block, which the hook vetoes.
        assert_eq!(
            allocator.allocate(&[], &code).unwrap_err(),
            Error::UnwindInfoRejected
        );
        assert_eq!(allocator.block_count(), 1);

        // The first block's published bytes are untouched...
        let published = unsafe { core::slice::from_raw_parts(first.code_start, code.len()) };
        assert_eq!(published, &code[..]);

        // ...and the cursor did not move: a request that fits the first
        // block's tail page still lands there.
        let small = allocator.allocate(&[], &[0xC3]).unwrap();
        assert_eq!(small.base as usize, first.base as usize - 16 + 3 * page);
        assert_eq!(allocator.block_count(), 1);
    }

    assert_eq!(deregistered.get(), 1);
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn published_code_is_callable() {
    let page = page_size();
    let mut allocator = CodeAllocator::new(4 * page, 16 * page);

    // mov rax, rdi; add rax, rsi; ret
    let code = [0x48, 0x89, 0xf8, 0x48, 0x01, 0xf0, 0xc3];
    let allocation = allocator.allocate(&[], &code).unwrap();

    let add: extern "C" fn(u64, u64) -> u64 =
        unsafe { core::mem::transmute(allocation.code_start) };

    assert_eq!(add(1, 2), 3);
    assert_eq!(add(u64::MAX, 1), 0);
}
