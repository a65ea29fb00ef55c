use std::{alloc::Layout, collections::BTreeMap, ptr::NonNull};

use postalloc::{PostAlloc, sizeclass};

#[global_allocator]
static ALLOC: PostAlloc = PostAlloc;

fn layout(size: usize, align: usize) -> Layout {
    Layout::from_size_align(size, align).unwrap()
}

#[test]
fn random_layouts() {
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    // start address -> (end address, fill byte, block, layout)
    let mut live = BTreeMap::<usize, (usize, u8, NonNull<u8>, Layout)>::new();

    for round in 0..20_000 {
        if !live.is_empty() && rng.u8(..) < 100 {
            let start = *live.keys().nth(rng.usize(..live.len())).unwrap();
            let (_, fill, ptr, layout) = live.remove(&start).unwrap();
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), layout.size()) };
            assert!(bytes.iter().all(|&b| b == fill), "block {start:#x} was overwritten");
            unsafe { ALLOC.deallocate(ptr, layout) };
            continue;
        }

        let size = match rng.u8(..) {
            0..200 => rng.usize(0..512),
            200..250 => rng.usize(512..1 << 16),
            _ => rng.usize(1 << 16..1 << 20),
        };
        let layout = layout(size, 1 << rng.u32(0..13));
        let ptr = ALLOC.allocate(layout).unwrap();
        let start = ptr.as_ptr().addr();
        assert_eq!(start % layout.align(), 0);
        assert!(ALLOC.usable_size(ptr.as_ptr()) >= size);

        let end = start + size.max(1);
        if let Some((&prev, &(prev_end, ..))) = live.range(..start).next_back() {
            assert!(prev_end <= start, "{prev:#x}..{prev_end:#x} overlaps {start:#x}");
        }
        if let Some((&next, _)) = live.range(start..).next() {
            assert!(end <= next, "{start:#x}..{end:#x} overlaps {next:#x}");
        }

        let fill = round as u8;
        unsafe { ptr.write_bytes(fill, size) };
        live.insert(start, (end, fill, ptr, layout));
    }

    for (_, (_, _, ptr, layout)) in live {
        unsafe { ALLOC.deallocate(ptr, layout) };
    }
    ALLOC.flush();
}

#[test]
fn zeroed_after_reuse() {
    for size in [8, 100, 3000, 70_000, 1 << 20] {
        let layout = layout(size, 8);
        let ptr = ALLOC.allocate(layout).unwrap();
        unsafe {
            ptr.write_bytes(0xa5, size);
            ALLOC.deallocate(ptr, layout);
        }
        let ptr = ALLOC.allocate_zeroed(layout).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == 0), "size {size}");
        unsafe { ALLOC.deallocate(ptr, layout) };
    }
}

#[test]
fn realloc_keeps_contents() {
    let mut vec = Vec::<u32>::new();
    for i in 0..100_000 {
        vec.push(i);
    }
    assert!(vec.iter().enumerate().all(|(i, &v)| i as u32 == v));
    vec.truncate(10);
    vec.shrink_to_fit();
    assert_eq!(vec, (0..10).collect::<Vec<_>>());

    let layout = layout(100, 8);
    let ptr = ALLOC.allocate(layout).unwrap();
    // Same size class: the block stays where it is.
    let same = unsafe { ALLOC.reallocate(ptr, layout, sizeclass::round_size(100)) }.unwrap();
    assert_eq!(same, ptr);
    unsafe { ALLOC.deallocate(same, layout) };
}

#[test]
fn queries_on_foreign_memory() {
    let local = 0u64;
    assert_eq!(ALLOC.usable_size((&raw const local).cast()), 0);
    assert!(!ALLOC.globals().is_owned((&raw const local).addr()));
}

#[test]
fn statistics() {
    let big = vec![1u8; 8 << 20];
    let stat = ALLOC.stat();
    assert!(stat.current >= big.len());
    assert!(stat.peak >= stat.current);
    assert!(stat.reserved >= stat.current);
    assert!(stat.heaps >= 1);
    drop(big);
}

#[test]
fn oversized_requests_fail() {
    let layout = layout(isize::MAX as usize - 4096, 1);
    assert!(ALLOC.allocate(layout).is_err());
    assert!(ALLOC.allocate_zeroed(layout).is_err());
}
