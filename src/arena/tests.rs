// SPDX-License-Identifier: Apache-2.0

use super::*;

use std::thread;

fn arenas(capacity: usize) -> Arc<Arenas> {
    let arenas = Arc::new(Arenas::new());
    arenas.configure_capacity(capacity).unwrap();
    arenas
}

#[test]
fn exhaust_and_clear() {
    let arenas = arenas(4096);
    let mut arena = arenas.arena();

    arena.allocate(4000).unwrap();
    assert!(matches!(arena.allocate(200), Err(Error::OutOfMemory)));

    arena.clear();
    arena.allocate(200).unwrap();
}

#[test]
fn rounding() {
    assert_eq!(align_up(0), Some(0));
    assert_eq!(align_up(1), Some(ALIGNMENT));
    assert_eq!(align_up(ALIGNMENT), Some(ALIGNMENT));
    assert_eq!(align_up(ALIGNMENT + 1), Some(2 * ALIGNMENT));
    assert_eq!(align_up(usize::MAX), None);
}

#[test]
fn disjoint_and_in_bounds() {
    let arenas = arenas(4096);
    let mut arena = arenas.arena();

    let blocks: Vec<_> = [1, 17, 32, 100, 5]
        .iter()
        .map(|size| arena.allocate(*size).unwrap())
        .collect();

    let base = blocks[0].as_ptr() as *mut u8 as usize;
    let end = base + arena.capacity();

    for (i, block) in blocks.iter().enumerate() {
        let start = block.as_ptr() as *mut u8 as usize;
        assert_eq!(start % ALIGNMENT, 0);
        assert!(start >= base && start + block.len() <= end);

        for other in &blocks[i + 1..] {
            let other = other.as_ptr() as *mut u8 as usize;
            assert!(other >= start + align_up(block.len()).unwrap());
        }
    }

    assert_eq!(arena.used(), 16 + 32 + 32 + 112 + 16);
}

#[test]
fn failure_does_not_mutate() {
    let arenas = arenas(4096);
    let mut arena = arenas.arena();

    arena.allocate(1024).unwrap();
    assert_eq!(arena.used(), 1024);

    assert!(arena.allocate(4096).is_err());
    assert_eq!(arena.used(), 1024);

    assert!(matches!(arena.allocate(usize::MAX), Err(Error::Overflow)));
    assert_eq!(arena.used(), 1024);

    arena.allocate(3072).unwrap();
    assert_eq!(arena.used(), 4096);
}

#[test]
fn reuse_after_clear() {
    let arenas = arenas(4096);
    let mut arena = arenas.arena();

    let first = arena.allocate(64).unwrap();
    arena.clear();
    assert_eq!(arena.used(), 0);

    let second = arena.allocate(64).unwrap();
    assert_eq!(first.as_ptr() as *mut u8, second.as_ptr() as *mut u8);
    assert_eq!(arenas.count(), 1);
}

#[test]
fn configure_capacity() {
    let arenas = Arc::new(Arenas::with_max_capacity(8192));
    assert_eq!(arenas.capacity(), 8192);

    arenas.configure_capacity(4096).unwrap();
    let mut old = arenas.arena();
    old.allocate(1).unwrap();
    assert_eq!(old.capacity(), 4096);

    assert!(matches!(
        arenas.configure_capacity(8193),
        Err(Error::CapacityTooLarge {
            requested: 8193,
            max: 8192
        })
    ));
    assert_eq!(arenas.capacity(), 4096);

    arenas.configure_capacity(2048).unwrap();
    assert_eq!(old.capacity(), 4096);

    let mut new = arenas.arena();
    new.allocate(1).unwrap();
    assert_eq!(new.capacity(), 2048);
}

#[test]
fn defaults() {
    let arenas = Arenas::default();
    assert_eq!(arenas.capacity(), DEFAULT_CAPACITY);
    assert_eq!(arenas.max_capacity(), MAX_CAPACITY);
    assert_eq!(arenas.count(), 0);
}

#[test]
fn lazy_creation() {
    let arenas = arenas(4096);
    let arena = arenas.arena();

    assert_eq!(arena.capacity(), 0);
    assert_eq!(arena.used(), 0);
    assert_eq!(arenas.count(), 0);
}

#[test]
fn zeroed() {
    let arenas = arenas(4096);
    let mut arena = arenas.arena();

    let dirty = arena.allocate(256).unwrap();
    unsafe { ptr::write_bytes(dirty.as_ptr() as *mut u8, 0xa5, 256) };
    arena.clear();

    let block = arena.allocate_zeroed(16, 16).unwrap();
    assert_eq!(block.len(), 256);
    assert!(unsafe { block.as_ref() }.iter().all(|b| *b == 0));

    assert!(matches!(
        arena.allocate_zeroed(usize::MAX, 2),
        Err(Error::Overflow)
    ));
    assert_eq!(arena.used(), 256);
}

#[test]
fn copy_in() {
    let arenas = arenas(4096);
    let mut arena = arenas.arena();

    let block = arena.copy_in(b"switchless").unwrap();
    assert_eq!(unsafe { block.as_ref() }, b"switchless");
    assert_eq!(arena.used(), 16);
}

#[test]
fn one_buffer_per_thread() {
    const THREADS: usize = 4;

    let arenas = arenas(4096);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let arenas = arenas.clone();
            thread::spawn(move || {
                let mut arena = arenas.arena();
                let block = arena.allocate(128).unwrap();
                let block2 = arena.allocate(128).unwrap();
                (block.as_ptr() as *mut u8 as usize, block2.as_ptr() as *mut u8 as usize)
            })
        })
        .collect();

    let mut bases: Vec<_> = handles
        .into_iter()
        .map(|handle| {
            let (first, second) = handle.join().unwrap();
            assert_eq!(second, first + 128);
            first
        })
        .collect();

    bases.sort_unstable();
    bases.dedup();
    assert_eq!(bases.len(), THREADS);
    assert_eq!(arenas.count(), THREADS);
}

#[test]
fn teardown() {
    let arenas = arenas(4096);
    let mut arena = arenas.arena();

    arena.allocate(1024).unwrap();
    assert_eq!(arenas.count(), 1);

    unsafe { arenas.teardown() };
    assert_eq!(arenas.count(), 0);

    arena.allocate(64).unwrap();
    assert_eq!(arena.used(), 64);
    assert_eq!(arenas.count(), 1);
}

#[test]
fn dropped_arena_is_reused() {
    let arenas = arenas(4096);

    let base = {
        let mut arena = arenas.arena();
        arena.allocate(64).unwrap().as_ptr() as *mut u8 as usize
    };

    for _ in 0..100 {
        let mut arena = arenas.arena();
        let block = arena.allocate(16).unwrap();
        assert_eq!(block.as_ptr() as *mut u8 as usize, base);
        assert_eq!(arena.used(), 16);
    }

    assert_eq!(arenas.count(), 1);
}

#[test]
fn dropped_arena_keeps_its_capacity() {
    let arenas = arenas(4096);
    arenas.arena().allocate(1).unwrap();
    assert_eq!(arenas.count(), 1);

    arenas.configure_capacity(2048).unwrap();
    let mut arena = arenas.arena();
    arena.allocate(1).unwrap();
    assert_eq!(arena.capacity(), 2048);
    assert_eq!(arenas.count(), 2);
    drop(arena);

    arenas.configure_capacity(4096).unwrap();
    let mut arena = arenas.arena();
    arena.allocate(1).unwrap();
    assert_eq!(arena.capacity(), 4096);
    assert_eq!(arenas.count(), 2);
}

#[test]
fn torn_down_arena_is_not_reused() {
    let arenas = arenas(4096);
    let mut arena = arenas.arena();
    arena.allocate(1).unwrap();

    unsafe { arenas.teardown() };
    drop(arena);

    let mut arena = arenas.arena();
    arena.allocate(1).unwrap();
    assert_eq!(arenas.count(), 1);
}
