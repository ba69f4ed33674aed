//! Many-thread stress runs of the lock-free pieces and the table.

#![cfg(not(loom))]

use std::{
    collections::HashSet,
    ptr::{self, NonNull},
    sync::Arc,
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use xlatmem::{
    os::mem::page_size, stack_node, ForeverAllocator, ForeverPool, Link, LockFreeStack,
    TableOfTables,
};

const NUM_THREADS: usize = 50;

fn init_logger() {
    _ = env_logger::builder().is_test(true).try_init();
}

struct Node {
    next: Link<Node>,
}

stack_node!(Node, next);

#[test]
fn stack_push_pop_from_many_threads() {
    const NODES_PER_THREAD: usize = 50;
    const ITERS_PER_THREAD: usize = 2000;

    init_logger();
    let mut storage: Vec<Node> = (0..NUM_THREADS * NODES_PER_THREAD)
        .map(|_| Node {
            next: Link::new(ptr::null_mut()),
        })
        .collect();
    let all: Vec<NonNull<Node>> = storage.iter_mut().map(NonNull::from).collect();
    let stack = LockFreeStack::<Node>::new();
    assert!(stack.is_empty());

    crossbeam::scope(|s| {
        for idx in 0..NUM_THREADS {
            let stack = &stack;
            let mut nodes: Vec<SendPtr> = all[idx * NODES_PER_THREAD..][..NODES_PER_THREAD]
                .iter()
                .map(|&p| SendPtr(p))
                .collect();
            s.spawn(move |_| {
                let count = idx + 1;
                for _ in 0..ITERS_PER_THREAD {
                    for node in &nodes[..count] {
                        unsafe { stack.push(node.0) };
                    }
                    assert!(!stack.is_empty());
                    for node in &mut nodes[..count] {
                        node.0 = stack.pop().expect("pushed at least this many");
                    }

                    // Re-link what we hold into one chain and push it at once
                    let mut next = ptr::null_mut();
                    for node in &nodes[..count] {
                        unsafe { node.0.as_ref() }
                            .next
                            .store(next, std::sync::atomic::Ordering::Relaxed);
                        next = node.0.as_ptr();
                    }
                    unsafe { stack.push_range(nodes[count - 1].0, nodes[0].0) };
                    assert!(!stack.is_empty());
                    for node in &mut nodes[..count] {
                        node.0 = stack.pop().expect("pushed at least this many");
                    }
                }
                // Hand our final nodes back so the main thread can count them
                for node in &nodes[..count] {
                    unsafe { stack.push(node.0) };
                }
            });
        }
    })
    .unwrap();

    // Each thread pushed back exactly as many nodes as it used, and none twice
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        assert!(seen.insert(node), "node popped twice");
    }
    let expected: usize = (1..=NUM_THREADS).sum();
    assert_eq!(seen.len(), expected);
    assert!(stack.is_empty());
}

#[derive(Clone, Copy)]
struct SendPtr(NonNull<Node>);

unsafe impl Send for SendPtr {}

#[test]
fn forever_allocations_never_overlap() {
    const ALLOCS_PER_THREAD: usize = 10_000;

    init_logger();
    let alloc = ForeverAllocator::new();
    let ranges: Vec<Vec<(usize, usize)>> = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|idx| {
                let alloc = &alloc;
                s.spawn(move |_| {
                    let size = 1 + idx % 23;
                    let align = 1 << (idx % 5);
                    (0..ALLOCS_PER_THREAD)
                        .map(|_| {
                            let p = alloc.allocate(size, align).as_ptr() as usize;
                            assert_eq!(p % align, 0);
                            assert!(p / page_size() == (p + size - 1) / page_size());
                            (p, size)
                        })
                        .collect()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
    .unwrap();

    let mut all: Vec<(usize, usize)> = ranges.into_iter().flatten().collect();
    all.sort_unstable();
    for pair in all.windows(2) {
        let ((a, a_size), (b, _)) = (pair[0], pair[1]);
        assert!(a + a_size <= b, "{a:#x}+{a_size} overlaps {b:#x}");
    }
}

#[test]
fn forever_allocations_of_random_shapes() {
    let alloc = ForeverAllocator::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut all = Vec::new();
    for _ in 0..5_000 {
        let size = rng.gen_range(1..page_size() / 4);
        let align = 1 << rng.gen_range(0..7);
        let p = alloc.allocate(size, align).as_ptr() as usize;
        assert_eq!(p % align, 0);
        all.push((p, size));
    }
    all.sort_unstable();
    for pair in all.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0);
    }
}

#[test]
fn pool_objects_have_one_owner_at_a_time() {
    const ITERS: usize = 2_000;

    let pool = ForeverPool::<[u64; 3]>::new(Arc::new(ForeverAllocator::new()));
    crossbeam::scope(|s| {
        for idx in 0..NUM_THREADS {
            let pool = &pool;
            s.spawn(move |_| {
                let tag = idx as u64;
                for i in 0..ITERS {
                    let mut held = Vec::with_capacity(4);
                    for j in 0..4 {
                        let value = [tag, i as u64, j];
                        held.push((pool.insert(value), value));
                    }
                    for (boxed, value) in &held {
                        assert_eq!(**boxed, *value, "somebody else wrote to our object");
                    }
                }
            });
        }
    })
    .unwrap();
}

#[test]
fn table_from_many_threads() {
    const PAGES: u32 = 4098;

    init_logger();
    let tot = TableOfTables::<u32, usize>::new(42);
    crossbeam::scope(|s| {
        for i in 0..64 {
            let tot = &tot;
            let base = if i % 2 == 0 { 0 } else { 65520 };
            s.spawn(move |_| {
                for page_num in 0..PAGES {
                    let page = page_num << 17;
                    assert_eq!(tot.get(page | (base + 4)), 42);
                    let slot = tot.get_pointer(page | (base + 5));
                    assert_eq!(tot.get(page | (base + 4)), 42);
                    assert_eq!(tot.put(page | (base + 5), 1729).load(), 1729);
                    assert_eq!(tot.put(page | (base + 6), 1).load(), 1);
                    assert_eq!(tot.get(page | (base + 4)), 42);
                    assert_eq!(slot.load(), 1729);
                }
            });
        }
    })
    .unwrap();

    for page_num in 0..PAGES {
        let page = page_num << 17;
        assert_eq!(tot.get(page | 5), 1729);
        assert_eq!(tot.get(page | 6), 1);
        assert_eq!(tot.get(page | 4), 42);
        assert_eq!(tot.get(page | 255), 42);

        assert_eq!(tot.get(page | 65525), 1729);
        assert_eq!(tot.get(page | 65526), 1);
        assert_eq!(tot.get(page | 65524), 42);
        assert_eq!(tot.get(page | 65535), 42);
    }
}

#[test]
fn table_publication_is_seen_with_its_contents() {
    let tot = TableOfTables::<u32, usize>::new(42);
    crossbeam::scope(|s| {
        for t in 0..8usize {
            let tot = &tot;
            s.spawn(move |_| {
                for region in 0..256u32 {
                    let key = (region << 16) | t as u32;
                    tot.put(key, t + 1);
                    // neighbours written by other threads are either theirs or
                    // the default, never anything else
                    for other in 0..8u32 {
                        let v = tot.get((region << 16) | other);
                        assert!(v == 42 || v == other as usize + 1, "torn value {v}");
                    }
                }
            });
        }
    })
    .unwrap();
    for region in 0..256u32 {
        for t in 0..8u32 {
            assert_eq!(tot.get((region << 16) | t), t as usize + 1);
        }
    }
}
