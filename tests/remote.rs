use std::{
    sync::{Arc, Barrier, Mutex, mpsc},
    thread,
};

use postalloc::PostAlloc;

#[global_allocator]
static ALLOC: PostAlloc = PostAlloc;

// The assertions below read process-wide statistics.
static SERIAL: Mutex<()> = Mutex::new(());

/// Every thread allocates, and frees what its neighbour allocated.
#[test]
fn ring_of_threads() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    const THREADS: usize = 6;
    const ROUNDS: usize = 200;

    let (txs, rxs): (Vec<_>, Vec<_>) = (0..THREADS).map(|_| mpsc::channel::<Vec<Box<[u8]>>>()).unzip();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = rxs
        .into_iter()
        .enumerate()
        .map(|(i, rx)| {
            let tx = txs[(i + 1) % THREADS].clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = fastrand::Rng::with_seed(i as u64);
                barrier.wait();
                for round in 0..ROUNDS {
                    let batch = (0..rng.usize(1..64))
                        .map(|_| {
                            let len = rng.usize(1..4096);
                            vec![(round % 251) as u8; len].into_boxed_slice()
                        })
                        .collect();
                    tx.send(batch).unwrap();
                    let received = rx.recv().unwrap();
                    for block in &received {
                        let first = block[0];
                        assert!(block.iter().all(|&b| b == first));
                    }
                    drop(received);
                }
                ALLOC.flush();
            })
        })
        .collect();
    drop(txs);
    handles.into_iter().for_each(|h| h.join().unwrap());
}

/// A block freed by another thread becomes available to its owner again.
#[test]
fn frees_return_to_owner() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    const COUNT: usize = 10_000;

    let blocks: Vec<Box<[u64; 4]>> = (0..COUNT).map(|i| Box::new([i as u64; 4])).collect();
    let before = ALLOC.stat().current;
    thread::spawn(move || {
        for (i, block) in blocks.into_iter().enumerate() {
            assert_eq!(block[3], i as u64);
        }
        ALLOC.flush();
    })
    .join()
    .unwrap();

    // Draining the queue on the next allocations must not grow the backend
    // footprint by the freed amount again.
    let again: Vec<Box<[u64; 4]>> = (0..COUNT).map(|i| Box::new([i as u64; 4])).collect();
    assert!(ALLOC.stat().current <= before + COUNT * 32);
    drop(again);
}

/// Exited threads hand their heaps back for reuse.
#[test]
fn heaps_are_recycled() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let spawn = || {
        thread::spawn(|| {
            let v = vec![0u8; 1000];
            drop(v);
        })
        .join()
        .unwrap()
    };
    spawn();
    let before = ALLOC.stat().heaps;
    for _ in 0..50 {
        spawn();
    }
    assert!(ALLOC.stat().heaps - before < 10);
}
