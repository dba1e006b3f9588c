//! # Concurrent Operation Tests
//!
//! Latch-free readers racing writers, deletes racing gets, split storms
//! under concurrent inserts, and record-lock serialization of increments.
//! Each thread drives its own `TxnContext`; the tree is shared through an
//! `Arc` and every scenario ends with a full verification walk on the
//! quiesced structure.

use std::sync::{Arc, Barrier};
use std::thread;

use slicetree::{PagePool, SliceTree, TreeError, TxnContext};

fn shared_tree(pages: usize) -> Arc<SliceTree> {
    Arc::new(SliceTree::create(Arc::new(PagePool::new(pages))).unwrap())
}

#[test]
fn delete_racing_get_returns_value_or_not_found_never_garbage() {
    for round in 0..50 {
        let tree = shared_tree(16);
        let mut ctx = TxnContext::new(1);
        tree.insert_record(&mut ctx, b"k", b"v").unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let deleter = {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut ctx = TxnContext::new(2);
                barrier.wait();
                tree.delete_record(&mut ctx, b"k").unwrap();
            })
        };
        let getter = {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut ctx = TxnContext::new(3);
                let mut buf = [0u8; 8];
                barrier.wait();
                let got = tree.get_record(&mut ctx, b"k", &mut buf);
                let observed = (got, buf);
                assert!(!ctx.read_set().is_empty() || !ctx.range_reads().is_empty());
                observed
            })
        };

        deleter.join().unwrap();
        let (got, buf) = getter.join().unwrap();
        match got {
            Ok(len) => assert_eq!(&buf[..len], b"v", "round {round}"),
            Err(TreeError::KeyNotFound) => {}
            Err(other) => panic!("round {round}: unexpected error {other}"),
        }
        tree.verify().unwrap();
    }
}

#[test]
fn concurrent_disjoint_inserts_all_land() {
    let tree = shared_tree(4096);
    let threads = 4;
    let per_thread = 2000u64;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut ctx = TxnContext::new(t as u64 + 1);
                barrier.wait();
                for i in 0..per_thread {
                    let key = ((t as u64) << 32) | i;
                    tree.insert_record_normalized(&mut ctx, key, &key.to_le_bytes())
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = tree.verify().unwrap();
    assert_eq!(stats.records, threads * per_thread as usize);

    let mut ctx = TxnContext::new(99);
    let mut buf = [0u8; 8];
    for t in 0..threads {
        for i in (0..per_thread).step_by(101) {
            let key = ((t as u64) << 32) | i;
            let len = tree.get_record_normalized(&mut ctx, key, &mut buf).unwrap();
            assert_eq!(buf[..len], key.to_le_bytes());
        }
    }
}

#[test]
fn readers_race_a_split_storm_without_seeing_corruption() {
    let tree = shared_tree(4096);
    let mut ctx = TxnContext::new(1);
    // seed records the readers will hammer
    for i in 0u64..64 {
        tree.insert_record_normalized(&mut ctx, i * 1000, &(i * 7).to_le_bytes())
            .unwrap();
    }

    let barrier = Arc::new(Barrier::new(3));
    let writer = {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut ctx = TxnContext::new(2);
            barrier.wait();
            // dense inserts around the seeded keys force repeated splits
            for i in 0u64..8000 {
                let key = (i % 64) * 1000 + 1 + (i / 64);
                match tree.insert_record_normalized(&mut ctx, key, &key.to_le_bytes()) {
                    Ok(()) | Err(TreeError::KeyAlreadyExists) => {}
                    Err(other) => panic!("writer: {other}"),
                }
            }
        })
    };
    let readers: Vec<_> = (0..2)
        .map(|r| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut ctx = TxnContext::new(10 + r);
                let mut buf = [0u8; 8];
                barrier.wait();
                for pass in 0..2000 {
                    let i = (pass as u64 * 13 + r) % 64;
                    let len = tree
                        .get_record_normalized(&mut ctx, i * 1000, &mut buf)
                        .unwrap();
                    assert_eq!(
                        buf[..len],
                        (i * 7).to_le_bytes(),
                        "reader {r} pass {pass}"
                    );
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    tree.verify().unwrap();
}

#[test]
fn concurrent_increments_serialize_through_the_record_lock() {
    let tree = shared_tree(16);
    let mut ctx = TxnContext::new(1);
    tree.insert_record(&mut ctx, b"counter", &[0u8; 8]).unwrap();

    let threads = 8;
    let per_thread = 500u64;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut ctx = TxnContext::new(t as u64 + 2);
                barrier.wait();
                for _ in 0..per_thread {
                    tree.increment_record::<u64>(&mut ctx, b"counter", 1, 0)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        tree.get_record_primitive::<u64>(&mut ctx, b"counter", 0)
            .unwrap(),
        threads as u64 * per_thread
    );
}

#[test]
fn racing_inserts_of_the_same_keys_admit_exactly_one_winner_each() {
    let tree = shared_tree(1024);
    let threads = 4;
    let keys = 1000u64;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut ctx = TxnContext::new(t as u64 + 1);
                let mut wins = 0usize;
                barrier.wait();
                for i in 0..keys {
                    match tree.insert_record_normalized(&mut ctx, i, &i.to_le_bytes()) {
                        Ok(()) => wins += 1,
                        Err(TreeError::KeyAlreadyExists) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
                wins
            })
        })
        .collect();

    let total_wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total_wins, keys as usize);

    let stats = tree.verify().unwrap();
    assert_eq!(stats.records, keys as usize);
}

#[test]
fn layer_creation_races_stay_consistent() {
    // all keys share the first 8 bytes, so every insert funnels through
    // next-layer creation on the same slot
    let tree = shared_tree(512);
    let threads = 4;
    let per_thread = 200u32;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut ctx = TxnContext::new(t as u64 + 1);
                barrier.wait();
                for i in 0..per_thread {
                    let mut key = b"sameslc!".to_vec();
                    key.extend_from_slice(&(t as u32).to_be_bytes());
                    key.extend_from_slice(&i.to_be_bytes());
                    tree.insert_record(&mut ctx, &key, &i.to_le_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = tree.verify().unwrap();
    assert_eq!(stats.records, threads * per_thread as usize);
    assert!(stats.deepest_layer >= 1);

    let mut ctx = TxnContext::new(42);
    let mut buf = [0u8; 4];
    for t in 0..threads as u32 {
        for i in (0..per_thread).step_by(37) {
            let mut key = b"sameslc!".to_vec();
            key.extend_from_slice(&t.to_be_bytes());
            key.extend_from_slice(&i.to_be_bytes());
            let len = tree.get_record(&mut ctx, &key, &mut buf).unwrap();
            assert_eq!(buf[..len], i.to_le_bytes(), "thread {t} key {i}");
        }
    }
}
