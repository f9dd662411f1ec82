//! End-to-end scenarios for dedupfs-store through its public API.

use dedupfs_store::{
    analyze_append, search::search, AppendInfo, BlockStore, FBlockId, FBlockSet, SearchTables,
    StoreConfig, WritePolicy,
};
use proptest::prelude::*;

fn small_config(dir: &tempfile::TempDir) -> StoreConfig {
    StoreConfig {
        fblock_capacity: 4096,
        block_size: 256,
        minimum_overlap: 4,
        ..StoreConfig::in_dir(dir.path())
    }
}

#[test]
fn test_search_full_and_missing() {
    let tables = SearchTables::preprocess(b"ABC").unwrap();
    assert_eq!(search(b"ABCABCABC", &tables), 0);
    assert_eq!(search(b"XYZ", &tables), 3);
}

#[test]
fn test_hello_world_append() {
    let dir = tempfile::tempdir().unwrap();
    let set = FBlockSet::open(StoreConfig::in_dir(dir.path())).unwrap();
    let fb = set.create();
    let mut g = fb.lock();
    g.put_appended_raw(&AppendInfo::new(0, 0, 5), b"HELLO").unwrap();

    let hay = g.get_raw().unwrap();
    let info = analyze_append(b"LOWORLD", 0, 2, 1, &hay);
    drop(hay);
    assert_eq!(info, AppendInfo::new(5, 3, 7));
    g.put_appended_raw(&info, b"LOWORLD").unwrap();
    assert_eq!(&g.get_raw().unwrap()[..], b"HELLOWORLD");
    drop(g);

    assert_eq!(
        std::fs::read(dir.path().join("fblock-0.dat")).unwrap(),
        b"HELLOWORLD"
    );
}

#[test]
fn test_pack_and_reopen_compressed() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(small_config(&dir)).unwrap();
    let text = b"the quick brown fox jumps over the lazy dog. ".repeat(40);
    let first = store.add_reader(&text[..]).unwrap();
    let second = store.add_reader(&text[..]).unwrap();
    assert_eq!(first, second);

    let set_stats = store.finish().unwrap();
    assert_eq!(set_stats.open, 0);
    assert_eq!(set_stats.compressed, set_stats.fblocks);

    let back: Vec<u8> = first
        .iter()
        .flat_map(|loc| store.read_block(loc).unwrap())
        .collect();
    assert_eq!(back, text);
    assert!(set_stats.bytes_on_disk < text.len() as u64);
}

#[test]
fn test_raw_policy_keeps_plain_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(StoreConfig {
        write_policy: WritePolicy::Raw,
        ..small_config(&dir)
    })
    .unwrap();
    let loc = store.add_block(b"plain bytes on disk").unwrap();
    let stats = store.finish().unwrap();
    assert_eq!(stats.compressed, 0);
    let on_disk = std::fs::read(store.set().config().fblock_path(loc.fblock)).unwrap();
    assert_eq!(on_disk, b"plain bytes on disk");
}

#[test]
fn test_lru_close_releases_oldest_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let set = FBlockSet::open(StoreConfig::in_dir(dir.path())).unwrap();
    let fbs: Vec<_> = (0..4).map(|_| set.create()).collect();
    for (i, fb) in fbs.iter().enumerate() {
        fb.lock().put_raw(format!("fblock {}", i).as_bytes()).unwrap();
    }
    drop(fbs[0].lock());

    // fblock 1 is now the least recently locked
    assert!(set.close_some(None));
    assert!(!fbs[1].try_lock().unwrap().is_open());
    assert!(fbs[0].try_lock().unwrap().is_open());
    assert_eq!(set.stats().open, 3);
}

#[test]
fn test_speculative_step_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(small_config(&dir)).unwrap();
    store.add_block(b"committed").unwrap();
    let cp = store.checkpoint();
    for i in 0..20 {
        store.add_block(&vec![i as u8; 1000]).unwrap();
    }
    assert!(store.set().len() > 1);
    store.rollback(&cp).unwrap();
    assert_eq!(store.set().len(), 1);
    assert!(!store.set().config().fblock_path(FBlockId(1)).exists());
    assert_eq!(store.stats().blocks, 1);
}

#[test]
fn test_parallel_adds_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(small_config(&dir)).unwrap();
    let text: Vec<u8> = (0..4000u32)
        .map(|i| b"abcdefghijklmnopqrstuvwxyz"[(i * i % 26) as usize])
        .collect();

    let stored: Vec<(dedupfs_store::BlockLocation, Vec<u8>)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4usize)
            .map(|t| {
                let store = &store;
                let text = &text;
                scope.spawn(move || {
                    let mut mine = Vec::new();
                    for i in 0..60usize {
                        // overlapping windows, shared between threads
                        let start = (i * 37 + t * 11) % 3000;
                        let block = text[start..start + 100 + (i % 5) * 40].to_vec();
                        let loc = store.add_block(&block).unwrap();
                        assert_eq!(store.read_block(&loc).unwrap(), block);
                        mine.push((loc, block));
                    }
                    mine
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    assert_eq!(stored.len(), 240);
    for (loc, block) in &stored {
        assert_eq!(store.read_block(loc).unwrap(), *block);
    }
    let stats = store.stats();
    assert_eq!(stats.blocks, 240);
    assert!(stats.bytes_written <= stats.bytes_in);
}

#[test]
fn test_fblock_locks_are_independent() {
    use std::sync::mpsc;
    use std::time::Duration;

    let dir = tempfile::tempdir().unwrap();
    let set = FBlockSet::open(StoreConfig::in_dir(dir.path())).unwrap();
    let a = set.create();
    let b = set.create();
    let (locked_tx, locked_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    let (a_ref, b_ref, set_ref) = (&a, &b, &set);
    std::thread::scope(|scope| {
        scope.spawn(move || {
            let mut g = a_ref.lock();
            g.put_raw(b"held").unwrap();
            locked_tx.send(()).unwrap();
            // still holding fblock 0 while the other thread works
            done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
            assert!(g.is_open());
        });
        scope.spawn(move || {
            locked_rx.recv().unwrap();
            b_ref.lock().put_raw(b"free").unwrap();
            // the only peer is locked, so reclaiming gives up instead of waiting
            assert!(!set_ref.close_some(Some(b_ref.id())));
            done_tx.send(()).unwrap();
        });
    });

    assert_eq!(&b.lock().get_raw().unwrap()[..], b"free");
    assert_eq!(&a.lock().get_raw().unwrap()[..], b"held");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_blocks_read_back(
        pool in prop::collection::vec(prop::collection::vec(0u8..4, 1..300), 1..8),
        picks in prop::collection::vec(0usize..8, 1..40),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(small_config(&dir)).unwrap();
        let mut stored = Vec::new();
        for p in picks {
            let block = &pool[p % pool.len()];
            stored.push((store.add_block(block).unwrap(), block.clone()));
        }
        for (loc, block) in &stored {
            prop_assert_eq!(store.read_block(loc).unwrap(), block.clone());
            prop_assert!(loc.offset + loc.len <= 4096);
        }
        let stats = store.stats();
        prop_assert!(stats.bytes_written <= stats.bytes_in);
        prop_assert_eq!(stats.blocks, stored.len() as u64);
    }
}
