//! End-to-end tests of the store: concurrency, durability, recovery and
//! tamper evidence.

use chainkv_core::codec::{
    decode_tx, encode_record, encode_tx, verify_record, RECORD_CRC_SIZE, RECORD_HEADER_SIZE,
};
use chainkv_core::{
    check_preconditions, entries_hash, Entry, ImmuStore, Precondition, PreconditionFault,
    StoreConfig, StoreError, Tx, TxHeader, TxId, TxOptions, ZERO_HASH,
};
use chainkv_storage::{FaultSwitch, FaultyBackend, InMemoryBackend, StorageBackend};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::tempdir;

fn put(store: &ImmuStore, key: &[u8], value: &[u8]) -> TxHeader {
    let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
    tx.set(key, value).unwrap();
    tx.commit().unwrap()
}

/// Splits a log image into the payloads of its records.
fn payloads(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let len = u32::from_le_bytes(bytes[offset + 6..offset + 10].try_into().unwrap()) as usize;
        let end = offset + RECORD_HEADER_SIZE + len + RECORD_CRC_SIZE;
        out.push(verify_record(offset as u64, &bytes[offset..end]).unwrap().to_vec());
        offset = end;
    }
    out
}

#[test]
fn concurrent_commits_get_dense_ids() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 25;

    let store = ImmuStore::open_in_memory(StoreConfig::default().sync_on_commit(false)).unwrap();
    let mut ids: Vec<u64> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let store = &store;
                s.spawn(move || {
                    (0..PER_THREAD)
                        .map(|i| {
                            let key = format!("t{t}-{i}");
                            put(store, key.as_bytes(), b"v").id.as_u64()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    ids.sort_unstable();
    let expected: Vec<u64> = (1..=(THREADS * PER_THREAD) as u64).collect();
    assert_eq!(ids, expected);
    assert_eq!(store.verify_chain().unwrap(), TxId((THREADS * PER_THREAD) as u64));
}

#[test]
fn concurrent_must_not_exist_admits_one_writer() {
    let store = ImmuStore::open_in_memory(StoreConfig::default()).unwrap();
    let winners = std::thread::scope(|s| {
        let handles: Vec<_> = (0..6)
            .map(|t| {
                let store = &store;
                s.spawn(move || {
                    let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
                    tx.set(b"owner", format!("{t}")).unwrap();
                    tx.add_precondition(Some(Precondition::key_must_not_exist(b"owner".to_vec())))
                        .unwrap();
                    tx.commit().is_ok()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count()
    });
    assert_eq!(winners, 1);
    assert_eq!(store.last_committed_tx_id(), TxId(1));
}

#[test]
fn precondition_list_against_real_store() {
    let store = ImmuStore::open_in_memory(StoreConfig::default()).unwrap();
    put(&store, b"k", b"v");
    let view = store.snapshot();
    let max = store.config().max_key_len;

    let none: [Option<&Precondition>; 1] = [None];
    let err = check_preconditions(none, &view, max).unwrap_err();
    assert!(err.is_invalid_precondition());
    assert!(matches!(err, StoreError::InvalidPrecondition(PreconditionFault::Null)));

    let exists = Precondition::key_must_exist(b"k".to_vec());
    check_preconditions([Some(&exists)], &view, max).unwrap();

    store.close().unwrap();
    let kinds = [
        Precondition::key_must_exist(b"k".to_vec()),
        Precondition::key_must_not_exist(b"k".to_vec()),
        Precondition::key_not_modified_after_tx(b"k".to_vec(), TxId(1)),
    ];
    for p in &kinds {
        assert!(matches!(
            check_preconditions([Some(p)], &view, max),
            Err(StoreError::AlreadyClosed)
        ));
    }
    check_preconditions(std::iter::empty(), &view, max).unwrap();
}

#[test]
fn durability_failure_halts_the_store() {
    let switch = FaultSwitch::new();
    let backend = FaultyBackend::new(InMemoryBackend::new(), Arc::clone(&switch));
    let store = ImmuStore::open_with_backend(Box::new(backend), StoreConfig::default()).unwrap();
    put(&store, b"a", b"1");

    switch.fail_flush(true);
    let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
    tx.set(b"b", b"2").unwrap();
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, StoreError::Durability { .. }));
    assert!(err.is_fatal());
    assert!(store.is_halted());
    assert_eq!(store.last_committed_tx_id(), TxId(1));
    assert!(store.get(b"b").unwrap().is_none());

    switch.fail_flush(false);
    let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
    tx.set(b"c", b"3").unwrap();
    assert!(matches!(tx.commit(), Err(StoreError::Durability { .. })));
}

#[test]
fn reopen_recovers_history_and_chain() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("store");

    let (last_alh, header) = {
        let store = ImmuStore::open(&path, StoreConfig::default()).unwrap();
        put(&store, b"a", b"1");
        let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
        tx.delete(b"a").unwrap();
        tx.set(b"b", b"2").unwrap();
        let header = tx.commit().unwrap();
        store.close().unwrap();
        (store.last_alh(), header)
    };

    let store = ImmuStore::open(&path, StoreConfig::default()).unwrap();
    assert_eq!(store.last_committed_tx_id(), TxId(2));
    assert_eq!(store.last_alh(), last_alh);
    assert_eq!(*store.read_tx(TxId(2)).unwrap().header(), header);
    assert!(store.get(b"a").unwrap().is_none());
    assert_eq!(store.get(b"b").unwrap().unwrap().value(), b"2");
    assert_eq!(put(&store, b"c", b"3").id, TxId(3));
}

#[test]
fn second_handle_on_directory_is_locked() {
    let tmp = tempdir().unwrap();
    let _store = ImmuStore::open(tmp.path(), StoreConfig::default()).unwrap();
    assert!(matches!(
        ImmuStore::open(tmp.path(), StoreConfig::default()),
        Err(StoreError::StoreLocked)
    ));
}

#[test]
fn torn_tail_is_dropped_on_reopen() {
    let backend = Arc::new(InMemoryBackend::new());
    let store =
        ImmuStore::open_with_backend(Box::new(Arc::clone(&backend)), StoreConfig::default()).unwrap();
    put(&store, b"a", b"1");
    put(&store, b"b", b"2");
    drop(store);

    let mut image = backend.snapshot();
    image.truncate(image.len() - 5);
    let store = ImmuStore::open_with_backend(
        Box::new(InMemoryBackend::with_bytes(image)),
        StoreConfig::default(),
    )
    .unwrap();
    assert_eq!(store.last_committed_tx_id(), TxId(1));
    assert_eq!(put(&store, b"c", b"3").id, TxId(2));
}

#[test]
fn bit_flip_is_reported_as_checksum_mismatch() {
    let backend = Arc::new(InMemoryBackend::new());
    let store =
        ImmuStore::open_with_backend(Box::new(Arc::clone(&backend)), StoreConfig::default()).unwrap();
    put(&store, b"a", b"1");
    drop(store);

    let mut image = backend.snapshot();
    image[RECORD_HEADER_SIZE + 20] ^= 0xff;
    let err = ImmuStore::open_with_backend(
        Box::new(InMemoryBackend::with_bytes(image)),
        StoreConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
}

#[test]
fn rewritten_history_breaks_the_chain() {
    let backend = Arc::new(InMemoryBackend::new());
    let store =
        ImmuStore::open_with_backend(Box::new(Arc::clone(&backend)), StoreConfig::default()).unwrap();
    for i in 0..3u8 {
        put(&store, &[b'k', i], b"honest");
    }
    drop(store);

    // Rewrite tx 2 with a consistent header and fresh checksums; only the
    // link from tx 3 gives it away.
    let mut records = payloads(&backend.snapshot());
    let original = decode_tx(&records[1]).unwrap();
    let forged = Tx::build(
        original.id(),
        original.header().timestamp,
        original.header().prev_alh,
        vec![Entry::new(original.entries()[0].key().to_vec(), b"forged".to_vec())],
    );
    assert_ne!(forged.header().entries_hash, original.header().entries_hash);
    assert_eq!(forged.header().entries_hash, entries_hash(forged.entries()));
    records[1] = encode_tx(&forged);

    let image: Vec<u8> = records.iter().flat_map(|p| encode_record(p).unwrap()).collect();
    let err = ImmuStore::open_with_backend(
        Box::new(InMemoryBackend::with_bytes(image)),
        StoreConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, StoreError::BrokenChain { tx_id: TxId(3) }));
    assert!(err.is_fatal());
}

#[test]
fn verify_chain_on_empty_store() {
    let store = ImmuStore::open_in_memory(StoreConfig::default()).unwrap();
    assert_eq!(store.verify_chain().unwrap(), TxId::NONE);
    assert_eq!(store.last_alh(), ZERO_HASH);
    assert_eq!(InMemoryBackend::new().size().unwrap(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_alh_recomputes_from_its_predecessor(
        batches in prop::collection::vec(
            prop::collection::btree_map(
                prop::collection::vec(any::<u8>(), 1..8),
                (prop::collection::vec(any::<u8>(), 0..16), any::<bool>()),
                1..4,
            ),
            1..12,
        )
    ) {
        let store = ImmuStore::open_in_memory(StoreConfig::default().sync_on_commit(false)).unwrap();
        for batch in &batches {
            let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
            for (key, (value, deleted)) in batch {
                if *deleted {
                    tx.delete(key.clone()).unwrap();
                } else {
                    tx.set(key.clone(), value.clone()).unwrap();
                }
            }
            tx.commit().unwrap();
        }

        let mut prev = ZERO_HASH;
        for id in 1..=batches.len() as u64 {
            let tx = store.read_tx(TxId(id)).unwrap();
            prop_assert_eq!(tx.header().prev_alh, prev);
            prop_assert_eq!(tx.header().entries_hash, entries_hash(tx.entries()));
            prop_assert!(tx.verify().is_ok());
            prev = tx.alh();
        }
        prop_assert_eq!(prev, store.last_alh());
    }
}
