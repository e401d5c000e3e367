use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use msgstore::segment::{segment_path, SegmentKind};
use msgstore::{
    BatchBuilder, Error, GetMessagesRequest, IoErrorCounters, ManualClock, MsgFileStats,
    MsgFileStore, NewMessage, StoreConfig, StoreContext,
};
use tempfile::tempdir;

fn config() -> StoreConfig {
    StoreConfig {
        unflush_threshold: 1,
        max_file_no_write_duration_ms: 60_000,
        ..StoreConfig::default()
    }
}

fn context(clock: Arc<ManualClock>) -> StoreContext {
    let _ = env_logger::builder().is_test(true).try_init();
    StoreContext {
        clock,
        flush_stats: Arc::new(MsgFileStats::new()),
        faults: Arc::new(IoErrorCounters::new()),
    }
}

fn open_store(base: &Path, clock: &Arc<ManualClock>) -> MsgFileStore {
    MsgFileStore::open_with_context(base, "orders-2", config(), 0, context(clock.clone()))
        .expect("store open")
}

fn append(store: &MsgFileStore, bodies: &[&[u8]]) {
    let mut builder = BatchBuilder::new(store.data_max_offset(), store.index_max_offset());
    for body in bodies {
        builder.push(&NewMessage {
            partition_id: 1,
            body,
            ..NewMessage::default()
        });
    }
    let batch = builder.finish();
    store
        .batch_append_msg(batch.msg_count, &batch.index, &batch.data)
        .expect("append");
}

fn fetch_all(store: &MsgFileStore) -> Vec<Vec<u8>> {
    let index = store
        .read_index(store.index_min_offset(), 1 << 16)
        .expect("read index");
    let result = store.get_messages(&GetMessagesRequest {
        partition_id: 1,
        last_read_offset: store.data_min_offset(),
        req_offset: store.index_min_offset(),
        index: &index,
        filter_keys: None,
        stats_key_prefix: "orders",
        max_transfer_size: 1 << 20,
    });
    assert!(result.success);
    result.messages.into_iter().map(|m| m.payload).collect()
}

#[test]
fn reopen_resumes_appending_on_last_segment() {
    let dir = tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::starting_now());
    {
        let store = open_store(dir.path(), &clock);
        append(&store, &[b"one", b"two"]);
    }

    let store = open_store(dir.path(), &clock);
    assert_eq!(store.data_segment_count(), 1);
    assert_eq!(store.index_max_offset(), 56);
    append(&store, &[b"three"]);
    assert_eq!(store.data_segment_count(), 1);
    assert_eq!(
        fetch_all(&store),
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
    );
}

#[test]
fn fresh_store_starts_at_requested_offset() {
    let dir = tempdir().expect("tempdir");
    let store = MsgFileStore::open(dir.path(), "orders-2", config(), 4096).expect("store open");
    assert_eq!(store.data_min_offset(), 4096);
    assert_eq!(store.index_min_offset(), 4096);
    assert!(segment_path(store.data_dir(), 4096, SegmentKind::Data).exists());
    assert!(segment_path(store.index_dir(), 4096, SegmentKind::Index).exists());
}

#[test]
fn idle_tail_is_sealed_on_reopen() {
    let dir = tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::starting_now());
    let (data_end, index_end) = {
        let store = open_store(dir.path(), &clock);
        append(&store, &[b"old"]);
        (store.data_max_offset(), store.index_max_offset())
    };

    clock.advance(120_000);
    let store = open_store(dir.path(), &clock);
    assert_eq!(store.data_segment_count(), 2);
    assert_eq!(store.index_segment_count(), 2);
    assert!(segment_path(store.data_dir(), data_end, SegmentKind::Data).exists());
    assert!(segment_path(store.index_dir(), index_end, SegmentKind::Index).exists());

    append(&store, &[b"new"]);
    assert_eq!(store.data_segment_count(), 2);
    assert_eq!(fetch_all(&store), vec![b"old".to_vec()]);
}

#[test]
fn torn_tail_write_is_truncated_on_reopen() {
    let dir = tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::starting_now());
    let (data_end, index_end) = {
        let store = open_store(dir.path(), &clock);
        append(&store, &[b"kept"]);
        (store.data_max_offset(), store.index_max_offset())
    };

    let store_dir = dir.path().join("orders-2");
    let data_path = segment_path(&store_dir, 0, SegmentKind::Data);
    let index_path = segment_path(&store_dir.join("index"), 0, SegmentKind::Index);
    let mut data = OpenOptions::new().append(true).open(&data_path).expect("open data");
    data.write_all(&[0xCA; 30]).expect("torn data");
    let mut index = OpenOptions::new().append(true).open(&index_path).expect("open index");
    index.write_all(&[0x01; 10]).expect("torn index");
    drop((data, index));

    let store = open_store(dir.path(), &clock);
    assert_eq!(store.data_max_offset(), data_end);
    assert_eq!(store.index_max_offset(), index_end);
    append(&store, &[b"after"]);
    assert_eq!(fetch_all(&store), vec![b"kept".to_vec(), b"after".to_vec()]);
}

#[test]
fn gap_between_segments_fails_to_load() {
    let dir = tempdir().expect("tempdir");
    let store_dir = dir.path().join("orders-2");
    std::fs::create_dir_all(&store_dir).expect("mkdir");
    std::fs::write(segment_path(&store_dir, 0, SegmentKind::Data), [0u8; 10]).expect("seg 0");
    std::fs::write(segment_path(&store_dir, 20, SegmentKind::Data), [0u8; 10]).expect("seg 20");

    match MsgFileStore::open(dir.path(), "orders-2", config(), 0) {
        Err(Error::NonContiguous { kind, .. }) => assert_eq!(kind, SegmentKind::Data),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("store with a gap opened"),
    }
}
