use std::sync::Arc;

use msgstore::record::DATA_HEADER_LEN;
use msgstore::segment::{segment_path, SegmentKind};
use msgstore::{
    BatchBuilder, GetMessagesRequest, IndexRecord, IoErrorCounters, ManualClock, MsgFileStats,
    MsgFileStore, NewMessage, StoreConfig, StoreContext,
};
use tempfile::tempdir;

const RECORD_LEN: usize = 200;

fn config() -> StoreConfig {
    StoreConfig {
        max_segment_size: 1024,
        max_index_segment_size: 28 * 4,
        unflush_threshold: 1,
        max_file_valid_duration_ms: 60_000,
        ..StoreConfig::default()
    }
}

fn append_record(store: &MsgFileStore, tag: u8) {
    let body = vec![tag; RECORD_LEN - DATA_HEADER_LEN];
    let mut builder = BatchBuilder::new(store.data_max_offset(), store.index_max_offset());
    builder.push(&NewMessage {
        msg_id: i64::from(tag),
        body: &body,
        ..NewMessage::default()
    });
    let batch = builder.finish();
    let outcome = store
        .batch_append_msg(batch.msg_count, &batch.index, &batch.data)
        .expect("append");
    assert!(outcome.offsets_consistent);
}

/// Reads every index record across segments starting at `offset`.
fn read_all_index(store: &MsgFileStore, mut offset: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let chunk = store.read_index(offset, 1 << 16).expect("read index");
        if chunk.is_empty() {
            return out;
        }
        offset += chunk.len() as u64;
        out.extend_from_slice(&chunk);
    }
}

#[test]
fn data_and_index_roll_at_threshold() {
    let dir = tempdir().expect("tempdir");
    let stats = Arc::new(MsgFileStats::new());
    let ctx = StoreContext {
        clock: Arc::new(ManualClock::starting_now()),
        flush_stats: stats.clone(),
        faults: Arc::new(IoErrorCounters::new()),
    };
    let store = MsgFileStore::open_with_context(dir.path(), "orders-1", config(), 0, ctx)
        .expect("store open");

    for tag in 0..10 {
        append_record(&store, tag);
    }

    assert_eq!(store.data_max_offset(), 2000);
    assert_eq!(store.data_segment_count(), 2);
    assert!(segment_path(store.data_dir(), 1200, SegmentKind::Data).exists());
    // Index rolls every 4 records: 0, 112, 224.
    assert_eq!(store.index_segment_count(), 3);
    assert!(segment_path(store.index_dir(), 224, SegmentKind::Index).exists());
    assert_eq!(store.index_max_offset(), 280);

    let snap = stats.snapshot();
    assert_eq!(snap.data_seg_rolls, 1);
    assert_eq!(snap.index_seg_rolls, 2);

    let index = read_all_index(&store, 0);
    assert_eq!(index.len(), 280);
    let result = store.get_messages(&GetMessagesRequest {
        partition_id: 0,
        last_read_offset: 0,
        req_offset: 0,
        index: &index,
        filter_keys: None,
        stats_key_prefix: "orders",
        max_transfer_size: 1 << 20,
    });
    let ids: Vec<i64> = result.messages.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, (0..10).collect::<Vec<i64>>());
    assert_eq!(result.last_rd_data_offset, 2000);
}

#[test]
fn cleanup_removes_expired_head_but_keeps_tail() {
    let dir = tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::starting_now());
    let ctx = StoreContext {
        clock: clock.clone(),
        flush_stats: Arc::new(MsgFileStats::new()),
        faults: Arc::new(IoErrorCounters::new()),
    };
    let store = MsgFileStore::open_with_context(dir.path(), "orders-1", config(), 0, ctx)
        .expect("store open");
    for tag in 0..10 {
        append_record(&store, tag);
    }
    let index = read_all_index(&store, 0);

    assert!(!store.run_cleanup_policy(true));

    clock.advance(120_000);
    assert!(store.run_cleanup_policy(true));
    assert_eq!(store.data_segment_count(), 2);

    assert!(store.run_cleanup_policy(false));
    assert_eq!(store.data_segment_count(), 1);
    assert_eq!(store.index_segment_count(), 1);
    assert_eq!(store.data_min_offset(), 1200);
    assert_eq!(store.index_min_offset(), 224);
    assert!(!segment_path(store.data_dir(), 0, SegmentKind::Data).exists());
    assert!(segment_path(store.data_dir(), 1200, SegmentKind::Data).exists());

    // Everything left is the tail; nothing more can expire.
    clock.advance(120_000);
    assert!(!store.run_cleanup_policy(false));

    // Index records pointing below the data head are stale and skipped.
    let result = store.get_messages(&GetMessagesRequest {
        partition_id: 0,
        last_read_offset: 0,
        req_offset: 0,
        index: &index,
        filter_keys: None,
        stats_key_prefix: "orders",
        max_transfer_size: 1 << 20,
    });
    assert!(result.success);
    let ids: Vec<i64> = result.messages.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![6, 7, 8, 9]);
    assert_eq!(result.last_read_offset, 280);
}

#[test]
fn pinned_segment_survives_cleanup_until_released() {
    let dir = tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::starting_now());
    let ctx = StoreContext {
        clock: clock.clone(),
        flush_stats: Arc::new(MsgFileStats::new()),
        faults: Arc::new(IoErrorCounters::new()),
    };
    let store = MsgFileStore::open_with_context(dir.path(), "orders-1", config(), 0, ctx)
        .expect("store open");
    for tag in 0..5 {
        append_record(&store, tag);
    }

    let pinned = store.index_segment(0).expect("index segment 0");
    let path = pinned.path().to_path_buf();
    clock.advance(120_000);
    assert!(store.run_cleanup_policy(false));
    assert!(store.index_segment(0).is_none());
    assert!(path.exists());

    // The pinned segment is still readable until it is released.
    let mut raw = [0u8; 28 * 4];
    assert_eq!(pinned.read(&mut raw, 0).expect("read pinned"), raw.len());
    let first = IndexRecord::from_bytes(&raw[..28]).expect("decode index");
    assert_eq!(first.data_offset, 0);
    let fourth = IndexRecord::from_bytes(&raw[84..]).expect("decode index");
    assert_eq!(fourth.data_offset, 600);

    drop(pinned);
    assert!(!path.exists());
}
