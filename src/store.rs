//! Message file store: one data stream and one index stream for a store key.
//!
//! # Layout
//!
//! ```text
//! {base}/{store_key}/00000000000000000000.tube         ← data segments
//! {base}/{store_key}/index/00000000000000000000.index  ← index segments
//! ```
//!
//! # Concurrency
//!
//! Appends, rollover, flush decisions and the unflushed counters all live
//! under one writer mutex. Reads never take it: they bound themselves with
//! the data min/max offsets sampled on entry and pin each segment they read
//! with a `SegmentView`, so expiry cannot delete a file mid-read.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::record::{
    peek_index_data_offset, peek_queue_logic_offset, IndexRecord, TransferMessage,
    INDEX_RECORD_LEN,
};
use crate::sample_log::SampledLogger;
use crate::segment::{discover_segments, Segment, SegmentKind, SegmentView};
use crate::segment_list::{validate_contiguity, SegmentList};
use crate::stats::{
    CountItem, FaultCounters, FlushCounters, FlushEvent, FlushStatsSink, IoErrorCounters,
    MsgFileStats,
};
use crate::{Error, Result};

pub const RET_OK: i32 = 0;
pub const INTERNAL_SERVER_ERROR: i32 = 500;

const INDEX_DIR: &str = "index";

/// Collaborators injected into a store.
#[derive(Clone)]
pub struct StoreContext {
    pub clock: Arc<dyn Clock>,
    pub flush_stats: Arc<dyn FlushStatsSink>,
    pub faults: Arc<dyn FaultCounters>,
}

impl Default for StoreContext {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            flush_stats: Arc::new(MsgFileStats::new()),
            faults: Arc::new(IoErrorCounters::new()),
        }
    }
}

/// What a batch append did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Absolute data offset the batch's data bytes were written at.
    pub data_offset: u64,
    /// Absolute index offset the batch's index records were written at.
    pub index_offset: u64,
    pub data_rolled: bool,
    pub index_rolled: bool,
    pub flushed: bool,
    /// True when the flush also synced file metadata.
    pub metadata_synced: bool,
    /// False when the offsets the encoder embedded disagree with where the
    /// bytes actually landed.
    pub offsets_consistent: bool,
}

/// A fetch against a slice of index records.
#[derive(Debug, Clone, Copy)]
pub struct GetMessagesRequest<'a> {
    pub partition_id: i32,
    /// Data offset the previous fetch stopped at.
    pub last_read_offset: u64,
    /// Index offset `index` was loaded from.
    pub req_offset: u64,
    pub index: &'a [u8],
    /// Only records whose filter key code is in the set qualify.
    pub filter_keys: Option<&'a HashSet<i32>>,
    pub stats_key_prefix: &'a str,
    pub max_transfer_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMessageResult {
    pub success: bool,
    pub ret_code: i32,
    pub err_info: String,
    pub req_offset: u64,
    /// Bytes of the index slice consumed.
    pub last_read_offset: usize,
    /// Data offset to resume reading from.
    pub last_rd_data_offset: u64,
    pub total_msg_size: usize,
    pub counts: HashMap<String, CountItem>,
    pub messages: Vec<TransferMessage>,
}

impl GetMessageResult {
    /// Index offset the next fetch should load from.
    pub fn next_index_offset(&self) -> u64 {
        self.req_offset + self.last_read_offset as u64
    }
}

enum RecordRead {
    Complete,
    /// Fewer bytes are durable than the record needs.
    NotDurable,
    /// The owning segment is gone.
    Missing,
}

pub struct MsgFileStore {
    store_key: String,
    data_dir: PathBuf,
    index_dir: PathBuf,
    config: StoreConfig,
    ctx: StoreContext,
    data_segments: SegmentList,
    index_segments: SegmentList,
    writer: Mutex<FlushCounters>,
    closed: AtomicBool,
    write_err_log: SampledLogger,
    read_err_log: SampledLogger,
}

impl MsgFileStore {
    /// Opens the store for `store_key` under `base_path`, creating empty
    /// streams starting at `offset_if_create` if none exist.
    pub fn open(
        base_path: impl AsRef<Path>,
        store_key: &str,
        config: StoreConfig,
        offset_if_create: u64,
    ) -> Result<Self> {
        Self::open_with_context(
            base_path,
            store_key,
            config,
            offset_if_create,
            StoreContext::default(),
        )
    }

    pub fn open_with_context(
        base_path: impl AsRef<Path>,
        store_key: &str,
        config: StoreConfig,
        offset_if_create: u64,
        ctx: StoreContext,
    ) -> Result<Self> {
        config.validate()?;
        let data_dir = base_path.as_ref().join(store_key);
        let index_dir = data_dir.join(INDEX_DIR);
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&index_dir)?;

        let now_ms = ctx.clock.now_ms();
        let data_segments =
            load_segments(&data_dir, SegmentKind::Data, offset_if_create, &config, now_ms)?;
        let index_segments =
            load_segments(&index_dir, SegmentKind::Index, offset_if_create, &config, now_ms)?;

        Ok(Self {
            store_key: store_key.to_string(),
            data_dir,
            index_dir,
            write_err_log: SampledLogger::new("msgstore::write", config.error_log_sample_ms),
            read_err_log: SampledLogger::new("msgstore::read", config.error_log_sample_ms),
            config,
            data_segments,
            index_segments,
            writer: Mutex::new(FlushCounters::new(ctx.clock.now_ms())),
            closed: AtomicBool::new(false),
            ctx,
        })
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, FlushCounters>> {
        self.writer
            .lock()
            .map_err(|_| Error::LockPoisoned("store writer"))
    }

    fn closed_error(&self) -> Error {
        Error::StoreClosed(self.store_key.clone())
    }

    /// Appends a batch of pre-encoded index records and data records.
    ///
    /// Data goes first, then index; each stream rolls to a new segment once
    /// its tail reaches the configured size. I/O faults are counted and
    /// logged before being returned.
    pub fn batch_append_msg(
        &self,
        msg_count: u32,
        index: &[u8],
        data: &[u8],
    ) -> Result<AppendOutcome> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        let mut counters = self.lock_writer()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        match self.append_locked(&mut counters, msg_count, index, data) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if self.closed.load(Ordering::Acquire) {
                    return Err(self.closed_error());
                }
                self.ctx.faults.add_write_io_err();
                self.write_err_log.error(
                    self.ctx.clock.now_ms(),
                    format_args!("[File Store] append failed, storeKey={}", self.store_key),
                    &err,
                );
                Err(err)
            }
        }
    }

    fn append_locked(
        &self,
        counters: &mut FlushCounters,
        msg_count: u32,
        index: &[u8],
        data: &[u8],
    ) -> Result<AppendOutcome> {
        let expected_index_offset = peek_queue_logic_offset(data);
        let expected_data_offset = peek_index_data_offset(index);

        counters.add(0, data.len() as u64);
        let data_seg = self.data_segments.last()?;
        let data_offset = data_seg.append(data)?;
        let data_rolled = if data_seg.cached_size() >= self.config.max_segment_size {
            self.roll(&self.data_segments, &data_seg)?;
            true
        } else {
            false
        };

        let index_seg = self.index_segments.last()?;
        let index_offset = index_seg.append(index)?;
        let index_rolled = if index_seg.cached_size() >= self.config.max_index_segment_size {
            self.roll(&self.index_segments, &index_seg)?;
            true
        } else {
            false
        };

        counters.add(msg_count as u64, 0);
        let now_ms = self.ctx.clock.now_ms();
        let msg_count_triggered = counters.unflushed_msgs >= self.config.unflush_threshold;
        let interval_triggered = counters.since_flush_ms(now_ms) >= self.config.unflush_interval_ms;
        let data_size_triggered = self.config.unflush_data_hold > 0
            && counters.unflushed_bytes >= self.config.unflush_data_hold;
        let flushed = msg_count_triggered
            || interval_triggered
            || data_size_triggered
            || data_rolled
            || index_rolled;

        let mut metadata_synced = false;
        if flushed {
            let force_metadata = data_rolled
                || index_rolled
                || counters.since_meta_flush_ms(now_ms) > self.config.max_meta_refresh_duration_ms;
            // A rolled segment was already force-flushed before it froze.
            if !data_rolled {
                data_seg.flush(force_metadata)?;
            }
            if !index_rolled {
                index_seg.flush(force_metadata)?;
            }
            self.ctx.flush_stats.record_flush(&FlushEvent {
                timestamp_ms: now_ms,
                data_seg_rolled: data_rolled,
                index_seg_rolled: index_rolled,
                msg_count_triggered,
                interval_triggered,
                data_size_triggered,
                unflushed_bytes: counters.unflushed_bytes,
                unflushed_msgs: counters.unflushed_msgs,
            });
            counters.reset(self.ctx.clock.now_ms(), force_metadata);
            metadata_synced = force_metadata;
        }

        let offsets_consistent = expected_index_offset
            .map_or(true, |exp| exp == index_offset as i64)
            && expected_data_offset.map_or(true, |exp| exp == data_offset as i64);
        if !offsets_consistent {
            self.ctx.faults.add_write_io_err();
            log::error!(
                "[File Store]: appendMsg data Error, storekey={},msgCnt={},indexSize={},\
                 inIndexOffset={:?},indexOffset={},dataSize={},inDataOffset={:?},dataOffset={}",
                self.store_key,
                msg_count,
                index.len(),
                expected_index_offset,
                index_offset,
                data.len(),
                expected_data_offset,
                data_offset
            );
        }

        Ok(AppendOutcome {
            data_offset,
            index_offset,
            data_rolled,
            index_rolled,
            flushed,
            metadata_synced,
            offsets_consistent,
        })
    }

    /// Freezes `tail` and starts a new tail right after its last byte.
    fn roll(&self, list: &SegmentList, tail: &Segment) -> Result<()> {
        let next_start = tail.flush(true)?;
        // The old tail stays mutable until its successor is in the list.
        let next = Segment::create(list.dir(), next_start, list.kind())?;
        let path = next.path().to_path_buf();
        list.append(next)?;
        tail.set_mutable(false);
        log::info!(
            "[File Store] Created {} segment {}",
            list.kind(),
            path.display()
        );
        Ok(())
    }

    /// Resolves a slice of index records to message payloads.
    pub fn get_messages(&self, req: &GetMessagesRequest<'_>) -> GetMessageResult {
        let data_max = self.data_max_offset() as i64;
        let data_min = self.data_min_offset() as i64;
        let max_record_len = i64::from(self.config.max_msg_store_len);

        let mut buf = vec![0u8; self.config.read_buffer_size];
        let mut view: Option<SegmentView> = None;
        let mut counts = HashMap::new();
        let mut messages = Vec::new();
        let mut total_msg_size = 0usize;
        let mut readed = 0usize;
        let mut last_rd_data: i64 = 0;
        let mut failure = None;

        for (slot, chunk) in req.index.chunks_exact(INDEX_RECORD_LEN).enumerate() {
            let next = (slot + 1) * INDEX_RECORD_LEN;
            let record = match IndexRecord::from_bytes(chunk) {
                Ok(record) => record,
                Err(_) => break,
            };
            // Stale records from since-deleted segments.
            if record.data_offset < 0
                || record.data_size <= 0
                || i64::from(record.data_size) > max_record_len
                || record.data_offset < data_min
            {
                readed = next;
                continue;
            }
            // Caught up with the writer.
            if record.data_offset >= data_max || record.data_end() > data_max {
                last_rd_data = record.data_offset;
                break;
            }
            if record.partition_id != req.partition_id
                || req
                    .filter_keys
                    .is_some_and(|keys| !keys.contains(&record.filter_key_code))
            {
                last_rd_data = record.data_end();
                readed = next;
                continue;
            }
            match self.read_record(&mut view, &record, &mut buf) {
                Ok(RecordRead::Complete) => {}
                Ok(RecordRead::NotDurable) => {
                    last_rd_data = record.data_offset;
                    break;
                }
                Ok(RecordRead::Missing) => {
                    readed = next;
                    continue;
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
            readed = next;
            last_rd_data = record.data_end();
            let size = record.data_size as usize;
            let decoded = TransferMessage::decode(&buf[..size], req.stats_key_prefix, &mut counts);
            if let Some(message) = decoded {
                messages.push(message);
                total_msg_size += size;
                if total_msg_size >= req.max_transfer_size {
                    break;
                }
            }
        }
        drop(view);

        let mut success = true;
        let mut ret_code = RET_OK;
        let mut err_info = String::from("Ok");
        if let Some(err) = failure {
            if err.is_io() {
                self.ctx.faults.add_read_io_err();
            }
            self.read_err_log.error(
                self.ctx.clock.now_ms(),
                format_args!(
                    "[File Store] read failure, storeKey={}, partitionId={}",
                    self.store_key, req.partition_id
                ),
                &err,
            );
            // Serve what was retrievable.
            if messages.is_empty() {
                success = false;
                ret_code = INTERNAL_SERVER_ERROR;
                err_info = format!("Get message from file failure : {err}");
            }
        }
        if last_rd_data <= 0 {
            last_rd_data = req.last_read_offset as i64;
        }

        GetMessageResult {
            success,
            ret_code,
            err_info,
            req_offset: req.req_offset,
            last_read_offset: readed,
            last_rd_data_offset: last_rd_data as u64,
            total_msg_size,
            counts,
            messages,
        }
    }

    /// Reads the data record behind `record` into `buf`, reusing the pinned
    /// segment while the record falls inside its committed range.
    fn read_record(
        &self,
        view: &mut Option<SegmentView>,
        record: &IndexRecord,
        buf: &mut Vec<u8>,
    ) -> Result<RecordRead> {
        let offset = record.data_offset as u64;
        let end = record.data_end() as u64;
        let reusable = view
            .as_ref()
            .is_some_and(|seg| offset >= seg.start() && end <= seg.commit_last());
        if !reusable {
            *view = None;
            let segment = match self.data_segments.record_segment(offset) {
                Some(segment) => segment,
                None => return Ok(RecordRead::Missing),
            };
            if self.closed.load(Ordering::Acquire) {
                return Err(self.closed_error());
            }
            match segment.acquire_view() {
                Some(pinned) => *view = Some(pinned),
                None => return Ok(RecordRead::Missing),
            }
        }
        let segment = match view.as_ref() {
            Some(segment) => segment,
            None => return Ok(RecordRead::Missing),
        };
        let size = record.data_size as usize;
        if buf.len() < size {
            buf.resize(size, 0);
        }
        let read = segment.read(&mut buf[..size], offset)?;
        if read < size {
            return Ok(RecordRead::NotDurable);
        }
        Ok(RecordRead::Complete)
    }

    /// Flushes both tails once the unflush interval has elapsed with
    /// messages pending. Meant to be driven by a periodic timer.
    pub fn flush_disk_file(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut counters = self.lock_writer()?;
        let now_ms = self.ctx.clock.now_ms();
        if counters.unflushed_msgs == 0
            || counters.since_flush_ms(now_ms) < self.config.unflush_interval_ms
        {
            return Ok(());
        }
        let force_metadata =
            counters.since_meta_flush_ms(now_ms) > self.config.max_meta_refresh_duration_ms;
        self.data_segments.flush_last(force_metadata)?;
        self.index_segments.flush_last(force_metadata)?;
        self.ctx.flush_stats.record_flush(&FlushEvent {
            timestamp_ms: now_ms,
            unflushed_bytes: counters.unflushed_bytes,
            unflushed_msgs: counters.unflushed_msgs,
            ..FlushEvent::default()
        });
        counters.reset(now_ms, force_metadata);
        Ok(())
    }

    /// Checks for, and unless `only_check` deletes, expired segments.
    /// Returns whether any segment was expired.
    pub fn run_cleanup_policy(&self, only_check: bool) -> bool {
        let now_ms = self.ctx.clock.now_ms();
        let max_valid = self.config.max_file_valid_duration_ms;
        let data_expired = self.data_segments.check_expired_segments(now_ms, max_valid);
        let index_expired = self.index_segments.check_expired_segments(now_ms, max_valid);
        if only_check {
            return data_expired || index_expired;
        }
        if data_expired {
            let removed = self.data_segments.del_expired_segments(now_ms, max_valid);
            log::info!(
                "[File Store] removed {removed} expired data segments, storeKey={}",
                self.store_key
            );
        }
        if index_expired {
            let removed = self.index_segments.del_expired_segments(now_ms, max_valid);
            log::info!(
                "[File Store] removed {removed} expired index segments, storeKey={}",
                self.store_key
            );
        }
        data_expired || index_expired
    }

    /// Closes both streams. Idempotent; later appends fail with `StoreClosed`.
    pub fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let _guard = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let index = self.index_segments.close();
        let data = self.data_segments.close();
        index.and(data)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Pins the index segment owning `offset`.
    pub fn index_segment(&self, offset: u64) -> Option<SegmentView> {
        self.index_segments.record_segment(offset)?.acquire_view()
    }

    /// Reads up to `max_size` committed index bytes starting at `offset`,
    /// rounded down to whole records and bounded by the owning segment.
    pub fn read_index(&self, offset: u64, max_size: usize) -> Result<Vec<u8>> {
        let segment = match self.index_segment(offset) {
            Some(segment) => segment,
            None => return Ok(Vec::new()),
        };
        let available = segment.commit_last().saturating_sub(offset) as usize;
        let len = available.min(max_size);
        let len = len - len % INDEX_RECORD_LEN;
        let mut buf = vec![0u8; len];
        let read = segment.read(&mut buf, offset)?;
        buf.truncate(read - read % INDEX_RECORD_LEN);
        Ok(buf)
    }

    pub fn store_key(&self) -> &str {
        &self.store_key
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Snapshot of the unflushed counters; informational only.
    pub fn flush_counters(&self) -> FlushCounters {
        *self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn data_segment_count(&self) -> usize {
        self.data_segments.len()
    }

    pub fn index_segment_count(&self) -> usize {
        self.index_segments.len()
    }

    pub fn data_size_in_bytes(&self) -> u64 {
        self.data_segments.size_in_bytes()
    }

    pub fn index_size_in_bytes(&self) -> u64 {
        self.index_segments.size_in_bytes()
    }

    pub fn data_max_offset(&self) -> u64 {
        self.data_segments.max_offset()
    }

    pub fn data_high_max_offset(&self) -> u64 {
        self.data_segments.commit_max_offset()
    }

    pub fn data_min_offset(&self) -> u64 {
        self.data_segments.min_offset()
    }

    pub fn index_max_offset(&self) -> u64 {
        self.index_segments.max_offset()
    }

    pub fn index_high_max_offset(&self) -> u64 {
        self.index_segments.commit_max_offset()
    }

    pub fn index_min_offset(&self) -> u64 {
        self.index_segments.min_offset()
    }
}

impl Drop for MsgFileStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!(
                "[File Store] close on drop failed, storeKey={}: {err}",
                self.store_key
            );
        }
    }
}

/// Loads one stream's segments from `dir`.
///
/// The newest file is reopened for appending unless it has not been written
/// for `max_file_no_write_duration_ms`, in which case it stays sealed and a
/// fresh tail starts after it.
fn load_segments(
    dir: &Path,
    kind: SegmentKind,
    offset_if_create: u64,
    config: &StoreConfig,
    now_ms: u64,
) -> Result<SegmentList> {
    log::info!("[File Store] begin Load {kind} segments {}", dir.display());
    let found = discover_segments(dir, kind)?;
    let mut segments = Vec::with_capacity(found.len() + 1);

    if found.is_empty() {
        let segment = Segment::create(dir, offset_if_create, kind)?;
        log::info!(
            "[File Store] Created {kind} segment {}",
            segment.path().display()
        );
        segments.push(segment);
    } else {
        for (start, path) in found {
            segments.push(Segment::open_frozen(path, start, kind)?);
        }
        validate_contiguity(kind, &segments)?;

        let last = segments.pop().ok_or(Error::EmptySegmentList)?;
        let idle_ms = now_ms.saturating_sub(last.last_modified_ms()?);
        if last.cached_size() > 0 && idle_ms >= config.max_file_no_write_duration_ms {
            let next = Segment::create(dir, last.commit_last(), kind)?;
            log::info!(
                "[File Store] Created time roll {kind} segment {}",
                next.path().display()
            );
            segments.push(last);
            segments.push(next);
        } else {
            let (start, path) = (last.start(), last.path().to_path_buf());
            last.close()?;
            drop(last);
            log::info!(
                "[File Store] Loading the last {kind} segment in mutable mode, recovering {}",
                path.display()
            );
            segments.push(Segment::recover(path, start, kind)?);
        }
    }

    let count = segments.len();
    let list = SegmentList::new(kind, dir, segments)?;
    log::info!(
        "[File Store] Loaded {kind} {count} segments from {}",
        dir.display()
    );
    Ok(list)
}
