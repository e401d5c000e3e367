//! Flush bookkeeping and the counters the store reports to its collaborators.

use std::sync::atomic::{AtomicU64, Ordering};

/// Message count and bytes served for one statistics key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountItem {
    pub msg_count: u64,
    pub msg_size: u64,
}

impl CountItem {
    pub fn append(&mut self, msg_count: u64, msg_size: u64) {
        self.msg_count += msg_count;
        self.msg_size += msg_size;
    }
}

/// Why a flush happened and how much it wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushEvent {
    pub timestamp_ms: u64,
    pub data_seg_rolled: bool,
    pub index_seg_rolled: bool,
    pub msg_count_triggered: bool,
    pub interval_triggered: bool,
    pub data_size_triggered: bool,
    pub unflushed_bytes: u64,
    pub unflushed_msgs: u64,
}

/// Receives one event per flush of a store's tail segments.
pub trait FlushStatsSink: Send + Sync {
    fn record_flush(&self, event: &FlushEvent);
}

/// Process-wide disk fault counters.
pub trait FaultCounters: Send + Sync {
    fn add_write_io_err(&self);
    fn add_read_io_err(&self);
}

/// Aggregates flush events.
#[derive(Debug, Default)]
pub struct MsgFileStats {
    flush_count: AtomicU64,
    data_seg_rolls: AtomicU64,
    index_seg_rolls: AtomicU64,
    msg_count_flushes: AtomicU64,
    interval_flushes: AtomicU64,
    data_size_flushes: AtomicU64,
    flushed_bytes: AtomicU64,
    flushed_msgs: AtomicU64,
    last_flush_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgFileStatsSnapshot {
    pub flush_count: u64,
    pub data_seg_rolls: u64,
    pub index_seg_rolls: u64,
    pub msg_count_flushes: u64,
    pub interval_flushes: u64,
    pub data_size_flushes: u64,
    pub flushed_bytes: u64,
    pub flushed_msgs: u64,
    pub last_flush_ms: u64,
}

impl MsgFileStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MsgFileStatsSnapshot {
        MsgFileStatsSnapshot {
            flush_count: self.flush_count.load(Ordering::Relaxed),
            data_seg_rolls: self.data_seg_rolls.load(Ordering::Relaxed),
            index_seg_rolls: self.index_seg_rolls.load(Ordering::Relaxed),
            msg_count_flushes: self.msg_count_flushes.load(Ordering::Relaxed),
            interval_flushes: self.interval_flushes.load(Ordering::Relaxed),
            data_size_flushes: self.data_size_flushes.load(Ordering::Relaxed),
            flushed_bytes: self.flushed_bytes.load(Ordering::Relaxed),
            flushed_msgs: self.flushed_msgs.load(Ordering::Relaxed),
            last_flush_ms: self.last_flush_ms.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64, hit: bool) {
    if hit {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl FlushStatsSink for MsgFileStats {
    fn record_flush(&self, event: &FlushEvent) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        bump(&self.data_seg_rolls, event.data_seg_rolled);
        bump(&self.index_seg_rolls, event.index_seg_rolled);
        bump(&self.msg_count_flushes, event.msg_count_triggered);
        bump(&self.interval_flushes, event.interval_triggered);
        bump(&self.data_size_flushes, event.data_size_triggered);
        self.flushed_bytes
            .fetch_add(event.unflushed_bytes, Ordering::Relaxed);
        self.flushed_msgs
            .fetch_add(event.unflushed_msgs, Ordering::Relaxed);
        self.last_flush_ms
            .fetch_max(event.timestamp_ms, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct IoErrorCounters {
    write_io_errors: AtomicU64,
    read_io_errors: AtomicU64,
}

impl IoErrorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_io_errors(&self) -> u64 {
        self.write_io_errors.load(Ordering::Relaxed)
    }

    pub fn read_io_errors(&self) -> u64 {
        self.read_io_errors.load(Ordering::Relaxed)
    }
}

impl FaultCounters for IoErrorCounters {
    fn add_write_io_err(&self) {
        self.write_io_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn add_read_io_err(&self) {
        self.read_io_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Unflushed-work counters of one store, guarded by its writer lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushCounters {
    pub unflushed_msgs: u64,
    pub unflushed_bytes: u64,
    pub last_flush_ms: u64,
    /// Zero until the first metadata sync, so the first flush syncs metadata.
    pub last_meta_flush_ms: u64,
}

impl FlushCounters {
    pub fn new(now_ms: u64) -> Self {
        Self {
            last_flush_ms: now_ms,
            ..Self::default()
        }
    }

    pub fn add(&mut self, msgs: u64, bytes: u64) {
        self.unflushed_msgs += msgs;
        self.unflushed_bytes += bytes;
    }

    pub fn reset(&mut self, now_ms: u64, meta_forced: bool) {
        self.unflushed_msgs = 0;
        self.unflushed_bytes = 0;
        self.last_flush_ms = now_ms;
        if meta_forced {
            self.last_meta_flush_ms = now_ms;
        }
    }

    pub fn since_flush_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_flush_ms)
    }

    pub fn since_meta_flush_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_meta_flush_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_aggregate_flush_causes() {
        let stats = MsgFileStats::new();
        stats.record_flush(&FlushEvent {
            timestamp_ms: 10,
            data_seg_rolled: true,
            unflushed_bytes: 100,
            unflushed_msgs: 2,
            ..FlushEvent::default()
        });
        stats.record_flush(&FlushEvent {
            timestamp_ms: 5,
            interval_triggered: true,
            unflushed_bytes: 50,
            unflushed_msgs: 1,
            ..FlushEvent::default()
        });
        let snap = stats.snapshot();
        assert_eq!(snap.flush_count, 2);
        assert_eq!(snap.data_seg_rolls, 1);
        assert_eq!(snap.interval_flushes, 1);
        assert_eq!(snap.index_seg_rolls, 0);
        assert_eq!(snap.flushed_bytes, 150);
        assert_eq!(snap.flushed_msgs, 3);
        assert_eq!(snap.last_flush_ms, 10);
    }

    #[test]
    fn counters_reset_meta_only_when_forced() {
        let mut counters = FlushCounters::new(100);
        counters.add(3, 300);
        counters.reset(200, false);
        assert_eq!(counters.unflushed_msgs, 0);
        assert_eq!(counters.unflushed_bytes, 0);
        assert_eq!(counters.last_flush_ms, 200);
        assert_eq!(counters.last_meta_flush_ms, 0);
        counters.reset(300, true);
        assert_eq!(counters.last_meta_flush_ms, 300);
        assert_eq!(counters.since_flush_ms(350), 50);
    }

    #[test]
    fn io_error_counters_count_separately() {
        let counters = IoErrorCounters::new();
        counters.add_write_io_err();
        counters.add_write_io_err();
        counters.add_read_io_err();
        assert_eq!(counters.write_io_errors(), 2);
        assert_eq!(counters.read_io_errors(), 1);
    }
}
