//! Ordered, offset-contiguous list of segments for one stream.
//!
//! The list is append-only at the tail and trimmed only at the head by
//! expiry. Lookups take a read lock and hand out `Arc<Segment>` clones, so a
//! reader keeps working on a segment even after the cleanup pass has removed
//! it from the list.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::segment::{Segment, SegmentKind};
use crate::{Error, Result};

/// Checks that every adjacent pair satisfies `a.start + a.cached_size == b.start`.
pub fn validate_contiguity<S: AsRef<Segment>>(kind: SegmentKind, segments: &[S]) -> Result<()> {
    for pair in segments.windows(2) {
        let (curr, next) = (pair[0].as_ref(), pair[1].as_ref());
        if curr.cached_last() != next.start() {
            return Err(Error::NonContiguous {
                kind,
                prev: curr.path().to_path_buf(),
                next: next.path().to_path_buf(),
            });
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct SegmentList {
    kind: SegmentKind,
    dir: PathBuf,
    segments: RwLock<Vec<Arc<Segment>>>,
}

impl SegmentList {
    /// Builds a list from segments sorted by start offset.
    pub fn new(kind: SegmentKind, dir: impl Into<PathBuf>, segments: Vec<Segment>) -> Result<Self> {
        if segments.is_empty() {
            return Err(Error::EmptySegmentList);
        }
        validate_contiguity(kind, &segments)?;
        Ok(Self {
            kind,
            dir: dir.into(),
            segments: RwLock::new(segments.into_iter().map(Arc::new).collect()),
        })
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // The guarded Vec is only pushed to or drained from the head, neither of
    // which can leave it half-updated, so a poisoned lock is still usable.
    fn read_segments(&self) -> RwLockReadGuard<'_, Vec<Arc<Segment>>> {
        self.segments.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_segments(&self) -> RwLockWriteGuard<'_, Vec<Arc<Segment>>> {
        self.segments.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read_segments().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_segments().is_empty()
    }

    /// Clones of the current segments, head first.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.read_segments().clone()
    }

    /// The mutable tail.
    pub fn last(&self) -> Result<Arc<Segment>> {
        self.read_segments()
            .last()
            .cloned()
            .ok_or(Error::EmptySegmentList)
    }

    /// Appends a new tail. The caller freezes the previous tail first.
    pub fn append(&self, segment: Segment) -> Result<Arc<Segment>> {
        let mut segments = self.write_segments();
        if let Some(last) = segments.last() {
            if last.cached_last() != segment.start() {
                return Err(Error::NonContiguous {
                    kind: self.kind,
                    prev: last.path().to_path_buf(),
                    next: segment.path().to_path_buf(),
                });
            }
        }
        let segment = Arc::new(segment);
        segments.push(Arc::clone(&segment));
        Ok(segment)
    }

    /// Finds the segment owning `offset`.
    ///
    /// Offsets in the tail beyond its committed size still resolve to the
    /// tail so in-flight reads can detect the short read themselves. Returns
    /// `None` below the head or at/after the last appended byte.
    pub fn record_segment(&self, offset: u64) -> Option<Arc<Segment>> {
        let segments = self.read_segments();
        let first = segments.first()?;
        let last = segments.last()?;
        if offset < first.start() || offset >= last.cached_last() {
            return None;
        }
        let idx = segments.partition_point(|seg| seg.start() <= offset);
        segments.get(idx.checked_sub(1)?).cloned()
    }

    /// Number of head segments that have expired. The tail never counts.
    fn expired_prefix(segments: &[Arc<Segment>], now_ms: u64, max_valid_duration_ms: u64) -> usize {
        let candidates = segments.len().saturating_sub(1);
        let mut expired = 0;
        for segment in &segments[..candidates] {
            match segment.is_expired(now_ms, max_valid_duration_ms) {
                Ok(true) => expired += 1,
                Ok(false) => break,
                Err(err) => {
                    log::warn!(
                        "[File Store] could not stat segment {}: {err}",
                        segment.path().display()
                    );
                    break;
                }
            }
        }
        expired
    }

    /// Cheap pre-check: does the head of the list hold expired segments?
    pub fn check_expired_segments(&self, now_ms: u64, max_valid_duration_ms: u64) -> bool {
        let segments = self.read_segments();
        Self::expired_prefix(&segments, now_ms, max_valid_duration_ms) > 0
    }

    /// Removes expired head segments and deletes their files, oldest first.
    /// Returns how many segments were removed from the list.
    pub fn del_expired_segments(&self, now_ms: u64, max_valid_duration_ms: u64) -> usize {
        let expired: Vec<Arc<Segment>> = {
            let mut segments = self.write_segments();
            let count = Self::expired_prefix(&segments, now_ms, max_valid_duration_ms);
            segments.drain(..count).collect()
        };
        for segment in &expired {
            match segment.delete_file() {
                Ok(true) => {}
                Ok(false) => log::info!(
                    "[File Store] deferred delete of segment {} until readers release it",
                    segment.path().display()
                ),
                Err(err) => log::error!(
                    "[File Store] failed to delete expired segment {}: {err}",
                    segment.path().display()
                ),
            }
        }
        expired.len()
    }

    pub fn flush_last(&self, force_metadata: bool) -> Result<u64> {
        self.last()?.flush(force_metadata)
    }

    /// Offset one past the last appended byte of the tail.
    pub fn max_offset(&self) -> u64 {
        self.read_segments()
            .last()
            .map_or(0, |seg| seg.cached_last())
    }

    /// Offset one past the last durable byte of the tail.
    pub fn commit_max_offset(&self) -> u64 {
        self.read_segments()
            .last()
            .map_or(0, |seg| seg.commit_last())
    }

    pub fn min_offset(&self) -> u64 {
        self.read_segments().first().map_or(0, |seg| seg.start())
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.read_segments().iter().map(|seg| seg.cached_size()).sum()
    }

    /// Closes every segment; the first failure is returned after all were
    /// attempted.
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        for segment in self.read_segments().iter() {
            if let Err(err) = segment.close() {
                log::error!(
                    "[File Store] failed to close segment {}: {err}",
                    segment.path().display()
                );
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
