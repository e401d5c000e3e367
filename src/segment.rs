//! A single append-only segment file.
//!
//! A segment covers the byte range `[start, start + cached_size)` of either
//! the data or the index offset space. Only the tail segment of a list is
//! mutable; it is appended to under the store's writer lock and read
//! concurrently by fetchers up to its committed size. Frozen segments are
//! read through a lazily created read-only mapping.
//!
//! ```text
//! {store}/00000000000000000000.tube        ← data segment starting at 0
//! {store}/00000000000536870912.tube        ← data segment starting at 512 MB
//! {store}/index/00000000000000000000.index ← index segment starting at 0
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::ops::Deref;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::clock::system_time_ms;
use crate::mmap::MmapFile;
use crate::record::{
    payload_crc32, DataRecordHeader, IndexRecord, DATA_HEADER_LEN, DATA_TOKEN, INDEX_RECORD_LEN,
};
use crate::{Error, Result};

pub const DATA_FILE_SUFFIX: &str = ".tube";
pub const INDEX_FILE_SUFFIX: &str = ".index";

/// Width of the zero-padded start offset in segment file names.
const OFFSET_DIGITS: usize = 20;

/// The two streams a store keeps. They differ only in naming and framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Data,
    Index,
}

impl SegmentKind {
    pub fn suffix(self) -> &'static str {
        match self {
            SegmentKind::Data => DATA_FILE_SUFFIX,
            SegmentKind::Index => INDEX_FILE_SUFFIX,
        }
    }

    /// Fixed framing size: the data record header or the whole index record.
    pub fn header_len(self) -> usize {
        match self {
            SegmentKind::Data => DATA_HEADER_LEN,
            SegmentKind::Index => INDEX_RECORD_LEN,
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Data => f.write_str("Data"),
            SegmentKind::Index => f.write_str("Index"),
        }
    }
}

/// Segment file name for a start offset (e.g. "00000000000000001024.tube").
pub fn segment_filename(start: u64, kind: SegmentKind) -> String {
    format!("{:0width$}{}", start, kind.suffix(), width = OFFSET_DIGITS)
}

pub fn segment_path(dir: &Path, start: u64, kind: SegmentKind) -> PathBuf {
    dir.join(segment_filename(start, kind))
}

/// Parses the start offset out of a segment file name.
///
/// Returns `None` for names without the kind's suffix, `Err` for names with
/// the suffix but a non-numeric base.
pub fn parse_segment_filename(name: &str, kind: SegmentKind) -> Result<Option<u64>> {
    let base = match name.strip_suffix(kind.suffix()) {
        Some(base) => base,
        None => return Ok(None),
    };
    if base.is_empty() || !base.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidFileName(name.to_string()));
    }
    base.parse::<u64>()
        .map(Some)
        .map_err(|_| Error::InvalidFileName(name.to_string()))
}

/// Lists `(start, path)` of every segment file of `kind` in `dir`, sorted by
/// start offset.
pub fn discover_segments(dir: &Path, kind: SegmentKind) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if let Some(start) = parse_segment_filename(name, kind)? {
            segments.push((start, path));
        }
    }
    segments.sort_unstable_by_key(|(start, _)| *start);
    Ok(segments)
}

pub struct Segment {
    kind: SegmentKind,
    start: u64,
    path: PathBuf,
    file: File,
    /// Bytes appended, flushed or not.
    cached_size: AtomicU64,
    /// Bytes made durable by the last flush; never exceeds `cached_size`.
    commit_size: AtomicU64,
    mutable: AtomicBool,
    closed: AtomicBool,
    delete_pending: AtomicBool,
    removed: AtomicBool,
    view_refs: AtomicUsize,
    map: OnceLock<MmapFile>,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("kind", &self.kind)
            .field("start", &self.start)
            .field("path", &self.path)
            .field("cached_size", &self.cached_size())
            .field("commit_size", &self.commit_size())
            .field("mutable", &self.is_mutable())
            .finish()
    }
}

impl Segment {
    fn from_parts(
        kind: SegmentKind,
        start: u64,
        path: PathBuf,
        file: File,
        size: u64,
        mutable: bool,
    ) -> Self {
        Self {
            kind,
            start,
            path,
            file,
            cached_size: AtomicU64::new(size),
            commit_size: AtomicU64::new(size),
            mutable: AtomicBool::new(mutable),
            closed: AtomicBool::new(false),
            delete_pending: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            view_refs: AtomicUsize::new(0),
            map: OnceLock::new(),
        }
    }

    /// Creates a brand-new, empty, mutable segment starting at `start`.
    ///
    /// If a file of that name already exists it is recovered instead, so a
    /// crash between creating a file and writing to it is harmless.
    pub fn create(dir: &Path, start: u64, kind: SegmentKind) -> Result<Self> {
        let path = segment_path(dir, start, kind);
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => Ok(Self::from_parts(kind, start, path, file, 0, true)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Self::recover(path, start, kind)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Opens an existing file as a frozen segment.
    pub fn open_frozen(path: PathBuf, start: u64, kind: SegmentKind) -> Result<Self> {
        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(Error::UnreadableSegment(path))
            }
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata()?.len();
        Ok(Self::from_parts(kind, start, path, file, size, false))
    }

    /// Reopens an existing file as the mutable tail, truncating any partial
    /// or corrupt records left by an interrupted write.
    pub fn recover(path: PathBuf, start: u64, kind: SegmentKind) -> Result<Self> {
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(Error::UnreadableSegment(path))
            }
            Err(err) => return Err(err.into()),
        };
        let file_len = file.metadata()?.len();
        let valid_len = match kind {
            SegmentKind::Data => scan_data_records(&file, file_len)?,
            SegmentKind::Index => scan_index_records(&file, file_len)?,
        };
        if valid_len < file_len {
            log::warn!(
                "[File Store] truncated {} segment {} from {} to {} bytes during recovery",
                kind,
                path.display(),
                file_len,
                valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(Self::from_parts(kind, start, path, file, valid_len, true))
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cached_size(&self) -> u64 {
        self.cached_size.load(Ordering::Acquire)
    }

    pub fn commit_size(&self) -> u64 {
        self.commit_size.load(Ordering::Acquire)
    }

    /// Offset one past the last appended byte.
    pub fn cached_last(&self) -> u64 {
        self.start + self.cached_size()
    }

    /// Offset one past the last durable byte.
    pub fn commit_last(&self) -> u64 {
        self.start + self.commit_size()
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True if `offset` lies inside the appended range of this segment.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.cached_last()
    }

    /// Appends `buf` at the tail and returns the absolute offset it landed at.
    ///
    /// Callers serialize appends; the cached size only advances once the
    /// whole buffer is written.
    pub fn append(&self, buf: &[u8]) -> Result<u64> {
        if self.is_closed() {
            return Err(Error::SegmentClosed);
        }
        if !self.is_mutable() {
            return Err(Error::SegmentImmutable);
        }
        let position = self.cached_size();
        self.file.write_all_at(buf, position)?;
        self.cached_size
            .store(position + buf.len() as u64, Ordering::Release);
        Ok(self.start + position)
    }

    /// Makes all appended bytes durable and returns the new commit offset.
    ///
    /// `force_metadata` selects `fsync` over `fdatasync`. With nothing new to
    /// write and no metadata requested this is a no-op.
    pub fn flush(&self, force_metadata: bool) -> Result<u64> {
        if self.is_closed() {
            return Err(Error::SegmentClosed);
        }
        if !self.is_mutable() {
            return Ok(self.commit_last());
        }
        let cached = self.cached_size();
        if cached > self.commit_size() || force_metadata {
            if force_metadata {
                self.file.sync_all()?;
            } else {
                self.file.sync_data()?;
            }
            self.commit_size.store(cached, Ordering::Release);
        }
        Ok(self.commit_last())
    }

    /// Reads into `dest` starting at absolute `offset`, clipped to the
    /// committed size. Returns the number of bytes read; a short count means
    /// the remainder is not durable yet.
    pub fn read(&self, dest: &mut [u8], offset: u64) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::SegmentClosed);
        }
        let position = offset
            .checked_sub(self.start)
            .ok_or(Error::Corrupt("read below segment start"))?;
        let commit = self.commit_size();
        if position >= commit {
            return Ok(0);
        }
        let len = dest.len().min((commit - position) as usize);
        if let Some(map) = self.frozen_map()? {
            dest[..len].copy_from_slice(map.range(position as usize, len)?);
        } else {
            self.file.read_exact_at(&mut dest[..len], position)?;
        }
        Ok(len)
    }

    fn frozen_map(&self) -> Result<Option<&MmapFile>> {
        if self.is_mutable() {
            return Ok(None);
        }
        if let Some(map) = self.map.get() {
            return Ok(Some(map));
        }
        let len = self.commit_size() as usize;
        if len == 0 {
            return Ok(None);
        }
        let map = MmapFile::map(&self.file, len)?;
        // A concurrent reader may have installed its own mapping first.
        let _ = self.map.set(map);
        Ok(self.map.get())
    }

    /// Freezes or unfreezes the segment. Freezing happens exactly once, when
    /// a new tail supersedes this segment.
    pub fn set_mutable(&self, mutable: bool) {
        self.mutable.store(mutable, Ordering::Release);
    }

    /// Pins the segment for a read. Returns `None` once the segment is closed
    /// or scheduled for deletion.
    pub fn acquire_view(self: &Arc<Self>) -> Option<SegmentView> {
        self.view_refs.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() || self.delete_pending.load(Ordering::SeqCst) {
            self.release_view();
            return None;
        }
        Some(SegmentView {
            segment: Arc::clone(self),
        })
    }

    pub fn view_refs(&self) -> usize {
        self.view_refs.load(Ordering::SeqCst)
    }

    fn release_view(&self) {
        let prev = self.view_refs.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.delete_pending.load(Ordering::SeqCst) {
            if let Err(err) = self.finish_delete() {
                log::error!(
                    "[File Store] failed to delete segment {}: {err}",
                    self.path.display()
                );
            }
        }
    }

    /// Closes the segment and unlinks its file. Runs at most once.
    fn finish_delete(&self) -> Result<()> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.close()?;
        std::fs::remove_file(&self.path)?;
        log::info!("[File Store] deleted segment {}", self.path.display());
        Ok(())
    }

    /// Modification time of the backing file in milliseconds.
    pub fn last_modified_ms(&self) -> Result<u64> {
        let modified = self.file.metadata()?.modified()?;
        Ok(system_time_ms(modified))
    }

    pub fn is_expired(&self, now_ms: u64, max_valid_duration_ms: u64) -> Result<bool> {
        let modified = self.last_modified_ms()?;
        Ok(now_ms.saturating_sub(modified) >= max_valid_duration_ms)
    }

    /// Durably flushes a mutable segment and rejects further I/O. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let synced = if self.is_mutable() && self.cached_size() > self.commit_size() {
            self.flush(true).map(|_| ())
        } else {
            Ok(())
        };
        self.closed.store(true, Ordering::Release);
        synced
    }

    /// Schedules the segment for deletion and refuses new views. While views
    /// are outstanding the segment stays open and readable; the last view to
    /// be released closes it and removes the file. Returns whether the file
    /// was removed immediately.
    pub fn delete_file(&self) -> Result<bool> {
        self.delete_pending.store(true, Ordering::SeqCst);
        if self.view_refs.load(Ordering::SeqCst) == 0 {
            self.finish_delete()?;
            return Ok(true);
        }
        Ok(false)
    }
}

impl AsRef<Segment> for Segment {
    fn as_ref(&self) -> &Segment {
        self
    }
}

/// A pinned reference on a segment; pins are released on drop.
#[derive(Debug)]
pub struct SegmentView {
    segment: Arc<Segment>,
}

impl SegmentView {
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl Deref for SegmentView {
    type Target = Segment;

    fn deref(&self) -> &Segment {
        &self.segment
    }
}

impl Drop for SegmentView {
    fn drop(&mut self) {
        self.segment.release_view();
    }
}

/// Length of the prefix made of whole, well-formed data records.
fn scan_data_records(file: &File, file_len: u64) -> Result<u64> {
    let mut offset = 0u64;
    let mut header = [0u8; DATA_HEADER_LEN];
    let mut payload = Vec::new();
    while offset + DATA_HEADER_LEN as u64 <= file_len {
        file.read_exact_at(&mut header, offset)?;
        let parsed = DataRecordHeader::from_bytes(&header)?;
        if parsed.token != DATA_TOKEN {
            break;
        }
        let (payload_len, record_len) = match (parsed.payload_len(), parsed.record_len()) {
            (Some(payload_len), Some(record_len)) => (payload_len, record_len as u64),
            _ => break,
        };
        if offset + record_len > file_len {
            break;
        }
        payload.resize(payload_len, 0);
        file.read_exact_at(&mut payload, offset + DATA_HEADER_LEN as u64)?;
        if payload_crc32(&payload) != parsed.checksum {
            break;
        }
        offset += record_len;
    }
    Ok(offset)
}

/// Length of the prefix made of whole, plausible index records.
fn scan_index_records(file: &File, file_len: u64) -> Result<u64> {
    let whole = file_len - file_len % INDEX_RECORD_LEN as u64;
    let mut offset = 0u64;
    let mut buf = [0u8; INDEX_RECORD_LEN];
    while offset < whole {
        file.read_exact_at(&mut buf, offset)?;
        let record = IndexRecord::from_bytes(&buf)?;
        if record.data_offset < 0 || record.data_size <= 0 {
            break;
        }
        offset += INDEX_RECORD_LEN as u64;
    }
    Ok(offset)
}
