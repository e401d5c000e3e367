use std::path::PathBuf;

use crate::segment::SegmentKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("{kind} segments don't validate: {prev} -> {next}")]
    NonContiguous {
        kind: SegmentKind,
        prev: PathBuf,
        next: PathBuf,
    },
    #[error("could not read segment file {0}")]
    UnreadableSegment(PathBuf),
    #[error("invalid segment file name: {0}")]
    InvalidFileName(String),
    #[error("segment is immutable")]
    SegmentImmutable,
    #[error("segment closed")]
    SegmentClosed,
    #[error("segment list is empty")]
    EmptySegmentList,
    #[error("closed message store for store key {0}")]
    StoreClosed(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl Error {
    /// True for faults raised by the operating system rather than by the
    /// store's own bookkeeping.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
