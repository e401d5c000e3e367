//! Durable segmented message log for a broker partition group.
//!
//! Each store key owns two append-only streams: data records holding the
//! message bodies and fixed 28-byte index records pointing into them. Both
//! streams are split into segment files named after their start offset.

pub mod clock;
pub mod config;
pub mod error;
pub mod mmap;
pub mod record;
pub mod sample_log;
pub mod segment;
pub mod segment_list;
pub mod stats;
pub mod store;

pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use record::{BatchBuilder, EncodedBatch, IndexRecord, NewMessage, TransferMessage};
pub use segment::{Segment, SegmentKind, SegmentView};
pub use segment_list::SegmentList;
pub use stats::{
    CountItem, FaultCounters, FlushCounters, FlushEvent, FlushStatsSink, IoErrorCounters,
    MsgFileStats, MsgFileStatsSnapshot,
};
pub use store::{
    AppendOutcome, GetMessageResult, GetMessagesRequest, MsgFileStore, StoreContext,
    INTERNAL_SERVER_ERROR, RET_OK,
};
