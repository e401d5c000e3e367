//! Binary framing for index and data records.
//!
//! Both record kinds are big-endian. An index record is a fixed 28-byte
//! descriptor locating one data record; a data record is a 52-byte header
//! followed by the message payload.
//!
//! ```text
//! index: | partition i32 | data_offset i64 | data_size i32 | key_code i32 | recv_ms i64 |
//! data:  | len i32 | token i32 | crc i32 | queue_id i32 | logic_off i64 | recv_ms i64 |
//!        | report_addr i32 | key_code i32 | msg_id i64 | flag i32 | payload ... |
//! ```

use std::collections::HashMap;

use crate::stats::CountItem;
use crate::{Error, Result};

pub const INDEX_RECORD_LEN: usize = 28;

pub const INDEX_POS_PARTITION_ID: usize = 0;
pub const INDEX_POS_DATA_OFFSET: usize = 4;
pub const INDEX_POS_DATA_SIZE: usize = 12;
pub const INDEX_POS_KEY_CODE: usize = 16;
pub const INDEX_POS_RECV_TIME: usize = 20;

pub const DATA_HEADER_LEN: usize = 52;
/// Bytes covered by the length field that precede the payload.
pub const DATA_PREFIX_LEN: usize = 48;
/// Marker identifying the start of a data record.
pub const DATA_TOKEN: i32 = 0xCAFF;

pub const DATA_POS_LENGTH: usize = 0;
pub const DATA_POS_TOKEN: usize = 4;
pub const DATA_POS_CHECKSUM: usize = 8;
pub const DATA_POS_QUEUE_ID: usize = 12;
pub const DATA_POS_QUEUE_LOGIC_OFFSET: usize = 16;
pub const DATA_POS_RECV_TIME: usize = 24;
pub const DATA_POS_REPORT_ADDR: usize = 32;
pub const DATA_POS_KEY_CODE: usize = 36;
pub const DATA_POS_MSG_ID: usize = 40;
pub const DATA_POS_MSG_FLAG: usize = 48;

/// Payload begins with `attr_len: i32` and an attribute string.
pub const FLAG_HAS_ATTRIBUTES: i32 = 0x1;
pub const MSG_TYPE_ATTR: &str = "$msgType$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub partition_id: i32,
    pub data_offset: i64,
    pub data_size: i32,
    pub filter_key_code: i32,
    pub receive_time_ms: i64,
}

impl IndexRecord {
    pub fn to_bytes(&self) -> [u8; INDEX_RECORD_LEN] {
        let mut buf = [0u8; INDEX_RECORD_LEN];
        put_i32(&mut buf, INDEX_POS_PARTITION_ID, self.partition_id);
        put_i64(&mut buf, INDEX_POS_DATA_OFFSET, self.data_offset);
        put_i32(&mut buf, INDEX_POS_DATA_SIZE, self.data_size);
        put_i32(&mut buf, INDEX_POS_KEY_CODE, self.filter_key_code);
        put_i64(&mut buf, INDEX_POS_RECV_TIME, self.receive_time_ms);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INDEX_RECORD_LEN {
            return Err(Error::Corrupt("index record truncated"));
        }
        Ok(Self {
            partition_id: get_i32(bytes, INDEX_POS_PARTITION_ID),
            data_offset: get_i64(bytes, INDEX_POS_DATA_OFFSET),
            data_size: get_i32(bytes, INDEX_POS_DATA_SIZE),
            filter_key_code: get_i32(bytes, INDEX_POS_KEY_CODE),
            receive_time_ms: get_i64(bytes, INDEX_POS_RECV_TIME),
        })
    }

    /// End of the referenced data record in the data offset space.
    pub fn data_end(&self) -> i64 {
        self.data_offset.saturating_add(self.data_size as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRecordHeader {
    /// Bytes following the length field: `DATA_PREFIX_LEN + payload_len`.
    pub length: i32,
    pub token: i32,
    pub checksum: i32,
    pub queue_id: i32,
    /// Index offset of the index record describing this data record.
    pub queue_logic_offset: i64,
    pub receive_time_ms: i64,
    pub report_addr: i32,
    pub filter_key_code: i32,
    pub msg_id: i64,
    pub msg_flag: i32,
}

impl DataRecordHeader {
    pub fn to_bytes(&self) -> [u8; DATA_HEADER_LEN] {
        let mut buf = [0u8; DATA_HEADER_LEN];
        put_i32(&mut buf, DATA_POS_LENGTH, self.length);
        put_i32(&mut buf, DATA_POS_TOKEN, self.token);
        put_i32(&mut buf, DATA_POS_CHECKSUM, self.checksum);
        put_i32(&mut buf, DATA_POS_QUEUE_ID, self.queue_id);
        put_i64(&mut buf, DATA_POS_QUEUE_LOGIC_OFFSET, self.queue_logic_offset);
        put_i64(&mut buf, DATA_POS_RECV_TIME, self.receive_time_ms);
        put_i32(&mut buf, DATA_POS_REPORT_ADDR, self.report_addr);
        put_i32(&mut buf, DATA_POS_KEY_CODE, self.filter_key_code);
        put_i64(&mut buf, DATA_POS_MSG_ID, self.msg_id);
        put_i32(&mut buf, DATA_POS_MSG_FLAG, self.msg_flag);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DATA_HEADER_LEN {
            return Err(Error::Corrupt("data record header truncated"));
        }
        Ok(Self {
            length: get_i32(bytes, DATA_POS_LENGTH),
            token: get_i32(bytes, DATA_POS_TOKEN),
            checksum: get_i32(bytes, DATA_POS_CHECKSUM),
            queue_id: get_i32(bytes, DATA_POS_QUEUE_ID),
            queue_logic_offset: get_i64(bytes, DATA_POS_QUEUE_LOGIC_OFFSET),
            receive_time_ms: get_i64(bytes, DATA_POS_RECV_TIME),
            report_addr: get_i32(bytes, DATA_POS_REPORT_ADDR),
            filter_key_code: get_i32(bytes, DATA_POS_KEY_CODE),
            msg_id: get_i64(bytes, DATA_POS_MSG_ID),
            msg_flag: get_i32(bytes, DATA_POS_MSG_FLAG),
        })
    }

    /// Payload length implied by the length field, if it is plausible.
    pub fn payload_len(&self) -> Option<usize> {
        let length = usize::try_from(self.length).ok()?;
        length.checked_sub(DATA_PREFIX_LEN)
    }

    /// Total on-disk size of the record, header included.
    pub fn record_len(&self) -> Option<usize> {
        self.payload_len().map(|len| DATA_HEADER_LEN + len)
    }
}

/// Expected data offset embedded by the encoder in the first index record.
pub fn peek_index_data_offset(index: &[u8]) -> Option<i64> {
    (index.len() >= INDEX_RECORD_LEN).then(|| get_i64(index, INDEX_POS_DATA_OFFSET))
}

/// Expected index offset embedded by the encoder in the first data record.
pub fn peek_queue_logic_offset(data: &[u8]) -> Option<i64> {
    (data.len() >= DATA_HEADER_LEN).then(|| get_i64(data, DATA_POS_QUEUE_LOGIC_OFFSET))
}

pub fn payload_crc32(payload: &[u8]) -> i32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize() as i32
}

/// A message decoded from a data record, in the shape handed to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMessage {
    pub message_id: i64,
    pub checksum: i32,
    pub flag: i32,
    pub payload: Vec<u8>,
}

impl TransferMessage {
    /// Decodes one data record and bumps the counter for its stats key.
    ///
    /// Returns `None` for records whose token, length or checksum do not
    /// hold up; such records are dropped rather than failing the read.
    pub fn decode(
        record: &[u8],
        stats_key_prefix: &str,
        counts: &mut HashMap<String, CountItem>,
    ) -> Option<Self> {
        let header = DataRecordHeader::from_bytes(record).ok()?;
        if header.token != DATA_TOKEN {
            log::warn!(
                "[Data Store] found data token {:#x} not match, message id {}",
                header.token,
                header.msg_id
            );
            return None;
        }
        let payload_len = header.payload_len()?;
        let end = DATA_HEADER_LEN.checked_add(payload_len)?;
        if end > record.len() {
            log::warn!(
                "[Data Store] payload length {payload_len} exceeds record of {} bytes",
                record.len()
            );
            return None;
        }
        let payload = &record[DATA_HEADER_LEN..end];
        if payload_crc32(payload) != header.checksum {
            log::warn!(
                "[Data Store] checksum mismatch for message id {}",
                header.msg_id
            );
            return None;
        }

        let stats_key = match message_type(header.msg_flag, payload) {
            Some(msg_type) if !msg_type.is_empty() => format!("{stats_key_prefix}#{msg_type}"),
            _ => stats_key_prefix.to_string(),
        };
        counts
            .entry(stats_key)
            .or_default()
            .append(1, payload_len as u64);

        Some(Self {
            message_id: header.msg_id,
            checksum: header.checksum,
            flag: header.msg_flag,
            payload: payload.to_vec(),
        })
    }
}

/// Extracts the `$msgType$` attribute from an attributed payload.
fn message_type(flag: i32, payload: &[u8]) -> Option<&str> {
    if flag & FLAG_HAS_ATTRIBUTES == 0 || payload.len() < 4 {
        return None;
    }
    let attr_len = usize::try_from(get_i32(payload, 0)).ok()?;
    let attrs = payload.get(4..4usize.checked_add(attr_len)?)?;
    let attrs = std::str::from_utf8(attrs).ok()?;
    attrs.split(',').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == MSG_TYPE_ATTR).then_some(value)
    })
}

/// A message queued for encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewMessage<'a> {
    pub partition_id: i32,
    pub msg_id: i64,
    pub filter_key_code: i32,
    pub receive_time_ms: i64,
    pub report_addr: i32,
    /// `k=v,k=v` attributes prefixed to the payload when present.
    pub attributes: Option<&'a str>,
    pub body: &'a [u8],
}

/// A batch of encoded index and data records with pre-computed offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedBatch {
    pub msg_count: u32,
    pub index: Vec<u8>,
    pub data: Vec<u8>,
}

/// Encodes messages into the buffers `MsgFileStore::batch_append_msg` takes.
///
/// Offsets are assigned from the bases given at construction, which must be
/// the store's current data and index max offsets for the write to verify.
#[derive(Debug)]
pub struct BatchBuilder {
    next_data_offset: i64,
    next_index_offset: i64,
    batch: EncodedBatch,
}

impl BatchBuilder {
    pub fn new(data_offset: u64, index_offset: u64) -> Self {
        Self {
            next_data_offset: data_offset as i64,
            next_index_offset: index_offset as i64,
            batch: EncodedBatch::default(),
        }
    }

    /// Appends one message, returning its (data offset, index offset).
    pub fn push(&mut self, msg: &NewMessage<'_>) -> (u64, u64) {
        let mut payload = Vec::with_capacity(msg.body.len() + 64);
        let mut flag = 0;
        if let Some(attrs) = msg.attributes {
            flag |= FLAG_HAS_ATTRIBUTES;
            payload.extend_from_slice(&(attrs.len() as i32).to_be_bytes());
            payload.extend_from_slice(attrs.as_bytes());
        }
        payload.extend_from_slice(msg.body);

        let header = DataRecordHeader {
            length: (DATA_PREFIX_LEN + payload.len()) as i32,
            token: DATA_TOKEN,
            checksum: payload_crc32(&payload),
            queue_id: msg.partition_id,
            queue_logic_offset: self.next_index_offset,
            receive_time_ms: msg.receive_time_ms,
            report_addr: msg.report_addr,
            filter_key_code: msg.filter_key_code,
            msg_id: msg.msg_id,
            msg_flag: flag,
        };
        let record_len = DATA_HEADER_LEN + payload.len();
        let index = IndexRecord {
            partition_id: msg.partition_id,
            data_offset: self.next_data_offset,
            data_size: record_len as i32,
            filter_key_code: msg.filter_key_code,
            receive_time_ms: msg.receive_time_ms,
        };

        self.batch.data.extend_from_slice(&header.to_bytes());
        self.batch.data.extend_from_slice(&payload);
        self.batch.index.extend_from_slice(&index.to_bytes());
        self.batch.msg_count += 1;

        let offsets = (self.next_data_offset as u64, self.next_index_offset as u64);
        self.next_data_offset += record_len as i64;
        self.next_index_offset += INDEX_RECORD_LEN as i64;
        offsets
    }

    pub fn msg_count(&self) -> u32 {
        self.batch.msg_count
    }

    pub fn is_empty(&self) -> bool {
        self.batch.msg_count == 0
    }

    pub fn next_data_offset(&self) -> u64 {
        self.next_data_offset as u64
    }

    pub fn next_index_offset(&self) -> u64 {
        self.next_index_offset as u64
    }

    pub fn finish(self) -> EncodedBatch {
        self.batch
    }
}

fn put_i32(buf: &mut [u8], pos: usize, value: i32) {
    buf[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_i64(buf: &mut [u8], pos: usize, value: i64) {
    buf[pos..pos + 8].copy_from_slice(&value.to_be_bytes());
}

// Callers check bounds before reading.
fn get_i32(buf: &[u8], pos: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[pos..pos + 4]);
    i32::from_be_bytes(raw)
}

fn get_i64(buf: &[u8], pos: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[pos..pos + 8]);
    i64::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &[u8]) -> NewMessage<'_> {
        NewMessage {
            partition_id: 3,
            msg_id: 42,
            filter_key_code: 7,
            receive_time_ms: 1_700_000_000_000,
            body,
            ..NewMessage::default()
        }
    }

    #[test]
    fn index_record_layout_is_big_endian() {
        let record = IndexRecord {
            partition_id: 1,
            data_offset: 0x0102_0304_0506_0708,
            data_size: 60,
            filter_key_code: -1,
            receive_time_ms: 9,
        };
        let bytes = record.to_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(IndexRecord::from_bytes(&bytes).unwrap(), record);
        assert_eq!(record.data_end(), 0x0102_0304_0506_0708 + 60);
    }

    #[test]
    fn truncated_records_are_rejected() {
        assert!(IndexRecord::from_bytes(&[0u8; INDEX_RECORD_LEN - 1]).is_err());
        assert!(DataRecordHeader::from_bytes(&[0u8; DATA_HEADER_LEN - 1]).is_err());
    }

    #[test]
    fn builder_assigns_contiguous_offsets() {
        let mut builder = BatchBuilder::new(1000, 280);
        assert_eq!(builder.push(&message(b"alpha")), (1000, 280));
        assert_eq!(
            builder.push(&message(b"bravo!")),
            (1000 + (DATA_HEADER_LEN + 5) as u64, 308)
        );
        let batch = builder.finish();
        assert_eq!(batch.msg_count, 2);
        assert_eq!(batch.index.len(), 2 * INDEX_RECORD_LEN);
        assert_eq!(batch.data.len(), 2 * DATA_HEADER_LEN + 11);
        assert_eq!(peek_index_data_offset(&batch.index), Some(1000));
        assert_eq!(peek_queue_logic_offset(&batch.data), Some(280));

        let second = IndexRecord::from_bytes(&batch.index[INDEX_RECORD_LEN..]).unwrap();
        let header =
            DataRecordHeader::from_bytes(&batch.data[DATA_HEADER_LEN + 5..]).unwrap();
        assert_eq!(header.queue_logic_offset, 308);
        assert_eq!(header.record_len(), Some(second.data_size as usize));
    }

    #[test]
    fn decode_counts_by_message_type() {
        let mut builder = BatchBuilder::new(0, 0);
        builder.push(&NewMessage {
            attributes: Some("$msgType$=order,region=eu"),
            ..message(b"payload")
        });
        builder.push(&message(b"plain"));
        let batch = builder.finish();
        let split = DATA_HEADER_LEN + 4 + 25 + 7;

        let mut counts = HashMap::new();
        let typed = TransferMessage::decode(&batch.data[..split], "topic-3", &mut counts).unwrap();
        assert_eq!(typed.message_id, 42);
        assert_eq!(typed.flag & FLAG_HAS_ATTRIBUTES, FLAG_HAS_ATTRIBUTES);
        assert!(typed.payload.ends_with(b"payload"));
        let plain = TransferMessage::decode(&batch.data[split..], "topic-3", &mut counts).unwrap();
        assert_eq!(plain.payload, b"plain");

        assert_eq!(counts["topic-3#order"].msg_count, 1);
        assert_eq!(counts["topic-3"].msg_count, 1);
        assert_eq!(counts["topic-3"].msg_size, 5);
    }

    #[test]
    fn decode_drops_corrupt_payload() {
        let mut builder = BatchBuilder::new(0, 0);
        builder.push(&message(b"payload"));
        let mut data = builder.finish().data;
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        let mut counts = HashMap::new();
        assert!(TransferMessage::decode(&data, "k", &mut counts).is_none());
        assert!(counts.is_empty());
    }

    #[test]
    fn decode_drops_bad_token() {
        let mut builder = BatchBuilder::new(0, 0);
        builder.push(&message(b"payload"));
        let mut data = builder.finish().data;
        data[DATA_POS_TOKEN..DATA_POS_TOKEN + 4].copy_from_slice(&0i32.to_be_bytes());
        let mut counts = HashMap::new();
        assert!(TransferMessage::decode(&data, "k", &mut counts).is_none());
    }
}
