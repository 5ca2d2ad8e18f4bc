//! Log record codec.
//!
//! Every entry in a data file is one record laid out as:
//!
//! ```text
//! +------------+---------+------------------+--------------------+-----+-------+
//! | crc(4, LE) | type(1) | key size(varint) | value size(varint) | key | value |
//! +------------+---------+------------------+--------------------+-----+-------+
//! ```
//!
//! The CRC (IEEE polynomial) covers everything after the CRC field. The
//! two sizes are zig-zag varints, so the header is variable-length:
//! at least 7 bytes, at most [`MAX_LOG_RECORD_HEADER_SIZE`].

use bytes::{Buf, BufMut, BytesMut};

/// Longest possible encoding of a 32-bit varint.
const MAX_VARINT32_LEN: usize = 5;

/// Maximum header size: crc + type + two maximum-length size varints.
pub const MAX_LOG_RECORD_HEADER_SIZE: usize = 4 + 1 + 2 * MAX_VARINT32_LEN;

/// What a log record means to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// A live key-value pair.
    Normal = 0,

    /// A tombstone: the key is deleted, the value is empty.
    Deleted = 1,

    /// A transaction commit marker. Carries no user payload; its presence
    /// makes every record sharing its sequence number visible to replay.
    TxnFinished = 2,
}

impl LogRecordType {
    /// Converts a raw tag byte back to a record type.
    ///
    /// Callers verify the record checksum before interpreting the tag, so
    /// an unknown value here means the encoder and decoder disagree.
    pub(crate) fn from_u8(value: u8) -> LogRecordType {
        match value {
            0 => LogRecordType::Normal,
            1 => LogRecordType::Deleted,
            2 => LogRecordType::TxnFinished,
            other => panic!("unknown log record type tag: {}", other),
        }
    }
}

/// One entry of a data file.
///
/// The `key` as stored on disk is a composite key: the transaction
/// sequence number as an unsigned varint, followed by the user key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Composite key bytes.
    pub key: Vec<u8>,
    /// Value bytes; empty for tombstones and commit markers.
    pub value: Vec<u8>,
    /// What this record means to the index.
    pub rec_type: LogRecordType,
}

impl LogRecord {
    /// Encodes the record into its on-disk representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(
            MAX_LOG_RECORD_HEADER_SIZE + self.key.len() + self.value.len(),
        );

        // crc is computed last, over everything that follows it
        buf.put_u32_le(0);
        buf.put_u8(self.rec_type as u8);
        encode_varint(&mut buf, self.key.len() as i64);
        encode_varint(&mut buf, self.value.len() as i64);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);

        let crc = crc32fast::hash(&buf[4..]);
        let mut bytes = buf.to_vec();
        bytes[0..4].copy_from_slice(&crc.to_le_bytes());

        bytes
    }
}

/// Decoded header fields of one record.
///
/// The type tag stays a raw byte until the checksum has been verified.
#[derive(Debug)]
pub(crate) struct LogRecordHeader {
    pub(crate) crc: u32,
    pub(crate) rec_type: u8,
    pub(crate) key_size: u32,
    pub(crate) value_size: u32,
}

/// Decodes a record header from the start of `buf`.
///
/// Returns `None` when fewer than five bytes are available or a size
/// varint is malformed; the caller treats this as end-of-file.
pub(crate) fn decode_log_record_header(buf: &[u8]) -> Option<(LogRecordHeader, usize)> {
    if buf.len() <= 4 {
        return None;
    }

    let mut reader: &[u8] = buf;
    let crc = reader.get_u32_le();
    let rec_type = reader.get_u8();

    let (key_size, key_len) = decode_varint(reader)?;
    reader = &reader[key_len..];
    let (value_size, value_len) = decode_varint(reader)?;

    if key_size < 0 || value_size < 0 {
        return None;
    }

    let header_size = 4 + 1 + key_len + value_len;
    let header = LogRecordHeader {
        crc,
        rec_type,
        key_size: key_size as u32,
        value_size: value_size as u32,
    };

    Some((header, header_size))
}

/// Where a record lives on disk. This is the value type of the in-memory
/// index, and the unit the reclaimable-space accounting is kept in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecordPos {
    /// Segment file identifier.
    pub file_id: u32,
    /// Byte offset of the record's first byte within the file.
    pub offset: u64,
    /// Total encoded length of the record.
    pub size: u32,
}

/// Encodes a position as three varints: file id, offset, size.
///
/// Hint records already carry a value length, so the encoding needs no
/// length prefix of its own.
pub fn encode_log_record_pos(pos: &LogRecordPos) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(3 * MAX_VARINT32_LEN);
    encode_varint(&mut buf, pos.file_id as i64);
    encode_varint(&mut buf, pos.offset as i64);
    encode_varint(&mut buf, pos.size as i64);
    buf.to_vec()
}

/// Decodes a position encoded by [`encode_log_record_pos`].
pub fn decode_log_record_pos(buf: &[u8]) -> Option<LogRecordPos> {
    let (file_id, n) = decode_varint(buf)?;
    let buf = &buf[n..];
    let (offset, n) = decode_varint(buf)?;
    let buf = &buf[n..];
    let (size, _) = decode_varint(buf)?;

    Some(LogRecordPos { file_id: file_id as u32, offset: offset as u64, size: size as u32 })
}

/// Appends a zig-zag varint to `buf`.
pub(crate) fn encode_varint(buf: &mut BytesMut, value: i64) {
    encode_uvarint(buf, ((value << 1) ^ (value >> 63)) as u64);
}

/// Appends an unsigned varint to `buf`.
pub(crate) fn encode_uvarint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decodes a zig-zag varint from the start of `buf`, returning the value
/// and the number of bytes consumed.
pub(crate) fn decode_varint(buf: &[u8]) -> Option<(i64, usize)> {
    let (value, n) = decode_uvarint(buf)?;
    Some((((value >> 1) as i64) ^ -((value & 1) as i64), n))
}

/// Decodes an unsigned varint from the start of `buf`.
pub(crate) fn decode_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if i == 10 {
            return None;
        }
        if byte < 0x80 {
            if i == 9 && byte > 1 {
                return None;
            }
            return Some((value | ((byte as u64) << shift), i + 1));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }
    None
}
