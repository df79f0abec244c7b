//! Binary encoding of transactions.
//!
//! A transaction payload is a little-endian layout shared by the tx log and
//! the replication stream:
//!
//! ```text
//! | id: u64 | timestamp: u64 | version: u16 | prev_alh: [u8; 32] |
//! | entries_count: u32 | entries_hash: [u8; 32] |
//! then per entry:
//! | deleted: u8 | key_len: u32 | key | value_len: u32 | value |
//! ```
//!
//! In the log each payload is wrapped in a checksummed record:
//!
//! ```text
//! | magic (4) | version (2) | length (4) | payload | crc32 (4) |
//! ```
//!
//! The CRC covers everything before it.

use crate::error::{StoreError, StoreResult};
use crate::tx::{Entry, EntryMetadata, Tx, TxHeader};
use crate::types::TxId;

/// Magic bytes identifying a tx log record.
pub const RECORD_MAGIC: [u8; 4] = *b"CKTX";

/// Current record envelope version.
pub const RECORD_VERSION: u16 = 1;

/// Size of the envelope before the payload.
pub const RECORD_HEADER_SIZE: usize = 10;

/// Size of the trailing checksum.
pub const RECORD_CRC_SIZE: usize = 4;

/// Size of the fixed payload header.
pub const TX_HEADER_SIZE: usize = 8 + 8 + 2 + 32 + 4 + 32;

/// Largest payload the log accepts.
///
/// Leaves headroom for message framing below the replication frame limit,
/// so any committed transaction can still be shipped on its own.
pub const MAX_TX_PAYLOAD_LEN: usize = 48 * 1024 * 1024;

/// Encoded size of one entry with the given key and value lengths.
#[must_use]
pub const fn entry_encoded_len(key_len: usize, value_len: usize) -> usize {
    1 + 4 + key_len + 4 + value_len
}

/// Encoded size of a transaction payload.
#[must_use]
pub fn encoded_tx_len(tx: &Tx) -> usize {
    TX_HEADER_SIZE
        + tx
            .entries()
            .iter()
            .map(|e| entry_encoded_len(e.key().len(), e.value().len()))
            .sum::<usize>()
}

/// Serializes a transaction payload.
#[must_use]
pub fn encode_tx(tx: &Tx) -> Vec<u8> {
    let header = tx.header();
    let mut buf = Vec::with_capacity(encoded_tx_len(tx));

    buf.extend_from_slice(&header.id.as_u64().to_le_bytes());
    buf.extend_from_slice(&header.timestamp.to_le_bytes());
    buf.extend_from_slice(&header.version.to_le_bytes());
    buf.extend_from_slice(&header.prev_alh);
    buf.extend_from_slice(&header.entries_count.to_le_bytes());
    buf.extend_from_slice(&header.entries_hash);

    for entry in tx.entries() {
        buf.push(u8::from(entry.is_deleted()));
        buf.extend_from_slice(&(entry.key().len() as u32).to_le_bytes());
        buf.extend_from_slice(entry.key());
        buf.extend_from_slice(&(entry.value().len() as u32).to_le_bytes());
        buf.extend_from_slice(entry.value());
    }
    buf
}

/// Deserializes a transaction payload.
///
/// The result is not verified; see [`Tx::verify`].
///
/// # Errors
///
/// Returns [`StoreError::Corrupted`] on truncated input, an invalid
/// deletion flag or trailing bytes.
pub fn decode_tx(bytes: &[u8]) -> StoreResult<Tx> {
    let mut reader = Reader::new(bytes);

    let id = TxId(reader.u64()?);
    let timestamp = reader.u64()?;
    let version = reader.u16()?;
    let prev_alh = reader.array32()?;
    let entries_count = reader.u32()?;
    let entries_hash = reader.array32()?;

    let header = TxHeader {
        id,
        timestamp,
        version,
        prev_alh,
        entries_count,
        entries_hash,
    };

    // Bounded by the remaining input so a forged count cannot force a huge allocation.
    let mut entries = Vec::with_capacity((entries_count as usize).min(reader.remaining() / 9));
    for _ in 0..entries_count {
        let deleted = match reader.u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(StoreError::corrupted(format!(
                    "{id}: invalid deletion flag {other}"
                )))
            }
        };
        let key_len = reader.u32()? as usize;
        let key = reader.bytes(key_len)?.to_vec();
        let value_len = reader.u32()? as usize;
        let value = reader.bytes(value_len)?.to_vec();
        entries.push(Entry::with_metadata(key, value, EntryMetadata { deleted }));
    }

    if reader.remaining() != 0 {
        return Err(StoreError::corrupted(format!(
            "{id}: {} trailing bytes after payload",
            reader.remaining()
        )));
    }

    Ok(Tx::from_parts(header, entries))
}

/// Wraps a payload in a checksummed log record.
///
/// # Errors
///
/// Returns [`StoreError::MaxTxBytesExceeded`] if the payload is longer than
/// [`MAX_TX_PAYLOAD_LEN`].
pub fn encode_record(payload: &[u8]) -> StoreResult<Vec<u8>> {
    if payload.len() > MAX_TX_PAYLOAD_LEN {
        return Err(StoreError::MaxTxBytesExceeded {
            len: payload.len(),
            max: MAX_TX_PAYLOAD_LEN,
        });
    }
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + RECORD_CRC_SIZE);
    buf.extend_from_slice(&RECORD_MAGIC);
    buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Parses a record envelope header and returns the payload length.
///
/// # Errors
///
/// Returns [`StoreError::Corrupted`] on a bad magic or unknown version.
pub fn decode_record_header(header: &[u8]) -> StoreResult<usize> {
    if header.len() < RECORD_HEADER_SIZE {
        return Err(StoreError::corrupted("record header truncated"));
    }
    if header[0..4] != RECORD_MAGIC {
        return Err(StoreError::corrupted("invalid record magic"));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != RECORD_VERSION {
        return Err(StoreError::corrupted(format!(
            "unsupported record version {version}"
        )));
    }
    Ok(u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize)
}

/// Checks the trailing CRC of a full record and returns its payload.
///
/// # Errors
///
/// Returns [`StoreError::ChecksumMismatch`] if the record is damaged.
pub fn verify_record(offset: u64, record: &[u8]) -> StoreResult<&[u8]> {
    if record.len() < RECORD_HEADER_SIZE + RECORD_CRC_SIZE {
        return Err(StoreError::corrupted(format!("record at {offset} truncated")));
    }
    let split = record.len() - RECORD_CRC_SIZE;
    let (body, crc_bytes) = record.split_at(split);
    let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(StoreError::ChecksumMismatch {
            offset,
            expected,
            actual,
        });
    }
    Ok(&body[RECORD_HEADER_SIZE..])
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> StoreResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(StoreError::corrupted(format!(
                "payload truncated: need {len} bytes at {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> StoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> StoreResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> StoreResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> StoreResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn array32(&mut self) -> StoreResult<[u8; 32]> {
        let mut buf = [0u8; 32];
        buf.copy_from_slice(self.bytes(32)?);
        Ok(buf)
    }
}
