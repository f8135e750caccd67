//! Journal record model and on-disk framing.
//!
//! ```text
//! [payload_len: u32][crc32: u32][payload]
//! payload = [kind: u8][fields...]
//! ```
//!
//! The checksum is seeded with the sequence number of the file holding the
//! record, so stale bytes left behind in a recycled file never validate.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::block::StoreFiles;
use crate::error::StorageResult;

/// Size of the per-record frame header.
pub const RECORD_HEADER_SIZE: usize = 8;

const KIND_DATA_BLOCK: u8 = 1;
const KIND_METADATA: u8 = 2;
const KIND_METADATA_BLOCK: u8 = 3;
const KIND_EXTEND_STORE: u8 = 4;
const KIND_COMMIT: u8 = 5;

/// One journaled store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// Bytes written into a data block
    DataBlock {
        /// Block handle
        handle: i32,
        /// Offset within the block
        offset: u32,
        /// Written bytes
        data: Bytes,
    },
    /// One integer written into the allocation table
    MetaData {
        /// Allocation table offset
        offset: u64,
        /// New value
        value: i32,
    },
    /// Raw bytes written into the allocation table
    MetaDataBlock {
        /// Allocation table offset
        offset: u64,
        /// Written bytes
        data: Bytes,
    },
    /// Store files grown to a new block count
    ExtendStore {
        /// Block size of the store
        block_size: u32,
        /// Count before the extension
        old_block_count: u32,
        /// Count after the extension
        new_block_count: u32,
    },
    /// Every preceding record is part of a durable commit
    Commit {
        /// Sequence number of the last record covered
        last_sequence: u64,
    },
}

impl JournalRecord {
    /// Size of the framed record on disk.
    #[must_use]
    pub fn framed_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload_len()
    }

    fn payload_len(&self) -> usize {
        1 + match self {
            Self::DataBlock { data, .. } => 4 + 4 + 4 + data.len(),
            Self::MetaData { .. } => 8 + 4,
            Self::MetaDataBlock { data, .. } => 8 + 4 + data.len(),
            Self::ExtendStore { .. } => 12,
            Self::Commit { .. } => 8,
        }
    }

    /// Replay the record against the store files.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`](crate::StorageError::Io) on write failure.
    pub fn apply_to(&self, files: &StoreFiles) -> StorageResult<()> {
        match self {
            Self::DataBlock { handle, offset, data } => files.write_block(*handle, *offset, data),
            Self::MetaData { offset, value } => files.write_table(*offset, &value.to_be_bytes()),
            Self::MetaDataBlock { offset, data } => files.write_table(*offset, data),
            Self::ExtendStore { new_block_count, .. } => files.resize(*new_block_count),
            Self::Commit { .. } => Ok(()),
        }
    }

    /// Append the framed record to `out`.
    pub fn encode(&self, file_sequence: u64, out: &mut BytesMut) {
        let mut payload = BytesMut::with_capacity(self.payload_len());
        match self {
            Self::DataBlock { handle, offset, data } => {
                payload.put_u8(KIND_DATA_BLOCK);
                payload.put_i32(*handle);
                payload.put_u32(*offset);
                payload.put_u32(data.len() as u32);
                payload.put_slice(data);
            },
            Self::MetaData { offset, value } => {
                payload.put_u8(KIND_METADATA);
                payload.put_u64(*offset);
                payload.put_i32(*value);
            },
            Self::MetaDataBlock { offset, data } => {
                payload.put_u8(KIND_METADATA_BLOCK);
                payload.put_u64(*offset);
                payload.put_u32(data.len() as u32);
                payload.put_slice(data);
            },
            Self::ExtendStore { block_size, old_block_count, new_block_count } => {
                payload.put_u8(KIND_EXTEND_STORE);
                payload.put_u32(*block_size);
                payload.put_u32(*old_block_count);
                payload.put_u32(*new_block_count);
            },
            Self::Commit { last_sequence } => {
                payload.put_u8(KIND_COMMIT);
                payload.put_u64(*last_sequence);
            },
        }

        out.reserve(RECORD_HEADER_SIZE + payload.len());
        out.put_u32(payload.len() as u32);
        out.put_u32(checksum(file_sequence, &payload));
        out.put_slice(&payload);
    }
}

/// Result of decoding one framed record.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A valid record and the number of bytes it occupied
    Record(JournalRecord, usize),
    /// Clean end of the written region
    End,
    /// Torn or corrupted bytes; nothing from here on can be trusted
    Invalid(&'static str),
}

/// Decode the record at the start of `input`.
#[must_use]
pub fn decode(file_sequence: u64, input: &[u8]) -> DecodeOutcome {
    if input.len() < RECORD_HEADER_SIZE {
        return if input.iter().all(|&b| b == 0) { DecodeOutcome::End } else { DecodeOutcome::Invalid("torn header") };
    }
    let mut header = &input[..RECORD_HEADER_SIZE];
    let len = header.get_u32() as usize;
    let crc = header.get_u32();
    if len == 0 && crc == 0 {
        return DecodeOutcome::End;
    }
    let Some(payload) = input.get(RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len) else {
        return DecodeOutcome::Invalid("torn payload");
    };
    if checksum(file_sequence, payload) != crc {
        return DecodeOutcome::Invalid("checksum mismatch");
    }
    match decode_payload(payload) {
        Some(record) => DecodeOutcome::Record(record, RECORD_HEADER_SIZE + len),
        None => DecodeOutcome::Invalid("malformed payload"),
    }
}

fn decode_payload(mut payload: &[u8]) -> Option<JournalRecord> {
    if payload.is_empty() {
        return None;
    }
    let record = match payload.get_u8() {
        KIND_DATA_BLOCK if payload.len() >= 12 => {
            let handle = payload.get_i32();
            let offset = payload.get_u32();
            let len = payload.get_u32() as usize;
            let data = take(&mut payload, len)?;
            JournalRecord::DataBlock { handle, offset, data }
        },
        KIND_METADATA if payload.len() >= 12 => {
            JournalRecord::MetaData { offset: payload.get_u64(), value: payload.get_i32() }
        },
        KIND_METADATA_BLOCK if payload.len() >= 12 => {
            let offset = payload.get_u64();
            let len = payload.get_u32() as usize;
            let data = take(&mut payload, len)?;
            JournalRecord::MetaDataBlock { offset, data }
        },
        KIND_EXTEND_STORE if payload.len() >= 12 => JournalRecord::ExtendStore {
            block_size: payload.get_u32(),
            old_block_count: payload.get_u32(),
            new_block_count: payload.get_u32(),
        },
        KIND_COMMIT if payload.len() >= 8 => JournalRecord::Commit { last_sequence: payload.get_u64() },
        _ => return None,
    };
    payload.is_empty().then_some(record)
}

fn take(payload: &mut &[u8], len: usize) -> Option<Bytes> {
    if payload.len() < len {
        return None;
    }
    let data = Bytes::copy_from_slice(&payload[..len]);
    payload.advance(len);
    Some(data)
}

fn checksum(file_sequence: u64, payload: &[u8]) -> u32 {
    let seed = (file_sequence as u32) ^ ((file_sequence >> 32) as u32);
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<JournalRecord> {
        vec![
            JournalRecord::DataBlock { handle: 7, offset: 0, data: Bytes::from_static(b"block") },
            JournalRecord::MetaData { offset: 8, value: -1 },
            JournalRecord::MetaDataBlock { offset: 25, data: Bytes::from_static(&[1, 2, 3]) },
            JournalRecord::ExtendStore { block_size: 64, old_block_count: 2, new_block_count: 6 },
            JournalRecord::Commit { last_sequence: 4 },
        ]
    }

    #[test]
    fn test_decode_sequence() {
        let mut buf = BytesMut::new();
        for record in sample() {
            record.encode(9, &mut buf);
        }
        let mut input = &buf[..];
        let mut decoded = Vec::new();
        while let DecodeOutcome::Record(record, used) = decode(9, input) {
            decoded.push(record);
            input = &input[used..];
        }
        assert_eq!(decoded, sample());
        assert_eq!(decode(9, input), DecodeOutcome::End);
    }

    #[test]
    fn test_wrong_file_sequence_rejected() {
        let mut buf = BytesMut::new();
        sample()[0].encode(1, &mut buf);
        assert_eq!(decode(2, &buf), DecodeOutcome::Invalid("checksum mismatch"));
    }

    #[test]
    fn test_torn_record_detected() {
        let mut buf = BytesMut::new();
        sample()[0].encode(1, &mut buf);
        assert_eq!(buf.len(), sample()[0].framed_len());
        assert!(matches!(decode(1, &buf[..buf.len() - 1]), DecodeOutcome::Invalid(_)));
        assert_eq!(decode(1, &[0u8; 20]), DecodeOutcome::End);
    }
}
