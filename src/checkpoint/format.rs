//! Checkpoint metadata file format definitions.
//!
//! # File Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ MAGIC_NUMBER: [u8; 4] = "CHKM"                  │
//! ├─────────────────────────────────────────────────┤
//! │ VERSION: u32 = 1                                │
//! ├─────────────────────────────────────────────────┤
//! │ FLAGS: u32                                      │
//! │   bit 0: compressed (LZ4)                       │
//! │   bits 1-31: reserved                           │
//! ├─────────────────────────────────────────────────┤
//! │ CHECKPOINT_ID: u64                              │
//! ├─────────────────────────────────────────────────┤
//! │ TIMESTAMP: u64 (Unix timestamp milliseconds)    │
//! ├─────────────────────────────────────────────────┤
//! │ OPERATOR_COUNT: u64                             │
//! ├─────────────────────────────────────────────────┤
//! │ DATA_SIZE: u64 (uncompressed size)              │
//! ├─────────────────────────────────────────────────┤
//! │ HEADER_CRC32: u32 (over bytes 0..44)            │
//! ├─────────────────────────────────────────────────┤
//! │ RESERVED: [u8; 16]                              │
//! ├─────────────────────────────────────────────────┤
//! │                   DATA BLOCK                     │
//! │ (possibly LZ4 compressed)                       │
//! │ ┌─────────────────────────────────────────────┐ │
//! │ │ Operator entry 1:                           │ │
//! │ │  - Operator Id Length: u32                  │ │
//! │ │  - Operator Id: [u8] (utf-8)                │ │
//! │ │  - Handles Length: u32                      │ │
//! │ │  - Handles: [u8] (bincode Vec<StateHandle>) │ │
//! │ │  - Entry CRC32: u32                         │ │
//! │ ├─────────────────────────────────────────────┤ │
//! │ │ Operator entry 2: ...                       │ │
//! │ └─────────────────────────────────────────────┘ │
//! ├─────────────────────────────────────────────────┤
//! │ CRC32: u32 (over the data block as stored)      │
//! └─────────────────────────────────────────────────┘
//!
//! Total header size: 64 bytes
//! ```

use crate::handle::StateHandle;
use crate::types::{CheckpointId, OperatorId};
use crc::{Crc, CRC_32_ISCSI};
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic number for checkpoint metadata files: "CHKM"
pub const MAGIC: [u8; 4] = [b'C', b'H', b'K', b'M'];

/// Current format version
pub const VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Trailing checksum size in bytes
pub const TRAILER_SIZE: usize = 4;

/// Offset of the header checksum, which covers every byte before it
const HEADER_CRC_AT: usize = 44;

/// Smallest encoded operator entry: two length prefixes and the entry CRC
pub const MIN_ENTRY_SIZE: usize = 12;

/// Flag: data is LZ4 compressed
pub const FLAG_COMPRESSED: u32 = 1 << 0;

/// CRC-32 calculator (iSCSI polynomial), shared by metadata and state payloads.
pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Checksum of a byte slice with [`CRC32`].
pub(crate) fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Metadata file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHeader {
    /// Format version
    pub version: u32,

    /// Flags (compression, etc.)
    pub flags: u32,

    /// Checkpoint this metadata describes
    pub checkpoint_id: CheckpointId,

    /// Unix timestamp in milliseconds when the checkpoint was triggered
    pub timestamp: u64,

    /// Number of operator entries
    pub operator_count: u64,

    /// Uncompressed data size
    pub data_size: u64,
}

impl MetadataHeader {
    /// Create a new header for a checkpoint
    pub fn new(checkpoint_id: CheckpointId, timestamp: u64) -> Self {
        Self {
            version: VERSION,
            flags: 0,
            checkpoint_id,
            timestamp,
            operator_count: 0,
            data_size: 0,
        }
    }

    /// Check if data is compressed
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Set compression flag
    pub fn set_compressed(&mut self, compressed: bool) {
        if compressed {
            self.flags |= FLAG_COMPRESSED;
        } else {
            self.flags &= !FLAG_COMPRESSED;
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.checkpoint_id.to_le_bytes());
        buf[20..28].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[28..36].copy_from_slice(&self.operator_count.to_le_bytes());
        buf[36..44].copy_from_slice(&self.data_size.to_le_bytes());

        let crc = checksum(&buf[..HEADER_CRC_AT]);
        buf[HEADER_CRC_AT..HEADER_CRC_AT + 4].copy_from_slice(&crc.to_le_bytes());

        // Reserved (48-63) - already zeros

        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_SIZE {
            return Err(FormatError::InvalidHeader("header too short".into()));
        }

        if buf[0..4] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let version = read_u32(buf, 4);
        if version == 0 || version > VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let stored = read_u32(buf, HEADER_CRC_AT);
        let computed = checksum(&buf[..HEADER_CRC_AT]);
        if stored != computed {
            return Err(FormatError::HeaderCorrupted {
                expected: stored,
                actual: computed,
            });
        }

        Ok(Self {
            version,
            flags: read_u32(buf, 8),
            checkpoint_id: read_u64(buf, 12),
            timestamp: read_u64(buf, 20),
            operator_count: read_u64(buf, 28),
            data_size: read_u64(buf, 36),
        })
    }
}

/// The state handles one operator reported for a checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorStateEntry {
    /// Operator the handles belong to
    pub operator_id: OperatorId,

    /// Handles in the order the tasks reported them
    pub handles: Vec<StateHandle>,
}

impl OperatorStateEntry {
    /// Create a new entry
    pub fn new(operator_id: OperatorId, handles: Vec<StateHandle>) -> Self {
        Self {
            operator_id,
            handles,
        }
    }

    /// Serialize entry to bytes, including the trailing entry CRC
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        encode_entry(&self.operator_id, &self.handles)
    }

    /// Parse entry from bytes, returns (entry, bytes_consumed)
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize), FormatError> {
        let mut pos = 0;

        let id_len = take_u32(buf, &mut pos)? as usize;
        let id_bytes = take_slice(buf, &mut pos, id_len)?;
        let operator_id = std::str::from_utf8(id_bytes)
            .map_err(|e| FormatError::Decode(format!("operator id: {}", e)))?;
        let operator_id = OperatorId::new(operator_id);

        let handles_len = take_u32(buf, &mut pos)? as usize;
        let handles_bytes = take_slice(buf, &mut pos, handles_len)?;

        let computed = checksum(&buf[..pos]);
        let stored = take_u32(buf, &mut pos)?;
        if stored != computed {
            return Err(FormatError::EntryCorrupted {
                expected: stored,
                actual: computed,
            });
        }

        let handles: Vec<StateHandle> = bincode::deserialize(handles_bytes)
            .map_err(|e| FormatError::Decode(format!("state handles: {}", e)))?;

        Ok((
            Self {
                operator_id,
                handles,
            },
            pos,
        ))
    }
}

/// Encode one operator entry without cloning its handles.
pub(crate) fn encode_entry(
    operator_id: &OperatorId,
    handles: &[StateHandle],
) -> Result<Vec<u8>, FormatError> {
    let handles_bytes =
        bincode::serialize(handles).map_err(|e| FormatError::Encode(e.to_string()))?;
    let id_bytes = operator_id.as_str().as_bytes();

    let mut buf = Vec::with_capacity(4 + id_bytes.len() + 4 + handles_bytes.len() + 4);
    buf.extend_from_slice(&(id_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(id_bytes);
    buf.extend_from_slice(&(handles_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&handles_bytes);

    let entry_crc = checksum(&buf);
    buf.extend_from_slice(&entry_crc.to_le_bytes());

    Ok(buf)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn take_u32(buf: &[u8], pos: &mut usize) -> Result<u32, FormatError> {
    if buf.len() < *pos + 4 {
        return Err(FormatError::UnexpectedEof);
    }
    let value = read_u32(buf, *pos);
    *pos += 4;
    Ok(value)
}

fn take_slice<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], FormatError> {
    if buf.len() < *pos + len {
        return Err(FormatError::UnexpectedEof);
    }
    let slice = &buf[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

/// Format-related errors
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("invalid magic number")]
    InvalidMagic,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("header corrupted: expected CRC {expected}, got {actual}")]
    HeaderCorrupted { expected: u32, actual: u32 },

    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("entry corrupted: expected CRC {expected}, got {actual}")]
    EntryCorrupted { expected: u32, actual: u32 },

    #[error("entry count mismatch: header says {expected}, found {actual}")]
    EntryCountMismatch { expected: u64, actual: u64 },

    #[error("encoding failed: {0}")]
    Encode(String),

    #[error("decoding failed: {0}")]
    Decode(String),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FormatError {
    /// Convert into a storage error for the metadata behind `pointer`.
    ///
    /// A missing file maps to `NotFound`; every layout problem, including a
    /// file truncated mid-entry, maps to `CorruptMetadata`.
    pub fn into_storage_error(self, pointer: &str) -> crate::Error {
        match self {
            FormatError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                crate::Error::NotFound(pointer.to_string())
            }
            FormatError::Io(e) if e.kind() != std::io::ErrorKind::UnexpectedEof => {
                crate::Error::Io(e)
            }
            FormatError::Encode(reason) => crate::Error::Serialization(reason),
            other => crate::Error::CorruptMetadata {
                pointer: pointer.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateScope;
    use bytes::Bytes;

    #[test]
    fn test_header_roundtrip() {
        let mut header = MetadataHeader::new(42, 1_700_000_000_000);
        header.set_compressed(true);
        header.operator_count = 3;
        header.data_size = 50_000;

        let bytes = header.to_bytes();
        let parsed = MetadataHeader::from_bytes(&bytes).unwrap();

        assert_eq!(parsed, header);
        assert!(parsed.is_compressed());
    }

    #[test]
    fn test_header_crc_detects_damaged_fields() {
        let mut header = MetadataHeader::new(5, 1_700_000_000_000);
        header.operator_count = 2;
        header.data_size = 128;

        for range in [12..20, 20..28, 28..36, 36..44] {
            let mut bytes = header.to_bytes();
            for b in &mut bytes[range] {
                *b = 0xFF;
            }
            let result = MetadataHeader::from_bytes(&bytes);
            assert!(matches!(result, Err(FormatError::HeaderCorrupted { .. })));
        }
    }

    #[test]
    fn test_entry_roundtrip_keeps_inline_bytes() {
        let handle = StateHandle::inline(StateScope::Shared, Bytes::from_static(b"offsets"));
        let entry = OperatorStateEntry::new(OperatorId::new("source"), vec![handle.clone()]);

        let bytes = entry.to_bytes().unwrap();
        let (parsed, consumed) = OperatorStateEntry::from_bytes(&bytes).unwrap();

        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.operator_id.as_str(), "source");
        assert_eq!(parsed.handles, vec![handle]);
    }

    #[test]
    fn test_entry_crc_detects_flipped_byte() {
        let entry = OperatorStateEntry::new(OperatorId::new("map"), Vec::new());
        let mut bytes = entry.to_bytes().unwrap();
        bytes[4] ^= 0xff;

        let result = OperatorStateEntry::from_bytes(&bytes);
        assert!(matches!(result, Err(FormatError::EntryCorrupted { .. })));
    }

    #[test]
    fn test_truncated_entry() {
        let entry = OperatorStateEntry::new(OperatorId::new("map"), Vec::new());
        let bytes = entry.to_bytes().unwrap();

        let result = OperatorStateEntry::from_bytes(&bytes[..bytes.len() - 2]);
        assert!(matches!(result, Err(FormatError::UnexpectedEof)));
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(b"XXXX");

        let result = MetadataHeader::from_bytes(&bytes);
        assert!(matches!(result, Err(FormatError::InvalidMagic)));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut bytes = MetadataHeader::new(1, 0).to_bytes();
        bytes[4..8].copy_from_slice(&(VERSION + 1).to_le_bytes());

        let result = MetadataHeader::from_bytes(&bytes);
        assert!(matches!(result, Err(FormatError::UnsupportedVersion(_))));
    }

    #[test]
    fn test_missing_file_maps_to_not_found() {
        let err = FormatError::Io(std::io::Error::from(std::io::ErrorKind::NotFound))
            .into_storage_error("/tmp/chk-1/_metadata");
        assert!(matches!(err, crate::Error::NotFound(_)));

        let err = FormatError::UnexpectedEof.into_storage_error("/tmp/chk-1/_metadata");
        assert!(matches!(err, crate::Error::CorruptMetadata { .. }));
    }
}
