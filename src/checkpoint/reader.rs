//! Metadata reader with LZ4 decompression and CRC32 verification.
//!
//! Metadata files are small by construction (state payloads live in their own
//! files or inline in handles), so the reader loads the whole file, verifies
//! the trailing checksum before decoding anything, and then hands out
//! operator entries one at a time.

use crate::checkpoint::format::{
    checksum, FormatError, MetadataHeader, OperatorStateEntry, HEADER_SIZE, MIN_ENTRY_SIZE,
    TRAILER_SIZE,
};
use lz4_flex::frame::FrameDecoder;
use std::io::Read;
use std::path::Path;

/// Reads operator entries from checkpoint metadata.
pub struct MetadataReader {
    /// The metadata header
    header: MetadataHeader,

    /// Decoded (decompressed) data block
    data: Vec<u8>,

    /// Read offset into `data`
    pos: usize,

    /// Number of entries read so far
    entries_read: u64,
}

impl MetadataReader {
    /// Open a metadata file for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    /// Parse metadata held in memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE + TRAILER_SIZE {
            return Err(FormatError::InvalidHeader("file too small".into()));
        }

        let header = MetadataHeader::from_bytes(&bytes[..HEADER_SIZE])?;

        // File layout: [header][data][crc32]
        let trailer_at = bytes.len() - TRAILER_SIZE;
        let stored = &bytes[HEADER_SIZE..trailer_at];
        let mut crc_buf = [0u8; TRAILER_SIZE];
        crc_buf.copy_from_slice(&bytes[trailer_at..]);
        let stored_crc = u32::from_le_bytes(crc_buf);

        let computed = checksum(stored);
        if computed != stored_crc {
            return Err(FormatError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed,
            });
        }

        let data = if header.is_compressed() {
            // One byte past the declared size is enough to detect a mismatch
            let mut decoder = FrameDecoder::new(stored).take(header.data_size.saturating_add(1));
            let mut data = Vec::new();
            decoder
                .read_to_end(&mut data)
                .map_err(|e| FormatError::DecompressionFailed(e.to_string()))?;
            data
        } else {
            stored.to_vec()
        };

        if data.len() as u64 != header.data_size {
            return Err(FormatError::InvalidHeader(format!(
                "data size mismatch: header says {}, found {}",
                header.data_size,
                data.len()
            )));
        }

        let max_entries = (data.len() / MIN_ENTRY_SIZE) as u64;
        if header.operator_count > max_entries {
            return Err(FormatError::InvalidHeader(format!(
                "{} operator entries cannot fit in {} bytes",
                header.operator_count,
                data.len()
            )));
        }

        Ok(Self {
            header,
            data,
            pos: 0,
            entries_read: 0,
        })
    }

    /// Get the metadata header.
    pub fn header(&self) -> &MetadataHeader {
        &self.header
    }

    /// Get the expected number of operator entries.
    pub fn operator_count(&self) -> u64 {
        self.header.operator_count
    }

    /// Check if there are more entries to read.
    pub fn has_more(&self) -> bool {
        self.entries_read < self.header.operator_count
    }

    /// Read the next operator entry.
    ///
    /// Returns `Ok(None)` when all entries have been read. Verifies the
    /// per-entry CRC to detect corruption.
    pub fn read_entry(&mut self) -> Result<Option<OperatorStateEntry>, FormatError> {
        if !self.has_more() {
            return Ok(None);
        }

        let (entry, consumed) = OperatorStateEntry::from_bytes(&self.data[self.pos..])?;
        self.pos += consumed;
        self.entries_read += 1;

        Ok(Some(entry))
    }

    /// Read all remaining entries and check nothing trails them.
    pub fn read_all(&mut self) -> Result<Vec<OperatorStateEntry>, FormatError> {
        let remaining = self.header.operator_count.saturating_sub(self.entries_read);
        let mut entries = Vec::with_capacity(remaining as usize);

        while let Some(entry) = self.read_entry()? {
            entries.push(entry);
        }

        if self.pos != self.data.len() {
            return Err(FormatError::EntryCountMismatch {
                expected: self.header.operator_count,
                actual: self.entries_read + 1,
            });
        }

        Ok(entries)
    }
}
