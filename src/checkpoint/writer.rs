//! Metadata writer with streaming LZ4 compression and CRC32 integrity.

use crate::checkpoint::format::{
    encode_entry, FormatError, MetadataHeader, CRC32, HEADER_SIZE,
};
use crate::handle::StateHandle;
use crate::types::{CheckpointId, OperatorId};
use lz4_flex::frame::FrameEncoder;
use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::Path;

/// Inner writer that handles compression transparently.
enum WriterInner<W: Write> {
    /// Compressed output using LZ4 frame format
    Compressed {
        encoder: FrameEncoder<CrcWriter<W>>,
    },
    /// Uncompressed output with CRC tracking
    Uncompressed { writer: CrcWriter<W> },
}

/// Wrapper that calculates CRC32 while writing.
pub(crate) struct CrcWriter<W: Write> {
    inner: W,
    digest: crc::Digest<'static, u32>,
}

impl<W: Write> CrcWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            digest: CRC32.digest(),
        }
    }

    pub(crate) fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub(crate) fn finalize_crc(self) -> (W, u32) {
        (self.inner, self.digest.finalize())
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Writes a checkpoint's operator states as a metadata file.
///
/// Operator entries are streamed through the (optional) LZ4 encoder as they
/// are written; the header is rewritten with the final counts in
/// [`MetadataWriter::finish`].
pub struct MetadataWriter<W: Write + Seek> {
    inner: WriterInner<W>,

    /// Header (will be rewritten at finish with final counts)
    header: MetadataHeader,

    operator_count: u64,

    /// Uncompressed data size (sum of serialized entry sizes)
    data_size: u64,
}

impl MetadataWriter<BufWriter<File>> {
    /// Create a writer for a new metadata file at `path`.
    pub fn create(
        path: impl AsRef<Path>,
        checkpoint_id: CheckpointId,
        timestamp: u64,
        compress: bool,
    ) -> Result<Self, FormatError> {
        let file = File::create(path.as_ref())?;
        Self::new(BufWriter::new(file), checkpoint_id, timestamp, compress)
    }

    /// Finish the file and make sure it reached physical storage.
    pub fn finalize_file(self) -> Result<MetadataFileInfo, FormatError> {
        let (buf_writer, mut info) = self.finish()?;

        let file = buf_writer
            .into_inner()
            .map_err(|e| FormatError::Io(std::io::Error::other(e.to_string())))?;
        file.sync_all()?;
        info.file_size = file.metadata()?.len();

        Ok(info)
    }
}

impl MetadataWriter<Cursor<Vec<u8>>> {
    /// Create a writer that keeps the metadata in memory.
    pub fn in_memory(
        checkpoint_id: CheckpointId,
        timestamp: u64,
        compress: bool,
    ) -> Result<Self, FormatError> {
        Self::new(Cursor::new(Vec::new()), checkpoint_id, timestamp, compress)
    }

    /// Finish and return the encoded metadata bytes.
    pub fn into_bytes(self) -> Result<(Vec<u8>, MetadataFileInfo), FormatError> {
        let (cursor, info) = self.finish()?;
        Ok((cursor.into_inner(), info))
    }
}

impl<W: Write + Seek> MetadataWriter<W> {
    /// Create a writer over any seekable sink.
    ///
    /// A placeholder header is written immediately.
    pub fn new(
        mut sink: W,
        checkpoint_id: CheckpointId,
        timestamp: u64,
        compress: bool,
    ) -> Result<Self, FormatError> {
        let mut header = MetadataHeader::new(checkpoint_id, timestamp);
        header.set_compressed(compress);
        sink.write_all(&header.to_bytes())?;

        let crc_writer = CrcWriter::new(sink);
        let inner = if compress {
            WriterInner::Compressed {
                encoder: FrameEncoder::new(crc_writer),
            }
        } else {
            WriterInner::Uncompressed { writer: crc_writer }
        };

        Ok(Self {
            inner,
            header,
            operator_count: 0,
            data_size: 0,
        })
    }

    /// Write the handles of one operator.
    pub fn write_operator(
        &mut self,
        operator_id: &OperatorId,
        handles: &[StateHandle],
    ) -> Result<(), FormatError> {
        let entry = encode_entry(operator_id, handles)?;

        let writer: &mut dyn Write = match &mut self.inner {
            WriterInner::Compressed { encoder } => encoder,
            WriterInner::Uncompressed { writer } => writer,
        };
        writer.write_all(&entry)?;

        self.data_size += entry.len() as u64;
        self.operator_count += 1;
        Ok(())
    }

    /// Finish writing.
    ///
    /// This:
    /// 1. Finishes compression (if enabled)
    /// 2. Writes the CRC32 checksum of the stored data block
    /// 3. Rewrites the header with actual counts
    pub fn finish(self) -> Result<(W, MetadataFileInfo), FormatError> {
        let crc_writer = match self.inner {
            WriterInner::Compressed { encoder } => encoder
                .finish()
                .map_err(|e| FormatError::CompressionFailed(e.to_string()))?,
            WriterInner::Uncompressed { writer } => writer,
        };
        let (mut sink, crc) = crc_writer.finalize_crc();

        let end = sink.stream_position()?;
        let stored_size = end.saturating_sub(HEADER_SIZE as u64);
        sink.write_all(&crc.to_le_bytes())?;

        let mut header = self.header;
        header.operator_count = self.operator_count;
        header.data_size = self.data_size;

        sink.seek(SeekFrom::Start(0))?;
        sink.write_all(&header.to_bytes())?;
        sink.seek(SeekFrom::End(0))?;
        sink.flush()?;

        Ok((
            sink,
            MetadataFileInfo {
                checkpoint_id: header.checkpoint_id,
                operator_count: self.operator_count,
                uncompressed_size: self.data_size,
                stored_size,
                file_size: end + 4,
                checksum: crc,
            },
        ))
    }
}

/// Information about written checkpoint metadata.
#[derive(Debug, Clone)]
pub struct MetadataFileInfo {
    /// Checkpoint the metadata belongs to
    pub checkpoint_id: CheckpointId,

    /// Number of operator entries
    pub operator_count: u64,

    /// Uncompressed data block size in bytes
    pub uncompressed_size: u64,

    /// Data block size as stored (same as uncompressed if not compressed)
    pub stored_size: u64,

    /// Total size including header and checksum
    pub file_size: u64,

    /// CRC32 checksum of the stored data block
    pub checksum: u32,
}
