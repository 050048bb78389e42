use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;

/// Future returned by [`ByteSource::read_range`].
pub type ReadFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, TransferError>> + Send + 'a>>;

/// Addressable binary blob with a known length.
///
/// The upload pipeline only ever asks for `[start, end)` slices, so a
/// source can be a file on disk, an in-memory buffer, or anything else
/// that can serve ranged reads.
pub trait ByteSource: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Returns `true` if the source holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads bytes `[start, end)`. `end` is clamped to [`len`](Self::len).
    fn read_range(&self, start: u64, end: u64) -> ReadFuture<'_>;
}

fn clamp_range(start: u64, end: u64, len: u64) -> Result<(u64, u64), TransferError> {
    let end = end.min(len);
    if start > end {
        return Err(TransferError::InvalidRange { start, end, len });
    }
    Ok((start, end))
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// Byte source backed by an owned buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, start: u64, end: u64) -> ReadFuture<'_> {
        Box::pin(async move {
            let (start, end) = clamp_range(start, end, self.len())?;
            Ok(self.data[start as usize..end as usize].to_vec())
        })
    }
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// Byte source reading ranges from a file on disk.
///
/// The length is captured when the source is opened; the file is
/// reopened for every read so the source holds no descriptor while idle.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Opens `path` and records its current size.
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            len: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, start: u64, end: u64) -> ReadFuture<'_> {
        Box::pin(async move {
            let (start, end) = clamp_range(start, end, self.len)?;
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(start)).await?;
            let mut buf = vec![0u8; (end - start) as usize];
            file.read_exact(&mut buf).await?;
            Ok(buf)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn memory_source_reads_ranges() {
        let src = MemorySource::new(b"0123456789".to_vec());
        assert_eq!(src.len(), 10);
        assert_eq!(src.read_range(2, 5).await.unwrap(), b"234");
        // End is clamped.
        assert_eq!(src.read_range(8, 100).await.unwrap(), b"89");
        assert!(src.read_range(10, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_source_rejects_start_past_end() {
        let src = MemorySource::new(b"abc".to_vec());
        let err = src.read_range(5, 9).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidRange { start: 5, .. }));
    }

    #[tokio::test]
    async fn file_source_reads_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"AABBCCDDEE").unwrap();
        drop(f);

        let src = FileSource::open(&path).await.unwrap();
        assert_eq!(src.len(), 10);
        assert!(!src.is_empty());
        assert_eq!(src.read_range(4, 8).await.unwrap(), b"CCDD");
        assert_eq!(src.read_range(8, 64).await.unwrap(), b"EE");
    }

    #[tokio::test]
    async fn file_source_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileSource::open(&dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }
}
