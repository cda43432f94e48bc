//! Output sinks for downloads and input sources for uploads. Grounded on
//! `drop_transfer::file::reader::path::FileReader`'s plain
//! `tokio::fs`-backed read loop, mirrored here for both directions of
//! I/O and behind an async trait so callers can also hand in an
//! in-memory or test double (spec §4.1 "to-sink" entry point).

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::SoulseekError;

#[async_trait]
pub trait DownloadSink: Send {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Current write position, used for the final progress/metrics
    /// capture (spec §4.2(k)). A failure here is swallowed by the
    /// orchestrator and surfaced only as a diagnostic (spec §4.2(l)).
    async fn position(&mut self) -> io::Result<u64>;

    /// Flush and close, invoked only when
    /// `dispose_output_stream_on_completion` is set (spec §4.2(k)).
    async fn flush_and_close(&mut self) -> io::Result<()>;
}

/// Invoked exactly once, inside the orchestrator, immediately before
/// entering `Initializing` — so a failure earlier in negotiation never
/// creates a zero-byte file (spec §5 resource discipline). A trait
/// object rather than a plain closure because opening typically needs to
/// be async (file creation, directory creation, ...).
#[async_trait]
pub trait SinkFactory: Send {
    async fn open(self: Box<Self>) -> Result<Box<dyn DownloadSink>, SoulseekError>;
}

pub struct FileSink {
    file: tokio::fs::File,
}

#[async_trait]
impl DownloadSink for FileSink {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf).await
    }

    async fn position(&mut self) -> io::Result<u64> {
        self.file.stream_position().await
    }

    async fn flush_and_close(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.shutdown().await
    }
}

/// `SinkFactory` for the "to-path" download entry point (spec §4.1).
/// Validated to be non-empty at API entry, but the file itself is not
/// created until `open` is called.
pub struct PathSinkFactory {
    pub path: PathBuf,
}

#[async_trait]
impl SinkFactory for PathSinkFactory {
    async fn open(self: Box<Self>) -> Result<Box<dyn DownloadSink>, SoulseekError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(crate::error::ConnectionError::from)?;
        Ok(Box::new(FileSink { file }))
    }
}

#[async_trait]
pub trait UploadSource: Send {
    /// Reads up to `buf.len()` bytes; `Ok(0)` signals EOF.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Lazily opens an upload source and reports its total size in the same
/// call, so the Upload Orchestrator can reply with an authoritative
/// `TransferResponse.size` without a separate stat before admission (spec
/// §4.3 mirrors §5's "factory called once" resource discipline).
#[async_trait]
pub trait SourceFactory: Send {
    async fn open(self: Box<Self>) -> Result<(Box<dyn UploadSource>, u64), SoulseekError>;
}

/// `SourceFactory` for the "from-path" upload entry point.
pub struct PathSourceFactory {
    pub path: PathBuf,
}

#[async_trait]
impl SourceFactory for PathSourceFactory {
    async fn open(self: Box<Self>) -> Result<(Box<dyn UploadSource>, u64), SoulseekError> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(crate::error::ConnectionError::from)?;
        let source = FileSource::open(self.path.clone())
            .await
            .map_err(crate::error::ConnectionError::from)?;
        Ok((Box::new(source), metadata.len()))
    }
}

pub struct FileSource {
    file: tokio::fs::File,
}

impl FileSource {
    pub async fn open(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path).await?;
        Ok(Self { file })
    }
}

#[async_trait]
impl UploadSource for FileSource {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf).await
    }
}

/// In-memory sink/source/factory used by tests (spec §8 scenarios). The
/// buffer lives behind a shared `Arc<Mutex<_>>` so the test harness keeps
/// a handle it can inspect after the orchestrator (and the `SinkFactory`
/// it owns) has run to completion.
#[cfg(any(test, feature = "test-util"))]
pub struct MemorySink {
    pub buffer: std::sync::Arc<tokio::sync::Mutex<Vec<u8>>>,
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl DownloadSink for MemorySink {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.buffer.lock().await.extend_from_slice(buf);
        Ok(())
    }

    async fn position(&mut self) -> io::Result<u64> {
        Ok(self.buffer.lock().await.len() as u64)
    }

    async fn flush_and_close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A `SinkFactory` that hands out a `MemorySink` backed by a buffer the
/// caller already holds a handle to.
#[cfg(any(test, feature = "test-util"))]
pub struct MemorySinkFactory {
    pub buffer: std::sync::Arc<tokio::sync::Mutex<Vec<u8>>>,
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl SinkFactory for MemorySinkFactory {
    async fn open(self: Box<Self>) -> Result<Box<dyn DownloadSink>, SoulseekError> {
        Ok(Box::new(MemorySink { buffer: self.buffer }))
    }
}

#[cfg(any(test, feature = "test-util"))]
pub struct MemorySource {
    pub data: Vec<u8>,
    pub pos: usize,
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl UploadSource for MemorySource {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub struct MemorySourceFactory {
    pub data: Vec<u8>,
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl SourceFactory for MemorySourceFactory {
    async fn open(self: Box<Self>) -> Result<(Box<dyn UploadSource>, u64), SoulseekError> {
        let size = self.data.len() as u64;
        Ok((Box::new(MemorySource { data: self.data, pos: 0 }), size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_accumulates_writes() {
        let buffer = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mut sink = MemorySink { buffer: buffer.clone() };
        sink.write_all(&[0xDE, 0xAD]).await.unwrap();
        sink.write_all(&[0xBE, 0xEF]).await.unwrap();
        assert_eq!(*buffer.lock().await, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(sink.position().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn memory_source_reads_until_exhausted() {
        let mut source = MemorySource { data: vec![1, 2, 3], pos: 0 };
        let mut buf = [0u8; 2];
        assert_eq!(source.read(&mut buf).await.unwrap(), 2);
        assert_eq!(source.read(&mut buf).await.unwrap(), 1);
        assert_eq!(source.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn path_sink_factory_does_not_create_file_before_open_is_called() {
        let dir = std::env::temp_dir().join(format!("slsk-transfer-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("not-yet-created.bin");

        let factory = Box::new(PathSinkFactory { path: path.clone() });
        assert!(!path.exists());

        let mut sink = factory.open().await.unwrap();
        sink.write_all(b"hi").await.unwrap();
        assert!(path.exists());

        tokio::fs::remove_file(&path).await.unwrap();
        tokio::fs::remove_dir(&dir).await.unwrap();
    }
}
