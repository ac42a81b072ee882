use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::RandomAccessSink;

/// Output file written with positioned writes
pub struct FileSink {
    file: std::fs::File,
    path: PathBuf,
}

impl FileSink {
    /// Create the output file, truncating any existing content
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RandomAccessSink for FileSink {
    async fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.write_all_at(data, offset)?;
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut written = 0;
            while written < data.len() {
                let n = self
                    .file
                    .seek_write(&data[written..], offset + written as u64)?;
                if n == 0 {
                    return Err(std::io::ErrorKind::WriteZero.into());
                }
                written += n;
            }
        }

        Ok(data.len())
    }

    async fn flush(&self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}

/// In-memory sink, mostly useful for tests and dry comparisons
#[derive(Default)]
pub struct MemorySink {
    buf: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the bytes written so far
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.buf.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RandomAccessSink for MemorySink {
    async fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| std::io::Error::other("offset exceeds addressable memory"))?;
        let end = start + data.len();

        let mut buf = self.lock();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    async fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}
