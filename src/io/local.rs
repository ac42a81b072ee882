use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

use super::{ReadAt, check_bounds};
use crate::error::SourceError;

/// Local file reader with random access support
pub struct LocalFileReader {
    file: std::fs::File,
    size: u64,
    path: String,
}

impl LocalFileReader {
    pub fn new(path: &Path) -> Result<Self, SourceError> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            path: path.display().to_string(),
        })
    }
}

#[async_trait]
impl ReadAt for LocalFileReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, SourceError> {
        check_bounds(offset, len, self.size)?;
        let mut buf = vec![0u8; len];

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_exact_at(&mut buf, offset)?;
        }

        #[cfg(windows)]
        {
            // seek_read moves the handle's cursor but never depends on it
            use std::os::windows::fs::FileExt;
            let mut filled = 0;
            while filled < len {
                let n = self
                    .file
                    .seek_read(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    return Err(SourceError::ShortRead {
                        offset,
                        expected: len as u64,
                        actual: filled as u64,
                    });
                }
                filled += n;
            }
        }

        Ok(Bytes::from(buf))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.path
    }
}
