//! Local save destination for downloaded content.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::MEMORY_BUFFER_LIMIT;

/// Where the bytes of a finished download ended up.
#[derive(Debug)]
pub enum SavedContent {
    Memory(Vec<u8>),
    File(PathBuf),
}

enum SinkInner {
    Memory(Vec<u8>),
    File { file: File, path: PathBuf },
}

/// Streaming save sink.
///
/// Small downloads buffer fully in memory; anything above
/// [`MEMORY_BUFFER_LIMIT`] streams incrementally to a spool file. The choice
/// is made once, from the known size, at open time.
pub struct SaveSink {
    inner: SinkInner,
    written: u64,
}

impl SaveSink {
    /// Opens a sink for a download of known `size`.
    pub fn for_size(size: u64, spool_dir: &Path, filename: &str) -> io::Result<Self> {
        if size <= MEMORY_BUFFER_LIMIT {
            Ok(Self::in_memory())
        } else {
            std::fs::create_dir_all(spool_dir)?;
            let path = spool_dir.join(filename);
            let file = File::create(&path)?;
            Ok(Self {
                inner: SinkInner::File { file, path },
                written: 0,
            })
        }
    }

    pub fn in_memory() -> Self {
        Self {
            inner: SinkInner::Memory(Vec::new()),
            written: 0,
        }
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.inner {
            SinkInner::Memory(buf) => buf.extend_from_slice(data),
            SinkInner::File { file, .. } => file.write_all(data)?,
        }
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self.inner, SinkInner::Memory(_))
    }

    /// Flushes and hands back the content.
    pub fn finish(self) -> io::Result<SavedContent> {
        match self.inner {
            SinkInner::Memory(buf) => Ok(SavedContent::Memory(buf)),
            SinkInner::File { mut file, path } => {
                file.flush()?;
                Ok(SavedContent::File(path))
            }
        }
    }

    /// Drops partial output. Buffered bytes are freed; a spool file is
    /// removed from disk.
    pub fn discard(self) -> io::Result<()> {
        match self.inner {
            SinkInner::Memory(_) => Ok(()),
            SinkInner::File { file, path } => {
                drop(file);
                std::fs::remove_file(path)
            }
        }
    }
}

impl Write for SaveSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            SinkInner::Memory(_) => Ok(()),
            SinkInner::File { file, .. } => file.flush(),
        }
    }
}
