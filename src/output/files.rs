//! File manager for side-channel sinks (SMB carves, VoIP payloads, OSPF
//! rows, auth lines).
//!
//! Open descriptors are amortized through an LRU cache: the hot few stay
//! open, everything else is transparently reopened on demand with
//! seek-to-offset semantics, so a capture touching thousands of carved files
//! never exhausts the descriptor limit. Peak concurrent descriptors are
//! tracked for the end-of-run report.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;

use crate::AnalyzerError;

pub struct FileManager {
    cache: LruCache<PathBuf, File>,
    peak_open: usize,
}

impl std::fmt::Debug for FileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileManager")
            .field("open", &self.cache.len())
            .field("peak_open", &self.peak_open)
            .finish()
    }
}

impl FileManager {
    pub fn new(max_open: usize) -> Result<FileManager, AnalyzerError> {
        let cap = NonZeroUsize::new(max_open).ok_or(AnalyzerError::InvalidConfig {
            context: "file manager capacity must be non-zero".into(),
        })?;
        Ok(FileManager { cache: LruCache::new(cap), peak_open: 0 })
    }

    fn open(&mut self, path: &Path) -> Result<&mut File, AnalyzerError> {
        if !self.cache.contains(path) {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(|e| AnalyzerError::Io {
                    context: format!("creating {}", parent.display()),
                    source: e,
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(false)
                .write(true)
                .read(true)
                .truncate(false)
                .open(path)
                .map_err(|e| AnalyzerError::Io {
                    context: format!("opening {}", path.display()),
                    source: e,
                })?;
            self.cache.put(path.to_path_buf(), file);
            self.peak_open = self.peak_open.max(self.cache.len());
        }
        self.cache
            .get_mut(path)
            .ok_or(AnalyzerError::InvalidConfig { context: "fd cache miss after insert".into() })
    }

    /// Write `bytes` at `offset`, extending the file as needed.
    pub fn write_at(&mut self, path: &Path, offset: u64, bytes: &[u8]) -> Result<(), AnalyzerError> {
        let file = self.open(path)?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| AnalyzerError::Io {
            context: format!("seeking {}", path.display()),
            source: e,
        })?;
        file.write_all(bytes).map_err(|e| AnalyzerError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })
    }

    /// Append raw bytes at the end of the file.
    pub fn append_bytes(&mut self, path: &Path, bytes: &[u8]) -> Result<(), AnalyzerError> {
        let file = self.open(path)?;
        file.seek(SeekFrom::End(0)).map_err(|e| AnalyzerError::Io {
            context: format!("seeking {}", path.display()),
            source: e,
        })?;
        file.write_all(bytes).map_err(|e| AnalyzerError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })
    }

    /// Append one text line at the end of the file.
    pub fn append_line(&mut self, path: &Path, line: &str) -> Result<(), AnalyzerError> {
        let file = self.open(path)?;
        file.seek(SeekFrom::End(0)).map_err(|e| AnalyzerError::Io {
            context: format!("seeking {}", path.display()),
            source: e,
        })?;
        writeln!(file, "{line}").map_err(|e| AnalyzerError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })
    }

    pub fn peak_open(&self) -> usize {
        self.peak_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_reopen_preserves_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = FileManager::new(2).unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let c = dir.path().join("c.bin");
        fm.write_at(&a, 0, b"hello").unwrap();
        fm.write_at(&b, 0, b"x").unwrap();
        fm.write_at(&c, 0, b"y").unwrap(); // evicts a
        fm.write_at(&a, 5, b" world").unwrap(); // reopened, not truncated
        assert_eq!(std::fs::read(&a).unwrap(), b"hello world");
        assert_eq!(fm.peak_open(), 2);
    }

    #[test]
    fn sparse_offsets_are_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = FileManager::new(4).unwrap();
        let f = dir.path().join("sparse.bin");
        fm.write_at(&f, 4, b"zz").unwrap();
        let data = std::fs::read(&f).unwrap();
        assert_eq!(data, &[0, 0, 0, 0, b'z', b'z']);
    }
}
