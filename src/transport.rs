//! The byte transport the store talks through. Ordinarily the store could
//! just use std::fs, but routing every read and append through a trait lets
//! the tests run against an in-memory filesystem and inject failures.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

pub trait Transport {
    /// Append bytes to a file, creating it if needed. Returns the offset the
    /// write started at.
    fn append(&self, path: &str, bytes: &[u8]) -> io::Result<u64>;

    /// Read a whole file.
    fn get(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Vectored read: fetch each (offset, length) range of the file. Results
    /// are returned in request order.
    fn readv(&self, path: &str, ranges: &[(u64, usize)]) -> io::Result<Vec<Vec<u8>>>;

    /// Create or replace a file.
    fn put(&self, path: &str, bytes: &[u8]) -> io::Result<()>;

    fn mkdir(&self, path: &str) -> io::Result<()>;

    fn delete(&self, path: &str) -> io::Result<()>;

    fn has(&self, path: &str) -> bool;

    /// All file paths below the transport root, relative, in no particular
    /// order.
    fn iter_files(&self) -> io::Result<Vec<String>>;
}

/// Something insert and sweep operations can report progress to.
pub trait ProgressSink {
    fn update(&mut self, msg: &str, current: usize, total: Option<usize>);
}

/// The default sink: throw it all away.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&mut self, _msg: &str, _current: usize, _total: Option<usize>) {}
}

// *** In-memory transport, the workhorse for tests.

#[derive(Default)]
pub struct MemoryTransport {
    files: RefCell<BTreeMap<String, Vec<u8>>>,
}

impl MemoryTransport {
    pub fn new() -> MemoryTransport {
        Self::default()
    }

    /// Direct mutation for corruption tests: flip a byte in place.
    pub fn corrupt_byte(&self, path: &str, offset: usize) {
        let mut files = self.files.borrow_mut();
        let data = files.get_mut(path).expect("no such file");
        data[offset] ^= 0xff;
    }

    /// Direct mutation for torn-write tests: drop the last n bytes.
    pub fn truncate_tail(&self, path: &str, n: usize) {
        let mut files = self.files.borrow_mut();
        let data = files.get_mut(path).expect("no such file");
        let new_len = data.len().saturating_sub(n);
        data.truncate(new_len);
    }

    pub fn file_len(&self, path: &str) -> Option<usize> {
        self.files.borrow().get(path).map(|d| d.len())
    }
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such file: {}", path))
}

impl Transport for MemoryTransport {
    fn append(&self, path: &str, bytes: &[u8]) -> io::Result<u64> {
        let mut files = self.files.borrow_mut();
        let data = files.entry(path.to_string()).or_default();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn get(&self, path: &str) -> io::Result<Vec<u8>> {
        self.files
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    fn readv(&self, path: &str, ranges: &[(u64, usize)]) -> io::Result<Vec<Vec<u8>>> {
        let files = self.files.borrow();
        let data = files.get(path).ok_or_else(|| not_found(path))?;
        let mut out = Vec::with_capacity(ranges.len());
        for &(offset, length) in ranges {
            let start = offset as usize;
            let end = start + length;
            if end > data.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short read of {} at {}+{}", path, offset, length),
                ));
            }
            out.push(data[start..end].to_vec());
        }
        Ok(out)
    }

    fn put(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        self.files
            .borrow_mut()
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn mkdir(&self, _path: &str) -> io::Result<()> {
        // Directories are implicit here.
        Ok(())
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        self.files
            .borrow_mut()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn has(&self, path: &str) -> bool {
        self.files.borrow().contains_key(path)
    }

    fn iter_files(&self) -> io::Result<Vec<String>> {
        Ok(self.files.borrow().keys().cloned().collect())
    }
}

// *** Local-disk transport.

pub struct FsTransport {
    base: PathBuf,
}

impl FsTransport {
    pub fn new(base: impl Into<PathBuf>) -> FsTransport {
        FsTransport { base: base.into() }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base.join(path)
    }
}

impl Transport for FsTransport {
    fn append(&self, path: &str, bytes: &[u8]) -> io::Result<u64> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.full_path(path))?;
        // tell() on freshly-opened append handles is 0 on some platforms, so
        // measure the end explicitly.
        let offset = f.seek(SeekFrom::End(0))?;
        f.write_all(bytes)?;
        Ok(offset)
    }

    fn get(&self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.full_path(path))
    }

    fn readv(&self, path: &str, ranges: &[(u64, usize)]) -> io::Result<Vec<Vec<u8>>> {
        let mut f = File::open(self.full_path(path))?;
        let mut out = Vec::with_capacity(ranges.len());
        for &(offset, length) in ranges {
            f.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; length];
            f.read_exact(&mut buf)?;
            out.push(buf);
        }
        Ok(out)
    }

    fn put(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        std::fs::write(self.full_path(path), bytes)
    }

    fn mkdir(&self, path: &str) -> io::Result<()> {
        std::fs::create_dir_all(self.full_path(path))
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        std::fs::remove_file(self.full_path(path))
    }

    fn has(&self, path: &str) -> bool {
        self.full_path(path).exists()
    }

    fn iter_files(&self) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        let mut pending = vec![self.base.clone()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.base) {
                    out.push(rel.to_string_lossy().into_owned());
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_append_returns_offsets() {
        let t = MemoryTransport::new();
        assert_eq!(t.append("a", b"hello").unwrap(), 0);
        assert_eq!(t.append("a", b"world").unwrap(), 5);
        assert_eq!(t.get("a").unwrap(), b"helloworld");
    }

    #[test]
    fn memory_readv_request_order() {
        let t = MemoryTransport::new();
        t.put("f", b"0123456789").unwrap();
        let got = t.readv("f", &[(6, 2), (0, 3)]).unwrap();
        assert_eq!(got, vec![b"67".to_vec(), b"012".to_vec()]);
    }

    #[test]
    fn memory_missing_file() {
        let t = MemoryTransport::new();
        let err = t.get("nope").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let t = FsTransport::new(dir.path());
        assert_eq!(t.append("data.knit", b"abc").unwrap(), 0);
        assert_eq!(t.append("data.knit", b"def").unwrap(), 3);
        assert_eq!(t.get("data.knit").unwrap(), b"abcdef");
        let got = t.readv("data.knit", &[(3, 3), (0, 1)]).unwrap();
        assert_eq!(got, vec![b"def".to_vec(), b"a".to_vec()]);
    }
}
