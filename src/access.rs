//! Moving raw record bytes in and out of the transport. Two shapes: per
//! prefix `.knit` files addressed straight from keys, and named pack
//! containers written once and read many times. Reads are vectored per
//! file, and results always come back in request order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::index::{AccessMemo, Bucket};
use crate::key::{Key, KeyMapper};
use crate::transport::Transport;

const DATA_SUFFIX: &str = ".knit";

pub trait DataAccess {
    /// Append one record's bytes, returning the memo the index should store.
    fn add_raw_record(&self, key: &Key, size: usize, chunks: &[Vec<u8>]) -> Result<AccessMemo>;

    /// Fetch raw record bytes for each memo, in request order.
    fn get_raw_records(&self, memos: &[AccessMemo]) -> Result<Vec<Vec<u8>>>;

    /// Push any buffered writes to the transport.
    fn flush(&self) -> Result<()>;

    /// Called by the stream layer when a read failed with
    /// `RetryWithNewPacks`. Returns Ok if the container listing was reloaded
    /// and the request should be retried; otherwise the error propagates.
    fn reload_or_raise(&self, err: Error) -> Result<()> {
        Err(err)
    }
}

/// Group consecutive memos sharing a bucket, preserving request order across
/// groups.
fn consecutive_groups(memos: &[AccessMemo]) -> Vec<(&Bucket, Vec<(u64, usize)>)> {
    let mut groups: Vec<(&Bucket, Vec<(u64, usize)>)> = Vec::new();
    for memo in memos {
        match groups.last_mut() {
            Some((bucket, ranges)) if **bucket == memo.bucket => {
                ranges.push((memo.offset, memo.length));
            }
            _ => groups.push((&memo.bucket, vec![(memo.offset, memo.length)])),
        }
    }
    groups
}

/// Access to records in per-prefix `.knit` files.
pub struct KnitKeyAccess {
    transport: Rc<dyn Transport>,
    mapper: Rc<dyn KeyMapper>,
}

impl KnitKeyAccess {
    pub fn new(transport: Rc<dyn Transport>, mapper: Rc<dyn KeyMapper>) -> KnitKeyAccess {
        KnitKeyAccess { transport, mapper }
    }

    fn data_path(&self, prefix: &[Vec<u8>]) -> String {
        format!("{}{}", self.mapper.map(prefix), DATA_SUFFIX)
    }
}

impl DataAccess for KnitKeyAccess {
    fn add_raw_record(&self, key: &Key, size: usize, chunks: &[Vec<u8>]) -> Result<AccessMemo> {
        let path = self.data_path(key.prefix());
        let data: Vec<u8> = chunks.concat();
        debug_assert_eq!(data.len(), size);
        let offset = match self.transport.append(&path, &data) {
            Ok(offset) => offset,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Missing parent directory; create and go again.
                if let Some(dir) = path.rsplit_once('/').map(|(d, _)| d) {
                    self.transport.mkdir(dir)?;
                }
                self.transport.append(&path, &data)?
            }
            Err(e) => return Err(e.into()),
        };
        trace!("appended {} bytes for {} at {}", size, key, offset);
        Ok(AccessMemo {
            bucket: Bucket::Prefix(key.prefix().to_vec()),
            offset,
            length: size,
        })
    }

    fn get_raw_records(&self, memos: &[AccessMemo]) -> Result<Vec<Vec<u8>>> {
        let mut result = Vec::with_capacity(memos.len());
        for (bucket, ranges) in consecutive_groups(memos) {
            let Bucket::Prefix(prefix) = bucket else {
                return Err(Error::corrupt(
                    "access",
                    "container memo handed to key-based access",
                ));
            };
            let path = self.data_path(prefix);
            result.extend(self.transport.readv(&path, &ranges)?);
        }
        Ok(result)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

struct PackWriter {
    container: String,
    path: String,
    /// Offset in the container file where the buffer will land.
    base: u64,
    buffer: Vec<u8>,
}

/// Access to records spread over named pack containers. Writes go through a
/// single write-once writer; reads resolve container names to paths through
/// a table that a concurrent repack may swap out underneath us, in which
/// case the reader gets `RetryWithNewPacks` and the caller-supplied reload
/// closure decides whether a retry is worthwhile.
pub struct PackAccess {
    transport: Rc<dyn Transport>,
    containers: RefCell<HashMap<String, String>>,
    writer: RefCell<Option<PackWriter>>,
    reload_func: Option<Box<dyn Fn() -> Result<bool>>>,
}

impl PackAccess {
    pub fn new(
        transport: Rc<dyn Transport>,
        reload_func: Option<Box<dyn Fn() -> Result<bool>>>,
    ) -> PackAccess {
        PackAccess {
            transport,
            containers: RefCell::new(HashMap::new()),
            writer: RefCell::new(None),
            reload_func,
        }
    }

    /// Register a container name to path mapping, replacing the previous
    /// set. This is what a repack calls after rewriting containers.
    pub fn set_containers(&self, containers: HashMap<String, String>) {
        *self.containers.borrow_mut() = containers;
    }

    pub fn add_container(&self, name: impl Into<String>, path: impl Into<String>) {
        self.containers.borrow_mut().insert(name.into(), path.into());
    }

    /// Open the write-once writer for a new container. Records buffer in
    /// memory until `flush`.
    pub fn set_writer(&self, name: impl Into<String>, path: impl Into<String>) -> Result<()> {
        let name = name.into();
        let path = path.into();
        // Measure the current end of file so buffered offsets are final.
        let base = self.transport.append(&path, b"")?;
        self.add_container(name.clone(), path.clone());
        *self.writer.borrow_mut() = Some(PackWriter {
            container: name,
            path,
            base,
            buffer: Vec::new(),
        });
        Ok(())
    }

    pub fn clear_writer(&self) -> Result<()> {
        self.flush()?;
        *self.writer.borrow_mut() = None;
        Ok(())
    }

    fn retry_or(&self, err: Error) -> Error {
        if self.reload_func.is_some() {
            Error::RetryWithNewPacks {
                context: err.to_string(),
            }
        } else {
            err
        }
    }
}

impl DataAccess for PackAccess {
    fn add_raw_record(&self, _key: &Key, size: usize, chunks: &[Vec<u8>]) -> Result<AccessMemo> {
        let mut writer = self.writer.borrow_mut();
        let writer = writer.as_mut().ok_or(Error::ReadOnly)?;
        let offset = writer.base + writer.buffer.len() as u64;
        for chunk in chunks {
            writer.buffer.extend_from_slice(chunk);
        }
        debug_assert_eq!(offset + size as u64, writer.base + writer.buffer.len() as u64);
        Ok(AccessMemo {
            bucket: Bucket::Container(writer.container.clone()),
            offset,
            length: size,
        })
    }

    fn get_raw_records(&self, memos: &[AccessMemo]) -> Result<Vec<Vec<u8>>> {
        // Reads may touch records still sitting in the writer's buffer.
        self.flush()?;
        let containers = self.containers.borrow();
        let mut result = Vec::with_capacity(memos.len());
        for (bucket, ranges) in consecutive_groups(memos) {
            let Bucket::Container(name) = bucket else {
                return Err(Error::corrupt(
                    "access",
                    "prefix memo handed to pack access",
                ));
            };
            let Some(path) = containers.get(name) else {
                return Err(self.retry_or(Error::corrupt(
                    "access",
                    format!("unknown container {}", name),
                )));
            };
            match self.transport.readv(path, &ranges) {
                Ok(chunks) => result.extend(chunks),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(self.retry_or(e.into()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(result)
    }

    fn flush(&self) -> Result<()> {
        let mut writer = self.writer.borrow_mut();
        if let Some(writer) = writer.as_mut() {
            if !writer.buffer.is_empty() {
                let wrote_at = self.transport.append(&writer.path, &writer.buffer)?;
                debug_assert_eq!(wrote_at, writer.base);
                writer.base += writer.buffer.len() as u64;
                writer.buffer.clear();
            }
        }
        Ok(())
    }

    fn reload_or_raise(&self, err: Error) -> Result<()> {
        match (&err, &self.reload_func) {
            (Error::RetryWithNewPacks { context }, Some(reload)) => {
                if reload()? {
                    debug!("container listing reloaded, retrying {}", context);
                    Ok(())
                } else {
                    Err(err)
                }
            }
            _ => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ConstantMapper;
    use crate::transport::MemoryTransport;

    fn key(s: &str) -> Key {
        Key::from_slices(&[s.as_bytes()])
    }

    #[test]
    fn key_access_round_trip() {
        let transport = Rc::new(MemoryTransport::new());
        let access = KnitKeyAccess::new(
            transport,
            Rc::new(ConstantMapper("data".to_string())),
        );
        let m1 = access
            .add_raw_record(&key("r0"), 5, &[b"hello".to_vec()])
            .unwrap();
        let m2 = access
            .add_raw_record(&key("r1"), 5, &[b"wo".to_vec(), b"rld".to_vec()])
            .unwrap();
        assert_eq!(m1.offset, 0);
        assert_eq!(m2.offset, 5);
        // Out of order request comes back in request order.
        let got = access.get_raw_records(&[m2, m1]).unwrap();
        assert_eq!(got, vec![b"world".to_vec(), b"hello".to_vec()]);
    }

    #[test]
    fn pack_access_buffers_until_flush() {
        let transport = Rc::new(MemoryTransport::new());
        let access = PackAccess::new(transport.clone(), None);
        access.set_writer("pack-0", "packs/pack-0.pack").unwrap();
        let memo = access
            .add_raw_record(&key("r0"), 4, &[b"data".to_vec()])
            .unwrap();
        assert_eq!(transport.file_len("packs/pack-0.pack"), Some(0));
        // Reading forces the flush.
        let got = access.get_raw_records(std::slice::from_ref(&memo)).unwrap();
        assert_eq!(got, vec![b"data".to_vec()]);
        assert_eq!(transport.file_len("packs/pack-0.pack"), Some(4));
    }

    #[test]
    fn pack_access_without_writer_is_read_only() {
        let access = PackAccess::new(Rc::new(MemoryTransport::new()), None);
        assert!(matches!(
            access.add_raw_record(&key("r0"), 1, &[b"x".to_vec()]),
            Err(Error::ReadOnly)
        ));
    }

    #[test]
    fn vanished_container_raises_retry_when_reloadable() {
        let transport = Rc::new(MemoryTransport::new());
        let access = PackAccess::new(transport, Some(Box::new(|| Ok(false))));
        access.add_container("pack-0", "packs/gone.pack");
        let memo = AccessMemo {
            bucket: Bucket::Container("pack-0".to_string()),
            offset: 0,
            length: 4,
        };
        let err = access.get_raw_records(&[memo]).unwrap_err();
        assert!(matches!(err, Error::RetryWithNewPacks { .. }));
        // Reload declines, so the error sticks.
        assert!(access.reload_or_raise(err).is_err());
    }
}
