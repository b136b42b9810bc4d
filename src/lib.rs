//! An append-only store for many versioned texts, kept compact by storing
//! most versions as line deltas against an ancestor. A store is a pair of
//! structures: an index mapping keys to (method, location, parents, flags)
//! and a data file of gzip-framed records. On top of that sit delta-chain
//! reconstruction, record streams for replication, multi-parent diffs and
//! an annotator.

pub mod access;
pub mod adapters;
pub mod annotate;
pub mod codec;
pub mod content;
pub mod delta;
pub mod diff;
pub mod error;
pub mod graph;
pub mod index;
pub mod key;
pub mod multiparent;
pub mod store;
pub mod stream;
pub mod transport;

pub use codec::Digest;
pub use content::{ContentKind, KnitContent, Method};
pub use error::{Error, Result};
pub use key::{ConstantMapper, HashPrefixMapper, Key, KeyMapper, ParentKeys, PrefixMapper};
pub use multiparent::MultiParent;
pub use store::{AddResult, KnitStore, MpDiffRecord, Ordering};
pub use stream::{filter_absent, ContentFactory, FactoryBytes, NetworkRecordStream, StorageKind};
pub use transport::{FsTransport, MemoryTransport, NoProgress, ProgressSink, Transport};
