//! The index half of a knit: a persistent map from key to storage method,
//! data location, parents and flags. Two interchangeable back-ends implement
//! one contract; the store never cares which it is talking to.

pub mod graph;
pub mod kndx;

use std::collections::{HashMap, HashSet};

use crate::content::Method;
use crate::error::Result;
use crate::key::{Key, ParentKeys};

pub use graph::{InMemoryGraphIndex, KnitGraphIndex};
pub use kndx::KndxIndex;

/// Which byte run a record lives in. The index only remembers the bucket;
/// the data access layer turns it into an actual file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    /// Records filed per key prefix (`<mapped prefix>.knit`).
    Prefix(Vec<Vec<u8>>),
    /// Records in a named pack container.
    Container(String),
}

/// Where to find one raw record: bucket, byte offset, byte length. Ordering
/// is (bucket, offset), which is exactly the grouping wanted for vectored
/// reads.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessMemo {
    pub bucket: Bucket,
    pub offset: u64,
    pub length: usize,
}

/// The options stored with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOptions {
    pub method: Method,
    pub no_eol: bool,
}

/// One entry handed to `add_records`.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub key: Key,
    pub options: RecordOptions,
    pub memo: AccessMemo,
    pub parents: ParentKeys,
}

/// Everything needed to schedule reconstruction of one key.
#[derive(Debug, Clone)]
pub struct BuildDetails {
    pub memo: AccessMemo,
    /// The record this one's delta applies against; None for fulltexts.
    pub compression_parent: Option<Key>,
    pub parents: ParentKeys,
    pub method: Method,
    pub no_eol: bool,
}

/// Tracks which referenced keys are still unsatisfied: a reference is
/// satisfied the moment the referenced key itself is added. Used to find
/// parents a write group still owes.
#[derive(Debug, Default)]
pub struct KeyRefs {
    /// key -> set of keys referring to it.
    refs: HashMap<Key, HashSet<Key>>,
}

impl KeyRefs {
    pub fn new() -> KeyRefs {
        KeyRefs::default()
    }

    pub fn clear(&mut self) {
        self.refs.clear();
    }

    /// Record that `key` references `refs`, and that `key` itself now
    /// exists.
    pub fn add_references<'a>(&mut self, key: &Key, refs: impl IntoIterator<Item = &'a Key>) {
        for referenced in refs {
            self.refs
                .entry(referenced.clone())
                .or_default()
                .insert(key.clone());
        }
        self.add_key(key);
    }

    pub fn add_key(&mut self, key: &Key) {
        self.refs.remove(key);
    }

    pub fn satisfy_refs_for_keys<'a>(&mut self, keys: impl IntoIterator<Item = &'a Key>) {
        for key in keys {
            self.refs.remove(key);
        }
    }

    pub fn get_unsatisfied_refs(&self) -> Vec<Key> {
        self.refs.keys().cloned().collect()
    }

    pub fn get_referrers(&self) -> HashSet<Key> {
        self.refs.values().flatten().cloned().collect()
    }
}

pub trait KnitIndex {
    /// Add records to the index. `random_id` promises the keys were freshly
    /// generated, allowing duplicate checks to be skipped.
    /// `missing_compression_parents` marks records whose delta basis has not
    /// arrived yet; back-ends that cannot hold such records must refuse.
    fn add_records(
        &self,
        records: Vec<IndexRecord>,
        random_id: bool,
        missing_compression_parents: bool,
    ) -> Result<()>;

    /// Parents for each requested key. Absent keys are simply absent from
    /// the result.
    fn get_parent_map(&self, keys: &[Key]) -> Result<HashMap<Key, ParentKeys>>;

    /// Build details for each requested key; ghosts are omitted.
    fn get_build_details(&self, keys: &[Key]) -> Result<HashMap<Key, BuildDetails>>;

    fn get_method(&self, key: &Key) -> Result<Method>;

    fn get_options(&self, key: &Key) -> Result<RecordOptions>;

    fn get_position(&self, key: &Key) -> Result<AccessMemo>;

    fn keys(&self) -> Result<HashSet<Key>>;

    /// Walk the ancestry of `keys` through this index. Returns the parent
    /// map found and the keys (including ancestors) that were missing.
    fn find_ancestry(&self, keys: &[Key]) -> Result<(HashMap<Key, ParentKeys>, HashSet<Key>)> {
        let mut parent_map = HashMap::new();
        let mut missing = HashSet::new();
        let mut pending: Vec<Key> = keys.to_vec();
        while let Some(key) = pending.pop() {
            if parent_map.contains_key(&key) || missing.contains(&key) {
                continue;
            }
            let found = self.get_parent_map(std::slice::from_ref(&key))?;
            match found.into_iter().next() {
                Some((key, parents)) => {
                    pending.extend(
                        parents
                            .iter()
                            .filter(|p| !parent_map.contains_key(*p))
                            .cloned(),
                    );
                    parent_map.insert(key, parents);
                }
                None => {
                    missing.insert(key);
                }
            }
        }
        Ok((parent_map, missing))
    }

    /// Delta bases that are still unresolved after stream inserts or index
    /// scans. Only the graph back-end can track these.
    fn missing_compression_parents(&self) -> Vec<Key>;

    /// Whether this index stores a parent graph at all. Without one, streams
    /// fall back to unordered.
    fn has_graph(&self) -> bool;

    fn contains_key(&self, key: &Key) -> Result<bool> {
        Ok(!self.get_parent_map(std::slice::from_ref(key))?.is_empty())
    }
}
