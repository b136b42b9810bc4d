//! The graph index back-end: knit records layered over an immutable
//! graph-index structure, as used by pack repositories. Each node's value is
//! `[N| ]<offset> <length>` (a leading `N` meaning no final newline); the
//! first reference list holds the parents, and when deltas are enabled a
//! second list holds the compression parent (zero or one entries).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::debug;
use smallvec::SmallVec;

use crate::content::Method;
use crate::error::{Error, Result};
use crate::key::{Key, ParentKeys};

use super::{AccessMemo, Bucket, BuildDetails, IndexRecord, KeyRefs, KnitIndex, RecordOptions};

/// A node: opaque value bytes plus reference lists of keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub value: Vec<u8>,
    pub refs: Vec<ParentKeys>,
}

/// The minimal graph-index contract the knit layer needs: add nodes, look
/// nodes up, enumerate, and report dangling references.
#[derive(Debug, Default)]
pub struct InMemoryGraphIndex {
    nodes: RefCell<HashMap<Key, GraphNode>>,
    reference_lists: usize,
}

impl InMemoryGraphIndex {
    pub fn new(reference_lists: usize) -> InMemoryGraphIndex {
        InMemoryGraphIndex {
            nodes: RefCell::new(HashMap::new()),
            reference_lists,
        }
    }

    pub fn reference_lists(&self) -> usize {
        self.reference_lists
    }

    pub fn add_nodes(&self, nodes: Vec<(Key, Vec<u8>, Vec<ParentKeys>)>) {
        let mut map = self.nodes.borrow_mut();
        for (key, value, refs) in nodes {
            debug_assert_eq!(refs.len(), self.reference_lists);
            map.insert(key, GraphNode { value, refs });
        }
    }

    pub fn get(&self, key: &Key) -> Option<GraphNode> {
        self.nodes.borrow().get(key).cloned()
    }

    pub fn keys(&self) -> HashSet<Key> {
        self.nodes.borrow().keys().cloned().collect()
    }

    pub fn all_nodes(&self) -> Vec<(Key, GraphNode)> {
        self.nodes
            .borrow()
            .iter()
            .map(|(k, n)| (k.clone(), n.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    /// Keys referenced from list `ref_list` that have no node of their own.
    pub fn external_references(&self, ref_list: usize) -> HashSet<Key> {
        let nodes = self.nodes.borrow();
        let mut result = HashSet::new();
        for node in nodes.values() {
            if let Some(refs) = node.refs.get(ref_list) {
                for key in refs.iter() {
                    if !nodes.contains_key(key) {
                        result.insert(key.clone());
                    }
                }
            }
        }
        result
    }
}

pub struct KnitGraphIndex {
    graph: Rc<InMemoryGraphIndex>,
    /// The container new records are filed under; memos resolve through the
    /// data access layer's container table.
    container: String,
    deltas: bool,
    parents: bool,
    writable: bool,
    missing_compression_parents: RefCell<HashSet<Key>>,
    /// When enabled, every parent reference of an added record is tracked
    /// until the referenced key arrives itself.
    key_dependencies: Option<RefCell<KeyRefs>>,
}

impl KnitGraphIndex {
    pub fn new(
        graph: Rc<InMemoryGraphIndex>,
        container: impl Into<String>,
        deltas: bool,
        parents: bool,
        writable: bool,
    ) -> Result<KnitGraphIndex> {
        if deltas && !parents {
            return Err(Error::corrupt(
                "graph-index",
                "cannot do delta compression without parent tracking",
            ));
        }
        Ok(KnitGraphIndex {
            graph,
            container: container.into(),
            deltas,
            parents,
            writable,
            missing_compression_parents: RefCell::new(HashSet::new()),
            key_dependencies: None,
        })
    }

    /// Enable tracking of external parent references; `get_missing_parents`
    /// reports those that never materialised.
    pub fn track_external_parent_refs(mut self) -> KnitGraphIndex {
        self.key_dependencies = Some(RefCell::new(KeyRefs::new()));
        self
    }

    /// Parents referenced by added records that are present nowhere in this
    /// index. Only meaningful with `track_external_parent_refs`.
    pub fn get_missing_parents(&self) -> Result<Vec<Key>> {
        let Some(deps) = &self.key_dependencies else {
            return Ok(Vec::new());
        };
        // References can be satisfied by keys that were already in the graph
        // before tracking started; filter those false positives out.
        let unsatisfied = deps.borrow().get_unsatisfied_refs();
        let present = self.get_parent_map(&unsatisfied)?;
        let mut deps = deps.borrow_mut();
        deps.satisfy_refs_for_keys(present.keys());
        let mut missing = deps.get_unsatisfied_refs();
        missing.sort_unstable();
        Ok(missing)
    }

    fn node_value(options: &RecordOptions, memo: &AccessMemo) -> Vec<u8> {
        let mut value = Vec::with_capacity(24);
        value.push(if options.no_eol { b'N' } else { b' ' });
        value.extend_from_slice(format!("{} {}", memo.offset, memo.length).as_bytes());
        value
    }

    fn node_to_memo(&self, key: &Key, node: &GraphNode) -> Result<AccessMemo> {
        let text = &node.value[1..];
        let mut bits = text.split(|&b| b == b' ');
        let parse = |field: Option<&[u8]>| -> Option<u64> {
            field
                .and_then(|f| std::str::from_utf8(f).ok())
                .and_then(|s| s.parse().ok())
        };
        let offset = parse(bits.next());
        let length = parse(bits.next());
        match (offset, length) {
            (Some(offset), Some(length)) => Ok(AccessMemo {
                bucket: Bucket::Container(self.container.clone()),
                offset,
                length: length as usize,
            }),
            _ => Err(Error::corrupt(
                "graph-index",
                format!("bad node value for {}", key),
            )),
        }
    }

    fn node_compression_parent(&self, key: &Key, node: &GraphNode) -> Result<Option<Key>> {
        if !self.deltas {
            return Ok(None);
        }
        let compression = node.refs.get(1).map(|r| r.as_slice()).unwrap_or(&[]);
        match compression {
            [] => Ok(None),
            [parent] => Ok(Some(parent.clone())),
            _ => Err(Error::corrupt(
                "graph-index",
                format!("too many compression parents for {}", key),
            )),
        }
    }

    fn node_parents(&self, node: &GraphNode) -> ParentKeys {
        if self.parents {
            node.refs.first().cloned().unwrap_or_default()
        } else {
            SmallVec::new()
        }
    }

    fn get_node(&self, key: &Key) -> Result<GraphNode> {
        self.graph
            .get(key)
            .ok_or_else(|| Error::RevisionNotPresent(key.clone()))
    }

    /// Tell this index about another, not yet validated, index whose records
    /// may reference bases that are nowhere to be found yet. Unsatisfied
    /// compression references accumulate until matching records arrive.
    pub fn scan_unvalidated_index(&self, graph_index: &InMemoryGraphIndex) {
        if let Some(deps) = &self.key_dependencies {
            let mut deps = deps.borrow_mut();
            for (key, node) in graph_index.all_nodes() {
                if let Some(parents) = node.refs.first() {
                    deps.add_references(&key, parents.iter());
                }
            }
        }
        if !self.deltas {
            return;
        }
        let mut new_missing = graph_index.external_references(1);
        let candidates: Vec<Key> = new_missing.iter().cloned().collect();
        if let Ok(present) = self.get_parent_map(&candidates) {
            for key in present.keys() {
                new_missing.remove(key);
            }
        }
        debug!("scan found {} unsatisfied bases", new_missing.len());
        self.missing_compression_parents
            .borrow_mut()
            .extend(new_missing);
    }
}

impl KnitIndex for KnitGraphIndex {
    fn add_records(
        &self,
        records: Vec<IndexRecord>,
        random_id: bool,
        missing_compression_parents: bool,
    ) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let mut keys: HashMap<Key, (Vec<u8>, Vec<ParentKeys>)> = HashMap::new();
        let mut compression_parents: HashSet<Key> = HashSet::new();
        for record in &records {
            if self.parents {
                if let Some(deps) = &self.key_dependencies {
                    deps.borrow_mut()
                        .add_references(&record.key, record.parents.iter());
                }
            }
            let value = Self::node_value(&record.options, &record.memo);
            if !self.deltas && record.options.method == Method::LineDelta {
                return Err(Error::corrupt(
                    "graph-index",
                    "attempt to add line-delta in non-delta knit",
                ));
            }
            let node_refs: Vec<ParentKeys> = if self.parents {
                if self.deltas {
                    if record.options.method == Method::LineDelta {
                        let basis = record.parents.first().cloned().ok_or_else(|| {
                            Error::corrupt(
                                "graph-index",
                                format!("line-delta {} has no parents", record.key),
                            )
                        })?;
                        if missing_compression_parents {
                            compression_parents.insert(basis.clone());
                        }
                        let mut second: ParentKeys = SmallVec::new();
                        second.push(basis);
                        vec![record.parents.clone(), second]
                    } else {
                        vec![record.parents.clone(), SmallVec::new()]
                    }
                } else {
                    vec![record.parents.clone()]
                }
            } else {
                if !record.parents.is_empty() {
                    return Err(Error::corrupt(
                        "graph-index",
                        "attempt to add node with parents in parentless index",
                    ));
                }
                Vec::new()
            };
            keys.insert(record.key.clone(), (value, node_refs));
        }

        if !random_id {
            // Identical duplicates are dropped; inconsistent ones refused.
            let mut consistent_duplicates = Vec::new();
            for (key, (value, node_refs)) in &keys {
                if let Some(existing) = self.graph.get(key) {
                    let existing_parents = existing.refs.first();
                    let new_parents = node_refs.first();
                    if existing.value.first() != value.first()
                        || existing_parents != new_parents
                    {
                        return Err(Error::corrupt(
                            "graph-index",
                            format!("inconsistent details in add_records for {}", key),
                        ));
                    }
                    consistent_duplicates.push(key.clone());
                }
            }
            for key in consistent_duplicates {
                keys.remove(&key);
            }
        }

        let added: Vec<Key> = keys.keys().cloned().collect();
        self.graph.add_nodes(
            keys.into_iter()
                .map(|(key, (value, refs))| (key, value, refs))
                .collect(),
        );
        let mut missing = self.missing_compression_parents.borrow_mut();
        if missing_compression_parents {
            // Every basis in this batch either arrived alongside its child
            // or is genuinely missing.
            for parent in compression_parents {
                if !added.contains(&parent) {
                    missing.insert(parent);
                }
            }
        }
        // Arrivals may have satisfied older gaps.
        for key in &added {
            missing.remove(key);
        }
        Ok(())
    }

    fn get_parent_map(&self, keys: &[Key]) -> Result<HashMap<Key, ParentKeys>> {
        let mut result = HashMap::new();
        for key in keys {
            if let Some(node) = self.graph.get(key) {
                result.insert(key.clone(), self.node_parents(&node));
            }
        }
        Ok(result)
    }

    fn get_build_details(&self, keys: &[Key]) -> Result<HashMap<Key, BuildDetails>> {
        let mut result = HashMap::new();
        for key in keys {
            let Some(node) = self.graph.get(key) else {
                continue;
            };
            let compression_parent = self.node_compression_parent(key, &node)?;
            let method = if compression_parent.is_some() {
                Method::LineDelta
            } else {
                Method::Fulltext
            };
            result.insert(
                key.clone(),
                BuildDetails {
                    memo: self.node_to_memo(key, &node)?,
                    compression_parent,
                    parents: self.node_parents(&node),
                    method,
                    no_eol: node.value.first() == Some(&b'N'),
                },
            );
        }
        Ok(result)
    }

    fn get_method(&self, key: &Key) -> Result<Method> {
        let node = self.get_node(key)?;
        Ok(if self.node_compression_parent(key, &node)?.is_some() {
            Method::LineDelta
        } else {
            Method::Fulltext
        })
    }

    fn get_options(&self, key: &Key) -> Result<RecordOptions> {
        let node = self.get_node(key)?;
        Ok(RecordOptions {
            method: if self.node_compression_parent(key, &node)?.is_some() {
                Method::LineDelta
            } else {
                Method::Fulltext
            },
            no_eol: node.value.first() == Some(&b'N'),
        })
    }

    fn get_position(&self, key: &Key) -> Result<AccessMemo> {
        let node = self.get_node(key)?;
        self.node_to_memo(key, &node)
    }

    fn keys(&self) -> Result<HashSet<Key>> {
        Ok(self.graph.keys())
    }

    fn missing_compression_parents(&self) -> Vec<Key> {
        let mut out: Vec<Key> = self
            .missing_compression_parents
            .borrow()
            .iter()
            .cloned()
            .collect();
        out.sort_unstable();
        out
    }

    fn has_graph(&self) -> bool {
        self.parents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Key {
        Key::from_slices(&[s.as_bytes()])
    }

    fn memo(offset: u64) -> AccessMemo {
        AccessMemo {
            bucket: Bucket::Container("pack-0".to_string()),
            offset,
            length: 10,
        }
    }

    fn record(suffix: &str, method: Method, offset: u64, parents: &[Key]) -> IndexRecord {
        IndexRecord {
            key: key(suffix),
            options: RecordOptions { method, no_eol: false },
            memo: memo(offset),
            parents: parents.iter().cloned().collect(),
        }
    }

    fn new_index() -> KnitGraphIndex {
        KnitGraphIndex::new(
            Rc::new(InMemoryGraphIndex::new(2)),
            "pack-0",
            true,
            true,
            true,
        )
        .unwrap()
    }

    #[test]
    fn build_details_round_trip() {
        let index = new_index();
        index
            .add_records(
                vec![
                    record("r0", Method::Fulltext, 0, &[]),
                    record("r1", Method::LineDelta, 10, &[key("r0")]),
                ],
                false,
                false,
            )
            .unwrap();
        let details = index.get_build_details(&[key("r0"), key("r1")]).unwrap();
        assert_eq!(details[&key("r0")].compression_parent, None);
        assert_eq!(details[&key("r0")].method, Method::Fulltext);
        assert_eq!(details[&key("r1")].compression_parent, Some(key("r0")));
        assert_eq!(details[&key("r1")].memo.offset, 10);
    }

    #[test]
    fn no_eol_flag_encoded_in_value() {
        let index = new_index();
        index
            .add_records(
                vec![IndexRecord {
                    key: key("r0"),
                    options: RecordOptions { method: Method::Fulltext, no_eol: true },
                    memo: memo(0),
                    parents: SmallVec::new(),
                }],
                false,
                false,
            )
            .unwrap();
        assert!(index.get_options(&key("r0")).unwrap().no_eol);
        let node = index.graph.get(&key("r0")).unwrap();
        assert_eq!(node.value[0], b'N');
    }

    #[test]
    fn identical_duplicate_tolerated_inconsistent_refused() {
        let index = new_index();
        let r = record("r0", Method::Fulltext, 0, &[]);
        index.add_records(vec![r.clone()], false, false).unwrap();
        index.add_records(vec![r], false, false).unwrap();
        // Same key, different parents: refused.
        let bad = record("r0", Method::Fulltext, 0, &[key("other")]);
        assert!(matches!(
            index.add_records(vec![bad], false, false),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn delta_in_nondelta_index_refused() {
        let index = KnitGraphIndex::new(
            Rc::new(InMemoryGraphIndex::new(1)),
            "pack-0",
            false,
            true,
            true,
        )
        .unwrap();
        assert!(matches!(
            index.add_records(
                vec![record("r1", Method::LineDelta, 0, &[key("r0")])],
                false,
                false,
            ),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn missing_compression_parents_tracked_until_satisfied() {
        let index = new_index();
        index
            .add_records(
                vec![record("r1", Method::LineDelta, 0, &[key("r0")])],
                false,
                true,
            )
            .unwrap();
        assert_eq!(index.missing_compression_parents(), vec![key("r0")]);
        index
            .add_records(vec![record("r0", Method::Fulltext, 10, &[])], false, false)
            .unwrap();
        assert!(index.missing_compression_parents().is_empty());
    }

    #[test]
    fn scan_unvalidated_tracks_external_bases() {
        let index = new_index();
        let other = InMemoryGraphIndex::new(2);
        let mut basis_ref: ParentKeys = SmallVec::new();
        basis_ref.push(key("missing-base"));
        other.add_nodes(vec![(
            key("child"),
            b" 0 10".to_vec(),
            vec![basis_ref.clone(), basis_ref],
        )]);
        index.scan_unvalidated_index(&other);
        assert_eq!(index.missing_compression_parents(), vec![key("missing-base")]);
    }

    #[test]
    fn external_parent_refs_tracked_until_added() {
        let index = KnitGraphIndex::new(
            Rc::new(InMemoryGraphIndex::new(2)),
            "pack-0",
            true,
            true,
            true,
        )
        .unwrap()
        .track_external_parent_refs();
        index
            .add_records(
                vec![record("r1", Method::Fulltext, 0, &[key("ghost"), key("r0")])],
                false,
                false,
            )
            .unwrap();
        assert_eq!(
            index.get_missing_parents().unwrap(),
            vec![key("ghost"), key("r0")]
        );
        index
            .add_records(vec![record("r0", Method::Fulltext, 10, &[])], false, false)
            .unwrap();
        assert_eq!(index.get_missing_parents().unwrap(), vec![key("ghost")]);
    }

    #[test]
    fn parentless_index_stores_no_graph() {
        let index = KnitGraphIndex::new(
            Rc::new(InMemoryGraphIndex::new(0)),
            "pack-0",
            false,
            false,
            true,
        )
        .unwrap();
        index
            .add_records(vec![record("r0", Method::Fulltext, 0, &[])], false, false)
            .unwrap();
        assert!(!index.has_graph());
        let parents = index.get_parent_map(&[key("r0")]).unwrap();
        assert!(parents[&key("r0")].is_empty());
    }
}
