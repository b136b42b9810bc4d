//! The knit store proper: inserts decide between fulltext and delta storage,
//! reads walk delta chains back to a fulltext, and record streams move
//! content between stores. Storage is split between an index and a data
//! access object; fallback stores answer for keys not present locally.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::{debug, trace};

use crate::access::{DataAccess, KnitKeyAccess, PackAccess};
use crate::adapters::{self, BasisProvider};
use crate::annotate::Annotator;
use crate::codec::{self, Digest};
use crate::content::{ContentKind, KnitContent, Method};
use crate::delta::LineDelta;
use crate::diff::{OpTag, SequenceMatcher};
use crate::error::{Error, Result};
use crate::graph::{sort_groupcompress, topo_sort};
use crate::index::{
    AccessMemo, BuildDetails, IndexRecord, KnitGraphIndex, KnitIndex, KndxIndex,
    InMemoryGraphIndex, RecordOptions,
};
use crate::key::{Key, KeyMapper, ParentKeys};
use crate::multiparent::MultiParent;
use crate::stream::{
    AbsentContentFactory, ContentFactory, ContentMapGenerator, KnitContentFactory, RawEntry,
    StorageKind,
};
use crate::transport::{ProgressSink, Transport};

/// Stream orderings a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Unordered,
    Topological,
    GroupCompress,
}

/// Keep stream read batches under roughly this much build data, so a large
/// tree does not get pulled into memory in one go.
const STREAM_MIN_BUFFER_SIZE: usize = 5 * 1024 * 1024;

/// The outcome of one insert.
#[derive(Debug, Clone)]
pub struct AddResult {
    /// The key actually stored; differs from the request when the suffix was
    /// content generated.
    pub key: Key,
    pub digest: Digest,
    pub text_length: usize,
}

/// A multi-parent diff record for `add_mpdiffs`.
#[derive(Debug, Clone)]
pub struct MpDiffRecord {
    pub key: Key,
    pub parents: ParentKeys,
    pub expected_sha1: Digest,
    pub diff: MultiParent,
}

pub struct KnitStore {
    index: Rc<dyn KnitIndex>,
    access: Rc<dyn DataAccess>,
    factory: ContentKind,
    max_delta_chain: usize,
    fallbacks: Vec<Rc<KnitStore>>,
}

impl KnitStore {
    pub fn new(
        index: Rc<dyn KnitIndex>,
        access: Rc<dyn DataAccess>,
        factory: ContentKind,
        max_delta_chain: usize,
    ) -> KnitStore {
        KnitStore {
            index,
            access,
            factory,
            max_delta_chain,
            fallbacks: Vec::new(),
        }
    }

    /// A store over per-prefix `.kndx`/`.knit` files.
    pub fn make_file_knit(
        transport: Rc<dyn Transport>,
        mapper: Rc<dyn KeyMapper>,
        annotated: bool,
        read_only: bool,
    ) -> KnitStore {
        let index = Rc::new(KndxIndex::new(transport.clone(), mapper.clone(), read_only));
        let access = Rc::new(KnitKeyAccess::new(transport, mapper));
        let factory = if annotated {
            ContentKind::Annotated
        } else {
            ContentKind::Plain
        };
        KnitStore::new(index, access, factory, 200)
    }

    /// A pack-style store over a graph index and one fresh container.
    pub fn make_pack_knit(transport: Rc<dyn Transport>, delta: bool) -> Result<KnitStore> {
        let graph = Rc::new(InMemoryGraphIndex::new(if delta { 2 } else { 1 }));
        let index = Rc::new(KnitGraphIndex::new(graph, "newpack", delta, true, true)?);
        let access = Rc::new(PackAccess::new(transport, None));
        access.set_writer("newpack", "newpack.pack")?;
        let max_delta_chain = if delta { 200 } else { 0 };
        Ok(KnitStore::new(index, access, ContentKind::Plain, max_delta_chain))
    }

    pub fn annotated(&self) -> bool {
        self.factory.annotated()
    }

    pub(crate) fn content_kind(&self) -> ContentKind {
        self.factory
    }

    pub fn index(&self) -> &dyn KnitIndex {
        &*self.index
    }

    pub fn access(&self) -> &dyn DataAccess {
        &*self.access
    }

    /// Add another store consulted for keys not present here.
    pub fn add_fallback(&mut self, fallback: Rc<KnitStore>) {
        self.fallbacks.push(fallback);
    }

    /// A view of this store that never consults fallbacks.
    pub fn without_fallbacks(&self) -> KnitStore {
        KnitStore::new(
            self.index.clone(),
            self.access.clone(),
            self.factory,
            self.max_delta_chain,
        )
    }

    // *** Insert path.

    pub fn add_lines(
        &self,
        key: &Key,
        parents: &[Key],
        lines: Vec<Vec<u8>>,
    ) -> Result<AddResult> {
        self.add_lines_opts(key, parents, lines, None, false)
    }

    /// Full insert: `nostore_sha` aborts with `ExistingContent` when the new
    /// text hashes to it; `random_id` promises a fresh key.
    pub fn add_lines_opts(
        &self,
        key: &Key,
        parents: &[Key],
        lines: Vec<Vec<u8>>,
        nostore_sha: Option<&Digest>,
        random_id: bool,
    ) -> Result<AddResult> {
        let line_bytes: Vec<u8> = lines.concat();
        let digest = codec::sha1_bytes(&line_bytes);
        if nostore_sha == Some(&digest) {
            return Err(Error::ExistingContent(key.clone()));
        }
        // An empty suffix asks for a content-addressed key.
        let key = if key.suffix().is_empty() {
            Key::with_content_address(key.prefix(), &digest)
        } else {
            key.clone()
        };
        key.check_usable_suffix()?;

        // Only parents actually present locally are usable for compression;
        // the rest become ghosts.
        let present_parent_map = self.index.get_parent_map(parents)?;
        let present_parents: Vec<&Key> =
            parents.iter().filter(|p| present_parent_map.contains_key(p)).collect();
        // Compression is only ever against the leftmost declared parent.
        let delta = self.max_delta_chain > 0
            && !present_parents.is_empty()
            && present_parents[0] == &parents[0]
            && self.check_should_delta(present_parents[0])?;

        let text_length = line_bytes.len();
        let no_eol = !line_bytes.is_empty() && !line_bytes.ends_with(b"\n");
        let mut lines = lines;
        if no_eol {
            // Content always stores a trailing newline; the flag records the
            // truth.
            if let Some(last) = lines.last_mut() {
                last.push(b'\n');
            }
        }
        let version_id = key.suffix().to_vec();
        let mut content = self.factory.make(lines, &version_id);
        if no_eol {
            content.set_strip_eol(true);
        }

        let delta_hunks = if delta || (self.factory.annotated() && !present_parents.is_empty()) {
            self.merge_annotations(&mut content, &present_parents, delta)?
        } else {
            None
        };

        let options = RecordOptions {
            method: if delta_hunks.is_some() {
                Method::LineDelta
            } else {
                Method::Fulltext
            },
            no_eol,
        };
        let store_lines = match &delta_hunks {
            Some(hunks) => self.factory.lower_line_delta(hunks),
            None => self.factory.lower_fulltext(&content),
        };
        let (size, data) = codec::record_to_data(&version_id, &digest, &store_lines)?;
        let memo = self.access.add_raw_record(&key, size, &[data])?;
        trace!(
            "stored {} as {:?} ({} bytes)",
            key,
            options.method,
            size
        );
        self.index.add_records(
            vec![IndexRecord {
                key: key.clone(),
                options,
                memo,
                parents: parents.iter().cloned().collect(),
            }],
            random_id,
            false,
        )?;
        Ok(AddResult { key, digest, text_length })
    }

    /// Walk back from `parent` along compression parents looking for a
    /// fulltext within the chain bound; delta only if the chain's delta
    /// bytes are smaller than that fulltext.
    fn check_should_delta(&self, parent: &Key) -> Result<bool> {
        let mut delta_size = 0usize;
        let mut fulltext_size = None;
        let mut cursor = parent.clone();
        for _ in 0..self.max_delta_chain {
            // Only this store's index is consulted: a delta must never span
            // a physical store boundary.
            let details = match self.index.get_build_details(std::slice::from_ref(&cursor)) {
                Ok(details) => details,
                Err(_) => return Ok(false),
            };
            let Some(d) = details.get(&cursor) else {
                return Ok(false);
            };
            match &d.compression_parent {
                None => {
                    fulltext_size = Some(d.memo.length);
                    break;
                }
                Some(next) => {
                    delta_size += d.memo.length;
                    cursor = next.clone();
                }
            }
        }
        let should = match fulltext_size {
            // No fulltext within the bound: time to start a new one.
            None => false,
            Some(fulltext) => fulltext > delta_size,
        };
        Ok(should)
    }

    /// For annotated stores, pull matching lines' origins across from each
    /// parent; in all cases produce the line delta against the leftmost
    /// parent when delta storage was chosen.
    fn merge_annotations(
        &self,
        content: &mut KnitContent,
        present_parents: &[&Key],
        delta: bool,
    ) -> Result<Option<LineDelta>> {
        let mut left_parent_text: Option<Vec<Vec<u8>>> = None;
        if self.factory.annotated() {
            if let KnitContent::Annotated { lines, .. } = content {
                let new_text: Vec<Vec<u8>> =
                    lines.iter().map(|(_, text)| text.clone()).collect();
                for parent_key in present_parents {
                    let merge_content = self.get_content(parent_key)?;
                    let parent_pairs = merge_content.origin_pairs();
                    let parent_text = merge_content.text();
                    let matcher = SequenceMatcher::new(&parent_text, &new_text);
                    for (i, j, n) in matcher.get_matching_blocks() {
                        if n == 0 {
                            continue;
                        }
                        lines[j..j + n].clone_from_slice(&parent_pairs[i..i + n]);
                    }
                    if Some(parent_key) == present_parents.first() {
                        left_parent_text = Some(parent_text);
                    }
                }
                // A copied pair may have come from storage of a no-eol text;
                // reinstate the storage invariant.
                if let Some((_, text)) = lines.last_mut() {
                    if !text.ends_with(b"\n") {
                        text.push(b'\n');
                    }
                }
            }
        }
        if !delta {
            return Ok(None);
        }
        let reference_text = match left_parent_text {
            Some(text) => text,
            None => self.get_content(present_parents[0])?.text(),
        };
        let new_text = content.text();
        let matcher = SequenceMatcher::new(&reference_text, &new_text);
        let opcodes = matcher.get_opcodes();
        let mut hunk_ranges = Vec::new();
        for (tag, i1, i2, j1, j2) in opcodes {
            if tag == OpTag::Equal {
                continue;
            }
            hunk_ranges.push((i1, i2, j1, j2));
        }
        Ok(Some(content_delta(content, &hunk_ranges)))
    }

    // *** Lookup helpers.

    pub fn get_parent_map(&self, keys: &[Key]) -> Result<HashMap<Key, ParentKeys>> {
        Ok(self.parent_map_with_sources(keys)?.0)
    }

    /// Parent map plus the per-source maps, local first then each fallback
    /// in declaration order.
    fn parent_map_with_sources(
        &self,
        keys: &[Key],
    ) -> Result<(HashMap<Key, ParentKeys>, Vec<HashMap<Key, ParentKeys>>)> {
        let mut result = HashMap::new();
        let mut source_results = Vec::new();
        let mut missing: Vec<Key> = keys.to_vec();
        let local = self.index.get_parent_map(&missing)?;
        missing.retain(|k| !local.contains_key(k));
        result.extend(local.clone());
        source_results.push(local);
        for fallback in &self.fallbacks {
            if missing.is_empty() {
                source_results.push(HashMap::new());
                continue;
            }
            let found = fallback.get_parent_map(&missing)?;
            missing.retain(|k| !found.contains_key(k));
            result.extend(found.clone());
            source_results.push(found);
        }
        Ok((result, source_results))
    }

    pub fn contains_key_anywhere(&self, key: &Key) -> Result<bool> {
        Ok(!self.get_parent_map(std::slice::from_ref(key))?.is_empty())
    }

    pub fn keys(&self) -> Result<HashSet<Key>> {
        let mut result = self.index.keys()?;
        for fallback in &self.fallbacks {
            result.extend(fallback.keys()?);
        }
        Ok(result)
    }

    /// Map each key (and, transitively, each compression parent) to its
    /// build details.
    fn components_positions(
        &self,
        keys: &[Key],
        allow_missing: bool,
    ) -> Result<HashMap<Key, BuildDetails>> {
        let mut component_data: HashMap<Key, BuildDetails> = HashMap::new();
        let mut pending: Vec<Key> = keys.to_vec();
        while !pending.is_empty() {
            let details = self.index.get_build_details(&pending)?;
            let mut next: Vec<Key> = Vec::new();
            for key in &pending {
                match details.get(key) {
                    Some(d) => {
                        if let Some(cp) = &d.compression_parent {
                            if !component_data.contains_key(cp) && !details.contains_key(cp) {
                                next.push(cp.clone());
                            }
                        }
                    }
                    None => {
                        if !allow_missing {
                            return Err(Error::RevisionNotPresent(key.clone()));
                        }
                    }
                }
            }
            component_data.extend(details);
            next.retain(|k| !component_data.contains_key(k));
            next.sort_unstable();
            next.dedup();
            pending = next;
        }
        Ok(component_data)
    }

    /// Raw record bytes for keys and their whole build chains, ready for
    /// bottom-up parsing. Retries through the reload protocol when the
    /// container set shifts mid-read.
    pub(crate) fn record_map_unparsed(
        &self,
        keys: &[Key],
        allow_missing: bool,
    ) -> Result<HashMap<Key, RawEntry>> {
        loop {
            let positions = self.components_positions(keys, allow_missing)?;
            let mut records: Vec<(Key, AccessMemo)> = positions
                .iter()
                .map(|(k, d)| (k.clone(), d.memo.clone()))
                .collect();
            // Read in on-disk order: one grouped request per container.
            records.sort_by(|a, b| a.1.cmp(&b.1));
            let memos: Vec<AccessMemo> = records.iter().map(|(_, m)| m.clone()).collect();
            match self.access.get_raw_records(&memos) {
                Ok(data) => {
                    let mut map = HashMap::new();
                    for ((key, _), raw) in records.into_iter().zip(data) {
                        let d = &positions[&key];
                        map.insert(
                            key,
                            RawEntry {
                                raw,
                                method: d.method,
                                no_eol: d.no_eol,
                                next: d.compression_parent.clone(),
                            },
                        );
                    }
                    return Ok(map);
                }
                Err(e @ Error::RetryWithNewPacks { .. }) => {
                    self.access.reload_or_raise(e)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Raw records for exactly the given keys (no chain closure), parsed and
    /// digest-carrying, in I/O order.
    pub(crate) fn read_parsed_records(
        &self,
        records: &[(Key, AccessMemo)],
    ) -> Result<Vec<(Key, Vec<Vec<u8>>, Digest)>> {
        let mut sorted: Vec<(Key, AccessMemo)> = records.to_vec();
        sorted.sort_by(|a, b| a.1.cmp(&b.1));
        loop {
            let memos: Vec<AccessMemo> = sorted.iter().map(|(_, m)| m.clone()).collect();
            match self.access.get_raw_records(&memos) {
                Ok(data) => {
                    let mut out = Vec::with_capacity(sorted.len());
                    for ((key, _), raw) in sorted.iter().zip(data) {
                        let (payload, digest) =
                            codec::parse_record("knit", key.suffix(), &raw)?;
                        out.push((key.clone(), payload, digest));
                    }
                    return Ok(out);
                }
                Err(e @ Error::RetryWithNewPacks { .. }) => {
                    self.access.reload_or_raise(e)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The content object for one key, consulting fallbacks when it is not
    /// local.
    pub(crate) fn get_content(&self, key: &Key) -> Result<KnitContent> {
        if self.index.contains_key(key)? {
            let raw_map = self.record_map_unparsed(std::slice::from_ref(key), false)?;
            let mut generator = ContentMapGenerator::new(
                self,
                self.factory,
                vec![key.clone()],
                HashSet::new(),
                HashMap::new(),
                raw_map,
            );
            return generator.get_one_work(key);
        }
        for fallback in &self.fallbacks {
            if fallback.contains_key_anywhere(key)? {
                return fallback.get_content(key);
            }
        }
        Err(Error::RevisionNotPresent(key.clone()))
    }

    /// The output lines of `key`'s fulltext.
    pub fn get_lines(&self, key: &Key) -> Result<Vec<Vec<u8>>> {
        Ok(self.get_content(key)?.text())
    }

    pub fn get_text(&self, key: &Key) -> Result<Vec<u8>> {
        Ok(self.get_lines(key)?.concat())
    }

    /// Stored digests, without reconstructing any text.
    pub fn get_sha1s(&self, keys: &[Key]) -> Result<HashMap<Key, Digest>> {
        let mut result = HashMap::new();
        let details = self.index.get_build_details(keys)?;
        let records: Vec<(Key, AccessMemo)> = details
            .iter()
            .map(|(k, d)| (k.clone(), d.memo.clone()))
            .collect();
        if !records.is_empty() {
            let mut sorted = records;
            sorted.sort_by(|a, b| a.1.cmp(&b.1));
            let memos: Vec<AccessMemo> = sorted.iter().map(|(_, m)| m.clone()).collect();
            let data = self.access.get_raw_records(&memos)?;
            for ((key, _), raw) in sorted.into_iter().zip(data) {
                let header = codec::parse_record_header("knit", key.suffix(), &raw)?;
                result.insert(key, header.digest);
            }
        }
        let missing: Vec<Key> = keys
            .iter()
            .filter(|k| !result.contains_key(*k))
            .cloned()
            .collect();
        for fallback in &self.fallbacks {
            if missing.is_empty() {
                break;
            }
            let still: Vec<Key> = missing
                .iter()
                .filter(|k| !result.contains_key(*k))
                .cloned()
                .collect();
            result.extend(fallback.get_sha1s(&still)?);
        }
        Ok(result)
    }

    // *** Record streams out.

    pub fn get_record_stream<'a>(
        &'a self,
        keys: &[Key],
        ordering: Ordering,
        include_delta_closure: bool,
    ) -> Result<Vec<Box<dyn ContentFactory + 'a>>> {
        let keys: HashSet<Key> = keys.iter().cloned().collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        loop {
            match self.remaining_record_stream(&keys, ordering, include_delta_closure) {
                Ok(factories) => return Ok(factories),
                Err(e @ Error::RetryWithNewPacks { .. }) => {
                    self.access.reload_or_raise(e)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn remaining_record_stream<'a>(
        &'a self,
        keys: &HashSet<Key>,
        ordering: Ordering,
        include_delta_closure: bool,
    ) -> Result<Vec<Box<dyn ContentFactory + 'a>>> {
        // Without a stored graph there is nothing to sort by.
        let ordering = if self.index.has_graph() {
            ordering
        } else {
            Ordering::Unordered
        };
        let key_vec: Vec<Key> = keys.iter().cloned().collect();
        let positions: HashMap<Key, BuildDetails> = if include_delta_closure {
            self.components_positions(&key_vec, true)?
        } else {
            self.index.get_build_details(&key_vec)?
        };

        // Work out which keys can only be reconstructed through a fallback.
        let mut needed_from_fallback: HashSet<Key> = HashSet::new();
        if include_delta_closure {
            let mut reconstructable: HashMap<Key, bool> = HashMap::new();
            for key in keys {
                let mut chain = vec![key.clone()];
                let mut result = true;
                loop {
                    let cursor = chain.last().unwrap();
                    match positions.get(cursor) {
                        None => {
                            needed_from_fallback.insert(cursor.clone());
                            break;
                        }
                        Some(d) => match &d.compression_parent {
                            None => break,
                            Some(cp) => {
                                if let Some(&known) = reconstructable.get(cp) {
                                    result = known;
                                    break;
                                }
                                chain.push(cp.clone());
                            }
                        },
                    }
                }
                for chain_key in &chain {
                    reconstructable.insert(chain_key.clone(), result);
                }
                if !result {
                    needed_from_fallback.insert(key.clone());
                }
            }
        }

        let (global_map, parent_maps) = self.parent_map_with_sources(&key_vec)?;
        let mut factories: Vec<Box<dyn ContentFactory + 'a>> = Vec::new();
        for key in keys {
            if !global_map.contains_key(key) {
                factories.push(Box::new(AbsentContentFactory::new(key.clone())));
            }
        }

        // The emitted order, and a grouping of runs by owning source.
        let present_keys: Vec<Key> = match ordering {
            Ordering::Topological => topo_sort(&global_map)?,
            Ordering::GroupCompress => sort_groupcompress(&global_map)?,
            Ordering::Unordered => {
                // Fallback keys first, then local keys in on-disk order.
                let mut out: Vec<Key> = Vec::new();
                for parent_map in parent_maps.iter().skip(1).rev() {
                    out.extend(parent_map.keys().cloned());
                }
                let mut local: Vec<Key> = parent_maps[0].keys().cloned().collect();
                local.sort_by(|a, b| {
                    let ma = positions.get(a).map(|d| &d.memo);
                    let mb = positions.get(b).map(|d| &d.memo);
                    ma.cmp(&mb)
                });
                out.extend(local);
                out
            }
        };

        // Group consecutive keys by the source that answers for them.
        let source_of = |key: &Key| -> usize {
            parent_maps
                .iter()
                .position(|m| m.contains_key(key))
                .unwrap_or(0)
        };
        let mut source_keys: Vec<(usize, Vec<Key>)> = Vec::new();
        for key in present_keys {
            let source = source_of(&key);
            match source_keys.last_mut() {
                Some((s, list)) if *s == source => list.push(key),
                _ => source_keys.push((source, vec![key])),
            }
        }

        if include_delta_closure {
            let absent: HashSet<Key> = keys
                .iter()
                .filter(|k| !global_map.contains_key(*k))
                .cloned()
                .collect();
            let non_local: HashSet<Key> = needed_from_fallback
                .difference(&absent)
                .cloned()
                .collect();
            let ordered_present: Vec<Key> = source_keys
                .into_iter()
                .flat_map(|(_, keys)| keys)
                .collect();
            for (group_keys, group_non_local) in
                self.group_keys_for_io(&ordered_present, &non_local, &positions)
            {
                // Texts only a fallback can produce are fetched from it as
                // full streams first.
                let mut missing: HashSet<Key> = group_non_local.clone();
                for fallback in &self.fallbacks {
                    if missing.is_empty() {
                        break;
                    }
                    let wanted: Vec<Key> = missing.iter().cloned().collect();
                    for factory in fallback.get_record_stream(&wanted, ordering, true)? {
                        if factory.storage_kind() == StorageKind::Absent {
                            continue;
                        }
                        missing.remove(factory.key());
                        factories.push(factory);
                    }
                }
                let local_keys: Vec<Key> = group_keys
                    .iter()
                    .filter(|k| !group_non_local.contains(*k))
                    .cloned()
                    .collect();
                let raw_map = self.record_map_unparsed(&local_keys, true)?;
                let generator_map: HashMap<Key, Option<ParentKeys>> = group_keys
                    .iter()
                    .map(|k| (k.clone(), self.parents_for_factory(&global_map, k)))
                    .collect();
                let generator = ContentMapGenerator::new(
                    self,
                    self.factory,
                    group_keys,
                    group_non_local,
                    generator_map,
                    raw_map,
                );
                factories.extend(ContentMapGenerator::record_stream(Rc::new(RefCell::new(
                    generator,
                ))));
            }
        } else {
            for (source, group_keys) in source_keys {
                if source == 0 {
                    let records: Vec<(Key, AccessMemo)> = group_keys
                        .iter()
                        .map(|k| (k.clone(), positions[k].memo.clone()))
                        .collect();
                    let memos: Vec<AccessMemo> =
                        records.iter().map(|(_, m)| m.clone()).collect();
                    let data = self.access.get_raw_records(&memos)?;
                    for ((key, _), raw) in records.into_iter().zip(data) {
                        let d = &positions[&key];
                        factories.push(Box::new(KnitContentFactory::new(
                            key.clone(),
                            self.parents_for_factory(&global_map, &key),
                            d.method,
                            d.no_eol,
                            None,
                            raw,
                            self.factory.annotated(),
                            Some(self),
                        )));
                    }
                } else {
                    let fallback = &self.fallbacks[source - 1];
                    factories.extend(fallback.get_record_stream(
                        &group_keys,
                        ordering,
                        include_delta_closure,
                    )?);
                }
            }
        }
        Ok(factories)
    }

    fn parents_for_factory(
        &self,
        global_map: &HashMap<Key, ParentKeys>,
        key: &Key,
    ) -> Option<ParentKeys> {
        if self.index.has_graph() {
            global_map.get(key).cloned()
        } else {
            None
        }
    }

    /// Split the present keys into read batches: per prefix, then merged
    /// until each batch carries a sensible amount of build data.
    fn group_keys_for_io(
        &self,
        keys: &[Key],
        non_local: &HashSet<Key>,
        positions: &HashMap<Key, BuildDetails>,
    ) -> Vec<(Vec<Key>, HashSet<Key>)> {
        let mut prefix_order: Vec<Vec<Vec<u8>>> = Vec::new();
        let mut split: HashMap<Vec<Vec<u8>>, Vec<Key>> = HashMap::new();
        for key in keys {
            let prefix = key.prefix().to_vec();
            if !split.contains_key(&prefix) {
                prefix_order.push(prefix.clone());
            }
            split.entry(prefix).or_default().push(key.clone());
        }
        let mut result = Vec::new();
        let mut cur_keys: Vec<Key> = Vec::new();
        let mut cur_non_local: HashSet<Key> = HashSet::new();
        let mut cur_size = 0usize;
        for prefix in prefix_order {
            let prefix_keys = split.remove(&prefix).unwrap();
            cur_size += total_build_size(&prefix_keys, positions);
            cur_non_local.extend(
                prefix_keys.iter().filter(|k| non_local.contains(*k)).cloned(),
            );
            cur_keys.extend(prefix_keys);
            if cur_size > STREAM_MIN_BUFFER_SIZE {
                result.push((
                    std::mem::take(&mut cur_keys),
                    std::mem::take(&mut cur_non_local),
                ));
                cur_size = 0;
            }
        }
        if !cur_keys.is_empty() {
            result.push((cur_keys, cur_non_local));
        }
        result
    }

    // *** Record streams in.

    /// Insert a stream produced by `get_record_stream` somewhere else.
    /// Records whose delta basis has not arrived yet are buffered and flushed
    /// transitively as bases show up; anything still buffered at the end is
    /// committed with its missing bases recorded.
    pub fn insert_record_stream<'s>(
        &self,
        stream: impl IntoIterator<Item = Box<dyn ContentFactory + 's>>,
    ) -> Result<()> {
        let annotated = self.factory.annotated();
        let mut delta_types: HashSet<StorageKind> = HashSet::new();
        let mut convertibles: HashSet<StorageKind> = HashSet::new();
        if !annotated {
            // Annotations strip cheaply, so annotated records are welcome.
            convertibles.insert(StorageKind::KnitAnnotatedFtGz);
            if self.max_delta_chain > 0 {
                delta_types.insert(StorageKind::KnitAnnotatedDeltaGz);
                convertibles.insert(StorageKind::KnitAnnotatedDeltaGz);
            }
        }
        let mut native_types: HashSet<StorageKind> = HashSet::new();
        native_types.insert(StorageKind::for_knit_record(Method::Fulltext, annotated));
        if self.max_delta_chain > 0 {
            let native_delta = StorageKind::for_knit_record(Method::LineDelta, annotated);
            native_types.insert(native_delta);
            delta_types.insert(native_delta);
        }
        let knit_types: HashSet<StorageKind> =
            native_types.union(&convertibles).cloned().collect();

        let mut buffered_index_entries: HashMap<Key, Vec<IndexRecord>> = HashMap::new();
        for record in stream {
            let kind = record.storage_kind();
            if kind == StorageKind::Absent {
                return Err(Error::RevisionNotPresent(record.key().clone()));
            }
            if kind.is_knit() {
                // The raw bytes embed the version id; make sure they agree
                // with the stream metadata before blatting them across.
                if let Some(raw) = record.raw_record() {
                    codec::parse_record_header("stream", record.key().suffix(), raw)?;
                }
            }
            let key = record.key().clone();
            let parents: ParentKeys = record
                .parents()
                .map(|p| p.iter().cloned().collect())
                .unwrap_or_default();
            let compression_parent = if delta_types.contains(&kind) {
                Some(parents.first().cloned().ok_or_else(|| {
                    Error::corrupt("stream", format!("delta record {} has no parents", key))
                })?)
            } else {
                None
            };

            let mut buffered = false;
            let directly_insertable = knit_types.contains(&kind)
                && match &compression_parent {
                    None => true,
                    Some(cp) => {
                        self.fallbacks.is_empty()
                            || self.index.contains_key(cp)?
                            || !self.contains_key_anywhere(cp)?
                    }
                };
            if directly_insertable {
                let (method, no_eol) = record.build_details().ok_or_else(|| {
                    Error::corrupt("stream", "knit record without build details")
                })?;
                let bytes = if native_types.contains(&kind) {
                    record
                        .raw_record()
                        .ok_or_else(|| {
                            Error::corrupt("stream", "knit record without raw bytes")
                        })?
                        .to_vec()
                } else {
                    let target = if kind.is_knit_delta() {
                        StorageKind::KnitDeltaGz
                    } else {
                        StorageKind::KnitFtGz
                    };
                    adapters::adapt(&*record, target, Some(self as &dyn BasisProvider))?
                        .into_bytes()
                };
                let memo = self.access.add_raw_record(&key, bytes.len(), &[bytes])?;
                let entry = IndexRecord {
                    key: key.clone(),
                    options: RecordOptions { method, no_eol },
                    memo,
                    parents,
                };
                if method == Method::LineDelta {
                    // The basis must land in this store, not a fallback.
                    let cp = compression_parent.clone().ok_or_else(|| {
                        Error::corrupt("stream", "delta record without compression parent")
                    })?;
                    if !self.index.contains_key(&cp)? {
                        buffered_index_entries.entry(cp).or_default().push(entry);
                        buffered = true;
                    } else {
                        self.index.add_records(vec![entry], false, false)?;
                    }
                } else {
                    self.index.add_records(vec![entry], false, false)?;
                }
            } else if kind.is_expanded() {
                let lines = record.get_bytes_as(StorageKind::Lines)?.into_lines();
                self.add_lines(&key, &parents.to_vec(), lines)?;
            } else {
                // Wrong format for direct insertion (or its basis lives in a
                // fallback): expand to lines and re-insert from scratch.
                self.access.flush()?;
                let lines = match record.get_bytes_as(StorageKind::Lines) {
                    Ok(bytes) => bytes.into_lines(),
                    Err(Error::UnavailableRepresentation { .. }) => {
                        adapters::adapt(&*record, StorageKind::Lines, Some(self as &dyn BasisProvider))?
                            .into_lines()
                    }
                    Err(e) => return Err(e),
                };
                self.add_lines(&key, &parents.to_vec(), lines)?;
            }

            if !buffered {
                // This key may unblock buffered children, transitively.
                let mut added_keys = vec![key];
                while let Some(added) = added_keys.pop() {
                    if let Some(entries) = buffered_index_entries.remove(&added) {
                        added_keys.extend(entries.iter().map(|e| e.key.clone()));
                        self.index.add_records(entries, false, false)?;
                    }
                }
            }
        }
        if !buffered_index_entries.is_empty() {
            let all_entries: Vec<IndexRecord> = buffered_index_entries
                .into_values()
                .flatten()
                .collect();
            debug!(
                "{} records buffered at stream end, committing with missing bases",
                all_entries.len()
            );
            self.index.add_records(all_entries, false, true)?;
        }
        Ok(())
    }

    /// Check after `insert_record_stream`: delta bases that never arrived.
    /// A write group is not final until this is empty.
    pub fn get_missing_compression_parent_keys(&self) -> Vec<Key> {
        self.index.missing_compression_parents()
    }

    // *** Annotation.

    /// Per-line origins for the fulltext of `key`.
    pub fn annotate(&self, key: &Key) -> Result<Vec<(Key, Vec<u8>)>> {
        match self.factory {
            ContentKind::Annotated => {
                let content = self.get_content(key)?;
                Ok(content
                    .annotate()
                    .into_iter()
                    .map(|(origin, line)| (Key::from_prefix(key.prefix(), &origin), line))
                    .collect())
            }
            ContentKind::Plain => Annotator::new(self).annotate_flat(key),
        }
    }

    // *** Multi-parent diffs.

    /// Produce a multi-parent diff for each key against its present parents.
    pub fn make_mpdiffs(&self, keys: &[Key]) -> Result<Vec<MultiParent>> {
        let mut out = Vec::with_capacity(keys.len());
        let parent_map = self.get_parent_map(keys)?;
        for key in keys {
            let parents = parent_map
                .get(key)
                .ok_or_else(|| Error::RevisionNotPresent(key.clone()))?;
            let mut parent_lines = Vec::new();
            for parent in parents.iter() {
                if self.contains_key_anywhere(parent)? {
                    parent_lines.push(self.get_lines(parent)?);
                }
            }
            out.push(MultiParent::from_lines(&self.get_lines(key)?, &parent_lines));
        }
        Ok(out)
    }

    /// The inverse: expand diffs against already-stored parents and insert
    /// the results.
    pub fn add_mpdiffs(&self, records: Vec<MpDiffRecord>) -> Result<()> {
        for record in records {
            let mut parent_lines = Vec::new();
            for parent in record.parents.iter() {
                if self.contains_key_anywhere(parent)? {
                    parent_lines.push(self.get_lines(parent)?);
                }
            }
            let lines = record.diff.to_lines(&parent_lines)?;
            let actual = codec::sha1_lines(&lines);
            if actual != record.expected_sha1 {
                return Err(Error::Sha1Mismatch {
                    key: record.key,
                    expected: record.expected_sha1,
                    actual,
                    content: lines,
                });
            }
            self.add_lines(&record.key, &record.parents.to_vec(), lines)?;
        }
        Ok(())
    }

    // *** Maintenance.

    /// The cheap structural check: every delta's basis must be locally
    /// present.
    pub fn check(&self) -> Result<()> {
        let keys: Vec<Key> = self.index.keys()?.into_iter().collect();
        let parent_map = self.get_parent_map(&keys)?;
        for key in &keys {
            if self.index.get_method(key)? == Method::LineDelta {
                let parents = &parent_map[key];
                let basis = parents.first().ok_or_else(|| {
                    Error::corrupt("knit", format!("delta {} has no parents", key))
                })?;
                if !parent_map.contains_key(basis) {
                    return Err(Error::corrupt(
                        "knit",
                        format!("missing basis parent {} for {}", basis, key),
                    ));
                }
            }
        }
        for fallback in &self.fallbacks {
            fallback.check()?;
        }
        Ok(())
    }

    /// Every stored content line for `keys`, in whatever order suits the
    /// storage. Lines repeat per key they are present in; a key introducing
    /// no lines may not appear.
    pub fn iter_lines_added_or_present_in_keys(
        &self,
        keys: &[Key],
        progress: &mut dyn ProgressSink,
    ) -> Result<Vec<(Vec<u8>, Key)>> {
        let mut remaining: HashSet<Key> = keys.iter().cloned().collect();
        let total = remaining.len();
        let mut out = Vec::new();
        loop {
            let pending: Vec<Key> = remaining.iter().cloned().collect();
            let details = self.index.get_build_details(&pending)?;
            let mut records: Vec<(Key, AccessMemo)> = details
                .iter()
                .map(|(k, d)| (k.clone(), d.memo.clone()))
                .collect();
            records.sort_by(|a, b| a.1.cmp(&b.1));
            let memos: Vec<AccessMemo> = records.iter().map(|(_, m)| m.clone()).collect();
            match self.access.get_raw_records(&memos) {
                Ok(data) => {
                    for (idx, ((key, _), raw)) in records.into_iter().zip(data).enumerate() {
                        progress.update("Walking content", idx, Some(total));
                        let (payload, _) = codec::parse_record("knit", key.suffix(), &raw)?;
                        let lines = match details[&key].method {
                            Method::Fulltext => {
                                self.factory.fulltext_content_lines("knit", &payload)?
                            }
                            Method::LineDelta => {
                                self.factory.linedelta_content_lines("knit", &payload)?
                            }
                        };
                        remaining.remove(&key);
                        out.extend(lines.into_iter().map(|l| (l, key.clone())));
                    }
                    break;
                }
                Err(e @ Error::RetryWithNewPacks { .. }) => {
                    self.access.reload_or_raise(e)?;
                }
                Err(e) => return Err(e),
            }
        }
        if !remaining.is_empty() && self.fallbacks.is_empty() {
            return Err(Error::RevisionNotPresent(
                remaining.into_iter().next().unwrap(),
            ));
        }
        for fallback in &self.fallbacks {
            if remaining.is_empty() {
                break;
            }
            let wanted: Vec<Key> = remaining.iter().cloned().collect();
            let found = fallback.iter_lines_added_or_present_in_keys(&wanted, progress)?;
            for (_, key) in &found {
                remaining.remove(key);
            }
            out.extend(found);
        }
        progress.update("Walking content", total, Some(total));
        Ok(out)
    }
}

impl BasisProvider for KnitStore {
    fn basis_lines(&self, key: &Key) -> Result<Vec<Vec<u8>>> {
        self.get_lines(key)
    }
}

/// Build a line delta whose replacement lines come from `content`, matching
/// its annotation flavour.
fn content_delta(content: &KnitContent, ranges: &[(usize, usize, usize, usize)]) -> LineDelta {
    use crate::delta::Hunk;
    match content {
        KnitContent::Annotated { lines, .. } => LineDelta::Annotated(
            ranges
                .iter()
                .map(|&(i1, i2, j1, j2)| Hunk {
                    start: i1,
                    end: i2,
                    lines: lines[j1..j2].to_vec(),
                })
                .collect(),
        ),
        KnitContent::Plain { lines, .. } => LineDelta::Plain(
            ranges
                .iter()
                .map(|&(i1, i2, j1, j2)| Hunk {
                    start: i1,
                    end: i2,
                    lines: lines[j1..j2].to_vec(),
                })
                .collect(),
        ),
    }
}

/// Total bytes needed to build `keys`, following compression parents, with
/// shared components counted once.
fn total_build_size(keys: &[Key], positions: &HashMap<Key, BuildDetails>) -> usize {
    let mut seen: HashMap<Key, usize> = HashMap::new();
    let mut build_keys: Vec<Key> = keys.to_vec();
    while !build_keys.is_empty() {
        let mut next: Vec<Key> = Vec::new();
        for key in build_keys {
            // Keys answered by a fallback have no local position.
            let Some(d) = positions.get(&key) else {
                continue;
            };
            seen.insert(key, d.memo.length);
            if let Some(cp) = &d.compression_parent {
                if !seen.contains_key(cp) {
                    next.push(cp.clone());
                }
            }
        }
        build_keys = next;
    }
    seen.values().sum()
}
