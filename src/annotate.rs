//! Per-line origin tracking. For plain stores the origins are not in the
//! payload, so they are recomputed by walking the ancestry: every text is
//! diffed against its parents, matched lines inherit the parent's origin,
//! new lines take the current key. Content and matching blocks are reused
//! across siblings so a build stays linear in the ancestry size.

use std::collections::{HashMap, HashSet};

use crate::content::KnitContent;
use crate::delta::PlainDelta;
use crate::diff::SequenceMatcher;
use crate::error::{Error, Result};
use crate::index::{AccessMemo, BuildDetails};
use crate::key::{Key, ParentKeys};
use crate::store::KnitStore;

/// Matching blocks implied by a line delta, avoiding a fresh diff between a
/// basis and its delta child. Knit deltas cannot be trusted about the final
/// line because of eol handling, so a trailing mismatch shrinks the block.
fn line_delta_blocks(
    delta: &PlainDelta,
    source: &[Vec<u8>],
    target: &[Vec<u8>],
) -> Vec<(usize, usize, usize)> {
    let target_len = target.len();
    let mut blocks = Vec::new();
    let mut s_pos = 0usize;
    let mut t_pos = 0usize;
    for hunk in delta {
        let true_n = hunk.start - s_pos;
        let mut n = true_n.min(source.len().saturating_sub(s_pos));
        if n > 0 {
            if source[s_pos + n - 1] != target[t_pos + n - 1] {
                n -= 1;
            }
            if n > 0 {
                blocks.push((s_pos, t_pos, n));
            }
        }
        t_pos += hunk.lines.len() + true_n;
        s_pos = hunk.end;
    }
    let tail = target_len - t_pos;
    let mut n = tail.min(source.len().saturating_sub(s_pos));
    if n > 0 {
        if source[s_pos + n - 1] != target[t_pos + n - 1] {
            n -= 1;
        }
        if n > 0 {
            blocks.push((s_pos, t_pos, n));
        }
    }
    blocks.push((s_pos + tail, target_len, 0));
    blocks
}

pub struct Annotator<'a> {
    store: &'a KnitStore,
    all_build_details: HashMap<Key, BuildDetails>,
    parent_map: HashMap<Key, ParentKeys>,
    /// How many delta children still need each basis content.
    num_compression_children: HashMap<Key, usize>,
    content_objects: HashMap<Key, KnitContent>,
    text_cache: HashMap<Key, Vec<Vec<u8>>>,
    annotations_cache: HashMap<Key, Vec<Key>>,
    /// (child, basis) -> blocks, populated from deltas; consumed once.
    matching_blocks: HashMap<(Key, Key), Vec<(usize, usize, usize)>>,
    /// Delta payloads waiting for their basis content, keyed by basis.
    pending_deltas: HashMap<Key, Vec<(Key, Vec<Vec<u8>>)>>,
    /// Texts waiting for a parent's annotations, keyed by that parent.
    pending_annotation: HashMap<Key, Vec<Key>>,
}

impl<'a> Annotator<'a> {
    pub fn new(store: &'a KnitStore) -> Annotator<'a> {
        Annotator {
            store,
            all_build_details: HashMap::new(),
            parent_map: HashMap::new(),
            num_compression_children: HashMap::new(),
            content_objects: HashMap::new(),
            text_cache: HashMap::new(),
            annotations_cache: HashMap::new(),
            matching_blocks: HashMap::new(),
            pending_deltas: HashMap::new(),
            pending_annotation: HashMap::new(),
        }
    }

    /// Annotate one key: `(origin_key, line)` for every line of its
    /// fulltext.
    pub fn annotate_flat(mut self, key: &Key) -> Result<Vec<(Key, Vec<u8>)>> {
        let (records, ann_keys) = self.build_graph(key)?;
        let parsed = self.store.read_parsed_records(&records)?;
        for (record_key, payload, _digest) in parsed {
            if self.expand_record(record_key.clone(), payload)?.is_some() {
                self.process_after_expansion(record_key)?;
            }
        }
        for ann_key in ann_keys {
            // Fallback-sourced fulltexts, text already cached.
            self.process_after_expansion(ann_key)?;
        }
        let annotations = self.annotations_cache.remove(key).ok_or_else(|| {
            // Every well formed graph annotates fully; a leftover means a
            // cycle or a basis that never materialised.
            Error::corrupt("annotate", format!("could not annotate {}", key))
        })?;
        let lines = self
            .text_cache
            .remove(key)
            .ok_or_else(|| Error::RevisionNotPresent(key.clone()))?;
        debug_assert_eq!(annotations.len(), lines.len());
        Ok(annotations.into_iter().zip(lines).collect())
    }

    /// Discover the records and counts needed to build and annotate `key`.
    /// Returns (records to read, ancestors-first-ish) and the keys whose
    /// texts came from fallbacks.
    fn build_graph(&mut self, key: &Key) -> Result<(Vec<(Key, AccessMemo)>, Vec<Key>)> {
        let mut pending: HashSet<Key> = HashSet::from([key.clone()]);
        let mut records = Vec::new();
        let mut ann_keys = Vec::new();
        while !pending.is_empty() {
            let mut this_iteration: Vec<Key> = pending.drain().collect();
            this_iteration.sort_unstable();
            let details = self.store.index().get_build_details(&this_iteration)?;
            let mut next: HashSet<Key> = HashSet::new();
            for key in &this_iteration {
                if let Some(d) = details.get(key) {
                    self.parent_map.insert(key.clone(), d.parents.clone());
                    records.push((key.clone(), d.memo.clone()));
                    for parent in d.parents.iter() {
                        if !self.parent_map.contains_key(parent) {
                            next.insert(parent.clone());
                        }
                    }
                    if let Some(cp) = &d.compression_parent {
                        *self.num_compression_children.entry(cp.clone()).or_insert(0) += 1;
                    }
                } else if self.store.contains_key_anywhere(key)? {
                    // Not local: pull the fulltext through the fallbacks and
                    // annotate it like any other node.
                    let lines = self.store.get_lines(key)?;
                    self.text_cache.insert(key.clone(), lines);
                    ann_keys.push(key.clone());
                    let parents = self
                        .store
                        .get_parent_map(std::slice::from_ref(key))?
                        .remove(key)
                        .unwrap_or_default();
                    for parent in parents.iter() {
                        if !self.parent_map.contains_key(parent) {
                            next.insert(parent.clone());
                        }
                    }
                    self.parent_map.insert(key.clone(), parents);
                } else {
                    return Err(Error::RevisionNotPresent(key.clone()));
                }
            }
            self.all_build_details.extend(details);
            next.retain(|k| !self.parent_map.contains_key(k));
            pending = next;
        }
        // Children were discovered before their parents; reading roughly
        // ancestor-first keeps the pending queues short.
        records.reverse();
        Ok((records, ann_keys))
    }

    /// Turn one record payload into cached text, or park it until its basis
    /// content exists. Returns the text lines when expansion happened.
    fn expand_record(&mut self, key: Key, payload: Vec<Vec<u8>>) -> Result<Option<Vec<Vec<u8>>>> {
        let details = self
            .all_build_details
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::RevisionNotPresent(key.clone()))?;
        let content = match &details.compression_parent {
            Some(basis) => {
                if !self.content_objects.contains_key(basis) {
                    self.pending_deltas
                        .entry(basis.clone())
                        .or_default()
                        .push((key, payload));
                    return Ok(None);
                }
                let remaining = self
                    .num_compression_children
                    .get_mut(basis)
                    .expect("counted during build_graph");
                *remaining -= 1;
                let base_content = if *remaining == 0 {
                    self.num_compression_children.remove(basis);
                    self.content_objects.remove(basis).unwrap()
                } else {
                    self.content_objects[basis].clone()
                };
                let delta = self
                    .store
                    .content_kind()
                    .parse_line_delta("annotate", &payload)?;
                let mut content = base_content;
                content.set_strip_eol(false);
                content.apply_delta(&delta, key.suffix());
                content.set_strip_eol(details.no_eol);
                let lines = content.text();
                let basis_lines = &self.text_cache[basis];
                self.matching_blocks.insert(
                    (key.clone(), basis.clone()),
                    line_delta_blocks(&delta.into_plain(), basis_lines, &lines),
                );
                content
            }
            None => {
                let mut content = self.store.content_kind().parse_fulltext(
                    "annotate",
                    &payload,
                    key.suffix(),
                )?;
                content.set_strip_eol(details.no_eol);
                content
            }
        };
        if self.num_compression_children.get(&key).copied().unwrap_or(0) > 0 {
            self.content_objects.insert(key.clone(), content.clone());
        }
        let lines = content.text();
        self.text_cache.insert(key, lines.clone());
        Ok(Some(lines))
    }

    /// A content for `key` just materialised: annotate whatever became
    /// ready, and expand any deltas that were waiting on it.
    fn process_after_expansion(&mut self, key: Key) -> Result<()> {
        let mut expanded = vec![key];
        while let Some(k) = expanded.pop() {
            let mut ready = Vec::new();
            if !self.annotations_cache.contains_key(&k) && self.check_ready(&k) {
                ready.push(k.clone());
            }
            while let Some(r) = ready.pop() {
                if self.annotations_cache.contains_key(&r) {
                    continue;
                }
                self.annotate_one(&r)?;
                if let Some(children) = self.pending_annotation.remove(&r) {
                    for child in children {
                        if !self.annotations_cache.contains_key(&child) && self.check_ready(&child)
                        {
                            ready.push(child);
                        }
                    }
                }
            }
            if let Some(children) = self.pending_deltas.remove(&k) {
                for (child, payload) in children {
                    if self.expand_record(child.clone(), payload)?.is_some() {
                        expanded.push(child);
                    }
                }
            }
        }
        Ok(())
    }

    /// True when every parent's annotations exist; otherwise queue `key`
    /// under the first missing parent.
    fn check_ready(&mut self, key: &Key) -> bool {
        let Some(parents) = self.parent_map.get(key) else {
            return false;
        };
        for parent in parents.iter() {
            if !self.annotations_cache.contains_key(parent) {
                self.pending_annotation
                    .entry(parent.clone())
                    .or_default()
                    .push(key.clone());
                return false;
            }
        }
        true
    }

    /// All parents are annotated: matched lines take the parent origin
    /// (earliest parent wins), the rest take this key.
    fn annotate_one(&mut self, key: &Key) -> Result<()> {
        let lines = self.text_cache[key].clone();
        let parents = self.parent_map[key].clone();
        let mut annotations: Vec<Option<Key>> = vec![None; lines.len()];
        for parent in parents.iter() {
            let parent_annotations = self
                .annotations_cache
                .get(parent)
                .ok_or_else(|| {
                    Error::corrupt("annotate", format!("parent {} not annotated yet", parent))
                })?
                .clone();
            let blocks = match self.matching_blocks.remove(&(key.clone(), parent.clone())) {
                Some(blocks) => blocks,
                None => {
                    let parent_lines = self.text_cache.get(parent).ok_or_else(|| {
                        Error::RevisionNotPresent(parent.clone())
                    })?;
                    SequenceMatcher::new(parent_lines, &lines).get_matching_blocks()
                }
            };
            for (parent_idx, text_idx, n) in blocks {
                for offset in 0..n {
                    let slot = &mut annotations[text_idx + offset];
                    if slot.is_none() {
                        *slot = Some(parent_annotations[parent_idx + offset].clone());
                    }
                }
            }
        }
        let resolved: Vec<Key> = annotations
            .into_iter()
            .map(|origin| origin.unwrap_or_else(|| key.clone()))
            .collect();
        self.annotations_cache.insert(key.clone(), resolved);
        Ok(())
    }
}
