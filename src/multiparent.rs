//! Multi-parent diffs: a text expressed as hunks that either introduce new
//! lines or cite line ranges from any of N parents. Unlike line deltas these
//! tile the whole child text, so reconstruction never needs the parent
//! fulltext up front; parent ranges resolve recursively until they bottom
//! out in `NewText` hunks.

use std::collections::{HashMap, HashSet};

use crate::diff::SequenceMatcher;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hunk {
    NewText {
        lines: Vec<Vec<u8>>,
    },
    ParentText {
        parent: usize,
        parent_pos: usize,
        child_pos: usize,
        num_lines: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MultiParent {
    pub hunks: Vec<Hunk>,
}

/// One entry of a diff viewed as child line ranges.
#[derive(Debug, Clone, Copy)]
enum RangeData {
    // Index of the NewText hunk holding the lines.
    New { hunk: usize },
    Parent { parent: usize, parent_start: usize, parent_end: usize },
}

#[derive(Debug, Clone, Copy)]
struct RangeEntry {
    start: usize,
    end: usize,
    data: RangeData,
}

impl MultiParent {
    pub fn new(hunks: Vec<Hunk>) -> MultiParent {
        MultiParent { hunks }
    }

    /// Express `text` against its parents. At each child position the parent
    /// match covering the most lines wins; uncovered stretches become
    /// `NewText`.
    pub fn from_lines(text: &[Vec<u8>], parents: &[Vec<Vec<u8>>]) -> MultiParent {
        let comparisons: Vec<Vec<(usize, usize, usize)>> = parents
            .iter()
            .map(|parent| SequenceMatcher::new(parent, text).get_matching_blocks())
            .collect();
        // Cursor into each parent's block list. Blocks are sorted by child
        // position, so each cursor only moves forward.
        let mut cursors = vec![0usize; comparisons.len()];
        let mut diff = MultiParent::default();
        let mut new_lines: Vec<Vec<u8>> = Vec::new();
        let mut cur_line = 0;
        while cur_line < text.len() {
            let mut best: Option<(usize, usize, usize)> = None; // (parent, parent_pos, len)
            for (p, blocks) in comparisons.iter().enumerate() {
                // Skip blocks wholly before the current line.
                while cursors[p] < blocks.len() {
                    let (_, j, n) = blocks[cursors[p]];
                    if j + n <= cur_line {
                        cursors[p] += 1;
                    } else {
                        break;
                    }
                }
                let Some(&(i, j, n)) = blocks.get(cursors[p]) else {
                    continue;
                };
                if j > cur_line {
                    continue;
                }
                let offset = cur_line - j;
                let n = n - offset;
                if n == 0 {
                    continue;
                }
                if best.map_or(true, |(_, _, best_n)| n > best_n) {
                    best = Some((p, i + offset, n));
                }
            }
            match best {
                Some((parent, parent_pos, num_lines)) => {
                    if !new_lines.is_empty() {
                        diff.hunks.push(Hunk::NewText {
                            lines: std::mem::take(&mut new_lines),
                        });
                    }
                    diff.hunks.push(Hunk::ParentText {
                        parent,
                        parent_pos,
                        child_pos: cur_line,
                        num_lines,
                    });
                    cur_line += num_lines;
                }
                None => {
                    new_lines.push(text[cur_line].clone());
                    cur_line += 1;
                }
            }
        }
        if !new_lines.is_empty() {
            diff.hunks.push(Hunk::NewText { lines: new_lines });
        }
        diff
    }

    /// The number of lines in the text this diff describes.
    pub fn num_lines(&self) -> usize {
        let mut extra_n = 0;
        for hunk in self.hunks.iter().rev() {
            match hunk {
                Hunk::ParentText { child_pos, num_lines, .. } => {
                    return child_pos + num_lines + extra_n;
                }
                Hunk::NewText { lines } => extra_n += lines.len(),
            }
        }
        extra_n
    }

    /// True when the diff is a single `NewText` hunk, i.e. effectively a
    /// fulltext.
    pub fn is_snapshot(&self) -> bool {
        matches!(self.hunks.as_slice(), [Hunk::NewText { .. }])
    }

    /// Serialise to patch form. `i <n>` introduces n new lines, `c` cites a
    /// parent range. A bare newline after a NewText body marks that the
    /// body's last line really did end in a newline.
    pub fn to_patch(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for hunk in &self.hunks {
            match hunk {
                Hunk::NewText { lines } => {
                    out.extend_from_slice(format!("i {}\n", lines.len()).as_bytes());
                    for line in lines {
                        out.extend_from_slice(line);
                    }
                    out.push(b'\n');
                }
                Hunk::ParentText { parent, parent_pos, child_pos, num_lines } => {
                    out.extend_from_slice(
                        format!("c {} {} {} {}\n", parent, parent_pos, child_pos, num_lines)
                            .as_bytes(),
                    );
                }
            }
        }
        out
    }

    pub fn from_patch(text: &[u8]) -> Result<MultiParent> {
        let lines = crate::content::split_lines(text);
        let mut line_iter = lines.into_iter();
        let mut hunks: Vec<Hunk> = Vec::new();
        while let Some(cur_line) = line_iter.next() {
            match cur_line.first() {
                Some(b'i') => {
                    let num_lines: usize = std::str::from_utf8(&cur_line)
                        .ok()
                        .and_then(|s| s.trim_end().split(' ').nth(1))
                        .and_then(|n| n.parse().ok())
                        .ok_or_else(|| Error::corrupt("patch", "bad insert hunk header"))?;
                    let mut hunk_lines = Vec::with_capacity(num_lines);
                    for _ in 0..num_lines {
                        hunk_lines.push(line_iter.next().ok_or_else(|| {
                            Error::corrupt("patch", "insert hunk truncated")
                        })?);
                    }
                    // The last line swallowed the hunk terminator; a bare
                    // newline following the hunk restores it.
                    if let Some(last) = hunk_lines.last_mut() {
                        if last.ends_with(b"\n") {
                            last.pop();
                        } else {
                            return Err(Error::corrupt("patch", "insert hunk truncated"));
                        }
                    }
                    hunks.push(Hunk::NewText { lines: hunk_lines });
                }
                Some(b'\n') => {
                    match hunks.last_mut() {
                        Some(Hunk::NewText { lines }) if !lines.is_empty() => {
                            lines.last_mut().unwrap().push(b'\n');
                        }
                        _ => return Err(Error::corrupt("patch", "stray newline marker")),
                    }
                }
                Some(b'c') => {
                    let fields: Vec<usize> = std::str::from_utf8(&cur_line)
                        .ok()
                        .map(|s| {
                            s.trim_end()
                                .split(' ')
                                .skip(1)
                                .filter_map(|f| f.parse().ok())
                                .collect()
                        })
                        .unwrap_or_default();
                    if fields.len() != 4 {
                        return Err(Error::corrupt("patch", "bad parent hunk header"));
                    }
                    hunks.push(Hunk::ParentText {
                        parent: fields[0],
                        parent_pos: fields[1],
                        child_pos: fields[2],
                        num_lines: fields[3],
                    });
                }
                _ => return Err(Error::corrupt("patch", "unknown hunk marker")),
            }
        }
        Ok(MultiParent { hunks })
    }

    /// Expand this diff directly against its parents' fulltexts.
    pub fn to_lines(&self, parents: &[Vec<Vec<u8>>]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(self.num_lines());
        for hunk in &self.hunks {
            match hunk {
                Hunk::NewText { lines } => out.extend(lines.iter().cloned()),
                Hunk::ParentText { parent, parent_pos, num_lines, .. } => {
                    let parent_lines = parents.get(*parent).ok_or_else(|| {
                        Error::corrupt("patch", "parent hunk cites missing parent")
                    })?;
                    if parent_pos + num_lines > parent_lines.len() {
                        return Err(Error::corrupt("patch", "parent range out of bounds"));
                    }
                    out.extend(
                        parent_lines[*parent_pos..parent_pos + num_lines].iter().cloned(),
                    );
                }
            }
        }
        Ok(out)
    }

    /// The child line ranges this diff covers, in order.
    fn range_entries(&self) -> Vec<RangeEntry> {
        let mut entries = Vec::with_capacity(self.hunks.len());
        let mut start = 0;
        for (idx, hunk) in self.hunks.iter().enumerate() {
            let entry = match hunk {
                Hunk::NewText { lines } => RangeEntry {
                    start,
                    end: start + lines.len(),
                    data: RangeData::New { hunk: idx },
                },
                Hunk::ParentText { parent, parent_pos, child_pos, num_lines } => RangeEntry {
                    start: *child_pos,
                    end: child_pos + num_lines,
                    data: RangeData::Parent {
                        parent: *parent,
                        parent_start: *parent_pos,
                        parent_end: parent_pos + num_lines,
                    },
                },
            };
            start = entry.end;
            entries.push(entry);
        }
        entries
    }

    /// Matching blocks between the child and one parent, as implied by the
    /// `ParentText` hunks citing that parent.
    pub fn get_matching_blocks(&self, parent: usize, parent_len: usize) -> Vec<(usize, usize, usize)> {
        let mut blocks = Vec::new();
        for hunk in &self.hunks {
            if let Hunk::ParentText { parent: p, parent_pos, child_pos, num_lines } = hunk {
                if *p == parent {
                    blocks.push((*parent_pos, *child_pos, *num_lines));
                }
            }
        }
        blocks.push((parent_len, self.num_lines(), 0));
        blocks
    }
}

/// A diff provider for reconstruction: somewhere diffs and parent lists can
/// be pulled from by version id.
pub trait DiffSource {
    fn get_diff(&self, version_id: &[u8]) -> Result<&MultiParent>;
    fn get_parents(&self, version_id: &[u8]) -> Result<&[Vec<u8>]>;
}

/// Builds texts from diffs without recursing: parent citations become range
/// requests on an explicit pending stack, so pathological parent chains
/// cannot exhaust the call stack.
pub struct Reconstructor<'a, S: DiffSource> {
    source: &'a S,
    /// Materialised range tables, built once per version touched.
    ranges: HashMap<Vec<u8>, Vec<RangeEntry>>,
    /// Resume point per version. Requests normally sweep forward; a request
    /// behind the cursor rewinds it.
    cursors: HashMap<Vec<u8>, usize>,
    /// Fully reconstructed texts, reused across requests.
    cache: HashMap<Vec<u8>, Vec<Vec<u8>>>,
}

impl<'a, S: DiffSource> Reconstructor<'a, S> {
    pub fn new(source: &'a S) -> Reconstructor<'a, S> {
        Reconstructor {
            source,
            ranges: HashMap::new(),
            cursors: HashMap::new(),
            cache: HashMap::new(),
        }
    }

    /// Reconstruct the whole text of `version_id`, caching it.
    pub fn reconstruct_version(&mut self, version_id: &[u8]) -> Result<Vec<Vec<u8>>> {
        if let Some(cached) = self.cache.get(version_id) {
            return Ok(cached.clone());
        }
        let num_lines = self.source.get_diff(version_id)?.num_lines();
        let mut lines = Vec::with_capacity(num_lines);
        self.extend_range(&mut lines, version_id, 0, num_lines)?;
        self.cache.insert(version_id.to_vec(), lines.clone());
        Ok(lines)
    }

    fn ensure_ranges(&mut self, version_id: &[u8]) -> Result<()> {
        if !self.ranges.contains_key(version_id) {
            let entries = self.source.get_diff(version_id)?.range_entries();
            self.ranges.insert(version_id.to_vec(), entries);
        }
        Ok(())
    }

    fn extend_range(
        &mut self,
        lines: &mut Vec<Vec<u8>>,
        version_id: &[u8],
        req_start: usize,
        req_end: usize,
    ) -> Result<()> {
        if req_start == req_end {
            return Ok(());
        }
        let mut pending: Vec<(Vec<u8>, usize, usize)> =
            vec![(version_id.to_vec(), req_start, req_end)];
        while let Some((vid, req_start, mut req_end)) = pending.pop() {
            if let Some(cached) = self.cache.get(&vid) {
                lines.extend_from_slice(&cached[req_start..req_end]);
                continue;
            }
            self.ensure_ranges(&vid)?;
            let entries = &self.ranges[&vid];
            let mut idx = self.cursors.get(&vid).copied().unwrap_or(0);
            if entries.get(idx).map_or(true, |e| e.start > req_start) {
                idx = 0;
            }
            let entry = loop {
                match entries.get(idx) {
                    Some(e) if e.end <= req_start => idx += 1,
                    Some(e) => break *e,
                    None => {
                        return Err(Error::corrupt("patch", "range request beyond text"));
                    }
                }
            };
            self.cursors.insert(vid.clone(), idx);
            // A request spanning several hunks is split; the tail goes back
            // on the stack.
            if req_end > entry.end {
                pending.push((vid.clone(), entry.end, req_end));
                req_end = entry.end;
            }
            match entry.data {
                RangeData::New { hunk } => {
                    let diff = self.source.get_diff(&vid)?;
                    let Hunk::NewText { lines: hunk_lines } = &diff.hunks[hunk] else {
                        unreachable!()
                    };
                    lines.extend_from_slice(
                        &hunk_lines[req_start - entry.start..req_end - entry.start],
                    );
                }
                RangeData::Parent { parent, parent_start, parent_end } => {
                    let parents = self.source.get_parents(&vid)?;
                    let parent_id = parents
                        .get(parent)
                        .ok_or_else(|| {
                            Error::corrupt("patch", "parent hunk cites missing parent")
                        })?
                        .clone();
                    let new_start = parent_start + req_start - entry.start;
                    let new_end = parent_end + req_end - entry.end;
                    pending.push((parent_id, new_start, new_end));
                }
            }
        }
        Ok(())
    }
}

/// A small in-memory multi-parent store: versions held as diffs, with a
/// snapshot policy deciding when to store a fulltext instead.
pub struct MultiMemoryStore {
    diffs: HashMap<Vec<u8>, MultiParent>,
    parents: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    lines: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    snapshots: HashSet<Vec<u8>>,
    snapshot_interval: Option<usize>,
    max_snapshots: Option<usize>,
}

impl DiffSource for MultiMemoryStore {
    fn get_diff(&self, version_id: &[u8]) -> Result<&MultiParent> {
        self.diffs.get(version_id).ok_or_else(|| {
            Error::RevisionNotPresent(crate::key::Key::from_slices(&[version_id]))
        })
    }

    fn get_parents(&self, version_id: &[u8]) -> Result<&[Vec<u8>]> {
        self.parents
            .get(version_id)
            .map(|p| p.as_slice())
            .ok_or_else(|| Error::RevisionNotPresent(crate::key::Key::from_slices(&[version_id])))
    }
}

impl Default for MultiMemoryStore {
    fn default() -> Self {
        MultiMemoryStore::new(Some(25), None)
    }
}

impl MultiMemoryStore {
    pub fn new(snapshot_interval: Option<usize>, max_snapshots: Option<usize>) -> MultiMemoryStore {
        MultiMemoryStore {
            diffs: HashMap::new(),
            parents: HashMap::new(),
            lines: HashMap::new(),
            snapshots: HashSet::new(),
            snapshot_interval,
            max_snapshots,
        }
    }

    pub fn versions(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.parents.keys()
    }

    pub fn has_version(&self, version_id: &[u8]) -> bool {
        self.parents.contains_key(version_id)
    }

    pub fn is_snapshot(&self, version_id: &[u8]) -> bool {
        self.snapshots.contains(version_id)
    }

    /// Snapshot when the ancestry within `snapshot_interval` hops contains no
    /// snapshot yet, i.e. build chains stay bounded.
    fn should_snapshot(&self, parent_ids: &[Vec<u8>]) -> bool {
        let Some(interval) = self.snapshot_interval else {
            return false;
        };
        if let Some(max) = self.max_snapshots {
            if self.snapshots.len() >= max {
                return false;
            }
        }
        if parent_ids.is_empty() {
            return true;
        }
        let mut frontier: Vec<Vec<u8>> = parent_ids.to_vec();
        for _ in 0..interval {
            if frontier.is_empty() {
                return false;
            }
            let mut next = Vec::new();
            for version_id in &frontier {
                if !self.snapshots.contains(version_id) {
                    if let Some(parents) = self.parents.get(version_id) {
                        next.extend(parents.iter().cloned());
                    }
                }
            }
            frontier = next;
        }
        true
    }

    pub fn add_version(
        &mut self,
        lines: Vec<Vec<u8>>,
        version_id: &[u8],
        parent_ids: Vec<Vec<u8>>,
        force_snapshot: Option<bool>,
    ) -> Result<()> {
        let do_snapshot = force_snapshot.unwrap_or_else(|| self.should_snapshot(&parent_ids));
        let diff = if do_snapshot {
            self.snapshots.insert(version_id.to_vec());
            MultiParent::new(vec![Hunk::NewText { lines: lines.clone() }])
        } else {
            let parent_lines = parent_ids
                .iter()
                .map(|p| self.get_line_list(p))
                .collect::<Result<Vec<_>>>()?;
            let diff = MultiParent::from_lines(&lines, &parent_lines);
            if diff.is_snapshot() {
                self.snapshots.insert(version_id.to_vec());
            }
            diff
        };
        self.add_diff(diff, version_id, parent_ids);
        self.lines.insert(version_id.to_vec(), lines);
        Ok(())
    }

    pub fn add_diff(&mut self, diff: MultiParent, version_id: &[u8], parent_ids: Vec<Vec<u8>>) {
        self.diffs.insert(version_id.to_vec(), diff);
        self.parents.insert(version_id.to_vec(), parent_ids);
    }

    pub fn get_line_list(&mut self, version_id: &[u8]) -> Result<Vec<Vec<u8>>> {
        if let Some(lines) = self.lines.get(version_id) {
            return Ok(lines.clone());
        }
        let lines = {
            let mut reconstructor = Reconstructor::new(&*self);
            reconstructor.reconstruct_version(version_id)?
        };
        self.lines.insert(version_id.to_vec(), lines.clone());
        Ok(lines)
    }

    pub fn clear_cache(&mut self) {
        self.lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &[&str]) -> Vec<Vec<u8>> {
        text.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn from_lines_prefers_longest_parent_block() {
        let parent_a = lines(&["a\n", "b\n"]);
        let parent_b = lines(&["a\n", "b\n", "c\n"]);
        let text = lines(&["a\n", "b\n", "c\n", "d\n"]);
        let diff = MultiParent::from_lines(&text, &[parent_a, parent_b.clone()]);
        // The three-line run from parent 1 beats the two-line run from
        // parent 0.
        assert_eq!(
            diff.hunks[0],
            Hunk::ParentText { parent: 1, parent_pos: 0, child_pos: 0, num_lines: 3 }
        );
        assert_eq!(diff.hunks[1], Hunk::NewText { lines: lines(&["d\n"]) });
        assert_eq!(diff.num_lines(), 4);
    }

    #[test]
    fn no_parents_is_snapshot() {
        let text = lines(&["x\n", "y\n"]);
        let diff = MultiParent::from_lines(&text, &[]);
        assert!(diff.is_snapshot());
        assert_eq!(diff.num_lines(), 2);
    }

    #[test]
    fn patch_round_trip() {
        let diff = MultiParent::new(vec![
            Hunk::ParentText { parent: 0, parent_pos: 0, child_pos: 0, num_lines: 2 },
            Hunk::NewText { lines: lines(&["new-a\n", "new-b\n"]) },
        ]);
        let patch = diff.to_patch();
        assert_eq!(MultiParent::from_patch(&patch).unwrap(), diff);
    }

    #[test]
    fn patch_round_trip_no_trailing_newline() {
        let diff = MultiParent::new(vec![Hunk::NewText { lines: lines(&["a\n", "end"]) }]);
        let patch = diff.to_patch();
        // The patch itself ends with the unterminated line.
        assert!(patch.ends_with(b"end"));
        assert_eq!(MultiParent::from_patch(&patch).unwrap(), diff);
    }

    #[test]
    fn store_reconstructs_through_parent_chains() {
        let mut store = MultiMemoryStore::new(Some(25), None);
        store
            .add_version(lines(&["a\n", "b\n"]), b"base", vec![], None)
            .unwrap();
        store
            .add_version(
                lines(&["a\n", "b\n", "c\n"]),
                b"left",
                vec![b"base".to_vec()],
                Some(false),
            )
            .unwrap();
        store
            .add_version(
                lines(&["a\n", "z\n", "c\n"]),
                b"merged",
                vec![b"left".to_vec()],
                Some(false),
            )
            .unwrap();
        store.clear_cache();
        assert_eq!(
            store.get_line_list(b"merged").unwrap(),
            lines(&["a\n", "z\n", "c\n"])
        );
        assert!(store.is_snapshot(b"base"));
        assert!(!store.is_snapshot(b"merged"));
    }

    #[test]
    fn snapshot_interval_bounds_chains() {
        let mut store = MultiMemoryStore::new(Some(2), None);
        let mut parent: Option<Vec<u8>> = None;
        let mut text = lines(&["seed\n"]);
        for i in 0..8u8 {
            let vid = vec![b'v', b'0' + i];
            text.push(format!("line {}\n", i).into_bytes());
            let parents = parent.iter().cloned().collect();
            store.add_version(text.clone(), &vid, parents, None).unwrap();
            parent = Some(vid);
        }
        // With an interval of 2 the store must have taken snapshots beyond
        // the root.
        assert!(store.snapshots.len() > 1);
        store.clear_cache();
        assert_eq!(store.get_line_list(b"v7").unwrap(), text);
    }
}
