//! Line-level sequence matching. This is the engine behind delta generation,
//! annotation merging and the multi-parent differ. It finds maximal common
//! runs between two line sequences: recursively take the longest matching
//! block, then match the regions either side of it.

use std::collections::HashMap;

/// A run of `len` identical lines starting at `a` in the old sequence and
/// `b` in the new one.
pub type MatchingBlock = (usize, usize, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpTag {
    Equal,
    Replace,
    Delete,
    Insert,
}

/// An edit operation: apply `tag` to old[i1..i2] / new[j1..j2].
pub type Opcode = (OpTag, usize, usize, usize, usize);

pub struct SequenceMatcher<'a> {
    a: &'a [Vec<u8>],
    b: &'a [Vec<u8>],
    // Positions of each distinct line in b.
    b2j: HashMap<&'a [u8], Vec<usize>>,
}

impl<'a> SequenceMatcher<'a> {
    pub fn new(a: &'a [Vec<u8>], b: &'a [Vec<u8>]) -> SequenceMatcher<'a> {
        let mut b2j: HashMap<&'a [u8], Vec<usize>> = HashMap::new();
        for (j, line) in b.iter().enumerate() {
            b2j.entry(line.as_slice()).or_default().push(j);
        }
        SequenceMatcher { a, b, b2j }
    }

    fn find_longest_match(
        &self,
        alo: usize,
        ahi: usize,
        blo: usize,
        bhi: usize,
    ) -> MatchingBlock {
        let (mut besti, mut bestj, mut bestsize) = (alo, blo, 0);
        // j2len[j] = length of the longest match ending with a[i-1] == b[j].
        let mut j2len: HashMap<usize, usize> = HashMap::new();
        for i in alo..ahi {
            let mut newj2len: HashMap<usize, usize> = HashMap::new();
            if let Some(indices) = self.b2j.get(self.a[i].as_slice()) {
                for &j in indices {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let k = j.checked_sub(1)
                        .and_then(|jm| j2len.get(&jm).copied())
                        .unwrap_or(0)
                        + 1;
                    newj2len.insert(j, k);
                    if k > bestsize {
                        besti = i + 1 - k;
                        bestj = j + 1 - k;
                        bestsize = k;
                    }
                }
            }
            j2len = newj2len;
        }
        (besti, bestj, bestsize)
    }

    /// All matching blocks, sorted, ending with the `(len(a), len(b), 0)`
    /// sentinel. Adjacent blocks are coalesced.
    pub fn get_matching_blocks(&self) -> Vec<MatchingBlock> {
        let (la, lb) = (self.a.len(), self.b.len());
        let mut queue = vec![(0usize, la, 0usize, lb)];
        let mut matches: Vec<MatchingBlock> = Vec::new();
        while let Some((alo, ahi, blo, bhi)) = queue.pop() {
            let (i, j, k) = self.find_longest_match(alo, ahi, blo, bhi);
            if k > 0 {
                matches.push((i, j, k));
                if alo < i && blo < j {
                    queue.push((alo, i, blo, j));
                }
                if i + k < ahi && j + k < bhi {
                    queue.push((i + k, ahi, j + k, bhi));
                }
            }
        }
        matches.sort_unstable();

        let mut blocks: Vec<MatchingBlock> = Vec::with_capacity(matches.len() + 1);
        let (mut i1, mut j1, mut k1) = (0, 0, 0);
        for (i2, j2, k2) in matches {
            if i1 + k1 == i2 && j1 + k1 == j2 {
                k1 += k2;
            } else {
                if k1 > 0 {
                    blocks.push((i1, j1, k1));
                }
                i1 = i2;
                j1 = j2;
                k1 = k2;
            }
        }
        if k1 > 0 {
            blocks.push((i1, j1, k1));
        }
        blocks.push((la, lb, 0));
        blocks
    }

    pub fn get_opcodes(&self) -> Vec<Opcode> {
        let mut opcodes = Vec::new();
        let (mut i, mut j) = (0, 0);
        for (ai, bj, size) in self.get_matching_blocks() {
            let tag = match (i < ai, j < bj) {
                (true, true) => Some(OpTag::Replace),
                (true, false) => Some(OpTag::Delete),
                (false, true) => Some(OpTag::Insert),
                (false, false) => None,
            };
            if let Some(tag) = tag {
                opcodes.push((tag, i, ai, j, bj));
            }
            if size > 0 {
                opcodes.push((OpTag::Equal, ai, ai + size, bj, bj + size));
            }
            i = ai + size;
            j = bj + size;
        }
        opcodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &[&str]) -> Vec<Vec<u8>> {
        text.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn identical_sequences() {
        let a = lines(&["a\n", "b\n", "c\n"]);
        let m = SequenceMatcher::new(&a, &a);
        assert_eq!(m.get_matching_blocks(), vec![(0, 0, 3), (3, 3, 0)]);
        assert_eq!(m.get_opcodes(), vec![(OpTag::Equal, 0, 3, 0, 3)]);
    }

    #[test]
    fn disjoint_sequences() {
        let a = lines(&["a\n"]);
        let b = lines(&["b\n"]);
        let m = SequenceMatcher::new(&a, &b);
        assert_eq!(m.get_matching_blocks(), vec![(1, 1, 0)]);
        assert_eq!(m.get_opcodes(), vec![(OpTag::Replace, 0, 1, 0, 1)]);
    }

    #[test]
    fn insert_in_middle() {
        let a = lines(&["a\n", "c\n"]);
        let b = lines(&["a\n", "b\n", "c\n"]);
        let m = SequenceMatcher::new(&a, &b);
        assert_eq!(m.get_matching_blocks(), vec![(0, 0, 1), (1, 2, 1), (2, 3, 0)]);
        assert_eq!(
            m.get_opcodes(),
            vec![
                (OpTag::Equal, 0, 1, 0, 1),
                (OpTag::Insert, 1, 1, 1, 2),
                (OpTag::Equal, 1, 2, 2, 3),
            ]
        );
    }

    #[test]
    fn repeated_lines_pick_longest_run() {
        let a = lines(&["x\n", "x\n", "x\n"]);
        let b = lines(&["x\n", "x\n"]);
        let m = SequenceMatcher::new(&a, &b);
        let blocks = m.get_matching_blocks();
        // One two-line block plus the sentinel.
        assert_eq!(blocks.last(), Some(&(3, 2, 0)));
        let matched: usize = blocks.iter().map(|&(_, _, n)| n).sum();
        assert_eq!(matched, 2);
    }

    #[test]
    fn adjacent_blocks_coalesce() {
        let a = lines(&["a\n", "b\n", "c\n", "d\n"]);
        let b = lines(&["a\n", "b\n", "c\n", "d\n", "e\n"]);
        let m = SequenceMatcher::new(&a, &b);
        assert_eq!(m.get_matching_blocks(), vec![(0, 0, 4), (4, 5, 0)]);
    }
}
