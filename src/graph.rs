//! Ordering over parent graphs. Parent maps are acyclic by construction, but
//! malformed data could smuggle a cycle in, so the sort detects and reports
//! them instead of looping.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::key::{Key, ParentKeys};

/// Sort keys so every parent present in the map comes before its children.
/// Parents absent from the map (ghosts) impose no ordering. Deterministic:
/// ties break on key order.
pub fn topo_sort(parent_map: &HashMap<Key, ParentKeys>) -> Result<Vec<Key>> {
    let mut pending_parents: HashMap<&Key, usize> = HashMap::with_capacity(parent_map.len());
    let mut children: HashMap<&Key, Vec<&Key>> = HashMap::new();
    for (key, parents) in parent_map {
        let mut count = 0;
        for parent in parents.iter() {
            if parent_map.contains_key(parent) && parent != key {
                children.entry(parent).or_default().push(key);
                count += 1;
            }
        }
        pending_parents.insert(key, count);
    }

    let mut ready: Vec<&Key> = pending_parents
        .iter()
        .filter(|(_, &n)| n == 0)
        .map(|(&k, _)| k)
        .collect();
    ready.sort_unstable();

    let mut result = Vec::with_capacity(parent_map.len());
    while let Some(key) = ready.pop() {
        result.push(key.clone());
        if let Some(kids) = children.get(key) {
            let mut unblocked: Vec<&Key> = Vec::new();
            for &child in kids {
                let n = pending_parents.get_mut(child).unwrap();
                *n -= 1;
                if *n == 0 {
                    unblocked.push(child);
                }
            }
            unblocked.sort_unstable();
            ready.extend(unblocked);
        }
    }
    if result.len() != parent_map.len() {
        return Err(Error::corrupt("graph", "cycle in parent graph"));
    }
    Ok(result)
}

/// The ordering used to maximise compression locality: grouped by key
/// prefix, reverse-topological within each group, prefixes in sorted order.
pub fn sort_groupcompress(parent_map: &HashMap<Key, ParentKeys>) -> Result<Vec<Key>> {
    let mut per_prefix: HashMap<Vec<Vec<u8>>, HashMap<Key, ParentKeys>> = HashMap::new();
    for (key, parents) in parent_map {
        per_prefix
            .entry(key.prefix().to_vec())
            .or_default()
            .insert(key.clone(), parents.clone());
    }
    let mut prefixes: Vec<_> = per_prefix.keys().cloned().collect();
    prefixes.sort_unstable();

    let mut result = Vec::with_capacity(parent_map.len());
    for prefix in prefixes {
        let mut sorted = topo_sort(&per_prefix[&prefix])?;
        sorted.reverse();
        result.extend(sorted);
    }
    Ok(result)
}
