//! Randomized DAG churn: build arbitrary parent graphs with edited texts,
//! then check reconstruction, streaming and annotation against a plain
//! in-memory model.

use std::collections::HashMap;
use std::rc::Rc;

use rand::prelude::*;
use rand::rngs::SmallRng;

use knit_store::{ConstantMapper, Key, KnitStore, MemoryTransport, Ordering};

fn file_knit(annotated: bool) -> KnitStore {
    KnitStore::make_file_knit(
        Rc::new(MemoryTransport::new()),
        Rc::new(ConstantMapper("fuzz".to_string())),
        annotated,
        false,
    )
}

/// Ensure every line ends in a newline, so edits of a no-eol text stay
/// well formed.
fn terminated(mut lines: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    if let Some(last) = lines.last_mut() {
        if !last.ends_with(b"\n") {
            last.push(b'\n');
        }
    }
    lines
}

fn mutate(rng: &mut SmallRng, mut lines: Vec<Vec<u8>>, tag: &str) -> Vec<Vec<u8>> {
    let edits = rng.gen_range(1..4);
    for edit in 0..edits {
        if !lines.is_empty() && rng.gen_bool(0.3) {
            let at = rng.gen_range(0..lines.len());
            lines.remove(at);
        } else {
            let at = rng.gen_range(0..=lines.len());
            lines.insert(at, format!("{} edit {}\n", tag, edit).into_bytes());
        }
    }
    if lines.is_empty() {
        lines.push(format!("{} reseed\n", tag).into_bytes());
    }
    // Occasionally produce a text without a final newline.
    if rng.gen_bool(0.2) {
        let last = lines.last_mut().unwrap();
        last.pop();
        if last.is_empty() {
            last.extend_from_slice(b"tail");
        }
    }
    lines
}

fn ancestors_of(key: &Key, parent_map: &HashMap<Key, Vec<Key>>) -> Vec<Key> {
    let mut out = vec![key.clone()];
    let mut cursor = 0;
    while cursor < out.len() {
        let k = out[cursor].clone();
        cursor += 1;
        for parent in &parent_map[&k] {
            if !out.contains(parent) {
                out.push(parent.clone());
            }
        }
    }
    out
}

#[test]
fn random_dag_round_trips() {
    for seed in 0..6u64 {
        let mut rng = SmallRng::seed_from_u64(seed);
        let store = file_knit(false);
        let mut expected: HashMap<Key, Vec<Vec<u8>>> = HashMap::new();
        let mut parent_map: HashMap<Key, Vec<Key>> = HashMap::new();
        let mut keys: Vec<Key> = Vec::new();

        for i in 0..40 {
            let key = Key::from_slices(&[format!("rev-{}-{}", seed, i).as_bytes()]);
            let parent_count = rng.gen_range(0..=2.min(keys.len()));
            let mut parents: Vec<Key> = Vec::new();
            while parents.len() < parent_count {
                let candidate = keys[rng.gen_range(0..keys.len())].clone();
                if !parents.contains(&candidate) {
                    parents.push(candidate);
                }
            }
            let base = parents
                .first()
                .map(|p| terminated(expected[p].clone()))
                .unwrap_or_default();
            let lines = mutate(&mut rng, base, &format!("r{}", i));
            store.add_lines(&key, &parents, lines.clone()).unwrap();
            expected.insert(key.clone(), lines);
            parent_map.insert(key.clone(), parents);
            keys.push(key);
        }

        // Direct reconstruction matches the model.
        for key in &keys {
            assert_eq!(
                store.get_lines(key).unwrap(),
                expected[key],
                "seed {} key {}",
                seed,
                key
            );
        }

        // Re-adding an existing record with identical content is a no-op
        // semantically.
        let dup = keys[rng.gen_range(0..keys.len())].clone();
        store
            .add_lines(&dup, &parent_map[&dup], expected[&dup].clone())
            .unwrap();
        assert_eq!(store.get_lines(&dup).unwrap(), expected[&dup]);

        // Stream everything into a fresh store and compare again.
        let closure = rng.gen_bool(0.5);
        let dst = file_knit(false);
        let factories = store
            .get_record_stream(&keys, Ordering::Topological, closure)
            .unwrap();
        dst.insert_record_stream(factories).unwrap();
        assert!(dst.get_missing_compression_parent_keys().is_empty());
        for key in &keys {
            assert_eq!(
                dst.get_lines(key).unwrap(),
                expected[key],
                "seed {} closure {} key {}",
                seed,
                closure,
                key
            );
        }

        // Annotation: text preserved, every origin is the key itself or an
        // ancestor, and the origin's text actually contains the line.
        let target = keys[rng.gen_range(0..keys.len())].clone();
        let annotations = store.annotate(&target).unwrap();
        let text: Vec<Vec<u8>> = annotations.iter().map(|(_, line)| line.clone()).collect();
        assert_eq!(text, expected[&target]);
        let ancestry = ancestors_of(&target, &parent_map);
        for (origin, line) in &annotations {
            assert!(
                ancestry.contains(origin),
                "seed {} origin {} not an ancestor of {}",
                seed,
                origin,
                target
            );
            let origin_text = terminated(expected[origin].clone());
            let needle = terminated(vec![line.clone()]).pop().unwrap();
            assert!(
                origin_text.contains(&needle),
                "seed {} line {:?} missing from origin {}",
                seed,
                String::from_utf8_lossy(line),
                origin
            );
        }
    }
}
