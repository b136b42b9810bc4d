//! End-to-end coverage of the store: insert, reconstruct, stream, annotate,
//! and the documented failure modes, over both index back-ends.

use std::rc::Rc;

use knit_store::access::KnitKeyAccess;
use knit_store::codec;
use knit_store::index::{AccessMemo, Bucket, IndexRecord, KndxIndex, RecordOptions};
use knit_store::{
    ConstantMapper, ContentKind, Error, Key, KnitStore, MemoryTransport, Method, MpDiffRecord,
    NoProgress, Ordering, PrefixMapper, StorageKind,
};

fn key(s: &str) -> Key {
    Key::from_slices(&[s.as_bytes()])
}

fn pkey(p: &str, s: &str) -> Key {
    Key::from_slices(&[p.as_bytes(), s.as_bytes()])
}

fn lines(texts: &[&str]) -> Vec<Vec<u8>> {
    texts.iter().map(|t| t.as_bytes().to_vec()).collect()
}

fn file_knit(transport: Rc<MemoryTransport>, annotated: bool) -> KnitStore {
    KnitStore::make_file_knit(
        transport,
        Rc::new(ConstantMapper("test".to_string())),
        annotated,
        false,
    )
}

/// A diamond ancestry: origin <- base <- {left, right} <- merged.
fn insert_diamond(store: &KnitStore) {
    store
        .add_lines(&key("origin"), &[], lines(&["origin\n"]))
        .unwrap();
    store
        .add_lines(&key("base"), &[key("origin")], lines(&["base\n"]))
        .unwrap();
    store
        .add_lines(&key("left"), &[key("base")], lines(&["base\n", "left\n"]))
        .unwrap();
    store
        .add_lines(&key("right"), &[key("base")], lines(&["base\n", "right\n"]))
        .unwrap();
    store
        .add_lines(
            &key("merged"),
            &[key("left"), key("right")],
            lines(&["base\n", "left\n", "right\n", "merged\n"]),
        )
        .unwrap();
}

fn diamond_keys() -> Vec<Key> {
    vec![key("origin"), key("base"), key("left"), key("right"), key("merged")]
}

#[test]
fn diamond_round_trip_and_digests() {
    for annotated in [false, true] {
        let store = file_knit(Rc::new(MemoryTransport::new()), annotated);
        insert_diamond(&store);
        assert_eq!(store.get_text(&key("base")).unwrap(), b"base\n");
        assert_eq!(
            store.get_text(&key("merged")).unwrap(),
            b"base\nleft\nright\nmerged\n"
        );
        let sha1s = store.get_sha1s(&diamond_keys()).unwrap();
        assert_eq!(
            &sha1s[&key("base")][..],
            b"51c64a6f4fc375daf0d24aafbabe4d91b6f4bb44"
        );
        assert_eq!(
            &sha1s[&key("merged")][..],
            b"ed8bce375198ea62444dc71952b22cfc2b09226d"
        );
        // The stored digest always matches the reconstructed text.
        for k in diamond_keys() {
            let text = store.get_text(&k).unwrap();
            assert_eq!(codec::sha1_bytes(&text), sha1s[&k]);
        }
    }
}

#[test]
fn diamond_annotations() {
    for annotated in [false, true] {
        let store = file_knit(Rc::new(MemoryTransport::new()), annotated);
        insert_diamond(&store);
        let annotations = store.annotate(&key("merged")).unwrap();
        let origins: Vec<&Key> = annotations.iter().map(|(origin, _)| origin).collect();
        assert_eq!(
            origins,
            vec![&key("base"), &key("left"), &key("right"), &key("merged")],
            "annotated={}",
            annotated
        );
        let text: Vec<Vec<u8>> = annotations.into_iter().map(|(_, line)| line).collect();
        assert_eq!(text, lines(&["base\n", "left\n", "right\n", "merged\n"]));
    }
}

#[test]
fn no_eol_round_trip() {
    let store = file_knit(Rc::new(MemoryTransport::new()), false);
    store
        .add_lines(&key("k1"), &[], vec![b"line".to_vec()])
        .unwrap();
    assert_eq!(store.get_text(&key("k1")).unwrap(), b"line");
    assert_eq!(store.get_lines(&key("k1")).unwrap(), vec![b"line".to_vec()]);
    assert!(store.index().get_options(&key("k1")).unwrap().no_eol);

    // A no-eol text used as a basis still reconstructs its children.
    store
        .add_lines(
            &key("k2"),
            &[key("k1")],
            vec![b"line\n".to_vec(), b"two".to_vec()],
        )
        .unwrap();
    assert_eq!(store.get_text(&key("k2")).unwrap(), b"line\ntwo");
}

#[test]
fn empty_text_round_trip() {
    let store = file_knit(Rc::new(MemoryTransport::new()), false);
    store.add_lines(&key("empty"), &[], vec![]).unwrap();
    assert_eq!(store.get_text(&key("empty")).unwrap(), b"");
}

#[test]
fn content_addressed_insert() {
    let store = file_knit(Rc::new(MemoryTransport::new()), false);
    let result = store
        .add_lines(&Key::from_slices(&[b""]), &[], lines(&["payload\n"]))
        .unwrap();
    let mut expected = b"sha1:".to_vec();
    expected.extend_from_slice(&result.digest);
    assert_eq!(result.key.suffix(), expected.as_slice());
    assert_eq!(store.get_text(&result.key).unwrap(), b"payload\n");
}

#[test]
fn nostore_sha_rejects_existing_content() {
    let store = file_knit(Rc::new(MemoryTransport::new()), false);
    let first = store.add_lines(&key("a"), &[], lines(&["same\n"])).unwrap();
    let err = store
        .add_lines_opts(&key("b"), &[], lines(&["same\n"]), Some(&first.digest), false)
        .unwrap_err();
    assert!(matches!(err, Error::ExistingContent(_)));
}

#[test]
fn invalid_version_ids_rejected() {
    let store = file_knit(Rc::new(MemoryTransport::new()), false);
    assert!(matches!(
        store.add_lines(&key("has space"), &[], lines(&["x\n"])),
        Err(Error::InvalidRevisionId(_))
    ));
    assert!(matches!(
        store.add_lines(&key("reserved:"), &[], lines(&["x\n"])),
        Err(Error::InvalidRevisionId(_))
    ));
}

// Delta chains stay bounded: with max_delta_chain = 3 a fresh fulltext must
// appear at least every fourth record.
#[test]
fn delta_chain_capped() {
    let transport: Rc<MemoryTransport> = Rc::new(MemoryTransport::new());
    let mapper = Rc::new(ConstantMapper("test".to_string()));
    let index = Rc::new(KndxIndex::new(transport.clone(), mapper.clone(), false));
    let access = Rc::new(KnitKeyAccess::new(transport, mapper));
    let store = KnitStore::new(index, access, ContentKind::Plain, 3);

    // A fat base so deltas are clearly cheaper than fulltexts.
    let mut text: Vec<Vec<u8>> = (0..20)
        .map(|i| format!("filler line number {}\n", i).into_bytes())
        .collect();
    let mut keys = Vec::new();
    let mut parent: Option<Key> = None;
    for i in 0..10 {
        let k = key(&format!("r{}", i));
        text.push(format!("appended line {}\n", i).into_bytes());
        let parents: Vec<Key> = parent.iter().cloned().collect();
        store.add_lines(&k, &parents, text.clone()).unwrap();
        keys.push(k.clone());
        parent = Some(k);
    }
    let methods: Vec<Method> = keys
        .iter()
        .map(|k| store.index().get_method(k).unwrap())
        .collect();
    assert_eq!(methods[0], Method::Fulltext);
    for window in methods.windows(4) {
        assert!(
            window.contains(&Method::Fulltext),
            "four consecutive deltas in {:?}",
            methods
        );
    }
    // And everything still reads back through the chain.
    assert_eq!(store.get_lines(&keys[9]).unwrap(), text);
}

#[test]
fn digest_mismatch_is_reported_with_both_digests() {
    let store = file_knit(Rc::new(MemoryTransport::new()), false);
    store.add_lines(&key("good"), &[], lines(&["a\n"])).unwrap();

    // Hand-store a record whose header digest does not match its payload.
    let bogus_digest = codec::sha1_bytes(b"something else entirely");
    let payload = lines(&["text\n"]);
    let (size, data) = codec::record_to_data(b"bad", &bogus_digest, &payload).unwrap();
    let memo = store
        .access()
        .add_raw_record(&key("bad"), size, &[data])
        .unwrap();
    store
        .index()
        .add_records(
            vec![IndexRecord {
                key: key("bad"),
                options: RecordOptions { method: Method::Fulltext, no_eol: false },
                memo,
                parents: Default::default(),
            }],
            false,
            false,
        )
        .unwrap();

    match store.get_lines(&key("bad")) {
        Err(Error::Sha1Mismatch { key: k, expected, actual, content }) => {
            assert_eq!(k, key("bad"));
            assert_eq!(expected, bogus_digest);
            assert_eq!(actual, codec::sha1_lines(&payload));
            assert_eq!(content, payload);
        }
        other => panic!("expected Sha1Mismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn flipped_byte_in_data_file_fails_loudly() {
    let transport = Rc::new(MemoryTransport::new());
    let store = file_knit(transport.clone(), false);
    store
        .add_lines(&key("k"), &[], lines(&["payload\n"]))
        .unwrap();
    // Damage the gzip body, past the 10-byte member header.
    transport.corrupt_byte("test.knit", 14);
    assert!(store.get_lines(&key("k")).is_err());
}

// A stream arriving bases-last: deltas buffer until their basis lands.
#[test]
fn stream_insert_buffers_missing_bases() {
    let src = file_knit(Rc::new(MemoryTransport::new()), false);
    let mut text: Vec<Vec<u8>> = (0..20)
        .map(|i| format!("bulk content line {}\n", i).into_bytes())
        .collect();
    src.add_lines(&key("a"), &[], text.clone()).unwrap();
    text.push(b"b extra\n".to_vec());
    src.add_lines(&key("b"), &[key("a")], text.clone()).unwrap();
    text.push(b"c extra\n".to_vec());
    src.add_lines(&key("c"), &[key("b")], text.clone()).unwrap();
    assert_eq!(src.index().get_method(&key("b")).unwrap(), Method::LineDelta);
    assert_eq!(src.index().get_method(&key("c")).unwrap(), Method::LineDelta);

    let dst = file_knit(Rc::new(MemoryTransport::new()), false);
    let mut factories = Vec::new();
    for k in ["c", "b", "a"] {
        factories.extend(
            src.get_record_stream(&[key(k)], Ordering::Unordered, false)
                .unwrap(),
        );
    }
    dst.insert_record_stream(factories).unwrap();
    assert!(dst.get_missing_compression_parent_keys().is_empty());
    assert_eq!(dst.get_lines(&key("c")).unwrap(), text);
    dst.check().unwrap();
}

// The same stream cut short: the graph back-end records the unresolved
// basis, and a later arrival satisfies it.
#[test]
fn stream_insert_tracks_unresolved_bases() {
    let src = file_knit(Rc::new(MemoryTransport::new()), false);
    let mut text: Vec<Vec<u8>> = (0..20)
        .map(|i| format!("bulk content line {}\n", i).into_bytes())
        .collect();
    src.add_lines(&key("a"), &[], text.clone()).unwrap();
    text.push(b"b extra\n".to_vec());
    src.add_lines(&key("b"), &[key("a")], text.clone()).unwrap();
    text.push(b"c extra\n".to_vec());
    src.add_lines(&key("c"), &[key("b")], text.clone()).unwrap();

    let dst = KnitStore::make_pack_knit(Rc::new(MemoryTransport::new()), true).unwrap();
    let mut factories = Vec::new();
    for k in ["c", "b"] {
        factories.extend(
            src.get_record_stream(&[key(k)], Ordering::Unordered, false)
                .unwrap(),
        );
    }
    dst.insert_record_stream(factories).unwrap();
    assert_eq!(dst.get_missing_compression_parent_keys(), vec![key("a")]);

    let tail = src
        .get_record_stream(&[key("a")], Ordering::Unordered, false)
        .unwrap();
    dst.insert_record_stream(tail).unwrap();
    assert!(dst.get_missing_compression_parent_keys().is_empty());
    assert_eq!(dst.get_lines(&key("c")).unwrap(), text);
}

// Truncating the uncommitted tail of the index must hide only the last
// record; a later append works against the healed log.
#[test]
fn torn_index_write_tolerated() {
    let transport = Rc::new(MemoryTransport::new());
    {
        let store = file_knit(transport.clone(), false);
        store
            .add_lines(&key("first"), &[], lines(&["one\n"]))
            .unwrap();
        store
            .add_lines(&key("second"), &[key("first")], lines(&["one\n", "two\n"]))
            .unwrap();
    }
    transport.truncate_tail("test.kndx", 1);

    let reopened = file_knit(transport.clone(), false);
    let keys = reopened.keys().unwrap();
    assert!(keys.contains(&key("first")));
    assert!(!keys.contains(&key("second")));
    assert_eq!(reopened.get_text(&key("first")).unwrap(), b"one\n");

    // Re-adding after the torn write commits cleanly.
    reopened
        .add_lines(&key("second"), &[key("first")], lines(&["one\n", "two\n"]))
        .unwrap();
    let healed = file_knit(transport, false);
    assert_eq!(healed.get_text(&key("second")).unwrap(), b"one\ntwo\n");
}

#[test]
fn topological_stream_orders_bases_first() {
    let store = file_knit(Rc::new(MemoryTransport::new()), false);
    insert_diamond(&store);
    let factories = store
        .get_record_stream(&diamond_keys(), Ordering::Topological, false)
        .unwrap();
    let order: Vec<Key> = factories.iter().map(|f| f.key().clone()).collect();
    let pos = |k: &Key| order.iter().position(|o| o == k).unwrap();
    assert!(pos(&key("origin")) < pos(&key("base")));
    assert!(pos(&key("base")) < pos(&key("left")));
    assert!(pos(&key("base")) < pos(&key("right")));
    assert!(pos(&key("left")) < pos(&key("merged")));
    assert!(pos(&key("right")) < pos(&key("merged")));
}

#[test]
fn groupcompress_stream_groups_by_prefix() {
    let store = KnitStore::make_file_knit(
        Rc::new(MemoryTransport::new()),
        Rc::new(PrefixMapper),
        false,
        false,
    );
    store
        .add_lines(&pkey("f1", "a"), &[], lines(&["1\n"]))
        .unwrap();
    store
        .add_lines(&pkey("f1", "b"), &[pkey("f1", "a")], lines(&["1\n", "2\n"]))
        .unwrap();
    store
        .add_lines(&pkey("f2", "a"), &[], lines(&["x\n"]))
        .unwrap();
    let factories = store
        .get_record_stream(
            &[pkey("f1", "a"), pkey("f1", "b"), pkey("f2", "a")],
            Ordering::GroupCompress,
            false,
        )
        .unwrap();
    let order: Vec<Key> = factories.iter().map(|f| f.key().clone()).collect();
    assert_eq!(order, vec![pkey("f1", "b"), pkey("f1", "a"), pkey("f2", "a")]);
}

#[test]
fn absent_keys_stream_as_absent_not_error() {
    let store = file_knit(Rc::new(MemoryTransport::new()), false);
    insert_diamond(&store);
    let factories = store
        .get_record_stream(&[key("base"), key("ghost")], Ordering::Unordered, true)
        .unwrap();
    let mut saw_absent = false;
    for factory in &factories {
        if factory.key() == &key("ghost") {
            assert_eq!(factory.storage_kind(), StorageKind::Absent);
            assert!(factory.get_bytes_as(StorageKind::Fulltext).is_err());
            saw_absent = true;
        }
    }
    assert!(saw_absent);
}

// Reinserting a topological closure stream into an empty store reproduces
// every text, including across annotated/plain boundaries.
#[test]
fn stream_round_trip_with_delta_closure() {
    for (src_annotated, dst_annotated) in [(false, false), (true, false), (true, true)] {
        let src = file_knit(Rc::new(MemoryTransport::new()), src_annotated);
        insert_diamond(&src);
        let dst = file_knit(Rc::new(MemoryTransport::new()), dst_annotated);
        let factories = src
            .get_record_stream(&diamond_keys(), Ordering::Topological, true)
            .unwrap();
        dst.insert_record_stream(factories).unwrap();
        for k in diamond_keys() {
            assert_eq!(
                src.get_text(&k).unwrap(),
                dst.get_text(&k).unwrap(),
                "key {} src_annotated={} dst_annotated={}",
                k,
                src_annotated,
                dst_annotated
            );
        }
    }
}

// Raw knit records into a plain store from an annotated source exercise the
// strip adapters.
#[test]
fn annotated_records_strip_into_plain_store() {
    let src = file_knit(Rc::new(MemoryTransport::new()), true);
    insert_diamond(&src);
    let dst = file_knit(Rc::new(MemoryTransport::new()), false);
    let factories = src
        .get_record_stream(&diamond_keys(), Ordering::Topological, false)
        .unwrap();
    dst.insert_record_stream(factories).unwrap();
    for k in diamond_keys() {
        assert_eq!(src.get_text(&k).unwrap(), dst.get_text(&k).unwrap());
    }
}

// The wire form survives serialisation: kind line, key, parents, payload.
#[test]
fn network_stream_round_trip() {
    let src = file_knit(Rc::new(MemoryTransport::new()), false);
    insert_diamond(&src);
    let factories = src
        .get_record_stream(&diamond_keys(), Ordering::Topological, false)
        .unwrap();
    let wire: Vec<Vec<u8>> = factories
        .iter()
        .map(|f| f.get_bytes_as(f.storage_kind()).unwrap().into_bytes())
        .collect();

    let parsed = knit_store::NetworkRecordStream::read(wire).unwrap();
    let dst = file_knit(Rc::new(MemoryTransport::new()), false);
    dst.insert_record_stream(parsed).unwrap();
    for k in diamond_keys() {
        assert_eq!(src.get_text(&k).unwrap(), dst.get_text(&k).unwrap());
    }
}

// Keys only present in a fallback read identically through the stacked
// store.
#[test]
fn fallback_transparency() {
    let backing = Rc::new(file_knit(Rc::new(MemoryTransport::new()), false));
    insert_diamond(&backing);
    let mut front = file_knit(Rc::new(MemoryTransport::new()), false);
    front.add_fallback(backing.clone());

    assert_eq!(
        front.get_text(&key("merged")).unwrap(),
        backing.get_text(&key("merged")).unwrap()
    );
    // The stream path can produce fulltexts for fallback keys too.
    let factories = front
        .get_record_stream(&[key("merged")], Ordering::Unordered, true)
        .unwrap();
    let texts: Vec<Vec<u8>> = factories
        .iter()
        .filter(|f| f.storage_kind() != StorageKind::Absent)
        .map(|f| f.get_bytes_as(StorageKind::Fulltext).unwrap().into_bytes())
        .collect();
    assert_eq!(texts, vec![b"base\nleft\nright\nmerged\n".to_vec()]);

    // A local insert on top of a fallback basis stays a fulltext; deltas
    // never span store boundaries.
    front
        .add_lines(&key("child"), &[key("merged")], lines(&["novel\n"]))
        .unwrap();
    assert_eq!(
        front.index().get_method(&key("child")).unwrap(),
        Method::Fulltext
    );
    assert!(front.without_fallbacks().get_lines(&key("merged")).is_err());
}

#[test]
fn mpdiff_round_trip() {
    let src = file_knit(Rc::new(MemoryTransport::new()), false);
    insert_diamond(&src);
    let keys = diamond_keys();
    let diffs = src.make_mpdiffs(&keys).unwrap();
    let sha1s = src.get_sha1s(&keys).unwrap();
    let parent_map = src.get_parent_map(&keys).unwrap();

    let dst = file_knit(Rc::new(MemoryTransport::new()), false);
    let records: Vec<MpDiffRecord> = keys
        .iter()
        .zip(diffs)
        .map(|(k, diff)| MpDiffRecord {
            key: k.clone(),
            parents: parent_map[k].clone(),
            expected_sha1: sha1s[k],
            diff,
        })
        .collect();
    dst.add_mpdiffs(records).unwrap();
    for k in &keys {
        assert_eq!(src.get_text(k).unwrap(), dst.get_text(k).unwrap());
    }
}

#[test]
fn iter_lines_visits_stored_content() {
    let store = file_knit(Rc::new(MemoryTransport::new()), false);
    insert_diamond(&store);
    let mut progress = NoProgress;
    let found = store
        .iter_lines_added_or_present_in_keys(&diamond_keys(), &mut progress)
        .unwrap();
    assert!(found
        .iter()
        .any(|(line, k)| line == b"merged\n" && k == &key("merged")));
    assert!(found
        .iter()
        .any(|(line, k)| line == b"origin\n" && k == &key("origin")));
}

#[test]
fn duplicate_stream_insert_is_tolerated() {
    let src = file_knit(Rc::new(MemoryTransport::new()), false);
    insert_diamond(&src);
    let dst = KnitStore::make_pack_knit(Rc::new(MemoryTransport::new()), true).unwrap();
    for _ in 0..2 {
        let factories = src
            .get_record_stream(&diamond_keys(), Ordering::Topological, false)
            .unwrap();
        dst.insert_record_stream(factories).unwrap();
    }
    assert_eq!(
        dst.get_text(&key("merged")).unwrap(),
        b"base\nleft\nright\nmerged\n"
    );
}

#[test]
fn on_disk_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let transport = Rc::new(knit_store::FsTransport::new(dir.path()));
        let store = KnitStore::make_file_knit(
            transport,
            Rc::new(ConstantMapper("texts".to_string())),
            false,
            false,
        );
        insert_diamond(&store);
    }
    let transport = Rc::new(knit_store::FsTransport::new(dir.path()));
    let reopened = KnitStore::make_file_knit(
        transport,
        Rc::new(ConstantMapper("texts".to_string())),
        false,
        false,
    );
    assert_eq!(
        reopened.get_text(&key("merged")).unwrap(),
        b"base\nleft\nright\nmerged\n"
    );
    assert_eq!(reopened.keys().unwrap().len(), 5);
}

#[test]
fn unordered_local_reads_come_back_in_disk_order() {
    let store = file_knit(Rc::new(MemoryTransport::new()), false);
    insert_diamond(&store);
    let factories = store
        .get_record_stream(&diamond_keys(), Ordering::Unordered, false)
        .unwrap();
    assert_eq!(factories.len(), 5);
    let mut offsets = Vec::new();
    for factory in &factories {
        let memo: AccessMemo = store.index().get_position(factory.key()).unwrap();
        assert!(matches!(memo.bucket, Bucket::Prefix(_)));
        offsets.push(memo.offset);
    }
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    assert_eq!(offsets, sorted);
}
