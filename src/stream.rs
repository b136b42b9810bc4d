//! Record streams: the lazy factories handed out by `get_record_stream` and
//! consumed by `insert_record_stream`, plus the wire form each factory can
//! serialise itself into for replication between stores.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::rc::Rc;

use crate::codec::{self, Digest};
use crate::content::{ContentKind, KnitContent, Method, split_lines};
use crate::error::{Error, Result};
use crate::key::{Key, ParentKeys};
use crate::store::KnitStore;

/// Every representation a record can be asked for. The knit kinds carry raw
/// compressed record bytes; the last four are expanded forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    KnitFtGz,
    KnitDeltaGz,
    KnitAnnotatedFtGz,
    KnitAnnotatedDeltaGz,
    KnitDeltaClosure,
    KnitDeltaClosureRef,
    Fulltext,
    Chunked,
    Lines,
    Absent,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::KnitFtGz => "knit-ft-gz",
            StorageKind::KnitDeltaGz => "knit-delta-gz",
            StorageKind::KnitAnnotatedFtGz => "knit-annotated-ft-gz",
            StorageKind::KnitAnnotatedDeltaGz => "knit-annotated-delta-gz",
            StorageKind::KnitDeltaClosure => "knit-delta-closure",
            StorageKind::KnitDeltaClosureRef => "knit-delta-closure-ref",
            StorageKind::Fulltext => "fulltext",
            StorageKind::Chunked => "chunked",
            StorageKind::Lines => "lines",
            StorageKind::Absent => "absent",
        }
    }

    pub fn parse(name: &[u8]) -> Option<StorageKind> {
        Some(match name {
            b"knit-ft-gz" => StorageKind::KnitFtGz,
            b"knit-delta-gz" => StorageKind::KnitDeltaGz,
            b"knit-annotated-ft-gz" => StorageKind::KnitAnnotatedFtGz,
            b"knit-annotated-delta-gz" => StorageKind::KnitAnnotatedDeltaGz,
            b"knit-delta-closure" => StorageKind::KnitDeltaClosure,
            b"knit-delta-closure-ref" => StorageKind::KnitDeltaClosureRef,
            b"fulltext" => StorageKind::Fulltext,
            b"chunked" => StorageKind::Chunked,
            b"lines" => StorageKind::Lines,
            b"absent" => StorageKind::Absent,
            _ => return None,
        })
    }

    pub fn for_knit_record(method: Method, annotated: bool) -> StorageKind {
        match (method, annotated) {
            (Method::Fulltext, false) => StorageKind::KnitFtGz,
            (Method::LineDelta, false) => StorageKind::KnitDeltaGz,
            (Method::Fulltext, true) => StorageKind::KnitAnnotatedFtGz,
            (Method::LineDelta, true) => StorageKind::KnitAnnotatedDeltaGz,
        }
    }

    pub fn is_knit(&self) -> bool {
        matches!(
            self,
            StorageKind::KnitFtGz
                | StorageKind::KnitDeltaGz
                | StorageKind::KnitAnnotatedFtGz
                | StorageKind::KnitAnnotatedDeltaGz
        )
    }

    pub fn is_knit_delta(&self) -> bool {
        matches!(self, StorageKind::KnitDeltaGz | StorageKind::KnitAnnotatedDeltaGz)
    }

    pub fn is_knit_annotated(&self) -> bool {
        matches!(
            self,
            StorageKind::KnitAnnotatedFtGz | StorageKind::KnitAnnotatedDeltaGz
        )
    }

    pub fn is_expanded(&self) -> bool {
        matches!(
            self,
            StorageKind::Fulltext | StorageKind::Chunked | StorageKind::Lines
        )
    }
}

impl Display for StorageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a factory hands back: either one byte run or a list of them (the
/// `chunked` and `lines` representations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactoryBytes {
    Bytes(Vec<u8>),
    Chunks(Vec<Vec<u8>>),
}

impl FactoryBytes {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            FactoryBytes::Bytes(b) => b,
            FactoryBytes::Chunks(chunks) => chunks.concat(),
        }
    }

    pub fn into_lines(self) -> Vec<Vec<u8>> {
        match self {
            FactoryBytes::Bytes(b) => split_lines(&b),
            FactoryBytes::Chunks(chunks) => chunks,
        }
    }
}

/// One record in a stream. Factories expose metadata cheaply and produce
/// bytes on demand; callers wanting to keep a representation must materialise
/// it before moving on.
pub trait ContentFactory {
    fn key(&self) -> &Key;

    /// None means no graph information is available, as opposed to an empty
    /// parent list.
    fn parents(&self) -> Option<&[Key]>;

    fn sha1(&self) -> Option<&Digest>;

    fn size(&self) -> Option<usize>;

    fn storage_kind(&self) -> StorageKind;

    /// The raw compressed record bytes, for knit kinds.
    fn raw_record(&self) -> Option<&[u8]> {
        None
    }

    /// (method, no_eol), for knit kinds.
    fn build_details(&self) -> Option<(Method, bool)> {
        None
    }

    fn get_bytes_as(&self, kind: StorageKind) -> Result<FactoryBytes>;
}

fn unavailable(factory: &dyn ContentFactory, wanted: StorageKind) -> Error {
    Error::UnavailableRepresentation {
        key: factory.key().clone(),
        wanted,
        native: factory.storage_kind(),
    }
}

// *** Wire helpers shared by the factories.

fn key_to_wire(key: &Key) -> Vec<u8> {
    key.0.join(&b'\0')
}

fn key_from_wire(bytes: &[u8]) -> Key {
    Key(bytes.split(|&b| b == b'\0').map(|c| c.to_vec()).collect())
}

fn parents_to_wire(parents: Option<&[Key]>) -> Vec<u8> {
    match parents {
        None => b"None:".to_vec(),
        Some(parents) => {
            let encoded: Vec<Vec<u8>> = parents.iter().map(key_to_wire).collect();
            encoded.join(&b'\t')
        }
    }
}

fn parents_from_wire(bytes: &[u8]) -> Option<ParentKeys> {
    if bytes == b"None:" {
        return None;
    }
    Some(
        bytes
            .split(|&b| b == b'\t')
            .filter(|seg| !seg.is_empty())
            .map(key_from_wire)
            .collect(),
    )
}

/// Strip the storage kind line off the front of a network record.
pub fn network_bytes_to_kind_and_offset(network_bytes: &[u8]) -> Result<(StorageKind, usize)> {
    let line_end = network_bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| Error::corrupt("network", "record missing kind line"))?;
    let kind = StorageKind::parse(&network_bytes[..line_end])
        .ok_or_else(|| Error::corrupt("network", "unknown storage kind"))?;
    Ok((kind, line_end + 1))
}

// *** The factory for records straight out of a knit.

pub struct KnitContentFactory<'a> {
    key: Key,
    parents: Option<ParentKeys>,
    method: Method,
    no_eol: bool,
    sha1: Option<Digest>,
    raw_record: Vec<u8>,
    annotated: bool,
    /// When set, delta records can be expanded through the owning store.
    knit: Option<&'a KnitStore>,
    network_bytes: RefCell<Option<Vec<u8>>>,
}

impl<'a> KnitContentFactory<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: Key,
        parents: Option<ParentKeys>,
        method: Method,
        no_eol: bool,
        sha1: Option<Digest>,
        raw_record: Vec<u8>,
        annotated: bool,
        knit: Option<&'a KnitStore>,
    ) -> KnitContentFactory<'a> {
        KnitContentFactory {
            key,
            parents,
            method,
            no_eol,
            sha1,
            raw_record,
            annotated,
            knit,
            network_bytes: RefCell::new(None),
        }
    }

    fn with_network_bytes(self, network_bytes: Vec<u8>) -> KnitContentFactory<'a> {
        *self.network_bytes.borrow_mut() = Some(network_bytes);
        self
    }

    fn create_network_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw_record.len() + 64);
        out.extend_from_slice(self.storage_kind().as_str().as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&key_to_wire(&self.key));
        out.push(b'\n');
        out.extend_from_slice(&parents_to_wire(self.parents.as_deref()));
        out.push(b'\n');
        out.push(if self.no_eol { b'N' } else { b' ' });
        out.extend_from_slice(&self.raw_record);
        out
    }
}

impl<'a> ContentFactory for KnitContentFactory<'a> {
    fn key(&self) -> &Key {
        &self.key
    }

    fn parents(&self) -> Option<&[Key]> {
        self.parents.as_deref()
    }

    fn sha1(&self) -> Option<&Digest> {
        self.sha1.as_ref()
    }

    fn size(&self) -> Option<usize> {
        None
    }

    fn storage_kind(&self) -> StorageKind {
        StorageKind::for_knit_record(self.method, self.annotated)
    }

    fn raw_record(&self) -> Option<&[u8]> {
        Some(&self.raw_record)
    }

    fn build_details(&self) -> Option<(Method, bool)> {
        Some((self.method, self.no_eol))
    }

    fn get_bytes_as(&self, kind: StorageKind) -> Result<FactoryBytes> {
        if kind == self.storage_kind() {
            let mut cached = self.network_bytes.borrow_mut();
            if cached.is_none() {
                *cached = Some(self.create_network_bytes());
            }
            return Ok(FactoryBytes::Bytes(cached.clone().unwrap()));
        }
        if kind.is_expanded() {
            if self.method == Method::Fulltext {
                // Fulltexts convert without touching the store.
                return crate::adapters::adapt(self, kind, None);
            }
            if let Some(knit) = self.knit {
                let lines = knit.get_lines(&self.key)?;
                return Ok(match kind {
                    StorageKind::Fulltext => FactoryBytes::Bytes(lines.concat()),
                    _ => FactoryBytes::Chunks(lines),
                });
            }
        }
        Err(unavailable(self, kind))
    }
}

// *** Simple factories.

pub struct AbsentContentFactory {
    key: Key,
}

impl AbsentContentFactory {
    pub fn new(key: Key) -> AbsentContentFactory {
        AbsentContentFactory { key }
    }
}

impl ContentFactory for AbsentContentFactory {
    fn key(&self) -> &Key {
        &self.key
    }

    fn parents(&self) -> Option<&[Key]> {
        None
    }

    fn sha1(&self) -> Option<&Digest> {
        None
    }

    fn size(&self) -> Option<usize> {
        None
    }

    fn storage_kind(&self) -> StorageKind {
        StorageKind::Absent
    }

    fn get_bytes_as(&self, kind: StorageKind) -> Result<FactoryBytes> {
        Err(unavailable(self, kind))
    }
}

pub struct FulltextContentFactory {
    key: Key,
    parents: Option<ParentKeys>,
    sha1: Option<Digest>,
    text: Vec<u8>,
}

impl FulltextContentFactory {
    pub fn new(
        key: Key,
        parents: Option<ParentKeys>,
        sha1: Option<Digest>,
        text: Vec<u8>,
    ) -> FulltextContentFactory {
        FulltextContentFactory { key, parents, sha1, text }
    }
}

impl ContentFactory for FulltextContentFactory {
    fn key(&self) -> &Key {
        &self.key
    }

    fn parents(&self) -> Option<&[Key]> {
        self.parents.as_deref()
    }

    fn sha1(&self) -> Option<&Digest> {
        self.sha1.as_ref()
    }

    fn size(&self) -> Option<usize> {
        Some(self.text.len())
    }

    fn storage_kind(&self) -> StorageKind {
        StorageKind::Fulltext
    }

    fn get_bytes_as(&self, kind: StorageKind) -> Result<FactoryBytes> {
        match kind {
            StorageKind::Fulltext => Ok(FactoryBytes::Bytes(self.text.clone())),
            StorageKind::Chunked | StorageKind::Lines => {
                Ok(FactoryBytes::Chunks(split_lines(&self.text)))
            }
            _ => Err(unavailable(self, kind)),
        }
    }
}

pub struct ChunkedContentFactory {
    key: Key,
    parents: Option<ParentKeys>,
    sha1: Option<Digest>,
    chunks: Vec<Vec<u8>>,
}

impl ChunkedContentFactory {
    pub fn new(
        key: Key,
        parents: Option<ParentKeys>,
        sha1: Option<Digest>,
        chunks: Vec<Vec<u8>>,
    ) -> ChunkedContentFactory {
        ChunkedContentFactory { key, parents, sha1, chunks }
    }
}

impl ContentFactory for ChunkedContentFactory {
    fn key(&self) -> &Key {
        &self.key
    }

    fn parents(&self) -> Option<&[Key]> {
        self.parents.as_deref()
    }

    fn sha1(&self) -> Option<&Digest> {
        self.sha1.as_ref()
    }

    fn size(&self) -> Option<usize> {
        Some(self.chunks.iter().map(|c| c.len()).sum())
    }

    fn storage_kind(&self) -> StorageKind {
        StorageKind::Chunked
    }

    fn get_bytes_as(&self, kind: StorageKind) -> Result<FactoryBytes> {
        match kind {
            StorageKind::Fulltext => Ok(FactoryBytes::Bytes(self.chunks.concat())),
            StorageKind::Chunked | StorageKind::Lines => {
                Ok(FactoryBytes::Chunks(self.chunks.clone()))
            }
            _ => Err(unavailable(self, kind)),
        }
    }
}

// *** Delta closure: a bundle of raw records plus the map needed to expand
// them without the source store.

#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub raw: Vec<u8>,
    pub method: Method,
    pub no_eol: bool,
    /// Compression parent, i.e. the next component in the build chain.
    pub next: Option<Key>,
}

/// Expands a set of keys from a prefetched raw record map, caching contents
/// so shared bases parse once.
pub struct ContentMapGenerator<'a> {
    pub(crate) vf: Option<&'a KnitStore>,
    pub(crate) content_kind: ContentKind,
    pub(crate) keys: Vec<Key>,
    pub(crate) nonlocal_keys: HashSet<Key>,
    pub(crate) global_map: HashMap<Key, Option<ParentKeys>>,
    pub(crate) raw_record_map: HashMap<Key, RawEntry>,
    contents_map: HashMap<Key, KnitContent>,
    /// The original wire bytes when this generator was itself parsed off the
    /// network.
    network_bytes: Option<Vec<u8>>,
}

impl<'a> ContentMapGenerator<'a> {
    pub(crate) fn new(
        vf: &'a KnitStore,
        content_kind: ContentKind,
        keys: Vec<Key>,
        nonlocal_keys: HashSet<Key>,
        global_map: HashMap<Key, Option<ParentKeys>>,
        raw_record_map: HashMap<Key, RawEntry>,
    ) -> ContentMapGenerator<'a> {
        ContentMapGenerator {
            vf: Some(vf),
            content_kind,
            keys,
            nonlocal_keys,
            global_map,
            raw_record_map,
            contents_map: HashMap::new(),
            network_bytes: None,
        }
    }

    /// Reconstruct one key from the prefetched records: walk the component
    /// chain down to a fulltext, parse bottom-up, verify the digest.
    pub(crate) fn get_one_work(&mut self, requested_key: &Key) -> Result<KnitContent> {
        if let Some(content) = self.contents_map.get(requested_key) {
            return Ok(content.clone());
        }
        let mut components: Vec<Key> = Vec::new();
        let mut cursor = Some(requested_key.clone());
        let mut digest: Option<Digest> = None;
        while let Some(key) = cursor {
            if self.contents_map.contains_key(&key) {
                components.push(key);
                break;
            }
            let Some(entry) = self.raw_record_map.get(&key) else {
                // Not among the prefetched records. When a backing store is
                // around the text may still live in one of its fallbacks.
                let Some(vf) = self.vf else {
                    return Err(Error::RevisionNotPresent(key.clone()));
                };
                let content = vf.get_content(&key)?;
                self.contents_map.insert(key.clone(), content);
                components.push(key);
                break;
            };
            cursor = entry.next.clone();
            components.push(key);
        }
        let mut content: Option<KnitContent> = None;
        for key in components.iter().rev() {
            if let Some(cached) = self.contents_map.get(key) {
                content = Some(cached.clone());
                continue;
            }
            let entry = &self.raw_record_map[key];
            let (payload, record_digest) = codec::parse_record("closure", key.suffix(), &entry.raw)?;
            let (new_content, _delta) = self.content_kind.parse_record(
                "closure",
                key.suffix(),
                &payload,
                entry.method,
                entry.no_eol,
                content.as_ref(),
            )?;
            if key == requested_key {
                digest = Some(record_digest);
            }
            self.contents_map.insert(key.clone(), new_content.clone());
            content = Some(new_content);
        }
        let content = content.expect("component walk produced no content");
        if let Some(expected) = digest {
            let text = content.text();
            let actual = codec::sha1_lines(&text);
            if actual != expected {
                return Err(Error::Sha1Mismatch {
                    key: requested_key.clone(),
                    expected,
                    actual,
                    content: text,
                });
            }
        }
        Ok(content)
    }

    /// The serialised closure: kind marker, annotated flag, contained keys,
    /// then every raw record with enough metadata to rebuild the map.
    pub(crate) fn wire_bytes(&self) -> Vec<u8> {
        if let Some(bytes) = &self.network_bytes {
            return bytes.clone();
        }
        let mut out = Vec::new();
        out.extend_from_slice(b"knit-delta-closure\n");
        if self.content_kind.annotated() {
            out.extend_from_slice(b"annotated");
        }
        out.push(b'\n');
        let local: Vec<Vec<u8>> = self
            .keys
            .iter()
            .filter(|k| !self.nonlocal_keys.contains(k))
            .map(key_to_wire)
            .collect();
        out.extend_from_slice(&local.join(&b'\t'));
        out.push(b'\n');
        for (key, entry) in &self.raw_record_map {
            out.extend_from_slice(&key_to_wire(key));
            out.push(b'\n');
            let parents = self.global_map.get(key).cloned().flatten();
            out.extend_from_slice(&parents_to_wire(parents.as_deref()));
            out.push(b'\n');
            out.extend_from_slice(entry.method.as_bytes());
            out.push(b'\n');
            out.push(if entry.no_eol { b'T' } else { b'F' });
            out.push(b'\n');
            if let Some(next) = &entry.next {
                out.extend_from_slice(&key_to_wire(next));
            }
            out.push(b'\n');
            out.extend_from_slice(entry.raw.len().to_string().as_bytes());
            out.push(b'\n');
            out.extend_from_slice(&entry.raw);
        }
        out
    }

    /// Parse a closure off the wire. `offset` points just past the kind
    /// line.
    pub fn from_network_bytes(bytes: &[u8], offset: usize) -> Result<ContentMapGenerator<'static>> {
        let corrupt = || Error::corrupt("network", "truncated delta closure");
        let next_line = |start: usize| -> Result<(usize, usize)> {
            let end = bytes[start..]
                .iter()
                .position(|&b| b == b'\n')
                .ok_or_else(corrupt)?;
            Ok((start + end, start + end + 1))
        };
        let mut start = offset;
        let (line_end, after) = next_line(start)?;
        let content_kind = if &bytes[start..line_end] == b"annotated" {
            ContentKind::Annotated
        } else {
            ContentKind::Plain
        };
        start = after;
        let (line_end, after) = next_line(start)?;
        let keys: Vec<Key> = bytes[start..line_end]
            .split(|&b| b == b'\t')
            .filter(|seg| !seg.is_empty())
            .map(key_from_wire)
            .collect();
        start = after;

        let mut global_map = HashMap::new();
        let mut raw_record_map = HashMap::new();
        while start < bytes.len() {
            let (line_end, after) = next_line(start)?;
            let key = key_from_wire(&bytes[start..line_end]);
            start = after;
            let (line_end, after) = next_line(start)?;
            let parents = parents_from_wire(&bytes[start..line_end]);
            start = after;
            let (line_end, after) = next_line(start)?;
            let method = match &bytes[start..line_end] {
                b"fulltext" => Method::Fulltext,
                b"line-delta" => Method::LineDelta,
                other => {
                    return Err(Error::corrupt(
                        "network",
                        format!("unknown method {:?}", String::from_utf8_lossy(other)),
                    ))
                }
            };
            start = after;
            let (line_end, after) = next_line(start)?;
            let no_eol = &bytes[start..line_end] == b"T";
            start = after;
            let (line_end, after) = next_line(start)?;
            let next = if line_end == start {
                None
            } else {
                Some(key_from_wire(&bytes[start..line_end]))
            };
            start = after;
            let (line_end, after) = next_line(start)?;
            let count: usize = std::str::from_utf8(&bytes[start..line_end])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(corrupt)?;
            start = after;
            if start + count > bytes.len() {
                return Err(corrupt());
            }
            let raw = bytes[start..start + count].to_vec();
            start += count;
            global_map.insert(key.clone(), parents);
            raw_record_map.insert(key, RawEntry { raw, method, no_eol, next });
        }
        Ok(ContentMapGenerator {
            vf: None,
            content_kind,
            keys,
            nonlocal_keys: HashSet::new(),
            global_map,
            raw_record_map,
            contents_map: HashMap::new(),
            network_bytes: Some(bytes.to_vec()),
        })
    }

    /// The factories for the keys this generator carries. The first one owns
    /// the wire payload; the rest are references into it.
    pub(crate) fn record_stream(
        generator: Rc<RefCell<ContentMapGenerator<'a>>>,
    ) -> Vec<Box<dyn ContentFactory + 'a>> {
        let (keys, nonlocal, global_map) = {
            let g = generator.borrow();
            (g.keys.clone(), g.nonlocal_keys.clone(), g.global_map.clone())
        };
        let mut factories: Vec<Box<dyn ContentFactory + 'a>> = Vec::new();
        let mut first = true;
        for key in keys {
            if nonlocal.contains(&key) {
                continue;
            }
            let parents = global_map.get(&key).cloned().flatten();
            factories.push(Box::new(LazyClosureFactory {
                key,
                parents,
                generator: generator.clone(),
                first,
            }));
            first = false;
        }
        factories
    }
}

/// A factory backed by a `ContentMapGenerator`; can produce either the wire
/// closure or expanded texts.
pub struct LazyClosureFactory<'a> {
    key: Key,
    parents: Option<ParentKeys>,
    generator: Rc<RefCell<ContentMapGenerator<'a>>>,
    first: bool,
}

impl<'a> ContentFactory for LazyClosureFactory<'a> {
    fn key(&self) -> &Key {
        &self.key
    }

    fn parents(&self) -> Option<&[Key]> {
        self.parents.as_deref()
    }

    fn sha1(&self) -> Option<&Digest> {
        None
    }

    fn size(&self) -> Option<usize> {
        None
    }

    fn storage_kind(&self) -> StorageKind {
        if self.first {
            StorageKind::KnitDeltaClosure
        } else {
            StorageKind::KnitDeltaClosureRef
        }
    }

    fn get_bytes_as(&self, kind: StorageKind) -> Result<FactoryBytes> {
        if kind == self.storage_kind() {
            return Ok(FactoryBytes::Bytes(if self.first {
                self.generator.borrow().wire_bytes()
            } else {
                // The first record carries everything.
                Vec::new()
            }));
        }
        if kind.is_expanded() {
            let content = self.generator.borrow_mut().get_one_work(&self.key)?;
            let lines = content.text();
            return Ok(match kind {
                StorageKind::Fulltext => FactoryBytes::Bytes(lines.concat()),
                _ => FactoryBytes::Chunks(lines),
            });
        }
        Err(unavailable(self, kind))
    }
}

/// Drop absent records from a stream, for callers that treat absence as
/// fine.
pub fn filter_absent<'a>(
    stream: Vec<Box<dyn ContentFactory + 'a>>,
) -> Vec<Box<dyn ContentFactory + 'a>> {
    stream
        .into_iter()
        .filter(|record| record.storage_kind() != StorageKind::Absent)
        .collect()
}

// *** Reconstituting records from the wire.

/// Parse a single non-closure network record.
pub fn knit_network_to_record(
    kind: StorageKind,
    bytes: &[u8],
    offset: usize,
) -> Result<KnitContentFactory<'static>> {
    let corrupt = || Error::corrupt("network", "truncated knit record");
    let find = |start: usize| -> Result<usize> {
        bytes[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| start + p)
            .ok_or_else(corrupt)
    };
    let line_end = find(offset)?;
    let key = key_from_wire(&bytes[offset..line_end]);
    let start = line_end + 1;
    let line_end = find(start)?;
    let parents = parents_from_wire(&bytes[start..line_end]);
    let start = line_end + 1;
    if start >= bytes.len() {
        return Err(corrupt());
    }
    let no_eol = bytes[start] == b'N';
    let method = if kind.is_knit_delta() {
        Method::LineDelta
    } else {
        Method::Fulltext
    };
    let raw_record = bytes[start + 1..].to_vec();
    Ok(KnitContentFactory::new(
        key,
        parents,
        method,
        no_eol,
        None,
        raw_record,
        kind.is_knit_annotated(),
        None,
    )
    .with_network_bytes(bytes.to_vec()))
}

/// Serialise a factory's fulltext for the wire under the `fulltext` kind.
pub fn record_to_fulltext_bytes(record: &dyn ContentFactory) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(b"fulltext\n");
    out.extend_from_slice(&key_to_wire(record.key()));
    out.push(b'\n');
    out.extend_from_slice(&parents_to_wire(record.parents()));
    out.push(b'\n');
    out.extend_from_slice(&record.get_bytes_as(StorageKind::Fulltext)?.into_bytes());
    Ok(out)
}

/// Parse a `fulltext` network record.
pub fn fulltext_network_to_record(bytes: &[u8], offset: usize) -> Result<FulltextContentFactory> {
    let corrupt = || Error::corrupt("network", "truncated fulltext record");
    let find = |start: usize| -> Result<usize> {
        bytes[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| start + p)
            .ok_or_else(corrupt)
    };
    let line_end = find(offset)?;
    let key = key_from_wire(&bytes[offset..line_end]);
    let start = line_end + 1;
    let line_end = find(start)?;
    let parents = parents_from_wire(&bytes[start..line_end]);
    let text = bytes[line_end + 1..].to_vec();
    Ok(FulltextContentFactory::new(key, parents, None, text))
}

/// Rebuild a record stream from serialised records, whatever their kinds.
pub struct NetworkRecordStream;

impl NetworkRecordStream {
    pub fn read(
        bytes_iterator: impl IntoIterator<Item = Vec<u8>>,
    ) -> Result<Vec<Box<dyn ContentFactory + 'static>>> {
        let mut out: Vec<Box<dyn ContentFactory + 'static>> = Vec::new();
        for bytes in bytes_iterator {
            let (kind, offset) = network_bytes_to_kind_and_offset(&bytes)?;
            match kind {
                StorageKind::Fulltext => {
                    out.push(Box::new(fulltext_network_to_record(&bytes, offset)?));
                }
                k if k.is_knit() => {
                    out.push(Box::new(knit_network_to_record(k, &bytes, offset)?));
                }
                StorageKind::KnitDeltaClosure => {
                    let generator = ContentMapGenerator::from_network_bytes(&bytes, offset)?;
                    let generator = Rc::new(RefCell::new(generator));
                    out.extend(ContentMapGenerator::record_stream(generator));
                }
                StorageKind::KnitDeltaClosureRef => {
                    // All data lives in the closure record that preceded it.
                }
                other => {
                    return Err(Error::corrupt(
                        "network",
                        format!("cannot parse stream record of kind {}", other),
                    ));
                }
            }
        }
        Ok(out)
    }
}
