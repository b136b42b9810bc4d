//! Stateless record transforms, keyed by (source kind, target kind). They
//! let a stream produced by one flavour of store feed another: annotations
//! strip off on the fly, deltas expand against a basis provider.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::codec;
use crate::content::{ContentKind, KnitContent, Method};
use crate::delta::{self, LineDelta};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::stream::{ContentFactory, FactoryBytes, StorageKind};

/// Where adapters that expand deltas fetch their basis text from. Takes the
/// place of a concrete store pointer so adapter logic stays ignorant of the
/// store-plus-fallbacks graph.
pub trait BasisProvider {
    /// The output lines of `key`'s fulltext.
    fn basis_lines(&self, key: &Key) -> Result<Vec<Vec<u8>>>;
}

type AdapterFn =
    fn(&dyn ContentFactory, StorageKind, Option<&dyn BasisProvider>) -> Result<FactoryBytes>;

fn unavailable(factory: &dyn ContentFactory, wanted: StorageKind) -> Error {
    Error::UnavailableRepresentation {
        key: factory.key().clone(),
        wanted,
        native: factory.storage_kind(),
    }
}

fn raw_and_details(factory: &dyn ContentFactory) -> Result<(&[u8], Method, bool)> {
    match (factory.raw_record(), factory.build_details()) {
        (Some(raw), Some((method, no_eol))) => Ok((raw, method, no_eol)),
        _ => Err(unavailable(factory, factory.storage_kind())),
    }
}

fn source_kind(factory: &dyn ContentFactory) -> ContentKind {
    if factory.storage_kind().is_knit_annotated() {
        ContentKind::Annotated
    } else {
        ContentKind::Plain
    }
}

fn expanded(content: &KnitContent, target: StorageKind) -> FactoryBytes {
    let lines = content.text();
    match target {
        StorageKind::Fulltext => FactoryBytes::Bytes(lines.concat()),
        _ => FactoryBytes::Chunks(lines),
    }
}

/// annotated-ft -> plain-ft: strip origins, re-frame.
fn ft_annotated_to_unannotated(
    factory: &dyn ContentFactory,
    _target: StorageKind,
    _basis: Option<&dyn BasisProvider>,
) -> Result<FactoryBytes> {
    let (raw, _, _) = raw_and_details(factory)?;
    let (header, payload) = codec::parse_record_unchecked("adapter", raw)?;
    let content = ContentKind::Annotated.parse_fulltext("adapter", &payload, &header.version_id)?;
    let (_, data) = codec::record_to_data(&header.version_id, &header.digest, &content.storage_lines())?;
    Ok(FactoryBytes::Bytes(data))
}

/// annotated-delta -> plain-delta: strip origins off the hunk lines.
fn delta_annotated_to_unannotated(
    factory: &dyn ContentFactory,
    _target: StorageKind,
    _basis: Option<&dyn BasisProvider>,
) -> Result<FactoryBytes> {
    let (raw, _, _) = raw_and_details(factory)?;
    let (header, payload) = codec::parse_record_unchecked("adapter", raw)?;
    let hunks = delta::parse_annotated_as_plain("adapter", &payload)?;
    let (_, data) =
        codec::record_to_data(&header.version_id, &header.digest, &delta::lower_plain(&hunks))?;
    Ok(FactoryBytes::Bytes(data))
}

/// Any fulltext knit record -> expanded form.
fn ft_to_expanded(
    factory: &dyn ContentFactory,
    target: StorageKind,
    _basis: Option<&dyn BasisProvider>,
) -> Result<FactoryBytes> {
    let (raw, method, no_eol) = raw_and_details(factory)?;
    debug_assert_eq!(method, Method::Fulltext);
    let (header, payload) = codec::parse_record_unchecked("adapter", raw)?;
    let (content, _) = source_kind(factory).parse_record(
        "adapter",
        &header.version_id,
        &payload,
        Method::Fulltext,
        no_eol,
        None,
    )?;
    Ok(expanded(&content, target))
}

/// Any delta knit record -> expanded form, fetching the basis text through
/// the provider.
fn delta_to_expanded(
    factory: &dyn ContentFactory,
    target: StorageKind,
    basis: Option<&dyn BasisProvider>,
) -> Result<FactoryBytes> {
    let (raw, method, no_eol) = raw_and_details(factory)?;
    debug_assert_eq!(method, Method::LineDelta);
    let basis = basis.ok_or_else(|| unavailable(factory, target))?;
    let compression_parent = factory
        .parents()
        .and_then(|p| p.first())
        .cloned()
        .ok_or_else(|| unavailable(factory, target))?;
    let (header, payload) = codec::parse_record_unchecked("adapter", raw)?;
    let hunks = match source_kind(factory) {
        ContentKind::Annotated => delta::parse_annotated_as_plain("adapter", &payload)?,
        ContentKind::Plain => delta::parse_plain("adapter", &payload)?,
    };
    let basis_lines = basis.basis_lines(&compression_parent)?;
    let mut content = KnitContent::Plain {
        lines: basis_lines,
        version_id: compression_parent.suffix().to_vec(),
        strip_eol: false,
    };
    content.apply_delta(&LineDelta::Plain(hunks), &header.version_id);
    content.set_strip_eol(no_eol);
    Ok(expanded(&content, target))
}

lazy_static! {
    static ref ADAPTER_REGISTRY: HashMap<(StorageKind, StorageKind), AdapterFn> = {
        use StorageKind::*;
        let mut m: HashMap<(StorageKind, StorageKind), AdapterFn> = HashMap::new();
        m.insert((KnitAnnotatedFtGz, KnitFtGz), ft_annotated_to_unannotated as AdapterFn);
        m.insert((KnitAnnotatedDeltaGz, KnitDeltaGz), delta_annotated_to_unannotated);
        for target in [Fulltext, Chunked, Lines] {
            m.insert((KnitAnnotatedFtGz, target), ft_to_expanded);
            m.insert((KnitFtGz, target), ft_to_expanded);
            m.insert((KnitAnnotatedDeltaGz, target), delta_to_expanded);
            m.insert((KnitDeltaGz, target), delta_to_expanded);
        }
        m
    };
}

/// Convert a record to `target`, or report the representation unavailable.
pub fn adapt(
    factory: &dyn ContentFactory,
    target: StorageKind,
    basis: Option<&dyn BasisProvider>,
) -> Result<FactoryBytes> {
    match ADAPTER_REGISTRY.get(&(factory.storage_kind(), target)) {
        Some(adapter) => adapter(factory, target, basis),
        None => Err(unavailable(factory, target)),
    }
}

/// True when a direct conversion between the kinds is registered.
pub fn has_adapter(source: StorageKind, target: StorageKind) -> bool {
    ADAPTER_REGISTRY.contains_key(&(source, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::sha1_lines;
    use crate::stream::KnitContentFactory;

    fn key(s: &str) -> Key {
        Key::from_slices(&[s.as_bytes()])
    }

    fn annotated_ft_factory() -> KnitContentFactory<'static> {
        let store_lines = vec![b"rev-1 hello\n".to_vec(), b"rev-1 world\n".to_vec()];
        let digest = sha1_lines(&[b"hello\n".to_vec(), b"world\n".to_vec()]);
        let (_, raw) = codec::record_to_data(b"rev-1", &digest, &store_lines).unwrap();
        KnitContentFactory::new(
            key("rev-1"),
            Some(Default::default()),
            Method::Fulltext,
            false,
            Some(digest),
            raw,
            true,
            None,
        )
    }

    struct FixedBasis(Vec<Vec<u8>>);

    impl BasisProvider for FixedBasis {
        fn basis_lines(&self, _key: &Key) -> Result<Vec<Vec<u8>>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn annotated_ft_strips_to_plain_record() {
        let factory = annotated_ft_factory();
        let converted = adapt(&factory, StorageKind::KnitFtGz, None)
            .unwrap()
            .into_bytes();
        let (payload, _) = codec::parse_record("t", b"rev-1", &converted).unwrap();
        assert_eq!(payload, vec![b"hello\n".to_vec(), b"world\n".to_vec()]);
    }

    #[test]
    fn annotated_ft_expands_to_fulltext() {
        let factory = annotated_ft_factory();
        assert_eq!(
            adapt(&factory, StorageKind::Fulltext, None).unwrap(),
            FactoryBytes::Bytes(b"hello\nworld\n".to_vec())
        );
        assert_eq!(
            adapt(&factory, StorageKind::Lines, None).unwrap(),
            FactoryBytes::Chunks(vec![b"hello\n".to_vec(), b"world\n".to_vec()])
        );
    }

    #[test]
    fn delta_expands_through_basis_provider() {
        let delta_payload = vec![b"1,1,1\n".to_vec(), b"replaced\n".to_vec()];
        let new_lines = vec![b"a\n".to_vec(), b"replaced\n".to_vec()];
        let digest = sha1_lines(&new_lines);
        let (_, raw) = codec::record_to_data(b"rev-2", &digest, &delta_payload).unwrap();
        let mut parents = crate::key::ParentKeys::new();
        parents.push(key("rev-1"));
        let factory = KnitContentFactory::new(
            key("rev-2"),
            Some(parents),
            Method::LineDelta,
            false,
            Some(digest),
            raw,
            false,
            None,
        );
        let basis = FixedBasis(vec![b"a\n".to_vec(), b"b\n".to_vec()]);
        assert_eq!(
            adapt(&factory, StorageKind::Fulltext, Some(&basis)).unwrap(),
            FactoryBytes::Bytes(b"a\nreplaced\n".to_vec())
        );
    }

    #[test]
    fn unregistered_conversion_is_unavailable() {
        // A fulltext cannot be turned into a delta record.
        let factory = annotated_ft_factory();
        assert!(matches!(
            adapt(&factory, StorageKind::KnitDeltaGz, None),
            Err(Error::UnavailableRepresentation { .. })
        ));
        assert!(!has_adapter(
            StorageKind::KnitAnnotatedFtGz,
            StorageKind::KnitDeltaGz
        ));
    }
}
