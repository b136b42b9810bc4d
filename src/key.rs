//! Keys are immutable tuples of byte strings. The last component is the
//! version id; everything before it is the prefix, which decides which index
//! and data file a record lands in. A store uses one arity throughout.

use std::fmt::{Debug, Display, Formatter};

use smallvec::SmallVec;

use crate::error::{Error, Result};

/// The components of a key. Two components (file id, version id) is the
/// overwhelmingly common case, so keep that inline.
pub type Components = SmallVec<Vec<u8>, 2>;

/// Parent lists are almost always 0..2 entries.
pub type ParentKeys = SmallVec<Key, 2>;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(pub Components);

impl Key {
    pub fn new(components: Components) -> Key {
        debug_assert!(!components.is_empty());
        Key(components)
    }

    /// Build a key from borrowed components.
    pub fn from_slices(components: &[&[u8]]) -> Key {
        Key(components.iter().map(|c| c.to_vec()).collect())
    }

    /// All components except the version id.
    pub fn prefix(&self) -> &[Vec<u8>] {
        &self.0[..self.0.len() - 1]
    }

    /// The version id.
    pub fn suffix(&self) -> &[u8] {
        self.0.last().unwrap().as_slice()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Clone the prefix components into an owned value, usable as a map key.
    pub fn prefix_key(&self) -> Components {
        self.prefix().iter().cloned().collect()
    }

    /// Rebuild a full key from a prefix and a version id.
    pub fn from_prefix(prefix: &[Vec<u8>], suffix: &[u8]) -> Key {
        let mut components: Components = prefix.iter().cloned().collect();
        components.push(suffix.to_vec());
        Key(components)
    }

    /// The content-addressed form used when the caller supplies no version
    /// id: `sha1:` plus the hex digest of the fulltext.
    pub fn with_content_address(prefix: &[Vec<u8>], digest_hex: &[u8]) -> Key {
        let mut suffix = b"sha1:".to_vec();
        suffix.extend_from_slice(digest_hex);
        Key::from_prefix(prefix, &suffix)
    }

    /// Validate the version id of a key about to be inserted. Whitespace
    /// would break the index line format; a trailing colon is reserved for
    /// generated namespaces (`sha1:`).
    pub fn check_usable_suffix(&self) -> Result<()> {
        let suffix = self.suffix();
        if suffix.is_empty() {
            return Err(Error::InvalidRevisionId(suffix.to_vec()));
        }
        if suffix.iter().any(|b| b.is_ascii_whitespace()) {
            return Err(Error::InvalidRevisionId(suffix.to_vec()));
        }
        if suffix.ends_with(b":") {
            return Err(Error::InvalidRevisionId(suffix.to_vec()));
        }
        Ok(())
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", String::from_utf8_lossy(component))?;
        }
        Ok(())
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", self)
    }
}

/// Maps keys to relative paths in the transport, and back. The mapper decides
/// how a store partitions its files; the store core never interprets paths.
pub trait KeyMapper {
    /// Map a key (or bare prefix, with an empty suffix slot allowed) to a
    /// relative path without extension.
    fn map(&self, prefix: &[Vec<u8>]) -> String;

    /// Recover the key prefix a path was generated from.
    fn unmap(&self, path: &str) -> Components;
}

/// Every key lands in one fixed path. Used for single-file stores such as a
/// revision log, where keys have arity 1 and the prefix is empty.
pub struct ConstantMapper(pub String);

impl KeyMapper for ConstantMapper {
    fn map(&self, _prefix: &[Vec<u8>]) -> String {
        self.0.clone()
    }

    fn unmap(&self, _path: &str) -> Components {
        SmallVec::new()
    }
}

/// Maps the first key component to a directory-safe file name. Bytes outside
/// the unreserved set are percent-escaped so arbitrary file ids stay legal
/// path segments.
pub struct PrefixMapper;

fn byte_is_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.'
}

impl KeyMapper for PrefixMapper {
    fn map(&self, prefix: &[Vec<u8>]) -> String {
        debug_assert_eq!(prefix.len(), 1);
        let mut out = String::new();
        for &b in prefix[0].iter() {
            if byte_is_safe(b) {
                out.push(b as char);
            } else {
                out.push_str(&format!("%{:02x}", b));
            }
        }
        out
    }

    fn unmap(&self, path: &str) -> Components {
        let bytes = path.as_bytes();
        let mut component = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' && i + 3 <= bytes.len() {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    component.push(v);
                    i += 3;
                    continue;
                }
            }
            component.push(bytes[i]);
            i += 1;
        }
        let mut components: Components = SmallVec::new();
        components.push(component);
        components
    }
}

/// Shards prefixes over 256 directories by checksum, keeping any one
/// directory from accumulating every file of a large store.
pub struct HashPrefixMapper;

fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

fn escape_component(component: &[u8]) -> String {
    let mut out = String::new();
    for &b in component {
        // @ stays literal: it is a valid filesystem character used all the
        // time in ids, and it reads better than %40 everywhere.
        if byte_is_safe(b) || b == b'@' || b == b',' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02x}", b));
        }
    }
    out
}

fn unescape_component(escaped: &str) -> Vec<u8> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

impl KeyMapper for HashPrefixMapper {
    fn map(&self, prefix: &[Vec<u8>]) -> String {
        debug_assert_eq!(prefix.len(), 1);
        let escaped = escape_component(&prefix[0]);
        format!("{:02x}/{}", adler32(escaped.as_bytes()) & 255, escaped)
    }

    fn unmap(&self, path: &str) -> Components {
        let basename = path.rsplit_once('/').map(|(_, b)| b).unwrap_or(path);
        let mut components: Components = SmallVec::new();
        components.push(unescape_component(basename));
        components
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[&[u8]]) -> Key {
        Key::from_slices(parts)
    }

    #[test]
    fn prefix_and_suffix() {
        let k = key(&[b"file-id", b"rev-1"]);
        assert_eq!(k.prefix(), &[b"file-id".to_vec()][..]);
        assert_eq!(k.suffix(), b"rev-1");
        let single = key(&[b"rev-1"]);
        assert!(single.prefix().is_empty());
    }

    #[test]
    fn content_address() {
        let k = Key::with_content_address(&[b"f".to_vec()], b"abcd");
        assert_eq!(k.suffix(), b"sha1:abcd");
        // Generated suffixes are not themselves insertable ids.
        assert!(key(&[b"f", b"sha1:"]).check_usable_suffix().is_err());
    }

    #[test]
    fn suffix_validation() {
        assert!(key(&[b"f", b"ok-id"]).check_usable_suffix().is_ok());
        assert!(key(&[b"f", b"has space"]).check_usable_suffix().is_err());
        assert!(key(&[b"f", b"has\nnewline"]).check_usable_suffix().is_err());
        assert!(key(&[b"f", b""]).check_usable_suffix().is_err());
    }

    #[test]
    fn prefix_mapper_round_trip() {
        let mapper = PrefixMapper;
        let prefix = vec![b"odd name/\x01".to_vec()];
        let path = mapper.map(&prefix);
        assert!(!path.contains('/'));
        assert_eq!(mapper.unmap(&path)[0], prefix[0]);
    }

    #[test]
    fn hash_prefix_mapper_shards_and_round_trips() {
        let mapper = HashPrefixMapper;
        let prefix = vec![b"some file@id,1".to_vec()];
        let path = mapper.map(&prefix);
        // Two hex digits, a slash, then the escaped id with @ and , kept.
        assert_eq!(path.as_bytes()[2], b'/');
        assert!(path.ends_with("some%20file@id,1"));
        assert_eq!(mapper.unmap(&path)[0], prefix[0]);
        // Same prefix always lands in the same shard.
        assert_eq!(path, mapper.map(&prefix));
    }
}
