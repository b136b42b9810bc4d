use std::fmt::{Display, Formatter};
use std::io;

use crate::codec::Digest;
use crate::key::Key;
use crate::stream::StorageKind;

/// Everything that can go wrong inside the store. Parse failures carry enough
/// context (file, offset, offending bytes) to locate the damage without
/// re-reading the whole knit.
#[derive(Debug)]
pub enum Error {
    /// Malformed data somewhere in an index or data file: bad header, line
    /// count mismatch, bad end marker, bad gzip stream, undecodable parent
    /// reference.
    Corrupt {
        path: String,
        detail: String,
    },
    /// A key was required to be present and wasn't, anywhere.
    RevisionNotPresent(Key),
    /// The reconstructed fulltext did not hash to the stored digest. The
    /// content is included so repair tooling can diff it against other
    /// sources.
    Sha1Mismatch {
        key: Key,
        expected: Digest,
        actual: Digest,
        content: Vec<Vec<u8>>,
    },
    /// The index carried a storage method we don't understand, or an illegal
    /// combination of options.
    InvalidOptions {
        key: Key,
        options: Vec<Vec<u8>>,
    },
    /// An insert with a nostore digest found that digest already present.
    ExistingContent(Key),
    /// Write attempted through a read-only view.
    ReadOnly,
    /// The record cannot be produced in the requested representation.
    UnavailableRepresentation {
        key: Key,
        wanted: StorageKind,
        native: StorageKind,
    },
    /// A stream insert finished with delta records whose basis never arrived.
    MissingCompressionParents(Vec<Key>),
    /// The version id is not usable as a key suffix (whitespace, reserved
    /// namespace, empty).
    InvalidRevisionId(Vec<u8>),
    /// The container set changed underneath a reader. The data access layer
    /// raises this; the stream layer reloads and retries exactly once.
    RetryWithNewPacks {
        context: String,
    },
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl Error {
    pub(crate) fn corrupt(path: impl Into<String>, detail: impl Into<String>) -> Error {
        Error::Corrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// True if the underlying failure was a missing file. Used to treat an
    /// absent index as an empty one.
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Corrupt { path, detail } => {
                write!(f, "knit {} corrupt: {}", path, detail)
            }
            Error::RevisionNotPresent(key) => {
                write!(f, "revision not present: {}", key)
            }
            Error::Sha1Mismatch { key, expected, actual, .. } => {
                write!(
                    f,
                    "sha-1 of reconstructed text for {} does not match: expected {} got {}",
                    key,
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(actual)
                )
            }
            Error::InvalidOptions { key, options } => {
                write!(f, "unknown storage options for {}: ", key)?;
                for (i, opt) in options.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", String::from_utf8_lossy(opt))?;
                }
                Ok(())
            }
            Error::ExistingContent(key) => {
                write!(f, "content being inserted is already present: {}", key)
            }
            Error::ReadOnly => f.write_str("write attempted on read-only store"),
            Error::UnavailableRepresentation { key, wanted, native } => {
                write!(
                    f,
                    "representation {} not available for {} stored as {}",
                    wanted, key, native
                )
            }
            Error::MissingCompressionParents(keys) => {
                write!(f, "{} compression parents missing after stream insert", keys.len())
            }
            Error::InvalidRevisionId(id) => {
                write!(f, "invalid version id {:?}", String::from_utf8_lossy(id))
            }
            Error::RetryWithNewPacks { context } => {
                write!(f, "container set changed while reading {}", context)
            }
            Error::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}
