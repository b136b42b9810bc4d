//! On-disk record framing. Each record is one gzip member whose uncompressed
//! body is:
//!
//! ```text
//! version <version-id> <line-count> <sha1-hex>\n
//! <payload lines>
//! end <version-id>\n
//! ```
//!
//! The digest in the header is always the digest of the reconstructed
//! fulltext, even for delta records.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha1::{Digest as _, Sha1};

use crate::content::split_lines;
use crate::error::{Error, Result};

/// A hex-encoded sha-1, as stored in record headers.
pub type Digest = [u8; 40];

pub fn sha1_bytes(data: &[u8]) -> Digest {
    let raw = Sha1::digest(data);
    hex_digest(&raw)
}

pub fn sha1_lines(lines: &[Vec<u8>]) -> Digest {
    let mut hasher = Sha1::new();
    for line in lines {
        hasher.update(line);
    }
    hex_digest(&hasher.finalize())
}

fn hex_digest(raw: &[u8]) -> Digest {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = [0u8; 40];
    for (i, &b) in raw.iter().enumerate() {
        out[i * 2] = HEX[(b >> 4) as usize];
        out[i * 2 + 1] = HEX[(b & 0x0f) as usize];
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub version_id: Vec<u8>,
    pub line_count: usize,
    pub digest: Digest,
}

/// Frame and compress one record. Returns the compressed length and bytes;
/// the length is what the index records.
pub fn record_to_data(version_id: &[u8], digest: &Digest, lines: &[Vec<u8>]) -> Result<(usize, Vec<u8>)> {
    if let Some(last) = lines.last() {
        if !last.ends_with(b"\n") {
            return Err(Error::corrupt(
                "record",
                "payload lines must all be newline terminated",
            ));
        }
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let header = format!(
        "version {} {} {}\n",
        String::from_utf8_lossy(version_id),
        lines.len(),
        std::str::from_utf8(digest).unwrap(),
    );
    encoder.write_all(header.as_bytes())?;
    for line in lines {
        encoder.write_all(line)?;
    }
    encoder.write_all(b"end ")?;
    encoder.write_all(version_id)?;
    encoder.write_all(b"\n")?;
    let compressed = encoder.finish()?;
    Ok((compressed.len(), compressed))
}

fn gunzip(path: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::corrupt(path, format!("corrupt compressed record: {}", e)))?;
    Ok(out)
}

fn split_header(path: &str, line: &[u8]) -> Result<RecordHeader> {
    let fields: Vec<&[u8]> = line
        .strip_suffix(b"\n")
        .unwrap_or(line)
        .split(|&b| b == b' ')
        .collect();
    if fields.len() != 4 || fields[0] != b"version" {
        return Err(Error::corrupt(
            path,
            "unexpected number of elements in record header",
        ));
    }
    let line_count = std::str::from_utf8(fields[2])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::corrupt(path, "bad line count in record header"))?;
    let digest: Digest = fields[3]
        .try_into()
        .map_err(|_| Error::corrupt(path, "bad digest in record header"))?;
    Ok(RecordHeader {
        version_id: fields[1].to_vec(),
        line_count,
        digest,
    })
}

/// Decompress and validate framing without checking the version id against
/// anything.
pub fn parse_record_unchecked(path: &str, data: &[u8]) -> Result<(RecordHeader, Vec<Vec<u8>>)> {
    let body = gunzip(path, data)?;
    let mut lines = split_lines(&body);
    if lines.len() < 2 {
        return Err(Error::corrupt(path, "record too short"));
    }
    let header = split_header(path, &lines.remove(0))?;
    let last = lines.pop().unwrap();
    if lines.len() != header.line_count {
        return Err(Error::corrupt(
            path,
            format!(
                "incorrect number of lines {} != {} for version {}",
                lines.len(),
                header.line_count,
                String::from_utf8_lossy(&header.version_id)
            ),
        ));
    }
    let mut expected_end = b"end ".to_vec();
    expected_end.extend_from_slice(&header.version_id);
    expected_end.push(b'\n');
    if last != expected_end {
        return Err(Error::corrupt(
            path,
            format!(
                "unexpected version end line {:?}, wanted {:?}",
                String::from_utf8_lossy(&last),
                String::from_utf8_lossy(&expected_end)
            ),
        ));
    }
    Ok((header, lines))
}

/// Decompress, validate framing, and check the embedded version id matches
/// the one we asked for. Returns the payload lines and the stored digest.
pub fn parse_record(path: &str, version_id: &[u8], data: &[u8]) -> Result<(Vec<Vec<u8>>, Digest)> {
    let (header, lines) = parse_record_unchecked(path, data)?;
    if header.version_id != version_id {
        return Err(Error::corrupt(
            path,
            format!(
                "unexpected version, wanted {:?}, got {:?}",
                String::from_utf8_lossy(version_id),
                String::from_utf8_lossy(&header.version_id)
            ),
        ));
    }
    Ok((lines, header.digest))
}

/// Validate just the header of a raw record against the requested version.
/// Used when relaying raw records without expanding them.
pub fn parse_record_header(path: &str, version_id: &[u8], data: &[u8]) -> Result<RecordHeader> {
    let (header, _) = parse_record_unchecked(path, data)?;
    if header.version_id != version_id {
        return Err(Error::corrupt(
            path,
            format!(
                "unexpected version, wanted {:?}, got {:?}",
                String::from_utf8_lossy(version_id),
                String::from_utf8_lossy(&header.version_id)
            ),
        ));
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let lines = vec![b"hello\n".to_vec(), b"world\n".to_vec()];
        let digest = sha1_lines(&lines);
        let (size, data) = record_to_data(b"rev-1", &digest, &lines).unwrap();
        assert_eq!(size, data.len());
        let (payload, got_digest) = parse_record("t", b"rev-1", &data).unwrap();
        assert_eq!(payload, lines);
        assert_eq!(got_digest, digest);
    }

    #[test]
    fn known_digest() {
        let lines = vec![b"base\n".to_vec()];
        assert_eq!(
            &sha1_lines(&lines)[..],
            b"51c64a6f4fc375daf0d24aafbabe4d91b6f4bb44"
        );
    }

    #[test]
    fn wrong_version_is_corrupt() {
        let lines = vec![b"x\n".to_vec()];
        let digest = sha1_lines(&lines);
        let (_, data) = record_to_data(b"rev-1", &digest, &lines).unwrap();
        assert!(matches!(
            parse_record("t", b"rev-2", &data),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn bad_gzip_is_corrupt() {
        assert!(matches!(
            parse_record_unchecked("t", b"definitely not gzip"),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn line_count_mismatch_is_corrupt() {
        // Hand-build a record with a lying line count.
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let digest = sha1_lines(&[b"a\n".to_vec()]);
        encoder
            .write_all(
                format!("version v 2 {}\n", std::str::from_utf8(&digest).unwrap()).as_bytes(),
            )
            .unwrap();
        encoder.write_all(b"a\n").unwrap();
        encoder.write_all(b"end v\n").unwrap();
        let data = encoder.finish().unwrap();
        assert!(matches!(
            parse_record_unchecked("t", &data),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn unterminated_payload_rejected() {
        let digest = sha1_bytes(b"line");
        assert!(record_to_data(b"v", &digest, &[b"line".to_vec()]).is_err());
    }
}
