//! Line deltas: the edit script stored for `line-delta` records. A delta is a
//! sorted run of hunks, each replacing the half-open source range
//! `start..end` of the compression parent with replacement lines.
//!
//! The stored payload form is, per hunk:
//!
//! ```text
//! <start>,<end>,<count>\n
//! <count replacement lines>
//! ```
//!
//! Annotated stores prefix every replacement line with `<origin> `.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk<L> {
    pub start: usize,
    pub end: usize,
    pub lines: Vec<L>,
}

/// Replacement lines carrying the origin version id of each line.
pub type AnnotatedLine = (Vec<u8>, Vec<u8>);

pub type PlainDelta = Vec<Hunk<Vec<u8>>>;
pub type AnnotatedDelta = Vec<Hunk<AnnotatedLine>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineDelta {
    Plain(PlainDelta),
    Annotated(AnnotatedDelta),
}

impl LineDelta {
    pub fn hunk_count(&self) -> usize {
        match self {
            LineDelta::Plain(hunks) => hunks.len(),
            LineDelta::Annotated(hunks) => hunks.len(),
        }
    }

    /// Drop origins, yielding the plain form of this delta.
    pub fn into_plain(self) -> PlainDelta {
        match self {
            LineDelta::Plain(hunks) => hunks,
            LineDelta::Annotated(hunks) => hunks
                .into_iter()
                .map(|h| Hunk {
                    start: h.start,
                    end: h.end,
                    lines: h.lines.into_iter().map(|(_, text)| text).collect(),
                })
                .collect(),
        }
    }
}

fn parse_header(path: &str, header: &[u8]) -> Result<(usize, usize, usize)> {
    let mut fields = header
        .strip_suffix(b"\n")
        .unwrap_or(header)
        .split(|&b| b == b',');
    let mut next = |what: &str| -> Result<usize> {
        let field = fields
            .next()
            .ok_or_else(|| Error::corrupt(path, format!("delta hunk header missing {}", what)))?;
        std::str::from_utf8(field)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::corrupt(path, format!("bad {} in delta hunk header", what)))
    };
    let start = next("start")?;
    let end = next("end")?;
    let count = next("count")?;
    if start > end {
        return Err(Error::corrupt(path, "inverted delta hunk range"));
    }
    Ok((start, end, count))
}

fn split_annotation(path: &str, line: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    match line.iter().position(|&b| b == b' ') {
        Some(pos) => Ok((line[..pos].to_vec(), line[pos + 1..].to_vec())),
        None => Err(Error::corrupt(
            path,
            "line in annotated payload missing annotation",
        )),
    }
}

/// Parse a plain delta payload.
pub fn parse_plain(path: &str, payload: &[Vec<u8>]) -> Result<PlainDelta> {
    let mut hunks = Vec::new();
    let mut cursor = 0;
    while cursor < payload.len() {
        let (start, end, count) = parse_header(path, &payload[cursor])?;
        cursor += 1;
        if cursor + count > payload.len() {
            return Err(Error::corrupt(path, "delta hunk truncated"));
        }
        hunks.push(Hunk {
            start,
            end,
            lines: payload[cursor..cursor + count].to_vec(),
        });
        cursor += count;
    }
    Ok(hunks)
}

/// Parse an annotated delta payload, keeping origins.
pub fn parse_annotated(path: &str, payload: &[Vec<u8>]) -> Result<AnnotatedDelta> {
    let mut hunks = Vec::new();
    let mut cursor = 0;
    while cursor < payload.len() {
        let (start, end, count) = parse_header(path, &payload[cursor])?;
        cursor += 1;
        if cursor + count > payload.len() {
            return Err(Error::corrupt(path, "delta hunk truncated"));
        }
        let lines = payload[cursor..cursor + count]
            .iter()
            .map(|line| split_annotation(path, line))
            .collect::<Result<Vec<_>>>()?;
        cursor += count;
        hunks.push(Hunk { start, end, lines });
    }
    Ok(hunks)
}

/// Parse an annotated delta payload but discard the origins. Used when an
/// annotated record is being converted for a plain consumer.
pub fn parse_annotated_as_plain(path: &str, payload: &[Vec<u8>]) -> Result<PlainDelta> {
    Ok(parse_annotated(path, payload)?
        .into_iter()
        .map(|h| Hunk {
            start: h.start,
            end: h.end,
            lines: h.lines.into_iter().map(|(_, text)| text).collect(),
        })
        .collect())
}

pub fn lower_plain(hunks: &PlainDelta) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for hunk in hunks {
        out.push(format!("{},{},{}\n", hunk.start, hunk.end, hunk.lines.len()).into_bytes());
        out.extend(hunk.lines.iter().cloned());
    }
    out
}

pub fn lower_annotated(hunks: &AnnotatedDelta) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for hunk in hunks {
        out.push(format!("{},{},{}\n", hunk.start, hunk.end, hunk.lines.len()).into_bytes());
        for (origin, text) in &hunk.lines {
            let mut line = origin.clone();
            line.push(b' ');
            line.extend_from_slice(text);
            out.push(line);
        }
    }
    out
}

pub fn lower(delta: &LineDelta) -> Vec<Vec<u8>> {
    match delta {
        LineDelta::Plain(hunks) => lower_plain(hunks),
        LineDelta::Annotated(hunks) => lower_annotated(hunks),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_round_trip() {
        let hunks: PlainDelta = vec![
            Hunk { start: 0, end: 1, lines: vec![b"new\n".to_vec()] },
            Hunk { start: 4, end: 4, lines: vec![b"a\n".to_vec(), b"b\n".to_vec()] },
        ];
        let payload = lower_plain(&hunks);
        assert_eq!(payload[0], b"0,1,1\n");
        assert_eq!(parse_plain("t", &payload).unwrap(), hunks);
    }

    #[test]
    fn annotated_round_trip() {
        let hunks: AnnotatedDelta = vec![Hunk {
            start: 2,
            end: 3,
            lines: vec![(b"rev-1".to_vec(), b"text\n".to_vec())],
        }];
        let payload = lower_annotated(&hunks);
        assert_eq!(payload[1], b"rev-1 text\n");
        assert_eq!(parse_annotated("t", &payload).unwrap(), hunks);
        let plain = parse_annotated_as_plain("t", &payload).unwrap();
        assert_eq!(plain[0].lines, vec![b"text\n".to_vec()]);
    }

    #[test]
    fn truncated_hunk_is_corrupt() {
        let payload = vec![b"0,0,2\n".to_vec(), b"only-one\n".to_vec()];
        assert!(matches!(
            parse_plain("t", &payload),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn missing_annotation_is_corrupt() {
        let payload = vec![b"0,0,1\n".to_vec(), b"no-space-anywhere".to_vec()];
        assert!(matches!(
            parse_annotated("t", &payload),
            Err(Error::Corrupt { .. })
        ));
    }
}
