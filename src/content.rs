//! In-memory representation of one version's text. Content is always held as
//! a list of lines each ending in `\n`, plus a flag recording that the final
//! newline is synthetic and must be stripped on output. That mirrors the
//! on-disk form exactly, so deltas splice without any eol special-casing.

use crate::delta::{self, AnnotatedDelta, Hunk, LineDelta, PlainDelta};
use crate::diff::{OpTag, SequenceMatcher};
use crate::error::{Error, Result};

/// Split a byte string into lines, keeping the `\n` terminators. The final
/// line may lack one.
pub fn split_lines(data: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, &b) in data.iter().enumerate() {
        if b == b'\n' {
            out.push(data[start..=i].to_vec());
            start = i + 1;
        }
    }
    if start < data.len() {
        out.push(data[start..].to_vec());
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnitContent {
    Annotated {
        lines: Vec<(Vec<u8>, Vec<u8>)>,
        strip_eol: bool,
    },
    Plain {
        lines: Vec<Vec<u8>>,
        version_id: Vec<u8>,
        strip_eol: bool,
    },
}

impl KnitContent {
    pub fn len(&self) -> usize {
        match self {
            KnitContent::Annotated { lines, .. } => lines.len(),
            KnitContent::Plain { lines, .. } => lines.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn strip_eol(&self) -> bool {
        match self {
            KnitContent::Annotated { strip_eol, .. } => *strip_eol,
            KnitContent::Plain { strip_eol, .. } => *strip_eol,
        }
    }

    pub fn set_strip_eol(&mut self, value: bool) {
        match self {
            KnitContent::Annotated { strip_eol, .. } => *strip_eol = value,
            KnitContent::Plain { strip_eol, .. } => *strip_eol = value,
        }
    }

    /// The output lines, with the synthetic trailing newline removed again.
    pub fn text(&self) -> Vec<Vec<u8>> {
        let mut lines = self.storage_lines();
        if self.strip_eol() {
            if let Some(last) = lines.last_mut() {
                if last.ends_with(b"\n") {
                    last.pop();
                }
            }
        }
        lines
    }

    /// The lines in storage form: every line `\n`-terminated, no eol strip.
    pub fn storage_lines(&self) -> Vec<Vec<u8>> {
        match self {
            KnitContent::Annotated { lines, .. } => {
                lines.iter().map(|(_, text)| text.clone()).collect()
            }
            KnitContent::Plain { lines, .. } => lines.clone(),
        }
    }

    /// `(origin, line)` pairs in storage form, no eol strip. Used when
    /// copying lines between contents.
    pub fn origin_pairs(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        match self {
            KnitContent::Annotated { lines, .. } => lines.clone(),
            KnitContent::Plain { lines, version_id, .. } => lines
                .iter()
                .map(|line| (version_id.clone(), line.clone()))
                .collect(),
        }
    }

    /// `(origin, line)` pairs. Plain content reports its own version id for
    /// every line; real per-line origins need the annotator.
    pub fn annotate(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        match self {
            KnitContent::Annotated { lines, strip_eol } => {
                let mut out = lines.clone();
                if *strip_eol {
                    if let Some((_, text)) = out.last_mut() {
                        if text.ends_with(b"\n") {
                            text.pop();
                        }
                    }
                }
                out
            }
            KnitContent::Plain { lines, version_id, .. } => lines
                .iter()
                .map(|line| (version_id.clone(), line.clone()))
                .collect(),
        }
    }

    /// Splice a delta into this content, becoming `new_version_id`. Hunk
    /// indices refer to the pre-delta line numbering; the running offset
    /// accounts for earlier hunks changing the length.
    pub fn apply_delta(&mut self, delta: &LineDelta, new_version_id: &[u8]) {
        match self {
            KnitContent::Annotated { lines, .. } => {
                let mut offset: isize = 0;
                match delta {
                    LineDelta::Annotated(hunks) => {
                        for hunk in hunks {
                            splice(lines, offset, hunk.start, hunk.end, hunk.lines.clone());
                            offset += hunk.lines.len() as isize - (hunk.end - hunk.start) as isize;
                        }
                    }
                    LineDelta::Plain(hunks) => {
                        // Plain replacement lines inherit the new version id.
                        for hunk in hunks {
                            let annotated: Vec<(Vec<u8>, Vec<u8>)> = hunk
                                .lines
                                .iter()
                                .map(|l| (new_version_id.to_vec(), l.clone()))
                                .collect();
                            splice(lines, offset, hunk.start, hunk.end, annotated);
                            offset += hunk.lines.len() as isize - (hunk.end - hunk.start) as isize;
                        }
                    }
                }
            }
            KnitContent::Plain { lines, version_id, .. } => {
                let mut offset: isize = 0;
                match delta {
                    LineDelta::Plain(hunks) => {
                        for hunk in hunks {
                            splice(lines, offset, hunk.start, hunk.end, hunk.lines.clone());
                            offset += hunk.lines.len() as isize - (hunk.end - hunk.start) as isize;
                        }
                    }
                    LineDelta::Annotated(hunks) => {
                        for hunk in hunks {
                            let plain: Vec<Vec<u8>> =
                                hunk.lines.iter().map(|(_, l)| l.clone()).collect();
                            splice(lines, offset, hunk.start, hunk.end, plain);
                            offset += hunk.lines.len() as isize - (hunk.end - hunk.start) as isize;
                        }
                    }
                }
                *version_id = new_version_id.to_vec();
            }
        }
    }

    /// Generate the delta turning `self` into `new`. The replacement lines
    /// come from `new`, so the delta kind follows `new`'s kind.
    pub fn line_delta(&self, new: &KnitContent) -> LineDelta {
        let old_text = self.text();
        let new_text = new.text();
        let matcher = SequenceMatcher::new(&old_text, &new_text);
        let opcodes = matcher.get_opcodes();
        match new {
            KnitContent::Annotated { lines, .. } => {
                let mut hunks: AnnotatedDelta = Vec::new();
                for (tag, i1, i2, j1, j2) in opcodes {
                    if tag == OpTag::Equal {
                        continue;
                    }
                    hunks.push(Hunk {
                        start: i1,
                        end: i2,
                        lines: lines[j1..j2].to_vec(),
                    });
                }
                LineDelta::Annotated(hunks)
            }
            KnitContent::Plain { lines, .. } => {
                let mut hunks: PlainDelta = Vec::new();
                for (tag, i1, i2, j1, j2) in opcodes {
                    if tag == OpTag::Equal {
                        continue;
                    }
                    hunks.push(Hunk {
                        start: i1,
                        end: i2,
                        lines: lines[j1..j2].to_vec(),
                    });
                }
                LineDelta::Plain(hunks)
            }
        }
    }
}

fn splice<T: Clone>(lines: &mut Vec<T>, offset: isize, start: usize, end: usize, new: Vec<T>) {
    let start = (start as isize + offset) as usize;
    let end = (end as isize + offset) as usize;
    lines.splice(start..end, new);
}

/// Which flavour of content a store keeps: annotated records carry a per-line
/// origin in the payload, plain records just the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Annotated,
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Fulltext,
    LineDelta,
}

impl Method {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Method::Fulltext => b"fulltext",
            Method::LineDelta => b"line-delta",
        }
    }
}

impl ContentKind {
    pub fn annotated(&self) -> bool {
        matches!(self, ContentKind::Annotated)
    }

    /// Wrap caller-supplied lines (each `\n`-terminated) as content.
    pub fn make(&self, lines: Vec<Vec<u8>>, version_id: &[u8]) -> KnitContent {
        match self {
            ContentKind::Annotated => KnitContent::Annotated {
                lines: lines
                    .into_iter()
                    .map(|l| (version_id.to_vec(), l))
                    .collect(),
                strip_eol: false,
            },
            ContentKind::Plain => KnitContent::Plain {
                lines,
                version_id: version_id.to_vec(),
                strip_eol: false,
            },
        }
    }

    /// Decode a fulltext payload into content.
    pub fn parse_fulltext(
        &self,
        path: &str,
        payload: &[Vec<u8>],
        version_id: &[u8],
    ) -> Result<KnitContent> {
        match self {
            ContentKind::Annotated => {
                let lines = payload
                    .iter()
                    .map(|line| match line.iter().position(|&b| b == b' ') {
                        Some(pos) => Ok((line[..pos].to_vec(), line[pos + 1..].to_vec())),
                        None => Err(Error::corrupt(
                            path,
                            "line in annotated fulltext missing annotation",
                        )),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(KnitContent::Annotated { lines, strip_eol: false })
            }
            ContentKind::Plain => Ok(KnitContent::Plain {
                lines: payload.to_vec(),
                version_id: version_id.to_vec(),
                strip_eol: false,
            }),
        }
    }

    /// Decode a line-delta payload, preserving origins when this kind is
    /// annotated.
    pub fn parse_line_delta(&self, path: &str, payload: &[Vec<u8>]) -> Result<LineDelta> {
        match self {
            ContentKind::Annotated => Ok(LineDelta::Annotated(delta::parse_annotated(path, payload)?)),
            ContentKind::Plain => Ok(LineDelta::Plain(delta::parse_plain(path, payload)?)),
        }
    }

    /// Serialise content into its fulltext payload form.
    pub fn lower_fulltext(&self, content: &KnitContent) -> Vec<Vec<u8>> {
        match (self, content) {
            (ContentKind::Annotated, KnitContent::Annotated { lines, .. }) => lines
                .iter()
                .map(|(origin, text)| {
                    let mut line = origin.clone();
                    line.push(b' ');
                    line.extend_from_slice(text);
                    line
                })
                .collect(),
            _ => content.storage_lines(),
        }
    }

    pub fn lower_line_delta(&self, delta: &LineDelta) -> Vec<Vec<u8>> {
        delta::lower(delta)
    }

    /// Decode one record payload into content, applying it to `base` when it
    /// is a delta. Returns the content and the parsed delta (None for
    /// fulltexts).
    pub fn parse_record(
        &self,
        path: &str,
        version_id: &[u8],
        payload: &[Vec<u8>],
        method: Method,
        no_eol: bool,
        base: Option<&KnitContent>,
    ) -> Result<(KnitContent, Option<LineDelta>)> {
        let (mut content, delta) = match method {
            Method::LineDelta => {
                let base = base.ok_or_else(|| {
                    Error::corrupt(path, "line-delta record decoded without a basis")
                })?;
                let delta = self.parse_line_delta(path, payload)?;
                let mut content = base.clone();
                content.set_strip_eol(false);
                content.apply_delta(&delta, version_id);
                (content, Some(delta))
            }
            Method::Fulltext => (self.parse_fulltext(path, payload, version_id)?, None),
        };
        content.set_strip_eol(no_eol);
        Ok((content, delta))
    }

    /// Just the text lines of a fulltext payload, annotations dropped.
    pub fn fulltext_content_lines(&self, path: &str, payload: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        match self {
            ContentKind::Annotated => payload
                .iter()
                .map(|line| match line.iter().position(|&b| b == b' ') {
                    Some(pos) => Ok(line[pos + 1..].to_vec()),
                    None => Err(Error::corrupt(path, "annotated line missing annotation")),
                })
                .collect(),
            ContentKind::Plain => Ok(payload.to_vec()),
        }
    }

    /// Just the replacement lines of a delta payload.
    pub fn linedelta_content_lines(&self, path: &str, payload: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        let hunks = match self {
            ContentKind::Annotated => delta::parse_annotated_as_plain(path, payload)?,
            ContentKind::Plain => delta::parse_plain(path, payload)?,
        };
        Ok(hunks.into_iter().flat_map(|h| h.lines).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(lines: &[&[u8]], vid: &[u8]) -> KnitContent {
        KnitContent::Plain {
            lines: lines.iter().map(|l| l.to_vec()).collect(),
            version_id: vid.to_vec(),
            strip_eol: false,
        }
    }

    #[test]
    fn split_lines_keeps_terminators() {
        assert_eq!(
            split_lines(b"a\nb\nc"),
            vec![b"a\n".to_vec(), b"b\n".to_vec(), b"c".to_vec()]
        );
        assert_eq!(split_lines(b""), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn text_strips_synthetic_eol() {
        let mut c = plain(&[b"line\n"], b"v1");
        c.set_strip_eol(true);
        assert_eq!(c.text(), vec![b"line".to_vec()]);
        assert_eq!(c.storage_lines(), vec![b"line\n".to_vec()]);
    }

    #[test]
    fn apply_plain_delta() {
        let mut c = plain(&[b"a\n", b"b\n", b"c\n"], b"v1");
        // Replace b with two lines, and append one at the end.
        let delta = LineDelta::Plain(vec![
            Hunk { start: 1, end: 2, lines: vec![b"b1\n".to_vec(), b"b2\n".to_vec()] },
            Hunk { start: 3, end: 3, lines: vec![b"d\n".to_vec()] },
        ]);
        c.apply_delta(&delta, b"v2");
        assert_eq!(
            c.text(),
            vec![
                b"a\n".to_vec(),
                b"b1\n".to_vec(),
                b"b2\n".to_vec(),
                b"c\n".to_vec(),
                b"d\n".to_vec()
            ]
        );
    }

    #[test]
    fn plain_delta_into_annotated_content_inherits_origin() {
        let mut c = KnitContent::Annotated {
            lines: vec![(b"v1".to_vec(), b"a\n".to_vec())],
            strip_eol: false,
        };
        let delta = LineDelta::Plain(vec![Hunk {
            start: 1,
            end: 1,
            lines: vec![b"b\n".to_vec()],
        }]);
        c.apply_delta(&delta, b"v2");
        assert_eq!(
            c.annotate(),
            vec![
                (b"v1".to_vec(), b"a\n".to_vec()),
                (b"v2".to_vec(), b"b\n".to_vec())
            ]
        );
    }

    #[test]
    fn line_delta_round_trip() {
        let old = plain(&[b"a\n", b"b\n", b"c\n"], b"v1");
        let new = plain(&[b"a\n", b"x\n", b"c\n", b"d\n"], b"v2");
        let delta = old.line_delta(&new);
        let mut rebuilt = old.clone();
        rebuilt.apply_delta(&delta, b"v2");
        assert_eq!(rebuilt.text(), new.text());
    }

    #[test]
    fn annotated_fulltext_parse_and_lower() {
        let kind = ContentKind::Annotated;
        let payload = vec![b"v1 hello\n".to_vec(), b"v2 world\n".to_vec()];
        let content = kind.parse_fulltext("t", &payload, b"v2").unwrap();
        assert_eq!(
            content.annotate()[0],
            (b"v1".to_vec(), b"hello\n".to_vec())
        );
        assert_eq!(kind.lower_fulltext(&content), payload);
    }
}
