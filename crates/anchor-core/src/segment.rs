//! Content segmentation into contiguous, size-bounded byte ranges.
//!
//! Segmentation is dispatched on [`ContentType`] through the [`Segmenter`]
//! trait: [`ProseSegmenter`] for prose, [`CodeSegmenter`] for source code.
//!
//! # Prose
//!
//! 1. Split at paragraph boundaries (runs of two or more newlines). The
//!    separator stays attached to the paragraph before it.
//! 2. Greedily pack consecutive paragraphs while the packed range stays
//!    within `max_chunk_size`.
//! 3. A paragraph larger than the maximum is split at sentence boundaries
//!    (`.`, `!`, `?` followed by whitespace, or a newline) and packed the
//!    same way.
//! 4. A single sentence larger than the maximum is emitted whole and
//!    flagged `oversized` while it stays within `max × sentence_overflow`.
//!    Beyond that it is cut at the last whitespace or `,;:` found in the
//!    upper half of the budget, or hard-cut at the byte limit and flagged
//!    `continued` when no such boundary exists.
//!
//! # Code
//!
//! Top-level declaration boundaries are lines that start in column 0 at
//! bracket depth 0 (leading comments, attributes and decorators stay with
//! the declaration that follows). Units are packed like paragraphs; a unit
//! larger than the maximum falls back to the prose policy.
//!
//! # Guarantees
//!
//! - Segments are contiguous, non-empty, and cover `[0, content.len())`.
//! - Every boundary is a UTF-8 char boundary.
//! - A segment longer than `max_chunk_size` is flagged `oversized`.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AnchorError;
use crate::models::{ContentType, NumericValue};
use crate::tagger::is_stopword;

/// Segmentation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Maximum segment size in bytes.
    pub max_chunk_size: usize,
    /// A single sentence up to `max_chunk_size × sentence_overflow` bytes
    /// is kept whole instead of being cut.
    pub sentence_overflow: f64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1024,
            sentence_overflow: 2.0,
        }
    }
}

impl SegmenterConfig {
    pub fn validate(&self) -> Result<(), AnchorError> {
        if self.max_chunk_size == 0 {
            return Err(AnchorError::Config(
                "segmentation.max_chunk_size must be > 0".into(),
            ));
        }
        if !self.sentence_overflow.is_finite() || self.sentence_overflow < 1.0 {
            return Err(AnchorError::Config(
                "segmentation.sentence_overflow must be >= 1.0".into(),
            ));
        }
        Ok(())
    }

    fn overflow_limit(&self) -> usize {
        ((self.max_chunk_size as f64) * self.sentence_overflow).floor() as usize
    }
}

/// A segment of the input, as a byte range plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    pub content_type: ContentType,
    pub numeric: Option<NumericValue>,
    pub oversized: bool,
    pub continued: bool,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn text<'a>(&self, content: &'a str) -> &'a str {
        &content[self.start..self.end]
    }
}

/// A raw split produced by a [`Segmenter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub oversized: bool,
    pub continued: bool,
}

impl Span {
    fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            oversized: false,
            continued: false,
        }
    }
}

/// Splitting strategy for one content type.
pub trait Segmenter {
    fn content_type(&self) -> ContentType;

    /// Split `text[range]` into contiguous spans that cover it exactly.
    fn split(&self, text: &str, range: Range<usize>, out: &mut Vec<Span>);
}

/// Paragraph → sentence → hard-limit splitting.
pub struct ProseSegmenter {
    max: usize,
    overflow_limit: usize,
}

impl ProseSegmenter {
    pub fn new(config: &SegmenterConfig) -> Self {
        Self {
            max: config.max_chunk_size.max(1),
            overflow_limit: config.overflow_limit().max(config.max_chunk_size),
        }
    }

    fn split_sentences(&self, text: &str, range: Range<usize>, out: &mut Vec<Span>) {
        let sentences = sentence_spans(text, range);
        pack(&sentences, self.max, out, |r, out| {
            self.split_overflow(text, r, out)
        });
    }

    fn split_overflow(&self, text: &str, range: Range<usize>, out: &mut Vec<Span>) {
        if range.len() <= self.overflow_limit {
            out.push(Span {
                start: range.start,
                end: range.end,
                oversized: true,
                continued: false,
            });
            return;
        }
        hard_split(text, range, self.max, out);
    }
}

impl Segmenter for ProseSegmenter {
    fn content_type(&self) -> ContentType {
        ContentType::Prose
    }

    fn split(&self, text: &str, range: Range<usize>, out: &mut Vec<Span>) {
        let paragraphs = paragraph_spans(text, range);
        pack(&paragraphs, self.max, out, |r, out| {
            self.split_sentences(text, r, out)
        });
    }
}

/// Top-level declaration splitting with prose fallback.
pub struct CodeSegmenter {
    prose: ProseSegmenter,
}

impl CodeSegmenter {
    pub fn new(config: &SegmenterConfig) -> Self {
        Self {
            prose: ProseSegmenter::new(config),
        }
    }
}

impl Segmenter for CodeSegmenter {
    fn content_type(&self) -> ContentType {
        ContentType::Code
    }

    fn split(&self, text: &str, range: Range<usize>, out: &mut Vec<Span>) {
        let units = top_level_spans(text, range);
        pack(&units, self.prose.max, out, |r, out| {
            self.prose.split(text, r, out)
        });
    }
}

/// Strategy for a content type.
pub fn segmenter_for(content_type: ContentType, config: &SegmenterConfig) -> Box<dyn Segmenter> {
    match content_type {
        ContentType::Prose => Box::new(ProseSegmenter::new(config)),
        ContentType::Code => Box::new(CodeSegmenter::new(config)),
    }
}

/// Segment content with the default overflow tolerance.
pub fn segment(content: &str, content_type: ContentType, max_chunk_size: usize) -> Vec<Segment> {
    let config = SegmenterConfig {
        max_chunk_size,
        ..SegmenterConfig::default()
    };
    segment_with(content, content_type, &config)
}

/// Segment content with an explicit configuration.
pub fn segment_with(content: &str, content_type: ContentType, config: &SegmenterConfig) -> Vec<Segment> {
    if content.is_empty() {
        return Vec::new();
    }
    let strategy = segmenter_for(content_type, config);
    let mut spans = Vec::new();
    strategy.split(content, 0..content.len(), &mut spans);

    spans
        .into_iter()
        .map(|s| Segment {
            start: s.start,
            end: s.end,
            content_type: strategy.content_type(),
            numeric: extract_numeric(&content[s.start..s.end]),
            oversized: s.oversized || s.end - s.start > config.max_chunk_size,
            continued: s.continued,
        })
        .collect()
}

/// Greedily merge consecutive spans while the merged range fits `max`.
/// Spans that are individually too large go to `fallback`.
fn pack<F>(spans: &[Range<usize>], max: usize, out: &mut Vec<Span>, mut fallback: F)
where
    F: FnMut(Range<usize>, &mut Vec<Span>),
{
    let mut current: Option<Range<usize>> = None;
    for span in spans {
        if span.len() > max {
            if let Some(c) = current.take() {
                out.push(Span::new(c.start, c.end));
            }
            fallback(span.clone(), out);
            continue;
        }
        current = match current.take() {
            Some(c) if span.end - c.start <= max => Some(c.start..span.end),
            Some(c) => {
                out.push(Span::new(c.start, c.end));
                Some(span.clone())
            }
            None => Some(span.clone()),
        };
    }
    if let Some(c) = current {
        out.push(Span::new(c.start, c.end));
    }
}

fn paragraph_spans(text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut start = range.start;
    let mut i = range.start;
    while i < range.end {
        if bytes[i] == b'\n' {
            let mut j = i + 1;
            let mut newlines = 1;
            while j < range.end && matches!(bytes[j], b'\n' | b'\r' | b' ' | b'\t') {
                if bytes[j] == b'\n' {
                    newlines += 1;
                }
                j += 1;
            }
            if newlines >= 2 {
                spans.push(start..j);
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    if start < range.end {
        spans.push(start..range.end);
    }
    spans
}

fn sentence_spans(text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut start = range.start;
    let mut i = range.start;
    while i < range.end {
        let boundary = match bytes[i] {
            b'.' | b'!' | b'?' => i + 1 >= range.end || bytes[i + 1].is_ascii_whitespace(),
            b'\n' => true,
            _ => false,
        };
        if boundary {
            let mut j = i + 1;
            while j < range.end && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            spans.push(start..j);
            start = j;
            i = j;
            continue;
        }
        i += 1;
    }
    if start < range.end {
        spans.push(start..range.end);
    }
    spans
}

fn hard_split(text: &str, range: Range<usize>, max: usize, out: &mut Vec<Span>) {
    let bytes = text.as_bytes();
    let mut start = range.start;
    while start < range.end {
        if range.end - start <= max {
            out.push(Span::new(start, range.end));
            break;
        }
        let limit = floor_char_boundary(text, start + max);
        let floor = start + max / 2;
        let soft = (floor..limit)
            .rev()
            .find(|&i| matches!(bytes[i], b' ' | b'\t' | b'\n' | b'\r' | b',' | b';' | b':'));
        match soft {
            Some(i) => {
                out.push(Span::new(start, i + 1));
                start = i + 1;
            }
            None => {
                let cut = if limit > start {
                    limit
                } else {
                    ceil_char_boundary(text, start + 1)
                };
                out.push(Span {
                    start,
                    end: cut,
                    oversized: cut - start > max,
                    continued: true,
                });
                start = cut;
            }
        }
    }
}

fn top_level_spans(text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let mut starts = vec![range.start];
    let mut depth: i32 = 0;
    let mut in_block_comment = false;
    let mut prev_prefix = false;
    let mut offset = range.start;

    for line in text[range.clone()].split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let starts_in_column_zero = line
            .as_bytes()
            .first()
            .is_some_and(|b| !b.is_ascii_whitespace());
        if depth == 0 && !in_block_comment && starts_in_column_zero {
            if line_start != range.start && !prev_prefix && !is_closer(line) {
                starts.push(line_start);
            }
            prev_prefix = is_prefix_line(line);
        } else if depth == 0 && !line.trim().is_empty() {
            prev_prefix = false;
        }

        let (delta, still_in_comment) = scan_brackets(line, in_block_comment);
        depth = (depth + delta).max(0);
        in_block_comment = still_in_comment;
    }

    let mut spans: Vec<Range<usize>> = starts.windows(2).map(|w| w[0]..w[1]).collect();
    if let Some(&last) = starts.last() {
        if last < range.end {
            spans.push(last..range.end);
        }
    }
    spans
}

fn is_closer(line: &str) -> bool {
    matches!(line.as_bytes().first(), Some(b'}' | b')' | b']'))
}

fn is_prefix_line(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("//") || t.starts_with("/*") || t.starts_with('#') || t.starts_with('@')
}

/// Net bracket depth change for one line, skipping strings, char literals
/// and comments.
fn scan_brackets(line: &str, mut in_block: bool) -> (i32, bool) {
    let b = line.as_bytes();
    let mut delta = 0;
    let mut i = 0;
    while i < b.len() {
        if in_block {
            if b[i] == b'*' && b.get(i + 1) == Some(&b'/') {
                in_block = false;
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }
        match b[i] {
            b'/' if b.get(i + 1) == Some(&b'/') => break,
            b'/' if b.get(i + 1) == Some(&b'*') => {
                in_block = true;
                i += 2;
                continue;
            }
            b'"' => {
                i += 1;
                while i < b.len() && b[i] != b'"' {
                    if b[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'\'' => {
                if b.get(i + 2) == Some(&b'\'') {
                    i += 2;
                } else if b.get(i + 1) == Some(&b'\\') && b.get(i + 3) == Some(&b'\'') {
                    i += 3;
                }
            }
            b'{' | b'(' | b'[' => delta += 1,
            b'}' | b')' | b']' => delta -= 1,
            _ => {}
        }
        i += 1;
    }
    (delta, in_block)
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
pub(crate) fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Snap a byte index forward to the nearest valid UTF-8 char boundary.
pub(crate) fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

static NUMERIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:^|[^\w.])(-?\d{1,3}(?:,\d{3})+(?:\.\d+)?|-?\d+(?:\.\d+)?)(?:[ \t]*([A-Za-z%°µ][A-Za-z%°µ/²³]*))?",
    )
    .expect("numeric pattern compiles")
});

/// Find the first standalone number in `text`, with the unit word that
/// directly follows it. Best effort: a stopword after the number is not
/// treated as a unit.
pub fn extract_numeric(text: &str) -> Option<NumericValue> {
    let caps = NUMERIC.captures(text)?;
    let raw = caps.get(1)?.as_str().replace(',', "");
    let value: f64 = raw.parse().ok()?;
    let unit = caps
        .get(2)
        .map(|m| m.as_str())
        .filter(|u| u.chars().count() <= 16 && !is_stopword(&u.to_lowercase()))
        .map(str::to_string);
    Some(NumericValue { value, unit })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn texts<'a>(content: &'a str, segs: &[Segment]) -> Vec<&'a str> {
        segs.iter().map(|s| s.text(content)).collect()
    }

    fn assert_covers(content: &str, segs: &[Segment], max: usize) {
        let mut cursor = 0;
        for s in segs {
            assert_eq!(s.start, cursor, "gap or overlap at {}", cursor);
            assert!(s.end > s.start, "empty segment at {}", s.start);
            assert!(content.is_char_boundary(s.start) && content.is_char_boundary(s.end));
            if s.len() > max {
                assert!(s.oversized, "unflagged oversized segment {:?}", s);
            }
            cursor = s.end;
        }
        assert_eq!(cursor, content.len());
    }

    #[test]
    fn test_empty_content() {
        assert!(segment("", ContentType::Prose, 100).is_empty());
        assert!(segment("", ContentType::Code, 100).is_empty());
    }

    #[test]
    fn test_small_text_single_segment() {
        let segs = segment("Hello, world!", ContentType::Prose, 100);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].start, 0);
        assert_eq!(segs[0].end, 13);
        assert!(!segs[0].oversized);
    }

    #[test]
    fn test_sentence_split_with_numeric() {
        let content = "Revenue Q1: 42.5 meters of growth. See details.";
        let segs = segment(content, ContentType::Prose, 30);
        assert_eq!(segs.len(), 2);
        assert_eq!(
            texts(content, &segs),
            vec!["Revenue Q1: 42.5 meters of growth. ", "See details."]
        );
        assert_eq!(
            segs[0].numeric,
            Some(NumericValue {
                value: 42.5,
                unit: Some("meters".to_string())
            })
        );
        assert!(segs[1].numeric.is_none());
        assert_covers(content, &segs, 30);
    }

    #[test]
    fn test_paragraphs_packed_under_limit() {
        let content = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let segs = segment(content, ContentType::Prose, 1024);
        assert_eq!(segs.len(), 1);

        let segs = segment(content, ContentType::Prose, 20);
        assert_eq!(
            texts(content, &segs),
            vec!["First paragraph.\n\n", "Second paragraph.\n\n", "Third paragraph."]
        );
    }

    #[test]
    fn test_hard_split_marks_continuation() {
        let content = "a".repeat(100);
        let segs = segment(&content, ContentType::Prose, 10);
        assert_eq!(segs.len(), 10);
        for s in &segs[..9] {
            assert!(s.continued);
            assert_eq!(s.len(), 10);
        }
        assert!(!segs[9].continued);
        assert_covers(&content, &segs, 10);
    }

    #[test]
    fn test_hard_split_prefers_soft_boundary() {
        let content = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda";
        let segs = segment(content, ContentType::Prose, 12);
        assert_covers(content, &segs, 12);
        for s in &segs {
            assert!(!s.continued, "unexpected hard cut in {:?}", s.text(content));
        }
    }

    #[test]
    fn test_code_splits_at_top_level_declarations() {
        let code = "use std::io;\n\nfn alpha() {\n    let x = 1;\n}\n\nfn beta() {\n    let y = 2;\n}\n";
        let segs = segment(code, ContentType::Code, 32);
        let t = texts(code, &segs);
        assert_eq!(t.len(), 3);
        assert!(t[0].starts_with("use std::io;"));
        assert!(t[1].starts_with("fn alpha()"));
        assert!(t[2].starts_with("fn beta()"));
        assert!(segs.iter().all(|s| s.content_type == ContentType::Code));
    }

    #[test]
    fn test_code_keeps_doc_comment_with_item() {
        let code = "/// Adds.\n#[inline]\nfn add(a: i32) -> i32 {\n    a + 1\n}\n/// Subs.\nfn sub(a: i32) -> i32 {\n    a - 1\n}\n";
        let segs = segment(code, ContentType::Code, 45);
        let t = texts(code, &segs);
        assert_eq!(t.len(), 2);
        assert!(t[0].starts_with("/// Adds."));
        assert!(t[1].starts_with("/// Subs."));
    }

    #[test]
    fn test_code_indentation_blocks() {
        let code = "def a():\n    return 1\n\ndef b():\n    return 2\n";
        let segs = segment(code, ContentType::Code, 24);
        let t = texts(code, &segs);
        assert_eq!(t, vec!["def a():\n    return 1\n\n", "def b():\n    return 2\n"]);
    }

    #[test]
    fn test_code_braces_in_strings_ignored() {
        let code = "fn a() {\n    let s = \"}\";\n}\nfn b() {}\n";
        let segs = segment(code, ContentType::Code, 30);
        let t = texts(code, &segs);
        assert!(t[0].starts_with("fn a()"));
        assert!(t.last().unwrap().starts_with("fn b()") || t.len() == 1);
        assert_covers(code, &segs, 30);
    }

    #[test]
    fn test_oversized_code_unit_falls_back_to_prose() {
        let body: String = (0..20).map(|i| format!("    call_{}();\n", i)).collect();
        let code = format!("fn big() {{\n{}}}\n", body);
        let segs = segment(&code, ContentType::Code, 64);
        assert!(segs.len() > 1);
        assert_covers(&code, &segs, 64);
    }

    #[test]
    fn test_multibyte_boundaries() {
        let content = "┌──────────────────┐\n│ Hello wörld      │\n└──────────────────┘";
        for max in [1, 3, 5, 16] {
            let segs = segment(content, ContentType::Prose, max);
            assert_covers(content, &segs, max);
        }
    }

    #[test]
    fn test_extract_numeric() {
        assert_eq!(
            extract_numeric("It weighs 1,250.75 kg in total"),
            Some(NumericValue {
                value: 1250.75,
                unit: Some("kg".into())
            })
        );
        assert_eq!(
            extract_numeric("42 of them"),
            Some(NumericValue {
                value: 42.0,
                unit: None
            })
        );
        assert_eq!(
            extract_numeric("-3.5% drop"),
            Some(NumericValue {
                value: -3.5,
                unit: Some("%".into())
            })
        );
        assert_eq!(extract_numeric("Version v2 ships Q3"), None);
        assert_eq!(extract_numeric("no numbers here"), None);
    }

    proptest! {
        #[test]
        fn prop_prose_coverage(content in "[a-z .!?\n,é┐]{0,300}", max in 1usize..64) {
            let segs = segment(&content, ContentType::Prose, max);
            let mut cursor = 0;
            for s in &segs {
                prop_assert_eq!(s.start, cursor);
                prop_assert!(s.end > s.start);
                prop_assert!(s.len() <= max || s.oversized);
                cursor = s.end;
            }
            prop_assert_eq!(cursor, content.len());
        }

        #[test]
        fn prop_code_coverage(content in "[a-z {}()\n\"'/#]{0,300}", max in 1usize..64) {
            let segs = segment(&content, ContentType::Code, max);
            let mut cursor = 0;
            for s in &segs {
                prop_assert_eq!(s.start, cursor);
                prop_assert!(s.end > s.start);
                prop_assert!(s.len() <= max || s.oversized);
                cursor = s.end;
            }
            prop_assert_eq!(cursor, content.len());
        }
    }
}
