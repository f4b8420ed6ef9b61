//! Tag extraction and `(atom, tag, bucket)` triple generation.
//!
//! An atom's tag set is the union of:
//!
//! - tags supplied by the caller for the whole document,
//! - `#hashtags` found in the atom's content (lowercased, `#` stripped),
//! - up to `max_auto` keyword tags: lowercase alphanumeric terms of at
//!   least [`MIN_KEYWORD_LEN`] characters that are not stopwords, ranked by
//!   frequency and then by first position.
//!
//! The result is deduplicated and sorted so that the same content always
//! yields the same tags.

use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::TagAssoc;

/// Bucket assigned to atoms ingested without any bucket.
pub const DEFAULT_BUCKET: &str = "core";

/// Minimum length of an automatically extracted keyword.
pub const MIN_KEYWORD_LEN: usize = 4;

static HASHTAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\w&])#([A-Za-z][\w\-]{1,63})").expect("hashtag pattern compiles"));

const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "also", "am", "an", "and", "any",
    "are", "as", "at", "be", "because", "been", "before", "being", "below", "between", "both",
    "but", "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "else",
    "few", "for", "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers",
    "him", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just", "may",
    "me", "might", "more", "most", "must", "my", "no", "nor", "not", "now", "of", "off", "on",
    "once", "only", "or", "other", "our", "ours", "out", "over", "own", "same", "see", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them", "then",
    "there", "these", "they", "this", "those", "through", "to", "too", "under", "until", "up",
    "upon", "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "whom",
    "why", "will", "with", "within", "without", "would", "you", "your", "yours",
];

/// True for common English function words.
pub(crate) fn is_stopword(word: &str) -> bool {
    STOPWORDS.binary_search(&word).is_ok()
}

/// Lowercase alphanumeric tokens of `text`, in order.
pub(crate) fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Normalize a caller-supplied tag: trimmed, lowercased, `#` stripped.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let t = tag.trim().trim_start_matches('#').to_lowercase();
    if t.is_empty() {
        None
    } else {
        Some(t)
    }
}

/// Compute the tag set for one atom.
pub fn extract_tags(content: &str, caller_tags: &[String], max_auto: usize) -> Vec<String> {
    let mut tags: BTreeSet<String> = caller_tags.iter().filter_map(|t| normalize_tag(t)).collect();

    for caps in HASHTAG.captures_iter(content) {
        if let Some(m) = caps.get(1) {
            tags.insert(m.as_str().to_lowercase());
        }
    }

    for keyword in keywords(content, max_auto) {
        tags.insert(keyword);
    }

    tags.into_iter().collect()
}

fn keywords(content: &str, max: usize) -> Vec<String> {
    if max == 0 {
        return Vec::new();
    }
    // term -> (count, first position)
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, token) in tokens(content).enumerate() {
        if token.chars().count() < MIN_KEYWORD_LEN
            || is_stopword(&token)
            || token.chars().all(|c| c.is_ascii_digit())
        {
            continue;
        }
        counts.entry(token).or_insert((0, pos)).0 += 1;
    }

    let mut ranked: Vec<(String, usize, usize)> =
        counts.into_iter().map(|(t, (n, first))| (t, n, first)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().take(max).map(|(t, _, _)| t).collect()
}

/// Iterator over every `(atom_id, tag, bucket)` triple of one atom.
///
/// Yields `tags × buckets` in order; an empty bucket list is treated as
/// [`DEFAULT_BUCKET`].
pub struct TagTriples<'a> {
    atom_id: &'a str,
    tags: &'a [String],
    buckets: &'a [String],
    tag_idx: usize,
    bucket_idx: usize,
}

impl<'a> TagTriples<'a> {
    pub fn new(atom_id: &'a str, tags: &'a [String], buckets: &'a [String]) -> Self {
        Self {
            atom_id,
            tags,
            buckets,
            tag_idx: 0,
            bucket_idx: 0,
        }
    }

    fn bucket_count(&self) -> usize {
        self.buckets.len().max(1)
    }
}

impl Iterator for TagTriples<'_> {
    type Item = TagAssoc;

    fn next(&mut self) -> Option<TagAssoc> {
        let tag = self.tags.get(self.tag_idx)?;
        let bucket = if self.buckets.is_empty() {
            DEFAULT_BUCKET
        } else {
            self.buckets[self.bucket_idx].as_str()
        };
        let item = TagAssoc {
            atom_id: self.atom_id.to_string(),
            tag: tag.clone(),
            bucket: bucket.to_string(),
        };
        self.bucket_idx += 1;
        if self.bucket_idx >= self.bucket_count() {
            self.bucket_idx = 0;
            self.tag_idx += 1;
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let total = self.tags.len() * self.bucket_count();
        let done = self.tag_idx * self.bucket_count() + self.bucket_idx;
        let left = total.saturating_sub(done);
        (left, Some(left))
    }
}

impl ExactSizeIterator for TagTriples<'_> {}

/// Normalized bucket list, with the default bucket when none are given.
pub fn normalize_buckets(buckets: &[String]) -> Vec<String> {
    let set: BTreeSet<String> = buckets
        .iter()
        .map(|b| b.trim().to_lowercase())
        .filter(|b| !b.is_empty())
        .collect();
    if set.is_empty() {
        vec![DEFAULT_BUCKET.to_string()]
    } else {
        set.into_iter().collect()
    }
}
