//! Core data models: compounds, molecules, atoms, and their relations.
//!
//! A **compound** is one ingested source document, a **molecule** is one
//! positional chunk of it, and an **atom** is the retrievable unit a
//! molecule resolves to. Identical content in two documents resolves to one
//! atom; the molecules of both documents point at it.
//!
//! Identifiers are deterministic (UUID v5) so that re-ingesting the same
//! input produces the same rows and insert conflicts are idempotent.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AnchorError;

const COMPOUND_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_8b3d_4f5a_9c7e_1d2b_3a4c_5e6f);
const MOLECULE_NAMESPACE: Uuid = Uuid::from_u128(0x0b8e_7d6c_5a4f_4e3d_8c2b_1a09_f8e7_d6c5);
const ATOM_NAMESPACE: Uuid = Uuid::from_u128(0x3d5f_7a9b_1c2e_4d6f_a8b0_c2d4_e6f8_0a1b);

/// Tag that marks an atom as soft-removed.
pub const QUARANTINE_TAG: &str = "quarantined";

/// Segmentation strategy for a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Prose,
    Code,
}

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "c", "h", "cpp", "hpp", "cc", "js", "ts", "tsx", "jsx", "py", "go", "java", "kt",
    "swift", "rb", "cs", "php", "scala", "sh", "lua", "zig", "sql",
];

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Prose => "prose",
            ContentType::Code => "code",
        }
    }

    /// Infer the content type from a file extension.
    pub fn from_path(path: &str) -> Self {
        let ext = Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if CODE_EXTENSIONS.contains(&ext.as_str()) {
            ContentType::Code
        } else {
            ContentType::Prose
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = AnchorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prose" => Ok(ContentType::Prose),
            "code" => Ok(ContentType::Code),
            other => Err(AnchorError::Validation(format!(
                "unknown content type '{}': expected prose or code",
                other
            ))),
        }
    }
}

/// Where a piece of content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Internal,
    External,
    Quarantined,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Internal => "internal",
            Provenance::External => "external",
            Provenance::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provenance {
    type Err = AnchorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(Provenance::Internal),
            "external" => Ok(Provenance::External),
            "quarantined" => Ok(Provenance::Quarantined),
            other => Err(AnchorError::Validation(format!(
                "unknown provenance '{}': expected internal, external or quarantined",
                other
            ))),
        }
    }
}

/// A number found in a chunk, with an optional unit word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericValue {
    pub value: f64,
    pub unit: Option<String>,
}

/// One ingested source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compound {
    pub id: String,
    pub path: String,
    /// Ingestion time, Unix milliseconds.
    pub timestamp: i64,
    pub provenance: Provenance,
    /// Fingerprint of the whole document.
    pub signature: u64,
    /// Document text as segmented (HTML is stored cleaned).
    pub content: String,
}

/// One positional chunk of a compound.
///
/// Molecules of a compound partition `[0, content.len())` in sequence
/// order. `atom_id` is `None` for whitespace-only chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Molecule {
    pub id: String,
    pub compound_id: String,
    pub sequence: i64,
    pub start_byte: usize,
    pub end_byte: usize,
    pub content_type: ContentType,
    pub numeric_value: Option<f64>,
    pub numeric_unit: Option<String>,
    pub fingerprint: u64,
    pub timestamp: i64,
    pub atom_id: Option<String>,
    /// Larger than the configured maximum; emitted whole.
    pub oversized: bool,
    /// Hard-cut mid-unit; the next molecule continues it.
    pub continued: bool,
}

/// The smallest retrievable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub id: String,
    pub content: String,
    pub content_hash: String,
    pub source_path: String,
    pub sequence: i64,
    pub content_type: ContentType,
    pub fingerprint: u64,
    pub provenance: Provenance,
    /// Distinct tags across all buckets, sorted.
    pub tags: Vec<String>,
    /// Distinct buckets, sorted.
    pub buckets: Vec<String>,
    pub first_seen: i64,
    pub last_seen: i64,
    pub occurrences: i64,
}

impl Atom {
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_quarantined(&self) -> bool {
        self.provenance == Provenance::Quarantined || self.tags.iter().any(|t| t == QUARANTINE_TAG)
    }
}

/// One `(atom, tag, bucket)` association. Unique on the triple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagAssoc {
    pub atom_id: String,
    pub tag: String,
    pub bucket: String,
}

/// `atom_id` belongs to `bucket`, independent of any tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketMembership {
    pub atom_id: String,
    pub bucket: String,
}

/// `atom_id` is a near-duplicate of the already-stored `canonical_id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VariantLink {
    pub atom_id: String,
    pub canonical_id: String,
    pub distance: u8,
}

/// Dedup gate verdict for a new chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Classification {
    Novel,
    Variant { canonical_id: String, distance: u8 },
    Exact { existing_id: String },
}

/// Current time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SHA-256 of the content, lowercase hex.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compound id: stable for a given path and content.
pub fn compound_id(path: &str, content: &str) -> String {
    let mut key = Vec::with_capacity(path.len() + 1 + 64);
    key.extend_from_slice(path.as_bytes());
    key.push(0);
    key.extend_from_slice(content_hash(content).as_bytes());
    Uuid::new_v5(&COMPOUND_NAMESPACE, &key).to_string()
}

/// Molecule id: stable for a compound and sequence index.
pub fn molecule_id(compound_id: &str, sequence: i64) -> String {
    let key = format!("{}:{}", compound_id, sequence);
    Uuid::new_v5(&MOLECULE_NAMESPACE, key.as_bytes()).to_string()
}

/// Atom id: content-addressed, so concurrent inserts of the same text
/// collide on the primary key instead of duplicating.
pub fn atom_id(content: &str) -> String {
    Uuid::new_v5(&ATOM_NAMESPACE, content.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_from_path() {
        assert_eq!(ContentType::from_path("src/main.rs"), ContentType::Code);
        assert_eq!(ContentType::from_path("lib/App.TSX"), ContentType::Code);
        assert_eq!(ContentType::from_path("notes/today.md"), ContentType::Prose);
        assert_eq!(ContentType::from_path("README"), ContentType::Prose);
    }

    #[test]
    fn test_provenance_round_trip_str() {
        for p in [Provenance::Internal, Provenance::External, Provenance::Quarantined] {
            assert_eq!(p.as_str().parse::<Provenance>().unwrap(), p);
        }
        assert!("public".parse::<Provenance>().is_err());
    }

    #[test]
    fn test_ids_are_deterministic() {
        let c1 = compound_id("a.md", "hello");
        let c2 = compound_id("a.md", "hello");
        assert_eq!(c1, c2);
        assert_ne!(c1, compound_id("b.md", "hello"));
        assert_ne!(c1, compound_id("a.md", "hello!"));
        assert_eq!(molecule_id(&c1, 3), molecule_id(&c1, 3));
        assert_ne!(molecule_id(&c1, 3), molecule_id(&c1, 4));
        assert_eq!(atom_id("same text"), atom_id("same text"));
    }

    #[test]
    fn test_content_hash_hex() {
        let h = content_hash("abc");
        assert_eq!(h.len(), 64);
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
