//! Storage abstraction for Anchor.
//!
//! The [`Store`] trait defines every persistence operation the ingestion
//! pipeline and the tag-walker need, so that backends are pluggable
//! (SQLite in the application crate, [`memory::InMemoryStore`] here).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! Unique-key conflicts on insert are idempotent no-ops, never errors.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{
    Atom, BucketMembership, Compound, Molecule, Provenance, TagAssoc, VariantLink,
};

/// Fingerprint of a stored atom, as seen by the dedup gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintRecord {
    pub atom_id: String,
    pub fingerprint: u64,
    pub content_hash: String,
    pub last_seen: i64,
}

/// Which stored fingerprints the dedup gate wants to compare against.
#[derive(Debug, Clone, PartialEq)]
pub enum FingerprintScope {
    /// Every stored atom.
    Exhaustive,
    /// Atoms sharing at least one 16-bit band with the query, plus atoms in
    /// `buckets` seen at or after `since` (Unix ms).
    Scoped {
        bands: [u16; 4],
        buckets: Vec<String>,
        since: i64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintQuery {
    pub scope: FingerprintScope,
    /// Cap on returned records for [`FingerprintScope::Scoped`]. Band
    /// matches are returned before time-window matches.
    pub limit: usize,
}

/// An exact-duplicate sighting: bump `last_seen` and `occurrences`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Touch {
    pub atom_id: String,
    pub seen_at: i64,
}

/// Everything one ingestion chunk writes, committed all-or-nothing.
#[derive(Debug, Clone)]
pub struct ChunkWrite {
    pub compound: Compound,
    /// Drop older compounds (and their molecules) stored under the same
    /// path. Set on the first chunk of a document.
    pub replace_previous: bool,
    pub molecules: Vec<Molecule>,
    pub atoms: Vec<Atom>,
    pub touches: Vec<Touch>,
    pub tags: Vec<TagAssoc>,
    /// Bucket membership of every atom the chunk references, including
    /// exact duplicates seen under a new bucket.
    pub memberships: Vec<BucketMembership>,
    pub variants: Vec<VariantLink>,
    /// Rows per insert statement; batches run sequentially inside the
    /// chunk's transaction.
    pub sub_batch_size: usize,
}

impl ChunkWrite {
    /// Number of sub-batches the largest row group needs.
    pub fn sub_batches(&self) -> usize {
        let size = self.sub_batch_size.max(1);
        [
            self.atoms.len(),
            self.molecules.len(),
            self.tags.len(),
            self.memberships.len(),
            self.variants.len(),
            self.touches.len(),
        ]
        .iter()
        .map(|n| n.div_ceil(size))
        .max()
        .unwrap_or(0)
    }
}

/// Rows actually inserted by a [`ChunkWrite`] (conflicts excluded).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub atoms_inserted: usize,
    pub molecules_inserted: usize,
    pub tags_inserted: usize,
    pub memberships_inserted: usize,
    pub variants_inserted: usize,
    pub atoms_touched: usize,
}

/// Bucket / tag / provenance restriction shared by every read path.
///
/// - `buckets`: the atom must be in at least one (empty = any).
/// - `tags`: the atom must carry at least one (empty = any).
/// - `provenance`: `None` hides quarantined atoms; `Some(Quarantined)`
///   returns only quarantined atoms; any other value selects that
///   provenance among non-quarantined atoms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomFilter {
    pub buckets: Vec<String>,
    pub tags: Vec<String>,
    pub provenance: Option<Provenance>,
}

impl AtomFilter {
    pub fn matches(&self, atom: &Atom) -> bool {
        let quarantined = atom.is_quarantined();
        let provenance_ok = match self.provenance {
            None => !quarantined,
            Some(Provenance::Quarantined) => quarantined,
            Some(p) => !quarantined && atom.provenance == p,
        };
        provenance_ok
            && (self.buckets.is_empty() || atom.buckets.iter().any(|b| self.buckets.contains(b)))
            && (self.tags.is_empty() || atom.tags.iter().any(|t| self.tags.contains(t)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Every term must occur.
    All,
    /// At least one term must occur.
    Any,
}

/// Full-text query over atom content.
#[derive(Debug, Clone)]
pub struct TextQuery<'a> {
    /// Lowercase alphanumeric terms.
    pub terms: &'a [String],
    pub mode: MatchMode,
    pub filter: &'a AtomFilter,
    pub limit: usize,
}

/// A full-text match. Higher `score` is more relevant; the scale is
/// backend-specific and normalized by the caller.
#[derive(Debug, Clone)]
pub struct TextHit {
    pub atom: Atom,
    pub score: f64,
}

/// A candidate that shares at least one `(tag, bucket)` pair with an
/// anchor.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub anchor_id: String,
    pub atom: Atom,
    /// Number of distinct tags shared with the anchor.
    pub shared_tags: usize,
}

/// Abstract storage backend for Anchor.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`commit_chunk`](Store::commit_chunk) | Write one ingestion chunk atomically |
/// | [`atom_count`](Store::atom_count) | Corpus size, for dedup scan selection |
/// | [`find_by_content_hash`](Store::find_by_content_hash) | Exact-duplicate lookup |
/// | [`fingerprint_candidates`](Store::fingerprint_candidates) | Near-duplicate candidate set |
/// | [`text_search`](Store::text_search) | AND / OR full-text match |
/// | [`tag_neighbors`](Store::tag_neighbors) | Shared `(tag, bucket)` join for the walk |
/// | [`get_atoms`](Store::get_atoms) | Fetch atoms by id |
/// | [`get_compound`](Store::get_compound) | Fetch a source document |
/// | [`locate_atom`](Store::locate_atom) | Latest molecule resolving to an atom |
/// | [`molecules_for`](Store::molecules_for) | Molecules of a compound in order |
/// | [`add_tags`](Store::add_tags) | Append tag associations |
#[async_trait]
pub trait Store: Send + Sync {
    /// Write a chunk in one transaction. Either everything in `write`
    /// commits or nothing does.
    async fn commit_chunk(&self, write: &ChunkWrite) -> Result<CommitReport>;

    async fn atom_count(&self) -> Result<u64>;

    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<FingerprintRecord>>;

    async fn fingerprint_candidates(&self, query: &FingerprintQuery) -> Result<Vec<FingerprintRecord>>;

    async fn text_search(&self, query: &TextQuery<'_>) -> Result<Vec<TextHit>>;

    /// For each anchor, up to `per_anchor_limit` atoms sharing a
    /// `(tag, bucket)` pair with it, ranked by shared tag count, then
    /// most recent `last_seen`, then id. Anchors, `exclude`, and atoms
    /// rejected by `filter` never appear. The quarantine tag does not
    /// count as a shared tag.
    async fn tag_neighbors(
        &self,
        anchor_ids: &[String],
        exclude: &[String],
        filter: &AtomFilter,
        per_anchor_limit: usize,
    ) -> Result<Vec<Neighbor>>;

    /// Atoms for the given ids, in input order; unknown ids are skipped.
    async fn get_atoms(&self, ids: &[String]) -> Result<Vec<Atom>>;

    async fn get_compound(&self, id: &str) -> Result<Option<Compound>>;

    async fn locate_atom(&self, atom_id: &str) -> Result<Option<Molecule>>;

    async fn molecules_for(&self, compound_id: &str) -> Result<Vec<Molecule>>;

    /// Returns how many triples were new.
    async fn add_tags(&self, tags: &[TagAssoc]) -> Result<usize>;

    /// Release backend resources. Default is a no-op.
    async fn close(&self) {}
}
