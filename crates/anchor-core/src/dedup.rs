//! Deduplication gate: Novel / Variant / Exact classification per chunk.
//!
//! The gate runs before anything is written. For a new chunk it:
//!
//! 1. Looks for identical content (by SHA-256) among atoms pending in the
//!    current chunk, then in the store. A hit is [`Classification::Exact`].
//! 2. Fetches candidate fingerprints. Below `full_scan_ceiling` stored atoms
//!    this is every atom; above it the lookup is scoped to atoms sharing a
//!    16-bit fingerprint band with the query or seen recently in one of the
//!    chunk's buckets, capped at `candidate_limit`.
//! 3. Picks the closest candidate within `variant_threshold` bits (ties:
//!    most recent `last_seen`, then id) and returns
//!    [`Classification::Variant`]; otherwise [`Classification::Novel`].
//!
//! Exact requires identical content: a fingerprint collision between
//! different texts is a variant, so the new text is still stored.

use serde::{Deserialize, Serialize};

use crate::error::AnchorError;
use crate::fingerprint::{bands, best_kernel, DistanceKernel};
use crate::models::{content_hash, now_ms, Classification};
use crate::store::{FingerprintQuery, FingerprintRecord, FingerprintScope, Store};

const MS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Max distance at which identical content counts as the same atom.
    pub exact_threshold: u8,
    /// Max distance for a near-duplicate.
    pub variant_threshold: u8,
    /// Corpus size up to which every stored fingerprint is compared.
    pub full_scan_ceiling: u64,
    /// Time window of the scoped lookup.
    pub recent_window_days: u32,
    /// Cap on scoped candidates.
    pub candidate_limit: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            exact_threshold: 0,
            variant_threshold: 3,
            full_scan_ceiling: 10_000,
            recent_window_days: 30,
            candidate_limit: 2_000,
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<(), AnchorError> {
        if self.variant_threshold >= 64 {
            return Err(AnchorError::Config(
                "dedup.variant_threshold must be < 64".into(),
            ));
        }
        if self.exact_threshold > self.variant_threshold {
            return Err(AnchorError::Config(
                "dedup.exact_threshold must be <= dedup.variant_threshold".into(),
            ));
        }
        if self.candidate_limit == 0 {
            return Err(AnchorError::Config(
                "dedup.candidate_limit must be > 0".into(),
            ));
        }
        if self.variant_threshold > 3 {
            tracing::warn!(
                threshold = self.variant_threshold,
                "variant_threshold above 3: scoped lookups may miss near-duplicates on large corpora"
            );
        }
        Ok(())
    }
}

/// Gate bound to one store snapshot. Build one per ingestion chunk.
pub struct DedupGate<'a, S: Store + ?Sized> {
    store: &'a S,
    config: &'a DedupConfig,
    kernel: &'static dyn DistanceKernel,
    corpus_size: u64,
}

impl<'a, S: Store + ?Sized> DedupGate<'a, S> {
    /// Read the corpus size once; it decides between exhaustive and
    /// scoped lookups for the whole chunk.
    pub async fn prepare(store: &'a S, config: &'a DedupConfig) -> anyhow::Result<Self> {
        let corpus_size = store.atom_count().await?;
        Ok(Self {
            store,
            config,
            kernel: best_kernel(),
            corpus_size,
        })
    }

    pub fn is_exhaustive(&self) -> bool {
        self.corpus_size <= self.config.full_scan_ceiling
    }

    /// Classify one chunk. `pending` holds atoms accepted earlier in the
    /// same chunk that are not committed yet.
    pub async fn classify(
        &self,
        fingerprint: u64,
        content: &str,
        buckets: &[String],
        pending: &[FingerprintRecord],
    ) -> anyhow::Result<Classification> {
        let hash = content_hash(content);
        if let Some(p) = pending.iter().find(|p| p.content_hash == hash) {
            return Ok(Classification::Exact {
                existing_id: p.atom_id.clone(),
            });
        }
        if let Some(existing) = self.store.find_by_content_hash(&hash).await? {
            return Ok(Classification::Exact {
                existing_id: existing.atom_id,
            });
        }

        let scope = if self.is_exhaustive() {
            FingerprintScope::Exhaustive
        } else {
            FingerprintScope::Scoped {
                bands: bands(fingerprint),
                buckets: buckets.to_vec(),
                since: now_ms() - i64::from(self.config.recent_window_days) * MS_PER_DAY,
            }
        };
        let mut candidates = self
            .store
            .fingerprint_candidates(&FingerprintQuery {
                scope,
                limit: self.config.candidate_limit,
            })
            .await?;
        candidates.extend(pending.iter().cloned());

        Ok(classify_against(
            fingerprint,
            &hash,
            &candidates,
            self.config,
            self.kernel,
        ))
    }
}

/// Classify against an explicit candidate set.
pub fn classify_against(
    fingerprint: u64,
    content_hash: &str,
    candidates: &[FingerprintRecord],
    config: &DedupConfig,
    kernel: &dyn DistanceKernel,
) -> Classification {
    let fps: Vec<u64> = candidates.iter().map(|c| c.fingerprint).collect();
    let mut distances = Vec::with_capacity(fps.len());
    kernel.distances(fingerprint, &fps, &mut distances);

    let best = candidates
        .iter()
        .zip(distances.iter().copied())
        .filter(|(_, d)| *d <= config.variant_threshold)
        .min_by(|(a, da), (b, db)| {
            da.cmp(db)
                .then(b.last_seen.cmp(&a.last_seen))
                .then(a.atom_id.cmp(&b.atom_id))
        });

    match best {
        Some((c, d)) if d <= config.exact_threshold && c.content_hash == content_hash => {
            Classification::Exact {
                existing_id: c.atom_id.clone(),
            }
        }
        Some((c, d)) => Classification::Variant {
            canonical_id: c.atom_id.clone(),
            distance: d,
        },
        None => Classification::Novel,
    }
}
