//! In-memory [`Store`] implementation for tests and embedding.
//!
//! State lives behind one `std::sync::RwLock`; a chunk commit takes the
//! write lock once, so commits are trivially all-or-nothing. Full-text
//! search tokenizes atom content on the fly and scores by term frequency.
//!
//! Failures can be injected to exercise rollback and degraded retrieval:
//! [`InMemoryStore::set_unavailable`], [`InMemoryStore::fail_next_commits`]
//! and [`InMemoryStore::fail_next_searches`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::error::AnchorError;
use crate::fingerprint::bands;
use crate::models::{Atom, BucketMembership, Compound, Molecule, TagAssoc, QUARANTINE_TAG};
use crate::tagger::tokens;

use super::{
    ChunkWrite, CommitReport, FingerprintQuery, FingerprintRecord, FingerprintScope, MatchMode,
    Neighbor, Store, TextHit, TextQuery, AtomFilter,
};

#[derive(Default)]
struct State {
    compounds: HashMap<String, Compound>,
    /// Keyed by `(compound_id, sequence)`.
    molecules: BTreeMap<(String, i64), Molecule>,
    /// Stored without tags/buckets; hydrated from `atom_tags` and
    /// `atom_buckets` on read.
    atoms: HashMap<String, Atom>,
    atom_tags: HashMap<String, BTreeSet<(String, String)>>,
    atom_buckets: HashMap<String, BTreeSet<String>>,
    pair_atoms: HashMap<(String, String), BTreeSet<String>>,
    variants: BTreeMap<(String, String), u8>,
}

impl State {
    fn hydrate(&self, atom: &Atom) -> Atom {
        let mut out = atom.clone();
        let pairs = self.atom_tags.get(&atom.id);
        let tags: BTreeSet<&String> = pairs.iter().flat_map(|p| p.iter().map(|(t, _)| t)).collect();
        out.tags = tags.into_iter().cloned().collect();
        out.buckets = self.buckets_of(&atom.id).into_iter().cloned().collect();
        out
    }

    /// Member buckets plus any bucket a tag row names.
    fn buckets_of(&self, atom_id: &str) -> BTreeSet<&String> {
        let mut buckets: BTreeSet<&String> = self
            .atom_buckets
            .get(atom_id)
            .map(|b| b.iter().collect())
            .unwrap_or_default();
        if let Some(pairs) = self.atom_tags.get(atom_id) {
            buckets.extend(pairs.iter().map(|(_, b)| b));
        }
        buckets
    }

    fn insert_membership(&mut self, membership: &BucketMembership) -> bool {
        self.atom_buckets
            .entry(membership.atom_id.clone())
            .or_default()
            .insert(membership.bucket.clone())
    }

    fn insert_tag(&mut self, assoc: &TagAssoc) -> bool {
        let pair = (assoc.tag.clone(), assoc.bucket.clone());
        let fresh = self
            .atom_tags
            .entry(assoc.atom_id.clone())
            .or_default()
            .insert(pair.clone());
        if fresh {
            self.pair_atoms
                .entry(pair)
                .or_default()
                .insert(assoc.atom_id.clone());
        }
        fresh
    }

    fn remove_compound(&mut self, id: &str) {
        self.compounds.remove(id);
        self.molecules.retain(|(cid, _), _| cid != id);
    }
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
    failing_commits: AtomicUsize,
    failing_searches: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`AnchorError::StoreUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to [`Store::commit_chunk`] before anything
    /// is written.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to [`Store::text_search`].
    pub fn fail_next_searches(&self, n: usize) {
        self.failing_searches.store(n, Ordering::SeqCst);
    }

    /// All stored `variant_of` links as `(atom_id, canonical_id, distance)`.
    pub fn variant_links(&self) -> Result<Vec<(String, String, u8)>> {
        let state = self.read()?;
        Ok(state
            .variants
            .iter()
            .map(|((a, c), d)| (a.clone(), c.clone(), *d))
            .collect())
    }

    /// Number of stored molecules.
    pub fn molecule_count(&self) -> Result<usize> {
        Ok(self.read()?.molecules.len())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::Error::new(AnchorError::StoreUnavailable(
                "in-memory store marked unavailable".into(),
            )));
        }
        Ok(())
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.check_available()?;
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.check_available()?;
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn commit_chunk(&self, write: &ChunkWrite) -> Result<CommitReport> {
        self.check_available()?;
        if Self::take_failure(&self.failing_commits) {
            return Err(anyhow::Error::new(AnchorError::StoreUnavailable(
                "injected commit failure".into(),
            )));
        }
        let mut state = self.write()?;
        let mut report = CommitReport::default();

        if write.replace_previous {
            let stale: Vec<String> = state
                .compounds
                .values()
                .filter(|c| c.path == write.compound.path && c.id != write.compound.id)
                .map(|c| c.id.clone())
                .collect();
            for id in stale {
                state.remove_compound(&id);
            }
        }
        state
            .compounds
            .entry(write.compound.id.clone())
            .or_insert_with(|| write.compound.clone());

        for atom in &write.atoms {
            if !state.atoms.contains_key(&atom.id) {
                let mut stored = atom.clone();
                stored.tags.clear();
                stored.buckets.clear();
                state.atoms.insert(atom.id.clone(), stored);
                report.atoms_inserted += 1;
            }
        }

        for molecule in &write.molecules {
            let key = (molecule.compound_id.clone(), molecule.sequence);
            if !state.molecules.contains_key(&key) {
                state.molecules.insert(key, molecule.clone());
                report.molecules_inserted += 1;
            }
        }

        for touch in &write.touches {
            if let Some(atom) = state.atoms.get_mut(&touch.atom_id) {
                atom.last_seen = atom.last_seen.max(touch.seen_at);
                atom.occurrences += 1;
                report.atoms_touched += 1;
            }
        }

        for assoc in &write.tags {
            if state.insert_tag(assoc) {
                report.tags_inserted += 1;
            }
        }

        for membership in &write.memberships {
            if state.insert_membership(membership) {
                report.memberships_inserted += 1;
            }
        }

        for link in &write.variants {
            let key = (link.atom_id.clone(), link.canonical_id.clone());
            if !state.variants.contains_key(&key) {
                state.variants.insert(key, link.distance);
                report.variants_inserted += 1;
            }
        }

        Ok(report)
    }

    async fn atom_count(&self) -> Result<u64> {
        Ok(self.read()?.atoms.len() as u64)
    }

    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<FingerprintRecord>> {
        let state = self.read()?;
        Ok(state
            .atoms
            .values()
            .find(|a| a.content_hash == content_hash)
            .map(|a| FingerprintRecord {
                atom_id: a.id.clone(),
                fingerprint: a.fingerprint,
                content_hash: a.content_hash.clone(),
                last_seen: a.last_seen,
            }))
    }

    async fn fingerprint_candidates(&self, query: &FingerprintQuery) -> Result<Vec<FingerprintRecord>> {
        let state = self.read()?;
        let record = |a: &Atom| FingerprintRecord {
            atom_id: a.id.clone(),
            fingerprint: a.fingerprint,
            content_hash: a.content_hash.clone(),
            last_seen: a.last_seen,
        };

        match &query.scope {
            FingerprintScope::Exhaustive => Ok(state.atoms.values().map(record).collect()),
            FingerprintScope::Scoped {
                bands: wanted,
                buckets,
                since,
            } => {
                let mut ranked: Vec<(bool, &Atom)> = state
                    .atoms
                    .values()
                    .filter_map(|a| {
                        let band_hit = bands(a.fingerprint)
                            .iter()
                            .zip(wanted.iter())
                            .any(|(x, y)| x == y);
                        let recent = a.last_seen >= *since
                            && state.buckets_of(&a.id).iter().any(|b| buckets.contains(*b));
                        (band_hit || recent).then_some((band_hit, a))
                    })
                    .collect();
                ranked.sort_by(|(ha, a), (hb, b)| {
                    hb.cmp(ha)
                        .then(b.last_seen.cmp(&a.last_seen))
                        .then(a.id.cmp(&b.id))
                });
                Ok(ranked
                    .into_iter()
                    .take(query.limit)
                    .map(|(_, a)| record(a))
                    .collect())
            }
        }
    }

    async fn text_search(&self, query: &TextQuery<'_>) -> Result<Vec<TextHit>> {
        self.check_available()?;
        if Self::take_failure(&self.failing_searches) {
            return Err(anyhow::Error::new(AnchorError::StoreUnavailable(
                "injected search failure".into(),
            )));
        }
        if query.terms.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.read()?;
        let mut hits = Vec::new();
        for atom in state.atoms.values() {
            let mut freq: HashMap<String, usize> = HashMap::new();
            for token in tokens(&atom.content) {
                *freq.entry(token).or_insert(0) += 1;
            }
            let counts: Vec<usize> = query
                .terms
                .iter()
                .map(|t| freq.get(t).copied().unwrap_or(0))
                .collect();
            let matched = match query.mode {
                MatchMode::All => counts.iter().all(|&n| n > 0),
                MatchMode::Any => counts.iter().any(|&n| n > 0),
            };
            if !matched {
                continue;
            }
            let hydrated = state.hydrate(atom);
            if !query.filter.matches(&hydrated) {
                continue;
            }
            let total: usize = freq.values().sum();
            let score = counts.iter().sum::<usize>() as f64 / total.max(1) as f64;
            hits.push(TextHit {
                atom: hydrated,
                score,
            });
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.atom.last_seen.cmp(&a.atom.last_seen))
                .then(a.atom.id.cmp(&b.atom.id))
        });
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn tag_neighbors(
        &self,
        anchor_ids: &[String],
        exclude: &[String],
        filter: &AtomFilter,
        per_anchor_limit: usize,
    ) -> Result<Vec<Neighbor>> {
        let state = self.read()?;
        let mut out = Vec::new();
        for anchor_id in anchor_ids {
            let Some(pairs) = state.atom_tags.get(anchor_id) else {
                continue;
            };
            let mut shared: HashMap<&String, BTreeSet<&String>> = HashMap::new();
            for pair in pairs {
                if pair.0 == QUARANTINE_TAG {
                    continue;
                }
                let Some(atoms) = state.pair_atoms.get(pair) else {
                    continue;
                };
                for id in atoms {
                    if id == anchor_id || anchor_ids.contains(id) || exclude.contains(id) {
                        continue;
                    }
                    shared.entry(id).or_default().insert(&pair.0);
                }
            }

            let mut ranked: Vec<Neighbor> = shared
                .into_iter()
                .filter_map(|(id, tags)| {
                    let atom = state.hydrate(state.atoms.get(id)?);
                    filter.matches(&atom).then(|| Neighbor {
                        anchor_id: anchor_id.clone(),
                        atom,
                        shared_tags: tags.len(),
                    })
                })
                .collect();
            ranked.sort_by(|a, b| {
                b.shared_tags
                    .cmp(&a.shared_tags)
                    .then(b.atom.last_seen.cmp(&a.atom.last_seen))
                    .then(a.atom.id.cmp(&b.atom.id))
            });
            ranked.truncate(per_anchor_limit);
            out.extend(ranked);
        }
        Ok(out)
    }

    async fn get_atoms(&self, ids: &[String]) -> Result<Vec<Atom>> {
        let state = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.atoms.get(id).map(|a| state.hydrate(a)))
            .collect())
    }

    async fn get_compound(&self, id: &str) -> Result<Option<Compound>> {
        Ok(self.read()?.compounds.get(id).cloned())
    }

    async fn locate_atom(&self, atom_id: &str) -> Result<Option<Molecule>> {
        let state = self.read()?;
        Ok(state
            .molecules
            .values()
            .filter(|m| m.atom_id.as_deref() == Some(atom_id))
            .max_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then(b.compound_id.cmp(&a.compound_id))
                    .then(b.sequence.cmp(&a.sequence))
            })
            .cloned())
    }

    async fn molecules_for(&self, compound_id: &str) -> Result<Vec<Molecule>> {
        let state = self.read()?;
        Ok(state
            .molecules
            .iter()
            .filter(|((cid, _), _)| cid == compound_id)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn add_tags(&self, tags: &[TagAssoc]) -> Result<usize> {
        let mut state = self.write()?;
        let mut added = 0;
        for assoc in tags {
            if !state.atoms.contains_key(&assoc.atom_id) {
                continue;
            }
            state.insert_membership(&BucketMembership {
                atom_id: assoc.atom_id.clone(),
                bucket: assoc.bucket.clone(),
            });
            if state.insert_tag(assoc) {
                added += 1;
            }
        }
        Ok(added)
    }
}
