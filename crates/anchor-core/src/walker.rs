//! Three-phase tag-walker search.
//!
//! # Phases
//!
//! 1. **Strict**: every query term must occur in the atom (AND). Hits are
//!    min-max normalized and admitted until the strict share of the
//!    character budget (`strict_share`, default 70%) is used.
//! 2. **Fuzzy**: runs only when strict returned nothing (or failed); any
//!    term may match (OR). Same budget as strict.
//! 3. **Walk**: starting from the atoms selected so far (the anchors),
//!    follow shared `(tag, bucket)` associations for up to `walk_radius`
//!    hops. Each candidate `M` of anchor `T` gets a gravity score
//!
//!    ```text
//!    W = α · C · e^(−λ·Δt) · (1 − d/64)
//!    ```
//!
//!    with `C` shared tags, `Δt` the `last_seen` gap in hours, `d` the
//!    fingerprint distance, and `α` the damping. Candidates below
//!    `gravity_threshold` are pruned; at most `max_per_hop` survivors per
//!    anchor are picked by weighted reservoir sampling.
//!
//! The walk visits at most `|anchors| × max_per_hop^walk_radius`
//! candidates in total, whatever the density of the tag graph.
//!
//! When strict already produced `min_results` atoms the walk is limited to
//! the remaining share of the budget; otherwise it may use all that is
//! left. A phase is admitted atom by atom while its used characters are
//! below its budget, so the last admitted atom can overflow it; the
//! assembler trims the final text.
//!
//! Store failures never escape: the failing phase records its error and
//! the outcome is flagged `degraded`.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::AnchorError;
use crate::fingerprint::{distance, similarity};
use crate::models::{Atom, Provenance};
use crate::store::{AtomFilter, MatchMode, Store, TextHit, TextQuery};
use crate::tagger::{is_stopword, tokens};

const MS_PER_HOUR: f64 = 3_600_000.0;
const MAX_QUERY_TERMS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerConfig {
    /// Fraction of the budget reserved for strict/fuzzy hits.
    pub strict_share: f64,
    /// `α` in the gravity score.
    pub damping: f64,
    /// `λ` in the gravity score, per hour.
    pub decay_lambda: f64,
    pub gravity_threshold: f64,
    /// 0 picks the heaviest candidates deterministically.
    pub temperature: f64,
    pub walk_radius: usize,
    pub max_per_hop: usize,
    /// Neighbors fetched per anchor before pruning and sampling.
    pub candidate_pool: usize,
    /// Strict hits needed before the walk is held to its own share.
    pub min_results: usize,
    pub max_strict_hits: usize,
    /// RNG seed for sampling; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            strict_share: 0.7,
            damping: 0.85,
            decay_lambda: 0.001,
            gravity_threshold: 0.01,
            temperature: 0.0,
            walk_radius: 2,
            max_per_hop: 3,
            candidate_pool: 32,
            min_results: 3,
            max_strict_hits: 200,
            seed: None,
        }
    }
}

impl WalkerConfig {
    pub fn validate(&self) -> Result<(), AnchorError> {
        let fail = |msg: &str| Err(AnchorError::Config(format!("retrieval.{}", msg)));
        if !(self.strict_share > 0.0 && self.strict_share <= 1.0) {
            return fail("strict_share must be in (0, 1]");
        }
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return fail("damping must be in (0, 1]");
        }
        if !(self.decay_lambda >= 0.0 && self.decay_lambda.is_finite()) {
            return fail("decay_lambda must be >= 0");
        }
        if !(self.gravity_threshold >= 0.0) {
            return fail("gravity_threshold must be >= 0");
        }
        if !(self.temperature >= 0.0 && self.temperature.is_finite()) {
            return fail("temperature must be >= 0");
        }
        if self.walk_radius == 0 {
            return fail("walk_radius must be >= 1");
        }
        if self.max_per_hop == 0 {
            return fail("max_per_hop must be >= 1");
        }
        if self.candidate_pool == 0 || self.max_strict_hits == 0 {
            return fail("candidate_pool and max_strict_hits must be > 0");
        }
        Ok(())
    }

    /// Upper bound on walk picks for a given anchor count.
    pub fn visit_cap(&self, anchors: usize) -> usize {
        let per_anchor = u32::try_from(self.walk_radius)
            .ok()
            .and_then(|r| self.max_per_hop.checked_pow(r))
            .unwrap_or(usize::MAX);
        anchors.saturating_mul(per_anchor)
    }
}

/// A retrieval query.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub buckets: Vec<String>,
    pub tags: Vec<String>,
    pub char_budget: usize,
    pub provenance: Option<Provenance>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, char_budget: usize) -> Self {
        Self {
            query: query.into(),
            buckets: Vec::new(),
            tags: Vec::new(),
            char_budget,
            provenance: None,
        }
    }

    pub fn buckets(mut self, buckets: Vec<String>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    fn filter(&self) -> AtomFilter {
        AtomFilter {
            buckets: self.buckets.clone(),
            tags: self.tags.clone(),
            provenance: self.provenance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Strict,
    Fuzzy,
    Walk,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedAtom {
    pub atom: Atom,
    /// Relevance in `[0, 1]`.
    pub score: f64,
    pub phase: Phase,
    /// Raw gravity for walk atoms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gravity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_id: Option<String>,
    /// 0 for strict/fuzzy hits.
    pub hop: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseReport {
    pub ran: bool,
    /// Rows returned by the store before budgeting.
    pub hits: usize,
    /// Atoms admitted into the result.
    pub contributed: usize,
    pub chars: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchStats {
    pub strict: PhaseReport,
    pub fuzzy: PhaseReport,
    pub walk: PhaseReport,
    pub atom_count: usize,
    /// Characters admitted. May exceed `char_budget`: the last atom a phase
    /// admits can overflow it, and the assembler trims the rendered context.
    pub char_count: usize,
    pub char_budget: usize,
    /// A phase failed; results may be partial.
    pub degraded: bool,
    /// Candidates picked by the walk.
    pub visited: usize,
}

impl SearchStats {
    /// Phases that admitted at least one atom.
    pub fn contributing_phases(&self) -> Vec<Phase> {
        [
            (Phase::Strict, &self.strict),
            (Phase::Fuzzy, &self.fuzzy),
            (Phase::Walk, &self.walk),
        ]
        .into_iter()
        .filter(|(_, r)| r.contributed > 0)
        .map(|(p, _)| p)
        .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    pub atoms: Vec<RetrievedAtom>,
    pub stats: SearchStats,
}

/// `W = α · C · e^(−λ·Δt) · (1 − d/64)`.
pub fn gravity(shared_tags: usize, delta_hours: f64, distance: u8, damping: f64, lambda: f64) -> f64 {
    damping * shared_tags as f64 * (-lambda * delta_hours.abs()).exp() * similarity(distance)
}

/// A sampling candidate.
#[derive(Debug, Clone)]
pub struct Weighted<T> {
    pub item: T,
    pub weight: f64,
    pub last_seen: i64,
    pub id: String,
}

fn deterministic_order<T>(a: &Weighted<T>, b: &Weighted<T>) -> std::cmp::Ordering {
    b.weight
        .partial_cmp(&a.weight)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(b.last_seen.cmp(&a.last_seen))
        .then(a.id.cmp(&b.id))
}

/// Pick up to `k` candidates.
///
/// At temperature 0 the heaviest win (ties: most recent `last_seen`, then
/// id). Otherwise each candidate draws the A-Res key `ln(u) / w^(1/T)` and
/// the `k` largest keys win: low temperatures approach the deterministic
/// order, high temperatures approach uniform sampling.
pub fn weighted_sample<T, R: Rng + ?Sized>(
    mut pool: Vec<Weighted<T>>,
    k: usize,
    temperature: f64,
    rng: &mut R,
) -> Vec<Weighted<T>> {
    pool.retain(|c| c.weight > 0.0 && c.weight.is_finite());
    if temperature <= f64::EPSILON || pool.len() <= 1 {
        pool.sort_by(deterministic_order);
        pool.truncate(k);
        return pool;
    }

    let mut keyed: Vec<(f64, Weighted<T>)> = pool
        .into_iter()
        .map(|c| {
            let u: f64 = 1.0 - rng.gen::<f64>();
            let tempered = c.weight.powf(1.0 / temperature).max(f64::MIN_POSITIVE);
            (u.ln() / tempered, c)
        })
        .collect();
    keyed.sort_by(|(ka, a), (kb, b)| {
        kb.partial_cmp(ka)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| deterministic_order(a, b))
    });
    keyed.into_iter().take(k).map(|(_, c)| c).collect()
}

/// Lowercase query terms with stopwords dropped; if every term is a
/// stopword the raw terms are used.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let raw: Vec<String> = tokens(query).filter(|t| seen.insert(t.clone())).collect();
    let content: Vec<String> = raw.iter().filter(|t| !is_stopword(t)).cloned().collect();
    let mut terms = if content.is_empty() { raw } else { content };
    terms.truncate(MAX_QUERY_TERMS);
    terms
}

/// Min-max normalize scores into `[0, 1]`; all-equal scores become 1.
fn normalize(hits: &mut [TextHit]) {
    let (min, max) = hits.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), h| {
        (lo.min(h.score), hi.max(h.score))
    });
    let range = max - min;
    for h in hits.iter_mut() {
        h.score = if range.abs() < f64::EPSILON {
            1.0
        } else {
            (h.score - min) / range
        };
    }
}

struct Accumulator {
    atoms: Vec<RetrievedAtom>,
    selected: HashSet<String>,
    chars: usize,
}

impl Accumulator {
    fn admit(&mut self, item: RetrievedAtom, report: &mut PhaseReport) {
        let len = item.atom.char_len();
        self.selected.insert(item.atom.id.clone());
        self.chars += len;
        report.contributed += 1;
        report.chars += len;
        self.atoms.push(item);
    }
}

/// Runs searches against one store.
pub struct TagWalker<'a, S: Store + ?Sized> {
    store: &'a S,
    config: &'a WalkerConfig,
}

impl<'a, S: Store + ?Sized> TagWalker<'a, S> {
    pub fn new(store: &'a S, config: &'a WalkerConfig) -> Self {
        Self { store, config }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome, AnchorError> {
        if request.char_budget == 0 {
            return Err(AnchorError::Validation("char_budget must be > 0".into()));
        }
        let mut stats = SearchStats {
            char_budget: request.char_budget,
            ..Default::default()
        };
        let terms = query_terms(&request.query);
        if terms.is_empty() {
            return Ok(SearchOutcome {
                atoms: Vec::new(),
                stats,
            });
        }

        let filter = request.filter();
        let strict_budget = ((request.char_budget as f64) * self.config.strict_share).ceil() as usize;
        let mut acc = Accumulator {
            atoms: Vec::new(),
            selected: HashSet::new(),
            chars: 0,
        };

        let strict_found = self
            .match_phase(Phase::Strict, &terms, &filter, strict_budget, &mut acc, &mut stats.strict)
            .await;
        if !strict_found {
            self.match_phase(Phase::Fuzzy, &terms, &filter, strict_budget, &mut acc, &mut stats.fuzzy)
                .await;
        }

        let remaining = request.char_budget.saturating_sub(acc.chars);
        let walk_budget = if stats.strict.contributed >= self.config.min_results {
            remaining.min(request.char_budget - strict_budget.min(request.char_budget))
        } else {
            remaining
        };
        if !acc.atoms.is_empty() && walk_budget > 0 {
            stats.visited = self.walk(&filter, walk_budget, &mut acc, &mut stats.walk).await;
        }

        stats.degraded =
            stats.strict.error.is_some() || stats.fuzzy.error.is_some() || stats.walk.error.is_some();
        stats.atom_count = acc.atoms.len();
        stats.char_count = acc.chars;
        tracing::debug!(
            query = %request.query,
            atoms = stats.atom_count,
            chars = stats.char_count,
            degraded = stats.degraded,
            "search finished"
        );
        Ok(SearchOutcome {
            atoms: acc.atoms,
            stats,
        })
    }

    /// Run a full-text phase. Returns true when the store returned any
    /// rows without error.
    async fn match_phase(
        &self,
        phase: Phase,
        terms: &[String],
        filter: &AtomFilter,
        budget: usize,
        acc: &mut Accumulator,
        report: &mut PhaseReport,
    ) -> bool {
        report.ran = true;
        let mode = if phase == Phase::Strict {
            MatchMode::All
        } else {
            MatchMode::Any
        };
        let result = self
            .store
            .text_search(&TextQuery {
                terms,
                mode,
                filter,
                limit: self.config.max_strict_hits,
            })
            .await;
        let mut hits = match result {
            Ok(hits) => hits,
            Err(e) => {
                let err = AnchorError::from_store(&e);
                tracing::warn!(?phase, error = %err, "search phase failed");
                report.error = Some(err.to_string());
                return false;
            }
        };
        report.hits = hits.len();
        if hits.is_empty() {
            return false;
        }

        normalize(&mut hits);
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.atom.last_seen.cmp(&a.atom.last_seen))
                .then(a.atom.id.cmp(&b.atom.id))
        });

        let mut used = 0;
        for hit in hits {
            if used >= budget {
                break;
            }
            if acc.selected.contains(&hit.atom.id) {
                continue;
            }
            used += hit.atom.char_len();
            acc.admit(
                RetrievedAtom {
                    atom: hit.atom,
                    score: hit.score,
                    phase,
                    gravity: None,
                    anchor_id: None,
                    hop: 0,
                },
                report,
            );
        }
        true
    }

    /// Expand from the current selection. Returns the number of picks.
    async fn walk(
        &self,
        filter: &AtomFilter,
        budget: usize,
        acc: &mut Accumulator,
        report: &mut PhaseReport,
    ) -> usize {
        report.ran = true;
        let cfg = self.config;
        let cap = cfg.visit_cap(acc.atoms.len());
        let mut rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        // (atom, relevance) of the current frontier
        let mut frontier: Vec<(Atom, f64)> =
            acc.atoms.iter().map(|r| (r.atom.clone(), r.score)).collect();
        let mut visited = 0usize;
        let mut used = 0usize;

        'hops: for hop in 1..=cfg.walk_radius {
            if frontier.is_empty() {
                break;
            }
            let anchor_ids: Vec<String> = frontier.iter().map(|(a, _)| a.id.clone()).collect();
            let exclude: Vec<String> = acc.selected.iter().cloned().collect();
            let neighbors = match self
                .store
                .tag_neighbors(&anchor_ids, &exclude, filter, cfg.candidate_pool)
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    let err = AnchorError::from_store(&e);
                    tracing::warn!(hop, error = %err, "walk hop failed");
                    report.error = Some(err.to_string());
                    break;
                }
            };
            report.hits += neighbors.len();

            let mut by_anchor: HashMap<String, Vec<_>> = HashMap::new();
            for n in neighbors {
                by_anchor.entry(n.anchor_id.clone()).or_default().push(n);
            }

            let mut next = Vec::new();
            for (anchor, anchor_score) in &frontier {
                let Some(cands) = by_anchor.remove(&anchor.id) else {
                    continue;
                };
                let pool: Vec<Weighted<_>> = cands
                    .into_iter()
                    .filter(|n| !acc.selected.contains(&n.atom.id))
                    .filter_map(|n| {
                        let dt = (n.atom.last_seen - anchor.last_seen) as f64 / MS_PER_HOUR;
                        let d = distance(n.atom.fingerprint, anchor.fingerprint);
                        let w = gravity(n.shared_tags, dt, d, cfg.damping, cfg.decay_lambda);
                        (w >= cfg.gravity_threshold).then(|| Weighted {
                            id: n.atom.id.clone(),
                            last_seen: n.atom.last_seen,
                            weight: w,
                            item: n.atom,
                        })
                    })
                    .collect();

                let picks = weighted_sample(pool, cfg.max_per_hop, cfg.temperature, &mut rng);
                let top = picks.iter().map(|p| p.weight).fold(0.0, f64::max);
                for pick in picks {
                    if visited >= cap || used >= budget {
                        break 'hops;
                    }
                    visited += 1;
                    let relevance = anchor_score * cfg.damping * (pick.weight / top);
                    used += pick.item.char_len();
                    next.push((pick.item.clone(), relevance));
                    acc.admit(
                        RetrievedAtom {
                            atom: pick.item,
                            score: relevance,
                            phase: Phase::Walk,
                            gravity: Some(pick.weight),
                            anchor_id: Some(anchor.id.clone()),
                            hop,
                        },
                        report,
                    );
                }
            }
            frontier = next;
        }

        tracing::debug!(visited, cap, chars = used, "walk finished");
        visited
    }
}
