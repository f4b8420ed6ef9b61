//! Budget-constrained context assembly.
//!
//! Candidates are ranked by a mixed score
//!
//! ```text
//! score = relevance · w_r + recency · w_c      recency = max(0, 1 − age / window)
//! ```
//!
//! with `(w_r, w_c)` = 0.7/0.3, shifted to 0.4/0.6 when the query carries a
//! temporal signal ("latest", "recent", "today", …). The budget is filled
//! greedily in score order:
//!
//! - an atom that fits is included whole (it may use the safety margin);
//! - an atom that does not fit is cut at the last sentence or paragraph
//!   boundary inside the remaining space if that boundary lies past half of
//!   it, otherwise hard-truncated with the truncation marker.
//!
//! The chosen atoms are then put back in chronological order (first seen,
//! then source path, then sequence) and joined with the separator, which
//! counts against the budget. Sizes are in characters.

use serde::{Deserialize, Serialize};

use crate::error::AnchorError;
use crate::models::now_ms;
use crate::tagger::tokens;
use crate::walker::RetrievedAtom;

const MS_PER_DAY: f64 = 86_400_000.0;
const MIN_SLICE_CHARS: usize = 16;

const TEMPORAL_TERMS: &[&str] = &[
    "current", "currently", "just", "last", "latest", "new", "newest", "now", "recent",
    "recently", "today", "tonight", "yesterday",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    pub relevance_weight: f64,
    pub recency_weight: f64,
    /// Weights used when the query has a temporal signal.
    pub temporal_relevance_weight: f64,
    pub temporal_recency_weight: f64,
    pub recency_window_days: f64,
    pub chars_per_token: f64,
    /// Fraction of the budget an atom included whole may overrun.
    pub safety_margin: f64,
    /// Inflation radius bounds, in bytes.
    pub min_radius: usize,
    pub max_radius: usize,
    pub separator: String,
    pub truncation_marker: String,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            relevance_weight: 0.7,
            recency_weight: 0.3,
            temporal_relevance_weight: 0.4,
            temporal_recency_weight: 0.6,
            recency_window_days: 30.0,
            chars_per_token: 4.0,
            safety_margin: 0.05,
            min_radius: 200,
            max_radius: 32 * 1024,
            separator: "\n\n".to_string(),
            truncation_marker: "…[truncated]".to_string(),
        }
    }
}

impl AssemblerConfig {
    pub fn validate(&self) -> Result<(), AnchorError> {
        let fail = |msg: &str| Err(AnchorError::Config(format!("context.{}", msg)));
        let unit = |w: f64| (0.0..=1.0).contains(&w);
        for (a, b) in [
            (self.relevance_weight, self.recency_weight),
            (self.temporal_relevance_weight, self.temporal_recency_weight),
        ] {
            if !unit(a) || !unit(b) || ((a + b) - 1.0).abs() > 1e-6 {
                return fail("relevance/recency weights must be in [0, 1] and sum to 1");
            }
        }
        if !(self.recency_window_days > 0.0) {
            return fail("recency_window_days must be > 0");
        }
        if !(self.chars_per_token > 0.0) {
            return fail("chars_per_token must be > 0");
        }
        if !(0.0..1.0).contains(&self.safety_margin) {
            return fail("safety_margin must be in [0, 1)");
        }
        if self.min_radius > self.max_radius {
            return fail("min_radius must be <= max_radius");
        }
        Ok(())
    }
}

/// True when the query asks for recent material.
pub fn has_temporal_signal(query: &str) -> bool {
    tokens(query).any(|t| TEMPORAL_TERMS.contains(&t.as_str()))
}

/// Context window radius for expanding hits into their source: the fewer
/// hits, the wider the window.
pub fn inflation_radius(hits: usize, min_radius: usize, max_radius: usize) -> usize {
    if hits == 0 {
        return max_radius;
    }
    (max_radius / hits).clamp(min_radius, max_radius)
}

#[derive(Debug, Clone, Serialize)]
pub struct AssembledAtom {
    pub atom_id: String,
    pub source_path: String,
    pub sequence: i64,
    pub chars: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextStats {
    pub char_count: usize,
    pub token_estimate: usize,
    pub fill_percent: f64,
    pub atom_count: usize,
    pub truncated_count: usize,
    pub char_budget: usize,
    pub temporal: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssembledContext {
    pub text: String,
    pub stats: ContextStats,
    pub atoms: Vec<AssembledAtom>,
}

struct Piece<'c> {
    candidate: &'c RetrievedAtom,
    text: String,
    chars: usize,
    truncated: bool,
}

pub struct ContextAssembler<'a> {
    config: &'a AssemblerConfig,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(config: &'a AssemblerConfig) -> Self {
        Self { config }
    }

    pub fn assemble(
        &self,
        query: &str,
        candidates: &[RetrievedAtom],
        budget: usize,
    ) -> Result<AssembledContext, AnchorError> {
        self.assemble_at(query, candidates, budget, now_ms())
    }

    /// [`assemble`](Self::assemble) with an explicit clock.
    pub fn assemble_at(
        &self,
        query: &str,
        candidates: &[RetrievedAtom],
        budget: usize,
        now: i64,
    ) -> Result<AssembledContext, AnchorError> {
        if budget == 0 {
            return Err(AnchorError::Validation("budget must be > 0".into()));
        }
        let cfg = self.config;
        let temporal = has_temporal_signal(query);
        let (w_r, w_c) = if temporal {
            (cfg.temporal_relevance_weight, cfg.temporal_recency_weight)
        } else {
            (cfg.relevance_weight, cfg.recency_weight)
        };
        let window_ms = cfg.recency_window_days * MS_PER_DAY;

        let mut ranked: Vec<(f64, &RetrievedAtom)> = candidates
            .iter()
            .map(|c| {
                let age = (now - c.atom.last_seen).max(0) as f64;
                let recency = (1.0 - age / window_ms).max(0.0);
                (c.score.clamp(0.0, 1.0) * w_r + recency * w_c, c)
            })
            .collect();
        ranked.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.atom.last_seen.cmp(&a.atom.last_seen))
                .then(a.atom.id.cmp(&b.atom.id))
        });

        let sep_chars = cfg.separator.chars().count();
        let marker_chars = cfg.truncation_marker.chars().count();
        let hard_limit = budget + (budget as f64 * cfg.safety_margin).floor() as usize;
        let mut used = 0usize;
        let mut pieces: Vec<Piece> = Vec::new();

        for (_, candidate) in ranked {
            if used >= budget {
                break;
            }
            let sep = if pieces.is_empty() { 0 } else { sep_chars };
            let chars = candidate.atom.char_len();
            if chars == 0 {
                continue;
            }
            if used + sep + chars <= hard_limit {
                used += sep + chars;
                pieces.push(Piece {
                    candidate,
                    text: candidate.atom.content.clone(),
                    chars,
                    truncated: false,
                });
                continue;
            }

            let space = budget.saturating_sub(used + sep);
            if space < MIN_SLICE_CHARS.max(marker_chars + 1) {
                continue;
            }
            let text = slice_to_fit(&candidate.atom.content, space, &cfg.truncation_marker);
            let chars = text.chars().count();
            used += sep + chars;
            pieces.push(Piece {
                candidate,
                text,
                chars,
                truncated: true,
            });
        }

        pieces.sort_by(|a, b| {
            let (x, y) = (&a.candidate.atom, &b.candidate.atom);
            x.first_seen
                .cmp(&y.first_seen)
                .then_with(|| x.source_path.cmp(&y.source_path))
                .then(x.sequence.cmp(&y.sequence))
        });

        let text = pieces
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(&cfg.separator);
        let char_count = text.chars().count();
        let stats = ContextStats {
            char_count,
            token_estimate: (char_count as f64 / cfg.chars_per_token).ceil() as usize,
            fill_percent: (char_count as f64 / budget as f64 * 100.0 * 100.0).round() / 100.0,
            atom_count: pieces.len(),
            truncated_count: pieces.iter().filter(|p| p.truncated).count(),
            char_budget: budget,
            temporal,
        };
        let atoms = pieces
            .iter()
            .map(|p| AssembledAtom {
                atom_id: p.candidate.atom.id.clone(),
                source_path: p.candidate.atom.source_path.clone(),
                sequence: p.candidate.atom.sequence,
                chars: p.chars,
                truncated: p.truncated,
            })
            .collect();

        Ok(AssembledContext { text, stats, atoms })
    }
}

/// Cut `content` to at most `space` chars: at a sentence or paragraph
/// boundary past half of the space, else hard-cut with `marker`.
fn slice_to_fit(content: &str, space: usize, marker: &str) -> String {
    let prefix_end = content
        .char_indices()
        .nth(space)
        .map_or(content.len(), |(i, _)| i);
    let prefix = &content[..prefix_end];

    let boundary = prefix
        .char_indices()
        .filter(|&(i, c)| {
            c == '\n'
                || (matches!(c, '.' | '!' | '?')
                    && prefix[i + 1..].chars().next().map_or(true, char::is_whitespace))
        })
        .map(|(i, c)| i + c.len_utf8())
        .last();
    if let Some(end) = boundary {
        let cut = prefix[..end].trim_end();
        if cut.chars().count() * 2 >= space {
            return cut.to_string();
        }
    }

    let keep = space.saturating_sub(marker.chars().count());
    let keep_end = content
        .char_indices()
        .nth(keep)
        .map_or(content.len(), |(i, _)| i);
    format!("{}{}", content[..keep_end].trim_end(), marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Atom, ContentType, Provenance};
    use crate::walker::Phase;
    use proptest::prelude::*;

    const DAY: i64 = 86_400_000;
    const NOW: i64 = 1_000 * DAY;

    fn candidate(id: &str, content: &str, score: f64, first_seen: i64, last_seen: i64) -> RetrievedAtom {
        RetrievedAtom {
            atom: Atom {
                id: id.into(),
                content: content.into(),
                content_hash: String::new(),
                source_path: "doc.md".into(),
                sequence: 0,
                content_type: ContentType::Prose,
                fingerprint: 0,
                provenance: Provenance::Internal,
                tags: Vec::new(),
                buckets: Vec::new(),
                first_seen,
                last_seen,
                occurrences: 1,
            },
            score,
            phase: Phase::Strict,
            gravity: None,
            anchor_id: None,
            hop: 0,
        }
    }

    #[test]
    fn test_temporal_signal() {
        assert!(has_temporal_signal("what changed recently?"));
        assert!(has_temporal_signal("Latest deploy notes"));
        assert!(!has_temporal_signal("deploy notes"));
    }

    #[test]
    fn test_inflation_radius() {
        assert_eq!(inflation_radius(0, 200, 32768), 32768);
        assert_eq!(inflation_radius(1, 200, 32768), 32768);
        assert_eq!(inflation_radius(4, 200, 32768), 8192);
        assert_eq!(inflation_radius(1000, 200, 32768), 200);
    }

    #[test]
    fn test_chronological_output_order() {
        let cfg = AssemblerConfig::default();
        let cands = vec![
            candidate("late", "Second event.", 1.0, 20 * DAY, NOW),
            candidate("early", "First event.", 0.1, 10 * DAY, NOW),
        ];
        let out = ContextAssembler::new(&cfg)
            .assemble_at("event", &cands, 1000, NOW)
            .unwrap();
        assert_eq!(out.text, "First event.\n\nSecond event.");
        assert_eq!(out.stats.atom_count, 2);
        assert_eq!(out.stats.char_count, 27);
        assert_eq!(out.stats.token_estimate, 7);
    }

    #[test]
    fn test_temporal_query_prefers_recent() {
        let cfg = AssemblerConfig::default();
        let cands = vec![
            candidate("relevant-old", "Old but very relevant.", 1.0, 0, NOW - 29 * DAY),
            candidate("fresh", "Fresh but weaker match.", 0.5, 0, NOW),
        ];
        let asm = ContextAssembler::new(&cfg);
        let plain = asm.assemble_at("match", &cands, 25, NOW).unwrap();
        assert_eq!(plain.atoms[0].atom_id, "relevant-old");
        let temporal = asm.assemble_at("latest match", &cands, 25, NOW).unwrap();
        assert_eq!(temporal.atoms[0].atom_id, "fresh");
        assert!(temporal.stats.temporal);
    }

    #[test]
    fn test_partial_fit_cuts_at_sentence() {
        let cfg = AssemblerConfig::default();
        let content = "The first sentence is here. The second one is much longer and will not fit.";
        let cands = vec![candidate("a", content, 1.0, 0, NOW)];
        let out = ContextAssembler::new(&cfg)
            .assemble_at("q", &cands, 40, NOW)
            .unwrap();
        assert_eq!(out.text, "The first sentence is here.");
        assert_eq!(out.stats.truncated_count, 1);
    }

    #[test]
    fn test_partial_fit_hard_truncates_with_marker() {
        let cfg = AssemblerConfig::default();
        let content = "x".repeat(500);
        let cands = vec![candidate("a", &content, 1.0, 0, NOW)];
        let out = ContextAssembler::new(&cfg)
            .assemble_at("q", &cands, 100, NOW)
            .unwrap();
        assert!(out.text.ends_with("…[truncated]"));
        assert_eq!(out.text.chars().count(), 100);
    }

    #[test]
    fn test_zero_budget_rejected() {
        let cfg = AssemblerConfig::default();
        let err = ContextAssembler::new(&cfg).assemble("q", &[], 0).unwrap_err();
        assert!(matches!(err, AnchorError::Validation(_)));
    }

    #[test]
    fn test_config_validation() {
        assert!(AssemblerConfig::default().validate().is_ok());
        let bad = AssemblerConfig {
            relevance_weight: 0.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = AssemblerConfig {
            min_radius: 10,
            max_radius: 5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_budget_respected(
            contents in proptest::collection::vec("[a-zé .!\n]{0,120}", 0..12),
            budget in 1usize..400,
        ) {
            let cfg = AssemblerConfig::default();
            let cands: Vec<RetrievedAtom> = contents
                .iter()
                .enumerate()
                .map(|(i, c)| candidate(&format!("a{}", i), c, 1.0 / (i + 1) as f64, i as i64, NOW))
                .collect();
            let out = ContextAssembler::new(&cfg).assemble_at("q", &cands, budget, NOW).unwrap();
            let limit = budget as f64 * (1.0 + cfg.safety_margin);
            prop_assert!(out.text.chars().count() as f64 <= limit);
            prop_assert_eq!(out.stats.char_count, out.text.chars().count());
        }
    }
}
