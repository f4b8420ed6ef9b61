//! The engine context object.
//!
//! [`Engine`] owns the shared store handle and the validated configuration,
//! and is passed by reference to every entry point. Construct it once at
//! startup; [`Engine::shutdown`] releases the store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::assemble::{inflation_radius, AssembledContext, AssemblerConfig, ContextAssembler};
use crate::dedup::DedupConfig;
use crate::error::AnchorError;
use crate::ingest::{CancelFlag, IngestConfig, IngestReport, IngestRequest, Ingestor};
use crate::models::{TagAssoc, QUARANTINE_TAG};
use crate::segment::{ceil_char_boundary, floor_char_boundary, SegmenterConfig};
use crate::store::Store;
use crate::tagger::{normalize_buckets, normalize_tag};
use crate::walker::{RetrievedAtom, SearchOutcome, SearchRequest, TagWalker, WalkerConfig};

/// All engine tuning, validated together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub segmentation: SegmenterConfig,
    pub dedup: DedupConfig,
    pub ingest: IngestConfig,
    pub retrieval: WalkerConfig,
    pub context: AssemblerConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), AnchorError> {
        self.segmentation.validate()?;
        self.dedup.validate()?;
        self.ingest.validate()?;
        self.retrieval.validate()?;
        self.context.validate()?;
        if self.ingest.chunk_threshold < self.segmentation.max_chunk_size {
            return Err(AnchorError::Config(
                "ingest.chunk_threshold must be >= segmentation.max_chunk_size".into(),
            ));
        }
        Ok(())
    }
}

/// A hit expanded into its surrounding source text.
#[derive(Debug, Clone, Serialize)]
pub struct InflatedContext {
    pub atom_id: String,
    pub compound_id: String,
    pub source_path: String,
    /// Byte window into the compound content.
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// The window hit the start of the source.
    pub clipped_start: bool,
    /// The window hit the end of the source.
    pub clipped_end: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QuarantineReport {
    pub requested: usize,
    pub quarantined: usize,
    pub tags_added: usize,
    pub missing: Vec<String>,
}

pub struct Engine<S: Store> {
    store: Arc<S>,
    config: EngineConfig,
}

impl<S: Store> Engine<S> {
    /// Validate `config` and bind it to `store`. Invalid configuration is
    /// the only fatal error.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Result<Self, AnchorError> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn ingest(
        &self,
        request: &IngestRequest,
        cancel: &CancelFlag,
    ) -> Result<IngestReport, AnchorError> {
        Ingestor::new(
            self.store.as_ref(),
            &self.config.segmentation,
            &self.config.dedup,
            &self.config.ingest,
        )
        .ingest(request, cancel)
        .await
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome, AnchorError> {
        TagWalker::new(self.store.as_ref(), &self.config.retrieval)
            .search(request)
            .await
    }

    pub fn assemble_context(
        &self,
        query: &str,
        candidates: &[RetrievedAtom],
        budget: usize,
    ) -> Result<AssembledContext, AnchorError> {
        ContextAssembler::new(&self.config.context).assemble(query, candidates, budget)
    }

    /// Expand each hit into a window of its source document. The radius
    /// shrinks as the number of hits grows.
    pub async fn inflate(&self, hits: &[RetrievedAtom]) -> Result<Vec<InflatedContext>, AnchorError> {
        let radius = inflation_radius(
            hits.len(),
            self.config.context.min_radius,
            self.config.context.max_radius,
        );
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let located = self
                .store
                .locate_atom(&hit.atom.id)
                .await
                .map_err(|e| AnchorError::from_store(&e))?;
            let Some(molecule) = located else {
                continue;
            };
            let compound = self
                .store
                .get_compound(&molecule.compound_id)
                .await
                .map_err(|e| AnchorError::from_store(&e))?;
            let Some(compound) = compound else {
                continue;
            };

            let content = &compound.content;
            let start = floor_char_boundary(content, molecule.start_byte.saturating_sub(radius));
            let end = ceil_char_boundary(content, molecule.end_byte.saturating_add(radius));
            out.push(InflatedContext {
                atom_id: hit.atom.id.clone(),
                compound_id: compound.id.clone(),
                source_path: compound.path.clone(),
                start,
                end,
                text: content[start..end].to_string(),
                clipped_start: molecule.start_byte < radius,
                clipped_end: molecule.end_byte.saturating_add(radius) > content.len(),
            });
        }
        Ok(out)
    }

    /// Soft-remove atoms by tagging them `quarantined` (and
    /// `quarantined:<reason>`) in each of their buckets. Nothing is erased.
    pub async fn quarantine(
        &self,
        atom_ids: &[String],
        reason: Option<&str>,
    ) -> Result<QuarantineReport, AnchorError> {
        if atom_ids.is_empty() {
            return Err(AnchorError::Validation("no atom ids given".into()));
        }
        let atoms = self
            .store
            .get_atoms(atom_ids)
            .await
            .map_err(|e| AnchorError::from_store(&e))?;

        let mut labels = vec![QUARANTINE_TAG.to_string()];
        if let Some(r) = reason.and_then(normalize_tag) {
            labels.push(format!("{}:{}", QUARANTINE_TAG, r));
        }

        let mut triples = Vec::new();
        for atom in &atoms {
            for bucket in normalize_buckets(&atom.buckets) {
                for label in &labels {
                    triples.push(TagAssoc {
                        atom_id: atom.id.clone(),
                        tag: label.clone(),
                        bucket: bucket.clone(),
                    });
                }
            }
        }
        let tags_added = self
            .store
            .add_tags(&triples)
            .await
            .map_err(|e| AnchorError::from_store(&e))?;

        let missing = atom_ids
            .iter()
            .filter(|id| !atoms.iter().any(|a| &a.id == *id))
            .cloned()
            .collect();
        tracing::info!(count = atoms.len(), reason = ?reason, "atoms quarantined");
        Ok(QuarantineReport {
            requested: atom_ids.len(),
            quarantined: atoms.len(),
            tags_added,
            missing,
        })
    }

    pub async fn shutdown(&self) {
        self.store.close().await;
    }
}
