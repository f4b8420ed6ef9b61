//! Ingestion transaction manager.
//!
//! A document is processed as a sequence of independent **chunks**:
//!
//! 1. Content above `chunk_threshold` bytes is cut into chunks at
//!    paragraph (or line) boundaries near the threshold. Byte offsets stay
//!    global, so molecules always index the whole document.
//! 2. Each chunk is segmented, fingerprinted, and classified by the
//!    [`DedupGate`]. Identical content within the chunk collapses to one
//!    atom before the store is touched.
//! 3. All rows of the chunk go to the store in one [`ChunkWrite`]: one
//!    transaction, inserts grouped into sub-batches of `sub_batch_size`.
//! 4. A failed chunk is rolled back by the store and recorded in
//!    [`IngestReport::errors`]; the next chunk still runs.
//!
//! A [`CancelFlag`] is checked between chunks, never inside one.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dedup::{DedupConfig, DedupGate};
use crate::error::AnchorError;
use crate::fingerprint::fingerprint;
use crate::models::{
    atom_id, compound_id, content_hash, molecule_id, now_ms, Atom, BucketMembership,
    Classification, Compound, ContentType, Molecule, Provenance, VariantLink,
};
use crate::segment::{segment_with, Segment, SegmenterConfig};
use crate::store::{ChunkWrite, FingerprintRecord, Store, Touch};
use crate::tagger::{extract_tags, normalize_buckets, TagTriples};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Documents larger than this many bytes are committed in chunks.
    pub chunk_threshold: usize,
    /// Rows per insert statement inside a chunk transaction.
    pub sub_batch_size: usize,
    /// Keyword tags extracted per atom.
    pub max_auto_tags: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 50 * 1024,
            sub_batch_size: 50,
            max_auto_tags: 6,
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), AnchorError> {
        if self.chunk_threshold == 0 {
            return Err(AnchorError::Config("ingest.chunk_threshold must be > 0".into()));
        }
        if self.sub_batch_size == 0 {
            return Err(AnchorError::Config("ingest.sub_batch_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Cooperative cancellation shared between a run and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One document to ingest.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub source_path: String,
    pub content: Vec<u8>,
    pub provenance: Provenance,
    pub buckets: Vec<String>,
    /// Tags applied to every atom of the document.
    pub tags: Vec<String>,
    /// Defaults to [`ContentType::from_path`].
    pub content_type: Option<ContentType>,
    /// Observation time in Unix ms. Defaults to now.
    pub observed_at: Option<i64>,
}

impl IngestRequest {
    pub fn new(source_path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            source_path: source_path.into(),
            content: content.into(),
            provenance: Provenance::Internal,
            buckets: Vec::new(),
            tags: Vec::new(),
            content_type: None,
            observed_at: None,
        }
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn buckets(mut self, buckets: Vec<String>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn observed_at(mut self, ts: i64) -> Self {
        self.observed_at = Some(ts);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    StoreUnavailable,
    Store,
}

/// A chunk that was rolled back.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub byte_range: (usize, usize),
    pub kind: FailureKind,
    pub message: String,
}

/// Result of ingesting one document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub compound_id: String,
    pub atoms_written: usize,
    pub variants_linked: usize,
    pub exact_duplicates: usize,
    /// Chunks classified [`Classification::Novel`] in committed chunks.
    pub novel: usize,
    pub molecules_written: usize,
    pub tags_written: usize,
    pub oversized_units: usize,
    pub chunks_total: usize,
    pub chunks_committed: usize,
    pub errors: Vec<ChunkFailure>,
    pub cancelled: bool,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }
}

/// A `[start, end)` byte range of the document processed as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentChunk {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl ContentChunk {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Cut `content` into chunks of at most `threshold` bytes where possible,
/// preferring a paragraph break, then a line break, in the upper half of
/// each window.
pub fn split_into_chunks(content: &str, threshold: usize) -> Vec<ContentChunk> {
    let len = content.len();
    if len == 0 {
        return Vec::new();
    }
    let threshold = threshold.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < len {
        let end = if len - start <= threshold {
            len
        } else {
            let mut limit = start + threshold;
            while !content.is_char_boundary(limit) {
                limit -= 1;
            }
            let floor = start + threshold / 2;
            let window = &content[start..limit];
            let cut = window
                .rfind("\n\n")
                .map(|i| start + i + 2)
                .filter(|&c| c > floor)
                .or_else(|| {
                    window
                        .rfind('\n')
                        .map(|i| start + i + 1)
                        .filter(|&c| c > floor)
                });
            match cut {
                Some(c) => c,
                None if limit > start => limit,
                None => start + content[start..].chars().next().map_or(1, char::len_utf8),
            }
        };
        chunks.push(ContentChunk {
            index: chunks.len(),
            start,
            end,
        });
        start = end;
    }
    chunks
}

/// Drives segmentation, dedup, and per-chunk commits for one store.
pub struct Ingestor<'a, S: Store + ?Sized> {
    store: &'a S,
    segmenter: &'a SegmenterConfig,
    dedup: &'a DedupConfig,
    config: &'a IngestConfig,
}

/// Document-level values every chunk needs.
struct DocumentContext<'r> {
    request: &'r IngestRequest,
    content: &'r str,
    content_type: ContentType,
    compound: Compound,
    buckets: Vec<String>,
    observed_at: i64,
}

/// Rows built for one chunk plus the counters that only count on commit.
struct PreparedChunk {
    write: ChunkWrite,
    novel: usize,
    exact: usize,
    oversized: usize,
}

impl<'a, S: Store + ?Sized> Ingestor<'a, S> {
    pub fn new(
        store: &'a S,
        segmenter: &'a SegmenterConfig,
        dedup: &'a DedupConfig,
        config: &'a IngestConfig,
    ) -> Self {
        Self {
            store,
            segmenter,
            dedup,
            config,
        }
    }

    /// Ingest one document.
    ///
    /// Only malformed input is returned as `Err`; store failures are
    /// recorded per chunk in the report.
    pub async fn ingest(
        &self,
        request: &IngestRequest,
        cancel: &CancelFlag,
    ) -> Result<IngestReport, AnchorError> {
        if request.source_path.trim().is_empty() {
            return Err(AnchorError::Validation("source_path must not be empty".into()));
        }
        let content = std::str::from_utf8(&request.content).map_err(|e| {
            AnchorError::Validation(format!(
                "{}: content is not valid UTF-8 ({})",
                request.source_path, e
            ))
        })?;

        let observed_at = request.observed_at.unwrap_or_else(now_ms);
        let doc = DocumentContext {
            request,
            content,
            content_type: request
                .content_type
                .unwrap_or_else(|| ContentType::from_path(&request.source_path)),
            compound: Compound {
                id: compound_id(&request.source_path, content),
                path: request.source_path.clone(),
                timestamp: observed_at,
                provenance: request.provenance,
                signature: fingerprint(content.as_bytes()),
                content: content.to_string(),
            },
            buckets: normalize_buckets(&request.buckets),
            observed_at,
        };

        let chunks = split_into_chunks(content, self.config.chunk_threshold);
        let mut report = IngestReport {
            compound_id: doc.compound.id.clone(),
            chunks_total: chunks.len(),
            ..Default::default()
        };
        let mut next_sequence: i64 = 0;

        for chunk in &chunks {
            if cancel.is_cancelled() {
                tracing::info!(path = %request.source_path, chunk = chunk.index, "ingestion cancelled");
                report.cancelled = true;
                break;
            }

            let segments = segment_with(&content[chunk.range()], doc.content_type, self.segmenter);
            let first_sequence = next_sequence;
            next_sequence += segments.len() as i64;

            let outcome = match self
                .prepare_chunk(&doc, chunk, &segments, first_sequence)
                .await
            {
                Ok(prepared) => {
                    let committed = self.store.commit_chunk(&prepared.write).await;
                    committed.map(|c| (prepared, c))
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok((prepared, committed)) => {
                    tracing::debug!(
                        path = %request.source_path,
                        chunk = chunk.index,
                        sub_batches = prepared.write.sub_batches(),
                        atoms = committed.atoms_inserted,
                        "chunk committed"
                    );
                    report.chunks_committed += 1;
                    report.atoms_written += committed.atoms_inserted;
                    report.molecules_written += committed.molecules_inserted;
                    report.tags_written += committed.tags_inserted;
                    report.variants_linked += committed.variants_inserted;
                    report.novel += prepared.novel;
                    report.exact_duplicates += prepared.exact;
                    report.oversized_units += prepared.oversized;
                }
                Err(e) => {
                    let classified = AnchorError::from_store(&e);
                    tracing::warn!(
                        path = %request.source_path,
                        chunk = chunk.index,
                        error = %classified,
                        "chunk rolled back"
                    );
                    report.errors.push(ChunkFailure {
                        chunk_index: chunk.index,
                        byte_range: (chunk.start, chunk.end),
                        kind: if classified.is_unavailable() {
                            FailureKind::StoreUnavailable
                        } else {
                            FailureKind::Store
                        },
                        message: classified.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            path = %request.source_path,
            atoms = report.atoms_written,
            variants = report.variants_linked,
            exact = report.exact_duplicates,
            failed_chunks = report.errors.len(),
            "document ingested"
        );
        Ok(report)
    }

    async fn prepare_chunk(
        &self,
        doc: &DocumentContext<'_>,
        chunk: &ContentChunk,
        segments: &[Segment],
        first_sequence: i64,
    ) -> anyhow::Result<PreparedChunk> {
        let gate = DedupGate::prepare(self.store, self.dedup).await?;
        let mut prepared = PreparedChunk {
            write: ChunkWrite {
                compound: doc.compound.clone(),
                replace_previous: chunk.index == 0,
                molecules: Vec::with_capacity(segments.len()),
                atoms: Vec::new(),
                touches: Vec::new(),
                tags: Vec::new(),
                memberships: Vec::new(),
                variants: Vec::new(),
                sub_batch_size: self.config.sub_batch_size,
            },
            novel: 0,
            exact: 0,
            oversized: 0,
        };
        let mut pending: Vec<FingerprintRecord> = Vec::new();

        for (i, seg) in segments.iter().enumerate() {
            let start = chunk.start + seg.start;
            let end = chunk.start + seg.end;
            let text = &doc.content[start..end];
            let fp = fingerprint(text.as_bytes());
            let sequence = first_sequence + i as i64;
            if seg.oversized {
                prepared.oversized += 1;
            }

            let mut molecule = Molecule {
                id: molecule_id(&doc.compound.id, sequence),
                compound_id: doc.compound.id.clone(),
                sequence,
                start_byte: start,
                end_byte: end,
                content_type: seg.content_type,
                numeric_value: seg.numeric.as_ref().map(|n| n.value),
                numeric_unit: seg.numeric.as_ref().and_then(|n| n.unit.clone()),
                fingerprint: fp,
                timestamp: doc.observed_at,
                atom_id: None,
                oversized: seg.oversized,
                continued: seg.continued,
            };

            if text.trim().is_empty() {
                prepared.write.molecules.push(molecule);
                continue;
            }

            let classification = gate.classify(fp, text, &doc.buckets, &pending).await?;
            let id = match classification {
                Classification::Exact { existing_id } => {
                    prepared.exact += 1;
                    prepared.write.touches.push(Touch {
                        atom_id: existing_id.clone(),
                        seen_at: doc.observed_at,
                    });
                    self.attach(doc, &mut prepared.write, &existing_id, text);
                    existing_id
                }
                Classification::Variant {
                    canonical_id,
                    distance,
                } => {
                    let id = self.push_atom(doc, &mut prepared.write, &mut pending, text, fp, sequence);
                    prepared.write.variants.push(VariantLink {
                        atom_id: id.clone(),
                        canonical_id,
                        distance,
                    });
                    id
                }
                Classification::Novel => {
                    prepared.novel += 1;
                    self.push_atom(doc, &mut prepared.write, &mut pending, text, fp, sequence)
                }
            };
            molecule.atom_id = Some(id);
            prepared.write.molecules.push(molecule);
        }

        Ok(prepared)
    }

    fn push_atom(
        &self,
        doc: &DocumentContext<'_>,
        write: &mut ChunkWrite,
        pending: &mut Vec<FingerprintRecord>,
        text: &str,
        fp: u64,
        sequence: i64,
    ) -> String {
        let id = atom_id(text);
        let hash = content_hash(text);
        let tags = self.attach(doc, write, &id, text);
        write.atoms.push(Atom {
            id: id.clone(),
            content: text.to_string(),
            content_hash: hash.clone(),
            source_path: doc.request.source_path.clone(),
            sequence,
            content_type: doc.content_type,
            fingerprint: fp,
            provenance: doc.request.provenance,
            tags,
            buckets: doc.buckets.clone(),
            first_seen: doc.observed_at,
            last_seen: doc.observed_at,
            occurrences: 1,
        });
        pending.push(FingerprintRecord {
            atom_id: id.clone(),
            fingerprint: fp,
            content_hash: hash,
            last_seen: doc.observed_at,
        });
        id
    }

    /// Queue this document's tags and bucket memberships for `id`, which may
    /// be a new atom or an exact duplicate already stored under other buckets.
    fn attach(
        &self,
        doc: &DocumentContext<'_>,
        write: &mut ChunkWrite,
        id: &str,
        text: &str,
    ) -> Vec<String> {
        let tags = extract_tags(text, &doc.request.tags, self.config.max_auto_tags);
        write.tags.extend(TagTriples::new(id, &tags, &doc.buckets));
        write.memberships.extend(doc.buckets.iter().map(|bucket| BucketMembership {
            atom_id: id.to_string(),
            bucket: bucket.clone(),
        }));
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn configs() -> (SegmenterConfig, DedupConfig, IngestConfig) {
        (
            SegmenterConfig::default(),
            DedupConfig::default(),
            IngestConfig::default(),
        )
    }

    #[test]
    fn test_split_small_is_single_chunk() {
        let chunks = split_into_chunks("short text", 100);
        assert_eq!(chunks, vec![ContentChunk { index: 0, start: 0, end: 10 }]);
        assert!(split_into_chunks("", 100).is_empty());
    }

    #[test]
    fn test_split_prefers_paragraph_break() {
        let para = "word ".repeat(30);
        let content = format!("{}\n\n{}\n\n{}", para, para, para);
        let chunks = split_into_chunks(&content, 200);
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].end, para.len() + 2);
        let mut cursor = 0;
        for c in &chunks {
            assert_eq!(c.start, cursor);
            cursor = c.end;
        }
        assert_eq!(cursor, content.len());
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let content = "é".repeat(500);
        let chunks = split_into_chunks(&content, 101);
        for c in &chunks {
            assert!(content.is_char_boundary(c.start));
            assert!(content.is_char_boundary(c.end));
        }
        assert_eq!(chunks.last().map(|c| c.end), Some(content.len()));
    }

    #[tokio::test]
    async fn test_repeated_content_in_chunk_collapses() {
        let store = InMemoryStore::new();
        let (seg, dedup, cfg) = configs();
        let seg = SegmenterConfig {
            max_chunk_size: 20,
            ..seg
        };
        let ingestor = Ingestor::new(&store, &seg, &dedup, &cfg);
        let req = IngestRequest::new("dup.md", "Same line here.\n\nSame line here.\n\n");
        let report = ingestor.ingest(&req, &CancelFlag::new()).await.unwrap();
        assert_eq!(report.atoms_written, 1);
        assert_eq!(report.exact_duplicates, 1);
        assert_eq!(report.molecules_written, 2);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_whitespace_segment_has_no_atom() {
        let store = InMemoryStore::new();
        let (_, dedup, cfg) = configs();
        let seg = SegmenterConfig {
            max_chunk_size: 8,
            ..Default::default()
        };
        let ingestor = Ingestor::new(&store, &seg, &dedup, &cfg);
        let req = IngestRequest::new("ws.md", format!("abc.\n\n{}", " ".repeat(30)));
        let report = ingestor.ingest(&req, &CancelFlag::new()).await.unwrap();
        let molecules = store.molecules_for(&report.compound_id).await.unwrap();
        assert!(molecules.iter().any(|m| m.atom_id.is_none()));
        assert_eq!(report.atoms_written, 1);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected() {
        let store = InMemoryStore::new();
        let (seg, dedup, cfg) = configs();
        let ingestor = Ingestor::new(&store, &seg, &dedup, &cfg);
        let err = ingestor
            .ingest(&IngestRequest::new("", "x"), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AnchorError::Validation(_)));
        let err = ingestor
            .ingest(&IngestRequest::new("bin.dat", vec![0xff, 0xfe]), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AnchorError::Validation(_)));
        assert_eq!(store.atom_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_first_chunk() {
        let store = InMemoryStore::new();
        let (seg, dedup, cfg) = configs();
        let ingestor = Ingestor::new(&store, &seg, &dedup, &cfg);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = ingestor
            .ingest(&IngestRequest::new("a.md", "Some text."), &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.chunks_committed, 0);
        assert!(!report.is_complete());
    }
}
