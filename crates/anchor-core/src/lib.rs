//! # Anchor Core
//!
//! Shared engine logic for Anchor: the atom data model, content
//! segmentation, similarity fingerprints, the deduplication gate, the
//! ingestion transaction manager, the three-phase tag-walker search, and
//! budget-constrained context assembly.
//!
//! This crate contains no tokio runtime, sqlx, or filesystem I/O. All
//! persistence goes through the [`store::Store`] trait; an in-memory
//! implementation ships in [`store::memory`] for tests and embedding.
//!
//! ## Data flow
//!
//! ```text
//! content ─▶ segment ─▶ fingerprint ─▶ dedup gate ─▶ ingest (per chunk tx) ─▶ Store
//! query   ─▶ walker (strict → fuzzy → walk) ─▶ assemble ─▶ packed text + stats
//! ```

pub mod assemble;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod models;
pub mod segment;
pub mod store;
pub mod tagger;
pub mod walker;

pub use engine::{Engine, EngineConfig};
pub use error::AnchorError;
