//! # Anchor
//!
//! A local-first knowledge engine. Documents are segmented into molecules,
//! deduplicated into atoms by SimHash fingerprint, tagged, and retrieved
//! with a three-phase tag-walker whose results are packed into a
//! character budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌───────────┐
//! │ Filesystem  │──▶│  anchor-core     │──▶│  SQLite   │
//! │ connector   │   │ segment + dedup  │   │ FTS5+tags │
//! └─────────────┘   └──────────────────┘   └─────┬─────┘
//!                                                │
//!                   ┌──────────────────┐         │
//!                   │ tag-walker +     │◀────────┘
//!                   │ context assembler│
//!                   └────────┬─────────┘
//!                            ▼
//!                     ┌────────────┐
//!                     │    CLI     │
//!                     │  (anchor)  │
//!                     └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! anchor init
//! anchor ingest --bucket notes
//! anchor search "kubelet restarts" --inflate
//! anchor context "what changed last week" --budget 4000
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` trait |
//! | [`connector_fs`] | Filesystem connector |
//! | [`extract`] | HTML text and metadata extraction |
//! | [`ingest`] | Ingestion runner |
//! | [`progress`] | Ingestion progress reporting |
//! | [`search`] | Search and context commands |
//! | [`get`] | Atom lookup |
//! | [`quarantine`] | Soft removal |
//! | [`stats`] | Database statistics |
//! | [`logging`] | Tracing subscriber setup |

pub mod config;
pub mod connector_fs;
pub mod db;
pub mod extract;
pub mod get;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod progress;
pub mod quarantine;
pub mod search;
pub mod sqlite_store;
pub mod stats;
