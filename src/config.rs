//! TOML configuration.
//!
//! Every section except `[db]` is optional; omitted fields take the engine
//! defaults. [`load_config`] validates the whole file and fails fast, so an
//! invalid threshold never reaches ingestion or retrieval.
//!
//! ```toml
//! [db]
//! path = "./data/anchor.sqlite"
//!
//! [segmentation]
//! max_chunk_size = 1024
//!
//! [retrieval]
//! temperature = 0.0
//!
//! [connectors.filesystem]
//! root = "./notes"
//! include_globs = ["**/*.md"]
//! ```

use anchor_core::assemble::AssemblerConfig;
use anchor_core::dedup::DedupConfig;
use anchor_core::ingest::IngestConfig;
use anchor_core::models::Provenance;
use anchor_core::segment::SegmenterConfig;
use anchor_core::walker::WalkerConfig;
use anchor_core::EngineConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub segmentation: SegmenterConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: WalkerConfig,
    #[serde(default)]
    pub context: AssemblerConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            segmentation: self.segmentation.clone(),
            dedup: self.dedup.clone(),
            ingest: self.ingest.clone(),
            retrieval: self.retrieval.clone(),
            context: self.context.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    pub filesystem: Option<FilesystemConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemConnectorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Buckets assigned to every file from this connector.
    #[serde(default)]
    pub buckets: Vec<String>,
    /// Tags applied to every atom from this connector.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_provenance")]
    pub provenance: Provenance,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.html".to_string(),
        "**/*.htm".to_string(),
    ]
}

fn default_provenance() -> Provenance {
    Provenance::Internal
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config
        .engine_config()
        .validate()
        .map_err(anyhow::Error::new)?;

    if let Some(fs) = &config.connectors.filesystem {
        if fs.include_globs.is_empty() {
            anyhow::bail!("connectors.filesystem.include_globs must not be empty");
        }
        if fs.provenance == Provenance::Quarantined {
            anyhow::bail!("connectors.filesystem.provenance cannot be 'quarantined'");
        }
    }

    match config.logging.level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => {}
        other => anyhow::bail!(
            "Unknown logging.level: '{}'. Must be trace, debug, info, warn, error, or off.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(body: &str) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("anchor.toml");
        fs::write(&path, body).unwrap();
        (tmp, path)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let (_tmp, path) = write_config("[db]\npath = \"./data/anchor.sqlite\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.segmentation.max_chunk_size, 1024);
        assert_eq!(config.dedup.variant_threshold, 3);
        assert_eq!(config.ingest.chunk_threshold, 50 * 1024);
        assert_eq!(config.ingest.sub_batch_size, 50);
        assert!((config.retrieval.damping - 0.85).abs() < 1e-12);
        assert!((config.context.relevance_weight - 0.7).abs() < 1e-12);
        assert_eq!(config.logging.level, "info");
        assert!(config.connectors.filesystem.is_none());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let (_tmp, path) = write_config(
            "[db]\npath = \"x.sqlite\"\n\n[retrieval]\ntemperature = 0.5\nseed = 7\n",
        );
        let config = load_config(&path).unwrap();
        assert!((config.retrieval.temperature - 0.5).abs() < 1e-12);
        assert_eq!(config.retrieval.seed, Some(7));
        assert_eq!(config.retrieval.walk_radius, 2);
    }

    #[test]
    fn test_invalid_thresholds_fail_fast() {
        for body in [
            "[db]\npath = \"x\"\n[segmentation]\nmax_chunk_size = 0\n",
            "[db]\npath = \"x\"\n[dedup]\nexact_threshold = 5\n",
            "[db]\npath = \"x\"\n[ingest]\nchunk_threshold = 10\n",
            "[db]\npath = \"x\"\n[context]\nrelevance_weight = 0.9\n",
            "[db]\npath = \"x\"\n[retrieval]\nstrict_share = 1.5\n",
            "[db]\npath = \"x\"\n[logging]\nlevel = \"loud\"\n",
        ] {
            let (_tmp, path) = write_config(body);
            assert!(load_config(&path).is_err(), "accepted: {}", body);
        }
    }

    #[test]
    fn test_filesystem_connector_defaults() {
        let (_tmp, path) = write_config(
            "[db]\npath = \"x\"\n[connectors.filesystem]\nroot = \"./notes\"\nbuckets = [\"work\"]\n",
        );
        let config = load_config(&path).unwrap();
        let fs = config.connectors.filesystem.unwrap();
        assert!(fs.include_globs.contains(&"**/*.md".to_string()));
        assert_eq!(fs.buckets, vec!["work"]);
        assert_eq!(fs.provenance, Provenance::Internal);
        assert!(!fs.follow_symlinks);
    }
}
