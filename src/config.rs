use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

pub const MAX_BATCH_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Process-level settings. Workspace-level settings live in the `settings` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    /// Upper bound on rapor models built in parallel by `reports.raporBatch`.
    pub batch_concurrency: usize,
    /// Workspace opened at startup, before any `workspace.select`.
    pub workspace: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            batch_concurrency: 4,
            workspace: None,
        }
    }
}

impl DaemonConfig {
    /// `rapord.toml` in the working directory (optional), then `RAPORD_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("rapord").required(false))
            .add_source(Environment::with_prefix("RAPORD").try_parsing(true))
            .build()?;
        let mut cfg: DaemonConfig = config.try_deserialize()?;
        cfg.batch_concurrency = clamp_concurrency(cfg.batch_concurrency);
        Ok(cfg)
    }
}

pub fn clamp_concurrency(n: usize) -> usize {
    n.clamp(1, MAX_BATCH_CONCURRENCY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_is_clamped() {
        assert_eq!(clamp_concurrency(0), 1);
        assert_eq!(clamp_concurrency(4), 4);
        assert_eq!(clamp_concurrency(100), MAX_BATCH_CONCURRENCY);
    }

    #[test]
    fn defaults_are_used_when_no_sources_exist() {
        let cfg: DaemonConfig = Config::builder()
            .build()
            .and_then(|c| c.try_deserialize())
            .expect("deserialize defaults");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.batch_concurrency, 4);
        assert!(cfg.workspace.is_none());
    }
}
