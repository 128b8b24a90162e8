//! Job configuration.
//!
//! `TransferConfig` is an explicit value handed to the pipeline at
//! construction. Every field has a default so partial TOML files work.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Match and report without invoking the write capability
    pub dry_run: bool,
    pub batch_size: usize,
    /// Attempts after the first for transient failures
    pub max_retries: u32,
    pub fuzzy_threshold: f64,
    pub duration_tolerance_ms: u64,
    /// Widest duration difference the fuzzy stage still considers
    pub fuzzy_duration_tolerance_ms: u64,
    pub ambiguity_margin: f64,
    pub top_k: usize,
    pub match_workers: usize,
    /// Consecutive rate-limit responses tolerated per batch
    pub max_rate_limit_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub error_rate_threshold: f64,
    /// Trailing batches considered by the error-rate check
    pub error_window_batches: usize,
    /// Entries the window must hold before the error rate can abort a job
    pub error_window_min_entries: usize,
    pub checkpoint_max_failures: u32,
    /// 0 disables the per-operation deadline
    pub operation_deadline_ms: u64,
    pub stale_lock_secs: u64,
    pub user_id: String,
    pub jitter_seed: Option<u64>,
    /// Safety switch: forces dry-run
    pub rollback: bool,
    /// Target collection for the best candidate of ambiguous tracks
    pub manual_review_collection: Option<String>,
    /// Target collection name for the source's liked tracks
    pub liked_collection_name: Option<String>,
    pub report_dir: Option<PathBuf>,
    pub show_progress: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: 100,
            max_retries: 3,
            fuzzy_threshold: 0.85,
            duration_tolerance_ms: 2000,
            fuzzy_duration_tolerance_ms: 10_000,
            ambiguity_margin: 0.02,
            top_k: 3,
            match_workers: 4,
            max_rate_limit_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            error_rate_threshold: 0.05,
            error_window_batches: 10,
            error_window_min_entries: 50,
            checkpoint_max_failures: 3,
            operation_deadline_ms: 30_000,
            stale_lock_secs: 3600,
            user_id: "default".to_string(),
            jitter_seed: None,
            rollback: false,
            manual_review_collection: None,
            liked_collection_name: None,
            report_dir: None,
            show_progress: true,
        }
    }
}

impl TransferConfig {
    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Dry-run after applying the rollback switch.
    pub fn effective_dry_run(&self) -> bool {
        self.dry_run || self.rollback
    }

    /// Applies the rollback switch and validates the result.
    pub fn resolved(mut self) -> Result<Self, ConfigError> {
        if self.rollback && !self.dry_run {
            warn!("rollback mode enabled, forcing dry-run: no writes will be made");
            self.dry_run = true;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn operation_deadline(&self) -> Option<Duration> {
        (self.operation_deadline_ms > 0).then(|| Duration::from_millis(self.operation_deadline_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".to_string());
        }
        if self.top_k == 0 {
            return invalid("top_k must be at least 1".to_string());
        }
        if self.match_workers == 0 {
            return invalid("match_workers must be at least 1".to_string());
        }
        for (name, value) in [
            ("fuzzy_threshold", self.fuzzy_threshold),
            ("ambiguity_margin", self.ambiguity_margin),
            ("error_rate_threshold", self.error_rate_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.fuzzy_duration_tolerance_ms < self.duration_tolerance_ms {
            return invalid(format!(
                "fuzzy_duration_tolerance_ms ({}) must not be below duration_tolerance_ms ({})",
                self.fuzzy_duration_tolerance_ms, self.duration_tolerance_ms
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return invalid("backoff_max_ms must not be below backoff_base_ms".to_string());
        }
        if self.error_window_batches == 0 {
            return invalid("error_window_batches must be at least 1".to_string());
        }
        if self.checkpoint_max_failures == 0 {
            return invalid("checkpoint_max_failures must be at least 1".to_string());
        }
        if self.user_id.trim().is_empty() {
            return invalid("user_id must not be empty".to_string());
        }
        if matches!(&self.manual_review_collection, Some(name) if name.trim().is_empty()) {
            return invalid("manual_review_collection must not be blank".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.fuzzy_threshold, 0.85);
        assert_eq!(config.duration_tolerance_ms, 2000);
        assert_eq!(config.operation_deadline(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_partial_toml() {
        let config = TransferConfig::from_toml_str(
            r#"
            dry_run = true
            batch_size = 50
            fuzzy_threshold = 0.9
            manual_review_collection = "Needs review"
            "#,
            "inline",
        )
        .unwrap();
        assert!(config.dry_run);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.fuzzy_threshold, 0.9);
        assert_eq!(config.manual_review_collection.as_deref(), Some("Needs review"));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = TransferConfig::from_toml_str("batchsize = 5", "inline").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_from_missing_file() {
        let err =
            TransferConfig::from_toml_file(Path::new("/nonexistent/musync.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let bad = [
            TransferConfig { batch_size: 0, ..Default::default() },
            TransferConfig { fuzzy_threshold: 1.5, ..Default::default() },
            TransferConfig { match_workers: 0, ..Default::default() },
            TransferConfig { fuzzy_duration_tolerance_ms: 1000, ..Default::default() },
            TransferConfig { user_id: " ".to_string(), ..Default::default() },
            TransferConfig { manual_review_collection: Some(String::new()), ..Default::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{:?}", config);
        }
    }

    #[test]
    fn test_rollback_forces_dry_run() {
        let config = TransferConfig { rollback: true, ..Default::default() };
        assert!(config.effective_dry_run());
        let resolved = config.resolved().unwrap();
        assert!(resolved.dry_run);
    }

    #[test]
    fn test_zero_deadline_disables() {
        let config = TransferConfig { operation_deadline_ms: 0, ..Default::default() };
        assert_eq!(config.operation_deadline(), None);
    }
}
