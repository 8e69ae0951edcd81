//! Run settings and persisted parameters.

use super::PartialRunParameters;
use crate::backend::FailureMode;
use crate::bids::DiscoveryFilters;
use crate::errors::QsmflowError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of persisted settings inside the output directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Everything a planning and execution run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// BIDS root.
    #[serde(default = "default_bids_dir")]
    pub bids_dir: PathBuf,
    /// Derivatives output root.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Scratch directory; `<output_dir>/workflow` when unset.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Discovery filters.
    #[serde(default)]
    pub filters: DiscoveryFilters,
    /// User parameter overrides.
    #[serde(default)]
    pub parameters: PartialRunParameters,
    /// Stages run concurrently by the local back-end.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Failure handling of the local back-end.
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Emit JSON log lines.
    #[serde(default)]
    pub json_logs: bool,
    /// Drop per-stage span events; run summaries are still logged.
    #[serde(default)]
    pub quiet: bool,
    /// Read and write `<output_dir>/settings.json`.
    #[serde(default = "default_true")]
    pub persist_settings: bool,
}

fn default_bids_dir() -> PathBuf {
    PathBuf::from("bids")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("qsmflow-output")
}

fn default_max_parallel() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bids_dir: default_bids_dir(),
            output_dir: default_output_dir(),
            work_dir: None,
            filters: DiscoveryFilters::default(),
            parameters: PartialRunParameters::default(),
            max_parallel: default_max_parallel(),
            failure_mode: FailureMode::default(),
            json_logs: false,
            quiet: false,
            persist_settings: true,
        }
    }
}

impl Settings {
    /// Creates settings for a BIDS root and an output directory.
    #[must_use]
    pub fn new(bids_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            bids_dir: bids_dir.into(),
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// Loads settings from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, QsmflowError> {
        let text = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)
            .map_err(|e| QsmflowError::config("settings", format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks values the type system cannot.
    pub fn validate(&self) -> Result<(), QsmflowError> {
        if self.max_parallel == 0 {
            return Err(QsmflowError::config("max_parallel", "must be at least 1"));
        }
        self.parameters.validate()?;
        Ok(())
    }

    /// Sets the discovery filters.
    #[must_use]
    pub fn with_filters(mut self, filters: DiscoveryFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Sets the parameter overrides.
    #[must_use]
    pub fn with_parameters(mut self, parameters: PartialRunParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the work directory.
    #[must_use]
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    /// Sets the failure mode.
    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Silences per-stage span events.
    #[must_use]
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Enables or disables settings persistence.
    #[must_use]
    pub fn with_persistence(mut self, persist: bool) -> Self {
        self.persist_settings = persist;
        self
    }

    /// Resolved work directory.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join("workflow"))
    }

    /// Path of the persisted settings file.
    #[must_use]
    pub fn persisted_path(&self) -> PathBuf {
        self.output_dir.join(SETTINGS_FILE)
    }
}

/// Merged configuration saved after planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSettings {
    /// When the file was written.
    pub saved_at: DateTime<Utc>,
    /// Premade the configuration started from.
    pub premade: String,
    /// Merged configuration.
    pub parameters: PartialRunParameters,
    /// SHA-256 of `parameters`, hex encoded.
    pub fingerprint: String,
}

impl PersistedSettings {
    /// Wraps a merged configuration.
    pub fn new(parameters: PartialRunParameters) -> Result<Self, QsmflowError> {
        let fingerprint = hex::encode(Sha256::digest(serde_json::to_vec(&parameters)?));
        Ok(Self {
            saved_at: Utc::now(),
            premade: parameters
                .premade
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            parameters,
            fingerprint,
        })
    }

    /// Reads `<output_dir>/settings.json` if it exists.
    pub fn load(output_dir: &Path) -> Result<Option<Self>, QsmflowError> {
        let path = output_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        let persisted: Self = serde_json::from_str(&text)
            .map_err(|e| QsmflowError::config("settings", format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), premade = %persisted.premade, "Loaded persisted settings");
        Ok(Some(persisted))
    }

    /// Writes `<output_dir>/settings.json`.
    pub fn save(&self, output_dir: &Path) -> Result<PathBuf, QsmflowError> {
        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join(SETTINGS_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), fingerprint = %self.fingerprint, "Persisted settings");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::QsmAlgorithm;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_from_empty_json() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.max_parallel, 4);
        assert_eq!(settings.failure_mode, FailureMode::ContinueOnFailure);
        assert_eq!(settings.work_dir(), PathBuf::from("qsmflow-output/workflow"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{"bids_dir": "/data/bids", "parameters": {"qsm_algorithm": "tgv"}, "failure_mode": "fail_fast"}"#,
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.bids_dir, PathBuf::from("/data/bids"));
        assert_eq!(settings.parameters.qsm_algorithm, Some(QsmAlgorithm::Tgv));
        assert_eq!(settings.failure_mode, FailureMode::FailFast);
    }

    #[test]
    fn test_invalid_settings_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"parameters": {"bet_fractional_intensity": 1.5}}"#).unwrap();
        let err = Settings::from_file(&path).unwrap_err();
        assert_eq!(err.exit_code(), 2);

        std::fs::write(&path, r#"{"max_parallel": 0}"#).unwrap();
        assert!(Settings::from_file(&path).is_err());
    }

    #[test]
    fn test_persisted_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PersistedSettings::load(dir.path()).unwrap().is_none());

        let params = PartialRunParameters::new()
            .with_premade("fast")
            .with_two_pass(false);
        let persisted = PersistedSettings::new(params.clone()).unwrap();
        persisted.save(dir.path()).unwrap();

        let loaded = PersistedSettings::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.parameters, params);
        assert_eq!(loaded.premade, "fast");
        assert_eq!(loaded.fingerprint, persisted.fingerprint);
        assert_eq!(loaded.fingerprint.len(), 64);
    }
}
