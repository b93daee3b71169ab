//! Persisted settings document with backup recovery
//!
//! A single JSON document at a configured path, with a sibling backup file
//! written before every update. Reads fall back primary -> backup -> hard
//! defaults; explicit writes surface their errors to the caller.

use crate::error::{ContextError, Result};
use crate::optimizer::OptimizationLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn default_enabled() -> bool {
    true
}

fn default_live_budget() -> usize {
    6000
}

fn default_hard_cap() -> usize {
    100_000
}

fn default_auto_optimize() -> bool {
    true
}

fn default_pii_stripping() -> bool {
    true
}

fn default_level() -> OptimizationLevel {
    OptimizationLevel::Medium
}

/// Accumulated usage counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageTotals {
    pub total_tokens_used: u64,
    pub total_cost: f64,
    pub request_count: u64,
    pub last_reset: DateTime<Utc>,
}

impl Default for UsageTotals {
    fn default() -> Self {
        Self {
            total_tokens_used: 0,
            total_cost: 0.0,
            request_count: 0,
            last_reset: Utc::now(),
        }
    }
}

/// The persisted settings document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Token allowance for the most recent messages kept verbatim. Acts as a
    /// hard ceiling the optimizer cannot exceed.
    #[serde(default = "default_live_budget")]
    pub live_budget: usize,

    /// Absolute maximum tokens before the backend itself would reject the
    /// thread.
    #[serde(default = "default_hard_cap")]
    pub hard_cap: usize,

    #[serde(default = "default_auto_optimize")]
    pub auto_optimize: bool,

    #[serde(default = "default_pii_stripping")]
    pub enable_pii_stripping: bool,

    #[serde(default = "default_level")]
    pub optimization_level: OptimizationLevel,

    #[serde(default)]
    pub usage: UsageTotals,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            live_budget: default_live_budget(),
            hard_cap: default_hard_cap(),
            auto_optimize: default_auto_optimize(),
            enable_pii_stripping: default_pii_stripping(),
            optimization_level: default_level(),
            usage: UsageTotals::default(),
        }
    }
}

/// Durable key-value style store for the settings document.
pub struct SettingsStore {
    path: PathBuf,
    backup_path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut backup_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "settings.json".to_string());
        backup_name.push_str(".bak");
        let backup_path = path.with_file_name(backup_name);

        Self { path, backup_path }
    }

    /// Load the settings document. Never fails: a corrupted or missing
    /// primary file falls back to the backup, then to hard defaults, logging
    /// each fallback.
    pub async fn load(&self) -> Settings {
        match self.read_document(&self.path).await {
            Ok(settings) => settings,
            Err(primary_err) => {
                warn!(
                    "Settings read failed ({}), trying backup: {}",
                    self.path.display(),
                    primary_err
                );
                match self.read_document(&self.backup_path).await {
                    Ok(settings) => {
                        info!("Recovered settings from backup");
                        settings
                    }
                    Err(backup_err) => {
                        warn!("Backup read failed, using defaults: {}", backup_err);
                        Settings::default()
                    }
                }
            }
        }
    }

    /// Persist the full document, writing a backup of the prior version
    /// first. Backup failure is logged but does not block the write; the
    /// write itself surfaces its error.
    pub async fn save(&self, settings: &Settings) -> Result<()> {
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::copy(&self.path, &self.backup_path).await {
                warn!("Settings backup failed: {}", e);
            }
        }

        let body = serde_json::to_string_pretty(settings)
            .map_err(|e| ContextError::Persistence(e.to_string()))?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| ContextError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Load, apply `mutate`, save, and return the updated document.
    pub async fn save_partial<F>(&self, mutate: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut settings = self.load().await;
        mutate(&mut settings);
        self.save(&settings).await?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self, path: &Path) -> Result<Settings> {
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ContextError::Persistence(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| ContextError::Persistence(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));

        let settings = store.load().await;
        assert!(settings.enabled);
        assert_eq!(settings.live_budget, 6000);
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));

        let mut settings = Settings::default();
        settings.live_budget = 4000;
        settings.enabled = false;
        store.save(&settings).await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.live_budget, 4000);
        assert!(!loaded.enabled);
    }

    #[tokio::test]
    async fn test_second_save_writes_backup_of_prior_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(&path);

        let mut settings = Settings::default();
        settings.live_budget = 1111;
        store.save(&settings).await.unwrap();
        settings.live_budget = 2222;
        store.save(&settings).await.unwrap();

        let backup_body =
            std::fs::read_to_string(dir.path().join("settings.json.bak")).unwrap();
        let backup: Settings = serde_json::from_str(&backup_body).unwrap();
        assert_eq!(backup.live_budget, 1111);

        let current = store.load().await;
        assert_eq!(current.live_budget, 2222);
    }

    #[tokio::test]
    async fn test_corrupted_primary_recovers_from_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(&path);

        let mut settings = Settings::default();
        settings.live_budget = 3333;
        store.save(&settings).await.unwrap();
        settings.live_budget = 4444;
        store.save(&settings).await.unwrap();

        std::fs::write(&path, "{ not json").unwrap();

        let recovered = store.load().await;
        assert_eq!(recovered.live_budget, 3333);
    }

    #[tokio::test]
    async fn test_corrupted_primary_and_backup_yield_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(&path);

        std::fs::write(&path, "garbage").unwrap();
        std::fs::write(dir.path().join("settings.json.bak"), "garbage").unwrap();

        let settings = store.load().await;
        assert_eq!(settings.live_budget, 6000);
    }

    #[tokio::test]
    async fn test_save_partial_merges() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));

        let updated = store
            .save_partial(|s| {
                s.usage.total_tokens_used += 500;
                s.usage.request_count += 1;
            })
            .await
            .unwrap();

        assert_eq!(updated.usage.total_tokens_used, 500);
        let reloaded = store.load().await;
        assert_eq!(reloaded.usage.request_count, 1);
    }

    #[test]
    fn test_settings_deserialize_with_missing_fields() {
        let settings: Settings = serde_json::from_str(r#"{"enabled": false}"#).unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.hard_cap, 100_000);
        assert!(settings.enable_pii_stripping);
    }
}
