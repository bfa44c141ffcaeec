//! `EffectiveSettings`: a fully-defaulted, deep-merged, atomically
//! persisted JSON settings document (`spec.md` §4.9).
//!
//! The nested-record shape and per-field `#[serde(default = "...")]`
//! convention directly follows the teacher's `config.rs`; the
//! difference is persistence — the teacher reads a static TOML file
//! the operator hand-edits, Axon reads/writes a JSON document the
//! product itself mutates, so it needs atomic writes, restrictive
//! permissions, mtime caching, and corruption recovery on top.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

fn default_version() -> u32 {
    1
}

fn default_exclude_paths() -> Vec<String> {
    vec!["node_modules".into(), ".git".into(), "target".into(), "dist".into()]
}

fn default_exclude_extensions() -> Vec<String> {
    vec!["png".into(), "jpg".into(), "jpeg".into(), "gif".into(), "pdf".into(), "zip".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrawlSettings {
    #[serde(default = "default_crawl_limit")]
    pub limit: usize,
    #[serde(default = "default_missing_threshold")]
    pub missing_threshold: u32,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

fn default_crawl_limit() -> usize {
    500
}
fn default_missing_threshold() -> u32 {
    2
}
fn default_grace_period_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            limit: default_crawl_limit(),
            missing_threshold: default_missing_threshold(),
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeSettings {
    #[serde(default = "default_scrape_formats")]
    pub formats: Vec<String>,
}

fn default_scrape_formats() -> Vec<String> {
    vec!["markdown".into()]
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            formats: default_scrape_formats(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapSettings {
    #[serde(default = "default_map_limit")]
    pub limit: usize,
}

fn default_map_limit() -> usize {
    1000
}

impl Default for MapSettings {
    fn default() -> Self {
        Self {
            limit: default_map_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchSettings {
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    10
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            limit: default_search_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractSettings {
    #[serde(default)]
    pub schema_hint: Option<String>,
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self { schema_hint: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchSettings {
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,
}

fn default_batch_concurrency() -> usize {
    5
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: default_batch_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AskSettings {
    #[serde(default)]
    pub llm_endpoint: Option<String>,
}

impl Default for AskSettings {
    fn default() -> Self {
        Self { llm_endpoint: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    5_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkingSettings {
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_target_chunk_size")]
    pub target_chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
}

fn default_max_chunk_size() -> usize {
    1500
}
fn default_target_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    100
}
fn default_min_chunk_size() -> usize {
    50
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            target_chunk_size: default_target_chunk_size(),
            overlap: default_overlap(),
            min_chunk_size: default_min_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
}

fn default_batch_size() -> usize {
    24
}
fn default_max_concurrent() -> usize {
    10
}
fn default_max_concurrent_batches() -> usize {
    4
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent: default_max_concurrent(),
            max_concurrent_batches: default_max_concurrent_batches(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollingSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Typed merge of on-disk user settings over built-in defaults. Every
/// nested record has a total default, so callers never see a missing
/// field. `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EffectiveSettings {
    #[serde(default = "default_version")]
    pub settings_version: u32,
    #[serde(default = "default_exclude_paths")]
    pub default_exclude_paths: Vec<String>,
    #[serde(default = "default_exclude_extensions")]
    pub default_exclude_extensions: Vec<String>,
    #[serde(default)]
    pub crawl: CrawlSettings,
    #[serde(default)]
    pub scrape: ScrapeSettings,
    #[serde(default)]
    pub map: MapSettings,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(default)]
    pub extract: ExtractSettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub ask: AskSettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub polling: PollingSettings,
}

impl Default for EffectiveSettings {
    fn default() -> Self {
        Self {
            settings_version: default_version(),
            default_exclude_paths: default_exclude_paths(),
            default_exclude_extensions: default_exclude_extensions(),
            crawl: CrawlSettings::default(),
            scrape: ScrapeSettings::default(),
            map: MapSettings::default(),
            search: SearchSettings::default(),
            extract: ExtractSettings::default(),
            batch: BatchSettings::default(),
            ask: AskSettings::default(),
            http: HttpSettings::default(),
            chunking: ChunkingSettings::default(),
            embedding: EmbeddingSettings::default(),
            polling: PollingSettings::default(),
        }
    }
}

impl EffectiveSettings {
    /// Deep-merge `patch` (an arbitrary partial JSON document) over
    /// `self`, one level deep: known nested records are merged
    /// key-by-key; scalars and arrays (including path/extension lists)
    /// are replaced wholesale. `spec.md` §4.9 "Deep-merge rule".
    pub fn merged_with(&self, patch: &Value) -> Result<Self, CoreError> {
        let mut base = serde_json::to_value(self)
            .map_err(|e| CoreError::InvalidInput(format!("cannot serialize settings: {e}")))?;
        deep_merge_one_level(&mut base, patch);
        serde_json::from_value(base)
            .map_err(|e| CoreError::InvalidInput(format!("invalid settings patch: {e}")))
    }
}

/// Merge `patch` into `base` one level deep: for object-valued keys
/// present in both, merge their second-level keys; everything else
/// (scalars, arrays, keys only on one side) is replaced/inserted
/// wholesale from `patch`.
fn deep_merge_one_level(base: &mut Value, patch: &Value) {
    let (Value::Object(base_map), Value::Object(patch_map)) = (base, patch) else {
        return;
    };
    for (key, patch_value) in patch_map {
        match base_map.get_mut(key) {
            Some(existing @ Value::Object(_)) if patch_value.is_object() => {
                if let (Value::Object(existing_map), Value::Object(patch_inner)) =
                    (existing, patch_value)
                {
                    for (inner_key, inner_value) in patch_inner {
                        existing_map.insert(inner_key.clone(), inner_value.clone());
                    }
                }
            }
            _ => {
                base_map.insert(key.clone(), patch_value.clone());
            }
        }
    }
}

struct CachedSettings {
    settings: EffectiveSettings,
    mtime: Option<SystemTime>,
}

/// File-backed settings store: atomic writes, `0600`/`0700`
/// permissions on Unix, mtime-cached reads, corruption recovery.
pub struct SettingsStore {
    path: PathBuf,
    lock: std::sync::Mutex<Option<CachedSettings>>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: std::sync::Mutex::new(None),
        }
    }

    fn file_mtime(path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
    }

    /// Return the effective settings, reading from disk only if the
    /// file's mtime has changed since the last read (or on first call).
    pub fn get(&self) -> Result<EffectiveSettings, CoreError> {
        let current_mtime = Self::file_mtime(&self.path);
        let mut cache = self.lock.lock().unwrap();

        if let Some(cached) = cache.as_ref() {
            if cached.mtime == current_mtime {
                return Ok(cached.settings.clone());
            }
        }

        let settings = self.load_from_disk()?;
        *cache = Some(CachedSettings {
            settings: settings.clone(),
            mtime: current_mtime,
        });
        Ok(settings)
    }

    fn load_from_disk(&self) -> Result<EffectiveSettings, CoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(EffectiveSettings::default());
            }
            Err(e) => {
                return Err(CoreError::Transient(format!("cannot read settings file: {e}")))
            }
        };

        match serde_json::from_slice::<EffectiveSettings>(&bytes) {
            Ok(settings) => Ok(settings),
            Err(_) => {
                self.quarantine_corrupt_file()?;
                Ok(EffectiveSettings::default())
            }
        }
    }

    /// Rename the unreadable file aside with a timestamped suffix and
    /// leave a fresh defaults document in its place, per `spec.md` §4.9.
    fn quarantine_corrupt_file(&self) -> Result<(), CoreError> {
        let timestamp = Self::file_mtime(&self.path)
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let backup_path = self
            .path
            .with_extension(format!("json.invalid-backup-{timestamp}"));
        std::fs::rename(&self.path, &backup_path)
            .map_err(|e| CoreError::Transient(format!("cannot quarantine corrupt settings: {e}")))?;
        self.write_to_disk(&EffectiveSettings::default())
    }

    /// Merge `patch` over the current settings and persist the result.
    pub fn save(&self, patch: &Value) -> Result<EffectiveSettings, CoreError> {
        let current = self.get()?;
        let merged = current.merged_with(patch)?;
        self.write_to_disk(&merged)?;

        let mtime = Self::file_mtime(&self.path);
        *self.lock.lock().unwrap() = Some(CachedSettings {
            settings: merged.clone(),
            mtime,
        });
        Ok(merged)
    }

    fn write_to_disk(&self, settings: &EffectiveSettings) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Transient(format!("cannot create config dir: {e}")))?;
            set_dir_permissions(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(settings)
            .map_err(|e| CoreError::InvalidInput(format!("cannot serialize settings: {e}")))?;
        std::fs::write(&tmp_path, &bytes)
            .map_err(|e| CoreError::Transient(format!("cannot write temp settings file: {e}")))?;
        set_file_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| CoreError::Transient(format!("cannot rename settings file: {e}")))?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| CoreError::Transient(format!("cannot set settings file permissions: {e}")))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| CoreError::Transient(format!("cannot set config dir permissions: {e}")))
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_fully_populated() {
        let settings = EffectiveSettings::default();
        assert_eq!(settings.settings_version, 1);
        assert_eq!(settings.chunking.max_chunk_size, 1500);
        assert_eq!(settings.http.max_retries, 3);
    }

    #[test]
    fn deep_merge_replaces_scalars_and_merges_nested_records_one_level_deep() {
        let base = EffectiveSettings::default();
        let patch = serde_json::json!({
            "chunking": { "max_chunk_size": 2000 },
            "default_exclude_paths": ["only-this"],
        });
        let merged = base.merged_with(&patch).unwrap();

        assert_eq!(merged.chunking.max_chunk_size, 2000);
        // Untouched nested field survives the one-level merge.
        assert_eq!(merged.chunking.target_chunk_size, 1000);
        assert_eq!(merged.default_exclude_paths, vec!["only-this".to_string()]);
    }

    #[test]
    fn missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));
        let settings = store.get().unwrap();
        assert_eq!(settings.settings_version, 1);
    }

    #[test]
    fn merge_rejects_unknown_top_level_key() {
        let base = EffectiveSettings::default();
        let patch = serde_json::json!({ "chunkng": { "max_chunk_size": 2000 } });
        let err = base.merged_with(&patch).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn merge_rejects_unknown_nested_key() {
        let base = EffectiveSettings::default();
        let patch = serde_json::json!({ "chunking": { "max_chnk_size": 2000 } });
        let err = base.merged_with(&patch).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn save_then_get_round_trips_and_reuses_cache_without_reread() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));

        store
            .save(&serde_json::json!({ "chunking": { "max_chunk_size": 999 } }))
            .unwrap();
        let reloaded = store.get().unwrap();
        assert_eq!(reloaded.chunking.max_chunk_size, 999);
    }

    #[test]
    fn corrupt_file_is_quarantined_and_defaults_are_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, b"not valid json").unwrap();

        let store = SettingsStore::new(&path);
        let settings = store.get().unwrap();
        assert_eq!(settings.settings_version, 1);

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("invalid-backup"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn settings_file_is_written_with_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(&path);
        store.save(&serde_json::json!({})).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
