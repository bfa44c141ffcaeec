//! Resolves the platform-appropriate configuration root, overridable
//! via `AXON_HOME` (`spec.md` §6 "Storage override: config root").
//!
//! Grounded on the `dirs` crate usage in the pack's
//! `vyotiq-ai-vyotiq-agent` Rust backend for its own config root.

use std::path::PathBuf;

const ENV_OVERRIDE: &str = "AXON_HOME";
const APP_DIR_NAME: &str = "axon";

/// Resolve the config root: `$AXON_HOME` if set, else the platform
/// config directory (`dirs::config_dir()`) joined with `axon`.
pub fn resolve() -> PathBuf {
    if let Ok(override_path) = std::env::var(ENV_OVERRIDE) {
        if !override_path.is_empty() {
            return PathBuf::from(override_path);
        }
    }

    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

pub fn settings_path() -> PathBuf {
    resolve().join("settings.json")
}

pub fn embed_queue_dir() -> PathBuf {
    resolve().join("embed-queue")
}

pub fn reconciliation_path() -> PathBuf {
    resolve().join("crawl-reconciliation.json")
}

pub fn baselines_path() -> PathBuf {
    resolve().join("crawl-baselines.json")
}

pub fn daemon_lock_path() -> PathBuf {
    resolve().join("axon-daemon.lock")
}
