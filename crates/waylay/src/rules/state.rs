//! Persisted rule enable/disable/usage state (`config/rules-state.json`).
//!
//! A `RwLock<HashMap<...>>` guarding a whole-file `serde_json`
//! read-modify-write. Toggle writes are synchronous; usage-count
//! increments are batched and flushed every 10th call to bound I/O.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const FLUSH_EVERY_N_INCREMENTS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleStateEntry {
    pub enabled: bool,
    #[serde(rename = "lastModified")]
    pub last_modified: DateTime<Utc>,
    #[serde(rename = "usageCount")]
    pub usage_count: u64,
}

impl Default for RuleStateEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            last_modified: Utc::now(),
            usage_count: 0,
        }
    }
}

pub struct RuleStateStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, RuleStateEntry>>,
    pending_increments: RwLock<HashMap<String, u64>>,
}

impl RuleStateStore {
    /// Load `path` if present, otherwise start from an empty map. The file
    /// itself is only created on the first mutation.
    pub fn load(path: &Path) -> Self {
        let entries = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();

        Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
            pending_increments: RwLock::new(HashMap::new()),
        }
    }

    /// Reading an unknown rule yields the documented default.
    pub fn entry_for(&self, filename: &str) -> RuleStateEntry {
        self.entries.read().get(filename).cloned().unwrap_or_default()
    }

    pub fn is_enabled(&self, filename: &str) -> bool {
        self.entry_for(filename).enabled
    }

    /// Ensure `filename` has a state entry, defaulting to enabled. Used by
    /// `reload()` to seed state for newly discovered rule files without
    /// disturbing existing entries.
    pub fn ensure_rule_state(&self, filename: &str) {
        let mut entries = self.entries.write();
        entries.entry(filename.to_string()).or_insert_with(RuleStateEntry::default);
    }

    /// Flip enabled/disabled for `filename` and persist synchronously.
    /// Returns the new enabled value.
    pub fn toggle(&self, filename: &str) -> bool {
        let new_value = {
            let mut entries = self.entries.write();
            let entry = entries.entry(filename.to_string()).or_insert_with(RuleStateEntry::default);
            entry.enabled = !entry.enabled;
            entry.last_modified = Utc::now();
            entry.enabled
        };
        self.flush();
        new_value
    }

    /// Record a use of `filename`. Batches writes: only every Nth increment
    /// triggers a flush to disk.
    pub fn record_usage(&self, filename: &str) {
        {
            let mut entries = self.entries.write();
            let entry = entries.entry(filename.to_string()).or_insert_with(RuleStateEntry::default);
            entry.usage_count += 1;
        }

        let should_flush = {
            let mut pending = self.pending_increments.write();
            let counter = pending.entry(filename.to_string()).or_insert(0);
            *counter += 1;
            if *counter >= FLUSH_EVERY_N_INCREMENTS {
                *counter = 0;
                true
            } else {
                false
            }
        };

        if should_flush {
            self.flush();
        }
    }

    pub fn flush(&self) {
        let entries = self.entries.read();
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(text) = serde_json::to_string_pretty(&*entries) {
            if let Err(e) = std::fs::write(&self.path, text) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to persist rule state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!(
            "waylay-rules-state-{}.json",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    #[test]
    fn unknown_rule_defaults_to_enabled_zero_usage() {
        let store = RuleStateStore::load(&temp_path());
        let entry = store.entry_for("never-seen.rhai");
        assert!(entry.enabled);
        assert_eq!(entry.usage_count, 0);
    }

    #[test]
    fn toggle_twice_restores_persisted_state() {
        let path = temp_path();
        let store = RuleStateStore::load(&path);
        let initial = store.is_enabled("a.rhai");
        store.toggle("a.rhai");
        store.toggle("a.rhai");
        assert_eq!(store.is_enabled("a.rhai"), initial);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn toggle_persists_synchronously_to_disk() {
        let path = temp_path();
        let store = RuleStateStore::load(&path);
        store.toggle("b.rhai");
        assert!(path.is_file());

        let reloaded = RuleStateStore::load(&path);
        assert!(!reloaded.is_enabled("b.rhai"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn usage_count_flushes_every_tenth_increment() {
        let path = temp_path();
        let store = RuleStateStore::load(&path);
        for _ in 0..9 {
            store.record_usage("c.rhai");
        }
        assert!(!path.is_file(), "should not flush before the 10th increment");

        store.record_usage("c.rhai");
        assert!(path.is_file(), "should flush on the 10th increment");

        let reloaded = RuleStateStore::load(&path);
        assert_eq!(reloaded.entry_for("c.rhai").usage_count, 10);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn reload_preserves_enable_disable_by_filename() {
        let path = temp_path();
        let store = RuleStateStore::load(&path);
        store.toggle("d.rhai");
        let was_enabled = store.is_enabled("d.rhai");

        store.ensure_rule_state("e.rhai");
        assert!(store.is_enabled("e.rhai"));
        assert_eq!(store.is_enabled("d.rhai"), was_enabled);
        std::fs::remove_file(&path).ok();
    }
}
