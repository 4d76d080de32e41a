//! Rule Store (C2): compiled rule scripts, their persisted enable/disable
//! and usage-count state, and the hot-reloading directory snapshot that
//! ties the two together.

pub mod engine;
pub mod state;
pub mod store;

pub use engine::{create_engine, CompiledRule, OnRequestOutcome};
pub use state::{RuleStateEntry, RuleStateStore};
pub use store::{RuleStore, Snapshot, SnapshotEntry};

use std::path::Path;
use std::sync::Arc;

/// Fixed location for enable/disable/usage persistence, independent of the
/// configurable rules directory.
const STATE_PATH: &str = "config/rules-state.json";

/// Open the rule store rooted at `rules_dir`, using `config/rules-state.json`
/// (relative to the process's working directory, not `rules_dir`) for
/// enable/disable/usage persistence.
pub fn open(rules_dir: &Path) -> anyhow::Result<Arc<RuleStore>> {
    let state = Arc::new(RuleStateStore::load(Path::new(STATE_PATH)));
    RuleStore::open(rules_dir, state)
}
