//! Rule directory scanning and hot reload.
//!
//! Mirrors this codebase's existing fs-watch-driven reload pattern: a
//! `notify` watcher debounces filesystem events into a single `reload()`
//! call, which rebuilds an immutable snapshot and publishes it via
//! `arc-swap` so in-flight transactions keep whatever snapshot they
//! already captured rather than observing a reload mid-transaction.

use crate::rules::engine::{create_engine, CompiledRule};
use crate::rules::state::RuleStateStore;
use arc_swap::ArcSwap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use rhai::Engine;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RULE_EXTENSION: &str = "rhai";
const DEBOUNCE: Duration = Duration::from_millis(250);

/// One entry in the published snapshot: the compiled rule plus whether it
/// is currently enabled, resolved once per reload so the pipeline doesn't
/// need to consult `RuleStateStore` on every request.
pub struct SnapshotEntry {
    pub rule: CompiledRule,
    pub enabled: bool,
}

pub type Snapshot = Vec<Arc<SnapshotEntry>>;

pub struct RuleStore {
    dir: PathBuf,
    engine: Engine,
    state: Arc<RuleStateStore>,
    snapshot: ArcSwap<Snapshot>,
    // Held only to keep the watcher alive for the store's lifetime; never
    // read back out. Mutex, not a plain field, because it's populated after
    // the store is already behind an `Arc` (the watcher's callback needs a
    // `Weak` back-reference to `self`).
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl RuleStore {
    /// Scan `dir` once, start watching it for changes, and return the
    /// store primed with the initial snapshot. A missing directory is not
    /// an error: it is treated as zero rules.
    pub fn open(dir: &Path, state: Arc<RuleStateStore>) -> anyhow::Result<Arc<Self>> {
        let engine = create_engine();
        let snapshot = scan(dir, &engine, &state);

        let store = Arc::new(Self {
            dir: dir.to_path_buf(),
            engine,
            state,
            snapshot: ArcSwap::from_pointee(snapshot),
            _watcher: Mutex::new(None),
        });

        let watcher = store.clone().spawn_watcher()?;
        *store._watcher.lock().unwrap() = Some(watcher);

        Ok(store)
    }

    fn spawn_watcher(self: Arc<Self>) -> notify::Result<RecommendedWatcher> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(tx)?;
        if self.dir.is_dir() {
            watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        }

        let weak = Arc::downgrade(&self);
        std::thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                if event.is_err() {
                    continue;
                }
                // Drain anything else that arrives within the debounce window
                // so a burst of saves triggers one reload, not N.
                while rx.recv_timeout(DEBOUNCE).is_ok() {}

                let Some(store) = weak.upgrade() else { break };
                store.reload();
            }
        });

        Ok(watcher)
    }

    /// Rebuild the snapshot from disk and publish it atomically. Existing
    /// holders of the prior snapshot (in-flight transactions) keep using
    /// their `Arc` until they finish.
    pub fn reload(&self) {
        let snapshot = scan(&self.dir, &self.engine, &self.state);
        self.snapshot.store(Arc::new(snapshot));
    }

    /// The current rule snapshot, already filtered to enabled rules and
    /// ordered by filename. Cheap: an `Arc` clone of the published vector.
    pub fn enabled_rules(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn toggle(&self, filename: &str) -> bool {
        let new_value = self.state.toggle(filename);
        self.reload();
        new_value
    }

    pub fn record_usage(&self, filename: &str) {
        self.state.record_usage(filename);
    }
}

/// List `.rhai` files in `dir` in lexicographic-by-filename order, compile
/// each, and pair it with its enabled flag. A rule that fails to parse is
/// skipped, not fatal: one broken file must never take the whole proxy
/// down.
fn scan(dir: &Path, engine: &Engine, state: &RuleStateStore) -> Snapshot {
    let mut filenames: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                let name = path.file_name()?.to_str()?.to_string();
                if name.starts_with('_') {
                    return None;
                }
                if path.extension().and_then(|s| s.to_str()) != Some(RULE_EXTENSION) {
                    return None;
                }
                Some(name)
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    filenames.sort();

    let mut snapshot = Vec::with_capacity(filenames.len());
    for filename in filenames {
        let path = dir.join(&filename);
        let source = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(file = %filename, error = %e, "skipping unreadable rule file");
                continue;
            }
        };

        match CompiledRule::compile(&filename, &source, engine) {
            Ok(rule) => {
                state.ensure_rule_state(&filename);
                let enabled = state.is_enabled(&filename);
                snapshot.push(Arc::new(SnapshotEntry { rule, enabled }));
            }
            Err(e) => {
                tracing::warn!(file = %filename, error = %e, "skipping rule that failed to compile");
            }
        }
    }

    snapshot
}
