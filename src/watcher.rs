//! File watcher for incremental live re-indexing.
//!
//! Subscribes to native filesystem events on the codebase root, debounces
//! them per path, and drives hash-verified reconciliation through the
//! indexer. Events for distinct paths are independent; events for the same
//! path collapse into one reconciliation per quiescence window. Stopping the
//! watcher cancels every pending timer.

use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::normalize_rel_path;
use crate::error::{Error, Result};
use crate::indexer::Indexer;
use crate::scan::is_ignored_path;

/// Debounce window: wait this long after the last event before reconciling.
pub const DEBOUNCE_MS: u64 = 500;

/// Collapsed event classes after notify's taxonomy is folded down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Upsert,
    Delete,
}

/// Callback invoked with the repo-relative path after each completed
/// reconciliation.
pub type ChangeCallback = Box<dyn Fn(&str) + Send + Sync>;

pub(crate) struct Coordinator {
    indexer: Arc<Indexer>,
    /// path → pending debounce timer. Re-arming cancels the previous timer.
    timers: DashMap<String, JoinHandle<()>>,
    /// path → reconciliation lock, serializing same-path work.
    locks: DashMap<String, Arc<Mutex<()>>>,
    stopped: AtomicBool,
    on_change: Option<ChangeCallback>,
    rt: tokio::runtime::Handle,
}

impl Coordinator {
    pub(crate) fn new(indexer: Arc<Indexer>, on_change: Option<ChangeCallback>) -> Arc<Self> {
        Arc::new(Self {
            indexer,
            timers: DashMap::new(),
            locks: DashMap::new(),
            stopped: AtomicBool::new(false),
            on_change,
            rt: tokio::runtime::Handle::current(),
        })
    }

    /// Entry point for one native event: normalize, filter, classify, and
    /// (re)arm the per-path timer. This is the only work done on the
    /// watcher's delivery thread.
    pub(crate) fn handle_event(self: &Arc<Self>, abs_path: &Path, class: EventClass) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let Some(rel_path) = normalize_rel_path(self.indexer.root(), abs_path) else {
            return;
        };
        if rel_path.is_empty() || is_ignored_path(&rel_path) {
            return;
        }
        self.arm_timer(rel_path, class);
    }

    fn arm_timer(self: &Arc<Self>, rel_path: String, class: EventClass) {
        if let Some((_, previous)) = self.timers.remove(&rel_path) {
            previous.abort();
        }
        let coordinator = Arc::clone(self);
        let path = rel_path.clone();
        let timer = self.rt.spawn(async move {
            tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS)).await;
            coordinator.timers.remove(&path);
            if coordinator.stopped.load(Ordering::Acquire) {
                return;
            }
            coordinator.reconcile(path, class).await;
        });
        self.timers.insert(rel_path, timer);
    }

    async fn reconcile(self: Arc<Self>, rel_path: String, class: EventClass) {
        let lock = self
            .locks
            .entry(rel_path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let coordinator = Arc::clone(&self);
        let path = rel_path.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let _guard = match lock.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            match class {
                EventClass::Delete => coordinator.indexer.reconcile_delete(&path),
                EventClass::Upsert => coordinator.indexer.reconcile_upsert(&path),
            }
        })
        .await;

        match outcome {
            Ok(Ok(mutated)) => {
                debug!(file = %rel_path, mutated, "watcher reconciliation complete");
                if let Some(cb) = &self.on_change {
                    cb(&rel_path);
                }
            }
            Ok(Err(e)) => warn!(file = %rel_path, error = %e, "watcher reconciliation failed"),
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => warn!(file = %rel_path, error = %join_err, "reconciliation task panicked"),
        }
    }

    /// Cancel every pending timer and refuse further events.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let keys: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, timer)) = self.timers.remove(&key) {
                timer.abort();
            }
        }
        self.locks.clear();
    }

    #[cfg(test)]
    pub(crate) fn pending_timers(&self) -> usize {
        self.timers.len()
    }
}

/// Running watcher. Dropping the handle stops the native subscription and
/// cancels all pending work.
pub struct FileWatcher {
    coordinator: Arc<Coordinator>,
    /// Kept alive for the native subscription; dropped on stop.
    native: Option<RecommendedWatcher>,
}

impl FileWatcher {
    pub fn stop(&mut self) {
        self.native = None;
        self.coordinator.stop();
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn classify(kind: &EventKind) -> Option<EventClass> {
    match kind {
        EventKind::Create(_) | EventKind::Modify(_) => Some(EventClass::Upsert),
        EventKind::Remove(_) => Some(EventClass::Delete),
        _ => None,
    }
}

/// Start watching the indexer's codebase root. Must be called from within a
/// tokio runtime; debounce timers fire on that runtime.
pub fn start_watcher(
    indexer: Arc<Indexer>,
    on_change: Option<ChangeCallback>,
) -> Result<FileWatcher> {
    let coordinator = Coordinator::new(Arc::clone(&indexer), on_change);

    let callback = {
        let coordinator = Arc::clone(&coordinator);
        move |res: std::result::Result<Event, notify::Error>| {
            let event = match res {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "watch event error");
                    return;
                }
            };
            let Some(class) = classify(&event.kind) else { return };
            for path in &event.paths {
                // directory events carry no indexable content
                if class == EventClass::Upsert && path.is_dir() {
                    continue;
                }
                coordinator.handle_event(path, class);
            }
        }
    };

    let mut native = RecommendedWatcher::new(callback, notify::Config::default())
        .map_err(|e| Error::Watcher(e.to_string()))?;
    native
        .watch(indexer.root(), RecursiveMode::Recursive)
        .map_err(|e| Error::Watcher(e.to_string()))?;
    debug!(root = %indexer.root().display(), "watching for changes");

    Ok(FileWatcher { coordinator, native: Some(native) })
}
