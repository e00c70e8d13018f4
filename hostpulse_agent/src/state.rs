//! Process-wide shared state handed to every connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::collectors::CollectorRegistry;
use crate::config::Config;
use crate::history::HistoryStore;
use crate::scheduler::CollectorScheduler;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CollectorRegistry>,
    pub scheduler: Arc<CollectorScheduler>,
    pub history: Arc<HistoryStore>,
    /// Global subscription flag, shared across all sessions. Any session's
    /// subscribe_metrics toggles push for every bridge connection.
    pub metrics_enabled: Arc<AtomicBool>,
    /// When set, `hello` must present exactly this token.
    pub auth_token: Option<String>,
    pub log_every: u64,
}

impl AppState {
    pub fn new(cfg: &Config) -> Result<Self> {
        Ok(Self {
            registry: Arc::new(CollectorRegistry::with_builtins()),
            scheduler: CollectorScheduler::new(),
            history: HistoryStore::open(cfg.db_dir.as_deref())?,
            metrics_enabled: Arc::new(AtomicBool::new(false)),
            auth_token: cfg.token.clone(),
            log_every: cfg.log_every,
        })
    }

    pub fn metrics_push_enabled(&self) -> bool {
        self.metrics_enabled.load(Ordering::Relaxed)
    }

    pub fn set_metrics_enabled(&self, enabled: bool) {
        self.metrics_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Reset shared mutable state between test cases (subscription flag,
    /// collector task table, history ring).
    pub fn reset_shared(&self) {
        self.set_metrics_enabled(false);
        self.scheduler.reset();
        self.history.reset_ring();
    }
}
