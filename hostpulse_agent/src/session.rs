//! Per-connection session state: bridge flag, interval configuration, burst
//! override, push suppression, and the outbound frame channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::collectors::CollectorRegistry;
use crate::types::{Notification, Response};

pub const MIN_INTERVAL_MS: u64 = 100;
pub const MIN_BURST_INTERVAL_MS: u64 = 50;
pub const DEFAULT_BASE_INTERVAL_MS: u64 = 1000;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

#[derive(Debug, Clone, Copy)]
pub struct Burst {
    pub interval_ms: u64,
    pub expires_at: i64,
}

#[derive(Debug)]
struct SessionState {
    is_bridge: bool,
    base_interval_ms: u64,
    module_intervals: HashMap<String, u64>,
    burst: Option<Burst>,
    suppress_until: i64,
}

/// Read-only view of the current configuration for `get_config`.
#[derive(Debug)]
pub struct ConfigView {
    pub base_interval_ms: u64,
    pub module_intervals: HashMap<String, u64>,
    pub current_interval_ms: u64,
    pub burst_expires_at: i64,
}

pub struct Session {
    pub conn_id: Uuid,
    tx: mpsc::UnboundedSender<String>,
    seq: AtomicI64,
    pushed: AtomicI64,
    state: Mutex<SessionState>,
    /// Warm-up, priming and burst-ticker tasks; aborted on disconnect.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Arc<Self> {
        Arc::new(Self {
            conn_id: Uuid::new_v4(),
            tx,
            seq: AtomicI64::new(0),
            pushed: AtomicI64::new(0),
            state: Mutex::new(SessionState {
                is_bridge: false,
                base_interval_ms: DEFAULT_BASE_INTERVAL_MS,
                module_intervals: HashMap::new(),
                burst: None,
                suppress_until: 0,
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn incr_pushed(&self) -> i64 {
        self.pushed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_bridge(&self) -> bool {
        self.lock().is_bridge
    }

    pub fn set_bridge(&self) {
        self.lock().is_bridge = true;
    }

    // ---- suppression window ----

    /// Withhold push notifications for at least `ms` (floored to 50ms) so a
    /// pending response does not share its write boundary with a push.
    pub fn suppress_push(&self, ms: i64) {
        let until = now_ms() + ms.max(50);
        let mut st = self.lock();
        st.suppress_until = st.suppress_until.max(until);
    }

    pub fn is_push_suppressed(&self, now: i64) -> bool {
        now < self.lock().suppress_until
    }

    // ---- interval configuration ----

    pub fn base_interval_ms(&self) -> u64 {
        self.lock().base_interval_ms
    }

    pub fn set_base_interval_ms(&self, ms: u64) {
        self.lock().base_interval_ms = ms.max(MIN_INTERVAL_MS);
    }

    /// Replace the enabled-module set with exactly `modules`, each at the
    /// current base interval.
    pub fn replace_modules(&self, modules: &[String]) {
        let mut st = self.lock();
        let base = st.base_interval_ms.max(MIN_INTERVAL_MS);
        st.module_intervals = modules.iter().map(|m| (m.clone(), base)).collect();
    }

    pub fn set_module_intervals(&self, intervals: HashMap<String, u64>) {
        let mut st = self.lock();
        st.module_intervals = intervals
            .into_iter()
            .map(|(k, v)| (k, v.max(MIN_INTERVAL_MS)))
            .collect();
    }

    /// Drop per-module intervals; the enabled set reverts to all registered
    /// collectors.
    pub fn clear_modules(&self) {
        self.lock().module_intervals.clear();
    }

    pub fn module_intervals(&self) -> HashMap<String, u64> {
        self.lock().module_intervals.clone()
    }

    pub fn enabled_modules(&self, registry: &CollectorRegistry) -> HashSet<String> {
        let st = self.lock();
        if st.module_intervals.is_empty() {
            registry.names().iter().map(|s| s.to_string()).collect()
        } else {
            st.module_intervals.keys().cloned().collect()
        }
    }

    // ---- burst ----

    pub fn set_burst(&self, interval_ms: u64, expires_at: i64) {
        self.lock().burst = Some(Burst {
            interval_ms,
            expires_at,
        });
    }

    /// Effective push interval: burst override while active, else the minimum
    /// of the base interval and any per-module interval.
    pub fn effective_interval_ms(&self, now: i64) -> u64 {
        let st = self.lock();
        if let Some(b) = st.burst {
            if now < b.expires_at {
                return b.interval_ms.max(MIN_BURST_INTERVAL_MS);
            }
        }
        let min_mod = st.module_intervals.values().copied().min();
        match min_mod {
            Some(m) => st.base_interval_ms.min(m),
            None => st.base_interval_ms,
        }
    }

    pub fn config_view(&self, now: i64) -> ConfigView {
        let current = self.effective_interval_ms(now);
        let st = self.lock();
        let burst_expires_at = match st.burst {
            Some(b) if now < b.expires_at => b.expires_at,
            _ => 0,
        };
        ConfigView {
            base_interval_ms: st.base_interval_ms,
            module_intervals: st.module_intervals.clone(),
            current_interval_ms: current,
            burst_expires_at,
        }
    }

    // ---- outbound channel ----

    pub fn send_response(&self, resp: &Response) -> bool {
        match serde_json::to_string(resp) {
            Ok(text) => self.tx.send(text).is_ok(),
            Err(e) => {
                debug!(conn = %self.conn_id, "response serialize failed: {e}");
                false
            }
        }
    }

    /// Best-effort notification; a closed connection simply drops it.
    pub fn notify(&self, event: &str, data: Value) -> bool {
        let frame = Notification { event, data };
        match serde_json::to_string(&frame) {
            Ok(text) => self.tx.send(text).is_ok(),
            Err(e) => {
                debug!(conn = %self.conn_id, "notification serialize failed: {e}");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    // ---- background task tracking ----

    pub fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    pub fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for h in tasks.drain(..) {
            h.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
