//! Non-blocking collector scheduler.
//!
//! Policy: return the freshest available data, never block waiting for new
//! data. Each collector name owns a small state machine; a run that exceeds
//! its budget is flagged for cancellation by the watchdog and abandoned; its
//! eventual result is discarded by the run-generation check, never promoted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::collectors::Collector;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const WATCHDOG_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Completed,
    TimedOut,
    Failed,
}

struct TaskEntry {
    state: TaskState,
    last_result: Option<Value>,
    pending: Option<Value>,
    started_at: Instant,
    consecutive_failures: u32,
    last_duration_ms: u64,
    /// Generation of the in-flight run; a finishing run may only publish if
    /// the generation still matches.
    run: u64,
    cancel: Option<Arc<AtomicBool>>,
}

impl TaskEntry {
    fn new() -> Self {
        Self {
            state: TaskState::Idle,
            last_result: None,
            pending: None,
            started_at: Instant::now(),
            consecutive_failures: 0,
            last_duration_ms: 0,
            run: 0,
            cancel: None,
        }
    }
}

pub struct CollectorScheduler {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    timeout: Duration,
    watchdog_period: Duration,
}

impl CollectorScheduler {
    pub fn new() -> Arc<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            timeout,
            watchdog_period: WATCHDOG_PERIOD,
        })
    }

    /// Drive the per-name state machine and return the freshest value known.
    /// Never waits on the collector itself; at most one run per name is ever
    /// in flight.
    pub fn try_get_result(
        self: &Arc<Self>,
        collector: &Arc<dyn Collector>,
    ) -> Option<Value> {
        let name = collector.name();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = tasks.entry(name.to_string()).or_insert_with(TaskEntry::new);
        match entry.state {
            TaskState::Idle => {
                Self::launch(self, entry, name, collector.clone());
                entry.last_result.clone()
            }
            TaskState::Running => entry.last_result.clone(),
            TaskState::Completed => {
                entry.last_result = entry.pending.take();
                entry.state = TaskState::Idle;
                entry.consecutive_failures = 0;
                debug!(
                    collector = name,
                    duration_ms = entry.last_duration_ms,
                    "collector run completed"
                );
                entry.last_result.clone()
            }
            TaskState::TimedOut | TaskState::Failed => {
                // Abandon the stale run and start over; serve the last
                // known-good value in the meantime.
                if let Some(flag) = entry.cancel.take() {
                    flag.store(true, Ordering::Release);
                }
                Self::launch(self, entry, name, collector.clone());
                entry.last_result.clone()
            }
        }
    }

    fn launch(this: &Arc<Self>, entry: &mut TaskEntry, name: &'static str, collector: Arc<dyn Collector>) {
        entry.run += 1;
        let run = entry.run;
        let cancel = Arc::new(AtomicBool::new(false));
        entry.cancel = Some(cancel.clone());
        entry.state = TaskState::Running;
        entry.started_at = Instant::now();

        let sched = this.clone();
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let result = collector.collect();
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let mut tasks = sched.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = tasks.get_mut(name) else {
                return;
            };
            // A cancelled or superseded run must not touch shared state.
            if entry.run != run || cancel.load(Ordering::Acquire) {
                debug!(collector = name, "discarding result of abandoned run");
                return;
            }
            match result {
                Ok(value) => {
                    entry.pending = Some(value);
                    entry.last_duration_ms = elapsed_ms;
                    entry.state = TaskState::Completed;
                }
                Err(e) => {
                    warn!(collector = name, error = %e, "collector run failed");
                    entry.state = TaskState::Failed;
                    entry.consecutive_failures += 1;
                }
            }
        });
    }

    /// One watchdog pass: flag runs that exceeded the budget.
    pub fn sweep(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for (name, entry) in tasks.iter_mut() {
            if entry.state == TaskState::Running && entry.started_at.elapsed() > self.timeout {
                warn!(
                    collector = name.as_str(),
                    elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "collector run timed out, abandoning"
                );
                entry.state = TaskState::TimedOut;
                entry.consecutive_failures += 1;
                if let Some(flag) = entry.cancel.take() {
                    flag.store(true, Ordering::Release);
                }
            }
        }
    }

    pub fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let sched = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sched.watchdog_period).await;
                sched.sweep();
            }
        })
    }

    pub fn state_of(&self, name: &str) -> Option<TaskState> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(name).map(|e| e.state)
    }

    pub fn failures_of(&self, name: &str) -> u32 {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(name).map(|e| e.consecutive_failures).unwrap_or(0)
    }

    /// Drop all task state. Cancels in-flight runs; test hook between cases.
    pub fn reset(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for entry in tasks.values_mut() {
            if let Some(flag) = entry.cancel.take() {
                flag.store(true, Ordering::Release);
            }
        }
        tasks.clear();
    }
}
