//! Push scheduler: the per-session background loop that samples enabled
//! modules and streams `metrics` notifications, plus the priming and burst
//! senders. The loop only runs for bridge sessions while the global
//! subscription flag is set, and never dies on a tick error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::collectors::sample_cpu_mem;
use crate::history::HistoryRecord;
use crate::session::{now_ms, Session};
use crate::state::AppState;

const IDLE_WAIT_MS: u64 = 300;
const SUPPRESSED_WAIT_MS: u64 = 50;
const ERROR_BACKOFF_MS: u64 = 1000;

pub fn spawn_push_loop(state: AppState, session: Arc<Session>) -> JoinHandle<()> {
    tokio::spawn(push_loop(state, session))
}

async fn push_loop(state: AppState, session: Arc<Session>) {
    loop {
        if session.is_closed() {
            break;
        }
        // Push only for bridge sessions with the global flag on; idle-wait
        // without collecting otherwise.
        if !session.is_bridge() || !state.metrics_push_enabled() {
            sleep(Duration::from_millis(IDLE_WAIT_MS)).await;
            continue;
        }
        // Protect in-flight responses: back off briefly, collect nothing.
        if session.is_push_suppressed(now_ms()) {
            sleep(Duration::from_millis(SUPPRESSED_WAIT_MS)).await;
            continue;
        }
        match push_tick(&state, &session) {
            Ok(true) => {
                let delay = session.effective_interval_ms(now_ms());
                sleep(Duration::from_millis(delay)).await;
            }
            Ok(false) => break, // outbound channel closed
            Err(e) => {
                debug!(conn = %session.conn_id, "push tick failed (will retry): {e:#}");
                let _ = session.notify(
                    "bridge_error",
                    json!({ "reason": "metrics_push_exception", "message": e.to_string() }),
                );
                sleep(Duration::from_millis(ERROR_BACKOFF_MS)).await;
            }
        }
    }
    // Best-effort; on a torn-down connection this simply goes nowhere.
    let _ = session.notify("bridge_disconnected", json!({ "reason": "push_loop_exit" }));
}

/// One sampling tick. Returns Ok(false) when the session is gone.
fn push_tick(state: &AppState, session: &Arc<Session>) -> anyhow::Result<bool> {
    let now = now_ms();
    let enabled = session.enabled_modules(&state.registry);

    let mut payload = Map::new();
    payload.insert("ts".into(), json!(now));
    payload.insert("seq".into(), json!(session.next_seq()));

    for c in state.registry.iter() {
        if !enabled.contains(c.name()) {
            continue;
        }
        // Fast collectors are sampled inline and their failure fails the
        // whole tick; everything else goes through the non-blocking scheduler
        // and may serve a value one cycle old.
        let value = if c.fast() {
            Some(
                c.collect()
                    .with_context(|| format!("collect {}", c.name()))?,
            )
        } else {
            state.scheduler.try_get_result(c)
        };
        if let Some(v) = value {
            payload.insert(c.name().into(), v);
        }
    }

    let cpu = payload
        .get("cpu")
        .and_then(|v| v.get("usage_percent"))
        .and_then(Value::as_f64);
    let mem = payload.get("memory").and_then(|v| {
        let total = v.get("total_mb")?.as_i64()?;
        let used = v.get("used_mb")?.as_i64()?;
        Some((total, used))
    });
    if cpu.is_some() || mem.is_some() {
        state.history.append(HistoryRecord {
            ts: now,
            cpu,
            mem_total: mem.map(|m| m.0),
            mem_used: mem.map(|m| m.1),
        });
    }

    if !session.notify("metrics", Value::Object(payload)) {
        return Ok(false);
    }
    let pushed = session.incr_pushed();
    if state.log_every > 0 && pushed as u64 % state.log_every == 0 {
        info!(conn = %session.conn_id, pushed, "metrics pushed");
    }
    Ok(true)
}

/// Poll until the session's suppression window clears, up to `max_ms`.
pub async fn wait_unsuppressed(session: &Session, max_ms: u64) {
    let deadline = now_ms() + max_ms as i64;
    while session.is_push_suppressed(now_ms()) && now_ms() < deadline {
        sleep(Duration::from_millis(25)).await;
    }
}

/// Send one minimal metrics notification (ts/seq + live cpu/mem) so a client
/// does not have to wait out a full interval after a config change.
pub fn send_minimal_metrics(state: &AppState, session: &Session) -> bool {
    let (cpu, mem) = sample_cpu_mem(&state.registry);
    let mut payload = Map::new();
    payload.insert("ts".into(), json!(now_ms()));
    payload.insert("seq".into(), json!(session.next_seq()));
    if let Some(c) = cpu {
        payload.insert("cpu".into(), json!({ "usage_percent": c }));
    }
    if let Some((total, used)) = mem {
        payload.insert(
            "memory".into(),
            json!({ "total_mb": total, "used_mb": used }),
        );
    }
    if session.notify("metrics", Value::Object(payload)) {
        session.incr_pushed();
        true
    } else {
        false
    }
}

/// One delayed priming notification after a state-changing response.
pub fn spawn_priming(state: &AppState, session: &Arc<Session>, delay_ms: u64) -> JoinHandle<()> {
    let state = state.clone();
    let session = session.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(delay_ms)).await;
        wait_unsuppressed(&session, 400).await;
        send_minimal_metrics(&state, &session);
    })
}

/// TTL-bounded redundancy ticker for burst mode: minimal metrics at the
/// requested cadence (floored to 50ms) until expiry.
pub fn spawn_burst_ticker(
    state: &AppState,
    session: &Arc<Session>,
    interval_ms: i64,
    ttl_ms: i64,
) -> JoinHandle<()> {
    let state = state.clone();
    let session = session.clone();
    tokio::spawn(async move {
        let end = now_ms().saturating_add(ttl_ms.max(100));
        let step = Duration::from_millis(interval_ms.max(50) as u64);
        while now_ms() < end {
            if session.is_closed() {
                break;
            }
            if !session.is_push_suppressed(now_ms()) && !send_minimal_metrics(&state, &session) {
                break;
            }
            sleep(step).await;
        }
        debug!(conn = %session.conn_id, "burst ticker expired");
    })
}
