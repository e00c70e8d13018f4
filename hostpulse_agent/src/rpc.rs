//! Session protocol engine: validates and executes client operations.
//!
//! Every request first arms a short push-suppression window so a concurrent
//! push tick cannot interleave with the response on the same channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collectors::{normalize_module, sample_cpu_mem};
use crate::error::RpcError;
use crate::history::{agg_bucket_ms, downsample, HistoryRecord};
use crate::push;
use crate::session::{now_ms, Session};
use crate::state::AppState;
use crate::types::{
    BurstParams, HelloParams, QueryHistoryParams, Request, Response, SetConfigParams,
    SnapshotParams, StartParams, SubscribeMetricsParams,
};

pub const PROTOCOL_VERSION: i64 = 1;
pub const SUPPORTED_CAPABILITIES: [&str; 3] = ["metrics_stream", "burst_mode", "history_query"];
pub const STREAM_CAPABILITY: &str = "metrics_stream";
/// Modules auto-started for a freshly handshaken bridge.
pub const DEFAULT_MODULES: [&str; 4] = ["cpu", "mem", "disk", "network"];

const RESPONSE_SUPPRESS_MS: i64 = 200;

pub async fn dispatch(state: &AppState, session: &Arc<Session>, req: Request) -> Response {
    session.suppress_push(RESPONSE_SUPPRESS_MS);
    let result = match req.method.as_str() {
        "hello" => hello(state, session, req.params),
        "snapshot" => snapshot(state, session, req.params),
        "start" => start(session, req.params),
        "stop" => stop(session),
        "subscribe_metrics" => subscribe_metrics(state, session, req.params),
        "set_config" => set_config(state, session, req.params),
        "get_config" => get_config(session),
        "burst_subscribe" => burst_subscribe(state, session, req.params),
        "query_history" => query_history(state, req.params).await,
        other => Err(RpcError::NotSupported(format!("method={other}"))),
    };
    match result {
        Ok(v) => Response::ok(req.id, v),
        Err(e) => {
            warn!(conn = %session.conn_id, method = %req.method, "request failed: {e}");
            Response::err(req.id, &e)
        }
    }
}

/// Handshake: token check, protocol/capability negotiation. A session that
/// requests the streaming capability becomes a bridge and gets a warm-up.
fn hello(state: &AppState, session: &Arc<Session>, params: Value) -> Result<Value, RpcError> {
    let p: HelloParams = serde_json::from_value(params)?;
    if p.token.trim().is_empty() {
        return Err(RpcError::Unauthorized);
    }
    if let Some(expected) = state.auth_token.as_deref() {
        if p.token != expected {
            return Err(RpcError::Unauthorized);
        }
    }
    if p.protocol_version != PROTOCOL_VERSION {
        return Err(RpcError::NotSupported(format!(
            "protocol_version={}",
            p.protocol_version
        )));
    }
    let caps = p.capabilities.unwrap_or_default();
    let unsupported: Vec<&str> = caps
        .iter()
        .map(String::as_str)
        .filter(|c| !SUPPORTED_CAPABILITIES.contains(c))
        .collect();
    if !unsupported.is_empty() {
        return Err(RpcError::NotSupported(format!(
            "capabilities=[{}]",
            unsupported.join(",")
        )));
    }

    let session_id = Uuid::new_v4().to_string();
    let is_bridge = caps.iter().any(|c| c == STREAM_CAPABILITY);
    info!(
        conn = %session.conn_id,
        app = %p.app_version,
        bridge = is_bridge,
        session_id = %session_id,
        "hello ok"
    );

    if is_bridge {
        session.set_bridge();
        // A bridge handshake implies the client wants the stream; enable push
        // even if subscribe_metrics has not arrived yet.
        state.set_metrics_enabled(true);
        spawn_warmup(state, session);
    }

    Ok(json!({
        "server_version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "capabilities": SUPPORTED_CAPABILITIES,
        "session_id": session_id,
    }))
}

/// After a short settle delay, auto-start the default module set and emit one
/// priming notification so a fresh client sees data before the first full
/// interval elapses.
fn spawn_warmup(state: &AppState, session: &Arc<Session>) {
    let state = state.clone();
    let session_task = session.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let modules: Vec<String> = DEFAULT_MODULES.iter().map(|m| normalize_module(m)).collect();
        session_task.replace_modules(&modules);
        push::wait_unsuppressed(&session_task, 400).await;
        let _ = session_task.notify(
            "state",
            state_payload("start", None, Some(json!({ "modules": DEFAULT_MODULES }))),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        push::wait_unsuppressed(&session_task, 400).await;
        push::send_minimal_metrics(&state, &session_task);
        debug!(conn = %session_task.conn_id, "warm-up metrics sent after hello");
    });
    session.track(handle);
}

/// Point-in-time collection of the requested modules; failing collectors are
/// omitted rather than failing the request.
fn snapshot(state: &AppState, session: &Arc<Session>, params: Value) -> Result<Value, RpcError> {
    let p: SnapshotParams = serde_json::from_value(params)?;
    let want = want_set(p.modules.as_deref());
    let mut payload = Map::new();
    payload.insert("ts".into(), json!(now_ms()));
    for c in state.registry.iter() {
        if !want.contains(c.name()) {
            continue;
        }
        match c.collect() {
            Ok(v) => {
                payload.insert(c.name().into(), v);
            }
            Err(e) => debug!(module = c.name(), "snapshot collect failed (omitted): {e:#}"),
        }
    }
    debug!(conn = %session.conn_id, "snapshot served");
    Ok(Value::Object(payload))
}

fn start(session: &Arc<Session>, params: Value) -> Result<Value, RpcError> {
    let p: StartParams = serde_json::from_value(params)?;
    let requested = p
        .modules
        .unwrap_or_else(|| DEFAULT_MODULES.iter().map(|s| s.to_string()).collect());
    let normalized: Vec<String> = requested
        .iter()
        .map(|m| normalize_module(m))
        .filter(|m| !m.is_empty())
        .collect();
    session.replace_modules(&normalized);
    info!(conn = %session.conn_id, modules = ?normalized, "start");
    spawn_state_notify(
        session,
        50,
        "start",
        None,
        Some(json!({ "modules": requested })),
    );
    Ok(json!({ "ok": true, "started_modules": requested }))
}

fn stop(session: &Arc<Session>) -> Result<Value, RpcError> {
    session.clear_modules();
    info!(conn = %session.conn_id, "stop");
    spawn_state_notify(session, 50, "stop", None, None);
    Ok(json!({ "ok": true }))
}

fn subscribe_metrics(
    state: &AppState,
    session: &Arc<Session>,
    params: Value,
) -> Result<Value, RpcError> {
    let p: SubscribeMetricsParams = serde_json::from_value(params)?;
    state.set_metrics_enabled(p.enable);
    info!(conn = %session.conn_id, enable = p.enable, "subscribe_metrics");
    if p.enable && session.is_bridge() {
        session.track(push::spawn_priming(state, session, 300));
    }
    Ok(json!({ "ok": true, "enabled": p.enable }))
}

fn set_config(state: &AppState, session: &Arc<Session>, params: Value) -> Result<Value, RpcError> {
    let p: SetConfigParams = serde_json::from_value(params)?;

    // Validate everything before touching session state so a rejected call
    // leaves the configuration unchanged.
    let new_base = match p.base_interval_ms {
        Some(v) if v <= 0 => {
            return Err(RpcError::InvalidParams(
                "base_interval_ms must be positive".into(),
            ))
        }
        Some(v) => Some(v as u64),
        None => None,
    };
    let new_intervals = match &p.module_intervals {
        Some(map) => {
            let mut sanitized: HashMap<String, u64> = HashMap::new();
            for (name, v) in map {
                let name = normalize_module(name);
                if name.is_empty() {
                    continue;
                }
                if *v <= 0 {
                    return Err(RpcError::InvalidParams(format!(
                        "module_intervals[{name}] must be positive"
                    )));
                }
                sanitized.insert(name, *v as u64);
            }
            Some(sanitized)
        }
        None => None,
    };

    if let Some(base) = new_base {
        session.set_base_interval_ms(base);
    }
    if let Some(intervals) = new_intervals {
        session.set_module_intervals(intervals);
    }

    let view = session.config_view(now_ms());
    info!(
        conn = %session.conn_id,
        base_interval_ms = view.base_interval_ms,
        "set_config applied"
    );
    if session.is_bridge() {
        session.track(push::spawn_priming(state, session, 120));
    }
    Ok(json!({
        "ok": true,
        "base_interval_ms": view.base_interval_ms,
        "effective_intervals": view.module_intervals,
    }))
}

fn get_config(session: &Arc<Session>) -> Result<Value, RpcError> {
    let view = session.config_view(now_ms());
    Ok(json!({
        "ok": true,
        "base_interval_ms": view.base_interval_ms,
        "effective_intervals": view.module_intervals,
        "current_interval_ms": view.current_interval_ms,
        "burst_expires_at": view.burst_expires_at,
    }))
}

fn burst_subscribe(
    state: &AppState,
    session: &Arc<Session>,
    params: Value,
) -> Result<Value, RpcError> {
    let p: BurstParams = serde_json::from_value(params)?;
    if p.interval_ms <= 0 || p.ttl_ms <= 0 {
        return Err(RpcError::InvalidParams(
            "interval_ms>0 && ttl_ms>0 required".into(),
        ));
    }
    let now = now_ms();
    let expires_at = now.saturating_add(p.ttl_ms);
    session.set_burst(p.interval_ms as u64, expires_at);
    info!(
        conn = %session.conn_id,
        interval_ms = p.interval_ms,
        ttl_ms = p.ttl_ms,
        expires_at,
        "burst_subscribe"
    );
    spawn_state_notify(
        session,
        120,
        "burst",
        None,
        Some(json!({
            "interval_ms": p.interval_ms,
            "ttl_ms": p.ttl_ms,
            "expires_at": expires_at,
        })),
    );
    if session.is_bridge() {
        // Redundancy against push-loop jitter: an independent TTL-bounded
        // ticker at the requested cadence.
        session.track(push::spawn_burst_ticker(state, session, p.interval_ms, p.ttl_ms));
    }
    Ok(json!({ "ok": true, "expires_at": expires_at }))
}

async fn query_history(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let p: QueryHistoryParams = serde_json::from_value(params)?;
    let now = now_ms();
    let from = p.from_ts;
    let to = if p.to_ts <= 0 || p.to_ts < from {
        now
    } else {
        p.to_ts
    };
    let want = want_set(p.modules.as_deref());
    let agg = p
        .agg
        .as_deref()
        .filter(|a| !a.is_empty() && !a.eq_ignore_ascii_case("raw"))
        .map(str::to_string);

    // Durable store first, off the serving thread.
    let store = state.history.clone();
    let agg_for_query = agg.clone();
    let mut rows = tokio::task::spawn_blocking(move || match agg_for_query.as_deref() {
        Some(a) => store.query_agg(a, from, to),
        None => store.query_raw(from, to),
    })
    .await
    .map_err(|e| RpcError::Internal(e.to_string()))?;

    let mut from_ring = false;
    if rows.is_empty() {
        rows = state.history.ring_slice(from, to);
        from_ring = true;
    }

    // Aggregated durable rows are already bucket-keyed; everything else is
    // downsampled here (last value per bucket, keyed by bucket end).
    let bucket_ms = match (agg.as_deref(), p.step_ms) {
        (Some(a), step) => {
            let g = agg_bucket_ms(a).unwrap_or(60_000);
            if from_ring || step.is_some_and(|s| s > 0) {
                Some(g)
            } else {
                None
            }
        }
        (None, step) => step.filter(|s| *s > 0),
    };
    if let Some(b) = bucket_ms {
        rows = downsample(&rows, b);
    }

    let mut items: Vec<Value> = rows.iter().map(|r| history_item(r, &want)).collect();

    // Raw query with nothing in range: answer with one live sample instead of
    // an empty array. Aggregated queries keep their gaps.
    if items.is_empty() && agg.is_none() {
        let (cpu, mem) = sample_cpu_mem(&state.registry);
        let rec = HistoryRecord {
            ts: now_ms(),
            cpu,
            mem_total: mem.map(|m| m.0),
            mem_used: mem.map(|m| m.1),
        };
        items.push(history_item(&rec, &want));
    }
    Ok(json!({ "ok": true, "items": items }))
}

// ---------- helpers ----------

fn want_set(modules: Option<&[String]>) -> HashSet<String> {
    match modules {
        Some(list) if !list.is_empty() => list
            .iter()
            .map(|m| normalize_module(m))
            .filter(|m| !m.is_empty())
            .collect(),
        _ => HashSet::from(["cpu".to_string(), "memory".to_string()]),
    }
}

fn history_item(r: &HistoryRecord, want: &HashSet<String>) -> Value {
    let cpu = if want.contains("cpu") {
        r.cpu.map(|c| json!({ "usage_percent": c }))
    } else {
        None
    };
    let memory = if want.contains("memory") {
        match (r.mem_total, r.mem_used) {
            (Some(total), Some(used)) => Some(json!({ "total_mb": total, "used_mb": used })),
            _ => None,
        }
    } else {
        None
    };
    json!({ "ts": r.ts, "cpu": cpu, "memory": memory })
}

pub fn state_payload(phase: &str, reason: Option<&str>, extra: Option<Value>) -> Value {
    json!({
        "ts": now_ms(),
        "phase": phase,
        "reason": reason,
        "extra": extra,
    })
}

/// Emit a state notification shortly after the triggering response has gone
/// out, once any suppression window has cleared.
fn spawn_state_notify(
    session: &Arc<Session>,
    delay_ms: u64,
    phase: &'static str,
    reason: Option<&'static str>,
    extra: Option<Value>,
) {
    let session_task = session.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        push::wait_unsuppressed(&session_task, 400).await;
        let _ = session_task.notify("state", state_payload(phase, reason, extra));
    });
    session.track(handle);
}
