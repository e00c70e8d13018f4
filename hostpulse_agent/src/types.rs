//! Wire format for the local RPC channel.
//! Keep this module minimal and stable; it defines the JSON contract.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// One client request frame.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// One response frame, correlated to a request by `id`.
#[derive(Debug, Serialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, e: &RpcError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: e.code().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// Out-of-band server-to-client frame (`metrics`, `state`, bridge lifecycle).
#[derive(Debug, Serialize)]
pub struct Notification<'a> {
    pub event: &'a str,
    pub data: Value,
}

// ---------- Operation parameters ----------

#[derive(Debug, Default, Deserialize)]
pub struct HelloParams {
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub protocol_version: i64,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotParams {
    #[serde(default)]
    pub modules: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartParams {
    #[serde(default)]
    pub modules: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeMetricsParams {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SetConfigParams {
    #[serde(default)]
    pub base_interval_ms: Option<i64>,
    #[serde(default)]
    pub module_intervals: Option<HashMap<String, i64>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BurstParams {
    #[serde(default)]
    pub interval_ms: i64,
    #[serde(default)]
    pub ttl_ms: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryHistoryParams {
    #[serde(default)]
    pub from_ts: i64,
    #[serde(default)]
    pub to_ts: i64,
    #[serde(default)]
    pub modules: Option<Vec<String>>,
    #[serde(default)]
    pub step_ms: Option<i64>,
    /// "raw" | "10s" | "1m"
    #[serde(default)]
    pub agg: Option<String>,
}
