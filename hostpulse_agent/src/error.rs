//! RPC error taxonomy. Only handshake/config validation surfaces to callers;
//! collector and persistence failures are handled where they occur.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("not_supported: {0}")]
    NotSupported(String),
    #[error("invalid_params: {0}")]
    InvalidParams(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::NotSupported(_) => "not_supported",
            Self::InvalidParams(_) => "invalid_params",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidParams(e.to_string())
    }
}
