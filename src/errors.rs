use hyper::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Failures raised while normalizing a single client request.
///
/// Nothing here is retried internally; the forwarding layer decides whether
/// to try another upstream, fail the client request, or serve from cache.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("failed to decode JSON-RPC request: {0}")]
    Unmarshal(#[source] serde_json::Error),
    #[error("no method found in JSON-RPC request: {detail}")]
    UnresolvableMethod { detail: String },
    #[error("request `{field}` field is not a string")]
    NonStringField { field: &'static str },
    #[error("invalid block reference `{0}`")]
    InvalidBlockReference(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid JSON-RPC payload: {0}")]
    InvalidPayload(String),
    #[error("unknown network `{0}`")]
    UnknownNetwork(String),
    #[error("no upstreams available")]
    NoUpstreams,
    #[error("upstream request failed: {0}")]
    Upstream(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnknownNetwork(_) => StatusCode::NOT_FOUND,
            GatewayError::NoUpstreams => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let (code, message) = match self {
            GatewayError::InvalidPayload(msg) => (-32600, msg.clone()),
            GatewayError::UnknownNetwork(network) => {
                (-32601, format!("network `{network}` is not configured"))
            }
            GatewayError::NoUpstreams => (-32100, "no upstreams available".into()),
            GatewayError::Upstream(msg) => (-32001, msg.clone()),
        };

        ErrorBody { code, message }
    }
}
