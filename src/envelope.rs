use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::Rng;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request envelope.
///
/// Clients are sloppy about the envelope: the version tag and the id are
/// frequently omitted. [`JsonRpcRequest::apply_defaults`] fills both in so
/// that every request forwarded to an upstream is correlatable.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(default)]
    pub id: JsonRpcId,
}

/// The polymorphic JSON-RPC request identifier.
///
/// Ids transported as numbers commonly arrive as floating point because of
/// generic JSON decoding, so the numeric variant is a float and
/// [`JsonRpcId::canonical_string`] truncates it to a base-10 integer.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum JsonRpcId {
    #[default]
    Absent,
    Number(f64),
    Text(String),
}

impl JsonRpcId {
    pub fn is_absent(&self) -> bool {
        matches!(self, JsonRpcId::Absent)
    }

    /// Total conversion to the canonical string form used for request
    /// identity: text verbatim, numbers as truncated base-10 integers,
    /// absent as the empty string.
    pub fn canonical_string(&self) -> String {
        match self {
            JsonRpcId::Absent => String::new(),
            JsonRpcId::Number(num) => (num.trunc() as i64).to_string(),
            JsonRpcId::Text(text) => text.clone(),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::Null => JsonRpcId::Absent,
            Value::Number(num) => JsonRpcId::Number(num.as_f64().unwrap_or_default()),
            Value::String(text) => JsonRpcId::Text(text),
            // Non-standard id shapes (bools, arrays, objects) are kept as
            // their serialized text rather than rejected.
            other => JsonRpcId::Text(other.to_string()),
        })
    }
}

impl Serialize for JsonRpcId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            JsonRpcId::Absent => serializer.serialize_none(),
            JsonRpcId::Number(num) => {
                if num.fract() == 0.0 {
                    serializer.serialize_i64(num.trunc() as i64)
                } else {
                    serializer.serialize_f64(*num)
                }
            }
            JsonRpcId::Text(text) => serializer.serialize_str(text),
        }
    }
}

impl JsonRpcRequest {
    /// Fill in protocol defaults after a successful decode: the version tag
    /// becomes "2.0" and an absent id becomes a random non-negative integer
    /// bounded to the 32-bit signed range. Idempotent.
    pub fn apply_defaults(&mut self) {
        if self.jsonrpc.is_empty() {
            self.jsonrpc = JSONRPC_VERSION.to_string();
        }
        if self.id.is_absent() {
            self.id = JsonRpcId::Number(rand::thread_rng().gen_range(0..i32::MAX) as f64);
        }
    }

    /// Deterministic response-cache key over the method and the canonically
    /// serialized params. Two wire-distinct payloads encoding the same
    /// logical call (whitespace, key order) hash identically because object
    /// keys are sorted during serialization.
    pub fn cache_hash(&self) -> Result<String, serde_json::Error> {
        let params = serde_json::to_string(&self.params)?;
        let mut hasher = DefaultHasher::new();
        self.method.hash(&mut hasher);
        params.hash(&mut hasher);
        Ok(format!("{}:{:016x}", self.method, hasher.finish()))
    }
}
