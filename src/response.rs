use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::JsonRpcId;
use crate::errors::RequestError;

/// A JSON-RPC 2.0 response envelope.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: JsonRpcId,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Canonical in-memory representation of an upstream response.
///
/// Like the request side, the raw body is kept verbatim for forwarding and
/// the envelope is parsed lazily behind a lock, at most once.
pub struct NormalizedResponse {
    body: Bytes,
    state: Mutex<ResponseState>,
}

#[derive(Default)]
struct ResponseState {
    envelope: Option<JsonRpcResponse>,
    block_number: Option<i64>,
}

impl NormalizedResponse {
    pub fn new(body: Bytes) -> Self {
        Self {
            body,
            state: Mutex::new(ResponseState::default()),
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn json_rpc_response(&self) -> Result<JsonRpcResponse, RequestError> {
        let mut state = self.lock_state();
        self.envelope_locked(&mut state).map(Clone::clone)
    }

    /// Whether the upstream answered without a usable result: an error-free
    /// envelope whose result is null, "", "0x", [] or {}, or a body that is
    /// not a JSON-RPC response at all. Used by the retry-on-empty directive
    /// to decide whether another upstream deserves a shot.
    pub fn is_result_empty(&self) -> bool {
        let mut state = self.lock_state();
        let envelope = match self.envelope_locked(&mut state) {
            Ok(envelope) => envelope,
            Err(_) => return true,
        };
        if envelope.error.is_some() {
            return false;
        }
        match &envelope.result {
            Value::Null => true,
            Value::String(text) => text.is_empty() || text == "0x",
            Value::Array(items) => items.is_empty(),
            Value::Object(fields) => fields.is_empty(),
            _ => false,
        }
    }

    /// The block height this response reports, memoized. Understood shapes:
    /// a hex string result (eth_blockNumber) or a block object carrying a
    /// hex `number` field. Anything else is height 0.
    pub fn evm_block_number(&self) -> Result<i64, RequestError> {
        let mut state = self.lock_state();
        if let Some(number) = state.block_number {
            return Ok(number);
        }

        let envelope = self.envelope_locked(&mut state)?;
        let number = match &envelope.result {
            Value::String(text) => parse_hex_height(text)?,
            Value::Object(fields) => match fields.get("number") {
                Some(Value::String(text)) => parse_hex_height(text)?,
                _ => 0,
            },
            _ => 0,
        };

        state.block_number = Some(number);
        Ok(number)
    }

    fn lock_state(&self) -> MutexGuard<'_, ResponseState> {
        self.state.lock().expect("response state lock poisoned")
    }

    fn envelope_locked<'a>(
        &self,
        state: &'a mut ResponseState,
    ) -> Result<&'a JsonRpcResponse, RequestError> {
        if state.envelope.is_none() {
            let envelope: JsonRpcResponse =
                serde_json::from_slice(&self.body).map_err(RequestError::Unmarshal)?;
            state.envelope = Some(envelope);
        }
        Ok(state.envelope.as_ref().expect("envelope just memoized"))
    }
}

fn parse_hex_height(text: &str) -> Result<i64, RequestError> {
    if let Some(hex) = text.strip_prefix("0x") {
        i64::from_str_radix(hex, 16)
            .map_err(|_| RequestError::InvalidBlockReference(text.to_string()))
    } else {
        Ok(0)
    }
}
