use serde_json::Value;

use crate::envelope::JsonRpcRequest;
use crate::errors::RequestError;

/// Statically extract the block height a request pertains to from its
/// parameters, per method-specific positional rules. Returns 0 when the
/// request carries a symbolic tag ("latest", "pending", ...) or no block
/// reference at all; callers treat 0 as "not statically resolvable" and
/// fall back to observed chain state.
pub fn block_number_from_request(request: &JsonRpcRequest) -> Result<i64, RequestError> {
    match request.method.as_str() {
        "eth_getBlockByNumber"
        | "eth_getBlockTransactionCountByNumber"
        | "eth_getUncleCountByBlockNumber" => number_from_param(request, 0),
        "eth_getBalance" | "eth_getCode" | "eth_getTransactionCount" | "eth_call"
        | "eth_estimateGas" | "eth_feeHistory" => number_from_param(request, 1),
        "eth_getStorageAt" => number_from_param(request, 2),
        "eth_getLogs" => number_from_log_filter(request),
        _ => Ok(0),
    }
}

fn number_from_param(request: &JsonRpcRequest, position: usize) -> Result<i64, RequestError> {
    match request.params.as_array().and_then(|params| params.get(position)) {
        Some(value) => number_from_value(value),
        None => Ok(0),
    }
}

fn number_from_log_filter(request: &JsonRpcRequest) -> Result<i64, RequestError> {
    let filter = match request.params.as_array().and_then(|params| params.first()) {
        Some(Value::Object(filter)) => filter,
        _ => return Ok(0),
    };
    // The upper bound decides freshness; fall back to the lower bound for
    // single-ended filters.
    match filter.get("toBlock").or_else(|| filter.get("fromBlock")) {
        Some(value) => number_from_value(value),
        None => Ok(0),
    }
}

fn number_from_value(value: &Value) -> Result<i64, RequestError> {
    match value {
        Value::String(text) => number_from_text(text),
        Value::Number(num) => num
            .as_i64()
            .ok_or_else(|| RequestError::InvalidBlockReference(num.to_string())),
        // EIP-1898 object form; the blockHash variant carries no height.
        Value::Object(fields) => match fields.get("blockNumber") {
            Some(Value::String(text)) => number_from_text(text),
            _ => Ok(0),
        },
        Value::Null => Ok(0),
        other => Err(RequestError::InvalidBlockReference(other.to_string())),
    }
}

fn number_from_text(text: &str) -> Result<i64, RequestError> {
    match text {
        "latest" | "pending" | "earliest" | "safe" | "finalized" => Ok(0),
        hex if hex.starts_with("0x") => i64::from_str_radix(&hex[2..], 16)
            .map_err(|_| RequestError::InvalidBlockReference(text.to_string())),
        _ => Err(RequestError::InvalidBlockReference(text.to_string())),
    }
}
