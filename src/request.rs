use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use hyper::HeaderMap;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::envelope::JsonRpcRequest;
use crate::errors::RequestError;
use crate::evm;
use crate::registry::Upstream;
use crate::response::NormalizedResponse;

/// Header clients use to opt out of retrying empty upstream results.
const RETRY_EMPTY_HEADER: &str = "x-erpc-retry-empty";

/// Sentinel memoized when a probed field exists but cannot be read.
const NOT_AVAILABLE: &str = "n/a";

/// The chain/network a request targets. Consumed, never owned: the request
/// core holds a shared handle whose lifetime belongs to the registry.
pub trait Network: Send + Sync {
    fn id(&self) -> &str;
}

/// Per-request behavioral flags derived from transport metadata.
///
/// Replaced wholesale when re-derived, never field-mutated, so readers
/// under the lock always observe a complete directive set.
#[derive(Clone, Copy, Debug)]
pub struct RequestDirectives {
    pub retry_empty: bool,
}

impl Default for RequestDirectives {
    fn default() -> Self {
        Self { retry_empty: true }
    }
}

/// Structural identity of a request (method plus serialized params), usable
/// by outer layers to coalesce identical in-flight requests.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UniqueRequestKey {
    pub method: String,
    pub params: String,
}

impl UniqueRequestKey {
    pub fn from_request(request: &NormalizedRequest) -> Result<Self, RequestError> {
        let envelope = request.json_rpc_request()?;
        let params = serde_json::to_string(&envelope.params).map_err(RequestError::Unmarshal)?;
        Ok(Self {
            method: envelope.method,
            params,
        })
    }
}

/// Canonical, reusable representation of one inbound JSON-RPC request.
///
/// Created once per client request and shared by every pipeline stage for
/// the lifetime of that request, including all retries and fan-out across
/// upstreams. Identity, method, the parsed envelope, and the cache key are
/// derived lazily and memoized; a single mutex serializes every memoized
/// field together with the failover pointers, so concurrent attempt workers
/// never observe a torn envelope or lose a bookkeeping update. The raw body
/// is immutable and read without synchronization.
pub struct NormalizedRequest {
    body: Bytes,
    attempt: AtomicU32,
    network: OnceCell<Arc<dyn Network>>,
    state: Mutex<RequestState>,
}

#[derive(Default)]
struct RequestState {
    uid: Option<String>,
    method: Option<String>,
    envelope: Option<JsonRpcRequest>,
    directives: RequestDirectives,
    last_upstream: Option<Arc<Upstream>>,
    last_valid_response: Option<Arc<NormalizedResponse>>,
}

impl NormalizedRequest {
    pub fn new(body: Bytes) -> Self {
        Self {
            body,
            attempt: AtomicU32::new(0),
            network: OnceCell::new(),
            state: Mutex::new(RequestState::default()),
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Number of delivery attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }

    /// Record one more delivery attempt, returning the new count.
    pub fn mark_attempt(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Attach the network this request targets. Internally synthesized
    /// requests are built before network context exists; the first
    /// attachment wins and later calls are ignored.
    pub fn set_network(&self, network: Arc<dyn Network>) {
        let _ = self.network.set(network);
    }

    pub fn network_id(&self) -> &str {
        match self.network.get() {
            Some(network) => network.id(),
            None => NOT_AVAILABLE,
        }
    }

    /// Stable string identifier for this request, computed at most once.
    ///
    /// Resolution order: memoized value, then the parsed envelope's id in
    /// canonical string form, then a cheap probe of the raw payload that
    /// never triggers a full envelope parse. An empty string means no
    /// stable id is available; that is a signal, not an error.
    pub fn id(&self) -> String {
        let mut state = self.lock_state();

        if let Some(uid) = &state.uid {
            return uid.clone();
        }

        if let Some(envelope) = &state.envelope {
            let uid = envelope.id.canonical_string();
            state.uid = Some(uid.clone());
            return uid;
        }

        if !self.body.is_empty() {
            if let Some(id) = probe_id(&self.body) {
                state.uid = Some(id.clone());
                return id;
            }
        }

        String::new()
    }

    /// The parsed, defaulted envelope. This is the single authoritative
    /// parse; once it succeeds every structured accessor routes through the
    /// memoized result.
    pub fn json_rpc_request(&self) -> Result<JsonRpcRequest, RequestError> {
        let mut state = self.lock_state();
        self.envelope_locked(&mut state).map(Clone::clone)
    }

    /// The JSON-RPC method name, memoized.
    ///
    /// Resolution order: memoized value, then the parsed envelope, then a
    /// raw-payload probe. A probe that finds a method field it cannot read
    /// as a string memoizes the "n/a" sentinel before surfacing the error,
    /// so repeated calls do not repeat the failed parse.
    pub fn method(&self) -> Result<String, RequestError> {
        let mut state = self.lock_state();

        if let Some(method) = &state.method {
            return Ok(method.clone());
        }

        if let Some(envelope) = &state.envelope {
            let method = envelope.method.clone();
            state.method = Some(method.clone());
            return Ok(method);
        }

        if self.body.is_empty() {
            return Err(RequestError::UnresolvableMethod {
                detail: "empty request body".into(),
            });
        }

        match probe_method(&self.body) {
            Ok(Some(method)) => {
                state.method = Some(method.clone());
                Ok(method)
            }
            Ok(None) => Err(RequestError::UnresolvableMethod {
                detail: String::from_utf8_lossy(&self.body).into_owned(),
            }),
            Err(err) => {
                state.method = Some(NOT_AVAILABLE.to_string());
                Err(err)
            }
        }
    }

    /// Derive and atomically install directives from the request headers,
    /// replacing the previous set wholesale. Only the exact literal "false"
    /// disables retry-on-empty; anything else, including absence, keeps the
    /// default.
    pub fn apply_directives_from_headers(&self, headers: &HeaderMap) {
        let retry_empty = headers
            .get(RETRY_EMPTY_HEADER)
            .and_then(|value| value.to_str().ok())
            != Some("false");
        let directives = RequestDirectives { retry_empty };

        let mut state = self.lock_state();
        state.directives = directives;
    }

    pub fn directives(&self) -> RequestDirectives {
        self.lock_state().directives
    }

    pub fn set_last_upstream(&self, upstream: Arc<Upstream>) {
        let mut state = self.lock_state();
        state.last_upstream = Some(upstream);
    }

    pub fn last_upstream(&self) -> Option<Arc<Upstream>> {
        self.lock_state().last_upstream.clone()
    }

    pub fn set_last_valid_response(&self, response: Arc<NormalizedResponse>) {
        let mut state = self.lock_state();
        state.last_valid_response = Some(response);
    }

    pub fn last_valid_response(&self) -> Option<Arc<NormalizedResponse>> {
        self.lock_state().last_valid_response.clone()
    }

    /// Deterministic response-cache key, delegated to the parsed envelope's
    /// canonicalization rule. The raw payload is never hashed directly:
    /// wire-distinct encodings of the same logical call must collide.
    pub fn cache_hash(&self) -> Result<String, RequestError> {
        let envelope = self.json_rpc_request()?;
        envelope.cache_hash().map_err(RequestError::Unmarshal)
    }

    /// The block height this request logically pertains to.
    ///
    /// Fallback chain, in contract order: static extraction from the
    /// parameters (a positive height is definitive), then the last valid
    /// response's observed height, then 0 meaning "unknown, but not a
    /// failure". Height-less methods like eth_chainId inherit whatever
    /// height was last trusted on this request's retry chain.
    pub fn evm_block_number(&self) -> Result<i64, RequestError> {
        let envelope = self.json_rpc_request()?;

        let number = evm::block_number_from_request(&envelope)?;
        if number > 0 {
            return Ok(number);
        }

        match self.last_valid_response() {
            None => Ok(0),
            Some(response) => response.evm_block_number(),
        }
    }

    /// Serialize for transport or logging. Raw-body fidelity takes
    /// precedence so that forwarded requests keep client-supplied field
    /// ordering and extra fields; then the parsed envelope, then a minimal
    /// method-only object, then JSON null.
    pub fn to_transport_bytes(&self) -> Result<Bytes, RequestError> {
        if !self.body.is_empty() {
            return Ok(self.body.clone());
        }

        {
            let state = self.lock_state();
            if let Some(envelope) = &state.envelope {
                return serde_json::to_vec(envelope)
                    .map(Bytes::from)
                    .map_err(RequestError::Unmarshal);
            }
        }

        if let Ok(method) = self.method() {
            if !method.is_empty() {
                return serde_json::to_vec(&json!({ "method": method }))
                    .map(Bytes::from)
                    .map_err(RequestError::Unmarshal);
            }
        }

        Ok(Bytes::from_static(b"null"))
    }

    fn lock_state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().expect("request state lock poisoned")
    }

    fn envelope_locked<'a>(
        &self,
        state: &'a mut RequestState,
    ) -> Result<&'a JsonRpcRequest, RequestError> {
        if state.envelope.is_none() {
            let mut envelope: JsonRpcRequest =
                serde_json::from_slice(&self.body).map_err(RequestError::Unmarshal)?;

            if envelope.method.is_empty() {
                return Err(RequestError::UnresolvableMethod {
                    detail: format!("{envelope:?}"),
                });
            }

            envelope.apply_defaults();
            state.envelope = Some(envelope);
        }
        Ok(state.envelope.as_ref().expect("envelope just memoized"))
    }
}

/// The raw body is the loggable representation; log sinks receive it as-is
/// without formatting or filtering.
impl fmt::Display for NormalizedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.body))
    }
}

#[derive(Deserialize)]
struct IdProbe {
    #[serde(default)]
    id: crate::envelope::JsonRpcId,
}

/// Targeted lookup of the `id` field in canonical string form, without
/// materializing the rest of the document.
fn probe_id(body: &[u8]) -> Option<String> {
    let probe: IdProbe = serde_json::from_slice(body).ok()?;
    if probe.id.is_absent() {
        return None;
    }
    Some(probe.id.canonical_string())
}

#[derive(Deserialize)]
struct MethodProbe {
    #[serde(default)]
    method: Option<Value>,
}

fn probe_method(body: &[u8]) -> Result<Option<String>, RequestError> {
    let probe: MethodProbe =
        serde_json::from_slice(body).map_err(RequestError::Unmarshal)?;
    match probe.method {
        Some(Value::String(method)) => Ok(Some(method)),
        Some(_) => Err(RequestError::NonStringField { field: "method" }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn request(raw: &str) -> NormalizedRequest {
        NormalizedRequest::new(Bytes::copy_from_slice(raw.as_bytes()))
    }

    fn upstream(id: &str) -> Arc<Upstream> {
        Arc::new(Upstream {
            id: id.into(),
            endpoint: format!("http://{id}.invalid"),
            headers: None,
        })
    }

    struct TestNetwork(&'static str);

    impl Network for TestNetwork {
        fn id(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn id_from_numeric_payload_is_memoized() {
        let req = request(r#"{"jsonrpc":"2.0","id":42,"method":"eth_chainId"}"#);
        let first = req.id();
        assert_eq!(first, "42");
        assert_eq!(req.id(), first);

        // The probe path must not have triggered a full parse.
        assert!(req.lock_state().envelope.is_none());
    }

    #[test]
    fn id_from_string_payload() {
        let req = request(r#"{"id":"req-7","method":"eth_chainId"}"#);
        assert_eq!(req.id(), "req-7");
    }

    #[test]
    fn id_unresolvable_is_empty_string() {
        let req = request(r#"{"method":"eth_chainId"}"#);
        assert_eq!(req.id(), "");
        assert_eq!(request("").id(), "");
    }

    #[test]
    fn id_prefers_parsed_envelope() {
        let req = request(r#"{"id":7.9,"method":"eth_chainId"}"#);
        req.json_rpc_request().unwrap();
        assert_eq!(req.id(), "7");
    }

    #[test]
    fn generated_id_is_stable_across_accesses() {
        let req = request(r#"{"method":"eth_chainId","params":[]}"#);
        let first = req.json_rpc_request().unwrap();
        let second = req.json_rpc_request().unwrap();
        assert!(!first.id.is_absent());
        assert_eq!(first.id, second.id);
        assert_eq!(req.id(), first.id.canonical_string());
    }

    #[test]
    fn version_defaults_to_2_0() {
        let req = request(r#"{"id":1,"method":"eth_chainId"}"#);
        assert_eq!(req.json_rpc_request().unwrap().jsonrpc, "2.0");

        let req = request(r#"{"jsonrpc":"1.0","id":1,"method":"eth_chainId"}"#);
        assert_eq!(req.json_rpc_request().unwrap().jsonrpc, "1.0");
    }

    #[test]
    fn method_resolves_and_memoizes() {
        let req = request(r#"{"method":"eth_call","params":[{"to":"0x1"}]}"#);
        assert_eq!(req.method().unwrap(), "eth_call");
        assert_eq!(req.method().unwrap(), "eth_call");
    }

    #[test]
    fn missing_method_is_unresolvable() {
        let req = request(r#"{"params":[]}"#);
        assert!(matches!(
            req.method(),
            Err(RequestError::UnresolvableMethod { .. })
        ));
        assert!(matches!(
            req.json_rpc_request(),
            Err(RequestError::UnresolvableMethod { .. })
        ));
    }

    #[test]
    fn non_string_method_memoizes_sentinel() {
        let req = request(r#"{"method":123,"params":[]}"#);
        assert!(matches!(
            req.method(),
            Err(RequestError::NonStringField { field: "method" })
        ));
        // Second call hits the memoized sentinel instead of re-probing.
        assert_eq!(req.method().unwrap(), "n/a");
    }

    #[test]
    fn malformed_payload_is_unmarshal_error() {
        let req = request("{not json");
        assert!(matches!(
            req.json_rpc_request(),
            Err(RequestError::Unmarshal(_))
        ));
    }

    #[test]
    fn directives_default_and_header_override() {
        let req = request(r#"{"id":1,"method":"eth_chainId"}"#);
        assert!(req.directives().retry_empty);

        let mut headers = HeaderMap::new();
        headers.insert("X-ERPC-Retry-Empty", "false".parse().unwrap());
        req.apply_directives_from_headers(&headers);
        assert!(!req.directives().retry_empty);

        // Any other literal keeps retries enabled.
        let mut headers = HeaderMap::new();
        headers.insert("X-ERPC-Retry-Empty", "0".parse().unwrap());
        req.apply_directives_from_headers(&headers);
        assert!(req.directives().retry_empty);

        req.apply_directives_from_headers(&HeaderMap::new());
        assert!(req.directives().retry_empty);
    }

    #[test]
    fn cache_hash_matches_envelope_rule() {
        let one = request(r#"{"id":1,"method":"eth_call","params":[{"to":"0x1","data":"0x2"}]}"#);
        let two = request(r#"{"id":2,"method":"eth_call","params":[{"data":"0x2","to":"0x1"}]}"#);
        assert_eq!(one.cache_hash().unwrap(), two.cache_hash().unwrap());

        assert!(request("{broken").cache_hash().is_err());
    }

    #[test]
    fn block_number_static_extraction_wins() {
        let req = request(r#"{"id":1,"method":"eth_getBalance","params":["0xabc","0x1b4"]}"#);
        assert_eq!(req.evm_block_number().unwrap(), 0x1b4);
    }

    #[test]
    fn block_number_falls_back_to_last_valid_response() {
        let req = request(r#"{"id":1,"method":"eth_chainId","params":[]}"#);
        assert_eq!(req.evm_block_number().unwrap(), 0);

        let response = NormalizedResponse::new(Bytes::from_static(
            br#"{"jsonrpc":"2.0","id":1,"result":"0x2a"}"#,
        ));
        req.set_last_valid_response(Arc::new(response));
        assert_eq!(req.evm_block_number().unwrap(), 0x2a);
    }

    #[test]
    fn failover_bookkeeping_is_latest_wins() {
        let req = request(r#"{"id":1,"method":"eth_chainId"}"#);
        assert!(req.last_upstream().is_none());
        assert!(req.last_valid_response().is_none());

        req.set_last_upstream(upstream("a"));
        req.set_last_upstream(upstream("b"));
        assert_eq!(req.last_upstream().unwrap().id, "b");
    }

    #[test]
    fn network_attachment_is_first_wins() {
        let req = request(r#"{"id":1,"method":"eth_chainId"}"#);
        assert_eq!(req.network_id(), "n/a");

        req.set_network(Arc::new(TestNetwork("evm-mainnet")));
        req.set_network(Arc::new(TestNetwork("evm-goerli")));
        assert_eq!(req.network_id(), "evm-mainnet");
    }

    #[test]
    fn attempt_counter() {
        let req = request(r#"{"id":1,"method":"eth_chainId"}"#);
        assert_eq!(req.attempts(), 0);
        assert_eq!(req.mark_attempt(), 1);
        assert_eq!(req.mark_attempt(), 2);
        assert_eq!(req.attempts(), 2);
    }

    #[test]
    fn transport_bytes_prefer_raw_body() {
        let raw = r#"{"id":1,"method":"eth_chainId","extra":true}"#;
        let req = request(raw);
        req.json_rpc_request().unwrap();
        // Raw body wins even after a parse, preserving extra fields.
        assert_eq!(req.to_transport_bytes().unwrap(), Bytes::from(raw));

        assert_eq!(
            request("").to_transport_bytes().unwrap(),
            Bytes::from_static(b"null")
        );
    }

    #[test]
    fn unique_request_key_is_structural() {
        let one = request(r#"{"id":1,"method":"eth_getBalance","params":["0x1","latest"]}"#);
        let two = request(r#"{"id":2,"method":"eth_getBalance","params":["0x1","latest"]}"#);
        assert_eq!(
            UniqueRequestKey::from_request(&one).unwrap(),
            UniqueRequestKey::from_request(&two).unwrap()
        );
    }

    #[test]
    fn concurrent_access_keeps_state_consistent() {
        let req = Arc::new(request(r#"{"jsonrpc":"2.0","id":99,"method":"eth_chainId"}"#));
        let upstream_count = 8;

        let mut handles = Vec::new();
        for n in 0..upstream_count {
            let req = req.clone();
            handles.push(thread::spawn(move || {
                req.set_last_upstream(upstream(&format!("up-{n}")));
                req.mark_attempt();
            }));
        }
        for _ in 0..4 {
            let req = req.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    assert_eq!(req.id(), "99");
                    assert_eq!(req.method().unwrap(), "eth_chainId");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // The winner is exactly one of the written handles, uncorrupted.
        let last = req.last_upstream().unwrap();
        assert!(last.id.starts_with("up-"));
        let n: u32 = last.id.trim_start_matches("up-").parse().unwrap();
        assert!(n < upstream_count);
        assert_eq!(req.attempts(), upstream_count);
    }
}
