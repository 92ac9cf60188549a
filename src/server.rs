use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use hyper::body::to_bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::signal;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::GatewayError;
use crate::forward;
use crate::registry::Registry;
use crate::request::NormalizedRequest;
use crate::response::NormalizedResponse;

const RPC_PREFIX: &str = "/rpc/";
const HEALTH_PATH: &str = "/healthz";

pub(crate) struct AppState {
    pub(crate) config: Config,
    pub(crate) registry: Registry,
    pub(crate) client: Client,
}

pub async fn start_server(config: Config, registry: Registry, client: Client) -> Result<()> {
    let listen_addr = config.listen_addr;
    let state = Arc::new(AppState {
        config,
        registry,
        client,
    });

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(req, state).await) }
            }))
        }
    });

    let server = Server::bind(&listen_addr).serve(make_svc);

    tracing::info!(%listen_addr, "rpcgate listening");

    server
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Into::into)
}

async fn route(req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, path) if path.starts_with(RPC_PREFIX) => {
            match handle_rpc(req, state).await {
                Ok(response) => response,
                Err((err, id)) => error_response(err, &id),
            }
        }
        (&Method::GET, HEALTH_PATH) => respond_with_json(StatusCode::OK, json!({"status": "ok"})),
        _ => not_found(),
    }
}

async fn handle_rpc(
    req: Request<Body>,
    state: Arc<AppState>,
) -> Result<Response<Body>, (GatewayError, String)> {
    let network_id = req
        .uri()
        .path()
        .strip_prefix(RPC_PREFIX)
        .unwrap_or_default()
        .trim_matches('/')
        .to_string();

    let correlation_id = Uuid::new_v4();
    let span = tracing::info_span!("rpc", %correlation_id, network = %network_id);
    let _guard = span.enter();

    let (parts, body) = req.into_parts();

    let content_length = parts
        .headers
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if let Some(len) = content_length {
        if len > state.config.max_payload_bytes {
            return Err((
                GatewayError::InvalidPayload(format!(
                    "payload exceeds {} bytes",
                    state.config.max_payload_bytes
                )),
                String::new(),
            ));
        }
    }

    let body: Bytes = to_bytes(body).await.map_err(|err| {
        (
            GatewayError::InvalidPayload(format!("failed to read request body: {err}")),
            String::new(),
        )
    })?;
    if body.len() > state.config.max_payload_bytes {
        return Err((
            GatewayError::InvalidPayload(format!(
                "payload exceeds {} bytes",
                state.config.max_payload_bytes
            )),
            String::new(),
        ));
    }

    let request = NormalizedRequest::new(body);
    request.apply_directives_from_headers(&parts.headers);
    let request_id = request.id();

    let network = state
        .registry
        .network(&network_id)
        .ok_or_else(|| (GatewayError::UnknownNetwork(network_id.clone()), request_id.clone()))?;
    request.set_network(network.clone());

    let method = request
        .method()
        .map_err(|err| (GatewayError::InvalidPayload(err.to_string()), request_id.clone()))?;

    let payload = request
        .to_transport_bytes()
        .map_err(|err| (GatewayError::InvalidPayload(err.to_string()), request_id.clone()))?;

    let upstreams = network.upstreams();
    let mut last_error = None;

    for (index, upstream) in upstreams.iter().enumerate() {
        let remaining = upstreams.len() - index - 1;
        let attempt = request.mark_attempt();
        request.set_last_upstream(upstream.clone());

        match forward::send_request(&state.client, upstream, payload.clone()).await {
            Ok(upstream_response) => {
                let status = upstream_response.status();

                if !status.is_success() {
                    tracing::warn!(
                        upstream = upstream.id,
                        %status,
                        attempt,
                        "upstream returned failure status"
                    );
                    last_error = Some(format!("{} responded {}", upstream.id, status));
                    if forward::is_retryable_status(status) && remaining > 0 {
                        continue;
                    }
                    let body = upstream_response.bytes().await.map_err(|err| {
                        (
                            GatewayError::Upstream(format!("failed to read upstream body: {err}")),
                            request_id.clone(),
                        )
                    })?;
                    return Ok(build_upstream_response(status, &upstream.id, body));
                }

                let body = upstream_response.bytes().await.map_err(|err| {
                    (
                        GatewayError::Upstream(format!("failed to read upstream body: {err}")),
                        request_id.clone(),
                    )
                })?;
                let response = Arc::new(NormalizedResponse::new(body));

                if response.is_result_empty() && request.directives().retry_empty && remaining > 0 {
                    tracing::debug!(
                        upstream = upstream.id,
                        method,
                        attempt,
                        "empty result, retrying on next upstream"
                    );
                    last_error = Some(format!("{} returned an empty result", upstream.id));
                    continue;
                }

                request.set_last_valid_response(response.clone());

                tracing::info!(
                    upstream = upstream.id,
                    method,
                    request_id,
                    attempt,
                    "request served"
                );
                return Ok(build_upstream_response(
                    StatusCode::OK,
                    &upstream.id,
                    response.body().clone(),
                ));
            }
            Err(err) => {
                tracing::warn!(
                    upstream = upstream.id,
                    attempt,
                    error = ?err,
                    "upstream transport error"
                );
                last_error = Some(format!("{} transport error: {err}", upstream.id));
            }
        }
    }

    tracing::error!(attempts = request.attempts(), request = %request, "request failed after retries");
    let err = match last_error {
        Some(message) => GatewayError::Upstream(message),
        None => GatewayError::NoUpstreams,
    };
    Err((err, request_id))
}

fn build_upstream_response(status: StatusCode, upstream_id: &str, body: Bytes) -> Response<Body> {
    let mut response = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(Body::from(body))
        .expect("failed to build upstream response");

    response.headers_mut().insert(
        HeaderName::from_static("x-rpcgate-upstream"),
        HeaderValue::from_str(upstream_id).unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    );

    response
}

fn error_response(err: GatewayError, id: &str) -> Response<Body> {
    let body = err.to_body();
    let payload = json!({
        "jsonrpc": "2.0",
        "error": {
            "code": body.code,
            "message": body.message,
        },
        "id": id_value(id),
    });

    Response::builder()
        .status(err.status_code())
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

// Echo numeric ids back as numbers; everything else as a string.
fn id_value(id: &str) -> Value {
    if id.is_empty() {
        return Value::Null;
    }
    match id.parse::<i64>() {
        Ok(num) => Value::from(num),
        Err(_) => Value::from(id),
    }
}

fn respond_with_json(status: StatusCode, payload: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn not_found() -> Response<Body> {
    respond_with_json(
        StatusCode::NOT_FOUND,
        json!({
            "error": {
                "message": "not found"
            }
        }),
    )
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
