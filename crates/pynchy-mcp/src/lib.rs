//! MCP reverse proxy — every tool call the agent makes is interposed here
//! so the security gate and untrusted-content fencing apply without
//! trusting the agent.
//!
//! Path-based routing on a single localhost port:
//! `POST /mcp/{workspace}/{invocation_ts}/{instance_id}`. The gate for
//! `(workspace, invocation_ts)` must exist (403 otherwise); the instance
//! id resolves to a backend URL through a runtime-updatable route map.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use pynchy_core::trust::ServiceTrust;
use pynchy_security::cop::Cop;
use pynchy_security::fencing::{fence_untrusted_content, BLOCKED_PLACEHOLDER};
use pynchy_security::gate::GateRegistry;
use serde_json::Value;
use tracing::{error, info, warn};

/// Instance routing and trust, swapped in place by `update_routes` so
/// in-flight requests observe updates without a restart.
#[derive(Default)]
struct RouteMap {
    instance_urls: HashMap<String, String>,
    trust_map: HashMap<String, ServiceTrust>,
}

pub struct ProxyState {
    routes: RwLock<RouteMap>,
    gates: Arc<GateRegistry>,
    cop: Arc<dyn Cop>,
    client: reqwest::Client,
}

/// The proxy server handle. Bound to an OS-assigned localhost port.
pub struct McpProxy {
    state: Arc<ProxyState>,
    port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl McpProxy {
    /// Start on `127.0.0.1:port` (0 = OS-assigned). Returns once bound.
    pub async fn start(
        gates: Arc<GateRegistry>,
        cop: Arc<dyn Cop>,
        port: u16,
    ) -> pynchy_core::Result<Self> {
        let state = Arc::new(ProxyState {
            routes: RwLock::new(RouteMap::default()),
            gates,
            cop,
            client: reqwest::Client::new(),
        });

        let router = Router::new()
            .route("/mcp/{workspace}/{invocation_ts}/{instance_id}", any(proxy_handler))
            .route(
                "/mcp/{workspace}/{invocation_ts}/{instance_id}/{*tail}",
                any(proxy_handler_tail),
            )
            .with_state(Arc::clone(&state));

        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().map_err(|e| {
            pynchy_core::PynchyError::Internal(format!("bad proxy addr: {e}"))
        })?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(pynchy_core::PynchyError::Io)?;
        let bound_port = listener
            .local_addr()
            .map_err(pynchy_core::PynchyError::Io)?
            .port();

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "MCP proxy server exited");
            }
        });

        info!(port = bound_port, "MCP proxy started");
        Ok(Self {
            state,
            port: bound_port,
            server,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// URL template injected into container MCP client config.
    pub fn url_for(&self, workspace: &str, invocation_ts: i64, instance_id: &str) -> String {
        format!(
            "http://host.docker.internal:{}/mcp/{workspace}/{invocation_ts}/{instance_id}",
            self.port
        )
    }

    /// Replace the instance→backend map and trust table in place.
    pub fn update_routes(
        &self,
        instance_urls: HashMap<String, String>,
        trust_map: HashMap<String, ServiceTrust>,
    ) {
        let mut routes = self.state.routes.write().unwrap();
        routes.instance_urls = instance_urls;
        routes.trust_map = trust_map;
    }

    pub fn stop(self) {
        self.server.abort();
        info!("MCP proxy stopped");
    }
}

async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    Path((workspace, invocation_ts, instance_id)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, workspace, invocation_ts, instance_id, String::new(), method, headers, body).await
}

async fn proxy_handler_tail(
    State(state): State<Arc<ProxyState>>,
    Path((workspace, invocation_ts, instance_id, tail)): Path<(String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let tail = format!("/{tail}");
    handle(state, workspace, invocation_ts, instance_id, tail, method, headers, body).await
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
}

/// Headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &["host", "content-length", "transfer-encoding", "connection"];

#[allow(clippy::too_many_arguments)]
async fn handle(
    state: Arc<ProxyState>,
    workspace: String,
    invocation_ts: String,
    instance_id: String,
    tail: String,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(invocation_ts) = invocation_ts.parse::<i64>() else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid invocation_ts");
    };

    let (backend_url, trust) = {
        let routes = state.routes.read().unwrap();
        let Some(url) = routes.instance_urls.get(&instance_id).cloned() else {
            return json_error(
                StatusCode::NOT_FOUND,
                &format!("Unknown MCP instance: {instance_id}"),
            );
        };
        (url, routes.trust_map.get(&instance_id).copied())
    };

    let Some(gate) = state.gates.get_gate(&workspace, invocation_ts) else {
        warn!(workspace, invocation_ts, "MCP proxy: no security gate");
        return json_error(StatusCode::FORBIDDEN, "No security context for this session");
    };

    let target = format!("{backend_url}{tail}");
    let mut request = state.client.request(
        method.as_str().parse().unwrap_or(reqwest::Method::POST),
        &target,
    );
    for (key, value) in &headers {
        if HOP_BY_HOP.contains(&key.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request = request.header(key.as_str(), v);
        }
    }

    let backend_resp = match request.body(body.to_vec()).send().await {
        Ok(resp) => resp,
        Err(e) => {
            error!(instance = %instance_id, error = %e, "MCP backend error");
            return json_error(StatusCode::BAD_GATEWAY, "MCP backend unavailable");
        }
    };

    let status =
        StatusCode::from_u16(backend_resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let resp_headers = backend_resp.headers().clone();
    let mut resp_body = match backend_resp.bytes().await {
        Ok(b) => b.to_vec(),
        Err(e) => {
            error!(instance = %instance_id, error = %e, "MCP backend body error");
            return json_error(StatusCode::BAD_GATEWAY, "MCP backend unavailable");
        }
    };

    // Responses from attacker-writable sources get taint + fencing.
    if trust.unwrap_or_default().public_source.is_yes() {
        resp_body = apply_fencing(&state, resp_body, &instance_id, &gate, &workspace).await;
    }

    let mut response = Response::builder().status(status);
    for (key, value) in &resp_headers {
        if HOP_BY_HOP.contains(&key.as_str()) {
            continue;
        }
        response = response.header(key, value);
    }
    response
        .body(axum::body::Body::from(resp_body))
        .unwrap_or_else(|_| json_error(StatusCode::INTERNAL_SERVER_ERROR, "proxy response error"))
}

/// Record the read on the gate (corruption taint), then Cop-inspect and
/// fence every text block in the MCP result. Non-JSON bodies pass through.
async fn apply_fencing(
    state: &Arc<ProxyState>,
    body: Vec<u8>,
    instance_id: &str,
    gate: &pynchy_security::gate::SecurityGate,
    workspace: &str,
) -> Vec<u8> {
    let Ok(mut data) = serde_json::from_slice::<Value>(&body) else {
        return body;
    };

    gate.evaluate_read(instance_id);

    let source = format!("mcp:{instance_id}");
    if let Some(contents) = data
        .get_mut("result")
        .and_then(|r| r.get_mut("content"))
        .and_then(|c| c.as_array_mut())
    {
        for item in contents {
            let is_text = item.get("type").and_then(|t| t.as_str()) == Some("text");
            if !is_text {
                continue;
            }
            let Some(text) = item.get("text").and_then(|t| t.as_str()).map(String::from) else {
                continue;
            };
            let verdict = state.cop.inspect_inbound(&source, &text).await;
            let replacement = if verdict.flagged {
                warn!(
                    instance = instance_id,
                    workspace,
                    reason = verdict.reason.as_deref().unwrap_or(""),
                    "cop flagged MCP response"
                );
                BLOCKED_PLACEHOLDER.to_string()
            } else {
                fence_untrusted_content(&text, &source)
            };
            item["text"] = Value::String(replacement);
        }
    }

    serde_json::to_vec(&data).unwrap_or(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pynchy_core::trust::{TrustLevel, WorkspaceSecurity};
    use pynchy_security::cop::AllowAllCop;

    /// Minimal MCP backend returning a fixed text envelope.
    async fn spawn_backend() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let app = Router::new().route(
            "/",
            any(|| async {
                axum::Json(serde_json::json!({
                    "result": {
                        "content": [{"type": "text", "text": "Hello from the web"}]
                    }
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, handle)
    }

    fn trust(public_source: bool) -> ServiceTrust {
        ServiceTrust {
            public_source: if public_source {
                TrustLevel::Yes
            } else {
                TrustLevel::No
            },
            secret_data: TrustLevel::No,
            public_sink: TrustLevel::No,
            dangerous_writes: TrustLevel::No,
        }
    }

    async fn proxy_with_backend(public_source: bool) -> (McpProxy, Arc<GateRegistry>) {
        let (backend_addr, _backend) = spawn_backend().await;
        let gates = Arc::new(GateRegistry::new());
        let proxy = McpProxy::start(Arc::clone(&gates), Arc::new(AllowAllCop), 0)
            .await
            .unwrap();
        proxy.update_routes(
            HashMap::from([("browser".to_string(), format!("http://{backend_addr}"))]),
            HashMap::from([("browser".to_string(), trust(public_source))]),
        );
        (proxy, gates)
    }

    #[tokio::test]
    async fn public_source_response_is_fenced_and_taints() {
        let (proxy, gates) = proxy_with_backend(true).await;
        let gate = gates.create_gate("dev", 1000, WorkspaceSecurity::default());

        let url = format!("http://127.0.0.1:{}/mcp/dev/1000/browser", proxy.port());
        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({"method": "tools/call"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        let text = body["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("EXTERNAL_UNTRUSTED_CONTENT"));
        assert!(text.contains("Hello from the web"));
        assert!(gate.corruption_tainted());
    }

    #[tokio::test]
    async fn private_source_passes_through_untainted() {
        let (proxy, gates) = proxy_with_backend(false).await;
        let gate = gates.create_gate("dev", 1000, WorkspaceSecurity::default());

        let url = format!("http://127.0.0.1:{}/mcp/dev/1000/browser", proxy.port());
        let resp = reqwest::Client::new().post(&url).send().await.unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["result"]["content"][0]["text"], "Hello from the web");
        assert!(!gate.corruption_tainted());
    }

    #[tokio::test]
    async fn missing_gate_is_403_unknown_instance_404() {
        let (proxy, gates) = proxy_with_backend(true).await;
        gates.create_gate("dev", 1000, WorkspaceSecurity::default());

        let no_gate = format!("http://127.0.0.1:{}/mcp/dev/9999/browser", proxy.port());
        let resp = reqwest::Client::new().post(&no_gate).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 403);

        let no_instance = format!("http://127.0.0.1:{}/mcp/dev/1000/ghost", proxy.port());
        let resp = reqwest::Client::new().post(&no_instance).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);

        let bad_ts = format!("http://127.0.0.1:{}/mcp/dev/abc/browser", proxy.port());
        let resp = reqwest::Client::new().post(&bad_ts).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }
}
