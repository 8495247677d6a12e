//! Flint web server
//!
//! Routes, shared state and the serve loop. Requests pass the trace layer,
//! then the per-client rate limiter, then either the API gate (`/api/*`) or
//! the web gate (everything else). `/api/health` and the two token
//! authenticated WebSocket endpoints sit outside both gates.

use axum::{
    body::Bytes,
    extract::{ws::Message, Path, Query, Request, State, WebSocketUpgrade},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use flint_common::hypervisor::Virsh;
use flint_common::ssh::{detect_public_key, ConnectionSettings};
use flint_common::{CredentialStore, FlintConfig, Hypervisor, VERSION};
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{
    api_gate, json_error, rate_limit_middleware, web_gate, AuthState, RateLimiter,
    SessionManager, SWEEP_INTERVAL,
};
use crate::console::{check_token, serial_console_ws_handler, TokenQuery};
use crate::static_files::StaticFiles;
use crate::vnc_proxy::VncProxy;

/// How long in-flight requests get to finish after a shutdown signal
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// State shared by every handler
pub struct WebState {
    pub auth: Arc<AuthState>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub config: FlintConfig,
    pub static_files: StaticFiles,
    pub started_at: Instant,
}

/// Web server
#[derive(Clone)]
pub struct WebServer {
    state: Arc<WebState>,
}

impl WebServer {
    /// Create a new web server
    pub fn new(
        config: FlintConfig,
        credentials: Arc<CredentialStore>,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Self {
        let auth = AuthState::new(
            credentials,
            Arc::new(SessionManager::new()),
            RateLimiter::new(config.security.rate_limit_requests),
        );

        Self {
            state: Arc::new(WebState {
                auth: Arc::new(auth),
                hypervisor,
                static_files: StaticFiles::new(config.web.ui_dir.clone()),
                config,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.state.auth.sessions
    }

    /// Create router
    pub fn router(&self) -> Router {
        let auth = self.state.auth.clone();
        let rate_limit = middleware::from_fn(move |req: Request, next: Next| {
            let auth = auth.clone();
            async move { rate_limit_middleware(auth, req, next).await }
        });

        let auth = self.state.auth.clone();
        let api_auth = middleware::from_fn(move |req: Request, next: Next| {
            let auth = auth.clone();
            async move { api_gate(auth, req, next).await }
        });

        let auth = self.state.auth.clone();
        let web_auth = middleware::from_fn(move |req: Request, next: Next| {
            let auth = auth.clone();
            async move { web_gate(auth, req, next).await }
        });

        // Bearer token or session cookie
        let api_routes = Router::new()
            .route("/api/api-key", get(api_key_handler))
            .route("/api/connection/status", get(connection_status_handler))
            .route("/api/connection/test", post(connection_test_handler))
            .route("/api/connection/config", put(connection_config_handler))
            .route("/api/ssh-key/detect", get(ssh_key_detect_handler))
            .route("/api/vms/:uuid/serial-console", get(serial_console_info_handler))
            .route("/api/vms/:uuid/console-stream", get(serial_console_info_handler))
            .route("/api/vms/:uuid/vnc", get(vnc_info_handler))
            .layer(api_auth);

        // Session cookie, otherwise the login page
        let web_routes = Router::new()
            .route("/login", post(|| async { Redirect::to("/") }))
            .fallback(ui_handler)
            .layer(web_auth);

        Router::new()
            .route("/api/health", get(health_handler))
            // Authenticated with `?token=` before the upgrade
            .route(
                "/api/vms/:uuid/serial-console/ws",
                get(serial_console_ws_handler),
            )
            .route("/api/vms/:uuid/vnc/ws", get(vnc_ws_handler))
            .merge(api_routes)
            .merge(web_routes)
            .layer(TimeoutLayer::new(self.request_timeout()))
            .layer(rate_limit)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Deadline for producing a response. Upgraded WebSocket sessions are
    /// not bound by it.
    fn request_timeout(&self) -> Duration {
        let server = &self.state.config.server;
        Duration::from_secs(server.read_timeout + server.write_timeout)
    }

    /// Serve until `shutdown` resolves, then give open connections
    /// [`SHUTDOWN_GRACE`] to finish. The session and rate limit sweepers run
    /// alongside.
    pub async fn serve<F>(self, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Flint web server listening on http://{}", listener.local_addr()?);

        let session_sweeper = self.sessions().start_sweeper(SWEEP_INTERVAL);
        let bucket_sweeper = self.state.auth.limiter.start_sweeper();

        let draining = CancellationToken::new();
        let signal = draining.clone();
        let server = axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .into_future();
        let mut server = std::pin::pin!(server);

        let result = tokio::select! {
            result = &mut server => result,
            _ = shutdown => {
                info!("Shutting down, waiting up to {}s for open connections", SHUTDOWN_GRACE.as_secs());
                draining.cancel();
                match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Graceful shutdown timed out; dropping remaining connections");
                        Ok(())
                    }
                }
            }
        };

        session_sweeper.stop().await;
        bucket_sweeper.stop().await;
        info!("Web server stopped");
        result.map_err(Into::into)
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Resolve a `:uuid` path segment to a canonical domain UUID. Domain names
/// are accepted too and looked up through the hypervisor.
pub(crate) async fn lookup_vm_id(
    hypervisor: &dyn Hypervisor,
    raw: &str,
) -> flint_common::Result<String> {
    if let Ok(id) = Uuid::parse_str(raw) {
        return Ok(id.to_string());
    }

    if !is_domain_name(raw) {
        return Err(flint_common::Error::InvalidVmId(raw.to_string()));
    }

    hypervisor.lookup_domain_by_name(raw).await.map_err(|e| {
        debug!(name = raw, error = %e, "Domain lookup failed");
        e
    })
}

/// [`lookup_vm_id`] with failures mapped onto JSON error responses
#[allow(clippy::result_large_err)]
async fn resolve_vm_id(hypervisor: &dyn Hypervisor, raw: &str) -> Result<String, Response> {
    lookup_vm_id(hypervisor, raw).await.map_err(|e| error_response(&e))
}

/// Names are passed to virsh as an argument, so no leading dash
fn is_domain_name(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= 255
        && !raw.starts_with('-')
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
}

/// Map a backend error onto a JSON error response
fn error_response(err: &flint_common::Error) -> Response {
    use flint_common::Error;

    if err.is_unavailable() {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, &err.to_string());
    }

    let status = match err {
        Error::InvalidVmId(_) => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } | Error::ConsoleError(_) => StatusCode::NOT_FOUND,
        Error::Hypervisor(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, &err.to_string())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<WebState>>) -> Response {
    let (host, resources) = tokio::join!(
        state.hypervisor.host_status(),
        state.hypervisor.host_resources()
    );
    let host_error = host.as_ref().err().map(|e| e.to_string());
    let resources_error = resources.as_ref().err().map(|e| e.to_string());
    let healthy = host_error.is_none() && resources_error.is_none();

    let mut body = serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "timestamp": Utc::now().timestamp(),
        "version": VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "checks": {
            // libvirt reachability is judged by the host status query
            "libvirt": {
                "healthy": host_error.is_none(),
                "error": host_error.clone().unwrap_or_default(),
            },
            "host_status": {
                "healthy": host_error.is_none(),
                "error": host_error.unwrap_or_default(),
            },
            "host_resources": {
                "healthy": resources_error.is_none(),
                "error": resources_error.unwrap_or_default(),
            },
        }
    });
    if let Ok(host) = host {
        body["host"] = serde_json::json!(host);
    }
    if let Ok(resources) = resources {
        body["resources"] = serde_json::json!(resources);
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn api_key_handler(State(state): State<Arc<WebState>>) -> Response {
    let key = state.auth.credentials.api_key();
    if key.is_empty() {
        return json_error(StatusCode::NOT_FOUND, "No API key configured");
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        key,
    )
        .into_response()
}

async fn connection_status_handler(State(state): State<Arc<WebState>>) -> Response {
    let libvirt = &state.config.libvirt;
    let error_message = state.hypervisor.host_status().await.err().map(|e| e.to_string());

    let mut body = serde_json::json!({
        "connected": error_message.is_none(),
        "uri": libvirt.uri,
        "effective_uri": state.config.effective_libvirt_uri(),
        "ssh_enabled": libvirt.ssh.enabled,
    });
    if libvirt.ssh.enabled {
        body["ssh_host"] = serde_json::json!(libvirt.ssh.host);
        body["ssh_username"] = serde_json::json!(libvirt.ssh.username);
        body["ssh_port"] = serde_json::json!(libvirt.ssh.port);
    }
    if let Some(message) = error_message {
        body["error_message"] = serde_json::json!(message);
    }

    Json(body).into_response()
}

/// Try connection parameters without saving them. Failures are reported
/// in the body with `success: false`.
async fn connection_test_handler(body: Bytes) -> Response {
    let settings: ConnectionSettings = match serde_json::from_slice(&body) {
        Ok(settings) => settings,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "Invalid request body"),
    };

    let uri = match settings.test_uri() {
        Ok(uri) => uri,
        Err(e) => {
            return Json(serde_json::json!({ "success": false, "message": e.to_string() }))
                .into_response()
        }
    };

    let virsh = Virsh::new(uri.clone());
    let (success, message) = match virsh.check().await {
        Err(e) => (false, format!("Connection failed: {}", e)),
        Ok(_) => match virsh.host_status().await {
            Err(e) => (
                false,
                format!("Connection established but failed to query host: {}", e),
            ),
            Ok(_) => (true, "Connection successful".to_string()),
        },
    };
    info!(uri = %uri, success, "Tested libvirt connection");

    Json(serde_json::json!({
        "success": success,
        "message": message,
        "effective_uri": uri,
    }))
    .into_response()
}

/// Store new connection settings. They take effect on the next start.
async fn connection_config_handler(
    State(state): State<Arc<WebState>>,
    body: Bytes,
) -> Response {
    let settings: ConnectionSettings = match serde_json::from_slice(&body) {
        Ok(settings) => settings,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "Invalid request body"),
    };

    let path = state.auth.credentials.config_path();
    let mut config = match FlintConfig::load_file(path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load configuration");
        }
    };

    if let Err(e) = settings.apply_to(&mut config) {
        return json_error(StatusCode::BAD_REQUEST, &e.to_string());
    }

    if let Err(e) = config.save(path) {
        error!(error = %e, "Failed to save config");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save configuration");
    }

    let effective_uri = config.effective_libvirt_uri();
    info!(
        ssh_enabled = config.libvirt.ssh.enabled,
        uri = %effective_uri,
        "Connection configuration updated"
    );
    Json(serde_json::json!({
        "success": true,
        "message": "Configuration updated. Please restart the server for changes to take effect.",
        "effective_uri": effective_uri,
    }))
    .into_response()
}

/// The server user's `~/.ssh/id_rsa.pub`, or an empty body if there is none
async fn ssh_key_detect_handler() -> Response {
    match detect_public_key(&flint_common::home_dir()) {
        Ok(key) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            key.unwrap_or_default(),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to read SSH public key");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read SSH key")
        }
    }
}

/// Where the UI should open the serial console WebSocket
async fn serial_console_info_handler(
    State(state): State<Arc<WebState>>,
    Path(vm_id): Path<String>,
) -> Response {
    let vm_id = match resolve_vm_id(state.hypervisor.as_ref(), &vm_id).await {
        Ok(vm_id) => vm_id,
        Err(response) => return response,
    };

    Json(serde_json::json!({
        "websocket_path": format!("/api/vms/{}/serial-console/ws", vm_id),
        "token": state.auth.credentials.api_key(),
    }))
    .into_response()
}

async fn vnc_info_handler(
    State(state): State<Arc<WebState>>,
    Path(vm_id): Path<String>,
) -> Response {
    let vm_id = match resolve_vm_id(state.hypervisor.as_ref(), &vm_id).await {
        Ok(vm_id) => vm_id,
        Err(response) => return response,
    };

    match state.hypervisor.vnc_endpoint(&vm_id).await {
        Ok(endpoint) => Json(serde_json::json!({
            "vm_id": vm_id,
            "host": endpoint.host,
            "port": endpoint.port,
            "websocket_path": format!("/api/vms/{}/vnc/ws", vm_id),
        }))
        .into_response(),
        Err(e) => {
            debug!(vm_id = %vm_id, error = %e, "VNC lookup failed");
            error_response(&e)
        }
    }
}

async fn vnc_ws_handler(
    State(state): State<Arc<WebState>>,
    Path(vm_id): Path<String>,
    Query(query): Query<TokenQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Err(response) = check_token(&state.auth.credentials, query.token.as_deref()) {
        warn!(vm_id = %vm_id, "Rejected VNC connection");
        return response;
    }

    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "Failed to upgrade to WebSocket").into_response();
    };

    let hypervisor = Arc::clone(&state.hypervisor);
    ws.on_upgrade(move |mut socket| async move {
        let lookup = async {
            let vm_id = lookup_vm_id(hypervisor.as_ref(), &vm_id).await?;
            let endpoint = hypervisor.vnc_endpoint(&vm_id).await?;
            Ok::<_, flint_common::Error>((vm_id, endpoint))
        };
        let (vm_id, endpoint) = match lookup.await {
            Ok(found) => found,
            Err(e) => {
                warn!(vm_id = %vm_id, error = %e, "VNC lookup failed");
                let _ = socket.send(Message::Text(format!("Error: {}", e))).await;
                let _ = socket.close().await;
                return;
            }
        };

        info!(vm_id = %vm_id, "VNC session started");
        if let Err(e) = VncProxy::new(endpoint).bridge(socket).await {
            warn!(vm_id = %vm_id, "VNC session failed: {}", e);
        }
    })
}

async fn ui_handler(State(state): State<Arc<WebState>>, req: Request) -> Response {
    let path = req.uri().path();
    if path.starts_with("/api/") {
        return json_error(StatusCode::NOT_FOUND, "Not found");
    }
    state.static_files.serve(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::extract::ConnectInfo;
    use axum::http::Method;
    use flint_common::hypervisor::{HostResources, HostStatus, HypervisorClient};
    use sha2::{Digest, Sha256};
    use tower::ServiceExt;

    const API_KEY: &str = "9c2e4a6b8d0f1e3a5c7b9d1f3e5a7c9b1d3f5e7a9c1b3d5f7e9a1c3b5d7f9e1a";
    const PASSPHRASE: &str = "correct horse battery";
    const VM: &str = "6f1c0e2a-3b4d-4e5f-8a9b-0c1d2e3f4a5b";

    const DOMAIN_XML: &str = r#"<domain type='kvm'>
  <devices>
    <console type='pty'><source path='/dev/pts/7'/></console>
    <graphics type='vnc' port='5901' listen='0.0.0.0'/>
  </devices>
</domain>"#;

    struct FakeHypervisor;

    #[async_trait]
    impl Hypervisor for FakeHypervisor {
        async fn domain_xml(&self, _id: &str) -> flint_common::Result<String> {
            Ok(DOMAIN_XML.to_string())
        }

        async fn lookup_domain_by_name(&self, _name: &str) -> flint_common::Result<String> {
            Ok(VM.to_string())
        }

        async fn host_status(&self) -> flint_common::Result<HostStatus> {
            Ok(HostStatus {
                hostname: "kvm01".into(),
                hypervisor_version: "8.0.0".into(),
                total_vms: 3,
                running_vms: 1,
            })
        }

        async fn host_resources(&self) -> flint_common::Result<HostResources> {
            Ok(HostResources {
                total_memory_kb: 16_318_412,
                free_memory_kb: 2_097_152,
                cpu_cores: 8,
                storage_total_b: 107_374_182_400,
                storage_used_b: 53_687_091_200,
            })
        }
    }

    fn config(ui_dir: Option<std::path::PathBuf>) -> FlintConfig {
        let mut config = FlintConfig::default();
        config.api_key = API_KEY.to_string();
        // Legacy hash keeps the tests fast
        config.security.passphrase_hash = hex::encode(Sha256::digest(PASSPHRASE.as_bytes()));
        config.web.ui_dir = ui_dir;
        config
    }

    fn server_with(config: FlintConfig, hypervisor: Arc<dyn Hypervisor>) -> WebServer {
        server_at(std::path::Path::new("/nonexistent/config.json"), config, hypervisor)
    }

    fn server_at(
        path: &std::path::Path,
        config: FlintConfig,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> WebServer {
        let credentials = Arc::new(CredentialStore::from_config(path, &config));
        WebServer::new(config, credentials, hypervisor)
    }

    fn server() -> WebServer {
        server_with(config(None), Arc::new(FakeHypervisor))
    }

    fn request(uri: &str) -> axum::http::request::Builder {
        axum::http::Request::builder()
            .uri(uri)
            .extension(ConnectInfo(SocketAddr::from(([192, 0, 2, 10], 40000))))
    }

    fn authed(uri: &str) -> Request {
        request(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
            .body(Body::empty())
            .unwrap()
    }

    fn authed_json(method: Method, uri: &str, body: &str) -> Request {
        request(uri)
            .method(method)
            .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn anonymous(uri: &str) -> Request {
        request(uri).body(Body::empty()).unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn text(response: Response) -> String {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public_and_never_limited() {
        let app = server().router();
        for _ in 0..150 {
            let response = app.clone().oneshot(anonymous("/api/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let body = json(app.oneshot(anonymous("/api/health")).await.unwrap()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], VERSION);
        assert!(body["timestamp"].as_i64().unwrap() > 1_600_000_000);
        for check in ["libvirt", "host_status", "host_resources"] {
            assert_eq!(body["checks"][check]["healthy"], true, "{}", check);
            assert_eq!(body["checks"][check]["error"], "", "{}", check);
        }
        assert_eq!(body["host"]["hostname"], "kvm01");
        assert_eq!(body["resources"]["cpu_cores"], 8);
        assert_eq!(body["resources"]["free_memory_kb"], 2_097_152);
        assert_eq!(body["resources"]["storage_used_b"], 53_687_091_200u64);
    }

    #[tokio::test]
    async fn test_health_unhealthy_when_disconnected() {
        let hypervisor = Arc::new(HypervisorClient::Disconnected {
            reason: "virsh not found".into(),
        });
        let app = server_with(config(None), hypervisor).router();

        let response = app.oneshot(anonymous("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json(response).await;
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["checks"]["libvirt"]["error"], "libvirt connection not available");
        assert_eq!(body["checks"]["host_resources"]["healthy"], false);
        assert!(body.get("host").is_none());
        assert!(body.get("resources").is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_applies_to_other_paths() {
        let app = server().router();
        for _ in 0..100 {
            let response = app.clone().oneshot(authed("/api/api-key")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(authed("/api/api-key")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
        let body = json(response).await;
        assert_eq!(body["error"], "Rate limit exceeded. Try again in 60 seconds.");

        // A different client has its own bucket
        let req = request("/api/api-key")
            .header("X-Forwarded-For", "198.51.100.7")
            .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_key_endpoint() {
        let app = server().router();

        let response = app.clone().oneshot(anonymous("/api/api-key")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.oneshot(authed("/api/api-key")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        assert_eq!(text(response).await, API_KEY);
    }

    #[tokio::test]
    async fn test_api_accepts_session_cookie() {
        let server = server();
        let session = server.sessions().create_session().unwrap();
        let req = request("/api/connection/status")
            .header(header::COOKIE, format!("flint_session={}", session))
            .body(Body::empty())
            .unwrap();

        let response = server.router().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["connected"], true);
        assert_eq!(body["uri"], "qemu:///system");
        assert_eq!(body["effective_uri"], "qemu:///system");
        assert_eq!(body["ssh_enabled"], false);
        assert!(body.get("ssh_host").is_none());
    }

    #[tokio::test]
    async fn test_connection_status_reports_errors() {
        let hypervisor = Arc::new(HypervisorClient::Disconnected {
            reason: "virsh not found".into(),
        });
        let app = server_with(config(None), hypervisor).router();

        let body = json(app.oneshot(authed("/api/connection/status")).await.unwrap()).await;
        assert_eq!(body["connected"], false);
        assert_eq!(body["error_message"], "libvirt connection not available");
    }

    #[tokio::test]
    async fn test_connection_test_reports_failures() {
        let app = server().router();
        let post = |body: &str| authed_json(Method::POST, "/api/connection/test", body);

        let response = app.clone().oneshot(post("{ nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json(
            app.clone()
                .oneshot(post(r#"{"ssh_enabled": true, "ssh_username": "root"}"#))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body["success"], false);
        assert_eq!(
            body["message"],
            "SSH username and host are required when SSH is enabled"
        );
        assert!(body.get("effective_uri").is_none());

        let body = json(
            app.clone()
                .oneshot(post(
                    r#"{"ssh_enabled": true, "ssh_username": "root", "ssh_host": "kvm01", "ssh_key_path": "/nonexistent/id_rsa"}"#,
                ))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body["success"], false);
        assert!(body["message"]
            .as_str()
            .unwrap()
            .starts_with("SSH validation failed: "));

        let body = json(
            app.clone()
                .oneshot(post(r#"{"uri": "qemu:///nonexistent-flint-test"}"#))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().starts_with("Connection failed: "));
        assert_eq!(body["effective_uri"], "qemu:///nonexistent-flint-test");

        let req = request("/api/connection/test")
            .method(Method::POST)
            .body(Body::from("{}"))
            .unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_connection_config_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut stored = config(None);
        stored.server.port = 6000;
        stored.save(&path).unwrap();

        let app = server_at(&path, stored, Arc::new(FakeHypervisor)).router();
        let put = |body: &str| authed_json(Method::PUT, "/api/connection/config", body);

        let response = app
            .clone()
            .oneshot(put(
                r#"{"ssh_enabled": true, "ssh_username": "ops", "ssh_host": "kvm02", "ssh_port": 2222}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["effective_uri"], "qemu+ssh://ops@kvm02:2222/system");

        let saved = FlintConfig::load_file(&path).unwrap();
        assert!(saved.libvirt.ssh.enabled);
        assert_eq!(saved.libvirt.ssh.host, "kvm02");
        assert_eq!(saved.libvirt.ssh.port, 2222);
        // Unrelated settings and secrets survive
        assert_eq!(saved.server.port, 6000);
        assert_eq!(saved.api_key, API_KEY);

        // The running connection is unchanged until restart
        let status = json(app.clone().oneshot(authed("/api/connection/status")).await.unwrap()).await;
        assert_eq!(status["effective_uri"], "qemu:///system");

        let response = app
            .clone()
            .oneshot(put(r#"{"ssh_enabled": true, "ssh_host": "kvm02"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("SSH username and host are required"));

        let response = app.oneshot(put("not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(FlintConfig::load_file(&path).unwrap().libvirt.ssh.port, 2222);
    }

    #[tokio::test]
    async fn test_ssh_key_detect() {
        let app = server().router();

        let response = app.clone().oneshot(anonymous("/api/ssh-key/detect")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.oneshot(authed("/api/ssh-key/detect")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }

    #[tokio::test]
    async fn test_serial_console_info() {
        let app = server().router();

        for path in ["serial-console", "console-stream"] {
            let uri = format!("/api/vms/{}/{}", VM, path);
            let body = json(app.clone().oneshot(authed(&uri)).await.unwrap()).await;
            assert_eq!(
                body["websocket_path"],
                format!("/api/vms/{}/serial-console/ws", VM)
            );
            assert_eq!(body["token"], API_KEY);
        }

        let response = app
            .clone()
            .oneshot(anonymous(&format!("/api/vms/{}/serial-console", VM)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Domain names resolve to the UUID
        let body = json(app.clone().oneshot(authed("/api/vms/web01/serial-console")).await.unwrap()).await;
        assert_eq!(
            body["websocket_path"],
            format!("/api/vms/{}/serial-console/ws", VM)
        );

        for bad in ["--help", "web%2F01", "has%20space"] {
            let response = app
                .clone()
                .oneshot(authed(&format!("/api/vms/{}/serial-console", bad)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", bad);
        }
    }

    #[test]
    fn test_domain_name_rules() {
        assert!(is_domain_name("web01"));
        assert!(is_domain_name("db_primary.v2+test"));
        assert!(!is_domain_name(""));
        assert!(!is_domain_name("-c"));
        assert!(!is_domain_name("a/b"));
        assert!(!is_domain_name("a b"));
    }

    #[tokio::test]
    async fn test_vnc_info() {
        let app = server().router();
        let body = json(app.oneshot(authed(&format!("/api/vms/{}/vnc", VM))).await.unwrap()).await;
        assert_eq!(body["vm_id"], VM);
        assert_eq!(body["host"], "0.0.0.0");
        assert_eq!(body["port"], 5901);
        assert_eq!(body["websocket_path"], format!("/api/vms/{}/vnc/ws", VM));
    }

    #[tokio::test]
    async fn test_vnc_info_unavailable() {
        let hypervisor = Arc::new(HypervisorClient::Disconnected {
            reason: "virsh not found".into(),
        });
        let app = server_with(config(None), hypervisor).router();
        let response = app.oneshot(authed(&format!("/api/vms/{}/vnc", VM))).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_websocket_token_checked_before_upgrade() {
        let app = server().router();

        for ws in ["serial-console/ws", "vnc/ws"] {
            let base = format!("/api/vms/{}/{}", VM, ws);

            let response = app.clone().oneshot(anonymous(&base)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(text(response).await, "Authentication token required");

            let response = app
                .clone()
                .oneshot(anonymous(&format!("{}?token=nope", base)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(text(response).await, "Invalid authentication token");

            // Valid token but a plain GET: no upgrade to perform
            let response = app
                .clone()
                .oneshot(anonymous(&format!("{}?token={}", base, API_KEY)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_websocket_ignores_session_cookie() {
        let server = server();
        let session = server.sessions().create_session().unwrap();
        let req = request(&format!("/api/vms/{}/serial-console/ws", VM))
            .header(header::COOKIE, format!("flint_session={}", session))
            .body(Body::empty())
            .unwrap();

        let response = server.router().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ui_behind_login() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>flint ui</html>").unwrap();
        let server = server_with(
            config(Some(dir.path().to_path_buf())),
            Arc::new(FakeHypervisor),
        );
        let app = server.router();

        let body = text(app.clone().oneshot(anonymous("/")).await.unwrap()).await;
        assert!(body.contains("Flint - Login"));

        let session = server.sessions().create_session().unwrap();
        let req = request("/vms")
            .header(header::COOKIE, format!("flint_session={}", session))
            .body(Body::empty())
            .unwrap();
        let body = text(app.oneshot(req).await.unwrap()).await;
        assert_eq!(body, "<html>flint ui</html>");
    }

    #[tokio::test]
    async fn test_login_then_browse() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>flint ui</html>").unwrap();
        let app = server_with(
            config(Some(dir.path().to_path_buf())),
            Arc::new(FakeHypervisor),
        )
        .router();

        let req = request("/login")
            .method(Method::POST)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("passphrase={}", PASSPHRASE.replace(' ', "+"))))
            .unwrap();
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let cookie = response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();

        // Posting the form again with a live session just redirects home
        let req = request("/login")
            .method(Method::POST)
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let req = request("/").header(header::COOKIE, &cookie).body(Body::empty()).unwrap();
        assert_eq!(text(app.oneshot(req).await.unwrap()).await, "<html>flint ui</html>");
    }

    #[tokio::test]
    async fn test_unknown_api_path() {
        let response = server().router().oneshot(anonymous("/api/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["error"], "Not found");
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server().serve(SocketAddr::from(([127, 0, 0, 1], 0)), async move {
            let _ = rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
