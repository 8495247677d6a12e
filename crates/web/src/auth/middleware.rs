//! Authentication and rate limiting middleware for Axum.

use axum::{
    extract::{ConnectInfo, FromRequest, Request},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
    Form, Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use flint_common::CredentialStore;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::login::login_page;
use super::rate_limit::{client_ip, RateLimiter, RETRY_AFTER_SECS};
use super::session::{SessionManager, SESSION_COOKIE, SESSION_TTL_SECS};

/// Paths that never consume rate limit tokens
const RATE_LIMIT_EXEMPT: &[&str] = &["/api/health"];

/// Everything the gates need
pub struct AuthState {
    pub credentials: Arc<CredentialStore>,
    pub sessions: Arc<SessionManager>,
    pub limiter: Arc<RateLimiter>,
}

impl AuthState {
    pub fn new(
        credentials: Arc<CredentialStore>,
        sessions: Arc<SessionManager>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            credentials,
            sessions,
            limiter: Arc::new(limiter),
        }
    }

    /// True when the request carries a live session cookie
    pub fn has_valid_session(&self, headers: &HeaderMap) -> bool {
        CookieJar::from_headers(headers)
            .get(SESSION_COOKIE)
            .map(|cookie| self.sessions.is_valid(cookie.value()))
            .unwrap_or(false)
    }

    /// Bearer token matching the API key, or a live session
    pub fn is_api_authorized(&self, headers: &HeaderMap) -> bool {
        let bearer_ok = bearer_token(headers)
            .map(|token| self.credentials.compare_api_key(token))
            .unwrap_or(false);

        bearer_ok || self.has_valid_session(headers)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// JSON error body used by the gates
pub fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Outermost layer: per-client token bucket
pub async fn rate_limit_middleware(auth: Arc<AuthState>, req: Request, next: Next) -> Response {
    if RATE_LIMIT_EXEMPT.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_ip(req.headers(), peer);

    if !auth.limiter.allow(&client) {
        warn!(client = %client, path = %req.uri().path(), "Rate limit exceeded");
        let mut response = json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded. Try again in 60 seconds.",
        );
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, RETRY_AFTER_SECS.into());
        return response;
    }

    next.run(req).await
}

/// Gate for `/api/*`: bearer token OR session cookie
pub async fn api_gate(auth: Arc<AuthState>, req: Request, next: Next) -> Response {
    if auth.is_api_authorized(req.headers()) {
        return next.run(req).await;
    }

    debug!(path = %req.uri().path(), "Unauthenticated API request");
    json_error(
        StatusCode::UNAUTHORIZED,
        "Authentication required. Use API key or login via web UI",
    )
}

/// Gate for the web UI: session cookie, otherwise the login flow.
/// `/api/` paths are left to the API gate.
pub async fn web_gate(auth: Arc<AuthState>, req: Request, next: Next) -> Response {
    if req.uri().path().starts_with("/api/") || auth.has_valid_session(req.headers()) {
        return next.run(req).await;
    }

    if req.method() == Method::POST && req.uri().path() == "/login" {
        return handle_login(auth, req).await;
    }

    login_page(false)
}

#[derive(Deserialize)]
struct LoginForm {
    #[serde(default)]
    passphrase: String,
}

async fn handle_login(auth: Arc<AuthState>, req: Request) -> Response {
    let Form(form) = match Form::<LoginForm>::from_request(req, &()).await {
        Ok(form) => form,
        Err(e) => {
            debug!(error = %e, "Rejected login form");
            return (StatusCode::BAD_REQUEST, "Invalid form data").into_response();
        }
    };

    // bcrypt is deliberately slow; keep it off the async workers
    let credentials = Arc::clone(&auth.credentials);
    let verified = tokio::task::spawn_blocking(move || {
        credentials.verify_passphrase(&form.passphrase)
    })
    .await
    .unwrap_or(false);

    if !verified {
        warn!("Failed web UI login attempt");
        return login_page(true);
    }

    match auth.sessions.create_session() {
        Ok(id) => {
            info!("Web UI login succeeded");
            let cookie = Cookie::build((SESSION_COOKIE, id))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax)
                .max_age(time::Duration::seconds(SESSION_TTL_SECS));
            (CookieJar::new().add(cookie), Redirect::to("/")).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to create session");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create session").into_response()
        }
    }
}
