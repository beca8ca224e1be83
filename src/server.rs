//!
//! sentra HTTP/WS server
//! ---------------------
//! This module defines the Axum-based HTTP API and WebSocket interface.
//!
//! Responsibilities:
//! - Sign-in/sign-out endpoints backed by the session authority, with the
//!   access token carried as a bearer header or cookie.
//! - MFA registration and challenge endpoints.
//! - Heartbeat endpoint that checks the session without extending it.
//! - WebSocket endpoint handing authenticated channels to the connection
//!   registry, plus the internal push-send endpoint for feature code.
//! - Error mapping: full detail is logged here, only user-safe messages
//!   cross the boundary.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::{MemoryUserStore, NewUser, Principal, SessionAuthority, UserStore};
use crate::registry::{Channel, ConnectionRegistry, Notification, SessionInvalidator};
use crate::security;
use crate::token::TokenCodec;

const TOKEN_COOKIE: &str = "accessToken";
/// Surfaced on the heartbeat so clients know to run the refresh loop.
const SECURITY_ENABLED: bool = true;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub authority: Arc<SessionAuthority>,
    pub registry: Arc<ConnectionRegistry<WsChannel>>,
    pub users: Arc<MemoryUserStore>,
}

/// Start the HTTP server with the given configuration.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let users = Arc::new(MemoryUserStore::new());
    let admin_password =
        std::env::var("SENTRA_ADMIN_PASSWORD").unwrap_or_else(|_| "sentra".to_string());
    users.ensure_admin_password(&admin_password)?;

    let codec = TokenCodec::new(config.secret.as_bytes());
    let authority = Arc::new(SessionAuthority::new(codec, users.clone(), config.policy));
    let invalidator: Arc<dyn SessionInvalidator> = authority.clone();
    let registry = ConnectionRegistry::new(
        invalidator,
        config.policy.inactivity_budget,
        config.policy.warning_lead,
    );

    let state = AppState { authority, registry, users };

    let app = Router::new()
        .route("/", get(|| async { "sentra ok" }))
        .route("/account/signin", post(sign_in))
        .route("/account/signout", post(sign_out))
        .route("/account/users", post(create_user))
        .route(
            "/account/mfa",
            get(mfa_begin).post(mfa_challenge).patch(mfa_register),
        )
        .route("/heartbeat", get(heartbeat))
        .route("/notification/connect", get(ws_connect))
        .route("/private/send/notifications", post(send_notifications))
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

// --- Token extraction -------------------------------------------------------

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie").or_else(|| headers.get("Cookie"))?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name {
                return Some(v[1..].to_string());
            }
        }
    }
    None
}

fn access_token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    parse_cookie(headers, TOKEN_COOKIE)
}

/// The single gate every protected route calls before proceeding. Records
/// activity on the user's realtime connection as well — many clients only
/// touch secure endpoints, and that traffic must count against the
/// inactivity budget.
async fn verify_request(
    state: &AppState,
    headers: &HeaderMap,
    refresh: bool,
    verify_mfa_challenge: bool,
) -> Result<Principal> {
    let token = access_token_from_headers(headers).ok_or(Error::InvalidToken)?;
    let principal = state
        .authority
        .verify_access_token(&token, refresh, verify_mfa_challenge)?;
    state.registry.record_activity(principal.user.id).await;
    Ok(principal)
}

fn error_response(err: &Error) -> Response {
    // Full detail for the log; the user-safe message for the wire.
    error!("request failed: {err}");
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({"status": "error", "code": err.code_str(), "message": err.message()})),
    )
        .into_response()
}

fn set_token_cookie(token: &str) -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{TOKEN_COOKIE}={token}; HttpOnly; Secure; SameSite=Strict; Path=/"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn clear_token_cookie() -> HeaderValue {
    HeaderValue::from_static(
        "accessToken=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; Secure; SameSite=Strict; Path=/",
    )
}

// --- Account ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SignInPayload {
    email: String,
    password: String,
}

async fn sign_in(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<SignInPayload>,
) -> Response {
    match state.authority.sign_in(&payload.email, &payload.password) {
        Ok((principal, session)) => {
            let principal = principal.with_peer(Some(addr.to_string()));
            let mut headers = HeaderMap::new();
            headers.insert("Set-Cookie", set_token_cookie(&session.access_token));
            info!(
                "signed in user ({}) peer ({:?})",
                principal.user.id, principal.peer
            );
            (
                StatusCode::OK,
                headers,
                Json(json!({
                    "status": "ok",
                    "user": principal.user,
                    "accessToken": session.access_token,
                    "mfaRequired": principal.mfa_challenge_pending,
                })),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn sign_out(State(state): State<AppState>, headers: HeaderMap) -> Response {
    // The token only needs to be authentic; a pending MFA challenge must not
    // trap the user in a session they cannot leave.
    match verify_request(&state, &headers, false, false).await {
        Ok(principal) => {
            state.authority.sign_out(&principal);
            let mut h = HeaderMap::new();
            h.insert("Set-Cookie", clear_token_cookie());
            (StatusCode::OK, h, Json(json!({"status": "ok"}))).into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserPayload {
    email: String,
    password: String,
    full_name: String,
    #[serde(default)]
    verified: bool,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateUserPayload>,
) -> Response {
    let principal = match verify_request(&state, &headers, true, true).await {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };
    if !principal.is_super_user() {
        return error_response(&Error::AccessDenied);
    }
    if !payload.email.contains('@') {
        return error_response(&Error::required("email"));
    }
    if payload.password.is_empty() {
        return error_response(&Error::required("password"));
    }

    let password_hash = match security::hash_password(&payload.password) {
        Ok(h) => h,
        Err(e) => return error_response(&Error::from(e)),
    };
    let new_user = NewUser {
        email: payload.email,
        full_name: payload.full_name,
        password_hash,
        verified: payload.verified,
        enabled: payload.enabled,
    };
    match state.users.create(new_user) {
        Ok(user) => {
            info!("created new user ({}) email ({})", user.id, user.email);
            (StatusCode::OK, Json(json!({"status": "ok", "user": user}))).into_response()
        }
        Err(e) => error_response(&Error::from(e)),
    }
}

// --- MFA --------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MfaPayload {
    #[serde(default)]
    mfa_code: Option<String>,
}

/// Begin MFA registration. Returns the otpauth provisioning URL; the account
/// is not MFA-enabled until the code is validated via PATCH.
async fn mfa_begin(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let principal = match verify_request(&state, &headers, true, true).await {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };
    match state.authority.generate_totp_secret(&principal) {
        Ok((_secret, url)) => {
            (StatusCode::OK, Json(json!({"status": "ok", "otpauthUrl": url}))).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Validate the MFA registration code, finalizing registration.
async fn mfa_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<MfaPayload>,
) -> Response {
    let principal = match verify_request(&state, &headers, true, true).await {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };
    match state
        .authority
        .register_mfa(&principal, payload.mfa_code.as_deref())
    {
        Ok(_user) => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Submit the sign-in MFA challenge. The token is verified without the
/// challenge check — passing the challenge is what is being done here.
async fn mfa_challenge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<MfaPayload>,
) -> Response {
    let principal = match verify_request(&state, &headers, false, false).await {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };
    match state
        .authority
        .verify_mfa(&principal, payload.mfa_code.as_deref())
    {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "user": principal.user})),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

// --- Heartbeat --------------------------------------------------------------

/// Check whether the server is running and the caller is signed in. Does not
/// refresh the session token.
async fn heartbeat(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let is_signed_in = verify_request(&state, &headers, false, false).await.is_ok();
    (
        StatusCode::OK,
        Json(json!({
            "isSignedIn": is_signed_in,
            "isSecurityEnabled": SECURITY_ENABLED,
        })),
    )
        .into_response()
}

// --- Realtime ---------------------------------------------------------------

/// WebSocket-backed channel handed to the connection registry. The sink side
/// lives here; the read side stays with the per-connection receive loop.
pub struct WsChannel {
    tx: Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
}

impl WsChannel {
    fn new(tx: SplitSink<WebSocket, Message>) -> Self {
        Self { tx: Mutex::new(tx), closed: AtomicBool::new(false) }
    }
}

impl Channel for WsChannel {
    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(anyhow::anyhow!("channel is closed"));
        }
        let mut tx = self.tx.lock().await;
        tx.send(Message::Text(text.into()))
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    async fn close(&self, code: u16) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut tx = self.tx.lock().await;
        let _ = tx
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: "session closed".into(),
            })))
            .await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

async fn ws_connect(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // Authenticate before upgrading; the registry binds the principal to the
    // channel for its whole lifetime.
    let principal = match verify_request(&state, &headers, true, true).await {
        Ok(p) => p.with_peer(Some(addr.to_string())),
        Err(e) => return error_response(&e),
    };

    ws.on_upgrade(move |socket| async move {
        let (tx, mut rx) = socket.split();
        let user_id = principal.user.id;
        let conn_id = state.registry.register(WsChannel::new(tx), principal).await;

        while let Some(Ok(msg)) = rx.next().await {
            match msg {
                Message::Text(text) => {
                    if state.registry.handle_message(user_id, text.as_str()).await {
                        // Recognized control traffic also slides the
                        // server-side session window.
                        state.authority.record_activity(user_id);
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        // Cleanup regardless of which side initiated closure.
        state.registry.remove_if_current(user_id, conn_id).await;
    })
}

#[derive(Debug, Deserialize)]
struct SendNotificationsPayload {
    notifications: Vec<Notification>,
}

/// Push fan-out for feature code (friend requests, notification creation).
/// Delivery is best-effort; callers persist anything that must survive.
async fn send_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SendNotificationsPayload>,
) -> Response {
    if let Err(e) = verify_request(&state, &headers, true, true).await {
        return error_response(&e);
    }
    state.registry.send_notifications(payload.notifications).await;
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}
