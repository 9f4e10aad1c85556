use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use rand::Rng;
use serde::Deserialize;

use bproxy_core::rotation::{RotationError, SwitchOutcome};
use bproxy_core::state::AppState;
use bproxy_protocol::StreamingMode;

const SESSION_COOKIE: &str = "bproxy_session";

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    sessions: Arc<Mutex<HashSet<String>>>,
}

/// Control surface behind its own session-cookie login, separate from the
/// API-key gate on the proxy routes.
pub fn admin_router(app: Arc<AppState>) -> Router {
    let state = AdminState {
        app,
        sessions: Arc::new(Mutex::new(HashSet::new())),
    };

    let protected = Router::new()
        .route("/api/status", get(status))
        .route("/api/switch-account", post(switch_account))
        .route("/api/set-mode", post(set_mode))
        .route("/api/toggle-reasoning", post(toggle_reasoning))
        .route("/api/toggle-native-reasoning", post(toggle_native_reasoning))
        .route("/api/toggle-redirect-25-30", post(toggle_redirect))
        .route("/api/set-resume-config", post(set_resume_config))
        .layer(middleware::from_fn_with_state(state.clone(), session_auth))
        .with_state(state.clone());

    Router::new()
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .with_state(state)
        .merge(protected)
}

async fn session_auth(
    State(state): State<AdminState>,
    req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let token =
        session_token(req.headers()).ok_or(StatusCode::UNAUTHORIZED)?;
    let known = state
        .sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(&token);
    if !known {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    password: String,
}

async fn login(
    State(state): State<AdminState>,
    Json(body): Json<LoginBody>,
) -> Response {
    let authorised = state
        .app
        .config
        .api_keys
        .iter()
        .any(|key| key == &body.password);
    if !authorised {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "ok": false, "reason": "bad password" })),
        )
            .into_response();
    }

    let token = mint_session_token();
    state
        .sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(token.clone());

    let cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict");
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({ "ok": true })),
    )
        .into_response()
}

async fn logout(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        state
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token);
    }
    let cookie = format!("{SESSION_COOKIE}=; Path=/; Max-Age=0");
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({ "ok": true })),
    )
        .into_response()
}

fn mint_session_token() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..32)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.app.status())
}

#[derive(Debug, Deserialize)]
struct SwitchAccountBody {
    #[serde(rename = "targetIndex")]
    target_index: Option<u32>,
}

async fn switch_account(
    State(state): State<AdminState>,
    body: Option<Json<SwitchAccountBody>>,
) -> Response {
    let target = body.and_then(|Json(body)| body.target_index);
    if let Some(index) = target {
        if !state.app.store.contains(index) {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "ok": false,
                    "reason": format!("unknown auth index {index}"),
                })),
            )
                .into_response();
        }
    }

    match state.app.rotation.manual_switch(target).await {
        Ok(SwitchOutcome::Completed { from, to }) => Json(serde_json::json!({
            "ok": true,
            "result": "completed",
            "from": from,
            "currentAuthIndex": to,
        }))
        .into_response(),
        Ok(SwitchOutcome::Deferred { target }) => Json(serde_json::json!({
            "ok": true,
            "result": "deferred",
            "targetIndex": target,
        }))
        .into_response(),
        Ok(SwitchOutcome::AlreadyInProgress) => Json(serde_json::json!({
            "ok": false,
            "result": "in_progress",
            "reason": "a switch is already running",
        }))
        .into_response(),
        Err(RotationError::RolledBack(message)) => Json(serde_json::json!({
            "ok": false,
            "result": "rolled_back",
            "reason": message,
            "currentAuthIndex": state.app.rotation.current_index(),
        }))
        .into_response(),
        Err(error) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ok": false, "reason": error.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SetModeBody {
    mode: String,
}

async fn set_mode(
    State(state): State<AdminState>,
    Json(body): Json<SetModeBody>,
) -> Response {
    let Some(mode) = StreamingMode::parse(&body.mode) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "ok": false, "reason": "mode must be real or fake" })),
        )
            .into_response();
    };
    state.app.flags.set_streaming_mode(mode);
    Json(serde_json::json!({ "ok": true, "streamingMode": mode })).into_response()
}

async fn toggle_reasoning(State(state): State<AdminState>) -> impl IntoResponse {
    let value = state.app.flags.toggle_openai_reasoning();
    Json(serde_json::json!({ "ok": true, "openaiReasoning": value }))
}

async fn toggle_native_reasoning(State(state): State<AdminState>) -> impl IntoResponse {
    let value = state.app.flags.toggle_native_reasoning();
    Json(serde_json::json!({ "ok": true, "nativeReasoning": value }))
}

async fn toggle_redirect(State(state): State<AdminState>) -> impl IntoResponse {
    let value = state.app.flags.toggle_redirect_25_to_30();
    Json(serde_json::json!({ "ok": true, "redirect25To30": value }))
}

#[derive(Debug, Deserialize)]
struct ResumeConfigBody {
    limit: u32,
}

async fn set_resume_config(
    State(state): State<AdminState>,
    Json(body): Json<ResumeConfigBody>,
) -> impl IntoResponse {
    state.app.flags.set_resume_limit(body.limit);
    let flags = state.app.flags.snapshot();
    Json(serde_json::json!({
        "ok": true,
        "resumeLimit": flags.resume_limit,
        "enableResume": flags.enable_resume,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn session_cookie_is_parsed_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("other=1; bproxy_session=tok123; x=2"),
        );
        assert_eq!(session_token(&headers).as_deref(), Some("tok123"));

        headers.insert(header::COOKIE, HeaderValue::from_static("other=1"));
        assert_eq!(session_token(&headers), None);
    }

    #[test]
    fn session_tokens_are_long_and_distinct() {
        let a = mint_session_token();
        let b = mint_session_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
