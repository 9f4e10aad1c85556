use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use bytes::Bytes;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use bproxy_core::engine::{ProxyCall, RelayHttpResponse, ResponseBody};
use bproxy_core::state::AppState;
use bproxy_protocol::openai::ChatCompletionRequestBody;

/// Public API surface: typed OpenAI routes plus verbatim passthrough for
/// every other path, all behind the API-key gate.
pub fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/models", get(models_list))
        .route("/v1/chat/completions", post(chat_completions))
        .fallback(passthrough)
        .layer(middleware::from_fn_with_state(state.clone(), api_key_auth))
        .with_state(state)
}

async fn api_key_auth(
    State(state): State<Arc<AppState>>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = extract_api_key(req.headers(), req.uri().query())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if !state.config.api_keys.iter().any(|allowed| allowed == &key) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    // Never forward downstream auth material to the relay.
    strip_auth_headers(req.headers_mut());
    strip_key_query(req.uri_mut());
    Ok(next.run(req).await)
}

async fn models_list(State(state): State<Arc<AppState>>) -> Response {
    to_axum_response(state.engine.handle(ProxyCall::ModelsList).await)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionRequestBody>,
) -> Response {
    let call = ProxyCall::ChatCompletions {
        body,
        accept_stream: accepts_event_stream(&headers),
    };
    to_axum_response(state.engine.handle(call).await)
}

async fn passthrough(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query: BTreeMap<String, String> = uri
        .query()
        .and_then(|raw| serde_urlencoded::from_str(raw).ok())
        .unwrap_or_default();

    let call = ProxyCall::Passthrough {
        method: method.as_str().to_string(),
        path: uri.path().to_string(),
        query,
        headers: forwardable_headers(&headers),
        body,
        accept_stream: accepts_event_stream(&headers),
    };
    to_axum_response(state.engine.handle(call).await)
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = header_value(headers, "x-goog-api-key") {
        return Some(value);
    }

    if let Some(auth) = header_value(headers, "authorization") {
        let auth = auth.trim();
        let prefix = "Bearer ";
        if auth.len() > prefix.len() && auth[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = auth[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }

    let raw = query?;
    let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(raw).ok()?;
    pairs
        .into_iter()
        .find(|(name, _)| name == "key")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn strip_auth_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
    headers.remove("x-goog-api-key");
}

fn strip_key_query(uri: &mut Uri) {
    let Some(raw) = uri.query() else { return };
    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(raw) else {
        return;
    };

    let filtered: Vec<(String, String)> =
        pairs.into_iter().filter(|(name, _)| name != "key").collect();
    let Ok(new_query) = serde_urlencoded::to_string(&filtered) else {
        return;
    };

    let path = uri.path();
    let rebuilt = if new_query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{new_query}")
    };
    if let Ok(new_uri) = rebuilt.parse() {
        *uri = new_uri;
    }
}

fn forwardable_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if matches!(
            name.as_str(),
            "host" | "content-length" | "connection" | "transfer-encoding" | "accept-encoding"
        ) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.insert(name, value.to_string());
        }
    }
    out
}

fn to_axum_response(resp: RelayHttpResponse) -> Response {
    let mut builder = Response::builder().status(resp.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in resp.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }
    }

    let body = match resp.body {
        ResponseBody::Bytes(bytes) => Body::from(bytes),
        ResponseBody::Stream(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            Body::from_stream(stream)
        }
    };

    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response build failed").into_response()
    })
}
