use axum::http::header;
use axum::response::{IntoResponse, Response};

const CONSOLE_HTML: &str = include_str!("console.html");

pub async fn console() -> Response {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], CONSOLE_HTML).into_response()
}
