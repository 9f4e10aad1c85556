use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How the in-page relay should consume the upstream response.
///
/// `Real` forwards upstream bytes as they arrive; `Fake` buffers the whole
/// upstream response before handing it back, letting the proxy synthesise a
/// stream (or a plain body) on its own terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    Real,
    Fake,
}

impl StreamingMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "real" => Some(Self::Real),
            "fake" => Some(Self::Fake),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Fake => "fake",
        }
    }
}

/// One proxied HTTP request, framed as a single JSON text message to the
/// in-page relay. `resume_on_prohibit` and `resume_limit` are opaque to the
/// proxy; only the relay script interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequestFrame {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    pub streaming_mode: StreamingMode,
    pub is_generative: bool,
    pub resume_on_prohibit: bool,
    pub resume_limit: u32,
    pub client_wants_stream: bool,
}

/// Relay → proxy event, tagged on `event_type`. Frames that fail to parse
/// (including anything without a `request_id`) are dropped by the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum RelayEvent {
    ResponseHeaders {
        request_id: String,
        status: u16,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Chunk {
        request_id: String,
        data: String,
    },
    Error {
        request_id: String,
        #[serde(default = "default_error_status")]
        status: u16,
        #[serde(default)]
        message: String,
    },
    StreamClose {
        request_id: String,
    },
}

fn default_error_status() -> u16 {
    500
}

impl RelayEvent {
    pub fn request_id(&self) -> &str {
        match self {
            Self::ResponseHeaders { request_id, .. }
            | Self::Chunk { request_id, .. }
            | Self::Error { request_id, .. }
            | Self::StreamClose { request_id } => request_id,
        }
    }
}

/// Proxy → relay control frame asking the page script to abort an upstream
/// call whose client has gone away.
pub fn cancel_frame(request_id: &str) -> String {
    serde_json::json!({
        "event_type": "cancel_request",
        "request_id": request_id,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trip() {
        let raw = r#"{"event_type":"chunk","request_id":"r1","data":"data: {}\n\n"}"#;
        let event: RelayEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.request_id(), "r1");
        match event {
            RelayEvent::Chunk { data, .. } => assert!(data.starts_with("data: ")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn error_status_defaults_to_500() {
        let raw = r#"{"event_type":"error","request_id":"r2","message":"boom"}"#;
        let event: RelayEvent = serde_json::from_str(raw).unwrap();
        match event {
            RelayEvent::Error { status, .. } => assert_eq!(status, 500),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn frame_without_request_id_fails_to_parse() {
        let raw = r#"{"event_type":"stream_close"}"#;
        assert!(serde_json::from_str::<RelayEvent>(raw).is_err());
    }

    #[test]
    fn request_frame_serialises_mode_lowercase() {
        let frame = RelayRequestFrame {
            request_id: "r3".to_string(),
            method: "POST".to_string(),
            path: "/v1beta/models/gemini-pro:generateContent".to_string(),
            headers: Default::default(),
            query_params: Default::default(),
            body: String::new(),
            streaming_mode: StreamingMode::Fake,
            is_generative: true,
            resume_on_prohibit: false,
            resume_limit: 0,
            client_wants_stream: false,
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains(r#""streaming_mode":"fake""#));
    }
}
