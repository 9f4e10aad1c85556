use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;

use bproxy_protocol::openai::ChatCompletionRequestBody;
use bproxy_protocol::sse::{done_frame, encode_data_frame, keep_alive_frame};
use bproxy_protocol::{RelayRequestFrame, StreamingMode};
use bproxy_relay::{DequeueError, QueueItem, RelayChannel, RequestQueue};
use bproxy_transform::chat::{self, GeminiToOpenAiStream, TranslateOptions};
use bproxy_transform::{images, models};

use crate::events::{EventHub, ProxyEvent};
use crate::flags::FlagStore;
use crate::rotation::RotationController;

pub const GENERAL_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(600);
pub const STREAM_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);
pub const BUFFERED_RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);
pub const MODEL_LIST_TIMEOUT: Duration = Duration::from_secs(60);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(3);

const MODEL_REDIRECT_FROM: &str = "gemini-2.5-pro";
const MODEL_REDIRECT_TO: &str = "gemini-3-pro-preview";

/// One downstream HTTP call, already routed and authenticated.
pub enum ProxyCall {
    ChatCompletions {
        body: ChatCompletionRequestBody,
        accept_stream: bool,
    },
    ModelsList,
    Passthrough {
        method: String,
        path: String,
        query: BTreeMap<String, String>,
        headers: BTreeMap<String, String>,
        body: Bytes,
        accept_stream: bool,
    },
}

pub struct RelayHttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

pub enum ResponseBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

impl RelayHttpResponse {
    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: ResponseBody::Bytes(Bytes::from(value.to_string())),
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::json(
            status,
            serde_json::json!({ "error": { "code": status, "message": message } }),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Gemini,
    OpenAi,
}

struct PreparedRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    query: BTreeMap<String, String>,
    body: String,
    is_generative: bool,
    wants_stream: bool,
    dialect: Dialect,
    model: String,
}

/// Drives accepted requests through the relay: strategy selection, retries,
/// timeouts, translation at the payload boundary, and exact-once
/// finalisation against the rotation controller.
#[derive(Clone)]
pub struct ProxyEngine {
    channel: Arc<RelayChannel>,
    rotation: Arc<RotationController>,
    flags: Arc<FlagStore>,
    events: EventHub,
    max_retries: u32,
    retry_delay: Duration,
}

impl ProxyEngine {
    pub fn new(
        channel: Arc<RelayChannel>,
        rotation: Arc<RotationController>,
        flags: Arc<FlagStore>,
        events: EventHub,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            channel,
            rotation,
            flags,
            events,
            max_retries,
            retry_delay,
        }
    }

    pub async fn handle(&self, call: ProxyCall) -> RelayHttpResponse {
        match call {
            ProxyCall::ChatCompletions {
                body,
                accept_stream,
            } => self.handle_chat_completions(body, accept_stream).await,
            ProxyCall::ModelsList => self.handle_models_list().await,
            ProxyCall::Passthrough {
                method,
                path,
                query,
                headers,
                body,
                accept_stream,
            } => {
                self.handle_passthrough(method, path, query, headers, body, accept_stream)
                    .await
            }
        }
    }

    async fn handle_chat_completions(
        &self,
        body: ChatCompletionRequestBody,
        accept_stream: bool,
    ) -> RelayHttpResponse {
        let flags = self.flags.snapshot();
        let wants_stream = body.wants_stream() || accept_stream;

        let mut model = body.model.clone();
        if flags.redirect_25_to_30 && model.contains(MODEL_REDIRECT_FROM) {
            model = model.replace(MODEL_REDIRECT_FROM, MODEL_REDIRECT_TO);
        }

        let translated = chat::to_gemini_request(
            &body,
            &TranslateOptions {
                include_thoughts: flags.openai_reasoning,
            },
        );
        let body_text = match serde_json::to_string(&translated) {
            Ok(text) => text,
            Err(error) => {
                return RelayHttpResponse::error(500, format!("request translation failed: {error}"));
            }
        };

        let action = if wants_stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let mut query = BTreeMap::new();
        if wants_stream {
            query.insert("alt".to_string(), "sse".to_string());
        }

        let prepared = PreparedRequest {
            method: "POST".to_string(),
            path: format!("/v1beta/models/{model}:{action}"),
            headers: BTreeMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            query,
            body: body_text,
            is_generative: true,
            wants_stream,
            dialect: Dialect::OpenAi,
            model,
        };
        self.execute(prepared).await
    }

    async fn handle_passthrough(
        &self,
        method: String,
        mut path: String,
        query: BTreeMap<String, String>,
        headers: BTreeMap<String, String>,
        body: Bytes,
        accept_stream: bool,
    ) -> RelayHttpResponse {
        let flags = self.flags.snapshot();
        let mut body_text = String::from_utf8_lossy(&body).into_owned();

        let is_generative = method.eq_ignore_ascii_case("POST")
            && (path.contains(":generateContent") || path.contains(":streamGenerateContent"));
        let wants_stream = path.contains(":streamGenerateContent") || accept_stream;

        if flags.redirect_25_to_30 && path.contains(MODEL_REDIRECT_FROM) {
            path = path.replace(MODEL_REDIRECT_FROM, MODEL_REDIRECT_TO);
        }
        if is_generative && flags.native_reasoning {
            body_text = inject_include_thoughts(body_text);
        }

        let model = model_from_path(&path);
        let prepared = PreparedRequest {
            method,
            path,
            headers,
            query,
            body: body_text,
            is_generative,
            wants_stream,
            dialect: Dialect::Gemini,
            model,
        };
        self.execute(prepared).await
    }

    async fn handle_models_list(&self) -> RelayHttpResponse {
        let prepared = PreparedRequest {
            method: "GET".to_string(),
            path: "/v1beta/models".to_string(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: String::new(),
            is_generative: false,
            wants_stream: false,
            dialect: Dialect::Gemini,
            model: String::new(),
        };

        let mut guard = match self.admit(&prepared).await {
            Ok(guard) => guard,
            Err(response) => return response,
        };
        if !self.channel.is_connected() {
            return RelayHttpResponse::error(503, "relay disconnected");
        }

        match self
            .relay_buffered(&prepared, &mut guard, MODEL_LIST_TIMEOUT, None)
            .await
        {
            Collect::Done { body, .. } => {
                self.rotation.record_success();
                match models::to_openai_model_list(&body, epoch_secs()) {
                    Some(list) => match serde_json::to_value(&list) {
                        Ok(value) => RelayHttpResponse::json(200, value),
                        Err(error) => RelayHttpResponse::error(502, error.to_string()),
                    },
                    None => RelayHttpResponse::error(502, "model list translation failed"),
                }
            }
            Collect::Failed { status, message } => {
                if !message.contains("aborted") {
                    self.rotation.record_failure(status);
                }
                RelayHttpResponse::error(status, message)
            }
            Collect::TimedOut => RelayHttpResponse::error(504, "model list timed out"),
            Collect::Closed => RelayHttpResponse::error(503, "relay connection lost"),
            Collect::NotConnected => RelayHttpResponse::error(503, "relay disconnected"),
        }
    }

    /// Acceptance gate plus one-shot relay auto-recovery. Returns a guard
    /// bound to the accepted request, or the rejection to surface.
    async fn admit(&self, prepared: &PreparedRequest) -> Result<RequestGuard, RelayHttpResponse> {
        if let Err(error) = self.rotation.try_accept(prepared.is_generative) {
            tracing::debug!(%error, path = %prepared.path, "request rejected");
            return Err(RelayHttpResponse::error(503, error.to_string()));
        }
        let guard = RequestGuard::new(
            Arc::clone(&self.channel),
            Arc::clone(&self.rotation),
        );

        if !self.channel.is_connected() && !self.rotation.is_system_busy() {
            if let Err(error) = self.rotation.recover().await {
                tracing::warn!(%error, "relay auto-recovery failed");
            }
        }
        Ok(guard)
    }

    async fn execute(&self, prepared: PreparedRequest) -> RelayHttpResponse {
        let guard = match self.admit(&prepared).await {
            Ok(guard) => guard,
            Err(response) => return response,
        };
        if !self.channel.is_connected() {
            return RelayHttpResponse::error(503, "relay disconnected");
        }

        if prepared.wants_stream {
            match self.flags.snapshot().streaming_mode {
                StreamingMode::Real => self.real_stream(prepared, guard).await,
                StreamingMode::Fake => self.pseudo_stream(prepared, guard),
            }
        } else {
            self.non_streaming(prepared, guard).await
        }
    }

    fn build_frame(
        &self,
        prepared: &PreparedRequest,
        request_id: &str,
        mode: StreamingMode,
    ) -> RelayRequestFrame {
        let flags = self.flags.snapshot();
        RelayRequestFrame {
            request_id: request_id.to_string(),
            method: prepared.method.clone(),
            path: prepared.path.clone(),
            headers: prepared.headers.clone(),
            query_params: prepared.query.clone(),
            body: prepared.body.clone(),
            streaming_mode: mode,
            is_generative: prepared.is_generative,
            resume_on_prohibit: flags.enable_resume,
            resume_limit: flags.resume_limit,
            client_wants_stream: prepared.wants_stream,
        }
    }

    // ---- Real streaming ----

    async fn real_stream(
        &self,
        prepared: PreparedRequest,
        mut guard: RequestGuard,
    ) -> RelayHttpResponse {
        let request_id = mint_request_id();
        guard.attach(request_id.clone());
        let Some(mut queue) = guard.take_queue() else {
            return RelayHttpResponse::error(500, "request queue missing");
        };
        let frame = self.build_frame(&prepared, &request_id, StreamingMode::Real);

        if let Err(error) = self.channel.send_request(&frame) {
            guard.settle();
            return RelayHttpResponse::error(503, format!("relay send failed: {error}"));
        }
        self.events.emit(ProxyEvent::RequestAccepted {
            request_id: request_id.clone(),
            path: prepared.path.clone(),
            streaming: true,
        });

        match queue.recv(GENERAL_DEQUEUE_TIMEOUT).await {
            Ok(QueueItem::Headers { status, headers }) => {
                let (tx, rx) = mpsc::channel::<Bytes>(32);
                let engine = self.clone();
                tokio::spawn(async move {
                    engine
                        .drain_real_stream(prepared, request_id, queue, guard, tx)
                        .await;
                });
                RelayHttpResponse {
                    status,
                    headers: stream_response_headers(headers),
                    body: ResponseBody::Stream(rx),
                }
            }
            Ok(QueueItem::Error { status, message }) => {
                guard.settle();
                if !message.contains("aborted") {
                    self.rotation.record_failure(status);
                }
                self.events.emit(ProxyEvent::RequestFailed {
                    request_id,
                    status,
                    message: message.clone(),
                });
                RelayHttpResponse::error(status, message)
            }
            Ok(_) => {
                guard.settle();
                RelayHttpResponse::error(502, "relay sent data before response headers")
            }
            Err(DequeueError::Timeout) => {
                RelayHttpResponse::error(504, "timed out waiting for relay response")
            }
            Err(DequeueError::Closed) => {
                guard.settle();
                RelayHttpResponse::error(503, "relay connection lost")
            }
        }
    }

    async fn drain_real_stream(
        &self,
        prepared: PreparedRequest,
        request_id: String,
        mut queue: RequestQueue,
        mut guard: RequestGuard,
        tx: mpsc::Sender<Bytes>,
    ) {
        let mut translator = match prepared.dialect {
            Dialect::OpenAi => Some(GeminiToOpenAiStream::new(
                &request_id,
                prepared.model.clone(),
                epoch_secs(),
            )),
            Dialect::Gemini => None,
        };
        let mut last_finish_reason: Option<String> = None;

        loop {
            match queue.recv(STREAM_CHUNK_TIMEOUT).await {
                Ok(QueueItem::Chunk(data)) => {
                    if let Some(reason) = scrape_finish_reason(&data) {
                        last_finish_reason = Some(reason);
                    }
                    let frames: Vec<Bytes> = match translator.as_mut() {
                        Some(translator) => translator
                            .translate_frame(&data)
                            .iter()
                            .map(|chunk| encode_data_frame(chunk))
                            .collect(),
                        None => vec![Bytes::from(data)],
                    };
                    for frame in frames {
                        if tx.send(frame).await.is_err() {
                            // Client went away; the guard cancels upstream.
                            return;
                        }
                    }
                }
                Ok(QueueItem::StreamEnd) => {
                    if translator.is_some() {
                        let _ = tx.send(done_frame()).await;
                    }
                    guard.settle();
                    self.rotation.record_success();
                    self.events.emit(ProxyEvent::RequestCompleted {
                        request_id,
                        status: 200,
                        finish_reason: last_finish_reason,
                    });
                    guard.finish();
                    return;
                }
                Ok(QueueItem::Error { status, message }) => {
                    guard.settle();
                    if !message.contains("aborted") {
                        self.rotation.record_failure(status);
                    }
                    self.events.emit(ProxyEvent::RequestFailed {
                        request_id,
                        status,
                        message: message.clone(),
                    });
                    let _ = tx.send(sse_error_chunk(status, &message)).await;
                    guard.finish();
                    return;
                }
                Ok(QueueItem::Headers { .. }) => continue,
                Err(DequeueError::Timeout) => {
                    self.events.emit(ProxyEvent::RequestFailed {
                        request_id,
                        status: 504,
                        message: "stream stalled past chunk timeout".to_string(),
                    });
                    // Guard drop cancels the upstream call.
                    return;
                }
                Err(DequeueError::Closed) => {
                    self.events.emit(ProxyEvent::RequestFailed {
                        request_id,
                        status: 503,
                        message: "relay connection lost mid-stream".to_string(),
                    });
                    return;
                }
            }
        }
    }

    // ---- Pseudo ("fake") streaming ----

    fn pseudo_stream(&self, prepared: PreparedRequest, guard: RequestGuard) -> RelayHttpResponse {
        let (tx, rx) = mpsc::channel::<Bytes>(32);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_pseudo_stream(prepared, guard, tx).await;
        });
        RelayHttpResponse {
            status: 200,
            headers: sse_headers(),
            body: ResponseBody::Stream(rx),
        }
    }

    async fn run_pseudo_stream(
        &self,
        prepared: PreparedRequest,
        mut guard: RequestGuard,
        tx: mpsc::Sender<Bytes>,
    ) {
        let heartbeat_tx = tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(keep_alive_frame()).await.is_err() {
                    break;
                }
            }
        });

        let outcome = self.pseudo_attempts(&prepared, &mut guard, &tx).await;
        heartbeat.abort();

        match outcome {
            PseudoOutcome::Success {
                request_id,
                payload,
            } => {
                let frame = match prepared.dialect {
                    Dialect::OpenAi => chat::buffered_to_chunk(
                        &payload,
                        &request_id,
                        &prepared.model,
                        epoch_secs(),
                    )
                    .and_then(|chunk| serde_json::to_string(&chunk).ok())
                    .map(|chunk| encode_data_frame(&chunk))
                    .unwrap_or_else(|| encode_data_frame(&payload)),
                    Dialect::Gemini => encode_data_frame(&payload),
                };
                if tx.send(frame).await.is_ok() {
                    let _ = tx.send(done_frame()).await;
                }
                self.events.emit(ProxyEvent::RequestCompleted {
                    request_id,
                    status: 200,
                    finish_reason: scrape_finish_reason(&payload),
                });
                guard.finish();
            }
            PseudoOutcome::Failed {
                request_id,
                status,
                message,
            } => {
                self.events.emit(ProxyEvent::RequestFailed {
                    request_id,
                    status,
                    message: message.clone(),
                });
                let _ = tx.send(sse_error_chunk(status, &message)).await;
                guard.finish();
            }
            PseudoOutcome::Aborted => {
                guard.finish();
            }
            PseudoOutcome::ClientGone | PseudoOutcome::Stalled => {
                // Guard drop sends the cancel frame.
            }
        }
    }

    async fn pseudo_attempts(
        &self,
        prepared: &PreparedRequest,
        guard: &mut RequestGuard,
        tx: &mpsc::Sender<Bytes>,
    ) -> PseudoOutcome {
        let mut attempt: u32 = 0;
        loop {
            let request_id = mint_request_id();
            guard.attach(request_id.clone());
            let frame = self.build_frame(prepared, &request_id, StreamingMode::Fake);

            if self.channel.send_request(&frame).is_err() {
                guard.settle();
                return PseudoOutcome::Failed {
                    request_id,
                    status: 503,
                    message: "relay disconnected".to_string(),
                };
            }
            if attempt == 0 {
                self.events.emit(ProxyEvent::RequestAccepted {
                    request_id: request_id.clone(),
                    path: prepared.path.clone(),
                    streaming: true,
                });
            }

            let collected = self
                .relay_buffered_attached(guard, BUFFERED_RESPONSE_TIMEOUT, Some(tx))
                .await;

            match collected {
                Collect::Done { body, .. } => {
                    self.rotation.record_success();
                    return PseudoOutcome::Success {
                        request_id,
                        payload: body,
                    };
                }
                Collect::Failed { status, message } => {
                    // Client cancellation is surfaced by the relay as an
                    // "aborted" error; never retried, never counted.
                    if message.contains("aborted") {
                        return PseudoOutcome::Aborted;
                    }
                    self.rotation.record_failure(status);
                    attempt += 1;
                    if attempt > self.max_retries {
                        return PseudoOutcome::Failed {
                            request_id,
                            status,
                            message,
                        };
                    }
                    tracing::info!(
                        %request_id,
                        attempt,
                        status,
                        "retrying buffered relay request"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Collect::TimedOut => return PseudoOutcome::Stalled,
                Collect::Closed => {
                    return PseudoOutcome::Failed {
                        request_id,
                        status: 503,
                        message: "relay connection lost".to_string(),
                    };
                }
                Collect::NotConnected => {
                    return PseudoOutcome::Failed {
                        request_id,
                        status: 503,
                        message: "relay disconnected".to_string(),
                    };
                }
            }

            if tx.is_closed() {
                return PseudoOutcome::ClientGone;
            }
        }
    }

    // ---- Non-streaming ----

    async fn non_streaming(
        &self,
        prepared: PreparedRequest,
        mut guard: RequestGuard,
    ) -> RelayHttpResponse {
        let collected = self
            .relay_buffered(&prepared, &mut guard, BUFFERED_RESPONSE_TIMEOUT, None)
            .await;
        let request_id = guard.request_id().unwrap_or_default().to_string();

        match collected {
            Collect::Done { status, body } => {
                self.rotation.record_success();
                self.events.emit(ProxyEvent::RequestCompleted {
                    request_id: request_id.clone(),
                    status,
                    finish_reason: scrape_finish_reason(&body),
                });
                match prepared.dialect {
                    Dialect::OpenAi => {
                        match chat::buffered_to_completion(
                            &body,
                            &request_id,
                            &prepared.model,
                            epoch_secs(),
                        )
                        .and_then(|completion| serde_json::to_value(&completion).ok())
                        {
                            Some(value) => RelayHttpResponse::json(200, value),
                            None => RelayHttpResponse::error(502, "response translation failed"),
                        }
                    }
                    Dialect::Gemini => {
                        let body = images::rewrite_inline_images(&body).unwrap_or(body);
                        RelayHttpResponse {
                            status,
                            headers: vec![(
                                "content-type".to_string(),
                                "application/json".to_string(),
                            )],
                            body: ResponseBody::Bytes(Bytes::from(body)),
                        }
                    }
                }
            }
            Collect::Failed { status, message } => {
                if !message.contains("aborted") {
                    self.rotation.record_failure(status);
                }
                self.events.emit(ProxyEvent::RequestFailed {
                    request_id,
                    status,
                    message: message.clone(),
                });
                RelayHttpResponse::error(status, message)
            }
            Collect::TimedOut => RelayHttpResponse::error(504, "relay response timed out"),
            Collect::Closed => RelayHttpResponse::error(503, "relay connection lost"),
            Collect::NotConnected => RelayHttpResponse::error(503, "relay disconnected"),
        }
    }

    /// Send a buffered (`fake` mode) relay request and collect the whole
    /// response body under one overall deadline.
    async fn relay_buffered(
        &self,
        prepared: &PreparedRequest,
        guard: &mut RequestGuard,
        overall: Duration,
        client: Option<&mpsc::Sender<Bytes>>,
    ) -> Collect {
        let request_id = mint_request_id();
        guard.attach(request_id.clone());
        let frame = self.build_frame(prepared, &request_id, StreamingMode::Fake);
        if self.channel.send_request(&frame).is_err() {
            guard.settle();
            return Collect::NotConnected;
        }
        self.events.emit(ProxyEvent::RequestAccepted {
            request_id,
            path: prepared.path.clone(),
            streaming: false,
        });
        self.relay_buffered_attached(guard, overall, client).await
    }

    /// Collect the response for the request the guard is currently attached
    /// to. `client` allows bailing out early once the downstream consumer is
    /// gone.
    async fn relay_buffered_attached(
        &self,
        guard: &mut RequestGuard,
        overall: Duration,
        client: Option<&mpsc::Sender<Bytes>>,
    ) -> Collect {
        let Some(mut queue) = guard.take_queue() else {
            return Collect::NotConnected;
        };
        let deadline = Instant::now() + overall;
        let mut status: u16 = 200;
        let mut body = String::new();

        loop {
            if let Some(client) = client {
                if client.is_closed() {
                    return Collect::TimedOut;
                }
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return Collect::TimedOut,
            };
            match queue.recv(remaining.min(Duration::from_secs(1))).await {
                Ok(QueueItem::Headers {
                    status: upstream, ..
                }) => status = upstream,
                Ok(QueueItem::Chunk(data)) => body.push_str(&data),
                Ok(QueueItem::StreamEnd) => {
                    guard.settle();
                    return Collect::Done { status, body };
                }
                Ok(QueueItem::Error {
                    status: upstream,
                    message,
                }) => {
                    guard.settle();
                    return Collect::Failed {
                        status: upstream,
                        message,
                    };
                }
                Err(DequeueError::Timeout) => continue,
                Err(DequeueError::Closed) => return Collect::Closed,
            }
        }
    }
}

enum Collect {
    Done { status: u16, body: String },
    Failed { status: u16, message: String },
    TimedOut,
    Closed,
    NotConnected,
}

enum PseudoOutcome {
    Success { request_id: String, payload: String },
    Failed { request_id: String, status: u16, message: String },
    Aborted,
    ClientGone,
    Stalled,
}

/// Ensures every accepted request is finalised exactly once, and that a
/// request dropped mid-flight (client disconnect, task cancellation) emits a
/// `cancel_request` frame before its queue is torn down.
struct RequestGuard {
    channel: Arc<RelayChannel>,
    rotation: Arc<RotationController>,
    request_id: Option<String>,
    queue: Option<RequestQueue>,
    in_flight: bool,
    finished: bool,
}

impl RequestGuard {
    fn new(channel: Arc<RelayChannel>, rotation: Arc<RotationController>) -> Self {
        Self {
            channel,
            rotation,
            request_id: None,
            queue: None,
            in_flight: false,
            finished: false,
        }
    }

    /// Bind the guard to a freshly minted relay request, creating its queue.
    /// A previously attached request is cleaned up first.
    fn attach(&mut self, request_id: String) {
        if let Some(old) = self.request_id.take() {
            self.channel.multiplexer().remove_queue(&old);
        }
        self.queue = Some(self.channel.multiplexer().create_queue(&request_id));
        self.request_id = Some(request_id);
        self.in_flight = true;
    }

    fn take_queue(&mut self) -> Option<RequestQueue> {
        self.queue.take()
    }

    fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// The relay round trip reached a terminal event; no cancel needed.
    fn settle(&mut self) {
        self.in_flight = false;
    }

    fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(request_id) = self.request_id.take() {
            if self.in_flight {
                let _ = self.channel.send_cancel(&request_id);
            }
            self.channel.multiplexer().remove_queue(&request_id);
        }
        self.rotation.finalize();
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.complete();
    }
}

// ---- Helpers ----

fn mint_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    let mut rng = rand::rng();
    let suffix: String = (0..9)
        .map(|_| {
            const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
            ALPHABET[rng.random_range(0..ALPHABET.len())] as char
        })
        .collect();
    format!("{millis}_{suffix}")
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Best-effort `finishReason` extraction for logging. Never fails loudly.
fn scrape_finish_reason(data: &str) -> Option<String> {
    let index = data.find("\"finishReason\"")?;
    let rest = &data[index + "\"finishReason\"".len()..];
    let rest = rest[rest.find(':')? + 1..].trim_start();
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn inject_include_thoughts(body: String) -> String {
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&body) else {
        return body;
    };
    let Some(object) = value.as_object_mut() else {
        return body;
    };
    let config = object
        .entry("generationConfig")
        .or_insert_with(|| serde_json::json!({}));
    if let Some(config) = config.as_object_mut() {
        let thinking = config
            .entry("thinkingConfig")
            .or_insert_with(|| serde_json::json!({}));
        if let Some(thinking) = thinking.as_object_mut() {
            thinking.insert("includeThoughts".to_string(), serde_json::Value::Bool(true));
        }
    }
    serde_json::to_string(&value).unwrap_or(body)
}

fn model_from_path(path: &str) -> String {
    path.rsplit('/')
        .next()
        .and_then(|segment| segment.split(':').next())
        .unwrap_or_default()
        .to_string()
}

fn stream_response_headers(upstream: BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = upstream
        .into_iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case("content-length")
                && !name.eq_ignore_ascii_case("content-type")
                && !name.eq_ignore_ascii_case("transfer-encoding")
                && !name.eq_ignore_ascii_case("connection")
        })
        .collect();
    out.extend(sse_headers());
    out
}

fn sse_headers() -> Vec<(String, String)> {
    vec![
        ("content-type".to_string(), "text/event-stream".to_string()),
        ("cache-control".to_string(), "no-cache".to_string()),
        ("connection".to_string(), "keep-alive".to_string()),
    ]
}

fn sse_error_chunk(status: u16, message: &str) -> Bytes {
    let payload = serde_json::json!({
        "error": { "code": status, "message": message }
    });
    encode_data_frame(&payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_follow_the_documented_shape() {
        let id = mint_request_id();
        let (millis, suffix) = id.split_once('_').unwrap();
        assert!(millis.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(suffix.len(), 9);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn finish_reason_scraper_tolerates_noise() {
        assert_eq!(
            scrape_finish_reason(r#"data: {"candidates":[{"finishReason":"STOP"}]}"#),
            Some("STOP".to_string())
        );
        assert_eq!(scrape_finish_reason("no reason here"), None);
        assert_eq!(scrape_finish_reason(r#""finishReason": 12"#), None);
    }

    #[test]
    fn thinking_config_injection_preserves_existing_fields() {
        let body = r#"{"contents":[],"generationConfig":{"temperature":0.1}}"#;
        let out = inject_include_thoughts(body.to_string());
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["generationConfig"]["temperature"], 0.1);
        assert_eq!(
            value["generationConfig"]["thinkingConfig"]["includeThoughts"],
            true
        );

        let untouched = inject_include_thoughts("not json".to_string());
        assert_eq!(untouched, "not json");
    }

    #[test]
    fn stream_headers_strip_framing_and_force_sse() {
        let upstream = BTreeMap::from([
            ("content-length".to_string(), "42".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
            ("x-upstream".to_string(), "yes".to_string()),
        ]);
        let headers = stream_response_headers(upstream);
        assert!(headers.iter().all(|(name, _)| name != "content-length"));
        assert!(headers
            .iter()
            .any(|(name, value)| name == "content-type" && value == "text/event-stream"));
        assert!(headers
            .iter()
            .any(|(name, value)| name == "x-upstream" && value == "yes"));
    }

    #[test]
    fn model_extraction_from_path() {
        assert_eq!(
            model_from_path("/v1beta/models/gemini-pro:streamGenerateContent"),
            "gemini-pro"
        );
        assert_eq!(model_from_path("/v1beta/models"), "models");
    }
}
