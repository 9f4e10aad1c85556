use bproxy_protocol::gemini::{
    Candidate, Content, GenerateContentRequestBody, GenerateContentResponse, GenerationConfig,
    Part, ThinkingConfig, block_none_safety_settings,
};
use bproxy_protocol::openai::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequestBody, ChatDelta, ChunkChoice,
    CompletionChoice, ChatResponseMessage, ContentPart, MessageContent,
};
use bproxy_protocol::sse::{SseDataParser, strip_sse_frame};

#[derive(Debug, Clone, Copy, Default)]
pub struct TranslateOptions {
    pub include_thoughts: bool,
}

/// Map an OpenAI chat request onto a Gemini `generateContent` body.
///
/// System messages collapse into a single `systemInstruction`; `assistant`
/// becomes `model`; `data:` image URLs become `inlineData`; any other URL
/// form is dropped.
pub fn to_gemini_request(
    body: &ChatCompletionRequestBody,
    opts: &TranslateOptions,
) -> GenerateContentRequestBody {
    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();

    for message in &body.messages {
        if message.role == "system" {
            system_texts.extend(collect_text(&message.content));
            continue;
        }
        let role = if message.role == "assistant" {
            "model"
        } else {
            message.role.as_str()
        };
        contents.push(Content {
            role: Some(role.to_string()),
            parts: content_to_parts(&message.content),
        });
    }

    let system_instruction = if system_texts.is_empty() {
        None
    } else {
        Some(Content {
            role: None,
            parts: vec![Part::text(system_texts.join("\n"))],
        })
    };

    GenerateContentRequestBody {
        contents,
        system_instruction,
        generation_config: build_generation_config(body, opts),
        safety_settings: Some(block_none_safety_settings()),
    }
}

fn collect_text(content: &MessageContent) -> Vec<String> {
    match content {
        MessageContent::Text(text) => vec![text.clone()],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.clone()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect(),
    }
}

fn content_to_parts(content: &MessageContent) -> Vec<Part> {
    match content {
        MessageContent::Text(text) => vec![Part::text(text.clone())],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(Part::text(text.clone())),
                ContentPart::ImageUrl { image_url } => split_data_uri(&image_url.url)
                    .map(|(mime, data)| Part::inline_data(mime, data)),
            })
            .collect(),
    }
}

/// Split a `data:<mime>;base64,<payload>` URI. Anything else yields `None`.
pub fn split_data_uri(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    if mime.is_empty() || data.is_empty() {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

fn build_generation_config(
    body: &ChatCompletionRequestBody,
    opts: &TranslateOptions,
) -> Option<GenerationConfig> {
    let config = GenerationConfig {
        temperature: body.temperature,
        top_p: body.top_p,
        top_k: body.top_k,
        max_output_tokens: body.max_tokens,
        stop_sequences: body.stop.clone().map(|stop| stop.into_vec()),
        thinking_config: opts.include_thoughts.then(|| ThinkingConfig {
            include_thoughts: Some(true),
        }),
    };

    let any_set = config.temperature.is_some()
        || config.top_p.is_some()
        || config.top_k.is_some()
        || config.max_output_tokens.is_some()
        || config.stop_sequences.is_some()
        || config.thinking_config.is_some();
    any_set.then_some(config)
}

/// Stateful Gemini-stream → OpenAI-chunk translator for one request.
///
/// Input frames arrive as the relay delivered them: usually one SSE frame
/// per call, possibly split or coalesced. The embedded parser keeps partial
/// frames across calls; bare JSON payloads bypass it.
pub struct GeminiToOpenAiStream {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    parser: SseDataParser,
}

impl GeminiToOpenAiStream {
    pub fn new(request_id: &str, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: format!("chatcmpl-{request_id}"),
            model: model.into(),
            created,
            role_sent: false,
            parser: SseDataParser::new(),
        }
    }

    /// Translate one relay chunk into zero or more serialised
    /// `chat.completion.chunk` payloads. Chunks with an empty delta and no
    /// finish reason are suppressed.
    pub fn translate_frame(&mut self, frame: &str) -> Vec<String> {
        let payloads = if frame.contains("data:") {
            self.parser.push_str(frame)
        } else {
            let trimmed = frame.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            }
        };

        payloads
            .iter()
            .filter_map(|payload| self.payload_to_chunk(payload))
            .collect()
    }

    fn payload_to_chunk(&mut self, payload: &str) -> Option<String> {
        let response: GenerateContentResponse = serde_json::from_str(payload).ok()?;
        let candidate = response.candidates.first()?;
        let mut delta = delta_from_parts(candidate, ImageRendering::Placeholder);
        let finish_reason = candidate.finish_reason.clone();

        if delta.is_empty() && finish_reason.is_none() {
            return None;
        }

        if !self.role_sent {
            delta.role = Some("assistant".to_string());
            self.role_sent = true;
        }

        let mut chunk = ChatCompletionChunk::new(&self.id, &self.model, self.created);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        });
        serde_json::to_string(&chunk).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageRendering {
    /// Stream deltas carry a short placeholder.
    Placeholder,
    /// Buffered responses inline the whole image as a Markdown data URI.
    DataUri,
}

fn delta_from_parts(candidate: &Candidate, images: ImageRendering) -> ChatDelta {
    let mut content = String::new();
    let mut reasoning = String::new();

    for part in &candidate.content.parts {
        if part.thought == Some(true) {
            if let Some(text) = &part.text {
                reasoning.push_str(text);
            }
            continue;
        }
        if let Some(inline) = &part.inline_data {
            match images {
                ImageRendering::Placeholder => content.push_str("![Image]"),
                ImageRendering::DataUri => {
                    content.push_str(&format!(
                        "![Image](data:{};base64,{})",
                        inline.mime_type, inline.data
                    ));
                }
            }
            continue;
        }
        if let Some(text) = &part.text {
            content.push_str(text);
        }
    }

    ChatDelta {
        role: None,
        content: (!content.is_empty()).then_some(content),
        reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
    }
}

/// Parse a fake-mode buffered payload: a single JSON document, or a run of
/// SSE frames concatenated by the relay.
fn parse_buffered(payload: &str) -> Vec<GenerateContentResponse> {
    let stripped = strip_sse_frame(payload);
    if let Ok(parsed) = serde_json::from_str::<GenerateContentResponse>(stripped) {
        return vec![parsed];
    }
    if !payload.contains("data:") {
        return Vec::new();
    }
    let mut parser = SseDataParser::new();
    let mut frames = parser.push_str(payload);
    frames.extend(parser.finish());
    frames
        .iter()
        .filter_map(|frame| serde_json::from_str(frame).ok())
        .collect()
}

struct AggregatedReply {
    content: String,
    reasoning: Option<String>,
    finish_reason: String,
}

fn aggregate(payload: &str, images: ImageRendering) -> Option<AggregatedReply> {
    let responses = parse_buffered(payload);
    if responses.is_empty() {
        return None;
    }

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut finish_reason: Option<String> = None;

    for response in &responses {
        let Some(candidate) = response.candidates.first() else {
            continue;
        };
        let delta = delta_from_parts(candidate, images);
        if let Some(text) = delta.content {
            content.push_str(&text);
        }
        if let Some(text) = delta.reasoning_content {
            reasoning.push_str(&text);
        }
        if candidate.finish_reason.is_some() {
            finish_reason = candidate.finish_reason.clone();
        }
    }

    Some(AggregatedReply {
        content,
        reasoning: (!reasoning.is_empty()).then_some(reasoning),
        finish_reason: finish_reason.unwrap_or_else(|| "UNKNOWN".to_string()),
    })
}

/// Build the final `chat.completion` object from a buffered Gemini payload.
pub fn buffered_to_completion(
    payload: &str,
    request_id: &str,
    model: &str,
    created: i64,
) -> Option<ChatCompletion> {
    let reply = aggregate(payload, ImageRendering::DataUri)?;
    Some(ChatCompletion {
        id: format!("chatcmpl-{request_id}"),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![CompletionChoice {
            index: 0,
            message: ChatResponseMessage {
                role: "assistant".to_string(),
                content: reply.content,
                reasoning_content: reply.reasoning,
            },
            finish_reason: reply.finish_reason,
        }],
    })
}

/// Collapse a buffered Gemini payload into one synthesised stream chunk, for
/// clients that asked for a stream while the proxy runs in buffered mode.
pub fn buffered_to_chunk(
    payload: &str,
    request_id: &str,
    model: &str,
    created: i64,
) -> Option<ChatCompletionChunk> {
    let reply = aggregate(payload, ImageRendering::Placeholder)?;
    let mut chunk = ChatCompletionChunk::new(format!("chatcmpl-{request_id}"), model, created);
    chunk.choices.push(ChunkChoice {
        index: 0,
        delta: ChatDelta {
            role: Some("assistant".to_string()),
            content: Some(reply.content),
            reasoning_content: reply.reasoning,
        },
        finish_reason: Some(reply.finish_reason),
    });
    Some(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bproxy_protocol::openai::{ChatMessage, ImageUrl, StopSequences};

    fn request_with(messages: Vec<ChatMessage>) -> ChatCompletionRequestBody {
        ChatCompletionRequestBody {
            model: "gemini-2.5-pro".to_string(),
            messages,
            temperature: Some(0.5),
            top_p: None,
            top_k: None,
            max_tokens: Some(64),
            stop: Some(StopSequences::One("END".to_string())),
            stream: None,
        }
    }

    #[test]
    fn system_messages_merge_into_instruction() {
        let body = request_with(vec![
            ChatMessage {
                role: "system".to_string(),
                content: MessageContent::Text("A".to_string()),
            },
            ChatMessage {
                role: "system".to_string(),
                content: MessageContent::Text("B".to_string()),
            },
            ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Text("hi".to_string()),
            },
        ]);
        let out = to_gemini_request(&body, &TranslateOptions::default());
        let instruction = out.system_instruction.unwrap();
        assert_eq!(instruction.parts[0].text.as_deref(), Some("A\nB"));
        assert_eq!(out.contents.len(), 1);
        assert_eq!(out.contents[0].role.as_deref(), Some("user"));
    }

    #[test]
    fn assistant_maps_to_model_and_images_to_inline_data() {
        let body = request_with(vec![
            ChatMessage {
                role: "assistant".to_string(),
                content: MessageContent::Text("earlier".to_string()),
            },
            ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "hi".to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/png;base64,AAA".to_string(),
                        },
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "https://example.com/x.png".to_string(),
                        },
                    },
                ]),
            },
        ]);
        let out = to_gemini_request(&body, &TranslateOptions::default());
        assert_eq!(out.contents[0].role.as_deref(), Some("model"));
        let user_parts = &out.contents[1].parts;
        assert_eq!(user_parts.len(), 2);
        let inline = user_parts[1].inline_data.as_ref().unwrap();
        assert_eq!(inline.mime_type, "image/png");
        assert_eq!(inline.data, "AAA");
    }

    #[test]
    fn generation_config_copies_sampling_fields() {
        let body = request_with(vec![]);
        let out = to_gemini_request(
            &body,
            &TranslateOptions {
                include_thoughts: true,
            },
        );
        let config = out.generation_config.unwrap();
        assert_eq!(config.temperature, Some(0.5));
        assert_eq!(config.max_output_tokens, Some(64));
        assert_eq!(config.stop_sequences.unwrap(), vec!["END".to_string()]);
        assert_eq!(
            config.thinking_config.unwrap().include_thoughts,
            Some(true)
        );
        assert_eq!(out.safety_settings.unwrap().len(), 4);
    }

    #[test]
    fn stream_translator_maps_text_and_thoughts() {
        let mut translator = GeminiToOpenAiStream::new("req1", "gemini-pro", 7);
        let frame = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[",
            "{\"text\":\"think\",\"thought\":true},{\"text\":\"hello\"}]}}]}\n\n"
        );
        let chunks = translator.translate_frame(frame);
        assert_eq!(chunks.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&chunks[0]).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["id"], "chatcmpl-req1");
        let delta = &value["choices"][0]["delta"];
        assert_eq!(delta["role"], "assistant");
        assert_eq!(delta["content"], "hello");
        assert_eq!(delta["reasoning_content"], "think");
    }

    #[test]
    fn empty_delta_without_finish_is_suppressed() {
        let mut translator = GeminiToOpenAiStream::new("req1", "gemini-pro", 7);
        let chunks =
            translator.translate_frame("data: {\"candidates\":[{\"content\":{\"parts\":[]}}]}\n\n");
        assert!(chunks.is_empty());

        let chunks = translator.translate_frame(
            "data: {\"candidates\":[{\"content\":{\"parts\":[]},\"finishReason\":\"STOP\"}]}\n\n",
        );
        assert_eq!(chunks.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&chunks[0]).unwrap();
        assert_eq!(value["choices"][0]["finish_reason"], "STOP");
    }

    #[test]
    fn buffered_completion_renders_full_image_uri() {
        let payload = concat!(
            "{\"candidates\":[{\"content\":{\"parts\":[",
            "{\"text\":\"look: \"},",
            "{\"inlineData\":{\"mimeType\":\"image/png\",\"data\":\"QUJD\"}}",
            "]},\"finishReason\":\"STOP\"}]}"
        );
        let completion = buffered_to_completion(payload, "req9", "gemini-pro", 0).unwrap();
        let message = &completion.choices[0].message;
        assert_eq!(completion.id, "chatcmpl-req9");
        assert_eq!(
            message.content,
            "look: ![Image](data:image/png;base64,QUJD)"
        );
        assert_eq!(message.reasoning_content, None);
        assert_eq!(completion.choices[0].finish_reason, "STOP");
    }

    #[test]
    fn buffered_aggregation_merges_sse_frames() {
        let payload = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},",
            "\"finishReason\":\"STOP\"}]}\n\n"
        );
        let completion = buffered_to_completion(payload, "req2", "gemini-pro", 0).unwrap();
        assert_eq!(completion.choices[0].message.content, "Hello");
        assert_eq!(completion.choices[0].finish_reason, "STOP");
    }

    #[test]
    fn missing_finish_reason_becomes_unknown() {
        let payload = "{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"x\"}]}}]}";
        let completion = buffered_to_completion(payload, "r", "m", 0).unwrap();
        assert_eq!(completion.choices[0].finish_reason, "UNKNOWN");
    }

    #[test]
    fn text_round_trip_through_both_directions() {
        // OpenAI request → Gemini body, then a synthetic Gemini stream of the
        // reply → OpenAI chunks whose concatenation equals the reply.
        let body = request_with(vec![ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Text("hi".to_string()),
        }]);
        let gemini = to_gemini_request(&body, &TranslateOptions::default());
        assert_eq!(gemini.contents[0].parts[0].text.as_deref(), Some("hi"));

        let reply_pieces = ["Hel", "lo ", "world"];
        let mut translator = GeminiToOpenAiStream::new("rt", "gemini-pro", 0);
        let mut reassembled = String::new();
        for piece in reply_pieces {
            let frame = format!(
                "data: {{\"candidates\":[{{\"content\":{{\"parts\":[{{\"text\":\"{piece}\"}}]}}}}]}}\n\n"
            );
            for chunk in translator.translate_frame(&frame) {
                let value: serde_json::Value = serde_json::from_str(&chunk).unwrap();
                if let Some(text) = value["choices"][0]["delta"]["content"].as_str() {
                    reassembled.push_str(text);
                }
            }
        }
        assert_eq!(reassembled, "Hello world");
    }
}
