use bproxy_protocol::gemini;
use bproxy_protocol::openai::{Model, ModelList};
use bproxy_protocol::sse::strip_sse_frame;

/// Translate a Gemini `models` listing into the OpenAI list shape.
pub fn to_openai_model_list(payload: &str, created: i64) -> Option<ModelList> {
    let parsed: gemini::ModelList = serde_json::from_str(strip_sse_frame(payload)).ok()?;
    Some(ModelList {
        object: "list".to_string(),
        data: parsed
            .models
            .iter()
            .map(|model| Model {
                id: model.bare_id().to_string(),
                object: "model".to_string(),
                created,
                owned_by: "google".to_string(),
            })
            .collect(),
    })
}
