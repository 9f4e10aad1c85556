use serde_json::Value;

/// Rewrite `inlineData` parts of a Gemini response body into Markdown image
/// parts, in place. Returns `None` when the body is not JSON, in which case
/// callers pass the original bytes through untouched.
pub fn rewrite_inline_images(body: &str) -> Option<String> {
    let mut value: Value = serde_json::from_str(body).ok()?;
    let mut changed = false;

    if let Some(candidates) = value.get_mut("candidates").and_then(Value::as_array_mut) {
        for candidate in candidates {
            let Some(parts) = candidate
                .get_mut("content")
                .and_then(|content| content.get_mut("parts"))
                .and_then(Value::as_array_mut)
            else {
                continue;
            };
            for part in parts {
                let Some(inline) = part.get("inlineData") else {
                    continue;
                };
                let mime = inline
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                let data = inline.get("data").and_then(Value::as_str).unwrap_or("");
                let markdown = format!("![image](data:{mime};base64,{data})");
                *part = serde_json::json!({ "text": markdown });
                changed = true;
            }
        }
    }

    if changed {
        serde_json::to_string(&value).ok()
    } else {
        Some(body.to_string())
    }
}
