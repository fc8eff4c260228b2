//! Recovering JSON from free-form model replies.

use serde_json::Value;

/// Extract the JSON object from an LLM reply.
///
/// Models wrap JSON in Markdown fences or add a sentence before it, so this
/// tries the whole reply, then fenced blocks, then the outermost braces.
pub fn extract_json_value(reply: &str) -> Option<Value> {
    let t = reply.trim().trim_matches('\u{feff}');

    if let Ok(v) = serde_json::from_str::<Value>(t) {
        return Some(v);
    }

    for fence in ["```json", "```JSON", "```"] {
        if let Some(start) = t.find(fence) {
            let body = &t[start + fence.len()..];
            if let Some(end) = body.find("```") {
                if let Ok(v) = serde_json::from_str::<Value>(body[..end].trim()) {
                    return Some(v);
                }
            }
        }
    }

    let (i, j) = (t.find('{')?, t.rfind('}')?);
    if i < j {
        if let Ok(v) = serde_json::from_str::<Value>(&t[i..=j]) {
            return Some(v);
        }
    }

    None
}
