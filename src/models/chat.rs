use serde::de::Deserializer;
use serde::{Deserialize, Serialize};

/// Message role on the inbound Chat Completions surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One inbound chat message.
///
/// `content` is flattened to plain text at deserialization time: OpenAI
/// clients may send either a string or an array of `{type: "text", text}`
/// parts, and everything downstream works on flat text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(deserialize_with = "flatten_content")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    pub fn named(role: Role, content: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: Some(name.into()),
        }
    }
}

fn flatten_content<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Array(parts) => {
            let mut pieces = Vec::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    pieces.push(text.to_string());
                }
            }
            pieces.join("\n")
        }
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Inbound `POST /v1/chat/completions` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// String or array of strings; normalized by the orchestrator.
    pub stop: Option<serde_json::Value>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
}

impl ChatCompletionRequest {
    /// Clamp temperature into the range the upstream accepts.
    pub fn clamped_temperature(&self) -> Option<f64> {
        self.temperature.map(|t| t.clamp(0.1, 1.0))
    }

    /// Caller-supplied stop sequences as a flat string list.
    pub fn stop_sequences(&self) -> Vec<String> {
        match &self.stop {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Minimal single-choice completion body, used for the greeting
/// short-circuit and other locally answered requests.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatChoice {
    pub message: ChatResponseMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponseMessage {
    pub content: String,
}

impl ChatCompletionResponse {
    pub fn of_text(content: impl Into<String>) -> Self {
        Self {
            choices: vec![ChatChoice {
                message: ChatResponseMessage {
                    content: content.into(),
                },
            }],
        }
    }
}

/// Entry in the `GET /v1/models` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub data: Vec<ModelEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_accepts_string_and_parts() {
        let msg: ChatMessage =
            serde_json::from_value(json!({"role": "user", "content": "hi"})).unwrap();
        assert_eq!(msg.content, "hi");

        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]
        }))
        .unwrap();
        assert_eq!(msg.content, "a\nb");
    }

    #[test]
    fn stop_normalizes_string_and_array() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m", "messages": [], "stop": "END"
        }))
        .unwrap();
        assert_eq!(req.stop_sequences(), vec!["END".to_string()]);

        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m", "messages": [], "stop": ["a", "b"]
        }))
        .unwrap();
        assert_eq!(req.stop_sequences(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn temperature_is_clamped() {
        let req = ChatCompletionRequest {
            temperature: Some(2.0),
            ..Default::default()
        };
        assert_eq!(req.clamped_temperature(), Some(1.0));
    }
}
