use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    /// Role of the message author (system, user or assistant).
    pub role: Role,
    /// Natural language content submitted by the author.
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Sampling parameters of one decision request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Sampling {
    pub const fn new(temperature: f64, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

impl Default for Sampling {
    fn default() -> Self {
        Self::new(0.7, 1000)
    }
}

/// Body of an OpenAI-compatible `chat/completions` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub stream: bool,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: &[ChatMessage], sampling: Sampling) -> Self {
        Self {
            model: model.into(),
            messages: messages.to_vec(),
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            top_p: 1.0,
            stream: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionResponse {
    /// Text of the first completion, if any.
    pub fn into_first_content(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
    }
}

/// Extract a human readable message from an upstream error body.
///
/// Understands the vendor shape `{"error": {"message": ..}}` and the proxy
/// shape `{"error": "..", "message": ".."}`.
pub fn upstream_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let nested = value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str);
    let flat = value.get("message").and_then(Value::as_str);
    let bare = value.get("error").and_then(Value::as_str);
    nested
        .or(flat)
        .or(bare)
        .map(str::to_string)
        .filter(|m| !m.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_body_matches_wire_format() {
        let messages = [ChatMessage::system("be terse"), ChatMessage::user("hi")];
        let request = ChatCompletionRequest::new("m1", &messages, Sampling::new(0.3, 500));
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "m1",
                "messages": [
                    {"role": "system", "content": "be terse"},
                    {"role": "user", "content": "hi"}
                ],
                "temperature": 0.3,
                "max_tokens": 500,
                "top_p": 1.0,
                "stream": false
            })
        );
    }

    #[test]
    fn first_choice_content_is_returned() {
        let parsed: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [
                {"message": {"role": "assistant", "content": "{\"ok\":true}"}},
                {"message": {"role": "assistant", "content": "second"}}
            ]
        }))
        .unwrap();
        assert_eq!(parsed.into_first_content().as_deref(), Some("{\"ok\":true}"));

        let empty: ChatCompletionResponse = serde_json::from_value(json!({})).unwrap();
        assert!(empty.into_first_content().is_none());
    }

    #[test]
    fn error_message_from_vendor_and_proxy_shapes() {
        let vendor = r#"{"error":{"message":"model decommissioned","type":"invalid_request_error"}}"#;
        assert_eq!(upstream_error_message(vendor).as_deref(), Some("model decommissioned"));

        let proxy = r#"{"error":"Upstream error: 400","message":"{\"error\":{\"message\":\"decommissioned\"}}"}"#;
        assert!(upstream_error_message(proxy).unwrap().contains("decommissioned"));

        let bare = r#"{"error":"Method not allowed"}"#;
        assert_eq!(upstream_error_message(bare).as_deref(), Some("Method not allowed"));

        assert!(upstream_error_message("<html>bad gateway</html>").is_none());
    }
}
