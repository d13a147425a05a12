//! Concrete chat-completion providers.
//!
//! Each provider maps the shared `CompletionRequest` onto its wire format
//! and concatenates the text parts of the reply. Errors carry the raw
//! provider message so overflow classification can inspect it.

use serde::Deserialize;

use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, LlmError, LlmProvider, Role};

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

async fn error_body(response: reqwest::Response) -> LlmError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    LlmError::Provider(format!("status {status}: {body}"))
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.unwrap_or("claude-sonnet-4-20250514").to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicPart>,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        // Anthropic takes the system prompt out of band.
        let system: String = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| serde_json::json!({ "role": role_str(m.role), "content": m.content }))
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system);
        }

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_body(response).await);
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let content: String = parsed
            .content
            .iter()
            .filter(|p| p.kind == "text")
            .map(|p| p.text.as_str())
            .collect();
        if content.is_empty() {
            return Err(LlmError::InvalidResponse("no text parts in reply".to_string()));
        }
        Ok(CompletionResponse {
            content,
            model: parsed.model,
        })
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.unwrap_or("gpt-4o-mini").to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: String,
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai-codex"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": role_str(m.role), "content": m.content }))
            .collect();

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
                "messages": messages,
            }))
            .send()
            .await
            .map_err(|e| LlmError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_body(response).await);
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(LlmError::InvalidResponse("empty completion".to_string()));
        }
        Ok(CompletionResponse {
            content,
            model: parsed.model,
        })
    }
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>, model: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.unwrap_or("gemini-2.0-flash").to_string(),
        }
    }

    fn to_contents(messages: &[ChatMessage]) -> (String, Vec<serde_json::Value>) {
        let system: String = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let contents = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                serde_json::json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();
        (system, contents)
    }
}

#[async_trait::async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini-cli"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (system, contents) = Self::to_contents(&request.messages);
        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature,
            }
        });
        if !system.is_empty() {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_body(response).await);
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let content: String = parsed["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if content.is_empty() {
            return Err(LlmError::InvalidResponse("no candidates in reply".to_string()));
        }
        Ok(CompletionResponse {
            content,
            model: self.model.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemini_role_mapping() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi"),
        ];
        let (system, contents) = GeminiProvider::to_contents(&messages);
        assert_eq!(system, "be brief");
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn test_anthropic_response_parsing() {
        let json = serde_json::json!({
            "content": [
                { "type": "text", "text": "part one " },
                { "type": "tool_use", "id": "x", "name": "t", "input": {} },
                { "type": "text", "text": "part two" }
            ],
            "model": "claude-sonnet-4-20250514"
        });
        let parsed: AnthropicResponse = serde_json::from_value(json).unwrap();
        let content: String = parsed
            .content
            .iter()
            .filter(|p| p.kind == "text")
            .map(|p| p.text.as_str())
            .collect();
        assert_eq!(content, "part one part two");
    }

    #[test]
    fn test_default_models() {
        assert_eq!(AnthropicProvider::new("k", None).model, "claude-sonnet-4-20250514");
        assert_eq!(OpenAiProvider::new("k", Some("gpt-4.1")).model, "gpt-4.1");
    }
}
