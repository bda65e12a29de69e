//! Gemini API client (https://generativelanguage.googleapis.com/v1beta by default).
//! Streams replies via `streamGenerateContent?alt=sse`.

use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use super::{ChatBackend, ChatSession, ImagePayload, LlmError};
use crate::session::{Conversation, Turn};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

struct GeminiClient {
    base_url: String,
    client: reqwest::Client,
    api_key: RwLock<Option<String>>,
}

impl GeminiClient {
    fn api_key(&self) -> Result<String, LlmError> {
        self.api_key
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(LlmError::NotConfigured)
    }
}

/// Backend for the Gemini HTTP API. Sessions created from it share its HTTP client and key.
#[derive(Clone)]
pub struct GeminiBackend {
    inner: Arc<GeminiClient>,
}

impl GeminiBackend {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            inner: Arc::new(GeminiClient {
                base_url,
                client: reqwest::Client::new(),
                api_key: RwLock::new(None),
            }),
        }
    }

    /// Backend with base URL from PYRO_GEMINI_BASE_URL, or the public endpoint.
    pub fn from_env() -> Self {
        let base = std::env::var("PYRO_GEMINI_BASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        Self::new(base)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }
}

impl ChatBackend for GeminiBackend {
    fn configure(&self, api_key: &str) -> Result<(), LlmError> {
        let key = api_key.trim();
        if key.is_empty() {
            return Err(LlmError::NotConfigured);
        }
        *self.inner.api_key.write().unwrap_or_else(|e| e.into_inner()) = Some(key.to_string());
        Ok(())
    }

    fn create_session(&self, model: &str) -> Box<dyn ChatSession> {
        log::debug!("gemini: new session for model {}", model);
        Box::new(GeminiSession {
            inner: Arc::clone(&self.inner),
            model: model.to_string(),
            conversation: Conversation::new(),
        })
    }
}

/// One Gemini conversation. History is sent in full with every request.
pub struct GeminiSession {
    inner: Arc<GeminiClient>,
    model: String,
    conversation: Conversation,
}

impl GeminiSession {
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChatSession for GeminiSession {
    /// POST {base}/models/{model}:streamGenerateContent?alt=sse. Parses SSE `data:` lines and
    /// calls on_fragment for each text delta; the exchange is recorded only once the stream ends.
    async fn send_streaming(
        &mut self,
        message: &str,
        image: Option<&ImagePayload>,
        on_fragment: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, LlmError> {
        let api_key = self.inner.api_key()?;
        let user_turn = Turn::user(message, image.cloned());
        let body = build_request(&self.conversation.turns, &user_turn);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.inner.base_url, self.model
        );
        let res = self
            .inner
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Api(format_api_error(status, &body)));
        }

        let mut stream = res.bytes_stream();
        let mut buffer = Vec::new();
        let mut content = String::new();
        let mut stop_reason: Option<String> = None;
        let mut handle_line = |line: &str| -> Result<(), LlmError> {
            let Some(chunk) = parse_sse_line(line)? else {
                return Ok(());
            };
            if let Some(reason) = chunk.stop_reason() {
                stop_reason = Some(reason);
            }
            let text = chunk.text();
            if !text.is_empty() {
                on_fragment(&text);
                content.push_str(&text);
            }
            Ok(())
        };
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);
            while let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = buffer.drain(..=i).collect();
                handle_line(&*String::from_utf8_lossy(&line_bytes))?;
            }
        }
        if !buffer.is_empty() {
            handle_line(&*String::from_utf8_lossy(&buffer))?;
        }

        // A reply without text (blocked or cut off) must not enter the history: the
        // service rejects empty parts on every later request.
        if content.is_empty() {
            let reason = stop_reason.unwrap_or_else(|| "no text returned".to_string());
            log::warn!("gemini: empty reply ({})", reason);
            return Err(LlmError::Api(format!("response blocked: {}", reason)));
        }

        self.conversation.push_exchange(user_turn, content.clone());
        Ok(content)
    }

    fn conversation(&self) -> &Conversation {
        &self.conversation
    }
}

/// Parse one SSE line. Returns `None` for lines that carry no payload (comments, blank
/// keep-alives, `[DONE]`), or an error for an `error` payload.
fn parse_sse_line(line: &str) -> Result<Option<StreamChunk>, LlmError> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
        return Ok(None);
    };
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(None);
    }
    let chunk: StreamChunk =
        serde_json::from_str(payload).map_err(|e| LlmError::Decode(e.to_string()))?;
    if let Some(ref err) = chunk.error {
        return Err(LlmError::Api(err.summary()));
    }
    Ok(Some(chunk))
}

fn format_api_error(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => format!("{} {}", status, env.error.summary()),
        Err(_) if body.trim().is_empty() => status.to_string(),
        Err(_) => format!("{} {}", status, body.trim()),
    }
}

fn build_request(history: &[Turn], next: &Turn) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: history
            .iter()
            .chain(std::iter::once(next))
            .map(Content::from)
            .collect(),
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

impl From<&Turn> for Content {
    fn from(turn: &Turn) -> Self {
        let mut parts = vec![Part::Text(turn.text.clone())];
        if let Some(ref img) = turn.image {
            parts.push(Part::InlineData(InlineData {
                mime_type: img.mime_type.clone(),
                data: base64::engine::general_purpose::STANDARD.encode(&img.bytes),
            }));
        }
        Self {
            role: turn.role.as_str(),
            parts,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum Part {
    Text(String),
    InlineData(InlineData),
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

impl StreamChunk {
    /// Text of the first candidate (all of its text parts, concatenated).
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }

    /// Why generation stopped early: the prompt's block reason, or a finish reason other
    /// than STOP. `None` for ordinary chunks.
    fn stop_reason(&self) -> Option<String> {
        if let Some(reason) = self
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.clone())
        {
            return Some(reason);
        }
        self.candidates
            .first()
            .and_then(|c| c.finish_reason.clone())
            .filter(|r| r != "STOP")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ApiErrorBody {
    fn summary(&self) -> String {
        match (self.status.as_deref(), self.message.as_deref()) {
            (Some(s), Some(m)) => format!("{}: {}", s, m),
            (None, Some(m)) => m.to_string(),
            (Some(s), None) => s.to_string(),
            (None, None) => "unknown error".to_string(),
        }
    }
}
