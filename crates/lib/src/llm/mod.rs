//! Remote generative-language service: the capability the chat bridge depends on,
//! and its Gemini implementation.
//!
//! The bridge only sees [`ChatBackend`] and [`ChatSession`]; tests substitute scripted
//! doubles for them.

mod gemini;

pub use gemini::{GeminiBackend, GeminiSession, DEFAULT_BASE_URL};

use async_trait::async_trait;

use crate::error::ErrorKind;
use crate::session::Conversation;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("gemini request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("gemini api error: {0}")]
    Api(String),
    #[error("malformed stream payload: {0}")]
    Decode(String),
    #[error("backend not configured with an API key")]
    NotConfigured,
}

impl LlmError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TransportFailure
    }
}

/// An image attached to a user message. The MIME type is sniffed from the bytes; the
/// remote service decides whether it accepts the format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImagePayload {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mime_type = sniff_image_mime(&bytes).to_string();
        Self { bytes, mime_type }
    }

    pub fn from_path(path: &std::path::Path) -> std::io::Result<Self> {
        Ok(Self::from_bytes(std::fs::read(path)?))
    }
}

/// MIME type from magic bytes; unknown formats go through as octet-stream.
pub fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

/// A live conversation with the remote service.
#[async_trait]
pub trait ChatSession: Send {
    /// Send one user message (plus optional image) with the conversation so far, calling
    /// `on_fragment` for each streamed text fragment in order. Returns the full reply text,
    /// which equals the concatenation of the fragments.
    async fn send_streaming(
        &mut self,
        message: &str,
        image: Option<&ImagePayload>,
        on_fragment: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, LlmError>;

    /// History of completed exchanges.
    fn conversation(&self) -> &Conversation;
}

/// Factory for sessions against one remote service.
pub trait ChatBackend: Send + Sync {
    /// Set the API key used by this backend's sessions from now on.
    fn configure(&self, api_key: &str) -> Result<(), LlmError>;

    /// Start an empty session bound to `model`.
    fn create_session(&self, model: &str) -> Box<dyn ChatSession>;
}
