//! Pyro core library — settings store, Gemini client, chat bridge, and transcript
//! used by both the CLI and desktop applications.

pub mod bridge;
pub mod error;
pub mod init;
pub mod llm;
pub mod session;
pub mod settings;
pub mod transcript;
