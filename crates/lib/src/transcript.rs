//! Chat transcript: timestamped lines, plain-text export, and periodic auto-save.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::settings::Settings;

/// Who a transcript line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::User => "You",
            Speaker::Assistant => "PyroAI",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptLine {
    pub at: DateTime<Local>,
    pub speaker: Speaker,
    pub text: String,
}

impl TranscriptLine {
    /// `[YYYY-MM-DD HH:MM:SS] You: text`
    pub fn render(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.speaker.label(),
            self.text
        )
    }
}

/// In-memory transcript for the current chat window.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    lines: Vec<TranscriptLine>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.push_at(Local::now(), speaker, text);
    }

    pub fn push_at(&mut self, at: DateTime<Local>, speaker: Speaker, text: impl Into<String>) {
        self.lines.push(TranscriptLine {
            at,
            speaker,
            text: text.into(),
        });
    }

    pub fn lines(&self) -> &[TranscriptLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn to_plain_text(&self) -> String {
        self.lines
            .iter()
            .map(TranscriptLine::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Write the plain-text transcript to `path`, replacing any existing file.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.to_plain_text())?;
        log::info!("saved transcript ({} lines) to {}", self.lines.len(), path.display());
        Ok(())
    }

    /// Write an auto-save file named after `at` into `dir`; returns the file path.
    pub fn auto_save(&self, dir: &Path, at: DateTime<Local>) -> std::io::Result<PathBuf> {
        let path = dir.join(auto_save_file_name(at));
        self.save_to(&path)?;
        Ok(path)
    }
}

/// `chat_auto_save_YYYYMMDD_HHMMSS.txt`
pub fn auto_save_file_name(at: DateTime<Local>) -> String {
    format!("chat_auto_save_{}.txt", at.format("%Y%m%d_%H%M%S"))
}

/// Fires once every `interval`; driven by the front end's own loop (no thread of its own).
#[derive(Debug, Clone)]
pub struct AutoSaveTimer {
    interval: Duration,
    last: Instant,
}

impl AutoSaveTimer {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self { interval, last: now }
    }

    /// Timer for the settings' auto-save policy, or `None` when auto-save is off.
    pub fn from_settings(settings: &Settings, now: Instant) -> Option<Self> {
        if !settings.auto_save {
            return None;
        }
        let minutes = u64::from(settings.auto_save_interval.max(1));
        Some(Self::new(Duration::from_secs(minutes * 60), now))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last) >= self.interval
    }

    /// Time left until the next tick.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.interval
            .saturating_sub(now.saturating_duration_since(self.last))
    }

    /// Restart the interval from `now`.
    pub fn mark(&mut self, now: Instant) {
        self.last = now;
    }
}
