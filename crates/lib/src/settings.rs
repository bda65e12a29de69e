//! Settings types and the JSON settings store.
//!
//! Settings live in a single flat JSON object (e.g. `~/.pyro/settings.json`). Keys the
//! program knows are typed fields; any other keys are carried through untouched so a
//! load/save cycle never drops data written by a newer version.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ErrorKind;

/// Stand-in value for an API key that was never configured.
pub const API_KEY_PLACEHOLDER: &str = "YOUR_GEMINI_API_KEY";

/// Smallest and largest accepted transcript font size (points).
pub const FONT_SIZE_RANGE: std::ops::RangeInclusive<u32> = 6..=72;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("accessing settings at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl SettingsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SettingsError::Io { .. } => ErrorKind::Io,
            SettingsError::Corrupt { .. } => ErrorKind::CorruptSettings,
            SettingsError::Invalid { .. } => ErrorKind::InvalidSettings,
        }
    }
}

/// Color scheme for the transcript window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }

    /// Strict parse for user input ("Light", "dark", ...).
    pub fn parse(s: &str) -> Option<Theme> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            _ => None,
        }
    }
}

/// Lenient conversion used when reading the file: anything that is not "dark" renders light.
impl From<String> for Theme {
    fn from(s: String) -> Self {
        Theme::parse(&s).unwrap_or(Theme::Light)
    }
}

impl From<Theme> for String {
    fn from(t: Theme) -> Self {
        t.as_str().to_string()
    }
}

/// Persisted application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Gemini API key. Overridden at send time by GEMINI_API_KEY env when set.
    #[serde(default = "default_api_key")]
    pub api_key: String,

    #[serde(default)]
    pub theme: Theme,

    /// Transcript font size in points.
    #[serde(default = "default_font_size")]
    pub font_size: u32,

    #[serde(default = "default_font_family")]
    pub font_family: String,

    /// When true, the transcript is written to a timestamped file every `auto_save_interval` minutes.
    #[serde(default)]
    pub auto_save: bool,

    /// Minutes between auto-saves.
    #[serde(default = "default_auto_save_interval")]
    pub auto_save_interval: u32,

    /// Keys this version does not know about; written back unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_api_key() -> String {
    API_KEY_PLACEHOLDER.to_string()
}

fn default_font_size() -> u32 {
    12
}

fn default_font_family() -> String {
    "Courier New".to_string()
}

fn default_auto_save_interval() -> u32 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
            theme: Theme::default(),
            font_size: default_font_size(),
            font_family: default_font_family(),
            auto_save: false,
            auto_save_interval: default_auto_save_interval(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Settings {
    /// True if the stored key is something other than empty or the placeholder.
    pub fn has_api_key(&self) -> bool {
        is_usable_api_key(&self.api_key)
    }

    /// Font size clamped to [`FONT_SIZE_RANGE`]. A hand-edited file may hold any value;
    /// the stored number is left as is.
    pub fn effective_font_size(&self) -> u32 {
        self.font_size
            .clamp(*FONT_SIZE_RANGE.start(), *FONT_SIZE_RANGE.end())
    }
}

/// True if `key` is non-empty (after trimming) and not the placeholder sentinel.
pub fn is_usable_api_key(key: &str) -> bool {
    let k = key.trim();
    !k.is_empty() && k != API_KEY_PLACEHOLDER
}

/// Resolve the API key to send with: env GEMINI_API_KEY overrides the stored key.
pub fn resolve_api_key(settings: &Settings) -> String {
    std::env::var("GEMINI_API_KEY")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| settings.api_key.clone())
}

/// A partial change to settings, as produced by a settings dialog or `pyro settings set`.
/// `None` fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub api_key: Option<String>,
    pub theme: Option<String>,
    pub font_size: Option<u32>,
    pub font_family: Option<String>,
    pub auto_save: Option<bool>,
    pub auto_save_interval: Option<u32>,
}

impl SettingsUpdate {
    /// Apply onto a copy of `current`, validating every provided field.
    pub fn apply_to(&self, current: &Settings) -> Result<Settings, SettingsError> {
        let mut next = current.clone();
        if let Some(ref key) = self.api_key {
            next.api_key = key.trim().to_string();
        }
        if let Some(ref theme) = self.theme {
            next.theme = Theme::parse(theme).ok_or_else(|| SettingsError::Invalid {
                field: "theme",
                reason: format!("expected \"light\" or \"dark\", got {:?}", theme),
            })?;
        }
        if let Some(size) = self.font_size {
            if !FONT_SIZE_RANGE.contains(&size) {
                return Err(SettingsError::Invalid {
                    field: "fontSize",
                    reason: format!(
                        "{} is outside {}..={}",
                        size,
                        FONT_SIZE_RANGE.start(),
                        FONT_SIZE_RANGE.end()
                    ),
                });
            }
            next.font_size = size;
        }
        if let Some(ref family) = self.font_family {
            let family = family.trim();
            if family.is_empty() {
                return Err(SettingsError::Invalid {
                    field: "fontFamily",
                    reason: "must not be empty".to_string(),
                });
            }
            next.font_family = family.to_string();
        }
        if let Some(enabled) = self.auto_save {
            next.auto_save = enabled;
        }
        if let Some(minutes) = self.auto_save_interval {
            if minutes == 0 {
                return Err(SettingsError::Invalid {
                    field: "autoSaveInterval",
                    reason: "must be at least 1 minute".to_string(),
                });
            }
            next.auto_save_interval = minutes;
        }
        Ok(next)
    }
}

/// Resolve settings path from env or default.
pub fn default_settings_path() -> PathBuf {
    std::env::var("PYRO_SETTINGS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".pyro").join("settings.json"))
                .unwrap_or_else(|| PathBuf::from("pyroai_settings.json"))
        })
}

/// Settings file at a fixed path.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at PYRO_SETTINGS_PATH or `~/.pyro/settings.json`.
    pub fn at_default_path() -> Self {
        Self::new(default_settings_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings. Missing file => defaults; keys absent from the file are backfilled.
    /// A file that exists but does not parse is reported as `Corrupt`, never silently replaced.
    pub fn load(&self) -> Result<Settings, SettingsError> {
        let s = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!(
                    "settings file not found, using defaults: {}",
                    self.path.display()
                );
                return Ok(Settings::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&s).map_err(|source| SettingsError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Write settings as JSON. Goes through a sibling temp file and a rename so a crash
    /// mid-write leaves either the old or the new file.
    pub fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(settings).map_err(|source| {
            SettingsError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;
        let tmp = temp_sibling(&self.path);
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        log::debug!("saved settings to {}", self.path.display());
        Ok(())
    }

    /// Validate and apply `update`, persist, and only then replace `settings`.
    /// On any error `settings` is left unchanged.
    pub fn commit(
        &self,
        settings: &mut Settings,
        update: &SettingsUpdate,
    ) -> Result<(), SettingsError> {
        let next = update.apply_to(settings)?;
        self.save(&next)?;
        *settings = next;
        log::info!("settings committed");
        Ok(())
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "settings.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("pyro-settings-test-{}", uuid::Uuid::new_v4()))
            .join("settings.json")
    }

    #[test]
    fn missing_file_yields_defaults() {
        let store = SettingsStore::new(temp_path());
        let s = store.load().expect("load");
        assert_eq!(s, Settings::default());
        assert_eq!(s.api_key, API_KEY_PLACEHOLDER);
        assert_eq!(s.theme, Theme::Dark);
        assert_eq!(s.font_size, 12);
        assert_eq!(s.font_family, "Courier New");
        assert!(!s.auto_save);
        assert_eq!(s.auto_save_interval, 5);
    }

    #[test]
    fn partial_file_is_backfilled() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"apiKey":"abc","fontSize":16}"#).unwrap();
        let s = SettingsStore::new(&path).load().expect("load");
        assert_eq!(s.api_key, "abc");
        assert_eq!(s.font_size, 16);
        assert_eq!(s.theme, Theme::Dark);
        assert_eq!(s.font_family, "Courier New");
        assert!(!s.auto_save);
        assert_eq!(s.auto_save_interval, 5);
    }

    #[test]
    fn out_of_range_font_size_loads_and_is_clamped_for_display() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let store = SettingsStore::new(&path);

        std::fs::write(&path, r#"{"fontSize":0}"#).unwrap();
        let s = store.load().expect("load");
        assert_eq!(s.font_size, 0);
        assert_eq!(s.effective_font_size(), 6);

        std::fs::write(&path, r#"{"fontSize":100000}"#).unwrap();
        let s = store.load().expect("load");
        assert_eq!(s.effective_font_size(), 72);
        assert_eq!(Settings::default().effective_font_size(), 12);
    }

    #[test]
    fn backfilled_file_contains_every_key_after_save() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"autoSave":true}"#).unwrap();
        let store = SettingsStore::new(&path);
        let s = store.load().unwrap();
        store.save(&s).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        for key in [
            "apiKey",
            "theme",
            "fontSize",
            "fontFamily",
            "autoSave",
            "autoSaveInterval",
        ] {
            assert!(raw.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(raw["autoSave"], serde_json::Value::Bool(true));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        let err = SettingsStore::new(&path).load().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptSettings);
    }

    #[test]
    fn wrongly_typed_key_is_corrupt() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"fontSize":"large"}"#).unwrap();
        let err = SettingsStore::new(&path).load().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptSettings);
    }

    #[test]
    fn unknown_theme_reads_as_light() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"theme":"solarized"}"#).unwrap();
        let s = SettingsStore::new(&path).load().unwrap();
        assert_eq!(s.theme, Theme::Light);
    }

    #[test]
    fn save_then_load_round_trips_with_unknown_keys() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"apiKey":"k","theme":"light","windowWidth":900,"recent":["a","b"]}"#,
        )
        .unwrap();
        let store = SettingsStore::new(&path);
        let first = store.load().unwrap();
        store.save(&first).unwrap();
        let second = store.load().unwrap();
        assert_eq!(first, second);
        assert_eq!(second.extra.get("windowWidth"), Some(&serde_json::json!(900)));
        assert!(!path.with_file_name("settings.json.tmp").exists());
    }

    #[test]
    fn commit_validates_before_saving() {
        let store = SettingsStore::new(temp_path());
        let mut s = Settings::default();
        let bad = SettingsUpdate {
            auto_save_interval: Some(0),
            ..Default::default()
        };
        let err = store.commit(&mut s, &bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSettings);
        assert_eq!(s, Settings::default());
        assert!(!store.path().exists());

        let good = SettingsUpdate {
            api_key: Some("  new-key ".to_string()),
            theme: Some("Light".to_string()),
            auto_save: Some(true),
            auto_save_interval: Some(10),
            ..Default::default()
        };
        store.commit(&mut s, &good).unwrap();
        assert_eq!(s.api_key, "new-key");
        assert_eq!(s.theme, Theme::Light);
        assert!(s.auto_save);
        assert_eq!(s.auto_save_interval, 10);
        assert_eq!(store.load().unwrap(), s);
    }

    #[test]
    fn font_size_out_of_range_is_rejected() {
        let update = SettingsUpdate {
            font_size: Some(200),
            ..Default::default()
        };
        assert!(update.apply_to(&Settings::default()).is_err());
    }

    #[test]
    fn placeholder_and_blank_keys_are_unusable() {
        assert!(!is_usable_api_key(""));
        assert!(!is_usable_api_key("   "));
        assert!(!is_usable_api_key(API_KEY_PLACEHOLDER));
        assert!(is_usable_api_key("AIza-something"));
        assert!(!Settings::default().has_api_key());
    }
}
