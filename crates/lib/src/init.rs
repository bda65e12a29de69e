//! Initialize the settings directory: create `~/.pyro` and a default `settings.json`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::settings::{Settings, SettingsStore};

/// Create the settings directory and default file if they do not exist.
/// - Creates the settings directory (parent of the settings file path).
/// - Writes the full default settings if the file is missing; an existing file is left alone.
///
/// Returns the settings directory.
pub fn init_settings_file(settings_path: &Path) -> Result<PathBuf> {
    let settings_dir = settings_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(settings_dir)
        .with_context(|| format!("creating settings directory {}", settings_dir.display()))?;

    if !settings_path.exists() {
        SettingsStore::new(settings_path)
            .save(&Settings::default())
            .with_context(|| {
                format!("writing default settings to {}", settings_path.display())
            })?;
        log::info!("created default settings at {}", settings_path.display());
    } else {
        log::debug!(
            "settings file already exists at {}, skipping",
            settings_path.display()
        );
    }

    Ok(settings_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_defaults_once() {
        let dir = std::env::temp_dir().join(format!("pyro-init-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("settings.json");
        let created = init_settings_file(&path).expect("init");
        assert_eq!(created, dir.join("nested"));
        let store = SettingsStore::new(&path);
        assert_eq!(store.load().unwrap(), Settings::default());

        std::fs::write(&path, r#"{"apiKey":"kept"}"#).unwrap();
        init_settings_file(&path).expect("second init");
        assert_eq!(store.load().unwrap().api_key, "kept");
    }
}
