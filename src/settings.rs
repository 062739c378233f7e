// ============================================================================
// Persisted Settings
// ============================================================================
// Last used inputs and the rate-limit snapshot, stored as JSON in the
// user's config directory.
// ============================================================================

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use atomicwrites::{AllowOverwrite, AtomicFile};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pexels::{Color, Locale, Orientation, Quality, SearchFilters, Size};
use crate::rate_limit::Quota;

pub const APP_DIR: &str = "pexels-downloader";
pub const SETTINGS_FILE: &str = "settings.json";
pub const LOG_FILE: &str = "pexels-downloader.log";
pub const DEFAULT_IMAGES_PER_TERM: u32 = 50;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub api_key: String,
    pub search_terms: String,
    pub images_per_term: u32,
    pub output_folder: Option<PathBuf>,
    pub orientation: Option<Orientation>,
    pub size: Option<Size>,
    pub color: Option<Color>,
    pub locale: Option<Locale>,
    pub quality: Quality,
    pub quota: Quota,
    pub last_run: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            api_key: String::new(),
            search_terms: String::new(),
            images_per_term: DEFAULT_IMAGES_PER_TERM,
            output_folder: None,
            orientation: None,
            size: None,
            color: None,
            locale: None,
            quality: Quality::default(),
            quota: Quota::default(),
            last_run: None,
        }
    }
}

/// Directory holding the settings file and the log
pub fn app_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join(APP_DIR))
        .ok_or_else(|| Error::invalid_input("cannot find the user config directory"))
}

pub fn default_path() -> Result<PathBuf> {
    Ok(app_dir()?.join(SETTINGS_FILE))
}

/// Default download location: `<Pictures>/Pexels`, or the working directory
pub fn default_output_folder() -> PathBuf {
    dirs::picture_dir()
        .map(|d| d.join("Pexels"))
        .unwrap_or_else(|| PathBuf::from("pexels"))
}

impl Settings {
    /// Missing file gives defaults; a corrupt file is logged and replaced by defaults.
    pub fn load(path: &Path) -> Result<Settings> {
        if !path.exists() {
            return Ok(Settings::default());
        }
        let content = fs::read_to_string(path)?;
        match serde_json::from_str(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings file");
                Ok(Settings::default())
            }
        }
    }

    /// Write the settings atomically: the file is either the old or the new blob.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        AtomicFile::new(path, AllowOverwrite)
            .write(|f| f.write_all(json.as_bytes()))
            .map_err(std::io::Error::from)?;
        tracing::debug!(path = %path.display(), "settings saved");
        Ok(())
    }

    pub fn filters(&self) -> SearchFilters {
        SearchFilters {
            orientation: self.orientation,
            size: self.size,
            color: self.color.clone(),
            locale: self.locale.clone(),
        }
    }

    /// API key with everything but the last four characters hidden
    pub fn masked_api_key(&self) -> String {
        let key = self.api_key.trim();
        if key.is_empty() {
            return "(not set)".to_string();
        }
        let chars: Vec<char> = key.chars().collect();
        let visible = chars.len().min(4);
        let tail: String = chars[chars.len() - visible..].iter().collect();
        format!("{}{}", "*".repeat(chars.len() - visible), tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.images_per_term, DEFAULT_IMAGES_PER_TERM);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);

        let settings = Settings {
            api_key: "abc123".into(),
            search_terms: "cats, dogs".into(),
            images_per_term: 20,
            output_folder: Some(dir.path().join("out")),
            orientation: Some(Orientation::Portrait),
            color: Some("#00ff00".parse().unwrap()),
            locale: Some("ja-JP".parse().unwrap()),
            quality: Quality::Large2x,
            ..Default::default()
        };
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.filters().orientation, Some(Orientation::Portrait));
    }

    #[test]
    fn test_save_replaces_existing_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, "x".repeat(4096)).unwrap();

        let settings = Settings {
            api_key: "key".into(),
            ..Default::default()
        };
        settings.save(&path).unwrap();

        assert_eq!(Settings::load(&path).unwrap(), settings);
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_partial_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);

        fs::write(&path, r#"{"api_key":"k","size":"medium"}"#).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.api_key, "k");
        assert_eq!(loaded.size, Some(Size::Medium));
        assert_eq!(loaded.images_per_term, DEFAULT_IMAGES_PER_TERM);

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Settings::load(&path).unwrap(), Settings::default());

        // an invalid color is a corrupt file, not a crash
        fs::write(&path, r#"{"color":"purple"}"#).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), Settings::default());
    }

    #[test]
    fn test_masked_api_key() {
        let mut settings = Settings::default();
        assert_eq!(settings.masked_api_key(), "(not set)");
        settings.api_key = "abcdefgh".into();
        assert_eq!(settings.masked_api_key(), "****efgh");
        settings.api_key = "xy".into();
        assert_eq!(settings.masked_api_key(), "xy");
    }
}
