//! `dimmer.toml` manifest.

use anyhow::{Context, Result};
use ext_brightness::{DarkModeDetector, DarkModeStrategy, TRANSITION_DURATION};
use ext_storage::SqliteStorage;
use ext_timers::{DebounceOptions, TimerError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Extension manifest. Only `[app]` is required.
#[derive(Debug, Deserialize, Clone)]
pub struct Manifest {
    pub app: App,
    #[serde(default)]
    pub brightness: BrightnessConfig,
    #[serde(default)]
    pub popup: PopupConfig,
    #[serde(default)]
    pub dark_mode: DarkModeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application identity
#[derive(Debug, Deserialize, Clone)]
pub struct App {
    /// Package name: the port channel name and the instance-marker meta name
    pub name: String,
    /// Identifier connecting ports must present
    pub extension_id: String,
    /// Relay `LOGGER_REQUEST` and dump storage on load (default: false)
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrightnessConfig {
    /// Background transition duration in milliseconds (default: 150)
    pub transition_ms: u64,
}

impl Default for BrightnessConfig {
    fn default() -> Self {
        Self {
            transition_ms: TRANSITION_DURATION.as_millis() as u64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PopupConfig {
    /// Quiet period before `SET_BRIGHTNESS` is sent (default: 20)
    pub slider_debounce_ms: u64,
    /// Slider events after which the message goes out immediately (default: 10)
    pub slider_max_calls: Option<u32>,
    /// Quiet period before the origin state is written (default: 500)
    pub storage_debounce_ms: u64,
}

impl Default for PopupConfig {
    fn default() -> Self {
        Self {
            slider_debounce_ms: 20,
            slider_max_calls: Some(10),
            storage_debounce_ms: 500,
        }
    }
}

impl PopupConfig {
    pub fn slider_debounce(&self) -> Result<DebounceOptions, TimerError> {
        DebounceOptions::new(self.slider_debounce_ms, self.slider_max_calls)
    }

    pub fn storage_debounce(&self) -> Result<DebounceOptions, TimerError> {
        DebounceOptions::new(self.storage_debounce_ms, None)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DarkModeConfig {
    pub strategies: Vec<DarkModeStrategy>,
}

impl Default for DarkModeConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                DarkModeStrategy::ColorModeAttribute,
                DarkModeStrategy::DarkreaderMarker,
            ],
        }
    }
}

impl DarkModeConfig {
    pub fn detector(&self) -> DarkModeDetector {
        DarkModeDetector::new(&self.strategies)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Database file (default: `<data_dir>/.dimmer/<app name>/storage.db`)
    pub path: Option<PathBuf>,
}

impl Manifest {
    /// Manifest with defaults for everything but identity.
    pub fn new(name: impl Into<String>, extension_id: impl Into<String>) -> Self {
        Self {
            app: App {
                name: name.into(),
                extension_id: extension_id.into(),
                debug: false,
            },
            brightness: BrightnessConfig::default(),
            popup: PopupConfig::default(),
            dark_mode: DarkModeConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(text).context("parsing manifest")?;
        if manifest.app.name.is_empty() {
            anyhow::bail!("app.name must not be empty");
        }
        Ok(manifest)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading manifest at {}", path.display()))?;
        Self::from_toml(&text)
    }

    pub fn transition_duration(&self) -> Duration {
        Duration::from_millis(self.brightness.transition_ms)
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| SqliteStorage::default_path(&self.app.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_manifest_uses_defaults() {
        let manifest = Manifest::from_toml(
            r#"
            [app]
            name = "chrome-dimmer"
            extension_id = "abcdefghijklmnop"
            "#,
        )
        .unwrap();

        assert!(!manifest.app.debug);
        assert_eq!(manifest.transition_duration(), Duration::from_millis(150));
        assert_eq!(manifest.popup.slider_debounce_ms, 20);
        assert_eq!(manifest.popup.slider_max_calls, Some(10));
        assert_eq!(manifest.popup.storage_debounce_ms, 500);
        assert_eq!(
            manifest.dark_mode.strategies,
            vec![
                DarkModeStrategy::ColorModeAttribute,
                DarkModeStrategy::DarkreaderMarker
            ]
        );
        assert!(manifest
            .storage_path()
            .ends_with(".dimmer/chrome-dimmer/storage.db"));
    }

    #[test]
    fn test_full_manifest() {
        let manifest = Manifest::from_toml(
            r#"
            [app]
            name = "chrome-dimmer"
            extension_id = "abcdefghijklmnop"
            debug = true

            [brightness]
            transition_ms = 300

            [popup]
            slider_debounce_ms = 40
            storage_debounce_ms = 1000

            [dark_mode]
            strategies = ["prefers-color-scheme"]

            [storage]
            path = "/tmp/dimmer.db"
            "#,
        )
        .unwrap();

        assert!(manifest.app.debug);
        assert_eq!(manifest.transition_duration(), Duration::from_millis(300));
        assert_eq!(manifest.popup.slider_debounce().unwrap().timeout_ms, 40);
        // unspecified keys in a present section keep their defaults
        assert_eq!(manifest.popup.slider_max_calls, Some(10));
        assert_eq!(manifest.storage_path(), PathBuf::from("/tmp/dimmer.db"));
    }

    #[test]
    fn test_invalid_manifest() {
        assert!(Manifest::from_toml("[app]\nname = \"x\"").is_err());
        assert!(Manifest::from_toml("[app]\nname = \"\"\nextension_id = \"id\"").is_err());
        assert!(Manifest::from_toml(
            "[app]\nname = \"x\"\nextension_id = \"id\"\n[dark_mode]\nstrategies = [\"sepia\"]"
        )
        .is_err());
    }
}
