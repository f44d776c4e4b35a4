//! Settings management for soulsfetch
//!
//! Stores the Nexus API key, per-game paths and loose option values in
//! ~/.config/soulsfetch/settings.json

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A typed option value. Anything else found in the settings file is dropped
/// when it is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl SettingValue {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n.as_i64().map(Self::Int),
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

fn typed_options<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, SettingValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    let mut options = BTreeMap::new();
    for (name, value) in raw {
        match SettingValue::from_json(&value) {
            Some(v) => {
                options.insert(name, v);
            }
            None => warn!("Ignoring option '{}' with unsupported value {}", name, value),
        }
    }
    Ok(options)
}

/// User settings for soulsfetch
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Nexus Mods API key obtained through SSO
    #[serde(default)]
    pub nexus_api_key: Option<String>,

    /// Game install directories keyed by game tag
    #[serde(default)]
    pub game_paths: BTreeMap<String, String>,

    /// Root folder holding the per-game asset folders
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Loose option values
    #[serde(default, deserialize_with = "typed_options")]
    pub options: BTreeMap<String, SettingValue>,
}

/// File-backed settings store.
///
/// Every accessor re-reads the file so separate handles never disagree.
#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    /// Store at an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at ~/.config/soulsfetch/settings.json
    pub fn default_location() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("soulsfetch");
        Ok(Self::at(config_dir.join("settings.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings from disk, or return defaults if missing or unreadable
    pub fn load(&self) -> Settings {
        match self.try_load() {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Could not load settings: {:#}. Using defaults.", e);
                Settings::default()
            }
        }
    }

    fn try_load(&self) -> Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {:?}", self.path))?;

        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", self.path))
    }

    /// Save settings to disk
    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }

        let content =
            serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {:?}", self.path))?;

        debug!("Saved settings to {:?}", self.path);
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut settings = self.load();
        f(&mut settings);
        self.save(&settings)
    }

    pub fn api_key(&self) -> Option<String> {
        self.load().nexus_api_key.filter(|k| !k.is_empty())
    }

    pub fn save_api_key(&self, key: &str) -> Result<()> {
        self.update(|s| s.nexus_api_key = Some(key.to_string()))
    }

    pub fn clear_api_key(&self) -> Result<()> {
        self.update(|s| s.nexus_api_key = None)
    }

    pub fn game_path(&self, game: &str) -> Option<PathBuf> {
        self.load().game_paths.get(game).map(PathBuf::from)
    }

    pub fn save_game_path(&self, game: &str, path: &Path) -> Result<()> {
        self.update(|s| {
            s.game_paths
                .insert(game.to_string(), path.to_string_lossy().into_owned());
        })
    }

    pub fn option(&self, name: &str) -> Option<SettingValue> {
        self.load().options.get(name).cloned()
    }

    pub fn set_option(&self, name: &str, value: SettingValue) -> Result<()> {
        self.update(|s| {
            s.options.insert(name.to_string(), value);
        })
    }
}
