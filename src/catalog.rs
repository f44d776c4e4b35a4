//! Source catalog
//!
//! Static registry mapping a logical asset key to where the asset comes from
//! and where its canonical file lives. The catalog is plain data: build it
//! from the built-in table, a JSON file, or any list of descriptors.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Nexus file category ids as reported by `files.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum FileCategory {
    Main,
    Update,
    Optional,
    OldVersion,
    Miscellaneous,
    Archived,
    Other(u32),
}

impl From<u32> for FileCategory {
    fn from(id: u32) -> Self {
        match id {
            1 => Self::Main,
            2 => Self::Update,
            3 => Self::Optional,
            4 => Self::OldVersion,
            5 => Self::Miscellaneous,
            7 => Self::Archived,
            other => Self::Other(other),
        }
    }
}

impl From<FileCategory> for u32 {
    fn from(category: FileCategory) -> Self {
        match category {
            FileCategory::Main => 1,
            FileCategory::Update => 2,
            FileCategory::Optional => 3,
            FileCategory::OldVersion => 4,
            FileCategory::Miscellaneous => 5,
            FileCategory::Archived => 7,
            FileCategory::Other(id) => id,
        }
    }
}

/// Where an asset is fetched from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetSource {
    /// Nexus Mods REST API (requires authentication)
    Api {
        domain: String,
        mod_id: u64,
        /// Substring of the file's display name; `None` selects the newest main file
        #[serde(default)]
        name_pattern: Option<String>,
        #[serde(default)]
        category: Option<FileCategory>,
    },
    /// Plain HTTP link
    Direct { url: String },
    /// Locker page that only exposes the file through a scripted page
    Browser { url: String },
}

impl AssetSource {
    pub fn kind(&self) -> &'static str {
        match self {
            AssetSource::Api { .. } => "Nexus",
            AssetSource::Direct { .. } => "HTTP",
            AssetSource::Browser { .. } => "Browser",
        }
    }

    pub fn requires_auth(&self) -> bool {
        matches!(self, AssetSource::Api { .. })
    }
}

/// One downloadable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub key: String,
    pub game: String,
    pub source: AssetSource,
    /// Canonical filename the installer looks for
    pub file_name: String,
    /// Folder relative to the data root
    pub output_dir: String,
    #[serde(default)]
    pub description: String,
    /// Blocking prerequisite: installation cannot proceed without it
    #[serde(default)]
    pub essential: bool,
    /// Archive must have a single root folder stripped before install
    #[serde(default)]
    pub flatten: bool,
}

impl AssetDescriptor {
    /// Page a user should visit to fetch this asset by hand
    pub fn manual_url(&self) -> String {
        match &self.source {
            AssetSource::Api { domain, mod_id, .. } => nexus_mod_url(domain, *mod_id),
            AssetSource::Direct { url } | AssetSource::Browser { url } => url.clone(),
        }
    }

    /// What to pick on the manual page
    pub fn manual_hint(&self) -> String {
        match &self.source {
            AssetSource::Api {
                name_pattern: Some(pattern),
                category,
                ..
            } => match category {
                Some(FileCategory::Optional) => {
                    format!("Download the '{}' file from OPTIONAL section", pattern)
                }
                _ => format!("Download the '{}' file", pattern),
            },
            AssetSource::Api { .. } => "Download the latest MAIN file".to_string(),
            AssetSource::Direct { .. } => "Download directly".to_string(),
            AssetSource::Browser { .. } => "Download via the page's download button".to_string(),
        }
    }

    pub fn display_name(&self) -> String {
        self.key.replace('_', " ")
    }
}

/// Human page for a Nexus mod
pub fn nexus_mod_url(domain: &str, mod_id: u64) -> String {
    format!("https://www.nexusmods.com/{}/mods/{}", domain.to_lowercase(), mod_id)
}

/// Lookup table over asset descriptors
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    entries: Vec<AssetDescriptor>,
    index: HashMap<String, usize>,
}

impl SourceCatalog {
    /// Build a catalog, rejecting duplicate keys
    pub fn new(entries: Vec<AssetDescriptor>) -> Result<Self> {
        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if index.insert(entry.key.clone(), i).is_some() {
                bail!("Duplicate asset key in catalog: {}", entry.key);
            }
        }
        Ok(Self { entries, index })
    }

    /// Load a catalog from a JSON array of descriptors
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let entries: Vec<AssetDescriptor> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalog {:?}", path))?;
        Self::new(entries)
    }

    /// The assets the Souls randomizers need
    pub fn builtin() -> Self {
        let entries: Vec<AssetDescriptor> = BUILTIN.iter().map(BuiltinEntry::to_descriptor).collect();
        // Keys in the table are unique (covered by tests)
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, d)| (d.key.clone(), i))
            .collect();
        Self { entries, index }
    }

    pub fn resolve(&self, key: &str) -> Option<&AssetDescriptor> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    /// Descriptors scoped to a game, in table order
    pub fn for_game(&self, game: &str) -> Vec<&AssetDescriptor> {
        self.entries.iter().filter(|d| d.game == game).collect()
    }

    pub fn total_for_game(&self, game: &str) -> usize {
        self.entries.iter().filter(|d| d.game == game).count()
    }

    /// Distinct game tags, in first-seen order
    pub fn games(&self) -> Vec<&str> {
        let mut games: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if !games.contains(&entry.game.as_str()) {
                games.push(&entry.game);
            }
        }
        games
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssetDescriptor> {
        self.entries.iter()
    }
}

enum BuiltinSource {
    Main(&'static str, u64),
    Pattern(&'static str, u64, &'static str, FileCategory),
    Browser(&'static str),
}

struct BuiltinEntry {
    key: &'static str,
    game: &'static str,
    source: BuiltinSource,
    file_name: &'static str,
    description: &'static str,
    essential: bool,
    flatten: bool,
}

impl BuiltinEntry {
    fn to_descriptor(&self) -> AssetDescriptor {
        let source = match self.source {
            BuiltinSource::Main(domain, mod_id) => AssetSource::Api {
                domain: domain.to_string(),
                mod_id,
                name_pattern: None,
                category: None,
            },
            BuiltinSource::Pattern(domain, mod_id, pattern, category) => AssetSource::Api {
                domain: domain.to_string(),
                mod_id,
                name_pattern: Some(pattern.to_string()),
                category: Some(category),
            },
            BuiltinSource::Browser(url) => AssetSource::Browser { url: url.to_string() },
        };
        AssetDescriptor {
            key: self.key.to_string(),
            game: self.game.to_string(),
            source,
            file_name: self.file_name.to_string(),
            output_dir: self.game.to_string(),
            description: self.description.to_string(),
            essential: self.essential,
            flatten: self.flatten,
        }
    }
}

const BUILTIN: &[BuiltinEntry] = &[
    BuiltinEntry {
        key: "DS2_Randomizer",
        game: "DS2",
        source: BuiltinSource::Main("darksouls2", 1317),
        file_name: "DS2_Randomizer.zip",
        description: "Dark Souls II item randomizer",
        essential: false,
        flatten: false,
    },
    BuiltinEntry {
        key: "DS3_FogGate",
        game: "DS3",
        source: BuiltinSource::Main("darksouls3", 551),
        file_name: "DS3_FogGate_Randomizer.zip",
        description: "Fog gate randomizer",
        essential: false,
        flatten: false,
    },
    BuiltinEntry {
        key: "DS3_ItemEnemy",
        game: "DS3",
        source: BuiltinSource::Main("darksouls3", 361),
        file_name: "DS3_Item_Enemy_Randomizer.zip",
        description: "Item and enemy randomizer",
        essential: false,
        flatten: false,
    },
    BuiltinEntry {
        key: "DS3_ModEngine",
        game: "DS3",
        source: BuiltinSource::Main("darksouls3", 332),
        file_name: "ModEngine.zip",
        description: "Mod loader",
        essential: false,
        flatten: true,
    },
    BuiltinEntry {
        key: "DS3_CrashFix",
        game: "DS3",
        source: BuiltinSource::Browser(
            "https://www.mediafire.com/file/2popj38c55nbhx2/DarkSoulsIII.exe/file",
        ),
        file_name: "DarkSoulsIII.exe",
        description: "DS3 Crash Fix",
        essential: true,
        flatten: false,
    },
    BuiltinEntry {
        key: "Sekiro_Randomizer",
        game: "Sekiro",
        source: BuiltinSource::Main("sekiro", 543),
        file_name: "Sekiro_Randomizer.zip",
        description: "Enemy and item randomizer",
        essential: false,
        flatten: false,
    },
    BuiltinEntry {
        key: "Sekiro_ModEngine",
        game: "Sekiro",
        source: BuiltinSource::Main("sekiro", 6),
        file_name: "ModEngine.zip",
        description: "Mod loader",
        essential: false,
        flatten: true,
    },
    BuiltinEntry {
        key: "Sekiro_CombinedSFX",
        game: "Sekiro",
        source: BuiltinSource::Pattern("sekiro", 543, "Combined SFX", FileCategory::Optional),
        file_name: "Combined_SFX.zip",
        description: "Combined sound effects for randomized enemies",
        essential: false,
        flatten: false,
    },
    BuiltinEntry {
        key: "Sekiro_DivineDragon",
        game: "Sekiro",
        source: BuiltinSource::Pattern("sekiro", 543, "Divine Dragon", FileCategory::Optional),
        file_name: "Divine_Dragon_Textures.zip",
        description: "Divine Dragon texture fix",
        essential: false,
        flatten: false,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(key: &str, game: &str) -> AssetDescriptor {
        AssetDescriptor {
            key: key.into(),
            game: game.into(),
            source: AssetSource::Direct {
                url: format!("https://example.com/{}.zip", key),
            },
            file_name: format!("{}.zip", key),
            output_dir: game.into(),
            description: String::new(),
            essential: false,
            flatten: false,
        }
    }

    #[test]
    fn test_builtin_lookup() {
        let catalog = SourceCatalog::builtin();
        let engine = catalog.resolve("DS3_ModEngine").unwrap();
        assert_eq!(engine.file_name, "ModEngine.zip");
        assert!(engine.flatten);
        assert_eq!(engine.manual_url(), "https://www.nexusmods.com/darksouls3/mods/332");
        assert!(catalog.resolve("nope").is_none());
    }

    #[test]
    fn test_for_game_scopes_entries() {
        let catalog = SourceCatalog::builtin();
        let keys: Vec<&str> = catalog.for_game("Sekiro").iter().map(|d| d.key.as_str()).collect();
        assert_eq!(
            keys,
            ["Sekiro_Randomizer", "Sekiro_ModEngine", "Sekiro_CombinedSFX", "Sekiro_DivineDragon"]
        );
        assert_eq!(catalog.total_for_game("DS3"), 4);
        assert_eq!(catalog.games(), ["DS2", "DS3", "Sekiro"]);
    }

    #[test]
    fn test_only_crash_fix_is_essential() {
        let catalog = SourceCatalog::builtin();
        let essential: Vec<&str> = catalog
            .iter()
            .filter(|d| d.essential)
            .map(|d| d.key.as_str())
            .collect();
        assert_eq!(essential, ["DS3_CrashFix"]);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let result = SourceCatalog::new(vec![direct("A", "G"), direct("A", "G")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_reduced_catalog_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[
                {"key": "X_Tool", "game": "X", "file_name": "Tool.zip", "output_dir": "X",
                 "source": {"kind": "api", "domain": "x", "mod_id": 7,
                            "name_pattern": "Extra", "category": 3}},
                {"key": "X_Fix", "game": "X", "file_name": "fix.exe", "output_dir": "X",
                 "essential": true,
                 "source": {"kind": "browser", "url": "https://www.mediafire.com/file/abc/fix.exe/file"}}
            ]"#,
        )
        .unwrap();

        let catalog = SourceCatalog::from_json_file(&path).unwrap();
        let tool = catalog.resolve("X_Tool").unwrap();
        match &tool.source {
            AssetSource::Api { category, name_pattern, .. } => {
                assert_eq!(*category, Some(FileCategory::Optional));
                assert_eq!(name_pattern.as_deref(), Some("Extra"));
            }
            other => panic!("unexpected source {:?}", other),
        }
        assert_eq!(tool.manual_hint(), "Download the 'Extra' file from OPTIONAL section");
        assert!(catalog.resolve("X_Fix").unwrap().essential);
    }

    #[test]
    fn test_category_ids() {
        assert_eq!(FileCategory::from(1), FileCategory::Main);
        assert_eq!(FileCategory::from(6), FileCategory::Other(6));
        assert_eq!(u32::from(FileCategory::Optional), 3);
    }
}
