//! URL → groups overrides (`mappings.yaml`)

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// One mapping entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// URL of the app whose allow-list is replaced
    pub app_url: String,
    /// Replacement allow-list
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Contents of `mappings.yaml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingsFile {
    /// Entries; the last one wins for a repeated URL
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

impl MappingsFile {
    /// Load from disk; a missing or empty file has no mappings
    pub fn load(path: &Path) -> Result<Self> {
        if path.as_os_str().is_empty() {
            return Ok(Self::default());
        }
        match std::fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => Ok(Self::default()),
            Ok(text) => Ok(serde_yaml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write atomically through a sibling `.tmp` file
    pub fn save(&self, path: &Path) -> Result<()> {
        super::write_atomic(path, &serde_yaml::to_string(self)?)
    }

    /// Allow-list mapped to `url`, if any
    #[must_use]
    pub fn groups_for(&self, url: &str) -> Option<&[String]> {
        self.mappings
            .iter()
            .rev()
            .find(|m| m.app_url.trim_end_matches('/') == url.trim_end_matches('/'))
            .map(|m| m.groups.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_mapping_wins_and_trailing_slash_is_ignored() {
        let file: MappingsFile = serde_yaml::from_str(
            "mappings:\n  - app_url: https://a.lan/\n    groups: [one]\n  - app_url: https://a.lan\n    groups: [two]\n",
        )
        .unwrap();
        assert_eq!(file.groups_for("https://a.lan"), Some(&["two".to_string()][..]));
        assert_eq!(file.groups_for("https://b.lan"), None);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mappings.yaml");
        let file = MappingsFile {
            mappings: vec![Mapping {
                app_url: "https://a.lan".into(),
                groups: vec!["ops".into()],
            }],
        };
        file.save(&path).unwrap();
        assert_eq!(MappingsFile::load(&path).unwrap(), file);
    }
}
