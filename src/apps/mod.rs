//! Static application catalogue
//!
//! `config.yaml` lists categories of links; `mappings.yaml` can replace the
//! group allow-list of any app by URL. Both are loaded into one immutable
//! snapshot that readers share through an `Arc`.

pub mod filter;
pub mod mappings;
mod watcher;

pub use filter::{filter_for_user, is_visible};
pub use mappings::{Mapping, MappingsFile};
pub use watcher::AppsWatcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::FilesConfig;
use crate::discovery::SourceTag;
use crate::{Error, Result};

/// One dashboard link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntry {
    /// Display name
    pub name: String,
    /// Link target
    pub url: String,
    /// Icon name or URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    /// Short description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Group allow-list; empty means admin only
    #[serde(default)]
    pub groups: Vec<String>,
    /// Names of apps this one depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Discovery provenance; `None` for static entries
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceTag>,
    /// Hidden by an admin override; shown to admins only
    #[serde(default, skip_deserializing, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}

/// Named group of apps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Category heading
    pub name: String,
    /// Apps in display order
    #[serde(default)]
    pub apps: Vec<AppEntry>,
}

/// Contents of `config.yaml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppsFile {
    /// Dashboard title
    #[serde(default)]
    pub title: String,
    /// Categories in display order
    #[serde(default)]
    pub categories: Vec<Category>,
}

impl AppsFile {
    /// Load from disk; a missing file is an empty catalogue
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => Ok(Self::default()),
            Ok(text) => Ok(serde_yaml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "App catalogue not found, starting empty");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write atomically through a sibling `.tmp` file
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &serde_yaml::to_string(self)?)
    }

    /// Every app URL, in file order
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.categories
            .iter()
            .flat_map(|c| c.apps.iter().map(|a| a.url.clone()))
            .collect()
    }

    /// Replace the allow-list of every app a mapping names
    pub fn apply_mappings(&mut self, mappings: &MappingsFile) {
        for app in self.categories.iter_mut().flat_map(|c| c.apps.iter_mut()) {
            if let Some(groups) = mappings.groups_for(&app.url) {
                app.groups = groups.to_vec();
            }
        }
    }
}

/// Write `contents` to `path` via `path.tmp` and a rename
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, contents)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Live catalogue: the static file with mappings applied
pub struct AppCatalog {
    apps_path: PathBuf,
    mappings_path: PathBuf,
    current: RwLock<Arc<AppsFile>>,
}

impl AppCatalog {
    /// Load both files. Parse errors are fatal at startup.
    pub fn open(files: &FilesConfig) -> Result<Self> {
        let current = Self::read(&files.apps, &files.mappings)?;
        info!(
            path = %files.apps.display(),
            apps = current.urls().len(),
            "App catalogue loaded"
        );
        Ok(Self {
            apps_path: files.apps.clone(),
            mappings_path: files.mappings.clone(),
            current: RwLock::new(Arc::new(current)),
        })
    }

    /// Catalogue held in memory only
    #[must_use]
    pub fn from_file(file: AppsFile) -> Self {
        Self {
            apps_path: PathBuf::new(),
            mappings_path: PathBuf::new(),
            current: RwLock::new(Arc::new(file)),
        }
    }

    fn read(apps: &Path, mappings: &Path) -> Result<AppsFile> {
        let mut file = AppsFile::load(apps)?;
        let mappings = MappingsFile::load(mappings)?;
        file.apply_mappings(&mappings);
        Ok(file)
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<AppsFile> {
        self.current.read().clone()
    }

    /// Files backing the catalogue
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        [&self.apps_path, &self.mappings_path]
            .into_iter()
            .filter(|p| !p.as_os_str().is_empty())
            .cloned()
            .collect()
    }

    /// Re-read both files. On error the previous snapshot stays in place.
    pub fn reload(&self) -> Result<usize> {
        if self.apps_path.as_os_str().is_empty() {
            return Err(Error::Config("Catalogue has no backing file".into()));
        }
        let next = Self::read(&self.apps_path, &self.mappings_path)?;
        let count = next.urls().len();
        *self.current.write() = Arc::new(next);
        Ok(count)
    }
}
