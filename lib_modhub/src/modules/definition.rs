//! # Module Definitions
//!
//! A definition source is either a manifest file (`*.yaml` / `*.yml`) placed
//! directly in a watched directory, or a package directory holding a
//! `module.yaml`. A manifest lists the classes it exports:
//!
//! ```yaml
//! classes:
//!   - name: WatchlistModule
//!     kind: watchlist
//!     dependencies: [MarketDataModule]
//!     config:
//!       codes: ["600519.SH"]
//! ```
//!
//! Loading a source parses it and checks every `kind` against the catalog. A
//! source that fails either step exports nothing and is reported as a
//! [`HubError::DefinitionLoad`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;
use walkdir::WalkDir;

use crate::errors::{HubError, HubResult};
use crate::modules::catalog::ModuleCatalog;
use crate::modules::module::ModuleConfig;

pub const PACKAGE_MANIFEST: &str = "module.yaml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDefinition {
    pub name: String,
    pub kind: String,
    pub source: PathBuf,
    pub modified: SystemTime,
    pub dependencies: Vec<String>,
    /// Class-level defaults, the lowest config layer.
    pub defaults: ModuleConfig,
}

impl ClassDefinition {
    /// True when a reload produced a different class (ignores the stamp).
    pub fn differs_from(&self, other: &ClassDefinition) -> bool {
        self.kind != other.kind || self.dependencies != other.dependencies || self.defaults != other.defaults
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassManifest {
    name: String,
    kind: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    config: ModuleConfig,
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    classes: Vec<ClassManifest>,
}

/// Every definition source currently present under `watch_dirs`, with its
/// modification time. Sources are returned as the file whose mtime is tracked.
pub fn discover_sources(watch_dirs: &[PathBuf]) -> Vec<(PathBuf, SystemTime)> {
    let mut found = Vec::new();
    for dir in watch_dirs {
        if !dir.is_dir() {
            continue;
        }
        let entries = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok());
        for entry in entries {
            let path = entry.path();
            let tracked = if entry.file_type().is_dir() {
                let manifest = path.join(PACKAGE_MANIFEST);
                manifest.is_file().then_some(manifest)
            } else if is_manifest_file(path) {
                Some(path.to_path_buf())
            } else {
                None
            };
            let Some(tracked) = tracked else { continue };
            match std::fs::metadata(&tracked).and_then(|m| m.modified()) {
                Ok(mtime) => found.push((tracked, mtime)),
                Err(e) => log::error!("Error scanning {}: {}", tracked.display(), e),
            }
        }
    }
    found
}

fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Parses a source and resolves its classes against `catalog`.
pub fn load_definitions(path: &Path, modified: SystemTime, catalog: &ModuleCatalog) -> HubResult<Vec<ClassDefinition>> {
    let fail = |reason: String| HubError::DefinitionLoad {
        path: path.to_path_buf(),
        reason,
    };

    let text = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
    let manifest: Manifest = if text.trim().is_empty() {
        Manifest::default()
    } else {
        serde_yml::from_str(&text).map_err(|e| fail(e.to_string()))?
    };

    let mut names = HashSet::new();
    let mut classes = Vec::with_capacity(manifest.classes.len());
    for class in manifest.classes {
        if !catalog.contains(&class.kind) {
            return Err(fail(format!("class '{}' uses unknown kind '{}'", class.name, class.kind)));
        }
        if !names.insert(class.name.clone()) {
            return Err(fail(format!("class '{}' defined twice", class.name)));
        }
        classes.push(ClassDefinition {
            name: class.name,
            kind: class.kind,
            source: path.to_path_buf(),
            modified,
            dependencies: class.dependencies,
            defaults: class.config,
        });
    }
    Ok(classes)
}
