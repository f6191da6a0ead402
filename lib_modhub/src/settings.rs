//! # Runtime Settings
//!
//! Library-level configuration and the on-disk configuration surface of the
//! reconciler:
//!
//! - `<config_dir>/instances.yaml`: the explicit instance list.
//! - `<config_dir>/modules/<Class>.yaml`: per-class overrides.
//! - `<config_dir>/modules/<instance>.yaml`: per-instance overrides.
//!
//! Missing files are normal and mean "nothing configured". Unreadable or
//! malformed files are reported as errors so the caller can log them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{HubError, HubResult};
use crate::modules::module::ModuleConfig;

pub const INSTANCES_FILE: &str = "instances.yaml";
pub const MODULE_OVERRIDES_DIR: &str = "modules";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSettings {
    /// Directories scanned for module definitions.
    pub watch_dirs: Vec<PathBuf>,
    /// Holds `instances.yaml` and the `modules/` override files.
    pub config_dir: PathBuf,
    pub scan_interval_secs: u64,
    pub cache_ttl_secs: u64,
    /// Provider used for operations no routing rule covers.
    pub default_provider: Option<String>,
    /// Operation name -> provider name; wins over built-in bindings.
    pub routing: HashMap<String, String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            watch_dirs: vec![
                PathBuf::from("modules/core"),
                PathBuf::from("modules/prod"),
                PathBuf::from("modules/beta"),
            ],
            config_dir: PathBuf::from("config"),
            scan_interval_secs: 5,
            cache_ttl_secs: 5,
            default_provider: None,
            routing: HashMap::new(),
        }
    }
}

/// One desired instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSpec {
    pub id: String,
    /// Class name the instance is built from.
    pub module: String,
    #[serde(default)]
    pub config: ModuleConfig,
}

impl InstanceSpec {
    /// The implicit instance every class gets when none is configured.
    pub fn default_for(class_name: &str) -> Self {
        Self {
            id: class_name.to_string(),
            module: class_name.to_string(),
            config: ModuleConfig::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct InstancesFile {
    #[serde(default)]
    instances: Vec<InstanceSpec>,
}

/// Reads `<config_dir>/instances.yaml`. Duplicate ids keep the first entry.
pub fn load_instance_specs(config_dir: &Path) -> HubResult<Vec<InstanceSpec>> {
    let path = config_dir.join(INSTANCES_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&path)?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: InstancesFile = serde_yml::from_str(&text)?;

    let mut seen = std::collections::HashSet::new();
    let mut specs = Vec::with_capacity(file.instances.len());
    for spec in file.instances {
        if seen.insert(spec.id.clone()) {
            specs.push(spec);
        } else {
            log::warn!("Duplicate instance id '{}' in {}, ignoring", spec.id, path.display());
        }
    }
    Ok(specs)
}

/// Reads `<config_dir>/modules/<name>.yaml` as a config map, if present.
pub fn load_override(config_dir: &Path, name: &str) -> HubResult<Option<ModuleConfig>> {
    let path = config_dir.join(MODULE_OVERRIDES_DIR).join(format!("{name}.yaml"));
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    if text.trim().is_empty() {
        return Ok(Some(ModuleConfig::new()));
    }
    let value: serde_json::Value = serde_yml::from_str(&text)?;
    match value {
        serde_json::Value::Object(map) => Ok(Some(map)),
        serde_json::Value::Null => Ok(Some(ModuleConfig::new())),
        _ => Err(HubError::DefinitionLoad {
            path,
            reason: "override file must be a mapping".to_string(),
        }),
    }
}

/// Shallow merge, `layer` keys win.
pub fn merge_into(base: &mut ModuleConfig, layer: &ModuleConfig) {
    for (k, v) in layer {
        base.insert(k.clone(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn settings_default_fields_are_optional() {
        let s: RuntimeSettings = serde_json::from_value(json!({ "cacheTtlSecs": 1 })).unwrap();
        assert_eq!(s.cache_ttl_secs, 1);
        assert_eq!(s.scan_interval_secs, 5);
        assert_eq!(s.config_dir, PathBuf::from("config"));
    }

    #[test]
    fn instances_file_drops_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(INSTANCES_FILE),
            "instances:\n  - id: tech\n    module: WatchlistModule\n    config:\n      codes: [\"600519\"]\n  - id: tech\n    module: LimitRankModule\n",
        )
        .unwrap();

        let specs = load_instance_specs(dir.path()).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].module, "WatchlistModule");
        assert_eq!(specs[0].config["codes"], json!(["600519"]));
    }

    #[test]
    fn missing_files_mean_nothing_configured() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_instance_specs(dir.path()).unwrap().is_empty());
        assert!(load_override(dir.path(), "WatchlistModule").unwrap().is_none());
    }

    #[test]
    fn override_must_be_a_mapping() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(MODULE_OVERRIDES_DIR)).unwrap();
        fs::write(dir.path().join("modules/Good.yaml"), "interval: 3\n").unwrap();
        fs::write(dir.path().join("modules/Bad.yaml"), "- 1\n- 2\n").unwrap();

        assert_eq!(load_override(dir.path(), "Good").unwrap().unwrap()["interval"], 3);
        assert!(load_override(dir.path(), "Bad").is_err());
    }
}
