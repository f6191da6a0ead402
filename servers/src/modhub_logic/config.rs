use clap::Parser;
use lib_modhub::RuntimeSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Pluggable module runtime with a live dashboard feed", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "MODHUB_PORT", help = "Port to listen on for dashboard clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "MODHUB_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "MODHUB_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "MODHUB_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(
        long = "watch-dir",
        env = "MODHUB_WATCH_DIRS",
        value_delimiter = ',',
        help = "Directories scanned for module definitions (comma separated)."
    )]
    pub watch_dirs: Option<Vec<PathBuf>>,

    #[clap(long, env = "MODHUB_MODULES_CONFIG_DIR", help = "Directory holding instances.yaml and modules/ overrides.")]
    pub modules_config_dir: Option<PathBuf>,

    #[clap(long, env = "MODHUB_SCAN_INTERVAL_SECONDS", help = "Seconds between definition scans.")]
    pub scan_interval_seconds: Option<u64>,

    #[clap(long, env = "MODHUB_CACHE_TTL_SECONDS", help = "Seconds a cached provider result stays fresh.")]
    pub cache_ttl_seconds: Option<u64>,

    #[clap(long, env = "MODHUB_DEFAULT_PROVIDER", help = "Provider used when no routing rule covers an operation.")]
    pub default_provider: Option<String>,

    /// Operation -> provider name. Only settable from the config file.
    #[clap(skip)]
    pub routing: Option<HashMap<String, String>>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            watch_dirs: other.watch_dirs.or(self.watch_dirs),
            modules_config_dir: other.modules_config_dir.or(self.modules_config_dir),
            scan_interval_seconds: other.scan_interval_seconds.or(self.scan_interval_seconds),
            cache_ttl_seconds: other.cache_ttl_seconds.or(self.cache_ttl_seconds),
            default_provider: other.default_provider.or(self.default_provider),
            routing: other.routing.or(self.routing),
        }
    }

    /// Library settings; anything unset falls back to the library defaults.
    pub fn runtime_settings(&self) -> RuntimeSettings {
        let defaults = RuntimeSettings::default();
        RuntimeSettings {
            watch_dirs: self.watch_dirs.clone().unwrap_or(defaults.watch_dirs),
            config_dir: self.modules_config_dir.clone().unwrap_or(defaults.config_dir),
            scan_interval_secs: self.scan_interval_seconds.unwrap_or(defaults.scan_interval_secs),
            cache_ttl_secs: self.cache_ttl_seconds.unwrap_or(defaults.cache_ttl_secs),
            default_provider: self.default_provider.clone().or(defaults.default_provider),
            routing: self.routing.clone().unwrap_or(defaults.routing),
        }
    }
}

pub fn load_config() -> Config {
    // 1. Load defaults
    let default_config = Config {
        port: Some(8000),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    };

    // 2. Load from config file (modhub.conf) if present.
    //    Allow overriding default config file path with CLI arg.
    let cli_args = Config::parse();

    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("modhub.conf"));

    let mut current_config = default_config;

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => eprintln!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => eprintln!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    }

    // 3. Environment variables and CLI arguments win over the file.
    current_config.merge(cli_args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_layers_win_and_unset_fields_fall_through() {
        let base = Config {
            port: Some(8000),
            log_level: Some("info".into()),
            ..Default::default()
        };
        let file: Config = serde_json::from_str(
            r#"{ "port": 9100, "cacheTtlSeconds": 2, "routing": { "get_price": "feed" } }"#,
        )
        .unwrap();
        let cli = Config {
            port: Some(9200),
            ..Default::default()
        };

        let merged = base.merge(file).merge(cli);
        assert_eq!(merged.port, Some(9200));
        assert_eq!(merged.log_level.as_deref(), Some("info"));

        let settings = merged.runtime_settings();
        assert_eq!(settings.cache_ttl_secs, 2);
        assert_eq!(settings.scan_interval_secs, 5);
        assert_eq!(settings.routing.get("get_price").map(String::as_str), Some("feed"));
    }
}
