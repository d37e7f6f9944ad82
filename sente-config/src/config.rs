use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Settings for the distributed evaluation client and the worker server.
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct NetworkSettings {
    /// Target number of pooled connections, and the worker-thread limit on
    /// the server side.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,

    /// Print per-connection diagnostics.
    #[serde(default = "default_nn_client_verbose")]
    pub nn_client_verbose: bool,

    /// Remote inference workers as `host:port` strings. Empty means all
    /// evaluations run locally.
    #[serde(default)]
    pub serverlist: Vec<String>,

    /// 64-bit fingerprint of the loaded weights, exchanged on connect so
    /// mismatched client/server pairs refuse each other.
    #[serde(default)]
    pub weights_hash: u64,
}

fn default_num_threads() -> usize {
    num_cpus::get()
}

fn default_nn_client_verbose() -> bool {
    false
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            num_threads: default_num_threads(),
            nn_client_verbose: default_nn_client_verbose(),
            serverlist: Vec::new(),
            weights_hash: 0,
        }
    }
}

/// Settings for the evaluation cache.
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// Requested cache size in entries. When a cache file is attached,
    /// part of this budget is redirected to the disk index.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Optional path of the disk-backed cache journal.
    #[serde(default)]
    pub cache_file: Option<String>,

    /// Open the cache file only for reading; nothing new is journaled.
    #[serde(default)]
    pub cache_file_read_only: bool,

    /// When set, the cache is sized from the playout budget instead of
    /// `cache_size`.
    #[serde(default)]
    pub max_playouts: Option<usize>,
}

fn default_cache_size() -> usize {
    150_000
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            cache_size: default_cache_size(),
            cache_file: None,
            cache_file_read_only: false,
            max_playouts: None,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub cache: CacheSettings,
}

impl NetworkSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.num_threads == 0 {
            return Err("'num_threads' must be at least 1".to_string());
        }

        for entry in &self.serverlist {
            let port = entry
                .rsplit_once(':')
                .map(|(_, port)| port)
                .ok_or_else(|| format!("serverlist entry '{entry}' is missing a ':port'"))?;
            port.parse::<u16>()
                .map_err(|_| format!("serverlist entry '{entry}' has an invalid port"))?;
        }

        Ok(())
    }
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_yaml::from_reader(file)?;
        config.validate()?;

        info!("Configuration from '{}' loaded:\n{:#?}", &path, config);

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.network.validate()?;

        Ok(())
    }

    pub fn save_to_file(&self, path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        let file = std::fs::File::create(path)?;
        serde_yaml::to_writer(file, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();

        assert!(config.network.serverlist.is_empty());
        assert!(!config.network.nn_client_verbose);
        assert!(config.network.num_threads > 0);
        assert_eq!(config.cache.cache_size, 150_000);
        assert!(config.cache.cache_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_document_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let yaml = "\
network:
  num_threads: 8
  nn_client_verbose: true
  serverlist:
    - gpu-box-1:9600
    - gpu-box-2:9601
  weights_hash: 12345
cache:
  cache_size: 20000
  cache_file: cache.lnc
";
        std::fs::write(&path, yaml).unwrap();

        let config = AppConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.network.num_threads, 8);
        assert_eq!(config.network.serverlist.len(), 2);
        assert_eq!(config.network.weights_hash, 12345);
        assert_eq!(config.cache.cache_file.as_deref(), Some("cache.lnc"));

        config.save_to_file(dir.path().join("resaved.yaml")).unwrap();
        let resaved = AppConfig::load(dir.path().join("resaved.yaml").to_str().unwrap()).unwrap();
        assert_eq!(resaved.network.num_threads, 8);
    }

    #[test]
    fn test_malformed_serverlist_is_fatal() {
        let config: AppConfig =
            serde_yaml::from_str("network:\n  serverlist: [\"no-port-here\"]\n").unwrap();
        assert!(config.validate().is_err());

        let config: AppConfig =
            serde_yaml::from_str("network:\n  serverlist: [\"host:notaport\"]\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_threads_is_rejected() {
        let config: AppConfig = serde_yaml::from_str("network:\n  num_threads: 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let parsed: Result<AppConfig, _> = serde_yaml::from_str("network:\n  typo_field: 3\n");
        assert!(parsed.is_err());
    }
}
