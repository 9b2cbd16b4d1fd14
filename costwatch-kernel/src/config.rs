use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("plugin config for {name} is not JSON-serializable: {source}")]
    PluginConfig {
        name: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub http_addr: String,
    pub opencost_url: String,
    pub log_level: String,
    /// Vide : store en mémoire uniquement
    pub data_file: String,
    pub scheduler: SchedulerConf,
    pub hub: HubConf,
    pub plugins: PluginsConf,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConf {
    pub csp_interval_secs: u64,
    pub kubernetes_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HubConf {
    pub client_buffer: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PluginsConf {
    pub execute_timeout_secs: u64,
    /// Configuration libre par plugin, transmise en JSON à `initialize`
    pub config: HashMap<String, serde_yaml::Value>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".into(),
            opencost_url: "http://localhost:9003".into(),
            log_level: "info".into(),
            data_file: "./data/store.json".into(),
            scheduler: SchedulerConf::default(),
            hub: HubConf::default(),
            plugins: PluginsConf::default(),
            shutdown_grace_secs: 10,
        }
    }
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self { csp_interval_secs: 3600, kubernetes_interval_secs: 300 }
    }
}

impl Default for HubConf {
    fn default() -> Self {
        Self { client_buffer: 256 }
    }
}

impl Default for PluginsConf {
    fn default() -> Self {
        Self { execute_timeout_secs: 30, config: HashMap::new() }
    }
}

impl KernelConfig {
    pub fn from_yaml(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(txt)?)
    }

    pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
        let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&txt)
    }

    /// Surcharges par variables d'environnement
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("COSTWATCH_ADDR") {
            self.http_addr = v;
        }
        if let Some(v) = get("OPENCOST_URL") {
            self.opencost_url = v;
        }
        if let Some(v) = get("COSTWATCH_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("COSTWATCH_DATA_FILE") {
            self.data_file = v;
        }
    }

    /// Configuration JSON d'un plugin, vide si absente
    pub fn plugin_config_bytes(&self, name: &str) -> Result<Vec<u8>, ConfigError> {
        match self.plugins.config.get(name) {
            Some(value) => serde_json::to_vec(value).map_err(|source| ConfigError::PluginConfig {
                name: name.to_string(),
                source,
            }),
            None => Ok(Vec::new()),
        }
    }

    pub fn plugin_configs(&self) -> HashMap<String, Vec<u8>> {
        let mut out = HashMap::new();
        for name in self.plugins.config.keys() {
            match self.plugin_config_bytes(name) {
                Ok(bytes) => {
                    out.insert(name.clone(), bytes);
                }
                Err(e) => tracing::warn!("[kernel] {}", e),
            }
        }
        out
    }

    pub fn csp_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.csp_interval_secs.max(1))
    }

    pub fn kubernetes_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.kubernetes_interval_secs.max(1))
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_secs(self.plugins.execute_timeout_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("COSTWATCH_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        KernelConfig::from_file(&path).await.unwrap_or_else(|e| {
            // tracing n'est pas encore initialisé à ce stade
            eprintln!("[kernel] config invalide ({path}): {e}");
            KernelConfig::default()
        })
    } else {
        eprintln!("[kernel] pas de {path}, usage config par défaut");
        KernelConfig::default()
    };
    cfg.apply_env(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let cfg = KernelConfig::from_yaml("  \n").unwrap();
        assert_eq!(cfg.http_addr, "0.0.0.0:8080");
        assert_eq!(cfg.hub.client_buffer, 256);
        assert_eq!(cfg.csp_interval(), Duration::from_secs(3600));
        assert_eq!(cfg.kubernetes_interval(), Duration::from_secs(300));
        assert_eq!(cfg.shutdown_grace(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_yaml_and_plugin_config() {
        let yaml = r#"
opencost_url: http://opencost.monitoring:9003
scheduler:
  kubernetes_interval_secs: 60
plugins:
  config:
    budgets:
      budgets:
        - namespace: team-a
          monthlyBudget: 500
          warningPercent: 80
"#;
        let cfg = KernelConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.kubernetes_interval(), Duration::from_secs(60));
        assert_eq!(cfg.scheduler.csp_interval_secs, 3600);
        assert_eq!(cfg.plugins.execute_timeout_secs, 30);

        let bytes = cfg.plugin_config_bytes("budgets").unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["budgets"][0]["namespace"], "team-a");
        assert_eq!(json["budgets"][0]["monthlyBudget"], 500);
        assert!(cfg.plugin_config_bytes("costbreakdown").unwrap().is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = KernelConfig::default();
        cfg.apply_env(|key| match key {
            "COSTWATCH_ADDR" => Some("127.0.0.1:9999".into()),
            "COSTWATCH_DATA_FILE" => Some(String::new()),
            _ => None,
        });
        assert_eq!(cfg.http_addr, "127.0.0.1:9999");
        assert!(cfg.data_file.is_empty());
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(KernelConfig::from_yaml("scheduler: [not, a, map]").is_err());
    }
}
