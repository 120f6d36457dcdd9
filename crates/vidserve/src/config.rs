//! Server configuration.
//!
//! Layers, later wins:
//! 1. built-in defaults
//! 2. optional TOML file (`--config`)
//! 3. `VIDSERVE_*` environment variables, `__` separating nested keys
//!    (`VIDSERVE_ENGINE__TASKS__STALL_TIMEOUT=120`)
//!
//! Command-line flags are applied on top by `main`.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use vidcore::EngineConfig;

pub const ENV_PREFIX: &str = "VIDSERVE_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub log_level: String,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// The layered provider chain, before extraction.
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(config_file: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(config_file).extract()
    }

    /// Create the task work directory if it is missing.
    pub async fn prepare_work_dir(&self) -> std::io::Result<()> {
        fs_err::tokio::create_dir_all(&self.engine.tasks.work_dir).await
    }
}
