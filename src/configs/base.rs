use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{common::types::AnyResult, configs::*};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub rest: RestConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    /// Loads `config.toml`, falling back to `config.default.toml`.
    pub fn load() -> AnyResult<Self> {
        let config_path = ["config.toml", "config.default.toml"]
            .into_iter()
            .find(|p| Path::new(p).exists())
            .ok_or("config.toml or config.default.toml not found")?;
        Self::load_from(config_path)
    }

    pub fn load_from(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)?;
        if config_str.trim().is_empty() {
            return Err(format!("{} is empty", path.display()).into());
        }
        Self::parse(&config_str)
    }

    pub fn parse(source: &str) -> AnyResult<Self> {
        let mut config: Config = toml::from_str(source)?;
        if config.gateway.token.is_empty() {
            if let Ok(token) = std::env::var("GATELINK_TOKEN") {
                config.gateway.token = token;
            }
        }
        Ok(config)
    }
}
