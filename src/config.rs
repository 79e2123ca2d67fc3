// Consultation settings. Defaults match a local dev setup; `from_env`
// overlays deployment values.

use crate::error::ConfigError;
use crate::peer::types::IceServerConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use url::Url;

pub const DEFAULT_ORIGIN: &str = "http://localhost:8000";
pub const DEFAULT_RELAY_BIND: &str = "0.0.0.0:8000";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsultConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Origin of the hosting page; the signaling endpoint is derived from it.
    pub origin: String,
    /// When true a call cannot proceed without local camera/microphone.
    pub media_required: bool,
    pub relay_bind: String,
}

impl Default for ConsultConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            origin: DEFAULT_ORIGIN.into(),
            media_required: false,
            relay_bind: DEFAULT_RELAY_BIND.into(),
        }
    }
}

pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        IceServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
}

impl ConsultConfig {
    /// Defaults overlaid with `CONSULT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(origin) = lookup("CONSULT_ORIGIN") {
            config.origin = origin;
        }
        if let Some(servers) = lookup("CONSULT_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .enumerate()
                .map(|(i, url)| IceServerConfig {
                    id: format!("env-{i}"),
                    r#type: if url.starts_with("turn:") { "turn" } else { "stun" }.into(),
                    url: url.to_owned(),
                    username: lookup("CONSULT_TURN_USERNAME"),
                    credential: lookup("CONSULT_TURN_CREDENTIAL"),
                })
                .collect();
        }
        if let Some(value) = lookup("CONSULT_MEDIA_REQUIRED") {
            config.media_required = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "CONSULT_MEDIA_REQUIRED",
                        value,
                    })
                }
            };
        }
        if let Some(bind) = lookup("CONSULT_RELAY_BIND") {
            config.relay_bind = bind;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::EmptyUrl(server.id.clone()));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::MissingTurnCredentials(server.id.clone()));
            }
        }
        if Url::parse(&self.origin).is_err() {
            return Err(ConfigError::InvalidOrigin(self.origin.clone()));
        }
        self.relay_addr()?;
        Ok(())
    }

    pub fn relay_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.relay_bind
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: "relay_bind",
                value: self.relay_bind.clone(),
            })
    }
}
