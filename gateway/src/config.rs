//! YAML configuration loading and validation.
//!
//! Every field defaults so that a missing key surfaces through the
//! validation pass with its own message instead of a generic parse error.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::types::ReasonCode;
use crate::util::is_blank;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    Load(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("missing required value: {0}")]
    MissingField(&'static str),
    #[error("server value must be positive: {0}")]
    InvalidServerValue(&'static str),
    #[error("unknown reason code in upstreamReasonCode: {0:#04x}")]
    UnknownReasonCode(u8),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub port: u16,
    #[serde(default, rename = "mecID")]
    pub mec_id: String,
    #[serde(default, rename = "tokenFile")]
    pub token_file: String,
    #[serde(default, rename = "maxHeaderBytes")]
    pub max_header_bytes: i64,
    #[serde(default, rename = "readTimeout")]
    pub read_timeout: i64,
    #[serde(default, rename = "writeTimeout")]
    pub write_timeout: i64,
    #[serde(default, rename = "handlerTimeout")]
    pub handler_timeout: i64,
    #[serde(default, rename = "upstreamReasonCode")]
    pub upstream_reason_code: Vec<u8>,
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub caas: CaasSettings,
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub debug: DebugSettings,
    #[serde(default)]
    pub metrics: Option<MetricsSettings>,
}

/// How the gateway authenticates its broker control-channel connects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum AuthType {
    #[default]
    None,
    File,
    Registration,
}

impl TryFrom<u8> for AuthType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AuthType::None),
            1 => Ok(AuthType::File),
            2 => Ok(AuthType::Registration),
            other => Err(format!("authType must be 0, 1 or 2, got {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MqttSettings {
    #[serde(default)]
    pub server: String,
    #[serde(default, rename = "successCode")]
    pub success_code: u8,
    #[serde(default, rename = "authType")]
    pub auth_type: AuthType,
    #[serde(default, rename = "authFile")]
    pub auth_file: String,
    #[serde(default)]
    pub crs: CrsSettings,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CrsSettings {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub entity: String,
    #[serde(default, rename = "cfgPath")]
    pub cfg_path: String,
    #[serde(default, rename = "registrationEndpoint")]
    pub registration_endpoint: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CaasSettings {
    #[serde(default)]
    pub server: String,
    #[serde(default, rename = "createEndpoint")]
    pub create_endpoint: String,
    #[serde(default, rename = "deleteEndpoint")]
    pub delete_endpoint: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RedisSettings {
    #[serde(default)]
    pub server: String,
    #[serde(default, rename = "authFile")]
    pub auth_file: String,
    #[serde(default, rename = "DBIndex")]
    pub db_index: i64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DebugSettings {
    #[serde(default, rename = "flushEndpoint")]
    pub flush_endpoint: String,
    #[serde(default, rename = "tokenEndpoint")]
    pub token_endpoint: String,
    #[serde(default, rename = "mecEndpoint")]
    pub mec_endpoint: String,
    #[serde(default, rename = "reqLogEndpoint")]
    pub req_log_endpoint: String,
    #[serde(default, rename = "debugLog")]
    pub debug_log: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MetricsSettings {
    #[serde(rename = "statsdHost")]
    pub statsd_host: String,
    #[serde(rename = "statsdPort")]
    pub statsd_port: u16,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every required field, reporting the first missing one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::MissingField("port"));
        }
        if is_blank(&self.mec_id) {
            return Err(ConfigError::MissingField("mecID"));
        }
        if is_blank(&self.token_file) {
            return Err(ConfigError::MissingField("tokenFile"));
        }
        if self.read_timeout <= 0 {
            return Err(ConfigError::InvalidServerValue("readTimeout"));
        }
        if self.write_timeout <= 0 {
            return Err(ConfigError::InvalidServerValue("writeTimeout"));
        }
        if self.max_header_bytes <= 0 {
            return Err(ConfigError::InvalidServerValue("maxHeaderBytes"));
        }
        if self.handler_timeout <= 0 {
            return Err(ConfigError::InvalidServerValue("handlerTimeout"));
        }
        if is_blank(&self.caas.server) {
            return Err(ConfigError::MissingField("caas.server"));
        }
        if is_blank(&self.mqtt.server) {
            return Err(ConfigError::MissingField("mqtt.server"));
        }
        if is_blank(&self.redis.server) {
            return Err(ConfigError::MissingField("redis.server"));
        }
        if is_blank(&self.caas.create_endpoint) {
            return Err(ConfigError::MissingField("caas.createEndpoint"));
        }
        if is_blank(&self.caas.delete_endpoint) {
            return Err(ConfigError::MissingField("caas.deleteEndpoint"));
        }
        match self.mqtt.auth_type {
            AuthType::Registration => {
                if is_blank(&self.mqtt.crs.server) {
                    return Err(ConfigError::MissingField("mqtt.crs.server"));
                }
                if is_blank(&self.mqtt.crs.entity) {
                    return Err(ConfigError::MissingField("mqtt.crs.entity"));
                }
                if is_blank(&self.mqtt.crs.registration_endpoint) {
                    return Err(ConfigError::MissingField("mqtt.crs.registrationEndpoint"));
                }
                if is_blank(&self.mqtt.crs.cfg_path) {
                    return Err(ConfigError::MissingField("mqtt.crs.cfgPath"));
                }
            }
            AuthType::File => {
                if is_blank(&self.mqtt.auth_file) {
                    return Err(ConfigError::MissingField("mqtt.authFile"));
                }
            }
            AuthType::None => {}
        }
        if is_blank(&self.redis.auth_file) {
            return Err(ConfigError::MissingField("redis.authFile"));
        }
        for code in &self.upstream_reason_code {
            if !ReasonCode(*code).is_known() {
                return Err(ConfigError::UnknownReasonCode(*code));
            }
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout as u64)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout as u64)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout as u64)
    }
}
