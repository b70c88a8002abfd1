use crate::domain::types::TOOL_NAME_SEPARATOR;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_CONFIG_PATH: &str = "config/client.toml";

const MODEL_ENV: &str = "OPENAI_MODEL";
const BASE_URL_ENV: &str = "OPENAI_BASE_URL";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: ModelSettings,
    pub servers: Vec<ServerConfig>,
}

/// Model endpoint settings. Values from the config file win; gaps are filled
/// from the `OPENAI_*` environment variables and finally from defaults.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid server name {name:?}: names must be non-empty and must not contain '{TOOL_NAME_SEPARATOR}'")]
    InvalidServerName { name: String },
    #[error("duplicate server name {name:?}")]
    DuplicateServerName { name: String },
    #[error("server {name:?} has kind = \"command\" but no command")]
    MissingCommand { name: String },
    #[error("server {name:?} has kind = \"stream\" but no url")]
    MissingUrl { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// Local subprocess speaking JSON-RPC over its standard streams.
    Command,
    /// Persistent SSE connection to a configured URL.
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub kind: ServerKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl ServerConfig {
    /// Builds a single-provider config from a server script path, mirroring
    /// the interpreter selection of the single-server CLI mode: `.py` runs
    /// under `python3`, `.js` under `node`, anything else is taken as a
    /// literal command line.
    pub fn for_script(path: &str) -> Self {
        let command = if path.ends_with(".py") {
            format!("python3 {path}")
        } else if path.ends_with(".js") {
            format!("node {path}")
        } else {
            path.to_string()
        };
        let name = Path::new(path)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("server")
            .replace(TOOL_NAME_SEPARATOR, "_");
        Self {
            name,
            kind: ServerKind::Command,
            command: Some(command),
            url: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    model: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

impl AppConfig {
    /// Loads configuration from `path`, or from the default path when `path`
    /// is `None`. A missing file at the default path falls back to built-in
    /// defaults; a missing file at an explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let raw = match path {
            Some(path) => read_raw(path)?,
            None => match read_raw(Path::new(DEFAULT_CONFIG_PATH)) {
                Ok(raw) => raw,
                Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                    info!("Configuration file not found; using defaults");
                    RawConfig::default()
                }
                Err(other) => return Err(other),
            },
        };

        validate_servers(&raw.servers)?;
        Ok(Self {
            model: ModelSettings::from_raw(&raw),
            servers: raw.servers,
        })
    }
}

impl ModelSettings {
    fn from_raw(raw: &RawConfig) -> Self {
        Self {
            model: raw
                .model
                .clone()
                .or_else(|| env_value(MODEL_ENV))
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: raw
                .base_url
                .clone()
                .or_else(|| env_value(BASE_URL_ENV))
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: raw.api_key.clone().or_else(|| env_value(API_KEY_ENV)),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn read_raw(path: &Path) -> Result<RawConfig, ConfigError> {
    debug!(path = %path.display(), "Reading client configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn validate_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    let mut seen = Vec::new();
    for server in servers {
        if server.name.is_empty() || server.name.contains(TOOL_NAME_SEPARATOR) {
            return Err(ConfigError::InvalidServerName {
                name: server.name.clone(),
            });
        }
        if seen.contains(&server.name.as_str()) {
            return Err(ConfigError::DuplicateServerName {
                name: server.name.clone(),
            });
        }
        seen.push(server.name.as_str());
        match server.kind {
            ServerKind::Command if server.command.is_none() => {
                return Err(ConfigError::MissingCommand {
                    name: server.name.clone(),
                });
            }
            ServerKind::Stream if server.url.is_none() => {
                return Err(ConfigError::MissingUrl {
                    name: server.name.clone(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}
