//! Configuration parsing and validation for chat-relay.
//!
//! Configuration comes from the process environment by default, or from a
//! TOML file whose secret values may reference environment variables.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;

/// Environment variable holding the provider secret.
pub const UPSTREAM_KEY_VAR: &str = "GROQ_API_KEY";
/// Environment variable holding the secret callers must present.
pub const RELAY_KEY_VAR: &str = "RELAY_API_KEY";
/// Environment variable overriding the listen port.
pub const PORT_VAR: &str = "PORT";
/// Environment variable overriding the listen host.
pub const HOST_VAR: &str = "HOST";
/// Environment variable overriding the upstream endpoint.
pub const UPSTREAM_URL_VAR: &str = "UPSTREAM_URL";

/// Gate secret used when none is configured.
const DEFAULT_RELAY_KEY: &str = "az-intital-key";

/// Root configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8006
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Socket address string to bind, e.g. `0.0.0.0:8006`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Upstream provider configuration.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Full chat-completions endpoint URL
    pub url: String,
    /// Provider secret sent as a bearer token
    pub api_key: ApiKey,
    /// Connect-phase timeout in seconds. Streaming reads are never timed out.
    pub connect_timeout_secs: u64,
    /// Idle keep-alive connections retained in the pool
    pub max_idle_connections: usize,
    /// Upper bound on concurrently open upstream streams
    pub max_connections: usize,
}

fn default_upstream_url() -> String {
    "https://api.groq.com/openai/v1/chat/completions".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_pool_size() -> usize {
    100
}

impl UpstreamConfig {
    /// Upstream settings with defaults for everything but the secret.
    pub fn with_key(api_key: impl Into<ApiKey>) -> Self {
        Self {
            url: default_upstream_url(),
            api_key: api_key.into(),
            connect_timeout_secs: default_connect_timeout(),
            max_idle_connections: default_pool_size(),
            max_connections: default_pool_size(),
        }
    }
}

/// Edge authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// The single shared secret callers present as `Authorization: Bearer <key>`
    pub api_key: ApiKey,
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a secret was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Literal string in the config file
    Literal,
    /// Config value contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Read from a well-known environment variable (holds var name)
    Convention(String),
    /// Built-in default
    Default,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "env ({})", var),
            KeySource::Default => write!(f, "built-in default"),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{key}': {message}")]
    EnvVar {
        var: String,
        key: String,
        message: String,
    },
}

/// Raw upstream section; `api_key` may hold `${VAR}` references or be absent.
#[derive(Deserialize)]
pub struct RawUpstreamConfig {
    #[serde(default = "default_upstream_url")]
    url: String,
    api_key: Option<String>,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_secs: u64,
    #[serde(default = "default_pool_size")]
    max_idle_connections: usize,
    #[serde(default = "default_pool_size")]
    max_connections: usize,
}

#[derive(Deserialize, Default)]
pub struct RawAuthConfig {
    api_key: Option<String>,
}

/// Raw configuration deserialized directly from TOML, before env expansion.
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    upstream: Option<RawUpstreamConfig>,
    #[serde(default)]
    auth: RawAuthConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, key: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            key: key.to_string(),
            message: "Unclosed '${' in config value".to_string(),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                key: key.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            key: key.to_string(),
            message: format!("Environment variable '{}' is not set", var_name),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Resolve a secret from a config value, falling back to a convention variable.
fn resolve_key<F>(
    raw: Option<String>,
    key: &str,
    convention_var: &str,
    lookup: &F,
) -> Result<Option<(ApiKey, KeySource)>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(match raw {
        Some(value) if value.contains("${") => {
            let expanded = expand_env_vars_with(&value, key, lookup)?;
            Some((ApiKey::from(expanded), KeySource::EnvExpanded))
        }
        Some(value) => Some((ApiKey::from(value), KeySource::Literal)),
        None => lookup(convention_var).map(|value| {
            (
                ApiKey::from(value),
                KeySource::Convention(convention_var.to_string()),
            )
        }),
    })
}

impl Config {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// `GROQ_API_KEY` is required; `PORT`, `HOST`, `UPSTREAM_URL` and
    /// `RELAY_API_KEY` are optional.
    pub fn from_env_with<F>(lookup: F) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut server = ServerConfig::default();
        if let Some(port) = lookup(PORT_VAR) {
            server.port = port.trim().parse().map_err(|_| {
                ConfigError::Validation(format!("{} must be a port number, got '{}'", PORT_VAR, port))
            })?;
        }
        if let Some(host) = lookup(HOST_VAR) {
            server.host = host;
        }

        let raw = RawConfig {
            server,
            upstream: Some(RawUpstreamConfig {
                url: lookup(UPSTREAM_URL_VAR).unwrap_or_else(default_upstream_url),
                api_key: None,
                connect_timeout_secs: default_connect_timeout(),
                max_idle_connections: default_pool_size(),
                max_connections: default_pool_size(),
            }),
            auth: RawAuthConfig::default(),
        };

        Self::from_raw_with(raw, lookup)
    }

    /// Convert raw config into final config, expanding and resolving secrets.
    pub fn from_raw_with<F>(
        raw: RawConfig,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let upstream = raw.upstream.unwrap_or(RawUpstreamConfig {
            url: default_upstream_url(),
            api_key: None,
            connect_timeout_secs: default_connect_timeout(),
            max_idle_connections: default_pool_size(),
            max_connections: default_pool_size(),
        });

        let (upstream_key, upstream_source) =
            resolve_key(upstream.api_key, "upstream", UPSTREAM_KEY_VAR, &lookup)?.ok_or_else(
                || ConfigError::EnvVar {
                    var: UPSTREAM_KEY_VAR.to_string(),
                    key: "upstream".to_string(),
                    message: "provider API key is required".to_string(),
                },
            )?;

        let (auth_key, auth_source) = resolve_key(raw.auth.api_key, "auth", RELAY_KEY_VAR, &lookup)?
            .unwrap_or_else(|| (ApiKey::from(DEFAULT_RELAY_KEY), KeySource::Default));

        let config = Config {
            server: raw.server,
            upstream: UpstreamConfig {
                url: upstream.url,
                api_key: upstream_key,
                connect_timeout_secs: upstream.connect_timeout_secs,
                max_idle_connections: upstream.max_idle_connections,
                max_connections: upstream.max_connections,
            },
            auth: AuthConfig { api_key: auth_key },
        };
        config.validate()?;

        let key_sources = vec![
            ("upstream".to_string(), upstream_source),
            ("auth".to_string(), auth_source),
        ];
        Ok((config, key_sources))
    }

    /// Load configuration from a TOML file with environment variable expansion.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let raw: RawConfig = toml::from_str(&content).map_err(ConfigError::Parse)?;
        Self::from_raw_with(raw, |name| std::env::var(name).ok())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.upstream.url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Validation(format!(
                "Upstream URL must be http(s), got '{}'",
                url
            )));
        }
        if self.upstream.api_key.expose_secret().is_empty() {
            return Err(ConfigError::Validation(
                "Upstream API key is empty".to_string(),
            ));
        }
        if self.auth.api_key.expose_secret().is_empty() {
            return Err(ConfigError::Validation("Relay API key is empty".to_string()));
        }
        if self.upstream.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.upstream.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
