use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    connection::{ReconnectPolicy, DEFAULT_RECONNECTION_ATTEMPTS, DEFAULT_RECONNECTION_DELAY},
    error::SettingsError,
    transport::{event_channel_url, DEFAULT_FRAME_BUFFER},
};

pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Base URL of the machine controller's REST surface.
    pub server_url: String,
    /// Explicit event channel URL; derived from `server_url` when unset.
    pub transport_url: Option<String>,
    pub reconnection_attempts: u32,
    pub reconnection_delay_ms: u64,
    pub backoff: BackoffKind,
    pub max_reconnection_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            transport_url: None,
            reconnection_attempts: DEFAULT_RECONNECTION_ATTEMPTS,
            reconnection_delay_ms: DEFAULT_RECONNECTION_DELAY.as_millis() as u64,
            backoff: BackoffKind::Fixed,
            max_reconnection_delay_ms: 30_000,
            request_timeout_ms: 10_000,
            event_buffer: DEFAULT_FRAME_BUFFER,
        }
    }
}

impl ClientSettings {
    pub fn server_url(&self) -> Result<Url, SettingsError> {
        parse_url("server_url", &self.server_url)
    }

    pub fn event_channel_url(&self) -> Result<Url, SettingsError> {
        match &self.transport_url {
            Some(raw) => parse_url("transport_url", raw),
            None => event_channel_url(&self.server_url()?).map_err(|err| {
                SettingsError::InvalidUrl {
                    key: "server_url",
                    reason: err.to_string(),
                }
            }),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let delay = Duration::from_millis(self.reconnection_delay_ms);
        match self.backoff {
            BackoffKind::Fixed => ReconnectPolicy::fixed(self.reconnection_attempts, delay),
            BackoffKind::Exponential => ReconnectPolicy::exponential(
                self.reconnection_attempts,
                delay,
                Duration::from_millis(self.max_reconnection_delay_ms),
            ),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_url(key: &'static str, raw: &str) -> Result<Url, SettingsError> {
    Url::parse(raw.trim()).map_err(|err| SettingsError::InvalidUrl {
        key,
        reason: format!("{raw}: {err}"),
    })
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> Result<ClientSettings, SettingsError> {
    let path = Path::new(SETTINGS_FILE);
    load_settings_from(path.exists().then_some(path), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ClientSettings, SettingsError> {
    let mut settings = match path {
        Some(path) => read_file(path)?,
        None => ClientSettings::default(),
    };

    if let Some(v) = env("VELVETPOUR_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__TRANSPORT_URL") {
        settings.transport_url = Some(v);
    }
    if let Some(v) = parse_env(&env, "APP__RECONNECTION_ATTEMPTS")? {
        settings.reconnection_attempts = v;
    }
    if let Some(v) = parse_env(&env, "APP__RECONNECTION_DELAY_MS")? {
        settings.reconnection_delay_ms = v;
    }
    if let Some(v) = parse_env(&env, "APP__BACKOFF")? {
        settings.backoff = v;
    }
    if let Some(v) = parse_env(&env, "APP__MAX_RECONNECTION_DELAY_MS")? {
        settings.max_reconnection_delay_ms = v;
    }
    if let Some(v) = parse_env(&env, "APP__REQUEST_TIMEOUT_MS")? {
        settings.request_timeout_ms = v;
    }
    if let Some(v) = parse_env(&env, "APP__EVENT_BUFFER")? {
        settings.event_buffer = v;
    }

    settings.server_url()?;
    settings.event_channel_url()?;
    Ok(settings)
}

fn read_file(path: &Path) -> Result<ClientSettings, SettingsError> {
    let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: PathBuf::from(path),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| SettingsError::Parse {
        path: PathBuf::from(path),
        source,
    })
}

fn parse_env<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, SettingsError> {
    let Some(value) = env(key) else {
        return Ok(None);
    };
    match value.trim().parse::<T>() {
        Ok(parsed) => Ok(Some(parsed)),
        Err(_) => Err(SettingsError::InvalidValue { key, value }),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
