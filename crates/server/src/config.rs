use std::{collections::HashMap, fs, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    /// Simulated pour time per ingredient.
    pub pour_delay_ms: u64,
    /// Cocktail ids whose pour always fails, for exercising failure paths.
    pub fail_cocktails: Vec<i64>,
    pub event_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "0.0.0.0:5000".into(),
            pour_delay_ms: 2500,
            fail_cocktails: Vec::new(),
            event_buffer: 256,
        }
    }
}

impl Settings {
    pub fn pour_delay(&self, ingredients: usize) -> Duration {
        Duration::from_millis(self.pour_delay_ms.saturating_mul(ingredients.max(1) as u64))
    }
}

pub fn load_settings() -> Settings {
    let raw = fs::read_to_string("server.toml").ok();
    load_settings_from(raw.as_deref(), |key| std::env::var(key).ok())
}

pub fn load_settings_from(raw: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = raw {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) {
            if let Some(v) = file_cfg.get("bind_addr").and_then(toml::Value::as_str) {
                settings.server_bind = v.to_string();
            }
            if let Some(v) = file_cfg.get("pour_delay_ms").and_then(toml::Value::as_integer) {
                settings.pour_delay_ms = v.max(0) as u64;
            }
            if let Some(v) = file_cfg.get("fail_cocktails").and_then(toml::Value::as_array) {
                settings.fail_cocktails = v.iter().filter_map(toml::Value::as_integer).collect();
            }
            if let Some(v) = file_cfg.get("event_buffer").and_then(toml::Value::as_integer) {
                settings.event_buffer = v.max(1) as usize;
            }
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = env("APP__POUR_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.pour_delay_ms = parsed;
        }
    }

    if let Some(v) = env("APP__FAIL_COCKTAILS") {
        settings.fail_cocktails = v
            .split(',')
            .filter_map(|id| id.trim().parse().ok())
            .collect();
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
