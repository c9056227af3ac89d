use std::{collections::HashMap, fs, time::Duration};

use tracing::warn;

use crate::{
    download::DownloadSettings, progress::ProgressSettings, search::SearchSettings,
    transport::Credentials,
};

pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub api_key: Option<String>,
    pub search_debounce_ms: u64,
    pub search_page_size: u32,
    pub download_revert_ms: u64,
    pub sync_poll_interval_ms: u64,
    pub sync_grace_ticks: u32,
    pub request_timeout_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:1323".into(),
            api_key: None,
            search_debounce_ms: 280,
            search_page_size: 30,
            download_revert_ms: 1500,
            sync_poll_interval_ms: 2000,
            sync_grace_ticks: 5,
            request_timeout_secs: Some(30),
        }
    }
}

/// Defaults, then `client.toml` in the working directory, then the
/// environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        settings.apply_file(&raw);
    }
    settings.apply_env(|key| std::env::var(key).ok());

    settings
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "config: ignoring unparsable number");
            None
        }
    }
}

impl Settings {
    /// Applies a flat `key = value` table. Unknown keys are ignored.
    pub fn apply_file(&mut self, raw: &str) {
        let table = match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(table) => table,
            Err(err) => {
                warn!(error = %err, file = SETTINGS_FILE, "config: ignoring malformed settings file");
                return;
            }
        };

        for (key, value) in table {
            let value = match value {
                toml::Value::String(text) => text,
                toml::Value::Integer(number) => number.to_string(),
                other => {
                    warn!(key = %key, kind = other.type_str(), "config: unsupported value type");
                    continue;
                }
            };
            self.set(&key, &value);
        }
    }

    /// Applies environment overrides; `APP__` names win over the plain ones.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SERVER_URL") {
            self.set("server_url", &v);
        }
        if let Some(v) = lookup("NPA_ADMIN_API_KEY") {
            self.set("api_key", &v);
        }

        for key in [
            "server_url",
            "api_key",
            "search_debounce_ms",
            "search_page_size",
            "download_revert_ms",
            "sync_poll_interval_ms",
            "sync_grace_ticks",
            "request_timeout_secs",
        ] {
            if let Some(v) = lookup(&format!("APP__{}", key.to_ascii_uppercase())) {
                self.set(key, &v);
            }
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        match key {
            "server_url" => self.server_url = value.trim().to_string(),
            "api_key" => {
                let value = value.trim();
                self.api_key = (!value.is_empty()).then(|| value.to_string());
            }
            "search_debounce_ms" => {
                if let Some(v) = parse_number(key, value) {
                    self.search_debounce_ms = v;
                }
            }
            "search_page_size" => {
                if let Some(v) = parse_number::<u32>(key, value).filter(|v| *v > 0) {
                    self.search_page_size = v;
                }
            }
            "download_revert_ms" => {
                if let Some(v) = parse_number(key, value) {
                    self.download_revert_ms = v;
                }
            }
            "sync_poll_interval_ms" => {
                if let Some(v) = parse_number::<u64>(key, value).filter(|v| *v > 0) {
                    self.sync_poll_interval_ms = v;
                }
            }
            "sync_grace_ticks" => {
                if let Some(v) = parse_number(key, value) {
                    self.sync_grace_ticks = v;
                }
            }
            "request_timeout_secs" => {
                // 0 disables the client-side timeout.
                if let Some(v) = parse_number::<u64>(key, value) {
                    self.request_timeout_secs = (v > 0).then_some(v);
                }
            }
            _ => {}
        }
    }

    pub fn search(&self) -> SearchSettings {
        SearchSettings {
            debounce: Duration::from_millis(self.search_debounce_ms),
            page_size: self.search_page_size,
        }
    }

    pub fn download(&self) -> DownloadSettings {
        DownloadSettings {
            revert_after: Duration::from_millis(self.download_revert_ms),
        }
    }

    pub fn progress(&self) -> ProgressSettings {
        ProgressSettings {
            poll_interval: Duration::from_millis(self.sync_poll_interval_ms),
            grace_ticks: self.sync_grace_ticks,
        }
    }

    pub fn credentials(&self) -> Credentials {
        self.api_key
            .as_deref()
            .map(Credentials::api_key)
            .unwrap_or_default()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}
