use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub ws_url: String,
    pub data_dir: PathBuf,
    pub send_ack_timeout_seconds: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080".into(),
            ws_url: "ws://127.0.0.1:8080/ws".into(),
            data_dir: PathBuf::from("./data"),
            send_ack_timeout_seconds: 10,
        }
    }
}

impl ClientConfig {
    pub fn send_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.send_ack_timeout_seconds)
    }
}

pub fn load_settings() -> ClientConfig {
    let mut settings = ClientConfig::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("api_base_url") {
                settings.api_base_url = v.clone();
            }
            if let Some(v) = file_cfg.get("ws_url") {
                settings.ws_url = v.clone();
            }
            if let Some(v) = file_cfg.get("data_dir") {
                settings.data_dir = PathBuf::from(v);
            }
            if let Some(v) = file_cfg.get("send_ack_timeout_seconds") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.send_ack_timeout_seconds = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = std::env::var("APP__WS_URL") {
        settings.ws_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATA_DIR") {
        settings.data_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("APP__SEND_ACK_TIMEOUT_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.send_ack_timeout_seconds = parsed;
        }
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
