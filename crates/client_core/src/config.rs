use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use shared::protocol::DEFAULT_WS_PATH;
use url::Url;

use crate::{connection::ConnectionOptions, stomp::Heartbeat};

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub ws_path: String,
    pub reconnect_delay_ms: u64,
    pub heartbeat_outgoing_ms: u64,
    pub heartbeat_incoming_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            ws_path: DEFAULT_WS_PATH.into(),
            reconnect_delay_ms: 5000,
            heartbeat_outgoing_ms: 4000,
            heartbeat_incoming_ms: 4000,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    ws_path: Option<String>,
    reconnect_delay_ms: Option<u64>,
    heartbeat_outgoing_ms: Option<u64>,
    heartbeat_incoming_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
}

/// Defaults, then `path` (or `client.toml` if present), then environment.
pub fn load_settings(path: Option<&Path>) -> Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{}'", path.display()))?;
            apply_file(&mut settings, &raw)
                .with_context(|| format!("invalid config file '{}'", path.display()))?;
        }
        None => {
            if let Ok(raw) = fs::read_to_string(DEFAULT_CONFIG_FILE) {
                apply_file(&mut settings, &raw)
                    .with_context(|| format!("invalid config file '{DEFAULT_CONFIG_FILE}'"))?;
            }
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut ClientSettings, raw: &str) -> Result<()> {
    let file: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file.ws_path {
        settings.ws_path = v;
    }
    if let Some(v) = file.reconnect_delay_ms {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = file.heartbeat_outgoing_ms {
        settings.heartbeat_outgoing_ms = v;
    }
    if let Some(v) = file.heartbeat_incoming_ms {
        settings.heartbeat_incoming_ms = v;
    }
    if let Some(v) = file.request_timeout_secs {
        settings.request_timeout_secs = v;
    }
    Ok(())
}

fn apply_env(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__WS_PATH") {
        settings.ws_path = v;
    }

    let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
    if let Some(v) = number("APP__RECONNECT_DELAY_MS") {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = number("APP__HEARTBEAT_OUTGOING_MS") {
        settings.heartbeat_outgoing_ms = v;
    }
    if let Some(v) = number("APP__HEARTBEAT_INCOMING_MS") {
        settings.heartbeat_incoming_ms = v;
    }
    if let Some(v) = number("APP__REQUEST_TIMEOUT_SECS") {
        settings.request_timeout_secs = v;
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The broker endpoint: the server URL with a WebSocket scheme and `ws_path`.
    pub fn ws_endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server_url '{}'", self.server_url))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            _ => bail!("server_url must start with http:// or https://"),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot use scheme {scheme} for '{}'", self.server_url))?;
        url.set_path(&self.ws_path);
        Ok(url)
    }

    pub fn connection_options(&self) -> Result<ConnectionOptions> {
        let mut options = ConnectionOptions::new(self.ws_endpoint()?);
        options.reconnect_delay = Duration::from_millis(self.reconnect_delay_ms);
        options.heartbeat = Heartbeat::new(
            Duration::from_millis(self.heartbeat_outgoing_ms),
            Duration::from_millis(self.heartbeat_incoming_ms),
        );
        options.connect_timeout = self.request_timeout();
        Ok(options)
    }
}
