use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::{
    error::{ClientError, Result},
    transport::TransportKind,
    typing::DEFAULT_TYPING_WINDOW,
};

pub const DEFAULT_CONFIG_FILE: &str = "chat_client.toml";

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_url: String,
    pub realtime_url: String,
    pub realtime_path: String,
    pub transports: Vec<TransportKind>,
    pub reconnection: bool,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub typing_window: Duration,
    pub session_file: PathBuf,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:4000/api".into(),
            realtime_url: "http://localhost:4000".into(),
            realtime_path: "/socket.io".into(),
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            reconnection: true,
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
            typing_window: DEFAULT_TYPING_WINDOW,
            session_file: PathBuf::from(".chat_session.json"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    realtime_url: Option<String>,
    realtime_path: Option<String>,
    transports: Option<Vec<String>>,
    reconnection: Option<bool>,
    reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    typing_window_ms: Option<u64>,
    session_file: Option<PathBuf>,
}

/// Loads `chat_client.toml` from the working directory (if present) and applies
/// environment overrides on top.
pub fn load_settings() -> Result<ClientSettings> {
    load_settings_from(Some(Path::new(DEFAULT_CONFIG_FILE)), |key| {
        std::env::var(key).ok()
    })
}

pub fn load_settings_from(
    config_file: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    if let Some(path) = config_file {
        match fs::read_to_string(path) {
            Ok(raw) => {
                let file_cfg: FileSettings = toml::from_str(&raw).map_err(|err| {
                    ClientError::Config(format!("failed to parse '{}': {err}", path.display()))
                })?;
                apply_file(&mut settings, file_cfg)?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "config: unable to read config file");
            }
        }
    }

    if let Some(v) = first_env(&env, &["CHAT_API_URL", "APP__API_URL"]) {
        settings.api_url = parse_url("CHAT_API_URL", &v)?;
    }
    if let Some(v) = first_env(&env, &["CHAT_REALTIME_URL", "APP__REALTIME_URL"]) {
        settings.realtime_url = parse_url("CHAT_REALTIME_URL", &v)?;
    }
    if let Some(v) = first_env(&env, &["CHAT_REALTIME_PATH", "APP__REALTIME_PATH"]) {
        settings.realtime_path = normalize_path(&v);
    }
    if let Some(v) = env("CHAT_TRANSPORTS") {
        settings.transports = parse_transports(v.split(','))?;
    }
    if let Some(v) = env("CHAT_RECONNECTION") {
        settings.reconnection = parse_value::<bool>("CHAT_RECONNECTION", &v)?;
    }
    if let Some(v) = env("CHAT_RECONNECT_ATTEMPTS") {
        settings.reconnect_attempts = parse_value("CHAT_RECONNECT_ATTEMPTS", &v)?;
    }
    if let Some(v) = env("CHAT_RECONNECT_DELAY_MS") {
        settings.reconnect_delay =
            Duration::from_millis(parse_value("CHAT_RECONNECT_DELAY_MS", &v)?);
    }
    if let Some(v) = env("CHAT_TYPING_WINDOW_MS") {
        settings.typing_window = Duration::from_millis(parse_value("CHAT_TYPING_WINDOW_MS", &v)?);
    }
    if let Some(v) = env("CHAT_SESSION_FILE") {
        settings.session_file = PathBuf::from(v);
    }

    if settings.transports.is_empty() {
        return Err(ClientError::Config(
            "at least one realtime transport must be enabled".into(),
        ));
    }

    Ok(settings)
}

fn apply_file(settings: &mut ClientSettings, file_cfg: FileSettings) -> Result<()> {
    if let Some(v) = file_cfg.api_url {
        settings.api_url = parse_url("api_url", &v)?;
    }
    if let Some(v) = file_cfg.realtime_url {
        settings.realtime_url = parse_url("realtime_url", &v)?;
    }
    if let Some(v) = file_cfg.realtime_path {
        settings.realtime_path = normalize_path(&v);
    }
    if let Some(v) = file_cfg.transports {
        settings.transports = parse_transports(v.iter().map(String::as_str))?;
    }
    if let Some(v) = file_cfg.reconnection {
        settings.reconnection = v;
    }
    if let Some(v) = file_cfg.reconnect_attempts {
        settings.reconnect_attempts = v;
    }
    if let Some(v) = file_cfg.reconnect_delay_ms {
        settings.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.typing_window_ms {
        settings.typing_window = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.session_file {
        settings.session_file = v;
    }
    Ok(())
}

fn first_env(env: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| env(key))
}

/// Validates an http(s) base url and strips any trailing slash.
pub(crate) fn parse_url(key: &str, raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim())
        .map_err(|err| ClientError::Config(format!("{key}: invalid url '{raw}': {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(raw.trim().trim_end_matches('/').to_string()),
        other => Err(ClientError::Config(format!(
            "{key}: unsupported scheme '{other}', expected http or https"
        ))),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| ClientError::Config(format!("{key}: invalid value '{raw}'")))
}

fn parse_transports<'a>(raw: impl Iterator<Item = &'a str>) -> Result<Vec<TransportKind>> {
    let mut transports = Vec::new();
    for name in raw.map(str::trim).filter(|name| !name.is_empty()) {
        let kind: TransportKind = name.parse()?;
        if !transports.contains(&kind) {
            transports.push(kind);
        }
    }
    Ok(transports)
}

fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
