use std::env;
use std::fmt;
use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;

pub const DEFAULT_SERVER: &str = "127.0.0.1:8000";
pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_millis(2000);
pub const DEFAULT_REPAIR_DELAY: Duration = Duration::from_millis(1500);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Which matchmaking pool (and endpoint) the session joins.
#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum ChatMode {
    #[default]
    Text,
    Video,
}

impl ChatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatMode::Text => "text",
            ChatMode::Video => "video",
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Websocket,
    Rest,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Matchmaking server address, with or without a scheme
    pub server: String,
    pub mode: ChatMode,
    pub transport: TransportKind,
    /// STUN/TURN urls handed to the peer connection untouched
    pub ice_servers: Vec<String>,
    /// Quiet period after the last keystroke before `typing=false` is sent
    pub typing_idle: Duration,
    /// Pause before a video session asks for a new partner on its own
    pub repair_delay: Duration,
    /// Inbox poll cadence for the REST channel
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            mode: ChatMode::default(),
            transport: TransportKind::default(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|url| url.to_string()).collect(),
            typing_idle: DEFAULT_TYPING_IDLE,
            repair_delay: DEFAULT_REPAIR_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(server) = env::var("STRANGER_SERVER") {
            config.server = normalize_server(&server);
        }
        if let Ok(mode) = env::var("STRANGER_MODE") {
            config.mode = ChatMode::from_str(&mode, true).map_err(|_| ConfigError::Invalid {
                var: "STRANGER_MODE",
                value: mode,
            })?;
        }
        if let Ok(transport) = env::var("STRANGER_TRANSPORT") {
            config.transport =
                TransportKind::from_str(&transport, true).map_err(|_| ConfigError::Invalid {
                    var: "STRANGER_TRANSPORT",
                    value: transport,
                })?;
        }
        if let Ok(servers) = env::var("STRANGER_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(idle) = millis_from_env("STRANGER_TYPING_IDLE_MS")? {
            config.typing_idle = idle;
        }
        if let Some(delay) = millis_from_env("STRANGER_REPAIR_DELAY_MS")? {
            config.repair_delay = delay;
        }
        if let Some(interval) = millis_from_env("STRANGER_POLL_INTERVAL_MS")? {
            config.poll_interval = interval;
        }

        Ok(config)
    }

    pub fn with_server(mut self, server: &str) -> Self {
        self.server = normalize_server(server);
        self
    }
}

// Normalize localhost to IPv4 so the client does not wander onto ::1
fn normalize_server(server: &str) -> String {
    let server = server.trim();
    if server.starts_with("localhost:") {
        server.replacen("localhost", "127.0.0.1", 1)
    } else {
        server.to_string()
    }
}

fn millis_from_env(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment tests must not run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: [&str; 7] = [
        "STRANGER_SERVER",
        "STRANGER_MODE",
        "STRANGER_TRANSPORT",
        "STRANGER_ICE_SERVERS",
        "STRANGER_TYPING_IDLE_MS",
        "STRANGER_REPAIR_DELAY_MS",
        "STRANGER_POLL_INTERVAL_MS",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_match_reference_timings() {
        let config = Config::default();
        assert_eq!(config.server, "127.0.0.1:8000");
        assert_eq!(config.mode, ChatMode::Text);
        assert_eq!(config.typing_idle, Duration::from_millis(2000));
        assert_eq!(config.repair_delay, Duration::from_millis(1500));
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn env_overrides_are_applied() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("STRANGER_SERVER", "localhost:9000");
            env::set_var("STRANGER_MODE", "video");
            env::set_var("STRANGER_ICE_SERVERS", "stun:a.example:3478, ,turn:b.example");
            env::set_var("STRANGER_REPAIR_DELAY_MS", "250");
        }
        let config = Config::from_env().expect("config");
        clear_env();

        assert_eq!(config.server, "127.0.0.1:9000");
        assert_eq!(config.mode, ChatMode::Video);
        assert_eq!(
            config.ice_servers,
            vec!["stun:a.example:3478".to_string(), "turn:b.example".to_string()]
        );
        assert_eq!(config.repair_delay, Duration::from_millis(250));
        assert_eq!(config.typing_idle, DEFAULT_TYPING_IDLE);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("STRANGER_TYPING_IDLE_MS", "soon");
        }
        let result = Config::from_env();
        clear_env();

        assert_eq!(
            result.unwrap_err(),
            ConfigError::Invalid {
                var: "STRANGER_TYPING_IDLE_MS",
                value: "soon".into()
            }
        );
    }
}
