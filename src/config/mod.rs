//! Configuration management

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::mpd::ClientOptions;
use crate::playlist::{DEFAULT_BACKGROUND_TIMEOUT, DEFAULT_CAP};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub mpd: MpdConfig,

    #[serde(default)]
    pub playlist: PlaylistConfig,

    #[serde(default)]
    pub ws: WsConfig,
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MpdConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Per-call deadline
    pub timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub ping_interval_secs: u64,
    /// Bound on a background playlist rewrite
    pub background_timeout_secs: u64,
}

impl Default for MpdConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6600,
            password: None,
            timeout_ms: 10_000,
            reconnect_interval_ms: 1_000,
            ping_interval_secs: 30,
            background_timeout_secs: DEFAULT_BACKGROUND_TIMEOUT.as_secs(),
        }
    }
}

impl MpdConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            password: self.password.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
        }
    }

    pub fn background_timeout(&self) -> Duration {
        Duration::from_secs(self.background_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaylistConfig {
    /// Maximum queue length after weak filtering
    pub cap: usize,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self { cap: DEFAULT_CAP }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    pub keepalive_secs: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self { keepalive_secs: 10 }
    }
}

impl WsConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

/// Get config directory (MIRROR_CONFIG_DIR, XDG_CONFIG_HOME or platform default)
pub fn get_config_dir() -> std::path::PathBuf {
    if let Ok(dir) = std::env::var("MIRROR_CONFIG_DIR") {
        return std::path::PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return std::path::PathBuf::from(home).join("Library/Application Support/mpd-mirror");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return std::path::PathBuf::from(xdg).join("mpd-mirror");
        }
        if let Ok(home) = std::env::var("HOME") {
            return std::path::PathBuf::from(home).join(".config/mpd-mirror");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return std::path::PathBuf::from(appdata).join("mpd-mirror");
        }
    }

    // Fallback to current directory
    std::path::PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("port", default_port() as i64)?
        // config.toml / config.json / config.yaml, if present
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // MIRROR_PORT, MIRROR_MPD__HOST, MIRROR_PLAYLIST__CAP, ...
        .add_source(
            ::config::Environment::with_prefix("MIRROR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // MIRROR_PORT > PORT > config > default
    if let Ok(port) = std::env::var("MIRROR_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("port", port_num as i64)?;
        }
    } else if let Ok(port) = std::env::var("PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("port", port_num as i64)?;
        }
    }

    // MPD_HOST / MPD_PORT as understood by mpc: MPD_HOST may be "password@host".
    if let Ok(host) = std::env::var("MPD_HOST") {
        match host.split_once('@') {
            Some((password, host)) if !password.is_empty() => {
                builder = builder
                    .set_override("mpd.password", password.to_string())?
                    .set_override("mpd.host", host.to_string())?;
            }
            _ => {
                builder = builder.set_override("mpd.host", host)?;
            }
        }
    }
    if let Ok(port) = std::env::var("MPD_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("mpd.port", port_num as i64)?;
        }
    }

    let config = builder.build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: &[&str] = &[
        "MIRROR_PORT",
        "PORT",
        "MPD_HOST",
        "MPD_PORT",
        "MIRROR_MPD__HOST",
        "MIRROR_PLAYLIST__CAP",
    ];

    fn clean_env() {
        for var in VARS {
            env::remove_var(var);
        }
        env::set_var("MIRROR_CONFIG_DIR", "/tmp/mpd-mirror-test-nonexistent");
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clean_env();
        let config = load_config().expect("config should load");
        env::remove_var("MIRROR_CONFIG_DIR");

        assert_eq!(config.port, 8080);
        assert_eq!(config.mpd.addr(), "localhost:6600");
        assert_eq!(config.mpd.password, None);
        assert_eq!(config.playlist.cap, 9999);
        assert_eq!(config.ws.keepalive(), Duration::from_secs(10));

        let options = config.mpd.client_options();
        assert_eq!(options.timeout, Duration::from_secs(10));
        assert_eq!(options.reconnect_interval, Duration::from_secs(1));
    }

    #[test]
    #[serial]
    fn test_mpd_host_and_port_env() {
        clean_env();
        env::set_var("MPD_HOST", "192.168.1.100");
        env::set_var("MPD_PORT", "6601");

        let config = load_config().expect("config should load");
        clean_env();
        env::remove_var("MIRROR_CONFIG_DIR");

        assert_eq!(config.mpd.host, "192.168.1.100");
        assert_eq!(config.mpd.port, 6601);
        assert_eq!(config.mpd.timeout_ms, 10_000);
    }

    #[test]
    #[serial]
    fn test_mpd_host_with_password() {
        clean_env();
        env::set_var("MPD_HOST", "secret@music.local");

        let config = load_config().expect("config should load");
        clean_env();
        env::remove_var("MIRROR_CONFIG_DIR");

        assert_eq!(config.mpd.host, "music.local");
        assert_eq!(config.mpd.password.as_deref(), Some("secret"));
    }

    #[test]
    #[serial]
    fn test_nested_prefixed_env() {
        clean_env();
        env::set_var("MIRROR_MPD__HOST", "nested.local");
        env::set_var("MIRROR_PLAYLIST__CAP", "500");

        let config = load_config().expect("config should load");
        clean_env();
        env::remove_var("MIRROR_CONFIG_DIR");

        assert_eq!(config.mpd.host, "nested.local");
        assert_eq!(config.mpd.port, 6600);
        assert_eq!(config.playlist.cap, 500);
    }

    #[test]
    #[serial]
    fn test_port_env_fallback() {
        clean_env();
        env::set_var("PORT", "3000");

        let config = load_config().expect("config should load");
        clean_env();
        env::remove_var("MIRROR_CONFIG_DIR");

        assert_eq!(config.port, 3000, "PORT env var should set config.port");
    }

    #[test]
    #[serial]
    fn test_mirror_port_takes_precedence_over_port() {
        clean_env();
        env::set_var("MIRROR_PORT", "5000");
        env::set_var("PORT", "3000");

        let config = load_config().expect("config should load");
        clean_env();
        env::remove_var("MIRROR_CONFIG_DIR");

        assert_eq!(config.port, 5000, "MIRROR_PORT should take precedence over PORT");
    }

    #[test]
    #[serial]
    fn test_invalid_port_uses_default() {
        clean_env();
        env::set_var("PORT", "not-a-number");

        let config = load_config().expect("config should load");
        clean_env();
        env::remove_var("MIRROR_CONFIG_DIR");

        assert_eq!(config.port, 8080, "Invalid PORT should fall back to default");
    }

    #[test]
    #[serial]
    fn test_config_file_in_config_dir() {
        clean_env();
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        std::fs::write(
            temp_dir.path().join("config.toml"),
            "port = 9090\n[mpd]\nhost = \"file.local\"\nbackground_timeout_secs = 5\n[ws]\nkeepalive_secs = 3\n",
        )
        .expect("write config");
        env::set_var("MIRROR_CONFIG_DIR", temp_dir.path());

        let config = load_config().expect("config should load");
        env::remove_var("MIRROR_CONFIG_DIR");

        assert_eq!(config.port, 9090);
        assert_eq!(config.mpd.host, "file.local");
        assert_eq!(config.mpd.background_timeout(), Duration::from_secs(5));
        assert_eq!(config.ws.keepalive_secs, 3);
        assert_eq!(config.playlist.cap, 9999);
    }

    #[test]
    #[serial]
    fn test_get_config_dir_prefers_env() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        env::set_var("MIRROR_CONFIG_DIR", temp_dir.path());
        let dir = get_config_dir();
        env::remove_var("MIRROR_CONFIG_DIR");

        assert_eq!(dir, temp_dir.path());
    }
}
