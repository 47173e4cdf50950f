use std::path::PathBuf;
use std::time::Duration;

use crate::error::AgentError;
use crate::process::ExternalTool;

/// Default restart budget after a relay exits cleanly on its own.
pub const DEFAULT_MAX_AUTO_RESTARTS: u32 = 1;

/// Agent runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub database_url: String,
    pub server_token: String,
    /// Overrides the server row's `base_path` when set.
    pub base_path: Option<PathBuf>,
    pub relay_bin: ExternalTool,
    pub capture_bin: ExternalTool,
    pub probe_bin: ExternalTool,
    pub remux_bin: ExternalTool,
    pub heartbeat_interval: Duration,
    pub command_poll_interval: Duration,
    pub stats_interval: Duration,
    pub launch_grace: Duration,
    pub stop_grace: Duration,
    pub probe_timeout: Duration,
    pub rewrap_timeout: Duration,
    pub command_watchdog: Duration,
    pub stale_server_after: Duration,
    pub max_auto_restarts: u32,
    pub resume_channels: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            server_token: String::new(),
            base_path: None,
            relay_bin: ExternalTool::new("srt-live-transmit"),
            capture_bin: ExternalTool::new("srt-live-transmit"),
            probe_bin: ExternalTool::new("ffprobe"),
            remux_bin: ExternalTool::new("ffmpeg"),
            heartbeat_interval: Duration::from_secs(5),
            command_poll_interval: Duration::from_secs(2),
            stats_interval: Duration::from_millis(1000),
            launch_grace: Duration::from_millis(1500),
            stop_grace: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(30),
            rewrap_timeout: Duration::from_secs(3600),
            command_watchdog: Duration::from_secs(300),
            stale_server_after: Duration::from_secs(30),
            max_auto_restarts: DEFAULT_MAX_AUTO_RESTARTS,
            resume_channels: true,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env var                      | Default              |
    /// |------------------------------|----------------------|
    /// | `DATABASE_URL`               | (required)           |
    /// | `SERVER_TOKEN`               | (required)           |
    /// | `BASE_PATH`                  | server row, else `/var/streaming` |
    /// | `RELAY_BIN`                  | `srt-live-transmit`  |
    /// | `CAPTURE_BIN`                | `srt-live-transmit`  |
    /// | `PROBE_BIN`                  | `ffprobe`            |
    /// | `REMUX_BIN`                  | `ffmpeg`             |
    /// | `HEARTBEAT_INTERVAL_SECS`    | `5`                  |
    /// | `COMMAND_POLL_INTERVAL_SECS` | `2`                  |
    /// | `STATS_INTERVAL_MS`          | `1000`               |
    /// | `LAUNCH_GRACE_MS`            | `1500`               |
    /// | `STOP_GRACE_SECS`            | `10`                 |
    /// | `PROBE_TIMEOUT_SECS`         | `30`                 |
    /// | `REWRAP_TIMEOUT_SECS`        | `3600`               |
    /// | `COMMAND_WATCHDOG_SECS`      | `300`                |
    /// | `STALE_SERVER_SECS`          | `30`                 |
    /// | `MAX_AUTO_RESTARTS`          | `1`                  |
    /// | `RESUME_CHANNELS`            | `true`               |
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AgentError::Config(format!("{key} must be set")))
        };
        let tool = |key: &str, default: ExternalTool| match lookup(key) {
            Some(v) => ExternalTool::parse(&v),
            None => Ok(default),
        };
        let secs = |key: &str, default: Duration| {
            parse_number(&lookup, key, default.as_secs()).map(Duration::from_secs)
        };
        let millis = |key: &str, default: Duration| {
            parse_number(&lookup, key, default.as_millis() as u64).map(Duration::from_millis)
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            server_token: required("SERVER_TOKEN")?,
            base_path: lookup("BASE_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            relay_bin: tool("RELAY_BIN", defaults.relay_bin)?,
            capture_bin: tool("CAPTURE_BIN", defaults.capture_bin)?,
            probe_bin: tool("PROBE_BIN", defaults.probe_bin)?,
            remux_bin: tool("REMUX_BIN", defaults.remux_bin)?,
            heartbeat_interval: secs("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            command_poll_interval: secs(
                "COMMAND_POLL_INTERVAL_SECS",
                defaults.command_poll_interval,
            )?,
            stats_interval: millis("STATS_INTERVAL_MS", defaults.stats_interval)?,
            launch_grace: millis("LAUNCH_GRACE_MS", defaults.launch_grace)?,
            stop_grace: secs("STOP_GRACE_SECS", defaults.stop_grace)?,
            probe_timeout: secs("PROBE_TIMEOUT_SECS", defaults.probe_timeout)?,
            rewrap_timeout: secs("REWRAP_TIMEOUT_SECS", defaults.rewrap_timeout)?,
            command_watchdog: secs("COMMAND_WATCHDOG_SECS", defaults.command_watchdog)?,
            stale_server_after: secs("STALE_SERVER_SECS", defaults.stale_server_after)?,
            max_auto_restarts: parse_number(
                &lookup,
                "MAX_AUTO_RESTARTS",
                u64::from(defaults.max_auto_restarts),
            )?
            .try_into()
            .map_err(|_| AgentError::Config("MAX_AUTO_RESTARTS is too large".into()))?,
            resume_channels: parse_bool(&lookup, "RESUME_CHANNELS", defaults.resume_channels)?,
        })
    }
}

fn parse_number<F>(lookup: &F, key: &str, default: u64) -> Result<u64, AgentError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| AgentError::Config(format!("{key} must be a non-negative integer, got '{v}'"))),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool, AgentError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(AgentError::Config(format!("{key} must be a boolean, got '{v}'"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AgentConfig, AgentError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn credentials_are_required() {
        assert_matches!(config_from(&[]), Err(AgentError::Config(msg)) if msg.contains("DATABASE_URL"));
        assert_matches!(
            config_from(&[("DATABASE_URL", "postgres://localhost/srtcast")]),
            Err(AgentError::Config(msg)) if msg.contains("SERVER_TOKEN")
        );
    }

    #[test]
    fn defaults_apply() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/srtcast"),
            ("SERVER_TOKEN", "tok_abcdefghijklmnop"),
        ])
        .unwrap();
        assert_eq!(config.relay_bin.program, "srt-live-transmit");
        assert_eq!(config.probe_timeout, Duration::from_secs(30));
        assert_eq!(config.launch_grace, Duration::from_millis(1500));
        assert_eq!(config.max_auto_restarts, 1);
        assert!(config.resume_channels);
        assert!(config.base_path.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/srtcast"),
            ("SERVER_TOKEN", "tok_abcdefghijklmnop"),
            ("BASE_PATH", "/srv/streams"),
            ("REMUX_BIN", "ffmpeg -hide_banner"),
            ("STOP_GRACE_SECS", "3"),
            ("RESUME_CHANNELS", "false"),
        ])
        .unwrap();
        assert_eq!(config.base_path, Some(PathBuf::from("/srv/streams")));
        assert_eq!(config.remux_bin.leading_args, vec!["-hide_banner"]);
        assert_eq!(config.stop_grace, Duration::from_secs(3));
        assert!(!config.resume_channels);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let result = config_from(&[
            ("DATABASE_URL", "postgres://localhost/srtcast"),
            ("SERVER_TOKEN", "tok_abcdefghijklmnop"),
            ("PROBE_TIMEOUT_SECS", "soon"),
        ]);
        assert_matches!(result, Err(AgentError::Config(msg)) if msg.contains("PROBE_TIMEOUT_SECS"));
    }
}
