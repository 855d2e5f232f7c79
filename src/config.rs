//! Konfiguration aus Umgebungsvariablen und Kommandozeile
//!
//! Aufruf: `relay-call [nickname] [relay-url]`. Positionsargumente haben
//! Vorrang vor den Umgebungsvariablen.

use crate::media::{AudioProfile, VideoProfile};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Standard-Relay für lokale Tests
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8080";

/// Maximale Nickname-Länge
pub const MAX_NICKNAME_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid relay URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid nickname '{0}': use 1-32 characters of A-Z, a-z, 0-9, '_', '.', '-'")]
    InvalidNickname(String),

    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub relay_url: String,
    pub nickname: String,
    pub channel: String,
    pub mode: String,
    pub port: u16,
    pub call_timeout: Duration,
    pub keepalive_interval: Duration,
    pub ring_interval: Duration,
    pub ffmpeg: String,
    pub player: String,
    /// `None` = Standardprogramm der Plattform
    pub viewer: Option<String>,
    pub frame_path: PathBuf,
    pub video: VideoProfile,
    pub audio: AudioProfile,
    pub serial_playback: bool,
    pub compression_level: i32,
}

impl Config {
    /// Liest die Konfiguration aus der Prozessumgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::from_lookup(|name| std::env::var(name).ok(), &args)
    }

    /// Baut die Konfiguration aus einer Variablen-Quelle und Argumenten
    pub fn from_lookup<F>(lookup: F, args: &[String]) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();

        let nickname = positional
            .first()
            .map(|s| s.to_string())
            .or_else(|| var("RELAY_CALL_NICKNAME"))
            .unwrap_or_else(default_nickname);

        let relay_url = positional
            .get(1)
            .map(|s| s.to_string())
            .or_else(|| var("RELAY_URL"))
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());

        let video = match var("RELAY_CALL_VIDEO") {
            Some(value) => VideoProfile::parse(&value).ok_or(ConfigError::InvalidValue {
                name: "RELAY_CALL_VIDEO",
                value,
            })?,
            None => VideoProfile::default(),
        };

        let audio = AudioProfile {
            sample_rate: parse_var(&var, "RELAY_CALL_SAMPLE_RATE", 16_000)?,
            chunk_ms: parse_var(&var, "RELAY_CALL_CHUNK_MS", 100)?,
            ..AudioProfile::default()
        };

        let config = Self {
            relay_url,
            nickname,
            channel: var("RELAY_CALL_CHANNEL").unwrap_or_else(|| "general".to_string()),
            mode: var("RELAY_CALL_MODE").unwrap_or_else(|| "voice".to_string()),
            port: parse_var(&var, "RELAY_CALL_PORT", 0)?,
            call_timeout: Duration::from_secs(parse_var(&var, "RELAY_CALL_TIMEOUT_SECS", 30)?),
            keepalive_interval: Duration::from_secs(parse_var(
                &var,
                "RELAY_CALL_KEEPALIVE_SECS",
                25,
            )?),
            ring_interval: Duration::from_secs(parse_var(&var, "RELAY_CALL_RING_SECS", 3)?),
            ffmpeg: var("RELAY_CALL_FFMPEG").unwrap_or_else(|| "ffmpeg".to_string()),
            player: var("RELAY_CALL_PLAYER").unwrap_or_else(|| "ffplay".to_string()),
            viewer: var("RELAY_CALL_VIEWER"),
            frame_path: var("RELAY_CALL_FRAME_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_frame_path),
            video,
            audio,
            serial_playback: parse_var(&var, "RELAY_CALL_SERIAL_PLAYBACK", false)?,
            compression_level: parse_var(
                &var,
                "RELAY_CALL_COMPRESSION_LEVEL",
                crate::codec::DEFAULT_LEVEL,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Prüft URL, Nickname und Zeitwerte
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.relay_url).map_err(|e| ConfigError::InvalidUrl {
            url: self.relay_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl {
                url: self.relay_url.clone(),
                reason: format!("unsupported scheme '{}', expected ws or wss", url.scheme()),
            });
        }

        if !is_valid_nickname(&self.nickname) {
            return Err(ConfigError::InvalidNickname(self.nickname.clone()));
        }

        for (name, value) in [
            ("call timeout", self.call_timeout),
            ("keepalive interval", self.keepalive_interval),
            ("ring interval", self.ring_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        if self.audio.sample_rate == 0 || self.audio.chunk_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "audio profile",
                value: format!("{} Hz / {} ms", self.audio.sample_rate, self.audio.chunk_ms),
            });
        }
        Ok(())
    }
}

fn parse_var<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}

/// Erlaubt sind 1-32 Zeichen aus `[A-Za-z0-9_.-]`
pub fn is_valid_nickname(nickname: &str) -> bool {
    !nickname.is_empty()
        && nickname.len() <= MAX_NICKNAME_LEN
        && nickname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Bereinigt einen Hostnamen zu einem gültigen Nickname
pub fn sanitize_nickname(raw: &str) -> String {
    let host = raw.trim().split('.').next().unwrap_or_default();
    let cleaned: String = host
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .take(MAX_NICKNAME_LEN)
        .collect();

    if cleaned.is_empty() {
        "peer".to_string()
    } else {
        cleaned
    }
}

fn default_nickname() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| {
            std::process::Command::new("hostname")
                .output()
                .ok()
                .map(|out| String::from_utf8_lossy(&out.stdout).to_string())
        })
        .unwrap_or_default();
    sanitize_nickname(&host)
}

fn default_frame_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "relay-call")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(std::env::temp_dir)
        .join("latest_frame.jpg")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)], args: &[&str]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        Config::from_lookup(|name| vars.get(name).cloned(), &args)
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("RELAY_CALL_NICKNAME", "M3Pro")], &[]).unwrap();
        assert_eq!(cfg.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(cfg.channel, "general");
        assert_eq!(cfg.call_timeout, Duration::from_secs(30));
        assert_eq!(cfg.video, VideoProfile::default());
        assert_eq!(cfg.audio.chunk_bytes(), 3_200);
        assert!(!cfg.serial_playback);
        assert!(cfg.frame_path.ends_with("latest_frame.jpg"));
    }

    #[test]
    fn test_positional_args_override_env() {
        let cfg = config(
            &[("RELAY_CALL_NICKNAME", "envname"), ("RELAY_URL", "ws://a:1")],
            &["Alice", "wss://relay.example.org/ws"],
        )
        .unwrap();
        assert_eq!(cfg.nickname, "Alice");
        assert_eq!(cfg.relay_url, "wss://relay.example.org/ws");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            config(&[], &["Alice", "http://relay"]),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            config(&[], &["@group"]),
            Err(ConfigError::InvalidNickname(_))
        ));
        assert!(matches!(
            config(&[("RELAY_CALL_TIMEOUT_SECS", "0")], &["Alice"]),
            Err(ConfigError::ZeroDuration("call timeout"))
        ));
        assert!(matches!(
            config(&[("RELAY_CALL_PORT", "abc")], &["Alice"]),
            Err(ConfigError::InvalidValue { name: "RELAY_CALL_PORT", .. })
        ));
    }

    #[test]
    fn test_video_and_playback_options() {
        let cfg = config(
            &[
                ("RELAY_CALL_VIDEO", "640x480@15"),
                ("RELAY_CALL_SERIAL_PLAYBACK", "true"),
                ("RELAY_CALL_VIEWER", "feh"),
            ],
            &["Alice"],
        )
        .unwrap();
        assert_eq!(cfg.video.width, 640);
        assert_eq!(cfg.video.fps, 15);
        assert!(cfg.serial_playback);
        assert_eq!(cfg.viewer.as_deref(), Some("feh"));
    }

    #[test]
    fn test_nickname_helpers() {
        assert!(is_valid_nickname("M3Pro"));
        assert!(is_valid_nickname("a.b-c_d"));
        assert!(!is_valid_nickname(""));
        assert!(!is_valid_nickname("has space"));
        assert!(!is_valid_nickname(&"x".repeat(33)));

        assert_eq!(sanitize_nickname("m3pro.local\n"), "m3pro");
        assert_eq!(sanitize_nickname("  "), "peer");
    }
}
