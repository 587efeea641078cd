//! Service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::{ExposeSecret, SecretBox, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind interface.
pub const DEFAULT_HTTP_INTERFACE: &str = "0.0.0.0";

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8070;

/// Default RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default cap on incoming bitrate per session (client -> server), bits/s.
pub const DEFAULT_MAX_BITRATE_IN: u32 = 8_000_000;

/// Default cap on outgoing bitrate per session (server -> client), bits/s.
pub const DEFAULT_MAX_BITRATE_OUT: u32 = 10_000_000;

/// Default cap advertised to clients for a single video producer, bits/s.
pub const DEFAULT_MAX_VIDEO_BITRATE: u32 = 4_000_000;

/// Default maximum number of sessions per channel.
pub const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Timer and deadline settings.
///
/// Every timer in the coordination layer comes from here so that tests can
/// shrink them without touching production defaults.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Connection deadline: a session must reach CONNECTED within this.
    pub session: Duration,
    /// Interval between server-issued PING requests.
    pub ping: Duration,
    /// Delay before retrying consumer creation against a peer.
    pub recovery: Duration,
    /// Idle-close deadline for channels with at most one session.
    pub channel: Duration,
    /// Deadline for the first (authentication) frame on a new link.
    pub authentication: Duration,
    /// Default bus request timeout.
    pub request: Duration,
    /// Trailing-edge batching window for outbound bus payloads.
    pub batch_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            session: Duration::from_secs(10),
            ping: Duration::from_secs(60),
            recovery: Duration::from_secs(2),
            channel: Duration::from_secs(3600),
            authentication: Duration::from_secs(10),
            request: Duration::from_secs(5),
            batch_delay: Duration::from_millis(300),
        }
    }
}

impl Timeouts {
    /// Short timers for tests (10ms batching window, sub-second deadlines).
    #[must_use]
    pub fn short() -> Self {
        Self {
            session: Duration::from_millis(500),
            ping: Duration::from_secs(60),
            recovery: Duration::from_millis(50),
            channel: Duration::from_secs(3600),
            authentication: Duration::from_millis(500),
            request: Duration::from_millis(500),
            batch_delay: Duration::from_millis(10),
        }
    }
}

/// Service configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Global token verification key (base64-encoded).
    /// Protected by `SecretString` to prevent accidental logging.
    pub auth_key: SecretString,

    /// Public IP announced to clients for media transport.
    pub public_ip: String,

    /// HTTP bind interface (default: "0.0.0.0").
    pub http_interface: String,

    /// HTTP port (default: 8070).
    pub port: u16,

    /// RTC bind interface (defaults to the HTTP interface).
    pub rtc_interface: Option<String>,

    /// RTC UDP+TCP port range.
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// Number of media workers (default: hardware parallelism).
    pub num_workers: Option<usize>,

    /// Enabled audio codec names (empty = all known).
    pub audio_codecs: Vec<String>,

    /// Enabled video codec names (empty = all known).
    pub video_codecs: Vec<String>,

    /// Socket buffer limits handed to the engine, bytes.
    pub max_buf_in: Option<u32>,
    pub max_buf_out: Option<u32>,

    /// Per-session bitrate caps, bits/s.
    pub max_bitrate_in: u32,
    pub max_bitrate_out: u32,

    /// Cap advertised to clients for a single video producer, bits/s.
    pub max_video_bitrate: u32,

    /// Maximum sessions per channel.
    pub channel_size: usize,

    /// Trust first-hop `x-forwarded-*` headers.
    pub proxy: bool,

    /// Timer settings.
    pub timeouts: Timeouts,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("auth_key", &"[REDACTED]")
            .field("public_ip", &self.public_ip)
            .field("http_interface", &self.http_interface)
            .field("port", &self.port)
            .field("rtc_interface", &self.rtc_interface)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("num_workers", &self.num_workers)
            .field("audio_codecs", &self.audio_codecs)
            .field("video_codecs", &self.video_codecs)
            .field("max_buf_in", &self.max_buf_in)
            .field("max_buf_out", &self.max_buf_out)
            .field("max_bitrate_in", &self.max_bitrate_in)
            .field("max_bitrate_out", &self.max_bitrate_out)
            .field("max_video_bitrate", &self.max_video_bitrate)
            .field("channel_size", &self.channel_size)
            .field("proxy", &self.proxy)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let auth_key = SecretString::from(
            vars.get("AUTH_KEY")
                .ok_or_else(|| ConfigError::MissingEnvVar("AUTH_KEY".to_string()))?
                .clone(),
        );

        let public_ip = vars
            .get("PUBLIC_IP")
            .ok_or_else(|| ConfigError::MissingEnvVar("PUBLIC_IP".to_string()))?
            .clone();

        let http_interface = vars
            .get("HTTP_INTERFACE")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HTTP_INTERFACE.to_string());

        let port = parse_opt(vars, "PORT")?.unwrap_or(DEFAULT_PORT);

        let rtc_interface = vars.get("RTC_INTERFACE").cloned();

        let rtc_min_port = parse_opt(vars, "RTC_MIN_PORT")?.unwrap_or(DEFAULT_RTC_MIN_PORT);
        let rtc_max_port = parse_opt(vars, "RTC_MAX_PORT")?.unwrap_or(DEFAULT_RTC_MAX_PORT);
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "RTC_MIN_PORT ({rtc_min_port}) exceeds RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let num_workers = parse_opt(vars, "NUM_WORKERS")?;

        let audio_codecs = parse_list(vars.get("AUDIO_CODECS"));
        let video_codecs = parse_list(vars.get("VIDEO_CODECS"));

        let max_buf_in = parse_opt(vars, "MAX_BUF_IN")?;
        let max_buf_out = parse_opt(vars, "MAX_BUF_OUT")?;

        let max_bitrate_in = parse_opt(vars, "MAX_BITRATE_IN")?.unwrap_or(DEFAULT_MAX_BITRATE_IN);
        let max_bitrate_out =
            parse_opt(vars, "MAX_BITRATE_OUT")?.unwrap_or(DEFAULT_MAX_BITRATE_OUT);
        let max_video_bitrate =
            parse_opt(vars, "MAX_VIDEO_BITRATE")?.unwrap_or(DEFAULT_MAX_VIDEO_BITRATE);

        let channel_size = parse_opt(vars, "CHANNEL_SIZE")?.unwrap_or(DEFAULT_CHANNEL_SIZE);

        let proxy = vars
            .get("PROXY")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Config {
            auth_key,
            public_ip,
            http_interface,
            port,
            rtc_interface,
            rtc_min_port,
            rtc_max_port,
            num_workers,
            audio_codecs,
            video_codecs,
            max_buf_in,
            max_buf_out,
            max_bitrate_in,
            max_bitrate_out,
            max_video_bitrate,
            channel_size,
            proxy,
            timeouts: Timeouts::default(),
        })
    }

    /// Decode the base64 `AUTH_KEY` into raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the key is not valid base64
    /// or decodes to an empty byte string.
    pub fn decoded_auth_key(&self) -> Result<SecretBox<Vec<u8>>, ConfigError> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let bytes = STANDARD
            .decode(self.auth_key.expose_secret())
            .map_err(|e| ConfigError::InvalidValue(format!("AUTH_KEY is not valid base64: {e}")))?;
        if bytes.is_empty() {
            return Err(ConfigError::InvalidValue(
                "AUTH_KEY decodes to an empty key".to_string(),
            ));
        }
        Ok(SecretBox::new(Box::new(bytes)))
    }
}

fn parse_opt<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match vars.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
    }
}

fn parse_list(raw: Option<&String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            // "test-auth-key-123456" in base64
            (
                "AUTH_KEY".to_string(),
                "dGVzdC1hdXRoLWtleS0xMjM0NTY=".to_string(),
            ),
            ("PUBLIC_IP".to_string(), "203.0.113.7".to_string()),
        ])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load");

        assert_eq!(config.public_ip, "203.0.113.7");
        assert_eq!(config.http_interface, DEFAULT_HTTP_INTERFACE);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.rtc_min_port, DEFAULT_RTC_MIN_PORT);
        assert_eq!(config.rtc_max_port, DEFAULT_RTC_MAX_PORT);
        assert_eq!(config.max_bitrate_in, DEFAULT_MAX_BITRATE_IN);
        assert_eq!(config.max_bitrate_out, DEFAULT_MAX_BITRATE_OUT);
        assert_eq!(config.max_video_bitrate, DEFAULT_MAX_VIDEO_BITRATE);
        assert_eq!(config.channel_size, DEFAULT_CHANNEL_SIZE);
        assert!(config.audio_codecs.is_empty());
        assert!(config.video_codecs.is_empty());
        assert!(!config.proxy);
    }

    #[test]
    fn test_from_vars_custom_values() {
        let mut vars = base_vars();
        vars.insert("PORT".to_string(), "9000".to_string());
        vars.insert("CHANNEL_SIZE".to_string(), "8".to_string());
        vars.insert("NUM_WORKERS".to_string(), "2".to_string());
        vars.insert("AUDIO_CODECS".to_string(), "opus".to_string());
        vars.insert("VIDEO_CODECS".to_string(), "VP8, H264".to_string());
        vars.insert("PROXY".to_string(), "true".to_string());

        let config = Config::from_vars(&vars).expect("Config should load");

        assert_eq!(config.port, 9000);
        assert_eq!(config.channel_size, 8);
        assert_eq!(config.num_workers, Some(2));
        assert_eq!(config.audio_codecs, vec!["opus"]);
        assert_eq!(config.video_codecs, vec!["vp8", "h264"]);
        assert!(config.proxy);
    }

    #[test]
    fn test_missing_auth_key() {
        let mut vars = base_vars();
        vars.remove("AUTH_KEY");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "AUTH_KEY"));
    }

    #[test]
    fn test_missing_public_ip() {
        let mut vars = base_vars();
        vars.remove("PUBLIC_IP");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "PUBLIC_IP"));
    }

    #[test]
    fn test_invalid_port() {
        let mut vars = base_vars();
        vars.insert("PORT".to_string(), "not-a-port".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_inverted_rtc_range() {
        let mut vars = base_vars();
        vars.insert("RTC_MIN_PORT".to_string(), "50000".to_string());
        vars.insert("RTC_MAX_PORT".to_string(), "40000".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_decoded_auth_key() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let key = config.decoded_auth_key().unwrap();
        assert_eq!(key.expose_secret().as_slice(), b"test-auth-key-123456");
    }

    #[test]
    fn test_decoded_auth_key_invalid_base64() {
        let mut vars = base_vars();
        vars.insert("AUTH_KEY".to_string(), "!!!not-base64!!!".to_string());
        let config = Config::from_vars(&vars).unwrap();

        assert!(matches!(
            config.decoded_auth_key(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_redacts_auth_key() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("dGVzdC1hdXRo"));
    }
}
