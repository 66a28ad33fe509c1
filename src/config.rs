use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::provider::ProviderKind;

/// One request per day; slower rates are treated as misconfiguration.
const MIN_REQUESTS_PER_SECOND: f64 = 1.0 / 86_400.0;

/// Application configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Delivery providers configuration
    pub providers: ProvidersConfig,
    /// Security configuration
    pub security: SecurityConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Dispatch queue configuration
    pub queue: QueueConfig,
    /// Outbound email relay; `/send-email` answers 503 without it
    pub smtp: Option<SmtpConfig>,
}

/// Server configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 5643)
    pub port: u16,
    /// How long shutdown waits for the in-flight send, in seconds (default: 45)
    pub shutdown_timeout_seconds: u64,
}

/// Delivery providers configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider to dispatch through: "hardware" or "cloud"/"twilio".
    /// When unset, Twilio is used if configured, otherwise the modem.
    pub selected: Option<String>,
    /// Serial modem configuration
    pub modem: Option<ModemConfig>,
    /// Twilio configuration
    pub twilio: Option<TwilioConfig>,
}

/// Serial modem configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModemConfig {
    /// Path to the serial device, e.g. /dev/ttyUSB0
    pub device_path: String,
    /// Baud rate (default: 115200)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Wait after each AT command in milliseconds (default: 1000)
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Upper bound on the modem reply in seconds (default: 10)
    #[serde(default = "default_read_timeout_seconds")]
    pub read_timeout_seconds: u64,
}

/// Twilio provider configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TwilioConfig {
    /// Twilio Account SID
    pub account_sid: String,
    /// Twilio Auth Token
    pub auth_token: String,
    /// Sending phone number
    pub from_number: String,
    /// API base URL override
    pub base_url: Option<String>,
}

/// Security configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    /// Value clients must send in the Authorization header
    pub api_key: Option<String>,
    /// Maximum request body size in bytes (default: 64KB)
    pub max_body_size: usize,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: json or pretty (default: json)
    pub format: String,
}

/// Rate limiting configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting (default: true)
    pub enabled: bool,
    /// Sustained refill rate per client (default: 1)
    pub requests_per_second: f64,
    /// Burst size (default: 5)
    pub burst_size: u32,
}

/// Dispatch queue configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of pending jobs (default: 100)
    pub max_queue_size: usize,
    /// Upper bound on a single delivery attempt in seconds (default: 30)
    pub send_timeout_seconds: u64,
}

/// SMTP relay configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SmtpConfig {
    /// Relay host name
    pub host: String,
    /// Relay port, STARTTLS (default: 587)
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Login user; also the sender address unless `from` is set
    pub username: Option<String>,
    pub password: Option<String>,
    /// Sender address
    pub from: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_baud_rate() -> u32 {
    sms_modem::DEFAULT_BAUD_RATE
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_read_timeout_seconds() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5643,
            shutdown_timeout_seconds: 45,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            max_body_size: 64 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 1.0,
            burst_size: 5,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            send_timeout_seconds: 30,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

impl QueueConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_seconds)
    }
}

impl ModemConfig {
    pub fn timing(&self) -> sms_modem::Timing {
        sms_modem::Timing {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            read_timeout: Duration::from_secs(self.read_timeout_seconds),
        }
    }
}

impl ProvidersConfig {
    /// The provider jobs are dispatched through.
    pub fn selected_kind(&self) -> Result<ProviderKind, ConfigError> {
        match &self.selected {
            Some(name) => name
                .parse()
                .map_err(|e: crate::provider::UnknownProvider| ConfigError::Message(e.to_string())),
            None if self.twilio.is_some() => Ok(ProviderKind::Cloud),
            None => Ok(ProviderKind::Hardware),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with default configuration
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides (gitignored)
            .add_source(File::with_name("config/local").required(false))
            // Environment variables, e.g. SMSGATE_QUEUE__MAX_QUEUE_SIZE=500
            .add_source(
                Environment::with_prefix("SMSGATE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: AppConfig = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::Message(
                "queue.max_queue_size must be greater than zero".into(),
            ));
        }
        if self.rate_limit.burst_size == 0 {
            return Err(ConfigError::Message(
                "rate_limit.burst_size must be greater than zero".into(),
            ));
        }
        let rate = self.rate_limit.requests_per_second;
        if !(rate.is_finite() && rate >= MIN_REQUESTS_PER_SECOND) {
            return Err(ConfigError::Message(format!(
                "rate_limit.requests_per_second must be a finite number of at least {}",
                MIN_REQUESTS_PER_SECOND
            )));
        }
        if let Some(smtp) = &self.smtp {
            if smtp.username.is_none() && smtp.from.is_none() {
                return Err(ConfigError::Message(
                    "smtp needs a sender: set smtp.from or smtp.username".into(),
                ));
            }
        }
        self.providers.selected_kind()?;
        Ok(())
    }
}
