//! # smsgate
//!
//! An HTTP gateway that accepts outbound SMS requests, throttles them per client and
//! delivers them asynchronously through a serial GSM modem or Twilio.
//!
//! ## Features
//!
//! - **Admission control**: continuous token bucket per client address
//! - **Asynchronous dispatch**: bounded FIFO queue drained by a single worker, so the modem
//!   never sees two exchanges at once
//! - **Pluggable delivery**: hardware modem (AT commands over serial) or Twilio, chosen at startup
//! - **Email relay**: `/send-email` hands plain-text mail to an SMTP server behind the same gates
//! - **Layered configuration**: defaults, config files and `SMSGATE_*` environment variables
//! - **Structured logging**: `tracing` with JSON or pretty output, recipients masked
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use smsgate::prelude::*;
//! use std::sync::Arc;
//!
//! let router = ProviderRouter::new(ProviderKind::Cloud)
//!     .with(ProviderKind::Cloud, Arc::new(TwilioClient::new("AC...", "token", "+15550001111")));
//! let queue = DispatchQueue::new(100, Arc::new(router));
//! queue.start()?;
//! queue.enqueue(SmsJob::validated("+1234567890", "Hello")?)?;
//! queue.stop().await?;
//! ```
//!
//! ## Configuration
//!
//! ```rust,ignore
//! use smsgate::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Queue holds {} jobs", config.queue.max_queue_size);
//! ```

pub mod config;
pub mod mail;
pub mod provider;
pub mod queue;
pub mod rate_limiter;
pub mod server;
pub mod telemetry;

pub use crate::config::AppConfig;

/// Common imports for smsgate usage
pub mod prelude {
    pub use crate::config::{
        AppConfig, LoggingConfig, ProvidersConfig, QueueConfig, RateLimitConfig, SecurityConfig,
        ServerConfig, SmtpConfig,
    };
    pub use crate::mail::{Email, MailError, MailSender, MailValidationError, SmtpMailer};
    pub use crate::provider::{DispatchError, Provider, ProviderKind, ProviderRouter};
    pub use crate::queue::{DispatchQueue, QueueError, QueueFull, QueueStatus};
    pub use crate::rate_limiter::{RateLimitResult, RateLimiter};
    pub use crate::server::AppState;
    pub use sms_core::*;
    pub use sms_modem::ModemClient;
    pub use sms_twilio::TwilioClient;
}
