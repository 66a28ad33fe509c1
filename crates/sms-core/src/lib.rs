//! # SMS Core
//!
//! Core traits and types shared by the smsgate dispatch pipeline.
//!
//! This crate provides the fundamental building blocks for outbound SMS:
//! - [`SmsJob`], the unit of work accepted by the gateway and queued for delivery
//! - [`SmsClient`] trait implemented by every delivery backend
//! - Recipient and body validation applied before a job is accepted
//!
//! ## Example
//!
//! ```rust,ignore
//! use sms_core::{SendRequest, SmsClient};
//!
//! // Any delivery backend implements SmsClient
//! let response = client.send(SendRequest {
//!     to: "+1234567890",
//!     text: "Hello world!"
//! }).await?;
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Errors that can occur during SMS operations
#[derive(Debug, thiserror::Error)]
pub enum SmsError {
    /// HTTP communication error
    #[error("http error: {0}")]
    Http(String),
    /// Authentication/authorization error
    #[error("authentication error: {0}")]
    Auth(String),
    /// Invalid request parameters
    #[error("invalid request: {0}")]
    Invalid(String),
    /// SMS provider returned an error
    #[error("provider error: {0}")]
    Provider(String),
    /// Transport to the provider failed (serial device, socket)
    #[error("transport error: {0}")]
    Transport(String),
}

/// Reasons a job is refused before it ever reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid phone number format")]
    InvalidRecipient,
    #[error("message cannot be empty")]
    EmptyMessage,
}

/// A single queued delivery request.
///
/// Jobs are immutable once built; the queue owns them until the worker claims one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsJob {
    recipient: String,
    message: String,
    accepted_at: OffsetDateTime,
}

impl SmsJob {
    /// Build a job without validation. Callers facing untrusted input use [`SmsJob::validated`].
    pub fn new(recipient: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            message: message.into(),
            accepted_at: OffsetDateTime::now_utc(),
        }
    }

    /// Build a job after checking the recipient format and that the body is not blank.
    pub fn validated(
        recipient: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let recipient = recipient.into();
        let message = message.into();
        if !validate_phone(&recipient) {
            return Err(ValidationError::InvalidRecipient);
        }
        if message.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        Ok(Self::new(recipient, message))
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn accepted_at(&self) -> OffsetDateTime {
        self.accepted_at
    }

    pub fn as_request(&self) -> SendRequest<'_> {
        SendRequest {
            to: &self.recipient,
            text: &self.message,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SendRequest<'a> {
    pub to: &'a str,
    pub text: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub id: String,
    /// Name of the backend/provider that produced the response, e.g. "twilio".
    pub provider: &'static str,
    /// Delivery status reported by the provider, when it reports one.
    pub status: Option<String>,
    /// Raw provider payload for debugging / audit.
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait SmsClient: Send + Sync {
    /// Send a single text SMS. Exactly one delivery attempt is made per call.
    async fn send(&self, req: SendRequest<'_>) -> Result<SendResponse, SmsError>;
}

/// Utility to create a pseudo id if a provider doesn't return one.
pub fn fallback_id() -> String {
    Uuid::new_v4().to_string()
}

/// Checks the E.164-ish shape the gateway accepts: 10 to 15 characters with a leading `+`.
pub fn validate_phone(phone: &str) -> bool {
    (10..=15).contains(&phone.len()) && phone.starts_with('+')
}

/// Obfuscates a phone number for logging, keeping the last four characters.
pub fn mask_phone(phone: &str) -> String {
    let count = phone.chars().count();
    if count > 4 {
        let tail: String = phone.chars().skip(count - 4).collect();
        format!("{}{}", "*".repeat(count - 4), tail)
    } else {
        "****".to_string()
    }
}
