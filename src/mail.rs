//! Outbound email through an SMTP relay.
//!
//! Unlike SMS, email is sent while the request waits: the handler reports the relay's
//! verdict directly to the caller.

use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::config::SmtpConfig;

/// Reasons an email request is refused before any SMTP traffic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailValidationError {
    #[error("missing required email fields")]
    MissingFields,
    #[error("invalid email address format")]
    InvalidAddress,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("email build error: {0}")]
    Build(String),
}

/// A validated plain-text email.
#[derive(Debug, Clone)]
pub struct Email {
    to: Address,
    subject: String,
    body: String,
}

impl Email {
    /// All three fields must be non-blank and `to` must be a `local@domain.tld` address.
    pub fn validated(
        to: &str,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self, MailValidationError> {
        let subject = subject.into();
        let body = body.into();
        if to.trim().is_empty() || subject.trim().is_empty() || body.trim().is_empty() {
            return Err(MailValidationError::MissingFields);
        }

        let to: Address = to
            .trim()
            .parse()
            .map_err(|_| MailValidationError::InvalidAddress)?;
        if !to.domain().contains('.') {
            return Err(MailValidationError::InvalidAddress);
        }

        Ok(Self { to, subject, body })
    }

    pub fn to(&self) -> &Address {
        &self.to
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), MailError>;
}

/// Mail sender backed by a STARTTLS SMTP relay.
pub struct SmtpMailer {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    /// Build the transport. No connection is made until the first send.
    pub fn from_config(config: &SmtpConfig) -> Result<Self, MailError> {
        let sender = config
            .from
            .as_deref()
            .or(config.username.as_deref())
            .ok_or_else(|| MailError::Build("no sender address configured".into()))?;
        let from: Mailbox = sender.parse()?;

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?.port(config.port);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            from,
            transport: builder.build(),
        })
    }

    pub fn from_address(&self) -> &Mailbox {
        &self.from
    }

    fn message(&self, email: &Email) -> Result<Message, MailError> {
        Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(None, email.to.clone()))
            .subject(email.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(email.body.clone())
            .map_err(|e| MailError::Build(e.to_string()))
    }
}

#[async_trait]
impl MailSender for SmtpMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let message = self.message(email)?;
        self.transport.send(message).await?;
        info!(to = %email.to, subject = %email.subject, "email sent");
        Ok(())
    }
}
