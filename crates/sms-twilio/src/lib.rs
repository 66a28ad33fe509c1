//! # Twilio SMS Provider
//!
//! Twilio Programmable Messaging provider for smsgate.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sms_core::{SendRequest, SmsClient};
//! use sms_twilio::TwilioClient;
//!
//! let client = TwilioClient::new("ACxxxxxxxx", "auth_token", "+15550001111");
//! let response = client.send(SendRequest {
//!     to: "+1234567890",
//!     text: "Hello from Twilio!"
//! }).await?;
//! ```

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use sms_core::{SendRequest, SendResponse, SmsClient, SmsError, mask_phone};
use tracing::{error, info};
use url::Url;

const PROVIDER: &str = "twilio";
const DEFAULT_BASE_URL: &str = "https://api.twilio.com";

/// Twilio REST client.
#[derive(Clone, Debug)]
pub struct TwilioClient {
    /// Twilio Account SID.
    pub account_sid: String,
    /// Twilio Auth Token (password for Basic auth).
    pub auth_token: String,
    /// Sending number, in E.164 form.
    pub from_number: String,
    /// API base URL; override for testing/mocking.
    pub base_url: String,
    http: reqwest::Client,
}

/// Successful `Messages.json` reply. Only the fields the gateway reports are mapped.
#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
    status: Option<String>,
}

/// Error body Twilio returns alongside non-2xx responses.
#[derive(Debug, Deserialize)]
struct TwilioApiError {
    code: Option<i64>,
    message: String,
}

impl TwilioClient {
    pub fn new<S: Into<String>>(account_sid: S, auth_token: S, from_number: S) -> Self {
        Self::with_base_url(
            account_sid,
            auth_token,
            from_number,
            DEFAULT_BASE_URL.to_string(),
        )
    }

    pub fn with_base_url<S: Into<String>>(
        account_sid: S,
        auth_token: S,
        from_number: S,
        base_url: String,
    ) -> Self {
        Self {
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from_number: from_number.into(),
            base_url,
            http: reqwest::Client::new(),
        }
    }

    fn messages_url(&self) -> Result<Url, SmsError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SmsError::Invalid(format!("base url {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| SmsError::Invalid(format!("base url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["2010-04-01", "Accounts", self.account_sid.as_str(), "Messages.json"]);
        Ok(url)
    }
}

fn map_error_status(status: StatusCode, body: &str) -> SmsError {
    let detail = match serde_json::from_str::<TwilioApiError>(body) {
        Ok(TwilioApiError {
            code: Some(code),
            message,
        }) => format!("HTTP {} (code {}): {}", status, code, message),
        Ok(TwilioApiError { message, .. }) => format!("HTTP {}: {}", status, message),
        Err(_) => format!("HTTP {}: {}", status, body),
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SmsError::Auth(detail),
        StatusCode::BAD_REQUEST => SmsError::Invalid(detail),
        _ => SmsError::Provider(detail),
    }
}

#[async_trait]
impl SmsClient for TwilioClient {
    async fn send(&self, req: SendRequest<'_>) -> Result<SendResponse, SmsError> {
        let url = self.messages_url()?;
        let form = [
            ("To", req.to),
            ("From", self.from_number.as_str()),
            ("Body", req.text),
        ];

        let res = self
            .http
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| SmsError::Http(e.to_string()))?;

        let status = res.status();
        let raw_text = res
            .text()
            .await
            .map_err(|e| SmsError::Http(e.to_string()))?;

        if !status.is_success() {
            let err = map_error_status(status, &raw_text);
            error!(to = %mask_phone(req.to), error = %err, "Twilio rejected message");
            return Err(err);
        }

        let message: TwilioMessage = serde_json::from_str(&raw_text)
            .map_err(|e| SmsError::Provider(format!("unexpected Twilio response: {}", e)))?;
        let raw_json: serde_json::Value = serde_json::from_str(&raw_text)
            .unwrap_or_else(|_| serde_json::json!({ "raw": raw_text }));

        info!(
            sid = %message.sid,
            status = message.status.as_deref().unwrap_or("unknown"),
            "Twilio SMS sent"
        );

        Ok(SendResponse {
            id: message.sid,
            provider: PROVIDER,
            status: message.status,
            raw: raw_json,
        })
    }
}
