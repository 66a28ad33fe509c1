//! # GSM Modem SMS Provider
//!
//! Sends SMS through a serial-attached modem speaking the text-mode AT command set.
//!
//! One send is a fixed exchange on the byte stream:
//!
//! 1. `AT+CMGF=1\r` switches the modem to text mode, followed by a settle delay
//! 2. `AT+CMGS="<recipient>"\r` opens the message, followed by a settle delay
//! 3. the body terminated by Ctrl-Z (`0x1A`)
//! 4. a single read of up to 1024 bytes, which must contain `OK`
//!
//! The modem gives no readiness prompt the driver waits on; the settle delays are a timing
//! heuristic. Recipient and body are written unescaped.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sms_core::{SendRequest, SmsClient};
//! use sms_modem::ModemClient;
//!
//! let modem = ModemClient::open("/dev/ttyUSB0", 115200)?;
//! modem.send(SendRequest { to: "+1234567890", text: "Hello" }).await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use sms_core::{SendRequest, SendResponse, SmsClient, SmsError, mask_phone};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

const PROVIDER: &str = "modem";

/// Ctrl-Z, the SMS-submit terminator.
pub const CTRL_Z: u8 = 0x1A;

/// Size of the single response read.
pub const RESPONSE_BUFFER_SIZE: usize = 1024;

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Protocol step, used to say which write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    TextMode,
    Recipient,
    Body,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Step::TextMode => "set text mode",
            Step::Recipient => "send phone number",
            Step::Body => "send message",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModemError {
    #[error("failed to {step}: {source}")]
    Write {
        step: Step,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read modem response: {0}")]
    Read(#[source] std::io::Error),
    #[error("no modem response within {0:?}")]
    Timeout(Duration),
    /// The modem answered without `OK`; the raw reply is kept for diagnostics.
    #[error("failed to send SMS, modem response: {response}")]
    Rejected { response: String },
    #[error("message body contains Ctrl-Z (0x1A)")]
    InvalidPayload,
    #[error("failed to open serial device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },
}

impl From<ModemError> for SmsError {
    fn from(e: ModemError) -> Self {
        match e {
            ModemError::Rejected { .. } => SmsError::Provider(e.to_string()),
            ModemError::InvalidPayload => SmsError::Invalid(e.to_string()),
            _ => SmsError::Transport(e.to_string()),
        }
    }
}

/// Timing of the AT exchange.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Wait after each command, in lieu of an acknowledgement.
    pub settle_delay: Duration,
    /// Upper bound on the final response read.
    pub read_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Run one complete text-mode send on `stream` and return the modem's raw reply.
///
/// The caller must hold exclusive access to the stream for the whole call.
pub async fn send_via_modem<S>(
    stream: &mut S,
    recipient: &str,
    body: &str,
    timing: Timing,
) -> Result<String, ModemError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if body.as_bytes().contains(&CTRL_Z) {
        return Err(ModemError::InvalidPayload);
    }

    write_step(stream, Step::TextMode, b"AT+CMGF=1\r").await?;
    tokio::time::sleep(timing.settle_delay).await;

    let cmd = format!("AT+CMGS=\"{}\"\r", recipient);
    write_step(stream, Step::Recipient, cmd.as_bytes()).await?;
    tokio::time::sleep(timing.settle_delay).await;

    let mut payload = Vec::with_capacity(body.len() + 1);
    payload.extend_from_slice(body.as_bytes());
    payload.push(CTRL_Z);
    write_step(stream, Step::Body, &payload).await?;

    // A reply split across several reads or longer than the buffer is not reassembled.
    let mut buf = [0u8; RESPONSE_BUFFER_SIZE];
    let n = tokio::time::timeout(timing.read_timeout, stream.read(&mut buf))
        .await
        .map_err(|_| ModemError::Timeout(timing.read_timeout))?
        .map_err(ModemError::Read)?;

    let response = String::from_utf8_lossy(&buf[..n]).into_owned();
    debug!(bytes = n, response = %response.trim(), "modem replied");

    if response.contains("OK") {
        Ok(response)
    } else {
        Err(ModemError::Rejected { response })
    }
}

async fn write_step<S>(stream: &mut S, step: Step, bytes: &[u8]) -> Result<(), ModemError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(bytes)
        .await
        .map_err(|source| ModemError::Write { step, source })?;
    stream
        .flush()
        .await
        .map_err(|source| ModemError::Write { step, source })
}

/// SMS client owning the modem's serial session.
///
/// The session lock is held across the whole AT exchange so two sends never interleave on
/// the stream.
pub struct ModemClient<S = SerialStream> {
    port: Mutex<S>,
    timing: Timing,
}

impl ModemClient<SerialStream> {
    /// Open the serial device at `path`.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, ModemError> {
        let stream = tokio_serial::new(path, baud_rate)
            .open_native_async()
            .map_err(|source| ModemError::Open {
                path: path.to_string(),
                source,
            })?;
        info!(device = path, baud_rate, "opened modem serial device");
        Ok(Self::new(stream))
    }
}

impl<S> ModemClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            port: Mutex::new(stream),
            timing: Timing::default(),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Give back the underlying stream.
    pub fn into_inner(self) -> S {
        self.port.into_inner()
    }
}

#[async_trait]
impl<S> SmsClient for ModemClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&self, req: SendRequest<'_>) -> Result<SendResponse, SmsError> {
        info!(to = %mask_phone(req.to), "sending SMS via modem");

        let mut port = self.port.lock().await;
        let response = send_via_modem(&mut *port, req.to, req.text, self.timing)
            .await
            .inspect_err(|e| warn!(to = %mask_phone(req.to), error = %e, "modem send failed"))?;
        drop(port);

        Ok(SendResponse {
            id: sms_core::fallback_id(),
            provider: PROVIDER,
            status: Some("sent".to_string()),
            raw: serde_json::json!({ "response": response }),
        })
    }
}
