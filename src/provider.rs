//! Routing of queued jobs to the configured delivery backend.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use config::ConfigError;
use sms_core::{SendResponse, SmsClient, SmsError, SmsJob};
use sms_modem::ModemClient;
use sms_twilio::TwilioClient;
use tracing::{error, info, warn};

use crate::config::ProvidersConfig;

/// Delivery backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Serial-attached GSM modem.
    Hardware,
    /// Cloud messaging API (Twilio).
    Cloud,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Hardware => "hardware",
            ProviderKind::Cloud => "cloud",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown SMS provider {0:?}, expected \"hardware\" or \"twilio\"")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hardware" | "modem" => Ok(ProviderKind::Hardware),
            "cloud" | "twilio" => Ok(ProviderKind::Cloud),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

/// A provider that is known to have a sender behind it.
#[derive(Clone)]
pub enum Provider {
    Hardware(Arc<dyn SmsClient>),
    Cloud(Arc<dyn SmsClient>),
}

impl Provider {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Hardware(_) => ProviderKind::Hardware,
            Provider::Cloud(_) => ProviderKind::Cloud,
        }
    }

    pub fn client(&self) -> &Arc<dyn SmsClient> {
        match self {
            Provider::Hardware(client) | Provider::Cloud(client) => client,
        }
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Provider").field(&self.kind()).finish()
    }
}

/// Errors raised while delivering a dequeued job. All of them are terminal for that job.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no sender configured for provider {0}")]
    NoProviderConfigured(ProviderKind),
    #[error(transparent)]
    Send(#[from] SmsError),
    #[error("send did not complete within {0:?}")]
    Timeout(std::time::Duration),
}

/// Holds the registered senders and the provider jobs are routed to.
///
/// Selection is fixed before the queue starts; the router never falls back from one
/// provider to another.
#[derive(Clone)]
pub struct ProviderRouter {
    senders: HashMap<ProviderKind, Arc<dyn SmsClient>>,
    selected: ProviderKind,
}

impl ProviderRouter {
    pub fn new(selected: ProviderKind) -> Self {
        Self {
            senders: HashMap::new(),
            selected,
        }
    }

    /// Builder-style [`ProviderRouter::register`].
    pub fn with(mut self, kind: ProviderKind, client: Arc<dyn SmsClient>) -> Self {
        self.register(kind, client);
        self
    }

    pub fn register(&mut self, kind: ProviderKind, client: Arc<dyn SmsClient>) {
        self.senders.insert(kind, client);
    }

    pub fn select(&mut self, kind: ProviderKind) {
        self.selected = kind;
    }

    pub fn selected(&self) -> ProviderKind {
        self.selected
    }

    /// The selected provider, if a sender is registered for it.
    pub fn provider(&self) -> Option<Provider> {
        let client = self.senders.get(&self.selected)?.clone();
        Some(match self.selected {
            ProviderKind::Hardware => Provider::Hardware(client),
            ProviderKind::Cloud => Provider::Cloud(client),
        })
    }

    /// Make exactly one delivery attempt through the selected provider.
    pub async fn send(&self, job: &SmsJob) -> Result<SendResponse, DispatchError> {
        let provider = self
            .provider()
            .ok_or(DispatchError::NoProviderConfigured(self.selected))?;
        Ok(provider.client().send(job.as_request()).await?)
    }
}

impl ProviderRouter {
    /// Register every configured backend and select the configured provider.
    ///
    /// A modem that cannot be opened is logged and left unregistered, so jobs routed to it
    /// are dropped as unconfigured rather than aborting startup.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self, ConfigError> {
        let mut router = ProviderRouter::new(config.selected_kind()?);

        if let Some(modem) = &config.modem {
            match ModemClient::open(&modem.device_path, modem.baud_rate) {
                Ok(client) => {
                    router.register(
                        ProviderKind::Hardware,
                        Arc::new(client.with_timing(modem.timing())),
                    );
                }
                Err(e) => error!(error = %e, "modem unavailable, hardware provider disabled"),
            }
        }

        if let Some(twilio) = &config.twilio {
            let client = match &twilio.base_url {
                Some(base_url) => TwilioClient::with_base_url(
                    twilio.account_sid.as_str(),
                    twilio.auth_token.as_str(),
                    twilio.from_number.as_str(),
                    base_url.clone(),
                ),
                None => TwilioClient::new(
                    twilio.account_sid.as_str(),
                    twilio.auth_token.as_str(),
                    twilio.from_number.as_str(),
                ),
            };
            router.register(ProviderKind::Cloud, Arc::new(client));
        }

        match router.provider() {
            Some(provider) => info!(provider = %provider.kind(), "SMS provider selected"),
            None => warn!(
                provider = %router.selected(),
                "selected SMS provider has no sender, queued SMS will be dropped"
            ),
        }

        Ok(router)
    }
}

impl fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("selected", &self.selected)
            .field("registered", &self.senders.keys().collect::<Vec<_>>())
            .finish()
    }
}
