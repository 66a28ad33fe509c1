//! `smsgate` -- SMS gateway daemon.
//!
//! # Environment variables
//!
//! Every setting can be overridden with `SMSGATE_<SECTION>__<KEY>`. The common ones:
//!
//! | Variable                                  | Default   | Description                         |
//! |-------------------------------------------|-----------|-------------------------------------|
//! | `SMSGATE_SERVER__PORT`                    | `5643`    | HTTP listen port                    |
//! | `SMSGATE_SECURITY__API_KEY`               | --        | Required `Authorization` header     |
//! | `SMSGATE_RATE_LIMIT__REQUESTS_PER_SECOND` | `1`       | Per-client refill rate              |
//! | `SMSGATE_RATE_LIMIT__BURST_SIZE`          | `5`       | Per-client burst                    |
//! | `SMSGATE_QUEUE__MAX_QUEUE_SIZE`           | `100`     | Pending SMS before 503              |
//! | `SMSGATE_PROVIDERS__SELECTED`             | see below | `hardware` or `twilio`              |
//! | `SMSGATE_PROVIDERS__MODEM__DEVICE_PATH`   | --        | Serial device of the modem          |
//! | `SMSGATE_PROVIDERS__TWILIO__ACCOUNT_SID`  | --        | Twilio account                      |
//! | `SMSGATE_SMTP__HOST`                      | --        | SMTP relay, enables `/send-email`   |
//! | `SMSGATE_SMTP__USERNAME`                  | --        | SMTP login and default sender       |
//!
//! Twilio also needs `..._TWILIO__AUTH_TOKEN` and `..._TWILIO__FROM_NUMBER`; SMTP takes
//! `..._SMTP__PORT` (587), `..._SMTP__PASSWORD` and `..._SMTP__FROM`.
//!
//! Without an explicit selection Twilio is used when configured, otherwise the modem.
//! A `settings.env` file in the working directory is loaded first if present.

use smsgate::config::AppConfig;
use smsgate::provider::ProviderRouter;
use smsgate::server::{self, AppState};
use smsgate::telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::from_filename("settings.env").ok();

    let config = AppConfig::load()?;
    telemetry::init_tracing(&config.logging);

    if config.security.api_key.is_none() {
        tracing::warn!("no API key configured, /send-sms accepts unauthenticated requests");
    }

    let router = ProviderRouter::from_config(&config.providers)?;
    let state = AppState::from_config(&config, router)?;
    state.queue.start()?;

    tracing::info!(
        port = config.server.port,
        queue_capacity = state.queue.capacity(),
        "starting smsgate"
    );

    let served = server::serve(&config, state.clone(), shutdown_signal()).await;

    match tokio::time::timeout(config.server.shutdown_timeout(), state.queue.stop()).await {
        Ok(Ok(discarded)) => tracing::info!(discarded, "shutdown complete"),
        Ok(Err(e)) => tracing::error!(error = %e, "dispatch queue did not stop cleanly"),
        Err(_) => tracing::error!("timed out waiting for the in-flight SMS, exiting anyway"),
    }

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
