use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Form, Router,
    extract::{ConnectInfo, DefaultBodyLimit, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use sms_core::{SmsJob, ValidationError, mask_phone};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::mail::{Email, MailError, MailSender, MailValidationError, SmtpMailer};
use crate::provider::ProviderRouter;
use crate::queue::DispatchQueue;
use crate::rate_limiter::{RateLimitResult, RateLimiter};

/// Everything the HTTP handlers share. Built once at startup and cloned into each request.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<DispatchQueue>,
    pub limiter: Arc<RateLimiter>,
    pub api_key: Option<Arc<str>>,
    pub mailer: Option<Arc<dyn MailSender>>,
}

impl AppState {
    pub fn new(
        queue: Arc<DispatchQueue>,
        limiter: Arc<RateLimiter>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            queue,
            limiter,
            api_key: api_key.map(Arc::from),
            mailer: None,
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn MailSender>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Wire a stopped queue, a limiter and, when an SMTP relay is configured, a mailer.
    pub fn from_config(config: &AppConfig, router: ProviderRouter) -> Result<Self, MailError> {
        let queue = DispatchQueue::new(config.queue.max_queue_size, Arc::new(router))
            .with_send_timeout(config.queue.send_timeout());
        let limiter = RateLimiter::new(config.rate_limit.clone());
        let state = Self::new(
            Arc::new(queue),
            Arc::new(limiter),
            config.security.api_key.clone(),
        );

        match &config.smtp {
            Some(smtp) => {
                let mailer = SmtpMailer::from_config(smtp)?;
                info!(relay = %smtp.host, port = smtp.port, "email delivery enabled");
                Ok(state.with_mailer(Arc::new(mailer)))
            }
            None => Ok(state),
        }
    }

    /// Without a configured key every request is accepted.
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.api_key else {
            return true;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == &**expected)
    }
}

/// Errors surfaced to HTTP clients.
#[derive(Debug)]
pub enum ApiError {
    RateLimited { retry_after: Duration },
    Unauthorized,
    Validation(ValidationError),
    QueueFull,
    InvalidEmail(MailValidationError),
    EmailUnavailable,
    EmailFailed,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RateLimited { retry_after } => {
                // Retry-After carries whole seconds; never advertise zero.
                let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, secs.to_string())],
                    "Too Many Requests\n",
                )
                    .into_response()
            }
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized\n").into_response(),
            ApiError::Validation(e) => {
                (StatusCode::BAD_REQUEST, format!("{}\n", e)).into_response()
            }
            ApiError::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SMS queue is full, try again later\n",
            )
                .into_response(),
            ApiError::InvalidEmail(e) => {
                (StatusCode::BAD_REQUEST, format!("{}\n", e)).into_response()
            }
            ApiError::EmailUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "email delivery is not configured\n",
            )
                .into_response(),
            ApiError::EmailFailed => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to send email\n",
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendSmsForm {
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct SendEmailForm {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

pub fn router(state: AppState, max_body_size: usize) -> Router {
    // Layers run outermost first: admission, then the API key, then body extraction.
    let limited = Router::new()
        .route("/send-sms", post(send_sms))
        .route("/send-email", post(send_email))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/ping", get(ping))
        .merge(limited)
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(state)
}

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn serve(
    config: &AppConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "server listening");

    let app = router(state, config.security.max_body_size);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn ping() -> &'static str {
    "pong\n"
}

async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    match state.limiter.check(&peer.ip().to_string()) {
        RateLimitResult::Allowed => next.run(req).await,
        RateLimitResult::Limited { retry_after } => {
            ApiError::RateLimited { retry_after }.into_response()
        }
    }
}

async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.authorized(req.headers()) {
        warn!(path = %req.uri().path(), "rejected request with bad API key");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(req).await)
}

async fn send_sms(
    State(state): State<AppState>,
    Form(form): Form<SendSmsForm>,
) -> Result<impl IntoResponse, ApiError> {
    let job = SmsJob::validated(form.phone, form.message).map_err(ApiError::Validation)?;
    let to = mask_phone(job.recipient());

    state.queue.enqueue(job).map_err(|_| ApiError::QueueFull)?;
    info!(to = %to, "SMS accepted");

    Ok((StatusCode::ACCEPTED, "SMS queued successfully\n"))
}

async fn send_email(
    State(state): State<AppState>,
    Form(form): Form<SendEmailForm>,
) -> Result<impl IntoResponse, ApiError> {
    let email =
        Email::validated(&form.to, form.subject, form.body).map_err(ApiError::InvalidEmail)?;
    let mailer = state.mailer.as_ref().ok_or(ApiError::EmailUnavailable)?;

    mailer.send(&email).await.map_err(|e| {
        error!(to = %email.to(), error = %e, "failed to send email");
        ApiError::EmailFailed
    })?;

    Ok((StatusCode::OK, "Email sent successfully\n"))
}
