use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode, header};
use axum::Router;
use smsgate::prelude::*;
use smsgate::server;
use tokio::sync::mpsc;
use tower::ServiceExt;

/// Sender that records what it was asked to deliver.
struct RecordingClient {
    log: Arc<Mutex<Vec<(String, String)>>>,
    delivered: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl SmsClient for RecordingClient {
    async fn send(&self, req: SendRequest<'_>) -> Result<SendResponse, SmsError> {
        self.log
            .lock()
            .unwrap()
            .push((req.to.to_string(), req.text.to_string()));
        let _ = self.delivered.send(());
        Ok(SendResponse {
            id: fallback_id(),
            provider: "recording",
            status: Some("sent".into()),
            raw: serde_json::Value::Null,
        })
    }
}

/// Mail sender that records accepted emails or fails every send.
struct RecordingMailer {
    sent: Arc<Mutex<Vec<(String, String, String)>>>,
    fail: bool,
}

#[async_trait]
impl MailSender for RecordingMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        if self.fail {
            return Err(MailError::Build("relay refused".into()));
        }
        self.sent.lock().unwrap().push((
            email.to().to_string(),
            email.subject().to_string(),
            email.body().to_string(),
        ));
        Ok(())
    }
}

fn with_mailer(h: Harness, mailer: RecordingMailer) -> Router {
    let state = h.state.with_mailer(Arc::new(mailer));
    server::router(state, 64 * 1024)
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
}

struct Harness {
    app: Router,
    state: AppState,
    log: Arc<Mutex<Vec<(String, String)>>>,
    delivered: mpsc::UnboundedReceiver<()>,
}

fn harness(api_key: Option<&str>, capacity: usize, rate_limit: RateLimitConfig) -> Harness {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (tx, delivered) = mpsc::unbounded_channel();
    let client = RecordingClient {
        log: log.clone(),
        delivered: tx,
    };
    let router =
        ProviderRouter::new(ProviderKind::Hardware).with(ProviderKind::Hardware, Arc::new(client));
    let state = AppState::new(
        Arc::new(DispatchQueue::new(capacity, Arc::new(router))),
        Arc::new(RateLimiter::new(rate_limit)),
        api_key.map(str::to_string),
    );
    let app = server::router(state.clone(), 64 * 1024)
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

    Harness {
        app,
        state,
        log,
        delivered,
    }
}

fn unlimited() -> RateLimitConfig {
    RateLimitConfig {
        enabled: false,
        ..RateLimitConfig::default()
    }
}

fn send_sms(api_key: Option<&str>, body: &str) -> Request<Body> {
    form_post("/send-sms", api_key, body)
}

fn send_email(api_key: Option<&str>, body: &str) -> Request<Body> {
    form_post("/send-email", api_key, body)
}

fn form_post(uri: &str, api_key: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(key) = api_key {
        builder = builder.header(header::AUTHORIZATION, key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn ping_answers_pong() {
    let h = harness(None, 4, unlimited());
    let resp = h
        .app
        .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "pong\n");
}

#[tokio::test]
async fn accepted_sms_is_delivered_by_worker() {
    let mut h = harness(Some("secret"), 4, unlimited());
    h.state.queue.start().unwrap();

    let resp = h
        .app
        .clone()
        .oneshot(send_sms(Some("secret"), "phone=%2B1234567890&message=Hello+there"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert_eq!(body_text(resp).await, "SMS queued successfully\n");

    h.delivered.recv().await.unwrap();
    assert_eq!(
        h.log.lock().unwrap().as_slice(),
        &[("+1234567890".to_string(), "Hello there".to_string())]
    );
    h.state.queue.stop().await.unwrap();
}

#[tokio::test]
async fn wrong_api_key_is_unauthorized() {
    let h = harness(Some("secret"), 4, unlimited());

    let resp = h
        .app
        .clone()
        .oneshot(send_sms(Some("guess"), "phone=%2B1234567890&message=Hi"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = h
        .app
        .oneshot(send_sms(None, "phone=%2B1234567890&message=Hi"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(h.state.queue.is_empty());
}

#[tokio::test]
async fn api_key_is_checked_before_the_body_is_read() {
    let h = harness(Some("secret"), 4, unlimited());

    let req = Request::builder()
        .method("POST")
        .uri("/send-sms")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("not a form"))
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // With the right key the same request reaches the form extractor.
    let req = Request::builder()
        .method("POST")
        .uri("/send-sms")
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::AUTHORIZATION, "secret")
        .body(Body::from("not a form"))
        .unwrap();
    let resp = h.app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn email_is_relayed_synchronously() {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let h = harness(Some("secret"), 4, unlimited());
    let app = with_mailer(
        h,
        RecordingMailer {
            sent: sent.clone(),
            fail: false,
        },
    );

    let resp = app
        .oneshot(send_email(
            Some("secret"),
            "to=ops%40example.com&subject=Disk+full&body=Volume+at+98%25",
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "Email sent successfully\n");
    assert_eq!(
        sent.lock().unwrap().as_slice(),
        &[(
            "ops@example.com".to_string(),
            "Disk full".to_string(),
            "Volume at 98%".to_string()
        )]
    );
}

#[tokio::test]
async fn email_requests_are_validated_and_authorized() {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let h = harness(Some("secret"), 4, unlimited());
    let app = with_mailer(
        h,
        RecordingMailer {
            sent: sent.clone(),
            fail: false,
        },
    );

    let resp = app
        .clone()
        .oneshot(send_email(None, "to=ops%40example.com&subject=Hi&body=Hi"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .clone()
        .oneshot(send_email(Some("secret"), "to=invalid-email&subject=Hi&body=Hi"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(resp).await, "invalid email address format\n");

    let resp = app
        .oneshot(send_email(Some("secret"), "to=ops%40example.com&subject=Hi"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(resp).await, "missing required email fields\n");

    assert!(sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn email_without_relay_or_with_failing_relay() {
    let h = harness(None, 4, unlimited());
    let resp = h
        .app
        .oneshot(send_email(None, "to=ops%40example.com&subject=Hi&body=Hi"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let h = harness(None, 4, unlimited());
    let app = with_mailer(
        h,
        RecordingMailer {
            sent: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        },
    );
    let resp = app
        .oneshot(send_email(None, "to=ops%40example.com&subject=Hi&body=Hi"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(resp).await, "failed to send email\n");
}

#[tokio::test]
async fn invalid_input_is_rejected_before_queueing() {
    let h = harness(None, 4, unlimited());

    let resp = h
        .app
        .clone()
        .oneshot(send_sms(None, "phone=INVALID&message=Hi"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(resp).await, "invalid phone number format\n");

    let resp = h
        .app
        .clone()
        .oneshot(send_sms(None, "phone=%2B1234567890&message=+++"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(resp).await, "message cannot be empty\n");

    let resp = h.app.oneshot(send_sms(None, "")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    assert!(h.state.queue.is_empty());
}

#[tokio::test]
async fn burst_exhaustion_returns_429_with_retry_after() {
    let h = harness(
        None,
        16,
        RateLimitConfig {
            enabled: true,
            requests_per_second: 0.5,
            burst_size: 2,
        },
    );

    for _ in 0..2 {
        let resp = h
            .app
            .clone()
            .oneshot(send_sms(None, "phone=%2B1234567890&message=Hi"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    let resp = h
        .app
        .clone()
        .oneshot(send_sms(None, "phone=%2B1234567890&message=Hi"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = resp.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=2).contains(&retry_after));

    // The limiter runs ahead of authentication and validation.
    let resp = h.app.clone().oneshot(send_sms(None, "")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    // Health checks are never throttled.
    let resp = h
        .app
        .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(h.state.queue.len(), 2);
}

#[tokio::test]
async fn full_queue_returns_503() {
    // Worker not started, so nothing drains the single slot.
    let h = harness(None, 1, unlimited());

    let resp = h
        .app
        .clone()
        .oneshot(send_sms(None, "phone=%2B1234567890&message=first"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let resp = h
        .app
        .oneshot(send_sms(None, "phone=%2B1234567890&message=second"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(h.state.queue.len(), 1);
}

#[tokio::test]
async fn concurrent_requests_are_each_delivered_once() {
    let mut h = harness(None, 64, unlimited());

    let requests = (0..20).map(|i| {
        let app = h.app.clone();
        async move {
            app.oneshot(send_sms(None, &format!("phone=%2B1234567890&message=msg+{i}")))
                .await
                .unwrap()
                .status()
        }
    });
    let statuses = futures::future::join_all(requests).await;
    assert!(statuses.iter().all(|s| *s == StatusCode::ACCEPTED));

    // Completion order of concurrent requests is unspecified; each accepted job is
    // delivered exactly once.
    h.state.queue.start().unwrap();
    for _ in 0..20 {
        h.delivered.recv().await.unwrap();
    }
    h.state.queue.stop().await.unwrap();
    let accepted: Vec<String> = h.log.lock().unwrap().iter().map(|(_, t)| t.clone()).collect();

    assert_eq!(accepted.len(), 20);
    let mut sorted = accepted.clone();
    sorted.sort();
    let mut expected: Vec<String> = (0..20).map(|i| format!("msg {i}")).collect();
    expected.sort();
    assert_eq!(sorted, expected);
}

#[tokio::test]
async fn sequential_requests_are_delivered_fifo() {
    let mut h = harness(None, 16, unlimited());
    h.state.queue.start().unwrap();

    for i in 0..5 {
        let resp = h
            .app
            .clone()
            .oneshot(send_sms(None, &format!("phone=%2B1234567890&message=msg+{i}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
    for _ in 0..5 {
        h.delivered.recv().await.unwrap();
    }
    h.state.queue.stop().await.unwrap();

    let texts: Vec<String> = h.log.lock().unwrap().iter().map(|(_, t)| t.clone()).collect();
    let expected: Vec<String> = (0..5).map(|i| format!("msg {i}")).collect();
    assert_eq!(texts, expected);
}
