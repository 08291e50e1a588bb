use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use mailgate::dlq::DeadLetterQueue;
use mailgate::publisher::TaskPublisher;
use mailgate::shutdown::ShutdownSignal;
use mailgate::store::SuppressionStore;
use mailgate::subscription::{self, SubscriptionError};
use mailgate::token;
use mailgate::{Envelope, MailgateConfig, SubscriptionService};

/// Default page size for the dead-letter listing
const DEAD_LETTER_PAGE: usize = 50;

#[derive(Clone)]
struct AppState {
    subscriptions: Arc<SubscriptionService>,
    store: Arc<dyn SuppressionStore>,
    publisher: Arc<dyn TaskPublisher>,
    /// Absent when the server is not backed by Redis streams
    dead_letters: Option<DeadLetterQueue>,
    api_key: String,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

#[derive(Debug, Deserialize)]
struct SubscriptionRequest {
    email: String,
}

#[derive(Debug, Deserialize)]
struct VerificationRequest {
    token: String,
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    count: Option<usize>,
    offset: Option<usize>,
}

/// Response returned when an event is accepted onto the stream.
#[derive(Debug, Serialize, Deserialize)]
struct EventResponse {
    /// Stream id assigned to the event
    id: String,
    status: String,
    #[serde(rename = "correlationId")]
    correlation_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    mailgate::init_tracing();

    let config = MailgateConfig::load()?;
    let components = config.build_components()?;

    let api_key = config.server.api_key.clone().unwrap_or_else(|| {
        warn!("MAILGATE_API_KEY not set, defaulting to 'dev-key'. DO NOT USE IN PRODUCTION.");
        "dev-key".to_string()
    });

    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen_for_os_signals());

    // In-memory stores are invisible to a separate worker process
    let embedded = if config.runs_embedded_consumer() {
        let consumer = components.stream_consumer(&config, &config.worker_name()).await?;
        info!("Running the stream consumer inside the server");
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move { consumer.run(shutdown).await }))
    } else {
        None
    };

    let state = Arc::new(AppState {
        subscriptions: components.subscriptions,
        store: components.store,
        publisher: components.publisher,
        dead_letters: Some(DeadLetterQueue::for_stream(components.pool, &config.worker.stream)),
        api_key,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, stream = %config.worker.stream, "mailgate server listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await?;

    if let Some(run) = embedded {
        let abort = run.abort_handle();
        match shutdown.drain(run).await {
            Some(Ok(stats)) => info!(processed = stats.processed, failed = stats.failed, "Embedded consumer stopped"),
            Some(Err(e)) => error!(error = %e, "Embedded consumer ended abnormally"),
            None => {
                warn!("Embedded consumer did not finish in time, aborting");
                abort.abort();
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

fn app(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/v1/events", post(emit_event))
        .route("/api/v1/dead-letters", get(list_dead_letters))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/email-subscriptions", post(create_subscription))
        .route("/api/v1/verify-email", post(verify_email))
        .merge(protected)
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(key) if key == state.api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API Key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    state.store.ping().await.map_err(|e| {
        error!(store = %state.store.name(), error = %e, "Store health check failed");
        api_error(StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
    })?;

    Ok(Json(json!({ "status": "ok", "store": state.store.name() })))
}

async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Json<Value>, ApiError> {
    let email = request.email;
    subscription::validate_email(&email).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let exists = state
        .subscriptions
        .email_subscription_exists(&email)
        .await
        .map_err(internal_error)?;

    if exists {
        debug!(email = %email, "Subscription already exists");
    } else {
        state
            .subscriptions
            .create_email_subscription(&email)
            .await
            .map_err(internal_error)?;
    }

    Ok(Json(json!({
        "message": "email subscription successful",
        "email": email,
    })))
}

async fn verify_email(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VerificationRequest>,
) -> Result<Json<Value>, ApiError> {
    let token = token::unescape(&request.token).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    match state.subscriptions.verify_email_with_subscription_token(&token).await {
        Ok(_) => Ok(Json(json!({ "message": "email verification successful" }))),
        Err(SubscriptionError::NotFound(email)) => {
            info!(email = %email, "Verification for unknown subscription");
            Err(api_error(StatusCode::NOT_FOUND, "subscription not found"))
        }
        Err(e @ SubscriptionError::Token(_)) => Err(api_error(StatusCode::BAD_REQUEST, e.to_string())),
        Err(e) => Err(internal_error(e)),
    }
}

fn internal_error(e: SubscriptionError) -> ApiError {
    error!(error = %e, "Subscription request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

async fn emit_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<EventResponse>), ApiError> {
    if envelope.kind().is_none() {
        warn!(event_type = %envelope.event_type, "Rejecting unsupported event type");
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("unsupported event type '{}'", envelope.event_type),
        ));
    }

    let correlation_id = if envelope.correlation_id.is_empty() {
        headers
            .get("X-Correlation-ID")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    } else {
        envelope.correlation_id.clone()
    };
    let envelope = envelope.with_correlation_id(&correlation_id);

    let serialized = serde_json::to_string(&envelope)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let id = state.publisher.publish(serialized).await.map_err(|e| {
        error!(error = %e, correlation_id = %correlation_id, "Failed to publish event");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to publish event")
    })?;

    info!(
        id = %id,
        event_type = %envelope.event_type,
        correlation_id = %correlation_id,
        "Event accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(EventResponse {
            id,
            status: "accepted".to_string(),
            correlation_id,
        }),
    ))
}

async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(dlq) = &state.dead_letters else {
        return Err(api_error(StatusCode::NOT_FOUND, "dead-letter stream not configured"));
    };

    let count = query.count.unwrap_or(DEAD_LETTER_PAGE);
    let offset = query.offset.unwrap_or(0);

    let (total, letters) = tokio::try_join!(dlq.count(), dlq.list(count, offset)).map_err(|e| {
        error!(error = %e, "Failed to read dead letters");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to read dead letters")
    })?;

    Ok(Json(json!({
        "stream": dlq.stream(),
        "total": total,
        "entries": letters,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use mailgate::event::{EmailSendTask, EventKind};
    use mailgate::gateway::log::LogGateway;
    use mailgate::publisher::VerificationNotifier;
    use mailgate::queue::memory::InMemoryQueue;
    use mailgate::queue::QueueTransport;
    use mailgate::store::memory::InMemorySuppressionStore;
    use mailgate::template::TemplateRegistry;
    use tower::ServiceExt;

    const KEY: &str = "test-key";

    struct TestApp {
        state: Arc<AppState>,
        store: Arc<InMemorySuppressionStore>,
        queue: Arc<InMemoryQueue>,
    }

    fn test_app() -> TestApp {
        let store = Arc::new(InMemorySuppressionStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let notifier = VerificationNotifier::new(
            queue.clone(),
            "app.example.com",
            "/verify-email-subscription",
            "no-reply@example.com",
        );
        let subscriptions = Arc::new(SubscriptionService::new(
            store.clone(),
            Arc::new(LogGateway::new()),
            Arc::new(TemplateRegistry::with_builtins()),
            notifier,
        ));

        let state = Arc::new(AppState {
            subscriptions,
            store: store.clone(),
            publisher: queue.clone(),
            dead_letters: None,
            api_key: KEY.to_string(),
        });

        TestApp { state, store, queue }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Value) {
        let response = app(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    /// The token carried by the most recently published verification link.
    async fn published_token(queue: &InMemoryQueue) -> String {
        let batch = queue.receive_batch(10).await.unwrap();
        let message = batch.last().unwrap();
        let envelope: Envelope = serde_json::from_slice(&message.body).unwrap();
        let task: EmailSendTask = serde_json::from_str(&envelope.event_details).unwrap();
        let link = &task.parameters["verificationLink"];
        link.split_once("token=").unwrap().1.to_string()
    }

    #[tokio::test]
    async fn test_health_check() {
        let test = test_app();
        let (status, body) = send(&test.state, Request::get("/health").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "memory");
    }

    #[tokio::test]
    async fn test_subscribe_then_verify() {
        let test = test_app();

        let (status, body) = send(
            &test.state,
            post_json("/api/v1/email-subscriptions", json!({ "email": "a@x.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "email subscription successful");
        assert_eq!(body["email"], "a@x.com");
        assert!(test.store.get("a@x.com").await.unwrap().is_some());

        let escaped = published_token(&test.queue).await;
        let (status, body) = send(&test.state, post_json("/api/v1/verify-email", json!({ "token": escaped }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "email verification successful");

        let record = test.store.get("a@x.com").await.unwrap().unwrap();
        assert!(record.verified);
    }

    #[tokio::test]
    async fn test_existing_subscription_is_not_recreated() {
        let test = test_app();
        let request = || post_json("/api/v1/email-subscriptions", json!({ "email": "a@x.com" }));

        send(&test.state, request()).await;
        let (status, _) = send(&test.state, request()).await;

        assert_eq!(status, StatusCode::OK);
        // Only the first call published a verification task
        assert_eq!(test.queue.pending().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_email_rejected() {
        let test = test_app();
        let (status, body) = send(
            &test.state,
            post_json("/api/v1/email-subscriptions", json!({ "email": "not-an-address" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("not-an-address"));
        assert!(test.store.is_empty().await);
        assert_eq!(test.queue.pending().await, 0);
    }

    #[tokio::test]
    async fn test_verify_unknown_subscription_is_not_found() {
        let test = test_app();
        let token = token::generate("ghost@x.com").unwrap();

        let (status, _) = send(&test.state, post_json("/api/v1/verify-email", json!({ "token": token }))).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(test.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_verify_rejects_bad_tokens() {
        let test = test_app();

        let (status, _) = send(&test.state, post_json("/api/v1/verify-email", json!({ "token": "no-separator" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&test.state, post_json("/api/v1/verify-email", json!({ "token": "abc%zz" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_events_require_api_key() {
        let test = test_app();
        let envelope = json!({ "eventType": "email-send-task", "eventDetails": "{}" });

        let (status, _) = send(&test.state, post_json("/api/v1/events", envelope.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut request = post_json("/api/v1/events", envelope);
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        let (status, _) = send(&test.state, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        assert_eq!(test.queue.pending().await, 0);
    }

    #[tokio::test]
    async fn test_emit_event_uses_correlation_header() {
        let test = test_app();
        let mut request = post_json(
            "/api/v1/events",
            json!({ "eventType": "account-confirmation-task", "eventDetails": "{\"userName\":\"u\",\"emailAddress\":\"a@x.com\"}" }),
        );
        let headers = request.headers_mut();
        headers.insert(header::AUTHORIZATION, format!("Bearer {KEY}").parse().unwrap());
        headers.insert("X-Correlation-ID", "corr-7".parse().unwrap());

        let (status, body) = send(&test.state, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["correlationId"], "corr-7");
        assert_eq!(body["id"], "m-1");

        let batch = test.queue.receive_batch(10).await.unwrap();
        let envelope: Envelope = serde_json::from_slice(&batch[0].body).unwrap();
        assert_eq!(envelope.kind(), Some(EventKind::ConfirmAccount));
        assert_eq!(envelope.correlation_id, "corr-7");
    }

    #[tokio::test]
    async fn test_emit_event_generates_correlation_id() {
        let test = test_app();
        let mut request = post_json("/api/v1/events", json!({ "eventType": "Bounce" }));
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, format!("Bearer {KEY}").parse().unwrap());

        let (status, body) = send(&test.state, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(uuid::Uuid::parse_str(body["correlationId"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_emit_event_rejects_unknown_kind() {
        let test = test_app();
        let mut request = post_json("/api/v1/events", json!({ "eventType": "mystery" }));
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, format!("Bearer {KEY}").parse().unwrap());

        let (status, _) = send(&test.state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(test.queue.pending().await, 0);
    }

    #[tokio::test]
    async fn test_dead_letters_unavailable_without_redis() {
        let test = test_app();
        let request = Request::get("/api/v1/dead-letters")
            .header(header::AUTHORIZATION, format!("Bearer {KEY}"))
            .body(Body::empty())
            .unwrap();

        let (status, _) = send(&test.state, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
