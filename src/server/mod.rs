use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    body::{ Body, Bytes },
    extract::{ Path, Query, State },
    http::{ header, StatusCode },
    response::{ IntoResponse, Response },
    routing::{ get, post },
    Json,
    Router,
};
use futures::StreamExt;
use governor::{ clock::DefaultClock, state::{ InMemoryState, NotKeyed }, Quota, RateLimiter };
use log::{ error, info, warn };
use serde::{ Deserialize, Serialize };
use serde_json::json;
use tower_http::cors::{ Any, CorsLayer };

use crate::cli::Args;
use crate::models::chat::{ AssistantReply, HistoryTurn, TimelineDocument };
use crate::session::{ AbortHandle, ChatSession, SessionError, SubmitOutcome };
use crate::simulator::{ SimulatorError, TimelineSimulator };
use crate::store::ChatStore;

type ApiRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Clone)]
pub struct AppState {
    simulator: Arc<TimelineSimulator>,
    store: Arc<dyn ChatStore>,
    limiter: Option<Arc<ApiRateLimiter>>,
}

impl AppState {
    pub fn new(
        simulator: Arc<TimelineSimulator>,
        store: Arc<dyn ChatStore>,
        requests_per_second: u32
    ) -> Self {
        let limiter = NonZeroU32::new(requests_per_second).map(|rate|
            Arc::new(RateLimiter::direct(Quota::per_second(rate)))
        );
        Self { simulator, store, limiter }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateRequest {
    #[serde(default)]
    pub symptom: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<HistoryTurn>,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    pub user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChatsQuery {
    pub user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    content: String,
    timeline: Option<TimelineDocument>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/simulate", post(simulate_handler))
        .route("/api/chats", post(create_chat_handler).get(list_chats_handler))
        .route("/api/chats/{id}", get(get_chat_handler).delete(delete_chat_handler))
        .route("/api/chats/{id}/messages", get(get_messages_handler).post(post_message_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(
    args: &Args,
    simulator: Arc<TimelineSimulator>,
    store: Arc<dyn ChatStore>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = args.server_addr.parse::<SocketAddr>()?;
    let state = AppState::new(simulator, store, args.rate_limit_per_second);
    let app = build_router(state);

    if args.enable_tls && args.tls_cert_path.is_some() && args.tls_key_path.is_some() {
        let cert_path = args.tls_cert_path.as_ref().ok_or("TLS enabled without certificate path")?;
        let key_path = args.tls_key_path.as_ref().ok_or("TLS enabled without key path")?;

        info!("Starting HTTPS server on: https://{}", addr);
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            cert_path,
            key_path
        ).await?;
        axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
    } else {
        if args.enable_tls {
            error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
            return Err("TLS enabled without cert/key".into());
        }
        info!("Starting HTTP server on: http://{}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app.into_make_service()).await?;
    }

    Ok(())
}

fn over_limit(state: &AppState) -> bool {
    state.limiter
        .as_ref()
        .map(|limiter| limiter.check().is_err())
        .unwrap_or(false)
}

fn rate_limited_response() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": "Too many requests. Please slow down." })),
    ).into_response()
}

fn simulator_error_response(err: &SimulatorError) -> Response {
    let status = match err {
        SimulatorError::QuotaExhausted => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = serde_json
        ::from_str::<serde_json::Value>(&err.client_payload())
        .ok()
        .and_then(|payload| payload["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| err.to_string());
    (status, Json(json!({ "status": "error", "message": message }))).into_response()
}

fn missing_symptom_response() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "error", "message": "Symptom description is required" })),
    ).into_response()
}

#[derive(Deserialize)]
pub struct HealthQuery {
    /// When set, issues a live completion against the first candidate
    /// model instead of only reporting configuration.
    #[serde(default)]
    pub probe: bool,
}

async fn health_handler(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>
) -> impl IntoResponse {
    let mut body = json!({
        "status": "success",
        "configured": state.simulator.is_configured(),
        "models": state.simulator.candidate_models(),
    });

    if query.probe {
        if let Err(err) = state.simulator.probe().await {
            body["status"] = json!("error");
            body["message"] = json!(err.to_string());
        }
    }

    Json(body)
}

/// The core route. Streams the raw model text as `text/plain`; on a
/// producer failure the body carries a single JSON error payload
/// instead of text chunks, never both.
async fn simulate_handler(
    State(state): State<AppState>,
    Json(req): Json<SimulateRequest>
) -> Response {
    if over_limit(&state) {
        warn!("Simulate request dropped by rate limiter");
        return rate_limited_response();
    }

    let symptom = req.symptom.trim();
    if symptom.is_empty() {
        return missing_symptom_response();
    }

    let message = match req.category.as_deref() {
        Some(category) => format!("[Category: {}] {}", category, symptom),
        None => symptom.to_string(),
    };

    if !req.stream {
        return match state.simulator.generate_timelines(&message, &req.choices).await {
            Ok(AssistantReply::Timeline(doc)) =>
                Json(json!({ "status": "success", "data": doc })).into_response(),
            Ok(AssistantReply::Text(text)) =>
                Json(
                    json!({ "status": "success", "data": { "type": "text", "content": text } })
                ).into_response(),
            Err(err) => simulator_error_response(&err),
        };
    }

    let stream = state.simulator.stream_timelines(
        &message,
        &req.conversation_history,
        &req.choices
    ).await;
    let body_stream = stream.map(|item| -> Result<Bytes, Infallible> {
        match item {
            Ok(chunk) => Ok(Bytes::from(chunk)),
            Err(err) => Ok(Bytes::from(err.client_payload())),
        }
    });

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body_stream),
    ).into_response()
}

async fn create_chat_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateChatRequest>
) -> Response {
    match state.store.create_chat(&req.user_id).await {
        Ok(chat) => (StatusCode::CREATED, Json(chat)).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn list_chats_handler(
    State(state): State<AppState>,
    Query(query): Query<ListChatsQuery>
) -> Response {
    match state.store.list_chats(&query.user_id).await {
        Ok(chats) => Json(chats).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn get_chat_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_chat(&id).await {
        Ok(Some(chat)) => Json(chat).into_response(),
        Ok(None) => chat_not_found(&id),
        Err(e) => store_error_response(e),
    }
}

async fn delete_chat_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.delete_chat(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn get_messages_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_chat(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return chat_not_found(&id);
        }
        Err(e) => {
            return store_error_response(e);
        }
    }
    match state.store.get_messages(&id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => store_error_response(e),
    }
}

/// Server-side conversational turn against a stored chat: resumes the
/// session, runs one submission to completion, and returns the final
/// assistant text plus the structured document when one was produced.
async fn post_message_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>
) -> Response {
    if over_limit(&state) {
        warn!("Message request dropped by rate limiter");
        return rate_limited_response();
    }

    let mut session = match
        ChatSession::resume(state.simulator.clone(), state.store.clone(), &id).await
    {
        Ok(session) => session,
        Err(SessionError::UnknownChat(_)) => {
            return chat_not_found(&id);
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            ).into_response();
        }
    };

    let outcome = match
        session.submit(&req.content, req.category.as_deref(), &AbortHandle::new()).await
    {
        Ok(outcome) => outcome,
        Err(SessionError::EmptyInput) => {
            return missing_symptom_response();
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            ).into_response();
        }
    };

    let content = session
        .transcript()
        .last()
        .map(|turn| turn.content.clone())
        .unwrap_or_default();

    match outcome {
        SubmitOutcome::Completed(AssistantReply::Timeline(doc)) =>
            Json(MessageResponse { content, timeline: Some(doc) }).into_response(),
        SubmitOutcome::Completed(AssistantReply::Text(_)) | SubmitOutcome::Cancelled =>
            Json(MessageResponse { content, timeline: None }).into_response(),
        SubmitOutcome::Failed(err) => simulator_error_response(&err),
    }
}

fn chat_not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("chat not found: {}", id) })),
    ).into_response()
}

fn store_error_response(e: Box<dyn Error + Send + Sync>) -> Response {
    error!("Chat store failure: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "chat store failure" })),
    ).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use crate::simulator::testing::{ candidate, FailingClient, ScriptedClient };
    use crate::store::create_chat_store;

    const TIMELINE_JSON: &str = r#"{"timelines":[{"path":"Rest","action":"Stay home.","days":[],"riskPercentage":10,"recoveryPercentage":90}],"bestPath":{"pathIndex":0,"explanation":"Safest."},"disclaimer":"Simulation only."}"#;

    fn memory_store() -> Arc<dyn ChatStore> {
        create_chat_store(&Args::for_tests()).unwrap()
    }

    fn app_with(simulator: TimelineSimulator) -> Router {
        build_router(AppState::new(Arc::new(simulator), memory_store(), 0))
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn simulate_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/simulate")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn simulate_streams_chunks_in_order() {
        let app = app_with(
            TimelineSimulator::with_candidates(
                vec![candidate("fast", ScriptedClient::new("fast", &["one ", "two ", "three"]))]
            )
        );
        let response = app
            .oneshot(simulate_request(json!({ "symptom": "headache" }))).await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(body_string(response).await, "one two three");
    }

    #[tokio::test]
    async fn simulate_falls_back_when_the_first_model_is_over_quota() {
        let app = app_with(
            TimelineSimulator::with_candidates(
                vec![
                    candidate("fast", FailingClient::new("fast", "429 Too Many Requests")),
                    candidate("slow", ScriptedClient::new("slow", &["fallback text"]))
                ]
            )
        );
        let response = app
            .oneshot(simulate_request(json!({ "symptom": "headache" }))).await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "fallback text");
    }

    #[tokio::test]
    async fn simulate_exhaustion_yields_a_single_error_payload() {
        let app = app_with(
            TimelineSimulator::with_candidates(
                vec![candidate("only", FailingClient::new("only", "quota exceeded"))]
            )
        );
        let response = app
            .oneshot(simulate_request(json!({ "symptom": "headache" }))).await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["details"], "Rate limit exceeded");
    }

    #[tokio::test]
    async fn empty_symptom_is_a_bad_request() {
        let app = app_with(
            TimelineSimulator::with_candidates(
                vec![candidate("fast", ScriptedClient::new("fast", &["unused"]))]
            )
        );
        let response = app
            .oneshot(simulate_request(json!({ "symptom": "   " }))).await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "Symptom description is required");
    }

    #[tokio::test]
    async fn non_streaming_simulate_returns_the_timeline_document() {
        let app = app_with(
            TimelineSimulator::with_candidates(
                vec![candidate("fast", ScriptedClient::new("fast", &[TIMELINE_JSON]))]
            )
        );
        let response = app
            .oneshot(simulate_request(json!({ "symptom": "headache", "stream": false }))).await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["timelines"][0]["path"], "Rest");
        assert_eq!(body["data"]["bestPath"]["pathIndex"], 0);
    }

    #[tokio::test]
    async fn non_streaming_simulate_wraps_plain_replies() {
        let app = app_with(
            TimelineSimulator::with_candidates(
                vec![candidate("fast", ScriptedClient::new("fast", &["Just rest."]))]
            )
        );
        let response = app
            .oneshot(simulate_request(json!({ "symptom": "headache", "stream": false }))).await
            .unwrap();

        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["type"], "text");
        assert_eq!(body["data"]["content"], "Just rest.");
    }

    #[tokio::test]
    async fn health_reports_configured_models() {
        let app = app_with(
            TimelineSimulator::with_candidates(
                vec![
                    candidate("fast", ScriptedClient::new("fast", &[])),
                    candidate("slow", ScriptedClient::new("slow", &[]))
                ]
            )
        );
        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap()).await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["configured"], true);
        assert_eq!(body["models"], json!(["fast", "slow"]));
    }

    #[tokio::test]
    async fn health_probe_runs_a_live_completion() {
        let app = app_with(
            TimelineSimulator::with_candidates(
                vec![candidate("fast", ScriptedClient::new("fast", &["SUCCESS"]))]
            )
        );
        let response = app
            .oneshot(
                Request::builder().uri("/api/health?probe=true").body(Body::empty()).unwrap()
            ).await
            .unwrap();

        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "success");
        assert!(body.get("message").is_none());
    }

    #[tokio::test]
    async fn chat_round_trip_creates_answers_and_lists() {
        let app = app_with(
            TimelineSimulator::with_candidates(
                vec![candidate("fast", ScriptedClient::new("fast", &["Take it easy."]))]
            )
        );

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chats")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "userId": "user-1" }).to_string()))
                    .unwrap()
            ).await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let chat: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        let chat_id = chat["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/chats/{}/messages", chat_id))
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "content": "mild headache" }).to_string()))
                    .unwrap()
            ).await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(reply["content"], "Take it easy.");
        assert!(reply["timeline"].is_null());

        let response = app
            .oneshot(
                Request::builder().uri("/api/chats?userId=user-1").body(Body::empty()).unwrap()
            ).await
            .unwrap();
        let chats: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(chats[0]["title"], "mild headache");
    }

    #[tokio::test]
    async fn unknown_chat_is_not_found() {
        let app = app_with(
            TimelineSimulator::with_candidates(
                vec![candidate("fast", ScriptedClient::new("fast", &["unused"]))]
            )
        );
        let response = app
            .oneshot(Request::builder().uri("/api/chats/missing").body(Body::empty()).unwrap()).await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
