//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST   /v1/chat`                    : Ask a question, get an answer with citations
//! - `GET    /v1/chat/history`            : Caller's chat turns, filterable and paginated
//! - `GET    /v1/chat/sessions`           : Caller's distinct session ids
//! - `POST   /v1/child-details`           : Record a detail about a child
//! - `POST   /v1/child-details/batch`     : Record several details for one child
//! - `GET    /v1/child-details`           : List a child's details
//! - `GET    /v1/child-details/{id}`      : Fetch one detail
//! - `PATCH  /v1/child-details/{id}`      : Update a detail
//! - `DELETE /v1/child-details/{id}`      : Delete a detail
//! - `GET    /v1/models`                  : Advertised models
//!
//! Every route identifies the caller by the `X-User-Id` header.

use axum::{
    Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use nestling_config::ModelInfo;
use nestling_core::chat::{ChatTurn, HistoryQuery, SessionId};
use nestling_core::child::{ChildDetail, ChildDetailPatch, ChildId, DetailId, DetailType, NewChildDetail, UserId};
use nestling_core::error::{Error, StoreError};
use nestling_core::store::DetailFilter;
use nestling_rag::{ChatAnswer, ChatRequest};

use crate::runtime::Services;

pub type SharedServices = Arc<Services>;

pub const USER_HEADER: &str = "x-user-id";

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 200;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(services: SharedServices) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/chat/history", get(history_handler))
        .route("/chat/sessions", get(sessions_handler))
        .route("/child-details", post(create_detail_handler).get(list_details_handler))
        .route("/child-details/batch", post(batch_create_handler))
        .route(
            "/child-details/{id}",
            get(get_detail_handler)
                .patch(update_detail_handler)
                .delete(delete_detail_handler),
        )
        .route("/models", get(models_handler))
        .with_state(services)
}

// ── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// An error rendered as a JSON body with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unauthenticated(message: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %e, "Request failed");
            return Self::new(status, "internal error");
        }
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

// ── Caller identity ───────────────────────────────────────────────────────

/// The authenticated caller, taken from the `X-User-Id` header.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthenticated("missing X-User-Id header"))?;
        value
            .trim()
            .parse()
            .map(Caller)
            .map_err(|_| ApiError::unauthenticated("malformed X-User-Id header"))
    }
}

// ── Chat ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatBody {
    question: String,
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    child_id: Option<ChildId>,
    #[serde(default)]
    model: Option<String>,
    /// Client-chosen turn number; a retried request reuses it.
    #[serde(default)]
    turn_sequence: Option<u64>,
}

async fn chat_handler(
    State(services): State<SharedServices>,
    Caller(user_id): Caller,
    Json(body): Json<ChatBody>,
) -> Result<Json<ChatAnswer>, ApiError> {
    info!(user_id = %user_id, child_id = ?body.child_id, "v1/chat request");
    let answer = services
        .pipeline
        .ask(ChatRequest {
            user_id,
            question: body.question,
            session_id: body.session_id,
            child_id: body.child_id,
            model: body.model,
            turn_sequence: body.turn_sequence,
        })
        .await?;
    Ok(Json(answer))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    child_id: Option<ChildId>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub turns: Vec<ChatTurn>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

async fn history_handler(
    State(services): State<SharedServices>,
    Caller(user_id): Caller,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let query = HistoryQuery {
        session_id: params.session_id,
        child_id: params.child_id,
        offset: params.offset.unwrap_or(0),
        limit: params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT),
    };
    let (turns, total) = services
        .history
        .list(user_id, &query)
        .await
        .map_err(Error::from)?;
    Ok(Json(HistoryResponse {
        turns,
        total,
        offset: query.offset,
        limit: query.limit,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionId>,
}

async fn sessions_handler(
    State(services): State<SharedServices>,
    Caller(user_id): Caller,
) -> Result<Json<SessionsResponse>, ApiError> {
    let sessions = services.history.sessions(user_id).await.map_err(Error::from)?;
    Ok(Json(SessionsResponse { sessions }))
}

// ── Child details ─────────────────────────────────────────────────────────

async fn create_detail_handler(
    State(services): State<SharedServices>,
    Caller(user_id): Caller,
    Json(input): Json<NewChildDetail>,
) -> Result<(StatusCode, Json<ChildDetail>), ApiError> {
    let detail = services.details.create(user_id, input).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

#[derive(Debug, Deserialize)]
struct BatchBody {
    details: Vec<NewChildDetail>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetailListResponse {
    pub details: Vec<ChildDetail>,
    pub total: usize,
}

async fn batch_create_handler(
    State(services): State<SharedServices>,
    Caller(user_id): Caller,
    Json(body): Json<BatchBody>,
) -> Result<(StatusCode, Json<DetailListResponse>), ApiError> {
    let details = services.details.batch_create(user_id, body.details).await?;
    let total = details.len();
    Ok((StatusCode::CREATED, Json(DetailListResponse { details, total })))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    child_id: ChildId,
    #[serde(default)]
    detail_type: Option<DetailType>,
    /// Comma-separated; a detail matches if it carries any of them.
    #[serde(default)]
    tags: Option<String>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_details_handler(
    State(services): State<SharedServices>,
    Caller(user_id): Caller,
    Query(params): Query<ListParams>,
) -> Result<Json<DetailListResponse>, ApiError> {
    let filter = DetailFilter {
        detail_type: params.detail_type,
        tags: params
            .tags
            .map(|t| t.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        offset: params.offset.unwrap_or(0),
        limit: params.limit.unwrap_or(0),
    };
    let (details, total) = services.details.list(user_id, params.child_id, filter).await?;
    Ok(Json(DetailListResponse { details, total }))
}

async fn get_detail_handler(
    State(services): State<SharedServices>,
    Caller(user_id): Caller,
    Path(detail_id): Path<DetailId>,
) -> Result<Json<ChildDetail>, ApiError> {
    Ok(Json(services.details.get(user_id, detail_id).await?))
}

async fn update_detail_handler(
    State(services): State<SharedServices>,
    Caller(user_id): Caller,
    Path(detail_id): Path<DetailId>,
    Json(patch): Json<ChildDetailPatch>,
) -> Result<Json<ChildDetail>, ApiError> {
    Ok(Json(services.details.update(user_id, detail_id, patch).await?))
}

async fn delete_detail_handler(
    State(services): State<SharedServices>,
    Caller(user_id): Caller,
    Path(detail_id): Path<DetailId>,
) -> Result<StatusCode, ApiError> {
    services.details.delete(user_id, detail_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Models ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelListResponse {
    pub models: Vec<ModelInfo>,
    pub default: String,
}

async fn models_handler(State(services): State<SharedServices>, _caller: Caller) -> Json<ModelListResponse> {
    Json(ModelListResponse {
        models: services.models.clone(),
        default: services.pipeline.settings().default_model.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Backends, Runtime};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use nestling_config::AppConfig;
    use nestling_core::child::ChildProfile;
    use nestling_core::error::ProviderError;
    use nestling_core::provider::{Provider, ProviderRequest, ProviderResponse};
    use nestling_memory::InMemoryChildStore;
    use nestling_providers::HashEmbedder;
    use tower::ServiceExt;

    struct MockProvider;

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                content: "Mock answer".into(),
                citations: vec![],
                usage: None,
                model: request.model,
            })
        }
    }

    struct TestApp {
        router: Router,
        guardian: UserId,
        child: ChildId,
        other_child: ChildId,
    }

    async fn test_app() -> TestApp {
        let children = InMemoryChildStore::new();
        let guardian = UserId::new();
        let child = ChildId::new();
        let other_child = ChildId::new();
        for (id, guardian_id) in [(child, guardian), (other_child, UserId::new())] {
            children
                .put_profile(ChildProfile {
                    id,
                    name: "Kid".into(),
                    birthdate: NaiveDate::from_ymd_opt(2023, 1, 15).unwrap(),
                    gender: None,
                    guardian_id,
                })
                .await;
        }
        let backends = Backends::in_memory(children, Arc::new(HashEmbedder::default()), Arc::new(MockProvider));
        let runtime = Runtime::assemble(AppConfig::default(), backends).unwrap();
        TestApp {
            router: v1_router(runtime.services()),
            guardian,
            child,
            other_child,
        }
    }

    fn request(method: &str, uri: &str, user: Option<UserId>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user.to_string());
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn missing_user_header_is_unauthorized() {
        let app = test_app().await;
        let (status, body) = send(&app, request("GET", "/chat/sessions", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("X-User-Id"));

        let req = Request::builder()
            .uri("/models")
            .header(USER_HEADER, "not-a-uuid")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn chat_answers_and_appears_in_history() {
        let app = test_app().await;
        let body = serde_json::json!({
            "question": "Any tips for bedtime?",
            "session_id": "s-1",
            "child_id": app.child,
        });
        let (status, answer) = send(&app, request("POST", "/chat", Some(app.guardian), Some(body))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(answer["answer"].as_str().unwrap().starts_with("Mock answer"));
        assert_eq!(answer["session_id"], "s-1");
        assert_eq!(answer["fallback"], false);

        let (status, history) = send(&app, request("GET", "/chat/history?session_id=s-1", Some(app.guardian), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["total"], 1);
        assert_eq!(history["turns"][0]["question"], "Any tips for bedtime?");

        let (_, sessions) = send(&app, request("GET", "/chat/sessions", Some(app.guardian), None)).await;
        assert_eq!(sessions["sessions"], serde_json::json!(["s-1"]));
    }

    #[tokio::test]
    async fn retried_chat_with_turn_sequence_is_recorded_once() {
        let app = test_app().await;
        let body = serde_json::json!({
            "question": "Any tips for bedtime?",
            "session_id": "s-retry",
            "child_id": app.child,
            "turn_sequence": 1,
        });
        for _ in 0..2 {
            let (status, answer) =
                send(&app, request("POST", "/chat", Some(app.guardian), Some(body.clone()))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(answer["turn_sequence"], 1);
        }

        let (_, history) =
            send(&app, request("GET", "/chat/history?session_id=s-retry", Some(app.guardian), None)).await;
        assert_eq!(history["total"], 1);
    }

    #[tokio::test]
    async fn chat_about_another_guardians_child_is_forbidden() {
        let app = test_app().await;
        let body = serde_json::json!({ "question": "What does she like?", "child_id": app.other_child });
        let (status, _) = send(&app, request("POST", "/chat", Some(app.guardian), Some(body))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn blank_question_is_bad_request() {
        let app = test_app().await;
        let body = serde_json::json!({ "question": "   " });
        let (status, _) = send(&app, request("POST", "/chat", Some(app.guardian), Some(body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn detail_lifecycle() {
        let app = test_app().await;
        let body = serde_json::json!({
            "child_id": app.child,
            "detail_type": "interest",
            "content": "enjoys stacking blocks into towers",
            "importance": 8,
            "tags": ["play"],
        });
        let (status, created) = send(&app, request("POST", "/child-details", Some(app.guardian), Some(body))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["revision"], 1);
        let id = created["id"].as_str().unwrap().to_string();
        let uri = format!("/child-details/{id}");

        let (status, fetched) = send(&app, request("GET", &uri, Some(app.guardian), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["content"], "enjoys stacking blocks into towers");

        let patch = serde_json::json!({ "importance": 9 });
        let (status, updated) = send(&app, request("PATCH", &uri, Some(app.guardian), Some(patch))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["importance"], 9);
        assert_eq!(updated["revision"], 2);

        let (status, _) = send(&app, request("GET", &uri, Some(UserId::new()), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(&app, request("DELETE", &uri, Some(app.guardian), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, request("GET", &uri, Some(app.guardian), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn batch_create_and_filtered_list() {
        let app = test_app().await;
        let body = serde_json::json!({ "details": [
            { "child_id": app.child, "detail_type": "milestone", "content": "first steps at 11 months" },
            { "child_id": app.child, "detail_type": "preference", "content": "prefers sweet over salty foods" },
        ]});
        let (status, created) = send(&app, request("POST", "/child-details/batch", Some(app.guardian), Some(body))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["total"], 2);

        let uri = format!("/child-details?child_id={}&detail_type=milestone", app.child);
        let (status, listed) = send(&app, request("GET", &uri, Some(app.guardian), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["total"], 1);
        assert_eq!(listed["details"][0]["content"], "first steps at 11 months");
    }

    #[tokio::test]
    async fn invalid_detail_is_bad_request() {
        let app = test_app().await;
        let body = serde_json::json!({
            "child_id": app.child,
            "detail_type": "interest",
            "content": "likes drums",
            "importance": 11,
        });
        let (status, _) = send(&app, request("POST", "/child-details", Some(app.guardian), Some(body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn models_lists_configured_models() {
        let app = test_app().await;
        let (status, body) = send(&app, request("GET", "/models", Some(app.guardian), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["default"], AppConfig::default().provider.chat_model);
        assert!(!body["models"].as_array().unwrap().is_empty());
    }
}
