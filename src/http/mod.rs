use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, FromRequest, Path, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::{
    cluster::LeaderDescriptor,
    domain::CatchUp,
    engine::{OrderEngine, PlaceOrder, WriteError},
    log_store::LogStoreError,
    rpc::{
        INVALIDATE_RAFT_PATH, MISSED_ORDER_PATH, MISSED_RAFT_PATH, MissedOrderRequest,
        MissedOrderResponse, MissedRaftRequest, MissedRaftResponse, REPLICATE_ORDER_PATH,
        REPLICATE_RAFT_PATH, ReplicateOrder, ReplicateRaft,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<OrderEngine>,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("no_leader", StatusCode::FORBIDDEN, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<LogStoreError> for ApiError {
    fn from(value: LogStoreError) -> Self {
        match value {
            LogStoreError::KeyOutOfRange { .. } => ApiError::invalid_request(value.to_string()),
            _ => ApiError::internal(value.to_string()),
        }
    }
}

impl From<WriteError> for ApiError {
    fn from(value: WriteError) -> Self {
        let message = value.to_string();
        match value {
            WriteError::NoLeader => ApiError::forbidden(message),
            WriteError::InvalidInput(msg) => ApiError::invalid_request(msg),
            WriteError::InsufficientStock {
                product,
                requested,
                available,
            } => ApiError::new("insufficient_stock", StatusCode::BAD_REQUEST, message)
                .with_detail("product", product)
                .with_detail("requested", requested)
                .with_detail("available", available),
            WriteError::Catalog { status, body } => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                let message = if body.is_empty() {
                    format!("catalog answered {status}")
                } else {
                    body
                };
                ApiError::new("catalog_rejected", status, message)
                    .with_detail("upstream_status", status.as_u16())
            }
            WriteError::CatalogUnavailable(_) => {
                ApiError::new("catalog_unavailable", StatusCode::BAD_GATEWAY, message)
            }
            WriteError::NoQuorum { acks, required } => ApiError::new(
                "replication_failed",
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                message,
            )
            .with_detail("acks", acks)
            .with_detail("required", required),
            WriteError::Storage(_) => ApiError::internal(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

fn parse_u64(raw: &str, what: &str) -> Result<u64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::invalid_request(format!("{what} must be a non-negative integer")))
}

pub fn build_router(engine: Arc<OrderEngine>) -> Router {
    let app_state = AppState { engine };

    Router::new()
        .route("/health", get(health))
        .route("/orders", post(place_order))
        .route("/orders/:order_number", get(get_order))
        .route(REPLICATE_ORDER_PATH, post(replicate_order))
        .route(REPLICATE_RAFT_PATH, post(replicate_raft))
        .route(
            &format!("{INVALIDATE_RAFT_PATH}/:n"),
            get(invalidate_raft),
        )
        .route(MISSED_ORDER_PATH, post(missed_order))
        .route(MISSED_RAFT_PATH, post(missed_raft))
        .route("/notify_leader_info_to_replica", post(notify_leader))
        .route("/note_raft_term/:term", get(note_raft_term))
        .fallback(fallback_not_found)
        .layer(Extension(app_state))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn place_order(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<PlaceOrder>,
) -> Result<Json<Value>, ApiError> {
    let order_number = state.engine.place_order(req).await?;
    Ok(Json(json!({ "order_number": order_number })))
}

async fn get_order(
    Extension(state): Extension<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let order_number = parse_u64(&raw, "order number")?;
    let order = state
        .engine
        .order(order_number)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("order {order_number} not found")))?;
    Ok(Json(json!({
        "data": {
            "number": order.order_number,
            "name": order.product_name,
            "quantity": order.quantity,
        }
    })))
}

async fn replicate_order(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<ReplicateOrder>,
) -> Result<Json<Value>, ApiError> {
    state.engine.accept_order(req).await?;
    Ok(Json(json!({ "status": "replicated" })))
}

async fn replicate_raft(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<ReplicateRaft>,
) -> Result<Json<Value>, ApiError> {
    state.engine.accept_raft(req).await?;
    Ok(Json(json!({ "status": "replicated" })))
}

async fn invalidate_raft(
    Extension(state): Extension<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let n = parse_u64(&raw, "invalidation index")?;
    let removed = state.engine.invalidate_raft(n).await?;
    Ok(Json(json!({
        "status": "invalidated",
        "removed": removed.map(|entry| entry.index),
    })))
}

async fn missed_order(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<MissedOrderRequest>,
) -> Result<Response, ApiError> {
    let missing = state.engine.missing_orders(req.latest_order_id).await?;
    Ok(match missing {
        CatchUp::UpToDate => up_to_date(),
        CatchUp::Behind(missed_orders) => (
            StatusCode::CREATED,
            Json(MissedOrderResponse { missed_orders }),
        )
            .into_response(),
    })
}

async fn missed_raft(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<MissedRaftRequest>,
) -> Result<Response, ApiError> {
    let missing = state.engine.missing_raft(req.latest_raft_id).await?;
    Ok(match missing {
        CatchUp::UpToDate => up_to_date(),
        CatchUp::Behind(missed_raft_entries) => (
            StatusCode::CREATED,
            Json(MissedRaftResponse {
                missed_raft_entries,
            }),
        )
            .into_response(),
    })
}

fn up_to_date() -> Response {
    (StatusCode::OK, Json(json!({ "message": "up to date" }))).into_response()
}

#[derive(Debug, Deserialize)]
struct LeaderAnnouncement {
    #[serde(default)]
    leader: Option<LeaderDescriptor>,
    /// The gateway sends the replica id; older callers send `host:port`.
    #[serde(default)]
    leader_id: Option<Value>,
}

async fn notify_leader(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<LeaderAnnouncement>,
) -> Result<Json<Value>, ApiError> {
    let (Some(leader), Some(leader_id)) = (req.leader, req.leader_id) else {
        return Err(ApiError::invalid_request(
            "leader and leader_id are required",
        ));
    };
    let is_self = state.engine.table().local().is_at(&leader);
    info!(
        leader_host = %leader.host,
        leader_port = leader.port,
        %leader_id,
        is_self,
        "leader announced"
    );
    Ok(Json(json!({ "status": "Leader updated successfully" })))
}

async fn note_raft_term(
    Extension(state): Extension<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let term = parse_u64(&raw, "term")?;
    state.engine.note_term(term);
    Ok(Json(json!({ "term": term })))
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
