//! HTTP surface: listing, single fetch and reservation of wishes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::rejection::FormRejection;
use axum::extract::{Form, MatchedPath, Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::engine::{CallContext, Engine, EngineError, ReservationRequest, WishListing};
use crate::limiter::{self, AdmissionLimiter};
use crate::limits::{MAX_WEEKS, MIN_WEEKS};
use crate::model::Wish;
use crate::observability;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub limiter: Arc<AdmissionLimiter>,
    pub request_timeout: Duration,
    /// Cancelled on shutdown; in-flight engine calls abort with it.
    pub shutdown: CancellationToken,
}

impl AppState {
    fn ctx(&self) -> CallContext {
        CallContext::with_cancel(self.request_timeout, &self.shutdown)
    }
}

pub fn router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/wishes", get(list_wishes))
        .route("/wishes/{name}", get(get_wish))
        .route("/wishes/{name}/reserve", post(reserve))
        .route_layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            limiter::limit_middleware,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(limited)
        .layer(middleware::from_fn(metrics_middleware))
        .with_state(state)
}

// ── Errors ───────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

/// Error response with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiErrorBody {
                code: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let message = e.to_string();
        match e {
            EngineError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", "wish not found")
            }
            EngineError::FullyReserved => {
                Self::new(StatusCode::CONFLICT, "FULLY_RESERVED", message)
            }
            EngineError::Conflict(_) => Self::new(StatusCode::CONFLICT, "CONFLICT", message),
            EngineError::LimitExceeded(_) => {
                Self::new(StatusCode::CONFLICT, "LIMIT_EXCEEDED", message)
            }
            EngineError::QuantityExceedsAvailable { .. } => {
                Self::bad_request("QUANTITY_EXCEEDS_AVAILABLE", message)
            }
            EngineError::Validation(m) => Self::bad_request("INVALID_REQUEST", m),
            EngineError::Timeout => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "TIMEOUT", message)
            }
            EngineError::Cancelled => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "CANCELLED", message)
            }
            EngineError::Store(e) => {
                error!(error = %e, "store failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "storage failure")
            }
        }
    }
}

// ── Handlers ─────────────────────────────────────────────

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct ListParams {
    tag: Option<String>,
}

async fn list_wishes(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<WishListing>, ApiError> {
    let listing = state
        .engine
        .list_active(params.tag.as_deref(), &state.ctx())
        .await?;
    Ok(Json(listing))
}

async fn get_wish(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Wish>, ApiError> {
    Ok(Json(state.engine.get_wish(&name, &state.ctx()).await?))
}

async fn reserve(
    State(state): State<AppState>,
    Path(name): Path<String>,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> Result<Json<Wish>, ApiError> {
    let Form(form) = form.map_err(|e| ApiError::bad_request("INVALID_REQUEST", e.body_text()))?;
    let req = parse_reservation(&form)?;
    let wish = state.engine.reserve(&name, req, &state.ctx()).await?;
    Ok(Json(wish))
}

/// `weeks` is required and must lie in range; `quantity` defaults to 1 when
/// absent or empty.
fn parse_reservation(form: &HashMap<String, String>) -> Result<ReservationRequest, ApiError> {
    let weeks = form
        .get("weeks")
        .and_then(|w| w.trim().parse::<u32>().ok())
        .filter(|w| (MIN_WEEKS..=MAX_WEEKS).contains(w))
        .ok_or_else(|| {
            ApiError::bad_request(
                "INVALID_WEEKS",
                format!("weeks must be between {MIN_WEEKS} and {MAX_WEEKS}"),
            )
        })?;

    let quantity = match form.get("quantity").map(|q| q.trim()) {
        None | Some("") => 1,
        Some(q) => q
            .parse::<i32>()
            .ok()
            .filter(|q| *q >= 1)
            .ok_or_else(|| ApiError::bad_request("INVALID_QUANTITY", "invalid quantity"))?,
    };

    Ok(ReservationRequest { quantity, weeks })
}

async fn metrics_middleware(req: Request<Body>, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let start = Instant::now();
    let response = next.run(req).await;
    metrics::histogram!(observability::HTTP_REQUEST_DURATION_SECONDS, "route" => route.clone())
        .record(start.elapsed().as_secs_f64());
    metrics::counter!(
        observability::HTTP_REQUESTS_TOTAL,
        "route" => route,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}
