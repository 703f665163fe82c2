use crate::alerts::types::StoredAlert;
use crate::error::IngestError;
use crate::ingest::Ingestor;
use crate::stats::StatsSnapshot;
use crate::storage::CompressionSummary;
use crate::telemetry::{Reading, WireId, WireReading};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(message) => Self::new(StatusCode::BAD_REQUEST, message),
            IngestError::Storage(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to process sensor data")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    message: &'static str,
    compression_ratio: f64,
    is_predicted: bool,
}

async fn receive_sensor_data(
    State(ingestor): State<Ingestor>,
    payload: Result<Json<WireReading>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    let Json(wire) = payload.map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.body_text()))?;

    let device_id = wire
        .device_id
        .as_deref()
        .map(|id| id.trim().to_string())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "device_id is required"))?;
    let user_id = wire
        .user_id
        .clone()
        .map(WireId::into_string)
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "user_id is required"))?;
    let reading = Reading::new(device_id.as_str(), wire.timestamp(), wire.values);

    let result = ingestor.ingest(&device_id, &user_id, reading).await?;
    Ok(Json(IngestResponse {
        message: "Data received successfully",
        compression_ratio: result.compression_ratio,
        is_predicted: result.is_predicted,
    }))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    tracked_devices: usize,
    stats: StatsSnapshot,
}

async fn healthz(State(ingestor): State<Ingestor>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        tracked_devices: ingestor.tracked_devices(),
        stats: ingestor.stats().snapshot(),
    })
}

#[derive(Debug, Deserialize)]
struct UnnotifiedQuery {
    limit: Option<i64>,
}

async fn unnotified_alerts(
    State(ingestor): State<Ingestor>,
    Query(query): Query<UnnotifiedQuery>,
) -> Result<Json<Vec<StoredAlert>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 250);
    Ok(Json(ingestor.unnotified_alerts(limit).await?))
}

async fn compression_summary(
    State(ingestor): State<Ingestor>,
    Path(user_id): Path<String>,
) -> Result<Json<CompressionSummary>, ApiError> {
    Ok(Json(ingestor.compression_summary(&user_id).await?))
}

pub fn router(ingestor: Ingestor) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/sensor-data", post(receive_sensor_data))
        .route("/api/alerts/unnotified", get(unnotified_alerts))
        .route("/api/users/{user_id}/compression", get(compression_summary))
        .with_state(ingestor)
}
