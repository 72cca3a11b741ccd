use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::models::{ApiResponse, IndicatorValues, StateQuery};
use crate::services::{AppError, IndicatorService};

pub async fn health() -> Json<ApiResponse<Value>> {
    Json(ApiResponse::success(json!({ "status": "ok" })))
}

pub async fn list_indicators(
    State(service): State<Arc<IndicatorService>>,
) -> Json<ApiResponse<Vec<String>>> {
    Json(ApiResponse::success(service.list_indicators()))
}

pub async fn indicator_values(
    Path(name): Path<String>,
    Query(params): Query<StateQuery>,
    State(service): State<Arc<IndicatorService>>,
) -> Result<Json<ApiResponse<IndicatorValues>>, AppError> {
    let values = service
        .indicator_values(&name, params.state.as_deref())
        .await?;

    Ok(Json(ApiResponse::success(IndicatorValues {
        indicator: name,
        state: params.state,
        count: values.len(),
        values,
    })))
}

pub async fn indicator_summary(
    Path(name): Path<String>,
    Query(params): Query<StateQuery>,
    State(service): State<Arc<IndicatorService>>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let summary = service
        .indicator_summary(&name, params.state.as_deref())
        .await?;
    Ok(Json(ApiResponse::success(summary)))
}

pub async fn municipality(
    Path(code): Path<String>,
    State(service): State<Arc<IndicatorService>>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let row = service.municipality(&code).await?;
    Ok(Json(ApiResponse::success(row)))
}

// Define all API routes
pub fn routes(service: Arc<IndicatorService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/indicators", get(list_indicators))
        .route("/api/indicators/{name}", get(indicator_values))
        .route("/api/indicators/{name}/summary", get(indicator_summary))
        .route("/api/municipalities/{code}", get(municipality))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}
