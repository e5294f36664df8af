//! HTTP API of the relay: batch streams and the share directory

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use groupmove::sync::channel::{BatchReceipt, PublishReceipt, ReceiveQuery};
use groupmove::{ChangeBatch, Delivery, ParticipantId, PropertyId, ShareToken};
use tracing::{info, warn};

use crate::db::MAX_READ_LIMIT;
use crate::AppState;

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

/// Create the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/streams/{property}/batches", post(append_batch).get(read_batches))
        .route("/participants/{participant}/streams", get(participant_streams))
        .route("/shares", post(publish_share))
        .route("/shares/{token}", get(resolve_share))
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "ok"
}

fn internal(e: &anyhow::Error) -> (StatusCode, String) {
    warn!(error = %e, "Request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, (StatusCode, String)> {
    raw.parse().map_err(|_| (StatusCode::BAD_REQUEST, format!("Invalid {what}")))
}

/// Append a batch to a property stream
async fn append_batch(
    State(state): State<Arc<AppState>>,
    Path(property): Path<String>,
    Json(batch): Json<ChangeBatch>,
) -> ApiResult<BatchReceipt> {
    let property: PropertyId = parse_id(&property, "property id")?;
    if batch.property != property {
        warn!(stream = %property, batch = %batch.property, "Batch sent to the wrong stream");
        return Err((StatusCode::BAD_REQUEST, "Batch property does not match stream".to_string()));
    }

    let seq = state.db.append(&batch).map_err(|e| internal(&e))?;
    Ok(Json(BatchReceipt { seq }))
}

/// Read batches after a cursor
async fn read_batches(
    State(state): State<Arc<AppState>>,
    Path(property): Path<String>,
    Query(query): Query<ReceiveQuery>,
) -> ApiResult<Vec<Delivery>> {
    let property: PropertyId = parse_id(&property, "property id")?;
    let limit = query.limit.unwrap_or(MAX_READ_LIMIT);
    let deliveries = state.db.batches_after(property, query.after, limit).map_err(|e| internal(&e))?;
    Ok(Json(deliveries))
}

/// Streams a participant has written to
async fn participant_streams(
    State(state): State<Arc<AppState>>,
    Path(participant): Path<String>,
) -> ApiResult<Vec<PropertyId>> {
    let participant: ParticipantId = parse_id(&participant, "participant id")?;
    let streams = state.db.streams_of(participant).map_err(|e| internal(&e))?;
    Ok(Json(streams))
}

/// Park an invitation until it is redeemed
async fn publish_share(
    State(state): State<Arc<AppState>>,
    Json(invitation): Json<serde_json::Value>,
) -> ApiResult<PublishReceipt> {
    if !invitation.is_object() {
        return Err((StatusCode::BAD_REQUEST, "Invitation must be a JSON object".to_string()));
    }
    let token = state.db.put_share(&invitation).map_err(|e| internal(&e))?;
    info!(token = %token, "Share published");
    Ok(Json(PublishReceipt { token: ShareToken::new(token) }))
}

/// Look up an invitation by token
async fn resolve_share(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> ApiResult<serde_json::Value> {
    match state.db.get_share(&token).map_err(|e| internal(&e))? {
        Some(invitation) => Ok(Json(invitation)),
        None => Err((StatusCode::NOT_FOUND, "Unknown share token".to_string())),
    }
}
