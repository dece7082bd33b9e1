use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use ulid::Ulid;

use crate::model::*;
use crate::store::StoreError;
use crate::sync::SyncOrchestrator;

use super::signature::SIGNATURE_HEADER;
use super::{IngestError, IngestOutcome, IngestPipeline};

const LEGACY_SIGNATURE_HEADER: &str = "x-hub-signature";

#[derive(Clone)]
struct AppState {
    pipeline: Arc<IngestPipeline>,
    orchestrator: Arc<SyncOrchestrator>,
}

/// `POST /webhooks/{channel}`, `GET /health`, `POST /properties/{property_id}/sync`,
/// `POST /mappings`, `DELETE /mappings/{id}`.
pub fn router(pipeline: Arc<IngestPipeline>, orchestrator: Arc<SyncOrchestrator>) -> axum::Router {
    // Oversized bodies still reach the handler so the 413 carries the pipeline's message.
    let body_limit = pipeline.max_payload_bytes().saturating_add(1);
    axum::Router::new()
        .route("/webhooks/{channel}", post(webhook_handler))
        .route("/health", get(health_handler))
        .route("/properties/{property_id}/sync", post(sync_handler))
        .route("/mappings", post(link_handler))
        .route("/mappings/{id}", delete(unlink_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(AppState {
            pipeline,
            orchestrator,
        })
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

async fn webhook_handler(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let channel = match channel.parse::<ChannelName>() {
        Ok(c) => c,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .or_else(|| headers.get(LEGACY_SIGNATURE_HEADER))
        .and_then(|v| v.to_str().ok());

    match state.pipeline.ingest(channel, &body, signature).await {
        Ok(IngestOutcome::Accepted(id)) => {
            (StatusCode::OK, Json(json!({ "status": "accepted", "eventId": id.to_string() })))
                .into_response()
        }
        Ok(IngestOutcome::Duplicate(id)) => {
            (StatusCode::OK, Json(json!({ "status": "duplicate", "eventId": id.to_string() })))
                .into_response()
        }
        Err(err) => {
            let status = match err {
                IngestError::Signature | IngestError::MissingSecret(_) => StatusCode::UNAUTHORIZED,
                IngestError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                IngestError::Malformed(_) => StatusCode::BAD_REQUEST,
                IngestError::Store(_) | IngestError::Bus(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, err)
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let registry = state.orchestrator.registry();
    let mut channels = BTreeMap::new();
    for channel in registry.channels() {
        if let Some(connector) = registry.get_connector(channel) {
            channels.insert(channel.as_str(), connector.check_health(None).await);
        }
    }
    Json(json!({
        "status": "ok",
        "webhookEvents": state.pipeline.log().len(),
        "channels": channels,
    }))
    .into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    org_id: OrgId,
    from: NaiveDate,
    to: NaiveDate,
}

async fn sync_handler(
    State(state): State<AppState>,
    Path(property_id): Path<PropertyId>,
    Json(req): Json<SyncRequest>,
) -> Response {
    if req.from >= req.to {
        return error_response(StatusCode::BAD_REQUEST, "from must be before to");
    }
    let range = DateRange::new(req.from, req.to);
    let results = state
        .orchestrator
        .sync_property(property_id, range, req.org_id)
        .await;
    let results: BTreeMap<&str, SyncResult> = results
        .into_iter()
        .map(|(channel, result)| (channel.as_str(), result))
        .collect();
    (StatusCode::OK, Json(json!({ "propertyId": property_id, "results": results }))).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkRequest {
    property_id: PropertyId,
    org_id: OrgId,
    channel: String,
    listing_id: Option<String>,
    #[serde(default)]
    auto_push_pricing: bool,
    #[serde(default)]
    auto_create_intervention: bool,
}

fn mapping_json(m: &ChannelMapping) -> serde_json::Value {
    json!({
        "id": m.id.to_string(),
        "propertyId": m.property_id,
        "orgId": m.org_id,
        "channel": m.channel.as_str(),
        "listingId": m.external_listing_id,
        "syncEnabled": m.sync_enabled,
        "autoPushPricing": m.auto_push_pricing,
        "autoCreateIntervention": m.auto_create_intervention,
        "lastSyncAt": m.last_sync_at,
    })
}

fn store_error_response(err: StoreError) -> Response {
    let status = match err {
        StoreError::Duplicate(_) => StatusCode::CONFLICT,
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
        StoreError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err)
}

/// Link a property to a channel listing. Every linked property also gets
/// its implicit direct-channel mapping.
async fn link_handler(State(state): State<AppState>, Json(req): Json<LinkRequest>) -> Response {
    let channel = match req.channel.parse::<ChannelName>() {
        Ok(c) => c,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let mappings = state.orchestrator.mappings();
    let direct = match mappings.ensure_direct(req.property_id, req.org_id).await {
        Ok(m) => m,
        Err(e) => return store_error_response(e),
    };
    if channel == ChannelName::Direct {
        return (StatusCode::CREATED, Json(mapping_json(&direct))).into_response();
    }

    let Some(listing_id) = req.listing_id else {
        return error_response(StatusCode::BAD_REQUEST, "listingId is required");
    };
    let mut mapping = ChannelMapping::new(req.property_id, req.org_id, channel, listing_id)
        .with_auto_push_pricing(req.auto_push_pricing);
    mapping.auto_create_intervention = req.auto_create_intervention;
    match mappings.upsert(mapping).await {
        Ok(stored) => (StatusCode::CREATED, Json(mapping_json(&stored))).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn unlink_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match id.parse::<Ulid>() {
        Ok(id) => id,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    match state.orchestrator.mappings().remove(id).await {
        Ok(removed) => {
            tracing::info!(property_id = removed.property_id, channel = %removed.channel, "mapping unlinked");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => store_error_response(e),
    }
}
