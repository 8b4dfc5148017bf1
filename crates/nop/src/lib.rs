//! nop-paaf: a remote controller that reports every resource as existing and up to date
//! enough, and does nothing on create, update or delete.

#![forbid(unsafe_code)]

use axum::body::Bytes;
use axum::routing::post;
use axum::{Json, Router};
use crisscross_core::ExternalObservation;
use crisscross_models::{CreationResponse, DeletionResponse, ObservationResponse, UpdateResponse, Verb};
use tracing::info;

pub const DEFAULT_PORT: &str = "8081";

/// The four callout routes.
pub fn router() -> Router {
    Router::new()
        .route(Verb::Observe.path(), post(observe))
        .route(Verb::Create.path(), post(create))
        .route(Verb::Update.path(), post(update))
        .route(Verb::Delete.path(), post(delete))
}

async fn observe(body: Bytes) -> Json<ObservationResponse> {
    info!(bytes = body.len(), "received observation");
    Json(ObservationResponse {
        external: ExternalObservation { resource_exists: true, ..Default::default() },
        ..Default::default()
    })
}

async fn create(body: Bytes) -> Json<CreationResponse> {
    info!(bytes = body.len(), "received create");
    Json(CreationResponse::default())
}

async fn update(body: Bytes) -> Json<UpdateResponse> {
    info!(bytes = body.len(), "received update");
    Json(UpdateResponse::default())
}

async fn delete(body: Bytes) -> Json<DeletionResponse> {
    info!(bytes = body.len(), "received delete");
    Json(DeletionResponse::default())
}
