//! crisscross core types: the four-verb managed lifecycle and its capabilities.
//!
//! A managed resource is observed, created, updated and deleted in some
//! external system. Transports (HTTP callouts today) supply an
//! [`ExternalClient`] through a [`Connector`]; reconcilers only see the traits.

#![forbid(unsafe_code)]

use std::time::Instant;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

mod details;

pub use details::ConnectionDetails;

/// The result of observing an external resource.
///
/// Zero-valued fields are omitted on the wire and read back as `false`/empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalObservation {
    #[serde(skip_serializing_if = "is_false")]
    pub resource_exists: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub resource_up_to_date: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub resource_late_initialized: bool,
    #[serde(skip_serializing_if = "ConnectionDetails::is_empty")]
    pub connection_details: ConnectionDetails,
}

/// The result of creating an external resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalCreation {
    #[serde(skip_serializing_if = "ConnectionDetails::is_empty")]
    pub connection_details: ConnectionDetails,
}

/// The result of updating an external resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalUpdate {
    #[serde(skip_serializing_if = "ConnectionDetails::is_empty")]
    pub connection_details: ConnectionDetails,
}

fn is_false(b: &bool) -> bool { !*b }

/// Four-verb lifecycle of one managed resource in an external system.
#[async_trait::async_trait]
pub trait ExternalClient: Send + Sync {
    async fn observe(&self, mg: &DynamicObject) -> anyhow::Result<ExternalObservation>;
    async fn create(&self, mg: &DynamicObject) -> anyhow::Result<ExternalCreation>;
    async fn update(&self, mg: &DynamicObject) -> anyhow::Result<ExternalUpdate>;
    async fn delete(&self, mg: &DynamicObject) -> anyhow::Result<()>;
}

/// Produces an [`ExternalClient`] for one reconcile of a managed resource.
///
/// `deadline` is the caller's wall-clock budget; every call made through the
/// returned client must finish before it.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, mg: &DynamicObject, deadline: Instant) -> anyhow::Result<Box<dyn ExternalClient>>;
}

pub mod prelude {
    pub use super::{ConnectionDetails, Connector, ExternalClient, ExternalCreation, ExternalObservation, ExternalUpdate};
}
