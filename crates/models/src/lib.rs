//! crisscross callout protocol: JSON bodies exchanged with a remote controller.
//!
//! Four POST endpoints, one per lifecycle verb. Every request wraps the
//! managed resource as `{"managed": ...}`; every response may carry an
//! `errMessage`, which is transported but carries no error semantics.

#![forbid(unsafe_code)]

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

pub use crisscross_core::{ConnectionDetails, ExternalCreation, ExternalObservation, ExternalUpdate};

/// Lifecycle verb and its endpoint path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Observe,
    Create,
    Update,
    Delete,
}

impl Verb {
    pub const ALL: [Verb; 4] = [Verb::Observe, Verb::Create, Verb::Update, Verb::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Observe => "observe",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Verb::Observe => "/observe",
            Verb::Create => "/create",
            Verb::Update => "/update",
            Verb::Delete => "/delete",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Request body shared by all verbs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedRequest<M> {
    pub managed: M,
}

/// Explicit `null` reads as the zero value, like an absent field.
fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

pub type ObservationRequest<M> = ManagedRequest<M>;
pub type CreationRequest<M> = ManagedRequest<M>;
pub type UpdateRequest<M> = ManagedRequest<M>;
pub type DeletionRequest<M> = ManagedRequest<M>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationResponse {
    #[serde(rename = "externalObservation", default, deserialize_with = "null_as_default")]
    pub external: ExternalObservation,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub err_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationResponse {
    #[serde(rename = "externalCreation", default, deserialize_with = "null_as_default")]
    pub external: ExternalCreation,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub err_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResponse {
    #[serde(rename = "externalUpdate", default, deserialize_with = "null_as_default")]
    pub external: ExternalUpdate,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub err_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionResponse {
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    pub err_message: String,
}

/// A response body bound to the verb that produces it.
pub trait CalloutResponse: DeserializeOwned + Send {
    const VERB: Verb;

    fn err_message(&self) -> Option<&str>;
}

macro_rules! callout_response {
    ($ty:ty, $verb:expr) => {
        impl CalloutResponse for $ty {
            const VERB: Verb = $verb;

            fn err_message(&self) -> Option<&str> {
                if self.err_message.is_empty() { None } else { Some(&self.err_message) }
            }
        }
    };
}

callout_response!(ObservationResponse, Verb::Observe);
callout_response!(CreationResponse, Verb::Create);
callout_response!(UpdateResponse, Verb::Update);
callout_response!(DeletionResponse, Verb::Delete);
