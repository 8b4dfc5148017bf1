//! What the registration reconciler needs from the outside world, each with a kube-backed implementation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crisscross_client::HttpConnector;
use crisscross_engine::{Options, Watch};
use crisscross_managed::ManagedReconciler;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::warn;

use crate::apis::Registration;
use crate::controller_name;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict writing Registration {0}: resourceVersion is stale")]
    Conflict(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl StoreError {
    fn from_write(name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(name.to_string()),
            other => StoreError::Kube(other),
        }
    }
}

/// Reads and writes Registrations with optimistic concurrency on `resourceVersion`.
#[async_trait::async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Registration>, StoreError>;
    /// Replace metadata and spec; returns the stored object.
    async fn update(&self, reg: &Registration) -> Result<Registration, StoreError>;
    /// Write `reg.status`; returns the stored object.
    async fn update_status(&self, reg: &Registration) -> Result<Registration, StoreError>;
}

pub struct KubeStore {
    api: Api<Registration>,
}

impl KubeStore {
    pub fn new(api: Api<Registration>) -> Self { Self { api } }
}

#[async_trait::async_trait]
impl RegistrationStore for KubeStore {
    async fn get(&self, name: &str) -> Result<Option<Registration>, StoreError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn update(&self, reg: &Registration) -> Result<Registration, StoreError> {
        let name = reg.name_any();
        self.api.replace(&name, &PostParams::default(), reg).await.map_err(|e| StoreError::from_write(&name, e))
    }

    async fn update_status(&self, reg: &Registration) -> Result<Registration, StoreError> {
        let name = reg.name_any();
        // resourceVersion in a merge patch makes the write conditional.
        let patch = json!({
            "metadata": { "resourceVersion": reg.resource_version() },
            "status": reg.status,
        });
        self.api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_write(&name, e))
    }
}

/// Adds or removes one finalizer; no-op when already in the desired state.
#[async_trait::async_trait]
pub trait Finalizer: Send + Sync {
    async fn add_finalizer(&self, reg: &mut Registration) -> Result<(), StoreError>;
    async fn remove_finalizer(&self, reg: &mut Registration) -> Result<(), StoreError>;
}

pub struct ApiFinalizer {
    store: Arc<dyn RegistrationStore>,
    finalizer: String,
}

impl ApiFinalizer {
    pub fn new(store: Arc<dyn RegistrationStore>, finalizer: impl Into<String>) -> Self {
        Self { store, finalizer: finalizer.into() }
    }
}

#[async_trait::async_trait]
impl Finalizer for ApiFinalizer {
    async fn add_finalizer(&self, reg: &mut Registration) -> Result<(), StoreError> {
        if reg.finalizers().iter().any(|f| f == &self.finalizer) {
            return Ok(());
        }
        reg.finalizers_mut().push(self.finalizer.clone());
        *reg = self.store.update(reg).await?;
        Ok(())
    }

    async fn remove_finalizer(&self, reg: &mut Registration) -> Result<(), StoreError> {
        if !reg.finalizers().iter().any(|f| f == &self.finalizer) {
            return Ok(());
        }
        reg.finalizers_mut().retain(|f| f != &self.finalizer);
        *reg = self.store.update(reg).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

/// An event about one Registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub severity: Severity,
    pub reason: &'static str,
    pub note: String,
}

impl Notice {
    pub fn normal(reason: &'static str, note: impl Into<String>) -> Self {
        Self { severity: Severity::Normal, reason, note: note.into() }
    }

    pub fn warning(reason: &'static str, note: impl Into<String>) -> Self {
        Self { severity: Severity::Warning, reason, note: note.into() }
    }
}

/// Best effort: publishing never fails the reconcile.
#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, reg: &Registration, notice: Notice);
}

/// Discards everything.
pub struct NopRecorder;

#[async_trait::async_trait]
impl EventRecorder for NopRecorder {
    async fn publish(&self, _reg: &Registration, _notice: Notice) {}
}

/// Writes core/v1 Events through `kube::runtime::events`.
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(client: Client, controller: &str) -> Self {
        Self { client, reporter: Reporter { controller: controller.to_string(), instance: std::env::var("HOSTNAME").ok() } }
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeRecorder {
    async fn publish(&self, reg: &Registration, notice: Notice) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reg.object_ref(&()));
        let type_ = match notice.severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        };
        let event = Event {
            type_,
            reason: notice.reason.to_string(),
            note: Some(notice.note),
            action: notice.reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(registration = %reg.name_any(), reason = notice.reason, error = %e, "failed to publish event");
        }
    }
}

/// Turns a Registration into the options and watch target of its engine entry.
pub trait ManagedFactory: Send + Sync {
    fn build(&self, reg: &Registration) -> Result<(Options, Watch)>;
}

/// Managed reconcilers calling out over HTTP to the registered endpoint.
#[derive(Debug, Clone)]
pub struct KubeManaged {
    concurrency: u16,
    poll_interval: Duration,
}

impl Default for KubeManaged {
    fn default() -> Self { Self { concurrency: 1, poll_interval: Duration::from_secs(60) } }
}

impl KubeManaged {
    pub fn new(concurrency: u16, poll_interval: Duration) -> Self { Self { concurrency, poll_interval } }
}

impl ManagedFactory for KubeManaged {
    fn build(&self, reg: &Registration) -> Result<(Options, Watch)> {
        let watch = Watch::for_type(&reg.spec.type_ref.api_version, &reg.spec.type_ref.kind)?;
        let connector = HttpConnector::try_new(reg.spec.endpoint.clone())?;
        let reconciler = ManagedReconciler::new(controller_name(&reg.name_any()), Arc::new(connector))
            .poll_interval(self.poll_interval);
        let options = Options::new(Arc::new(reconciler)).max_concurrent_reconciles(self.concurrency);
        Ok((options, watch))
    }
}
