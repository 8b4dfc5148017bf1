//! crisscross managed reconciler: drives an external client from watch events of one kind.
//!
//! Per object: make sure it carries its external name and finalizer, observe
//! the external resource, then create, update or delete it. Scheduling and
//! backoff belong to the surrounding controller loop.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crisscross_core::{ConnectionDetails, Connector};
use crisscross_engine::{ReconcileError, Reconciler, Target};
use kube::api::{Patch, PatchParams};
use kube::core::DynamicObject;
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use metrics::counter;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub const EXTERNAL_NAME_ANNOTATION: &str = "crossplane.io/external-name";
pub const MANAGED_FINALIZER: &str = "finalizer.managedresource.crisscross.crossplane.io";

const SHORT_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_POLL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Writes metadata of a managed object.
#[async_trait::async_trait]
pub trait MetadataPatcher: Send + Sync {
    /// Merge `metadata` into the object; fails on a resourceVersion conflict.
    async fn patch_metadata(&self, obj: &DynamicObject, metadata: Value) -> Result<DynamicObject>;
}

/// Patches through the API server.
pub struct ApiPatcher {
    api: Api<DynamicObject>,
}

impl ApiPatcher {
    pub fn new(api: Api<DynamicObject>) -> Self { Self { api } }
}

#[async_trait::async_trait]
impl MetadataPatcher for ApiPatcher {
    async fn patch_metadata(&self, obj: &DynamicObject, metadata: Value) -> Result<DynamicObject> {
        let name = obj.name_any();
        self.api
            .patch(&name, &PatchParams::default(), &Patch::Merge(json!({ "metadata": metadata })))
            .await
            .with_context(|| format!("patching metadata of {}", name))
    }
}

pub struct ManagedReconciler {
    controller: String,
    connector: Arc<dyn Connector>,
    poll_interval: Duration,
    timeout: Duration,
}

impl ManagedReconciler {
    pub fn new(controller: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self { controller: controller.into(), connector, poll_interval: DEFAULT_POLL, timeout: DEFAULT_TIMEOUT }
    }

    pub fn poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// One reconcile of `obj`, bounded by the configured timeout.
    pub async fn reconcile_object(&self, obj: &DynamicObject, patcher: &dyn MetadataPatcher) -> Result<Action> {
        let deadline = Instant::now() + self.timeout;
        match tokio::time::timeout(self.timeout, self.run(obj, patcher, deadline)).await {
            Ok(res) => res,
            Err(_) => Err(anyhow!("reconcile of {} exceeded {:?}", obj.name_any(), self.timeout)),
        }
    }

    async fn run(&self, obj: &DynamicObject, patcher: &dyn MetadataPatcher, deadline: Instant) -> Result<Action> {
        let name = obj.name_any();
        counter!("managed_reconcile_total", 1u64);

        if obj.metadata.deletion_timestamp.is_some() {
            if !has_finalizer(obj) {
                return Ok(Action::await_change());
            }
            let external = self.connector.connect(obj, deadline).await.context("connecting to external client")?;
            let observed = external.observe(obj).await.context("observing external resource")?;
            if observed.resource_exists {
                external.delete(obj).await.context("deleting external resource")?;
                info!(controller = %self.controller, name = %name, "deleted external resource");
                return Ok(Action::requeue(SHORT_WAIT));
            }
            let kept: Vec<&String> = obj.finalizers().iter().filter(|f| f.as_str() != MANAGED_FINALIZER).collect();
            patcher
                .patch_metadata(obj, json!({ "resourceVersion": obj.resource_version(), "finalizers": kept }))
                .await
                .context("removing finalizer")?;
            debug!(controller = %self.controller, name = %name, "external resource gone; finalizer removed");
            return Ok(Action::await_change());
        }

        let initialized;
        let obj = match initialize_patch(obj) {
            Some(patch) => {
                initialized = patcher.patch_metadata(obj, patch).await.context("initializing managed resource")?;
                debug!(controller = %self.controller, name = %name, "initialized managed resource");
                &initialized
            }
            None => obj,
        };

        let external = self.connector.connect(obj, deadline).await.context("connecting to external client")?;
        let observed = external.observe(obj).await.context("observing external resource")?;
        if !observed.resource_exists {
            let created = external.create(obj).await.context("creating external resource")?;
            log_details(&self.controller, &name, "create", &created.connection_details);
            info!(controller = %self.controller, name = %name, "created external resource");
            return Ok(Action::requeue(SHORT_WAIT));
        }
        log_details(&self.controller, &name, "observe", &observed.connection_details);
        if observed.resource_late_initialized {
            debug!(controller = %self.controller, name = %name, "external resource reported late initialization");
        }
        if !observed.resource_up_to_date {
            let updated = external.update(obj).await.context("updating external resource")?;
            log_details(&self.controller, &name, "update", &updated.connection_details);
            info!(controller = %self.controller, name = %name, "updated external resource");
        }
        Ok(Action::requeue(self.poll_interval))
    }
}

fn has_finalizer(obj: &DynamicObject) -> bool { obj.finalizers().iter().any(|f| f == MANAGED_FINALIZER) }

/// Metadata patch that adds the external name and finalizer, if either is missing.
fn initialize_patch(obj: &DynamicObject) -> Option<Value> {
    let needs_name = !obj.annotations().contains_key(EXTERNAL_NAME_ANNOTATION);
    let needs_finalizer = !has_finalizer(obj);
    if !needs_name && !needs_finalizer {
        return None;
    }
    let mut meta = json!({ "resourceVersion": obj.resource_version() });
    if needs_name {
        meta["annotations"] = json!({ EXTERNAL_NAME_ANNOTATION: obj.name_any() });
    }
    if needs_finalizer {
        let mut finalizers = obj.finalizers().to_vec();
        finalizers.push(MANAGED_FINALIZER.to_string());
        meta["finalizers"] = json!(finalizers);
    }
    Some(meta)
}

// Publishing to a secret store is not supported; only the keys are logged.
fn log_details(controller: &str, name: &str, verb: &str, details: &ConnectionDetails) {
    if !details.is_empty() {
        let keys: Vec<&str> = details.keys().collect();
        debug!(controller = %controller, name = %name, verb, keys = ?keys, "connection details not published");
    }
}

#[async_trait::async_trait]
impl Reconciler for ManagedReconciler {
    async fn reconcile(&self, obj: Arc<DynamicObject>, target: &Target) -> Result<Action, ReconcileError> {
        let patcher = ApiPatcher::new(target.api_for(&obj));
        Ok(self.reconcile_object(&obj, &patcher).await?)
    }

    fn error_policy(&self, obj: Arc<DynamicObject>, err: &ReconcileError) -> Action {
        warn!(controller = %self.controller, name = %obj.name_any(), error = %err, "managed reconcile failed");
        Action::requeue(SHORT_WAIT)
    }
}
