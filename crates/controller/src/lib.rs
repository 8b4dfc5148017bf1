//! crisscross controller: the `Registration` CRD and the reconciler that turns each Registration
//! into a running managed resource controller.
//!
//! One Registration maps to exactly one engine entry named `managed/<registration name>`.
//! The entry is (re)started whenever the Registration changes and stopped before the
//! Registration's finalizer is released.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crisscross_engine::Engine;
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

pub mod apis;
pub mod capabilities;
mod reconciler;

pub use apis::{Registration, RegistrationSpec, RegistrationStatus, TypeReference};
pub use capabilities::{
    ApiFinalizer, EventRecorder, Finalizer, KubeManaged, KubeRecorder, KubeStore, ManagedFactory, NopRecorder, Notice,
    RegistrationStore, Severity, StoreError,
};
pub use reconciler::{ReconcileError, RegistrationReconciler};

/// Name this controller reports events and logs under.
pub const CONTROLLER_NAME: &str = "crisscross/registration";
pub const FINALIZER: &str = "defined.apiextensions.crossplane.io";

pub const REASON_ESTABLISH: &str = "EstablishComposite";
pub const REASON_TERMINATE: &str = "TerminateManagedController";

pub const TINY_WAIT: Duration = Duration::from_secs(3);
pub const SHORT_WAIT: Duration = Duration::from_secs(30);
pub const TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const MAX_CONCURRENCY: u16 = 5;

/// Engine entry name for the Registration called `registration`.
pub fn controller_name(registration: &str) -> String { format!("managed/{}", registration) }

#[derive(Debug, Clone)]
pub struct Config {
    /// Concurrency of each managed resource controller.
    pub managed_concurrency: u16,
    /// How often an up to date managed resource is observed again.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self { Self { managed_concurrency: 1, poll_interval: Duration::from_secs(60) } }
}

async fn reconcile(reg: Arc<Registration>, ctx: Arc<RegistrationReconciler>) -> Result<Action, ReconcileError> {
    ctx.reconcile(&reg.name_any()).await
}

fn error_policy(reg: Arc<Registration>, err: &ReconcileError, _ctx: Arc<RegistrationReconciler>) -> Action {
    warn!(registration = %reg.name_any(), error = %err, "reconcile failed; requeueing");
    Action::requeue(SHORT_WAIT)
}

/// Watch Registrations until a shutdown signal arrives, then stop every managed controller.
pub async fn run(client: Client, engine: Engine, config: Config) -> Result<()> {
    let api: Api<Registration> = Api::all(client.clone());
    api.list(&ListParams::default().limit(1))
        .await
        .context("listing Registrations (is the CRD installed? try `crisscross crd | kubectl apply -f -`)")?;

    let store = Arc::new(KubeStore::new(api.clone()));
    let managed = Arc::new(KubeManaged::new(config.managed_concurrency, config.poll_interval));
    let recorder = Arc::new(KubeRecorder::new(client, CONTROLLER_NAME));
    let reconciler = Arc::new(
        RegistrationReconciler::new(store, Arc::new(engine.clone()), managed).with_recorder(recorder),
    );

    info!(controller = CONTROLLER_NAME, concurrency = MAX_CONCURRENCY, "starting registration controller");
    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(MAX_CONCURRENCY))
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(registration = %obj.name, ?action, "reconciled"),
                Err(e) => debug!(error = %e, "registration reconcile failed"),
            }
        })
        .await;

    info!(running = engine.running().len(), "shutting down managed resource controllers");
    engine.stop_all().await;
    Ok(())
}
