use std::sync::Arc;
use std::time::{Duration, Instant};

use crisscross_engine::ControllerEngine;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::apis::{Registration, RegistrationStatus};
use crate::capabilities::{
    ApiFinalizer, EventRecorder, Finalizer, ManagedFactory, NopRecorder, Notice, RegistrationStore, StoreError,
};
use crate::{
    controller_name, FINALIZER, REASON_ESTABLISH, REASON_TERMINATE, SHORT_WAIT, TIMEOUT, TINY_WAIT,
};

const ERR_ADD_FINALIZER: &str = "cannot add finalizer to Registration";
const ERR_REMOVE_FINALIZER: &str = "cannot remove finalizer from Registration";
const ERR_START_CONTROLLER: &str = "cannot start managed resource controller";

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("cannot get Registration: {0}")]
    Get(StoreError),
    #[error("cannot update Registration status: {0}")]
    UpdateStatus(StoreError),
    #[error("reconcile of Registration {name} exceeded {after:?}")]
    Timeout { name: String, after: Duration },
}

/// Keeps one engine entry per Registration in step with the Registration.
pub struct RegistrationReconciler {
    store: Arc<dyn RegistrationStore>,
    finalizer: Arc<dyn Finalizer>,
    engine: Arc<dyn ControllerEngine>,
    managed: Arc<dyn ManagedFactory>,
    recorder: Arc<dyn EventRecorder>,
    timeout: Duration,
}

impl RegistrationReconciler {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        engine: Arc<dyn ControllerEngine>,
        managed: Arc<dyn ManagedFactory>,
    ) -> Self {
        let finalizer = Arc::new(ApiFinalizer::new(store.clone(), FINALIZER));
        Self { store, finalizer, engine, managed, recorder: Arc::new(NopRecorder), timeout: TIMEOUT }
    }

    pub fn with_finalizer(mut self, finalizer: Arc<dyn Finalizer>) -> Self {
        self.finalizer = finalizer;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reconcile the Registration called `name`, abandoning the work once the timeout passes.
    pub async fn reconcile(&self, name: &str) -> Result<Action, ReconcileError> {
        let t0 = Instant::now();
        let res = match tokio::time::timeout(self.timeout, self.reconcile_inner(name)).await {
            Ok(res) => res,
            Err(_) => Err(ReconcileError::Timeout { name: name.to_string(), after: self.timeout }),
        };
        let outcome = match &res {
            Ok(_) => "ok",
            Err(ReconcileError::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        counter!("registration_reconcile_total", 1u64, "outcome" => outcome);
        histogram!("registration_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    }

    async fn reconcile_inner(&self, name: &str) -> Result<Action, ReconcileError> {
        debug!(request = %name, "Reconciling");
        let Some(mut reg) = self.store.get(name).await.map_err(ReconcileError::Get)? else {
            debug!(request = %name, "Registration not found");
            return Ok(Action::await_change());
        };
        let controller = controller_name(name);

        if reg.metadata.deletion_timestamp.is_some() {
            return Ok(self.terminate(&mut reg, &controller).await);
        }

        if let Err(e) = self.finalizer.add_finalizer(&mut reg).await {
            debug!(request = %name, error = %e, "{}", ERR_ADD_FINALIZER);
            self.recorder.publish(&reg, Notice::warning(REASON_ESTABLISH, format!("{ERR_ADD_FINALIZER}: {e}"))).await;
            return Ok(Action::requeue(SHORT_WAIT));
        }

        if let Some(err) = self.engine.err(&controller) {
            debug!(request = %name, controller = %controller, error = %err, "Managed resource controller encountered an error");
        }

        let started = match self.managed.build(&reg) {
            Ok((options, watch)) => self.engine.start(&controller, options, watch).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            debug!(request = %name, controller = %controller, error = %format!("{e:#}"), "{}", ERR_START_CONTROLLER);
            let note = format!("{ERR_START_CONTROLLER}: {e:#}");
            self.recorder.publish(&reg, Notice::warning(REASON_ESTABLISH, note)).await;
            return Ok(Action::requeue(SHORT_WAIT));
        }

        info!(request = %name, controller = %controller, kind = %reg.spec.type_ref.kind, "(Re)started managed resource controller");
        self.recorder.publish(&reg, Notice::normal(REASON_ESTABLISH, "(Re)started managed resource controller")).await;

        if let Some(status) = next_status(&reg, &controller) {
            reg.status = Some(status);
            self.store.update_status(&reg).await.map_err(ReconcileError::UpdateStatus)?;
        }
        Ok(Action::await_change())
    }

    async fn terminate(&self, reg: &mut Registration, controller: &str) -> Action {
        self.engine.stop(controller).await;
        debug!(request = %reg.name_any(), controller = %controller, "Stopped managed resource controller");
        self.recorder.publish(reg, Notice::normal(REASON_TERMINATE, "Stopped managed resource controller")).await;

        if !self.engine.is_running(controller) {
            if let Err(e) = self.finalizer.remove_finalizer(reg).await {
                debug!(request = %reg.name_any(), error = %e, "{}", ERR_REMOVE_FINALIZER);
                self.recorder.publish(reg, Notice::warning(REASON_TERMINATE, format!("{ERR_REMOVE_FINALIZER}: {e}"))).await;
            }
        }
        Action::requeue(TINY_WAIT)
    }
}

/// Status after a successful start, or None when nothing it reports has changed.
fn next_status(reg: &Registration, controller: &str) -> Option<RegistrationStatus> {
    let current = reg.status.clone().unwrap_or_default();
    let mut next = RegistrationStatus {
        controller: Some(controller.to_string()),
        endpoint: Some(reg.spec.endpoint.clone()),
        observed_generation: reg.metadata.generation,
        last_started: current.last_started.clone(),
    };
    if next == current && current.last_started.is_some() {
        return None;
    }
    next.last_started = Some(chrono::Utc::now().to_rfc3339());
    Some(next)
}
