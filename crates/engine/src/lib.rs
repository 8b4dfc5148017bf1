//! crisscross engine: start, hot-swap, stop and inspect named watch loops at runtime.
//!
//! Each entry watches one kind and hands every change to the [`Reconciler`]
//! held in its [`Options`]. The registry is an owned [`Engine`] handle, so
//! tests and binaries can run independent engines side by side.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::controller::Action;
use kube::{Api, Client};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod kube_loops;

pub use kube_loops::KubeLoops;

/// The kind a loop watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Watch {
    pub gvk: GroupVersionKind,
}

impl Watch {
    pub fn new(gvk: GroupVersionKind) -> Self { Self { gvk } }

    /// Build from a type reference such as `("example.org/v1", "Bucket")` or `("v1", "ConfigMap")`.
    pub fn for_type(api_version: &str, kind: &str) -> Result<Self> {
        let (group, version) = match api_version.split('/').collect::<Vec<_>>().as_slice() {
            [version] => (String::new(), (*version).to_string()),
            [group, version] if !group.is_empty() => ((*group).to_string(), (*version).to_string()),
            _ => return Err(anyhow!("invalid apiVersion: {} (expect v1 or group/v1)", api_version)),
        };
        if version.is_empty() || kind.is_empty() {
            return Err(anyhow!("type reference needs both apiVersion and kind (got {:?}, {:?})", api_version, kind));
        }
        Ok(Self { gvk: GroupVersionKind { group, version, kind: kind.to_string() } })
    }
}

impl fmt::Display for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.gvk.group.is_empty() {
            write!(f, "{}/{}", self.gvk.version, self.gvk.kind)
        } else {
            write!(f, "{}/{}/{}", self.gvk.group, self.gvk.version, self.gvk.kind)
        }
    }
}

/// Where a loop's objects live; handed to the reconciler on every call.
#[derive(Clone)]
pub struct Target {
    pub client: Client,
    pub resource: ApiResource,
    pub namespaced: bool,
}

impl Target {
    /// Api scoped to the object's namespace (or cluster scope).
    pub fn api_for(&self, obj: &DynamicObject) -> Api<DynamicObject> {
        match (self.namespaced, obj.metadata.namespace.as_deref()) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            _ => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ReconcileError(#[from] pub anyhow::Error);

/// Per-object reconcile logic run by a loop.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, obj: Arc<DynamicObject>, target: &Target) -> Result<Action, ReconcileError>;

    fn error_policy(&self, _obj: Arc<DynamicObject>, _err: &ReconcileError) -> Action {
        Action::requeue(std::time::Duration::from_secs(30))
    }
}

/// Loop configuration. Swapping the reconciler keeps the watch open;
/// changing the concurrency needs a new loop.
#[derive(Clone)]
pub struct Options {
    pub reconciler: Arc<dyn Reconciler>,
    pub max_concurrent_reconciles: u16,
}

impl Options {
    pub fn new(reconciler: Arc<dyn Reconciler>) -> Self {
        Self { reconciler, max_concurrent_reconciles: 1 }
    }

    pub fn max_concurrent_reconciles(mut self, n: u16) -> Self {
        self.max_concurrent_reconciles = n.max(1);
        self
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options").field("max_concurrent_reconciles", &self.max_concurrent_reconciles).finish_non_exhaustive()
    }
}

/// Options as seen by a running loop; the engine swaps them in place.
pub type SharedOptions = Arc<ArcSwap<Options>>;

/// A loop body; resolves when the loop dies.
pub type LoopFuture = BoxFuture<'static, Result<()>>;

/// Builds loop bodies. Failures here (unknown kind, watch refused) are
/// returned to the `start` caller.
#[async_trait::async_trait]
pub trait LoopFactory: Send + Sync {
    async fn build(&self, watch: &Watch, options: SharedOptions, reporter: LoopReporter) -> Result<LoopFuture>;
}

#[derive(Default)]
struct LoopStatus {
    running: AtomicBool,
    generation: AtomicU64,
    last_err: Mutex<Option<Arc<anyhow::Error>>>,
}

impl LoopStatus {
    fn set_err(&self, err: Option<Arc<anyhow::Error>>) {
        *self.last_err.lock().unwrap_or_else(PoisonError::into_inner) = err;
    }
}

/// Lets a loop report fatal errors. Reports from a replaced or stopped
/// loop are discarded.
#[derive(Clone)]
pub struct LoopReporter {
    status: Arc<LoopStatus>,
    generation: u64,
}

impl LoopReporter {
    fn current(&self) -> bool { self.status.generation.load(Ordering::SeqCst) == self.generation }

    pub fn error(&self, err: anyhow::Error) {
        if self.current() {
            self.status.set_err(Some(Arc::new(err)));
        }
    }

    fn exited(&self) {
        if self.current() {
            self.status.running.store(false, Ordering::SeqCst);
        }
    }
}

struct Entry {
    watch: Watch,
    concurrency: u16,
    options: SharedOptions,
    task: JoinHandle<()>,
}

struct Slot {
    op: tokio::sync::Mutex<Option<Entry>>,
    status: Arc<LoopStatus>,
}

struct Inner {
    factory: Arc<dyn LoopFactory>,
    slots: Mutex<FxHashMap<String, Arc<Slot>>>,
}

/// Registry of named loops.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(factory: Arc<dyn LoopFactory>) -> Self {
        Self { inner: Arc::new(Inner { factory, slots: Mutex::new(FxHashMap::default()) }) }
    }

    /// Engine whose loops are kube controllers over dynamically resolved kinds.
    pub fn kube(client: Client) -> Self { Self::new(Arc::new(KubeLoops::new(client))) }

    fn slot(&self, name: &str) -> Arc<Slot> {
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Slot { op: tokio::sync::Mutex::new(None), status: Arc::default() }))
            .clone()
    }

    fn lookup(&self, name: &str) -> Option<Arc<Slot>> {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lookup(name).map(|s| s.status.running.load(Ordering::SeqCst)).unwrap_or(false)
    }

    /// Last fatal error of the named loop, if any.
    pub fn err(&self, name: &str) -> Option<Arc<anyhow::Error>> {
        let slot = self.lookup(name)?;
        let err = slot.status.last_err.lock().unwrap_or_else(PoisonError::into_inner).clone();
        err
    }

    /// Whether `slot` is still the one registered under `name`.
    fn is_registered(&self, name: &str, slot: &Arc<Slot>) -> bool {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner).get(name).is_some_and(|s| Arc::ptr_eq(s, slot))
    }

    /// Drop the slot of a name with no loop. Caller holds the slot's op lock.
    fn release(&self, name: &str, slot: &Arc<Slot>) {
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(name).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(name);
        }
    }

    /// Start the named loop, or hot-swap its options if it already watches `watch`.
    pub async fn start(&self, name: &str, options: Options, watch: Watch) -> Result<()> {
        loop {
            let slot = self.slot(name);
            let mut current = slot.op.lock().await;
            // A concurrent stop may have released this slot while we waited.
            if !self.is_registered(name, &slot) {
                continue;
            }
            return self.start_locked(name, &slot, &mut current, options, watch).await;
        }
    }

    async fn start_locked(
        &self,
        name: &str,
        slot: &Arc<Slot>,
        current: &mut Option<Entry>,
        options: Options,
        watch: Watch,
    ) -> Result<()> {
        if let Some(entry) = current.as_ref() {
            if !entry.task.is_finished() && entry.watch == watch && entry.concurrency == options.max_concurrent_reconciles {
                entry.options.store(Arc::new(options));
                slot.status.set_err(None);
                debug!(name = %name, watch = %watch, "engine: options swapped in place");
                return Ok(());
            }
        }

        let generation = slot.status.generation.load(Ordering::SeqCst) + 1;
        let reporter = LoopReporter { status: Arc::clone(&slot.status), generation };
        let concurrency = options.max_concurrent_reconciles;
        let shared: SharedOptions = Arc::new(ArcSwap::from_pointee(options));
        let body = match self.inner.factory.build(&watch, Arc::clone(&shared), reporter.clone()).await {
            Ok(body) => body,
            Err(e) => {
                if current.is_none() {
                    self.release(name, slot);
                }
                return Err(e.context(format!("starting controller {} for {}", name, watch)));
            }
        };

        // Replacement is live before the old loop goes away.
        slot.status.generation.store(generation, Ordering::SeqCst);
        slot.status.running.store(true, Ordering::SeqCst);
        slot.status.set_err(None);
        let task = tokio::spawn(run_loop(name.to_string(), body, reporter));
        let previous = current.replace(Entry { watch: watch.clone(), concurrency, options: shared, task });
        if let Some(old) = previous {
            old.task.abort();
            info!(name = %name, from = %old.watch, to = %watch, "engine: loop replaced");
        } else {
            info!(name = %name, watch = %watch, concurrency, "engine: loop started");
        }
        counter!("engine_loops_started_total", 1u64);
        Ok(())
    }

    /// Stop the named loop. Unknown or stopped names are a no-op.
    pub async fn stop(&self, name: &str) {
        let Some(slot) = self.lookup(name) else { return };
        let mut current = slot.op.lock().await;
        let taken = current.take();
        self.release(name, &slot);
        if let Some(entry) = taken {
            // Invalidate the reporter before aborting.
            slot.status.generation.fetch_add(1, Ordering::SeqCst);
            slot.status.running.store(false, Ordering::SeqCst);
            slot.status.set_err(None);
            entry.task.abort();
            info!(name = %name, watch = %entry.watch, "engine: loop stopped");
            counter!("engine_loops_stopped_total", 1u64);
        }
    }

    /// Stop every loop; used on shutdown.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        for name in names {
            self.stop(&name).await;
        }
    }

    /// Names of loops currently running, sorted.
    pub fn running(&self) -> Vec<String> {
        let slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<String> = slots
            .iter()
            .filter(|(_, s)| s.status.running.load(Ordering::SeqCst))
            .map(|(n, _)| n.clone())
            .collect();
        out.sort();
        out
    }
}

async fn run_loop(name: String, body: LoopFuture, reporter: LoopReporter) {
    match body.await {
        Ok(()) => {
            warn!(name = %name, "engine: loop ended");
            reporter.error(anyhow!("controller {} stopped unexpectedly", name));
        }
        Err(e) => {
            warn!(name = %name, error = %e, "engine: loop failed");
            reporter.error(e);
        }
    }
    reporter.exited();
}

/// What the registration reconciler needs from an engine.
#[async_trait::async_trait]
pub trait ControllerEngine: Send + Sync {
    fn is_running(&self, name: &str) -> bool;
    async fn start(&self, name: &str, options: Options, watch: Watch) -> Result<()>;
    async fn stop(&self, name: &str);
    fn err(&self, name: &str) -> Option<Arc<anyhow::Error>>;
}

#[async_trait::async_trait]
impl ControllerEngine for Engine {
    fn is_running(&self, name: &str) -> bool { Engine::is_running(self, name) }

    async fn start(&self, name: &str, options: Options, watch: Watch) -> Result<()> {
        Engine::start(self, name, options, watch).await
    }

    async fn stop(&self, name: &str) { Engine::stop(self, name).await }

    fn err(&self, name: &str) -> Option<Arc<anyhow::Error>> { Engine::err(self, name) }
}
