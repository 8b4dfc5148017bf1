//! Loop bodies backed by `kube::runtime::Controller` over `DynamicObject`.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::{FutureExt, StreamExt};
use kube::api::ListParams;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client};
use tracing::{debug, info, warn};

use crate::{LoopFactory, LoopFuture, LoopReporter, ReconcileError, SharedOptions, Target, Watch};

/// Resolves kinds through discovery and runs one controller per loop.
pub struct KubeLoops {
    client: Client,
}

impl KubeLoops {
    pub fn new(client: Client) -> Self { Self { client } }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).filter(&[gvk.group.as_str()]).run().await.context("running discovery")?;
    let (ar, caps) = discovery
        .resolve_gvk(gvk)
        .ok_or_else(|| anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))?;
    Ok((ar, matches!(caps.scope, Scope::Namespaced)))
}

struct LoopContext {
    options: SharedOptions,
    target: Target,
}

async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<LoopContext>) -> Result<Action, ReconcileError> {
    let options = ctx.options.load_full();
    options.reconciler.reconcile(obj, &ctx.target).await
}

fn error_policy(obj: Arc<DynamicObject>, err: &ReconcileError, ctx: Arc<LoopContext>) -> Action {
    ctx.options.load().reconciler.error_policy(obj, err)
}

#[async_trait::async_trait]
impl LoopFactory for KubeLoops {
    async fn build(&self, watch: &Watch, options: SharedOptions, reporter: LoopReporter) -> Result<LoopFuture> {
        let (ar, namespaced) = find_api_resource(self.client.clone(), &watch.gvk).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        // Surface missing list permission now instead of inside the loop.
        api.list_metadata(&ListParams::default().limit(1))
            .await
            .with_context(|| format!("listing {}", watch))?;

        let concurrency = options.load().max_concurrent_reconciles;
        let target = Target { client: self.client.clone(), resource: ar.clone(), namespaced };
        let ctx = Arc::new(LoopContext { options, target });
        let controller = Controller::new_with(api, watcher::Config::default(), ar)
            .with_config(controller::Config::default().concurrency(concurrency));
        let label = watch.to_string();
        info!(watch = %label, namespaced, concurrency, "engine: watch registered");

        let body = async move {
            controller
                .run(reconcile, error_policy, ctx)
                .for_each(|res| {
                    match res {
                        Ok((obj, action)) => debug!(watch = %label, object = %obj, ?action, "reconciled"),
                        Err(controller::Error::QueueError(e)) => {
                            warn!(watch = %label, error = %e, "watch failed");
                            reporter.error(anyhow::Error::new(e).context(format!("watching {}", label)));
                        }
                        Err(e) => debug!(watch = %label, error = %e, "reconcile failed"),
                    }
                    futures::future::ready(())
                })
                .await;
            Ok::<(), anyhow::Error>(())
        };
        Ok(body.boxed())
    }
}
