//! HTTPRoute reconciler driving the instance's route table

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::finalizer::{finalizer, Event};
use kube_runtime::{watcher, Controller};
use portico_api::HTTPRoute;
use portico_core::Instance;
use tracing::{debug, error, info};

const FINALIZER: &str = "gateway.portico.dev/route-table";

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("gateway error: {0}")]
    Gateway(#[from] portico_core::GatewayError),

    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube_runtime::finalizer::Error<ReconcileError>>),
}

struct Context {
    client: Client,
    instance: Arc<Instance>,
}

async fn reconcile(
    route: Arc<HTTPRoute>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let namespace = route.namespace().unwrap_or_default();
    let name = route.name_any();
    info!("reconciling HTTPRoute {}/{}", namespace, name);

    let api: Api<HTTPRoute> = Api::namespaced(ctx.client.clone(), &namespace);
    let ctx = ctx.clone();
    finalizer(&api, FINALIZER, route, |event| async move {
        match event {
            Event::Apply(route) => {
                ctx.instance
                    .update_route(Some(&ctx.client), &route)
                    .await?;
                Ok(Action::requeue(Duration::from_secs(300)))
            }
            Event::Cleanup(route) => {
                ctx.instance.delete_route(&route).await?;
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|err| ReconcileError::Finalizer(Box::new(err)))
}

fn error_policy(route: Arc<HTTPRoute>, err: &ReconcileError, _ctx: Arc<Context>) -> Action {
    error!(
        "error reconciling HTTPRoute {}/{}: {}",
        route.namespace().unwrap_or_default(),
        route.name_any(),
        err
    );
    Action::requeue(Duration::from_secs(60))
}

/// Watch HTTPRoute objects and keep the route table in sync. Runs
/// until the watch stream ends.
pub async fn run(client: Client, instance: Arc<Instance>) -> anyhow::Result<()> {
    info!("starting HTTPRoute reconciliation");

    let routes: Api<HTTPRoute> = Api::all(client.clone());
    let context = Arc::new(Context { client, instance });

    Controller::new(routes, watcher::Config::default())
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok(_) => debug!("reconciled HTTPRoute successfully"),
                Err(err) => error!("error in reconciliation stream: {}", err),
            }
        })
        .await;

    Ok(())
}
