// SPDX-License-Identifier: MIT OR Apache-2.0
//! The level-triggered reconcile loop for `AsyncActor`.
//!
//! Every pass recomputes desired state from scratch and applies
//! minimum-necessary patches: finalizer, queue, workload, autoscaler,
//! status — in that order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use asya_transport::TransportError;

use crate::crd::{
    AsyncActor, AsyncActorStatus, Phase, ReplicaCounts, ScaleDirection, WorkloadKind, FINALIZER,
    GENERATION_ANNOTATION,
};
use crate::inject::{self, InjectError, InjectParams, ACTOR_LABEL};
use crate::keda::{build_scaled_object, ScaledObject};
use crate::queues::QueueProvisioner;
use crate::scripts::RuntimeScript;
use crate::status::{classify_failure, compute_phase, Observation, PodSignal};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "asya-operator";

/// Steady-state requeue period; status stays fresh even without watches
/// firing.
const REQUEUE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Context and errors
// ---------------------------------------------------------------------------

/// Operator-wide settings threaded into every reconcile.
#[derive(Debug, Clone)]
pub struct OperatorSettings {
    /// Default image for the injected sidecar.
    pub sidecar_image: String,
    /// Tracker base URL injected into sidecars, when configured.
    pub gateway_url: Option<String>,
    /// Base URL for SQS queue resolution.
    pub sqs_base_url: Option<String>,
}

/// Shared state for the controller.
pub struct Context {
    /// Kubernetes client.
    pub client: Client,
    /// Queue provisioning backend.
    pub queues: Arc<dyn QueueProvisioner>,
    /// Operator settings.
    pub settings: OperatorSettings,
    /// Canonical runtime script to distribute.
    pub script: RuntimeScript,
    /// When `ready < total` was first observed, per actor.
    degraded_since: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Context {
    /// Build a reconcile context.
    pub fn new(
        client: Client,
        queues: Arc<dyn QueueProvisioner>,
        settings: OperatorSettings,
        script: RuntimeScript,
    ) -> Self {
        Self {
            client,
            queues,
            settings,
            script,
            degraded_since: Mutex::new(HashMap::new()),
        }
    }
}

/// Reconciliation failures. Transient ones requeue with backoff.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// API server call failed.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    /// Queue provisioning or teardown failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The user workload spec failed admission.
    #[error("workload rejected: {0}")]
    Inject(#[from] InjectError),

    /// Finalizer bookkeeping failed.
    #[error("finalizer error: {0}")]
    Finalizer(String),

    /// Desired-state serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Server-side apply needs `apiVersion`/`kind` on the payload, which the
/// typed core objects do not serialize. Lift them from the resource
/// constants.
fn ssa_patch<T>(object: &T) -> Result<Patch<serde_json::Value>, Error>
where
    T: serde::Serialize + k8s_openapi::Resource,
{
    let mut value = serde_json::to_value(object)?;
    value["apiVersion"] = T::API_VERSION.into();
    value["kind"] = T::KIND.into();
    Ok(Patch::Apply(value))
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run the controller until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let actors = Api::<AsyncActor>::all(ctx.client.clone());
    let deployments = Api::<Deployment>::all(ctx.client.clone());
    let statefulsets = Api::<StatefulSet>::all(ctx.client.clone());

    Controller::new(actors, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(statefulsets, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async {
            match result {
                Ok((object, _)) => info!(target: "asya.operator", object = %object.name, "reconciled"),
                Err(e) => warn!(target: "asya.operator", error = %e, "reconcile failed"),
            }
        })
        .await;
}

/// One reconcile pass, wrapped in finalizer bookkeeping.
pub async fn reconcile(actor: Arc<AsyncActor>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = actor.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<AsyncActor> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER, actor, |event| async {
        match event {
            Event::Apply(actor) => apply(actor, &ctx).await,
            Event::Cleanup(actor) => cleanup(actor, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(e.to_string()))
}

/// Error policy: log and retry with a short backoff.
pub fn error_policy(actor: Arc<AsyncActor>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        target: "asya.operator",
        actor = %actor.name_any(),
        error = %error,
        "requeueing after error"
    );
    Action::requeue(Duration::from_secs(15))
}

// ---------------------------------------------------------------------------
// Apply path
// ---------------------------------------------------------------------------

async fn apply(actor: Arc<AsyncActor>, ctx: &Context) -> Result<Action, Error> {
    let name = actor.name_any();
    let namespace = actor.namespace().unwrap_or_else(|| "default".to_string());

    // Reserved sink names never reconcile into workloads.
    if asya_model::is_reserved_actor(&name) {
        warn!(target: "asya.operator", actor = %name, "rejecting reserved actor name");
        let status = AsyncActorStatus {
            phase: Some(Phase::WorkloadError),
            message: Some(format!("actor name '{name}' is reserved")),
            observed_generation: actor.metadata.generation,
            ..Default::default()
        };
        publish_status(&actor, ctx, status).await?;
        return Ok(Action::await_change());
    }

    // 2. Queue provisioning. Failures surface as TransportError phase and
    //    retry; nothing downstream is useful without the queue.
    let mut observation = Observation {
        scaling_enabled: actor.spec.scaling.enabled,
        ..Default::default()
    };
    if let Err(e) = ctx.queues.ensure(actor.spec.transport, &name).await {
        observation.transport_error = Some(e.to_string());
        let status = build_status(&actor, &observation, None, Utc::now());
        publish_status(&actor, ctx, status).await?;
        return Ok(Action::requeue(REQUEUE));
    }

    // 7. Script distribution: every actor namespace carries the ConfigMap.
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &namespace);
    let script_cm = ctx.script.config_map(&namespace);
    config_maps
        .patch(
            inject::SCRIPT_VOLUME,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &ssa_patch(&script_cm)?,
        )
        .await?;

    // 3. Workload validation + injection.
    let params = InjectParams {
        actor: name.clone(),
        transport: actor.spec.transport,
        socket: actor.spec.socket.clone(),
        timeout: actor.spec.timeout.clone(),
        sidecar: actor.spec.sidecar.clone(),
        default_sidecar_image: ctx.settings.sidecar_image.clone(),
        gateway_url: ctx.settings.gateway_url.clone(),
    };
    let template = match inject::inject(&actor.spec.workload.template, &params) {
        Ok(template) => template,
        Err(e) => {
            let status = AsyncActorStatus {
                phase: Some(Phase::WorkloadError),
                message: Some(e.to_string()),
                observed_generation: actor.metadata.generation,
                ..Default::default()
            };
            publish_status(&actor, ctx, status).await?;
            // User input is wrong; wait for a spec change instead of
            // spinning.
            return Ok(Action::await_change());
        }
    };

    let desired = match inject::workload_kind(&actor) {
        WorkloadKind::Deployment => {
            let deployment = inject::build_deployment(&actor, template);
            let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
            let applied = api
                .patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &ssa_patch(&deployment)?,
                )
                .await?;
            applied.spec.as_ref().and_then(|s| s.replicas)
        }
        WorkloadKind::StatefulSet => {
            let statefulset = inject::build_statefulset(&actor, template);
            let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
            let applied = api
                .patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &ssa_patch(&statefulset)?,
                )
                .await?;
            applied.spec.as_ref().and_then(|s| s.replicas)
        }
    };

    // 4. Autoscaler.
    if let Err(e) = reconcile_scaled_object(&actor, ctx, &namespace).await {
        observation.scaling_error = Some(e.to_string());
    }

    // 5. Status.
    let (counts, signals) = observe_pods(ctx, &namespace, &name, desired).await?;
    observation.replicas = counts;
    observation.workload_failure = classify_failure(&signals);
    observation.creating = actor.status.is_none() && counts.total == 0;
    observation.ready_below_total_since =
        track_degraded(ctx, &format!("{namespace}/{name}"), counts).await;

    let queue_depth = ctx
        .queues
        .depth(actor.spec.transport, &name)
        .await
        .unwrap_or(None);
    let mut status = build_status(&actor, &observation, queue_depth, Utc::now());
    carry_scale_history(&actor, &mut status);
    publish_status(&actor, ctx, status).await?;

    Ok(Action::requeue(REQUEUE))
}

/// Ensure or remove the KEDA binding. Skips work when the recorded
/// generation matches; replaces objects with a stale owner so admission
/// does not reject the update.
async fn reconcile_scaled_object(
    actor: &AsyncActor,
    ctx: &Context,
    namespace: &str,
) -> Result<(), Error> {
    let name = actor.name_any();
    let api: Api<ScaledObject> = Api::namespaced(ctx.client.clone(), namespace);

    if !actor.spec.scaling.enabled {
        if api.get_opt(&name).await?.is_some() {
            api.delete(&name, &DeleteParams::default()).await?;
            info!(target: "asya.operator", actor = %name, "autoscaler removed (scaling disabled)");
        }
        return Ok(());
    }

    let desired = build_scaled_object(actor, ctx.settings.sqs_base_url.as_deref());
    let generation = actor.metadata.generation.unwrap_or(0).to_string();

    if let Some(existing) = api.get_opt(&name).await? {
        let owned = existing
            .owner_references()
            .iter()
            .any(|o| Some(&o.uid) == actor.meta().uid.as_ref());
        if !owned {
            // Stale leftover from a previous incarnation; replace it.
            warn!(target: "asya.operator", actor = %name, "replacing scaled object with stale owner");
            api.delete(&name, &DeleteParams::default()).await?;
        } else if existing.annotations().get(GENERATION_ANNOTATION) == Some(&generation) {
            return Ok(());
        }
    }

    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&desired),
    )
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Cleanup path
// ---------------------------------------------------------------------------

/// Orderly teardown: workload and autoscaler go unconditionally, the queue
/// only once it is verifiably empty. A non-empty queue keeps the finalizer
/// held and the delete retrying.
async fn cleanup(actor: Arc<AsyncActor>, ctx: &Context) -> Result<Action, Error> {
    let name = actor.name_any();
    let namespace = actor.namespace().unwrap_or_else(|| "default".to_string());
    info!(target: "asya.operator", actor = %name, "tearing down");

    let scaled: Api<ScaledObject> = Api::namespaced(ctx.client.clone(), &namespace);
    if scaled.get_opt(&name).await?.is_some() {
        scaled.delete(&name, &DeleteParams::default()).await?;
    }
    match inject::workload_kind(&actor) {
        WorkloadKind::Deployment => {
            let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
            if api.get_opt(&name).await?.is_some() {
                api.delete(&name, &DeleteParams::default()).await?;
            }
        }
        WorkloadKind::StatefulSet => {
            let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
            if api.get_opt(&name).await?.is_some() {
                api.delete(&name, &DeleteParams::default()).await?;
            }
        }
    }

    if !asya_model::is_reserved_actor(&name) {
        match ctx.queues.delete_if_empty(actor.spec.transport, &name).await {
            Ok(()) => {}
            Err(TransportError::QueueNotEmpty(queue)) => {
                warn!(
                    target: "asya.operator",
                    actor = %name,
                    queue = %queue,
                    "refusing queue deletion: not empty"
                );
                let status = AsyncActorStatus {
                    phase: Some(Phase::Terminating),
                    message: Some(format!("queue '{queue}' still holds messages; teardown blocked")),
                    observed_generation: actor.metadata.generation,
                    ..Default::default()
                };
                publish_status(&actor, ctx, status).await.ok();
                return Err(Error::Transport(TransportError::QueueNotEmpty(queue)));
            }
            Err(e) => return Err(Error::Transport(e)),
        }
    }

    ctx.degraded_since
        .lock()
        .await
        .remove(&format!("{namespace}/{name}"));
    Ok(Action::await_change())
}

// ---------------------------------------------------------------------------
// Observation helpers
// ---------------------------------------------------------------------------

async fn observe_pods(
    ctx: &Context,
    namespace: &str,
    actor: &str,
    desired: Option<i32>,
) -> Result<(ReplicaCounts, Vec<PodSignal>), Error> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let list = pods
        .list(&ListParams::default().labels(&format!("{ACTOR_LABEL}={actor}")))
        .await?;
    Ok(summarize_pods(&list.items, desired))
}

/// Collapse a pod list into counts and classification signals. Pure, so the
/// counting rules are testable without an API server.
pub fn summarize_pods(pods: &[Pod], desired: Option<i32>) -> (ReplicaCounts, Vec<PodSignal>) {
    let mut counts = ReplicaCounts {
        desired: desired.unwrap_or(pods.len() as i32),
        total: pods.len() as i32,
        ..Default::default()
    };
    let mut signals = Vec::new();

    for pod in pods {
        let status = pod.status.clone().unwrap_or_default();
        let phase = status.phase.as_deref().unwrap_or("Unknown");

        let ready = status
            .conditions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True");
        if ready {
            counts.ready += 1;
        }

        // Pod-level conditions carry scheduling failures.
        for condition in status.conditions.as_deref().unwrap_or_default() {
            if condition.status == "False" {
                signals.push(PodSignal {
                    container: None,
                    reason: condition.reason.clone().unwrap_or_default(),
                    message: condition.message.clone().unwrap_or_default(),
                });
            }
        }

        let mut failing = phase == "Failed";
        for cs in status.container_statuses.as_deref().unwrap_or_default() {
            if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                let reason = waiting.reason.clone().unwrap_or_default();
                if matches!(
                    reason.as_str(),
                    "CrashLoopBackOff"
                        | "ErrImagePull"
                        | "ImagePullBackOff"
                        | "CreateContainerConfigError"
                ) {
                    failing = true;
                }
                signals.push(PodSignal {
                    container: Some(cs.name.clone()),
                    reason,
                    message: waiting.message.clone().unwrap_or_default(),
                });
            }
        }

        if failing {
            counts.failing += 1;
        } else if phase == "Running" {
            counts.running += 1;
        } else {
            counts.pending += 1;
        }
    }

    (counts, signals)
}

/// Remember when `ready < total` started, per actor, and forget once it
/// recovers. Backs the `Degraded` phase timer.
async fn track_degraded(
    ctx: &Context,
    key: &str,
    counts: ReplicaCounts,
) -> Option<DateTime<Utc>> {
    let mut map = ctx.degraded_since.lock().await;
    if counts.ready < counts.total {
        Some(*map.entry(key.to_string()).or_insert_with(Utc::now))
    } else {
        map.remove(key);
        None
    }
}

fn build_status(
    actor: &AsyncActor,
    observation: &Observation,
    queue_depth: Option<u64>,
    now: DateTime<Utc>,
) -> AsyncActorStatus {
    let phase = compute_phase(observation, now);
    let message = observation
        .transport_error
        .clone()
        .or_else(|| observation.scaling_error.clone());
    AsyncActorStatus {
        phase: Some(phase),
        workload_error: observation.workload_failure,
        message,
        replicas: observation.replicas,
        last_scale_time: None,
        last_scale_direction: None,
        transport_ready: observation.transport_error.is_none(),
        queued_messages: queue_depth,
        processing_messages: None,
        observed_generation: actor.metadata.generation,
    }
}

/// Fill in last-scale bookkeeping by comparing the new desired count with
/// the previously published status.
fn carry_scale_history(actor: &AsyncActor, status: &mut AsyncActorStatus) {
    let Some(previous) = actor.status.as_ref() else {
        return;
    };
    let before = previous.replicas.desired;
    let after = status.replicas.desired;
    if after > before {
        status.last_scale_time = Some(Utc::now().to_rfc3339());
        status.last_scale_direction = Some(ScaleDirection::Up);
    } else if after < before {
        status.last_scale_time = Some(Utc::now().to_rfc3339());
        status.last_scale_direction = Some(ScaleDirection::Down);
    } else {
        status.last_scale_time = previous.last_scale_time.clone();
        status.last_scale_direction = previous.last_scale_direction;
    }
}

async fn publish_status(
    actor: &AsyncActor,
    ctx: &Context,
    status: AsyncActorStatus,
) -> Result<(), Error> {
    let namespace = actor.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<AsyncActor> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &actor.name_any(),
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodCondition, PodStatus,
    };

    fn pod(phase: &str, ready: bool, waiting: Option<(&str, &str)>) -> Pod {
        let container_statuses = waiting.map(|(container, reason)| {
            vec![ContainerStatus {
                name: container.to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some(reason.to_string()),
                        message: Some(String::new()),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]
        });
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                container_statuses,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn healthy_pods_count_as_running_and_ready() {
        let pods = vec![pod("Running", true, None), pod("Running", true, None)];
        let (counts, signals) = summarize_pods(&pods, Some(2));
        assert_eq!(counts.running, 2);
        assert_eq!(counts.ready, 2);
        assert_eq!(counts.total, 2);
        assert_eq!(counts.desired, 2);
        assert_eq!(counts.failing, 0);
        assert!(classify_failure(&signals).is_none());
    }

    #[test]
    fn crash_loop_counts_as_failing_with_signal() {
        let pods = vec![pod(
            "Running",
            false,
            Some(("asya-runtime", "CrashLoopBackOff")),
        )];
        let (counts, signals) = summarize_pods(&pods, Some(1));
        assert_eq!(counts.failing, 1);
        assert_eq!(counts.running, 0);
        assert_eq!(
            classify_failure(&signals),
            Some(crate::crd::FailureReason::RuntimeError)
        );
    }

    #[test]
    fn pending_pod_counts_as_pending() {
        let pods = vec![pod("Pending", false, None)];
        let (counts, _) = summarize_pods(&pods, Some(1));
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.ready, 0);
    }

    #[test]
    fn image_pull_failure_classified() {
        let pods = vec![pod(
            "Pending",
            false,
            Some(("asya-sidecar", "ImagePullBackOff")),
        )];
        let (counts, signals) = summarize_pods(&pods, Some(1));
        assert_eq!(counts.failing, 1);
        assert_eq!(
            classify_failure(&signals),
            Some(crate::crd::FailureReason::ImagePullError)
        );
    }

    #[test]
    fn empty_pod_list_is_all_zero() {
        let (counts, signals) = summarize_pods(&[], Some(3));
        assert_eq!(counts.total, 0);
        assert_eq!(counts.desired, 3);
        assert!(signals.is_empty());
    }
}
