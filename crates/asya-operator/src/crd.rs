// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `AsyncActor` custom resource: desired state owned by the user,
//! status owned by the reconciler.

use k8s_openapi::api::core::v1::{PodTemplateSpec, ResourceRequirements};
use kube::CustomResource;
use schemars::{json_schema, JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group of every Asya resource.
pub const GROUP: &str = "asya.dev";

/// Finalizer attached to each `AsyncActor` so deletion waits for teardown.
pub const FINALIZER: &str = "asya.dev/teardown";

/// Annotation carrying the generation the autoscaler object was built from.
pub const GENERATION_ANNOTATION: &str = "asya.dev/actor-generation";

// ---------------------------------------------------------------------------
// Spec
// ---------------------------------------------------------------------------

/// Desired state for one actor: transport, scaling policy, the user's pod
/// template, and the knobs for the injected containers.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "asya.dev",
    version = "v1alpha1",
    kind = "AsyncActor",
    namespaced,
    status = "AsyncActorStatus",
    shortname = "actor",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.replicas.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AsyncActorSpec {
    /// Which queue transport backs this actor.
    pub transport: TransportName,

    /// Queue-depth autoscaling policy.
    #[serde(default)]
    pub scaling: ScalingSpec,

    /// The user's workload: pod template plus workload kind.
    pub workload: WorkloadSpec,

    /// Overrides for the injected sidecar container.
    #[serde(default)]
    pub sidecar: SidecarOverrides,

    /// Processing and shutdown deadlines, in seconds.
    #[serde(default)]
    pub timeout: TimeoutSpec,

    /// Socket directory shared by the injected containers.
    #[serde(default)]
    pub socket: SocketSpec,
}

/// Enumerated transport names accepted by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportName {
    /// AMQP broker.
    Amqp,
    /// SQS-style cloud queues.
    Sqs,
}

impl TransportName {
    /// Environment-variable value injected into the sidecar.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amqp => "amqp",
            Self::Sqs => "sqs",
        }
    }
}

/// Queue-length autoscaling policy, materialized as a KEDA `ScaledObject`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    /// When false, the workload runs at `workload.replicas`.
    #[serde(default)]
    pub enabled: bool,
    /// Lower replica bound (0 allows scale-to-zero).
    pub min_replicas: Option<i32>,
    /// Upper replica bound.
    pub max_replicas: Option<i32>,
    /// Target queue depth per replica.
    pub queue_length: Option<i64>,
    /// Seconds between autoscaler polls.
    pub polling_interval: Option<i32>,
    /// Seconds to wait before scaling down.
    pub cooldown_period: Option<i32>,
    /// Escape hatch for formula-based scaling.
    pub advanced: Option<AdvancedScaling>,
}

/// Advanced scaling expression handed through to the autoscaler.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedScaling {
    /// Scaling formula over the trigger metrics.
    pub formula: Option<String>,
    /// Target value for the formula result.
    pub target: Option<String>,
    /// Activation threshold for scale-from-zero.
    pub activation_target: Option<String>,
    /// Metric type (`AverageValue`, `Value`).
    pub metric_type: Option<String>,
}

/// The user's workload definition.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Deployment or StatefulSet.
    #[serde(default)]
    pub kind: WorkloadKind,
    /// Fixed replica count; honored only when scaling is disabled.
    pub replicas: Option<i32>,
    /// Pod template carrying exactly one container named `asya-runtime`.
    #[schemars(schema_with = "preserve_unknown_object")]
    pub template: PodTemplateSpec,
}

/// Workload kinds an actor can materialize as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
pub enum WorkloadKind {
    /// Stateless deployment (the default).
    #[default]
    Deployment,
    /// StatefulSet for actors needing stable identity.
    StatefulSet,
}

/// Image, resource, and environment overrides for the injected sidecar.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SidecarOverrides {
    /// Sidecar image; the operator default applies when unset.
    pub image: Option<String>,
    /// Resource requirements for the sidecar container.
    #[schemars(schema_with = "preserve_unknown_object_opt")]
    pub resources: Option<ResourceRequirements>,
    /// Extra environment for the sidecar container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Deadlines, in seconds.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutSpec {
    /// Per-envelope processing deadline enforced by the sidecar.
    pub processing: u64,
    /// Budget for the in-flight envelope on termination.
    pub graceful_shutdown: u64,
}

impl Default for TimeoutSpec {
    fn default() -> Self {
        Self {
            processing: asya_config::DEFAULT_TIMEOUT_SECS,
            graceful_shutdown: asya_config::DEFAULT_GRACEFUL_SHUTDOWN_SECS,
        }
    }
}

/// Socket sharing between the injected containers.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SocketSpec {
    /// Directory holding the Unix socket and readiness marker.
    pub dir: String,
    /// Octal permission string applied to the socket file.
    pub chmod: String,
}

impl Default for SocketSpec {
    fn default() -> Self {
        Self {
            dir: asya_config::DEFAULT_SOCKET_DIR.to_string(),
            chmod: "0660".to_string(),
        }
    }
}

fn preserve_unknown_object(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

fn preserve_unknown_object_opt(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
        "nullable": true
    })
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Published summary of an actor's observed state.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AsyncActorStatus {
    /// Highest-priority phase currently applying.
    pub phase: Option<Phase>,
    /// Sub-classification, set when `phase` is `WorkloadError`.
    pub workload_error: Option<FailureReason>,
    /// Human-readable detail for the current phase.
    pub message: Option<String>,
    /// Pod counts.
    #[serde(default)]
    pub replicas: ReplicaCounts,
    /// RFC 3339 timestamp of the last observed replica change.
    pub last_scale_time: Option<String>,
    /// Direction of the last replica change.
    pub last_scale_direction: Option<ScaleDirection>,
    /// Whether the transport accepted the most recent queue operation.
    #[serde(default)]
    pub transport_ready: bool,
    /// Queue depth, where the transport can report it.
    pub queued_messages: Option<u64>,
    /// Messages currently held by sidecars, where the transport reports it.
    pub processing_messages: Option<u64>,
    /// Generation this status was computed from.
    pub observed_generation: Option<i64>,
}

/// Pod counts summarized per actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaCounts {
    /// Pods in `Running` with all containers ready.
    pub running: i32,
    /// Pods still pending scheduling or startup.
    pub pending: i32,
    /// Pods in a failure state.
    pub failing: i32,
    /// All pods belonging to the actor.
    pub total: i32,
    /// Replicas the workload currently asks for.
    pub desired: i32,
    /// Pods passing readiness.
    pub ready: i32,
}

/// Lifecycle phases, listed in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Phase {
    /// Deletion in progress, finalizer still held.
    Terminating,
    /// First reconciliation has not yet produced a workload.
    Creating,
    /// Queue provisioning or depth queries are failing.
    TransportError,
    /// Pods are failing; see `workload_error` for the classification.
    WorkloadError,
    /// The autoscaler object could not be reconciled.
    ScalingError,
    /// Scaled to zero while idle.
    Napping,
    /// Observed replicas below desired.
    ScalingUp,
    /// Observed replicas above desired.
    ScalingDown,
    /// All desired replicas ready.
    Running,
    /// Ready below total for a sustained period.
    Degraded,
}

/// Deterministic sub-classification of workload failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum FailureReason {
    /// Cluster cannot schedule the pod (insufficient resources).
    PendingResources,
    /// The image cannot be pulled.
    ImagePullError,
    /// The runtime container is crash-looping.
    RuntimeError,
    /// The sidecar container is crash-looping.
    SidecarError,
    /// A volume failed to mount.
    VolumeError,
    /// A referenced ConfigMap or Secret is missing.
    ConfigError,
}

/// Direction of the most recent replica change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    /// Replicas increased.
    Up,
    /// Replicas decreased.
    Down,
}
