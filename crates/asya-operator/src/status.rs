// SPDX-License-Identifier: MIT OR Apache-2.0
//! Phase computation and failure classification. Pure functions over
//! observed cluster state so the rules stay testable without a cluster.

use chrono::{DateTime, Duration, Utc};

use crate::crd::{FailureReason, Phase, ReplicaCounts};

/// Ready < Total must persist this many minutes before the actor is
/// `Degraded` rather than `ScalingUp`.
pub const DEGRADED_AFTER_MINUTES: i64 = 5;

fn degraded_after() -> Duration {
    Duration::minutes(DEGRADED_AFTER_MINUTES)
}

// ---------------------------------------------------------------------------
// Phase computation
// ---------------------------------------------------------------------------

/// Everything the phase decision needs, already observed.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    /// Deletion timestamp present on the actor.
    pub terminating: bool,
    /// No workload generation observed yet.
    pub creating: bool,
    /// Queue provisioning / depth query failure, when one occurred.
    pub transport_error: Option<String>,
    /// Classified pod failure, when one is present.
    pub workload_failure: Option<FailureReason>,
    /// Autoscaler reconciliation failure, when one occurred.
    pub scaling_error: Option<String>,
    /// Whether autoscaling is enabled for the actor.
    pub scaling_enabled: bool,
    /// Pod counts.
    pub replicas: ReplicaCounts,
    /// When `ready < total` was first observed, if it still holds.
    pub ready_below_total_since: Option<DateTime<Utc>>,
}

/// Resolve the status phase by fixed priority: terminal and error states
/// first, then transitional, then operational.
pub fn compute_phase(obs: &Observation, now: DateTime<Utc>) -> Phase {
    if obs.terminating {
        return Phase::Terminating;
    }
    if obs.creating {
        return Phase::Creating;
    }
    if obs.transport_error.is_some() {
        return Phase::TransportError;
    }
    if obs.workload_failure.is_some() {
        return Phase::WorkloadError;
    }
    if obs.scaling_error.is_some() {
        return Phase::ScalingError;
    }

    let ReplicaCounts {
        total,
        desired,
        ready,
        ..
    } = obs.replicas;

    if obs.scaling_enabled && desired == 0 && total == 0 {
        return Phase::Napping;
    }
    if ready < total {
        if let Some(since) = obs.ready_below_total_since {
            if now - since > degraded_after() {
                return Phase::Degraded;
            }
        }
    }
    if total < desired || ready < total {
        return Phase::ScalingUp;
    }
    if total > desired {
        return Phase::ScalingDown;
    }
    Phase::Running
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// One observed pod signal: an event or a container waiting reason.
#[derive(Debug, Clone)]
pub struct PodSignal {
    /// Container the signal belongs to, when it is container-scoped.
    pub container: Option<String>,
    /// Event or waiting reason (`CrashLoopBackOff`, `FailedScheduling`, …).
    pub reason: String,
    /// Free-form message attached to the signal.
    pub message: String,
}

impl PodSignal {
    fn text(&self) -> String {
        format!("{} {}", self.reason, self.message).to_lowercase()
    }
}

/// Map pod signals to a failure reason. Rules run in a fixed order, so the
/// result is deterministic regardless of signal ordering.
pub fn classify_failure(signals: &[PodSignal]) -> Option<FailureReason> {
    // Scheduling starvation first: everything else is downstream noise
    // while the pod has nowhere to run.
    for s in signals {
        if s.reason.starts_with("Insufficient") || s.message.contains("Insufficient") {
            return Some(FailureReason::PendingResources);
        }
    }
    for s in signals {
        if s.reason == "ImagePullBackOff" || s.reason == "ErrImagePull" {
            return Some(FailureReason::ImagePullError);
        }
    }
    for s in signals {
        if s.container.as_deref() == Some(crate::inject::RUNTIME_CONTAINER)
            && s.reason == "CrashLoopBackOff"
        {
            return Some(FailureReason::RuntimeError);
        }
    }
    for s in signals {
        if s.container.as_deref() == Some(crate::inject::SIDECAR_CONTAINER)
            && s.reason == "CrashLoopBackOff"
        {
            return Some(FailureReason::SidecarError);
        }
    }
    for s in signals {
        let text = s.text();
        if text.contains("mountvolume") || text.contains("volumemount") {
            return Some(FailureReason::VolumeError);
        }
    }
    for s in signals {
        let text = s.text();
        if (text.contains("configmap") || text.contains("secret")) && text.contains("not found") {
            return Some(FailureReason::ConfigError);
        }
    }
    None
}
