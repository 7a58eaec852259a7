// SPDX-License-Identifier: MIT OR Apache-2.0
//! KEDA `ScaledObject` binding: queue depth in, replica counts out.

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use asya_transport::naming;

use crate::crd::{AsyncActor, TransportName, WorkloadKind, GENERATION_ANNOTATION};

// ---------------------------------------------------------------------------
// ScaledObject resource
// ---------------------------------------------------------------------------

/// Subset of the KEDA `ScaledObject` spec this operator manages.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "keda.sh",
    version = "v1alpha1",
    kind = "ScaledObject",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ScaledObjectSpec {
    /// Workload the autoscaler drives.
    pub scale_target_ref: ScaleTarget,
    /// Lower replica bound (0 enables scale-to-zero).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_replica_count: Option<i32>,
    /// Upper replica bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_replica_count: Option<i32>,
    /// Seconds between trigger polls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling_interval: Option<i32>,
    /// Seconds to wait before scaling down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_period: Option<i32>,
    /// Formula-based scaling modifiers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advanced: Option<AdvancedConfig>,
    /// Queue-depth triggers.
    pub triggers: Vec<ScaleTrigger>,
}

/// Reference to the scaled workload.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTarget {
    /// `apps/v1`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// `Deployment` or `StatefulSet`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Workload name.
    pub name: String,
}

/// One KEDA trigger.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ScaleTrigger {
    /// Scaler name (`rabbitmq`, `aws-sqs-queue`).
    #[serde(rename = "type")]
    pub trigger_type: String,
    /// Scaler-specific settings.
    pub metadata: BTreeMap<String, String>,
}

/// `spec.advanced` wrapper.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedConfig {
    /// Formula-based composition of trigger metrics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaling_modifiers: Option<ScalingModifiers>,
}

/// KEDA scaling-modifier block.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingModifiers {
    /// Expression over the trigger metrics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    /// Target value for the formula result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Activation threshold for scale-from-zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_target: Option<String>,
    /// Metric type for the formula result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Default per-replica queue-depth target.
pub const DEFAULT_QUEUE_LENGTH: i64 = 5;

/// Build the desired `ScaledObject` for an actor. The generation annotation
/// lets reconciliation skip work when nothing changed.
pub fn build_scaled_object(actor: &AsyncActor, sqs_base_url: Option<&str>) -> ScaledObject {
    let owner = actor.controller_owner_ref(&()).expect("actor has metadata");
    let scaling = &actor.spec.scaling;
    let queue_length = scaling.queue_length.unwrap_or(DEFAULT_QUEUE_LENGTH);

    let trigger = match actor.spec.transport {
        TransportName::Amqp => ScaleTrigger {
            trigger_type: "rabbitmq".to_string(),
            metadata: BTreeMap::from([
                ("queueName".to_string(), naming::queue_name(&actor.name_any())),
                ("mode".to_string(), "QueueLength".to_string()),
                ("value".to_string(), queue_length.to_string()),
                ("hostFromEnv".to_string(), asya_config::env::AMQP_URL.to_string()),
            ]),
        },
        TransportName::Sqs => ScaleTrigger {
            trigger_type: "aws-sqs-queue".to_string(),
            metadata: BTreeMap::from([
                (
                    "queueURL".to_string(),
                    naming::resolve(
                        asya_transport::TransportKind::Sqs,
                        &actor.name_any(),
                        sqs_base_url,
                    ),
                ),
                ("queueLength".to_string(), queue_length.to_string()),
            ]),
        },
    };

    let advanced = scaling.advanced.as_ref().map(|a| AdvancedConfig {
        scaling_modifiers: Some(ScalingModifiers {
            formula: a.formula.clone(),
            target: a.target.clone(),
            activation_target: a.activation_target.clone(),
            metric_type: a.metric_type.clone(),
        }),
    });

    let kind = match actor.spec.workload.kind {
        WorkloadKind::Deployment => "Deployment",
        WorkloadKind::StatefulSet => "StatefulSet",
    };

    ScaledObject {
        metadata: ObjectMeta {
            name: Some(actor.name_any()),
            namespace: actor.namespace(),
            owner_references: Some(vec![owner]),
            annotations: Some(BTreeMap::from([(
                GENERATION_ANNOTATION.to_string(),
                actor.metadata.generation.unwrap_or(0).to_string(),
            )])),
            ..Default::default()
        },
        spec: ScaledObjectSpec {
            scale_target_ref: ScaleTarget {
                api_version: Some("apps/v1".to_string()),
                kind: Some(kind.to_string()),
                name: actor.name_any(),
            },
            min_replica_count: scaling.min_replicas,
            max_replica_count: scaling.max_replicas,
            polling_interval: scaling.polling_interval,
            cooldown_period: scaling.cooldown_period,
            advanced,
            triggers: vec![trigger],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AdvancedScaling, AsyncActorSpec};
    use kube::core::ObjectMeta as KubeMeta;

    fn actor(transport: TransportName, scaling_json: serde_json::Value) -> AsyncActor {
        let transport = transport.as_str();
        let spec: AsyncActorSpec = serde_json::from_value(serde_json::json!({
            "transport": transport,
            "scaling": scaling_json,
            "workload": {
                "template": {"spec": {"containers": [{"name": "asya-runtime"}]}}
            }
        }))
        .unwrap();
        let mut actor = AsyncActor::new("embed", spec);
        actor.metadata = KubeMeta {
            name: Some("embed".to_string()),
            namespace: Some("ml".to_string()),
            uid: Some("uid-1".to_string()),
            generation: Some(4),
            ..Default::default()
        };
        actor
    }

    #[test]
    fn rabbitmq_trigger_shape() {
        let actor = actor(
            TransportName::Amqp,
            serde_json::json!({"enabled": true, "minReplicas": 0, "maxReplicas": 8, "queueLength": 10}),
        );
        let so = build_scaled_object(&actor, None);

        assert_eq!(so.metadata.name.as_deref(), Some("embed"));
        assert_eq!(so.spec.min_replica_count, Some(0));
        assert_eq!(so.spec.max_replica_count, Some(8));
        let trigger = &so.spec.triggers[0];
        assert_eq!(trigger.trigger_type, "rabbitmq");
        assert_eq!(trigger.metadata["queueName"], "asya-embed");
        assert_eq!(trigger.metadata["value"], "10");
        assert_eq!(trigger.metadata["mode"], "QueueLength");
    }

    #[test]
    fn sqs_trigger_uses_resolved_url() {
        let actor = actor(
            TransportName::Sqs,
            serde_json::json!({"enabled": true, "queueLength": 3}),
        );
        let so = build_scaled_object(&actor, Some("https://sqs.local/000"));
        let trigger = &so.spec.triggers[0];
        assert_eq!(trigger.trigger_type, "aws-sqs-queue");
        assert_eq!(trigger.metadata["queueURL"], "https://sqs.local/000/asya-embed");
        assert_eq!(trigger.metadata["queueLength"], "3");
    }

    #[test]
    fn generation_annotation_tracks_actor_generation() {
        let actor = actor(TransportName::Amqp, serde_json::json!({"enabled": true}));
        let so = build_scaled_object(&actor, None);
        assert_eq!(
            so.metadata.annotations.unwrap()[GENERATION_ANNOTATION],
            "4"
        );
    }

    #[test]
    fn advanced_formula_maps_to_scaling_modifiers() {
        let mut actor = actor(TransportName::Amqp, serde_json::json!({"enabled": true}));
        actor.spec.scaling.advanced = Some(AdvancedScaling {
            formula: Some("queue / 2".to_string()),
            target: Some("4".to_string()),
            activation_target: Some("1".to_string()),
            metric_type: Some("AverageValue".to_string()),
        });
        let so = build_scaled_object(&actor, None);
        let modifiers = so.spec.advanced.unwrap().scaling_modifiers.unwrap();
        assert_eq!(modifiers.formula.as_deref(), Some("queue / 2"));
        assert_eq!(modifiers.metric_type.as_deref(), Some("AverageValue"));
    }

    #[test]
    fn spec_serializes_camel_case() {
        let actor = actor(TransportName::Amqp, serde_json::json!({"enabled": true, "pollingInterval": 20}));
        let so = build_scaled_object(&actor, None);
        let v = serde_json::to_value(&so.spec).unwrap();
        assert!(v.get("scaleTargetRef").is_some());
        assert_eq!(v["pollingInterval"], 20);
        assert_eq!(v["triggers"][0]["type"], "rabbitmq");
    }
}
