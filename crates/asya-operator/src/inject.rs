// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pod-template validation and container injection.
//!
//! The user brings a pod template with exactly one container named
//! `asya-runtime`; the reconciler owns everything else: the runtime
//! entrypoint, the sidecar sibling, the shared socket volume, the script
//! mount, and the readiness probe.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec,
};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, ExecAction,
    PodTemplateSpec, Probe, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

use asya_config::env as config_env;
use asya_transport::naming;

use crate::crd::{AsyncActor, SidecarOverrides, SocketSpec, TimeoutSpec, TransportName, WorkloadKind};

/// Required name of the user's container.
pub const RUNTIME_CONTAINER: &str = "asya-runtime";

/// Name of the injected sidecar container.
pub const SIDECAR_CONTAINER: &str = "asya-sidecar";

/// Ephemeral volume carrying the Unix socket between the two containers.
pub const SOCKET_VOLUME: &str = "asya-socket";

/// Volume mounting the distributed runtime script.
pub const SCRIPT_VOLUME: &str = "asya-runtime-script";

/// ConfigMap (and volume mount) directory holding the runtime script.
pub const SCRIPT_MOUNT_DIR: &str = "/opt/asya";

/// File name of the runtime script inside the ConfigMap.
pub const SCRIPT_FILE: &str = "asya_runtime.py";

/// Label selecting every pod of one actor.
pub const ACTOR_LABEL: &str = "asya.dev/actor";

/// Fallback sidecar image when the spec carries no override.
pub const DEFAULT_SIDECAR_IMAGE: &str = "ghcr.io/asya-dev/asya-sidecar:latest";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Admission failures for a user workload spec.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InjectError {
    /// The template does not carry exactly one `asya-runtime` container.
    #[error("pod template must contain exactly one container named 'asya-runtime', found {0}")]
    RuntimeContainerCount(usize),

    /// The runtime container overrides its entrypoint.
    #[error("container 'asya-runtime' must not override the runtime entrypoint")]
    EntrypointOverride,

    /// A user container claims the injected sidecar's name.
    #[error("container name 'asya-sidecar' is reserved for the injected sidecar")]
    SidecarNameTaken,

    /// The actor uses a reserved sink name.
    #[error("actor name '{0}' is reserved")]
    ReservedActorName(String),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Admission rules from the workload contract. Called on every reconcile;
/// the template is user-owned and can drift.
pub fn validate_template(template: &PodTemplateSpec) -> Result<(), InjectError> {
    let containers = template
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();

    let runtime_count = containers
        .iter()
        .filter(|c| c.name == RUNTIME_CONTAINER)
        .count();
    if runtime_count != 1 {
        return Err(InjectError::RuntimeContainerCount(runtime_count));
    }
    if containers.iter().any(|c| c.name == SIDECAR_CONTAINER) {
        return Err(InjectError::SidecarNameTaken);
    }
    let runtime = containers
        .iter()
        .find(|c| c.name == RUNTIME_CONTAINER)
        .expect("count checked above");
    if runtime.command.is_some() || runtime.args.is_some() {
        return Err(InjectError::EntrypointOverride);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Injection
// ---------------------------------------------------------------------------

/// Everything injection needs from the actor spec and operator config.
#[derive(Debug, Clone)]
pub struct InjectParams {
    /// Actor name.
    pub actor: String,
    /// Transport selector injected into the sidecar.
    pub transport: TransportName,
    /// Socket sharing configuration.
    pub socket: SocketSpec,
    /// Deadlines injected into both containers.
    pub timeout: TimeoutSpec,
    /// Sidecar container overrides from the spec.
    pub sidecar: SidecarOverrides,
    /// Operator-wide default sidecar image.
    pub default_sidecar_image: String,
    /// Optional tracker base URL handed to the sidecar.
    pub gateway_url: Option<String>,
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn socket_mount(dir: &str) -> VolumeMount {
    VolumeMount {
        name: SOCKET_VOLUME.to_string(),
        mount_path: dir.to_string(),
        ..Default::default()
    }
}

/// Validate and transform the user template into the pod the actor actually
/// runs: runtime entrypoint wired to the distributed script, sidecar
/// sibling injected, socket volume shared, readiness probed.
pub fn inject(template: &PodTemplateSpec, params: &InjectParams) -> Result<PodTemplateSpec, InjectError> {
    if asya_model::is_reserved_actor(&params.actor) {
        return Err(InjectError::ReservedActorName(params.actor.clone()));
    }
    validate_template(template)?;

    let mut injected = template.clone();
    let spec = injected.spec.get_or_insert_with(Default::default);
    let socket_dir = params.socket.dir.clone();
    let script_path = format!("{SCRIPT_MOUNT_DIR}/{SCRIPT_FILE}");

    for container in spec.containers.iter_mut() {
        if container.name != RUNTIME_CONTAINER {
            continue;
        }
        container.command = Some(vec!["python3".to_string(), script_path.clone()]);
        let env_list = container.env.get_or_insert_with(Vec::new);
        env_list.push(env(config_env::SOCKET_DIR, &socket_dir));
        env_list.push(env(config_env::SOCKET_CHMOD, &params.socket.chmod));
        env_list.push(env(
            config_env::RUNTIME_TIMEOUT,
            params.timeout.processing.to_string(),
        ));
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        mounts.push(socket_mount(&socket_dir));
        mounts.push(VolumeMount {
            name: SCRIPT_VOLUME.to_string(),
            mount_path: SCRIPT_MOUNT_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        container.readiness_probe = Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    format!(
                        "test -S {socket_dir}/{} && test -f {socket_dir}/{}",
                        asya_config::SOCKET_FILE,
                        asya_config::READY_FILE
                    ),
                ]),
            }),
            initial_delay_seconds: Some(2),
            period_seconds: Some(5),
            ..Default::default()
        });
    }

    spec.containers.push(build_sidecar_container(params));

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    volumes.push(Volume {
        name: SOCKET_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });
    volumes.push(Volume {
        name: SCRIPT_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: SCRIPT_VOLUME.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    });

    // Actor label so status queries can select the pods.
    let metadata = injected.metadata.get_or_insert_with(Default::default);
    metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(ACTOR_LABEL.to_string(), params.actor.clone());

    Ok(injected)
}

fn build_sidecar_container(params: &InjectParams) -> Container {
    let mut env_list = vec![
        env(config_env::ACTOR_NAME, &params.actor),
        env(config_env::TRANSPORT, params.transport.as_str()),
        env(config_env::QUEUE_NAME, naming::queue_name(&params.actor)),
        env(config_env::SOCKET_DIR, &params.socket.dir),
        env(
            config_env::RUNTIME_TIMEOUT,
            params.timeout.processing.to_string(),
        ),
        env(
            config_env::GRACEFUL_SHUTDOWN,
            params.timeout.graceful_shutdown.to_string(),
        ),
    ];
    if let Some(gateway) = &params.gateway_url {
        env_list.push(env(config_env::GATEWAY_URL, gateway));
    }
    for (name, value) in &params.sidecar.env {
        env_list.push(env(name, value));
    }

    Container {
        name: SIDECAR_CONTAINER.to_string(),
        image: Some(
            params
                .sidecar
                .image
                .clone()
                .unwrap_or_else(|| params.default_sidecar_image.clone()),
        ),
        env: Some(env_list),
        resources: params.sidecar.resources.clone(),
        volume_mounts: Some(vec![socket_mount(&params.socket.dir)]),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Workload materialization
// ---------------------------------------------------------------------------

fn workload_meta(actor: &AsyncActor, owner: OwnerReference) -> ObjectMeta {
    let mut labels = BTreeMap::new();
    labels.insert(ACTOR_LABEL.to_string(), actor.name_any());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "asya-operator".to_string(),
    );
    ObjectMeta {
        name: Some(actor.name_any()),
        namespace: actor.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner]),
        ..Default::default()
    }
}

fn selector(actor: &AsyncActor) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(
            ACTOR_LABEL.to_string(),
            actor.name_any(),
        )])),
        ..Default::default()
    }
}

/// Replicas are only pinned when autoscaling is off; otherwise the
/// autoscaler owns the count and the field stays unset.
fn desired_replicas(actor: &AsyncActor) -> Option<i32> {
    if actor.spec.scaling.enabled {
        None
    } else {
        Some(actor.spec.workload.replicas.unwrap_or(1))
    }
}

/// Materialize the actor as a `Deployment`.
pub fn build_deployment(actor: &AsyncActor, template: PodTemplateSpec) -> Deployment {
    let owner = actor.controller_owner_ref(&()).expect("actor has metadata");
    Deployment {
        metadata: workload_meta(actor, owner),
        spec: Some(DeploymentSpec {
            replicas: desired_replicas(actor),
            selector: selector(actor),
            template,
            ..Default::default()
        }),
        status: None,
    }
}

/// Materialize the actor as a `StatefulSet`.
pub fn build_statefulset(actor: &AsyncActor, template: PodTemplateSpec) -> StatefulSet {
    let owner = actor.controller_owner_ref(&()).expect("actor has metadata");
    StatefulSet {
        metadata: workload_meta(actor, owner),
        spec: Some(StatefulSetSpec {
            replicas: desired_replicas(actor),
            selector: selector(actor),
            service_name: Some(actor.name_any()),
            template,
            ..Default::default()
        }),
        status: None,
    }
}

/// Which builder applies for the actor's configured kind.
pub fn workload_kind(actor: &AsyncActor) -> WorkloadKind {
    actor.spec.workload.kind
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;

    fn template(containers: Vec<Container>) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
        }
    }

    fn user_container() -> Container {
        Container {
            name: RUNTIME_CONTAINER.to_string(),
            image: Some("user/model:1".to_string()),
            env: Some(vec![env("ASYA_HANDLER", "handlers.predict")]),
            ..Default::default()
        }
    }

    fn params() -> InjectParams {
        InjectParams {
            actor: "infer".to_string(),
            transport: TransportName::Amqp,
            socket: SocketSpec::default(),
            timeout: TimeoutSpec::default(),
            sidecar: SidecarOverrides::default(),
            default_sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            gateway_url: None,
        }
    }

    fn env_value(container: &Container, name: &str) -> Option<String> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .clone()
    }

    // --- validation ---

    #[test]
    fn missing_runtime_container_rejected() {
        let t = template(vec![Container {
            name: "other".to_string(),
            ..Default::default()
        }]);
        assert_eq!(
            validate_template(&t),
            Err(InjectError::RuntimeContainerCount(0))
        );
    }

    #[test]
    fn duplicate_runtime_container_rejected() {
        let t = template(vec![user_container(), user_container()]);
        assert_eq!(
            validate_template(&t),
            Err(InjectError::RuntimeContainerCount(2))
        );
    }

    #[test]
    fn entrypoint_override_rejected() {
        let mut c = user_container();
        c.command = Some(vec!["/bin/bash".into()]);
        assert_eq!(
            validate_template(&template(vec![c])),
            Err(InjectError::EntrypointOverride)
        );
    }

    #[test]
    fn sidecar_name_collision_rejected() {
        let t = template(vec![
            user_container(),
            Container {
                name: SIDECAR_CONTAINER.to_string(),
                ..Default::default()
            },
        ]);
        assert_eq!(validate_template(&t), Err(InjectError::SidecarNameTaken));
    }

    #[test]
    fn reserved_actor_names_rejected() {
        let mut p = params();
        p.actor = "error-sink".to_string();
        let err = inject(&template(vec![user_container()]), &p).unwrap_err();
        assert_eq!(err, InjectError::ReservedActorName("error-sink".into()));
    }

    // --- injection ---

    #[test]
    fn injects_sidecar_and_volumes() {
        let out = inject(&template(vec![user_container()]), &params()).unwrap();
        let spec = out.spec.unwrap();
        assert_eq!(spec.containers.len(), 2);

        let sidecar = spec
            .containers
            .iter()
            .find(|c| c.name == SIDECAR_CONTAINER)
            .unwrap();
        assert_eq!(sidecar.image.as_deref(), Some(DEFAULT_SIDECAR_IMAGE));
        assert_eq!(env_value(sidecar, "ASYA_ACTOR_NAME").unwrap(), "infer");
        assert_eq!(env_value(sidecar, "ASYA_QUEUE_NAME").unwrap(), "asya-infer");
        assert_eq!(env_value(sidecar, "ASYA_TRANSPORT").unwrap(), "amqp");

        let volumes = spec.volumes.unwrap();
        assert!(volumes.iter().any(|v| v.name == SOCKET_VOLUME && v.empty_dir.is_some()));
        assert!(volumes.iter().any(|v| v.name == SCRIPT_VOLUME && v.config_map.is_some()));
    }

    #[test]
    fn runtime_container_gets_entrypoint_probe_and_mounts() {
        let out = inject(&template(vec![user_container()]), &params()).unwrap();
        let spec = out.spec.unwrap();
        let runtime = spec
            .containers
            .iter()
            .find(|c| c.name == RUNTIME_CONTAINER)
            .unwrap();

        assert_eq!(
            runtime.command.as_ref().unwrap(),
            &vec!["python3".to_string(), "/opt/asya/asya_runtime.py".to_string()]
        );
        // User environment survives injection.
        assert_eq!(
            env_value(runtime, "ASYA_HANDLER").unwrap(),
            "handlers.predict"
        );
        assert_eq!(
            env_value(runtime, "ASYA_SOCKET_DIR").unwrap(),
            "/var/run/asya"
        );

        let probe = runtime.readiness_probe.as_ref().unwrap();
        let cmd = probe.exec.as_ref().unwrap().command.as_ref().unwrap();
        assert!(cmd[2].contains("asya.sock"));
        assert!(cmd[2].contains("ready"));

        let mounts = runtime.volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.name == SOCKET_VOLUME));
        assert!(mounts
            .iter()
            .any(|m| m.name == SCRIPT_VOLUME && m.read_only == Some(true)));
    }

    #[test]
    fn sidecar_overrides_apply() {
        let mut p = params();
        p.sidecar.image = Some("custom/sidecar:2".to_string());
        p.sidecar.env.insert("EXTRA".to_string(), "1".to_string());
        p.gateway_url = Some("http://tracker:8080".to_string());

        let out = inject(&template(vec![user_container()]), &p).unwrap();
        let spec = out.spec.unwrap();
        let sidecar = spec
            .containers
            .iter()
            .find(|c| c.name == SIDECAR_CONTAINER)
            .unwrap();
        assert_eq!(sidecar.image.as_deref(), Some("custom/sidecar:2"));
        assert_eq!(env_value(sidecar, "EXTRA").unwrap(), "1");
        assert_eq!(
            env_value(sidecar, "ASYA_GATEWAY_URL").unwrap(),
            "http://tracker:8080"
        );
    }

    #[test]
    fn pods_are_labeled_for_selection() {
        let out = inject(&template(vec![user_container()]), &params()).unwrap();
        let labels = out.metadata.unwrap().labels.unwrap();
        assert_eq!(labels.get(ACTOR_LABEL).unwrap(), "infer");
    }

    #[test]
    fn user_helper_containers_survive() {
        let helper = Container {
            name: "log-shipper".to_string(),
            image: Some("vector:latest".to_string()),
            ..Default::default()
        };
        let out = inject(&template(vec![user_container(), helper]), &params()).unwrap();
        let spec = out.spec.unwrap();
        assert_eq!(spec.containers.len(), 3);
        assert!(spec.containers.iter().any(|c| c.name == "log-shipper"));
    }

    // --- workload materialization ---

    fn actor_with(scaling_enabled: bool, replicas: Option<i32>) -> crate::crd::AsyncActor {
        let spec: crate::crd::AsyncActorSpec = serde_json::from_value(serde_json::json!({
            "transport": "amqp",
            "scaling": {"enabled": scaling_enabled},
            "workload": {
                "replicas": replicas,
                "template": {"spec": {"containers": [{"name": "asya-runtime"}]}}
            }
        }))
        .unwrap();
        let mut actor = crate::crd::AsyncActor::new("embed", spec);
        actor.metadata.namespace = Some("ml".to_string());
        actor.metadata.uid = Some("uid-9".to_string());
        actor
    }

    #[test]
    fn deployment_pins_replicas_only_without_scaling() {
        let fixed = actor_with(false, Some(3));
        let template = inject(&fixed.spec.workload.template, &params()).unwrap();
        let deployment = build_deployment(&fixed, template.clone());
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(3));

        let scaled = actor_with(true, Some(3));
        let deployment = build_deployment(&scaled, template);
        // The autoscaler owns the count.
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, None);
    }

    #[test]
    fn workloads_carry_owner_reference_and_selector() {
        let actor = actor_with(false, None);
        let template = inject(&actor.spec.workload.template, &params()).unwrap();
        let statefulset = build_statefulset(&actor, template);

        let owners = statefulset.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "AsyncActor");
        assert_eq!(owners[0].uid, "uid-9");

        let spec = statefulset.spec.unwrap();
        assert_eq!(spec.service_name, Some("embed".to_string()));
        assert_eq!(
            spec.selector.match_labels.unwrap().get(ACTOR_LABEL).unwrap(),
            "embed"
        );
        // Defaults to one replica when nothing is specified.
        assert_eq!(spec.replicas, Some(1));
    }
}
