// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Kubernetes resource builders for Talos nodes
//!
//! This module builds the objects that back container-mode nodes (`StatefulSet`,
//! `Service`s) and the objects carrying generated material (`ConfigMap`, `Secret`).
//! All functions are pure: identical inputs give identical objects, which keeps
//! server-side apply of an unchanged spec a no-op.

use crate::bundle::MachineType;
use crate::constants::{
    CONFIG_MAP_SUFFIX, CONTROLPLANE_CONFIG_KEY, KUBE_API_PORT, KUBE_API_PORT_NAME,
    TALOS_API_PORT, TALOS_API_PORT_NAME, TALOS_CONTAINER_IMAGE, TALOS_PLATFORM_CONTAINER,
    TALOS_PLATFORM_ENV, TALOS_USERDATA_ENV, VOLUME_SIZE_ETC_CNI, VOLUME_SIZE_ETC_KUBERNETES,
    VOLUME_SIZE_SYSTEM_STATE, VOLUME_SIZE_USR_LIBEXEC_KUBERNETES, VOLUME_SIZE_VAR,
    WORKER_CONFIG_KEY,
};
use crate::crd::ConfigMapKeyRef;
use crate::labels::{
    APP_NAME_TALOS, COMPONENT_CONTROLPLANE, COMPONENT_WORKER, K8S_COMPONENT, K8S_INSTANCE,
    K8S_MANAGED_BY, K8S_NAME, K8S_PART_OF, MANAGED_BY_TALOS_OPERATOR, PART_OF_TALOS,
    STATEFULSET_POD_NAME,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use k8s_openapi::api::{
    apps::v1::{StatefulSet, StatefulSetSpec},
    core::v1::{
        ConfigMap, ConfigMapKeySelector, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
        EnvVarSource, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
        SeccompProfile, Secret, SecurityContext, Service, ServicePort, ServiceSpec, Volume,
        VolumeMount, VolumeResourceRequirements,
    },
};
use k8s_openapi::apimachinery::pkg::{
    api::resource::Quantity,
    apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference},
    util::intstr::IntOrString,
};
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::debug;

/// Name of the Talos container in node pods
pub const CONTAINER_NAME_TALOS: &str = "talos";

// Scratch directories backed by `emptyDir`
const EPHEMERAL_MOUNTS: [(&str, &str); 3] =
    [("run", "/run"), ("system", "/system"), ("tmp", "/tmp")];

/// Persistent volumes of a Talos node: claim name, mount path, size.
const PERSISTENT_MOUNTS: [(&str, &str, &str); 5] = [
    ("system-state", "/system/state", VOLUME_SIZE_SYSTEM_STATE),
    ("var", "/var", VOLUME_SIZE_VAR),
    ("etc-cni", "/etc/cni", VOLUME_SIZE_ETC_CNI),
    ("etc-kubernetes", "/etc/kubernetes", VOLUME_SIZE_ETC_KUBERNETES),
    (
        "usr-libexec-kubernetes",
        "/usr/libexec/kubernetes",
        VOLUME_SIZE_USR_LIBEXEC_KUBERNETES,
    ),
];

/// Inputs of a container-mode node set.
#[derive(Clone, Debug)]
pub struct NodeSetParams<'a> {
    /// Name of the owning control plane or worker, also the `StatefulSet` name
    pub name: &'a str,
    pub namespace: &'a str,
    pub replicas: i32,
    /// Talos version, used as image tag
    pub version: &'a str,
    pub machine_type: MachineType,
    pub storage_class_name: Option<&'a str>,
    /// External configuration. The generated `<name>-config` map is used otherwise.
    pub config_ref: Option<&'a ConfigMapKeyRef>,
}

/// Key of the generated configuration in the `<name>-config` map.
#[must_use]
pub fn config_key(machine_type: MachineType) -> &'static str {
    match machine_type {
        MachineType::ControlPlane => CONTROLPLANE_CONFIG_KEY,
        MachineType::Worker => WORKER_CONFIG_KEY,
    }
}

/// Name of the generated configuration map of `name`.
#[must_use]
pub fn config_map_name(name: &str) -> String {
    format!("{name}-{CONFIG_MAP_SUFFIX}")
}

/// Selector labels of the pods of a node set. Kept minimal so the selector never changes.
#[must_use]
pub fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

/// Builds the labels put on every object of a node set.
#[must_use]
pub fn build_labels(name: &str, machine_type: MachineType) -> BTreeMap<String, String> {
    let component = match machine_type {
        MachineType::ControlPlane => COMPONENT_CONTROLPLANE,
        MachineType::Worker => COMPONENT_WORKER,
    };
    let mut labels = selector_labels(name);
    labels.insert(K8S_NAME.into(), APP_NAME_TALOS.into());
    labels.insert(K8S_INSTANCE.into(), name.into());
    labels.insert(K8S_COMPONENT.into(), component.into());
    labels.insert(K8S_MANAGED_BY.into(), MANAGED_BY_TALOS_OPERATOR.into());
    labels.insert(K8S_PART_OF.into(), PART_OF_TALOS.into());
    labels
}

/// Builds a controller owner reference pointing at `owner`.
///
/// Deleting the owner cascades to every object carrying this reference.
#[must_use]
pub fn build_owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Builds a node `Service`.
///
/// With `replica` set the service selects exactly the pod `<name>-<replica>`,
/// otherwise it balances over every pod of the set.
#[must_use]
pub fn build_service(
    name: &str,
    namespace: &str,
    replica: Option<i32>,
    machine_type: MachineType,
    owner: &OwnerReference,
) -> Service {
    let mut selector = selector_labels(name);
    let service_name = match replica {
        Some(index) => {
            let pod = format!("{name}-{index}");
            selector.insert(STATEFULSET_POD_NAME.into(), pod.clone());
            pod
        }
        None => name.to_string(),
    };

    Service {
        metadata: ObjectMeta {
            name: Some(service_name),
            namespace: Some(namespace.into()),
            labels: Some(build_labels(name, machine_type)),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![
                service_port(TALOS_API_PORT_NAME, TALOS_API_PORT),
                service_port(KUBE_API_PORT_NAME, KUBE_API_PORT),
            ]),
            type_: Some("ClusterIP".into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds the cluster-facing service followed by one service per replica.
#[must_use]
pub fn build_services(
    name: &str,
    namespace: &str,
    replicas: i32,
    machine_type: MachineType,
    owner: &OwnerReference,
) -> Vec<Service> {
    std::iter::once(None)
        .chain((0..replicas).map(Some))
        .map(|replica| build_service(name, namespace, replica, machine_type, owner))
        .collect()
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.into()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

/// Builds the `StatefulSet` running container-mode Talos nodes.
#[must_use]
pub fn build_statefulset(params: &NodeSetParams<'_>, owner: &OwnerReference) -> StatefulSet {
    debug!(
        name = %params.name,
        namespace = %params.namespace,
        replicas = params.replicas,
        machine_type = %params.machine_type,
        "Building StatefulSet"
    );

    let labels = build_labels(params.name, params.machine_type);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(params.name.into()),
            namespace: Some(params.namespace.into()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(params.name.into()),
            replicas: Some(params.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(params.name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(build_pod_spec(params)),
            },
            volume_claim_templates: Some(
                PERSISTENT_MOUNTS
                    .iter()
                    .map(|(claim, _, size)| {
                        build_volume_claim(claim, size, params.storage_class_name)
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_pod_spec(params: &NodeSetParams<'_>) -> PodSpec {
    let userdata_source = match params.config_ref {
        Some(reference) => ConfigMapKeySelector {
            name: reference.name.clone(),
            key: reference.key.clone(),
            ..Default::default()
        },
        None => ConfigMapKeySelector {
            name: config_map_name(params.name),
            key: config_key(params.machine_type).into(),
            ..Default::default()
        },
    };

    let volume_mounts = EPHEMERAL_MOUNTS
        .iter()
        .map(|(name, path)| (*name, *path))
        .chain(PERSISTENT_MOUNTS.iter().map(|(name, path, _)| (*name, *path)))
        .map(|(name, path)| VolumeMount {
            name: name.into(),
            mount_path: path.into(),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: CONTAINER_NAME_TALOS.into(),
        image: Some(format!("{TALOS_CONTAINER_IMAGE}:{}", params.version)),
        env: Some(vec![
            EnvVar {
                name: TALOS_USERDATA_ENV.into(),
                value_from: Some(EnvVarSource {
                    config_map_key_ref: Some(userdata_source),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: TALOS_PLATFORM_ENV.into(),
                value: Some(TALOS_PLATFORM_CONTAINER.into()),
                ..Default::default()
            },
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some(TALOS_API_PORT_NAME.into()),
                container_port: TALOS_API_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some(KUBE_API_PORT_NAME.into()),
                container_port: KUBE_API_PORT,
                ..Default::default()
            },
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            read_only_root_filesystem: Some(true),
            seccomp_profile: Some(SeccompProfile {
                type_: "Unconfined".into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    PodSpec {
        containers: vec![container],
        volumes: Some(
            EPHEMERAL_MOUNTS
                .iter()
                .map(|(name, _)| Volume {
                    name: (*name).into(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    }
}

fn build_volume_claim(
    name: &str,
    size: &str,
    storage_class_name: Option<&str>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            storage_class_name: storage_class_name.map(Into::into),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds the `<name>-config` map holding the base64 encoded configuration.
#[must_use]
pub fn build_config_map(
    name: &str,
    namespace: &str,
    machine_type: MachineType,
    config: &str,
    owner: &OwnerReference,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(name)),
            namespace: Some(namespace.into()),
            labels: Some(build_labels(name, machine_type)),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            config_key(machine_type).to_string(),
            BASE64.encode(config),
        )])),
        ..Default::default()
    }
}

/// Builds an opaque `Secret` with a single key.
#[must_use]
pub fn build_secret(
    name: &str,
    namespace: &str,
    key: &str,
    value: &str,
    owner: &OwnerReference,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            labels: Some(BTreeMap::from([
                (K8S_MANAGED_BY.to_string(), MANAGED_BY_TALOS_OPERATOR.to_string()),
                (K8S_PART_OF.to_string(), PART_OF_TALOS.to_string()),
            ])),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        type_: Some("Opaque".into()),
        data: Some(BTreeMap::from([(
            key.to_string(),
            ByteString(value.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

#[cfg(test)]
#[path = "synthesis_tests.rs"]
mod synthesis_tests;
