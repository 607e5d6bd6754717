// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Custom Resource Definitions (CRDs) for Talos cluster lifecycle management.
//!
//! This module defines all Kubernetes Custom Resource Definitions used by the
//! operator to provision and lifecycle Talos-based Kubernetes clusters.
//!
//! # Resource Types
//!
//! ## Cluster Topology
//!
//! - [`TalosCluster`] - Top-level cluster, inline or referenced control plane and workers
//! - [`TalosControlPlane`] - Control plane nodes, secrets bundle and bootstrap
//! - [`TalosWorker`] - Worker nodes joined to a control plane
//! - [`TalosMachine`] - A single metal node driven through the node OS API
//!
//! ## Operations
//!
//! - [`TalosEtcdBackup`] - One-off etcd snapshot uploaded to object storage
//! - [`TalosEtcdBackupSchedule`] - Cron-driven backups with retention
//! - [`TalosAddon`] - Helm chart installed into a managed cluster
//! - [`TalosClusterAddon`] - Helm chart fanned out to every selected control plane
//! - [`TalosClusterAddonRelease`] - One chart install into one control plane's cluster
//!
//! # Example: Inline Cluster
//!
//! ```rust,no_run
//! use talos_operator::crd::{DeploymentMode, TalosClusterSpec, TalosControlPlaneSpec};
//!
//! let spec = TalosClusterSpec {
//!     control_plane: Some(TalosControlPlaneSpec {
//!         mode: DeploymentMode::Container,
//!         replicas: 3,
//!         version: "v1.10.4".to_string(),
//!         kube_version: "v1.31.0".to_string(),
//!         ..Default::default()
//!     }),
//!     ..Default::default()
//! };
//! assert!(spec.validate().is_ok());
//! ```

use crate::errors::ValidationError;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

fn default_talos_version() -> String {
    crate::constants::DEFAULT_TALOS_VERSION.to_string()
}

fn default_kube_version() -> String {
    crate::constants::DEFAULT_KUBE_VERSION.to_string()
}

fn default_cluster_domain() -> String {
    crate::constants::DEFAULT_CLUSTER_DOMAIN.to_string()
}

fn default_replicas() -> i32 {
    1
}

fn default_target_namespace() -> String {
    "default".to_string()
}

/// Condition represents an observation of a resource's current state.
///
/// Conditions are used in status subresources to communicate the state of
/// a resource to users and controllers.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition. Common types include: Ready, Available, Progressing, Deleting, Failed.
    pub r#type: String,

    /// Status of the condition: True, False, or Unknown.
    pub status: String,

    /// Brief CamelCase reason for the condition's last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message indicating details about the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition transitioned from one status to another (RFC3339 format).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// How the nodes of a control plane or worker pool are run.
///
/// The mode is fixed at creation time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Nodes run as privileged pods of a `StatefulSet` in the management cluster.
    #[default]
    Container,
    /// Nodes are pre-existing machines reached through the node OS API.
    Metal,
    /// Nodes are cloud instances provisioned by a cloud provisioner.
    Cloud,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Container => "container",
            Self::Metal => "metal",
            Self::Cloud => "cloud",
        };
        f.write_str(s)
    }
}

/// Lifecycle state reported in `status.state`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum LifecycleState {
    /// Configuration generated, nodes not yet up
    Pending,
    /// Machine is installing its first configuration
    Installing,
    /// Machine is upgrading to a new version
    Upgrading,
    /// Nodes are up and accept configuration / bootstrap
    Available,
    /// etcd has been bootstrapped
    Bootstrapped,
    /// Fully operational
    Ready,
    /// A terminal failure was observed
    Failed,
    /// The owning control plane or worker no longer exists
    Orphaned,
}

impl LifecycleState {
    /// Returns the state as it appears in status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Installing => "Installing",
            Self::Upgrading => "Upgrading",
            Self::Available => "Available",
            Self::Bootstrapped => "Bootstrapped",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
            Self::Orphaned => "Orphaned",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an object in the same namespace.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectReference {
    /// Name of the referenced object.
    pub name: String,
}

/// Relationship between a label key and a set of values.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A label selector requirement: a key, an operator and values.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct LabelSelectorRequirement {
    /// The label key that the selector applies to.
    pub key: String,

    /// Operator represents a key's relationship to a set of values.
    pub operator: SelectorOperator,

    /// Values for `In` and `NotIn`. Must be empty for `Exists` and `DoesNotExist`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Label query over a set of resources.
///
/// `matchLabels` and `matchExpressions` are ANDed. An empty selector matches
/// every object.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Map of {key,value} pairs, each equivalent to an `In` requirement with a
    /// single value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    /// List of label selector requirements.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    /// Renders the selector in list query syntax (`k=v,k in (a,b),!k`).
    /// Returns `None` for an empty selector.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidSelector`] when `In`/`NotIn` has no
    /// values or `Exists`/`DoesNotExist` has some.
    pub fn to_query(&self) -> Result<Option<String>, ValidationError> {
        let mut parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        for requirement in &self.match_expressions {
            let key = &requirement.key;
            let values = requirement.values.join(",");
            let invalid = |reason| ValidationError::InvalidSelector {
                key: key.clone(),
                reason,
            };
            let part = match requirement.operator {
                SelectorOperator::In | SelectorOperator::NotIn if values.is_empty() => {
                    return Err(invalid("values are required"));
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist if !values.is_empty() => {
                    return Err(invalid("values must be empty"));
                }
                SelectorOperator::In => format!("{key} in ({values})"),
                SelectorOperator::NotIn => format!("{key} notin ({values})"),
                SelectorOperator::Exists => key.clone(),
                SelectorOperator::DoesNotExist => format!("!{key}"),
            };
            parts.push(part);
        }

        Ok(if parts.is_empty() {
            None
        } else {
            Some(parts.join(","))
        })
    }
}

/// Selects a key of a `ConfigMap` in the same namespace.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub struct ConfigMapKeyRef {
    /// Name of the `ConfigMap`.
    pub name: String,
    /// Key inside the `ConfigMap`.
    pub key: String,
}

/// Selects a key of a `Secret` in the same namespace.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub struct SecretKeyRef {
    /// Name of the `Secret`.
    pub name: String,
    /// Key inside the `Secret`.
    pub key: String,
}

/// Install settings applied to metal machines.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Disk Talos installs itself onto (e.g. `/dev/sda`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(regex(pattern = r"^/dev/[a-z]+[0-9]*(n[0-9]+(p[0-9]+)?)?$"))]
    pub install_disk: Option<String>,

    /// Wipe the install disk before installation.
    #[serde(default)]
    pub wipe: bool,

    /// Installer image. The Talos version is appended as tag unless the image already has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Machine runs without access to public registries.
    #[serde(default)]
    pub air_gap: bool,

    /// Enable the local image cache.
    #[serde(default)]
    pub image_cache: bool,

    /// Allow workloads on control plane nodes.
    #[serde(default)]
    pub allow_scheduling_on_control_planes: bool,

    /// Static network settings written to the node META partition before the
    /// configuration is applied. Only used when the operator runs with
    /// `--enable-meta-key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MachineMeta>,
}

/// Static network settings of a machine without DHCP.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineMeta {
    /// Hostname of the machine.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    /// Link the address and default route are bound to (e.g. `eth0`).
    pub interface: String,

    /// Prefix length of the machine address.
    #[schemars(range(min = 1, max = 128))]
    pub subnet: u8,

    /// Default gateway.
    pub gateway: String,

    /// DNS servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
}

/// Metal mode settings: the machine addresses and their install settings.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetalSpec {
    /// Addresses of the machines (IP or hostname reachable on the node OS API port).
    #[serde(default)]
    pub machines: Vec<String>,

    /// Install settings shared by every machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_spec: Option<MachineSpec>,
}

/// Cloud mode settings handed to the cloud provisioner.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloudSpec {
    /// Cloud provider name (e.g. `gcp`).
    pub provider: String,

    /// Region the instances are created in.
    pub region: String,

    /// Zone the instances are created in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    /// Instance type / machine type.
    pub instance_type: String,

    /// Boot image for the instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// `TalosControlPlane` runs the control plane nodes of a cluster.
///
/// The control plane owns the secrets bundle of the cluster. It is generated once,
/// persisted in status and reused by every worker and machine joining the cluster.
///
/// # Example
///
/// ```yaml
/// apiVersion: talos.alperen.cloud/v1alpha1
/// kind: TalosControlPlane
/// metadata:
///   name: c1-controlplane
///   namespace: default
/// spec:
///   mode: container
///   replicas: 3
///   version: v1.10.4
///   kubeVersion: v1.31.0
///   podCIDR: ["10.244.0.0/16"]
/// ```
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "talos.alperen.cloud",
    version = "v1alpha1",
    kind = "TalosControlPlane",
    namespaced,
    doc = "TalosControlPlane runs the control plane nodes of a Talos cluster, generates and persists its secrets bundle and machine configuration, bootstraps etcd and publishes the kubeconfig."
)]
#[kube(status = "TalosControlPlaneStatus")]
#[serde(rename_all = "camelCase")]
pub struct TalosControlPlaneSpec {
    /// Talos version (e.g. `v1.10.3`).
    #[serde(default = "default_talos_version")]
    #[schemars(regex(pattern = r"^v\d+\.\d+\.\d+(-\w+)?$"))]
    pub version: String,

    /// Deployment mode, immutable after creation.
    #[serde(default)]
    pub mode: DeploymentMode,

    /// Number of control plane nodes (container and cloud modes).
    #[serde(default = "default_replicas")]
    #[schemars(range(min = 1))]
    pub replicas: i32,

    /// Metal mode settings.
    #[serde(default)]
    pub metal_spec: MetalSpec,

    /// Cloud mode settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_spec: Option<CloudSpec>,

    /// Kubernetes API endpoint. Defaults to `https://<name>:6443`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(regex(pattern = r"^https?://[a-zA-Z0-9.-]+(:\d+)?$"))]
    pub endpoint: Option<String>,

    /// Kubernetes version (e.g. `v1.33.1`).
    #[serde(default = "default_kube_version")]
    #[schemars(regex(pattern = r"^v\d+\.\d+\.\d+(-\w+)?$"))]
    pub kube_version: String,

    /// Cluster DNS domain.
    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,

    /// Storage class of the node volumes (container mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Pod network CIDRs.
    #[serde(default, rename = "podCIDR")]
    pub pod_cidr: Vec<String>,

    /// Service network CIDRs.
    #[serde(default, rename = "serviceCIDR")]
    pub service_cidr: Vec<String>,

    /// Externally supplied machine configuration, used instead of the generated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ConfigMapKeyRef>,
}

/// `TalosControlPlane` status
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TalosControlPlaneStatus {
    /// Current lifecycle state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generated control plane machine configuration.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config: String,

    /// Serialized secrets bundle. Written once, never regenerated.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_bundle: String,

    /// Serialized bundle descriptor used to rebuild node OS clients.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bundle_config: String,

    /// Kubernetes version observed on the running control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_kube_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// `TalosWorker` runs worker nodes joined to a control plane.
///
/// # Example
///
/// ```yaml
/// apiVersion: talos.alperen.cloud/v1alpha1
/// kind: TalosWorker
/// metadata:
///   name: c1-worker
/// spec:
///   mode: metal
///   version: v1.10.4
///   kubeVersion: v1.31.0
///   controlPlaneRef:
///     name: c1-controlplane
///   metalSpec:
///     machines: ["10.0.0.21", "10.0.0.22"]
///     machineSpec:
///       installDisk: /dev/sda
/// ```
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "talos.alperen.cloud",
    version = "v1alpha1",
    kind = "TalosWorker",
    namespaced,
    doc = "TalosWorker runs Talos worker nodes that join the cluster of the referenced TalosControlPlane, either as container pods or as metal machines."
)]
#[kube(status = "TalosWorkerStatus")]
#[serde(rename_all = "camelCase")]
pub struct TalosWorkerSpec {
    /// Talos version.
    #[serde(default = "default_talos_version")]
    #[schemars(regex(pattern = r"^v\d+\.\d+\.\d+(-\w+)?$"))]
    pub version: String,

    /// Deployment mode, immutable after creation.
    #[serde(default)]
    pub mode: DeploymentMode,

    /// Number of worker nodes (container mode).
    #[serde(default = "default_replicas")]
    #[schemars(range(min = 1))]
    pub replicas: i32,

    /// Metal mode settings.
    #[serde(default)]
    pub metal_spec: MetalSpec,

    /// Kubernetes version.
    #[serde(default = "default_kube_version")]
    #[schemars(regex(pattern = r"^v\d+\.\d+\.\d+(-\w+)?$"))]
    pub kube_version: String,

    /// Storage class of the node volumes (container mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// The control plane these workers join.
    #[serde(default)]
    pub control_plane_ref: LocalObjectReference,

    /// Externally supplied machine configuration, used instead of the generated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ConfigMapKeyRef>,
}

/// `TalosWorker` status
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TalosWorkerStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generated worker machine configuration.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Role of a machine in its cluster.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum MachineRole {
    /// Control plane node, owned by a `TalosControlPlane`.
    ControlPlane,
    /// Worker node, owned by a `TalosWorker`.
    Worker,
}

/// The control plane or worker a machine belongs to.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct MachineParentRef {
    /// Role of the machine, selects the kind of the parent.
    pub role: MachineRole,
    /// Name of the parent `TalosControlPlane` or `TalosWorker`.
    pub name: String,
}

/// `TalosMachine` drives a single node through the node OS API.
///
/// # Example
///
/// ```yaml
/// apiVersion: talos.alperen.cloud/v1alpha1
/// kind: TalosMachine
/// metadata:
///   name: c1-worker-10.0.0.21
/// spec:
///   endpoint: 10.0.0.21
///   version: v1.10.4
///   parentRef:
///     role: Worker
///     name: c1-worker
/// ```
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "talos.alperen.cloud",
    version = "v1alpha1",
    kind = "TalosMachine",
    namespaced,
    doc = "TalosMachine applies generated Talos configuration to one node through the node OS API, installing and upgrading it."
)]
#[kube(status = "TalosMachineStatus")]
#[serde(rename_all = "camelCase")]
pub struct TalosMachineSpec {
    /// Node OS API endpoint of the machine.
    pub endpoint: String,

    /// Desired Talos version.
    #[serde(default = "default_talos_version")]
    pub version: String,

    /// Install settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_spec: Option<MachineSpec>,

    /// Parent control plane or worker. Without it the machine is left alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<MachineParentRef>,

    /// Externally supplied machine configuration, used instead of the generated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ConfigMapKeyRef>,
}

/// `TalosMachine` status
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TalosMachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,

    /// Last configuration applied to the node.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config: String,

    /// Talos version the node was last installed or upgraded to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub observed_version: String,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// `TalosCluster` is the top-level resource of a cluster.
///
/// Each role is given either inline (the operator creates `<name>-controlplane` /
/// `<name>-worker`) or as a reference to an existing object, never both.
///
/// # Example
///
/// ```yaml
/// apiVersion: talos.alperen.cloud/v1alpha1
/// kind: TalosCluster
/// metadata:
///   name: c1
/// spec:
///   controlPlane:
///     mode: container
///     replicas: 3
///     version: v1.10.4
///     kubeVersion: v1.31.0
///   worker:
///     mode: container
///     replicas: 3
///     version: v1.10.4
///     kubeVersion: v1.31.0
/// ```
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "talos.alperen.cloud",
    version = "v1alpha1",
    kind = "TalosCluster",
    namespaced,
    doc = "TalosCluster creates or links the TalosControlPlane and TalosWorker of a cluster and deletes them in order when removed."
)]
#[kube(status = "TalosClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct TalosClusterSpec {
    /// Inline control plane, created as `<name>-controlplane`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<TalosControlPlaneSpec>,

    /// Existing control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<LocalObjectReference>,

    /// Inline worker pool, created as `<name>-worker`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<TalosWorkerSpec>,

    /// Existing worker pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_ref: Option<LocalObjectReference>,
}

impl TalosClusterSpec {
    /// Checks that no role is given both inline and by reference.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MutuallyExclusive`] naming the conflicting fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.control_plane.is_some() && self.control_plane_ref.is_some() {
            return Err(ValidationError::MutuallyExclusive {
                first: "controlPlane",
                second: "controlPlaneRef",
            });
        }
        if self.worker.is_some() && self.worker_ref.is_some() {
            return Err(ValidationError::MutuallyExclusive {
                first: "worker",
                second: "workerRef",
            });
        }
        Ok(())
    }
}

/// `TalosCluster` status
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TalosClusterStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// S3-compatible storage destination.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3Storage {
    /// Bucket name.
    pub bucket: String,

    /// Bucket region.
    pub region: String,

    /// Custom endpoint for S3-compatible services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Secret key holding the access key id.
    #[serde(rename = "accessKeyID")]
    pub access_key_id: SecretKeyRef,

    /// Secret key holding the secret access key.
    pub secret_access_key: SecretKeyRef,

    /// Skip TLS verification of the endpoint.
    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,
}

/// Where a backup is uploaded.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub struct BackupStorage {
    /// S3-compatible destination.
    pub s3: S3Storage,
}

/// `TalosEtcdBackup` takes one etcd snapshot of a control plane and uploads it.
///
/// # Example
///
/// ```yaml
/// apiVersion: talos.alperen.cloud/v1alpha1
/// kind: TalosEtcdBackup
/// metadata:
///   name: c1-manual
/// spec:
///   talosControlPlaneRef:
///     name: c1-controlplane
///   backupStorage:
///     s3:
///       bucket: backups
///       region: eu-west-1
///       accessKeyID: { name: s3-creds, key: access-key }
///       secretAccessKey: { name: s3-creds, key: secret-key }
/// ```
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "talos.alperen.cloud",
    version = "v1alpha1",
    kind = "TalosEtcdBackup",
    namespaced,
    doc = "TalosEtcdBackup takes a single etcd snapshot from a TalosControlPlane and uploads it to S3-compatible object storage."
)]
#[kube(status = "TalosEtcdBackupStatus")]
#[serde(rename_all = "camelCase")]
pub struct TalosEtcdBackupSpec {
    /// Control plane to snapshot.
    pub talos_control_plane_ref: LocalObjectReference,

    /// Upload destination.
    pub backup_storage: BackupStorage,
}

/// `TalosEtcdBackup` status
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TalosEtcdBackupStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Object key of the uploaded snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_key: Option<String>,
}

/// Template for the backups a schedule creates.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
pub struct TalosEtcdBackupTemplateSpec {
    /// Spec copied into every created `TalosEtcdBackup`.
    pub spec: TalosEtcdBackupSpec,
}

/// `TalosEtcdBackupSchedule` creates `TalosEtcdBackup` objects on a cron schedule.
///
/// # Example
///
/// ```yaml
/// apiVersion: talos.alperen.cloud/v1alpha1
/// kind: TalosEtcdBackupSchedule
/// metadata:
///   name: c1-nightly
/// spec:
///   schedule: "0 2 * * *"
///   retention: 7
///   backupTemplate:
///     spec:
///       talosControlPlaneRef: { name: c1-controlplane }
///       backupStorage:
///         s3: { bucket: backups, region: eu-west-1, accessKeyID: { name: s3, key: id }, secretAccessKey: { name: s3, key: secret } }
/// ```
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "talos.alperen.cloud",
    version = "v1alpha1",
    kind = "TalosEtcdBackupSchedule",
    namespaced,
    doc = "TalosEtcdBackupSchedule creates TalosEtcdBackup resources on a cron schedule and garbage-collects successful backups beyond the retention count."
)]
#[kube(status = "TalosEtcdBackupScheduleStatus")]
#[serde(rename_all = "camelCase")]
pub struct TalosEtcdBackupScheduleSpec {
    /// Standard 5-field cron expression (e.g. `0 2 * * *`).
    #[schemars(length(min = 1))]
    pub schedule: String,

    /// Template of the created backups.
    pub backup_template: TalosEtcdBackupTemplateSpec,

    /// Number of successful backups to keep (default 5).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub retention: Option<i32>,

    /// Suspend the schedule.
    #[serde(default)]
    pub paused: bool,
}

/// `TalosEtcdBackupSchedule` status
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TalosEtcdBackupScheduleStatus {
    /// Last time a backup was created (RFC3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<String>,

    /// Creation time of the newest successful backup (RFC3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_backup_time: Option<String>,

    /// Next time a backup will be created (RFC3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_schedule_time: Option<String>,

    /// Backups of this schedule that have not succeeded yet.
    #[serde(default)]
    pub active_backups: Vec<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Kind of object a values reference points at.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ValuesSourceKind {
    ConfigMap,
    Secret,
}

/// Chart values read from a `ConfigMap` or `Secret`.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ValuesReference {
    /// Kind of the source object.
    pub kind: ValuesSourceKind,
    /// Name of the source object.
    pub name: String,
    /// Single key to read. All keys are read when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Helm chart to install.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    /// Chart name.
    pub chart_name: String,

    /// Chart repository URL.
    #[serde(rename = "repoURL")]
    pub repo_url: String,

    /// Chart version. Latest when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Release name. Defaults to the addon name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Namespace the release is installed into.
    #[serde(default = "default_target_namespace")]
    pub target_namespace: String,

    /// Inline values, applied after `valuesFrom`.
    #[serde(default)]
    pub values: BTreeMap<String, String>,

    /// Values read from `ConfigMap`s and `Secret`s.
    #[serde(default)]
    pub values_from: Vec<ValuesReference>,
}

/// `TalosAddon` installs a Helm chart into a managed cluster.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "talos.alperen.cloud",
    version = "v1alpha1",
    kind = "TalosAddon",
    namespaced,
    shortname = "ta",
    doc = "TalosAddon installs or upgrades a Helm chart in the cluster of the referenced TalosCluster using its kubeconfig."
)]
#[kube(status = "TalosAddonStatus")]
#[serde(rename_all = "camelCase")]
pub struct TalosAddonSpec {
    /// Cluster the chart is installed into.
    pub cluster_ref: LocalObjectReference,

    /// Chart to install.
    pub helm_release: HelmReleaseSpec,
}

/// `TalosAddon` status
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TalosAddonStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Revision of the last successful install or upgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// `TalosClusterAddon` installs one Helm chart into every selected control plane.
///
/// Each `TalosControlPlane` in the addon's namespace matching `clusterSelector`
/// gets a `TalosClusterAddonRelease` named `<controlPlane>-<addon>-addonrelease`.
/// Releases of control planes that stop matching are deleted.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "talos.alperen.cloud",
    version = "v1alpha1",
    kind = "TalosClusterAddon",
    namespaced,
    shortname = "tca",
    doc = "TalosClusterAddon installs a Helm chart into every TalosControlPlane matching its cluster selector by creating one TalosClusterAddonRelease per control plane."
)]
#[kube(status = "TalosClusterAddonStatus")]
#[serde(rename_all = "camelCase")]
pub struct TalosClusterAddonSpec {
    /// Control planes the chart is installed into. Empty selects every control plane.
    #[serde(default)]
    pub cluster_selector: LabelSelector,

    /// Chart to install.
    pub helm_release: HelmReleaseSpec,
}

/// `TalosClusterAddon` status
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TalosClusterAddonStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Names of the control planes that currently have a release.
    #[serde(default)]
    pub matched_control_planes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// `TalosClusterAddonRelease` installs a chart into the cluster of one control plane.
///
/// Usually created by a `TalosClusterAddon`.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[kube(
    group = "talos.alperen.cloud",
    version = "v1alpha1",
    kind = "TalosClusterAddonRelease",
    namespaced,
    shortname = "tcar",
    doc = "TalosClusterAddonRelease installs or upgrades a Helm chart in the cluster of the referenced TalosControlPlane using its kubeconfig."
)]
#[kube(status = "TalosAddonStatus")]
#[serde(rename_all = "camelCase")]
pub struct TalosClusterAddonReleaseSpec {
    /// `TalosControlPlane` whose cluster receives the chart.
    pub cluster_ref: LocalObjectReference,

    /// Chart to install.
    pub helm_release: HelmReleaseSpec,
}
