// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Machine configuration and talosconfig generation.
//!
//! [`generate_config`] renders the Talos machine configuration of one role from a
//! [`BundleDescriptor`] and a [`SecretsBundle`]. The output is deterministic for
//! identical inputs: documents are built as ordered JSON values and serialized
//! to YAML, and nothing time-dependent is embedded.

use super::descriptor::{endpoint_host, BundleDescriptor, VersionContract};
use super::patch::{apply_patches, PatchOperation};
use super::secrets::SecretsBundle;
use crate::constants::{DEFAULT_CLUSTER_DOMAIN, TALOS_INSTALLER_IMAGE};
use crate::crd::MachineSpec;
use crate::errors::BundleError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

const KUBELET_IMAGE: &str = "ghcr.io/siderolabs/kubelet";
const KUBE_APISERVER_IMAGE: &str = "registry.k8s.io/kube-apiserver";
const KUBE_CONTROLLER_MANAGER_IMAGE: &str = "registry.k8s.io/kube-controller-manager";
const KUBE_SCHEDULER_IMAGE: &str = "registry.k8s.io/kube-scheduler";
const KUBE_PROXY_IMAGE: &str = "registry.k8s.io/kube-proxy";

const DEFAULT_INSTALL_DISK: &str = "/dev/sda";
const DEFAULT_POD_SUBNET: &str = "10.244.0.0/16";
const DEFAULT_SERVICE_SUBNET: &str = "10.96.0.0/12";
const KUBE_PRISM_PORT: u16 = 7445;

/// Volume document appended to machine configuration when the image cache is enabled.
pub const IMAGE_CACHE_VOLUME_CONFIG: &str = "---
apiVersion: v1alpha1
kind: VolumeConfig
name: IMAGECACHE
provisioning:
  diskSelector:
    match: system_disk
";

/// Role a machine configuration is generated for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineType {
    ControlPlane,
    Worker,
}

impl MachineType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControlPlane => "controlplane",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generates the machine configuration of `machine_type`.
///
/// Patches are applied after the built-in ones: CIDR overrides from the
/// descriptor and, for control planes, removal of the admission control
/// defaults. Callers pass machine-specific overrides in `patches`.
///
/// # Errors
///
/// Returns [`BundleError::InvalidVersion`] if the Talos version does not parse,
/// [`BundleError::MissingField`] for an incomplete descriptor and
/// [`BundleError::PatchFailed`] if a patch cannot be applied.
pub fn generate_config(
    descriptor: &BundleDescriptor,
    secrets: &SecretsBundle,
    machine_type: MachineType,
    patches: &[PatchOperation],
) -> Result<String, BundleError> {
    descriptor.validate()?;
    let contract = VersionContract::parse(&descriptor.version)?;

    let mut document = base_document(descriptor, secrets, machine_type, contract);

    let mut operations = cidr_patches(descriptor);
    if machine_type == MachineType::ControlPlane {
        operations.push(PatchOperation::remove("/cluster/apiServer/admissionControl"));
    }
    operations.extend_from_slice(patches);
    apply_patches(&mut document, &operations)?;

    serde_yaml::to_string(&document).map_err(|source| BundleError::Serialize {
        what: "machine configuration",
        source,
    })
}

/// Patches replacing the default pod and service subnets. Empty lists produce no patch.
#[must_use]
pub fn cidr_patches(descriptor: &BundleDescriptor) -> Vec<PatchOperation> {
    let mut patches = Vec::new();
    if !descriptor.pod_cidr.is_empty() {
        patches.push(PatchOperation::replace(
            "/cluster/network/podSubnets",
            json!(descriptor.pod_cidr),
        ));
    }
    if !descriptor.service_cidr.is_empty() {
        patches.push(PatchOperation::replace(
            "/cluster/network/serviceSubnets",
            json!(descriptor.service_cidr),
        ));
    }
    patches
}

/// Patches for a metal machine: install disk and image plus the optional features
/// selected in its [`MachineSpec`].
///
/// `install_disk` is the disk resolved for this machine (from the spec or
/// discovered on the node). The default disk of the base document is kept when it is `None`.
#[must_use]
pub fn machine_patches(
    spec: Option<&MachineSpec>,
    install_disk: Option<&str>,
    version: &str,
) -> Vec<PatchOperation> {
    let mut patches = Vec::new();
    if let Some(disk) = install_disk {
        patches.push(PatchOperation::replace("/machine/install/disk", json!(disk)));
    }
    let default_spec = MachineSpec::default();
    let spec = spec.unwrap_or(&default_spec);

    if spec.wipe {
        patches.push(PatchOperation::replace("/machine/install/wipe", json!(true)));
    }
    patches.push(PatchOperation::replace(
        "/machine/install/image",
        json!(installer_image(spec.image.as_deref(), version)),
    ));
    if spec.air_gap {
        patches.push(PatchOperation::add("/machine/time", json!({ "disabled": true })));
        patches.push(PatchOperation::replace(
            "/cluster/discovery/enabled",
            json!(false),
        ));
    }
    if spec.image_cache {
        patches.push(PatchOperation::add(
            "/machine/features/imageCache",
            json!({ "localEnabled": true }),
        ));
    }
    if spec.allow_scheduling_on_control_planes {
        patches.push(PatchOperation::add(
            "/cluster/allowSchedulingOnControlPlanes",
            json!(true),
        ));
    }
    patches
}

/// Appends [`IMAGE_CACHE_VOLUME_CONFIG`] as a second document when the image
/// cache is enabled in `spec`.
#[must_use]
pub fn with_image_cache_volume(mut config: String, spec: Option<&MachineSpec>) -> String {
    if spec.is_some_and(|s| s.image_cache) {
        if !config.ends_with('\n') {
            config.push('\n');
        }
        config.push_str(IMAGE_CACHE_VOLUME_CONFIG);
    }
    config
}

/// Installer image for `version`. A custom image gets the version as tag unless
/// it already carries a tag or digest.
#[must_use]
pub fn installer_image(image: Option<&str>, version: &str) -> String {
    match image.filter(|i| !i.is_empty()) {
        Some(image) if has_tag(image) => image.to_string(),
        Some(image) => format!("{image}:{version}"),
        None => format!("{TALOS_INSTALLER_IMAGE}:{version}"),
    }
}

fn has_tag(image: &str) -> bool {
    if image.contains('@') {
        return true;
    }
    // A colon before the last slash belongs to a registry port.
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    last_segment.contains(':')
}

/// Talos client configuration (`talosconfig`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TalosConfig {
    pub context: String,
    pub contexts: BTreeMap<String, TalosConfigContext>,
}

/// One context of a talosconfig.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TalosConfigContext {
    pub endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
    pub ca: String,
    pub crt: String,
    pub key: String,
}

/// Builds an admin talosconfig for the cluster, issuing a fresh client
/// certificate from the bundle clock.
///
/// # Errors
///
/// Returns [`BundleError::KeyGeneration`] if the client certificate cannot be
/// issued and [`BundleError::Serialize`] if rendering fails.
pub fn generate_talosconfig(
    descriptor: &BundleDescriptor,
    secrets: &SecretsBundle,
) -> Result<String, BundleError> {
    let admin = secrets.issue_admin_certificate()?;
    let context = TalosConfigContext {
        endpoints: descriptor.node_endpoints(),
        nodes: Vec::new(),
        ca: secrets.certs.os.crt.clone(),
        crt: admin.crt,
        key: admin.key,
    };
    let config = TalosConfig {
        context: descriptor.cluster_name.clone(),
        contexts: BTreeMap::from([(descriptor.cluster_name.clone(), context)]),
    };
    serde_yaml::to_string(&config).map_err(|source| BundleError::Serialize {
        what: "talosconfig",
        source,
    })
}

fn with_v_prefix(version: &str) -> String {
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{version}")
    }
}

fn base_document(
    descriptor: &BundleDescriptor,
    secrets: &SecretsBundle,
    machine_type: MachineType,
    contract: VersionContract,
) -> Value {
    let kube_tag = with_v_prefix(&descriptor.kube_version);
    let control_plane = machine_type == MachineType::ControlPlane;

    let mut features = json!({
        "rbac": true,
        "stableHostname": true,
        "apidCheckExtKeyUsage": true,
        "diskQuotaSupport": true,
    });
    if contract.kube_prism_enabled() {
        features["kubePrism"] = json!({ "enabled": true, "port": KUBE_PRISM_PORT });
    }
    if contract.host_dns_enabled() {
        features["hostDNS"] = json!({ "enabled": true, "forwardKubeDNSToHost": true });
    }

    let os_ca = if control_plane {
        secrets.certs.os.clone()
    } else {
        secrets.certs.os.public_only()
    };
    let k8s_ca = if control_plane {
        secrets.certs.k8s.clone()
    } else {
        secrets.certs.k8s.public_only()
    };

    let mut cert_sans = vec![endpoint_host(&descriptor.endpoint).to_string()];
    for san in &descriptor.sans {
        if !cert_sans.contains(san) {
            cert_sans.push(san.clone());
        }
    }

    let mut document = json!({
        "version": "v1alpha1",
        "debug": false,
        "persist": true,
        "machine": {
            "type": machine_type.as_str(),
            "token": secrets.trustdinfo.token,
            "ca": os_ca,
            "certSANs": cert_sans,
            "kubelet": {
                "image": format!("{KUBELET_IMAGE}:{kube_tag}"),
                "defaultRuntimeSeccompProfileEnabled": true,
                "disableManifestsDirectory": true,
            },
            "network": {},
            "install": {
                "disk": DEFAULT_INSTALL_DISK,
                "image": installer_image(None, &descriptor.version),
                "wipe": false,
            },
            "features": features,
        },
        "cluster": {
            "id": secrets.cluster.id,
            "secret": secrets.cluster.secret,
            "controlPlane": { "endpoint": descriptor.endpoint },
            "clusterName": descriptor.cluster_name,
            "network": {
                "dnsDomain": descriptor
                    .cluster_domain
                    .as_deref()
                    .unwrap_or(DEFAULT_CLUSTER_DOMAIN),
                "podSubnets": [DEFAULT_POD_SUBNET],
                "serviceSubnets": [DEFAULT_SERVICE_SUBNET],
            },
            "token": secrets.secrets.bootstrap_token,
            "ca": k8s_ca,
            "discovery": {
                "enabled": true,
                "registries": {
                    "kubernetes": { "disabled": true },
                    "service": {},
                },
            },
        },
    });

    if control_plane {
        document["cluster"]["secretboxEncryptionSecret"] =
            json!(secrets.secrets.secretbox_encryption_secret);
        document["cluster"]["aggregatorCA"] = json!(secrets.certs.k8s_aggregator);
        document["cluster"]["serviceAccount"] =
            json!({ "key": secrets.certs.k8s_service_account.key });
        document["cluster"]["apiServer"] = json!({
            "image": format!("{KUBE_APISERVER_IMAGE}:{kube_tag}"),
            "certSANs": cert_sans,
            "disablePodSecurityPolicy": true,
            "admissionControl": [{
                "name": "PodSecurity",
                "configuration": {
                    "apiVersion": "pod-security.admission.config.k8s.io/v1alpha1",
                    "kind": "PodSecurityConfiguration",
                    "defaults": {
                        "audit": "restricted",
                        "audit-version": "latest",
                        "enforce": "baseline",
                        "enforce-version": "latest",
                        "warn": "restricted",
                        "warn-version": "latest",
                    },
                    "exemptions": { "namespaces": ["kube-system"] },
                },
            }],
        });
        document["cluster"]["controllerManager"] =
            json!({ "image": format!("{KUBE_CONTROLLER_MANAGER_IMAGE}:{kube_tag}") });
        document["cluster"]["scheduler"] =
            json!({ "image": format!("{KUBE_SCHEDULER_IMAGE}:{kube_tag}") });
        document["cluster"]["proxy"] = json!({ "image": format!("{KUBE_PROXY_IMAGE}:{kube_tag}") });
        document["cluster"]["etcd"] = json!({ "ca": secrets.certs.etcd });
    }

    document
}

#[cfg(test)]
#[path = "builder_tests.rs"]
mod builder_tests;
