// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Bundle descriptor and version contract.
//!
//! A [`BundleDescriptor`] carries everything needed to generate machine
//! configuration for a cluster or to build a node OS client for it, except the
//! secrets bundle itself. Control planes persist it in `status.bundleConfig` so
//! workers and machines can rebuild it without re-deriving it from a spec.

use crate::errors::BundleError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Cluster parameters used to generate configuration and build node OS clients.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BundleDescriptor {
    /// Name of the cluster
    #[serde(default)]
    pub cluster_name: String,

    /// Kubernetes API endpoint (e.g. `https://c1-controlplane:6443`)
    #[serde(default)]
    pub endpoint: String,

    /// Talos version
    #[serde(default)]
    pub version: String,

    /// Kubernetes version
    #[serde(default)]
    pub kube_version: String,

    /// Additional subject alternative names for the API server certificate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sans: Vec<String>,

    #[serde(default, rename = "podCIDR", skip_serializing_if = "Vec::is_empty")]
    pub pod_cidr: Vec<String>,

    #[serde(default, rename = "serviceCIDR", skip_serializing_if = "Vec::is_empty")]
    pub service_cidr: Vec<String>,

    /// Node OS API endpoints a client connects to. The API endpoint host is used when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_endpoints: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_domain: Option<String>,
}

impl BundleDescriptor {
    /// Serializes the descriptor for `status.bundleConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Serialize`] if YAML serialization fails.
    pub fn to_yaml(&self) -> Result<String, BundleError> {
        serde_yaml::to_string(self).map_err(|source| BundleError::Serialize {
            what: "bundle descriptor",
            source,
        })
    }

    /// Parses a persisted descriptor and checks its required fields.
    ///
    /// JSON documents are accepted as well, since JSON is valid YAML.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Deserialize`] for malformed input and
    /// [`BundleError::MissingField`] when a required field is empty.
    pub fn from_yaml(input: &str) -> Result<Self, BundleError> {
        let descriptor: Self =
            serde_yaml::from_str(input).map_err(|source| BundleError::Deserialize {
                what: "bundle descriptor",
                source,
            })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Checks that the fields needed to generate configuration are set.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::MissingField`] naming the first empty field.
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.cluster_name.is_empty() {
            return Err(BundleError::MissingField {
                field: "clusterName",
            });
        }
        if self.endpoint.is_empty() {
            return Err(BundleError::MissingField { field: "endpoint" });
        }
        if self.kube_version.is_empty() {
            return Err(BundleError::MissingField {
                field: "kubeVersion",
            });
        }
        Ok(())
    }

    /// SHA-256 of the serialized descriptor, hex encoded.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Serialize`] if the descriptor cannot be serialized.
    pub fn fingerprint(&self) -> Result<String, BundleError> {
        let yaml = self.to_yaml()?;
        Ok(format!("{:x}", Sha256::digest(yaml.as_bytes())))
    }

    /// Endpoints a node OS client should dial.
    #[must_use]
    pub fn node_endpoints(&self) -> Vec<String> {
        if !self.client_endpoints.is_empty() {
            return self.client_endpoints.clone();
        }
        vec![endpoint_host(&self.endpoint).to_string()]
    }
}

/// Strips scheme and port from an API endpoint URL.
#[must_use]
pub fn endpoint_host(endpoint: &str) -> &str {
    let without_scheme = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    let authority = without_scheme
        .split_once('/')
        .map_or(without_scheme, |(host, _)| host);
    authority
        .rsplit_once(':')
        .map_or(authority, |(host, _)| host)
}

/// Subject alternative names for a control plane: the service name and one
/// name per replica pod (`<name>-0`, `<name>-1`, ...).
#[must_use]
pub fn generate_sans(name: &str, replicas: Option<i32>) -> Vec<String> {
    let mut sans = vec![name.to_string()];
    if let Some(replicas) = replicas {
        sans.extend((0..replicas).map(|i| format!("{name}-{i}")));
    }
    sans
}

/// Feature set selected by a Talos version.
///
/// Only major and minor matter. Newer contracts enable features that older
/// nodes would reject in their configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionContract {
    pub major: u32,
    pub minor: u32,
}

impl VersionContract {
    const TALOS_1_5: Self = Self::new(1, 5);
    const TALOS_1_7: Self = Self::new(1, 7);

    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parses `vMAJOR.MINOR[.PATCH][-suffix]`. The `v` prefix is optional.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::InvalidVersion`] when the string does not parse or
    /// names an unsupported major version.
    pub fn parse(version: &str) -> Result<Self, BundleError> {
        let invalid = |reason: &str| BundleError::InvalidVersion {
            version: version.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = version.strip_prefix('v').unwrap_or(version);
        let core = trimmed.split(['-', '+']).next().unwrap_or_default();
        let mut parts = core.split('.');

        let major = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| invalid("missing major version"))?
            .parse::<u32>()
            .map_err(|_| invalid("major version is not a number"))?;
        let minor = parts
            .next()
            .ok_or_else(|| invalid("missing minor version"))?
            .parse::<u32>()
            .map_err(|_| invalid("minor version is not a number"))?;
        if let Some(patch) = parts.next() {
            patch
                .parse::<u32>()
                .map_err(|_| invalid("patch version is not a number"))?;
        }
        if parts.next().is_some() {
            return Err(invalid("too many version components"));
        }
        if major != 1 {
            return Err(invalid("only Talos 1.x is supported"));
        }

        Ok(Self::new(major, minor))
    }

    /// `KubePrism` (in-cluster API load balancer) is on by default.
    #[must_use]
    pub fn kube_prism_enabled(&self) -> bool {
        *self >= Self::TALOS_1_5
    }

    /// Host DNS caching is on by default.
    #[must_use]
    pub fn host_dns_enabled(&self) -> bool {
        *self >= Self::TALOS_1_7
    }
}

impl fmt::Display for VersionContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
#[path = "descriptor_tests.rs"]
mod descriptor_tests;
