// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Error types for the Talos operator.
//!
//! This module provides specialized error types for:
//! - Bundle descriptor, secrets bundle and machine configuration generation
//! - Node OS API calls (bootstrap, apply, kubeconfig, snapshots)
//! - Object store uploads, chart installs and cloud provisioning
//! - Spec validation that must fail before any child object is created
//!
//! Reconcilers wrap these in `anyhow` with object context. The typed variants
//! exist so callers can branch on them (for example treating
//! [`NodeOsError::AlreadyBootstrapped`] as success) and map them to status reasons.

use thiserror::Error;

/// Errors raised while building bundle descriptors, secrets bundles and machine configuration.
///
/// All variants are terminal for the current reconcile pass. They are surfaced in
/// status and retried on the next spec change or requeue.
#[derive(Error, Debug)]
pub enum BundleError {
    /// Version string is not of the form `vMAJOR.MINOR[.PATCH]`
    #[error("invalid version '{version}': {reason}")]
    InvalidVersion {
        /// The rejected version string
        version: String,
        /// Why parsing failed
        reason: String,
    },

    /// A required descriptor field is empty
    #[error("bundle descriptor field '{field}' is required")]
    MissingField {
        /// Field name as it appears in the serialized descriptor
        field: &'static str,
    },

    /// Serializing a document failed
    #[error("failed to serialize {what}: {source}")]
    Serialize {
        /// What was being serialized
        what: &'static str,
        /// Underlying YAML error
        #[source]
        source: serde_yaml::Error,
    },

    /// Deserializing a persisted document failed
    #[error("failed to decode {what}: {source}")]
    Deserialize {
        /// What was being decoded
        what: &'static str,
        /// Underlying YAML error
        #[source]
        source: serde_yaml::Error,
    },

    /// A patch operation could not be applied to the configuration document
    #[error("patch operation {index} ({op} {path}) failed: {reason}")]
    PatchFailed {
        /// Position of the operation in the patch list
        index: usize,
        /// Operation name (`add`, `replace`, `remove`)
        op: String,
        /// JSON pointer the operation targets
        path: String,
        /// Why the operation failed
        reason: String,
    },

    /// A patch document could not be parsed
    #[error("invalid patch document: {reason}")]
    InvalidPatch {
        /// Why parsing failed
        reason: String,
    },

    /// Machine network metadata cannot be rendered
    #[error("invalid machine network metadata: {reason}")]
    InvalidMeta {
        /// Why rendering failed
        reason: String,
    },

    /// Key or certificate generation failed
    #[error("failed to generate {what}: {reason}")]
    KeyGeneration {
        /// Which key or certificate
        what: &'static str,
        /// Error from the certificate library
        reason: String,
    },
}

impl BundleError {
    /// Returns the status condition reason for this error.
    #[must_use]
    pub fn status_reason(&self) -> &'static str {
        match self {
            Self::InvalidVersion { .. } => "InvalidVersion",
            Self::MissingField { .. } => "InvalidBundleDescriptor",
            Self::Serialize { .. } | Self::Deserialize { .. } => "BundleSerializationFailed",
            Self::PatchFailed { .. } | Self::InvalidPatch { .. } => "PatchFailed",
            Self::KeyGeneration { .. } => "SecretsGenerationFailed",
            Self::InvalidMeta { .. } => "InvalidMeta",
        }
    }
}

/// Errors returned by node OS clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeOsError {
    /// No node OS connector is wired into the operator
    #[error("no node OS connector is configured")]
    NotConfigured,

    /// The node could not be reached
    #[error("failed to connect to node OS API at {endpoint}: {reason}")]
    Connection {
        /// Node endpoint
        endpoint: String,
        /// Transport error
        reason: String,
    },

    /// etcd on the node has already been bootstrapped
    #[error("etcd on {endpoint} is already bootstrapped")]
    AlreadyBootstrapped {
        /// Node endpoint
        endpoint: String,
    },

    /// An API call returned an error
    #[error("node OS call '{operation}' on {endpoint} failed: {reason}")]
    Rpc {
        /// RPC name
        operation: &'static str,
        /// Node endpoint
        endpoint: String,
        /// Error reported by the node
        reason: String,
    },
}

impl NodeOsError {
    /// Returns true if retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Rpc { .. })
    }
}

/// Errors returned by object store uploads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    /// The endpoint URL is not usable
    #[error("invalid object store endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        /// The configured endpoint
        endpoint: String,
        /// Why it was rejected
        reason: String,
    },

    /// The request did not complete
    #[error("upload to {url} failed: {reason}")]
    Request {
        /// Target URL
        url: String,
        /// Transport error
        reason: String,
    },

    /// The store answered with a non-success status
    #[error("upload to {url} rejected with HTTP {status}")]
    Rejected {
        /// Target URL
        url: String,
        /// HTTP status code
        status: u16,
    },
}

/// Errors returned by the chart installer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackageError {
    /// No chart installer is wired into the operator
    #[error("no chart installer is configured")]
    NotConfigured,

    /// Install or upgrade failed
    #[error("failed to install release '{release}': {reason}")]
    InstallFailed {
        /// Release name
        release: String,
        /// Installer error
        reason: String,
    },

    /// Uninstall failed
    #[error("failed to uninstall release '{release}': {reason}")]
    UninstallFailed {
        /// Release name
        release: String,
        /// Installer error
        reason: String,
    },
}

/// Errors returned by the cloud provisioner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// No provisioner handles this provider
    #[error("no cloud provisioner is configured for provider '{provider}'")]
    NotConfigured {
        /// Provider name from the spec
        provider: String,
    },

    /// Provisioning failed
    #[error("cloud provisioning for '{provider}' failed: {reason}")]
    Provisioning {
        /// Provider name from the spec
        provider: String,
        /// Provider error
        reason: String,
    },
}

/// Spec validation errors detected by reconcilers before any side effect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Two fields that exclude each other are both set
    #[error("specify either {first} or {second}, but not both")]
    MutuallyExclusive {
        /// First field
        first: &'static str,
        /// Second field
        second: &'static str,
    },

    /// The cron expression did not parse
    #[error("invalid cron schedule '{expression}': {reason}")]
    InvalidSchedule {
        /// Rejected expression
        expression: String,
        /// Parser error
        reason: String,
    },

    /// A field required by the selected mode is missing
    #[error("field '{field}' is required in {mode} mode")]
    MissingModeField {
        /// Missing field
        field: &'static str,
        /// Deployment mode
        mode: String,
    },

    /// A label selector requirement cannot be expressed as a query
    #[error("invalid label selector requirement on '{key}': {reason}")]
    InvalidSelector {
        /// Label key of the requirement
        key: String,
        /// What is wrong with it
        reason: &'static str,
    },
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod errors_tests;
