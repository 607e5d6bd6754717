// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Node OS API client seam.
//!
//! A [`NodeOsConnector`] builds a [`NodeOsClient`] from a bundle descriptor and the
//! cluster secrets. The client targets `descriptor.client_endpoints` (or the
//! endpoint host when empty). `insecure` skips server certificate verification and
//! is only used for the first contact with a machine that has no issued
//! certificate yet.

use crate::bundle::{BundleDescriptor, SecretsBundle};
use crate::errors::NodeOsError;
use crate::metrics::record_node_api_call;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A block device reported by a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskInfo {
    pub device_name: String,
    pub readonly: bool,
}

/// Disks picked first when discovering an install disk.
const PREFERRED_INSTALL_DISKS: [&str; 2] = ["/dev/nvme0n1", "/dev/sda"];

/// Picks the install disk among the disks a node reports.
///
/// Read-only disks are never picked. A preferred device wins, otherwise the first
/// writable disk is used.
#[must_use]
pub fn select_install_disk(disks: &[DiskInfo]) -> Option<String> {
    let writable: Vec<&DiskInfo> = disks.iter().filter(|d| !d.readonly).collect();
    writable
        .iter()
        .find(|d| PREFERRED_INSTALL_DISKS.contains(&d.device_name.as_str()))
        .or_else(|| writable.first())
        .map(|d| d.device_name.clone())
}

/// Calls issued against the node OS API of one or more nodes.
#[async_trait]
pub trait NodeOsClient: Send + Sync {
    /// Bootstraps etcd (no recovery). Returns
    /// [`NodeOsError::AlreadyBootstrapped`] if etcd is already running.
    async fn bootstrap(&self) -> Result<(), NodeOsError>;

    /// Applies a machine configuration in automatic mode.
    async fn apply_config(&self, config: &[u8]) -> Result<(), NodeOsError>;

    /// Fetches the admin kubeconfig of the cluster.
    async fn kubeconfig(&self) -> Result<Vec<u8>, NodeOsError>;

    /// Takes an etcd snapshot.
    async fn etcd_snapshot(&self) -> Result<Vec<u8>, NodeOsError>;

    /// Returns the state of a node OS service, e.g. `Running`.
    async fn service_state(&self, service: &str) -> Result<String, NodeOsError>;

    /// Upgrades the node to the installer `image`.
    async fn upgrade(&self, image: &str) -> Result<(), NodeOsError>;

    /// Resets the node, wiping its state.
    async fn reset(&self) -> Result<(), NodeOsError>;

    /// Lists the block devices of the node.
    async fn disks(&self) -> Result<Vec<DiskInfo>, NodeOsError>;

    /// Writes `value` under META partition key `key`.
    async fn meta_write(&self, key: u8, value: &[u8]) -> Result<(), NodeOsError>;
}

/// Builds node OS clients.
#[async_trait]
pub trait NodeOsConnector: Send + Sync {
    /// Connects to the nodes of `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeOsError::NotConfigured`] when no implementation is wired in
    /// and [`NodeOsError::Connection`] if the nodes cannot be reached.
    async fn connect(
        &self,
        descriptor: &BundleDescriptor,
        secrets: &SecretsBundle,
        insecure: bool,
    ) -> Result<Box<dyn NodeOsClient>, NodeOsError>;
}

/// Connector used when no node OS implementation is wired into the operator.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnconfiguredNodeOs;

#[async_trait]
impl NodeOsConnector for UnconfiguredNodeOs {
    async fn connect(
        &self,
        _descriptor: &BundleDescriptor,
        _secrets: &SecretsBundle,
        _insecure: bool,
    ) -> Result<Box<dyn NodeOsClient>, NodeOsError> {
        Err(NodeOsError::NotConfigured)
    }
}

/// Connector decorator bounding every node call by a timeout.
///
/// Each call is recorded in `talos_operator_node_api_calls_total` with result
/// `success`, `error` or `timeout`. A timed out call fails with
/// [`NodeOsError::Rpc`].
pub struct TimedNodeOs {
    inner: Arc<dyn NodeOsConnector>,
    timeout: Duration,
}

impl TimedNodeOs {
    #[must_use]
    pub fn new(inner: Arc<dyn NodeOsConnector>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl NodeOsConnector for TimedNodeOs {
    async fn connect(
        &self,
        descriptor: &BundleDescriptor,
        secrets: &SecretsBundle,
        insecure: bool,
    ) -> Result<Box<dyn NodeOsClient>, NodeOsError> {
        let endpoint = descriptor.endpoint.clone();
        let client = bounded(
            "connect",
            &endpoint,
            self.timeout,
            self.inner.connect(descriptor, secrets, insecure),
        )
        .await?;
        Ok(Box::new(TimedClient {
            inner: client,
            endpoint,
            timeout: self.timeout,
        }))
    }
}

struct TimedClient {
    inner: Box<dyn NodeOsClient>,
    endpoint: String,
    timeout: Duration,
}

async fn bounded<T>(
    operation: &'static str,
    endpoint: &str,
    timeout: Duration,
    call: impl Future<Output = Result<T, NodeOsError>> + Send,
) -> Result<T, NodeOsError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => {
            record_node_api_call(operation, "success");
            Ok(value)
        }
        Ok(Err(e)) => {
            record_node_api_call(operation, "error");
            Err(e)
        }
        Err(_) => {
            record_node_api_call(operation, "timeout");
            Err(NodeOsError::Rpc {
                operation,
                endpoint: endpoint.to_string(),
                reason: format!("timed out after {}s", timeout.as_secs()),
            })
        }
    }
}

#[async_trait]
impl NodeOsClient for TimedClient {
    async fn bootstrap(&self) -> Result<(), NodeOsError> {
        bounded("bootstrap", &self.endpoint, self.timeout, self.inner.bootstrap()).await
    }

    async fn apply_config(&self, config: &[u8]) -> Result<(), NodeOsError> {
        bounded(
            "apply_config",
            &self.endpoint,
            self.timeout,
            self.inner.apply_config(config),
        )
        .await
    }

    async fn kubeconfig(&self) -> Result<Vec<u8>, NodeOsError> {
        bounded("kubeconfig", &self.endpoint, self.timeout, self.inner.kubeconfig()).await
    }

    async fn etcd_snapshot(&self) -> Result<Vec<u8>, NodeOsError> {
        bounded(
            "etcd_snapshot",
            &self.endpoint,
            self.timeout,
            self.inner.etcd_snapshot(),
        )
        .await
    }

    async fn service_state(&self, service: &str) -> Result<String, NodeOsError> {
        bounded(
            "service_state",
            &self.endpoint,
            self.timeout,
            self.inner.service_state(service),
        )
        .await
    }

    async fn upgrade(&self, image: &str) -> Result<(), NodeOsError> {
        bounded("upgrade", &self.endpoint, self.timeout, self.inner.upgrade(image)).await
    }

    async fn reset(&self) -> Result<(), NodeOsError> {
        bounded("reset", &self.endpoint, self.timeout, self.inner.reset()).await
    }

    async fn disks(&self) -> Result<Vec<DiskInfo>, NodeOsError> {
        bounded("disks", &self.endpoint, self.timeout, self.inner.disks()).await
    }

    async fn meta_write(&self, key: u8, value: &[u8]) -> Result<(), NodeOsError> {
        bounded(
            "meta_write",
            &self.endpoint,
            self.timeout,
            self.inner.meta_write(key, value),
        )
        .await
    }
}

#[cfg(test)]
#[path = "node_os_tests.rs"]
mod node_os_tests;
