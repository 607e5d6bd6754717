// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Chart installer seam used by the addon reconciler.

use crate::errors::PackageError;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// A chart release to install or upgrade in a managed cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub release_name: String,
    pub namespace: String,
    pub repo_url: String,
    pub chart_name: String,
    pub version: Option<String>,
    /// Merged chart values
    pub values: BTreeMap<String, String>,
}

/// Installs charts into the cluster reachable with a kubeconfig.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Installs the release or upgrades it in place. Returns the new revision.
    async fn install_or_upgrade(
        &self,
        kubeconfig: &[u8],
        request: &ReleaseRequest,
    ) -> Result<String, PackageError>;

    /// Uninstalls the release.
    async fn uninstall(
        &self,
        kubeconfig: &[u8],
        release_name: &str,
        namespace: &str,
    ) -> Result<(), PackageError>;
}

/// Installer used when no chart installer is wired into the operator.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnconfiguredInstaller;

#[async_trait]
impl PackageInstaller for UnconfiguredInstaller {
    async fn install_or_upgrade(
        &self,
        _kubeconfig: &[u8],
        _request: &ReleaseRequest,
    ) -> Result<String, PackageError> {
        Err(PackageError::NotConfigured)
    }

    async fn uninstall(
        &self,
        _kubeconfig: &[u8],
        _release_name: &str,
        _namespace: &str,
    ) -> Result<(), PackageError> {
        Err(PackageError::NotConfigured)
    }
}
