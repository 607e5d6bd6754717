// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Cloud instance provisioning seam for cloud-mode control planes.

use crate::crd::TalosControlPlane;
use crate::errors::CloudError;
use async_trait::async_trait;

/// Observed state of the instances of a control plane.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudInstances {
    /// Every expected instance exists and is running
    pub ready: bool,
    /// Addresses the node OS API is reachable on (instances or load balancer)
    pub addresses: Vec<String>,
}

/// Creates and removes the cloud resources backing a control plane.
#[async_trait]
pub trait CloudProvisioner: Send + Sync {
    /// Creates or updates addresses, instances and load balancers. Idempotent.
    async fn ensure_instances(&self, control_plane: &TalosControlPlane) -> Result<(), CloudError>;

    /// Reports whether the instances are up and where they are reachable.
    async fn instances(&self, control_plane: &TalosControlPlane)
        -> Result<CloudInstances, CloudError>;

    /// Removes every resource created for the control plane.
    async fn teardown(&self, control_plane: &TalosControlPlane) -> Result<(), CloudError>;
}

/// Provisioner used when no cloud implementation is wired into the operator.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnconfiguredCloud;

fn not_configured(control_plane: &TalosControlPlane) -> CloudError {
    CloudError::NotConfigured {
        provider: control_plane
            .spec
            .cloud_spec
            .as_ref()
            .map(|c| c.provider.clone())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl CloudProvisioner for UnconfiguredCloud {
    async fn ensure_instances(&self, control_plane: &TalosControlPlane) -> Result<(), CloudError> {
        Err(not_configured(control_plane))
    }

    async fn instances(
        &self,
        control_plane: &TalosControlPlane,
    ) -> Result<CloudInstances, CloudError> {
        Err(not_configured(control_plane))
    }

    async fn teardown(&self, control_plane: &TalosControlPlane) -> Result<(), CloudError> {
        Err(not_configured(control_plane))
    }
}
