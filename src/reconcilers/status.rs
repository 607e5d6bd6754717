// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Status condition helpers for Talos resources.
//!
//! # Condition Format
//!
//! Kubernetes conditions follow a standard format:
//! - `type`: The aspect of the resource being reported (e.g., "Ready", "Progressing")
//! - `status`: "True", "False", or "Unknown"
//! - `reason`: A programmatic identifier (CamelCase)
//! - `message`: A human-readable explanation
//! - `lastTransitionTime`: RFC3339 timestamp of the last `status` change
//!
//! # Example
//!
//! ```rust,no_run
//! use talos_operator::reconcilers::status::create_condition;
//!
//! let condition = create_condition("Ready", "True", "NodeReady", "kubelet is running");
//! ```

use crate::crd::{
    Condition, TalosAddonStatus, TalosClusterAddonStatus, TalosClusterStatus,
    TalosControlPlaneStatus, TalosEtcdBackupScheduleStatus, TalosEtcdBackupStatus,
    TalosMachineStatus, TalosWorkerStatus,
};
use anyhow::{Context as _, Result};
use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::core::object::HasStatus;
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use std::marker::PhantomData;
use tracing::debug;

/// Condition `status` values.
pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";

/// Create a new Kubernetes condition with the current timestamp.
#[must_use]
pub fn create_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> Condition {
    Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_transition_time: Some(Utc::now().to_rfc3339()),
    }
}

/// Find a condition by type in a list of conditions.
#[must_use]
pub fn find_condition<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

/// Returns true if the condition `condition_type` is present with status `True`.
#[must_use]
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type).is_some_and(|c| c.status == STATUS_TRUE)
}

/// Update or add a condition in a mutable conditions list (in-memory, no API call).
///
/// `lastTransitionTime` is preserved when `status` is unchanged and set to now
/// when it changes. Setting an identical condition leaves the list untouched.
pub fn update_condition_in_memory(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition_type) {
        if existing.status != status || existing.last_transition_time.is_none() {
            existing.last_transition_time = Some(Utc::now().to_rfc3339());
        }
        existing.status = status.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
    } else {
        conditions.push(create_condition(condition_type, status, reason, message));
    }
}

/// Status types carrying a conditions list.
pub trait HasConditions {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

macro_rules! impl_has_conditions {
    ($($status:ty),* $(,)?) => {
        $(
            impl HasConditions for $status {
                fn conditions(&self) -> &[Condition] {
                    &self.conditions
                }

                fn conditions_mut(&mut self) -> &mut Vec<Condition> {
                    &mut self.conditions
                }
            }
        )*
    };
}

impl_has_conditions!(
    TalosClusterStatus,
    TalosControlPlaneStatus,
    TalosWorkerStatus,
    TalosMachineStatus,
    TalosEtcdBackupStatus,
    TalosEtcdBackupScheduleStatus,
    TalosAddonStatus,
    TalosClusterAddonStatus,
);

/// Collects status changes of one resource during a reconcile pass and writes
/// them with a single status patch.
///
/// The patch carries the `resourceVersion` the updater was built from, so a
/// write based on a stale read fails with a conflict instead of overwriting a
/// newer status. Each successful [`StatusUpdater::apply`] moves the updater to
/// the returned `resourceVersion`, so it can be applied again later in the same
/// pass.
pub struct StatusUpdater<K>
where
    K: HasStatus,
{
    namespace: String,
    name: String,
    resource_version: Option<String>,
    current: Option<K::Status>,
    new: K::Status,
    kind: PhantomData<K>,
}

impl<K> StatusUpdater<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + HasStatus
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
    K::Status: HasConditions + Clone + Default + PartialEq + serde::Serialize,
{
    /// Starts from the status currently stored on `resource`.
    #[must_use]
    pub fn new(resource: &K) -> Self {
        let current = resource.status().cloned();
        Self {
            namespace: resource.namespace().unwrap_or_default(),
            name: resource.name_any(),
            resource_version: resource.resource_version(),
            new: current.clone().unwrap_or_default(),
            current,
            kind: PhantomData,
        }
    }

    /// The status as it will be written.
    #[must_use]
    pub fn status(&self) -> &K::Status {
        &self.new
    }

    /// Mutable access to the status fields (in-memory only).
    pub fn status_mut(&mut self) -> &mut K::Status {
        &mut self.new
    }

    /// Update or add a condition (in-memory only).
    pub fn set_condition(
        &mut self,
        condition_type: &str,
        status: &str,
        reason: &str,
        message: &str,
    ) {
        update_condition_in_memory(
            self.new.conditions_mut(),
            condition_type,
            status,
            reason,
            message,
        );
    }

    /// Drops a condition type (in-memory only).
    pub fn clear_condition(&mut self, condition_type: &str) {
        self.new
            .conditions_mut()
            .retain(|c| c.r#type != condition_type);
    }

    /// True if the collected status differs from the stored one.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.current.as_ref() != Some(&self.new)
    }

    /// Writes the collected status if it changed. Returns whether a write happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails, including a conflict when the
    /// resource changed since it was read.
    pub async fn apply(&mut self, client: &Client) -> Result<bool> {
        if !self.has_changes() {
            debug!(
                "{} {}/{} status unchanged, skipping update",
                K::kind(&()),
                self.namespace,
                self.name
            );
            return Ok(false);
        }

        let api: Api<K> = Api::namespaced(client.clone(), &self.namespace);
        let patch = match &self.resource_version {
            Some(resource_version) => json!({
                "metadata": { "resourceVersion": resource_version },
                "status": self.new,
            }),
            None => json!({ "status": self.new }),
        };

        let updated = api
            .patch_status(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| {
                format!(
                    "failed to update status of {} {}/{}",
                    K::kind(&()),
                    self.namespace,
                    self.name
                )
            })?;

        self.resource_version = updated.resource_version();
        self.current = Some(self.new.clone());

        debug!(
            "Updated {} {}/{} status: {} condition(s)",
            K::kind(&()),
            self.namespace,
            self.name,
            self.new.conditions().len()
        );
        Ok(true)
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod status_tests;
