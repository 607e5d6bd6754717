// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Kubernetes reconciliation controllers for Talos resources.
//!
//! Each reconciler watches one resource kind and drives the objects it owns
//! towards the state declared in its spec.
//!
//! # Reconciliation Architecture
//!
//! The operator follows the standard Kubernetes controller pattern:
//!
//! 1. **Watch** - Monitor spec changes (generation bumps) via the Kubernetes API
//! 2. **Reconcile** - Compare desired state (CRD spec) with actual state
//! 3. **Update** - Create or apply child objects, call the node OS API
//! 4. **Status** - Report progress back through status conditions
//!
//! A pass never blocks waiting for a dependency. It returns a
//! [`ReconcileOutcome`] asking to be called again later instead.
//!
//! # Available Reconcilers
//!
//! ## Cluster Topology
//!
//! - [`reconcile_talos_cluster`] - Creates or links the control plane and worker children
//! - [`reconcile_talos_control_plane`] - Secrets bundle, configuration, nodes, bootstrap
//! - [`reconcile_talos_worker`] - Worker configuration, nodes or machine fan-out
//! - [`reconcile_talos_machine`] - Applies configuration to a single node
//!
//! ## Operations
//!
//! - [`reconcile_talos_etcd_backup`] - Takes and uploads one etcd snapshot
//! - [`reconcile_talos_etcd_backup_schedule`] - Cron-driven backups with retention
//! - [`reconcile_talos_addon`] - Installs a chart into a managed cluster
//! - [`reconcile_talos_cluster_addon`] - Fans a chart out to the selected control planes
//! - [`reconcile_talos_cluster_addon_release`] - Installs a chart into one control plane's cluster
//!
//! # Example: Using a Reconciler
//!
//! ```rust,no_run
//! use talos_operator::context::Context;
//! use talos_operator::crd::TalosCluster;
//! use talos_operator::reconcilers::reconcile_talos_cluster;
//! use std::sync::Arc;
//!
//! async fn reconcile_cluster(ctx: Arc<Context>, cluster: TalosCluster) -> anyhow::Result<()> {
//!     let outcome = reconcile_talos_cluster(ctx, cluster).await?;
//!     println!("next: {outcome:?}");
//!     Ok(())
//! }
//! ```

pub mod addon;
pub mod addon_release;
pub mod backup;
pub mod backup_schedule;
pub mod cluster;
pub mod cluster_addon;
pub mod controlplane;
pub mod finalizers;
pub mod machine;
pub mod pagination;
pub mod resources;
pub mod retry;
pub mod status;
pub mod worker;

pub use addon::reconcile_talos_addon;
pub use addon_release::reconcile_talos_cluster_addon_release;
pub use backup::reconcile_talos_etcd_backup;
pub use backup_schedule::reconcile_talos_etcd_backup_schedule;
pub use cluster::reconcile_talos_cluster;
pub use cluster_addon::reconcile_talos_cluster_addon;
pub use controlplane::reconcile_talos_control_plane;
pub use machine::reconcile_talos_machine;
pub use worker::reconcile_talos_worker;

use crate::bundle::patch::{parse_patch, PatchOperation};
use crate::constants::READY_REQUEUE_SECS;
use crate::errors::BundleError;
use crate::labels::{CONFIG_PATCHES_ANNOTATION, RECONCILE_MODE_ANNOTATION};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::time::Duration;
use tracing::warn;

/// What a reconcile pass asks the controller to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The object converged. It is revisited on the periodic resync.
    Done,
    /// A dependency is not ready yet. Call again after the duration.
    RequeueAfter(Duration),
    /// Nothing can progress until the object changes.
    AwaitChange,
}

impl ReconcileOutcome {
    /// Shorthand for [`ReconcileOutcome::RequeueAfter`] in whole seconds.
    #[must_use]
    pub fn requeue_secs(secs: u64) -> Self {
        Self::RequeueAfter(Duration::from_secs(secs))
    }

    /// Maps the outcome to a controller [`Action`].
    #[must_use]
    pub fn into_action(self) -> Action {
        match self {
            Self::Done => Action::requeue(Duration::from_secs(READY_REQUEUE_SECS)),
            Self::RequeueAfter(delay) => Action::requeue(delay),
            Self::AwaitChange => Action::await_change(),
        }
    }

    /// Label used for the requeue metric.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Done => "resync",
            Self::RequeueAfter(_) => "waiting",
            Self::AwaitChange => "await_change",
        }
    }
}

/// How an object is reconciled, selected by the
/// `talos.alperen.cloud/reconcile-mode` annotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReconcileMode {
    /// Reconcile normally.
    #[default]
    Normal,
    /// Skip the object entirely.
    Disable,
    /// Log what would be done without touching the node.
    DryRun,
}

impl ReconcileMode {
    /// Parses an annotation value. Unknown values fall back to `Normal`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "normal" => Self::Normal,
            "disable" | "disabled" => Self::Disable,
            "dryrun" | "dry-run" => Self::DryRun,
            other => {
                warn!("Unknown reconcile mode '{}', reconciling normally", other);
                Self::Normal
            }
        }
    }

    /// Reads the mode of `obj` from its annotations.
    #[must_use]
    pub fn of<K: ResourceExt>(obj: &K) -> Self {
        obj.annotations()
            .get(RECONCILE_MODE_ANNOTATION)
            .map_or(Self::Normal, |value| Self::parse(value))
    }
}

/// Check if a resource's spec has changed by comparing generation with `observed_generation`.
///
/// The `metadata.generation` field is incremented by Kubernetes only when the spec changes,
/// while `status.observed_generation` is set by the controller after processing a spec.
///
/// # Returns
///
/// * `true` - Reconciliation is needed (spec changed or first reconciliation)
/// * `false` - No reconciliation needed (spec unchanged, status-only update)
#[must_use]
pub fn should_reconcile(current_generation: Option<i64>, observed_generation: Option<i64>) -> bool {
    match (current_generation, observed_generation) {
        (Some(current), Some(observed)) => current != observed,
        (Some(_), None) => true, // First reconciliation
        _ => false,              // No generation tracking available
    }
}

/// Patch operations from the `talos.alperen.cloud/config-patches` annotation.
///
/// # Errors
///
/// Returns [`BundleError::InvalidPatch`] if the annotation does not parse.
pub fn annotation_patches<K: ResourceExt>(obj: &K) -> Result<Vec<PatchOperation>, BundleError> {
    obj.annotations()
        .get(CONFIG_PATCHES_ANNOTATION)
        .map_or_else(|| Ok(Vec::new()), |document| parse_patch(document))
}

/// Backoff and log key of an object: `Kind/namespace/name`.
#[must_use]
pub fn object_key<K>(obj: &K) -> String
where
    K: Resource<DynamicType = ()>,
{
    format!(
        "{}/{}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

#[cfg(test)]
mod mod_tests;
