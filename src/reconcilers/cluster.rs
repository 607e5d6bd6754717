// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! `TalosCluster` reconciliation logic.
//!
//! A cluster has no nodes of its own. It creates `<name>-controlplane` and
//! `<name>-worker` from inline specs, or checks that the referenced objects exist,
//! and deletes its children in order when it is removed.

use crate::constants::{
    CHILD_CREATED_REQUEUE_SECS, CLUSTER_CONTROLPLANE_SUFFIX, CLUSTER_WORKER_SUFFIX,
    DEPENDENCY_REQUEUE_SECS,
};
use crate::context::Context;
use crate::crd::{
    LocalObjectReference, TalosCluster, TalosControlPlane, TalosControlPlaneSpec, TalosWorker,
    TalosWorkerSpec,
};
use crate::events::{actions, reasons};
use crate::labels::FINALIZER_TALOS_CLUSTER;
use crate::reconcilers::finalizers::{ensure_finalizer, has_finalizer, remove_finalizer};
use crate::reconcilers::resources::{create_or_apply, delete_if_exists, ApplyOutcome};
use crate::reconcilers::status::{StatusUpdater, STATUS_FALSE, STATUS_TRUE};
use crate::reconcilers::{ReconcileMode, ReconcileOutcome};
use crate::status_reasons::{
    CONDITION_TYPE_DELETING, CONDITION_TYPE_FAILED, CONDITION_TYPE_READY,
    REASON_CHILDREN_RECONCILED, REASON_CONFIGURATION_INVALID, REASON_CONTROL_PLANE_NOT_FOUND,
    REASON_DELETING, REASON_PROGRESSING, REASON_WORKER_NOT_FOUND,
};
use crate::synthesis::build_owner_reference;
use anyhow::{Context as _, Result};
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the control plane created for an inline spec.
#[must_use]
pub fn control_plane_name(cluster: &str) -> String {
    format!("{cluster}-{CLUSTER_CONTROLPLANE_SUFFIX}")
}

/// Name of the worker created for an inline spec.
#[must_use]
pub fn worker_name(cluster: &str) -> String {
    format!("{cluster}-{CLUSTER_WORKER_SUFFIX}")
}

/// Builds the `<cluster>-controlplane` child for an inline spec.
#[must_use]
pub fn build_control_plane(
    cluster: &TalosCluster,
    spec: &TalosControlPlaneSpec,
) -> TalosControlPlane {
    let mut control_plane =
        TalosControlPlane::new(&control_plane_name(&cluster.name_any()), spec.clone());
    control_plane.metadata.namespace = cluster.namespace();
    control_plane.metadata.owner_references = Some(vec![build_owner_reference(cluster)]);
    control_plane
}

/// Builds the `<cluster>-worker` child for an inline spec.
///
/// An explicit `controlPlaneRef` in the inline spec wins over `control_plane`,
/// the control plane resolved for the cluster.
#[must_use]
pub fn build_worker(
    cluster: &TalosCluster,
    spec: &TalosWorkerSpec,
    control_plane: &str,
) -> TalosWorker {
    let mut spec = spec.clone();
    if spec.control_plane_ref.name.is_empty() {
        spec.control_plane_ref = LocalObjectReference {
            name: control_plane.to_string(),
        };
    }
    let mut worker = TalosWorker::new(&worker_name(&cluster.name_any()), spec);
    worker.metadata.namespace = cluster.namespace();
    worker.metadata.owner_references = Some(vec![build_owner_reference(cluster)]);
    worker
}

/// Child a pass would reconcile: the referenced one, or `inline_name` for an
/// inline spec.
fn planned_child(
    reference: Option<&LocalObjectReference>,
    inline: bool,
    inline_name: String,
) -> Option<String> {
    reference
        .map(|r| r.name.clone())
        .or_else(|| inline.then_some(inline_name))
}

/// Reconciles a `TalosCluster` resource.
///
/// This function:
/// 1. Handles deletion (children first, then the finalizer)
/// 2. Honours the reconcile-mode annotation
/// 3. Validates that no role is both inline and referenced
/// 4. Adds the finalizer
/// 5. Resolves or creates the control plane, then the worker
/// 6. Reports `Ready` once both are in place
///
/// # Errors
///
/// Returns an error if validation fails or a Kubernetes API call fails.
pub async fn reconcile_talos_cluster(
    ctx: Arc<Context>,
    cluster: TalosCluster,
) -> Result<ReconcileOutcome> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    info!("Reconciling TalosCluster: {}/{}", namespace, name);
    debug!(
        namespace = %namespace,
        name = %name,
        generation = ?cluster.metadata.generation,
        "Starting TalosCluster reconciliation"
    );

    if cluster.metadata.deletion_timestamp.is_some() {
        return delete_cluster(&ctx, &cluster).await;
    }

    match ReconcileMode::of(&cluster) {
        ReconcileMode::Normal => {}
        ReconcileMode::Disable => {
            info!("Reconciliation of TalosCluster {}/{} is disabled", namespace, name);
            return Ok(ReconcileOutcome::AwaitChange);
        }
        ReconcileMode::DryRun => {
            info!(
                control_plane = ?planned_child(
                    cluster.spec.control_plane_ref.as_ref(),
                    cluster.spec.control_plane.is_some(),
                    control_plane_name(&name),
                ),
                worker = ?planned_child(
                    cluster.spec.worker_ref.as_ref(),
                    cluster.spec.worker.is_some(),
                    worker_name(&name),
                ),
                "Dry run: TalosCluster {}/{} would reconcile its children",
                namespace,
                name
            );
            return Ok(ReconcileOutcome::Done);
        }
    }

    if let Err(e) = cluster.spec.validate() {
        warn!("TalosCluster {}/{} is invalid: {}", namespace, name, e);
        let message = e.to_string();
        let mut status = StatusUpdater::new(&cluster);
        status.set_condition(
            CONDITION_TYPE_READY,
            STATUS_FALSE,
            REASON_CONFIGURATION_INVALID,
            &message,
        );
        status.set_condition(
            CONDITION_TYPE_FAILED,
            STATUS_TRUE,
            REASON_CONFIGURATION_INVALID,
            &message,
        );
        status.apply(&ctx.client).await?;
        ctx.publish_event(
            &cluster,
            EventType::Warning,
            reasons::VALIDATION_FAILED,
            actions::RECONCILE,
            message,
        )
        .await;
        return Err(e).with_context(|| format!("invalid TalosCluster {namespace}/{name}"));
    }

    let cluster = ensure_finalizer(&ctx.client, &cluster, FINALIZER_TALOS_CLUSTER).await?;
    let mut status = StatusUpdater::new(&cluster);
    status.clear_condition(CONDITION_TYPE_FAILED);

    // Control plane
    let control_plane = if let Some(reference) = &cluster.spec.control_plane_ref {
        let api: Api<TalosControlPlane> = Api::namespaced(ctx.client.clone(), &namespace);
        let exists = api
            .get_opt(&reference.name)
            .await
            .with_context(|| {
                format!("failed to get TalosControlPlane {namespace}/{}", reference.name)
            })?
            .is_some();
        if !exists {
            let message = format!("TalosControlPlane {} not found", reference.name);
            warn!("TalosCluster {}/{}: {}", namespace, name, message);
            status.set_condition(
                CONDITION_TYPE_READY,
                STATUS_FALSE,
                REASON_CONTROL_PLANE_NOT_FOUND,
                &message,
            );
            status.apply(&ctx.client).await?;
            ctx.publish_event(
                &cluster,
                EventType::Warning,
                reasons::CONTROL_PLANE_NOT_FOUND,
                actions::RECONCILE,
                message,
            )
            .await;
            return Ok(ReconcileOutcome::requeue_secs(DEPENDENCY_REQUEUE_SECS));
        }
        Some(reference.name.clone())
    } else if let Some(spec) = &cluster.spec.control_plane {
        let desired = build_control_plane(&cluster, spec);
        let child = desired.name_any();
        let outcome = create_or_apply(&ctx.client, &namespace, &desired).await?;
        announce_child(&ctx, &cluster, "TalosControlPlane", &child, outcome).await;
        if outcome == ApplyOutcome::Created {
            // Give the control plane a head start before its worker is created.
            status.set_condition(
                CONDITION_TYPE_READY,
                STATUS_FALSE,
                REASON_PROGRESSING,
                &format!("Created TalosControlPlane {child}"),
            );
            status.apply(&ctx.client).await?;
            return Ok(ReconcileOutcome::requeue_secs(CHILD_CREATED_REQUEUE_SECS));
        }
        // An update needs no head start: continuing to the worker in this pass
        // is what an immediate requeue would do next.
        Some(child)
    } else {
        None
    };

    // Worker
    if let Some(reference) = &cluster.spec.worker_ref {
        let api: Api<TalosWorker> = Api::namespaced(ctx.client.clone(), &namespace);
        let exists = api
            .get_opt(&reference.name)
            .await
            .with_context(|| format!("failed to get TalosWorker {namespace}/{}", reference.name))?
            .is_some();
        if !exists {
            let message = format!("TalosWorker {} not found", reference.name);
            warn!("TalosCluster {}/{}: {}", namespace, name, message);
            status.set_condition(
                CONDITION_TYPE_READY,
                STATUS_FALSE,
                REASON_WORKER_NOT_FOUND,
                &message,
            );
            status.apply(&ctx.client).await?;
            return Ok(ReconcileOutcome::requeue_secs(DEPENDENCY_REQUEUE_SECS));
        }
    } else if let Some(spec) = &cluster.spec.worker {
        let default_control_plane = control_plane
            .clone()
            .unwrap_or_else(|| control_plane_name(&name));
        let desired = build_worker(&cluster, spec, &default_control_plane);
        let child = desired.name_any();
        let outcome = create_or_apply(&ctx.client, &namespace, &desired).await?;
        announce_child(&ctx, &cluster, "TalosWorker", &child, outcome).await;
    }

    status.set_condition(
        CONDITION_TYPE_READY,
        STATUS_TRUE,
        REASON_CHILDREN_RECONCILED,
        "Control plane and worker are in place",
    );
    status.status_mut().observed_generation = cluster.metadata.generation;
    status.apply(&ctx.client).await?;

    Ok(ReconcileOutcome::Done)
}

async fn announce_child(
    ctx: &Context,
    cluster: &TalosCluster,
    kind: &str,
    child: &str,
    outcome: ApplyOutcome,
) {
    let reason = match outcome {
        ApplyOutcome::Created => reasons::CREATED,
        ApplyOutcome::Updated => reasons::UPDATED,
        ApplyOutcome::Unchanged => return,
    };
    ctx.publish_event(
        cluster,
        EventType::Normal,
        reason,
        actions::RECONCILE,
        format!("{reason} {kind} {child}"),
    )
    .await;
}

/// Deletes `<name>-worker` and `<name>-controlplane`, then drops the finalizer
/// once both are gone from the store.
async fn delete_cluster(ctx: &Context, cluster: &TalosCluster) -> Result<ReconcileOutcome> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    if !has_finalizer(cluster, FINALIZER_TALOS_CLUSTER) {
        return Ok(ReconcileOutcome::AwaitChange);
    }
    info!("TalosCluster {}/{} is being deleted", namespace, name);

    let mut status = StatusUpdater::new(cluster);
    status.set_condition(
        CONDITION_TYPE_DELETING,
        STATUS_TRUE,
        REASON_DELETING,
        "Deleting worker and control plane",
    );
    if let Err(e) = status.apply(&ctx.client).await {
        warn!(
            "Failed to set Deleting condition on TalosCluster {}/{}: {:#}",
            namespace, name, e
        );
    }

    let worker = worker_name(&name);
    let control_plane = control_plane_name(&name);
    delete_if_exists::<TalosWorker>(&ctx.client, &namespace, &worker).await?;
    delete_if_exists::<TalosControlPlane>(&ctx.client, &namespace, &control_plane).await?;

    let workers: Api<TalosWorker> = Api::namespaced(ctx.client.clone(), &namespace);
    let control_planes: Api<TalosControlPlane> = Api::namespaced(ctx.client.clone(), &namespace);
    let worker_left = workers
        .get_opt(&worker)
        .await
        .with_context(|| format!("failed to get TalosWorker {namespace}/{worker}"))?
        .is_some();
    let control_plane_left = control_planes
        .get_opt(&control_plane)
        .await
        .with_context(|| format!("failed to get TalosControlPlane {namespace}/{control_plane}"))?
        .is_some();
    if worker_left || control_plane_left {
        debug!(
            worker_left,
            control_plane_left, "Waiting for TalosCluster children to terminate"
        );
        return Ok(ReconcileOutcome::requeue_secs(CHILD_CREATED_REQUEUE_SECS));
    }

    remove_finalizer(&ctx.client, cluster, FINALIZER_TALOS_CLUSTER).await?;
    Ok(ReconcileOutcome::AwaitChange)
}

#[cfg(test)]
#[path = "cluster_tests.rs"]
mod cluster_tests;
