// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! `TalosWorker` reconciliation logic.
//!
//! Workers join the cluster of the control plane they reference. Their
//! configuration is generated from the secrets bundle and descriptor persisted
//! by that control plane, with the worker's own versions.
//!
//! - **container** - one `Service` per replica and a `StatefulSet`
//! - **metal** - one `TalosMachine` per declared address, named
//!   `<worker>-<address>`. Machines whose address was removed are deleted.

use crate::bundle::{generate_config, BundleDescriptor, ConfigKey, MachineType, ObjectIdentity};
use crate::constants::{DEPENDENCY_REQUEUE_SECS, PROVISIONING_REQUEUE_SECS};
use crate::context::Context;
use crate::crd::{
    DeploymentMode, LifecycleState, MachineParentRef, MachineRole, TalosControlPlane,
    TalosMachine, TalosMachineSpec, TalosWorker,
};
use crate::events::{actions, reasons};
use crate::labels::FINALIZER_TALOS_WORKER;
use crate::metrics::{clear_resource_state, set_resource_state};
use crate::reconcilers::controlplane::persisted_bundle;
use crate::reconcilers::finalizers::{ensure_finalizer, handle_deletion, FinalizerCleanup};
use crate::reconcilers::pagination::list_all_paginated;
use crate::reconcilers::resources::{create_or_apply, delete_if_exists};
use crate::reconcilers::status::{StatusUpdater, STATUS_FALSE, STATUS_TRUE};
use crate::reconcilers::{annotation_patches, ReconcileOutcome};
use crate::status_reasons::{
    CONDITION_TYPE_DELETING, CONDITION_TYPE_FAILED, CONDITION_TYPE_READY,
    REASON_CONFIG_GENERATION_FAILED, REASON_CONTROL_PLANE_NOT_FOUND, REASON_DELETING,
    REASON_UNSUPPORTED_MODE, REASON_WAITING_FOR_CONTROL_PLANE, REASON_WAITING_FOR_NODES,
    REASON_WORKERS_PROVISIONED,
};
use crate::synthesis::{
    build_config_map, build_owner_reference, build_service, build_statefulset, NodeSetParams,
};
use anyhow::{Context as _, Result};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ListParams;
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const KIND: &str = "TalosWorker";

/// Name of the machine created for `address`.
#[must_use]
pub fn machine_name(worker: &str, address: &str) -> String {
    format!("{worker}-{address}")
}

/// Descriptor for worker configuration: the control plane's descriptor with
/// the worker's versions. An empty Kubernetes version inherits the control
/// plane's.
#[must_use]
pub fn worker_descriptor(
    worker: &TalosWorker,
    control_plane: &BundleDescriptor,
) -> BundleDescriptor {
    let mut descriptor = control_plane.clone();
    if !worker.spec.version.is_empty() {
        descriptor.version = worker.spec.version.clone();
    }
    if !worker.spec.kube_version.is_empty() {
        descriptor.kube_version = worker.spec.kube_version.clone();
    }
    descriptor.sans = Vec::new();
    descriptor
}

/// Builds the machine of a metal worker for `address`.
#[must_use]
pub fn build_machine(worker: &TalosWorker, address: &str) -> TalosMachine {
    let name = worker.name_any();
    let spec = TalosMachineSpec {
        endpoint: address.to_string(),
        version: worker.spec.version.clone(),
        machine_spec: worker.spec.metal_spec.machine_spec.clone(),
        parent_ref: Some(MachineParentRef {
            role: MachineRole::Worker,
            name: name.clone(),
        }),
        config_ref: worker.spec.config_ref.clone(),
    };
    let mut machine = TalosMachine::new(&machine_name(&name, address), spec);
    machine.metadata.namespace = worker.namespace();
    machine.metadata.owner_references = Some(vec![build_owner_reference(worker)]);
    machine
}

fn is_owned_by(machine: &TalosMachine, owner_uid: &str) -> bool {
    machine
        .owner_references()
        .iter()
        .any(|owner| owner.uid == owner_uid)
}

#[async_trait::async_trait]
impl FinalizerCleanup for TalosWorker {
    async fn cleanup(&self, ctx: &Context) -> Result<()> {
        let name = self.name_any();
        let mut status = StatusUpdater::new(self);
        status.set_condition(
            CONDITION_TYPE_DELETING,
            STATUS_TRUE,
            REASON_DELETING,
            "Removing worker resources",
        );
        if let Err(e) = status.apply(&ctx.client).await {
            warn!("Failed to set Deleting condition on TalosWorker {}: {:#}", name, e);
        }
        // Nodes, services and machines are owned by the worker and are removed
        // by garbage collection.
        ctx.bundles.forget(&ObjectIdentity::of(self));
        clear_resource_state(KIND, &name);
        Ok(())
    }
}

/// Reconciles a `TalosWorker` resource.
///
/// # Errors
///
/// Returns an error if configuration cannot be generated or a Kubernetes API
/// call fails.
pub async fn reconcile_talos_worker(
    ctx: Arc<Context>,
    worker: TalosWorker,
) -> Result<ReconcileOutcome> {
    let namespace = worker.namespace().unwrap_or_default();
    let name = worker.name_any();

    info!("Reconciling TalosWorker: {}/{}", namespace, name);
    debug!(
        namespace = %namespace,
        name = %name,
        mode = ?worker.spec.mode,
        control_plane = %worker.spec.control_plane_ref.name,
        "Starting TalosWorker reconciliation"
    );

    if worker.metadata.deletion_timestamp.is_some() {
        handle_deletion(&ctx, &worker, FINALIZER_TALOS_WORKER).await?;
        return Ok(ReconcileOutcome::AwaitChange);
    }

    let worker = ensure_finalizer(&ctx.client, &worker, FINALIZER_TALOS_WORKER).await?;
    let mut status = StatusUpdater::new(&worker);

    if worker.spec.mode == DeploymentMode::Cloud {
        warn!(
            "TalosWorker {}/{} uses cloud mode, which is not supported for workers",
            namespace, name
        );
        status.set_condition(
            CONDITION_TYPE_READY,
            STATUS_FALSE,
            REASON_UNSUPPORTED_MODE,
            "Cloud mode is not supported for workers",
        );
        status.apply(&ctx.client).await?;
        return Ok(ReconcileOutcome::AwaitChange);
    }

    // Control plane
    let control_plane_name = &worker.spec.control_plane_ref.name;
    let control_planes: Api<TalosControlPlane> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(control_plane) = control_planes
        .get_opt(control_plane_name)
        .await
        .with_context(|| {
            format!("failed to get TalosControlPlane {namespace}/{control_plane_name}")
        })?
    else {
        let message = format!("TalosControlPlane {control_plane_name} not found");
        warn!("TalosWorker {}/{}: {}", namespace, name, message);
        status.set_condition(
            CONDITION_TYPE_READY,
            STATUS_FALSE,
            REASON_CONTROL_PLANE_NOT_FOUND,
            &message,
        );
        status.apply(&ctx.client).await?;
        ctx.publish_event(
            &worker,
            EventType::Warning,
            reasons::CONTROL_PLANE_NOT_FOUND,
            actions::RECONCILE,
            message,
        )
        .await;
        return Ok(ReconcileOutcome::requeue_secs(DEPENDENCY_REQUEUE_SECS));
    };

    let Some((control_plane_descriptor, secrets)) = persisted_bundle(&ctx, &control_plane).await?
    else {
        debug!(control_plane = %control_plane_name, "Control plane has no secrets bundle yet");
        status.set_condition(
            CONDITION_TYPE_READY,
            STATUS_FALSE,
            REASON_WAITING_FOR_CONTROL_PLANE,
            &format!("Waiting for TalosControlPlane {control_plane_name} to generate its secrets"),
        );
        status.apply(&ctx.client).await?;
        return Ok(ReconcileOutcome::requeue_secs(DEPENDENCY_REQUEUE_SECS));
    };

    // Configuration
    let descriptor = worker_descriptor(&worker, &control_plane_descriptor);
    let identity = ObjectIdentity::of(&worker);
    let generated = annotation_patches(&worker).and_then(|patches| {
        let key = ConfigKey::new(
            worker.metadata.generation.unwrap_or_default(),
            MachineType::Worker,
            &descriptor,
            &patches,
        )?;
        ctx.bundles.get_or_generate_config(&identity, key, || {
            generate_config(&descriptor, &secrets, MachineType::Worker, &patches)
        })
    });
    let config = match generated {
        Ok(config) => config,
        Err(e) => {
            let message = e.to_string();
            warn!("Failed to generate configuration for TalosWorker {}: {}", name, message);
            status.set_condition(
                CONDITION_TYPE_READY,
                STATUS_FALSE,
                REASON_CONFIG_GENERATION_FAILED,
                &message,
            );
            status.set_condition(CONDITION_TYPE_FAILED, STATUS_TRUE, e.status_reason(), &message);
            status.apply(&ctx.client).await?;
            return Err(e).with_context(|| {
                format!("failed to generate configuration for {namespace}/{name}")
            });
        }
    };
    status.clear_condition(CONDITION_TYPE_FAILED);
    status.status_mut().config = config.clone();
    if status.status().state.is_none() {
        status.status_mut().state = Some(LifecycleState::Pending);
    }
    status.apply(&ctx.client).await?;

    let owner = build_owner_reference(&worker);
    let config_map = build_config_map(&name, &namespace, MachineType::Worker, &config, &owner);
    create_or_apply(&ctx.client, &namespace, &config_map).await?;

    // Nodes
    let provisioned = match worker.spec.mode {
        DeploymentMode::Metal => reconcile_machines(&ctx, &worker).await?,
        _ => provision_container(&ctx, &worker, &owner).await?,
    };

    let state = if provisioned {
        LifecycleState::Available
    } else {
        LifecycleState::Installing
    };
    if status.status().state != Some(state) {
        info!("TalosWorker {}/{} is now {}", namespace, name, state);
    }
    status.status_mut().state = Some(state);
    set_resource_state(KIND, &name, state);

    if !provisioned {
        status.set_condition(
            CONDITION_TYPE_READY,
            STATUS_FALSE,
            REASON_WAITING_FOR_NODES,
            "Waiting for worker nodes to become ready",
        );
        status.apply(&ctx.client).await?;
        return Ok(ReconcileOutcome::requeue_secs(PROVISIONING_REQUEUE_SECS));
    }

    status.set_condition(
        CONDITION_TYPE_READY,
        STATUS_TRUE,
        REASON_WORKERS_PROVISIONED,
        &format!("{} worker node(s) ready", worker_count(&worker)),
    );
    status.status_mut().observed_generation = worker.metadata.generation;
    status.apply(&ctx.client).await?;

    Ok(ReconcileOutcome::Done)
}

fn worker_count(worker: &TalosWorker) -> usize {
    match worker.spec.mode {
        DeploymentMode::Metal => worker.spec.metal_spec.machines.len(),
        _ => usize::try_from(worker.spec.replicas).unwrap_or(0),
    }
}

/// Applies the per-replica services and the `StatefulSet` of a container-mode
/// worker. Returns true once every replica is ready.
async fn provision_container(
    ctx: &Context,
    worker: &TalosWorker,
    owner: &OwnerReference,
) -> Result<bool> {
    let namespace = worker.namespace().unwrap_or_default();
    let name = worker.name_any();
    let spec = &worker.spec;

    for replica in 0..spec.replicas {
        let service = build_service(&name, &namespace, Some(replica), MachineType::Worker, owner);
        create_or_apply(&ctx.client, &namespace, &service).await?;
    }

    let params = NodeSetParams {
        name: &name,
        namespace: &namespace,
        replicas: spec.replicas,
        version: &spec.version,
        machine_type: MachineType::Worker,
        storage_class_name: spec.storage_class_name.as_deref(),
        config_ref: spec.config_ref.as_ref(),
    };
    create_or_apply(&ctx.client, &namespace, &build_statefulset(&params, owner)).await?;

    let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
    let ready_replicas = api
        .get_opt(&name)
        .await
        .with_context(|| format!("failed to get StatefulSet {namespace}/{name}"))?
        .and_then(|sts| sts.status)
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    Ok(ready_replicas >= spec.replicas)
}

/// Creates or updates one machine per declared address and deletes the owned
/// machines whose address is gone. Returns true once every declared machine is
/// `Available`.
async fn reconcile_machines(ctx: &Context, worker: &TalosWorker) -> Result<bool> {
    let namespace = worker.namespace().unwrap_or_default();
    let name = worker.name_any();
    let addresses = &worker.spec.metal_spec.machines;

    let mut desired = BTreeSet::new();
    for address in addresses {
        let machine = build_machine(worker, address);
        let outcome = create_or_apply(&ctx.client, &namespace, &machine).await?;
        if outcome.changed() {
            debug!(machine = %machine.name_any(), ?outcome, "Applied TalosMachine");
        }
        desired.insert(machine.name_any());
    }

    let api: Api<TalosMachine> = Api::namespaced(ctx.client.clone(), &namespace);
    let owner_uid = worker.uid().unwrap_or_default();
    let owned: Vec<TalosMachine> = list_all_paginated(&api, ListParams::default())
        .await?
        .into_iter()
        .filter(|machine| is_owned_by(machine, &owner_uid))
        .collect();

    for machine in &owned {
        let machine_name = machine.name_any();
        if desired.contains(&machine_name) {
            continue;
        }
        info!(
            "TalosMachine {}/{} is no longer declared by TalosWorker {}",
            namespace, machine_name, name
        );
        if delete_if_exists::<TalosMachine>(&ctx.client, &namespace, &machine_name).await? {
            ctx.publish_event(
                worker,
                EventType::Normal,
                reasons::DELETED,
                actions::DELETE,
                format!("Deleted TalosMachine {machine_name}"),
            )
            .await;
        }
    }

    let available = owned
        .iter()
        .filter(|machine| desired.contains(&machine.name_any()))
        .filter(|machine| {
            machine
                .status
                .as_ref()
                .is_some_and(|s| s.state == Some(LifecycleState::Available))
        })
        .count();
    debug!(available, declared = desired.len(), "Worker machines");
    Ok(available == desired.len())
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod worker_tests;
