// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! `TalosMachine` reconciliation logic.
//!
//! A machine is one node driven through the node OS API. Its role comes from
//! `spec.parentRef`: control plane machines take the configuration of their
//! `TalosControlPlane`, worker machines the worker configuration derived from the
//! control plane their `TalosWorker` joins. A machine without a parent is left
//! alone.
//!
//! ```text
//! Pending -> Installing -> Available -> Upgrading -> Available
//! ```
//!
//! The first contact with a node skips server certificate verification, since
//! the node has no issued certificate yet. Every later call verifies it. With
//! `--enable-meta-key`, the first contact also writes `spec.machineSpec.meta`
//! to the node META partition before the configuration is applied.
//!
//! While a node installs or upgrades, a background watcher polls its kubelet and
//! triggers the machine controller as soon as it runs.

use crate::bundle::builder::{installer_image, machine_patches, with_image_cache_volume};
use crate::bundle::{
    generate_config, network_meta, BundleDescriptor, ConfigKey, MachineType, ObjectIdentity,
    SecretsBundle,
};
use crate::constants::{
    DEPENDENCY_REQUEUE_SECS, KUBELET_SERVICE, META_KEY_NETWORK, NODE_WATCH_INTERVAL_SECS,
    SERVICE_STATE_RUNNING,
};
use crate::context::Context;
use crate::crd::{
    ConfigMapKeyRef, LifecycleState, MachineParentRef, MachineRole, TalosControlPlane,
    TalosMachine, TalosWorker,
};
use crate::errors::NodeOsError;
use crate::events::{actions, reasons};
use crate::external::node_os::select_install_disk;
use crate::external::NodeOsClient;
use crate::labels::FINALIZER_TALOS_MACHINE;
use crate::metrics::{clear_resource_state, set_resource_state};
use crate::reconcilers::controlplane::persisted_bundle;
use crate::reconcilers::finalizers::{ensure_finalizer, handle_deletion, FinalizerCleanup};
use crate::reconcilers::status::{StatusUpdater, STATUS_FALSE, STATUS_TRUE};
use crate::reconcilers::worker::worker_descriptor;
use crate::reconcilers::{annotation_patches, object_key, ReconcileMode, ReconcileOutcome};
use crate::status_reasons::{
    CONDITION_TYPE_DELETING, CONDITION_TYPE_FAILED, CONDITION_TYPE_READY,
    REASON_CONFIG_APPLIED, REASON_DELETING, REASON_INSTALLING, REASON_META_KEY_FAILED,
    REASON_NODE_READY, REASON_ORPHANED,
};
use anyhow::{anyhow, Context as _, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

const KIND: &str = "TalosMachine";

/// Configuration inputs of a machine, resolved from its parent.
struct MachineSource {
    machine_type: MachineType,
    descriptor: BundleDescriptor,
    secrets: SecretsBundle,
}

enum SourceLookup {
    Found(MachineSource),
    /// The parent is gone.
    Orphaned(String),
    /// The parent exists but has no configuration yet.
    Waiting(String),
}

/// Whether the next call to the node is its first contact.
fn is_first_contact(state: Option<LifecycleState>) -> bool {
    matches!(state, None | Some(LifecycleState::Pending))
}

/// Descriptor of the parent narrowed to this machine and its version.
#[must_use]
pub fn machine_descriptor(machine: &TalosMachine, parent: &BundleDescriptor) -> BundleDescriptor {
    let mut descriptor = parent.clone();
    descriptor.version = machine.spec.version.clone();
    descriptor.client_endpoints = vec![machine.spec.endpoint.clone()];
    descriptor
}

/// Install disk of a previously applied configuration. Only the first
/// document of a multi-document configuration is read.
#[must_use]
pub fn applied_install_disk(config: &str) -> Option<String> {
    let first = serde_yaml::Deserializer::from_str(config).next()?;
    let document = serde_yaml::Value::deserialize(first).ok()?;
    document
        .get("machine")?
        .get("install")?
        .get("disk")?
        .as_str()
        .map(str::to_string)
}

async fn resolve_source(
    ctx: &Context,
    machine: &TalosMachine,
    parent: &MachineParentRef,
) -> Result<SourceLookup> {
    let namespace = machine.namespace().unwrap_or_default();
    let control_planes: Api<TalosControlPlane> = Api::namespaced(ctx.client.clone(), &namespace);

    match parent.role {
        MachineRole::ControlPlane => {
            let Some(control_plane) = control_planes
                .get_opt(&parent.name)
                .await
                .with_context(|| {
                    format!("failed to get TalosControlPlane {namespace}/{}", parent.name)
                })?
            else {
                return Ok(SourceLookup::Orphaned(format!(
                    "TalosControlPlane {} not found",
                    parent.name
                )));
            };
            let generated = control_plane
                .status
                .as_ref()
                .is_some_and(|s| !s.config.is_empty());
            let bundle = if generated {
                persisted_bundle(ctx, &control_plane).await?
            } else {
                None
            };
            Ok(match bundle {
                Some((descriptor, secrets)) => SourceLookup::Found(MachineSource {
                    machine_type: MachineType::ControlPlane,
                    descriptor,
                    secrets,
                }),
                None => SourceLookup::Waiting(format!(
                    "TalosControlPlane {} has not generated its configuration yet",
                    parent.name
                )),
            })
        }
        MachineRole::Worker => {
            let workers: Api<TalosWorker> = Api::namespaced(ctx.client.clone(), &namespace);
            let Some(worker) = workers
                .get_opt(&parent.name)
                .await
                .with_context(|| format!("failed to get TalosWorker {namespace}/{}", parent.name))?
            else {
                return Ok(SourceLookup::Orphaned(format!(
                    "TalosWorker {} not found",
                    parent.name
                )));
            };
            let control_plane_name = &worker.spec.control_plane_ref.name;
            let control_plane = control_planes
                .get_opt(control_plane_name)
                .await
                .with_context(|| {
                    format!("failed to get TalosControlPlane {namespace}/{control_plane_name}")
                })?;
            let bundle = match &control_plane {
                Some(control_plane) => persisted_bundle(ctx, control_plane).await?,
                None => None,
            };
            Ok(match bundle {
                Some((descriptor, secrets)) => SourceLookup::Found(MachineSource {
                    machine_type: MachineType::Worker,
                    descriptor: worker_descriptor(&worker, &descriptor),
                    secrets,
                }),
                None => SourceLookup::Waiting(format!(
                    "TalosControlPlane {control_plane_name} of TalosWorker {} is not ready",
                    parent.name
                )),
            })
        }
    }
}

fn set_state(status: &mut StatusUpdater<TalosMachine>, name: &str, state: LifecycleState) {
    if status.status().state != Some(state) {
        info!("TalosMachine {} is now {}", name, state);
    }
    status.status_mut().state = Some(state);
    set_resource_state(KIND, name, state);
}

#[async_trait::async_trait]
impl FinalizerCleanup for TalosMachine {
    async fn cleanup(&self, ctx: &Context) -> Result<()> {
        let name = self.name_any();

        let mut status = StatusUpdater::new(self);
        status.set_condition(
            CONDITION_TYPE_DELETING,
            STATUS_TRUE,
            REASON_DELETING,
            "Resetting node",
        );
        if let Err(e) = status.apply(&ctx.client).await {
            warn!("Failed to set Deleting condition on TalosMachine {}: {:#}", name, e);
        }

        ctx.watchers.remove(&object_key(self)).await?;

        let state = self.status.as_ref().and_then(|s| s.state);
        if state == Some(LifecycleState::Orphaned) {
            info!("TalosMachine {} is orphaned, leaving its node untouched", name);
        } else if let Err(e) = reset_node(ctx, self).await {
            warn!("Failed to reset the node of TalosMachine {}: {:#}", name, e);
        }

        ctx.bundles.forget(&ObjectIdentity::of(self));
        clear_resource_state(KIND, &name);
        Ok(())
    }
}

async fn reset_node(ctx: &Context, machine: &TalosMachine) -> Result<()> {
    let Some(parent) = &machine.spec.parent_ref else {
        return Ok(());
    };
    let source = match resolve_source(ctx, machine, parent).await? {
        SourceLookup::Found(source) => source,
        SourceLookup::Orphaned(reason) | SourceLookup::Waiting(reason) => {
            warn!("Cannot reset node of TalosMachine {}: {}", machine.name_any(), reason);
            return Ok(());
        }
    };
    let descriptor = machine_descriptor(machine, &source.descriptor);
    let node = connect(ctx, machine, &descriptor, &source.secrets, false).await?;
    node.reset()
        .await
        .with_context(|| format!("failed to reset node {}", machine.spec.endpoint))?;
    info!("Reset node {} of TalosMachine {}", machine.spec.endpoint, machine.name_any());
    Ok(())
}

/// Reconciles a `TalosMachine` resource.
///
/// # Errors
///
/// Returns an error if configuration cannot be generated, a node OS call fails
/// or a Kubernetes API call fails.
pub async fn reconcile_talos_machine(
    ctx: Arc<Context>,
    machine: TalosMachine,
) -> Result<ReconcileOutcome> {
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();

    info!("Reconciling TalosMachine: {}/{}", namespace, name);
    debug!(
        namespace = %namespace,
        name = %name,
        endpoint = %machine.spec.endpoint,
        version = %machine.spec.version,
        parent = ?machine.spec.parent_ref,
        "Starting TalosMachine reconciliation"
    );

    // Deletion runs regardless of the reconcile mode so the finalizer is released.
    if machine.metadata.deletion_timestamp.is_some() {
        handle_deletion(&ctx, &machine, FINALIZER_TALOS_MACHINE).await?;
        return Ok(ReconcileOutcome::AwaitChange);
    }

    let mode = ReconcileMode::of(&machine);
    if mode == ReconcileMode::Disable {
        info!("Reconciliation of TalosMachine {}/{} is disabled", namespace, name);
        return Ok(ReconcileOutcome::AwaitChange);
    }

    let Some(parent) = machine.spec.parent_ref.clone() else {
        debug!("TalosMachine {}/{} has no parent, nothing to do", namespace, name);
        return Ok(ReconcileOutcome::AwaitChange);
    };

    let machine = ensure_finalizer(&ctx.client, &machine, FINALIZER_TALOS_MACHINE).await?;
    let mut status = StatusUpdater::new(&machine);

    let source = match resolve_source(&ctx, &machine, &parent).await? {
        SourceLookup::Found(source) => source,
        SourceLookup::Orphaned(message) => {
            warn!("TalosMachine {}/{} is orphaned: {}", namespace, name, message);
            set_state(&mut status, &name, LifecycleState::Orphaned);
            status.set_condition(CONDITION_TYPE_READY, STATUS_FALSE, REASON_ORPHANED, &message);
            status.apply(&ctx.client).await?;
            ctx.watchers.remove(&object_key(&machine)).await?;
            return Ok(ReconcileOutcome::AwaitChange);
        }
        SourceLookup::Waiting(message) => {
            debug!("TalosMachine {}/{}: {}", namespace, name, message);
            return Ok(ReconcileOutcome::requeue_secs(DEPENDENCY_REQUEUE_SECS));
        }
    };
    let descriptor = machine_descriptor(&machine, &source.descriptor);

    if matches!(
        status.status().state,
        Some(LifecycleState::Installing | LifecycleState::Upgrading)
    ) {
        return await_readiness(&ctx, &machine, &mut status, &descriptor, &source.secrets).await;
    }

    // Configuration
    let insecure = is_first_contact(status.status().state);
    let mut node: Option<Box<dyn NodeOsClient>> = None;
    let config = match &machine.spec.config_ref {
        Some(reference) => read_config_ref(&ctx, &namespace, reference).await?,
        None => {
            let known_disk = machine
                .spec
                .machine_spec
                .as_ref()
                .and_then(|s| s.install_disk.clone())
                .or_else(|| applied_install_disk(&status.status().config));
            let install_disk = match known_disk {
                Some(disk) => Some(disk),
                None => {
                    let client =
                        connect(&ctx, &machine, &descriptor, &source.secrets, insecure).await?;
                    let disks = client
                        .disks()
                        .await
                        .with_context(|| format!("failed to list disks of {namespace}/{name}"))?;
                    node = Some(client);
                    select_install_disk(&disks)
                }
            };
            let generated = annotation_patches(&machine).and_then(|extra| {
                let mut patches = machine_patches(
                    machine.spec.machine_spec.as_ref(),
                    install_disk.as_deref(),
                    &machine.spec.version,
                );
                patches.extend(extra);
                let key = ConfigKey::new(
                    machine.metadata.generation.unwrap_or_default(),
                    source.machine_type,
                    &descriptor,
                    &patches,
                )?;
                ctx.bundles
                    .get_or_generate_config(&ObjectIdentity::of(&machine), key, || {
                        generate_config(&descriptor, &source.secrets, source.machine_type, &patches)
                            .map(|config| {
                                with_image_cache_volume(config, machine.spec.machine_spec.as_ref())
                            })
                    })
            });
            match generated {
                Ok(config) => config,
                Err(e) => {
                    let message = e.to_string();
                    status.set_condition(
                        CONDITION_TYPE_FAILED,
                        STATUS_TRUE,
                        e.status_reason(),
                        &message,
                    );
                    status.apply(&ctx.client).await?;
                    return Err(e).with_context(|| {
                        format!("failed to generate configuration for {namespace}/{name}")
                    });
                }
            }
        }
    };
    status.clear_condition(CONDITION_TYPE_FAILED);

    let version = machine.spec.version.clone();
    let observed_version = status.status().observed_version.clone();
    if status.status().config == config && observed_version == version {
        debug!("TalosMachine {}/{} is up to date", namespace, name);
        set_state(&mut status, &name, LifecycleState::Available);
        status.apply(&ctx.client).await?;
        return Ok(ReconcileOutcome::Done);
    }

    if mode == ReconcileMode::DryRun {
        info!(
            "Dry run: would apply {} bytes of configuration to TalosMachine {}/{} at {}",
            config.len(),
            namespace,
            name,
            machine.spec.endpoint
        );
        return Ok(ReconcileOutcome::Done);
    }

    // Apply
    let node = match node {
        Some(node) => node,
        None => connect(&ctx, &machine, &descriptor, &source.secrets, insecure).await?,
    };
    let version_changed = !observed_version.is_empty() && observed_version != version;
    let (state, reason, action, message) = if insecure {
        if ctx.enable_meta_key {
            if let Err(e) = write_network_meta(node.as_ref(), &machine).await {
                status.set_condition(
                    CONDITION_TYPE_FAILED,
                    STATUS_TRUE,
                    REASON_META_KEY_FAILED,
                    &format!("{e:#}"),
                );
                status.apply(&ctx.client).await?;
                ctx.publish_event(
                    &machine,
                    EventType::Warning,
                    reasons::META_KEY_FAILED,
                    actions::APPLY,
                    format!("{e:#}"),
                )
                .await;
                return Err(e);
            }
        }
        apply_config(node.as_ref(), &machine, &config).await?;
        (
            LifecycleState::Installing,
            reasons::CONFIG_APPLIED,
            actions::APPLY,
            format!("Applied configuration, installing Talos {version}"),
        )
    } else if version_changed {
        let image = installer_image(
            machine.spec.machine_spec.as_ref().and_then(|s| s.image.as_deref()),
            &version,
        );
        node.upgrade(&image)
            .await
            .with_context(|| format!("failed to upgrade {namespace}/{name} to {image}"))?;
        (
            LifecycleState::Upgrading,
            reasons::UPGRADE_STARTED,
            actions::UPGRADE,
            format!("Upgrading from Talos {observed_version} with {image}"),
        )
    } else {
        apply_config(node.as_ref(), &machine, &config).await?;
        (
            LifecycleState::Available,
            reasons::CONFIG_APPLIED,
            actions::APPLY,
            "Applied configuration drift".to_string(),
        )
    };

    set_state(&mut status, &name, state);
    status.status_mut().config = config;
    status.status_mut().observed_version = version;
    if state == LifecycleState::Available {
        status.set_condition(CONDITION_TYPE_READY, STATUS_TRUE, REASON_CONFIG_APPLIED, &message);
    } else {
        status.set_condition(CONDITION_TYPE_READY, STATUS_FALSE, REASON_INSTALLING, &message);
        ensure_watcher(&ctx, &machine, &descriptor, &source.secrets).await?;
    }
    status.apply(&ctx.client).await?;
    ctx.publish_event(&machine, EventType::Normal, reason, action, message)
        .await;

    Ok(ReconcileOutcome::requeue_secs(DEPENDENCY_REQUEUE_SECS))
}

async fn connect(
    ctx: &Context,
    machine: &TalosMachine,
    descriptor: &BundleDescriptor,
    secrets: &SecretsBundle,
    insecure: bool,
) -> Result<Box<dyn NodeOsClient>> {
    ctx.node_os
        .connect(descriptor, secrets, insecure)
        .await
        .with_context(|| {
            format!(
                "failed to connect to TalosMachine {}/{} at {}",
                machine.namespace().unwrap_or_default(),
                machine.name_any(),
                machine.spec.endpoint
            )
        })
}

async fn apply_config(node: &dyn NodeOsClient, machine: &TalosMachine, config: &str) -> Result<()> {
    node.apply_config(config.as_bytes()).await.with_context(|| {
        format!(
            "failed to apply configuration to {}/{}",
            machine.namespace().unwrap_or_default(),
            machine.name_any()
        )
    })
}

/// Writes the static network settings of `machine` to the node META partition.
/// Machines without `spec.machineSpec.meta` are skipped.
async fn write_network_meta(node: &dyn NodeOsClient, machine: &TalosMachine) -> Result<()> {
    let Some(meta) = machine.spec.machine_spec.as_ref().and_then(|s| s.meta.as_ref()) else {
        debug!("TalosMachine {} has no network metadata", machine.name_any());
        return Ok(());
    };
    let document = network_meta(&machine.spec.endpoint, meta)?;
    node.meta_write(META_KEY_NETWORK, document.as_bytes())
        .await
        .with_context(|| format!("failed to write META key to {}", machine.spec.endpoint))?;
    info!(
        "Wrote network metadata to node {} of TalosMachine {}",
        machine.spec.endpoint,
        machine.name_any()
    );
    Ok(())
}

/// Reads an externally supplied configuration.
async fn read_config_ref(
    ctx: &Context,
    namespace: &str,
    reference: &ConfigMapKeyRef,
) -> Result<String> {
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
    let config_map = api
        .get(&reference.name)
        .await
        .with_context(|| format!("failed to get ConfigMap {namespace}/{}", reference.name))?;
    config_map
        .data
        .and_then(|mut data| data.remove(&reference.key))
        .ok_or_else(|| {
            anyhow!(
                "ConfigMap {namespace}/{} has no key {}",
                reference.name,
                reference.key
            )
        })
}

async fn node_ready(
    ctx: &Context,
    descriptor: &BundleDescriptor,
    secrets: &SecretsBundle,
) -> Result<bool, NodeOsError> {
    let node = ctx.node_os.connect(descriptor, secrets, false).await?;
    Ok(node.service_state(KUBELET_SERVICE).await? == SERVICE_STATE_RUNNING)
}

/// Checks an installing or upgrading node. `Available` once its kubelet runs.
async fn await_readiness(
    ctx: &Arc<Context>,
    machine: &TalosMachine,
    status: &mut StatusUpdater<TalosMachine>,
    descriptor: &BundleDescriptor,
    secrets: &SecretsBundle,
) -> Result<ReconcileOutcome> {
    let name = machine.name_any();
    let ready = match node_ready(ctx, descriptor, secrets).await {
        Ok(ready) => ready,
        Err(e) => {
            debug!(machine = %name, error = %e, "Node not reachable yet");
            false
        }
    };

    if ready {
        ctx.watchers.remove(&object_key(machine)).await?;
        set_state(status, &name, LifecycleState::Available);
        status.set_condition(
            CONDITION_TYPE_READY,
            STATUS_TRUE,
            REASON_NODE_READY,
            "kubelet is running",
        );
        status.apply(&ctx.client).await?;
        return Ok(ReconcileOutcome::Done);
    }

    ensure_watcher(ctx, machine, descriptor, secrets).await?;
    status.set_condition(
        CONDITION_TYPE_READY,
        STATUS_FALSE,
        REASON_INSTALLING,
        "Waiting for the kubelet to run",
    );
    status.apply(&ctx.client).await?;
    Ok(ReconcileOutcome::requeue_secs(DEPENDENCY_REQUEUE_SECS))
}

/// Registers a readiness watcher for `machine` unless one is running.
async fn ensure_watcher(
    ctx: &Arc<Context>,
    machine: &TalosMachine,
    descriptor: &BundleDescriptor,
    secrets: &SecretsBundle,
) -> Result<()> {
    let key = object_key(machine);
    if ctx.watchers.has(&key).await? {
        return Ok(());
    }
    ctx.watchers.add(&key, ctx.machine_trigger.clone()).await?;
    debug!(watcher = %key, "Starting readiness watcher");

    tokio::spawn(watch_readiness(
        Arc::clone(ctx),
        key,
        descriptor.clone(),
        secrets.clone(),
        Duration::from_secs(NODE_WATCH_INTERVAL_SECS),
    ));
    Ok(())
}

/// Polls the node every `period` until its kubelet runs, then triggers `key`.
///
/// The registration is dropped after triggering so a pass that still finds the
/// node not ready can start a fresh watcher.
async fn watch_readiness(
    ctx: Arc<Context>,
    key: String,
    descriptor: BundleDescriptor,
    secrets: SecretsBundle,
    period: Duration,
) {
    let mut ticks = interval_at(Instant::now() + period, period);
    loop {
        ticks.tick().await;
        match ctx.watchers.has(&key).await {
            Ok(true) => {}
            Ok(false) | Err(_) => break,
        }
        match node_ready(&ctx, &descriptor, &secrets).await {
            Ok(true) => {
                debug!(watcher = %key, "Node is ready, triggering reconcile");
                if let Err(e) = ctx.watchers.trigger(&key).await {
                    warn!("Failed to trigger reconcile of {}: {:#}", key, e);
                }
                if let Err(e) = ctx.watchers.remove(&key).await {
                    warn!("Failed to remove watcher {}: {:#}", key, e);
                }
                break;
            }
            Ok(false) => {}
            Err(e) => debug!(watcher = %key, error = %e, "Node not reachable yet"),
        }
    }
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod machine_tests;
