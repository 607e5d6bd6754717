// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! `TalosControlPlane` reconciliation logic.
//!
//! A control plane owns the cluster secrets bundle. Each pass generates the
//! control plane configuration from it, provisions the nodes for the selected
//! mode, bootstraps etcd and publishes the admin kubeconfig:
//!
//! ```text
//! Pending -> Installing -> Available -> Bootstrapped -> Ready
//! ```
//!
//! Container mode runs the nodes as a `StatefulSet` fronted by one `Service` per
//! replica plus a cluster-facing one. Cloud mode hands the instances to the
//! [`CloudProvisioner`](crate::external::CloudProvisioner). Metal mode is not
//! supported for control planes.

use crate::bundle::descriptor::generate_sans;
use crate::bundle::{
    generate_config, generate_talosconfig, BundleDescriptor, ConfigKey, MachineType,
    ObjectIdentity, SecretsBundle,
};
use crate::constants::{
    KUBECONFIG_KEY, KUBECONFIG_SUFFIX, KUBE_API_PORT, PROVISIONING_REQUEUE_SECS,
    TALOSCONFIG_SUFFIX,
};
use crate::context::Context;
use crate::crd::{DeploymentMode, LifecycleState, TalosControlPlane, TalosControlPlaneStatus};
use crate::errors::{BundleError, NodeOsError, ValidationError};
use crate::events::{actions, reasons};
use crate::external::NodeOsClient;
use crate::labels::FINALIZER_TALOS_CONTROL_PLANE;
use crate::metrics::{clear_resource_state, set_resource_state};
use crate::reconcilers::finalizers::{ensure_finalizer, handle_deletion, FinalizerCleanup};
use crate::reconcilers::resources::create_or_apply;
use crate::reconcilers::status::{StatusUpdater, STATUS_FALSE, STATUS_TRUE};
use crate::reconcilers::{annotation_patches, ReconcileOutcome};
use crate::status_reasons::{
    CONDITION_TYPE_DELETING, CONDITION_TYPE_FAILED, CONDITION_TYPE_PROGRESSING,
    CONDITION_TYPE_READY, REASON_BOOTSTRAPPED, REASON_CONFIGURATION_INVALID,
    REASON_CONFIG_GENERATED, REASON_CONFIG_GENERATION_FAILED, REASON_DELETING,
    REASON_KUBECONFIG_WRITTEN, REASON_UNSUPPORTED_MODE, REASON_WAITING_FOR_NODES,
};
use crate::synthesis::{
    build_config_map, build_owner_reference, build_secret, build_services, build_statefulset,
    NodeSetParams,
};
use anyhow::{anyhow, Context as _, Result};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

const KIND: &str = "TalosControlPlane";

/// Name of the secret holding the talosconfig of `control_plane`.
#[must_use]
pub fn talosconfig_secret_name(control_plane: &str) -> String {
    format!("{control_plane}-{TALOSCONFIG_SUFFIX}")
}

/// Name of the secret holding the admin kubeconfig of `control_plane`.
#[must_use]
pub fn kubeconfig_secret_name(control_plane: &str) -> String {
    format!("{control_plane}-{KUBECONFIG_SUFFIX}")
}

/// Kubernetes API endpoint of a control plane: the explicit endpoint, or its
/// cluster-facing service.
#[must_use]
pub fn api_endpoint(control_plane: &TalosControlPlane) -> String {
    match control_plane.spec.endpoint.as_deref() {
        Some(endpoint) if !endpoint.is_empty() => endpoint.to_string(),
        _ => format!("https://{}:{KUBE_API_PORT}", control_plane.name_any()),
    }
}

/// Builds the bundle descriptor of a control plane from its spec.
#[must_use]
pub fn build_descriptor(control_plane: &TalosControlPlane) -> BundleDescriptor {
    let name = control_plane.name_any();
    let spec = &control_plane.spec;
    let replicas = (spec.mode == DeploymentMode::Container).then_some(spec.replicas);
    BundleDescriptor {
        cluster_name: name.clone(),
        endpoint: api_endpoint(control_plane),
        version: spec.version.clone(),
        kube_version: spec.kube_version.clone(),
        sans: generate_sans(&name, replicas),
        pod_cidr: spec.pod_cidr.clone(),
        service_cidr: spec.service_cidr.clone(),
        client_endpoints: Vec::new(),
        cluster_domain: (!spec.cluster_domain.is_empty()).then(|| spec.cluster_domain.clone()),
    }
}

/// Descriptor and secrets bundle persisted by `control_plane`, or `None` until
/// its first pass persisted them.
///
/// # Errors
///
/// Returns an error if the persisted descriptor or bundle does not parse.
pub async fn persisted_bundle(
    ctx: &Context,
    control_plane: &TalosControlPlane,
) -> Result<Option<(BundleDescriptor, SecretsBundle)>> {
    let Some(status) = control_plane.status.as_ref() else {
        return Ok(None);
    };
    if status.secret_bundle.is_empty() || status.bundle_config.is_empty() {
        return Ok(None);
    }

    let name = control_plane.name_any();
    let descriptor = BundleDescriptor::from_yaml(&status.bundle_config)
        .with_context(|| format!("invalid bundle descriptor on TalosControlPlane {name}"))?;
    // Only the control plane itself generates a bundle. The status is non-empty here.
    let never_persist = |_: String| async {
        Err::<(), _>(anyhow!("secrets bundle of {name} is owned by its control plane"))
    };
    let secrets = ctx
        .bundles
        .get_or_create_secrets(
            &ObjectIdentity::of(control_plane),
            &status.secret_bundle,
            never_persist,
        )
        .await?;
    Ok(Some((descriptor, secrets)))
}

/// Whether the control plane has reached `state` or a later one.
fn reached(status: &TalosControlPlaneStatus, state: LifecycleState) -> bool {
    let rank = |s: LifecycleState| match s {
        LifecycleState::Pending | LifecycleState::Failed | LifecycleState::Orphaned => 0,
        LifecycleState::Installing | LifecycleState::Upgrading => 1,
        LifecycleState::Available => 2,
        LifecycleState::Bootstrapped => 3,
        LifecycleState::Ready => 4,
    };
    status.state.is_some_and(|current| rank(current) >= rank(state))
}

fn set_state(status: &mut StatusUpdater<TalosControlPlane>, name: &str, state: LifecycleState) {
    if status.status().state != Some(state) {
        info!("TalosControlPlane {} is now {}", name, state);
    }
    status.status_mut().state = Some(state);
    set_resource_state(KIND, name, state);
}

#[async_trait::async_trait]
impl FinalizerCleanup for TalosControlPlane {
    async fn cleanup(&self, ctx: &Context) -> Result<()> {
        let name = self.name_any();

        let mut status = StatusUpdater::new(self);
        status.set_condition(
            CONDITION_TYPE_DELETING,
            STATUS_TRUE,
            REASON_DELETING,
            "Removing control plane resources",
        );
        if let Err(e) = status.apply(&ctx.client).await {
            warn!("Failed to set Deleting condition on TalosControlPlane {}: {:#}", name, e);
        }

        if self.spec.mode == DeploymentMode::Cloud {
            if let Err(e) = ctx.cloud.teardown(self).await {
                warn!("Cloud teardown of TalosControlPlane {} failed: {}", name, e);
            }
        }

        ctx.bundles.forget(&ObjectIdentity::of(self));
        clear_resource_state(KIND, &name);
        Ok(())
    }
}

/// Reconciles a `TalosControlPlane` resource.
///
/// This function:
/// 1. Handles deletion (cloud teardown, then the finalizer)
/// 2. Resolves the secrets bundle, generating and persisting it on first use
/// 3. Generates the configuration and writes the config map and talosconfig
/// 4. Provisions the nodes for the deployment mode
/// 5. Bootstraps etcd and writes the kubeconfig secret
///
/// # Errors
///
/// Returns an error if configuration cannot be generated, a node OS call fails
/// or a Kubernetes API call fails.
pub async fn reconcile_talos_control_plane(
    ctx: Arc<Context>,
    control_plane: TalosControlPlane,
) -> Result<ReconcileOutcome> {
    let namespace = control_plane.namespace().unwrap_or_default();
    let name = control_plane.name_any();

    info!("Reconciling TalosControlPlane: {}/{}", namespace, name);
    debug!(
        namespace = %namespace,
        name = %name,
        mode = ?control_plane.spec.mode,
        replicas = control_plane.spec.replicas,
        generation = ?control_plane.metadata.generation,
        "Starting TalosControlPlane reconciliation"
    );

    if control_plane.metadata.deletion_timestamp.is_some() {
        handle_deletion(&ctx, &control_plane, FINALIZER_TALOS_CONTROL_PLANE).await?;
        return Ok(ReconcileOutcome::AwaitChange);
    }

    let control_plane =
        ensure_finalizer(&ctx.client, &control_plane, FINALIZER_TALOS_CONTROL_PLANE).await?;
    let mut status = StatusUpdater::new(&control_plane);

    if control_plane.spec.mode == DeploymentMode::Metal {
        warn!(
            "TalosControlPlane {}/{} uses metal mode, which is not supported for control planes",
            namespace, name
        );
        status.set_condition(
            CONDITION_TYPE_READY,
            STATUS_FALSE,
            REASON_UNSUPPORTED_MODE,
            "Metal mode is not supported for control planes",
        );
        status.apply(&ctx.client).await?;
        return Ok(ReconcileOutcome::AwaitChange);
    }
    if control_plane.spec.mode == DeploymentMode::Cloud && control_plane.spec.cloud_spec.is_none()
    {
        let error = ValidationError::MissingModeField {
            field: "cloudSpec",
            mode: "cloud".to_string(),
        };
        return fail(&ctx, &control_plane, &mut status, REASON_CONFIGURATION_INVALID, error)
            .await;
    }

    // Secrets bundle and configuration
    let identity = ObjectIdentity::of(&control_plane);
    let persisted = status.status().secret_bundle.clone();
    let client = ctx.client.clone();
    let secrets = ctx
        .bundles
        .get_or_create_secrets(&identity, &persisted, |serialized| {
            let status = &mut status;
            async move {
                status.status_mut().secret_bundle = serialized;
                status.status_mut().state.get_or_insert(LifecycleState::Pending);
                status.apply(&client).await.map(|_| ())
            }
        })
        .await?;

    let descriptor = build_descriptor(&control_plane);
    let config = match generate(&ctx, &control_plane, &identity, &descriptor, &secrets) {
        Ok(config) => config,
        Err(e) => {
            warn!(
                "Failed to generate configuration for TalosControlPlane {}: {} ({})",
                name,
                e,
                e.status_reason()
            );
            return fail(&ctx, &control_plane, &mut status, REASON_CONFIG_GENERATION_FAILED, e)
                .await;
        }
    };
    let bundle_config = descriptor.to_yaml()?;
    let config_changed = status.status().config != config;
    let descriptor_changed = status.status().bundle_config != bundle_config;

    status.status_mut().config = config.clone();
    status.status_mut().bundle_config = bundle_config;
    if matches!(status.status().state, None | Some(LifecycleState::Failed)) {
        set_state(&mut status, &name, LifecycleState::Pending);
    }
    status.clear_condition(CONDITION_TYPE_FAILED);
    if config_changed {
        status.set_condition(
            CONDITION_TYPE_PROGRESSING,
            STATUS_TRUE,
            REASON_CONFIG_GENERATED,
            "Control plane configuration generated",
        );
    }
    if reached(status.status(), LifecycleState::Ready)
        && status.status().observed_kube_version.as_deref()
            != Some(control_plane.spec.kube_version.as_str())
    {
        set_state(&mut status, &name, LifecycleState::Upgrading);
        ctx.publish_event(
            &control_plane,
            EventType::Normal,
            reasons::UPGRADE_STARTED,
            actions::UPGRADE,
            format!("Upgrading Kubernetes to {}", control_plane.spec.kube_version),
        )
        .await;
    }
    status.apply(&ctx.client).await?;

    let owner = build_owner_reference(&control_plane);
    let config_map = build_config_map(
        &name,
        &namespace,
        MachineType::ControlPlane,
        &config,
        &owner,
    );
    create_or_apply(&ctx.client, &namespace, &config_map).await?;
    write_talosconfig(&ctx, &control_plane, &descriptor, &secrets, descriptor_changed).await?;
    if config_changed {
        ctx.publish_event(
            &control_plane,
            EventType::Normal,
            reasons::CONFIG_GENERATED,
            actions::RECONCILE,
            format!("Generated configuration for Talos {}", control_plane.spec.version),
        )
        .await;
    }

    // Provisioning
    let mut node_descriptor = descriptor.clone();
    let provisioned = match control_plane.spec.mode {
        DeploymentMode::Cloud => {
            ctx.cloud
                .ensure_instances(&control_plane)
                .await
                .with_context(|| format!("failed to provision instances of {namespace}/{name}"))?;
            let instances = ctx
                .cloud
                .instances(&control_plane)
                .await
                .with_context(|| format!("failed to list instances of {namespace}/{name}"))?;
            node_descriptor.client_endpoints = instances.addresses;
            instances.ready
        }
        _ => provision_container(&ctx, &control_plane, &owner).await?,
    };

    if !provisioned {
        if !reached(status.status(), LifecycleState::Available) {
            set_state(&mut status, &name, LifecycleState::Installing);
        }
        status.set_condition(
            CONDITION_TYPE_READY,
            STATUS_FALSE,
            REASON_WAITING_FOR_NODES,
            "Waiting for control plane nodes to become ready",
        );
        status.apply(&ctx.client).await?;
        return Ok(ReconcileOutcome::requeue_secs(PROVISIONING_REQUEUE_SECS));
    }
    if !reached(status.status(), LifecycleState::Available) {
        set_state(&mut status, &name, LifecycleState::Available);
    }

    // Bootstrap and kubeconfig
    let node = ctx
        .node_os
        .connect(&node_descriptor, &secrets, false)
        .await
        .with_context(|| format!("failed to connect to control plane {namespace}/{name}"))?;
    bootstrap(&ctx, &control_plane, node.as_ref(), &mut status).await?;
    let kubeconfig = node
        .kubeconfig()
        .await
        .with_context(|| format!("failed to read kubeconfig of {namespace}/{name}"))?;
    let secret = build_secret(
        &kubeconfig_secret_name(&name),
        &namespace,
        KUBECONFIG_KEY,
        &String::from_utf8_lossy(&kubeconfig),
        &owner,
    );
    create_or_apply(&ctx.client, &namespace, &secret).await?;

    set_state(&mut status, &name, LifecycleState::Ready);
    status.status_mut().observed_kube_version = Some(control_plane.spec.kube_version.clone());
    status.status_mut().observed_generation = control_plane.metadata.generation;
    status.set_condition(
        CONDITION_TYPE_PROGRESSING,
        STATUS_FALSE,
        REASON_KUBECONFIG_WRITTEN,
        "Control plane is up to date",
    );
    status.set_condition(
        CONDITION_TYPE_READY,
        STATUS_TRUE,
        REASON_KUBECONFIG_WRITTEN,
        "Control plane is bootstrapped and the kubeconfig is available",
    );
    status.apply(&ctx.client).await?;

    Ok(ReconcileOutcome::Done)
}

fn generate(
    ctx: &Context,
    control_plane: &TalosControlPlane,
    identity: &ObjectIdentity,
    descriptor: &BundleDescriptor,
    secrets: &SecretsBundle,
) -> Result<String, BundleError> {
    let generation = control_plane.metadata.generation.unwrap_or_default();
    let patches = annotation_patches(control_plane)?;
    let key = ConfigKey::new(generation, MachineType::ControlPlane, descriptor, &patches)?;
    ctx.bundles.get_or_generate_config(identity, key, || {
        generate_config(descriptor, secrets, MachineType::ControlPlane, &patches)
    })
}

/// Reports a terminal error: state `Failed`, `Ready=False` and `Failed=True`
/// with `reason`, then returns the error.
///
/// `Failed` ranks with `Pending`, so the next successful pass starts over.
async fn fail<E>(
    ctx: &Context,
    control_plane: &TalosControlPlane,
    status: &mut StatusUpdater<TalosControlPlane>,
    reason: &str,
    error: E,
) -> Result<ReconcileOutcome>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = error.to_string();
    set_state(status, &control_plane.name_any(), LifecycleState::Failed);
    status.set_condition(CONDITION_TYPE_READY, STATUS_FALSE, reason, &message);
    status.set_condition(CONDITION_TYPE_FAILED, STATUS_TRUE, reason, &message);
    status.apply(&ctx.client).await?;
    ctx.publish_event(
        control_plane,
        EventType::Warning,
        reasons::VALIDATION_FAILED,
        actions::RECONCILE,
        message,
    )
    .await;
    Err(error).with_context(|| {
        format!(
            "TalosControlPlane {}/{} failed",
            control_plane.namespace().unwrap_or_default(),
            control_plane.name_any()
        )
    })
}

/// Writes the talosconfig secret. The talosconfig embeds a freshly issued client
/// certificate, so it is only rewritten when the descriptor changed or the
/// secret is missing.
async fn write_talosconfig(
    ctx: &Context,
    control_plane: &TalosControlPlane,
    descriptor: &BundleDescriptor,
    secrets: &SecretsBundle,
    descriptor_changed: bool,
) -> Result<()> {
    let namespace = control_plane.namespace().unwrap_or_default();
    let name = control_plane.name_any();
    let secret_name = talosconfig_secret_name(&name);

    if !descriptor_changed {
        let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
        let existing = api
            .get_opt(&secret_name)
            .await
            .with_context(|| format!("failed to get Secret {namespace}/{secret_name}"))?;
        if existing.is_some() {
            return Ok(());
        }
    }

    let talosconfig = generate_talosconfig(descriptor, secrets)
        .with_context(|| format!("failed to generate talosconfig for {namespace}/{name}"))?;
    let secret = build_secret(
        &secret_name,
        &namespace,
        &format!("{name}.{TALOSCONFIG_SUFFIX}"),
        &talosconfig,
        &build_owner_reference(control_plane),
    );
    create_or_apply(&ctx.client, &namespace, &secret).await?;
    Ok(())
}

/// Applies the services and `StatefulSet` of a container-mode control plane.
/// Returns true once every replica is ready.
async fn provision_container(
    ctx: &Context,
    control_plane: &TalosControlPlane,
    owner: &OwnerReference,
) -> Result<bool> {
    let namespace = control_plane.namespace().unwrap_or_default();
    let name = control_plane.name_any();
    let spec = &control_plane.spec;

    for service in build_services(
        &name,
        &namespace,
        spec.replicas,
        MachineType::ControlPlane,
        owner,
    ) {
        create_or_apply(&ctx.client, &namespace, &service).await?;
    }

    let params = NodeSetParams {
        name: &name,
        namespace: &namespace,
        replicas: spec.replicas,
        version: &spec.version,
        machine_type: MachineType::ControlPlane,
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
    debug!(ready_replicas, replicas = spec.replicas, "Control plane StatefulSet status");
    Ok(ready_replicas >= spec.replicas)
}

/// Bootstraps etcd. A node that reports etcd as already bootstrapped counts as success.
async fn bootstrap(
    ctx: &Context,
    control_plane: &TalosControlPlane,
    node: &dyn NodeOsClient,
    status: &mut StatusUpdater<TalosControlPlane>,
) -> Result<()> {
    let namespace = control_plane.namespace().unwrap_or_default();
    let name = control_plane.name_any();

    match node.bootstrap().await {
        Ok(()) => info!("Bootstrapped etcd of TalosControlPlane {}/{}", namespace, name),
        Err(NodeOsError::AlreadyBootstrapped { endpoint }) => {
            debug!(endpoint = %endpoint, "etcd already bootstrapped");
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to bootstrap {namespace}/{name}"));
        }
    }

    if !reached(status.status(), LifecycleState::Bootstrapped) {
        set_state(status, &name, LifecycleState::Bootstrapped);
        status.set_condition(
            CONDITION_TYPE_PROGRESSING,
            STATUS_TRUE,
            REASON_BOOTSTRAPPED,
            "etcd bootstrapped",
        );
        status.apply(&ctx.client).await?;
        ctx.publish_event(
            control_plane,
            EventType::Normal,
            reasons::BOOTSTRAPPED,
            actions::BOOTSTRAP,
            "etcd bootstrapped".to_string(),
        )
        .await;
    }
    Ok(())
}

#[cfg(test)]
#[path = "controlplane_tests.rs"]
mod controlplane_tests;
