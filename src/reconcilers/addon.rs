// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! `TalosAddon` reconciliation logic.
//!
//! An addon installs a Helm chart into the cluster of a `TalosCluster` using the
//! admin kubeconfig its control plane published. Once installed for the current
//! generation the addon is left alone until its spec changes.
//!
//! The install pipeline ([`install_release`]) is shared with
//! `TalosClusterAddonRelease`, which reports the same status.

use crate::constants::KUBECONFIG_KEY;
use crate::context::Context;
use crate::crd::{
    HelmReleaseSpec, LifecycleState, TalosAddon, TalosAddonStatus, TalosCluster,
    ValuesReference, ValuesSourceKind,
};
use crate::events::{actions, reasons};
use crate::external::ReleaseRequest;
use crate::labels::FINALIZER_TALOS_ADDON;
use crate::metrics::{clear_resource_state, set_resource_state};
use crate::reconcilers::cluster::control_plane_name;
use crate::reconcilers::controlplane::kubeconfig_secret_name;
use crate::reconcilers::finalizers::{ensure_finalizer, handle_deletion, FinalizerCleanup};
use crate::reconcilers::status::{
    is_condition_true, StatusUpdater, STATUS_FALSE, STATUS_TRUE,
};
use crate::reconcilers::{should_reconcile, ReconcileOutcome};
use crate::status_reasons::{
    CONDITION_TYPE_FAILED, CONDITION_TYPE_PROGRESSING, CONDITION_TYPE_READY,
    REASON_ADDON_INSTALLED, REASON_CLUSTER_NOT_FOUND, REASON_HELM_INSTALL_FAILED,
    REASON_INVALID_KUBECONFIG, REASON_KUBECONFIG_NOT_FOUND, REASON_PROGRESSING,
    REASON_VALUES_REFERENCE_ERROR,
};
use anyhow::{anyhow, Context as _, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::core::object::HasStatus;
use kube::core::NamespaceResourceScope;
use kube::runtime::events::EventType;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

const KIND: &str = "TalosAddon";

/// Resources that install one chart and report it through [`TalosAddonStatus`].
pub trait ChartResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + HasStatus<Status = TalosAddonStatus>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
{
}

impl<K> ChartResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + HasStatus<Status = TalosAddonStatus>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
{
}

/// Name of the secret holding the admin kubeconfig of `cluster`.
///
/// An inline control plane publishes `<cluster>-controlplane-kubeconfig`, a
/// referenced one `<controlPlaneRef>-kubeconfig`.
#[must_use]
pub fn cluster_kubeconfig_secret_name(cluster: &TalosCluster) -> String {
    match &cluster.spec.control_plane_ref {
        Some(reference) => kubeconfig_secret_name(&reference.name),
        None => kubeconfig_secret_name(&control_plane_name(&cluster.name_any())),
    }
}

/// Builds the release request for `release` with already merged `values`.
/// An empty release name falls back to `default_name`.
#[must_use]
pub fn release_request(
    release: &HelmReleaseSpec,
    default_name: &str,
    values: BTreeMap<String, String>,
) -> ReleaseRequest {
    ReleaseRequest {
        release_name: release
            .release_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| default_name.to_string()),
        namespace: release.target_namespace.clone(),
        repo_url: release.repo_url.clone(),
        chart_name: release.chart_name.clone(),
        version: release.version.clone().filter(|v| !v.is_empty()),
        values,
    }
}

/// Entries of one values source. A missing `key` yields no entry.
#[must_use]
pub fn select_values(
    data: BTreeMap<String, String>,
    key: Option<&str>,
) -> BTreeMap<String, String> {
    match key {
        Some(key) => data.into_iter().filter(|(k, _)| k == key).collect(),
        None => data,
    }
}

/// Why a pass stopped before installing.
pub(crate) struct Blocked {
    pub(crate) reason: &'static str,
    pub(crate) error: anyhow::Error,
}

impl Blocked {
    pub(crate) fn new(reason: &'static str, error: anyhow::Error) -> Self {
        Self { reason, error }
    }
}

async fn read_values_reference(
    ctx: &Context,
    namespace: &str,
    reference: &ValuesReference,
) -> Result<BTreeMap<String, String>> {
    let data = match reference.kind {
        ValuesSourceKind::ConfigMap => {
            let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
            api.get(&reference.name)
                .await
                .with_context(|| {
                    format!("failed to get ConfigMap {namespace}/{}", reference.name)
                })?
                .data
                .unwrap_or_default()
        }
        ValuesSourceKind::Secret => {
            let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
            let secret = api
                .get(&reference.name)
                .await
                .with_context(|| {
                    format!("failed to get Secret {namespace}/{}", reference.name)
                })?;
            let mut data = BTreeMap::new();
            for (key, value) in secret.data.unwrap_or_default() {
                let value = String::from_utf8(value.0).with_context(|| {
                    format!("key {key} of Secret {} is not UTF-8", reference.name)
                })?;
                data.insert(key, value);
            }
            data
        }
    };
    Ok(select_values(data, reference.key.as_deref()))
}

/// Merges `valuesFrom` in order, then the inline values on top.
pub(crate) async fn merged_values(
    ctx: &Context,
    namespace: &str,
    release: &HelmReleaseSpec,
) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for reference in &release.values_from {
        values.extend(read_values_reference(ctx, namespace, reference).await?);
    }
    values.extend(release.values.clone());
    Ok(values)
}

/// Reads the admin kubeconfig of `cluster`.
///
/// Returns `Ok(None)` when the secret does not exist yet.
async fn read_kubeconfig(ctx: &Context, cluster: &TalosCluster) -> Result<Option<Vec<u8>>> {
    let namespace = cluster.namespace().unwrap_or_default();
    read_kubeconfig_secret(ctx, &namespace, &cluster_kubeconfig_secret_name(cluster)).await
}

/// Reads the `kubeconfig` key of secret `namespace/name`.
///
/// Returns `Ok(None)` when the secret does not exist yet.
pub(crate) async fn read_kubeconfig_secret(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let secret = api
        .get_opt(name)
        .await
        .with_context(|| format!("failed to get Secret {namespace}/{name}"))?;
    Ok(secret.map(|secret| {
        secret
            .data
            .and_then(|mut data| data.remove(KUBECONFIG_KEY))
            .map(|value| value.0)
            .unwrap_or_default()
    }))
}

/// Resolves the cluster kubeconfig and chart values of `addon`.
async fn prepare(
    ctx: &Context,
    addon: &TalosAddon,
) -> std::result::Result<(Vec<u8>, ReleaseRequest), Blocked> {
    let namespace = addon.namespace().unwrap_or_default();
    let cluster_name = &addon.spec.cluster_ref.name;

    let clusters: Api<TalosCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let cluster = clusters
        .get_opt(cluster_name)
        .await
        .with_context(|| format!("failed to get TalosCluster {namespace}/{cluster_name}"))
        .and_then(|c| c.ok_or_else(|| anyhow!("TalosCluster {cluster_name} not found")))
        .map_err(|e| Blocked::new(REASON_CLUSTER_NOT_FOUND, e))?;

    let kubeconfig = read_kubeconfig(ctx, &cluster)
        .await
        .and_then(|k| {
            k.ok_or_else(|| {
                anyhow!(
                    "kubeconfig secret {} not found",
                    cluster_kubeconfig_secret_name(&cluster)
                )
            })
        })
        .map_err(|e| Blocked::new(REASON_KUBECONFIG_NOT_FOUND, e))?;
    if kubeconfig.is_empty() {
        return Err(Blocked::new(
            REASON_INVALID_KUBECONFIG,
            anyhow!("kubeconfig of TalosCluster {cluster_name} is empty"),
        ));
    }

    let values = merged_values(ctx, &namespace, &addon.spec.helm_release)
        .await
        .map_err(|e| Blocked::new(REASON_VALUES_REFERENCE_ERROR, e))?;
    let request = release_request(&addon.spec.helm_release, &addon.name_any(), values);
    Ok((kubeconfig, request))
}

#[async_trait::async_trait]
impl FinalizerCleanup for TalosAddon {
    async fn cleanup(&self, ctx: &Context) -> Result<()> {
        let namespace = self.namespace().unwrap_or_default();
        let name = self.name_any();
        clear_resource_state(KIND, &name);

        let clusters: Api<TalosCluster> = Api::namespaced(ctx.client.clone(), &namespace);
        let cluster = match clusters.get_opt(&self.spec.cluster_ref.name).await {
            Ok(Some(cluster)) => cluster,
            Ok(None) => {
                info!(
                    "TalosCluster {} is gone, skipping uninstall of TalosAddon {}/{}",
                    self.spec.cluster_ref.name, namespace, name
                );
                return Ok(());
            }
            Err(e) => {
                warn!("Skipping uninstall of TalosAddon {}/{}: {}", namespace, name, e);
                return Ok(());
            }
        };
        let kubeconfig = match read_kubeconfig(ctx, &cluster).await {
            Ok(Some(kubeconfig)) if !kubeconfig.is_empty() => kubeconfig,
            Ok(_) => {
                info!("No kubeconfig for TalosAddon {}/{}, skipping uninstall", namespace, name);
                return Ok(());
            }
            Err(e) => {
                warn!("Skipping uninstall of TalosAddon {}/{}: {:#}", namespace, name, e);
                return Ok(());
            }
        };

        let request = release_request(&self.spec.helm_release, &name, BTreeMap::new());
        match ctx
            .packages
            .uninstall(&kubeconfig, &request.release_name, &request.namespace)
            .await
        {
            Ok(()) => info!(
                "Uninstalled release {} of TalosAddon {}",
                request.release_name, name
            ),
            Err(e) => warn!("Failed to uninstall TalosAddon {}/{}: {}", namespace, name, e),
        }
        Ok(())
    }
}

/// Reconciles a `TalosAddon` resource.
///
/// # Errors
///
/// Returns an error when the cluster, kubeconfig or values cannot be resolved,
/// when the chart install fails, or when a Kubernetes API call fails.
pub async fn reconcile_talos_addon(
    ctx: Arc<Context>,
    addon: TalosAddon,
) -> Result<ReconcileOutcome> {
    let namespace = addon.namespace().unwrap_or_default();
    let name = addon.name_any();

    if addon.metadata.deletion_timestamp.is_some() {
        handle_deletion(&ctx, &addon, FINALIZER_TALOS_ADDON).await?;
        return Ok(ReconcileOutcome::AwaitChange);
    }

    let addon = ensure_finalizer(&ctx.client, &addon, FINALIZER_TALOS_ADDON).await?;
    if is_installed(&addon) {
        debug!("TalosAddon {}/{} is installed and up to date", namespace, name);
        return Ok(ReconcileOutcome::Done);
    }

    info!("Reconciling TalosAddon: {}/{}", namespace, name);

    match prepare(&ctx, &addon).await {
        Ok((kubeconfig, request)) => install_release(&ctx, &addon, &kubeconfig, &request).await,
        Err(blocked) => fail(&ctx, &addon, &mut StatusUpdater::new(&addon), blocked).await,
    }
}

/// True once the chart is installed for the current generation.
pub(crate) fn is_installed<K: ChartResource>(resource: &K) -> bool {
    let status = resource.status();
    let observed = status.and_then(|s| s.observed_generation);
    let ready = status.is_some_and(|s| is_condition_true(&s.conditions, CONDITION_TYPE_READY));
    ready && !should_reconcile(resource.meta().generation, observed)
}

/// Installs or upgrades `request` and reports the outcome on `resource`.
///
/// # Errors
///
/// Returns an error when the install fails or a status write fails.
pub(crate) async fn install_release<K: ChartResource>(
    ctx: &Context,
    resource: &K,
    kubeconfig: &[u8],
    request: &ReleaseRequest,
) -> Result<ReconcileOutcome> {
    let kind = K::kind(&());
    let namespace = resource.namespace().unwrap_or_default();
    let name = resource.name_any();

    let mut status = StatusUpdater::new(resource);
    status.status_mut().state = Some(LifecycleState::Installing);
    status.set_condition(
        CONDITION_TYPE_PROGRESSING,
        STATUS_TRUE,
        REASON_PROGRESSING,
        &format!("Installing chart {}", request.chart_name),
    );
    status.apply(&ctx.client).await?;
    set_resource_state(&kind, &name, LifecycleState::Installing);

    let revision = match ctx.packages.install_or_upgrade(kubeconfig, request).await {
        Ok(revision) => revision,
        Err(e) => {
            let blocked = Blocked::new(REASON_HELM_INSTALL_FAILED, anyhow::Error::new(e));
            return fail(ctx, resource, &mut status, blocked).await;
        }
    };

    info!(
        "{} {}/{} installed release {} revision {}",
        kind, namespace, name, request.release_name, revision
    );
    let message = format!("Release {} at revision {revision}", request.release_name);
    {
        let s = status.status_mut();
        s.state = Some(LifecycleState::Ready);
        s.last_applied_revision = Some(revision);
        s.observed_generation = resource.meta().generation;
    }
    status.clear_condition(CONDITION_TYPE_FAILED);
    status.clear_condition(CONDITION_TYPE_PROGRESSING);
    status.set_condition(CONDITION_TYPE_READY, STATUS_TRUE, REASON_ADDON_INSTALLED, &message);
    status.apply(&ctx.client).await?;
    set_resource_state(&kind, &name, LifecycleState::Ready);
    ctx.publish_event(
        resource,
        EventType::Normal,
        reasons::ADDON_INSTALLED,
        actions::INSTALL,
        message,
    )
    .await;

    Ok(ReconcileOutcome::Done)
}

/// Records a failed pass and returns its error.
pub(crate) async fn fail<K: ChartResource>(
    ctx: &Context,
    resource: &K,
    status: &mut StatusUpdater<K>,
    blocked: Blocked,
) -> Result<ReconcileOutcome> {
    let Blocked { reason, error } = blocked;
    let kind = K::kind(&());
    let name = resource.name_any();
    warn!(
        "{} {}/{} failed ({}): {:#}",
        kind,
        resource.namespace().unwrap_or_default(),
        name,
        reason,
        error
    );
    let message = format!("{error:#}");
    status.status_mut().state = Some(LifecycleState::Failed);
    status.clear_condition(CONDITION_TYPE_PROGRESSING);
    status.set_condition(CONDITION_TYPE_FAILED, STATUS_TRUE, reason, &message);
    status.set_condition(CONDITION_TYPE_READY, STATUS_FALSE, reason, &message);
    status.apply(&ctx.client).await?;
    set_resource_state(&kind, &name, LifecycleState::Failed);
    ctx.publish_event(
        resource,
        EventType::Warning,
        reasons::ADDON_FAILED,
        actions::INSTALL,
        message,
    )
    .await;
    Err(error)
}

#[cfg(test)]
#[path = "addon_tests.rs"]
mod addon_tests;
