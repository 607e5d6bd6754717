// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! `TalosClusterAddonRelease` reconciliation logic.
//!
//! A release installs its chart into the cluster of the `TalosControlPlane`
//! named by `spec.clusterRef`, using the `<controlPlane>-kubeconfig` secret that
//! control plane published. Status and the install pipeline are shared with
//! `TalosAddon`. Deleting a release uninstalls the chart on a best-effort basis.

use crate::context::Context;
use crate::crd::{TalosClusterAddonRelease, TalosControlPlane};
use crate::external::ReleaseRequest;
use crate::labels::FINALIZER_TALOS_CLUSTER_ADDON_RELEASE;
use crate::metrics::clear_resource_state;
use crate::reconcilers::addon::{
    fail, install_release, is_installed, merged_values, read_kubeconfig_secret,
    release_request, Blocked,
};
use crate::reconcilers::controlplane::kubeconfig_secret_name;
use crate::reconcilers::finalizers::{ensure_finalizer, handle_deletion, FinalizerCleanup};
use crate::reconcilers::status::StatusUpdater;
use crate::reconcilers::ReconcileOutcome;
use crate::status_reasons::{
    REASON_CONTROL_PLANE_NOT_FOUND, REASON_INVALID_KUBECONFIG, REASON_KUBECONFIG_NOT_FOUND,
    REASON_VALUES_REFERENCE_ERROR,
};
use anyhow::{anyhow, Context as _, Result};
use kube::{Api, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const KIND: &str = "TalosClusterAddonRelease";

/// Resolves the control plane kubeconfig and chart values of `release`.
async fn prepare(
    ctx: &Context,
    release: &TalosClusterAddonRelease,
) -> std::result::Result<(Vec<u8>, ReleaseRequest), Blocked> {
    let namespace = release.namespace().unwrap_or_default();
    let control_plane_name = &release.spec.cluster_ref.name;

    let control_planes: Api<TalosControlPlane> = Api::namespaced(ctx.client.clone(), &namespace);
    control_planes
        .get_opt(control_plane_name)
        .await
        .with_context(|| {
            format!("failed to get TalosControlPlane {namespace}/{control_plane_name}")
        })
        .and_then(|cp| {
            cp.ok_or_else(|| anyhow!("TalosControlPlane {control_plane_name} not found"))
        })
        .map_err(|e| Blocked::new(REASON_CONTROL_PLANE_NOT_FOUND, e))?;

    let secret_name = kubeconfig_secret_name(control_plane_name);
    let kubeconfig = read_kubeconfig_secret(ctx, &namespace, &secret_name)
        .await
        .and_then(|k| k.ok_or_else(|| anyhow!("kubeconfig secret {secret_name} not found")))
        .map_err(|e| Blocked::new(REASON_KUBECONFIG_NOT_FOUND, e))?;
    if kubeconfig.is_empty() {
        return Err(Blocked::new(
            REASON_INVALID_KUBECONFIG,
            anyhow!("kubeconfig of TalosControlPlane {control_plane_name} is empty"),
        ));
    }

    let values = merged_values(ctx, &namespace, &release.spec.helm_release)
        .await
        .map_err(|e| Blocked::new(REASON_VALUES_REFERENCE_ERROR, e))?;
    let request = release_request(&release.spec.helm_release, &release.name_any(), values);
    Ok((kubeconfig, request))
}

#[async_trait::async_trait]
impl FinalizerCleanup for TalosClusterAddonRelease {
    async fn cleanup(&self, ctx: &Context) -> Result<()> {
        let namespace = self.namespace().unwrap_or_default();
        let name = self.name_any();
        clear_resource_state(KIND, &name);

        let secret_name = kubeconfig_secret_name(&self.spec.cluster_ref.name);
        let kubeconfig = match read_kubeconfig_secret(ctx, &namespace, &secret_name).await {
            Ok(Some(kubeconfig)) if !kubeconfig.is_empty() => kubeconfig,
            Ok(_) => {
                info!(
                    "No kubeconfig for TalosClusterAddonRelease {}/{}, skipping uninstall",
                    namespace, name
                );
                return Ok(());
            }
            Err(e) => {
                warn!(
                    "Skipping uninstall of TalosClusterAddonRelease {}/{}: {:#}",
                    namespace, name, e
                );
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
                "Uninstalled release {} of TalosClusterAddonRelease {}",
                request.release_name, name
            ),
            Err(e) => warn!(
                "Failed to uninstall TalosClusterAddonRelease {}/{}: {}",
                namespace, name, e
            ),
        }
        Ok(())
    }
}

/// Reconciles a `TalosClusterAddonRelease` resource.
///
/// # Errors
///
/// Returns an error when the control plane, kubeconfig or values cannot be
/// resolved, when the chart install fails, or when a Kubernetes API call fails.
pub async fn reconcile_talos_cluster_addon_release(
    ctx: Arc<Context>,
    release: TalosClusterAddonRelease,
) -> Result<ReconcileOutcome> {
    let namespace = release.namespace().unwrap_or_default();
    let name = release.name_any();

    if release.metadata.deletion_timestamp.is_some() {
        handle_deletion(&ctx, &release, FINALIZER_TALOS_CLUSTER_ADDON_RELEASE).await?;
        return Ok(ReconcileOutcome::AwaitChange);
    }

    let release =
        ensure_finalizer(&ctx.client, &release, FINALIZER_TALOS_CLUSTER_ADDON_RELEASE).await?;
    if is_installed(&release) {
        debug!(
            "TalosClusterAddonRelease {}/{} is installed and up to date",
            namespace, name
        );
        return Ok(ReconcileOutcome::Done);
    }

    info!("Reconciling TalosClusterAddonRelease: {}/{}", namespace, name);

    match prepare(&ctx, &release).await {
        Ok((kubeconfig, request)) => {
            install_release(&ctx, &release, &kubeconfig, &request).await
        }
        Err(blocked) => fail(&ctx, &release, &mut StatusUpdater::new(&release), blocked).await,
    }
}

#[cfg(test)]
#[path = "addon_release_tests.rs"]
mod addon_release_tests;
