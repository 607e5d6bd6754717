// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! `TalosClusterAddon` reconciliation logic.
//!
//! A cluster addon fans one chart out to the `TalosControlPlane`s of its
//! namespace that match `spec.clusterSelector`. Every match gets an owned
//! `TalosClusterAddonRelease`, which the release reconciler installs. Releases
//! of control planes that stopped matching or are being deleted are removed.
//!
//! New control planes are picked up on the periodic resync.

use crate::context::Context;
use crate::crd::{
    LocalObjectReference, TalosClusterAddon, TalosClusterAddonRelease,
    TalosClusterAddonReleaseSpec, TalosControlPlane,
};
use crate::events::{actions, reasons};
use crate::labels::{
    CLUSTER_ADDON_LABEL, K8S_MANAGED_BY, K8S_PART_OF, MANAGED_BY_TALOS_OPERATOR, PART_OF_TALOS,
};
use crate::reconcilers::pagination::list_all_paginated;
use crate::reconcilers::resources::{create_or_apply, delete_if_exists, ApplyOutcome};
use crate::reconcilers::status::{StatusUpdater, STATUS_FALSE, STATUS_TRUE};
use crate::reconcilers::{ReconcileMode, ReconcileOutcome};
use crate::status_reasons::{
    CONDITION_TYPE_READY, REASON_CONFIGURATION_INVALID, REASON_RELEASES_RECONCILED,
};
use crate::synthesis::build_owner_reference;
use anyhow::Result;
use kube::api::ListParams;
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the release of `addon` for `control_plane`.
#[must_use]
pub fn release_name(control_plane: &str, addon: &str) -> String {
    format!("{control_plane}-{addon}-addonrelease")
}

/// Builds the release of `addon` targeting `control_plane`.
#[must_use]
pub fn build_release(addon: &TalosClusterAddon, control_plane: &str) -> TalosClusterAddonRelease {
    let addon_name = addon.name_any();
    let spec = TalosClusterAddonReleaseSpec {
        cluster_ref: LocalObjectReference {
            name: control_plane.to_string(),
        },
        helm_release: addon.spec.helm_release.clone(),
    };
    let mut release =
        TalosClusterAddonRelease::new(&release_name(control_plane, &addon_name), spec);
    release.metadata.namespace = addon.namespace();
    release.metadata.labels = Some(BTreeMap::from([
        (CLUSTER_ADDON_LABEL.to_string(), addon_name),
        (K8S_MANAGED_BY.to_string(), MANAGED_BY_TALOS_OPERATOR.to_string()),
        (K8S_PART_OF.to_string(), PART_OF_TALOS.to_string()),
    ]));
    release.metadata.owner_references = Some(vec![build_owner_reference(addon)]);
    release
}

/// Names of the selected control planes that are not being deleted, sorted.
#[must_use]
pub fn selected_control_planes(control_planes: &[TalosControlPlane]) -> Vec<String> {
    let names: BTreeSet<String> = control_planes
        .iter()
        .filter(|cp| cp.metadata.deletion_timestamp.is_none())
        .map(ResourceExt::name_any)
        .collect();
    names.into_iter().collect()
}

/// Reconciles a `TalosClusterAddon` resource.
///
/// Deleting the addon needs no cleanup here: its releases are owned and are
/// garbage collected, each uninstalling its chart through its own finalizer.
///
/// # Errors
///
/// Returns an error if a Kubernetes API call fails.
pub async fn reconcile_talos_cluster_addon(
    ctx: Arc<Context>,
    addon: TalosClusterAddon,
) -> Result<ReconcileOutcome> {
    let namespace = addon.namespace().unwrap_or_default();
    let name = addon.name_any();

    if addon.metadata.deletion_timestamp.is_some() {
        debug!("TalosClusterAddon {}/{} is being deleted", namespace, name);
        return Ok(ReconcileOutcome::AwaitChange);
    }

    let mode = ReconcileMode::of(&addon);
    if mode == ReconcileMode::Disable {
        info!("Reconciliation of TalosClusterAddon {}/{} is disabled", namespace, name);
        return Ok(ReconcileOutcome::AwaitChange);
    }

    info!("Reconciling TalosClusterAddon: {}/{}", namespace, name);
    let mut status = StatusUpdater::new(&addon);

    let query = match addon.spec.cluster_selector.to_query() {
        Ok(query) => query,
        Err(e) => {
            let message = e.to_string();
            warn!("TalosClusterAddon {}/{} is invalid: {}", namespace, name, message);
            status.set_condition(
                CONDITION_TYPE_READY,
                STATUS_FALSE,
                REASON_CONFIGURATION_INVALID,
                &message,
            );
            status.apply(&ctx.client).await?;
            ctx.publish_event(
                &addon,
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                message,
            )
            .await;
            return Ok(ReconcileOutcome::AwaitChange);
        }
    };

    let mut list_params = ListParams::default();
    if let Some(query) = &query {
        list_params = list_params.labels(query);
    }
    let control_planes: Api<TalosControlPlane> = Api::namespaced(ctx.client.clone(), &namespace);
    let candidates = list_all_paginated(&control_planes, list_params).await?;
    let selected = selected_control_planes(&candidates);
    debug!(
        selector = query.as_deref().unwrap_or(""),
        selected = ?selected,
        "Selected control planes"
    );

    if mode == ReconcileMode::DryRun {
        info!(
            "Dry run: TalosClusterAddon {}/{} would have releases for {:?}",
            namespace, name, selected
        );
        return Ok(ReconcileOutcome::Done);
    }

    let mut desired = BTreeSet::new();
    for control_plane in &selected {
        let release = build_release(&addon, control_plane);
        let child_name = release.name_any();
        if create_or_apply(&ctx.client, &namespace, &release).await? == ApplyOutcome::Created {
            ctx.publish_event(
                &addon,
                EventType::Normal,
                reasons::CREATED,
                actions::RECONCILE,
                format!("Created TalosClusterAddonRelease {child_name}"),
            )
            .await;
        }
        desired.insert(child_name);
    }

    let releases: Api<TalosClusterAddonRelease> = Api::namespaced(ctx.client.clone(), &namespace);
    let owner_uid = addon.uid().unwrap_or_default();
    let owned = list_all_paginated(
        &releases,
        ListParams::default().labels(&format!("{CLUSTER_ADDON_LABEL}={name}")),
    )
    .await?;
    for release in owned
        .iter()
        .filter(|r| r.owner_references().iter().any(|o| o.uid == owner_uid))
    {
        let child_name = release.name_any();
        if desired.contains(&child_name) {
            continue;
        }
        info!(
            "TalosClusterAddonRelease {}/{} no longer matches TalosClusterAddon {}",
            namespace, child_name, name
        );
        let deleted =
            delete_if_exists::<TalosClusterAddonRelease>(&ctx.client, &namespace, &child_name)
                .await?;
        if deleted {
            ctx.publish_event(
                &addon,
                EventType::Normal,
                reasons::DELETED,
                actions::DELETE,
                format!("Deleted TalosClusterAddonRelease {child_name}"),
            )
            .await;
        }
    }

    let message = format!("{} release(s) for the selected control planes", selected.len());
    {
        let s = status.status_mut();
        s.matched_control_planes = selected;
        s.observed_generation = addon.metadata.generation;
    }
    status.set_condition(
        CONDITION_TYPE_READY,
        STATUS_TRUE,
        REASON_RELEASES_RECONCILED,
        &message,
    );
    status.apply(&ctx.client).await?;

    Ok(ReconcileOutcome::Done)
}

#[cfg(test)]
#[path = "cluster_addon_tests.rs"]
mod cluster_addon_tests;
