// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! `TalosEtcdBackup` reconciliation logic.
//!
//! A backup is one-shot: it snapshots etcd through the node OS API of the
//! referenced control plane and uploads the snapshot to S3-compatible storage
//! under `etcd-backups/<control plane>/etcd-snapshot-<timestamp>.db`. A backup
//! that succeeded is never taken again.

use crate::context::Context;
use crate::crd::{SecretKeyRef, TalosControlPlane, TalosEtcdBackup};
use crate::events::{actions, reasons};
use crate::external::object_store::snapshot_key;
use crate::external::S3Target;
use crate::labels::FINALIZER_TALOS_ETCD_BACKUP;
use crate::metrics::record_etcd_backup;
use crate::reconcilers::controlplane::persisted_bundle;
use crate::reconcilers::finalizers::{ensure_finalizer, handle_deletion, FinalizerCleanup};
use crate::reconcilers::status::{is_condition_true, StatusUpdater, STATUS_FALSE, STATUS_TRUE};
use crate::reconcilers::ReconcileOutcome;
use crate::status_reasons::{
    CONDITION_TYPE_FAILED, CONDITION_TYPE_PROGRESSING, CONDITION_TYPE_READY,
    REASON_BACKUP_COMPLETED, REASON_BACKUP_FAILED, REASON_BACKUP_IN_PROGRESS,
    REASON_BACKUP_SUCCEEDED,
};
use anyhow::{anyhow, Context as _, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whether `backup` already completed successfully.
#[must_use]
pub fn is_backup_ready(backup: &TalosEtcdBackup) -> bool {
    backup
        .status
        .as_ref()
        .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_TYPE_READY))
}

#[async_trait::async_trait]
impl FinalizerCleanup for TalosEtcdBackup {
    async fn cleanup(&self, _ctx: &Context) -> Result<()> {
        // Uploaded snapshots outlive their backup object.
        debug!(backup = %self.name_any(), "Nothing to clean up for TalosEtcdBackup");
        Ok(())
    }
}

/// Reconciles a `TalosEtcdBackup` resource.
///
/// # Errors
///
/// Returns an error if the snapshot or upload fails, or a Kubernetes API call
/// fails.
pub async fn reconcile_talos_etcd_backup(
    ctx: Arc<Context>,
    backup: TalosEtcdBackup,
) -> Result<ReconcileOutcome> {
    let namespace = backup.namespace().unwrap_or_default();
    let name = backup.name_any();

    info!("Reconciling TalosEtcdBackup: {}/{}", namespace, name);

    if backup.metadata.deletion_timestamp.is_some() {
        handle_deletion(&ctx, &backup, FINALIZER_TALOS_ETCD_BACKUP).await?;
        return Ok(ReconcileOutcome::AwaitChange);
    }

    if is_backup_ready(&backup) {
        debug!("TalosEtcdBackup {}/{} already completed", namespace, name);
        return Ok(ReconcileOutcome::AwaitChange);
    }

    let backup = ensure_finalizer(&ctx.client, &backup, FINALIZER_TALOS_ETCD_BACKUP).await?;
    let mut status = StatusUpdater::new(&backup);
    status.set_condition(
        CONDITION_TYPE_PROGRESSING,
        STATUS_TRUE,
        REASON_BACKUP_IN_PROGRESS,
        "Taking etcd snapshot",
    );
    status.apply(&ctx.client).await?;

    match take_backup(&ctx, &backup).await {
        Ok(key) => {
            info!("TalosEtcdBackup {}/{} uploaded {}", namespace, name, key);
            record_etcd_backup("success");
            let message = format!("Uploaded snapshot to {key}");
            status.status_mut().snapshot_key = Some(key);
            status.clear_condition(CONDITION_TYPE_FAILED);
            status.set_condition(
                CONDITION_TYPE_PROGRESSING,
                STATUS_FALSE,
                REASON_BACKUP_COMPLETED,
                "Backup completed",
            );
            status.set_condition(
                CONDITION_TYPE_READY,
                STATUS_TRUE,
                REASON_BACKUP_SUCCEEDED,
                &message,
            );
            status.apply(&ctx.client).await?;
            ctx.publish_event(
                &backup,
                EventType::Normal,
                reasons::BACKUP_SUCCEEDED,
                actions::BACKUP,
                message,
            )
            .await;
            Ok(ReconcileOutcome::Done)
        }
        Err(e) => {
            warn!("TalosEtcdBackup {}/{} failed: {:#}", namespace, name, e);
            record_etcd_backup("failure");
            let message = format!("{e:#}");
            status.set_condition(
                CONDITION_TYPE_PROGRESSING,
                STATUS_FALSE,
                REASON_BACKUP_FAILED,
                "Backup failed",
            );
            status.set_condition(
                CONDITION_TYPE_FAILED,
                STATUS_TRUE,
                REASON_BACKUP_FAILED,
                &message,
            );
            status.apply(&ctx.client).await?;
            ctx.publish_event(
                &backup,
                EventType::Warning,
                reasons::BACKUP_FAILED,
                actions::BACKUP,
                message,
            )
            .await;
            Err(e)
        }
    }
}

/// Takes the snapshot and uploads it. Returns the object key.
async fn take_backup(ctx: &Context, backup: &TalosEtcdBackup) -> Result<String> {
    let namespace = backup.namespace().unwrap_or_default();
    let control_plane_name = &backup.spec.talos_control_plane_ref.name;

    let control_planes: Api<TalosControlPlane> =
        Api::namespaced(ctx.client.clone(), &namespace);
    let control_plane = control_planes
        .get_opt(control_plane_name)
        .await
        .with_context(|| {
            format!("failed to get TalosControlPlane {namespace}/{control_plane_name}")
        })?
        .ok_or_else(|| anyhow!("TalosControlPlane {control_plane_name} not found"))?;
    let (descriptor, secrets) =
        persisted_bundle(ctx, &control_plane).await?.ok_or_else(|| {
            anyhow!("TalosControlPlane {control_plane_name} has no bundle configuration")
        })?;

    let s3 = &backup.spec.backup_storage.s3;
    let target = S3Target {
        bucket: s3.bucket.clone(),
        region: s3.region.clone(),
        endpoint: s3.endpoint.clone(),
        access_key_id: read_secret_key(ctx, &namespace, &s3.access_key_id).await?,
        secret_access_key: read_secret_key(ctx, &namespace, &s3.secret_access_key).await?,
        insecure_skip_tls_verify: s3.insecure_skip_tls_verify,
    };

    let node = ctx
        .node_os
        .connect(&descriptor, &secrets, false)
        .await
        .with_context(|| format!("failed to connect to control plane {control_plane_name}"))?;
    let snapshot = node
        .etcd_snapshot()
        .await
        .with_context(|| format!("failed to snapshot etcd of {control_plane_name}"))?;
    debug!(bytes = snapshot.len(), "Took etcd snapshot");

    let key = snapshot_key(control_plane_name, Utc::now());
    ctx.object_store
        .upload(&target, &key, snapshot)
        .await
        .with_context(|| format!("failed to upload snapshot to bucket {}", s3.bucket))?;
    Ok(key)
}

/// Reads one key of a secret as UTF-8.
async fn read_secret_key(
    ctx: &Context,
    namespace: &str,
    reference: &SecretKeyRef,
) -> Result<String> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let secret = api
        .get(&reference.name)
        .await
        .with_context(|| format!("failed to get Secret {namespace}/{}", reference.name))?;
    let value = secret
        .data
        .and_then(|mut data| data.remove(&reference.key))
        .ok_or_else(|| {
            anyhow!("Secret {namespace}/{} has no key {}", reference.name, reference.key)
        })?;
    String::from_utf8(value.0).with_context(|| {
        format!("key {} of Secret {} is not UTF-8", reference.key, reference.name)
    })
}

#[cfg(test)]
#[path = "backup_tests.rs"]
mod backup_tests;
