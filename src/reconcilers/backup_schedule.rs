// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! `TalosEtcdBackupSchedule` reconciliation logic.
//!
//! A schedule creates one `TalosEtcdBackup` per due cron occurrence and keeps
//! at most `retention` successful backups. Missed occurrences are not replayed:
//! a pass that finds the schedule overdue creates a single backup and moves the
//! schedule forward from "now".
//!
//! Backups created by a schedule carry the
//! [`ETCD_BACKUP_SCHEDULE_LABEL`](crate::labels::ETCD_BACKUP_SCHEDULE_LABEL)
//! label and a controller owner reference to it.

use crate::constants::{
    DEFAULT_BACKUP_RETENTION, MIN_SCHEDULE_REQUEUE_SECS, PAUSED_SCHEDULE_REQUEUE_SECS,
};
use crate::context::Context;
use crate::crd::{TalosEtcdBackup, TalosEtcdBackupSchedule};
use crate::errors::ValidationError;
use crate::events::{actions, reasons};
use crate::labels::{ETCD_BACKUP_SCHEDULE_LABEL, FINALIZER_TALOS_ETCD_BACKUP_SCHEDULE};
use crate::reconcilers::backup::is_backup_ready;
use crate::reconcilers::finalizers::{ensure_finalizer, handle_deletion, FinalizerCleanup};
use crate::reconcilers::pagination::list_all_paginated;
use crate::reconcilers::resources::{create_or_apply, delete_if_exists};
use crate::reconcilers::status::{StatusUpdater, STATUS_FALSE, STATUS_TRUE};
use crate::reconcilers::ReconcileOutcome;
use crate::status_reasons::{
    CONDITION_TYPE_FAILED, CONDITION_TYPE_READY, REASON_BACKUP_CREATION_FAILED,
    REASON_INVALID_SCHEDULE, REASON_SCHEDULE_ACTIVE, REASON_SCHEDULE_PAUSED,
};
use crate::synthesis::build_owner_reference;
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use croner::Cron;
use kube::api::{ListParams, ObjectMeta};
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parses a standard 5-field cron expression.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidSchedule`] if the expression does not parse.
pub fn parse_schedule(expression: &str) -> Result<Cron, ValidationError> {
    Cron::new(expression)
        .parse()
        .map_err(|e| ValidationError::InvalidSchedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

/// First occurrence of `cron` strictly after `after`.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidSchedule`] if the expression never fires.
pub fn next_occurrence(
    cron: &Cron,
    expression: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ValidationError> {
    cron.find_next_occurrence(&after, false)
        .map_err(|e| ValidationError::InvalidSchedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

/// Whether a backup is due at `now`.
///
/// A schedule that never ran is due immediately. Otherwise it is due once `now`
/// reaches the first occurrence after the last scheduled run.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidSchedule`] if the expression never fires.
pub fn is_due(
    cron: &Cron,
    expression: &str,
    last_schedule: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool, ValidationError> {
    match last_schedule {
        None => Ok(true),
        Some(last) => Ok(now >= next_occurrence(cron, expression, last)?),
    }
}

/// Delay until `next`, or the minimum schedule requeue once `next` has passed.
#[must_use]
pub fn requeue_after(next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    match (next - now).to_std() {
        Ok(delay) if !delay.is_zero() => delay,
        _ => Duration::from_secs(MIN_SCHEDULE_REQUEUE_SECS),
    }
}

/// Name of the backup a schedule creates at `now`.
#[must_use]
pub fn backup_name(schedule: &str, now: DateTime<Utc>) -> String {
    format!("{schedule}-{}", now.timestamp())
}

/// Builds the backup `schedule` creates at `now` from its template.
#[must_use]
pub fn build_backup(schedule: &TalosEtcdBackupSchedule, now: DateTime<Utc>) -> TalosEtcdBackup {
    let schedule_name = schedule.name_any();
    TalosEtcdBackup {
        metadata: ObjectMeta {
            name: Some(backup_name(&schedule_name, now)),
            namespace: schedule.namespace(),
            labels: Some(BTreeMap::from([(
                ETCD_BACKUP_SCHEDULE_LABEL.to_string(),
                schedule_name,
            )])),
            owner_references: Some(vec![build_owner_reference(schedule)]),
            ..ObjectMeta::default()
        },
        spec: schedule.spec.backup_template.spec.clone(),
        status: None,
    }
}

/// Names of the successful backups beyond `retention`, oldest last.
///
/// Backups that have not succeeded are never selected.
#[must_use]
pub fn backups_to_prune(backups: &[TalosEtcdBackup], retention: usize) -> Vec<String> {
    let mut succeeded: Vec<&TalosEtcdBackup> =
        backups.iter().filter(|b| is_backup_ready(b)).collect();
    succeeded.sort_by_key(|b| Reverse(b.metadata.creation_timestamp.clone()));
    succeeded
        .into_iter()
        .skip(retention)
        .map(ResourceExt::name_any)
        .collect()
}

/// Creation time of the newest successful backup.
#[must_use]
pub fn last_successful_backup_time(backups: &[TalosEtcdBackup]) -> Option<String> {
    backups
        .iter()
        .filter(|b| is_backup_ready(b))
        .filter_map(|b| b.metadata.creation_timestamp.as_ref())
        .filter_map(|t| DateTime::from_timestamp(t.0.as_second(), 0))
        .max()
        .map(rfc3339)
}

fn retention_of(schedule: &TalosEtcdBackupSchedule) -> usize {
    let retention = schedule.spec.retention.unwrap_or(DEFAULT_BACKUP_RETENTION).max(1);
    usize::try_from(retention).unwrap_or(1)
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_time(value: Option<&String>) -> Option<DateTime<Utc>> {
    let value = value?;
    match DateTime::parse_from_rfc3339(value) {
        Ok(time) => Some(time.with_timezone(&Utc)),
        Err(e) => {
            warn!("Ignoring unparsable schedule time {}: {}", value, e);
            None
        }
    }
}

/// Lists the backups labelled for `schedule`.
async fn list_schedule_backups(
    ctx: &Context,
    schedule: &TalosEtcdBackupSchedule,
) -> Result<Vec<TalosEtcdBackup>> {
    let namespace = schedule.namespace().unwrap_or_default();
    let api: Api<TalosEtcdBackup> = Api::namespaced(ctx.client.clone(), &namespace);
    let selector = format!("{ETCD_BACKUP_SCHEDULE_LABEL}={}", schedule.name_any());
    list_all_paginated(&api, ListParams::default().labels(&selector)).await
}

#[async_trait::async_trait]
impl FinalizerCleanup for TalosEtcdBackupSchedule {
    async fn cleanup(&self, ctx: &Context) -> Result<()> {
        let namespace = self.namespace().unwrap_or_default();
        let backups = match list_schedule_backups(ctx, self).await {
            Ok(backups) => backups,
            Err(e) => {
                warn!(
                    "Failed to list backups of TalosEtcdBackupSchedule {}/{}: {:#}",
                    namespace,
                    self.name_any(),
                    e
                );
                return Ok(());
            }
        };
        for backup in backups {
            let name = backup.name_any();
            let deleted =
                delete_if_exists::<TalosEtcdBackup>(&ctx.client, &namespace, &name).await;
            if let Err(e) = deleted {
                warn!("Failed to delete TalosEtcdBackup {}/{}: {:#}", namespace, name, e);
            }
        }
        Ok(())
    }
}

/// Reconciles a `TalosEtcdBackupSchedule` resource.
///
/// # Errors
///
/// Returns an error for an invalid cron expression, a failed backup creation,
/// or a failed Kubernetes API call.
pub async fn reconcile_talos_etcd_backup_schedule(
    ctx: Arc<Context>,
    schedule: TalosEtcdBackupSchedule,
) -> Result<ReconcileOutcome> {
    let namespace = schedule.namespace().unwrap_or_default();
    let name = schedule.name_any();

    info!("Reconciling TalosEtcdBackupSchedule: {}/{}", namespace, name);

    if schedule.metadata.deletion_timestamp.is_some() {
        handle_deletion(&ctx, &schedule, FINALIZER_TALOS_ETCD_BACKUP_SCHEDULE).await?;
        return Ok(ReconcileOutcome::AwaitChange);
    }

    let schedule =
        ensure_finalizer(&ctx.client, &schedule, FINALIZER_TALOS_ETCD_BACKUP_SCHEDULE).await?;
    let mut status = StatusUpdater::new(&schedule);

    if schedule.spec.paused {
        debug!("TalosEtcdBackupSchedule {}/{} is paused", namespace, name);
        status.set_condition(
            CONDITION_TYPE_READY,
            STATUS_FALSE,
            REASON_SCHEDULE_PAUSED,
            "Schedule is paused",
        );
        status.apply(&ctx.client).await?;
        return Ok(ReconcileOutcome::requeue_secs(PAUSED_SCHEDULE_REQUEUE_SECS));
    }

    let expression = schedule.spec.schedule.as_str();
    let now = Utc::now();
    let plan = parse_schedule(expression).and_then(|cron| {
        let last = parse_time(status.status().last_schedule_time.as_ref());
        let due = is_due(&cron, expression, last, now)?;
        Ok((due, next_occurrence(&cron, expression, now)?))
    });
    let (due, next) = match plan {
        Ok(plan) => plan,
        Err(e) => {
            warn!("TalosEtcdBackupSchedule {}/{}: {}", namespace, name, e);
            status.set_condition(
                CONDITION_TYPE_FAILED,
                STATUS_TRUE,
                REASON_INVALID_SCHEDULE,
                &e.to_string(),
            );
            status.set_condition(
                CONDITION_TYPE_READY,
                STATUS_FALSE,
                REASON_INVALID_SCHEDULE,
                "Schedule expression is invalid",
            );
            status.apply(&ctx.client).await?;
            ctx.publish_event(
                &schedule,
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                e.to_string(),
            )
            .await;
            return Err(e.into());
        }
    };

    if due {
        let backup = build_backup(&schedule, now);
        let backup_name = backup.name_any();
        if let Err(e) = create_or_apply(&ctx.client, &namespace, &backup).await {
            warn!("Failed to create TalosEtcdBackup {}/{}: {:#}", namespace, backup_name, e);
            status.set_condition(
                CONDITION_TYPE_FAILED,
                STATUS_TRUE,
                REASON_BACKUP_CREATION_FAILED,
                &format!("{e:#}"),
            );
            status.apply(&ctx.client).await?;
            return Err(e);
        }
        info!(
            "TalosEtcdBackupSchedule {}/{} created TalosEtcdBackup {}",
            namespace, name, backup_name
        );
        status.status_mut().last_schedule_time = Some(rfc3339(now));
        ctx.publish_event(
            &schedule,
            EventType::Normal,
            reasons::BACKUP_CREATED,
            actions::BACKUP,
            format!("Created TalosEtcdBackup {backup_name}"),
        )
        .await;
    }

    let backups = list_schedule_backups(&ctx, &schedule).await?;
    let pruned = backups_to_prune(&backups, retention_of(&schedule));
    for backup_name in &pruned {
        match delete_if_exists::<TalosEtcdBackup>(&ctx.client, &namespace, backup_name).await {
            Ok(_) => debug!("Pruned TalosEtcdBackup {}/{}", namespace, backup_name),
            Err(e) => warn!(
                "Failed to prune TalosEtcdBackup {}/{}: {:#}",
                namespace, backup_name, e
            ),
        }
    }

    let last_successful = last_successful_backup_time(&backups);
    let active: Vec<String> = backups
        .iter()
        .filter(|b| !is_backup_ready(b))
        .map(ResourceExt::name_any)
        .collect();

    {
        let s = status.status_mut();
        s.next_schedule_time = Some(rfc3339(next));
        s.active_backups = active;
        if last_successful.is_some() {
            s.last_successful_backup_time = last_successful;
        }
    }
    status.clear_condition(CONDITION_TYPE_FAILED);
    status.set_condition(
        CONDITION_TYPE_READY,
        STATUS_TRUE,
        REASON_SCHEDULE_ACTIVE,
        &format!("Next backup at {}", rfc3339(next)),
    );
    status.apply(&ctx.client).await?;

    Ok(ReconcileOutcome::RequeueAfter(requeue_after(next, now)))
}

#[cfg(test)]
#[path = "backup_schedule_tests.rs"]
mod backup_schedule_tests;
