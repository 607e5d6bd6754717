// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Kubernetes Event publishing.
//!
//! Events are best effort: a failed publish is logged and never fails the
//! reconcile that emitted it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about managed objects.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes an event on `object`. Never fails.
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller` is reported as the event's reporting component.
    #[must_use]
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, object).await {
            warn!(
                reason,
                action,
                object = ?object.name,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _object: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`.
pub mod reasons {
    /// A child object was created
    pub const CREATED: &str = "Created";
    /// A child object was updated
    pub const UPDATED: &str = "Updated";
    /// A child object was deleted
    pub const DELETED: &str = "Deleted";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A referenced control plane does not exist
    pub const CONTROL_PLANE_NOT_FOUND: &str = "ControlPlaneNotFound";
    /// Machine configuration was generated
    pub const CONFIG_GENERATED: &str = "ConfigGenerated";
    /// etcd was bootstrapped
    pub const BOOTSTRAPPED: &str = "Bootstrapped";
    /// Configuration was applied to a node
    pub const CONFIG_APPLIED: &str = "ConfigApplied";
    /// A node upgrade was started
    pub const UPGRADE_STARTED: &str = "UpgradeStarted";
    /// Network metadata could not be written to a node
    pub const META_KEY_FAILED: &str = "MetaKeyFailed";
    /// A backup was created by a schedule
    pub const BACKUP_CREATED: &str = "BackupCreated";
    /// A snapshot was uploaded
    pub const BACKUP_SUCCEEDED: &str = "BackupSucceeded";
    /// A snapshot or upload failed
    pub const BACKUP_FAILED: &str = "BackupFailed";
    /// A chart was installed or upgraded
    pub const ADDON_INSTALLED: &str = "AddonInstalled";
    /// A chart install failed
    pub const ADDON_FAILED: &str = "AddonFailed";
}

/// Event actions, shown in the ACTION column of `kubectl get events`.
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const BOOTSTRAP: &str = "Bootstrap";
    pub const APPLY: &str = "Apply";
    pub const UPGRADE: &str = "Upgrade";
    pub const BACKUP: &str = "Backup";
    pub const INSTALL: &str = "Install";
    pub const DELETE: &str = "Delete";
}
