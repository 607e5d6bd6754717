// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Common label, annotation and finalizer constants used across all reconcilers.
//!
//! This module defines standard Kubernetes labels and Talos-specific labels/annotations
//! to ensure consistency across all resources created by the controller.

// ============================================================================
// Kubernetes Standard Labels
// https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
// ============================================================================

/// Standard label for the component name within the architecture (e.g., "controlplane", "worker")
pub const K8S_COMPONENT: &str = "app.kubernetes.io/component";

/// Standard label for the tool being used to manage the operation of an application
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard label for the name of the application
pub const K8S_NAME: &str = "app.kubernetes.io/name";

/// Standard label for a unique name identifying the instance of an application
pub const K8S_INSTANCE: &str = "app.kubernetes.io/instance";

/// Standard label for the name of a higher-level application this one is part of
pub const K8S_PART_OF: &str = "app.kubernetes.io/part-of";

/// Label the `StatefulSet` controller sets on each pod
pub const STATEFULSET_POD_NAME: &str = "statefulset.kubernetes.io/pod-name";

// ============================================================================
// Kubernetes Standard Label Values
// ============================================================================

/// Value for `app.kubernetes.io/part-of`
pub const PART_OF_TALOS: &str = "talos-operator";

/// Value for `app.kubernetes.io/managed-by`
pub const MANAGED_BY_TALOS_OPERATOR: &str = "talos-operator";

/// Application name for Talos nodes
pub const APP_NAME_TALOS: &str = "talos";

/// Component value for control plane nodes
pub const COMPONENT_CONTROLPLANE: &str = "controlplane";

/// Component value for worker nodes
pub const COMPONENT_WORKER: &str = "worker";

// ============================================================================
// Talos-Specific Labels and Annotations
// ============================================================================

/// Label put on backups created by a schedule (value is the schedule name)
pub const ETCD_BACKUP_SCHEDULE_LABEL: &str = "talos.alperen.cloud/etcd-backup-schedule";

/// Annotation carrying extra JSON patch operations (a YAML or JSON list) applied
/// to the generated machine configuration
pub const CONFIG_PATCHES_ANNOTATION: &str = "talos.alperen.cloud/config-patches";

/// Annotation selecting how a resource is reconciled (`normal`, `disable`, `dryrun`)
pub const RECONCILE_MODE_ANNOTATION: &str = "talos.alperen.cloud/reconcile-mode";

/// Label carrying the name of the `TalosClusterAddon` that created a release
pub const CLUSTER_ADDON_LABEL: &str = "talos.alperen.cloud/cluster-addon";

// ============================================================================
// Finalizers
// ============================================================================

/// Finalizer for `TalosCluster` resources
pub const FINALIZER_TALOS_CLUSTER: &str = "taloscluster.talos.alperen.cloud/finalizer";

/// Finalizer for `TalosControlPlane` resources
pub const FINALIZER_TALOS_CONTROL_PLANE: &str = "taloscontrolplane.talos.alperen.cloud/finalizer";

/// Finalizer for `TalosWorker` resources
pub const FINALIZER_TALOS_WORKER: &str = "talosworker.talos.alperen.cloud/finalizer";

/// Finalizer for `TalosMachine` resources
pub const FINALIZER_TALOS_MACHINE: &str = "talosmachine.talos.alperen.cloud/finalizer";

/// Finalizer for `TalosEtcdBackup` resources
pub const FINALIZER_TALOS_ETCD_BACKUP: &str = "talosetcdbackup.talos.alperen.cloud/finalizer";

/// Finalizer for `TalosEtcdBackupSchedule` resources
pub const FINALIZER_TALOS_ETCD_BACKUP_SCHEDULE: &str =
    "talosetcdbackupschedule.talos.alperen.cloud/finalizer";

/// Finalizer for `TalosAddon` resources
pub const FINALIZER_TALOS_ADDON: &str = "talosaddon.talos.alperen.cloud/finalizer";

/// Finalizer for `TalosClusterAddonRelease` resources
pub const FINALIZER_TALOS_CLUSTER_ADDON_RELEASE: &str =
    "talosclusteraddonrelease.talos.alperen.cloud/finalizer";
