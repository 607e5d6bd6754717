// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Standard Kubernetes status condition types and reasons for Talos resources.
//!
//! Reasons are programmatic identifiers in CamelCase that explain why a condition has
//! a particular status. Condition types are shared across all kinds; every resource
//! carries at most one condition of each type.
//!
//! # Example Status
//!
//! ```yaml
//! status:
//!   state: Ready
//!   conditions:
//!     - type: Ready
//!       status: "True"
//!       reason: KubeconfigWritten
//!       message: "Control plane c1-controlplane is ready"
//! ```

// ============================================================================
// Condition Types
// ============================================================================

/// Overall health of a resource.
pub const CONDITION_TYPE_READY: &str = "Ready";

/// Set while a resource is being torn down.
pub const CONDITION_TYPE_DELETING: &str = "Deleting";

/// Set when a terminal failure has been observed.
pub const CONDITION_TYPE_FAILED: &str = "Failed";

/// Set while a long-running operation is underway.
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";

// ============================================================================
// Common Reasons
// ============================================================================

/// Resources are being created or updated.
pub const REASON_PROGRESSING: &str = "Progressing";

/// The resource is being deleted.
pub const REASON_DELETING: &str = "Deleting";

/// Spec validation failed.
pub const REASON_CONFIGURATION_INVALID: &str = "ConfigurationInvalid";

/// The deployment mode has no reconciliation path for this kind.
pub const REASON_UNSUPPORTED_MODE: &str = "UnsupportedMode";

/// Machine configuration could not be generated.
pub const REASON_CONFIG_GENERATION_FAILED: &str = "ConfigGenerationFailed";

// ============================================================================
// Cluster Reasons
// ============================================================================

/// The control plane and worker children were resolved or created.
pub const REASON_CHILDREN_RECONCILED: &str = "ChildrenReconciled";

/// A referenced control plane does not exist.
pub const REASON_CONTROL_PLANE_NOT_FOUND: &str = "ControlPlaneNotFound";

/// A referenced worker does not exist.
pub const REASON_WORKER_NOT_FOUND: &str = "WorkerNotFound";

// ============================================================================
// Control Plane / Worker Reasons
// ============================================================================

/// Generated configuration was written.
pub const REASON_CONFIG_GENERATED: &str = "ConfigGenerated";

/// Nodes are still being provisioned.
pub const REASON_WAITING_FOR_NODES: &str = "WaitingForNodes";

/// The etcd cluster was bootstrapped.
pub const REASON_BOOTSTRAPPED: &str = "Bootstrapped";

/// The kubeconfig secret was written and the control plane is usable.
pub const REASON_KUBECONFIG_WRITTEN: &str = "KubeconfigWritten";

/// The control plane referenced by a worker has no secrets bundle yet.
pub const REASON_WAITING_FOR_CONTROL_PLANE: &str = "WaitingForControlPlane";

/// Worker nodes are provisioned.
pub const REASON_WORKERS_PROVISIONED: &str = "WorkersProvisioned";

// ============================================================================
// Machine Reasons
// ============================================================================

/// Configuration was applied to the node.
pub const REASON_CONFIG_APPLIED: &str = "ConfigApplied";

/// The node is installing or upgrading.
pub const REASON_INSTALLING: &str = "Installing";

/// The kubelet on the node reported running.
pub const REASON_NODE_READY: &str = "NodeReady";

/// The owning control plane or worker is gone.
pub const REASON_ORPHANED: &str = "Orphaned";

/// Network metadata could not be written to the node.
pub const REASON_META_KEY_FAILED: &str = "MetaKeyFailed";

// ============================================================================
// Backup Reasons
// ============================================================================

/// A snapshot is being taken and uploaded.
pub const REASON_BACKUP_IN_PROGRESS: &str = "BackupInProgress";

/// The snapshot finished (successfully or not).
pub const REASON_BACKUP_COMPLETED: &str = "BackupCompleted";

/// The snapshot was uploaded.
pub const REASON_BACKUP_SUCCEEDED: &str = "BackupSucceeded";

/// The snapshot or upload failed.
pub const REASON_BACKUP_FAILED: &str = "BackupFailed";

/// The cron expression did not parse.
pub const REASON_INVALID_SCHEDULE: &str = "InvalidSchedule";

/// Creating the scheduled backup failed.
pub const REASON_BACKUP_CREATION_FAILED: &str = "BackupCreationFailed";

/// The schedule is active and the next run is computed.
pub const REASON_SCHEDULE_ACTIVE: &str = "ScheduleActive";

/// The schedule is paused.
pub const REASON_SCHEDULE_PAUSED: &str = "SchedulePaused";

// ============================================================================
// Addon Reasons
// ============================================================================

/// The referenced cluster does not exist.
pub const REASON_CLUSTER_NOT_FOUND: &str = "ClusterNotFound";

/// The cluster kubeconfig secret is missing.
pub const REASON_KUBECONFIG_NOT_FOUND: &str = "KubeconfigNotFound";

/// The cluster kubeconfig secret has no usable content.
pub const REASON_INVALID_KUBECONFIG: &str = "InvalidKubeconfig";

/// A `valuesFrom` reference could not be resolved.
pub const REASON_VALUES_REFERENCE_ERROR: &str = "ValuesReferenceError";

/// The chart install or upgrade failed.
pub const REASON_HELM_INSTALL_FAILED: &str = "HelmInstallFailed";

/// The chart was installed or upgraded.
pub const REASON_ADDON_INSTALLED: &str = "AddonInstalled";

/// Every selected control plane has a release and stale releases are gone.
pub const REASON_RELEASES_RECONCILED: &str = "ReleasesReconciled";
