// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the Talos operator.
//!
//! This module contains all numeric and string constants used throughout the codebase.
//! Constants are organized by category for easy maintenance.

// ============================================================================
// API Constants
// ============================================================================

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "talos-operator";

// ============================================================================
// Node OS Constants
// ============================================================================

/// Talos node API port
pub const TALOS_API_PORT: i32 = 50000;

/// Kubernetes API server port
pub const KUBE_API_PORT: i32 = 6443;

/// Port name for the Talos node API
pub const TALOS_API_PORT_NAME: &str = "talos-api";

/// Port name for the Kubernetes API server
pub const KUBE_API_PORT_NAME: &str = "k8s-api";

/// Container image used for container-mode nodes (tag is the Talos version)
pub const TALOS_CONTAINER_IMAGE: &str = "ghcr.io/siderolabs/talos";

/// Installer image used for metal-mode installs and upgrades (tag is the Talos version)
pub const TALOS_INSTALLER_IMAGE: &str = "ghcr.io/siderolabs/installer";

/// Platform value injected into container-mode nodes
pub const TALOS_PLATFORM_CONTAINER: &str = "container";

/// Environment variable carrying the platform name
pub const TALOS_PLATFORM_ENV: &str = "PLATFORM";

/// Environment variable carrying the base64 machine configuration
pub const TALOS_USERDATA_ENV: &str = "USERDATA";

/// Name of the kubelet service reported by the node OS
pub const KUBELET_SERVICE: &str = "kubelet";

/// Service state reported when a node OS service is up
pub const SERVICE_STATE_RUNNING: &str = "Running";

/// META partition key holding the platform network configuration
pub const META_KEY_NETWORK: u8 = 0x0a;

/// Default Talos version when none is given
pub const DEFAULT_TALOS_VERSION: &str = "v1.10.3";

/// Default Kubernetes version when none is given
pub const DEFAULT_KUBE_VERSION: &str = "v1.33.1";

/// Default cluster DNS domain
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

// ============================================================================
// Generated Object Names and Keys
// ============================================================================

/// Config map key for control plane configuration
pub const CONTROLPLANE_CONFIG_KEY: &str = "controlplane.yaml";

/// Config map key for worker configuration
pub const WORKER_CONFIG_KEY: &str = "worker.yaml";

/// Secret key holding a kubeconfig
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Suffix of the generated configuration config map
pub const CONFIG_MAP_SUFFIX: &str = "config";

/// Suffix of the talosconfig secret
pub const TALOSCONFIG_SUFFIX: &str = "talosconfig";

/// Suffix of the kubeconfig secret
pub const KUBECONFIG_SUFFIX: &str = "kubeconfig";

/// Suffix of the control plane created for an inline cluster spec
pub const CLUSTER_CONTROLPLANE_SUFFIX: &str = "controlplane";

/// Suffix of the worker created for an inline cluster spec
pub const CLUSTER_WORKER_SUFFIX: &str = "worker";

/// Prefix of every etcd snapshot object key
pub const ETCD_BACKUP_KEY_PREFIX: &str = "etcd-backups";

/// Validity of a presigned object store upload URL
pub const OBJECT_STORE_PRESIGN_TTL_SECS: u64 = 3600;

// ============================================================================
// Storage Defaults
// ============================================================================

/// Size of the `system-state` volume
pub const VOLUME_SIZE_SYSTEM_STATE: &str = "1Gi";

/// Size of the `var` volume
pub const VOLUME_SIZE_VAR: &str = "20Gi";

/// Size of the `etc-cni` volume
pub const VOLUME_SIZE_ETC_CNI: &str = "1Gi";

/// Size of the `etc-kubernetes` volume
pub const VOLUME_SIZE_ETC_KUBERNETES: &str = "1Gi";

/// Size of the `usr-libexec-kubernetes` volume
pub const VOLUME_SIZE_USR_LIBEXEC_KUBERNETES: &str = "1Gi";

// ============================================================================
// Controller Timing Constants
// ============================================================================

/// Requeue interval while waiting for a dependency to produce its config
pub const DEPENDENCY_REQUEUE_SECS: u64 = 30;

/// Requeue interval while waiting for container or cloud nodes to come up
pub const PROVISIONING_REQUEUE_SECS: u64 = 10;

/// Requeue after a freshly created child control plane
pub const CHILD_CREATED_REQUEUE_SECS: u64 = 5;

/// Requeue interval for ready resources
pub const READY_REQUEUE_SECS: u64 = 300;

/// Requeue interval for paused backup schedules
pub const PAUSED_SCHEDULE_REQUEUE_SECS: u64 = 60;

/// Lower bound on the backup schedule requeue interval
pub const MIN_SCHEDULE_REQUEUE_SECS: u64 = 60;

/// Default number of successful backups to keep
pub const DEFAULT_BACKUP_RETENTION: i32 = 5;

/// Poll interval of background node readiness watchers
pub const NODE_WATCH_INTERVAL_SECS: u64 = 10;

/// Page size for list calls over machines and backups
pub const KUBE_LIST_PAGE_SIZE: u32 = 100;

// ============================================================================
// Error Backoff Constants
// ============================================================================

/// First delay after a failed reconcile
pub const ERROR_BACKOFF_INITIAL_SECS: u64 = 1;

/// Ceiling for the failed reconcile delay
pub const ERROR_BACKOFF_MAX_SECS: u64 = 300;

/// Jitter applied to failed reconcile delays (±10%)
pub const ERROR_BACKOFF_JITTER: f64 = 0.1;

// ============================================================================
// Runtime Constants
// ============================================================================

/// Number of worker threads for the Tokio runtime
pub const TOKIO_WORKER_THREADS: usize = 4;

/// Default metrics and health server bind address
pub const METRICS_SERVER_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Path for the Prometheus metrics endpoint
pub const METRICS_SERVER_PATH: &str = "/metrics";

/// Path for the liveness endpoint
pub const HEALTH_SERVER_PATH: &str = "/healthz";

/// Default per-call timeout for node OS API calls, in seconds
pub const NODE_OS_TIMEOUT_SECS: u64 = 30;

/// Tokio worker thread name
pub const TOKIO_THREAD_NAME: &str = "talos-controller";
