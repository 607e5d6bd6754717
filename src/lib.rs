// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

#![allow(unexpected_cfgs)]

//! # Talos Operator - Talos Linux cluster lifecycle for Kubernetes
//!
//! The Talos operator provisions and runs Talos Linux clusters from Custom
//! Resource Definitions (CRDs). A `TalosCluster` fans out into a
//! `TalosControlPlane` and a `TalosWorker`, which run their nodes either as
//! containers inside the management cluster or on bare-metal machines driven
//! through the Talos node API.
//!
//! ## Overview
//!
//! This library provides the core functionality of the operator:
//!
//! - Custom Resource Definitions for clusters, node pools, machines, etcd
//!   backups, addons and label-selected cluster addons
//! - Secrets bundle and machine configuration generation
//! - Reconciliation logic for every resource kind
//! - Synthesis of the `StatefulSet`, `Service`, `ConfigMap` and `Secret`
//!   objects of container-mode node pools
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types
//! - [`bundle`] - Secrets bundle, bundle descriptor and configuration generation
//! - [`reconcilers`] - Reconciliation logic for each resource type
//! - [`synthesis`] - Kubernetes objects owned by node pools
//! - [`context`] - Shared controller context and collaborator seams
//! - [`external`] - Node OS, object store, chart installer and cloud seams
//! - [`watcher`] - Per-machine readiness watchers
//!
//! ## Example
//!
//! ```rust,no_run
//! use talos_operator::crd::{DeploymentMode, TalosClusterSpec, TalosControlPlaneSpec};
//!
//! let cluster = TalosClusterSpec {
//!     control_plane: Some(TalosControlPlaneSpec {
//!         version: "v1.10.4".to_string(),
//!         mode: DeploymentMode::Container,
//!         replicas: 3,
//!         ..TalosControlPlaneSpec::default()
//!     }),
//!     ..TalosClusterSpec::default()
//! };
//! assert!(cluster.validate().is_ok());
//! ```

pub mod bundle;
pub mod constants;
pub mod context;
pub mod crd;
pub mod errors;
pub mod events;
pub mod external;
pub mod labels;
pub mod metrics;
pub mod reconcilers;
pub mod status_reasons;
pub mod synthesis;
pub mod watcher;

#[cfg(test)]
mod test_support;
