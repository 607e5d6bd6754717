// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Integration seams for the systems the operator drives but does not implement.
//!
//! Each collaborator is a trait object held by the controller [`Context`](crate::context::Context):
//!
//! - [`node_os`] - node OS API (bootstrap, apply configuration, kubeconfig, snapshots)
//! - [`package`] - chart installer used by addons
//! - [`object_store`] - snapshot uploads
//! - [`cloud`] - cloud instance provisioning
//!
//! The operator ships [`UnconfiguredNodeOs`], [`UnconfiguredInstaller`] and
//! [`UnconfiguredCloud`], which fail every call with a `NotConfigured` error,
//! and an HTTP [`HttpObjectStore`].

pub mod cloud;
pub mod node_os;
pub mod object_store;
pub mod package;

pub use cloud::{CloudInstances, CloudProvisioner, UnconfiguredCloud};
pub use node_os::{DiskInfo, NodeOsClient, NodeOsConnector, TimedNodeOs, UnconfiguredNodeOs};
pub use object_store::{HttpObjectStore, ObjectStore, S3Target};
pub use package::{PackageInstaller, ReleaseRequest, UnconfiguredInstaller};
