// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Machine configuration and cluster secrets.
//!
//! - [`descriptor`] - the bundle descriptor persisted on control planes and version contracts
//! - [`secrets`] - cluster secrets bundle (CAs, tokens, encryption secrets)
//! - [`patch`] - JSON patch operations applied to generated documents
//! - [`builder`] - control plane / worker configuration and talosconfig generation
//! - [`cache`] - generate-once cache in front of persisted status
//! - [`meta`] - platform network document written to the node META partition

pub mod builder;
pub mod cache;
pub mod descriptor;
pub mod meta;
pub mod patch;
pub mod secrets;

pub use builder::{generate_config, generate_talosconfig, MachineType};
pub use cache::{BundleCache, ConfigKey, ObjectIdentity};
pub use descriptor::BundleDescriptor;
pub use meta::network_meta;
pub use patch::PatchOperation;
pub use secrets::SecretsBundle;
