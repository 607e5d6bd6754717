// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Generic create-or-update helpers for child objects.
//!
//! Desired objects come from the pure builders in [`crate::synthesis`]. They are
//! written with server-side apply under the operator's field manager, but only
//! when the stored object differs from the desired one: a pass with no change
//! issues no write at all.
//!
//! # Example
//!
//! ```rust,no_run
//! use talos_operator::reconcilers::resources::create_or_apply;
//! use k8s_openapi::api::core::v1::Service;
//! use kube::Client;
//! use anyhow::Result;
//!
//! async fn example(client: &Client, namespace: &str, service: Service) -> Result<()> {
//!     create_or_apply(client, namespace, &service).await?;
//!     Ok(())
//! }
//! ```

use crate::constants::FIELD_MANAGER;
use crate::metrics::{record_resource_created, record_resource_deleted, record_resource_updated};
use anyhow::{anyhow, Context as _, Result};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use serde_json::Value;
use tracing::{debug, info};

/// What [`create_or_apply`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

impl ApplyOutcome {
    /// True if the object was written.
    #[must_use]
    pub fn changed(self) -> bool {
        self != Self::Unchanged
    }
}

/// Returns true if every field set in `desired` has the same value in `existing`.
///
/// Objects are compared field by field, arrays element by element. Fields only
/// present in `existing` (server defaults, status, metadata added by the API
/// server) are ignored.
#[must_use]
pub fn json_contains(existing: &Value, desired: &Value) -> bool {
    match (existing, desired) {
        (Value::Object(have), Value::Object(want)) => want.iter().all(|(key, want_value)| {
            have.get(key)
                .is_some_and(|have_value| json_contains(have_value, want_value))
        }),
        (Value::Array(have), Value::Array(want)) => {
            have.len() == want.len()
                && have
                    .iter()
                    .zip(want)
                    .all(|(have_value, want_value)| json_contains(have_value, want_value))
        }
        _ => existing == desired,
    }
}

/// Create `resource` or server-side apply it if the stored copy differs.
///
/// # Errors
///
/// Returns an error if the resource has no name or an API call fails.
pub async fn create_or_apply<T>(
    client: &Client,
    namespace: &str,
    resource: &T,
) -> Result<ApplyOutcome>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
{
    let kind = T::kind(&());
    let name = resource
        .meta()
        .name
        .as_ref()
        .ok_or_else(|| anyhow!("{kind} must have a name"))?;

    let api: Api<T> = Api::namespaced(client.clone(), namespace);

    let existing = api
        .get_opt(name)
        .await
        .with_context(|| format!("failed to get {kind} {namespace}/{name}"))?;

    match existing {
        Some(existing) => {
            let desired = serde_json::to_value(resource)?;
            let stored = serde_json::to_value(&existing)?;
            if json_contains(&stored, &desired) {
                debug!("{} {}/{} is up to date", kind, namespace, name);
                return Ok(ApplyOutcome::Unchanged);
            }

            api.patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(resource),
            )
            .await
            .with_context(|| format!("failed to apply {kind} {namespace}/{name}"))?;
            record_resource_updated(&kind);
            info!("Updated {} {}/{}", kind, namespace, name);
            Ok(ApplyOutcome::Updated)
        }
        None => {
            api.create(&PostParams::default(), resource)
                .await
                .with_context(|| format!("failed to create {kind} {namespace}/{name}"))?;
            record_resource_created(&kind);
            info!("Created {} {}/{}", kind, namespace, name);
            Ok(ApplyOutcome::Created)
        }
    }
}

/// Delete `name`, tolerating not-found. Returns whether a delete was issued.
///
/// # Errors
///
/// Returns an error if the API call fails for another reason.
pub async fn delete_if_exists<T>(client: &Client, namespace: &str, name: &str) -> Result<bool>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
{
    let kind = T::kind(&());
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            record_resource_deleted(&kind);
            info!("Deleted {} {}/{}", kind, namespace, name);
            Ok(true)
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!("{} {}/{} already gone", kind, namespace, name);
            Ok(false)
        }
        Err(e) => {
            Err(e).with_context(|| format!("failed to delete {kind} {namespace}/{name}"))
        }
    }
}

#[cfg(test)]
#[path = "resources_tests.rs"]
mod resources_tests;
