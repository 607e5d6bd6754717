// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Generic finalizer management for Talos resources.
//!
//! Every kind that performs cleanup on deletion carries a finalizer. It is added on
//! the first reconcile pass, while no deletion timestamp is set, and removed only
//! after [`FinalizerCleanup::cleanup`] succeeded.
//!
//! # Example
//!
//! ```rust,ignore
//! use talos_operator::reconcilers::finalizers::{ensure_finalizer, handle_deletion};
//!
//! if cluster.metadata.deletion_timestamp.is_some() {
//!     return handle_deletion(&ctx, &cluster, FINALIZER_TALOS_CLUSTER).await;
//! }
//! let cluster = ensure_finalizer(&ctx.client, &cluster, FINALIZER_TALOS_CLUSTER).await?;
//! ```

use crate::context::Context;
use anyhow::{Context as _, Result};
use kube::api::{Patch, PatchParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::info;

/// Cleanup a resource performs before its finalizer is removed.
#[async_trait::async_trait]
pub trait FinalizerCleanup: Resource + ResourceExt + Clone {
    /// Performs cleanup operations before the finalizer is removed.
    ///
    /// # Errors
    ///
    /// An error keeps the finalizer in place; deletion is retried on the next pass.
    /// Implementations log and swallow failures of non-critical external cleanup
    /// so deletion is never stuck behind them.
    async fn cleanup(&self, ctx: &Context) -> Result<()>;
}

/// Returns true if `resource` carries `finalizer`.
#[must_use]
pub fn has_finalizer<T: Resource>(resource: &T, finalizer: &str) -> bool {
    resource
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|existing| existing == finalizer))
}

/// Returns the finalizer list of `resource` without `finalizer`.
#[must_use]
pub fn finalizers_without<T: Resource>(resource: &T, finalizer: &str) -> Vec<String> {
    let mut finalizers = resource.meta().finalizers.clone().unwrap_or_default();
    finalizers.retain(|f| f != finalizer);
    finalizers
}

async fn patch_finalizers<T>(client: &Client, resource: &T, finalizers: Vec<String>) -> Result<T>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
{
    let namespace = resource.namespace().unwrap_or_default();
    let name = resource.name_any();
    let api: Api<T> = Api::namespaced(client.clone(), &namespace);
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .with_context(|| {
            format!(
                "failed to patch finalizers of {} {namespace}/{name}",
                T::kind(&())
            )
        })
}

/// Add a finalizer to a resource if not already present.
///
/// Returns the resource as stored afterwards, so later writes in the same pass
/// carry the current `resourceVersion`.
///
/// # Errors
///
/// Returns an error if the API patch operation fails.
pub async fn ensure_finalizer<T>(client: &Client, resource: &T, finalizer: &str) -> Result<T>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
{
    if has_finalizer(resource, finalizer) {
        return Ok(resource.clone());
    }

    info!(
        "Adding finalizer {} to {} {}/{}",
        finalizer,
        T::kind(&()),
        resource.namespace().unwrap_or_default(),
        resource.name_any()
    );

    let mut finalizers = resource.meta().finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_string());
    patch_finalizers(client, resource, finalizers).await
}

/// Remove a finalizer from a resource. Idempotent.
///
/// # Errors
///
/// Returns an error if the API patch operation fails.
pub async fn remove_finalizer<T>(client: &Client, resource: &T, finalizer: &str) -> Result<()>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
{
    if !has_finalizer(resource, finalizer) {
        return Ok(());
    }

    info!(
        "Removing finalizer {} from {} {}/{}",
        finalizer,
        T::kind(&()),
        resource.namespace().unwrap_or_default(),
        resource.name_any()
    );

    patch_finalizers(client, resource, finalizers_without(resource, finalizer)).await?;
    Ok(())
}

/// Handle resource deletion: run cleanup, then remove the finalizer.
///
/// Does nothing when the finalizer is already gone.
///
/// # Errors
///
/// Returns an error if cleanup or the finalizer removal fails. The finalizer then
/// stays on the resource and deletion is retried on a subsequent reconcile.
pub async fn handle_deletion<T>(ctx: &Context, resource: &T, finalizer: &str) -> Result<()>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + FinalizerCleanup
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>
        + Send
        + Sync,
{
    let namespace = resource.namespace().unwrap_or_default();
    let name = resource.name_any();

    info!("{} {}/{} is being deleted", T::kind(&()), namespace, name);

    if has_finalizer(resource, finalizer) {
        info!("Running cleanup for {} {}/{}", T::kind(&()), namespace, name);
        resource.cleanup(ctx).await?;
        remove_finalizer(&ctx.client, resource, finalizer).await?;
    }

    Ok(())
}

#[cfg(test)]
#[path = "finalizers_tests.rs"]
mod finalizers_tests;
