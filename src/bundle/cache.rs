// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Generate-once cache for secrets bundles and generated configuration.
//!
//! Control plane status is the durable copy of a secrets bundle. [`BundleCache`]
//! is the in-process layer in front of it:
//!
//! - Secrets bundles are keyed by object identity (namespace, name, uid). Lookup
//!   order is cache, then persisted status, then generate-and-persist. A newly
//!   generated bundle is only returned and cached after it was persisted.
//! - Generated configuration is keyed by object uid, generation and a fingerprint
//!   of every input, so a spec change or a changed parent descriptor misses.
//!
//! The maps are behind short-lived mutexes that are never held across an await.

use super::builder::MachineType;
use super::descriptor::BundleDescriptor;
use super::patch::PatchOperation;
use super::secrets::SecretsBundle;
use crate::errors::BundleError;
use anyhow::{Context as _, Result};
use chrono::Utc;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Identity of a stored object. A recreated object gets a new uid.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl ObjectIdentity {
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
            uid: obj.uid().unwrap_or_default(),
        }
    }
}

/// Cache key of a generated configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigKey {
    pub generation: i64,
    pub fingerprint: String,
}

impl ConfigKey {
    /// Key for the configuration of `machine_type` generated from `descriptor`
    /// and `patches` for an object at `generation`.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Serialize`] if the descriptor cannot be serialized.
    pub fn new(
        generation: i64,
        machine_type: MachineType,
        descriptor: &BundleDescriptor,
        patches: &[PatchOperation],
    ) -> Result<Self, BundleError> {
        let mut hasher = Sha256::new();
        hasher.update(machine_type.as_str().as_bytes());
        hasher.update(descriptor.fingerprint()?.as_bytes());
        for patch in patches {
            // Patch values are plain JSON, serialization cannot fail.
            hasher.update(serde_json::to_vec(patch).unwrap_or_default());
        }
        Ok(Self {
            generation,
            fingerprint: format!("{:x}", hasher.finalize()),
        })
    }
}

#[derive(Default)]
pub struct BundleCache {
    secrets: Mutex<HashMap<ObjectIdentity, String>>,
    configs: Mutex<HashMap<ObjectIdentity, (ConfigKey, String)>>,
}

impl BundleCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the secrets bundle of a control plane, generating and persisting it
    /// on first use.
    ///
    /// `persisted` is the current `status.secretBundle` (empty when unset).
    /// `persist` writes a new serialization to status. If it fails the new
    /// bundle is discarded and the error returned, so no credential is ever
    /// derived from an unpersisted bundle. The returned bundle's clock is now.
    ///
    /// # Errors
    ///
    /// Returns an error if a persisted bundle does not parse, generation fails or
    /// persisting fails.
    pub async fn get_or_create_secrets<F, Fut>(
        &self,
        identity: &ObjectIdentity,
        persisted: &str,
        persist: F,
    ) -> Result<SecretsBundle>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let cached = self
            .secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned();

        let serialized = match (cached, persisted.is_empty()) {
            (Some(cached), _) => cached,
            (None, false) => persisted.to_string(),
            (None, true) => {
                info!(
                    "Generating secrets bundle for {}/{}",
                    identity.namespace, identity.name
                );
                let bundle = SecretsBundle::generate(Utc::now())?;
                let serialized = bundle.to_yaml()?;
                persist(serialized.clone()).await.with_context(|| {
                    format!(
                        "failed to persist secrets bundle for {}/{}",
                        identity.namespace, identity.name
                    )
                })?;
                serialized
            }
        };

        let mut bundle = SecretsBundle::from_yaml(&serialized).with_context(|| {
            format!(
                "failed to decode secrets bundle of {}/{}",
                identity.namespace, identity.name
            )
        })?;
        bundle.reset_clock();

        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.clone(), serialized);
        Ok(bundle)
    }

    /// Returns the cached configuration for `key`, or generates and caches it.
    ///
    /// # Errors
    ///
    /// Returns the error of `generate`. Failures are not cached.
    pub fn get_or_generate_config<F>(
        &self,
        identity: &ObjectIdentity,
        key: ConfigKey,
        generate: F,
    ) -> Result<String, BundleError>
    where
        F: FnOnce() -> Result<String, BundleError>,
    {
        if let Some((cached_key, config)) = self
            .configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
        {
            if *cached_key == key {
                debug!(
                    name = %identity.name,
                    generation = key.generation,
                    "Using cached configuration"
                );
                return Ok(config.clone());
            }
        }

        let config = generate()?;
        self.configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.clone(), (key, config.clone()));
        Ok(config)
    }

    /// Drops everything cached for a deleted object.
    pub fn forget(&self, identity: &ObjectIdentity) {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity);
        self.configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity);
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod cache_tests;
