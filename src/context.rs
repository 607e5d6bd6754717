// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared context for all controllers.
//!
//! Every controller receives an `Arc<Context>` holding:
//! - the Kubernetes client
//! - the generate-once bundle cache and the watcher registry
//! - the per-object error backoff table
//! - the external collaborators (node OS, chart installer, object store, cloud)
//! - the event publisher

use crate::bundle::BundleCache;
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::external::{
    CloudProvisioner, HttpObjectStore, NodeOsConnector, ObjectStore, PackageInstaller,
    TimedNodeOs, UnconfiguredCloud, UnconfiguredInstaller, UnconfiguredNodeOs,
};
use crate::reconcilers::retry::ErrorBackoffs;
use crate::watcher::WatcherRegistry;
use futures::channel::mpsc;
use kube::runtime::events::EventType;
use kube::{Client, Resource};
use std::sync::Arc;
use std::time::Duration;

/// Capacity of the machine trigger channel. A full channel already guarantees a
/// pending reconcile-all, so extra signals are dropped.
pub const MACHINE_TRIGGER_BUFFER: usize = 16;

/// Shared context passed to all controllers.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client for API operations
    pub client: Client,

    /// In-process read-through cache for secrets bundles and generated configs
    pub bundles: Arc<BundleCache>,

    /// Background watchers that request an immediate machine reconcile
    pub watchers: WatcherRegistry,

    /// Sender feeding the machine controller's `reconcile_all_on` stream
    pub machine_trigger: mpsc::Sender<()>,

    /// Per-object exponential backoff used by the error policy
    pub backoffs: Arc<ErrorBackoffs>,

    /// Node OS connector, wrapped with a per-call timeout
    pub node_os: Arc<dyn NodeOsConnector>,

    /// Chart installer used by addons
    pub packages: Arc<dyn PackageInstaller>,

    /// Snapshot upload target
    pub object_store: Arc<dyn ObjectStore>,

    /// Cloud instance provisioner
    pub cloud: Arc<dyn CloudProvisioner>,

    /// Kubernetes event publisher
    pub events: Arc<dyn EventPublisher>,

    /// Write machine network settings to the node META partition before the
    /// first configuration apply
    pub enable_meta_key: bool,
}

/// Collaborators and settings a [`Context`] is built from.
pub struct ContextOptions {
    pub node_os: Arc<dyn NodeOsConnector>,
    pub node_os_timeout: Duration,
    pub packages: Arc<dyn PackageInstaller>,
    pub object_store: Arc<dyn ObjectStore>,
    pub cloud: Arc<dyn CloudProvisioner>,
    pub events: Arc<dyn EventPublisher>,
    pub enable_meta_key: bool,
}

impl ContextOptions {
    /// Default collaborators: unconfigured node OS, installer and cloud, the
    /// HTTP object store and Kubernetes events.
    #[must_use]
    pub fn defaults(client: &Client, node_os_timeout: Duration) -> Self {
        Self {
            node_os: Arc::new(UnconfiguredNodeOs),
            node_os_timeout,
            packages: Arc::new(UnconfiguredInstaller),
            object_store: Arc::new(HttpObjectStore::new(reqwest::Client::new())),
            cloud: Arc::new(UnconfiguredCloud),
            events: Arc::new(KubeEventPublisher::new(
                client.clone(),
                crate::constants::FIELD_MANAGER,
            )),
            enable_meta_key: false,
        }
    }
}

/// Selects ring as the process-wide rustls crypto provider.
///
/// kube and reqwest compile in different rustls backends, so neither client can
/// pick one by itself. Must run before the first client is built. Returns
/// `false` when a provider was already installed.
pub fn install_crypto_provider() -> bool {
    rustls::crypto::ring::default_provider()
        .install_default()
        .is_ok()
}

impl Context {
    /// Builds the context and returns the receiving end of the machine trigger
    /// channel, to be passed to `Controller::reconcile_all_on`.
    ///
    /// Spawns the watcher registry task, so it must be called inside a runtime.
    #[must_use]
    pub fn new(client: Client, options: ContextOptions) -> (Self, mpsc::Receiver<()>) {
        let (machine_trigger, trigger_rx) = mpsc::channel(MACHINE_TRIGGER_BUFFER);
        let context = Self {
            client,
            bundles: Arc::new(BundleCache::new()),
            watchers: WatcherRegistry::spawn(),
            machine_trigger,
            backoffs: Arc::new(ErrorBackoffs::default()),
            node_os: Arc::new(TimedNodeOs::new(options.node_os, options.node_os_timeout)),
            packages: options.packages,
            object_store: options.object_store,
            cloud: options.cloud,
            events: options.events,
            enable_meta_key: options.enable_meta_key,
        };
        (context, trigger_rx)
    }

    /// Publishes an event on `obj`. Failures are logged by the publisher.
    pub async fn publish_event<K>(
        &self,
        obj: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) where
        K: Resource<DynamicType = ()>,
    {
        self.events
            .publish(&obj.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod context_tests;
