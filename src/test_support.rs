// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared fixtures for unit tests: a client bound to a wiremock API server and
//! controller contexts with fake collaborators.

use crate::bundle::{BundleDescriptor, SecretsBundle};
use crate::context::{install_crypto_provider, Context, ContextOptions};
use crate::crd::TalosControlPlane;
use crate::errors::{CloudError, NodeOsError, PackageError};
use crate::events::{EventPublisher, NoopEventPublisher};
use crate::external::{
    CloudInstances, CloudProvisioner, DiskInfo, HttpObjectStore, NodeOsClient, NodeOsConnector,
    PackageInstaller, ReleaseRequest, UnconfiguredCloud, UnconfiguredInstaller,
    UnconfiguredNodeOs,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::Client;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::{MockServer, ResponseTemplate};

/// Kubernetes client talking to `server`.
pub fn api_client(server: &MockServer) -> Client {
    install_crypto_provider();
    let config = kube::Config::new(server.uri().parse().unwrap());
    Client::try_from(config).unwrap()
}

/// Unconfigured collaborators and a no-op event publisher.
pub fn test_options() -> ContextOptions {
    ContextOptions {
        node_os: Arc::new(UnconfiguredNodeOs),
        node_os_timeout: Duration::from_secs(5),
        packages: Arc::new(UnconfiguredInstaller),
        object_store: Arc::new(HttpObjectStore::new(reqwest::Client::new())),
        cloud: Arc::new(UnconfiguredCloud),
        events: Arc::new(NoopEventPublisher),
        enable_meta_key: false,
    }
}

/// Controller context backed by `server` with unconfigured collaborators.
pub fn test_context(server: &MockServer) -> Context {
    test_context_with(server, test_options())
}

/// Controller context backed by `server` with the given collaborators.
pub fn test_context_with(server: &MockServer, options: ContextOptions) -> Context {
    Context::new(api_client(server), options).0
}

/// A `Status` error body as the API server sends it.
pub fn api_error(code: u16, reason: &str) -> ResponseTemplate {
    ResponseTemplate::new(code).set_body_json(json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": format!("{reason} ({code})"),
        "reason": reason,
        "code": code
    }))
}

/// 404 response.
pub fn not_found() -> ResponseTemplate {
    api_error(404, "NotFound")
}

/// 200 response echoing `body`.
pub fn ok_json(body: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(body)
}

/// Event publisher remembering `(type, reason)` of every event.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(String, String)>>,
}

impl RecordingEvents {
    /// Reasons of the published events, in order.
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason)| reason.clone())
            .collect()
    }

    /// Reasons of the published `Warning` events.
    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(type_, _)| type_ == "Warning")
            .map(|(_, reason)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _object: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        let type_ = match type_ {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        };
        self.events
            .lock()
            .unwrap()
            .push((type_.to_string(), reason.to_string()));
    }
}

#[derive(Default)]
struct FakeNodeState {
    calls: Mutex<Vec<String>>,
    bootstrap_error: Mutex<Option<NodeOsError>>,
    apply_error: Mutex<Option<NodeOsError>>,
    kubelet_state: Mutex<Option<String>>,
    meta: Mutex<Vec<(u8, Vec<u8>)>>,
}

/// Node OS connector whose nodes record every call.
///
/// Calls are recorded as `connect insecure=<bool>`, `bootstrap`, `apply_config`,
/// `kubeconfig`, `etcd_snapshot`, `service_state <name>`, `upgrade <image>`,
/// `reset`, `disks` and `meta_write <key>`.
#[derive(Clone, Default)]
pub struct FakeNodeOs {
    state: Arc<FakeNodeState>,
}

impl FakeNodeOs {
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn fail_bootstrap(&self, error: NodeOsError) {
        *self.state.bootstrap_error.lock().unwrap() = Some(error);
    }

    pub fn fail_apply(&self, error: NodeOsError) {
        *self.state.apply_error.lock().unwrap() = Some(error);
    }

    pub fn set_kubelet_state(&self, state: &str) {
        *self.state.kubelet_state.lock().unwrap() = Some(state.to_string());
    }

    /// META partition writes, in order.
    pub fn meta_writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.state.meta.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.state.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl NodeOsConnector for FakeNodeOs {
    async fn connect(
        &self,
        _descriptor: &BundleDescriptor,
        _secrets: &SecretsBundle,
        insecure: bool,
    ) -> Result<Box<dyn NodeOsClient>, NodeOsError> {
        self.record(format!("connect insecure={insecure}"));
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl NodeOsClient for FakeNodeOs {
    async fn bootstrap(&self) -> Result<(), NodeOsError> {
        self.record("bootstrap".to_string());
        self.state.bootstrap_error.lock().unwrap().clone().map_or(Ok(()), Err)
    }

    async fn apply_config(&self, _config: &[u8]) -> Result<(), NodeOsError> {
        self.record("apply_config".to_string());
        self.state.apply_error.lock().unwrap().clone().map_or(Ok(()), Err)
    }

    async fn kubeconfig(&self) -> Result<Vec<u8>, NodeOsError> {
        self.record("kubeconfig".to_string());
        Ok(b"apiVersion: v1\nkind: Config\n".to_vec())
    }

    async fn etcd_snapshot(&self) -> Result<Vec<u8>, NodeOsError> {
        self.record("etcd_snapshot".to_string());
        Ok(b"snapshot".to_vec())
    }

    async fn service_state(&self, service: &str) -> Result<String, NodeOsError> {
        self.record(format!("service_state {service}"));
        Ok(self
            .state
            .kubelet_state
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "Waiting".to_string()))
    }

    async fn upgrade(&self, image: &str) -> Result<(), NodeOsError> {
        self.record(format!("upgrade {image}"));
        Ok(())
    }

    async fn reset(&self) -> Result<(), NodeOsError> {
        self.record("reset".to_string());
        Ok(())
    }

    async fn disks(&self) -> Result<Vec<DiskInfo>, NodeOsError> {
        self.record("disks".to_string());
        Ok(Vec::new())
    }

    async fn meta_write(&self, key: u8, value: &[u8]) -> Result<(), NodeOsError> {
        self.record(format!("meta_write {key:#04x}"));
        self.state.meta.lock().unwrap().push((key, value.to_vec()));
        Ok(())
    }
}

/// Chart installer remembering requests and uninstalls.
#[derive(Default)]
pub struct FakeInstaller {
    pub requests: Mutex<Vec<ReleaseRequest>>,
    pub uninstalled: Mutex<Vec<String>>,
    pub fail: bool,
}

#[async_trait]
impl PackageInstaller for FakeInstaller {
    async fn install_or_upgrade(
        &self,
        _kubeconfig: &[u8],
        request: &ReleaseRequest,
    ) -> Result<String, PackageError> {
        if self.fail {
            return Err(PackageError::InstallFailed {
                release: request.release_name.clone(),
                reason: "chart not found".to_string(),
            });
        }
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        Ok(requests.len().to_string())
    }

    async fn uninstall(
        &self,
        _kubeconfig: &[u8],
        release_name: &str,
        _namespace: &str,
    ) -> Result<(), PackageError> {
        self.uninstalled.lock().unwrap().push(release_name.to_string());
        if self.fail {
            return Err(PackageError::UninstallFailed {
                release: release_name.to_string(),
                reason: "cluster unreachable".to_string(),
            });
        }
        Ok(())
    }
}

/// Cloud provisioner reporting fixed instances.
#[derive(Default)]
pub struct FakeCloud {
    pub ready: bool,
    pub calls: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl CloudProvisioner for FakeCloud {
    async fn ensure_instances(&self, _control_plane: &TalosControlPlane) -> Result<(), CloudError> {
        self.calls.lock().unwrap().push("ensure_instances");
        Ok(())
    }

    async fn instances(
        &self,
        _control_plane: &TalosControlPlane,
    ) -> Result<CloudInstances, CloudError> {
        self.calls.lock().unwrap().push("instances");
        Ok(CloudInstances {
            ready: self.ready,
            addresses: vec!["10.0.0.10".to_string()],
        })
    }

    async fn teardown(&self, _control_plane: &TalosControlPlane) -> Result<(), CloudError> {
        self.calls.lock().unwrap().push("teardown");
        Ok(())
    }
}
