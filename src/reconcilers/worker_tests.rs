// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `worker.rs`

#[cfg(test)]
mod tests {
    use crate::bundle::SecretsBundle;
    use crate::crd::{MachineRole, TalosControlPlane, TalosWorker};
    use crate::events::reasons;
    use crate::labels::{FINALIZER_TALOS_CONTROL_PLANE, FINALIZER_TALOS_WORKER};
    use crate::reconcilers::controlplane::build_descriptor;
    use crate::reconcilers::worker::*;
    use crate::reconcilers::ReconcileOutcome;
    use crate::test_support::{
        not_found, ok_json, test_context, test_context_with, test_options, RecordingEvents,
    };
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BASE: &str = "/apis/talos.alperen.cloud/v1alpha1/namespaces/default";
    const CORE: &str = "/api/v1/namespaces/default";
    const APPS: &str = "/apis/apps/v1/namespaces/default";
    const WORKER_UID: &str = "0b7e2f4c-0000-4000-8000-000000000004";

    fn worker_json(spec: Value) -> Value {
        let mut spec_base = json!({
            "version": "v1.10.5",
            "mode": "container",
            "replicas": 2,
            "kubeVersion": "",
            "controlPlaneRef": { "name": "cp1" }
        });
        if let (Some(base), Some(extra)) = (spec_base.as_object_mut(), spec.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        json!({
            "apiVersion": "talos.alperen.cloud/v1alpha1",
            "kind": "TalosWorker",
            "metadata": {
                "name": "w1",
                "namespace": "default",
                "uid": WORKER_UID,
                "resourceVersion": "30",
                "generation": 2,
                "finalizers": [FINALIZER_TALOS_WORKER]
            },
            "spec": spec_base,
            "status": {}
        })
    }

    fn worker(spec: Value) -> TalosWorker {
        serde_json::from_value(worker_json(spec)).unwrap()
    }

    /// A control plane that already persisted its bundle and descriptor.
    fn control_plane_json(persisted: bool) -> Value {
        let mut body = json!({
            "apiVersion": "talos.alperen.cloud/v1alpha1",
            "kind": "TalosControlPlane",
            "metadata": {
                "name": "cp1",
                "namespace": "default",
                "uid": "0b7e2f4c-0000-4000-8000-000000000003",
                "resourceVersion": "20",
                "generation": 1,
                "finalizers": [FINALIZER_TALOS_CONTROL_PLANE]
            },
            "spec": {
                "version": "v1.10.4",
                "mode": "container",
                "replicas": 1,
                "kubeVersion": "v1.31.0"
            },
            "status": {}
        });
        if persisted {
            let cp: TalosControlPlane = serde_json::from_value(body.clone()).unwrap();
            body["status"] = json!({
                "secretBundle": SecretsBundle::generate(Utc::now()).unwrap().to_yaml().unwrap(),
                "bundleConfig": build_descriptor(&cp).to_yaml().unwrap(),
                "state": "Ready"
            });
        }
        body
    }

    async fn mount_control_plane(server: &MockServer, persisted: bool) {
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/taloscontrolplanes/cp1")))
            .respond_with(ok_json(control_plane_json(persisted)))
            .mount(server)
            .await;
    }

    async fn mount_status(server: &MockServer, body: Value) {
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/talosworkers/w1/status")))
            .respond_with(ok_json(body))
            .mount(server)
            .await;
    }

    fn machine_json(name: &str, owner_uid: &str, state: Option<&str>) -> Value {
        let mut machine = json!({
            "apiVersion": "talos.alperen.cloud/v1alpha1",
            "kind": "TalosMachine",
            "metadata": {
                "name": name,
                "namespace": "default",
                "ownerReferences": [{
                    "apiVersion": "talos.alperen.cloud/v1alpha1",
                    "kind": "TalosWorker",
                    "name": "w1",
                    "uid": owner_uid,
                    "controller": true
                }]
            },
            "spec": { "endpoint": "10.0.0.1", "version": "v1.10.5" }
        });
        if let Some(state) = state {
            machine["status"] = json!({ "state": state });
        }
        machine
    }

    #[test]
    fn test_machine_name() {
        assert_eq!(machine_name("w1", "10.0.0.21"), "w1-10.0.0.21");
    }

    #[test]
    fn test_worker_descriptor_inherits_kube_version() {
        let cp: TalosControlPlane = serde_json::from_value(control_plane_json(false)).unwrap();
        let descriptor = worker_descriptor(&worker(json!({})), &build_descriptor(&cp));
        assert_eq!(descriptor.cluster_name, "cp1");
        assert_eq!(descriptor.version, "v1.10.5");
        assert_eq!(descriptor.kube_version, "v1.31.0");
        assert!(descriptor.sans.is_empty());
    }

    #[test]
    fn test_worker_descriptor_uses_own_kube_version() {
        let cp: TalosControlPlane = serde_json::from_value(control_plane_json(false)).unwrap();
        let w = worker(json!({ "kubeVersion": "v1.32.0" }));
        assert_eq!(worker_descriptor(&w, &build_descriptor(&cp)).kube_version, "v1.32.0");
    }

    #[test]
    fn test_build_machine() {
        let w = worker(json!({
            "mode": "metal",
            "metalSpec": {
                "machines": ["10.0.0.21"],
                "machineSpec": { "installDisk": "/dev/sda" }
            }
        }));
        let machine = build_machine(&w, "10.0.0.21");

        assert_eq!(machine.metadata.name.as_deref(), Some("w1-10.0.0.21"));
        assert_eq!(machine.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(machine.spec.endpoint, "10.0.0.21");
        assert_eq!(machine.spec.version, "v1.10.5");
        let parent = machine.spec.parent_ref.as_ref().unwrap();
        assert_eq!(parent.role, MachineRole::Worker);
        assert_eq!(parent.name, "w1");
        assert_eq!(
            machine.spec.machine_spec.as_ref().unwrap().install_disk.as_deref(),
            Some("/dev/sda")
        );
        let owner = &machine.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.uid, WORKER_UID);
        assert_eq!(owner.controller, Some(true));
    }

    #[tokio::test]
    async fn test_cloud_mode_is_unsupported() {
        let server = MockServer::start().await;
        let body = worker_json(json!({ "mode": "cloud" }));
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/talosworkers/w1/status")))
            .and(body_partial_json(json!({
                "status": { "conditions": [{ "type": "Ready", "reason": "UnsupportedMode" }] }
            })))
            .respond_with(ok_json(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let w: TalosWorker = serde_json::from_value(body).unwrap();
        let outcome = reconcile_talos_worker(Arc::new(test_context(&server)), w)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::AwaitChange);
    }

    #[tokio::test]
    async fn test_missing_control_plane_requeues() {
        let server = MockServer::start().await;
        let body = worker_json(json!({}));
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/taloscontrolplanes/cp1")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/talosworkers/w1/status")))
            .and(body_partial_json(json!({
                "status": { "conditions": [{ "type": "Ready", "reason": "ControlPlaneNotFound" }] }
            })))
            .respond_with(ok_json(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let events = Arc::new(RecordingEvents::default());
        let mut options = test_options();
        options.events = events.clone();
        let ctx = Arc::new(test_context_with(&server, options));

        let w: TalosWorker = serde_json::from_value(body).unwrap();
        let outcome = reconcile_talos_worker(ctx, w).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(30))
        );
        assert_eq!(events.warnings(), vec![reasons::CONTROL_PLANE_NOT_FOUND.to_string()]);
    }

    #[tokio::test]
    async fn test_waits_for_control_plane_bundle() {
        let server = MockServer::start().await;
        let body = worker_json(json!({}));
        mount_control_plane(&server, false).await;
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/talosworkers/w1/status")))
            .and(body_partial_json(json!({
                "status": {
                    "conditions": [{ "type": "Ready", "reason": "WaitingForControlPlane" }]
                }
            })))
            .respond_with(ok_json(body.clone()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let w: TalosWorker = serde_json::from_value(body).unwrap();
        let outcome = reconcile_talos_worker(Arc::new(test_context(&server)), w)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn test_container_workers_become_available() {
        let server = MockServer::start().await;
        let body = worker_json(json!({}));
        mount_control_plane(&server, true).await;
        mount_status(&server, body.clone()).await;
        Mock::given(method("GET"))
            .and(path_regex(format!(r"^{CORE}/(configmaps|services)/.+$")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        for (plural, kind) in [("configmaps", "ConfigMap"), ("services", "Service")] {
            Mock::given(method("POST"))
                .and(path(format!("{CORE}/{plural}")))
                .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                    "apiVersion": "v1",
                    "kind": kind,
                    "metadata": { "name": "created", "namespace": "default" }
                })))
                .mount(&server)
                .await;
        }
        let statefulset = json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": { "name": "w1", "namespace": "default" },
            "status": { "replicas": 2, "readyReplicas": 2 }
        });
        Mock::given(method("GET"))
            .and(path(format!("{APPS}/statefulsets/w1")))
            .respond_with(ok_json(statefulset.clone()))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(format!("{APPS}/statefulsets/w1")))
            .respond_with(ok_json(statefulset))
            .mount(&server)
            .await;

        let w: TalosWorker = serde_json::from_value(body).unwrap();
        let outcome = reconcile_talos_worker(Arc::new(test_context(&server)), w)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);

        let requests = server.received_requests().await.unwrap();
        let services: Vec<String> = requests
            .iter()
            .filter(|r| r.method.as_str() == "POST" && r.url.path().ends_with("/services"))
            .map(|r| {
                let service: Value = serde_json::from_slice(&r.body).unwrap();
                service["metadata"]["name"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(services, vec!["w1-0", "w1-1"], "no cluster-facing service for workers");

        let last_status: Value = requests
            .iter()
            .filter(|r| r.url.path().ends_with("/status"))
            .last()
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .unwrap();
        assert_eq!(last_status["status"]["state"], "Available");
        assert_eq!(last_status["status"]["observedGeneration"], 2);
        assert!(last_status["status"]["config"]
            .as_str()
            .unwrap()
            .contains("type: worker"));
    }

    #[tokio::test]
    async fn test_metal_workers_create_machines_and_prune_stale_ones() {
        let server = MockServer::start().await;
        let body = worker_json(json!({
            "mode": "metal",
            "metalSpec": { "machines": ["10.0.0.21"] }
        }));
        mount_control_plane(&server, true).await;
        mount_status(&server, body.clone()).await;
        Mock::given(method("GET"))
            .and(path(format!("{CORE}/configmaps/w1-config")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{CORE}/configmaps")))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": "w1-config", "namespace": "default" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/talosmachines/w1-10.0.0.21")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{BASE}/talosmachines")))
            .respond_with(ResponseTemplate::new(201).set_body_json(machine_json(
                "w1-10.0.0.21",
                WORKER_UID,
                None,
            )))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/talosmachines")))
            .respond_with(ok_json(json!({
                "apiVersion": "talos.alperen.cloud/v1alpha1",
                "kind": "TalosMachineList",
                "metadata": { "resourceVersion": "40" },
                "items": [
                    machine_json("w1-10.0.0.21", WORKER_UID, Some("Installing")),
                    machine_json("w1-10.0.0.99", WORKER_UID, Some("Available")),
                    machine_json("other-10.0.0.50", "another-owner", Some("Available"))
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{BASE}/talosmachines/w1-10.0.0.99")))
            .respond_with(ok_json(machine_json("w1-10.0.0.99", WORKER_UID, None)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{BASE}/talosmachines/other-10.0.0.50")))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let w: TalosWorker = serde_json::from_value(body).unwrap();
        let outcome = reconcile_talos_worker(Arc::new(test_context(&server)), w)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(10)),
            "the remaining machine is still installing"
        );
    }

    #[tokio::test]
    async fn test_deletion_removes_finalizer() {
        let server = MockServer::start().await;
        let mut body = worker_json(json!({}));
        body["metadata"]["deletionTimestamp"] = json!("2025-01-01T00:00:00Z");
        mount_status(&server, body.clone()).await;
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/talosworkers/w1")))
            .respond_with(ok_json(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let w: TalosWorker = serde_json::from_value(body).unwrap();
        let outcome = reconcile_talos_worker(Arc::new(test_context(&server)), w)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::AwaitChange);
    }
}
