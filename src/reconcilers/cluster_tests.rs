// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `cluster.rs`

#[cfg(test)]
mod tests {
    use crate::crd::{
        DeploymentMode, LocalObjectReference, TalosCluster, TalosControlPlaneSpec,
        TalosWorkerSpec,
    };
    use crate::labels::{FINALIZER_TALOS_CLUSTER, RECONCILE_MODE_ANNOTATION};
    use crate::reconcilers::cluster::*;
    use crate::reconcilers::ReconcileOutcome;
    use crate::test_support::{not_found, ok_json, test_context};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BASE: &str = "/apis/talos.alperen.cloud/v1alpha1/namespaces/default";

    fn control_plane_spec(replicas: i32) -> TalosControlPlaneSpec {
        TalosControlPlaneSpec {
            mode: DeploymentMode::Container,
            replicas,
            version: "v1.10.4".to_string(),
            kube_version: "v1.31.0".to_string(),
            ..Default::default()
        }
    }

    fn worker_spec() -> TalosWorkerSpec {
        TalosWorkerSpec {
            mode: DeploymentMode::Container,
            replicas: 3,
            version: "v1.10.4".to_string(),
            kube_version: "v1.31.0".to_string(),
            ..Default::default()
        }
    }

    fn cluster_json(spec: Value, extra_metadata: Value) -> Value {
        let mut metadata = json!({
            "name": "c1",
            "namespace": "default",
            "uid": "5e1f3b7a-0000-4000-8000-000000000001",
            "resourceVersion": "100",
            "generation": 1,
            "finalizers": [FINALIZER_TALOS_CLUSTER]
        });
        if let (Some(metadata), Some(extra)) =
            (metadata.as_object_mut(), extra_metadata.as_object())
        {
            for (key, value) in extra {
                metadata.insert(key.clone(), value.clone());
            }
        }
        json!({
            "apiVersion": "talos.alperen.cloud/v1alpha1",
            "kind": "TalosCluster",
            "metadata": metadata,
            "spec": spec
        })
    }

    fn inline_cluster() -> TalosCluster {
        let spec = json!({
            "controlPlane": serde_json::to_value(control_plane_spec(3)).unwrap(),
            "worker": serde_json::to_value(worker_spec()).unwrap()
        });
        serde_json::from_value(cluster_json(spec, json!({}))).unwrap()
    }

    fn stored(object: Value) -> Value {
        let mut object = object;
        object["metadata"]["resourceVersion"] = json!("7");
        object["metadata"]["uid"] = json!("9d2c1a55-0000-4000-8000-000000000002");
        object
    }

    async fn mount_status(server: &MockServer, body: Value) {
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/talosclusters/c1/status")))
            .respond_with(ok_json(body))
            .mount(server)
            .await;
    }

    #[test]
    fn test_child_names() {
        assert_eq!(control_plane_name("c1"), "c1-controlplane");
        assert_eq!(worker_name("c1"), "c1-worker");
    }

    #[test]
    fn test_build_control_plane_maps_inline_spec() {
        let cluster = inline_cluster();
        let control_plane = build_control_plane(&cluster, &control_plane_spec(3));

        assert_eq!(control_plane.metadata.name.as_deref(), Some("c1-controlplane"));
        assert_eq!(control_plane.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(control_plane.spec.replicas, 3);
        assert_eq!(control_plane.spec.version, "v1.10.4");
        assert_eq!(control_plane.spec.kube_version, "v1.31.0");

        let owners = control_plane.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "TalosCluster");
        assert_eq!(owners[0].uid, "5e1f3b7a-0000-4000-8000-000000000001");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_build_worker_defaults_control_plane_ref() {
        let cluster = inline_cluster();
        let worker = build_worker(&cluster, &worker_spec(), "c1-controlplane");
        assert_eq!(worker.metadata.name.as_deref(), Some("c1-worker"));
        assert_eq!(worker.spec.control_plane_ref.name, "c1-controlplane");
    }

    #[test]
    fn test_build_worker_keeps_explicit_control_plane_ref() {
        let cluster = inline_cluster();
        let spec = TalosWorkerSpec {
            control_plane_ref: LocalObjectReference {
                name: "shared-cp".to_string(),
            },
            ..worker_spec()
        };
        let worker = build_worker(&cluster, &spec, "c1-controlplane");
        assert_eq!(worker.spec.control_plane_ref.name, "shared-cp");
    }

    #[tokio::test]
    async fn test_invalid_spec_fails_before_creating_children() {
        let server = MockServer::start().await;
        let spec = json!({
            "controlPlane": serde_json::to_value(control_plane_spec(1)).unwrap(),
            "controlPlaneRef": { "name": "existing" }
        });
        let body = cluster_json(spec, json!({}));
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/talosclusters/c1/status")))
            .and(body_partial_json(json!({
                "status": { "conditions": [
                    { "type": "Ready", "status": "False", "reason": "ConfigurationInvalid" },
                    { "type": "Failed", "status": "True", "reason": "ConfigurationInvalid" }
                ]}
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
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let cluster: TalosCluster = serde_json::from_value(body).unwrap();
        let err = reconcile_talos_cluster(Arc::new(test_context(&server)), cluster)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("controlPlane or controlPlaneRef"));
    }

    #[tokio::test]
    async fn test_reconcile_mode_annotation_skips_children() {
        for (mode, expected) in [
            ("disable", ReconcileOutcome::AwaitChange),
            ("dryrun", ReconcileOutcome::Done),
        ] {
            let server = MockServer::start().await;
            let spec = json!({
                "controlPlane": serde_json::to_value(control_plane_spec(1)).unwrap(),
                "worker": serde_json::to_value(worker_spec()).unwrap()
            });
            let body = cluster_json(
                spec,
                json!({ "annotations": { RECONCILE_MODE_ANNOTATION: mode } }),
            );

            let cluster: TalosCluster = serde_json::from_value(body).unwrap();
            let outcome = reconcile_talos_cluster(Arc::new(test_context(&server)), cluster)
                .await
                .unwrap();

            assert_eq!(outcome, expected, "mode {mode}");
            assert!(
                server.received_requests().await.unwrap().is_empty(),
                "mode {mode} must not call the API"
            );
        }
    }

    #[tokio::test]
    async fn test_disabled_cluster_is_still_deleted() {
        let server = MockServer::start().await;
        let body = cluster_json(
            json!({}),
            json!({
                "annotations": { RECONCILE_MODE_ANNOTATION: "disable" },
                "deletionTimestamp": "2025-01-01T00:00:00Z"
            }),
        );
        mount_status(&server, body.clone()).await;
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/talosclusters/c1")))
            .respond_with(ok_json(body.clone()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(not_found())
            .mount(&server)
            .await;

        let cluster: TalosCluster = serde_json::from_value(body).unwrap();
        reconcile_talos_cluster(Arc::new(test_context(&server)), cluster)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_creates_control_plane_first_and_requeues() {
        let server = MockServer::start().await;
        let cluster = inline_cluster();
        let desired = build_control_plane(&cluster, &control_plane_spec(3));

        Mock::given(method("GET"))
            .and(path(format!("{BASE}/taloscontrolplanes/c1-controlplane")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{BASE}/taloscontrolplanes")))
            .and(body_partial_json(json!({
                "metadata": { "name": "c1-controlplane" },
                "spec": { "replicas": 3 }
            })))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(stored(serde_json::to_value(&desired).unwrap())),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/talosworkers/c1-worker")))
            .respond_with(not_found())
            .expect(0)
            .mount(&server)
            .await;
        mount_status(&server, serde_json::to_value(&cluster).unwrap()).await;

        let outcome = reconcile_talos_cluster(Arc::new(test_context(&server)), cluster)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn test_creates_worker_once_control_plane_exists() {
        let server = MockServer::start().await;
        let cluster = inline_cluster();
        let control_plane = build_control_plane(&cluster, &control_plane_spec(3));
        let worker = build_worker(&cluster, &worker_spec(), "c1-controlplane");

        Mock::given(method("GET"))
            .and(path(format!("{BASE}/taloscontrolplanes/c1-controlplane")))
            .respond_with(ok_json(stored(serde_json::to_value(&control_plane).unwrap())))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/talosworkers/c1-worker")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{BASE}/talosworkers")))
            .and(body_partial_json(json!({
                "metadata": { "name": "c1-worker" },
                "spec": { "controlPlaneRef": { "name": "c1-controlplane" } }
            })))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(stored(serde_json::to_value(&worker).unwrap())),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/talosclusters/c1/status")))
            .and(body_partial_json(json!({
                "status": {
                    "observedGeneration": 1,
                    "conditions": [{
                        "type": "Ready",
                        "status": "True",
                        "reason": "ChildrenReconciled"
                    }]
                }
            })))
            .respond_with(ok_json(serde_json::to_value(&cluster).unwrap()))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = reconcile_talos_cluster(Arc::new(test_context(&server)), cluster)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
    }

    #[tokio::test]
    async fn test_replica_change_is_applied_to_control_plane() {
        let server = MockServer::start().await;
        let mut cluster = inline_cluster();
        cluster.spec.control_plane = Some(control_plane_spec(5));
        let old = build_control_plane(&cluster, &control_plane_spec(3));
        let worker = build_worker(&cluster, &worker_spec(), "c1-controlplane");

        Mock::given(method("GET"))
            .and(path(format!("{BASE}/taloscontrolplanes/c1-controlplane")))
            .respond_with(ok_json(stored(serde_json::to_value(&old).unwrap())))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/taloscontrolplanes/c1-controlplane")))
            .and(body_partial_json(json!({ "spec": { "replicas": 5 } })))
            .respond_with(ok_json(stored(
                serde_json::to_value(build_control_plane(&cluster, &control_plane_spec(5)))
                    .unwrap(),
            )))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/talosworkers/c1-worker")))
            .respond_with(ok_json(stored(serde_json::to_value(&worker).unwrap())))
            .mount(&server)
            .await;
        mount_status(&server, serde_json::to_value(&cluster).unwrap()).await;

        let outcome = reconcile_talos_cluster(Arc::new(test_context(&server)), cluster)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
    }

    #[tokio::test]
    async fn test_missing_referenced_control_plane_requeues() {
        let server = MockServer::start().await;
        let body = cluster_json(json!({ "controlPlaneRef": { "name": "missing" } }), json!({}));

        Mock::given(method("GET"))
            .and(path(format!("{BASE}/taloscontrolplanes/missing")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/talosclusters/c1/status")))
            .and(body_partial_json(json!({
                "status": { "conditions": [{ "type": "Ready", "reason": "ControlPlaneNotFound" }] }
            })))
            .respond_with(ok_json(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let cluster: TalosCluster = serde_json::from_value(body).unwrap();
        let outcome = reconcile_talos_cluster(Arc::new(test_context(&server)), cluster)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn test_deletion_removes_children_then_finalizer() {
        let server = MockServer::start().await;
        let body = cluster_json(
            json!({}),
            json!({ "deletionTimestamp": "2025-01-01T00:00:00Z" }),
        );
        mount_status(&server, body.clone()).await;
        for child in ["talosworkers/c1-worker", "taloscontrolplanes/c1-controlplane"] {
            Mock::given(method("DELETE"))
                .and(path(format!("{BASE}/{child}")))
                .respond_with(not_found())
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("{BASE}/{child}")))
                .respond_with(not_found())
                .mount(&server)
                .await;
        }
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/talosclusters/c1")))
            .and(body_partial_json(json!({ "metadata": { "finalizers": [] } })))
            .respond_with(ok_json(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let cluster: TalosCluster = serde_json::from_value(body).unwrap();
        let outcome = reconcile_talos_cluster(Arc::new(test_context(&server)), cluster)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::AwaitChange);
    }

    #[tokio::test]
    async fn test_deletion_waits_for_terminating_children() {
        let server = MockServer::start().await;
        let body = cluster_json(
            json!({}),
            json!({ "deletionTimestamp": "2025-01-01T00:00:00Z" }),
        );
        let cluster: TalosCluster = serde_json::from_value(body.clone()).unwrap();
        let control_plane = build_control_plane(&cluster, &control_plane_spec(3));
        mount_status(&server, body.clone()).await;

        Mock::given(method("DELETE"))
            .and(path(format!("{BASE}/talosworkers/c1-worker")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/talosworkers/c1-worker")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{BASE}/taloscontrolplanes/c1-controlplane")))
            .respond_with(ok_json(stored(serde_json::to_value(&control_plane).unwrap())))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/taloscontrolplanes/c1-controlplane")))
            .respond_with(ok_json(stored(serde_json::to_value(&control_plane).unwrap())))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/talosclusters/c1")))
            .respond_with(ok_json(body))
            .expect(0)
            .mount(&server)
            .await;

        let outcome = reconcile_talos_cluster(Arc::new(test_context(&server)), cluster)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(5))
        );
    }
}
