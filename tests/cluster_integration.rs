// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Integration tests for the Talos operator
//!
//! These tests need a Kubernetes cluster with the CRDs installed and the
//! operator running. They create resources and watch the operator act on them.
//!
//! Run with: cargo test --test cluster_integration -- --ignored

mod common;

use common::{
    create_test_namespace, delete_test_namespace, get_kube_client_or_skip, wait_for,
    wait_for_deletion,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{CustomResourceExt, ResourceExt};
use serde_json::json;
use std::time::Duration;
use talos_operator::crd::{
    TalosAddon, TalosCluster, TalosClusterAddon, TalosClusterAddonRelease, TalosControlPlane,
    TalosEtcdBackup, TalosEtcdBackupSchedule, TalosMachine, TalosWorker,
};
use talos_operator::reconcilers::cluster::{control_plane_name, worker_name};
use talos_operator::reconcilers::status::is_condition_true;
use talos_operator::status_reasons::{CONDITION_TYPE_READY, REASON_SCHEDULE_PAUSED};

const CHILD_TIMEOUT: Duration = Duration::from_secs(60);
const DELETE_TIMEOUT: Duration = Duration::from_secs(120);

#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn test_crds_are_installed() {
    let Some(client) = get_kube_client_or_skip().await else {
        return;
    };
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for name in [
        TalosCluster::crd_name(),
        TalosControlPlane::crd_name(),
        TalosWorker::crd_name(),
        TalosMachine::crd_name(),
        TalosEtcdBackup::crd_name(),
        TalosEtcdBackupSchedule::crd_name(),
        TalosAddon::crd_name(),
        TalosClusterAddon::crd_name(),
        TalosClusterAddonRelease::crd_name(),
    ] {
        let crd = crds.get_opt(name).await.unwrap();
        assert!(crd.is_some(), "CRD {name} is not installed");
    }
}

#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn test_container_cluster_lifecycle() {
    let Some(client) = get_kube_client_or_skip().await else {
        return;
    };
    let namespace = "talos-it-cluster";
    create_test_namespace(&client, namespace).await.unwrap();

    let clusters: Api<TalosCluster> = Api::namespaced(client.clone(), namespace);
    let control_planes: Api<TalosControlPlane> = Api::namespaced(client.clone(), namespace);
    let workers: Api<TalosWorker> = Api::namespaced(client.clone(), namespace);
    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);

    let cluster: TalosCluster = serde_json::from_value(json!({
        "apiVersion": "talos.alperen.cloud/v1alpha1",
        "kind": "TalosCluster",
        "metadata": { "name": "c1", "namespace": namespace },
        "spec": {
            "controlPlane": { "mode": "container", "replicas": 1 },
            "worker": {
                "mode": "container",
                "replicas": 1,
                "controlPlaneRef": { "name": control_plane_name("c1") }
            }
        }
    }))
    .unwrap();
    clusters.create(&PostParams::default(), &cluster).await.unwrap();

    let control_plane = wait_for(&control_planes, &control_plane_name("c1"), CHILD_TIMEOUT, |_| {
        true
    })
    .await
    .expect("control plane child was not created");
    let owners = control_plane.owner_references();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "TalosCluster");
    assert_eq!(owners[0].name, "c1");

    let worker = wait_for(&workers, &worker_name("c1"), CHILD_TIMEOUT, |_| true).await;
    assert!(worker.is_some(), "worker child was not created");

    let control_plane = wait_for(&control_planes, &control_plane_name("c1"), CHILD_TIMEOUT, |cp| {
        cp.status
            .as_ref()
            .is_some_and(|status| !status.secret_bundle.is_empty())
    })
    .await
    .expect("control plane never persisted its secrets bundle");
    assert!(control_plane
        .status
        .as_ref()
        .is_some_and(|status| !status.bundle_config.is_empty()));

    let statefulset = wait_for(&statefulsets, &control_plane_name("c1"), CHILD_TIMEOUT, |_| true)
        .await
        .expect("control plane StatefulSet was not created");
    assert_eq!(statefulset.spec.and_then(|spec| spec.replicas), Some(1));
    assert!(services
        .get_opt(&control_plane_name("c1"))
        .await
        .unwrap()
        .is_some());

    clusters.delete("c1", &DeleteParams::default()).await.unwrap();
    assert!(
        wait_for_deletion(&clusters, "c1", DELETE_TIMEOUT).await,
        "cluster was not deleted"
    );
    assert!(control_planes
        .get_opt(&control_plane_name("c1"))
        .await
        .unwrap()
        .is_none_or(|cp| cp.metadata.deletion_timestamp.is_some()));

    delete_test_namespace(&client, namespace).await;
}

#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn test_paused_schedule_reports_paused() {
    let Some(client) = get_kube_client_or_skip().await else {
        return;
    };
    let namespace = "talos-it-schedule";
    create_test_namespace(&client, namespace).await.unwrap();

    let schedules: Api<TalosEtcdBackupSchedule> = Api::namespaced(client.clone(), namespace);
    let schedule: TalosEtcdBackupSchedule = serde_json::from_value(json!({
        "apiVersion": "talos.alperen.cloud/v1alpha1",
        "kind": "TalosEtcdBackupSchedule",
        "metadata": { "name": "nightly", "namespace": namespace },
        "spec": {
            "schedule": "0 2 * * *",
            "paused": true,
            "backupTemplate": { "spec": {
                "talosControlPlaneRef": { "name": "cp1" },
                "backupStorage": { "s3": {
                    "bucket": "backups",
                    "region": "eu-west-1",
                    "accessKeyID": { "name": "s3", "key": "id" },
                    "secretAccessKey": { "name": "s3", "key": "secret" }
                }}
            }}
        }
    }))
    .unwrap();
    schedules.create(&PostParams::default(), &schedule).await.unwrap();

    let paused = wait_for(&schedules, "nightly", CHILD_TIMEOUT, |s| {
        s.status.as_ref().is_some_and(|status| {
            status.conditions.iter().any(|c| {
                c.r#type == CONDITION_TYPE_READY
                    && c.reason.as_deref() == Some(REASON_SCHEDULE_PAUSED)
            })
        })
    })
    .await
    .expect("paused schedule never reported SchedulePaused");
    let status = paused.status.unwrap_or_default();
    assert!(!is_condition_true(&status.conditions, CONDITION_TYPE_READY));
    assert!(status.last_schedule_time.is_none());

    let backups: Api<TalosEtcdBackup> = Api::namespaced(client.clone(), namespace);
    let created = backups.list(&Default::default()).await.unwrap();
    assert!(created.items.is_empty(), "a paused schedule created a backup");

    schedules.delete("nightly", &DeleteParams::default()).await.unwrap();
    assert!(wait_for_deletion(&schedules, "nightly", DELETE_TIMEOUT).await);
    delete_test_namespace(&client, namespace).await;
}
