// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `pagination.rs`

#[cfg(test)]
mod tests {
    use crate::crd::TalosMachine;
    use crate::reconcilers::pagination::*;
    use crate::test_support::{api_client, api_error};
    use kube::api::ListParams;
    use kube::Api;
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MACHINES: &str = "/apis/talos.alperen.cloud/v1alpha1/namespaces/default/talosmachines";

    fn machine(name: &str) -> Value {
        json!({
            "apiVersion": "talos.alperen.cloud/v1alpha1",
            "kind": "TalosMachine",
            "metadata": { "name": name, "namespace": "default" },
            "spec": { "endpoint": "10.0.0.1", "version": "v1.10.4" }
        })
    }

    fn page(items: Vec<Value>, continue_token: Option<&str>) -> ResponseTemplate {
        let mut metadata = json!({ "resourceVersion": "1" });
        if let Some(token) = continue_token {
            metadata["continue"] = json!(token);
        }
        ResponseTemplate::new(200).set_body_json(json!({
            "apiVersion": "talos.alperen.cloud/v1alpha1",
            "kind": "TalosMachineList",
            "metadata": metadata,
            "items": items
        }))
    }

    #[tokio::test]
    async fn test_follows_continue_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MACHINES))
            .and(query_param("limit", "100"))
            .and(query_param_is_missing("continue"))
            .respond_with(page(vec![machine("m1"), machine("m2")], Some("next")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(MACHINES))
            .and(query_param("continue", "next"))
            .respond_with(page(vec![machine("m3")], None))
            .expect(1)
            .mount(&server)
            .await;

        let api: Api<TalosMachine> = Api::namespaced(api_client(&server), "default");
        let machines = list_all_paginated(&api, ListParams::default()).await.unwrap();
        let names: Vec<_> = machines
            .iter()
            .map(|m| m.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_list_error_names_the_resource() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MACHINES))
            .respond_with(api_error(403, "Forbidden"))
            .mount(&server)
            .await;

        let api: Api<TalosMachine> = Api::namespaced(api_client(&server), "default");
        let err = list_all_paginated(&api, ListParams::default())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to list talosmachines"));
    }
}
