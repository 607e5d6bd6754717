// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `synthesis.rs`

#[cfg(test)]
mod tests {
    use crate::bundle::MachineType;
    use crate::crd::{ConfigMapKeyRef, TalosControlPlane, TalosControlPlaneSpec};
    use crate::labels::STATEFULSET_POD_NAME;
    use crate::synthesis::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn owner() -> OwnerReference {
        let mut cp = TalosControlPlane::new("c1-controlplane", TalosControlPlaneSpec::default());
        cp.metadata.namespace = Some("default".to_string());
        cp.metadata.uid = Some("cp-uid".to_string());
        build_owner_reference(&cp)
    }

    fn params(config_ref: Option<&ConfigMapKeyRef>) -> NodeSetParams<'_> {
        NodeSetParams {
            name: "c1-controlplane",
            namespace: "default",
            replicas: 3,
            version: "v1.10.4",
            machine_type: MachineType::ControlPlane,
            storage_class_name: Some("local-path"),
            config_ref,
        }
    }

    #[test]
    fn test_owner_reference_points_at_control_plane() {
        let reference = owner();
        assert_eq!(reference.kind, "TalosControlPlane");
        assert_eq!(reference.api_version, "talos.alperen.cloud/v1alpha1");
        assert_eq!(reference.name, "c1-controlplane");
        assert_eq!(reference.uid, "cp-uid");
        assert_eq!(reference.controller, Some(true));
    }

    #[test]
    fn test_statefulset_is_deterministic() {
        let a = build_statefulset(&params(None), &owner());
        let b = build_statefulset(&params(None), &owner());
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_statefulset_shape() {
        let sts = build_statefulset(&params(None), &owner());
        let spec = sts.spec.unwrap();

        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("c1-controlplane"));

        let claims = spec.volume_claim_templates.unwrap();
        let names: Vec<_> = claims
            .iter()
            .map(|c| c.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "system-state",
                "var",
                "etc-cni",
                "etc-kubernetes",
                "usr-libexec-kubernetes"
            ]
        );
        let var = claims[1].spec.as_ref().unwrap();
        assert_eq!(var.storage_class_name.as_deref(), Some("local-path"));
        assert_eq!(
            var.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"].0,
            "20Gi"
        );

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.containers.len(), 1);
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("ghcr.io/siderolabs/talos:v1.10.4")
        );
        let security = container.security_context.as_ref().unwrap();
        assert_eq!(security.privileged, Some(true));
        assert_eq!(security.seccomp_profile.as_ref().unwrap().type_, "Unconfined");
        assert_eq!(container.volume_mounts.as_ref().unwrap().len(), 8);
    }

    #[test]
    fn test_userdata_defaults_to_generated_config_map() {
        let sts = build_statefulset(&params(None), &owner());
        let pod = sts.spec.unwrap().template.spec.unwrap();
        let env = pod.containers[0].env.as_ref().unwrap();

        let userdata = env.iter().find(|e| e.name == "USERDATA").unwrap();
        let selector = userdata
            .value_from
            .as_ref()
            .unwrap()
            .config_map_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(selector.name, "c1-controlplane-config");
        assert_eq!(selector.key, "controlplane.yaml");

        let platform = env.iter().find(|e| e.name == "PLATFORM").unwrap();
        assert_eq!(platform.value.as_deref(), Some("container"));
    }

    #[test]
    fn test_userdata_uses_config_ref() {
        let reference = ConfigMapKeyRef {
            name: "custom".to_string(),
            key: "machine.yaml".to_string(),
        };
        let sts = build_statefulset(&params(Some(&reference)), &owner());
        let pod = sts.spec.unwrap().template.spec.unwrap();
        let env = pod.containers[0].env.as_ref().unwrap();
        let selector = env[0]
            .value_from
            .as_ref()
            .unwrap()
            .config_map_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(selector.name, "custom");
        assert_eq!(selector.key, "machine.yaml");
    }

    #[test]
    fn test_worker_config_key() {
        assert_eq!(config_key(MachineType::Worker), "worker.yaml");
        assert_eq!(config_key(MachineType::ControlPlane), "controlplane.yaml");
    }

    #[test]
    fn test_services_cluster_facing_and_per_replica() {
        let services =
            build_services("c1-controlplane", "default", 3, MachineType::ControlPlane, &owner());
        let names: Vec<_> = services
            .iter()
            .map(|s| s.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "c1-controlplane",
                "c1-controlplane-0",
                "c1-controlplane-1",
                "c1-controlplane-2"
            ]
        );

        let shared = services[0].spec.as_ref().unwrap();
        assert!(!shared
            .selector
            .as_ref()
            .unwrap()
            .contains_key(STATEFULSET_POD_NAME));

        let first = services[1].spec.as_ref().unwrap();
        assert_eq!(
            first.selector.as_ref().unwrap()[STATEFULSET_POD_NAME],
            "c1-controlplane-0"
        );
        let ports: Vec<_> = first
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .map(|p| (p.name.clone().unwrap(), p.port))
            .collect();
        assert_eq!(
            ports,
            vec![("talos-api".to_string(), 50000), ("k8s-api".to_string(), 6443)]
        );
    }

    #[test]
    fn test_config_map_carries_base64_config() {
        let cm = build_config_map(
            "c1-worker",
            "default",
            MachineType::Worker,
            "version: v1alpha1\n",
            &owner(),
        );
        assert_eq!(cm.metadata.name.as_deref(), Some("c1-worker-config"));
        let data = cm.data.unwrap();
        let decoded = BASE64.decode(&data["worker.yaml"]).unwrap();
        assert_eq!(decoded, b"version: v1alpha1\n");
    }

    #[test]
    fn test_secret_single_key() {
        let secret = build_secret(
            "c1-controlplane-kubeconfig",
            "default",
            "kubeconfig",
            "apiVersion: v1",
            &owner(),
        );
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert_eq!(secret.data.unwrap()["kubeconfig"].0, b"apiVersion: v1");
        assert_eq!(secret.metadata.owner_references.unwrap().len(), 1);
    }
}
