// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for reconciler helper functions.

#[cfg(test)]
mod tests {
    use super::super::{
        annotation_patches, object_key, should_reconcile, ReconcileMode, ReconcileOutcome,
    };
    use crate::crd::{TalosCluster, TalosClusterSpec};
    use crate::errors::BundleError;
    use crate::labels::{CONFIG_PATCHES_ANNOTATION, RECONCILE_MODE_ANNOTATION};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::controller::Action;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn cluster(annotations: Option<BTreeMap<String, String>>) -> TalosCluster {
        TalosCluster {
            metadata: ObjectMeta {
                name: Some("c1".to_string()),
                namespace: Some("default".to_string()),
                annotations,
                ..Default::default()
            },
            spec: TalosClusterSpec::default(),
            status: None,
        }
    }

    // ========== Tests for should_reconcile() ==========

    #[test]
    fn test_should_reconcile_when_generations_equal() {
        assert!(
            !should_reconcile(Some(5), Some(5)),
            "Should not reconcile when generations match"
        );
    }

    #[test]
    fn test_should_reconcile_when_generations_differ() {
        assert!(should_reconcile(Some(7), Some(5)));
    }

    #[test]
    fn test_should_reconcile_first_reconciliation() {
        assert!(
            should_reconcile(Some(1), None),
            "Should reconcile on first reconciliation (observed=None)"
        );
    }

    #[test]
    fn test_should_reconcile_no_generation_tracking() {
        assert!(!should_reconcile(None, Some(5)));
        assert!(!should_reconcile(None, None));
    }

    // ========== Tests for ReconcileOutcome ==========

    #[test]
    fn test_outcome_actions() {
        assert_eq!(
            ReconcileOutcome::requeue_secs(30).into_action(),
            Action::requeue(Duration::from_secs(30))
        );
        assert_eq!(
            ReconcileOutcome::AwaitChange.into_action(),
            Action::await_change()
        );
        assert_eq!(
            ReconcileOutcome::Done.into_action(),
            Action::requeue(Duration::from_secs(crate::constants::READY_REQUEUE_SECS))
        );
    }

    #[test]
    fn test_outcome_reason_labels() {
        assert_eq!(ReconcileOutcome::Done.reason(), "resync");
        assert_eq!(ReconcileOutcome::requeue_secs(5).reason(), "waiting");
        assert_eq!(ReconcileOutcome::AwaitChange.reason(), "await_change");
    }

    // ========== Tests for ReconcileMode ==========

    #[test]
    fn test_reconcile_mode_parse() {
        assert_eq!(ReconcileMode::parse("normal"), ReconcileMode::Normal);
        assert_eq!(ReconcileMode::parse(""), ReconcileMode::Normal);
        assert_eq!(ReconcileMode::parse("disable"), ReconcileMode::Disable);
        assert_eq!(ReconcileMode::parse("DryRun"), ReconcileMode::DryRun);
        assert_eq!(ReconcileMode::parse("bogus"), ReconcileMode::Normal);
    }

    #[test]
    fn test_reconcile_mode_from_annotation() {
        assert_eq!(ReconcileMode::of(&cluster(None)), ReconcileMode::Normal);

        let annotations = BTreeMap::from([(
            RECONCILE_MODE_ANNOTATION.to_string(),
            "disable".to_string(),
        )]);
        assert_eq!(
            ReconcileMode::of(&cluster(Some(annotations))),
            ReconcileMode::Disable
        );
    }

    // ========== Tests for object helpers ==========

    #[test]
    fn test_object_key() {
        assert_eq!(object_key(&cluster(None)), "TalosCluster/default/c1");
    }

    #[test]
    fn test_annotation_patches() {
        assert!(annotation_patches(&cluster(None)).unwrap().is_empty());

        let annotated = cluster(Some(BTreeMap::from([(
            CONFIG_PATCHES_ANNOTATION.to_string(),
            r#"[{"op": "add", "path": "/machine/kubelet/extraArgs", "value": {"v": "2"}}]"#
                .to_string(),
        )])));
        let patches = annotation_patches(&annotated).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].path(), "/machine/kubelet/extraArgs");

        let broken = cluster(Some(BTreeMap::from([(
            CONFIG_PATCHES_ANNOTATION.to_string(),
            "not a patch list".to_string(),
        )])));
        assert!(matches!(
            annotation_patches(&broken),
            Err(BundleError::InvalidPatch { .. })
        ));
    }
}
