// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `cache.rs`

#[cfg(test)]
mod tests {
    use crate::bundle::builder::MachineType;
    use crate::bundle::cache::*;
    use crate::bundle::descriptor::BundleDescriptor;
    use crate::bundle::patch::PatchOperation;
    use crate::bundle::secrets::SecretsBundle;
    use crate::errors::BundleError;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn identity(uid: &str) -> ObjectIdentity {
        ObjectIdentity {
            namespace: "default".to_string(),
            name: "c1-controlplane".to_string(),
            uid: uid.to_string(),
        }
    }

    fn descriptor() -> BundleDescriptor {
        BundleDescriptor {
            cluster_name: "c1-controlplane".to_string(),
            endpoint: "https://c1-controlplane:6443".to_string(),
            version: "v1.10.4".to_string(),
            kube_version: "v1.31.0".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_secrets_generated_once_across_passes() {
        let cache = BundleCache::new();
        let persisted = Arc::new(Mutex::new(Vec::<String>::new()));

        let mut keys = Vec::new();
        for _ in 0..3 {
            let sink = Arc::clone(&persisted);
            let bundle = cache
                .get_or_create_secrets(&identity("uid-1"), "", |yaml| async move {
                    sink.lock().unwrap().push(yaml);
                    Ok(())
                })
                .await
                .unwrap();
            keys.push(bundle.certs.os.key.clone());
        }

        assert_eq!(persisted.lock().unwrap().len(), 1);
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_persisted_bundle_is_reused_without_persisting() {
        let cache = BundleCache::new();
        let existing = SecretsBundle::generate(Utc::now()).unwrap();
        let yaml = existing.to_yaml().unwrap();

        let rewritten = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&rewritten);
        let bundle = cache
            .get_or_create_secrets(&identity("uid-1"), &yaml, |_| async move {
                *flag.lock().unwrap() = true;
                Ok(())
            })
            .await
            .unwrap();

        assert!(!*rewritten.lock().unwrap());
        assert_eq!(bundle.certs, existing.certs);
        assert_eq!(bundle.cluster.secret, existing.cluster.secret);
    }

    #[tokio::test]
    async fn test_persist_failure_returns_error_and_caches_nothing() {
        let cache = BundleCache::new();

        let result = cache
            .get_or_create_secrets(&identity("uid-1"), "", |_| async {
                Err(anyhow::anyhow!("conflict"))
            })
            .await;
        assert!(result.is_err());

        let persisted = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&persisted);
        cache
            .get_or_create_secrets(&identity("uid-1"), "", |_| async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(*persisted.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recreated_object_gets_new_bundle() {
        let cache = BundleCache::new();
        let first = cache
            .get_or_create_secrets(&identity("uid-1"), "", |_| async { Ok(()) })
            .await
            .unwrap();
        let second = cache
            .get_or_create_secrets(&identity("uid-2"), "", |_| async { Ok(()) })
            .await
            .unwrap();
        assert_ne!(first.certs.os.key, second.certs.os.key);
    }

    #[tokio::test]
    async fn test_returned_bundle_clock_is_now() {
        let cache = BundleCache::new();
        let before = Utc::now();
        let bundle = cache
            .get_or_create_secrets(&identity("uid-1"), "", |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(bundle.clock() >= before);
    }

    #[test]
    fn test_config_reused_for_same_key() {
        let cache = BundleCache::new();
        let key = ConfigKey::new(1, MachineType::Worker, &descriptor(), &[]).unwrap();
        let mut calls = 0;

        for _ in 0..2 {
            let config = cache
                .get_or_generate_config(&identity("uid-1"), key.clone(), || {
                    calls += 1;
                    Ok("config".to_string())
                })
                .unwrap();
            assert_eq!(config, "config");
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_generation_change_regenerates_config() {
        let cache = BundleCache::new();
        let first = ConfigKey::new(1, MachineType::Worker, &descriptor(), &[]).unwrap();
        let second = ConfigKey::new(2, MachineType::Worker, &descriptor(), &[]).unwrap();

        cache
            .get_or_generate_config(&identity("uid-1"), first, || Ok("one".to_string()))
            .unwrap();
        let config = cache
            .get_or_generate_config(&identity("uid-1"), second, || Ok("two".to_string()))
            .unwrap();
        assert_eq!(config, "two");
    }

    #[test]
    fn test_fingerprint_covers_role_descriptor_and_patches() {
        let base = ConfigKey::new(1, MachineType::Worker, &descriptor(), &[]).unwrap();

        let role = ConfigKey::new(1, MachineType::ControlPlane, &descriptor(), &[]).unwrap();
        assert_ne!(base, role);

        let mut changed = descriptor();
        changed.version = "v1.10.5".to_string();
        let version = ConfigKey::new(1, MachineType::Worker, &changed, &[]).unwrap();
        assert_ne!(base, version);

        let patched = ConfigKey::new(
            1,
            MachineType::Worker,
            &descriptor(),
            &[PatchOperation::replace("/machine/install/disk", json!("/dev/vda"))],
        )
        .unwrap();
        assert_ne!(base, patched);
    }

    #[test]
    fn test_generation_failure_is_not_cached() {
        let cache = BundleCache::new();
        let key = ConfigKey::new(1, MachineType::Worker, &descriptor(), &[]).unwrap();

        let result = cache.get_or_generate_config(&identity("uid-1"), key.clone(), || {
            Err(BundleError::MissingField { field: "endpoint" })
        });
        assert!(result.is_err());

        let config = cache
            .get_or_generate_config(&identity("uid-1"), key, || Ok("ok".to_string()))
            .unwrap();
        assert_eq!(config, "ok");
    }

    #[tokio::test]
    async fn test_forget_drops_cached_entries() {
        let cache = BundleCache::new();
        let id = identity("uid-1");
        cache
            .get_or_create_secrets(&id, "", |_| async { Ok(()) })
            .await
            .unwrap();
        cache.forget(&id);

        let regenerated = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&regenerated);
        cache
            .get_or_create_secrets(&id, "", |_| async move {
                *flag.lock().unwrap() = true;
                Ok(())
            })
            .await
            .unwrap();
        assert!(*regenerated.lock().unwrap());
    }
}
