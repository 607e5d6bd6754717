// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `context.rs`

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::events::NoopEventPublisher;
    use futures::StreamExt;

    fn offline_client() -> Client {
        install_crypto_provider();
        let config = kube::Config::new("http://127.0.0.1:6443".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    fn options() -> ContextOptions {
        ContextOptions {
            node_os: Arc::new(UnconfiguredNodeOs),
            node_os_timeout: Duration::from_secs(1),
            packages: Arc::new(UnconfiguredInstaller),
            object_store: Arc::new(HttpObjectStore::new(reqwest::Client::new())),
            cloud: Arc::new(UnconfiguredCloud),
            events: Arc::new(NoopEventPublisher),
            enable_meta_key: false,
        }
    }

    #[test]
    fn test_crypto_provider_installed_once() {
        install_crypto_provider();

        assert!(rustls::crypto::CryptoProvider::get_default().is_some());
        assert!(!install_crypto_provider());
    }

    #[tokio::test]
    async fn test_machine_trigger_reaches_receiver() {
        let (context, mut trigger_rx) = Context::new(offline_client(), options());

        let mut sender = context.machine_trigger.clone();
        sender.try_send(()).unwrap();

        assert_eq!(trigger_rx.next().await, Some(()));
    }

    #[tokio::test]
    async fn test_registered_watcher_triggers_machine_stream() {
        let (context, mut trigger_rx) = Context::new(offline_client(), options());

        context
            .watchers
            .add("default/m1", context.machine_trigger.clone())
            .await
            .unwrap();
        assert!(context.watchers.trigger("default/m1").await.unwrap());
        assert_eq!(trigger_rx.next().await, Some(()));
    }

    #[tokio::test]
    async fn test_node_os_is_wrapped() {
        let (context, _trigger_rx) = Context::new(offline_client(), options());
        let secrets = crate::bundle::SecretsBundle::generate(chrono::Utc::now()).unwrap();

        let result = context
            .node_os
            .connect(&crate::bundle::BundleDescriptor::default(), &secrets, true)
            .await;
        assert!(matches!(
            result,
            Err(crate::errors::NodeOsError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_meta_key_setting_is_carried() {
        let (context, _trigger_rx) = Context::new(
            offline_client(),
            ContextOptions {
                enable_meta_key: true,
                ..options()
            },
        );
        assert!(context.enable_meta_key);

        let (context, _trigger_rx) = Context::new(offline_client(), options());
        assert!(!context.enable_meta_key);
    }

    #[tokio::test]
    async fn test_context_clones_share_backoffs() {
        let (context, _trigger_rx) = Context::new(offline_client(), options());
        let clone = context.clone();

        let first = context.backoffs.next_delay("TalosMachine/default/m1");
        let second = clone.backoffs.next_delay("TalosMachine/default/m1");
        assert!(second > first);
    }
}
