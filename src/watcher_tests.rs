// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `watcher.rs`

#[cfg(test)]
mod tests {
    use crate::watcher::WatcherRegistry;
    use futures::channel::mpsc;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_add_has_remove() {
        let registry = WatcherRegistry::spawn();
        let (tx, _rx) = mpsc::channel(1);

        assert!(!registry.has("default/m1").await.unwrap());
        registry.add("default/m1", tx).await.unwrap();
        assert!(registry.has("default/m1").await.unwrap());

        assert!(registry.remove("default/m1").await.unwrap());
        assert!(!registry.has("default/m1").await.unwrap());
        assert!(!registry.remove("default/m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_trigger_signals_stream() {
        let registry = WatcherRegistry::spawn();
        let (tx, mut rx) = mpsc::channel(1);
        registry.add("default/m1", tx).await.unwrap();

        assert!(registry.trigger("default/m1").await.unwrap());
        assert_eq!(rx.next().await, Some(()));
    }

    #[tokio::test]
    async fn test_trigger_unknown_name() {
        let registry = WatcherRegistry::spawn();
        assert!(!registry.trigger("default/missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_trigger_with_pending_signal_still_delivers() {
        let registry = WatcherRegistry::spawn();
        let (tx, mut rx) = mpsc::channel(0);
        registry.add("default/m1", tx).await.unwrap();

        assert!(registry.trigger("default/m1").await.unwrap());
        assert!(registry.trigger("default/m1").await.unwrap());
        assert_eq!(rx.next().await, Some(()));
    }

    #[tokio::test]
    async fn test_closed_stream_drops_entry() {
        let registry = WatcherRegistry::spawn();
        let (tx, rx) = mpsc::channel(1);
        registry.add("default/m1", tx).await.unwrap();
        drop(rx);

        assert!(!registry.trigger("default/m1").await.unwrap());
        assert!(!registry.has("default/m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_clones_share_registry() {
        let registry = WatcherRegistry::spawn();
        let other = registry.clone();
        let (tx, _rx) = mpsc::channel(1);
        registry.add("default/m1", tx).await.unwrap();
        assert!(other.has("default/m1").await.unwrap());
    }
}
