// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `main.rs` - command line parsing and signal handling

#[cfg(test)]
mod tests {
    use crate::{error_type, Args};
    use clap::{CommandFactory, Parser};
    use std::time::Duration as StdDuration;
    use talos_operator::constants::{
        METRICS_SERVER_BIND_ADDRESS, NODE_OS_TIMEOUT_SECS, TOKIO_WORKER_THREADS,
    };
    use talos_operator::errors::NodeOsError;
    use tokio::time::timeout;

    #[test]
    fn test_args_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["talos-operator"]).unwrap();

        assert_eq!(args.metrics_bind_address, METRICS_SERVER_BIND_ADDRESS);
        assert_eq!(args.worker_threads, TOKIO_WORKER_THREADS);
        assert_eq!(args.node_os_connector_timeout_secs, NODE_OS_TIMEOUT_SECS);
        assert!(args.watch_namespace.is_none());
        assert!(!args.enable_meta_key);
    }

    #[test]
    fn test_args_flags() {
        let args = Args::try_parse_from([
            "talos-operator",
            "--metrics-bind-address",
            "127.0.0.1:9090",
            "--worker-threads",
            "8",
            "--watch-namespace",
            "clusters",
            "--node-os-connector-timeout-secs",
            "5",
            "--enable-meta-key",
        ])
        .unwrap();

        assert_eq!(args.metrics_bind_address, "127.0.0.1:9090");
        assert_eq!(args.worker_threads, 8);
        assert_eq!(args.watch_namespace.as_deref(), Some("clusters"));
        assert_eq!(args.node_os_connector_timeout_secs, 5);
        assert!(args.enable_meta_key);
    }

    #[test]
    fn test_args_reject_non_numeric_threads() {
        assert!(Args::try_parse_from(["talos-operator", "--worker-threads", "many"]).is_err());
    }

    #[test]
    fn test_error_type_classification() {
        let node_os = anyhow::Error::new(NodeOsError::NotConfigured)
            .context("failed to apply configuration");
        assert_eq!(error_type(&node_os), "node_os");

        let unreachable = anyhow::Error::new(NodeOsError::Connection {
            endpoint: "10.0.0.21".to_string(),
            reason: "connection refused".to_string(),
        });
        assert_eq!(error_type(&unreachable), "node_os_unavailable");
        assert_eq!(error_type(&anyhow::anyhow!("bundle missing")), "reconcile");
    }

    /// Test that SIGTERM signal handler can be created on Unix platforms
    #[tokio::test]
    #[cfg(unix)]
    async fn test_sigterm_signal_handler_creation() {
        use tokio::signal::unix::{signal, SignalKind};

        let result = signal(SignalKind::terminate());
        assert!(
            result.is_ok(),
            "Should be able to create SIGTERM signal handler"
        );
    }

    #[tokio::test]
    async fn test_shutdown_signal_pending_without_signal() {
        let result = timeout(StdDuration::from_millis(100), crate::shutdown_signal()).await;

        assert!(
            result.is_err(),
            "shutdown_signal() should not resolve when no signal is sent"
        );
    }
}
