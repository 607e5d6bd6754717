// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use anyhow::Result;
use clap::Parser;
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    runtime::{
        controller::Action, predicates, reflector, watcher, Controller, PredicateConfig,
        WatchStreamExt,
    },
    Api, Client, Resource,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use talos_operator::{
    constants::{
        METRICS_SERVER_BIND_ADDRESS, NODE_OS_TIMEOUT_SECS, TOKIO_THREAD_NAME,
        TOKIO_WORKER_THREADS,
    },
    context::{install_crypto_provider, Context, ContextOptions},
    crd::{
        TalosAddon, TalosCluster, TalosClusterAddon, TalosClusterAddonRelease, TalosControlPlane,
        TalosEtcdBackup, TalosEtcdBackupSchedule, TalosMachine, TalosWorker,
    },
    errors::NodeOsError,
    metrics,
    reconcilers::{
        object_key, reconcile_talos_addon, reconcile_talos_cluster, reconcile_talos_cluster_addon,
        reconcile_talos_cluster_addon_release, reconcile_talos_control_plane,
        reconcile_talos_etcd_backup, reconcile_talos_etcd_backup_schedule,
        reconcile_talos_machine, reconcile_talos_worker, ReconcileOutcome,
    },
};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct ReconcileError(#[from] anyhow::Error);

/// Talos cluster lifecycle operator
#[derive(Debug, Parser)]
#[command(name = "talos-operator", version, about)]
struct Args {
    /// Address the metrics and health server listens on
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = METRICS_SERVER_BIND_ADDRESS)]
    metrics_bind_address: String,

    /// Number of Tokio worker threads
    #[arg(long, env = "WORKER_THREADS", default_value_t = TOKIO_WORKER_THREADS)]
    worker_threads: usize,

    /// Only watch resources in this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Per-call timeout for node OS API calls, in seconds
    #[arg(
        long,
        env = "NODE_OS_CONNECTOR_TIMEOUT_SECS",
        default_value_t = NODE_OS_TIMEOUT_SECS
    )]
    node_os_connector_timeout_secs: u64,

    /// Write machine network settings to the node META partition before the
    /// first configuration apply
    #[arg(long, env = "ENABLE_META_KEY")]
    enable_meta_key: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Build Tokio runtime with custom thread names
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.worker_threads.max(1))
        .thread_name(TOKIO_THREAD_NAME)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    // Initialize logging with custom format
    // Format: timestamp file:line LEVEL message
    //
    // Respects RUST_LOG environment variable if set, otherwise defaults to INFO level
    // Respects RUST_LOG_FORMAT environment variable for output format (text or json)
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }

    info!("Starting Talos Operator");
    debug!(?args, "Parsed command line arguments");

    if !install_crypto_provider() {
        warn!("A rustls crypto provider is already installed, keeping it");
    }

    debug!("Initializing Kubernetes client");
    let client = Client::try_default().await?;
    debug!("Kubernetes client initialized successfully");

    let options = ContextOptions {
        enable_meta_key: args.enable_meta_key,
        ..ContextOptions::defaults(
            &client,
            Duration::from_secs(args.node_os_connector_timeout_secs),
        )
    };
    let (context, machine_trigger) = Context::new(client, options);
    let ctx = Arc::new(context);
    let namespace = args.watch_namespace;

    match namespace.as_deref() {
        Some(ns) => info!("Starting all controllers in namespace {}", ns),
        None => info!("Starting all controllers cluster-wide"),
    }

    // Controllers should never exit - if one fails, we log it and exit the main process
    tokio::select! {
        result = shutdown_signal() => {
            result?;
            info!("Graceful shutdown completed successfully");
            Ok(())
        }
        result = metrics::serve(&args.metrics_bind_address) => {
            error!("CRITICAL: metrics server exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("metrics server exited unexpectedly without error")
        }
        result = run_cluster_controller(ctx.clone(), namespace.clone()) => {
            error!("CRITICAL: TalosCluster controller exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("TalosCluster controller exited unexpectedly without error")
        }
        result = run_control_plane_controller(ctx.clone(), namespace.clone()) => {
            error!("CRITICAL: TalosControlPlane controller exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("TalosControlPlane controller exited unexpectedly without error")
        }
        result = run_worker_controller(ctx.clone(), namespace.clone()) => {
            error!("CRITICAL: TalosWorker controller exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("TalosWorker controller exited unexpectedly without error")
        }
        result = run_machine_controller(ctx.clone(), namespace.clone(), machine_trigger) => {
            error!("CRITICAL: TalosMachine controller exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("TalosMachine controller exited unexpectedly without error")
        }
        result = run_etcd_backup_controller(ctx.clone(), namespace.clone()) => {
            error!("CRITICAL: TalosEtcdBackup controller exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("TalosEtcdBackup controller exited unexpectedly without error")
        }
        result = run_etcd_backup_schedule_controller(ctx.clone(), namespace.clone()) => {
            error!(
                "CRITICAL: TalosEtcdBackupSchedule controller exited unexpectedly: {:?}",
                result
            );
            result?;
            anyhow::bail!("TalosEtcdBackupSchedule controller exited unexpectedly without error")
        }
        result = run_addon_controller(ctx.clone(), namespace.clone()) => {
            error!("CRITICAL: TalosAddon controller exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("TalosAddon controller exited unexpectedly without error")
        }
        result = run_cluster_addon_controller(ctx.clone(), namespace.clone()) => {
            error!("CRITICAL: TalosClusterAddon controller exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("TalosClusterAddon controller exited unexpectedly without error")
        }
        result = run_cluster_addon_release_controller(ctx.clone(), namespace.clone()) => {
            error!(
                "CRITICAL: TalosClusterAddonRelease controller exited unexpectedly: {:?}",
                result
            );
            result?;
            anyhow::bail!("TalosClusterAddonRelease controller exited unexpectedly without error")
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on Unix platforms.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT, initiating graceful shutdown...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM (pod termination), initiating graceful shutdown...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received SIGINT, initiating graceful shutdown...");
    }
    Ok(())
}

/// Api handle scoped to `namespace`, or to all namespaces.
fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Controller fed by a reflector stream that only passes generation changes.
///
/// Status-only writes do not bump `metadata.generation`, so a reconciler
/// writing its own status does not trigger itself again.
fn controller_for<K>(client: &Client, namespace: Option<&str>) -> Controller<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = watcher(scoped_api::<K>(client, namespace), watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(predicates::generation, PredicateConfig::default());

    Controller::for_stream(stream, reader)
}

/// Run the `TalosCluster` controller
async fn run_cluster_controller(ctx: Arc<Context>, namespace: Option<String>) -> Result<()> {
    info!("Starting TalosCluster controller");

    controller_for::<TalosCluster>(&ctx.client, namespace.as_deref())
        .run(reconcile_cluster_wrapper, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Run the `TalosControlPlane` controller
async fn run_control_plane_controller(
    ctx: Arc<Context>,
    namespace: Option<String>,
) -> Result<()> {
    info!("Starting TalosControlPlane controller");

    controller_for::<TalosControlPlane>(&ctx.client, namespace.as_deref())
        .run(reconcile_control_plane_wrapper, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Run the `TalosWorker` controller
async fn run_worker_controller(ctx: Arc<Context>, namespace: Option<String>) -> Result<()> {
    info!("Starting TalosWorker controller");

    controller_for::<TalosWorker>(&ctx.client, namespace.as_deref())
        .run(reconcile_worker_wrapper, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Run the `TalosMachine` controller
///
/// Readiness watchers signal `trigger` when a node comes up, which requeues
/// every machine in the store.
async fn run_machine_controller(
    ctx: Arc<Context>,
    namespace: Option<String>,
    trigger: mpsc::Receiver<()>,
) -> Result<()> {
    info!("Starting TalosMachine controller");

    controller_for::<TalosMachine>(&ctx.client, namespace.as_deref())
        .reconcile_all_on(trigger)
        .run(reconcile_machine_wrapper, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Run the `TalosEtcdBackup` controller
async fn run_etcd_backup_controller(ctx: Arc<Context>, namespace: Option<String>) -> Result<()> {
    info!("Starting TalosEtcdBackup controller");

    controller_for::<TalosEtcdBackup>(&ctx.client, namespace.as_deref())
        .run(reconcile_etcd_backup_wrapper, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Run the `TalosEtcdBackupSchedule` controller
async fn run_etcd_backup_schedule_controller(
    ctx: Arc<Context>,
    namespace: Option<String>,
) -> Result<()> {
    info!("Starting TalosEtcdBackupSchedule controller");

    controller_for::<TalosEtcdBackupSchedule>(&ctx.client, namespace.as_deref())
        .run(reconcile_etcd_backup_schedule_wrapper, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Run the `TalosAddon` controller
async fn run_addon_controller(ctx: Arc<Context>, namespace: Option<String>) -> Result<()> {
    info!("Starting TalosAddon controller");

    controller_for::<TalosAddon>(&ctx.client, namespace.as_deref())
        .run(reconcile_addon_wrapper, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Run the `TalosClusterAddon` controller
async fn run_cluster_addon_controller(
    ctx: Arc<Context>,
    namespace: Option<String>,
) -> Result<()> {
    info!("Starting TalosClusterAddon controller");

    controller_for::<TalosClusterAddon>(&ctx.client, namespace.as_deref())
        .run(reconcile_cluster_addon_wrapper, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Run the `TalosClusterAddonRelease` controller
async fn run_cluster_addon_release_controller(
    ctx: Arc<Context>,
    namespace: Option<String>,
) -> Result<()> {
    info!("Starting TalosClusterAddonRelease controller");

    controller_for::<TalosClusterAddonRelease>(&ctx.client, namespace.as_deref())
        .run(reconcile_cluster_addon_release_wrapper, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Logs and records the result of one reconcile pass and maps it to an [`Action`].
///
/// A successful pass resets the object's error backoff.
fn finish<K>(
    obj: &K,
    ctx: &Context,
    started: Instant,
    result: Result<ReconcileOutcome>,
) -> Result<Action, ReconcileError>
where
    K: Resource<DynamicType = ()>,
{
    let kind = K::kind(&());
    let key = object_key(obj);

    match result {
        Ok(outcome) => {
            info!("Successfully reconciled {}: {:?}", key, outcome);
            ctx.backoffs.reset(&key);
            metrics::record_reconciliation_success(&kind, started.elapsed());
            metrics::record_reconciliation_requeue(&kind, outcome.reason());
            Ok(outcome.into_action())
        }
        Err(e) => {
            error!("Failed to reconcile {}: {:#}", key, e);
            metrics::record_reconciliation_error(&kind, started.elapsed());
            metrics::record_error(&kind, error_type(&e));
            Err(e.into())
        }
    }
}

/// Coarse error class used as the `error_type` metric label.
fn error_type(err: &anyhow::Error) -> &'static str {
    if err.downcast_ref::<kube::Error>().is_some() {
        "kube_api"
    } else if let Some(node_os) = err.downcast_ref::<NodeOsError>() {
        if node_os.is_transient() {
            "node_os_unavailable"
        } else {
            "node_os"
        }
    } else {
        "reconcile"
    }
}

/// Reconcile wrapper for `TalosCluster`
async fn reconcile_cluster_wrapper(
    cluster: Arc<TalosCluster>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_talos_cluster(ctx.clone(), (*cluster).clone()).await;
    finish(cluster.as_ref(), &ctx, started, result)
}

/// Reconcile wrapper for `TalosControlPlane`
async fn reconcile_control_plane_wrapper(
    control_plane: Arc<TalosControlPlane>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_talos_control_plane(ctx.clone(), (*control_plane).clone()).await;
    finish(control_plane.as_ref(), &ctx, started, result)
}

/// Reconcile wrapper for `TalosWorker`
async fn reconcile_worker_wrapper(
    worker: Arc<TalosWorker>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_talos_worker(ctx.clone(), (*worker).clone()).await;
    finish(worker.as_ref(), &ctx, started, result)
}

/// Reconcile wrapper for `TalosMachine`
async fn reconcile_machine_wrapper(
    machine: Arc<TalosMachine>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_talos_machine(ctx.clone(), (*machine).clone()).await;
    finish(machine.as_ref(), &ctx, started, result)
}

/// Reconcile wrapper for `TalosEtcdBackup`
async fn reconcile_etcd_backup_wrapper(
    backup: Arc<TalosEtcdBackup>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_talos_etcd_backup(ctx.clone(), (*backup).clone()).await;
    finish(backup.as_ref(), &ctx, started, result)
}

/// Reconcile wrapper for `TalosEtcdBackupSchedule`
async fn reconcile_etcd_backup_schedule_wrapper(
    schedule: Arc<TalosEtcdBackupSchedule>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_talos_etcd_backup_schedule(ctx.clone(), (*schedule).clone()).await;
    finish(schedule.as_ref(), &ctx, started, result)
}

/// Reconcile wrapper for `TalosAddon`
async fn reconcile_addon_wrapper(
    addon: Arc<TalosAddon>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_talos_addon(ctx.clone(), (*addon).clone()).await;
    finish(addon.as_ref(), &ctx, started, result)
}

/// Reconcile wrapper for `TalosClusterAddon`
async fn reconcile_cluster_addon_wrapper(
    addon: Arc<TalosClusterAddon>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_talos_cluster_addon(ctx.clone(), (*addon).clone()).await;
    finish(addon.as_ref(), &ctx, started, result)
}

/// Reconcile wrapper for `TalosClusterAddonRelease`
async fn reconcile_cluster_addon_release_wrapper(
    release: Arc<TalosClusterAddonRelease>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_talos_cluster_addon_release(ctx.clone(), (*release).clone()).await;
    finish(release.as_ref(), &ctx, started, result)
}

/// Error policy shared by all controllers: per-object exponential backoff.
fn error_policy<K>(obj: Arc<K>, err: &ReconcileError, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let key = object_key(obj.as_ref());
    let delay = ctx.backoffs.next_delay(&key);
    warn!("Requeueing {} in {:?} after error: {}", key, delay, err);
    Action::requeue(delay)
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod main_tests;
