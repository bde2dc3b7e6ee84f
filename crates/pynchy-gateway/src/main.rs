use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pynchy_channels::{ChannelFanout, Reconciler, StreamManager, TraceBatcher};
use pynchy_container::runtime::kill_orphans;
use pynchy_container::{CliRuntime, ContainerRuntime};
use pynchy_core::config::PynchyConfig;
use pynchy_git::WorktreeManager;
use pynchy_ipc::{HandlerRegistry, IpcDeps, IpcWatcher};
use pynchy_mcp::McpProxy;
use pynchy_queue::GroupQueue;
use pynchy_scheduler::TaskScheduler;
use pynchy_security::approval::sweep_expired_approvals;
use pynchy_security::clean_room::validate_admin_clean_room;
use pynchy_security::cop::{AllowAllCop, Cop, HttpCop};
use pynchy_security::gate::GateRegistry;
use pynchy_security::questions::sweep_expired_questions;
use pynchy_store::Store;
use tracing::{error, info, warn};

mod app;
mod deploy;
mod http;
mod invoker;
mod notify;
mod processor;
mod services;

use app::App;

#[derive(Parser, Debug)]
#[command(name = "pynchy-gateway", about = "Pynchy host orchestrator")]
struct Args {
    /// Path to pynchy.toml (defaults to ./pynchy.toml, then PYNCHY_* env).
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pynchy_gateway=info,pynchy_ipc=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(PynchyConfig::load(args.config.as_deref())?);

    // A failed prior deploy left a continuation: reset and retry on the
    // recorded sha before anything side-effecting.
    deploy::consume_rollback_continuation(&config).await;

    let store = Arc::new(Store::open(&config.db_path())?);

    // Admin clean-room: terminal on violation, with a rollback
    // continuation so the next start can recover from a bad deploy.
    let profiles: Vec<_> = store.all_registered_groups()?.into_values().collect();
    if let Err(e) = validate_admin_clean_room(&config, &profiles) {
        deploy::write_rollback_and_exit(&config, &e.to_string());
    }
    deploy::clear_deploy_marker(&config);

    // Container runtime must answer before we accept work.
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(CliRuntime::new(&config.container.runtime));
    if let Err(e) = runtime.ensure_running().await {
        error!(error = %e, "container runtime unavailable");
        deploy::write_rollback_and_exit(&config, &e.to_string());
    }
    let killed = kill_orphans(runtime.as_ref(), &config.container.name_prefix).await;
    if killed > 0 {
        info!(count = killed, "orphaned containers cleaned up");
    }

    // Crash-recovery sweeps: stale approvals and questions auto-deny.
    let expired = sweep_expired_approvals(&config.ipc_root(), chrono::Utc::now())?;
    if !expired.is_empty() {
        info!(count = expired.len(), "expired approvals auto-denied at startup");
    }
    let expired = sweep_expired_questions(&config.ipc_root(), chrono::Utc::now())?;
    if !expired.is_empty() {
        info!(count = expired.len(), "expired questions auto-denied at startup");
    }

    // Cop: LLM inspector when a key is configured, fail-open stub otherwise.
    let cop: Arc<dyn Cop> = match config
        .secrets
        .get("agent__api_key")
        .cloned()
        .or_else(|| std::env::var("AGENT__API_KEY").ok())
    {
        Some(key) => Arc::new(HttpCop::new(key, None)),
        None => {
            warn!("no agent API key configured — Cop inspections disabled (fail-open)");
            Arc::new(AllowAllCop)
        }
    };

    let queue = GroupQueue::new(
        config.container.max_concurrent,
        config.queue.base_retry_seconds,
    );
    let gates = Arc::new(GateRegistry::new());

    // Channel adapters are plugin-provided; the core starts with none and
    // the TUI API remains fully usable.
    let channels: Vec<Arc<dyn pynchy_channels::Channel>> = Vec::new();
    let fanout = Arc::new(ChannelFanout::new(channels.clone(), Arc::clone(&store)));
    let streams = Arc::new(StreamManager::new(channels.clone(), Arc::clone(&store)));
    let (traces, mut trace_flush_rx) = TraceBatcher::new(Duration::from_secs(3));

    let proxy = Arc::new(McpProxy::start(Arc::clone(&gates), Arc::clone(&cop), 0).await?);
    let worktrees = Arc::new(WorktreeManager::new(
        config.project_root.clone(),
        config.worktrees_dir(),
    ));

    let (events_tx, _) = tokio::sync::broadcast::channel(256);
    let app = Arc::new(App {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        queue: queue.clone(),
        gates: Arc::clone(&gates),
        cop: Arc::clone(&cop),
        fanout: Arc::clone(&fanout),
        streams,
        traces: Arc::new(traces),
        proxy,
        worktrees,
        runtime: Arc::clone(&runtime),
        workspaces: std::sync::RwLock::new(Default::default()),
        active: Default::default(),
        events: events_tx,
        started_at: std::time::Instant::now(),
    });
    app.reload_workspaces();

    // Queue → processor wiring.
    {
        let app_for_process = Arc::clone(&app);
        queue.set_process_messages_fn(Arc::new(move |jid| {
            let app = Arc::clone(&app_for_process);
            Box::pin(processor::process_messages(app, jid))
        }));
        let app_for_stop = Arc::clone(&app);
        queue.set_stop_fn(Arc::new(move |jid| {
            let app = Arc::clone(&app_for_stop);
            Box::pin(async move {
                let Some(profile) = app.workspace_by_jid(&jid) else {
                    return;
                };
                if let Some(active) = app.active.get(&profile.folder) {
                    pynchy_container::spawn::write_close_sentinel(&active.input_dir);
                    if let Err(e) = app.runtime.stop(&active.name).await {
                        warn!(container = %active.name, error = %e, "stop failed");
                    }
                }
            })
        }));
    }

    // Host-side service tools. `list_tasks` lets an agent inspect its own
    // schedule without a host-mutating operation.
    let mut service_registry = services::ServiceRegistry::new();
    {
        let store_for_tool = Arc::clone(&store);
        service_registry.register(
            "list_tasks",
            Arc::new(move |payload| {
                let store = Arc::clone(&store_for_tool);
                Box::pin(async move {
                    let folder = payload
                        .get("source_group")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    let tasks = store
                        .list_tasks(folder.as_deref())
                        .map_err(|e| e.to_string())?;
                    let tasks = serde_json::to_value(&tasks).map_err(|e| e.to_string())?;
                    Ok(serde_json::json!({ "tasks": tasks }))
                })
            }),
        );
    }

    // IPC dispatch.
    let mut registry = HandlerRegistry::new();
    pynchy_ipc::handlers::register_all(&mut registry);
    let registry = Arc::new(registry);
    let ipc_deps = Arc::new(IpcDeps {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        gates: Arc::clone(&gates),
        cop: Arc::clone(&cop),
        queue: queue.clone(),
        broadcaster: Arc::new(services::AppBroadcaster(Arc::clone(&app))),
        worktree: Arc::new(services::AppWorktreeOps(Arc::clone(&app))),
        services: Arc::new(service_registry),
        containers: Arc::new(services::AppContainerControl(Arc::clone(&app))),
        on_refresh_groups: {
            let app = Arc::clone(&app);
            Arc::new(move || app.reload_workspaces())
        },
    });
    pynchy_ipc::watcher::drain_existing(&config.ipc_root(), &registry, &ipc_deps).await;
    let ipc_watcher = IpcWatcher::start(
        config.ipc_root(),
        Arc::clone(&registry),
        Arc::clone(&ipc_deps),
    )?;

    // Trace batches flush to channels when their cooldown fires.
    {
        let app_for_traces = Arc::clone(&app);
        tokio::spawn(async move {
            while let Some(jid) = trace_flush_rx.recv().await {
                if let Some(batch) = app_for_traces.traces.take(&jid) {
                    app_for_traces.fanout.broadcast(&jid, &batch, true).await;
                }
            }
        });
    }

    // Task scheduler.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler = TaskScheduler::new(
        Arc::clone(&store),
        queue.clone(),
        Arc::new(invoker::AppTaskInvoker(Arc::clone(&app))),
        Duration::from_secs(5),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    // Reconciler: boot run, then periodic.
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&config),
        queue.clone(),
    ));
    {
        let app_for_rec = Arc::clone(&app);
        let reconciler = Arc::clone(&reconciler);
        let mut shutdown_rx = shutdown_rx.clone();
        let channels = channels.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(app_for_rec.config.reconcile.cooldown_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let workspaces = app_for_rec.workspaces.read().unwrap().clone();
                        reconciler.reconcile_all(&channels, &workspaces).await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                }
            }
        });
    }

    // Slow housekeeping: ledger GC, completed-task retention, sweeps.
    {
        let app_for_gc = Arc::clone(&app);
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let _ = app_for_gc.store.gc_delivered_ledger(7);
                        let _ = app_for_gc.store.prune_completed_tasks(30);
                        let _ = sweep_expired_approvals(&app_for_gc.config.ipc_root(), chrono::Utc::now());
                        let _ = sweep_expired_questions(&app_for_gc.config.ipc_root(), chrono::Utc::now());
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                }
            }
        });
    }

    // HTTP surface.
    let router = http::build_router(Arc::clone(&app));
    let addr: SocketAddr = format!("0.0.0.0:{}", config.deploy.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port = config.deploy.port, "pynchy gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Orderly teardown: stop intake, let containers finish, kill stragglers.
    let _ = shutdown_tx.send(true);
    queue.shutdown(Duration::from_secs(30)).await;
    ipc_watcher.stop();
    let _ = scheduler_handle.await;
    info!("pynchy gateway stopped");
    Ok(())
}
