//! AgentBox CLI entry point.

use agentbox::adapters::global_registry;
use agentbox::agent_config::AgentConfigStore;
use agentbox::api::{self, ApiState};
use agentbox::batch::{BatchScheduler, BatchStore};
use agentbox::channel::{ChannelSessionStore, ChannelStore};
use agentbox::config::{Config, ContainerEngineKind};
use agentbox::container::docker::DockerEngine;
use agentbox::container::gc::{GarbageCollector, SessionLookup};
use agentbox::container::noop::NoopEngine;
use agentbox::container::pool::{ContainerPool, PoolConfig};
use agentbox::container::ContainerEngineDyn;
use agentbox::cron::{CronScheduler, CronStore};
use agentbox::db;
use agentbox::secrets::SecretBox;
use agentbox::session::SessionManager;
use agentbox::shutdown::{wait_for_signal, Shutdown};
use agentbox::tasks::{TaskManager, TaskStore};
use agentbox::webhook::{WebhookNotifier, WebhookStore};

use anyhow::Context as _;
use arc_swap::ArcSwap;
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "agentbox", version)]
#[command(about = "Multi-tenant execution platform for long-lived agent CLI processes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP/SSE server and every background subsystem.
    Serve,
    /// Garbage collection dry run: list containers that would be removed.
    GcPreview,
    /// Garbage collection sweep: remove orphaned/expired containers now.
    GcSweep,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => runtime.block_on(cmd_serve()),
        Command::GcPreview => runtime.block_on(cmd_gc_preview()),
        Command::GcSweep => runtime.block_on(cmd_gc_sweep()),
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug { tracing_subscriber::EnvFilter::new("debug") } else { tracing_subscriber::EnvFilter::new("info") };
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();
}

/// Holds every long-lived subsystem, wired once at startup and shared by
/// `serve`/`gc` commands alike.
struct App {
    config: Arc<Config>,
    tasks: Arc<TaskManager>,
    batches: Arc<BatchScheduler>,
    webhooks: Arc<WebhookStore>,
    cron: Arc<CronScheduler>,
    channels: Arc<ChannelSessionStore>,
    pool: Arc<ContainerPool>,
    gc: Arc<GarbageCollector>,
}

/// Caches the Session Manager's live container ids so the Garbage
/// Collector's synchronous [`SessionLookup::owns`] callback never blocks
/// on the database; refreshed by a background task.
struct CachedSessionLookup {
    live: ArcSwap<HashSet<String>>,
}

impl SessionLookup for CachedSessionLookup {
    fn owns(&self, session_id: &str) -> bool {
        self.live.load().contains(session_id)
    }
}

async fn build_app(config: Config) -> anyhow::Result<App> {
    let config = Arc::new(config);
    let pool = db::connect(&config.sqlite_path()).await.context("failed to open database")?;
    let secrets = SecretBox::new(&config.encryption_key);
    let adapters = global_registry();

    let engine: Arc<dyn ContainerEngineDyn> = match config.container.engine {
        ContainerEngineKind::Docker => Arc::new(DockerEngine::connect().context("failed to connect to docker")?),
        ContainerEngineKind::Noop => Arc::new(NoopEngine::new()),
    };

    let workspace_base = config.data_dir.join("workspaces");
    let sessions = Arc::new(SessionManager::new(pool.clone(), engine.clone(), adapters.clone(), workspace_base));

    let task_store = Arc::new(TaskStore::new(pool.clone()));
    let agent_configs = Arc::new(AgentConfigStore::new(pool.clone()));
    let tasks = TaskManager::new(task_store, agent_configs, sessions.clone(), adapters, config.task_manager.max_concurrent_tasks);

    let webhooks = Arc::new(WebhookStore::new(pool.clone(), secrets));
    let notifier = Arc::new(WebhookNotifier::new(webhooks.clone()).context("failed to build webhook notifier")?);
    tasks.set_webhook_notifier(Arc::new(notifier)).await;

    let batch_store = Arc::new(BatchStore::new(pool.clone()));
    let batches = BatchScheduler::new(batch_store, tasks.clone());

    let cron_store = Arc::new(CronStore::new(pool.clone()));
    let cron = CronScheduler::new(cron_store, tasks.clone(), config.cron.poll_interval);

    let channel_store = Arc::new(ChannelStore::new(pool.clone()));
    let channels = ChannelSessionStore::new(channel_store, tasks.clone(), config.channel_session.ttl);

    let pool_config =
        PoolConfig { max_per_key: config.pool.max_idle_per_key, max_total: config.pool.max_idle_per_key * 4, idle_timeout: config.pool.idle_ttl };
    let container_pool = Arc::new(ContainerPool::new(engine.clone(), pool_config));

    let session_lookup = Arc::new(CachedSessionLookup { live: ArcSwap::from_pointee(HashSet::new()) });
    spawn_session_lookup_refresher(sessions, session_lookup.clone(), config.gc.sweep_interval);

    // `config::GcConfig` is the operator-facing env-driven shape;
    // `container::gc::GcConfig` is what the sweep loop itself consumes.
    let gc_config = agentbox::container::gc::GcConfig {
        container_ttl: config.gc.max_container_age,
        exited_idle_timeout: config.gc.max_stopped_age,
        sweep_interval: config.gc.sweep_interval,
        ..Default::default()
    };
    let gc = Arc::new(GarbageCollector::new(engine.clone(), session_lookup as Arc<dyn SessionLookup>, gc_config));

    Ok(App { config, tasks, batches, webhooks, cron, channels, pool: container_pool, gc })
}

/// Refreshes `lookup`'s live container-id cache from the Session Manager
/// on the same cadence as the Garbage Collector's sweep, so `owns` never
/// serves data older than one sweep interval.
fn spawn_session_lookup_refresher(sessions: Arc<SessionManager>, lookup: Arc<CachedSessionLookup>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match sessions.list_container_ids().await {
                Ok(ids) => lookup.live.store(Arc::new(ids.into_iter().collect())),
                Err(err) => tracing::warn!(error = %err, "failed to refresh session lookup cache"),
            }
        }
    });
}

async fn cmd_serve() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let app = build_app(config).await?;

    // Restart recovery (spec §4.6/§4.7): tasks and batch-tasks left
    // `running` when the process last exited are reset and re-enqueued
    // before anything starts accepting new work.
    let recovered_tasks = app.tasks.recover().await.context("task recovery failed")?;
    let recovered_batches = app.batches.recover().await.context("batch recovery failed")?;
    tracing::info!(recovered_tasks, recovered_batches, "startup recovery complete");

    app.tasks.spawn_workers();
    let cron_handle = app.cron.clone().spawn();
    let sweeper_handle = app.channels.clone().spawn_sweeper();
    app.gc.clone().run_once_at_startup().await;

    let mut shutdown = Shutdown::new();
    let gc_token = shutdown.subscribe();
    spawn_gc_loop(app.gc.clone(), app.pool.clone(), gc_token);

    let state = Arc::new(ApiState {
        tasks: app.tasks.clone(),
        batches: app.batches.clone(),
        webhooks: app.webhooks.clone(),
        cron: app.cron.clone(),
        channels: app.channels.clone(),
        config: app.config.clone(),
        started_at: Instant::now(),
    });

    let bind_addr: std::net::SocketAddr = app.config.bind_addr.parse().context("invalid AGENTBOX_BIND_ADDR")?;
    let listener = tokio::net::TcpListener::bind(bind_addr).await.context("failed to bind HTTP listener")?;
    tracing::info!(%bind_addr, "agentbox listening");

    let (http_shutdown_tx, mut http_shutdown_rx) = tokio::sync::watch::channel(false);
    let router = api::router(state);
    let server_handle = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown_rx.changed().await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    // Reverse-dependency-order stop (spec §5): stop order is HTTP server,
    // Task Manager, Batch Scheduler, Cron Scheduler, Garbage Collector /
    // Container Pool sweeper (exits as soon as `run` broadcasts, via
    // `gc_token` above), then the channel session sweeper last. Hooks run
    // in reverse of registration order, so register in the opposite
    // sequence.
    shutdown.register("channel session sweeper", {
        let channels = app.channels.clone();
        move || async move {
            channels.stop();
            let _ = sweeper_handle.await;
        }
    });
    shutdown.register("cron scheduler", {
        let cron = app.cron.clone();
        move || async move { cron.stop().await }
    });
    shutdown.register("batch scheduler", {
        let batches = app.batches.clone();
        move || async move { batches.stop().await }
    });
    shutdown.register("task manager", {
        let tasks = app.tasks.clone();
        move || async move { tasks.stop().await }
    });
    shutdown.register("http server", move || async move {
        let _ = http_shutdown_tx.send(true);
        let _ = server_handle.await;
    });

    wait_for_signal().await;
    tracing::info!("shutdown signal received");
    shutdown.run().await;
    let _ = cron_handle;
    Ok(())
}

/// Periodically sweeps expired idle containers (Container Pool) and
/// orphaned/aged containers (Garbage Collector), refreshing the GC's live
/// session-id cache from the Session Manager first.
fn spawn_gc_loop(gc: Arc<GarbageCollector>, pool: Arc<ContainerPool>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(gc.config().sweep_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let removed = pool.sweep_idle().await;
                    if removed > 0 {
                        tracing::info!(removed, "pool: swept idle containers");
                    }
                    if let Err(err) = gc.sweep().await {
                        tracing::warn!(error = %err, "gc: sweep failed");
                    }
                }
            }
        }
    });
}

async fn cmd_gc_preview() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let app = build_app(config).await?;
    let candidates = app.gc.preview().await.context("gc preview failed")?;
    for candidate in candidates {
        println!("{} reason={:?}", candidate.container_id, candidate.reason);
    }
    Ok(())
}

async fn cmd_gc_sweep() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let app = build_app(config).await?;
    let removed = app.gc.sweep().await.context("gc sweep failed")?;
    println!("removed {} containers", removed.len());
    Ok(())
}
