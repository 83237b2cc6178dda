use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use im2_events::{EventBus, InMemoryEventBus, PipelineEvent};
use im2_infra::workers::{
    CommandStageWorker, StageExecutor, StageExecutorConfig, StageWorker, spawn_detector_loop, spawn_router_loop,
    spawn_sweeper_loop,
};
use im2_infra::{
    AdminService, EventSink, FanoutSink, InMemoryJobStore, InMemoryLockManager, IntakeWatcher, JobRegistrar,
    JobStore, LockManager, OrchestratorConfig, PauseGate, PipelineQuery, PostgresJobStore, PostgresLockManager,
    RecoverySweeper, StabilityDetector, StageRouter,
};

fn main() -> anyhow::Result<()> {
    im2_observability::init();

    let config = OrchestratorConfig::from_env().context("invalid configuration")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    for dir in [
        &config.intake_root,
        &config.staging_root,
        &config.output_root,
        &config.quarantine_root,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let (store, locks) = backends(&runtime, &config)?;
    let events = event_sink(&config);
    let pause = Arc::new(PauseGate::new());

    let router = Arc::new(StageRouter::new(
        store.clone(),
        locks,
        pause.clone(),
        config.handoff_area(),
        events.clone(),
        config.router_settings(),
    ));
    let registrar = Arc::new(JobRegistrar::new(store.clone(), events.clone()));
    let detector = Arc::new(Mutex::new(StabilityDetector::new(config.detector_settings())));
    let sweeper = Arc::new(
        RecoverySweeper::new(router.clone(), registrar.clone(), config.sweeper_settings())
            .with_detector(detector.clone()),
    );
    let admin = AdminService::new(
        router.clone(),
        PipelineQuery::new(store.clone(), pause, config.stuck_threshold).with_locks(router.locks().clone()),
    );

    let report = sweeper.run_once();
    info!(?report, "startup reconciliation finished");

    let watcher = IntakeWatcher::start(&config.intake_root).context("failed to watch intake root")?;
    let loops = vec![
        spawn_detector_loop(watcher, detector, registrar, events, config.detector_poll),
        spawn_router_loop(router.clone(), config.detector_poll),
        spawn_sweeper_loop(sweeper),
    ];

    let mut executors = Vec::new();
    for (stage, line) in &config.stage_commands {
        let Some(command) = CommandStageWorker::from_command_line(line) else {
            warn!(stage = %stage, "empty stage command; stage has no workers");
            continue;
        };
        let handler: Arc<dyn StageWorker> = Arc::new(command);
        for n in 0..config.workers_per_stage.max(1) {
            let exec_config = StageExecutorConfig::new(*stage).with_name(format!("stage-{stage}-{n}"));
            executors.push(StageExecutor::new(router.clone(), handler.clone(), exec_config).spawn());
        }
    }
    info!(
        executors = executors.len(),
        intake = %config.intake_root.display(),
        "orchestrator running"
    );

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for shutdown signal")?;

    info!("shutdown requested; draining in-flight attempts");
    admin.pause();
    for executor in executors {
        executor.shutdown();
    }
    for handle in loops {
        handle.shutdown();
    }

    if let Some(path) = &config.checkpoint_path {
        let summary = admin.checkpoint(path)?;
        info!(jobs = summary.jobs, path = %path.display(), "final checkpoint written");
    }
    if let Ok(stats) = admin.query().stats() {
        info!(
            total = stats.total,
            active = stats.active,
            stuck = stats.stuck,
            "orchestrator stopped"
        );
    }
    Ok(())
}

/// Postgres when `DATABASE_URL` is set, in-memory otherwise.
fn backends(
    runtime: &Runtime,
    config: &OrchestratorConfig,
) -> anyhow::Result<(Arc<dyn JobStore>, Arc<dyn LockManager>)> {
    let Some(url) = &config.database_url else {
        warn!("DATABASE_URL not set; job state lives in memory and is lost on exit");
        let store: Arc<dyn JobStore> = InMemoryJobStore::arc();
        let locks: Arc<dyn LockManager> = Arc::new(InMemoryLockManager::new());
        return Ok((store, locks));
    };

    let pool = runtime
        .block_on(PgPoolOptions::new().max_connections(10).connect(url))
        .context("failed to connect to Postgres")?;
    let store = PostgresJobStore::new(pool.clone(), runtime.handle().clone());
    runtime.block_on(store.ensure_schema())?;

    // Fencing tokens must keep increasing across restarts.
    let floor = store.max_fence()?;
    let locks = PostgresLockManager::new(pool, runtime.handle().clone());
    runtime.block_on(locks.ensure_schema(floor))?;
    info!(fence_floor = %floor, "connected to Postgres");

    let store: Arc<dyn JobStore> = Arc::new(store);
    let locks: Arc<dyn LockManager> = Arc::new(locks);
    Ok((store, locks))
}

/// In-process bus (mirrored to the debug log), plus Redis when configured.
fn event_sink(config: &OrchestratorConfig) -> Arc<dyn EventSink> {
    let bus = Arc::new(InMemoryEventBus::<PipelineEvent>::new());
    let subscription = bus.subscribe();
    thread::Builder::new()
        .name("event-log".into())
        .spawn(move || {
            while let Ok(event) = subscription.recv() {
                debug!(
                    job_id = ?event.job_id,
                    state = ?event.state,
                    kind = ?event.kind,
                    "pipeline event"
                );
            }
        })
        .expect("failed to spawn event log thread");

    #[allow(unused_mut)]
    let mut sink = FanoutSink::new().with(bus);

    #[cfg(feature = "redis")]
    if let Some(url) = &config.redis_url {
        match im2_infra::event_bus::RedisPubSubEventBus::new(url, "im2") {
            Ok(redis) => sink = sink.with(Arc::new(redis)),
            Err(err) => warn!(error = %err, "redis event publication disabled"),
        }
    }
    #[cfg(not(feature = "redis"))]
    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but this build has no redis support");
    }

    Arc::new(sink)
}
