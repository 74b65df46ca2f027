mod logging;
mod routes;

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use quill_agent::{OpenAiCompatClient, Sampling, Worker};
use quill_core::{
    config::Config,
    dispatch::{Invocation, JobDispatcher},
    history::ExecutionHistory,
    jobs::JobRegistry,
    queue::TaskQueue,
    redact::PatternRedactor,
    runner::ProcessRunner,
    store::TaskStore,
    webhook::WebhookRouter,
};
use tracing::{error, info, warn};

use crate::logging::LogHub;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub queue: TaskQueue,
    pub dispatcher: JobDispatcher,
    pub webhooks: Arc<WebhookRouter>,
    pub(crate) logs: LogHub,
    pub start_time: Instant,
    pub stale_task_minutes: u64,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logs = LogHub::new();
    logging::init(&logs);

    let config = Config::from_env()?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;

    let queue = TaskQueue::open(TaskStore::new(&config.tasks_file)).await;

    let mut registry = JobRegistry::builtin(&config.scripts_dir, &config.script_runtime);
    registry
        .load_file(&config.jobs_file)
        .with_context(|| format!("load job definitions from {}", config.jobs_file.display()))?;
    let registry = Arc::new(registry);
    info!(jobs = registry.len(), "job registry ready");

    let redactor = Arc::new(PatternRedactor::from_env());
    let history = Arc::new(ExecutionHistory::new(&config.history_file, config.history_limit));

    let dispatcher = JobDispatcher::new(
        Arc::clone(&registry),
        ProcessRunner::new(config.runner_config(), redactor.clone()),
        Arc::clone(&history),
    )
    .with_max_concurrent(config.max_concurrent_scripts)
    .with_default_timeout(config.script_timeout());

    // Webhook scripts get their own runner, outside the dispatcher's slots.
    let webhooks = WebhookRouter::new(
        Arc::clone(&registry),
        ProcessRunner::new(config.runner_config(), redactor),
        config.script_timeout(),
    )
    .with_history(history);

    // Scheduled jobs: one tick loop each
    for (spec, interval) in registry.scheduled() {
        let dispatcher = dispatcher.clone();
        let kind = spec.kind;
        let name = spec.name.clone();
        info!(job = %name, interval_s = interval.as_secs(), "scheduling job");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so startup stays quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match dispatcher.run(kind, &name, Invocation::default()).await {
                    Ok(outcome) if !outcome.success => {
                        warn!(job = %name, "scheduled run failed: {}", outcome.message)
                    }
                    Ok(_) => {}
                    Err(e) => warn!(job = %name, "scheduled run skipped: {e}"),
                }
            }
        });
    }

    // Stale task cleanup loop
    {
        let queue = queue.clone();
        let minutes = config.stale_task_minutes;
        let every = std::time::Duration::from_secs(config.cleanup_interval_s.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                match queue.cleanup_stale_tasks(minutes).await {
                    Ok(0) => {}
                    Ok(n) => info!("marked {n} stale task(s) failed"),
                    Err(e) => error!("stale task cleanup error: {e}"),
                }
            }
        });
    }

    // Stage worker
    if config.worker_enabled() {
        let model = OpenAiCompatClient::new(&config.llm_base_url, &config.llm_api_key, &config.llm_model)
            .with_timeout(config.llm_timeout_s);
        let worker = Worker::new(queue.clone(), Arc::new(model))
            .with_sampling(Sampling {
                temperature: config.llm_temperature,
                max_tokens: config.llm_max_tokens,
            })
            .with_role(config.worker_role.clone());
        let poll = std::time::Duration::from_secs(config.worker_poll_s.max(1));
        tokio::spawn(worker.run(poll));
    } else {
        info!("LLM_API_KEY not set, stage worker disabled");
    }

    let state = Arc::new(AppState {
        queue,
        dispatcher,
        webhooks: Arc::new(webhooks),
        logs,
        start_time: Instant::now(),
        stale_task_minutes: config.stale_task_minutes,
    });

    let app = routes::router(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
