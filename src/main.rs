use distributed_ops::config::{QueueConfig, Settings};
use distributed_ops::executor::client::HttpQueueClient;
use distributed_ops::executor::executor::PollingExecutor;
use distributed_ops::executor::handlers::router;
use distributed_ops::executor::queue::ExecutionQueue;
use distributed_ops::executor::registry::JobRegistry;
use distributed_ops::executor::runner::{BatchPoller, LocalBatchExecutor};
use distributed_ops::executor::session::ExecutorSessionRegistry;
use distributed_ops::iocost::StorageIoTracker;
use distributed_ops::ops::{ExecutionContext, JobId, OpsReader};
use distributed_ops::storage::{LocalFileStorage, StorageId, StorageRegistry};

use anyhow::{Context, anyhow, bail};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Args {
    mode: String,
    bind: Option<SocketAddr>,
    server: Option<String>,
    base_dir: Option<PathBuf>,
    storages: Vec<(StorageId, PathBuf)>,
    threads: Option<usize>,
    ops_file: Option<PathBuf>,
    job: String,
    settings: Settings,
}

fn usage(program: &str) {
    eprintln!("Usage: {} --mode <server|executor|run> [--config <settings.json>] [options]", program);
    eprintln!("Example: {} --mode server --bind 127.0.0.1:6000 --base-dir /var/lib/ops", program);
    eprintln!(
        "Example: {} --mode executor --server 127.0.0.1:6000 --storage local=/data --threads 8",
        program
    );
    eprintln!(
        "Example: {} --mode run --ops-file ops.txt --job copy-1 --storage src=/in --storage dst=/out",
        program
    );
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let mut parsed = Args {
        mode: String::new(),
        bind: None,
        server: None,
        base_dir: None,
        storages: Vec::new(),
        threads: None,
        ops_file: None,
        job: "default".to_string(),
        settings: Settings::default(),
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = || args.get(i + 1).cloned().ok_or_else(|| anyhow!("{} needs a value", flag));
        match flag {
            "--mode" => parsed.mode = value()?,
            "--bind" => parsed.bind = Some(value()?.parse().context("--bind")?),
            "--server" => parsed.server = Some(value()?),
            "--base-dir" => parsed.base_dir = Some(PathBuf::from(value()?)),
            "--threads" => parsed.threads = Some(value()?.parse().context("--threads")?),
            "--ops-file" => parsed.ops_file = Some(PathBuf::from(value()?)),
            "--job" => parsed.job = value()?,
            "--config" => parsed.settings = Settings::load(&PathBuf::from(value()?))?,
            "--storage" => {
                let arg = value()?;
                let (id, root) = arg
                    .split_once('=')
                    .ok_or_else(|| anyhow!("--storage expects <id>=<path>, got {}", arg))?;
                parsed.storages.push((StorageId::new(id), PathBuf::from(root)));
            }
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    Ok(parsed)
}

fn storage_registry(storages: &[(StorageId, PathBuf)]) -> Arc<StorageRegistry> {
    let registry = StorageRegistry::new();
    for (id, root) in storages {
        tracing::info!("Storage {} -> {}", id, root.display());
        registry.register(id.clone(), Arc::new(LocalFileStorage::new(root)));
    }
    registry
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, shutting down");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let program = argv.first().cloned().unwrap_or_else(|| "distributed-ops".to_string());
    let args = parse_args(&argv)?;

    match args.mode.as_str() {
        "server" => run_server(args).await,
        "executor" => run_executor(args).await,
        "run" => run_local(args).await,
        _ => {
            usage(&program);
            std::process::exit(1);
        }
    }
}

/// Job registry, session registry and the HTTP API.
async fn run_server(args: Args) -> anyhow::Result<()> {
    let bind = args.bind.ok_or_else(|| anyhow!("--bind is required in server mode"))?;
    let settings = args.settings;
    let flush_interval = settings.persist.flush_interval.max(std::time::Duration::from_secs(1));

    let jobs = match &args.base_dir {
        Some(dir) => {
            tracing::info!("Persisting job queues under {}", dir.display());
            let jobs = JobRegistry::with_persistence(
                settings.queue.clone(),
                Arc::new(LocalFileStorage::new(dir)),
                "/",
                settings.persist.clone(),
            );
            let recovered = jobs.recover_jobs()?;
            for job_id in recovered {
                tracing::info!("  - recovered job {}", job_id);
            }
            jobs
        }
        None => {
            tracing::info!("Job queues are in memory only");
            JobRegistry::new(settings.queue.clone())
        }
    };
    let sessions = ExecutorSessionRegistry::new(jobs.clone(), settings.session.clone());

    let cancel = cancel_on_ctrl_c();
    let liveness = sessions.clone().spawn_liveness_check(cancel.clone());

    // Periodic flush and checkpoint of persisted jobs
    let flush_jobs = jobs.clone();
    let flush_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(flush_interval);
        loop {
            tokio::select! {
                _ = flush_cancel.cancelled() => break,
                _ = interval.tick() => flush_jobs.flush_all(),
            }
        }
    });

    // Stats reporter
    let stats_jobs = jobs.clone();
    let stats_sessions = sessions.clone();
    let stats_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = stats_cancel.cancelled() => break,
                _ = interval.tick() => {
                    let sessions = stats_sessions.sessions();
                    tracing::info!("Server stats: {} executor sessions", sessions.len());
                    for stats in stats_jobs.stats() {
                        let q = &stats.queue;
                        tracing::info!(
                            "  - job {} queued={} running={} done={} error={} polling={}",
                            q.job_id,
                            q.queued,
                            q.running,
                            q.done_total,
                            q.error,
                            stats.polling_active
                        );
                    }
                }
            }
        }
    });

    let app = router(jobs.clone(), sessions);
    tracing::info!("HTTP server listening on {}", bind);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(bind).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    cancel.cancel();
    if let Err(e) = liveness.await {
        tracing::warn!("Liveness check ended abnormally: {}", e);
    }
    jobs.flush_all();
    tracing::info!("Server stopped");
    Ok(())
}

/// Remote executor polling a server.
async fn run_executor(args: Args) -> anyhow::Result<()> {
    let server = args
        .server
        .ok_or_else(|| anyhow!("--server is required in executor mode"))?;
    if args.storages.is_empty() {
        tracing::warn!("No --storage given; only mock operations can succeed");
    }
    let mut config = args.settings.executor;
    if let Some(threads) = args.threads {
        config.thread_count = threads.max(1);
    }

    let ctx = ExecutionContext::from_config(storage_registry(&args.storages), &config);
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let executor = PollingExecutor::new(HttpQueueClient::new(&server), ctx, config, host);
    tracing::info!("Executor session {} polling {}", executor.session_id(), server);

    let reason = executor.run(cancel_on_ctrl_c()).await?;
    tracing::info!("Executor exited: {:?}", reason);
    Ok(())
}

/// Executes an ops file in-process with the batch poller.
async fn run_local(args: Args) -> anyhow::Result<()> {
    let ops_file = args
        .ops_file
        .ok_or_else(|| anyhow!("--ops-file is required in run mode"))?;
    let text = std::fs::read_to_string(&ops_file).with_context(|| format!("reading {}", ops_file.display()))?;
    let job_id = JobId::new(args.job);

    let mut ops = Vec::new();
    for record in OpsReader::new(&text, job_id.clone()) {
        match record {
            Ok(op) => ops.push(op),
            Err(e) => tracing::warn!("Skipping malformed operation: {}", e),
        }
    }
    if ops.is_empty() {
        bail!("{} contains no valid operations", ops_file.display());
    }

    let mut config = args.settings.executor;
    if let Some(threads) = args.threads {
        config.thread_count = threads.max(1);
    }
    let queue = ExecutionQueue::new(job_id.clone(), QueueConfig { keep_done_ops: false });
    queue.add_ops(ops)?;

    let tracker = StorageIoTracker::new();
    let ctx = ExecutionContext::from_config(storage_registry(&args.storages), &config);
    let executor = LocalBatchExecutor::with_tracker(ctx, config.thread_count, tracker.clone());
    let poller = BatchPoller::new(queue.clone(), executor, args.settings.batch);

    let summary = poller.run(cancel_on_ctrl_c()).await;

    let stats = queue.stats();
    tracing::info!(
        "Job {}: {} batches, done={} error={} queued={}",
        job_id,
        summary.batches,
        stats.done_total,
        stats.error,
        stats.queued
    );
    for (op, message) in queue.error_ops() {
        tracing::warn!("  - task {} ({}) failed: {}", op.task_id, op.kind_name(), message);
    }
    for storage in tracker.snapshot() {
        tracing::info!(
            "  - storage {}: read {} B, wrote {} B, {} calls, {:.0} B/s read, {:.0} B/s write",
            storage.storage_id,
            storage.total.io_read_len,
            storage.total.io_write_len,
            storage.total.call_count,
            storage.read_bytes_per_sec,
            storage.write_bytes_per_sec
        );
    }
    if stats.error > 0 {
        bail!("{} operations failed", stats.error);
    }
    Ok(())
}
