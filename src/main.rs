use anyhow::Result;
use autoreel::activity::ActivityMonitor;
use autoreel::automation::{AutomationEngine, EngineOptions};
use autoreel::handlers::{self, Console};
use autoreel::queue::WorkQueue;
use autoreel::scheduler::Scheduler;
use autoreel::service::GenerationClient;
use autoreel::store::ProjectStore;
use autoreel::{config, db};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.resolved_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let queue = WorkQueue::new(pool);
    queue.requeue_stale().await?;

    let client = GenerationClient::from_config(&cfg)?;
    let engine = Arc::new(AutomationEngine::new(
        Arc::new(client),
        ProjectStore::new(),
        EngineOptions::from_config(&cfg),
    ));
    let monitor = Arc::new(ActivityMonitor::new(
        cfg.scheduler.idle_threshold(),
        cfg.scheduler.tick_interval(),
    ));

    let shutdown = CancellationToken::new();
    let ticker = monitor.spawn_ticker(shutdown.clone());

    // Narrate ledger progress.
    let mut ledger_rx = engine.subscribe();
    let progress_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut last = String::new();
        loop {
            tokio::select! {
                _ = progress_shutdown.cancelled() => break,
                res = ledger_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    let (progress, action) = {
                        let run = ledger_rx.borrow_and_update();
                        (run.progress(), run.current_action.clone())
                    };
                    if action != last {
                        info!(progress, %action, "progress");
                        last = action;
                    }
                }
            }
        }
    });

    let scheduler_task = if cfg.scheduler.enabled {
        let scheduler = Scheduler::new(Arc::clone(&engine), Arc::clone(&monitor), queue.clone());
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = scheduler.run(token).await {
                error!(?err, "scheduler stopped with error");
            }
        }))
    } else {
        info!("scheduler disabled");
        None
    };

    let console = Console {
        engine: Arc::clone(&engine),
        monitor,
        queue,
    };

    info!("autoreel ready; type /help");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match handlers::handle_line(&console, &line).await {
                        Ok(reply) if reply.is_empty() => {}
                        Ok(reply) => println!("{reply}"),
                        Err(err) => {
                            error!(?err, "failed to handle input");
                            println!("error: {err:#}");
                        }
                    },
                    Ok(None) => {
                        // stdin closed; keep serving the queue until interrupted.
                        tokio::signal::ctrl_c().await?;
                        break;
                    }
                    Err(err) => {
                        error!(?err, "failed to read stdin");
                        break;
                    }
                }
            }
        }
    }

    // Stop the scheduler before the engine so an interrupted item stays
    // `processing` and is requeued on the next start.
    shutdown.cancel();
    if let Some(task) = scheduler_task {
        let _ = task.await;
    }
    engine.cancel();
    let _ = ticker.await;
    info!("shutdown complete");
    Ok(())
}
