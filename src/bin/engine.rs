//! The operator CLI: `engine --config <path>` starts one worker per
//! configured (or registered) market and shuts down cooperatively on
//! `SIGINT` (§6, §10.4).

use std::path::PathBuf;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

use iu_matching_engine::config::Config;
use iu_matching_engine::model::Pair;
use iu_matching_engine::persistence;
use iu_matching_engine::worker::PairWorker;

#[derive(Parser, Debug)]
#[command(name = "engine", about = "Order book matching engine")]
struct Args {
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let pool = PgPoolOptions::new().max_connections(16).connect(&config.database_url).await?;

    let pairs: Vec<Pair> = match &config.markets {
        Some(selectors) => {
            selectors.iter().map(|s| Pair::new(s.base.clone(), s.quote.clone())).collect()
        }
        None => persistence::list_markets(&pool).await?.iter().map(|m| m.pair()).collect(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for pair in pairs {
        let pool = pool.clone();
        let queue_url = config.queue_url.clone();
        let bus_url = config.bus_url.clone();
        let worker_config = config.worker.clone();
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            match PairWorker::start(pool, &queue_url, &bus_url, pair.clone(), worker_config).await {
                Ok(Some(mut worker)) => worker.run(shutdown_rx).await,
                Ok(None) => {}
                Err(e) => log::error!(target: "engine", "worker for {} failed to start: {}", pair, e),
            }
        }));
    }

    log::info!(target: "engine", "engine running with {} worker(s)", handles.len());
    tokio::signal::ctrl_c().await?;
    log::info!(target: "engine", "SIGINT received, shutting down cooperatively");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
