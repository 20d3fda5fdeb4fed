mod acquire;
mod bencode;
mod config;
mod dedup;
mod fetch;
mod info;
mod ingest;
mod model;
mod publish;
mod stats;
mod swarm;
mod web;
mod wire;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::acquire::Acquirer;
use crate::config::Config;
use crate::dedup::BloomMembership;
use crate::fetch::{DirectProbe, FetchTimeouts};
use crate::model::HashEvent;
use crate::publish::Publisher;
use crate::stats::Stats;
use crate::swarm::SwarmFetch;

const DEDUP_SNAPSHOT: &str = "dedup.bloom";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = Arc::new(Config::load()?);
    std::fs::create_dir_all(&cfg.data_dir).context("create data dir")?;

    let dedup_path = cfg.data_dir.join(DEDUP_SNAPSHOT);
    let membership = Arc::new(BloomMembership::load(
        &dedup_path,
        cfg.dedup_enabled,
        cfg.dedup_bits_pow2,
        cfg.dedup_k,
    ));
    let stats = Arc::new(Stats::default());
    let publisher = Arc::new(
        Publisher::open(&cfg.data_dir)
            .await
            .context("open result sinks")?,
    );

    let direct = DirectProbe::new(FetchTimeouts {
        connect: Duration::from_millis(cfg.direct_connect_timeout_ms),
        read: Duration::from_millis(cfg.direct_read_timeout_ms),
    });
    let swarm = SwarmFetch::new(cfg.clone());
    let acquirer = Arc::new(Acquirer::new(
        cfg.clone(),
        direct,
        swarm,
        membership.clone(),
        stats.clone(),
    ));

    let (events_tx, events_rx) = mpsc::channel::<HashEvent>(cfg.queue_depth.max(1));

    // Feed: one info-hash per line, optionally with a peer hint.
    tokio::spawn(ingest::run(cfg.clone(), events_tx));

    // Observability: /healthz and /stats.
    let addr = cfg.http_addr;
    let web_state = web::WebState {
        stats: stats.clone(),
    };
    tokio::spawn(async move {
        if let Err(err) = web::serve(web_state, addr).await {
            tracing::error!(%err, "web server exited");
        }
    });

    // Resolution pipeline: fan events out to acquisition tasks, publish each
    // terminal result.
    let pipeline = tokio::spawn(run_pipeline(
        cfg.clone(),
        events_rx,
        acquirer,
        publisher,
        stats,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
        _ = pipeline => tracing::info!("hash feed drained"),
    }

    // In-flight fetches are dropped; finished work stays remembered through
    // the dedup snapshot.
    if let Err(err) = membership.save(&dedup_path) {
        tracing::warn!(%err, path = %dedup_path.display(), "dedup snapshot not saved");
    }
    Ok(())
}

/// Pulls discovery events off the queue and resolves each on its own task,
/// capped so a flooding feed backs up the channel instead of spawning
/// without bound.
async fn run_pipeline(
    cfg: Arc<Config>,
    mut events: mpsc::Receiver<HashEvent>,
    acquirer: Arc<Acquirer<DirectProbe, SwarmFetch, BloomMembership>>,
    publisher: Arc<Publisher>,
    stats: Arc<Stats>,
) {
    let max_tasks = (cfg.direct_pool_size + cfg.swarm_pool_size).max(1);
    let mut tasks = JoinSet::new();
    while let Some(event) = events.recv().await {
        while tasks.len() >= max_tasks {
            let _ = tasks.join_next().await;
        }
        let acquirer = acquirer.clone();
        let publisher = publisher.clone();
        let stats = stats.clone();
        tasks.spawn(async move {
            stats.begin();
            let result = acquirer.acquire(event).await;
            if let Err(err) = publisher.publish(&result).await {
                tracing::warn!(%err, hash = %result.hash, "publish failed");
            }
            stats.end();
        });
    }
    while tasks.join_next().await.is_some() {}
}
