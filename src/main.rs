//! Settlement Server
//!
//! Settles skate challenges and spot bounties

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use skate_settlement::auth::StoreAuth;
use skate_settlement::events::{ClipStatusObserver, ObserverHub};
use skate_settlement::notify::{LogSink, NotificationDispatcher};
use skate_settlement::reputation::ReputationService;
use skate_settlement::server::{run_server, AppState};
use skate_settlement::store::DocumentStore;
use skate_settlement::video::{FfprobeProbe, LocalBlobStore};
use skate_settlement::{
    BountyEngine, ChallengeEngine, Config, MemoryStore, RateLimiter, SqliteStore, VideoPipeline,
};

const SWEEP_INTERVAL_SECS: u64 = 3600; // hourly

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Settlement Server");

    let config = Config::load()?;

    // SQLite by default; SETTLEMENT_DB=memory for throwaway runs.
    let store: Arc<dyn DocumentStore> = match std::env::var("SETTLEMENT_DB").as_deref() {
        Ok("memory") => Arc::new(MemoryStore::new()),
        Ok(path) => Arc::new(SqliteStore::open(path)?),
        Err(_) => Arc::new(SqliteStore::open("settlement.db")?),
    };
    info!("document store initialized");

    let notifier = Arc::new(NotificationDispatcher::new().with_sink(Arc::new(LogSink)));
    let limiter = Arc::new(RateLimiter::new(store.clone(), config.limits.clone()));
    let challenges = Arc::new(ChallengeEngine::new(
        store.clone(),
        limiter.clone(),
        notifier.clone(),
        config.policy.clone(),
        config.video.clone(),
    ));
    let bounties = Arc::new(BountyEngine::new(
        store.clone(),
        limiter.clone(),
        notifier.clone(),
        config.policy.clone(),
    ));

    let blob_root = std::env::var("SETTLEMENT_BLOB_ROOT").unwrap_or_else(|_| "blobs".to_string());
    let pipeline = Arc::new(VideoPipeline::new(
        store.clone(),
        Arc::new(LocalBlobStore::new(blob_root)),
        Arc::new(FfprobeProbe),
        notifier.clone(),
        config.video.clone(),
    ));

    let hub = Arc::new(
        ObserverHub::new().with_observer(Arc::new(ClipStatusObserver::new(challenges.clone()))),
    );

    let state = Arc::new(AppState {
        store: store.clone(),
        challenges: challenges.clone(),
        bounties: bounties.clone(),
        pipeline: pipeline.clone(),
        limiter: limiter.clone(),
        reputation: Arc::new(ReputationService::new(store.clone(), config.policy.clone())),
        auth: Arc::new(StoreAuth::new(store.clone())),
        hub,
        started_at: std::time::Instant::now(),
    });

    // Background sweeps: expiry, due settlements, counter and record cleanup.
    {
        let bounties = bounties.clone();
        let challenges = challenges.clone();
        let limiter = limiter.clone();
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;

            let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                if let Err(e) = bounties.expire_bounties().await {
                    error!("bounty expiry sweep failed: {}", e);
                }
                if let Err(e) = challenges.settle_due_challenges().await {
                    error!("challenge settlement sweep failed: {}", e);
                }
                if let Err(e) = limiter.sweep_stale().await {
                    error!("rate limit counter sweep failed: {}", e);
                }
                if let Err(e) = pipeline.sweep_processed_records().await {
                    error!("processed record sweep failed: {}", e);
                }
            }
        });
    }
    info!("background sweeps started (every {} seconds)", SWEEP_INTERVAL_SECS);

    let host = config.server.host.clone();
    let port = config.server.port;
    run_server(&host, port, state).await?;

    Ok(())
}
