//! Uniterd daemon entry point.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::signal;

use uniterd::clock::WallClock;
use uniterd::config::Config;
use uniterd::network::resolver::NetworkInfo;
use uniterd::remotestate::{Snapshot, Tracker};
use uniterd::state::{MemoryModel, ModelSeed, State};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting uniterd with config: {:?}", cfg);
    let unit = cfg.unit_id()?;

    // Model
    let model = match &cfg.model_file {
        Some(path) => MemoryModel::from_seed(ModelSeed::load(path)?)?,
        None => {
            warn!("No model_file configured; starting with an empty model");
            MemoryModel::new()
        }
    };
    let state: Arc<dyn State> = Arc::new(model);

    // Remote-state tracker
    let mut tracker = Tracker::with_config(Arc::clone(&state), unit.clone(), Arc::new(WallClock), cfg.tracker());
    let network = NetworkInfo::new(Arc::clone(&state), unit, Some(cfg.retry_factory()))
        .with_egress_subnets(cfg.egress()?)
        .with_abort(tracker.abort_token());

    loop {
        let change = tokio::select! {
            res = signal::ctrl_c() => {
                match res {
                    Ok(()) => info!("Received Ctrl+C, shutting down..."),
                    Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                }
                break;
            }
            change = tracker.changes().recv() => change,
        };
        if change.is_none() {
            info!("Tracker stopped");
            break;
        }
        let snapshot = tracker.snapshot();
        report(&snapshot);
        resolve_networks(&*state, &network, &snapshot, cfg.poll_public).await;
    }

    tracker.stop();
    if let Err(e) = tracker.wait().await {
        error!("Tracker failed: {}", e);
    }

    info!("Shutdown complete.");
    Ok(())
}

fn report(snapshot: &Snapshot) {
    info!(
        "life={:?} resolved={:?} charm={} leader={} relations={} storage={}",
        snapshot.life,
        snapshot.resolved,
        snapshot.charm_url.as_deref().unwrap_or("-"),
        snapshot.leader,
        snapshot.relations.len(),
        snapshot.storage.len()
    );
    debug!("snapshot: {:?}", snapshot);
}

async fn resolve_networks(state: &dyn State, network: &NetworkInfo, snapshot: &Snapshot, poll_public: bool) {
    for id in snapshot.relations.keys() {
        let relation = match state.relation(*id).await {
            Ok(relation) => relation,
            Err(e) => {
                warn!("relation {}: {}", id, e);
                continue;
            }
        };
        let Some(endpoint) = relation.endpoint(network.unit().application()) else {
            continue;
        };
        match network
            .networks_for_relation(&endpoint.name, &relation, poll_public)
            .await
        {
            Ok(nets) => info!(
                "relation {}: space {} ingress {:?} egress {:?}",
                relation.key(),
                nets.space,
                nets.ingress.iter().map(ToString::to_string).collect::<Vec<_>>(),
                nets.egress.iter().map(ToString::to_string).collect::<Vec<_>>()
            ),
            Err(e) => warn!("relation {}: {}", relation.key(), e),
        }
    }
}
