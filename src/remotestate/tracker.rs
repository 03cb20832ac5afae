//! The remote-state tracker actor.
//!
//! One task owns every source for the unit and is the only writer of the
//! snapshot.  It applies events in arrival order, publishes the snapshot
//! after each one, and raises the change signal once the burst of ready
//! events has drained.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::select_all;
use futures_util::FutureExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::snapshot::{addresses_hash, config_hash, RelationSnapshot, Snapshot};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::network::AddressInventory;
use crate::state::{Source, State};
use crate::types::{Life, RelationId, RelationUnitsChange, UnitId};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Period of the update-status tick.
    pub update_status_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            update_status_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Handle to a running tracker.
pub struct Tracker {
    snapshot: watch::Receiver<Snapshot>,
    changes: mpsc::Receiver<()>,
    abort: CancellationToken,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Tracker {
    /// Starts tracking `unit`.  Must be called from within a tokio runtime.
    pub fn new(state: Arc<dyn State>, unit: UnitId, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(state, unit, clock, TrackerConfig::default())
    }

    pub fn with_config(state: Arc<dyn State>, unit: UnitId, clock: Arc<dyn Clock>, config: TrackerConfig) -> Self {
        let (published, snapshot) = watch::channel(Snapshot::default());
        let (signal, changes) = mpsc::channel(1);
        let abort = CancellationToken::new();
        let next_update_status = clock.now() + config.update_status_interval;
        let actor = TrackerActor {
            inventory: AddressInventory::new(Arc::clone(&state), unit.clone()),
            state,
            unit,
            clock,
            config,
            abort: abort.clone(),
            snapshot: Snapshot::default(),
            published,
            signal,
            next_update_status,
        };
        let handle = tokio::spawn(actor.run());
        Self {
            snapshot,
            changes,
            abort,
            handle: Some(handle),
        }
    }

    /// The latest snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Signals that the snapshot may have advanced.  Closes when the
    /// tracker stops.
    pub fn changes(&mut self) -> &mut mpsc::Receiver<()> {
        &mut self.changes
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn stop(&self) {
        self.abort.cancel();
    }

    /// Waits for the tracker to finish and returns the first error it hit.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.await.map_err(|e| Error::SourceTerminated {
            source_name: "tracker".into(),
            reason: e.to_string(),
        })?
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}

struct RelationSources {
    id: RelationId,
    units: Source<RelationUnitsChange>,
    notify: Source<()>,
}

/// Sources in subscription order.
struct Sources {
    unit: Source<()>,
    addresses: Source<()>,
    config: Source<()>,
    storage: Source<Vec<String>>,
    application: Source<()>,
    leader_settings: Source<()>,
    relations: Source<Vec<RelationId>>,
    relation: Vec<RelationSources>,
}

enum Event {
    Cancelled,
    UpdateStatus,
    Unit(Option<Result<()>>),
    Addresses(Option<Result<()>>),
    Config(Option<Result<()>>),
    Storage(Option<Result<Vec<String>>>),
    Application(Option<Result<()>>),
    LeaderSettings(Option<Result<()>>),
    Relations(Option<Result<Vec<RelationId>>>),
    RelationUnits(RelationId, Option<Result<RelationUnitsChange>>),
    Relation(RelationId, Option<Result<()>>),
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    /// The unit is dead or gone.
    Dead,
    Cancelled,
}

struct TrackerActor {
    state: Arc<dyn State>,
    inventory: AddressInventory,
    unit: UnitId,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
    abort: CancellationToken,
    snapshot: Snapshot,
    published: watch::Sender<Snapshot>,
    signal: mpsc::Sender<()>,
    next_update_status: Instant,
}

impl TrackerActor {
    async fn run(mut self) -> Result<()> {
        let mut sources = match self.start().await {
            Ok(Some(sources)) => sources,
            Ok(None) => {
                info!("unit {} is gone; tracker exiting", self.unit);
                return Ok(());
            }
            Err(err) if err.is_cancelled() => return Ok(()),
            Err(err) => return Err(err),
        };

        let result = self.event_loop(&mut sources).await;
        if let Err(err) = &result {
            warn!("tracker for {} failed: {}", self.unit, err);
        }
        shutdown(sources).await;
        result
    }

    /// Subscribes and absorbs the initial event of every source.  Returns
    /// `None` when the unit no longer exists.  Once subscribed, sources are
    /// stopped through [`shutdown`] on cancellation or failure.
    async fn start(&mut self) -> Result<Option<Sources>> {
        if self.refresh_unit().await? == Flow::Dead {
            self.publish();
            self.notify_consumer();
            return Ok(None);
        }

        let unit = self.unit.clone();
        let app = unit.application().to_string();
        let mut sources = Sources {
            unit: subscribe("unit", self.state.watch_unit(&unit).await)?,
            addresses: subscribe("addresses", self.state.watch_addresses(&unit).await)?,
            config: subscribe("config", self.state.watch_config_settings(&unit).await)?,
            storage: subscribe("storage", self.state.watch_storage(&unit).await)?,
            application: subscribe("application", self.state.watch_application(&app).await)?,
            leader_settings: subscribe("leader settings", self.state.watch_leadership_settings(&app).await)?,
            relations: subscribe("relations", self.state.watch_relations(&app).await)?,
            relation: Vec::new(),
        };

        let abort = self.abort.clone();
        let started = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(Error::Cancelled),
            started = self.absorb_initial(&mut sources) => started,
        };
        if let Err(err) = started {
            shutdown(sources).await;
            return Err(err);
        }
        self.publish();
        self.notify_consumer();
        debug!("tracker for {} started", self.unit);
        Ok(Some(sources))
    }

    async fn absorb_initial(&mut self, sources: &mut Sources) -> Result<()> {
        initial(&mut sources.unit).await?;
        initial(&mut sources.addresses).await?;
        initial(&mut sources.config).await?;
        let storage_ids = initial(&mut sources.storage).await?;
        initial(&mut sources.application).await?;
        initial(&mut sources.leader_settings).await?;
        let relation_ids = initial(&mut sources.relations).await?;
        self.initialise(sources, storage_ids, relation_ids).await
    }

    async fn initialise(
        &mut self,
        sources: &mut Sources,
        storage_ids: Vec<String>,
        relation_ids: Vec<RelationId>,
    ) -> Result<()> {
        self.refresh_application().await?;
        self.refresh_config().await?;
        self.refresh_addresses().await?;
        self.refresh_leader().await?;
        self.update_storage(storage_ids).await?;
        self.update_relations(sources, relation_ids).await
    }

    /// Applies bursts of ready events, signalling once per burst.
    async fn event_loop(&mut self, sources: &mut Sources) -> Result<()> {
        loop {
            let mut event = next_event(sources, &self.abort, &*self.clock, self.update_status_wait()).await;
            loop {
                match self.handle(sources, event).await? {
                    Flow::Continue => self.publish(),
                    Flow::Dead => {
                        info!("unit {} is dead; tracker exiting", self.unit);
                        self.publish();
                        self.notify_consumer();
                        return Ok(());
                    }
                    Flow::Cancelled => return Ok(()),
                }
                match next_event(sources, &self.abort, &*self.clock, self.update_status_wait()).now_or_never() {
                    Some(next) => event = next,
                    None => break,
                }
            }
            self.notify_consumer();
        }
    }

    async fn handle(&mut self, sources: &mut Sources, event: Event) -> Result<Flow> {
        match event {
            Event::Cancelled => return Ok(Flow::Cancelled),
            Event::UpdateStatus => {
                self.snapshot.update_status_version += 1;
                self.next_update_status = self.clock.now() + self.config.update_status_interval;
            }
            Event::Unit(Some(Err(err))) if err.is_not_found() => {
                self.snapshot.life = Life::Dead;
                return Ok(Flow::Dead);
            }
            Event::Unit(event) => {
                delivered(&sources.unit, event)?;
                return self.refresh_unit().await;
            }
            Event::Addresses(event) => {
                delivered(&sources.addresses, event)?;
                self.refresh_addresses().await?;
            }
            Event::Config(event) => {
                delivered(&sources.config, event)?;
                self.refresh_config().await?;
            }
            Event::Storage(event) => {
                let ids = delivered(&sources.storage, event)?;
                self.update_storage(ids).await?;
            }
            Event::Application(event) => {
                delivered(&sources.application, event)?;
                self.refresh_application().await?;
            }
            Event::LeaderSettings(event) => {
                delivered(&sources.leader_settings, event)?;
                self.snapshot.leader_settings_version += 1;
                self.refresh_leader().await?;
            }
            Event::Relations(event) => {
                let ids = delivered(&sources.relations, event)?;
                self.update_relations(sources, ids).await?;
            }
            Event::RelationUnits(id, event) => match event {
                Some(Ok(change)) => {
                    if let Some(rel) = self.snapshot.relations.get_mut(&id) {
                        rel.apply(change);
                    }
                }
                Some(Err(err)) if err.is_not_found() => self.remove_relation(sources, id).await,
                None => self.relation_source_closed(sources, id).await?,
                Some(Err(err)) => {
                    if let Some(rel) = sources.relation.iter().find(|r| r.id == id) {
                        delivered::<_, ()>(&rel.units, Some(Err(err)))?;
                    }
                }
            },
            Event::Relation(id, event) => match event {
                Some(Ok(())) => self.refresh_relation(sources, id).await?,
                Some(Err(err)) if err.is_not_found() => self.remove_relation(sources, id).await,
                None => self.relation_source_closed(sources, id).await?,
                Some(Err(err)) => {
                    if let Some(rel) = sources.relation.iter().find(|r| r.id == id) {
                        delivered::<_, ()>(&rel.notify, Some(Err(err)))?;
                    }
                }
            },
        }
        Ok(Flow::Continue)
    }

    fn update_status_wait(&self) -> Duration {
        self.next_update_status
            .saturating_duration_since(self.clock.now())
    }

    fn publish(&self) {
        self.published.send_replace(self.snapshot.clone());
    }

    /// Never blocks; a pending signal already covers this change.
    fn notify_consumer(&self) {
        let _ = self.signal.try_send(());
    }

    async fn refresh_unit(&mut self) -> Result<Flow> {
        match self.state.unit(&self.unit).await {
            Ok(info) => {
                self.snapshot.life = info.life;
                self.snapshot.resolved = info.resolved;
                if info.life == Life::Dead {
                    return Ok(Flow::Dead);
                }
                Ok(Flow::Continue)
            }
            Err(err) if err.is_not_found() => {
                self.snapshot.life = Life::Dead;
                Ok(Flow::Dead)
            }
            Err(err) => Err(err),
        }
    }

    async fn refresh_application(&mut self) -> Result<()> {
        let app = self.state.application(self.unit.application()).await?;
        self.snapshot.charm_url = app.charm_url;
        self.snapshot.force_charm_upgrade = app.force_charm_upgrade;
        Ok(())
    }

    async fn refresh_config(&mut self) -> Result<()> {
        let settings = self.state.config_settings(&self.unit).await?;
        self.snapshot.config_hash = config_hash(&settings);
        Ok(())
    }

    async fn refresh_addresses(&mut self) -> Result<()> {
        let addresses = self.inventory.all_addresses().await?;
        self.snapshot.addresses_hash = addresses_hash(&addresses);
        Ok(())
    }

    async fn refresh_leader(&mut self) -> Result<()> {
        self.snapshot.leader = self.state.is_leader(&self.unit).await?;
        Ok(())
    }

    /// `ids` is the full current set of storage attachments.
    async fn update_storage(&mut self, ids: Vec<String>) -> Result<()> {
        let wanted: BTreeSet<String> = ids.into_iter().collect();
        self.snapshot.storage.retain(|id, _| wanted.contains(id));
        if wanted.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = wanted.into_iter().collect();
        let lives = self.state.storage_attachment_life(&self.unit, &ids).await?;
        for (id, life) in ids.into_iter().zip(lives) {
            match life {
                Ok(life) => {
                    self.snapshot.storage.insert(id, life);
                }
                Err(err) if err.is_not_found() => {
                    self.snapshot.storage.remove(&id);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// `ids` is the full current set of relations.
    async fn update_relations(&mut self, sources: &mut Sources, ids: Vec<RelationId>) -> Result<()> {
        let wanted: BTreeSet<RelationId> = ids.into_iter().collect();
        let removed: Vec<RelationId> = sources
            .relation
            .iter()
            .map(|r| r.id)
            .filter(|id| !wanted.contains(id))
            .collect();
        for id in removed {
            self.remove_relation(sources, id).await;
        }
        for id in wanted {
            if !sources.relation.iter().any(|r| r.id == id) {
                self.add_relation(sources, id).await?;
            }
        }
        Ok(())
    }

    async fn add_relation(&mut self, sources: &mut Sources, id: RelationId) -> Result<()> {
        let relation = match self.state.relation(id).await {
            Ok(relation) => relation,
            Err(err) if err.is_not_found() => {
                debug!("relation {} vanished before it could be tracked", id);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let mut units = match self.state.watch_relation_units(id, &self.unit).await {
            Ok(source) => source,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        let mut notify = match self.state.watch_relation(id).await {
            Ok(source) => source,
            Err(err) => {
                stop_quietly(&mut units).await;
                return if err.is_not_found() { Ok(()) } else { Err(err) };
            }
        };

        let initial_units = initial(&mut units).await;
        let initial_notify = initial(&mut notify).await;
        let change = match (initial_units, initial_notify) {
            (Ok(change), Ok(())) => change,
            (Err(err), _) | (_, Err(err)) => {
                stop_quietly(&mut notify).await;
                stop_quietly(&mut units).await;
                return Err(err);
            }
        };

        let mut snapshot = RelationSnapshot {
            life: relation.life,
            ..Default::default()
        };
        snapshot.apply(change);
        self.snapshot.relations.insert(id, snapshot);
        sources.relation.push(RelationSources { id, units, notify });
        debug!("unit {} now tracking relation {} ({})", self.unit, id, relation.key());
        Ok(())
    }

    async fn refresh_relation(&mut self, sources: &mut Sources, id: RelationId) -> Result<()> {
        match self.state.relation(id).await {
            Ok(relation) => {
                if let Some(rel) = self.snapshot.relations.get_mut(&id) {
                    rel.life = relation.life;
                }
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                self.remove_relation(sources, id).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// A relation source ending cleanly is only expected once the relation
    /// itself is gone.
    async fn relation_source_closed(&mut self, sources: &mut Sources, id: RelationId) -> Result<()> {
        match self.state.relation(id).await {
            Err(err) if err.is_not_found() => {
                self.remove_relation(sources, id).await;
                Ok(())
            }
            Err(err) => Err(err),
            Ok(_) => Err(Error::SourceTerminated {
                source_name: format!("relation {id}"),
                reason: "source closed".into(),
            }),
        }
    }

    async fn remove_relation(&mut self, sources: &mut Sources, id: RelationId) {
        if let Some(pos) = sources.relation.iter().position(|r| r.id == id) {
            let mut rel = sources.relation.remove(pos);
            stop_quietly(&mut rel.notify).await;
            stop_quietly(&mut rel.units).await;
        }
        self.snapshot.relations.remove(&id);
        debug!("unit {} no longer tracking relation {}", self.unit, id);
    }
}

fn subscribe<T>(name: &str, result: Result<Source<T>>) -> Result<Source<T>> {
    result.map_err(|err| Error::InitFailed {
        source_name: name.to_string(),
        reason: err.to_string(),
    })
}

async fn initial<T>(source: &mut Source<T>) -> Result<T> {
    match source.next().await {
        Some(Ok(event)) => Ok(event),
        Some(Err(err)) => Err(Error::InitFailed {
            source_name: source.name().to_string(),
            reason: err.to_string(),
        }),
        None => Err(Error::InitFailed {
            source_name: source.name().to_string(),
            reason: "closed before the initial event".into(),
        }),
    }
}

fn delivered<S, T>(source: &Source<S>, event: Option<Result<T>>) -> Result<T> {
    match event {
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(Error::SourceTerminated {
            source_name: source.name().to_string(),
            reason: err.to_string(),
        }),
        None => Err(Error::SourceTerminated {
            source_name: source.name().to_string(),
            reason: "source closed".into(),
        }),
    }
}

async fn next_event(sources: &mut Sources, abort: &CancellationToken, clock: &dyn Clock, wait: Duration) -> Event {
    let relation_event = next_relation_event(&mut sources.relation);
    tokio::select! {
        biased;
        _ = abort.cancelled() => Event::Cancelled,
        event = sources.unit.next() => Event::Unit(event),
        event = sources.addresses.next() => Event::Addresses(event),
        event = sources.config.next() => Event::Config(event),
        event = sources.storage.next() => Event::Storage(event),
        event = sources.application.next() => Event::Application(event),
        event = sources.leader_settings.next() => Event::LeaderSettings(event),
        event = sources.relations.next() => Event::Relations(event),
        event = relation_event => event,
        _ = clock.after(wait) => Event::UpdateStatus,
    }
}

async fn next_relation_event(relations: &mut [RelationSources]) -> Event {
    if relations.is_empty() {
        return std::future::pending().await;
    }
    let pending = relations.iter_mut().map(|rel| {
        Box::pin(async move {
            let id = rel.id;
            tokio::select! {
                biased;
                event = rel.units.next() => Event::RelationUnits(id, event),
                event = rel.notify.next() => Event::Relation(id, event),
            }
        })
    });
    select_all(pending).await.0
}

async fn stop_quietly<T>(source: &mut Source<T>) {
    if let Err(err) = source.wait().await {
        warn!("error stopping {}: {}", source.name(), err);
    }
}

/// Stops every source in reverse subscription order.
async fn shutdown(mut sources: Sources) {
    while let Some(mut rel) = sources.relation.pop() {
        stop_quietly(&mut rel.notify).await;
        stop_quietly(&mut rel.units).await;
    }
    stop_quietly(&mut sources.relations).await;
    stop_quietly(&mut sources.leader_settings).await;
    stop_quietly(&mut sources.application).await;
    stop_quietly(&mut sources.storage).await;
    stop_quietly(&mut sources.config).await;
    stop_quietly(&mut sources.addresses).await;
    stop_quietly(&mut sources.unit).await;
}
