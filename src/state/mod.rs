//! The state façade consumed by the tracker and the network-info resolver.
//!
//! Every read and watch the core performs goes through [`State`], so a
//! daemon can back it with a live model while tests substitute the
//! in-memory [`MemoryModel`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::network::{Address, DeviceAddress, LinkLayerDevice, Subnet};
use crate::types::{Bindings, Life, Relation, RelationId, RelationUnitsChange, ResolvedMode, UnitId};

pub mod memory;

pub use memory::{MemoryModel, ModelSeed};

/// What a unit runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitHost {
    Machine(String),
    /// Hosted by a cluster service abstraction of its application.
    CloudService,
    Unassigned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub id: UnitId,
    pub life: Life,
    pub resolved: ResolvedMode,
    pub host: UnitHost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationInfo {
    pub name: String,
    pub life: Life,
    pub charm_url: Option<String>,
    pub force_charm_upgrade: bool,
    pub bindings: Bindings,
    /// Offered from another model.
    pub remote: bool,
}

pub type Settings = BTreeMap<String, serde_json::Value>;

#[async_trait]
pub trait State: Send + Sync {
    async fn unit(&self, unit: &UnitId) -> Result<UnitInfo>;
    async fn application(&self, name: &str) -> Result<ApplicationInfo>;
    async fn relation(&self, id: RelationId) -> Result<Relation>;

    /// Life of each storage attachment of `unit`, in the order asked.
    async fn storage_attachment_life(&self, unit: &UnitId, ids: &[String]) -> Result<Vec<Result<Life>>>;
    async fn config_settings(&self, unit: &UnitId) -> Result<Settings>;
    async fn is_leader(&self, unit: &UnitId) -> Result<bool>;

    async fn provider_addresses(&self, machine: &str) -> Result<Vec<Address>>;
    async fn machine_addresses(&self, machine: &str) -> Result<Vec<Address>>;
    async fn link_layer_devices(&self, machine: &str) -> Result<Vec<LinkLayerDevice>>;
    async fn device_addresses(&self, machine: &str) -> Result<Vec<DeviceAddress>>;
    async fn cloud_service_addresses(&self, application: &str) -> Result<Vec<Address>>;
    async fn subnets(&self) -> Result<Vec<Subnet>>;

    async fn watch_unit(&self, unit: &UnitId) -> Result<Source<()>>;
    async fn watch_addresses(&self, unit: &UnitId) -> Result<Source<()>>;
    async fn watch_config_settings(&self, unit: &UnitId) -> Result<Source<()>>;
    async fn watch_storage(&self, unit: &UnitId) -> Result<Source<Vec<String>>>;
    async fn watch_application(&self, name: &str) -> Result<Source<()>>;
    async fn watch_leadership_settings(&self, name: &str) -> Result<Source<()>>;
    async fn watch_relations(&self, name: &str) -> Result<Source<Vec<RelationId>>>;
    async fn watch_relation(&self, id: RelationId) -> Result<Source<()>>;
    async fn watch_relation_units(&self, id: RelationId, unit: &UnitId) -> Result<Source<RelationUnitsChange>>;
}

/// Creates a connected source pair.  The producer must send the initial
/// event before handing the [`Source`] out.
pub fn source<T>(name: impl Into<String>) -> (SourceSender<T>, Source<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SourceSender { tx },
        Source {
            name: name.into(),
            rx,
            terminated: false,
        },
    )
}

/// Producer half of a [`Source`].
#[derive(Debug)]
pub struct SourceSender<T> {
    tx: mpsc::UnboundedSender<Result<T>>,
}

impl<T> SourceSender<T> {
    /// Returns false once the consumer has stopped the source.
    pub fn send(&self, event: T) -> bool {
        self.tx.send(Ok(event)).is_ok()
    }

    /// Ends the stream with a terminal error.
    pub fn fail(self, err: Error) {
        let _ = self.tx.send(Err(err));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A lazy stream of change events for one watched entity.
///
/// Events are never dropped.  A stream ends either cleanly (the producer
/// went away or the source was stopped) or with exactly one error item.
#[derive(Debug)]
pub struct Source<T> {
    name: String,
    rx: mpsc::UnboundedReceiver<Result<T>>,
    terminated: bool,
}

impl<T> Source<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next event; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<T>> {
        if self.terminated {
            return None;
        }
        let item = self.rx.recv().await;
        if !matches!(item, Some(Ok(_))) {
            self.terminated = true;
        }
        item
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        self.rx.close();
    }

    /// Drains a stopped source and reports the terminal error, if any.
    pub async fn wait(&mut self) -> Result<()> {
        self.stop();
        let mut outcome = Ok(());
        while let Some(item) = self.rx.recv().await {
            if let Err(err) = item {
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        self.terminated = true;
        outcome
    }
}
