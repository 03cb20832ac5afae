//! In-memory model implementing [`State`].
//!
//! The model owns every entity the core reads and fans change events out
//! to the sources it has handed out.  Mutations are synchronous so they
//! can be made from retry notify hooks.  A model can be built up through
//! its mutation methods or seeded from a [`ModelSeed`] document.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use figment::providers::{Format, Json, Toml};
use figment::Figment;
use log::debug;
use serde::{Deserialize, Serialize};

use super::{source, ApplicationInfo, Settings, Source, SourceSender, State, UnitHost, UnitInfo};
use crate::error::{Error, Result};
use crate::network::{Address, DeviceAddress, LinkLayerDevice, Origin, Subnet};
use crate::types::{
    Bindings, Life, Relation, RelationId, RelationScope, RelationUnitsChange, ResolvedMode, Role, UnitId,
};

#[derive(Debug, Default)]
pub struct MemoryModel {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    units: BTreeMap<UnitId, UnitRecord>,
    applications: BTreeMap<String, ApplicationRecord>,
    relations: BTreeMap<RelationId, RelationRecord>,
    machines: BTreeMap<String, MachineRecord>,
    subnets: Vec<Subnet>,
    watchers: Watchers,
    closed: bool,
}

#[derive(Debug)]
struct UnitRecord {
    life: Life,
    resolved: ResolvedMode,
    host: UnitHost,
    config: Settings,
    storage: BTreeMap<String, Life>,
    leader: bool,
}

#[derive(Debug, Default)]
struct ApplicationRecord {
    life: Life,
    charm_url: Option<String>,
    force_charm_upgrade: bool,
    bindings: Bindings,
    remote: bool,
    service_addresses: Vec<Address>,
}

#[derive(Debug)]
struct RelationRecord {
    relation: Relation,
    /// Units in scope with their settings version.
    members: BTreeMap<UnitId, i64>,
}

#[derive(Debug, Default)]
struct MachineRecord {
    provider_addresses: Vec<Address>,
    machine_addresses: Vec<Address>,
    devices: Vec<LinkLayerDevice>,
    device_addresses: Vec<DeviceAddress>,
}

type Senders<K, T> = BTreeMap<K, Vec<SourceSender<T>>>;

#[derive(Debug, Default)]
struct Watchers {
    unit: Senders<UnitId, ()>,
    addresses: Senders<UnitId, ()>,
    config: Senders<UnitId, ()>,
    storage: Senders<UnitId, Vec<String>>,
    application: Senders<String, ()>,
    leadership: Senders<String, ()>,
    relations: Senders<String, Vec<RelationId>>,
    relation: Senders<RelationId, ()>,
    relation_units: BTreeMap<RelationId, Vec<(UnitId, SourceSender<RelationUnitsChange>)>>,
}

/// Sends `event` to every live sender for `key`, forgetting stopped ones.
fn notify<K: Ord, T: Clone>(senders: &mut Senders<K, T>, key: &K, event: T) {
    if let Some(list) = senders.get_mut(key) {
        list.retain(|tx| tx.send(event.clone()));
    }
}

/// Moves `current` forward to `next`, refusing to go back.
fn advance_life(entity: impl FnOnce() -> String, current: &mut Life, next: Life) -> Result<()> {
    if next < *current {
        return Err(Error::LifeRegression {
            entity: entity(),
            from: *current,
            to: next,
        });
    }
    *current = next;
    Ok(())
}

fn register<K: Ord, T>(senders: &mut Senders<K, T>, key: K, tx: SourceSender<T>) {
    let list = senders.entry(key).or_default();
    list.retain(|tx| !tx.is_closed());
    list.push(tx);
}

fn fail_all<K, T>(senders: &mut Senders<K, T>, reason: &str) {
    for (_, list) in std::mem::take(senders) {
        for tx in list {
            tx.fail(Error::SourceTerminated {
                source_name: "model".into(),
                reason: reason.to_string(),
            });
        }
    }
}

impl Inner {
    fn unit(&self, id: &UnitId) -> Result<&UnitRecord> {
        self.units
            .get(id)
            .ok_or_else(|| Error::not_found(format!("unit {id}")))
    }

    fn unit_mut(&mut self, id: &UnitId) -> Result<&mut UnitRecord> {
        self.units
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("unit {id}")))
    }

    fn application(&self, name: &str) -> Result<&ApplicationRecord> {
        self.applications
            .get(name)
            .ok_or_else(|| Error::not_found(format!("application {name}")))
    }

    fn application_mut(&mut self, name: &str) -> Result<&mut ApplicationRecord> {
        self.applications
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("application {name}")))
    }

    fn relation(&self, id: RelationId) -> Result<&RelationRecord> {
        self.relations
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("relation {id}")))
    }

    fn machine(&self, id: &str) -> Result<&MachineRecord> {
        self.machines
            .get(id)
            .ok_or_else(|| Error::not_found(format!("machine {id}")))
    }

    fn machine_mut(&mut self, id: &str) -> Result<&mut MachineRecord> {
        self.machines
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("machine {id}")))
    }

    fn relation_ids(&self, application: &str) -> Vec<RelationId> {
        self.relations
            .values()
            .filter(|r| r.relation.endpoint(application).is_some())
            .map(|r| r.relation.id)
            .collect()
    }

    fn storage_ids(&self, unit: &UnitId) -> Vec<String> {
        self.units
            .get(unit)
            .map(|u| u.storage.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn notify_relations(&mut self, application: &str) {
        let ids = self.relation_ids(application);
        notify(&mut self.watchers.relations, &application.to_string(), ids);
    }

    fn notify_addresses_on_machine(&mut self, machine: &str) {
        let hosted: Vec<UnitId> = self
            .units
            .iter()
            .filter(|(_, u)| matches!(&u.host, UnitHost::Machine(m) if m == machine))
            .map(|(id, _)| id.clone())
            .collect();
        for id in hosted {
            notify(&mut self.watchers.addresses, &id, ());
        }
    }

    fn send_relation_units(&mut self, id: RelationId, member: &UnitId, change: RelationUnitsChange) {
        let Some(record) = self.relations.get(&id) else {
            return;
        };
        let relation = &record.relation;
        let units = &self.units;
        if let Some(list) = self.watchers.relation_units.get_mut(&id) {
            list.retain(|(watcher, tx)| !sees(relation, units, watcher, member) || tx.send(change.clone()));
        }
    }
}

/// Whether `watcher` should see changes made by `member`.  Container
/// scoped relations only link units on the same machine.
fn sees(relation: &Relation, units: &BTreeMap<UnitId, UnitRecord>, watcher: &UnitId, member: &UnitId) -> bool {
    if watcher == member {
        return false;
    }
    if relation.scope == RelationScope::Container && !co_located(units, watcher, member) {
        return false;
    }
    if watcher.application() != member.application() {
        return true;
    }
    relation
        .endpoint(watcher.application())
        .is_some_and(|ep| ep.role == Role::Peer)
}

fn co_located(units: &BTreeMap<UnitId, UnitRecord>, a: &UnitId, b: &UnitId) -> bool {
    match (units.get(a).map(|u| &u.host), units.get(b).map(|u| &u.host)) {
        (Some(UnitHost::Machine(x)), Some(UnitHost::Machine(y))) => x == y,
        _ => false,
    }
}

impl MemoryModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(inner: &Inner) -> Result<()> {
        if inner.closed {
            return Err(Error::SourceTerminated {
                source_name: "model".into(),
                reason: "model closed".into(),
            });
        }
        Ok(())
    }

    pub fn add_subnet(&self, subnet: Subnet) {
        self.lock().subnets.push(subnet);
    }

    pub fn add_application(&self, name: &str) {
        self.lock()
            .applications
            .entry(name.to_string())
            .or_default();
    }

    /// Adds an application offered from another model.
    pub fn add_remote_application(&self, name: &str) {
        self.lock().applications.entry(name.to_string()).or_default().remote = true;
    }

    pub fn set_bindings(&self, application: &str, bindings: Bindings) -> Result<()> {
        let mut inner = self.lock();
        inner.application_mut(application)?.bindings = bindings;
        notify(&mut inner.watchers.application, &application.to_string(), ());
        Ok(())
    }

    pub fn set_charm_url(&self, application: &str, url: &str, force: bool) -> Result<()> {
        let mut inner = self.lock();
        let app = inner.application_mut(application)?;
        app.charm_url = Some(url.to_string());
        app.force_charm_upgrade = force;
        notify(&mut inner.watchers.application, &application.to_string(), ());
        Ok(())
    }

    pub fn set_application_life(&self, application: &str, life: Life) -> Result<()> {
        let mut inner = self.lock();
        let record = inner.application_mut(application)?;
        advance_life(|| format!("application {application}"), &mut record.life, life)?;
        notify(&mut inner.watchers.application, &application.to_string(), ());
        Ok(())
    }

    /// Sets the addresses of an application's cluster service.
    pub fn set_service_addresses(&self, application: &str, addresses: Vec<Address>) -> Result<()> {
        let mut inner = self.lock();
        inner.application_mut(application)?.service_addresses = addresses;
        let hosted: Vec<UnitId> = inner
            .units
            .iter()
            .filter(|(id, u)| id.application() == application && u.host == UnitHost::CloudService)
            .map(|(id, _)| id.clone())
            .collect();
        for id in hosted {
            notify(&mut inner.watchers.addresses, &id, ());
        }
        Ok(())
    }

    pub fn add_unit(&self, id: UnitId, host: UnitHost) -> Result<()> {
        let mut inner = self.lock();
        inner.application(id.application())?;
        if let UnitHost::Machine(machine) = &host {
            inner.machines.entry(machine.clone()).or_default();
        }
        inner.units.insert(
            id,
            UnitRecord {
                life: Life::Alive,
                resolved: ResolvedMode::None,
                host,
                config: Settings::new(),
                storage: BTreeMap::new(),
                leader: false,
            },
        );
        Ok(())
    }

    pub fn set_unit_life(&self, id: &UnitId, life: Life) -> Result<()> {
        let mut inner = self.lock();
        let record = inner.unit_mut(id)?;
        advance_life(|| format!("unit {id}"), &mut record.life, life)?;
        notify(&mut inner.watchers.unit, id, ());
        Ok(())
    }

    pub fn set_resolved(&self, id: &UnitId, resolved: ResolvedMode) -> Result<()> {
        let mut inner = self.lock();
        inner.unit_mut(id)?.resolved = resolved;
        notify(&mut inner.watchers.unit, id, ());
        Ok(())
    }

    pub fn remove_unit(&self, id: &UnitId) -> Result<()> {
        let mut inner = self.lock();
        inner
            .units
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("unit {id}")))?;
        notify(&mut inner.watchers.unit, id, ());
        Ok(())
    }

    pub fn set_config(&self, id: &UnitId, key: &str, value: serde_json::Value) -> Result<()> {
        let mut inner = self.lock();
        inner.unit_mut(id)?.config.insert(key.to_string(), value);
        notify(&mut inner.watchers.config, id, ());
        Ok(())
    }

    pub fn set_leader(&self, id: &UnitId, leader: bool) -> Result<()> {
        let mut inner = self.lock();
        let application = id.application().to_string();
        for (unit, record) in inner.units.iter_mut() {
            if unit.application() == application {
                record.leader = leader && unit == id;
            }
        }
        notify(&mut inner.watchers.leadership, &application, ());
        Ok(())
    }

    /// Records a write to the application's leader settings.
    pub fn write_leader_settings(&self, application: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.application(application)?;
        notify(&mut inner.watchers.leadership, &application.to_string(), ());
        Ok(())
    }

    pub fn set_storage(&self, id: &UnitId, storage: &str, life: Life) -> Result<()> {
        let mut inner = self.lock();
        inner.unit_mut(id)?.storage.insert(storage.to_string(), life);
        let ids = inner.storage_ids(id);
        notify(&mut inner.watchers.storage, id, ids);
        Ok(())
    }

    pub fn remove_storage(&self, id: &UnitId, storage: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.unit_mut(id)?.storage.remove(storage);
        let ids = inner.storage_ids(id);
        notify(&mut inner.watchers.storage, id, ids);
        Ok(())
    }

    pub fn add_relation(&self, relation: Relation) -> Result<()> {
        let mut inner = self.lock();
        for ep in &relation.endpoints {
            inner.application(&ep.application)?;
        }
        let apps: Vec<String> = relation
            .endpoints
            .iter()
            .map(|ep| ep.application.clone())
            .collect();
        inner.relations.insert(
            relation.id,
            RelationRecord {
                relation,
                members: BTreeMap::new(),
            },
        );
        for app in apps {
            inner.notify_relations(&app);
        }
        Ok(())
    }

    pub fn set_relation_life(&self, id: RelationId, life: Life) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .relations
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("relation {id}")))?;
        advance_life(|| format!("relation {id}"), &mut record.relation.life, life)?;
        notify(&mut inner.watchers.relation, &id, ());
        Ok(())
    }

    pub fn remove_relation(&self, id: RelationId) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .relations
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("relation {id}")))?;
        for ep in &record.relation.endpoints {
            inner.notify_relations(&ep.application);
        }
        notify(&mut inner.watchers.relation, &id, ());
        inner.watchers.relation.remove(&id);
        inner.watchers.relation_units.remove(&id);
        Ok(())
    }

    /// `unit` joins the relation with settings version 0.
    pub fn enter_scope(&self, id: RelationId, unit: &UnitId) -> Result<()> {
        self.bump_member(id, unit, true)
    }

    /// `unit` changed its relation settings.
    pub fn change_settings(&self, id: RelationId, unit: &UnitId) -> Result<()> {
        self.bump_member(id, unit, false)
    }

    fn bump_member(&self, id: RelationId, unit: &UnitId, entering: bool) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .relations
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("relation {id}")))?;
        let version = match (entering, record.members.get(unit)) {
            (true, _) | (false, None) => 0,
            (false, Some(v)) => v + 1,
        };
        record.members.insert(unit.clone(), version);
        let change = RelationUnitsChange {
            changed: BTreeMap::from([(unit.to_string(), version)]),
            ..Default::default()
        };
        inner.send_relation_units(id, unit, change);
        Ok(())
    }

    pub fn leave_scope(&self, id: RelationId, unit: &UnitId) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .relations
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("relation {id}")))?;
        if record.members.remove(unit).is_none() {
            return Ok(());
        }
        let change = RelationUnitsChange {
            departed: BTreeSet::from([unit.to_string()]),
            ..Default::default()
        };
        inner.send_relation_units(id, unit, change);
        Ok(())
    }

    /// `application` changed its application-level relation settings.
    pub fn change_app_settings(&self, id: RelationId, application: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.relation(id)?;
        let change = RelationUnitsChange {
            app_changed: true,
            ..Default::default()
        };
        if let Some(list) = inner.watchers.relation_units.get_mut(&id) {
            list.retain(|(watcher, tx)| watcher.application() == application || tx.send(change.clone()));
        }
        Ok(())
    }

    pub fn add_machine(&self, id: &str) {
        self.lock().machines.entry(id.to_string()).or_default();
    }

    pub fn set_provider_addresses(&self, machine: &str, addresses: Vec<Address>) -> Result<()> {
        let mut inner = self.lock();
        inner.machine_mut(machine)?.provider_addresses = addresses
            .into_iter()
            .map(|a| Address { origin: Origin::Provider, ..a })
            .collect();
        inner.notify_addresses_on_machine(machine);
        Ok(())
    }

    pub fn set_machine_addresses(&self, machine: &str, addresses: Vec<Address>) -> Result<()> {
        let mut inner = self.lock();
        inner.machine_mut(machine)?.machine_addresses = addresses
            .into_iter()
            .map(|a| Address { origin: Origin::Machine, ..a })
            .collect();
        inner.notify_addresses_on_machine(machine);
        Ok(())
    }

    /// Adds or replaces a device by name.
    pub fn set_device(&self, machine: &str, device: LinkLayerDevice) -> Result<()> {
        let mut inner = self.lock();
        let record = inner.machine_mut(machine)?;
        record.devices.retain(|d| d.name != device.name);
        record.devices.push(device);
        Ok(())
    }

    pub fn add_device_address(&self, machine: &str, address: DeviceAddress) -> Result<()> {
        let mut inner = self.lock();
        let record = inner.machine_mut(machine)?;
        if !record.devices.iter().any(|d| d.name == address.device) {
            return Err(Error::not_found(format!("device {} on machine {machine}", address.device)));
        }
        record.device_addresses.push(address);
        Ok(())
    }

    /// Shuts the model down.  Every open source ends with an error and
    /// later watches are refused.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        let w = &mut inner.watchers;
        let reason = "model closed";
        fail_all(&mut w.unit, reason);
        fail_all(&mut w.addresses, reason);
        fail_all(&mut w.config, reason);
        fail_all(&mut w.storage, reason);
        fail_all(&mut w.application, reason);
        fail_all(&mut w.leadership, reason);
        fail_all(&mut w.relations, reason);
        fail_all(&mut w.relation, reason);
        for (_, list) in std::mem::take(&mut w.relation_units) {
            for (_, tx) in list {
                tx.fail(Error::SourceTerminated {
                    source_name: "model".into(),
                    reason: reason.into(),
                });
            }
        }
        debug!("memory model closed");
    }

    pub fn from_seed(seed: ModelSeed) -> Result<Self> {
        let model = Self::new();
        for subnet in seed.subnets {
            model.add_subnet(subnet);
        }
        for app in seed.applications {
            if app.remote {
                model.add_remote_application(&app.name);
            } else {
                model.add_application(&app.name);
            }
            let mut inner = model.lock();
            let record = inner.application_mut(&app.name)?;
            record.charm_url = app.charm_url;
            record.bindings = app.bindings;
            record.service_addresses = app.service_addresses;
        }
        for machine in seed.machines {
            model.add_machine(&machine.id);
            model.set_provider_addresses(&machine.id, machine.provider_addresses)?;
            model.set_machine_addresses(&machine.id, machine.machine_addresses)?;
            for device in machine.devices {
                model.set_device(&machine.id, device)?;
            }
            for address in machine.device_addresses {
                model.add_device_address(&machine.id, address)?;
            }
        }
        for unit in seed.units {
            let host = match (unit.machine, unit.cloud_service) {
                (Some(machine), _) => UnitHost::Machine(machine),
                (None, true) => UnitHost::CloudService,
                (None, false) => UnitHost::Unassigned,
            };
            model
                .add_unit(unit.name.clone(), host)
                .map_err(|e| Error::Seed(e.to_string()))?;
            let mut inner = model.lock();
            let record = inner.unit_mut(&unit.name)?;
            record.life = unit.life;
            record.config = unit.config;
            record.storage = unit.storage;
            record.leader = unit.leader;
        }
        for relation in seed.relations {
            let members = relation.members.clone();
            let id = relation.relation.id;
            model
                .add_relation(relation.relation)
                .map_err(|e| Error::Seed(e.to_string()))?;
            for member in members {
                model.enter_scope(id, &member)?;
            }
        }
        Ok(model)
    }
}

#[async_trait]
impl State for MemoryModel {
    async fn unit(&self, unit: &UnitId) -> Result<UnitInfo> {
        let inner = self.lock();
        let record = inner.unit(unit)?;
        Ok(UnitInfo {
            id: unit.clone(),
            life: record.life,
            resolved: record.resolved,
            host: record.host.clone(),
        })
    }

    async fn application(&self, name: &str) -> Result<ApplicationInfo> {
        let inner = self.lock();
        let record = inner.application(name)?;
        Ok(ApplicationInfo {
            name: name.to_string(),
            life: record.life,
            charm_url: record.charm_url.clone(),
            force_charm_upgrade: record.force_charm_upgrade,
            bindings: record.bindings.clone(),
            remote: record.remote,
        })
    }

    async fn relation(&self, id: RelationId) -> Result<Relation> {
        Ok(self.lock().relation(id)?.relation.clone())
    }

    async fn storage_attachment_life(&self, unit: &UnitId, ids: &[String]) -> Result<Vec<Result<Life>>> {
        let inner = self.lock();
        let record = inner.unit(unit)?;
        Ok(ids
            .iter()
            .map(|id| {
                record
                    .storage
                    .get(id)
                    .copied()
                    .ok_or_else(|| Error::not_found(format!("storage attachment {id}")))
            })
            .collect())
    }

    async fn config_settings(&self, unit: &UnitId) -> Result<Settings> {
        Ok(self.lock().unit(unit)?.config.clone())
    }

    async fn is_leader(&self, unit: &UnitId) -> Result<bool> {
        Ok(self.lock().unit(unit)?.leader)
    }

    async fn provider_addresses(&self, machine: &str) -> Result<Vec<Address>> {
        Ok(self.lock().machine(machine)?.provider_addresses.clone())
    }

    async fn machine_addresses(&self, machine: &str) -> Result<Vec<Address>> {
        Ok(self.lock().machine(machine)?.machine_addresses.clone())
    }

    async fn link_layer_devices(&self, machine: &str) -> Result<Vec<LinkLayerDevice>> {
        Ok(self.lock().machine(machine)?.devices.clone())
    }

    async fn device_addresses(&self, machine: &str) -> Result<Vec<DeviceAddress>> {
        Ok(self.lock().machine(machine)?.device_addresses.clone())
    }

    async fn cloud_service_addresses(&self, application: &str) -> Result<Vec<Address>> {
        Ok(self.lock().application(application)?.service_addresses.clone())
    }

    async fn subnets(&self) -> Result<Vec<Subnet>> {
        Ok(self.lock().subnets.clone())
    }

    async fn watch_unit(&self, unit: &UnitId) -> Result<Source<()>> {
        let mut inner = self.lock();
        Self::check_open(&inner)?;
        inner.unit(unit)?;
        let (tx, rx) = source(format!("unit {unit}"));
        tx.send(());
        register(&mut inner.watchers.unit, unit.clone(), tx);
        Ok(rx)
    }

    async fn watch_addresses(&self, unit: &UnitId) -> Result<Source<()>> {
        let mut inner = self.lock();
        Self::check_open(&inner)?;
        inner.unit(unit)?;
        let (tx, rx) = source(format!("addresses of {unit}"));
        tx.send(());
        register(&mut inner.watchers.addresses, unit.clone(), tx);
        Ok(rx)
    }

    async fn watch_config_settings(&self, unit: &UnitId) -> Result<Source<()>> {
        let mut inner = self.lock();
        Self::check_open(&inner)?;
        inner.unit(unit)?;
        let (tx, rx) = source(format!("config of {unit}"));
        tx.send(());
        register(&mut inner.watchers.config, unit.clone(), tx);
        Ok(rx)
    }

    async fn watch_storage(&self, unit: &UnitId) -> Result<Source<Vec<String>>> {
        let mut inner = self.lock();
        Self::check_open(&inner)?;
        inner.unit(unit)?;
        let (tx, rx) = source(format!("storage of {unit}"));
        tx.send(inner.storage_ids(unit));
        register(&mut inner.watchers.storage, unit.clone(), tx);
        Ok(rx)
    }

    async fn watch_application(&self, name: &str) -> Result<Source<()>> {
        let mut inner = self.lock();
        Self::check_open(&inner)?;
        inner.application(name)?;
        let (tx, rx) = source(format!("application {name}"));
        tx.send(());
        register(&mut inner.watchers.application, name.to_string(), tx);
        Ok(rx)
    }

    async fn watch_leadership_settings(&self, name: &str) -> Result<Source<()>> {
        let mut inner = self.lock();
        Self::check_open(&inner)?;
        inner.application(name)?;
        let (tx, rx) = source(format!("leader settings of {name}"));
        tx.send(());
        register(&mut inner.watchers.leadership, name.to_string(), tx);
        Ok(rx)
    }

    async fn watch_relations(&self, name: &str) -> Result<Source<Vec<RelationId>>> {
        let mut inner = self.lock();
        Self::check_open(&inner)?;
        inner.application(name)?;
        let (tx, rx) = source(format!("relations of {name}"));
        tx.send(inner.relation_ids(name));
        register(&mut inner.watchers.relations, name.to_string(), tx);
        Ok(rx)
    }

    async fn watch_relation(&self, id: RelationId) -> Result<Source<()>> {
        let mut inner = self.lock();
        Self::check_open(&inner)?;
        inner.relation(id)?;
        let (tx, rx) = source(format!("relation {id}"));
        tx.send(());
        register(&mut inner.watchers.relation, id, tx);
        Ok(rx)
    }

    async fn watch_relation_units(&self, id: RelationId, unit: &UnitId) -> Result<Source<RelationUnitsChange>> {
        let mut inner = self.lock();
        Self::check_open(&inner)?;
        inner.unit(unit)?;
        let record = inner.relation(id)?;
        let initial = RelationUnitsChange {
            changed: record
                .members
                .iter()
                .filter(|(member, _)| sees(&record.relation, &inner.units, unit, member))
                .map(|(member, version)| (member.to_string(), *version))
                .collect(),
            ..Default::default()
        };
        let (tx, rx) = source(format!("relation {id} units for {unit}"));
        tx.send(initial);
        let list = inner.watchers.relation_units.entry(id).or_default();
        list.retain(|(_, tx)| !tx.is_closed());
        list.push((unit.clone(), tx));
        Ok(rx)
    }
}

/// A model document, in JSON or TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSeed {
    pub subnets: Vec<Subnet>,
    pub applications: Vec<ApplicationSeed>,
    pub machines: Vec<MachineSeed>,
    pub units: Vec<UnitSeed>,
    pub relations: Vec<RelationSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSeed {
    pub name: String,
    #[serde(default)]
    pub charm_url: Option<String>,
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub bindings: Bindings,
    #[serde(default)]
    pub service_addresses: Vec<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSeed {
    pub id: String,
    #[serde(default)]
    pub provider_addresses: Vec<Address>,
    #[serde(default)]
    pub machine_addresses: Vec<Address>,
    #[serde(default)]
    pub devices: Vec<LinkLayerDevice>,
    #[serde(default)]
    pub device_addresses: Vec<DeviceAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSeed {
    pub name: UnitId,
    #[serde(default)]
    pub machine: Option<String>,
    #[serde(default)]
    pub cloud_service: bool,
    #[serde(default)]
    pub life: Life,
    #[serde(default)]
    pub leader: bool,
    #[serde(default)]
    pub config: Settings,
    #[serde(default)]
    pub storage: BTreeMap<String, Life>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationSeed {
    #[serde(flatten)]
    pub relation: Relation,
    #[serde(default)]
    pub members: Vec<UnitId>,
}

impl ModelSeed {
    /// Reads a seed document; `.toml` files are TOML, anything else JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Figment::from(Toml::file(path)),
            _ => Figment::from(Json::file(path)),
        };
        figment
            .extract()
            .map_err(|e| Error::Seed(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Scope;
    use crate::types::Endpoint;

    fn unit(name: &str) -> UnitId {
        name.parse().unwrap()
    }

    fn relation(id: RelationId) -> Relation {
        Relation {
            id,
            life: Life::Alive,
            scope: RelationScope::Global,
            endpoints: vec![
                Endpoint {
                    application: "mysql".into(),
                    role: Role::Provider,
                    name: "server".into(),
                    interface: "mysql".into(),
                },
                Endpoint {
                    application: "wordpress".into(),
                    role: Role::Requirer,
                    name: "db".into(),
                    interface: "mysql".into(),
                },
            ],
        }
    }

    fn model() -> MemoryModel {
        let model = MemoryModel::new();
        model.add_application("mysql");
        model.add_application("wordpress");
        model.add_unit(unit("mysql/0"), UnitHost::Machine("0".into())).unwrap();
        model.add_unit(unit("wordpress/0"), UnitHost::Machine("1".into())).unwrap();
        model.add_relation(relation(1)).unwrap();
        model
    }

    #[tokio::test]
    async fn watches_deliver_initial_event() {
        let model = model();
        let mut relations = model.watch_relations("wordpress").await.unwrap();
        assert_eq!(relations.next().await.unwrap().unwrap(), vec![1]);

        model.add_relation(relation(2)).unwrap();
        assert_eq!(relations.next().await.unwrap().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn relation_units_skip_own_application() {
        let model = model();
        let wp = unit("wordpress/0");
        model.enter_scope(1, &unit("mysql/0")).unwrap();
        model.enter_scope(1, &wp).unwrap();

        let mut ru = model.watch_relation_units(1, &wp).await.unwrap();
        let initial = ru.next().await.unwrap().unwrap();
        assert_eq!(initial.changed, BTreeMap::from([("mysql/0".to_string(), 0)]));

        model.change_settings(1, &wp).unwrap();
        model.change_settings(1, &unit("mysql/0")).unwrap();
        let next = ru.next().await.unwrap().unwrap();
        assert_eq!(next.changed, BTreeMap::from([("mysql/0".to_string(), 1)]));
    }

    #[tokio::test]
    async fn address_changes_reach_hosted_units() {
        let model = model();
        let mut addresses = model.watch_addresses(&unit("mysql/0")).await.unwrap();
        addresses.next().await.unwrap().unwrap();

        let addr = Address::parse("10.0.0.1", Scope::CloudLocal, Origin::Machine).unwrap();
        model.set_provider_addresses("0", vec![addr]).unwrap();
        addresses.next().await.unwrap().unwrap();
        let stored = model.provider_addresses("0").await.unwrap();
        assert_eq!(stored[0].origin, Origin::Provider);
    }

    #[tokio::test]
    async fn close_terminates_sources() {
        let model = model();
        let mut watch = model.watch_unit(&unit("mysql/0")).await.unwrap();
        watch.next().await.unwrap().unwrap();
        model.close();
        assert!(matches!(watch.next().await, Some(Err(Error::SourceTerminated { .. }))));
        assert!(model.watch_unit(&unit("mysql/0")).await.is_err());
    }

    #[test]
    fn seed_builds_model() {
        let seed: ModelSeed = serde_json::from_value(serde_json::json!({
            "subnets": [{"cidr": "10.0.0.0/24", "space": "default"}],
            "applications": [{"name": "mysql"}, {"name": "wordpress", "bindings": {"": "default"}}],
            "machines": [{"id": "0", "provider_addresses": [{"value": "10.0.0.5", "scope": "cloud-local"}]}],
            "units": [{"name": "wordpress/0", "machine": "0", "leader": true}],
            "relations": [{
                "id": 7,
                "endpoints": [
                    {"application": "mysql", "role": "provider", "name": "server", "interface": "mysql"},
                    {"application": "wordpress", "role": "requirer", "name": "db", "interface": "mysql"}
                ],
                "members": ["wordpress/0"]
            }]
        }))
        .unwrap();
        let model = MemoryModel::from_seed(seed).unwrap();
        let inner = model.lock();
        assert_eq!(inner.relations[&7].members.len(), 1);
        assert!(inner.units[&unit("wordpress/0")].leader);
    }

    #[test]
    fn life_never_goes_back() {
        let model = model();
        let wp = unit("wordpress/0");
        model.set_unit_life(&wp, Life::Dying).unwrap();
        let err = model.set_unit_life(&wp, Life::Alive).unwrap_err();
        assert!(matches!(err, Error::LifeRegression { from: Life::Dying, to: Life::Alive, .. }));
        assert_eq!(model.lock().units[&wp].life, Life::Dying);
        model.set_unit_life(&wp, Life::Dying).unwrap();

        model.set_relation_life(1, Life::Dead).unwrap();
        assert!(model.set_relation_life(1, Life::Dying).is_err());
        assert_eq!(model.lock().relations[&1].relation.life, Life::Dead);

        model.set_application_life("mysql", Life::Dying).unwrap();
        assert!(model.set_application_life("mysql", Life::Alive).is_err());
    }

    #[tokio::test]
    async fn container_scope_links_co_located_units_only() {
        let model = model();
        model.add_application("logging");
        model.add_unit(unit("logging/0"), UnitHost::Machine("1".into())).unwrap();
        model.add_unit(unit("logging/1"), UnitHost::Machine("5".into())).unwrap();
        model
            .add_relation(Relation {
                id: 7,
                life: Life::Alive,
                scope: RelationScope::Container,
                endpoints: vec![
                    Endpoint {
                        application: "wordpress".into(),
                        role: Role::Provider,
                        name: "juju-info".into(),
                        interface: "juju-info".into(),
                    },
                    Endpoint {
                        application: "logging".into(),
                        role: Role::Requirer,
                        name: "info".into(),
                        interface: "juju-info".into(),
                    },
                ],
            })
            .unwrap();
        model.enter_scope(7, &unit("logging/0")).unwrap();
        model.enter_scope(7, &unit("logging/1")).unwrap();

        let wp = unit("wordpress/0");
        let mut ru = model.watch_relation_units(7, &wp).await.unwrap();
        let initial = ru.next().await.unwrap().unwrap();
        assert_eq!(initial.changed, BTreeMap::from([("logging/0".to_string(), 0)]));

        model.change_settings(7, &unit("logging/1")).unwrap();
        model.change_settings(7, &unit("logging/0")).unwrap();
        let next = ru.next().await.unwrap().unwrap();
        assert_eq!(next.changed, BTreeMap::from([("logging/0".to_string(), 1)]));
    }
}
