//! Resolves the bound space, ingress addresses and egress CIDRs a unit
//! advertises for a relation.
//!
//! Cross-model relations poll for an address because the provider may
//! record it only after the unit first asks.  Public and private polls run
//! under separate policies from the [`RetryFactory`] so a short public
//! wait cannot eat into the private fallback.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::network::inventory::{select_address, AddressInventory, DeviceInfo};
use crate::network::{space_of, Address, Scope, SpaceId};
use crate::retry::{RetryFactory, RetryPolicy};
use crate::state::{State, UnitHost};
use crate::types::{Relation, UnitId};

/// Networking a unit advertises for one relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationNetworks {
    pub space: SpaceId,
    pub ingress: Vec<Address>,
    pub egress: Vec<IpNet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub address: IpAddr,
    /// Subnet of the address, when a device carries it.
    pub cidr: Option<IpNet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Empty when the address is known but no device reports it.
    pub interface_name: String,
    pub addresses: Vec<InterfaceAddress>,
}

pub struct NetworkInfo {
    state: Arc<dyn State>,
    inventory: AddressInventory,
    retry_factory: RetryFactory,
    egress_subnets: Vec<IpNet>,
    abort: CancellationToken,
}

impl NetworkInfo {
    /// Without a factory every poll gives up after a millisecond.
    pub fn new(state: Arc<dyn State>, unit: UnitId, retry_factory: Option<RetryFactory>) -> Self {
        Self {
            inventory: AddressInventory::new(Arc::clone(&state), unit),
            state,
            retry_factory: retry_factory.unwrap_or_else(RetryPolicy::fail_fast),
            egress_subnets: Vec::new(),
            abort: CancellationToken::new(),
        }
    }

    /// Model-level egress subnets; when set they replace derived egress.
    pub fn with_egress_subnets(mut self, subnets: Vec<IpNet>) -> Self {
        self.egress_subnets = subnets;
        self
    }

    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn unit(&self) -> &UnitId {
        self.inventory.unit()
    }

    /// Space bound to `endpoint` of the unit's application.
    pub async fn bound_space(&self, endpoint: &str) -> Result<SpaceId> {
        let app = self.state.application(self.unit().application()).await?;
        Ok(app.bindings.space_for(endpoint))
    }

    async fn is_cross_model(&self, relation: &Relation) -> Result<bool> {
        for ep in &relation.endpoints {
            if self.state.application(&ep.application).await?.remote {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn networks_for_relation(
        &self,
        endpoint: &str,
        relation: &Relation,
        poll_public: bool,
    ) -> Result<RelationNetworks> {
        let space = self.bound_space(endpoint).await?;
        let host = self.inventory.host().await?;

        let ingress: Vec<Address> = if host == UnitHost::CloudService {
            let pool = self.inventory.cloud_service_addresses().await?;
            select_address(&pool, Scope::CloudLocal)
                .cloned()
                .into_iter()
                .collect()
        } else if self.is_cross_model(relation).await? {
            self.cross_model_ingress(relation, poll_public).await?
        } else {
            self.local_ingress(&space, &host).await?
        };

        let egress = if self.egress_subnets.is_empty() {
            ingress.iter().map(Address::host_cidr).collect()
        } else {
            self.egress_subnets.clone()
        };
        debug!(
            "unit {} relation {}: space {}, ingress {:?}",
            self.unit(),
            relation.key(),
            space,
            ingress.iter().map(ToString::to_string).collect::<Vec<_>>()
        );
        Ok(RelationNetworks {
            space,
            ingress,
            egress,
        })
    }

    async fn local_ingress(&self, space: &SpaceId, host: &UnitHost) -> Result<Vec<Address>> {
        let pool = self.inventory.all_addresses().await?;
        if space.is_alpha() {
            return match select_address(&pool, Scope::CloudLocal) {
                Some(addr) => Ok(vec![addr.clone()]),
                None => {
                    warn!("no private address for unit {}", self.unit());
                    Ok(Vec::new())
                }
            };
        }

        let devices = self.inventory.devices_by_space().await?;
        let from_devices: Vec<Address> = devices
            .get(space)
            .into_iter()
            .flatten()
            .map(|info| AddressInventory::device_to_address(info, &pool))
            .collect();
        if !from_devices.is_empty() {
            return Ok(from_devices);
        }

        let subnets = self.state.subnets().await?;
        let in_space: Vec<Address> = pool
            .into_iter()
            .filter(|addr| space_of(&addr.value, &subnets) == *space)
            .collect();
        if !in_space.is_empty() {
            return Ok(in_space);
        }
        Err(Error::NoAddressInSpace {
            space: space.to_string(),
            machine: machine_name(host),
        })
    }

    async fn cross_model_ingress(&self, relation: &Relation, poll_public: bool) -> Result<Vec<Address>> {
        if poll_public {
            match self.poll_for_address(Scope::Public).await {
                Ok(addr) => return Ok(vec![addr]),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => warn!(
                    "unit {} relation {}: {}; falling back to a private address",
                    self.unit(),
                    relation.key(),
                    err
                ),
            }
        }
        Ok(vec![self.poll_for_address(Scope::CloudLocal).await?])
    }

    async fn poll_for_address(&self, scope: Scope) -> Result<Address> {
        let policy = (self.retry_factory)();
        let inventory = &self.inventory;
        policy
            .call(&self.abort, || async move {
                match inventory.select_exact(scope).await? {
                    Some(addr) => Ok(addr),
                    None if scope == Scope::Public => Err(Error::NoPublicAddress(inventory.unit().to_string())),
                    None => Err(Error::NoPrivateAddress(inventory.unit().to_string())),
                }
            })
            .await
    }

    /// Interfaces of the unit's machine in each of `spaces`.  A space with
    /// nothing on the machine maps to [`Error::NoAddressInSpace`].
    pub async fn machine_network_infos(
        &self,
        spaces: &[SpaceId],
    ) -> Result<BTreeMap<SpaceId, Result<Vec<InterfaceInfo>>>> {
        let host = self.inventory.host().await?;
        let machine = match &host {
            UnitHost::Machine(id) => id.clone(),
            UnitHost::CloudService | UnitHost::Unassigned => {
                return Err(Error::not_found(format!("machine for unit {}", self.unit())))
            }
        };
        let by_space = self.inventory.devices_by_space().await?;

        let mut results = BTreeMap::new();
        for space in spaces {
            let result = if space.is_alpha() {
                self.alpha_interface(&machine).await
            } else {
                match by_space.get(space) {
                    Some(infos) if !infos.is_empty() => Ok(group_by_interface(infos)),
                    _ => Err(Error::NoAddressInSpace {
                        space: space.to_string(),
                        machine: machine.clone(),
                    }),
                }
            };
            results.insert(space.clone(), result);
        }
        Ok(results)
    }

    /// The device carrying the machine's preferred private address.
    async fn alpha_interface(&self, machine: &str) -> Result<Vec<InterfaceInfo>> {
        let pool = self.inventory.all_addresses().await?;
        let Some(preferred) = select_address(&pool, Scope::CloudLocal) else {
            return Err(Error::NoAddressInSpace {
                space: SpaceId::ALPHA.to_string(),
                machine: machine.to_string(),
            });
        };
        let devices = self.inventory.devices_by_space().await?;
        let carrier = devices
            .values()
            .flatten()
            .find(|info| info.address.ip() == preferred.value);
        Ok(vec![match carrier {
            Some(info) => InterfaceInfo {
                interface_name: info.device.name.clone(),
                addresses: vec![InterfaceAddress {
                    address: preferred.value,
                    cidr: Some(info.address.subnet_cidr()),
                }],
            },
            None => InterfaceInfo {
                interface_name: String::new(),
                addresses: vec![InterfaceAddress {
                    address: preferred.value,
                    cidr: None,
                }],
            },
        }])
    }
}

fn machine_name(host: &UnitHost) -> String {
    match host {
        UnitHost::Machine(id) => id.clone(),
        UnitHost::CloudService | UnitHost::Unassigned => String::new(),
    }
}

fn group_by_interface(infos: &[DeviceInfo]) -> Vec<InterfaceInfo> {
    let mut grouped: Vec<InterfaceInfo> = Vec::new();
    for info in infos {
        let address = InterfaceAddress {
            address: info.address.ip(),
            cidr: Some(info.address.subnet_cidr()),
        };
        match grouped.iter_mut().find(|g| g.interface_name == info.device.name) {
            Some(existing) => existing.addresses.push(address),
            None => grouped.push(InterfaceInfo {
                interface_name: info.device.name.clone(),
                addresses: vec![address],
            }),
        }
    }
    grouped
}
