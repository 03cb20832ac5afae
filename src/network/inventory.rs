//! Address inventory for one unit.
//!
//! Addresses are gathered in preference order: provider, then machine,
//! then cloud service.  Selection walks that order and takes the first
//! match, so origin precedence and upstream order fall out of the pool
//! layout.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::Result;
use crate::network::{space_of, Address, DeviceAddress, DeviceType, LinkLayerDevice, Origin, Scope, SpaceId};
use crate::state::{State, UnitHost};
use crate::types::UnitId;

/// A device together with one of its addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device: LinkLayerDevice,
    pub address: DeviceAddress,
}

/// First address with exactly `scope`.
pub fn first_in_scope(pool: &[Address], scope: Scope) -> Option<&Address> {
    pool.iter().find(|addr| addr.scope == scope)
}

/// First address with `scope`, else the first with its fallback scope.
pub fn select_address(pool: &[Address], scope: Scope) -> Option<&Address> {
    first_in_scope(pool, scope).or_else(|| scope.fallback().and_then(|other| first_in_scope(pool, other)))
}

#[derive(Clone)]
pub struct AddressInventory {
    state: Arc<dyn State>,
    unit: UnitId,
}

impl AddressInventory {
    pub fn new(state: Arc<dyn State>, unit: UnitId) -> Self {
        Self { state, unit }
    }

    pub fn unit(&self) -> &UnitId {
        &self.unit
    }

    pub async fn host(&self) -> Result<UnitHost> {
        Ok(self.state.unit(&self.unit).await?.host)
    }

    async fn machine(&self) -> Result<Option<String>> {
        match self.host().await? {
            UnitHost::Machine(id) => Ok(Some(id)),
            UnitHost::CloudService | UnitHost::Unassigned => Ok(None),
        }
    }

    /// Addresses the provider reports for the unit's machine, in provider
    /// order.
    pub async fn provider_addresses(&self) -> Result<Vec<Address>> {
        match self.machine().await? {
            Some(machine) => self.state.provider_addresses(&machine).await,
            None => Ok(Vec::new()),
        }
    }

    /// Addresses the in-guest agent observed.
    pub async fn machine_addresses(&self) -> Result<Vec<Address>> {
        match self.machine().await? {
            Some(machine) => self.state.machine_addresses(&machine).await,
            None => Ok(Vec::new()),
        }
    }

    /// The cluster service's addresses, for units hosted by one.
    pub async fn cloud_service_addresses(&self) -> Result<Vec<Address>> {
        match self.host().await? {
            UnitHost::CloudService => {
                self.state
                    .cloud_service_addresses(self.unit.application())
                    .await
            }
            UnitHost::Machine(_) | UnitHost::Unassigned => Ok(Vec::new()),
        }
    }

    /// Every known address: provider, machine, then cloud service.
    pub async fn all_addresses(&self) -> Result<Vec<Address>> {
        let mut pool = self.provider_addresses().await?;
        pool.extend(self.machine_addresses().await?);
        pool.extend(self.cloud_service_addresses().await?);
        Ok(pool)
    }

    /// Address for `scope`, falling back to the other of public and
    /// cloud-local.
    pub async fn select(&self, scope: Scope) -> Result<Option<Address>> {
        let pool = self.all_addresses().await?;
        Ok(select_address(&pool, scope).cloned())
    }

    /// Address for exactly `scope`.
    pub async fn select_exact(&self, scope: Scope) -> Result<Option<Address>> {
        let pool = self.all_addresses().await?;
        Ok(first_in_scope(&pool, scope).cloned())
    }

    /// Device addresses of the unit's machine grouped by the space of
    /// their subnet.  Down and loopback devices are skipped, and a NIC is
    /// dropped from a space in which its bridge also appears.
    pub async fn devices_by_space(&self) -> Result<BTreeMap<SpaceId, Vec<DeviceInfo>>> {
        let Some(machine) = self.machine().await? else {
            return Ok(BTreeMap::new());
        };
        let devices = self.state.link_layer_devices(&machine).await?;
        let addresses = self.state.device_addresses(&machine).await?;
        let subnets = self.state.subnets().await?;

        let by_name: BTreeMap<&str, &LinkLayerDevice> =
            devices.iter().map(|d| (d.name.as_str(), d)).collect();
        let bridged = bridged_nics(&devices);

        let mut spaces: BTreeMap<SpaceId, Vec<DeviceInfo>> = BTreeMap::new();
        for address in addresses {
            let Some(device) = by_name.get(address.device.as_str()) else {
                continue;
            };
            if !device.is_up || device.kind == DeviceType::Loopback {
                continue;
            }
            spaces
                .entry(space_of(&address.ip(), &subnets))
                .or_default()
                .push(DeviceInfo {
                    device: (*device).clone(),
                    address,
                });
        }

        for infos in spaces.values_mut() {
            let present: HashSet<String> = infos.iter().map(|i| i.device.name.clone()).collect();
            infos.retain(|info| {
                !bridged
                    .iter()
                    .any(|(nic, bridge)| *nic == info.device.name && present.contains(bridge))
            });
        }
        Ok(spaces)
    }

    /// A device address as an [`Address`], taking the scope of the
    /// matching known address.
    pub fn device_to_address(info: &DeviceInfo, pool: &[Address]) -> Address {
        let ip = info.address.ip();
        let scope = pool
            .iter()
            .find(|known| known.value == ip)
            .map_or(Scope::CloudLocal, |known| known.scope);
        Address::new(ip, scope, Origin::Machine)
    }
}

/// `(nic, bridge)` pairs, whichever side names the other as parent.
fn bridged_nics(devices: &[LinkLayerDevice]) -> Vec<(String, String)> {
    let bridges: HashSet<&str> = devices
        .iter()
        .filter(|d| d.kind == DeviceType::Bridge)
        .map(|d| d.name.as_str())
        .collect();
    let mut pairs = Vec::new();
    for device in devices {
        let Some(parent) = device.parent.as_deref() else {
            continue;
        };
        if device.kind == DeviceType::Bridge {
            pairs.push((parent.to_string(), device.name.clone()));
        } else if bridges.contains(parent) {
            pairs.push((device.name.clone(), parent.to_string()));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConfigMethod, Subnet};
    use crate::state::MemoryModel;

    fn addr(value: &str, scope: Scope, origin: Origin) -> Address {
        Address::parse(value, scope, origin).unwrap()
    }

    fn device(name: &str, kind: DeviceType, parent: Option<&str>) -> LinkLayerDevice {
        LinkLayerDevice {
            name: name.into(),
            kind,
            parent: parent.map(Into::into),
            is_up: true,
        }
    }

    fn device_address(device: &str, cidr: &str) -> DeviceAddress {
        DeviceAddress {
            device: device.into(),
            cidr: cidr.parse().unwrap(),
            config_method: ConfigMethod::Static,
        }
    }

    fn inventory(model: MemoryModel) -> AddressInventory {
        AddressInventory::new(Arc::new(model), "mysql/0".parse().unwrap())
    }

    fn machine_model() -> MemoryModel {
        let model = MemoryModel::new();
        model.add_application("mysql");
        model
            .add_unit("mysql/0".parse().unwrap(), UnitHost::Machine("0".into()))
            .unwrap();
        model
    }

    #[test]
    fn selection_prefers_scope_then_falls_back() {
        let pool = vec![
            addr("4.3.2.1", Scope::Public, Origin::Provider),
            addr("10.0.0.1", Scope::CloudLocal, Origin::Machine),
            addr("10.0.0.2", Scope::CloudLocal, Origin::Machine),
        ];
        assert_eq!(select_address(&pool, Scope::CloudLocal).unwrap().to_string(), "10.0.0.1");
        assert_eq!(select_address(&pool, Scope::Public).unwrap().to_string(), "4.3.2.1");

        let private_only = &pool[1..];
        assert_eq!(select_address(private_only, Scope::Public).unwrap().to_string(), "10.0.0.1");
        assert!(first_in_scope(private_only, Scope::Public).is_none());
        assert!(select_address(&[], Scope::Public).is_none());
    }

    #[tokio::test]
    async fn pool_orders_provider_before_machine() {
        let model = machine_model();
        model
            .set_machine_addresses("0", vec![addr("10.0.0.9", Scope::CloudLocal, Origin::Machine)])
            .unwrap();
        model
            .set_provider_addresses("0", vec![addr("10.0.0.1", Scope::CloudLocal, Origin::Provider)])
            .unwrap();
        let inv = inventory(model);
        let chosen = inv.select(Scope::CloudLocal).await.unwrap().unwrap();
        assert_eq!(chosen.to_string(), "10.0.0.1");
        assert_eq!(chosen.origin, Origin::Provider);
        assert!(inv.cloud_service_addresses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bridge_shadows_its_nic() {
        let model = machine_model();
        model.add_subnet(Subnet {
            cidr: "10.0.0.0/24".parse().unwrap(),
            space: "default".into(),
        });
        model.set_device("0", device("br-eth0", DeviceType::Bridge, None)).unwrap();
        model
            .set_device("0", device("eth0", DeviceType::Ethernet, Some("br-eth0")))
            .unwrap();
        model.set_device("0", device("eth1", DeviceType::Ethernet, None)).unwrap();
        model.add_device_address("0", device_address("eth0", "10.0.0.5/24")).unwrap();
        model.add_device_address("0", device_address("br-eth0", "10.0.0.20/24")).unwrap();
        model.add_device_address("0", device_address("eth1", "192.168.1.4/24")).unwrap();

        let spaces = inventory(model).devices_by_space().await.unwrap();
        let default: Vec<&str> = spaces[&SpaceId::from("default")]
            .iter()
            .map(|i| i.device.name.as_str())
            .collect();
        assert_eq!(default, vec!["br-eth0"]);
        assert_eq!(spaces[&SpaceId::alpha()][0].device.name, "eth1");
    }

    #[tokio::test]
    async fn down_devices_are_ignored() {
        let model = machine_model();
        let mut eth0 = device("eth0", DeviceType::Ethernet, None);
        eth0.is_up = false;
        model.set_device("0", eth0).unwrap();
        model.add_device_address("0", device_address("eth0", "10.0.0.5/24")).unwrap();
        assert!(inventory(model).devices_by_space().await.unwrap().is_empty());
    }
}
