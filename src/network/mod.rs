//! Network model: addresses, spaces, subnets and link-layer devices.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

pub mod inventory;
pub mod resolver;

pub use inventory::{AddressInventory, DeviceInfo};
pub use resolver::{InterfaceAddress, InterfaceInfo, NetworkInfo, RelationNetworks};

/// Identifier of a network space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceId(String);

impl SpaceId {
    pub const ALPHA: &'static str = "alpha";

    /// The implicit default space.  It may have no subnets.
    pub fn alpha() -> Self {
        SpaceId(Self::ALPHA.to_string())
    }

    pub fn is_alpha(&self) -> bool {
        self.0 == Self::ALPHA
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SpaceId {
    fn from(s: &str) -> Self {
        SpaceId(s.to_string())
    }
}

impl From<String> for SpaceId {
    fn from(s: String) -> Self {
        SpaceId(s)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    MachineLocal,
    LinkLocal,
    CloudLocal,
    Public,
}

impl Scope {
    /// The scope tried when nothing matches `self`.
    pub fn fallback(self) -> Option<Scope> {
        match self {
            Scope::Public => Some(Scope::CloudLocal),
            Scope::CloudLocal => Some(Scope::Public),
            Scope::MachineLocal | Scope::LinkLocal => None,
        }
    }
}

/// Where an address was learned from.  Declaration order is preference
/// order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Provider,
    Machine,
    Container,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub value: IpAddr,
    pub scope: Scope,
    #[serde(default)]
    pub origin: Origin,
}

impl Address {
    pub fn new(value: IpAddr, scope: Scope, origin: Origin) -> Self {
        Self {
            value,
            scope,
            origin,
        }
    }

    /// Parses `value` as an IP address.
    pub fn parse(value: &str, scope: Scope, origin: Origin) -> crate::Result<Self> {
        let ip = value
            .parse()
            .map_err(|_| crate::Error::InvalidAddress(value.to_string()))?;
        Ok(Self::new(ip, scope, origin))
    }

    /// The `/32` or `/128` network holding exactly this address.
    pub fn host_cidr(&self) -> IpNet {
        IpNet::from(self.value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// A subnet belongs to exactly one space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub cidr: IpNet,
    pub space: SpaceId,
}

/// Space holding `ip`: the most specific subnet containing it, else alpha.
pub fn space_of(ip: &IpAddr, subnets: &[Subnet]) -> SpaceId {
    subnets
        .iter()
        .filter(|subnet| subnet.cidr.contains(ip))
        .max_by_key(|subnet| subnet.cidr.prefix_len())
        .map(|subnet| subnet.space.clone())
        .unwrap_or_else(SpaceId::alpha)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Ethernet,
    Bridge,
    Bond,
    Vlan,
    Loopback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkLayerDevice {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: DeviceType,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default = "default_up")]
    pub is_up: bool,
}

fn default_up() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigMethod {
    #[default]
    Static,
    Dynamic,
    Manual,
    Loopback,
}

/// An address configured on a device, written with its prefix length
/// (`10.0.0.20/24`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub device: String,
    pub cidr: IpNet,
    #[serde(default)]
    pub config_method: ConfigMethod,
}

impl DeviceAddress {
    pub fn ip(&self) -> IpAddr {
        self.cidr.addr()
    }

    /// The network part, e.g. `10.0.0.0/24`.
    pub fn subnet_cidr(&self) -> IpNet {
        self.cidr.trunc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(cidr: &str, space: &str) -> Subnet {
        Subnet {
            cidr: cidr.parse().unwrap(),
            space: space.into(),
        }
    }

    #[test]
    fn host_cidr_is_full_length() {
        let v4 = Address::parse("1.2.3.4", Scope::Public, Origin::Provider).unwrap();
        assert_eq!(v4.host_cidr().to_string(), "1.2.3.4/32");
        let v6 = Address::parse("fc00::1", Scope::CloudLocal, Origin::Machine).unwrap();
        assert_eq!(v6.host_cidr().to_string(), "fc00::1/128");
        assert!(Address::parse("not-an-ip", Scope::Public, Origin::Provider).is_err());
    }

    #[test]
    fn unmatched_addresses_belong_to_alpha() {
        let subnets = vec![subnet("10.0.0.0/8", "wide"), subnet("10.1.0.0/16", "narrow")];
        assert_eq!(space_of(&"10.1.2.3".parse().unwrap(), &subnets), "narrow".into());
        assert_eq!(space_of(&"10.2.2.3".parse().unwrap(), &subnets), "wide".into());
        assert_eq!(space_of(&"192.168.0.1".parse().unwrap(), &subnets), SpaceId::alpha());
    }

    #[test]
    fn device_address_reports_its_subnet() {
        let addr = DeviceAddress {
            device: "eth0".into(),
            cidr: "10.0.0.20/24".parse().unwrap(),
            config_method: ConfigMethod::Static,
        };
        assert_eq!(addr.ip().to_string(), "10.0.0.20");
        assert_eq!(addr.subnet_cidr().to_string(), "10.0.0.0/24");
    }
}
