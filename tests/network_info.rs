use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uniterd::clock::WallClock;
use uniterd::network::{
    Address, ConfigMethod, DeviceAddress, DeviceType, LinkLayerDevice, NetworkInfo, Origin, Scope, SpaceId, Subnet,
};
use uniterd::retry::{RetryFactory, RetryPolicy};
use uniterd::state::{MemoryModel, UnitHost};
use uniterd::types::{Bindings, Endpoint, Life, Relation, RelationScope, Role, UnitId};
use uniterd::Error;

fn wordpress() -> UnitId {
    "wordpress/0".parse().unwrap()
}

fn addr(value: &str, scope: Scope) -> Address {
    Address::parse(value, scope, Origin::Machine).unwrap()
}

fn relation(other: &str) -> Relation {
    Relation {
        id: 1,
        life: Life::Alive,
        scope: RelationScope::Global,
        endpoints: vec![
            Endpoint {
                application: "wordpress".into(),
                role: Role::Requirer,
                name: "db".into(),
                interface: "mysql".into(),
            },
            Endpoint {
                application: other.into(),
                role: Role::Provider,
                name: "server".into(),
                interface: "mysql".into(),
            },
        ],
    }
}

/// wordpress/0 on machine 0, related to a local mysql and a remote mysql.
fn model() -> Arc<MemoryModel> {
    let model = MemoryModel::new();
    model.add_application("wordpress");
    model.add_application("mysql");
    model.add_remote_application("remote-mysql");
    model.add_unit(wordpress(), UnitHost::Machine("0".into())).unwrap();
    Arc::new(model)
}

fn network_info(model: &Arc<MemoryModel>, factory: Option<RetryFactory>) -> NetworkInfo {
    NetworkInfo::new(model.clone(), wordpress(), factory)
}

fn device(name: &str) -> LinkLayerDevice {
    LinkLayerDevice {
        name: name.into(),
        kind: DeviceType::Ethernet,
        parent: None,
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

fn subnet(cidr: &str, space: &str) -> Subnet {
    Subnet {
        cidr: cidr.parse().unwrap(),
        space: space.into(),
    }
}

fn strings<T: ToString>(items: &[T]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

/// A policy that injects `address` into machine 0 after its first failed
/// attempt.
fn injecting_policy(model: &Arc<MemoryModel>, address: Address) -> RetryPolicy {
    let model = model.clone();
    RetryPolicy::new(Arc::new(WallClock), Duration::from_millis(1), Duration::from_secs(1)).with_notify(
        move |_, attempt| {
            if attempt == 1 {
                model.set_machine_addresses("0", vec![address.clone()]).unwrap();
            }
        },
    )
}

#[tokio::test]
async fn local_relation_in_alpha_uses_cloud_local_address() {
    let model = model();
    model
        .set_provider_addresses(
            "0",
            vec![addr("1.2.3.4", Scope::CloudLocal), addr("4.3.2.1", Scope::Public)],
        )
        .unwrap();

    let nets = network_info(&model, None)
        .networks_for_relation("", &relation("mysql"), true)
        .await
        .unwrap();
    assert_eq!(nets.space, SpaceId::alpha());
    assert_eq!(strings(&nets.ingress), vec!["1.2.3.4"]);
    assert_eq!(strings(&nets.egress), vec!["1.2.3.4/32"]);
}

#[tokio::test]
async fn local_relation_uses_device_in_bound_space() {
    let model = model();
    for (n, cidr) in ["1.2.0.0/16", "2.2.0.0/16", "3.2.0.0/16", "4.2.0.0/16"].iter().enumerate() {
        model.add_subnet(subnet(cidr, &format!("s{}", n + 1)));
    }
    model
        .set_bindings("wordpress", Bindings::new().with("", "s3"))
        .unwrap();
    for (n, cidr) in ["1.2.3.4/16", "2.2.3.4/16", "3.2.3.4/16", "4.3.2.1/16"].iter().enumerate() {
        let name = format!("eth{n}");
        model.set_device("0", device(&name)).unwrap();
        model.add_device_address("0", device_address(&name, cidr)).unwrap();
    }

    let nets = network_info(&model, None)
        .networks_for_relation("db", &relation("mysql"), true)
        .await
        .unwrap();
    assert_eq!(nets.space, SpaceId::from("s3"));
    assert_eq!(strings(&nets.ingress), vec!["3.2.3.4"]);
    assert_eq!(strings(&nets.egress), vec!["3.2.3.4/32"]);
}

#[tokio::test]
async fn local_relation_without_address_in_space_fails() {
    let model = model();
    model.add_subnet(subnet("10.10.0.0/24", "dmz"));
    model
        .set_bindings("wordpress", Bindings::new().with("db", "dmz"))
        .unwrap();
    model
        .set_machine_addresses("0", vec![addr("10.0.0.5", Scope::CloudLocal)])
        .unwrap();

    let err = network_info(&model, None)
        .networks_for_relation("db", &relation("mysql"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoAddressInSpace { ref space, ref machine } if space == "dmz" && machine == "0"));
}

#[tokio::test]
async fn local_relation_falls_back_to_pool_addresses_in_space() {
    let model = model();
    model.add_subnet(subnet("10.10.0.0/24", "dmz"));
    model
        .set_bindings("wordpress", Bindings::new().with("db", "dmz"))
        .unwrap();
    model
        .set_machine_addresses(
            "0",
            vec![addr("10.0.0.5", Scope::CloudLocal), addr("10.10.0.7", Scope::CloudLocal)],
        )
        .unwrap();

    let nets = network_info(&model, None)
        .networks_for_relation("db", &relation("mysql"), false)
        .await
        .unwrap();
    assert_eq!(nets.space, SpaceId::from("dmz"));
    assert_eq!(strings(&nets.ingress), vec!["10.10.0.7"]);
}

#[tokio::test]
async fn cross_model_prefers_public_address() {
    let model = model();
    model
        .set_machine_addresses(
            "0",
            vec![addr("1.2.3.4", Scope::CloudLocal), addr("4.3.2.1", Scope::Public)],
        )
        .unwrap();

    let nets = network_info(&model, None)
        .networks_for_relation("", &relation("remote-mysql"), true)
        .await
        .unwrap();
    assert_eq!(nets.space, SpaceId::alpha());
    assert_eq!(strings(&nets.ingress), vec!["4.3.2.1"]);
    assert_eq!(strings(&nets.egress), vec!["4.3.2.1/32"]);
}

#[tokio::test]
async fn cross_model_falls_back_to_cloud_local() {
    let model = model();
    model
        .set_machine_addresses("0", vec![addr("1.2.3.4", Scope::CloudLocal)])
        .unwrap();

    let nets = network_info(&model, None)
        .networks_for_relation("", &relation("remote-mysql"), true)
        .await
        .unwrap();
    assert_eq!(strings(&nets.ingress), vec!["1.2.3.4"]);
    assert_eq!(strings(&nets.egress), vec!["1.2.3.4/32"]);
}

#[tokio::test]
async fn cross_model_without_public_poll_uses_cloud_local() {
    let model = model();
    model
        .set_machine_addresses(
            "0",
            vec![addr("1.2.3.4", Scope::CloudLocal), addr("4.3.2.1", Scope::Public)],
        )
        .unwrap();

    let nets = network_info(&model, None)
        .networks_for_relation("", &relation("remote-mysql"), false)
        .await
        .unwrap();
    assert_eq!(strings(&nets.ingress), vec!["1.2.3.4"]);
}

#[tokio::test]
async fn cross_model_waits_for_late_public_address() {
    let model = model();
    let calls = Arc::new(AtomicU32::new(0));
    let factory: RetryFactory = {
        let model = model.clone();
        let calls = calls.clone();
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            injecting_policy(&model, addr("4.3.2.1", Scope::Public))
        })
    };

    let nets = network_info(&model, Some(factory))
        .networks_for_relation("", &relation("remote-mysql"), true)
        .await
        .unwrap();
    assert_eq!(nets.space, SpaceId::alpha());
    assert_eq!(strings(&nets.ingress), vec!["4.3.2.1"]);
    assert_eq!(strings(&nets.egress), vec!["4.3.2.1/32"]);
    // The private fallback never ran.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cross_model_waits_for_late_private_address() {
    let model = model();
    let calls = Arc::new(AtomicU32::new(0));
    let factory: RetryFactory = {
        let model = model.clone();
        let calls = calls.clone();
        Arc::new(move || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                RetryPolicy::new(Arc::new(WallClock), Duration::from_millis(1), Duration::from_millis(1))
            } else {
                injecting_policy(&model, addr("4.3.2.1", Scope::CloudLocal))
            }
        })
    };

    let nets = network_info(&model, Some(factory))
        .networks_for_relation("", &relation("remote-mysql"), true)
        .await
        .unwrap();
    assert_eq!(strings(&nets.ingress), vec!["4.3.2.1"]);
    assert_eq!(strings(&nets.egress), vec!["4.3.2.1/32"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cross_model_with_no_address_reports_private_exhaustion() {
    let model = model();
    let err = network_info(&model, None)
        .networks_for_relation("", &relation("remote-mysql"), true)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), Error::NoPrivateAddress(_)));
}

#[tokio::test]
async fn cross_model_poll_stops_on_abort() {
    let model = model();
    let abort = CancellationToken::new();
    abort.cancel();
    let err = network_info(&model, Some(RetryPolicy::factory(Duration::from_secs(1), Duration::from_secs(60))))
        .with_abort(abort)
        .networks_for_relation("", &relation("remote-mysql"), true)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn egress_overrides_replace_derived_cidrs() {
    let model = model();
    model
        .set_provider_addresses("0", vec![addr("1.2.3.4", Scope::CloudLocal)])
        .unwrap();
    let nets = network_info(&model, None)
        .with_egress_subnets(vec!["192.168.0.0/16".parse().unwrap()])
        .networks_for_relation("", &relation("mysql"), true)
        .await
        .unwrap();
    assert_eq!(strings(&nets.ingress), vec!["1.2.3.4"]);
    assert_eq!(strings(&nets.egress), vec!["192.168.0.0/16"]);
}

#[tokio::test]
async fn cloud_service_unit_uses_service_address() {
    let model = MemoryModel::new();
    model.add_application("wordpress");
    model.add_application("mysql");
    model.add_unit(wordpress(), UnitHost::CloudService).unwrap();
    let model = Arc::new(model);

    // No service address yet.
    let nets = network_info(&model, None)
        .networks_for_relation("db", &relation("mysql"), true)
        .await
        .unwrap();
    assert_eq!(nets.space, SpaceId::alpha());
    assert!(nets.ingress.is_empty());
    assert!(nets.egress.is_empty());

    model
        .set_service_addresses(
            "wordpress",
            vec![addr("35.1.1.1", Scope::Public), addr("10.152.183.7", Scope::CloudLocal)],
        )
        .unwrap();

    let nets = network_info(&model, None)
        .networks_for_relation("db", &relation("mysql"), true)
        .await
        .unwrap();
    assert_eq!(strings(&nets.ingress), vec!["10.152.183.7"]);
    assert_eq!(strings(&nets.egress), vec!["10.152.183.7/32"]);
}

#[tokio::test]
async fn machine_network_infos_fan_out_per_space() {
    let model = model();
    model.add_subnet(subnet("10.0.0.0/24", "default"));
    model.add_subnet(subnet("10.10.0.0/24", "dmz"));
    model.add_subnet(subnet("10.20.0.0/24", "private"));
    add_three_nics(&model);

    let spaces: Vec<SpaceId> = vec!["default".into(), "dmz".into(), "666".into(), SpaceId::alpha()];
    let infos = network_info(&model, None).machine_network_infos(&spaces).await.unwrap();
    assert_eq!(infos.len(), 4);

    let check = |space: &str, name: &str, address: &str, cidr: &str| {
        let result = infos[&SpaceId::from(space)].as_ref().unwrap();
        assert_eq!(result.len(), 1, "{space}");
        assert_eq!(result[0].interface_name, name);
        assert_eq!(result[0].addresses.len(), 1);
        assert_eq!(result[0].addresses[0].address.to_string(), address);
        assert_eq!(result[0].addresses[0].cidr.unwrap().to_string(), cidr);
    };
    check("default", "br-eth0", "10.0.0.20", "10.0.0.0/24");
    check("dmz", "eth1", "10.10.0.20", "10.10.0.0/24");
    check(SpaceId::ALPHA, "eth2", "10.20.0.20", "10.20.0.0/24");

    let err = infos[&SpaceId::from("666")].as_ref().unwrap_err();
    assert_eq!(err.to_string(), r#"machine "0" has no devices in space "666""#);
}

#[tokio::test]
async fn machine_network_infos_alpha_without_subnets() {
    let model = model();
    add_three_nics(&model);

    let infos = network_info(&model, None)
        .machine_network_infos(&[SpaceId::alpha()])
        .await
        .unwrap();
    assert_eq!(infos.len(), 1);
    let alpha = infos[&SpaceId::alpha()].as_ref().unwrap();
    assert_eq!(alpha.len(), 1);
    assert_eq!(alpha[0].interface_name, "eth2");
    assert_eq!(alpha[0].addresses[0].address.to_string(), "10.20.0.20");
    assert_eq!(alpha[0].addresses[0].cidr.unwrap().to_string(), "10.20.0.0/24");
}

/// A bridge over eth0 plus eth1 and eth2, each with one address, and the
/// machine addresses the agent observed for them.
fn add_three_nics(model: &MemoryModel) {
    model
        .set_device(
            "0",
            LinkLayerDevice {
                kind: DeviceType::Bridge,
                ..device("br-eth0")
            },
        )
        .unwrap();
    model
        .set_device(
            "0",
            LinkLayerDevice {
                parent: Some("br-eth0".into()),
                ..device("eth0")
            },
        )
        .unwrap();
    model.set_device("0", device("eth1")).unwrap();
    model.set_device("0", device("eth2")).unwrap();
    model.add_device_address("0", device_address("br-eth0", "10.0.0.20/24")).unwrap();
    model.add_device_address("0", device_address("eth1", "10.10.0.20/24")).unwrap();
    model.add_device_address("0", device_address("eth2", "10.20.0.20/24")).unwrap();
    model
        .set_machine_addresses(
            "0",
            vec![
                addr("10.0.0.20", Scope::Public),
                addr("10.10.0.20", Scope::Public),
                addr("10.10.0.30", Scope::Public),
                addr("10.20.0.20", Scope::CloudLocal),
            ],
        )
        .unwrap();
}
