// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{o, Drain, Logger};
use vmhw::changes::{ChangeOperation, FileOperation};
use vmhw::device::ScsiType;
use vmhw::inventory::{InventoryReader, StaticInventory};
use vmhw::subresource::{
    AdapterType, CdromConfig, ControllerConfig, DiskConfig,
    NetworkInterfaceConfig,
};
use vmhw::{converge, DeclaredHardware, Reconciler};

const VM: &str = "4210f3d9-0000-4000-8000-000000000001";

fn test_logger() -> Logger {
    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    Logger::root(drain, o!("component" => "converge-test"))
}

/// A freshly created VM: the system PCI and IDE controllers plus one
/// paravirtual SCSI controller.
fn inventory() -> StaticInventory {
    let raw = format!(
        r#"{{
        "api_type": "VirtualCenter",
        "networks": [
            {{ "type": "standard", "id": "network-12", "name": "VM Network" }},
            {{
                "type": "distributed_port_group",
                "id": "dvportgroup-40",
                "name": "dvpg-prod",
                "switch_uuid": "50 2a 6b",
                "portgroup_key": "dvportgroup-40"
            }}
        ],
        "datastores": [
            {{ "id": "datastore-11", "name": "datastore1" }},
            {{ "id": "datastore-12", "name": "datastore2" }}
        ],
        "vms": [{{
            "uuid": "{VM}",
            "name": "web-01",
            "power_state": "poweredOff",
            "devices": [
                {{ "key": 100, "kind": {{
                    "type": "controller", "controller_type": "pci",
                    "bus_number": 0 }} }},
                {{ "key": 200, "kind": {{
                    "type": "controller", "controller_type": "ide",
                    "bus_number": 0 }} }},
                {{ "key": 201, "kind": {{
                    "type": "controller", "controller_type": "ide",
                    "bus_number": 1 }} }},
                {{ "key": 1000, "kind": {{
                    "type": "controller",
                    "controller_type": {{ "scsi": "pvscsi" }},
                    "bus_number": 0 }} }}
            ]
        }}]
    }}"#
    );
    serde_json::from_str(&raw).unwrap()
}

fn declared() -> DeclaredHardware {
    DeclaredHardware {
        controllers: vec![ControllerConfig::scsi(0, ScsiType::ParaVirtual)],
        disks: vec![
            DiskConfig::new(16),
            DiskConfig { keep_on_remove: true, ..DiskConfig::new(40) },
        ],
        network_interfaces: vec![
            NetworkInterfaceConfig::new("network-12", AdapterType::Vmxnet3),
            NetworkInterfaceConfig::new("dvportgroup-40", AdapterType::E1000),
        ],
        cdroms: vec![CdromConfig::iso("datastore-12", "iso/installer.iso")],
    }
}

#[test]
fn converges_and_stays_converged() {
    let log = test_logger();
    let mut inv = inventory();
    let resolver = inv.resolver.clone();
    let reconciler = Reconciler::new(&log, &resolver)
        .with_api_type(inv.api_type)
        .with_default_datastore("datastore-11");

    let first = converge(&reconciler, &mut inv, VM, &declared()).unwrap();
    let adds = first
        .changes
        .iter()
        .filter(|c| c.operation == ChangeOperation::Add)
        .count();
    assert_eq!(adds, 5, "{:#?}", first.changes);

    let declared = first.declared;
    assert!(declared.disks.iter().all(|d| d.key.is_some_and(|k| k.is_assigned())));
    assert!(declared
        .network_interfaces
        .iter()
        .all(|n| n.key.is_some_and(|k| k.is_assigned())));
    assert_eq!(
        declared.network_interfaces.iter().map(|n| n.unit_number).collect::<Vec<_>>(),
        vec![Some(7), Some(8)]
    );
    assert_eq!(
        declared.disks.iter().map(|d| d.unit_number).collect::<Vec<_>>(),
        vec![Some(0), Some(1)]
    );

    let second = converge(&reconciler, &mut inv, VM, &declared).unwrap();
    assert!(second.changes.is_empty(), "{:#?}", second.changes);
    assert_eq!(second.declared, declared);
}

#[test]
fn dropping_a_disk_removes_only_that_disk() {
    let log = test_logger();
    let mut inv = inventory();
    let resolver = inv.resolver.clone();
    let reconciler =
        Reconciler::new(&log, &resolver).with_default_datastore("datastore-11");

    let mut declared = converge(&reconciler, &mut inv, VM, &declared())
        .unwrap()
        .declared;
    let before = inv.vm_properties(VM).unwrap().devices.len();
    let gone = declared.disks.remove(0);

    let report = converge(&reconciler, &mut inv, VM, &declared).unwrap();
    assert_eq!(report.changes.len(), 1, "{:#?}", report.changes);
    let change = &report.changes[0];
    assert_eq!(change.operation, ChangeOperation::Remove);
    assert_eq!(Some(change.key()), gone.key);
    assert_eq!(change.file_operation, Some(FileOperation::Destroy));

    let after = inv.vm_properties(VM).unwrap();
    assert_eq!(after.devices.len(), before - 1);
    assert!(after.devices.find(gone.key.unwrap()).is_none());
    assert_eq!(report.declared.disks[0].unit_number, Some(1));
}
