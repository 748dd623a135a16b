// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Functions for converting a [`super::Config`] into the declared hardware
//! the reconciler works from.

use std::str::FromStr;

use thiserror::Error;
use vmhw::device::{
    DiskMode, ScsiBusSharing, ScsiType, SharesLevel, MAX_DISK_SIZE_GIB,
};
use vmhw::reconcile::DeclaredHardware;
use vmhw::subresource::{
    AdapterType, CdromConfig, ControllerConfig, DiskConfig,
    NetworkInterfaceConfig,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TomlToDeclaredError {
    #[error("invalid {field} {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("network interface {0} may not declare an unknown adapter type")]
    UnknownAdapterType(usize),

    #[error("disk {0} has a size out of range")]
    InvalidDiskSize(usize),

    #[error(
        "cdrom {0} must name exactly one of an ISO (datastore_id and path) \
        or the client device"
    )]
    CdromBacking(usize),

    #[error("network interface {0} uses a static MAC but has no mac_address")]
    MissingMacAddress(usize),
}

fn parse_field<T: FromStr>(
    field: &'static str,
    value: &str,
) -> Result<T, TomlToDeclaredError> {
    value.parse().map_err(|_| TomlToDeclaredError::InvalidValue {
        field,
        value: value.to_owned(),
    })
}

fn parse_optional<T: FromStr + Default>(
    field: &'static str,
    value: Option<&str>,
) -> Result<T, TomlToDeclaredError> {
    value.map(|v| parse_field(field, v)).transpose().map(Option::unwrap_or_default)
}

impl TryFrom<&super::Config> for DeclaredHardware {
    type Error = TomlToDeclaredError;

    fn try_from(config: &super::Config) -> Result<Self, Self::Error> {
        let mut declared = DeclaredHardware::default();

        let scsi_type: ScsiType = parse_field("scsi type", &config.scsi.scsi_type)?;
        let sharing: ScsiBusSharing =
            parse_field("scsi bus_sharing", &config.scsi.bus_sharing)?;
        for bus in 0..config.scsi.controller_count {
            declared.controllers.push(ControllerConfig {
                sharing,
                ..ControllerConfig::scsi(bus as i32, scsi_type)
            });
        }
        for bus in 0..config.sata_controller_count {
            declared.controllers.push(ControllerConfig::sata(bus as i32));
        }

        for (index, disk) in config.disks.iter().enumerate() {
            declared.disks.push(parse_disk(index, disk)?);
        }
        for (index, nic) in config.network_interfaces.iter().enumerate() {
            declared.network_interfaces.push(parse_network_interface(index, nic)?);
        }
        for (index, cdrom) in config.cdroms.iter().enumerate() {
            declared.cdroms.push(parse_cdrom(index, cdrom)?);
        }

        Ok(declared)
    }
}

fn parse_disk(
    index: usize,
    disk: &super::Disk,
) -> Result<DiskConfig, TomlToDeclaredError> {
    if disk.size <= 0 || disk.size > MAX_DISK_SIZE_GIB {
        return Err(TomlToDeclaredError::InvalidDiskSize(index));
    }
    let disk_mode: DiskMode =
        parse_optional("disk_mode", disk.disk_mode.as_deref())?;
    let io_share_level: SharesLevel =
        parse_optional("io_share_level", disk.io_share_level.as_deref())?;

    Ok(DiskConfig {
        size_gib: disk.size,
        unit_number: disk.unit_number,
        datastore_id: disk.datastore_id.clone(),
        thin_provisioned: disk.thin_provisioned,
        eagerly_scrub: disk.eagerly_scrub,
        disk_mode,
        io_limit: disk.io_limit,
        io_reservation: disk.io_reservation,
        io_share_level,
        io_share_count: disk.io_share_count,
        keep_on_remove: disk.keep_on_remove,
        key: disk.key,
        file_name: None,
    })
}

fn parse_network_interface(
    index: usize,
    nic: &super::NetworkInterface,
) -> Result<NetworkInterfaceConfig, TomlToDeclaredError> {
    let adapter_type: AdapterType =
        parse_optional("adapter_type", nic.adapter_type.as_deref())?;
    if adapter_type == AdapterType::Unknown {
        return Err(TomlToDeclaredError::UnknownAdapterType(index));
    }
    if nic.use_static_mac && nic.mac_address.is_none() {
        return Err(TomlToDeclaredError::MissingMacAddress(index));
    }
    let bandwidth_share_level: SharesLevel = parse_optional(
        "bandwidth_share_level",
        nic.bandwidth_share_level.as_deref(),
    )?;

    Ok(NetworkInterfaceConfig {
        network_id: nic.network_id.clone(),
        adapter_type,
        use_static_mac: nic.use_static_mac,
        mac_address: nic.mac_address.clone(),
        bandwidth_limit: nic.bandwidth_limit,
        bandwidth_reservation: nic.bandwidth_reservation,
        bandwidth_share_level,
        bandwidth_share_count: nic.bandwidth_share_count,
        key: nic.key,
        unit_number: nic.unit_number,
    })
}

fn parse_cdrom(
    index: usize,
    cdrom: &super::Cdrom,
) -> Result<CdromConfig, TomlToDeclaredError> {
    let iso = cdrom.datastore_id.is_some() && cdrom.path.is_some();
    let partial_iso = cdrom.datastore_id.is_some() != cdrom.path.is_some();
    if partial_iso || iso == cdrom.client_device {
        return Err(TomlToDeclaredError::CdromBacking(index));
    }

    Ok(CdromConfig {
        datastore_id: cdrom.datastore_id.clone(),
        path: cdrom.path.clone(),
        client_device: cdrom.client_device,
        key: cdrom.key,
        bus_number: cdrom.bus_number,
        unit_number: cdrom.unit_number,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;
    use vmhw::device::ControllerType;
    use vmhw_types::DeviceKey;

    fn declared(raw: &str) -> Result<DeclaredHardware, TomlToDeclaredError> {
        let config: Config = toml::de::from_str(raw).unwrap();
        DeclaredHardware::try_from(&config)
    }

    #[test]
    fn controllers_come_from_counts() {
        let hw = declared(
            r#"
sata_controller_count = 1

[scsi]
type = "lsilogic"
controller_count = 2
bus_sharing = "virtualSharing"
"#,
        )
        .unwrap();

        let types: Vec<_> = hw
            .controllers
            .iter()
            .map(|c| (c.controller_type, c.bus_number))
            .collect();
        assert_eq!(
            types,
            vec![
                (ControllerType::Scsi(ScsiType::LsiLogic), 0),
                (ControllerType::Scsi(ScsiType::LsiLogic), 1),
                (ControllerType::Sata, 0),
            ]
        );
        assert_eq!(hw.controllers[1].sharing, ScsiBusSharing::VirtualSharing);
    }

    #[test]
    fn entries_keep_their_order_and_state() {
        let hw = declared(
            r#"
[[disk]]
size = 20
disk_mode = "independent_persistent"

[[disk]]
size = 40
key = 2001
unit_number = 1
io_share_level = "high"

[[network_interface]]
network_id = "network-12"
adapter_type = "e1000"

[[cdrom]]
datastore_id = "datastore-11"
path = "iso/os.iso"
"#,
        )
        .unwrap();

        assert_eq!(hw.controllers.len(), 1);
        assert_eq!(hw.disks[0].size_gib, 20);
        assert_eq!(hw.disks[0].disk_mode, DiskMode::IndependentPersistent);
        assert_eq!(hw.disks[1].key, Some(DeviceKey(2001)));
        assert_eq!(hw.disks[1].io_share_level, SharesLevel::High);
        assert_eq!(hw.network_interfaces[0].adapter_type, AdapterType::E1000);
        assert_eq!(hw.cdroms[0].path.as_deref(), Some("iso/os.iso"));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert_eq!(
            declared("[scsi]\ntype = \"megaraid\"\n"),
            Err(TomlToDeclaredError::InvalidValue {
                field: "scsi type",
                value: "megaraid".to_owned(),
            })
        );
        assert_eq!(
            declared("[[network_interface]]\nnetwork_id = \"n\"\nadapter_type = \"unknown\"\n"),
            Err(TomlToDeclaredError::UnknownAdapterType(0))
        );
        assert_eq!(
            declared("[[network_interface]]\nnetwork_id = \"n\"\nuse_static_mac = true\n"),
            Err(TomlToDeclaredError::MissingMacAddress(0))
        );
        assert_eq!(
            declared("[[disk]]\nsize = 0\n"),
            Err(TomlToDeclaredError::InvalidDiskSize(0))
        );
        assert_eq!(
            declared("[[disk]]\nsize = 10\n[[disk]]\nsize = 9223372036854775807\n"),
            Err(TomlToDeclaredError::InvalidDiskSize(1))
        );
        let largest = format!("[[disk]]\nsize = {MAX_DISK_SIZE_GIB}\n");
        assert_eq!(declared(&largest).unwrap().disks[0].size_gib, MAX_DISK_SIZE_GIB);
    }

    #[test]
    fn cdrom_backing_is_exclusive() {
        assert_eq!(
            declared("[[cdrom]]\n"),
            Err(TomlToDeclaredError::CdromBacking(0))
        );
        assert_eq!(
            declared(
                "[[cdrom]]\nclient_device = true\ndatastore_id = \"d\"\npath = \"p\"\n"
            ),
            Err(TomlToDeclaredError::CdromBacking(0))
        );
        assert_eq!(
            declared("[[cdrom]]\ndatastore_id = \"d\"\n"),
            Err(TomlToDeclaredError::CdromBacking(0))
        );
        assert!(declared("[[cdrom]]\nclient_device = true\n").is_ok());
    }
}
