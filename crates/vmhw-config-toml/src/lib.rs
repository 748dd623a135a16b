// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use vmhw::clone::CloneSettings;
use vmhw::reconcile::DeclaredHardware;
use vmhw_types::DeviceKey;

pub mod spec;

/// A VM's declared hardware, as written by an operator.
///
/// Entries also carry the state computed by the last successful apply
/// (`key`, `unit_number`, `bus_number`). It is written back by
/// [`Config::record_state`] and is what ties an entry to its device on the
/// next run.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    /// The datastore for disks that don't name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore_id: Option<String>,

    #[serde(default)]
    pub sata_controller_count: usize,

    #[serde(default)]
    pub scsi: Scsi,

    #[serde(default, rename = "disk")]
    pub disks: Vec<Disk>,

    #[serde(default, rename = "network_interface")]
    pub network_interfaces: Vec<NetworkInterface>,

    #[serde(default, rename = "cdrom")]
    pub cdroms: Vec<Cdrom>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone: Option<CloneSource>,
}

/// The VM's SCSI controllers. They are numbered from bus 0 upwards and all
/// share one model.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Scsi {
    #[serde(default = "default_scsi_type", rename = "type")]
    pub scsi_type: String,

    #[serde(default = "default_scsi_controller_count")]
    pub controller_count: usize,

    #[serde(default = "default_bus_sharing")]
    pub bus_sharing: String,
}

impl Default for Scsi {
    fn default() -> Self {
        Self {
            scsi_type: default_scsi_type(),
            controller_count: default_scsi_controller_count(),
            bus_sharing: default_bus_sharing(),
        }
    }
}

fn default_scsi_type() -> String {
    "pvscsi".to_owned()
}

fn default_scsi_controller_count() -> usize {
    1
}

fn default_bus_sharing() -> String {
    "noSharing".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_limit() -> i64 {
    -1
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Disk {
    /// Size in GiB.
    pub size: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore_id: Option<String>,

    #[serde(default = "default_true")]
    pub thin_provisioned: bool,

    #[serde(default)]
    pub eagerly_scrub: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_mode: Option<String>,

    #[serde(default = "default_limit")]
    pub io_limit: i64,

    #[serde(default)]
    pub io_reservation: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_share_level: Option<String>,

    #[serde(default)]
    pub io_share_count: i32,

    #[serde(default)]
    pub keep_on_remove: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<DeviceKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_number: Option<i32>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct NetworkInterface {
    pub network_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_type: Option<String>,

    #[serde(default)]
    pub use_static_mac: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,

    #[serde(default = "default_limit")]
    pub bandwidth_limit: i64,

    #[serde(default)]
    pub bandwidth_reservation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_share_level: Option<String>,

    #[serde(default)]
    pub bandwidth_share_count: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<DeviceKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_number: Option<i32>,
}

/// An optical drive, backed by either an ISO image (`datastore_id` and
/// `path`) or the client's drive (`client_device`), never both.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Cdrom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default)]
    pub client_device: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<DeviceKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_number: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_number: Option<i32>,
}

/// Where the VM is cloned from, if it is a clone.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct CloneSource {
    pub template_uuid: String,

    #[serde(default)]
    pub linked_clone: bool,
}

impl From<&CloneSource> for CloneSettings {
    fn from(clone: &CloneSource) -> Self {
        CloneSettings {
            template_uuid: clone.template_uuid.clone(),
            linked_clone: clone.linked_clone,
        }
    }
}

impl Config {
    /// Writes the computed state of a successful run back into the
    /// matching entries. `declared` must have come from this config.
    pub fn record_state(&mut self, declared: &DeclaredHardware) {
        for (disk, state) in self.disks.iter_mut().zip(&declared.disks) {
            disk.key = state.key;
            disk.unit_number = state.unit_number;
        }
        for (nic, state) in
            self.network_interfaces.iter_mut().zip(&declared.network_interfaces)
        {
            nic.key = state.key;
            nic.unit_number = state.unit_number;
        }
        for (cdrom, state) in self.cdroms.iter_mut().zip(&declared.cdroms) {
            cdrom.key = state.key;
            cdrom.bus_number = state.bus_number;
            cdrom.unit_number = state.unit_number;
        }
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}

/// Errors which may be returned when parsing a hardware configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

#[cfg(test)]
mod test {
    use super::*;
    use vmhw::subresource::DiskConfig;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config { ..Default::default() };
        let serialized = dummy_config.to_toml_string().unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn parse_basic_config() {
        let raw = r#"
datastore_id = "datastore-11"
sata_controller_count = 1

[scsi]
type = "lsilogic-sas"
controller_count = 2

[[disk]]
size = 20

[[disk]]
size = 100
thin_provisioned = false
keep_on_remove = true
key = 2001
unit_number = 16

[[network_interface]]
network_id = "network-12"

[[network_interface]]
network_id = "dvportgroup-40"
adapter_type = "e1000"
use_static_mac = true
mac_address = "00:50:56:aa:bb:cc"

[[cdrom]]
client_device = true

[clone]
template_uuid = "4207c3a1-0000-4000-8000-00000000beef"
linked_clone = true
"#;
        let cfg: Config = toml::de::from_str(raw).unwrap();

        assert_eq!(cfg.datastore_id.as_deref(), Some("datastore-11"));
        assert_eq!(cfg.scsi.scsi_type, "lsilogic-sas");
        assert_eq!(cfg.scsi.controller_count, 2);
        assert_eq!(cfg.scsi.bus_sharing, "noSharing");
        assert_eq!(cfg.sata_controller_count, 1);

        assert_eq!(cfg.disks.len(), 2);
        assert!(cfg.disks[0].thin_provisioned);
        assert_eq!(cfg.disks[0].io_limit, -1);
        assert_eq!(cfg.disks[0].key, None);
        assert!(!cfg.disks[1].thin_provisioned);
        assert_eq!(cfg.disks[1].key, Some(DeviceKey(2001)));
        assert_eq!(cfg.disks[1].unit_number, Some(16));

        assert_eq!(cfg.network_interfaces[0].adapter_type, None);
        assert_eq!(
            cfg.network_interfaces[1].adapter_type.as_deref(),
            Some("e1000")
        );
        assert!(cfg.cdroms[0].client_device);

        let settings = CloneSettings::from(cfg.clone.as_ref().unwrap());
        assert!(settings.linked_clone);
    }

    #[test]
    fn scsi_defaults_apply_without_a_table() {
        let cfg: Config = toml::de::from_str("[[disk]]\nsize = 8\n").unwrap();
        assert_eq!(cfg.scsi, Scsi::default());
        assert_eq!(cfg.scsi.controller_count, 1);
        assert!(cfg.clone.is_none());
    }

    #[test]
    fn recorded_state_survives_a_rewrite() {
        let mut cfg: Config =
            toml::de::from_str("[[disk]]\nsize = 8\n[[disk]]\nsize = 9\n")
                .unwrap();
        let declared = DeclaredHardware {
            disks: vec![
                DiskConfig {
                    key: Some(DeviceKey(2000)),
                    unit_number: Some(0),
                    ..DiskConfig::new(8)
                },
                DiskConfig {
                    key: Some(DeviceKey(2001)),
                    unit_number: Some(1),
                    ..DiskConfig::new(9)
                },
            ],
            ..Default::default()
        };
        cfg.record_state(&declared);

        let text = cfg.to_toml_string().unwrap();
        let reread: Config = toml::de::from_str(&text).unwrap();
        assert_eq!(reread, cfg);
        assert_eq!(reread.disks[1].key, Some(DeviceKey(2001)));
        assert_eq!(reread.disks[1].unit_number, Some(1));
    }
}
