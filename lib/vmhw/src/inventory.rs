// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The remote inventory: reading a VM's hardware and submitting change
//! batches.
//!
//! [`StaticInventory`] is a serializable snapshot of an inventory that
//! implements both sides the way the remote system does. Placeholder keys in
//! a batch are swapped for real ones, and the batch either applies as a
//! whole or not at all.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vmhw_types::{ApiType, DeviceKey, MoRef, PowerState};

use crate::changes::{ChangeOperation, ChangeSpec};
use crate::device::DeviceList;
use crate::resolve::StaticResolver;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTree {
    pub snapshot: MoRef,
    pub name: String,
    #[serde(default)]
    pub child_snapshot_list: Vec<SnapshotTree>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    #[serde(default)]
    pub current_snapshot: Option<MoRef>,
    #[serde(default)]
    pub root_snapshot_list: Vec<SnapshotTree>,
}

/// What the inventory reports about one VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmProperties {
    pub uuid: String,
    pub name: String,
    pub power_state: PowerState,
    #[serde(default)]
    pub snapshot: Option<SnapshotInfo>,
    #[serde(default)]
    pub devices: DeviceList,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("no virtual machine with UUID {0:?}")]
    VmNotFound(String),

    #[error("failed to read inventory {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse inventory {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("no virtual machine with UUID {0:?}")]
    VmNotFound(String),

    #[error("change {index}: added device has assigned key {key}")]
    AssignedKeyOnAdd { index: usize, key: DeviceKey },

    #[error("change {index}: {operation} of unknown device {key}")]
    UnknownDevice {
        index: usize,
        operation: ChangeOperation,
        key: DeviceKey,
    },

    #[error("device {key} refers to missing controller {controller}")]
    DanglingController { key: DeviceKey, controller: DeviceKey },

    #[error(
        "devices {first} and {second} both occupy unit {unit} on controller \
        {controller}"
    )]
    SlotConflict {
        controller: DeviceKey,
        unit: i32,
        first: DeviceKey,
        second: DeviceKey,
    },
}

/// Reads VM state from the inventory.
pub trait InventoryReader {
    fn vm_properties(&self, vm_uuid: &str) -> Result<VmProperties, InventoryError>;
}

/// Submits a change batch as one reconfiguration request.
pub trait ApplySink {
    fn apply(
        &mut self,
        vm_uuid: &str,
        changes: &[ChangeSpec],
    ) -> Result<(), ApplyError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticInventory {
    #[serde(default)]
    pub api_type: ApiType,
    #[serde(flatten)]
    pub resolver: StaticResolver,
    #[serde(default)]
    pub vms: Vec<VmProperties>,
}

impl StaticInventory {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InventoryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| {
            InventoryError::Io { path: path.to_path_buf(), source }
        })?;
        serde_json::from_str(&raw).map_err(|source| InventoryError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), InventoryError> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self).map_err(|source| {
            InventoryError::Parse { path: path.to_path_buf(), source }
        })?;
        std::fs::write(path, raw).map_err(|source| InventoryError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn vm(&self, vm_uuid: &str) -> Option<&VmProperties> {
        self.vms.iter().find(|vm| vm.uuid == vm_uuid)
    }
}

impl InventoryReader for StaticInventory {
    fn vm_properties(&self, vm_uuid: &str) -> Result<VmProperties, InventoryError> {
        self.vm(vm_uuid)
            .cloned()
            .ok_or_else(|| InventoryError::VmNotFound(vm_uuid.to_owned()))
    }
}

impl ApplySink for StaticInventory {
    fn apply(
        &mut self,
        vm_uuid: &str,
        changes: &[ChangeSpec],
    ) -> Result<(), ApplyError> {
        let vm = self
            .vms
            .iter_mut()
            .find(|vm| vm.uuid == vm_uuid)
            .ok_or_else(|| ApplyError::VmNotFound(vm_uuid.to_owned()))?;

        let devices = apply_batch(&vm.devices, changes)?;
        vm.devices = devices;
        Ok(())
    }
}

/// Applies `changes` to a copy of `current`, returning the result only if
/// the whole batch is valid.
fn apply_batch(
    current: &DeviceList,
    changes: &[ChangeSpec],
) -> Result<DeviceList, ApplyError> {
    let mut next_key = current.iter().map(|d| d.key.get()).max().unwrap_or(0).max(0);
    let mut assigned: BTreeMap<DeviceKey, DeviceKey> = BTreeMap::new();
    let mut devices = current.clone();

    for (index, spec) in changes.iter().enumerate() {
        let mut device = spec.device.clone();
        match spec.operation {
            ChangeOperation::Add => {
                if !device.key.is_pending() {
                    return Err(ApplyError::AssignedKeyOnAdd {
                        index,
                        key: device.key,
                    });
                }
                next_key += 1;
                assigned.insert(device.key, DeviceKey(next_key));
                device.key = DeviceKey(next_key);
                devices.append(device);
            }
            ChangeOperation::Edit => {
                let key = device.key;
                if devices.replace(device).is_none() {
                    return Err(ApplyError::UnknownDevice {
                        index,
                        operation: spec.operation,
                        key,
                    });
                }
            }
            ChangeOperation::Remove => {
                if devices.excise(spec.key()).is_none() {
                    return Err(ApplyError::UnknownDevice {
                        index,
                        operation: spec.operation,
                        key: spec.key(),
                    });
                }
            }
        }
    }

    // Placeholder controller keys may be referenced before or after the
    // controller's own add, so they are resolved once the batch is in.
    let devices: DeviceList = devices
        .into_inner()
        .into_iter()
        .map(|mut d| {
            if let Some(real) = assigned.get(&d.controller_key) {
                d.controller_key = *real;
            }
            d
        })
        .collect();

    let mut slots: BTreeMap<(DeviceKey, i32), DeviceKey> = BTreeMap::new();
    for device in &devices {
        if device.controller_key == DeviceKey::NONE {
            continue;
        }
        if devices.find(device.controller_key).is_none() {
            return Err(ApplyError::DanglingController {
                key: device.key,
                controller: device.controller_key,
            });
        }
        if let Some(unit) = device.unit_number {
            if let Some(first) =
                slots.insert((device.controller_key, unit), device.key)
            {
                return Err(ApplyError::SlotConflict {
                    controller: device.controller_key,
                    unit,
                    first,
                    second: device.key,
                });
            }
        }
    }
    Ok(devices)
}
