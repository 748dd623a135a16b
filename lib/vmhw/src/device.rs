// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtual hardware model.
//!
//! A VM's hardware is a flat, ordered list of [`VirtualDevice`] records. Each
//! record is addressed two ways: by its [`DeviceKey`], which is unique across
//! the whole VM, and by the pair of its owning controller's key and its unit
//! number, which is unique on that controller. [`DeviceList`] is the arena
//! that holds these records during a reconcile pass; the reconciler is its
//! only mutator and hands subresources temporary access to it.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use vmhw_types::{DeviceKey, MoRef};

/// Keys handed out by [`DeviceList::new_key`] always sit below this value.
const PENDING_KEY_CEILING: i32 = -200;

pub const BYTES_PER_GIB: i64 = 1 << 30;

/// The largest disk size, in GiB, whose byte count fits a capacity field.
pub const MAX_DISK_SIZE_GIB: i64 = i64::MAX / BYTES_PER_GIB;

/// One device in a VM's hardware list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    pub key: DeviceKey,

    /// The key of the controller this device is attached to, or
    /// [`DeviceKey::NONE`] for devices that have no parent.
    #[serde(default)]
    pub controller_key: DeviceKey,

    /// The device's slot on its controller. Unset until assigned.
    #[serde(default)]
    pub unit_number: Option<i32>,

    pub kind: DeviceKind,
}

impl VirtualDevice {
    pub fn new(key: DeviceKey, kind: DeviceKind) -> Self {
        Self { key, controller_key: DeviceKey::NONE, unit_number: None, kind }
    }

    pub fn as_disk(&self) -> Option<&VirtualDisk> {
        match &self.kind {
            DeviceKind::Disk(disk) => Some(disk),
            _ => None,
        }
    }

    pub fn as_disk_mut(&mut self) -> Option<&mut VirtualDisk> {
        match &mut self.kind {
            DeviceKind::Disk(disk) => Some(disk),
            _ => None,
        }
    }

    pub fn as_ethernet_card(&self) -> Option<&EthernetCard> {
        match &self.kind {
            DeviceKind::EthernetCard(card) => Some(card),
            _ => None,
        }
    }

    pub fn as_ethernet_card_mut(&mut self) -> Option<&mut EthernetCard> {
        match &mut self.kind {
            DeviceKind::EthernetCard(card) => Some(card),
            _ => None,
        }
    }

    pub fn as_cdrom(&self) -> Option<&VirtualCdrom> {
        match &self.kind {
            DeviceKind::Cdrom(cdrom) => Some(cdrom),
            _ => None,
        }
    }

    pub fn as_cdrom_mut(&mut self) -> Option<&mut VirtualCdrom> {
        match &mut self.kind {
            DeviceKind::Cdrom(cdrom) => Some(cdrom),
            _ => None,
        }
    }

    pub fn as_controller(&self) -> Option<&VirtualController> {
        match &self.kind {
            DeviceKind::Controller(ctlr) => Some(ctlr),
            _ => None,
        }
    }

    pub fn as_controller_mut(&mut self) -> Option<&mut VirtualController> {
        match &mut self.kind {
            DeviceKind::Controller(ctlr) => Some(ctlr),
            _ => None,
        }
    }
}

/// The kind-specific part of a device record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKind {
    Disk(VirtualDisk),
    EthernetCard(EthernetCard),
    Cdrom(VirtualCdrom),
    Controller(VirtualController),
}

impl DeviceKind {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::Disk(_) => "disk",
            DeviceKind::EthernetCard(_) => "ethernet card",
            DeviceKind::Cdrom(_) => "cdrom",
            DeviceKind::Controller(_) => "controller",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDisk {
    pub capacity_in_bytes: i64,
    pub backing: DiskBacking,
    #[serde(default)]
    pub storage_io_allocation: Option<StorageIoAllocation>,
}

impl VirtualDisk {
    /// Capacity rounded up to whole GiB.
    pub fn size_gib(&self) -> i64 {
        let bytes = self.capacity_in_bytes;
        bytes / BYTES_PER_GIB + i64::from(bytes % BYTES_PER_GIB > 0)
    }
}

/// A flat VMDK file backing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskBacking {
    /// The backing file path. Empty on creation; the server picks a name in
    /// the VM's directory on `datastore`.
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub datastore: Option<MoRef>,
    #[serde(default)]
    pub thin_provisioned: bool,
    #[serde(default)]
    pub eagerly_scrub: bool,
    #[serde(default)]
    pub disk_mode: DiskMode,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiskMode {
    #[default]
    Persistent,
    Nonpersistent,
    Undoable,
    IndependentPersistent,
    IndependentNonpersistent,
    Append,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageIoAllocation {
    pub limit: i64,
    pub reservation: i32,
    pub shares: SharesInfo,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharesInfo {
    pub shares: i32,
    pub level: SharesLevel,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SharesLevel {
    Low,
    #[default]
    Normal,
    High,
    Custom,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthernetCard {
    pub adapter: EthernetAdapter,
    pub backing: EthernetBacking,
    #[serde(default)]
    pub address_type: MacAddressType,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub resource_allocation: Option<BandwidthAllocation>,
    #[serde(default)]
    pub connectable: Connectable,
}

/// The emulated NIC model. The remote system supports more models than
/// users can declare; reads of the others still have to be understood.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EthernetAdapter {
    E1000,
    E1000e,
    Pcnet32,
    Sriov,
    Vmxnet2,
    Vmxnet3,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MacAddressType {
    Manual,
    #[default]
    Generated,
    Assigned,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthAllocation {
    pub limit: Option<i64>,
    pub reservation: Option<i64>,
    pub shares: SharesInfo,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connectable {
    pub start_connected: bool,
    pub allow_guest_control: bool,
    pub connected: bool,
}

impl Connectable {
    /// The connection state every newly attached device starts with.
    pub fn connected() -> Self {
        Self { start_connected: true, allow_guest_control: true, connected: true }
    }
}

/// What a NIC is plugged into.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EthernetBacking {
    /// A standard (host-local) port group.
    Network {
        network: Option<MoRef>,
        #[serde(default)]
        device_name: String,
    },

    /// An NSX-managed network.
    OpaqueNetwork { opaque_network_id: String, opaque_network_type: String },

    /// A port on a distributed virtual switch.
    DistributedVirtualPort { switch_uuid: String, portgroup_key: String },

    /// A backing this crate does not model.
    Other { type_name: String },
}

impl EthernetBacking {
    pub fn type_name(&self) -> &str {
        match self {
            EthernetBacking::Network { .. } => "network",
            EthernetBacking::OpaqueNetwork { .. } => "opaque_network",
            EthernetBacking::DistributedVirtualPort { .. } => {
                "distributed_virtual_port"
            }
            EthernetBacking::Other { type_name } => type_name,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualCdrom {
    pub backing: CdromBacking,
    #[serde(default)]
    pub connectable: Connectable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CdromBacking {
    /// An ISO image on a datastore.
    Iso { datastore: MoRef, file_name: String },

    /// The client's physical drive, passed through by the remote console.
    RemotePassthrough {
        #[serde(default)]
        exclusive: bool,
    },

    Other { type_name: String },
}

impl CdromBacking {
    pub fn type_name(&self) -> &str {
        match self {
            CdromBacking::Iso { .. } => "iso",
            CdromBacking::RemotePassthrough { .. } => "remote_passthrough",
            CdromBacking::Other { type_name } => type_name,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualController {
    pub controller_type: ControllerType,
    pub bus_number: i32,
    #[serde(default)]
    pub sharing: ScsiBusSharing,
}

/// The bus families a controller can drive.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE")]
pub enum BusKind {
    Pci,
    Ide,
    Sata,
    Scsi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    Pci,
    Ide,
    Sata,
    Scsi(ScsiType),
}

impl ControllerType {
    pub fn bus(&self) -> BusKind {
        match self {
            ControllerType::Pci => BusKind::Pci,
            ControllerType::Ide => BusKind::Ide,
            ControllerType::Sata => BusKind::Sata,
            ControllerType::Scsi(_) => BusKind::Scsi,
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum ScsiType {
    #[serde(rename = "lsilogic")]
    #[strum(serialize = "lsilogic")]
    LsiLogic,
    #[serde(rename = "lsilogic-sas")]
    #[strum(serialize = "lsilogic-sas")]
    LsiLogicSas,
    #[serde(rename = "pvscsi")]
    #[strum(serialize = "pvscsi")]
    ParaVirtual,
    #[serde(rename = "buslogic")]
    #[strum(serialize = "buslogic")]
    BusLogic,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ScsiBusSharing {
    #[default]
    NoSharing,
    PhysicalSharing,
    VirtualSharing,
}

/// A VM's device list, as an ordered arena of device records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceList {
    devices: Vec<VirtualDevice>,
}

impl DeviceList {
    pub fn new(devices: Vec<VirtualDevice>) -> Self {
        Self { devices }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VirtualDevice> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn as_slice(&self) -> &[VirtualDevice] {
        &self.devices
    }

    pub fn into_inner(self) -> Vec<VirtualDevice> {
        self.devices
    }

    pub fn find(&self, key: DeviceKey) -> Option<&VirtualDevice> {
        self.devices.iter().find(|d| d.key == key)
    }

    pub fn find_mut(&mut self, key: DeviceKey) -> Option<&mut VirtualDevice> {
        self.devices.iter_mut().find(|d| d.key == key)
    }

    /// Returns a placeholder key for a device about to be added. The key is
    /// lower than every key already in the list, so appending each new
    /// device before asking for the next key never yields a duplicate.
    pub fn new_key(&self) -> DeviceKey {
        let lowest = self
            .devices
            .iter()
            .map(|d| d.key.get())
            .fold(PENDING_KEY_CEILING, i32::min);
        DeviceKey(lowest - 1)
    }

    pub fn append(&mut self, device: VirtualDevice) {
        self.devices.push(device);
    }

    /// Removes the device with `key`, keeping the order of the rest.
    pub fn excise(&mut self, key: DeviceKey) -> Option<VirtualDevice> {
        let pos = self.devices.iter().position(|d| d.key == key)?;
        Some(self.devices.remove(pos))
    }

    /// Replaces the device that has the same key as `device`, in place.
    /// Returns the previous record, or `None` (leaving the list unchanged)
    /// if no device has that key.
    pub fn replace(&mut self, device: VirtualDevice) -> Option<VirtualDevice> {
        let slot = self.devices.iter_mut().find(|d| d.key == device.key)?;
        Some(std::mem::replace(slot, device))
    }

    /// Iterates over the controllers of a bus family, in list order.
    pub fn controllers(
        &self,
        bus: BusKind,
    ) -> impl Iterator<Item = (&VirtualDevice, &VirtualController)> {
        self.devices.iter().filter_map(move |d| match d.as_controller() {
            Some(ctlr) if ctlr.controller_type.bus() == bus => Some((d, ctlr)),
            _ => None,
        })
    }

    /// Finds the controller of a bus family with the given bus number.
    pub fn controller_on_bus(
        &self,
        bus: BusKind,
        bus_number: i32,
    ) -> Option<(&VirtualDevice, &VirtualController)> {
        self.controllers(bus).find(|(_, c)| c.bus_number == bus_number)
    }

    /// Iterates over the devices attached to `controller`.
    pub fn children(
        &self,
        controller: DeviceKey,
    ) -> impl Iterator<Item = &VirtualDevice> {
        self.devices.iter().filter(move |d| d.controller_key == controller)
    }

    /// Returns the device occupying `unit` on `controller`, if any.
    pub fn occupant(
        &self,
        controller: DeviceKey,
        unit: i32,
    ) -> Option<&VirtualDevice> {
        self.children(controller).find(|d| d.unit_number == Some(unit))
    }
}

impl FromIterator<VirtualDevice> for DeviceList {
    fn from_iter<T: IntoIterator<Item = VirtualDevice>>(iter: T) -> Self {
        Self { devices: iter.into_iter().collect() }
    }
}

impl<'a> IntoIterator for &'a DeviceList {
    type Item = &'a VirtualDevice;
    type IntoIter = std::slice::Iter<'a, VirtualDevice>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}


#[cfg(test)]
mod test {
    use super::test_util::*;
    use super::*;

    #[test]
    fn new_key_is_below_every_existing_key() {
        let mut list = DeviceList::new(base_devices());
        assert_eq!(list.new_key(), DeviceKey(-201));

        let first = list.new_key();
        list.append(disk(first.get(), SCSI0_KEY, 0, 10));
        let second = list.new_key();
        assert_eq!(second, DeviceKey(-202));
        assert_ne!(first, second);

        list.append(disk(-500, SCSI0_KEY, 1, 10));
        assert_eq!(list.new_key(), DeviceKey(-501));
    }

    #[test]
    fn excise_keeps_order() {
        let mut list = DeviceList::new(base_devices());
        let removed = list.excise(IDE0_KEY).unwrap();
        assert_eq!(removed.key, IDE0_KEY);
        let keys: Vec<_> = list.iter().map(|d| d.key).collect();
        assert_eq!(keys, vec![PCI_KEY, IDE1_KEY]);
        assert!(list.excise(IDE0_KEY).is_none());
    }

    #[test]
    fn replace_requires_existing_key() {
        let mut list = DeviceList::new(base_devices());
        assert!(list.replace(disk(5, SCSI0_KEY, 0, 1)).is_none());
        assert_eq!(list.len(), 3);

        let mut ide = list.find(IDE1_KEY).unwrap().clone();
        ide.as_controller_mut().unwrap().bus_number = 5;
        assert!(list.replace(ide).is_some());
        assert!(list.controller_on_bus(BusKind::Ide, 5).is_some());
    }

    #[test]
    fn controller_and_child_lookups() {
        let mut list = DeviceList::new(base_devices());
        list.append(nic(4000, 7, EthernetAdapter::Vmxnet3, "network-12"));

        assert_eq!(list.controllers(BusKind::Ide).count(), 2);
        assert_eq!(list.controllers(BusKind::Scsi).count(), 0);
        assert_eq!(
            list.controller_on_bus(BusKind::Ide, 1).map(|(d, _)| d.key),
            Some(IDE1_KEY)
        );
        assert_eq!(list.children(PCI_KEY).count(), 1);
        assert_eq!(
            list.occupant(PCI_KEY, 7).map(|d| d.key),
            Some(DeviceKey(4000))
        );
        assert!(list.occupant(PCI_KEY, 8).is_none());
    }

    #[test]
    fn device_records_parse_from_inventory_json() {
        let raw = r#"[
            {
                "key": 1000,
                "kind": {
                    "type": "controller",
                    "controller_type": { "scsi": "pvscsi" },
                    "bus_number": 0
                }
            },
            {
                "key": 4000,
                "controller_key": 100,
                "unit_number": 7,
                "kind": {
                    "type": "ethernet_card",
                    "adapter": "vmxnet3",
                    "backing": {
                        "type": "distributed_virtual_port",
                        "switch_uuid": "50 2a",
                        "portgroup_key": "dvportgroup-40"
                    }
                }
            }
        ]"#;
        let list: DeviceList = serde_json::from_str(raw).unwrap();
        let (_, scsi) = list.controller_on_bus(BusKind::Scsi, 0).unwrap();
        assert_eq!(
            scsi.controller_type,
            ControllerType::Scsi(ScsiType::ParaVirtual)
        );
        let card = list.find(DeviceKey(4000)).unwrap().as_ethernet_card();
        assert_eq!(card.unwrap().address_type, MacAddressType::Generated);
        assert_eq!(card.unwrap().backing.type_name(), "distributed_virtual_port");
    }
}
