// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual disks on SCSI controllers.
//!
//! A disk's declared `unit_number` is a flat index across every SCSI bus of
//! the VM; see [`SlotPolicy::flat_address`].

use serde::{Deserialize, Serialize};
use slog::debug;
use vmhw_types::{DeviceKey, MoRef};

use super::{
    controller_for_create, find_device, kind_mismatch, next_key,
    resolve_datastore, slot_address_of, Context, Error, SlotAddress,
    Subresource, SubresourceType,
};
use crate::changes::{ChangeSpec, FileOperation};
use crate::clone::DiskLocator;
use crate::device::{
    BusKind, DeviceKind, DeviceList, DiskBacking, DiskMode, SharesInfo,
    SharesLevel, StorageIoAllocation, VirtualDevice, VirtualDisk,
    BYTES_PER_GIB,
};
use crate::slot::{self, SlotError, SlotPolicies, SlotPolicy};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub size_gib: i64,

    /// Flat SCSI unit number. Defaults to the entry's position in the
    /// declared list when that slot is free.
    pub unit_number: Option<i32>,

    /// Overrides the VM's datastore. Cannot change once the disk exists.
    pub datastore_id: Option<String>,
    pub thin_provisioned: bool,
    pub eagerly_scrub: bool,
    pub disk_mode: DiskMode,

    pub io_limit: i64,
    pub io_reservation: i32,
    pub io_share_level: SharesLevel,
    /// Only meaningful with [`SharesLevel::Custom`]; computed otherwise.
    pub io_share_count: i32,

    /// Keep the backing file when the disk is removed from the VM.
    pub keep_on_remove: bool,

    pub key: Option<DeviceKey>,
    pub file_name: Option<String>,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            size_gib: 0,
            unit_number: None,
            datastore_id: None,
            thin_provisioned: true,
            eagerly_scrub: false,
            disk_mode: DiskMode::Persistent,
            io_limit: -1,
            io_reservation: 0,
            io_share_level: SharesLevel::Normal,
            io_share_count: 0,
            keep_on_remove: false,
            key: None,
            file_name: None,
        }
    }
}

impl DiskConfig {
    pub fn new(size_gib: i64) -> Self {
        Self { size_gib, ..Default::default() }
    }
}

/// Where and how a disk's backing file is laid down. Shared by disk
/// creation and clone relocation so both place disks the same way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskPlacement {
    pub datastore: MoRef,
    pub thin_provisioned: bool,
    pub eagerly_scrub: bool,
    pub disk_mode: DiskMode,
}

impl DiskPlacement {
    fn backing(&self, file_name: String) -> DiskBacking {
        DiskBacking {
            file_name,
            datastore: Some(self.datastore.clone()),
            thin_provisioned: self.thin_provisioned,
            eagerly_scrub: self.eagerly_scrub,
            disk_mode: self.disk_mode,
        }
    }
}

pub struct DiskSubresource {
    index: usize,
    config: DiskConfig,
}

impl DiskSubresource {
    pub fn placement(&self, ctx: &Context<'_>) -> Result<DiskPlacement, Error> {
        let id = self
            .config
            .datastore_id
            .as_deref()
            .or(ctx.default_datastore)
            .ok_or(Error::NoDatastore { ty: Self::TYPE, index: self.index })?;
        let datastore = resolve_datastore(ctx, Self::TYPE, self.index, id)?;
        Ok(DiskPlacement {
            datastore,
            thin_provisioned: self.config.thin_provisioned,
            eagerly_scrub: self.config.eagerly_scrub,
            disk_mode: self.config.disk_mode,
        })
    }

    /// Builds the relocation instruction for `source`, the template disk
    /// this entry corresponds to. Linked clones keep the parent's backing
    /// layout, so only full clones carry one.
    pub fn relocator(
        &self,
        ctx: &Context<'_>,
        source: &VirtualDevice,
        linked_clone: bool,
    ) -> Result<DiskLocator, Error> {
        let disk = source
            .as_disk()
            .ok_or_else(|| kind_mismatch(Self::TYPE, self.index, source))?;
        let placement = self.placement(ctx)?;
        let backing = (!linked_clone)
            .then(|| placement.backing(disk.backing.file_name.clone()));
        Ok(DiskLocator {
            disk_id: source.key,
            datastore: placement.datastore,
            backing,
        })
    }

    fn capacity_in_bytes(&self) -> Result<i64, Error> {
        let size_gib = self.config.size_gib;
        size_gib
            .checked_mul(BYTES_PER_GIB)
            .filter(|bytes| *bytes > 0)
            .ok_or(Error::InvalidDiskSize { index: self.index, size_gib })
    }

    fn io_allocation(&self) -> StorageIoAllocation {
        StorageIoAllocation {
            limit: self.config.io_limit,
            reservation: self.config.io_reservation,
            shares: SharesInfo {
                shares: self.config.io_share_count,
                level: self.config.io_share_level,
            },
        }
    }

    fn slot_error(&self, source: SlotError) -> Error {
        Error::Slot { ty: Self::TYPE, index: self.index, source }
    }

    fn flat_address(
        &self,
        policy: &SlotPolicy,
        n: i32,
    ) -> Result<(i32, i32), Error> {
        policy.flat_address(n).ok_or(Error::InvalidUnitNumber {
            ty: Self::TYPE,
            index: self.index,
            unit_number: n,
        })
    }

    /// The `(bus_number, unit)` a new disk should go to.
    fn target_slot(
        &self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<(i32, i32), Error> {
        let policy = &ctx.policies.scsi;
        if let Some(n) = self.config.unit_number {
            return self.flat_address(policy, n);
        }

        // The positional default only applies on a bus that exists.
        if let Some((bus_number, unit)) = policy.flat_address(self.index as i32)
        {
            let free = list
                .controller_on_bus(BusKind::Scsi, bus_number)
                .is_some_and(|(ctlr, _)| list.occupant(ctlr.key, unit).is_none());
            if free {
                return Ok((bus_number, unit));
            }
        }

        // Otherwise take the lowest free slot on the existing buses.
        let mut buses: Vec<_> = list
            .controllers(BusKind::Scsi)
            .map(|(dev, ctlr)| (ctlr.bus_number, dev.key))
            .collect();
        buses.sort();
        let mut last_err = SlotError::CapacityExceeded {
            controller: DeviceKey::NONE,
            offset: policy.offset,
            capacity: policy.capacity,
        };
        for (bus_number, key) in buses {
            match slot::next_unit_number(list, key, policy) {
                Ok(unit) => return Ok((bus_number, unit)),
                Err(e) => last_err = e,
            }
        }
        Err(self.slot_error(last_err))
    }

    /// Attaches `device` at `unit` on SCSI bus `bus_number`. SCSI
    /// controllers are declared entries of their own, so a disk never plans
    /// one: a bus without a controller is [`Error::NoSuitableController`].
    fn attach(
        &self,
        ctx: &Context<'_>,
        list: &DeviceList,
        device: &mut VirtualDevice,
        bus_number: i32,
        unit: i32,
    ) -> Result<(), Error> {
        let (ctlr, _) = controller_for_create(
            list,
            Self::TYPE,
            self.index,
            BusKind::Scsi,
            bus_number,
            None,
        )?;
        slot::claim(list, device, ctlr, unit, &ctx.policies.scsi)
            .map_err(|e| self.slot_error(e))
    }

    fn immutable(
        &self,
        attribute: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Error {
        Error::ImmutableAttribute {
            ty: Self::TYPE,
            index: self.index,
            attribute,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    fn check_immutable(&self, observed: &DiskConfig) -> Result<(), Error> {
        let declared = &self.config;
        if let (Some(to), Some(from)) =
            (&declared.datastore_id, &observed.datastore_id)
        {
            if to != from {
                return Err(self.immutable("datastore_id", from, to));
            }
        }
        if declared.thin_provisioned != observed.thin_provisioned {
            return Err(self.immutable(
                "thin_provisioned",
                observed.thin_provisioned,
                declared.thin_provisioned,
            ));
        }
        if declared.eagerly_scrub != observed.eagerly_scrub {
            return Err(self.immutable(
                "eagerly_scrub",
                observed.eagerly_scrub,
                declared.eagerly_scrub,
            ));
        }
        Ok(())
    }
}

impl Subresource for DiskSubresource {
    const TYPE: SubresourceType = SubresourceType::Disk;

    type Config = DiskConfig;

    fn new(index: usize, config: DiskConfig) -> Self {
        Self { index, config }
    }

    fn existing(index: usize, key: DeviceKey) -> Self {
        Self::new(index, DiskConfig { key: Some(key), ..Default::default() })
    }

    fn index(&self) -> usize {
        self.index
    }

    fn config(&self) -> &DiskConfig {
        &self.config
    }

    fn into_config(self) -> DiskConfig {
        self.config
    }

    fn key(&self) -> Option<DeviceKey> {
        self.config.key
    }

    fn set_key(&mut self, key: DeviceKey) {
        self.config.key = Some(key);
    }

    fn manages(device: &VirtualDevice) -> bool {
        device.as_disk().is_some()
    }

    fn recorded_slot(&self, policies: &SlotPolicies) -> Option<SlotAddress> {
        let (bus_number, unit) =
            policies.scsi.flat_address(self.config.unit_number?)?;
        Some(SlotAddress {
            bus: BusKind::Scsi,
            bus_number,
            unit_number: Some(unit),
        })
    }

    fn canonicalize(&mut self, ctx: &Context<'_>) -> Result<(), Error> {
        if let Some(id) = &self.config.datastore_id {
            let datastore = resolve_datastore(ctx, Self::TYPE, self.index, id)?;
            self.config.datastore_id = Some(datastore.value().to_owned());
        }
        Ok(())
    }

    fn differs(declared: &DiskConfig, observed: &DiskConfig) -> bool {
        let unit_moved = declared.unit_number.is_some()
            && declared.unit_number != observed.unit_number;
        let datastore_moved = declared.datastore_id.is_some()
            && declared.datastore_id != observed.datastore_id;
        let share_count_changed = declared.io_share_level == SharesLevel::Custom
            && declared.io_share_count != observed.io_share_count;

        unit_moved
            || datastore_moved
            || share_count_changed
            || declared.size_gib != observed.size_gib
            || declared.thin_provisioned != observed.thin_provisioned
            || declared.eagerly_scrub != observed.eagerly_scrub
            || declared.disk_mode != observed.disk_mode
            || declared.io_limit != observed.io_limit
            || declared.io_reservation != observed.io_reservation
            || declared.io_share_level != observed.io_share_level
    }

    fn create(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<Vec<ChangeSpec>, Error> {
        let capacity_in_bytes = self.capacity_in_bytes()?;
        let (bus_number, unit) = self.target_slot(ctx, list)?;
        let placement = self.placement(ctx)?;

        let mut device = VirtualDevice::new(
            DeviceKey::NONE,
            DeviceKind::Disk(VirtualDisk {
                capacity_in_bytes,
                backing: placement.backing(String::new()),
                storage_io_allocation: Some(self.io_allocation()),
            }),
        );
        self.attach(ctx, list, &mut device, bus_number, unit)?;
        device.key = next_key(list, &[]);

        debug!(ctx.log, "planned disk";
            "index" => self.index,
            "key" => %device.key,
            "bus_number" => bus_number,
            "unit_number" => unit);

        self.config.key = Some(device.key);
        self.config.unit_number = ctx.policies.scsi.flat_index(bus_number, unit);
        Ok(vec![
            ChangeSpec::add(device).with_file_operation(FileOperation::Create)
        ])
    }

    fn read(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<(), Error> {
        let device = find_device(list, Self::TYPE, self.index, self.key())?;
        let disk = device
            .as_disk()
            .ok_or_else(|| kind_mismatch(Self::TYPE, self.index, device))?;

        let cfg = &mut self.config;
        cfg.key = Some(device.key);
        cfg.size_gib = disk.size_gib();
        cfg.unit_number = slot_address_of(list, device)
            .filter(|addr| addr.bus == BusKind::Scsi)
            .and_then(|addr| {
                addr.unit_number.and_then(|unit| {
                    ctx.policies.scsi.flat_index(addr.bus_number, unit)
                })
            });
        cfg.datastore_id =
            disk.backing.datastore.as_ref().map(|ds| ds.value().to_owned());
        cfg.thin_provisioned = disk.backing.thin_provisioned;
        cfg.eagerly_scrub = disk.backing.eagerly_scrub;
        cfg.disk_mode = disk.backing.disk_mode;
        cfg.file_name = Some(disk.backing.file_name.clone())
            .filter(|name| !name.is_empty());

        let io = disk.storage_io_allocation.clone().unwrap_or(
            StorageIoAllocation {
                limit: -1,
                reservation: 0,
                shares: SharesInfo::default(),
            },
        );
        cfg.io_limit = io.limit;
        cfg.io_reservation = io.reservation;
        cfg.io_share_level = io.shares.level;
        cfg.io_share_count = io.shares.shares;
        Ok(())
    }

    fn update(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
        observed: &DiskConfig,
    ) -> Result<Vec<ChangeSpec>, Error> {
        let mut device =
            find_device(list, Self::TYPE, self.index, self.key())?.clone();
        if self.config.size_gib < observed.size_gib {
            return Err(Error::DiskShrink {
                index: self.index,
                from_gib: observed.size_gib,
                to_gib: self.config.size_gib,
            });
        }
        self.check_immutable(observed)?;
        let capacity_in_bytes = self.capacity_in_bytes()?;

        let io = self.io_allocation();
        match device.as_disk_mut() {
            Some(disk) => {
                disk.capacity_in_bytes = capacity_in_bytes;
                disk.backing.disk_mode = self.config.disk_mode;
                disk.storage_io_allocation = Some(io);
            }
            None => return Err(kind_mismatch(Self::TYPE, self.index, &device)),
        }

        match self.config.unit_number {
            Some(n) if Some(n) != observed.unit_number => {
                let (bus_number, unit) =
                    self.flat_address(&ctx.policies.scsi, n)?;
                self.attach(ctx, list, &mut device, bus_number, unit)?;
            }
            _ => self.config.unit_number = observed.unit_number,
        }

        debug!(ctx.log, "updated disk";
            "index" => self.index, "key" => %device.key);
        self.config.file_name = observed.file_name.clone();
        Ok(vec![ChangeSpec::add_or_edit(device)])
    }

    fn delete(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<Vec<ChangeSpec>, Error> {
        let device = find_device(list, Self::TYPE, self.index, self.key())?;
        if device.as_disk().is_none() {
            return Err(kind_mismatch(Self::TYPE, self.index, device));
        }
        debug!(ctx.log, "removing disk";
            "index" => self.index,
            "key" => %device.key,
            "keep_file" => self.config.keep_on_remove);

        let spec = ChangeSpec::remove(device.clone());
        Ok(vec![if self.config.keep_on_remove {
            spec
        } else {
            spec.with_file_operation(FileOperation::Destroy)
        }])
    }
}
