// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Declared storage controllers (SCSI and SATA).
//!
//! PCI and IDE controllers come with every VM and are never added or
//! removed here; disks and drives find them through
//! [`controller_for_create`](super::controller_for_create).

use serde::{Deserialize, Serialize};
use slog::{debug, info};
use vmhw_types::DeviceKey;

use super::{
    find_device, kind_mismatch, next_key, Context, Error, SlotAddress,
    Subresource, SubresourceType,
};
use crate::changes::ChangeSpec;
use crate::device::{
    BusKind, ControllerType, DeviceKind, DeviceList, ScsiBusSharing,
    ScsiType, VirtualController, VirtualDevice,
};
use crate::slot::SlotPolicies;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub controller_type: ControllerType,
    pub bus_number: i32,
    #[serde(default)]
    pub sharing: ScsiBusSharing,
    #[serde(default)]
    pub key: Option<DeviceKey>,
}

impl ControllerConfig {
    pub fn scsi(bus_number: i32, scsi_type: ScsiType) -> Self {
        Self {
            controller_type: ControllerType::Scsi(scsi_type),
            bus_number,
            sharing: ScsiBusSharing::NoSharing,
            key: None,
        }
    }

    pub fn sata(bus_number: i32) -> Self {
        Self {
            controller_type: ControllerType::Sata,
            bus_number,
            sharing: ScsiBusSharing::NoSharing,
            key: None,
        }
    }

    pub fn bus(&self) -> BusKind {
        self.controller_type.bus()
    }
}

pub struct ControllerSubresource {
    index: usize,
    config: ControllerConfig,
}

impl ControllerSubresource {
    fn controller(&self) -> VirtualController {
        VirtualController {
            controller_type: self.config.controller_type,
            bus_number: self.config.bus_number,
            sharing: match self.config.controller_type {
                ControllerType::Scsi(_) => self.config.sharing,
                _ => ScsiBusSharing::NoSharing,
            },
        }
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
}

impl Subresource for ControllerSubresource {
    const TYPE: SubresourceType = SubresourceType::Controller;

    type Config = ControllerConfig;

    fn new(index: usize, config: ControllerConfig) -> Self {
        Self { index, config }
    }

    fn existing(index: usize, key: DeviceKey) -> Self {
        // Only the key matters for a delete.
        let config = ControllerConfig { key: Some(key), ..ControllerConfig::sata(0) };
        Self::new(index, config)
    }

    fn index(&self) -> usize {
        self.index
    }

    fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn into_config(self) -> ControllerConfig {
        self.config
    }

    fn key(&self) -> Option<DeviceKey> {
        self.config.key
    }

    fn set_key(&mut self, key: DeviceKey) {
        self.config.key = Some(key);
    }

    fn manages(device: &VirtualDevice) -> bool {
        matches!(
            device.as_controller().map(|c| c.controller_type.bus()),
            Some(BusKind::Scsi | BusKind::Sata)
        )
    }

    fn recorded_slot(&self, _policies: &SlotPolicies) -> Option<SlotAddress> {
        Some(SlotAddress {
            bus: self.config.bus(),
            bus_number: self.config.bus_number,
            unit_number: None,
        })
    }

    fn differs(declared: &ControllerConfig, observed: &ControllerConfig) -> bool {
        let sharing_changed = declared.bus() == BusKind::Scsi
            && declared.sharing != observed.sharing;
        sharing_changed
            || declared.controller_type != observed.controller_type
            || declared.bus_number != observed.bus_number
    }

    fn create(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<Vec<ChangeSpec>, Error> {
        let bus = self.config.bus();
        let bus_number = self.config.bus_number;
        if matches!(bus, BusKind::Pci | BusKind::Ide) {
            return Err(Error::NoSuitableController {
                ty: Self::TYPE,
                index: self.index,
                bus,
                bus_number,
            });
        }
        if list.controller_on_bus(bus, bus_number).is_some() {
            return Err(Error::BusNumberInUse {
                ty: Self::TYPE,
                index: self.index,
                bus,
                bus_number,
            });
        }

        let device = VirtualDevice::new(
            next_key(list, &[]),
            DeviceKind::Controller(self.controller()),
        );
        debug!(ctx.log, "planned controller";
            "index" => self.index,
            "key" => %device.key,
            "bus" => %bus,
            "bus_number" => bus_number);
        self.config.key = Some(device.key);
        Ok(vec![ChangeSpec::add(device)])
    }

    fn read(
        &mut self,
        _ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<(), Error> {
        let device = find_device(list, Self::TYPE, self.index, self.key())?;
        let ctlr = device
            .as_controller()
            .ok_or_else(|| kind_mismatch(Self::TYPE, self.index, device))?;
        self.config = ControllerConfig {
            controller_type: ctlr.controller_type,
            bus_number: ctlr.bus_number,
            sharing: ctlr.sharing,
            key: Some(device.key),
        };
        Ok(())
    }

    fn update(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
        observed: &ControllerConfig,
    ) -> Result<Vec<ChangeSpec>, Error> {
        let existing = find_device(list, Self::TYPE, self.index, self.key())?;
        if existing.as_controller().is_none() {
            return Err(kind_mismatch(Self::TYPE, self.index, existing));
        }
        if self.config.bus() != observed.bus() {
            return Err(self.immutable("bus", observed.bus(), self.config.bus()));
        }
        if self.config.bus_number != observed.bus_number {
            return Err(self.immutable(
                "bus_number",
                observed.bus_number,
                self.config.bus_number,
            ));
        }

        if self.config.controller_type == observed.controller_type {
            let mut device = existing.clone();
            device.kind = DeviceKind::Controller(self.controller());
            return Ok(vec![ChangeSpec::add_or_edit(device)]);
        }

        // A different SCSI model: swap the controller out on the same bus
        // and move every child over to the replacement.
        let mut specs = vec![ChangeSpec::remove(existing.clone())];
        let replacement = VirtualDevice::new(
            next_key(list, &specs),
            DeviceKind::Controller(self.controller()),
        );
        let new_key = replacement.key;
        specs.push(ChangeSpec::add(replacement));
        for child in list.children(existing.key) {
            let mut moved = child.clone();
            moved.controller_key = new_key;
            specs.push(ChangeSpec::edit(moved));
        }

        info!(ctx.log, "replacing controller";
            "index" => self.index,
            "old_key" => %existing.key,
            "new_key" => %new_key,
            "children" => specs.len() - 2);
        self.config.key = Some(new_key);
        Ok(specs)
    }

    fn delete(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<Vec<ChangeSpec>, Error> {
        let device = find_device(list, Self::TYPE, self.index, self.key())?;
        if device.as_controller().is_none() {
            return Err(kind_mismatch(Self::TYPE, self.index, device));
        }
        let children = list.children(device.key).count();
        if children > 0 {
            return Err(Error::ControllerInUse {
                ty: Self::TYPE,
                index: self.index,
                key: device.key,
                children,
            });
        }
        debug!(ctx.log, "removing controller";
            "index" => self.index, "key" => %device.key);
        Ok(vec![ChangeSpec::remove(device.clone())])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::changes::ChangeOperation;
    use crate::device::test_util::*;
    use crate::resolve::test_util::resolver;
    use crate::subresource::test_util::{context, test_log};

    fn scsi_list() -> DeviceList {
        let mut list = DeviceList::new(base_devices());
        list.append(controller(
            SCSI0_KEY,
            ControllerType::Scsi(ScsiType::LsiLogic),
            0,
        ));
        list
    }

    #[test]
    fn create_on_a_free_bus() {
        let (log, r, p) = (test_log(), resolver(), SlotPolicies::default());
        let ctx = context(&log, &r, &p);

        let mut sr = ControllerSubresource::new(
            1,
            ControllerConfig::scsi(1, ScsiType::ParaVirtual),
        );
        let specs = sr.create(&ctx, &scsi_list()).unwrap();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].key().is_pending());
        assert_eq!(specs[0].device.as_controller().unwrap().bus_number, 1);

        let mut taken = ControllerSubresource::new(
            2,
            ControllerConfig::scsi(0, ScsiType::ParaVirtual),
        );
        assert!(matches!(
            taken.create(&ctx, &scsi_list()),
            Err(Error::BusNumberInUse { bus: BusKind::Scsi, bus_number: 0, .. })
        ));
    }

    #[test]
    fn only_storage_controllers_are_managed() {
        let list = scsi_list();
        let managed: Vec<_> = list
            .iter()
            .filter(|d| ControllerSubresource::manages(d))
            .map(|d| d.key)
            .collect();
        assert_eq!(managed, vec![SCSI0_KEY]);
    }

    #[test]
    fn scsi_type_change_moves_children() {
        let (log, r, p) = (test_log(), resolver(), SlotPolicies::default());
        let ctx = context(&log, &r, &p);
        let mut list = scsi_list();
        list.append(disk(2000, SCSI0_KEY, 0, 10));
        list.append(disk(2001, SCSI0_KEY, 1, 10));

        let mut scratch = ControllerSubresource::existing(0, SCSI0_KEY);
        scratch.read(&ctx, &list).unwrap();
        let seen = scratch.into_config();

        let declared = ControllerConfig {
            key: Some(SCSI0_KEY),
            ..ControllerConfig::scsi(0, ScsiType::ParaVirtual)
        };
        assert!(ControllerSubresource::differs(&declared, &seen));

        let mut sr = ControllerSubresource::new(0, declared);
        let specs = sr.update(&ctx, &list, &seen).unwrap();
        let ops: Vec<_> = specs.iter().map(|s| s.operation).collect();
        assert_eq!(
            ops,
            vec![
                ChangeOperation::Remove,
                ChangeOperation::Add,
                ChangeOperation::Edit,
                ChangeOperation::Edit,
            ]
        );
        let new_key = specs[1].key();
        assert!(new_key.is_pending());
        assert!(specs[2..]
            .iter()
            .all(|s| s.device.controller_key == new_key));
        assert_eq!(specs[2].device.unit_number, Some(0));
        assert_eq!(sr.config().key, Some(new_key));
    }

    #[test]
    fn sharing_change_is_an_edit() {
        let (log, r, p) = (test_log(), resolver(), SlotPolicies::default());
        let ctx = context(&log, &r, &p);
        let list = scsi_list();
        let mut scratch = ControllerSubresource::existing(0, SCSI0_KEY);
        scratch.read(&ctx, &list).unwrap();
        let seen = scratch.into_config();

        let declared = ControllerConfig {
            key: Some(SCSI0_KEY),
            sharing: ScsiBusSharing::VirtualSharing,
            ..ControllerConfig::scsi(0, ScsiType::LsiLogic)
        };
        let mut sr = ControllerSubresource::new(0, declared);
        let specs = sr.update(&ctx, &list, &seen).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].operation, ChangeOperation::Edit);
        assert_eq!(
            specs[0].device.as_controller().unwrap().sharing,
            ScsiBusSharing::VirtualSharing
        );
    }

    #[test]
    fn controllers_with_children_are_not_deleted() {
        let (log, r, p) = (test_log(), resolver(), SlotPolicies::default());
        let ctx = context(&log, &r, &p);
        let mut list = scsi_list();
        list.append(disk(2000, SCSI0_KEY, 0, 10));

        let mut sr = ControllerSubresource::existing(0, SCSI0_KEY);
        assert!(matches!(
            sr.delete(&ctx, &list),
            Err(Error::ControllerInUse { children: 1, .. })
        ));

        list.excise(DeviceKey(2000));
        let specs = sr.delete(&ctx, &list).unwrap();
        assert_eq!(specs[0].operation, ChangeOperation::Remove);
    }
}
