// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Optical drives, attached to IDE.

use serde::{Deserialize, Serialize};
use slog::debug;
use vmhw_types::DeviceKey;

use super::{
    controller_for_create, find_device, kind_mismatch, next_key,
    resolve_datastore, slot_address_of, Context, Error, SlotAddress,
    Subresource, SubresourceType,
};
use crate::changes::ChangeSpec;
use crate::device::{
    BusKind, CdromBacking, Connectable, ControllerType, DeviceKind,
    DeviceList, VirtualCdrom, VirtualDevice,
};
use crate::slot::{self, SlotError, SlotPolicies};

/// A CD-ROM is backed either by an ISO image on a datastore or by the
/// client's own drive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdromConfig {
    pub datastore_id: Option<String>,
    pub path: Option<String>,
    pub client_device: bool,

    pub key: Option<DeviceKey>,
    pub bus_number: Option<i32>,
    pub unit_number: Option<i32>,
}

impl CdromConfig {
    pub fn iso(datastore_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            datastore_id: Some(datastore_id.into()),
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn client_device() -> Self {
        Self { client_device: true, ..Default::default() }
    }
}

pub struct CdromSubresource {
    index: usize,
    config: CdromConfig,
}

impl CdromSubresource {
    fn backing(&self, ctx: &Context<'_>) -> Result<CdromBacking, Error> {
        let cfg = &self.config;
        match (cfg.client_device, &cfg.datastore_id, &cfg.path) {
            (true, None, None) => {
                Ok(CdromBacking::RemotePassthrough { exclusive: false })
            }
            (false, Some(id), Some(path)) => {
                let datastore =
                    resolve_datastore(ctx, Self::TYPE, self.index, id)?;
                Ok(CdromBacking::Iso { datastore, file_name: path.clone() })
            }
            _ => Err(Error::InvalidCdromBacking { index: self.index }),
        }
    }

    /// Picks the first IDE controller, in bus order, with a free slot. When
    /// the VM has no IDE controller at all, one is planned on bus 0.
    fn ide_slot(
        &self,
        ctx: &Context<'_>,
        list: &DeviceList,
        device: &mut VirtualDevice,
        specs: &mut Vec<ChangeSpec>,
    ) -> Result<(), Error> {
        let policy = &ctx.policies.ide;
        let mut buses: Vec<_> = list
            .controllers(BusKind::Ide)
            .map(|(dev, ctlr)| (ctlr.bus_number, dev.key))
            .collect();
        buses.sort();

        if buses.is_empty() {
            let (ctlr, ctlr_spec) = controller_for_create(
                list,
                Self::TYPE,
                self.index,
                BusKind::Ide,
                0,
                Some(ControllerType::Ide),
            )?;
            specs.extend(ctlr_spec);
            return slot::assign(list, device, ctlr, policy)
                .map(|_| ())
                .map_err(|e| self.slot_error(e));
        }

        let mut last_err = None;
        for (_, ctlr) in buses {
            match slot::assign(list, device, ctlr, policy) {
                Ok(_) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(self.slot_error(last_err.unwrap_or(SlotError::CapacityExceeded {
            controller: DeviceKey::NONE,
            offset: policy.offset,
            capacity: policy.capacity,
        })))
    }

    fn slot_error(&self, source: SlotError) -> Error {
        Error::Slot { ty: Self::TYPE, index: self.index, source }
    }
}

impl Subresource for CdromSubresource {
    const TYPE: SubresourceType = SubresourceType::Cdrom;

    type Config = CdromConfig;

    fn new(index: usize, config: CdromConfig) -> Self {
        Self { index, config }
    }

    fn existing(index: usize, key: DeviceKey) -> Self {
        Self::new(index, CdromConfig { key: Some(key), ..Default::default() })
    }

    fn index(&self) -> usize {
        self.index
    }

    fn config(&self) -> &CdromConfig {
        &self.config
    }

    fn into_config(self) -> CdromConfig {
        self.config
    }

    fn key(&self) -> Option<DeviceKey> {
        self.config.key
    }

    fn set_key(&mut self, key: DeviceKey) {
        self.config.key = Some(key);
    }

    fn manages(device: &VirtualDevice) -> bool {
        device.as_cdrom().is_some()
    }

    fn recorded_slot(&self, _policies: &SlotPolicies) -> Option<SlotAddress> {
        Some(SlotAddress {
            bus: BusKind::Ide,
            bus_number: self.config.bus_number?,
            unit_number: Some(self.config.unit_number?),
        })
    }

    fn canonicalize(&mut self, ctx: &Context<'_>) -> Result<(), Error> {
        if let Some(id) = &self.config.datastore_id {
            let datastore = resolve_datastore(ctx, Self::TYPE, self.index, id)?;
            self.config.datastore_id = Some(datastore.value().to_owned());
        }
        Ok(())
    }

    fn differs(declared: &CdromConfig, observed: &CdromConfig) -> bool {
        declared.client_device != observed.client_device
            || declared.datastore_id != observed.datastore_id
            || declared.path != observed.path
    }

    fn create(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<Vec<ChangeSpec>, Error> {
        let backing = self.backing(ctx)?;
        let mut specs = Vec::new();
        let mut device = VirtualDevice::new(
            DeviceKey::NONE,
            DeviceKind::Cdrom(VirtualCdrom {
                backing,
                connectable: Connectable::connected(),
            }),
        );
        self.ide_slot(ctx, list, &mut device, &mut specs)?;
        device.key = next_key(list, &specs);

        let addr = slot_address_of(list, &device);
        self.config.key = Some(device.key);
        self.config.unit_number = device.unit_number;
        // A controller planned in this operation isn't in the list yet, and
        // is always bus 0.
        self.config.bus_number = addr.map(|a| a.bus_number).or(Some(0));

        debug!(ctx.log, "planned cdrom";
            "index" => self.index,
            "key" => %device.key,
            "controller" => %device.controller_key,
            "unit_number" => device.unit_number);
        specs.push(ChangeSpec::add(device));
        Ok(specs)
    }

    fn read(
        &mut self,
        _ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<(), Error> {
        let device = find_device(list, Self::TYPE, self.index, self.key())?;
        let cdrom = device
            .as_cdrom()
            .ok_or_else(|| kind_mismatch(Self::TYPE, self.index, device))?;

        let cfg = &mut self.config;
        match &cdrom.backing {
            CdromBacking::Iso { datastore, file_name } => {
                cfg.client_device = false;
                cfg.datastore_id = Some(datastore.value().to_owned());
                cfg.path = Some(file_name.clone());
            }
            CdromBacking::RemotePassthrough { .. } => {
                cfg.client_device = true;
                cfg.datastore_id = None;
                cfg.path = None;
            }
            CdromBacking::Other { type_name } => {
                return Err(Error::UnsupportedBacking {
                    ty: Self::TYPE,
                    index: self.index,
                    backing: type_name.clone(),
                });
            }
        }

        let addr = slot_address_of(list, device);
        cfg.key = Some(device.key);
        cfg.bus_number = addr.map(|a| a.bus_number);
        cfg.unit_number = device.unit_number;
        Ok(())
    }

    fn update(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
        observed: &CdromConfig,
    ) -> Result<Vec<ChangeSpec>, Error> {
        let mut device =
            find_device(list, Self::TYPE, self.index, self.key())?.clone();
        let backing = self.backing(ctx)?;
        match device.as_cdrom_mut() {
            Some(cdrom) => cdrom.backing = backing,
            None => return Err(kind_mismatch(Self::TYPE, self.index, &device)),
        }

        self.config.bus_number = observed.bus_number;
        self.config.unit_number = observed.unit_number;
        Ok(vec![ChangeSpec::add_or_edit(device)])
    }

    fn delete(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<Vec<ChangeSpec>, Error> {
        let device = find_device(list, Self::TYPE, self.index, self.key())?;
        if device.as_cdrom().is_none() {
            return Err(kind_mismatch(Self::TYPE, self.index, device));
        }
        debug!(ctx.log, "removing cdrom";
            "index" => self.index, "key" => %device.key);
        Ok(vec![ChangeSpec::remove(device.clone())])
    }
}
