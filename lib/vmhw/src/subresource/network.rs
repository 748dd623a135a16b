// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual NICs on the PCI bus.
//!
//! The adapter model cannot be changed on a live card. A change of
//! `adapter_type` is carried out by removing the card and adding a new one
//! in the same slot, so the guest sees the replacement at the same PCI
//! position.

use serde::{Deserialize, Serialize};
use slog::debug;
use strum::{AsRefStr, Display, EnumString};
use vmhw_types::{ApiType, DeviceKey};

use super::{
    controller_for_create, find_device, kind_mismatch, next_key,
    slot_address_of, Context, Error, SlotAddress, Subresource,
    SubresourceType,
};
use crate::changes::ChangeSpec;
use crate::device::{
    BandwidthAllocation, BusKind, Connectable, DeviceKind, DeviceList,
    EthernetAdapter, EthernetBacking, EthernetCard, MacAddressType,
    SharesInfo, SharesLevel, VirtualDevice,
};
use crate::slot::{self, SlotPolicies};

/// The NIC models that can be declared. Anything else found on a VM reads
/// back as `Unknown`, which never matches a declaration and so forces the
/// card to be replaced.
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
pub enum AdapterType {
    E1000,
    #[default]
    Vmxnet3,
    Unknown,
}

impl AdapterType {
    fn adapter(self) -> Option<EthernetAdapter> {
        match self {
            AdapterType::E1000 => Some(EthernetAdapter::E1000),
            AdapterType::Vmxnet3 => Some(EthernetAdapter::Vmxnet3),
            AdapterType::Unknown => None,
        }
    }
}

impl From<EthernetAdapter> for AdapterType {
    fn from(adapter: EthernetAdapter) -> Self {
        match adapter {
            EthernetAdapter::E1000 => AdapterType::E1000,
            EthernetAdapter::Vmxnet3 => AdapterType::Vmxnet3,
            _ => AdapterType::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterfaceConfig {
    pub network_id: String,
    pub adapter_type: AdapterType,
    pub use_static_mac: bool,

    /// The declared address when `use_static_mac` is set; the address the
    /// remote system handed out otherwise.
    pub mac_address: Option<String>,

    pub bandwidth_limit: i64,
    pub bandwidth_reservation: i64,
    pub bandwidth_share_level: SharesLevel,
    pub bandwidth_share_count: i32,

    pub key: Option<DeviceKey>,
    pub unit_number: Option<i32>,
}

impl Default for NetworkInterfaceConfig {
    fn default() -> Self {
        Self {
            network_id: String::new(),
            adapter_type: AdapterType::Vmxnet3,
            use_static_mac: false,
            mac_address: None,
            bandwidth_limit: -1,
            bandwidth_reservation: 0,
            bandwidth_share_level: SharesLevel::Normal,
            bandwidth_share_count: 0,
            key: None,
            unit_number: None,
        }
    }
}

impl NetworkInterfaceConfig {
    pub fn new(network_id: impl Into<String>, adapter_type: AdapterType) -> Self {
        Self {
            network_id: network_id.into(),
            adapter_type,
            ..Default::default()
        }
    }
}

pub struct NetworkInterfaceSubresource {
    index: usize,
    config: NetworkInterfaceConfig,
}

impl NetworkInterfaceSubresource {
    fn backing(&self, ctx: &Context<'_>) -> Result<EthernetBacking, Error> {
        let id = &self.config.network_id;
        ctx.resolver.network_backing(id, ctx.api_timeout).map_err(|source| {
            Error::BackingResolutionFailed {
                ty: Self::TYPE,
                index: self.index,
                what: "network",
                id: id.clone(),
                source,
            }
        })
    }

    fn declared_adapter(&self) -> Result<EthernetAdapter, Error> {
        self.config.adapter_type.adapter().ok_or(Error::UndeclarableAdapter {
            ty: Self::TYPE,
            index: self.index,
            adapter: self.config.adapter_type,
        })
    }

    fn bandwidth(&self) -> BandwidthAllocation {
        BandwidthAllocation {
            limit: Some(self.config.bandwidth_limit),
            reservation: Some(self.config.bandwidth_reservation),
            shares: SharesInfo {
                shares: self.config.bandwidth_share_count,
                level: self.config.bandwidth_share_level,
            },
        }
    }

    fn static_mac(&self) -> String {
        self.config.mac_address.clone().unwrap_or_default()
    }

    /// Maps a live backing to the ID of the network it connects to.
    fn network_id(
        &self,
        ctx: &Context<'_>,
        key: DeviceKey,
        backing: &EthernetBacking,
    ) -> Result<String, Error> {
        let resolution_failed = |what, id: &str| {
            let id = id.to_owned();
            move |source| Error::BackingResolutionFailed {
                ty: Self::TYPE,
                index: self.index,
                what,
                id,
                source,
            }
        };

        match backing {
            EthernetBacking::Network { network: Some(net), .. } => {
                Ok(net.value().to_owned())
            }
            EthernetBacking::Network { network: None, .. } => {
                Err(Error::MissingNetworkReference {
                    ty: Self::TYPE,
                    index: self.index,
                    key,
                })
            }
            EthernetBacking::OpaqueNetwork { opaque_network_id, .. } => ctx
                .resolver
                .opaque_network(opaque_network_id, ctx.api_timeout)
                .map(|moref| moref.value().to_owned())
                .map_err(resolution_failed("opaque network", opaque_network_id)),
            EthernetBacking::DistributedVirtualPort {
                switch_uuid,
                portgroup_key,
            } => ctx
                .resolver
                .distributed_port_group(
                    switch_uuid,
                    portgroup_key,
                    ctx.api_timeout,
                )
                .map(|moref| moref.value().to_owned())
                .map_err(resolution_failed(
                    "distributed port group",
                    portgroup_key,
                )),
            EthernetBacking::Other { type_name } => {
                Err(Error::UnsupportedBacking {
                    ty: Self::TYPE,
                    index: self.index,
                    backing: type_name.clone(),
                })
            }
        }
    }
}

impl Subresource for NetworkInterfaceSubresource {
    const TYPE: SubresourceType = SubresourceType::NetworkInterface;

    type Config = NetworkInterfaceConfig;

    fn new(index: usize, config: NetworkInterfaceConfig) -> Self {
        Self { index, config }
    }

    fn existing(index: usize, key: DeviceKey) -> Self {
        Self::new(
            index,
            NetworkInterfaceConfig { key: Some(key), ..Default::default() },
        )
    }

    fn index(&self) -> usize {
        self.index
    }

    fn config(&self) -> &NetworkInterfaceConfig {
        &self.config
    }

    fn into_config(self) -> NetworkInterfaceConfig {
        self.config
    }

    fn key(&self) -> Option<DeviceKey> {
        self.config.key
    }

    fn set_key(&mut self, key: DeviceKey) {
        self.config.key = Some(key);
    }

    fn manages(device: &VirtualDevice) -> bool {
        device.as_ethernet_card().is_some()
    }

    fn recorded_slot(&self, _policies: &SlotPolicies) -> Option<SlotAddress> {
        Some(SlotAddress {
            bus: BusKind::Pci,
            bus_number: 0,
            unit_number: Some(self.config.unit_number?),
        })
    }

    fn canonicalize(&mut self, ctx: &Context<'_>) -> Result<(), Error> {
        let backing = self.backing(ctx)?;
        let key = self.key().unwrap_or(DeviceKey::NONE);
        self.config.network_id = self.network_id(ctx, key, &backing)?;
        Ok(())
    }

    fn differs(
        declared: &NetworkInterfaceConfig,
        observed: &NetworkInterfaceConfig,
    ) -> bool {
        let mac_changed = declared.use_static_mac
            && declared.mac_address != observed.mac_address;
        let share_count_changed = declared.bandwidth_share_level
            == SharesLevel::Custom
            && declared.bandwidth_share_count != observed.bandwidth_share_count;

        mac_changed
            || share_count_changed
            || declared.network_id != observed.network_id
            || declared.adapter_type != observed.adapter_type
            || declared.use_static_mac != observed.use_static_mac
            || declared.bandwidth_limit != observed.bandwidth_limit
            || declared.bandwidth_reservation != observed.bandwidth_reservation
            || declared.bandwidth_share_level != observed.bandwidth_share_level
    }

    fn create(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<Vec<ChangeSpec>, Error> {
        let mut specs = Vec::new();
        // PCI controllers are never created.
        let (ctlr, ctlr_spec) = controller_for_create(
            list,
            Self::TYPE,
            self.index,
            BusKind::Pci,
            0,
            None,
        )?;
        specs.extend(ctlr_spec);

        let adapter = self.declared_adapter()?;
        let backing = self.backing(ctx)?;
        let (address_type, mac_address) = if self.config.use_static_mac {
            (MacAddressType::Manual, self.static_mac())
        } else {
            (MacAddressType::Generated, String::new())
        };

        let mut device = VirtualDevice::new(
            next_key(list, &specs),
            DeviceKind::EthernetCard(EthernetCard {
                adapter,
                backing,
                address_type,
                mac_address,
                resource_allocation: Some(self.bandwidth()),
                connectable: Connectable::connected(),
            }),
        );
        let unit = slot::assign(list, &mut device, ctlr, &ctx.policies.pci_nic)
            .map_err(|source| Error::Slot {
                ty: Self::TYPE,
                index: self.index,
                source,
            })?;

        debug!(ctx.log, "planned network interface";
            "index" => self.index,
            "key" => %device.key,
            "unit_number" => unit,
            "adapter" => %adapter);

        self.config.key = Some(device.key);
        self.config.unit_number = Some(unit);
        specs.push(ChangeSpec::add(device));
        Ok(specs)
    }

    fn read(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<(), Error> {
        let device = find_device(list, Self::TYPE, self.index, self.key())?;
        let card = device
            .as_ethernet_card()
            .ok_or_else(|| kind_mismatch(Self::TYPE, self.index, device))?;

        let network_id = self.network_id(ctx, device.key, &card.backing)?;
        let cfg = &mut self.config;
        cfg.network_id = network_id;
        cfg.adapter_type = card.adapter.into();
        cfg.use_static_mac = card.address_type == MacAddressType::Manual;
        cfg.mac_address =
            Some(card.mac_address.clone()).filter(|mac| !mac.is_empty());

        if let Some(alloc) = &card.resource_allocation {
            cfg.bandwidth_limit = alloc.limit.unwrap_or(-1);
            cfg.bandwidth_reservation = alloc.reservation.unwrap_or(0);
            cfg.bandwidth_share_level = alloc.shares.level;
            cfg.bandwidth_share_count = alloc.shares.shares;
        }

        cfg.key = Some(device.key);
        cfg.unit_number =
            slot_address_of(list, device).and_then(|addr| addr.unit_number);
        Ok(())
    }

    fn update(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
        observed: &NetworkInterfaceConfig,
    ) -> Result<Vec<ChangeSpec>, Error> {
        let existing = find_device(list, Self::TYPE, self.index, self.key())?;
        if existing.as_ethernet_card().is_none() {
            return Err(kind_mismatch(Self::TYPE, self.index, existing));
        }

        let mut specs = Vec::new();
        let mut device = existing.clone();

        if self.config.adapter_type != observed.adapter_type {
            let adapter = self.declared_adapter()?;
            specs.push(ChangeSpec::remove(existing.clone()));

            // Same controller, same unit, fresh key. The remote system
            // picks a new MAC unless a static one is declared below.
            device.key = next_key(list, &specs);
            if let Some(card) = device.as_ethernet_card_mut() {
                card.adapter = adapter;
                card.address_type = MacAddressType::Generated;
                card.mac_address = String::new();
                card.connectable = Connectable::connected();
            }
            debug!(ctx.log, "replacing network interface";
                "index" => self.index,
                "old_key" => %existing.key,
                "new_key" => %device.key,
                "adapter" => %adapter);
        }

        let backing = if self.config.network_id != observed.network_id {
            Some(self.backing(ctx)?)
        } else {
            None
        };

        let mac = self.static_mac();
        let bandwidth = self.bandwidth();
        if let Some(card) = device.as_ethernet_card_mut() {
            if let Some(backing) = backing {
                card.backing = backing;
            }
            if self.config.use_static_mac {
                card.address_type = MacAddressType::Manual;
                card.mac_address = mac;
            } else if observed.use_static_mac {
                card.address_type = match ctx.api_type {
                    ApiType::HostAgent => MacAddressType::Generated,
                    ApiType::VirtualCenter => MacAddressType::Assigned,
                };
                card.mac_address = String::new();
            }
            card.resource_allocation = Some(bandwidth);
        }

        self.config.key = Some(device.key);
        self.config.unit_number = device.unit_number;
        if !self.config.use_static_mac {
            self.config.mac_address = None;
        }
        specs.push(ChangeSpec::add_or_edit(device));
        Ok(specs)
    }

    fn delete(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<Vec<ChangeSpec>, Error> {
        let device = find_device(list, Self::TYPE, self.index, self.key())?;
        if device.as_ethernet_card().is_none() {
            return Err(kind_mismatch(Self::TYPE, self.index, device));
        }
        debug!(ctx.log, "removing network interface";
            "index" => self.index, "key" => %device.key);
        Ok(vec![ChangeSpec::remove(device.clone())])
    }
}
