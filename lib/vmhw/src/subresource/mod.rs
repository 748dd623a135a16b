// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subresources: the device kinds whose lifecycle is managed declaratively.
//!
//! Each kind pairs a declared configuration type with a handler implementing
//! [`Subresource`]. Handlers never mutate the device list themselves; they
//! inspect it and return the change specs describing what should happen,
//! which the reconciler then applies to its working copy. The set of kinds
//! is closed: [`SubresourceType`] names every one of them.

use std::fmt::Debug;
use std::time::Duration;

use slog::Logger;
use strum::{AsRefStr, Display};
use thiserror::Error;
use vmhw_types::{ApiType, DeviceKey, MoRef};

use crate::changes::ChangeSpec;
use crate::device::{
    BusKind, ControllerType, DeviceKind, DeviceList, ScsiBusSharing,
    VirtualController, VirtualDevice,
};
use crate::resolve::{NameResolver, ResolveError};
use crate::slot::{SlotError, SlotPolicies};

pub mod cdrom;
pub mod controller;
pub mod disk;
pub mod network;

pub use cdrom::{CdromConfig, CdromSubresource};
pub use controller::{ControllerConfig, ControllerSubresource};
pub use disk::{DiskConfig, DiskPlacement, DiskSubresource};
pub use network::{
    AdapterType, NetworkInterfaceConfig, NetworkInterfaceSubresource,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SubresourceType {
    Controller,
    Disk,
    NetworkInterface,
    Cdrom,
}

/// Errors raised by subresource operations, and therefore by a reconcile
/// pass. Every variant names the device kind and its index in the declared
/// list (or, for devices being removed, in the device list).
#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "{ty} {index}: no {bus} controller on bus {bus_number}, and one \
        cannot be created"
    )]
    NoSuitableController {
        ty: SubresourceType,
        index: usize,
        bus: BusKind,
        bus_number: i32,
    },

    #[error("{ty} {index}: cannot attach device")]
    Slot {
        ty: SubresourceType,
        index: usize,
        #[source]
        source: SlotError,
    },

    #[error("{ty} {index}: invalid unit number {unit_number}")]
    InvalidUnitNumber { ty: SubresourceType, index: usize, unit_number: i32 },

    #[error("{ty} {index}: device with key {key} not found")]
    DeviceNotFound { ty: SubresourceType, index: usize, key: DeviceKey },

    #[error("{ty} {index}: device {key} is a {found}, not a {ty} device")]
    DeviceKindMismatch {
        ty: SubresourceType,
        index: usize,
        key: DeviceKey,
        found: &'static str,
    },

    #[error("{ty} {index}: could not resolve {what} {id:?}")]
    BackingResolutionFailed {
        ty: SubresourceType,
        index: usize,
        what: &'static str,
        id: String,
        #[source]
        source: ResolveError,
    },

    #[error("{ty} {index}: unsupported backing type {backing:?}")]
    UnsupportedBacking { ty: SubresourceType, index: usize, backing: String },

    #[error(
        "{ty} {index}: network backing of device {key} carries no network \
        reference"
    )]
    MissingNetworkReference {
        ty: SubresourceType,
        index: usize,
        key: DeviceKey,
    },

    #[error("{ty} {index}: adapter type {adapter} cannot be declared")]
    UndeclarableAdapter {
        ty: SubresourceType,
        index: usize,
        adapter: AdapterType,
    },

    #[error(
        "{ty} {index}: {attribute} cannot change from {from:?} to {to:?} on \
        an existing device"
    )]
    ImmutableAttribute {
        ty: SubresourceType,
        index: usize,
        attribute: &'static str,
        from: String,
        to: String,
    },

    #[error("disk {index}: cannot shrink from {from_gib} GiB to {to_gib} GiB")]
    DiskShrink { index: usize, from_gib: i64, to_gib: i64 },

    #[error("disk {index}: size of {size_gib} GiB is out of range")]
    InvalidDiskSize { index: usize, size_gib: i64 },

    #[error(
        "{ty} {index}: controller {key} still has {children} attached \
        device(s)"
    )]
    ControllerInUse {
        ty: SubresourceType,
        index: usize,
        key: DeviceKey,
        children: usize,
    },

    #[error("{ty} {index}: a {bus} controller already exists on bus {bus_number}")]
    BusNumberInUse {
        ty: SubresourceType,
        index: usize,
        bus: BusKind,
        bus_number: i32,
    },

    #[error(
        "{ty} {index}: no datastore declared and no default datastore \
        configured"
    )]
    NoDatastore { ty: SubresourceType, index: usize },

    #[error(
        "cdrom {index}: exactly one of an ISO (datastore and path) or the \
        client device must be declared"
    )]
    InvalidCdromBacking { index: usize },
}

/// Everything a subresource operation may consult besides the device list.
pub struct Context<'a> {
    pub log: &'a Logger,
    pub resolver: &'a dyn NameResolver,
    pub policies: &'a SlotPolicies,
    pub api_type: ApiType,

    /// The VM's datastore, used for devices that don't declare their own.
    pub default_datastore: Option<&'a str>,

    /// Deadline for each individual resolver call.
    pub api_timeout: Duration,
}

/// Where a device sits: the bus family and bus number of its controller, and
/// its unit on that controller (absent for controllers themselves).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotAddress {
    pub bus: BusKind,
    pub bus_number: i32,
    pub unit_number: Option<i32>,
}

/// The lifecycle contract every device kind implements.
///
/// A handler is built for one entry of the declared list (`index` is its
/// position there) and owns that entry's configuration for the duration of
/// one operation. Operations that succeed record the device's key and slot
/// back into the configuration.
pub trait Subresource: Sized {
    const TYPE: SubresourceType;

    type Config: Clone + Debug + PartialEq;

    fn new(index: usize, config: Self::Config) -> Self;

    /// A handler for a device that exists but has no declared entry, built
    /// so that it can be deleted.
    fn existing(index: usize, key: DeviceKey) -> Self;

    fn index(&self) -> usize;

    fn config(&self) -> &Self::Config;

    fn into_config(self) -> Self::Config;

    fn key(&self) -> Option<DeviceKey>;

    fn set_key(&mut self, key: DeviceKey);

    /// Whether the reconciler owns `device`, i.e. whether a device like it
    /// that has no declared entry should be removed.
    fn manages(device: &VirtualDevice) -> bool;

    /// The slot recorded for this entry, used to find the device again after
    /// the remote system has replaced its placeholder key.
    fn recorded_slot(&self, policies: &SlotPolicies) -> Option<SlotAddress>;

    /// Rewrites references the entry may give by name, such as networks and
    /// datastores, into the IDs a read reports. Runs before an existing
    /// device is compared against its entry.
    fn canonicalize(&mut self, _ctx: &Context<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Whether `declared` asks for anything that `observed` (the result of a
    /// fresh read) does not already have.
    fn differs(declared: &Self::Config, observed: &Self::Config) -> bool;

    fn create(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<Vec<ChangeSpec>, Error>;

    /// Populates the configuration from the live device, including computed
    /// attributes the user never declared.
    fn read(&mut self, ctx: &Context<'_>, list: &DeviceList)
        -> Result<(), Error>;

    fn update(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
        observed: &Self::Config,
    ) -> Result<Vec<ChangeSpec>, Error>;

    fn delete(
        &mut self,
        ctx: &Context<'_>,
        list: &DeviceList,
    ) -> Result<Vec<ChangeSpec>, Error>;
}

/// Resolves a datastore given by ID or name.
pub(crate) fn resolve_datastore(
    ctx: &Context<'_>,
    ty: SubresourceType,
    index: usize,
    id: &str,
) -> Result<MoRef, Error> {
    ctx.resolver.datastore(id, ctx.api_timeout).map_err(|source| {
        Error::BackingResolutionFailed {
            ty,
            index,
            what: "datastore",
            id: id.to_owned(),
            source,
        }
    })
}

/// Finds the device an entry refers to.
pub(crate) fn find_device<'l>(
    list: &'l DeviceList,
    ty: SubresourceType,
    index: usize,
    key: Option<DeviceKey>,
) -> Result<&'l VirtualDevice, Error> {
    let key = key.unwrap_or(DeviceKey::NONE);
    list.find(key).ok_or(Error::DeviceNotFound { ty, index, key })
}

pub(crate) fn kind_mismatch(
    ty: SubresourceType,
    index: usize,
    device: &VirtualDevice,
) -> Error {
    Error::DeviceKindMismatch {
        ty,
        index,
        key: device.key,
        found: device.kind.label(),
    }
}

/// Returns a placeholder key below every key in `list` and every key in
/// `pending`, the specs already produced by the running operation.
pub(crate) fn next_key(list: &DeviceList, pending: &[ChangeSpec]) -> DeviceKey {
    let lowest_pending =
        pending.iter().map(|s| s.key().get() - 1).min().unwrap_or(i32::MAX);
    DeviceKey(list.new_key().get().min(lowest_pending))
}

/// Finds the controller on bus `bus_number` of the `bus` family for a device
/// about to be created. When there is none and `create_as` names a model, a
/// new controller is planned and the change spec adding it is returned
/// alongside its placeholder key.
pub(crate) fn controller_for_create(
    list: &DeviceList,
    ty: SubresourceType,
    index: usize,
    bus: BusKind,
    bus_number: i32,
    create_as: Option<ControllerType>,
) -> Result<(DeviceKey, Option<ChangeSpec>), Error> {
    if let Some((dev, _)) = list.controller_on_bus(bus, bus_number) {
        return Ok((dev.key, None));
    }

    let Some(controller_type) = create_as else {
        return Err(Error::NoSuitableController { ty, index, bus, bus_number });
    };
    let controller = VirtualDevice::new(
        list.new_key(),
        DeviceKind::Controller(VirtualController {
            controller_type,
            bus_number,
            sharing: ScsiBusSharing::NoSharing,
        }),
    );
    Ok((controller.key, Some(ChangeSpec::add(controller))))
}

/// Returns the key of the managed device sitting at `addr`, if there is one.
pub(crate) fn locate_by_slot(
    list: &DeviceList,
    addr: &SlotAddress,
    manages: fn(&VirtualDevice) -> bool,
) -> Option<DeviceKey> {
    let (ctlr, _) = list.controller_on_bus(addr.bus, addr.bus_number)?;
    match addr.unit_number {
        None => Some(ctlr.key),
        Some(unit) => list
            .occupant(ctlr.key, unit)
            .filter(|d| manages(d))
            .map(|d| d.key),
    }
}

/// The slot address of an attached device, derived from its controller.
pub(crate) fn slot_address_of(
    list: &DeviceList,
    device: &VirtualDevice,
) -> Option<SlotAddress> {
    let ctlr = list.find(device.controller_key)?.as_controller()?;
    Some(SlotAddress {
        bus: ctlr.controller_type.bus(),
        bus_number: ctlr.bus_number,
        unit_number: device.unit_number,
    })
}
