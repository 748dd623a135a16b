// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Unit number allocation on controller buses.
//!
//! Allocation is a pure function of the current device list: every attach
//! rescans the devices already on the controller, including ones planned
//! earlier in the same pass, and takes the lowest free slot its policy
//! allows.

use std::ops::Range;

use thiserror::Error;
use vmhw_types::DeviceKey;

use crate::device::{BusKind, DeviceList, VirtualDevice};

/// The slots a controller exposes to one class of device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotPolicy {
    /// The first usable unit number.
    pub offset: i32,

    /// How many unit numbers, starting at `offset`, may be used.
    pub capacity: i32,

    /// Unit numbers inside the range that are never handed out.
    pub reserved: &'static [i32],
}

impl SlotPolicy {
    pub const fn new(offset: i32, capacity: i32) -> Self {
        Self { offset, capacity, reserved: &[] }
    }

    pub const fn with_reserved(self, reserved: &'static [i32]) -> Self {
        Self { reserved, ..self }
    }

    pub fn range(&self) -> Range<i32> {
        self.offset..self.offset + self.capacity
    }

    pub fn is_reserved(&self, unit: i32) -> bool {
        self.reserved.contains(&unit)
    }

    fn usable_units(&self) -> Vec<i32> {
        self.range().filter(|u| !self.is_reserved(*u)).collect()
    }

    /// Maps a flat unit number, counted across buses with reserved units
    /// skipped, to a `(bus_number, unit)` pair. With the SCSI policy, 0
    /// through 14 land on bus 0 (6 at unit 6, 7 at unit 8) and 15 starts
    /// bus 1.
    pub fn flat_address(&self, n: i32) -> Option<(i32, i32)> {
        let units = self.usable_units();
        if n < 0 || units.is_empty() {
            return None;
        }
        let per_bus = units.len() as i32;
        Some((n / per_bus, units[(n % per_bus) as usize]))
    }

    /// The inverse of [`SlotPolicy::flat_address`].
    pub fn flat_index(&self, bus_number: i32, unit: i32) -> Option<i32> {
        let units = self.usable_units();
        let pos = units.iter().position(|u| *u == unit)? as i32;
        (bus_number >= 0).then(|| bus_number * units.len() as i32 + pos)
    }
}

/// Virtual NICs on the PCI bus. The remote system moves the first NIC to
/// unit 7 if it lands anywhere else, so allocation starts there; ten NICs
/// per VM is the limit this crate accepts.
pub const PCI_NIC_SLOTS: SlotPolicy = SlotPolicy::new(7, 10);

/// SCSI targets. Unit 7 belongs to the controller itself.
pub const SCSI_SLOTS: SlotPolicy = SlotPolicy::new(0, 16).with_reserved(&[7]);

pub const SATA_SLOTS: SlotPolicy = SlotPolicy::new(0, 30);

/// IDE master and slave.
pub const IDE_SLOTS: SlotPolicy = SlotPolicy::new(0, 2);

/// The full set of slot policies a reconcile pass works with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotPolicies {
    pub pci_nic: SlotPolicy,
    pub scsi: SlotPolicy,
    pub sata: SlotPolicy,
    pub ide: SlotPolicy,
}

impl Default for SlotPolicies {
    fn default() -> Self {
        Self {
            pci_nic: PCI_NIC_SLOTS,
            scsi: SCSI_SLOTS,
            sata: SATA_SLOTS,
            ide: IDE_SLOTS,
        }
    }
}

impl SlotPolicies {
    pub fn for_bus(&self, bus: BusKind) -> &SlotPolicy {
        match bus {
            BusKind::Pci => &self.pci_nic,
            BusKind::Ide => &self.ide,
            BusKind::Sata => &self.sata,
            BusKind::Scsi => &self.scsi,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error(
        "no free unit numbers on controller {controller} \
        (units {offset} through {last})",
        last = .offset + .capacity - 1
    )]
    CapacityExceeded { controller: DeviceKey, offset: i32, capacity: i32 },

    #[error(
        "unit number {unit} is outside the usable range {offset} through \
        {last} on controller {controller}",
        last = .offset + .capacity - 1
    )]
    OutOfRange { controller: DeviceKey, unit: i32, offset: i32, capacity: i32 },

    #[error("unit number {unit} on controller {controller} is reserved")]
    Reserved { controller: DeviceKey, unit: i32 },

    #[error(
        "unit number {unit} on controller {controller} is in use by device \
        {occupant}"
    )]
    InUse { controller: DeviceKey, unit: i32, occupant: DeviceKey },
}

/// Returns the lowest unit number on `controller` that `policy` allows and
/// no device in `list` occupies.
pub fn next_unit_number(
    list: &DeviceList,
    controller: DeviceKey,
    policy: &SlotPolicy,
) -> Result<i32, SlotError> {
    let range = policy.range();
    let mut used = vec![false; range.len()];
    for unit in policy.reserved.iter().filter(|u| range.contains(*u)) {
        used[(unit - policy.offset) as usize] = true;
    }
    for unit in list
        .children(controller)
        .filter_map(|d| d.unit_number)
        .filter(|u| range.contains(u))
    {
        used[(unit - policy.offset) as usize] = true;
    }

    used.iter().position(|u| !u).map(|idx| idx as i32 + policy.offset).ok_or(
        SlotError::CapacityExceeded {
            controller,
            offset: policy.offset,
            capacity: policy.capacity,
        },
    )
}

/// Attaches `device` to the lowest free slot on `controller`, returning the
/// unit number it was given. Only the device's `controller_key` and
/// `unit_number` are touched.
pub fn assign(
    list: &DeviceList,
    device: &mut VirtualDevice,
    controller: DeviceKey,
    policy: &SlotPolicy,
) -> Result<i32, SlotError> {
    let unit = next_unit_number(list, controller, policy)?;
    device.controller_key = controller;
    device.unit_number = Some(unit);
    Ok(unit)
}

/// Attaches `device` to a specific slot on `controller`. The slot may
/// already be held by `device` itself (same key), but by nothing else.
pub fn claim(
    list: &DeviceList,
    device: &mut VirtualDevice,
    controller: DeviceKey,
    unit: i32,
    policy: &SlotPolicy,
) -> Result<(), SlotError> {
    if !policy.range().contains(&unit) {
        return Err(SlotError::OutOfRange {
            controller,
            unit,
            offset: policy.offset,
            capacity: policy.capacity,
        });
    }
    if policy.is_reserved(unit) {
        return Err(SlotError::Reserved { controller, unit });
    }
    if let Some(occupant) =
        list.occupant(controller, unit).filter(|d| d.key != device.key)
    {
        return Err(SlotError::InUse {
            controller,
            unit,
            occupant: occupant.key,
        });
    }

    device.controller_key = controller;
    device.unit_number = Some(unit);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::test_util::*;
    use crate::device::EthernetAdapter;

    fn pci_list_with_units(units: &[i32]) -> DeviceList {
        let mut list = DeviceList::new(base_devices());
        for (i, unit) in units.iter().enumerate() {
            list.append(nic(
                4000 + i as i32,
                *unit,
                EthernetAdapter::Vmxnet3,
                "network-12",
            ));
        }
        list
    }

    #[test]
    fn first_nic_lands_at_offset() {
        let list = DeviceList::new(base_devices());
        assert_eq!(next_unit_number(&list, PCI_KEY, &PCI_NIC_SLOTS), Ok(7));
    }

    #[test]
    fn lowest_free_slot_is_chosen() {
        let list = pci_list_with_units(&[7, 8, 10]);
        assert_eq!(next_unit_number(&list, PCI_KEY, &PCI_NIC_SLOTS), Ok(9));
    }

    #[test]
    fn units_outside_the_range_are_ignored() {
        // Something at unit 3 (below the offset) doesn't consume NIC slots.
        let list = pci_list_with_units(&[3]);
        assert_eq!(next_unit_number(&list, PCI_KEY, &PCI_NIC_SLOTS), Ok(7));
    }

    #[test]
    fn other_controllers_do_not_count() {
        let mut list = DeviceList::new(base_devices());
        list.append(disk(2000, SCSI0_KEY, 0, 10));
        assert_eq!(next_unit_number(&list, IDE0_KEY, &IDE_SLOTS), Ok(0));
    }

    #[test]
    fn capacity_exceeded_exactly_when_full() {
        let policy = SlotPolicy::new(0, 4);
        let mut list = DeviceList::new(base_devices());
        for expected in 0..4 {
            let mut dev = disk(0, IDE0_KEY, 0, 1);
            dev.key = list.new_key();
            let unit = assign(&list, &mut dev, IDE0_KEY, &policy).unwrap();
            assert_eq!(unit, expected);
            list.append(dev);
        }

        let mut dev = disk(0, IDE0_KEY, 0, 1);
        dev.key = list.new_key();
        assert_eq!(
            assign(&list, &mut dev, IDE0_KEY, &policy),
            Err(SlotError::CapacityExceeded {
                controller: IDE0_KEY,
                offset: 0,
                capacity: 4
            })
        );
    }

    #[test]
    fn full_pci_bus() {
        let list = pci_list_with_units(&(7..17).collect::<Vec<_>>());
        assert!(matches!(
            next_unit_number(&list, PCI_KEY, &PCI_NIC_SLOTS),
            Err(SlotError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn reserved_slots_are_skipped() {
        let mut list = DeviceList::new(base_devices());
        for unit in 0..7 {
            list.append(disk(2000 + unit, SCSI0_KEY, unit, 1));
        }
        assert_eq!(next_unit_number(&list, SCSI0_KEY, &SCSI_SLOTS), Ok(8));
    }

    #[test]
    fn alternate_topology() {
        let policy = SlotPolicy::new(2, 2).with_reserved(&[3]);
        let list = DeviceList::new(base_devices());
        assert_eq!(next_unit_number(&list, PCI_KEY, &policy), Ok(2));

        let list = pci_list_with_units(&[2]);
        assert!(next_unit_number(&list, PCI_KEY, &policy).is_err());
    }

    #[test]
    fn flat_scsi_addressing() {
        assert_eq!(SCSI_SLOTS.flat_address(0), Some((0, 0)));
        assert_eq!(SCSI_SLOTS.flat_address(6), Some((0, 6)));
        assert_eq!(SCSI_SLOTS.flat_address(7), Some((0, 8)));
        assert_eq!(SCSI_SLOTS.flat_address(14), Some((0, 15)));
        assert_eq!(SCSI_SLOTS.flat_address(15), Some((1, 0)));
        assert_eq!(SCSI_SLOTS.flat_address(-1), None);

        assert_eq!(SCSI_SLOTS.flat_index(0, 8), Some(7));
        assert_eq!(SCSI_SLOTS.flat_index(1, 0), Some(15));
        assert_eq!(SCSI_SLOTS.flat_index(0, 7), None);
        for n in 0..60 {
            let (bus, unit) = SCSI_SLOTS.flat_address(n).unwrap();
            assert_eq!(SCSI_SLOTS.flat_index(bus, unit), Some(n));
        }
    }

    #[test]
    fn claim_checks() {
        let list = pci_list_with_units(&[7]);
        let mut dev = nic(-201, 0, EthernetAdapter::E1000, "network-12");

        assert!(matches!(
            claim(&list, &mut dev, PCI_KEY, 3, &PCI_NIC_SLOTS),
            Err(SlotError::OutOfRange { unit: 3, .. })
        ));
        assert_eq!(
            claim(&list, &mut dev, PCI_KEY, 7, &PCI_NIC_SLOTS),
            Err(SlotError::InUse {
                controller: PCI_KEY,
                unit: 7,
                occupant: DeviceKey(4000)
            })
        );
        assert_eq!(
            claim(&list, &mut dev, SCSI0_KEY, 7, &SCSI_SLOTS),
            Err(SlotError::Reserved { controller: SCSI0_KEY, unit: 7 })
        );

        claim(&list, &mut dev, PCI_KEY, 8, &PCI_NIC_SLOTS).unwrap();
        assert_eq!(dev.controller_key, PCI_KEY);
        assert_eq!(dev.unit_number, Some(8));

        // A device may re-claim the slot it already holds.
        let mut holder = list.find(DeviceKey(4000)).unwrap().clone();
        assert!(claim(&list, &mut holder, PCI_KEY, 7, &PCI_NIC_SLOTS).is_ok());
    }
}
