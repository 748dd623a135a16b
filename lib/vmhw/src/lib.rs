// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Declarative management of a virtual machine's hardware.
//!
//! A VM's disks, network interfaces, CD-ROMs and storage controllers are
//! declared as ordered lists. The [`Reconciler`] compares them with the VM's
//! current device list and produces the batch of [`ChangeSpec`]s that makes
//! the two agree.

#![allow(clippy::style)]

pub mod changes;
pub mod clone;
pub mod converge;
pub mod device;
pub mod inventory;
pub mod reconcile;
pub mod resolve;
pub mod slot;
pub mod subresource;

pub use changes::{ChangeOperation, ChangeSpec, FileOperation};
pub use converge::{converge, ConvergeError, ConvergeReport};
pub use device::{DeviceList, VirtualDevice};
pub use reconcile::{DeclaredHardware, ReconcileOutcome, Reconciler};
pub use vmhw_types::{ApiType, DeviceKey, MoRef, PowerState};
