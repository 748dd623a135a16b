// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Change specs: the add/edit/remove instructions submitted to the remote
//! system as one reconfiguration batch.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use vmhw_types::DeviceKey;

use crate::device::{DeviceList, VirtualDevice};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChangeOperation {
    Add,
    Edit,
    Remove,
}

/// What should happen to a device's backing file alongside the device
/// operation.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FileOperation {
    Create,
    Destroy,
}

/// A single device mutation. The full device record is always carried, as
/// the remote system expects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSpec {
    pub operation: ChangeOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_operation: Option<FileOperation>,
    pub device: VirtualDevice,
}

impl ChangeSpec {
    pub fn add(device: VirtualDevice) -> Self {
        Self { operation: ChangeOperation::Add, file_operation: None, device }
    }

    pub fn edit(device: VirtualDevice) -> Self {
        Self { operation: ChangeOperation::Edit, file_operation: None, device }
    }

    pub fn remove(device: VirtualDevice) -> Self {
        Self {
            operation: ChangeOperation::Remove,
            file_operation: None,
            device,
        }
    }

    /// An add for a device with a pending key, an edit otherwise.
    pub fn add_or_edit(device: VirtualDevice) -> Self {
        if device.key.is_pending() {
            Self::add(device)
        } else {
            Self::edit(device)
        }
    }

    pub fn with_file_operation(mut self, op: FileOperation) -> Self {
        self.file_operation = Some(op);
        self
    }

    pub fn key(&self) -> DeviceKey {
        self.device.key
    }
}

/// Applies `specs` to a working device list, in order. Keys are left as they
/// are; only the remote system assigns real ones.
pub(crate) fn apply_to(list: &mut DeviceList, specs: &[ChangeSpec]) {
    for spec in specs {
        match spec.operation {
            ChangeOperation::Add => list.append(spec.device.clone()),
            ChangeOperation::Edit => {
                list.replace(spec.device.clone());
            }
            ChangeOperation::Remove => {
                list.excise(spec.key());
            }
        }
    }
}

/// Local accumulator for a batch under construction.
///
/// The batch only leaves the reconciler through [`ChangeSet::into_specs`],
/// once every subresource operation has succeeded.
#[derive(Debug, Default)]
pub(crate) struct ChangeSet {
    specs: Vec<ChangeSpec>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `spec`. An edit of a device that already has a pending add or
    /// edit in this batch replaces that record in place, keeping its
    /// operation and file operation, so each key appears at most once.
    pub fn push(&mut self, spec: ChangeSpec) {
        if spec.operation == ChangeOperation::Edit {
            if let Some(prev) = self.specs.iter_mut().find(|s| {
                s.key() == spec.key()
                    && s.operation != ChangeOperation::Remove
            }) {
                prev.device = spec.device;
                return;
            }
        }
        self.specs.push(spec);
    }

    pub fn extend(&mut self, specs: impl IntoIterator<Item = ChangeSpec>) {
        for spec in specs {
            self.push(spec);
        }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn count(&self, op: ChangeOperation) -> usize {
        self.specs.iter().filter(|s| s.operation == op).count()
    }

    pub fn into_specs(self) -> Vec<ChangeSpec> {
        self.specs
    }
}
