// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One full convergence round against an inventory: read the VM, plan the
//! changes, submit them as a single batch, then read back the keys the
//! inventory assigned.

use slog::info;
use thiserror::Error;

use crate::changes::ChangeSpec;
use crate::inventory::{ApplyError, ApplySink, InventoryError, InventoryReader};
use crate::reconcile::{DeclaredHardware, Reconciler};
use crate::subresource;

#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("failed to plan hardware changes")]
    Reconcile(#[from] subresource::Error),

    #[error("reconfiguration rejected")]
    Apply(#[from] ApplyError),
}

#[derive(Debug)]
pub struct ConvergeReport {
    /// The batch that was submitted. Empty if the VM already matched.
    pub changes: Vec<ChangeSpec>,

    /// The declared hardware with the keys and slots now in effect.
    pub declared: DeclaredHardware,
}

pub fn converge<I>(
    reconciler: &Reconciler<'_>,
    inventory: &mut I,
    vm_uuid: &str,
    declared: &DeclaredHardware,
) -> Result<ConvergeReport, ConvergeError>
where
    I: InventoryReader + ApplySink,
{
    let log = reconciler.log();
    let vm = inventory.vm_properties(vm_uuid)?;
    let outcome = reconciler.reconcile(declared, &vm.devices)?;

    if outcome.is_converged() {
        info!(log, "hardware already converged"; "vm" => vm_uuid);
        let declared = reconciler.refresh(&outcome.declared, &vm.devices)?;
        return Ok(ConvergeReport { changes: Vec::new(), declared });
    }

    inventory.apply(vm_uuid, &outcome.changes)?;
    info!(log, "applied hardware changes";
        "vm" => vm_uuid,
        "changes" => outcome.changes.len());

    let after = inventory.vm_properties(vm_uuid)?;
    let declared = reconciler.refresh(&outcome.declared, &after.devices)?;
    Ok(ConvergeReport { changes: outcome.changes, declared })
}
