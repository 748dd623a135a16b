// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The list reconciler: converges a VM's device list on its declared
//! hardware.
//!
//! A pass works on a private copy of the current device list. Devices that
//! are no longer declared are removed first, children before the controllers
//! they hang off. Then every declared entry is created, updated or left
//! alone, kind by kind (controllers, disks, network interfaces, CD-ROMs) and
//! in declared order within a kind. Each operation sees the effects of
//! every operation before it, which is what makes key and slot allocation
//! deterministic.
//!
//! The first error aborts the pass. The change specs built up to that point
//! are dropped with it.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slog::{debug, info, o, Logger};
use vmhw_types::{ApiType, DeviceKey};

use crate::changes::{apply_to, ChangeOperation, ChangeSet, ChangeSpec};
use crate::device::DeviceList;
use crate::resolve::{NameResolver, DEFAULT_API_TIMEOUT};
use crate::slot::SlotPolicies;
use crate::subresource::{
    locate_by_slot, CdromConfig, CdromSubresource, Context,
    ControllerConfig, ControllerSubresource, DiskConfig, DiskSubresource,
    Error, NetworkInterfaceConfig, NetworkInterfaceSubresource, Subresource,
};

/// A VM's declared hardware, one ordered list per device kind.
///
/// After a successful pass each entry also carries the key and slot of the
/// device it was reconciled with; writing these back is what lets the next
/// pass find the same devices again.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeclaredHardware {
    pub controllers: Vec<ControllerConfig>,
    pub disks: Vec<DiskConfig>,
    pub network_interfaces: Vec<NetworkInterfaceConfig>,
    pub cdroms: Vec<CdromConfig>,
}

impl DeclaredHardware {
    pub fn len(&self) -> usize {
        self.controllers.len()
            + self.disks.len()
            + self.network_interfaces.len()
            + self.cdroms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct ReconcileOutcome {
    /// The device list as it will look once `changes` is applied, with
    /// placeholder keys for added devices.
    pub devices: DeviceList,

    /// The batch to submit, in order.
    pub changes: Vec<ChangeSpec>,

    /// The declared hardware with keys and slots filled in.
    pub declared: DeclaredHardware,
}

impl ReconcileOutcome {
    pub fn is_converged(&self) -> bool {
        self.changes.is_empty()
    }
}

pub struct Reconciler<'a> {
    log: Logger,
    resolver: &'a dyn NameResolver,
    policies: SlotPolicies,
    api_type: ApiType,
    default_datastore: Option<String>,
    api_timeout: Duration,
}

impl<'a> Reconciler<'a> {
    pub fn new(log: &Logger, resolver: &'a dyn NameResolver) -> Self {
        Self {
            log: log.new(o!("component" => "reconciler")),
            resolver,
            policies: SlotPolicies::default(),
            api_type: ApiType::default(),
            default_datastore: None,
            api_timeout: DEFAULT_API_TIMEOUT,
        }
    }

    pub fn with_slot_policies(mut self, policies: SlotPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_api_type(mut self, api_type: ApiType) -> Self {
        self.api_type = api_type;
        self
    }

    /// The datastore used for disks that don't name one.
    pub fn with_default_datastore(mut self, id: impl Into<String>) -> Self {
        self.default_datastore = Some(id.into());
        self
    }

    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub(crate) fn context(&self) -> Context<'_> {
        Context {
            log: &self.log,
            resolver: self.resolver,
            policies: &self.policies,
            api_type: self.api_type,
            default_datastore: self.default_datastore.as_deref(),
            api_timeout: self.api_timeout,
        }
    }

    /// Computes the change specs that take `current` to `declared`.
    pub fn reconcile(
        &self,
        declared: &DeclaredHardware,
        current: &DeviceList,
    ) -> Result<ReconcileOutcome, Error> {
        let ctx = self.context();
        let mut working = current.clone();
        let mut changes = ChangeSet::new();

        let mut controllers =
            self.bind::<ControllerSubresource>(&declared.controllers, &working);
        let mut disks = self.bind::<DiskSubresource>(&declared.disks, &working);
        let mut nics = self.bind::<NetworkInterfaceSubresource>(
            &declared.network_interfaces,
            &working,
        );
        let mut cdroms = self.bind::<CdromSubresource>(&declared.cdroms, &working);

        self.remove_undeclared(&ctx, &disks, &mut working, &mut changes)?;
        self.remove_undeclared(&ctx, &nics, &mut working, &mut changes)?;
        self.remove_undeclared(&ctx, &cdroms, &mut working, &mut changes)?;
        self.remove_undeclared(&ctx, &controllers, &mut working, &mut changes)?;

        self.converge(&ctx, &mut controllers, &mut working, &mut changes)?;
        self.converge(&ctx, &mut disks, &mut working, &mut changes)?;
        self.converge(&ctx, &mut nics, &mut working, &mut changes)?;
        self.converge(&ctx, &mut cdroms, &mut working, &mut changes)?;

        info!(self.log, "reconciled hardware";
            "devices" => working.len(),
            "specs" => changes.len(),
            "adds" => changes.count(ChangeOperation::Add),
            "edits" => changes.count(ChangeOperation::Edit),
            "removes" => changes.count(ChangeOperation::Remove));

        Ok(ReconcileOutcome {
            devices: working,
            changes: changes.into_specs(),
            declared: DeclaredHardware {
                controllers: configs(controllers),
                disks: configs(disks),
                network_interfaces: configs(nics),
                cdroms: configs(cdroms),
            },
        })
    }

    /// Reads every keyed entry back from `current`, filling in computed
    /// attributes. Entries still holding a placeholder key from the last
    /// pass pick up the key the remote system assigned, found by slot.
    pub fn refresh(
        &self,
        declared: &DeclaredHardware,
        current: &DeviceList,
    ) -> Result<DeclaredHardware, Error> {
        let ctx = self.context();
        Ok(DeclaredHardware {
            controllers: self.refresh_kind::<ControllerSubresource>(
                &ctx,
                &declared.controllers,
                current,
            )?,
            disks: self.refresh_kind::<DiskSubresource>(
                &ctx,
                &declared.disks,
                current,
            )?,
            network_interfaces: self
                .refresh_kind::<NetworkInterfaceSubresource>(
                    &ctx,
                    &declared.network_interfaces,
                    current,
                )?,
            cdroms: self.refresh_kind::<CdromSubresource>(
                &ctx,
                &declared.cdroms,
                current,
            )?,
        })
    }

    /// Builds handlers for `entries`, associating entries that have no usable
    /// key with the device at their recorded slot, if there is one and no
    /// other entry already claims it.
    fn bind<S: Subresource>(
        &self,
        entries: &[S::Config],
        list: &DeviceList,
    ) -> Vec<S> {
        let mut handlers: Vec<S> = entries
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, config)| S::new(index, config))
            .collect();
        let mut bound: HashSet<DeviceKey> = handlers
            .iter()
            .filter_map(|h| h.key())
            .filter(|k| list.find(*k).is_some())
            .collect();

        for handler in handlers.iter_mut() {
            match handler.key() {
                Some(key) if list.find(key).is_some() => continue,
                // A real key that has gone missing is drift, and is reported
                // as such by the read.
                Some(key) if key.is_assigned() => continue,
                _ => {}
            }
            let Some(addr) = handler.recorded_slot(&self.policies) else {
                continue;
            };
            let Some(key) = locate_by_slot(list, &addr, S::manages) else {
                continue;
            };
            if bound.insert(key) {
                debug!(self.log, "bound entry by slot";
                    "kind" => %S::TYPE,
                    "index" => handler.index(),
                    "key" => %key);
                handler.set_key(key);
            }
        }
        handlers
    }

    fn remove_undeclared<S: Subresource>(
        &self,
        ctx: &Context<'_>,
        handlers: &[S],
        working: &mut DeviceList,
        changes: &mut ChangeSet,
    ) -> Result<(), Error> {
        let declared: HashSet<DeviceKey> =
            handlers.iter().filter_map(|h| h.key()).collect();
        let doomed: Vec<(usize, DeviceKey)> = working
            .iter()
            .enumerate()
            .filter(|(_, d)| S::manages(d) && !declared.contains(&d.key))
            .map(|(pos, d)| (pos, d.key))
            .collect();

        for (pos, key) in doomed {
            debug!(self.log, "deleting undeclared device";
                "kind" => %S::TYPE, "key" => %key);
            let specs = S::existing(pos, key).delete(ctx, working)?;
            apply_to(working, &specs);
            changes.extend(specs);
        }
        Ok(())
    }

    fn converge<S: Subresource>(
        &self,
        ctx: &Context<'_>,
        handlers: &mut [S],
        working: &mut DeviceList,
        changes: &mut ChangeSet,
    ) -> Result<(), Error> {
        for handler in handlers.iter_mut() {
            let (op, specs) = match handler.key() {
                None => ("create", handler.create(ctx, working)?),
                Some(_) => {
                    handler.canonicalize(ctx)?;
                    let observed = observe(ctx, handler, working)?;
                    if S::differs(handler.config(), &observed) {
                        ("update", handler.update(ctx, working, &observed)?)
                    } else {
                        *handler = S::new(handler.index(), observed);
                        ("unchanged", Vec::new())
                    }
                }
            };

            debug!(self.log, "reconciled entry";
                "kind" => %S::TYPE,
                "index" => handler.index(),
                "op" => op,
                "key" => handler.key().map(|k| k.get()),
                "specs" => specs.len());
            apply_to(working, &specs);
            changes.extend(specs);
        }
        Ok(())
    }

    fn refresh_kind<S: Subresource>(
        &self,
        ctx: &Context<'_>,
        entries: &[S::Config],
        current: &DeviceList,
    ) -> Result<Vec<S::Config>, Error> {
        self.bind::<S>(entries, current)
            .into_iter()
            .map(|handler| match handler.key() {
                Some(_) => observe(ctx, &handler, current),
                None => Ok(handler.into_config()),
            })
            .collect()
    }
}

/// Reads the device behind `handler` into a copy of its declared config, so
/// that attributes the device doesn't carry (such as whether to keep a disk's
/// file) survive.
fn observe<S: Subresource>(
    ctx: &Context<'_>,
    handler: &S,
    list: &DeviceList,
) -> Result<S::Config, Error> {
    let mut scratch = S::new(handler.index(), handler.config().clone());
    scratch.read(ctx, list)?;
    Ok(scratch.into_config())
}

fn configs<S: Subresource>(handlers: Vec<S>) -> Vec<S::Config> {
    handlers.into_iter().map(S::into_config).collect()
}
