// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clone specs: checking that a VM can serve as a clone source, and
//! describing where the clone's files go.
//!
//! Disk placement for a clone goes through the same
//! [`DiskSubresource::placement`] as a newly created disk.

use serde::{Deserialize, Serialize};
use slog::{debug, info};
use thiserror::Error;
use vmhw_types::{DeviceKey, MoRef, PowerState};

use crate::device::{DeviceList, DiskBacking, VirtualDevice, VirtualDisk};
use crate::inventory::VmProperties;
use crate::reconcile::{DeclaredHardware, Reconciler};
use crate::resolve::ResolveError;
use crate::subresource::{self, slot_address_of, DiskSubresource, Subresource};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSettings {
    pub template_uuid: String,
    #[serde(default)]
    pub linked_clone: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiskMoveType {
    MoveAllDiskBackingsAndDisallowSharing,
    /// Each disk of the clone is a copy-on-write child of the source
    /// snapshot's disk.
    CreateNewChildDiskBacking,
}

/// Where one of the source's disks goes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLocator {
    pub disk_id: DeviceKey,
    pub datastore: MoRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing: Option<DiskBacking>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocateSpec {
    pub datastore: MoRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_move_type: Option<DiskMoveType>,
    pub disks: Vec<DiskLocator>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSpec {
    pub location: RelocateSpec,
    /// The snapshot linked clones are based on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<MoRef>,
}

#[derive(Debug, Error)]
pub enum CloneError {
    #[error("source VM {uuid} must be powered off to be cloned (is {state})")]
    SourceNotPoweredOff { uuid: String, state: PowerState },

    #[error("source VM {uuid} has no snapshot to base a linked clone on")]
    NoSnapshot { uuid: String },

    #[error(
        "source VM {uuid} must have exactly one root snapshot without \
        children for a linked clone (has {roots} root(s), first root has \
        {children} child(ren))"
    )]
    AmbiguousSnapshot { uuid: String, roots: usize, children: usize },

    #[error(
        "current snapshot {current} of source VM {uuid} is not its root \
        snapshot {root}"
    )]
    SnapshotMismatch { uuid: String, current: String, root: MoRef },

    #[error(
        "source VM {uuid} has {source_disks} disk(s), but only {declared} \
        are declared"
    )]
    DiskCountMismatch { uuid: String, source_disks: usize, declared: usize },

    #[error(
        "disk {index}: declared size {declared_gib} GiB is smaller than the \
        source disk ({source_gib} GiB)"
    )]
    DiskShrink { index: usize, declared_gib: i64, source_gib: i64 },

    #[error(
        "disk {index}: linked clone disks must keep the source size of \
        {source_gib} GiB (declared {declared_gib} GiB)"
    )]
    LinkedCloneDiskResize { index: usize, declared_gib: i64, source_gib: i64 },

    #[error("could not resolve target datastore {id:?}")]
    DatastoreResolution {
        id: String,
        #[source]
        source: ResolveError,
    },

    #[error("could not place disk {index} of the clone")]
    Relocation {
        index: usize,
        #[source]
        source: subresource::Error,
    },
}

/// Checks that `source` can be cloned. Power state is checked first; the
/// snapshot tree only matters for linked clones.
pub fn validate_clone_source(
    source: &VmProperties,
    linked_clone: bool,
) -> Result<(), CloneError> {
    if source.power_state != PowerState::PoweredOff {
        return Err(CloneError::SourceNotPoweredOff {
            uuid: source.uuid.clone(),
            state: source.power_state,
        });
    }
    if linked_clone {
        linked_clone_snapshot(source)?;
    }
    Ok(())
}

/// Returns the one snapshot a linked clone of `source` can be based on.
fn linked_clone_snapshot(source: &VmProperties) -> Result<&MoRef, CloneError> {
    let uuid = || source.uuid.clone();
    let info = source
        .snapshot
        .as_ref()
        .ok_or_else(|| CloneError::NoSnapshot { uuid: uuid() })?;

    let root = match info.root_snapshot_list.as_slice() {
        [root] if root.child_snapshot_list.is_empty() => root,
        roots => {
            return Err(CloneError::AmbiguousSnapshot {
                uuid: uuid(),
                roots: roots.len(),
                children: roots
                    .first()
                    .map_or(0, |r| r.child_snapshot_list.len()),
            })
        }
    };

    match &info.current_snapshot {
        Some(current) if *current == root.snapshot => Ok(current),
        current => Err(CloneError::SnapshotMismatch {
            uuid: uuid(),
            current: current
                .as_ref()
                .map_or_else(|| "(none)".to_owned(), |c| c.to_string()),
            root: root.snapshot.clone(),
        }),
    }
}

/// The source's disks in bus order, which is the order declared disks are
/// matched against.
fn source_disks(devices: &DeviceList) -> Vec<&VirtualDevice> {
    let mut disks: Vec<_> = devices
        .iter()
        .filter(|d| d.as_disk().is_some())
        .map(|d| {
            let order = slot_address_of(devices, d)
                .map(|a| (a.bus, a.bus_number, a.unit_number));
            (order, d)
        })
        .collect();
    disks.sort_by_key(|(order, _)| *order);
    disks.into_iter().map(|(_, d)| d).collect()
}

fn size_gib(device: &VirtualDevice) -> i64 {
    device.as_disk().map_or(0, VirtualDisk::size_gib)
}

/// Checks the declared disks against the source's. Every source disk needs
/// a declared counterpart that is at least as large, and exactly as large
/// for a linked clone.
pub fn validate_clone_disks(
    source: &VmProperties,
    declared: &DeclaredHardware,
    linked_clone: bool,
) -> Result<(), CloneError> {
    let disks = source_disks(&source.devices);
    if declared.disks.len() < disks.len() {
        return Err(CloneError::DiskCountMismatch {
            uuid: source.uuid.clone(),
            source_disks: disks.len(),
            declared: declared.disks.len(),
        });
    }

    for (index, (device, config)) in
        disks.iter().zip(declared.disks.iter()).enumerate()
    {
        let source_gib = size_gib(device);
        let declared_gib = config.size_gib;
        if declared_gib < source_gib {
            return Err(CloneError::DiskShrink {
                index,
                declared_gib,
                source_gib,
            });
        }
        if linked_clone && declared_gib != source_gib {
            return Err(CloneError::LinkedCloneDiskResize {
                index,
                declared_gib,
                source_gib,
            });
        }
    }
    Ok(())
}

/// Assembles the clone spec for a clone of `source` onto
/// `target_datastore`.
pub fn build_clone_spec(
    reconciler: &Reconciler<'_>,
    source: &VmProperties,
    declared: &DeclaredHardware,
    settings: &CloneSettings,
    target_datastore: &str,
) -> Result<CloneSpec, CloneError> {
    let log = reconciler.log();
    let linked = settings.linked_clone;
    validate_clone_source(source, linked)?;
    validate_clone_disks(source, declared, linked)?;

    let base = reconciler.context();
    let ctx = subresource::Context {
        default_datastore: Some(target_datastore),
        ..base
    };
    let datastore = ctx
        .resolver
        .datastore(target_datastore, ctx.api_timeout)
        .map_err(|source| CloneError::DatastoreResolution {
            id: target_datastore.to_owned(),
            source,
        })?;

    let snapshot = if linked {
        let snapshot = linked_clone_snapshot(source)?.clone();
        debug!(log, "linked clone"; "snapshot" => %snapshot);
        Some(snapshot)
    } else {
        None
    };

    let disks = source_disks(&source.devices)
        .into_iter()
        .zip(declared.disks.iter())
        .enumerate()
        .map(|(index, (device, config))| {
            DiskSubresource::new(index, config.clone())
                .relocator(&ctx, device, linked)
                .map_err(|source| CloneError::Relocation { index, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    info!(log, "built clone spec";
        "source" => &source.uuid,
        "datastore" => %datastore,
        "linked" => linked,
        "disks" => disks.len());

    Ok(CloneSpec {
        location: RelocateSpec {
            datastore,
            disk_move_type: linked
                .then_some(DiskMoveType::CreateNewChildDiskBacking),
            disks,
        },
        snapshot,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::test_util::*;
    use crate::device::{ControllerType, ScsiType};
    use crate::inventory::{SnapshotInfo, SnapshotTree};
    use crate::resolve::test_util::resolver;
    use crate::subresource::DiskConfig;
    use slog::{o, Logger};

    fn snapshot(id: &str, children: Vec<SnapshotTree>) -> SnapshotTree {
        SnapshotTree {
            snapshot: MoRef::snapshot(id),
            name: id.to_owned(),
            child_snapshot_list: children,
        }
    }

    fn template(power_state: PowerState) -> VmProperties {
        let mut devices = DeviceList::new(base_devices());
        devices.append(controller(
            SCSI0_KEY,
            ControllerType::Scsi(ScsiType::LsiLogicSas),
            0,
        ));
        // Listed out of bus order on purpose.
        devices.append(disk(2001, SCSI0_KEY, 1, 40));
        devices.append(disk(2000, SCSI0_KEY, 0, 20));
        VmProperties {
            uuid: "4207e1a2".to_owned(),
            name: "template".to_owned(),
            power_state,
            snapshot: Some(SnapshotInfo {
                current_snapshot: Some(MoRef::snapshot("snapshot-1")),
                root_snapshot_list: vec![snapshot("snapshot-1", vec![])],
            }),
            devices,
        }
    }

    fn declared(sizes: &[i64]) -> DeclaredHardware {
        DeclaredHardware {
            disks: sizes.iter().map(|s| DiskConfig::new(*s)).collect(),
            ..Default::default()
        }
    }

    fn test_log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn powered_on_source_fails_before_snapshot_checks() {
        let mut vm = template(PowerState::PoweredOn);
        vm.snapshot = None;
        assert!(matches!(
            validate_clone_source(&vm, true),
            Err(CloneError::SourceNotPoweredOff {
                state: PowerState::PoweredOn,
                ..
            })
        ));

        let (log, r) = (test_log(), resolver());
        let rec = Reconciler::new(&log, &r);
        let settings =
            CloneSettings { template_uuid: vm.uuid.clone(), linked_clone: true };
        assert!(matches!(
            build_clone_spec(&rec, &vm, &declared(&[20, 40]), &settings, "datastore1"),
            Err(CloneError::SourceNotPoweredOff { .. })
        ));
    }

    #[test]
    fn snapshot_shapes() {
        let vm = template(PowerState::PoweredOff);
        assert!(validate_clone_source(&vm, true).is_ok());

        let mut none = vm.clone();
        none.snapshot = None;
        assert!(matches!(
            validate_clone_source(&none, true),
            Err(CloneError::NoSnapshot { .. })
        ));
        // Full clones don't care.
        assert!(validate_clone_source(&none, false).is_ok());

        let mut two_roots = vm.clone();
        two_roots.snapshot = Some(SnapshotInfo {
            current_snapshot: Some(MoRef::snapshot("snapshot-1")),
            root_snapshot_list: vec![
                snapshot("snapshot-1", vec![]),
                snapshot("snapshot-2", vec![]),
            ],
        });
        assert!(matches!(
            validate_clone_source(&two_roots, true),
            Err(CloneError::AmbiguousSnapshot { roots: 2, .. })
        ));

        let mut nested = vm.clone();
        nested.snapshot = Some(SnapshotInfo {
            current_snapshot: Some(MoRef::snapshot("snapshot-1")),
            root_snapshot_list: vec![snapshot(
                "snapshot-1",
                vec![snapshot("snapshot-2", vec![])],
            )],
        });
        assert!(matches!(
            validate_clone_source(&nested, true),
            Err(CloneError::AmbiguousSnapshot { roots: 1, children: 1, .. })
        ));

        let mut moved = vm.clone();
        moved.snapshot = Some(SnapshotInfo {
            current_snapshot: Some(MoRef::snapshot("snapshot-9")),
            root_snapshot_list: vec![snapshot("snapshot-1", vec![])],
        });
        assert!(matches!(
            validate_clone_source(&moved, true),
            Err(CloneError::SnapshotMismatch { .. })
        ));
    }

    #[test]
    fn linked_clone_spec() {
        let (log, r) = (test_log(), resolver());
        let rec = Reconciler::new(&log, &r);
        let vm = template(PowerState::PoweredOff);
        let settings =
            CloneSettings { template_uuid: vm.uuid.clone(), linked_clone: true };

        let spec = build_clone_spec(
            &rec,
            &vm,
            &declared(&[20, 40, 100]),
            &settings,
            "datastore2",
        )
        .unwrap();
        assert_eq!(spec.snapshot, Some(MoRef::snapshot("snapshot-1")));
        assert_eq!(spec.location.datastore, MoRef::datastore("datastore-12"));
        assert_eq!(
            spec.location.disk_move_type,
            Some(DiskMoveType::CreateNewChildDiskBacking)
        );

        // One locator per source disk, in bus order.
        let ids: Vec<_> =
            spec.location.disks.iter().map(|d| d.disk_id.get()).collect();
        assert_eq!(ids, vec![2000, 2001]);
        assert!(spec.location.disks.iter().all(|d| d.backing.is_none()
            && d.datastore == MoRef::datastore("datastore-12")));
    }

    #[test]
    fn full_clone_spec_places_disks_like_create() {
        let (log, r) = (test_log(), resolver());
        let rec = Reconciler::new(&log, &r);
        let vm = template(PowerState::PoweredOff);
        let settings =
            CloneSettings { template_uuid: vm.uuid.clone(), linked_clone: false };

        let mut hw = declared(&[20, 60]);
        hw.disks[1].datastore_id = Some("datastore-11".to_owned());
        hw.disks[1].thin_provisioned = false;
        hw.disks[1].eagerly_scrub = true;

        let spec =
            build_clone_spec(&rec, &vm, &hw, &settings, "datastore2").unwrap();
        assert_eq!(spec.snapshot, None);
        assert_eq!(spec.location.disk_move_type, None);

        let second = &spec.location.disks[1];
        assert_eq!(second.disk_id, DeviceKey(2001));
        assert_eq!(second.datastore, MoRef::datastore("datastore-11"));
        let backing = second.backing.as_ref().unwrap();
        assert!(!backing.thin_provisioned);
        assert!(backing.eagerly_scrub);
        assert_eq!(backing.file_name, "[datastore1] vm/vm_1.vmdk");
    }

    #[test]
    fn disk_checks() {
        let vm = template(PowerState::PoweredOff);
        assert!(matches!(
            validate_clone_disks(&vm, &declared(&[20]), false),
            Err(CloneError::DiskCountMismatch { source_disks: 2, declared: 1, .. })
        ));
        assert!(matches!(
            validate_clone_disks(&vm, &declared(&[20, 30]), false),
            Err(CloneError::DiskShrink { index: 1, .. })
        ));
        assert!(validate_clone_disks(&vm, &declared(&[20, 50]), false).is_ok());
        assert!(matches!(
            validate_clone_disks(&vm, &declared(&[20, 50]), true),
            Err(CloneError::LinkedCloneDiskResize { index: 1, source_gib: 40, .. })
        ));
    }

    #[test]
    fn unknown_target_datastore() {
        let (log, r) = (test_log(), resolver());
        let rec = Reconciler::new(&log, &r);
        let vm = template(PowerState::PoweredOff);
        let settings = CloneSettings::default();
        assert!(matches!(
            build_clone_spec(&rec, &vm, &declared(&[20, 40]), &settings, "nope"),
            Err(CloneError::DatastoreResolution { .. })
        ));
    }
}
