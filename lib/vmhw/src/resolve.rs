// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolution of user-facing identifiers to managed object references.
//!
//! The reconciler never talks to the management endpoint directly; lookups
//! of networks and datastores go through a [`NameResolver`]. Retries belong
//! to the resolver implementation, not to the callers in this crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vmhw_types::MoRef;

use crate::device::EthernetBacking;

/// The deadline applied to each individual lookup.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no {kind} matches {id:?}")]
    NotFound { kind: &'static str, id: String },

    #[error("{count} {kind} objects match {id:?}")]
    Ambiguous { kind: &'static str, id: String, count: usize },
}

/// Looks up networks and datastores on the management endpoint.
pub trait NameResolver {
    /// Returns the NIC backing that connects a device to the network
    /// identified by `network_id`.
    fn network_backing(
        &self,
        network_id: &str,
        timeout: Duration,
    ) -> Result<EthernetBacking, ResolveError>;

    /// Maps the logical-switch ID of an opaque network to its reference.
    fn opaque_network(
        &self,
        opaque_network_id: &str,
        timeout: Duration,
    ) -> Result<MoRef, ResolveError>;

    /// Maps a distributed switch UUID and port group key to the port
    /// group's reference.
    fn distributed_port_group(
        &self,
        switch_uuid: &str,
        portgroup_key: &str,
        timeout: Duration,
    ) -> Result<MoRef, ResolveError>;

    fn datastore(
        &self,
        datastore_id: &str,
        timeout: Duration,
    ) -> Result<MoRef, ResolveError>;
}

/// A network known to a [`StaticResolver`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEntry {
    Standard {
        id: String,
        name: String,
    },
    Opaque {
        id: String,
        name: String,
        opaque_network_id: String,
        #[serde(default = "default_opaque_network_type")]
        opaque_network_type: String,
    },
    DistributedPortGroup {
        id: String,
        name: String,
        switch_uuid: String,
        portgroup_key: String,
    },
}

fn default_opaque_network_type() -> String {
    "nsx.LogicalSwitch".to_owned()
}

impl NetworkEntry {
    pub fn id(&self) -> &str {
        match self {
            NetworkEntry::Standard { id, .. }
            | NetworkEntry::Opaque { id, .. }
            | NetworkEntry::DistributedPortGroup { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NetworkEntry::Standard { name, .. }
            | NetworkEntry::Opaque { name, .. }
            | NetworkEntry::DistributedPortGroup { name, .. } => name,
        }
    }

    fn moref(&self) -> MoRef {
        match self {
            NetworkEntry::Standard { id, .. } => MoRef::network(id.as_str()),
            NetworkEntry::Opaque { id, .. } => {
                MoRef::new("OpaqueNetwork", id.as_str())
            }
            NetworkEntry::DistributedPortGroup { id, .. } => {
                MoRef::new("DistributedVirtualPortgroup", id.as_str())
            }
        }
    }

    fn backing(&self) -> EthernetBacking {
        match self {
            NetworkEntry::Standard { name, .. } => EthernetBacking::Network {
                network: Some(self.moref()),
                device_name: name.clone(),
            },
            NetworkEntry::Opaque {
                opaque_network_id, opaque_network_type, ..
            } => EthernetBacking::OpaqueNetwork {
                opaque_network_id: opaque_network_id.clone(),
                opaque_network_type: opaque_network_type.clone(),
            },
            NetworkEntry::DistributedPortGroup {
                switch_uuid,
                portgroup_key,
                ..
            } => EthernetBacking::DistributedVirtualPort {
                switch_uuid: switch_uuid.clone(),
                portgroup_key: portgroup_key.clone(),
            },
        }
    }
}

/// A datastore known to a [`StaticResolver`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreEntry {
    pub id: String,
    pub name: String,
}

/// A resolver over a fixed snapshot of the inventory.
///
/// Identifiers match by ID first; failing that, by name, where more than one
/// match is an error rather than a guess.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticResolver {
    #[serde(default)]
    pub networks: Vec<NetworkEntry>,
    #[serde(default)]
    pub datastores: Vec<DatastoreEntry>,
}

impl StaticResolver {
    fn find_network(&self, id: &str) -> Result<&NetworkEntry, ResolveError> {
        if let Some(net) = self.networks.iter().find(|n| n.id() == id) {
            return Ok(net);
        }
        let matches: Vec<_> =
            self.networks.iter().filter(|n| n.name() == id).collect();
        match matches.as_slice() {
            [net] => Ok(*net),
            [] => Err(ResolveError::NotFound {
                kind: "network",
                id: id.to_owned(),
            }),
            _ => Err(ResolveError::Ambiguous {
                kind: "network",
                id: id.to_owned(),
                count: matches.len(),
            }),
        }
    }
}

impl NameResolver for StaticResolver {
    fn network_backing(
        &self,
        network_id: &str,
        _timeout: Duration,
    ) -> Result<EthernetBacking, ResolveError> {
        Ok(self.find_network(network_id)?.backing())
    }

    fn opaque_network(
        &self,
        opaque_network_id: &str,
        _timeout: Duration,
    ) -> Result<MoRef, ResolveError> {
        self.networks
            .iter()
            .find(|n| {
                matches!(n, NetworkEntry::Opaque { opaque_network_id: o, .. }
                    if o == opaque_network_id)
            })
            .map(NetworkEntry::moref)
            .ok_or_else(|| ResolveError::NotFound {
                kind: "opaque network",
                id: opaque_network_id.to_owned(),
            })
    }

    fn distributed_port_group(
        &self,
        switch_uuid: &str,
        portgroup_key: &str,
        _timeout: Duration,
    ) -> Result<MoRef, ResolveError> {
        self.networks
            .iter()
            .find(|n| {
                matches!(n, NetworkEntry::DistributedPortGroup {
                    switch_uuid: s, portgroup_key: k, ..
                } if s == switch_uuid && k == portgroup_key)
            })
            .map(NetworkEntry::moref)
            .ok_or_else(|| ResolveError::NotFound {
                kind: "distributed port group",
                id: format!("{switch_uuid}/{portgroup_key}"),
            })
    }

    fn datastore(
        &self,
        datastore_id: &str,
        _timeout: Duration,
    ) -> Result<MoRef, ResolveError> {
        if let Some(ds) = self.datastores.iter().find(|d| d.id == datastore_id)
        {
            return Ok(MoRef::datastore(ds.id.as_str()));
        }
        let matches: Vec<_> =
            self.datastores.iter().filter(|d| d.name == datastore_id).collect();
        match matches.as_slice() {
            [ds] => Ok(MoRef::datastore(ds.id.as_str())),
            [] => Err(ResolveError::NotFound {
                kind: "datastore",
                id: datastore_id.to_owned(),
            }),
            _ => Err(ResolveError::Ambiguous {
                kind: "datastore",
                id: datastore_id.to_owned(),
                count: matches.len(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// A resolver with one network of each backing kind and two datastores.
    pub(crate) fn resolver() -> StaticResolver {
        StaticResolver {
            networks: vec![
                NetworkEntry::Standard {
                    id: "network-12".to_owned(),
                    name: "VM Network".to_owned(),
                },
                NetworkEntry::Standard {
                    id: "network-13".to_owned(),
                    name: "Storage Network".to_owned(),
                },
                NetworkEntry::Opaque {
                    id: "network-o50".to_owned(),
                    name: "nsx-segment".to_owned(),
                    opaque_network_id: "ls-7f3e".to_owned(),
                    opaque_network_type: default_opaque_network_type(),
                },
                NetworkEntry::DistributedPortGroup {
                    id: "dvportgroup-40".to_owned(),
                    name: "dvpg-prod".to_owned(),
                    switch_uuid: "50 2a 6b".to_owned(),
                    portgroup_key: "dvportgroup-40".to_owned(),
                },
            ],
            datastores: vec![
                DatastoreEntry {
                    id: "datastore-11".to_owned(),
                    name: "datastore1".to_owned(),
                },
                DatastoreEntry {
                    id: "datastore-12".to_owned(),
                    name: "datastore2".to_owned(),
                },
            ],
        }
    }
}
