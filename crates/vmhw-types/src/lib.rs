// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the vmhw crates.
//!
//! This crate defines the identifiers that the core library, the TOML
//! configuration crate, and the CLI all need to agree on (device keys,
//! managed object references, power states) so that each of them can
//! implement its own conversions without any layering oddities.

use std::fmt::Display;
use std::num::ParseIntError;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The key the hypervisor uses to identify a device within one virtual
/// machine's hardware list.
///
/// Keys are sign-significant: a negative key is a placeholder for a device
/// that has been planned but not yet created, a positive key was assigned by
/// the remote system. Zero is never a valid device key; it is used as the
/// controller key of top-level devices (i.e. controllers themselves).
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct DeviceKey(pub i32);

impl DeviceKey {
    /// The controller key carried by devices that have no parent.
    pub const NONE: DeviceKey = DeviceKey(0);

    #[inline]
    pub fn get(self) -> i32 {
        self.0
    }

    /// Returns true if this key is a placeholder for a device that does not
    /// exist remotely yet.
    #[inline]
    pub fn is_pending(self) -> bool {
        self.0 < 0
    }

    /// Returns true if this key was assigned by the remote system.
    #[inline]
    pub fn is_assigned(self) -> bool {
        self.0 > 0
    }
}

impl From<i32> for DeviceKey {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceKey {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(i32::from_str(s)?))
    }
}

/// Errors produced when parsing a [`MoRef`] from its string form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoRefParseError {
    #[error("managed object reference {0:?} is not of the form Type:value")]
    MissingSeparator(String),

    #[error("managed object reference {0:?} has an empty type")]
    EmptyType(String),

    #[error("managed object reference {0:?} has an empty value")]
    EmptyValue(String),
}

/// A reference to a managed object on the remote management endpoint, e.g.
/// `Network:network-12` or `Datastore:datastore-11`.
///
/// The `value` part is the opaque identifier users put in configuration;
/// the type disambiguates it on the wire.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MoRef {
    kind: String,
    value: String,
}

impl MoRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self { kind: kind.into(), value: value.into() }
    }

    pub fn network(value: impl Into<String>) -> Self {
        Self::new("Network", value)
    }

    pub fn datastore(value: impl Into<String>) -> Self {
        Self::new("Datastore", value)
    }

    pub fn snapshot(value: impl Into<String>) -> Self {
        Self::new("VirtualMachineSnapshot", value)
    }

    #[inline]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl FromStr for MoRef {
    type Err = MoRefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| MoRefParseError::MissingSeparator(s.to_owned()))?;

        if kind.is_empty() {
            return Err(MoRefParseError::EmptyType(s.to_owned()));
        }
        if value.is_empty() {
            return Err(MoRefParseError::EmptyValue(s.to_owned()));
        }

        Ok(Self::new(kind, value))
    }
}

impl Display for MoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

impl Serialize for MoRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

impl<'d> Deserialize<'d> for MoRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

impl JsonSchema for MoRef {
    fn schema_name() -> String {
        "MoRef".to_owned()
    }

    fn json_schema(
        gen: &mut schemars::gen::SchemaGenerator,
    ) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

/// The power state of a virtual machine as reported by the remote system.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// The flavor of management endpoint being talked to. Some defaults (such
/// as how the server labels auto-generated MAC addresses) differ between a
/// management server and a standalone host.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum ApiType {
    #[default]
    VirtualCenter,
    HostAgent,
}

#[cfg(test)]
mod test {
    use super::{DeviceKey, MoRef, MoRefParseError, PowerState};
    use serde::Deserialize;
    use serde_test::{assert_tokens, Token};
    use std::str::FromStr;

    const MOREF_CASES: &[(&str, Result<(&str, &str), ()>)] = &[
        ("Network:network-12", Ok(("Network", "network-12"))),
        ("Datastore:datastore-11", Ok(("Datastore", "datastore-11"))),
        (
            "DistributedVirtualPortgroup:dvportgroup-40",
            Ok(("DistributedVirtualPortgroup", "dvportgroup-40")),
        ),
        ("Network:with:colons", Ok(("Network", "with:colons"))),
        ("network-12", Err(())),
        (":network-12", Err(())),
        ("Network:", Err(())),
        ("", Err(())),
    ];

    #[test]
    fn moref_from_str() {
        for (input, expected) in MOREF_CASES {
            match MoRef::from_str(input) {
                Ok(moref) => {
                    let (kind, value) = expected.unwrap();
                    assert_eq!(moref.kind(), kind);
                    assert_eq!(moref.value(), value);
                }
                Err(_) => assert!(
                    expected.is_err(),
                    "Expected error parsing managed object reference {}",
                    input
                ),
            }
        }
    }

    #[test]
    fn moref_serialization() {
        for (input, expected) in MOREF_CASES {
            match expected {
                Ok((kind, value)) => {
                    assert_tokens(&MoRef::new(*kind, *value), &[Token::Str(input)]);
                }
                Err(_) => {
                    let de = serde::de::value::StrDeserializer::<serde::de::value::Error>::new(input);
                    assert!(MoRef::deserialize(de).is_err());
                }
            }
        }
    }

    #[test]
    fn moref_parse_errors_name_the_input() {
        assert_eq!(
            MoRef::from_str("Network:"),
            Err(MoRefParseError::EmptyValue("Network:".to_owned()))
        );
    }

    #[test]
    fn device_key_sign() {
        assert!(DeviceKey(-201).is_pending());
        assert!(!DeviceKey(-201).is_assigned());
        assert!(DeviceKey(4000).is_assigned());
        assert!(!DeviceKey::NONE.is_pending());
        assert!(!DeviceKey::NONE.is_assigned());
        assert_tokens(&DeviceKey(-201), &[Token::I32(-201)]);
    }

    #[test]
    fn power_state_wire_names() {
        let state: PowerState =
            serde_json::from_str("\"poweredOff\"").unwrap();
        assert_eq!(state, PowerState::PoweredOff);
        assert_eq!(PowerState::PoweredOn.to_string(), "poweredOn");
    }
}
