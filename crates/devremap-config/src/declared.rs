// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device declarations of the guest, as expanded by the instance manager.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::ConfigError;

/// Name prefix the instance manager gives optical-media volumes.
pub const OPTICAL_VOLUME_PREFIX: &str = "iso-volume";

const ROOT_PATH: &str = "/";

/// A single declared guest device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeclaredDevice {
    name: String,
    kind: String,
    options: BTreeMap<String, String>,
}

impl DeclaredDevice {
    /// Builds a declaration from its raw options, which must carry a `type`.
    pub fn new(
        name: impl Into<String>,
        mut options: BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let kind = options
            .remove("type")
            .ok_or_else(|| ConfigError::MissingDeviceType(name.clone()))?;
        Ok(Self { name, kind, options })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn get<S: AsRef<str>>(&self, key: S) -> Option<&str> {
        self.options.get(key.as_ref()).map(String::as_str)
    }

    pub fn is_optical(&self) -> bool {
        self.name.starts_with(OPTICAL_VOLUME_PREFIX)
    }

    /// Guest mount path of a disk; an absent path means the root.
    pub fn mount_path(&self) -> &str {
        self.get("path").unwrap_or(ROOT_PATH)
    }

    /// Whether this is a root-mounted, non-optical disk, i.e. one which
    /// will show up as a remappable block device once the instance runs.
    pub fn is_root_disk(&self) -> bool {
        self.kind == "disk" && !self.is_optical() && self.mount_path() == ROOT_PATH
    }
}

/// All devices declared for an instance, in declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpandedDevices {
    devices: Vec<DeclaredDevice>,
    names: BTreeSet<String>,
}

impl ExpandedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, device: DeclaredDevice) -> Result<(), ConfigError> {
        if !self.names.insert(device.name.clone()) {
            return Err(ConfigError::DuplicateDevice(device.name));
        }
        self.devices.push(device);
        Ok(())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DeclaredDevice> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn root_disks(&self) -> impl Iterator<Item = &DeclaredDevice> {
        self.devices.iter().filter(|d| d.is_root_disk())
    }
}

impl TryFrom<Vec<DeclaredDevice>> for ExpandedDevices {
    type Error = ConfigError;

    fn try_from(devices: Vec<DeclaredDevice>) -> Result<Self, Self::Error> {
        let mut expanded = Self::new();
        for device in devices {
            expanded.push(device)?;
        }
        Ok(expanded)
    }
}

// Declarations arrive as a JSON object keyed by device name. The order of
// that object is significant (placeholders are paired with live disks by
// it), so it is walked directly rather than collected into a sorted map.
impl<'de> Deserialize<'de> for ExpandedDevices {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        struct DevicesVisitor;

        impl<'de> Visitor<'de> for DevicesVisitor {
            type Value = ExpandedDevices;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of device names to device options")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> Result<Self::Value, A::Error> {
                let mut devices = ExpandedDevices::new();
                while let Some((name, options)) =
                    map.next_entry::<String, BTreeMap<String, String>>()?
                {
                    let device = DeclaredDevice::new(name, options)
                        .map_err(de::Error::custom)?;
                    devices.push(device).map_err(de::Error::custom)?;
                }
                Ok(devices)
            }
        }

        deserializer.deserialize_map(DevicesVisitor)
    }
}
