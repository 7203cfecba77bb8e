// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entries of the hypervisor's static device configuration.
//!
//! The configuration is an ordered list of sections, each named by a
//! composite key of the form `<kind> "<identifier>"` (for example
//! `device "qemu_usb"`) and carrying a string-keyed set of options.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::ConfigError;

/// The section type of a configuration entry.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    Device,
    Chardev,
    Audiodev,
    Drive,
    Other(String),
}

impl EntryKind {
    pub fn as_str(&self) -> &str {
        match self {
            EntryKind::Device => "device",
            EntryKind::Chardev => "chardev",
            EntryKind::Audiodev => "audiodev",
            EntryKind::Drive => "drive",
            EntryKind::Other(kind) => kind,
        }
    }
}

impl Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" => return Err(ConfigError::EmptyKey),
            "device" => EntryKind::Device,
            "chardev" => EntryKind::Chardev,
            "audiodev" => EntryKind::Audiodev,
            "drive" => EntryKind::Drive,
            other => {
                if other.contains(|c: char| c.is_whitespace() || c == '"') {
                    return Err(ConfigError::MalformedKey(other.to_owned()));
                }
                EntryKind::Other(other.to_owned())
            }
        })
    }
}

impl Serialize for EntryKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntryKind {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}

/// The unique name of a configuration entry.
///
/// Formats as `<kind> "<identifier>"`, or as the bare kind for sections
/// which carry no identifier (e.g. `machine`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigKey {
    kind: EntryKind,
    ident: Option<String>,
}

impl ConfigKey {
    pub fn new(kind: EntryKind, ident: impl Into<String>) -> Self {
        Self { kind, ident: Some(ident.into()) }
    }

    pub fn bare(kind: EntryKind) -> Self {
        Self { kind, ident: None }
    }

    pub fn device(ident: impl Into<String>) -> Self {
        Self::new(EntryKind::Device, ident)
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    pub fn ident(&self) -> Option<&str> {
        self.ident.as_deref()
    }
}

impl Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ident {
            Some(ident) => write!(f, "{} \"{}\"", self.kind, ident),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((kind, rest)) = s.split_once(' ') else {
            return Ok(Self::bare(s.parse()?));
        };

        let ident = rest
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .filter(|ident| !ident.is_empty() && !ident.contains('"'))
            .ok_or_else(|| ConfigError::MalformedKey(s.to_owned()))?;

        Ok(Self::new(kind.parse()?, ident))
    }
}

impl Serialize for ConfigKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConfigKey {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}

/// One section of the static configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfigEntry {
    pub name: ConfigKey,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default)]
    pub entries: BTreeMap<String, String>,
}

impl DeviceConfigEntry {
    pub fn new(name: ConfigKey, entries: BTreeMap<String, String>) -> Self {
        Self { name, comment: None, entries }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn get<S: AsRef<str>>(&self, key: S) -> Option<&str> {
        self.entries.get(key.as_ref()).map(String::as_str)
    }

    pub fn driver(&self) -> Option<&str> {
        self.get("driver")
    }
}

/// An ordered list of configuration entries.
///
/// Entries with an identifier are unique by name. Bare sections such as
/// `global` may repeat, and each occurrence is kept.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "Vec<DeviceConfigEntry>",
    into = "Vec<DeviceConfigEntry>"
)]
pub struct DeviceConfigList {
    entries: Vec<DeviceConfigEntry>,
    /// Names of the identified entries.
    names: BTreeSet<ConfigKey>,
}

impl DeviceConfigList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `entry`, refusing an identified name which is already
    /// present.
    pub fn push(&mut self, entry: DeviceConfigEntry) -> Result<(), ConfigError> {
        if entry.name.ident().is_some() && !self.names.insert(entry.name.clone())
        {
            return Err(ConfigError::DuplicateKey(entry.name));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn contains(&self, name: &ConfigKey) -> bool {
        match name.ident() {
            Some(_) => self.names.contains(name),
            None => self.entries.iter().any(|e| &e.name == name),
        }
    }

    pub fn get(&self, name: &ConfigKey) -> Option<&DeviceConfigEntry> {
        self.entries.iter().find(|e| &e.name == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DeviceConfigEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TryFrom<Vec<DeviceConfigEntry>> for DeviceConfigList {
    type Error = ConfigError;

    fn try_from(entries: Vec<DeviceConfigEntry>) -> Result<Self, Self::Error> {
        let mut list = Self::new();
        for entry in entries {
            list.push(entry)?;
        }
        Ok(list)
    }
}

impl From<DeviceConfigList> for Vec<DeviceConfigEntry> {
    fn from(list: DeviceConfigList) -> Self {
        list.entries
    }
}

impl IntoIterator for DeviceConfigList {
    type Item = DeviceConfigEntry;
    type IntoIter = std::vec::IntoIter<DeviceConfigEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a DeviceConfigList {
    type Item = &'a DeviceConfigEntry;
    type IntoIter = std::slice::Iter<'a, DeviceConfigEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
