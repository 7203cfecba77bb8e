// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub mod declared;
pub mod entry;
pub mod tables;

pub use declared::{DeclaredDevice, ExpandedDevices};
pub use entry::{ConfigKey, DeviceConfigEntry, DeviceConfigList, EntryKind};
pub use tables::{AddTable, DenyTable};

/// Configuration for the device remapping hook.
///
/// Every section is optional; anything left out takes the built-in value
/// suited to booting a macOS guest on QEMU.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub placeholder: PlaceholderConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub passthrough: PassthroughConfig,
    pub monitor: MonitorConfig,
    pub deny: DenyTable,
    pub add: AddTable,
}

/// Placeholder disks, bound to a zero-backed source at launch and later
/// rebound to the guest's real disks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceholderConfig {
    /// Node name of the zero-backed block source.
    pub source: String,
    /// Host device backing the source.
    pub source_path: String,
    pub driver: String,
    /// Slot names are this prefix followed by an ordinal.
    pub prefix: String,
    pub share_rw: bool,
    pub comment: String,
}

impl Default for PlaceholderConfig {
    fn default() -> Self {
        Self {
            source: "devzero".to_string(),
            source_path: "/dev/zero".to_string(),
            driver: "virtio-blk-pci".to_string(),
            prefix: "sata".to_string(),
            share_rw: true,
            comment: "Automatically generated SATA disk".to_string(),
        }
    }
}

impl PlaceholderConfig {
    /// Launch arguments creating the zero-backed source.
    pub fn source_args(&self) -> [String; 2] {
        [
            "-blockdev".to_string(),
            format!(
                "node-name={},driver=raw,file.driver=host_device,file.filename={}",
                self.source, self.source_path
            ),
        ]
    }

    /// The configuration entry for the placeholder disk in `slot`.
    pub fn entry(&self, slot: &str) -> DeviceConfigEntry {
        let mut entries = BTreeMap::new();
        entries.insert("driver".to_string(), self.driver.clone());
        entries.insert("drive".to_string(), self.source.clone());
        if self.share_rw {
            entries.insert("share-rw".to_string(), "on".to_string());
        }
        DeviceConfigEntry::new(ConfigKey::device(slot), entries)
            .with_comment(self.comment.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Node-name prefix identifying disks managed by the instance manager.
    pub node_tag: String,
    /// Suffix of a block device's qdev path naming its backend layer
    /// rather than the removable frontend.
    pub backend_suffix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            node_tag: "incus_".to_string(),
            backend_suffix: "/virtio-backend".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Frontend driver of the adapters to replace.
    pub frontend: String,
    /// Driver of the replacement adapters.
    pub adapter: String,
    pub bus: String,
    pub prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            frontend: "virtio-net-pci".to_string(),
            adapter: "usb-net".to_string(),
            bus: "qemu_usb.0".to_string(),
            prefix: "net".to_string(),
        }
    }
}

/// Filesystem passthrough devices moved onto the root PCIe bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthroughConfig {
    pub driver: String,
    pub bus: String,
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self { driver: "virtio-9p-pci".to_string(), bus: "pcie.0".to_string() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds to wait on the monitor socket; 0 waits forever.
    pub timeout_secs: u64,
    pub peripheral_path: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            peripheral_path: "/machine/peripheral".to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Object path of the peripheral device `id`.
    pub fn peripheral(&self, id: &str) -> String {
        format!("{}/{}", self.peripheral_path, id)
    }
}

/// Errors in the static configuration data model.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("configuration key is empty")]
    EmptyKey,

    #[error("malformed configuration key {0:?}")]
    MalformedKey(String),

    #[error("duplicate configuration entry {0}")]
    DuplicateKey(ConfigKey),

    #[error("declared device {0:?} has no type")]
    MissingDeviceType(String),

    #[error("device {0:?} declared more than once")]
    DuplicateDevice(String),
}

/// Errors which may be returned when parsing the hook configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a hook configuration.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<HookConfig, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<HookConfig>(&contents)?;
    Ok(cfg)
}
