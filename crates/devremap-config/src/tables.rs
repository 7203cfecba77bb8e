// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tables of configuration entries to remove and to insert.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entry::{ConfigKey, DeviceConfigEntry, EntryKind};

type EntryOptions = BTreeMap<String, String>;

/// Entries which make no sense for the guest and are dropped, by kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DenyTable(BTreeMap<EntryKind, BTreeSet<String>>);

impl DenyTable {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with<I, S>(mut self, kind: EntryKind, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .entry(kind)
            .or_default()
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn denies(&self, key: &ConfigKey) -> bool {
        match (self.0.get(key.kind()), key.ident()) {
            (Some(names), Some(ident)) => names.contains(ident),
            _ => false,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = ConfigKey> + '_ {
        self.0.iter().flat_map(|(kind, names)| {
            names.iter().map(|name| ConfigKey::new(kind.clone(), name.clone()))
        })
    }
}

impl Default for DenyTable {
    fn default() -> Self {
        Self::new()
            .with(
                EntryKind::Chardev,
                [
                    "qemu_spice-usb-chardev1",
                    "qemu_spice-usb-chardev2",
                    "qemu_spice-usb-chardev3",
                ],
            )
            .with(
                EntryKind::Device,
                [
                    "qemu_gpu",
                    "qemu_keyboard",
                    "qemu_pcie8",
                    "qemu_pcie9",
                    "qemu_pcie10",
                    "qemu_pcie11",
                    "qemu_pcie12",
                    "qemu_spice-usb1",
                    "qemu_spice-usb2",
                    "qemu_spice-usb3",
                    "qemu_tablet",
                    "qemu_usb",
                ],
            )
    }
}

/// Entries the guest requires, by kind and then name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddTable(BTreeMap<EntryKind, BTreeMap<String, EntryOptions>>);

impl AddTable {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(
        mut self,
        kind: EntryKind,
        name: impl Into<String>,
        options: &[(&str, &str)],
    ) -> Self {
        let options = options
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.0.entry(kind).or_default().insert(name.into(), options);
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = ConfigKey> + '_ {
        self.0.iter().flat_map(|(kind, named)| {
            named.keys().map(|name| ConfigKey::new(kind.clone(), name.clone()))
        })
    }

    /// Materializes the table as configuration entries.
    pub fn entries(&self) -> Vec<DeviceConfigEntry> {
        self.0
            .iter()
            .flat_map(|(kind, named)| {
                named.iter().map(|(name, options)| {
                    DeviceConfigEntry::new(
                        ConfigKey::new(kind.clone(), name.clone()),
                        options.clone(),
                    )
                })
            })
            .collect()
    }
}

impl Default for AddTable {
    fn default() -> Self {
        Self::new()
            .with(EntryKind::Audiodev, "snd0", &[("driver", "spice")])
            .with(
                EntryKind::Device,
                "apple_smc",
                &[
                    ("driver", "isa-applesmc"),
                    (
                        "osk",
                        "ourhardworkbythesewordsguardedpleasedontsteal(c)AppleComputerInc",
                    ),
                ],
            )
            .with(
                EntryKind::Device,
                "qemu_audio",
                &[("driver", "virtio-sound-pci"), ("audiodev", "snd0")],
            )
            .with(EntryKind::Device, "qemu_sata", &[("driver", "ich9-ahci")])
            .with(EntryKind::Device, "qemu_vga", &[("driver", "virtio-vga")])
            .with(
                EntryKind::Device,
                "qemu_usb",
                &[("driver", "qemu-xhci"), ("p2", "8"), ("p3", "8")],
            )
            .with(
                EntryKind::Device,
                "usb_keyboard",
                &[("driver", "usb-kbd"), ("bus", "qemu_usb.0")],
            )
            .with(
                EntryKind::Device,
                "usb_tablet",
                &[("driver", "usb-tablet"), ("bus", "qemu_usb.0")],
            )
    }
}
