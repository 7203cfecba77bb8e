// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rewriting of the static device configuration before launch.

use std::collections::BTreeSet;

use devremap_config::{
    ConfigError, ConfigKey, DeviceConfigEntry, DeviceConfigList,
    ExpandedDevices, HookConfig,
};
use slog::{debug, info, Logger};
use thiserror::Error;

use crate::allocator::OrdinalAllocator;
use crate::launch::LaunchConfig;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("cannot build patched configuration")]
    Config(#[from] ConfigError),
}

/// What a patch pass changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchSummary {
    /// Input entries left out, either denied or superseded by an added one.
    pub dropped: Vec<ConfigKey>,
    /// Passthrough devices moved onto the root bus.
    pub rebound: Vec<ConfigKey>,
    pub added: Vec<ConfigKey>,
    pub placeholders: Vec<ConfigKey>,
}

pub struct ConfigPatcher<'a> {
    config: &'a HookConfig,
    log: Logger,
}

impl<'a> ConfigPatcher<'a> {
    pub fn new(config: &'a HookConfig, log: Logger) -> Self {
        Self { config, log }
    }

    /// Patches the launch parameters of an instance declaring `devices`.
    ///
    /// The configuration is replaced with a single call once the whole new
    /// list has been built; on error the launch parameters are left
    /// untouched.
    pub fn patch(
        &self,
        launch: &mut dyn LaunchConfig,
        devices: &ExpandedDevices,
    ) -> Result<PatchSummary, PatchError> {
        info!(self.log, "reconfiguring hypervisor");

        let (conf, summary) =
            self.patch_entries(launch.configuration(), devices)?;
        self.ensure_placeholder_source(launch);
        launch.set_configuration(conf);

        info!(self.log, "configuration patched";
            "dropped" => summary.dropped.len(),
            "rebound" => summary.rebound.len(),
            "added" => summary.added.len(),
            "placeholders" => summary.placeholders.len());
        Ok(summary)
    }

    /// Adds the zero-backed source placeholders are bound to, unless the
    /// command line already creates it.
    fn ensure_placeholder_source(&self, launch: &mut dyn LaunchConfig) {
        let source = self.config.placeholder.source_args();
        let mut cmdline = launch.command_line();
        if cmdline.windows(2).any(|w| w == source) {
            debug!(self.log, "placeholder source already present");
            return;
        }
        cmdline.extend(source);
        launch.set_command_line(cmdline);
    }

    /// Computes the patched configuration list.
    pub fn patch_entries(
        &self,
        current: DeviceConfigList,
        devices: &ExpandedDevices,
    ) -> Result<(DeviceConfigList, PatchSummary), PatchError> {
        let added = self.config.add.entries();
        let placeholders = self.placeholder_entries(devices);
        let generated: BTreeSet<&ConfigKey> =
            added.iter().chain(placeholders.iter()).map(|e| &e.name).collect();

        let mut summary = PatchSummary::default();
        let mut conf = DeviceConfigList::new();

        for mut entry in current {
            if self.config.deny.denies(&entry.name) {
                debug!(self.log, "dropping device"; "name" => %entry.name);
                summary.dropped.push(entry.name);
                continue;
            }
            if generated.contains(&entry.name) {
                debug!(self.log, "replacing device"; "name" => %entry.name);
                summary.dropped.push(entry.name);
                continue;
            }
            if self.rebind_passthrough(&mut entry) {
                summary.rebound.push(entry.name.clone());
            }
            conf.push(entry)?;
        }

        for entry in added {
            summary.added.push(entry.name.clone());
            conf.push(entry)?;
        }
        for entry in placeholders {
            summary.placeholders.push(entry.name.clone());
            conf.push(entry)?;
        }

        Ok((conf, summary))
    }

    /// Fixed addresses of passthrough devices do not exist on the target
    /// topology, so they are let go and the device is put on the root bus.
    fn rebind_passthrough(&self, entry: &mut DeviceConfigEntry) -> bool {
        let passthrough = &self.config.passthrough;
        if entry.driver() != Some(passthrough.driver.as_str()) {
            return false;
        }
        debug!(self.log, "rebinding passthrough device";
            "name" => %entry.name, "bus" => &passthrough.bus);
        entry.entries.remove("addr");
        entry.entries.insert("bus".to_string(), passthrough.bus.clone());
        true
    }

    /// One placeholder disk per root disk, numbered in declaration order.
    pub fn placeholder_entries(
        &self,
        devices: &ExpandedDevices,
    ) -> Vec<DeviceConfigEntry> {
        let mut slots = OrdinalAllocator::new(&self.config.placeholder.prefix);
        devices
            .root_disks()
            .map(|dev| {
                let slot = slots.next_slot();
                debug!(self.log, "adding placeholder disk";
                    "disk" => dev.name(), "slot" => %slot);
                self.config.placeholder.entry(&slot.name)
            })
            .collect()
    }
}
