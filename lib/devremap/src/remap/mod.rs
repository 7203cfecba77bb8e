// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live remapping of the devices of a running instance.
//!
//! Disks are rebound onto the placeholder slots declared at launch, and
//! network adapters are recreated on another bus over the same tap
//! descriptors. The monitor offers no transactions, so each device is
//! moved by a sequence of commands ordered such that a failure part way
//! leaves the original device working.

use std::fmt;

use devremap_config::HookConfig;
use slog::{error, info, Logger};
use thiserror::Error;

use crate::allocator::OrdinalAllocator;
use crate::netinfo;
use crate::qmp::{qom_get_string, Monitor, MonitorError};

mod network;
mod storage;

pub use network::{NetworkRemapError, NetworkRemapRecord};
pub use storage::{
    backing_node_name, is_eligible, StorageRemapError, StorageSwap,
};

/// Devices moved by one remap pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemapSummary {
    pub storage: Vec<StorageSwap>,
    pub network: Vec<NetworkRemapRecord>,
}

/// A device that could not be moved; it is still attached as before.
#[derive(Debug)]
pub enum RemapFailure {
    Storage { device: String, error: StorageRemapError },
    Network { device: String, error: NetworkRemapError },
}

impl fmt::Display for RemapFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemapFailure::Storage { device, error } => {
                write!(f, "disk {device}: {error}")
            }
            RemapFailure::Network { device, error } => {
                write!(f, "network adapter {device}: {error}")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RemapError {
    #[error("cannot scan network backends")]
    NetworkScan(#[source] MonitorError),

    #[error("cannot list block devices")]
    QueryBlock(#[source] MonitorError),

    #[error("cannot list peripheral devices")]
    ListPeripherals(#[source] MonitorError),

    #[error("{} device(s) could not be remapped", .failures.len())]
    Incomplete { summary: RemapSummary, failures: Vec<RemapFailure> },
}

pub struct Remapper<'a, M: Monitor + ?Sized> {
    mon: &'a mut M,
    config: &'a HookConfig,
    log: Logger,
}

impl<'a, M: Monitor + ?Sized> Remapper<'a, M> {
    pub fn new(mon: &'a mut M, config: &'a HookConfig, log: Logger) -> Self {
        Self { mon, config, log }
    }

    /// Runs one remap pass over every eligible disk, then every network
    /// adapter of the configured frontend type.
    ///
    /// Slots are numbered from zero in the order devices are listed by the
    /// monitor, which matches the order the placeholders were declared in.
    /// A device that fails still consumes its slot, and the pass carries on
    /// with the remaining devices.
    pub fn remap_devices(&mut self) -> Result<RemapSummary, RemapError> {
        let config = self.config;
        info!(self.log, "remapping devices");

        // Unplugging a device may close its descriptors, so take the
        // inventory before touching anything.
        let fds =
            netinfo::scan(&mut *self.mon).map_err(RemapError::NetworkScan)?;

        let mut summary = RemapSummary::default();
        let mut failures = Vec::new();

        let blocks = self.mon.query_block().map_err(RemapError::QueryBlock)?;
        let mut disks = OrdinalAllocator::new(&config.placeholder.prefix);
        for dev in blocks.iter().filter(|d| is_eligible(d, &config.storage)) {
            let slot = disks.next_slot();
            match self.remap_storage(dev, &slot) {
                Ok(swap) => summary.storage.push(swap),
                Err(error) => {
                    let device = dev
                        .inserted
                        .as_ref()
                        .map(|ins| ins.node_name.clone())
                        .unwrap_or_else(|| dev.device.clone());
                    error!(self.log, "failed to remap disk";
                        "device" => &device, "slot" => %slot,
                        "error" => %error);
                    failures.push(RemapFailure::Storage { device, error });
                }
            }
        }

        let children = self
            .mon
            .qom_list(&config.monitor.peripheral_path)
            .map_err(RemapError::ListPeripherals)?;
        let mut nics = OrdinalAllocator::new(&config.network.prefix);
        for child in children
            .iter()
            .filter(|c| c.child_type() == Some(config.network.frontend.as_str()))
        {
            let slot = nics.next_slot();
            let device = child.name.as_str();
            let path = config.monitor.peripheral(device);
            let result = qom_get_string(&mut *self.mon, &path, "netdev")
                .map_err(|source| NetworkRemapError::Property {
                    device: device.to_string(),
                    property: "netdev",
                    source,
                })
                .and_then(|backend| {
                    self.remap_network(&backend, device, &slot, &fds)
                });
            match result {
                Ok(record) => summary.network.push(record),
                Err(error) => {
                    error!(self.log, "failed to remap network adapter";
                        "device" => device, "slot" => %slot,
                        "error" => %error);
                    failures.push(RemapFailure::Network {
                        device: device.to_string(),
                        error,
                    });
                }
            }
        }

        info!(self.log, "remap pass finished";
            "disks" => summary.storage.len(),
            "adapters" => summary.network.len(),
            "failed" => failures.len());

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(RemapError::Incomplete { summary, failures })
        }
    }
}
