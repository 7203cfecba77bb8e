// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving a live network adapter onto a new bus, keeping its connection.

use slog::{info, warn};
use thiserror::Error;

use super::Remapper;
use crate::allocator::Slot;
use crate::netinfo::{NetInfoError, TapFdTable};
use crate::qmp::{qom_get_string, DeviceAdd, Monitor, MonitorError};

#[derive(Debug, Error)]
pub enum NetworkRemapError {
    #[error("cannot read {property} of {device}")]
    Property {
        device: String,
        property: &'static str,
        #[source]
        source: MonitorError,
    },

    #[error("cannot take over backend of {device}")]
    Descriptors {
        device: String,
        #[source]
        source: NetInfoError,
    },

    #[error("cannot create network backend {id}")]
    CreateBackend {
        id: String,
        #[source]
        source: MonitorError,
    },

    #[error("cannot create network adapter {id}")]
    CreateAdapter {
        id: String,
        #[source]
        source: MonitorError,
    },

    #[error("cannot bring link of {device} down")]
    LinkDown {
        device: String,
        #[source]
        source: MonitorError,
    },

    #[error("cannot unplug {device}")]
    Unplug {
        device: String,
        #[source]
        source: MonitorError,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkRemapRecord {
    pub original_device: String,
    pub new_device: String,
    pub mac_address: String,
    pub file_descriptors: Vec<String>,
}

impl<'a, M: Monitor + ?Sized> Remapper<'a, M> {
    /// Replaces adapter `device`, whose backend is `backend`, with a new
    /// adapter in `slot` running over the same tap descriptors.
    ///
    /// `fds` must have been scanned before any device of this pass was
    /// unplugged.
    pub fn remap_network(
        &mut self,
        backend: &str,
        device: &str,
        slot: &Slot,
        fds: &TapFdTable,
    ) -> Result<NetworkRemapRecord, NetworkRemapError> {
        let path = self.config.monitor.peripheral(device);
        let mac = qom_get_string(&mut *self.mon, &path, "mac").map_err(|source| {
            NetworkRemapError::Property {
                device: device.to_string(),
                property: "mac",
                source,
            }
        })?;
        let descriptors = fds.descriptors(backend).map_err(|source| {
            NetworkRemapError::Descriptors { device: device.to_string(), source }
        })?;

        warn!(self.log, "remapping network adapter";
            "backend" => backend, "mac" => &mac, "slot" => %slot,
            "adapter" => &self.config.network.adapter);

        let id = slot.name.as_str();
        self.mon.netdev_add(id, descriptors).map_err(|source| {
            NetworkRemapError::CreateBackend { id: id.to_string(), source }
        })?;

        let net = &self.config.network;
        let adapter = DeviceAdd::new(net.adapter.as_str(), id)
            .prop("netdev", id)
            .prop("mac", mac.as_str())
            .prop("bus", net.bus.as_str());
        self.mon.device_add(&adapter).map_err(|source| {
            NetworkRemapError::CreateAdapter { id: id.to_string(), source }
        })?;

        self.mon.set_link(device, false).map_err(|source| {
            NetworkRemapError::LinkDown { device: device.to_string(), source }
        })?;
        info!(self.log, "unplugging network adapter"; "device" => device);
        self.mon.device_del(device).map_err(|source| {
            NetworkRemapError::Unplug { device: device.to_string(), source }
        })?;

        Ok(NetworkRemapRecord {
            original_device: device.to_string(),
            new_device: id.to_string(),
            mac_address: mac,
            file_descriptors: descriptors.to_vec(),
        })
    }
}
