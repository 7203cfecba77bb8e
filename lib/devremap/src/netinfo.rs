// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovery of the file descriptors behind tap network backends.
//!
//! QMP has no structured query listing the descriptors a netdev was
//! created with, so they are scraped from the text of the `info network`
//! human monitor command.  Backends appear there on lines of the form:
//!
//! ```text
//! incus_eth0: index=0,type=nic,model=virtio-net-pci,macaddr=00:16:3e:01:02:03
//!  \ incus_eth0: index=0,type=tap,fd=34
//! ```
//!
//! Everything depending on that layout lives in [`TapFdTable::parse`].

use std::collections::BTreeMap;

use thiserror::Error;

use crate::qmp::{Monitor, MonitorError};

/// Prefix of the lines describing a backend.
pub const BACKEND_MARKER: &str = " \\ ";

const FD_ATTR: &str = "fd=";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetInfoError {
    #[error("network backend {0:?} is not listed by the monitor")]
    UnknownBackend(String),

    #[error("no file descriptors listed for network backend {0:?}")]
    NoDescriptors(String),
}

/// Descriptors of each network backend, in the order they were listed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TapFdTable(BTreeMap<String, Vec<String>>);

impl TapFdTable {
    pub fn parse(output: &str) -> Self {
        let mut table = BTreeMap::<String, Vec<String>>::new();
        for line in output.lines() {
            let Some(rest) = line.strip_prefix(BACKEND_MARKER) else {
                continue;
            };
            let Some((name, attrs)) = rest.split_once(':') else {
                continue;
            };
            let fds = table.entry(name.trim().to_string()).or_default();
            fds.extend(
                attrs
                    .split(',')
                    .filter_map(|attr| attr.trim().strip_prefix(FD_ATTR))
                    .filter(|fd| !fd.is_empty())
                    .map(str::to_string),
            );
        }
        Self(table)
    }

    /// Descriptors of `backend`; a backend with none cannot be taken over.
    pub fn descriptors(&self, backend: &str) -> Result<&[String], NetInfoError> {
        match self.0.get(backend) {
            None => Err(NetInfoError::UnknownBackend(backend.to_string())),
            Some(fds) if fds.is_empty() => {
                Err(NetInfoError::NoDescriptors(backend.to_string()))
            }
            Some(fds) => Ok(fds),
        }
    }

    pub fn backends(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Asks the monitor for its network listing and parses it.
pub fn scan<M: Monitor + ?Sized>(mon: &mut M) -> Result<TapFdTable, MonitorError> {
    let output = mon.human_monitor_command("info network")?;
    Ok(TapFdTable::parse(&output))
}
