// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to the hypervisor's machine-management protocol (QMP).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod client;

pub use client::QmpClient;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed monitor message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("monitor connection closed")]
    Closed,

    #[error("unexpected monitor greeting: {0}")]
    Greeting(String),

    #[error("{command} failed ({class}): {desc}")]
    Command { command: String, class: String, desc: String },

    #[error("unexpected response to {command}: {response}")]
    UnexpectedResponse { command: String, response: String },
}

/// A block device of the running instance, as reported by `query-block`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    #[serde(default)]
    pub device: String,

    #[serde(default)]
    pub qdev: Option<String>,

    #[serde(default)]
    pub removable: bool,

    /// Only present for devices with a tray, i.e. optical drives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tray_open: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted: Option<BlockInserted>,
}

/// The medium inserted in a block device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInserted {
    #[serde(rename = "node-name")]
    pub node_name: String,
    pub file: String,
    pub drv: String,
    pub ro: bool,
}

/// A child of an object in the object tree, as reported by `qom-list`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPropertyInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ObjectPropertyInfo {
    /// The type of a child object, from a property type of `child<TYPE>`.
    pub fn child_type(&self) -> Option<&str> {
        self.kind.strip_prefix("child<")?.strip_suffix('>')
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockdevLocking {
    Off,
    On,
    Auto,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockdevDiscard {
    Ignore,
    Unmap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockdevAio {
    Threads,
    Native,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockdevCache {
    pub direct: bool,
    pub no_flush: bool,
}

/// Arguments to `blockdev-add`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockdevOptions {
    pub driver: String,
    pub filename: String,
    pub node_name: String,
    pub read_only: bool,
    pub locking: BlockdevLocking,
    pub cache: BlockdevCache,
    pub discard: BlockdevDiscard,
    pub aio: BlockdevAio,
}

impl BlockdevOptions {
    /// A second node on the file already open behind `inserted`.
    ///
    /// Locking has to be off: the existing node still holds the file.
    pub fn reopen(node_name: impl Into<String>, inserted: &BlockInserted) -> Self {
        Self {
            driver: inserted.drv.clone(),
            filename: inserted.file.clone(),
            node_name: node_name.into(),
            read_only: inserted.ro,
            locking: BlockdevLocking::Off,
            cache: BlockdevCache { direct: true, no_flush: false },
            discard: BlockdevDiscard::Unmap,
            aio: BlockdevAio::Native,
        }
    }
}

/// Arguments to `device_add`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceAdd {
    pub driver: String,
    pub id: String,
    #[serde(flatten)]
    pub props: BTreeMap<String, Value>,
}

impl DeviceAdd {
    pub fn new(driver: impl Into<String>, id: impl Into<String>) -> Self {
        Self { driver: driver.into(), id: id.into(), props: BTreeMap::new() }
    }

    pub fn prop(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.props.insert(name.to_string(), value.into());
        self
    }
}

/// Commands issued against the running instance.
///
/// Every call blocks until the instance has answered it.
#[cfg_attr(test, mockall::automock)]
pub trait Monitor {
    /// Lists the block devices of the instance.
    fn query_block(&mut self) -> Result<Vec<BlockInfo>, MonitorError>;

    /// Lists the children of the object at `path`.
    fn qom_list(
        &mut self,
        path: &str,
    ) -> Result<Vec<ObjectPropertyInfo>, MonitorError>;

    fn qom_get(
        &mut self,
        path: &str,
        property: &str,
    ) -> Result<Value, MonitorError>;

    fn qom_set(
        &mut self,
        path: &str,
        property: &str,
        value: Value,
    ) -> Result<(), MonitorError>;

    fn blockdev_add(
        &mut self,
        opts: &BlockdevOptions,
    ) -> Result<(), MonitorError>;

    /// Creates a tap backend `id` on already-open descriptors.
    fn netdev_add(&mut self, id: &str, fds: &[String])
        -> Result<(), MonitorError>;

    fn device_add(&mut self, dev: &DeviceAdd) -> Result<(), MonitorError>;

    fn device_del(&mut self, id: &str) -> Result<(), MonitorError>;

    fn set_link(&mut self, name: &str, up: bool) -> Result<(), MonitorError>;

    /// Runs a human monitor command, returning its text output.
    fn human_monitor_command(
        &mut self,
        command_line: &str,
    ) -> Result<String, MonitorError>;
}

/// Reads a string-valued object property.
pub fn qom_get_string<M: Monitor + ?Sized>(
    mon: &mut M,
    path: &str,
    property: &str,
) -> Result<String, MonitorError> {
    match mon.qom_get(path, property)? {
        Value::String(s) => Ok(s),
        other => Err(MonitorError::UnexpectedResponse {
            command: format!("qom-get {path} {property}"),
            response: other.to_string(),
        }),
    }
}
