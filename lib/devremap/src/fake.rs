// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory machine answering monitor commands, for exercising whole
//! remap passes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use serde_json::Value;

use crate::qmp::{
    BlockInfo, BlockInserted, BlockdevLocking, BlockdevOptions, DeviceAdd,
    Monitor, MonitorError, ObjectPropertyInfo,
};

const PERIPHERAL: &str = "/machine/peripheral";
const ZERO_NODE: &str = "devzero";

struct Node {
    file: String,
    drv: String,
    ro: bool,
}

struct Device {
    id: String,
    driver: String,
    drive: Option<String>,
    netdev: Option<String>,
    mac: Option<String>,
    tray: bool,
    link_up: bool,
}

impl Device {
    fn new(id: &str, driver: &str) -> Self {
        Self {
            id: id.to_string(),
            driver: driver.to_string(),
            drive: None,
            netdev: None,
            mac: None,
            tray: false,
            link_up: true,
        }
    }
}

#[derive(Default)]
pub struct FakeMachine {
    nodes: BTreeMap<String, Node>,
    devices: Vec<Device>,
    netdevs: BTreeMap<String, Vec<String>>,
    failing: BTreeSet<(String, String)>,
}

fn rejected(command: &str, desc: String) -> MonitorError {
    MonitorError::Command {
        command: command.to_string(),
        class: "GenericError".to_string(),
        desc,
    }
}

impl FakeMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_node(&mut self, name: &str, file: &str) {
        self.nodes.insert(
            name.to_string(),
            Node { file: file.to_string(), drv: "raw".to_string(), ro: false },
        );
    }

    /// Adds `count` disks bound to the zero-backed source.
    pub fn add_placeholders(&mut self, prefix: &str, count: usize) {
        self.add_node(ZERO_NODE, "/dev/zero");
        for i in 0..count {
            let mut dev = Device::new(&format!("{prefix}{i}"), "virtio-blk-pci");
            dev.drive = Some(ZERO_NODE.to_string());
            self.devices.push(dev);
        }
    }

    /// Adds a disk on `/dev/fdset/<fd>`, its device and node both named
    /// `name`.
    pub fn add_disk(&mut self, name: &str, fd: u32) {
        self.add_node(name, &format!("/dev/fdset/{fd}"));
        let mut dev = Device::new(name, "virtio-blk-pci");
        dev.drive = Some(name.to_string());
        self.devices.push(dev);
    }

    pub fn add_cdrom(&mut self, name: &str, fd: u32) {
        self.add_node(name, &format!("/dev/fdset/{fd}"));
        let mut dev = Device::new(name, "scsi-cd");
        dev.drive = Some(name.to_string());
        dev.tray = true;
        self.devices.push(dev);
    }

    /// Adds an adapter backed by a tap netdev of the same name.
    pub fn add_nic(&mut self, name: &str, mac: &str, fds: &[&str]) {
        self.netdevs.insert(
            name.to_string(),
            fds.iter().map(|fd| fd.to_string()).collect(),
        );
        let mut dev = Device::new(name, "virtio-net-pci");
        dev.netdev = Some(name.to_string());
        dev.mac = Some(mac.to_string());
        self.devices.push(dev);
    }

    /// Makes `command` fail when aimed at `target`.
    pub fn fail_command(&mut self, command: &str, target: &str) {
        self.failing.insert((command.to_string(), target.to_string()));
    }

    fn check(&self, command: &str, target: &str) -> Result<(), MonitorError> {
        if self.failing.contains(&(command.to_string(), target.to_string())) {
            return Err(rejected(command, format!("injected failure on {target}")));
        }
        Ok(())
    }

    fn device(&self, id: &str) -> Option<&Device> {
        let id = id.strip_prefix(PERIPHERAL).map_or(id, |p| p.trim_start_matches('/'));
        self.devices.iter().find(|d| d.id == id)
    }

    fn device_mut(&mut self, id: &str) -> Option<&mut Device> {
        let id = id.strip_prefix(PERIPHERAL).map_or(id, |p| p.trim_start_matches('/'));
        self.devices.iter_mut().find(|d| d.id == id)
    }

    /// Devices through which `file` is reachable.
    pub fn frontends_of(&self, file: &str) -> Vec<String> {
        self.devices
            .iter()
            .filter(|d| {
                d.drive
                    .as_ref()
                    .and_then(|node| self.nodes.get(node))
                    .is_some_and(|node| node.file == file)
            })
            .map(|d| d.id.clone())
            .collect()
    }

    pub fn mac_of(&self, id: &str) -> Option<String> {
        self.device(id)?.mac.clone()
    }

    pub fn netdev_fds(&self, id: &str) -> Vec<String> {
        self.netdevs.get(id).cloned().unwrap_or_default()
    }

    pub fn has_device(&self, id: &str) -> bool {
        self.device(id).is_some()
    }

    pub fn link_up(&self, id: &str) -> bool {
        self.device(id).is_some_and(|d| d.link_up)
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn info_network(&self) -> String {
        let mut out = String::new();
        for dev in &self.devices {
            let (Some(netdev), Some(mac)) = (&dev.netdev, &dev.mac) else {
                continue;
            };
            let _ = write!(
                out,
                "{}: index=0,type=nic,model={},macaddr={}\r\n",
                dev.id, dev.driver, mac
            );
            for (i, fd) in self.netdevs.get(netdev).into_iter().flatten().enumerate() {
                let _ = write!(out, " \\ {netdev}: index={i},type=tap,fd={fd}\r\n");
            }
        }
        out
    }
}

impl Monitor for FakeMachine {
    fn query_block(&mut self) -> Result<Vec<BlockInfo>, MonitorError> {
        self.check("query-block", "")?;
        Ok(self
            .devices
            .iter()
            .filter_map(|dev| {
                let name = dev.drive.as_ref()?;
                let node = self.nodes.get(name)?;
                let qdev = if dev.tray {
                    dev.id.clone()
                } else {
                    format!("{PERIPHERAL}/{}/virtio-backend", dev.id)
                };
                Some(BlockInfo {
                    device: String::new(),
                    qdev: Some(qdev),
                    removable: dev.tray,
                    tray_open: dev.tray.then_some(false),
                    inserted: Some(BlockInserted {
                        node_name: name.clone(),
                        file: node.file.clone(),
                        drv: node.drv.clone(),
                        ro: node.ro,
                    }),
                })
            })
            .collect())
    }

    fn qom_list(
        &mut self,
        path: &str,
    ) -> Result<Vec<ObjectPropertyInfo>, MonitorError> {
        self.check("qom-list", path)?;
        if path != PERIPHERAL {
            return Err(rejected("qom-list", format!("Device '{path}' not found")));
        }
        Ok(self
            .devices
            .iter()
            .map(|d| ObjectPropertyInfo {
                name: d.id.clone(),
                kind: format!("child<{}>", d.driver),
            })
            .collect())
    }

    fn qom_get(
        &mut self,
        path: &str,
        property: &str,
    ) -> Result<Value, MonitorError> {
        self.check("qom-get", path)?;
        let dev = self
            .device(path)
            .ok_or_else(|| rejected("qom-get", format!("Device '{path}' not found")))?;
        let value = match property {
            "mac" => dev.mac.clone(),
            "netdev" => dev.netdev.clone(),
            "drive" => dev.drive.clone(),
            _ => None,
        };
        value.map(Value::String).ok_or_else(|| {
            rejected("qom-get", format!("Property '{property}' not found"))
        })
    }

    fn qom_set(
        &mut self,
        path: &str,
        property: &str,
        value: Value,
    ) -> Result<(), MonitorError> {
        self.check("qom-set", path)?;
        let Some(node) = value.as_str().map(str::to_string) else {
            return Err(rejected("qom-set", format!("bad value {value}")));
        };
        if property != "drive" || !self.nodes.contains_key(&node) {
            return Err(rejected("qom-set", format!("cannot set {property}")));
        }
        let dev = self
            .device_mut(path)
            .ok_or_else(|| rejected("qom-set", format!("Device '{path}' not found")))?;
        dev.drive = Some(node);
        Ok(())
    }

    fn blockdev_add(
        &mut self,
        opts: &BlockdevOptions,
    ) -> Result<(), MonitorError> {
        self.check("blockdev-add", &opts.node_name)?;
        if self.nodes.contains_key(&opts.node_name) {
            return Err(rejected(
                "blockdev-add",
                format!("Duplicate nodes with node-name='{}'", opts.node_name),
            ));
        }
        let open = self.nodes.values().any(|n| n.file == opts.filename);
        if open && opts.locking != BlockdevLocking::Off {
            return Err(rejected(
                "blockdev-add",
                "Failed to get \"write\" lock".to_string(),
            ));
        }
        self.nodes.insert(
            opts.node_name.clone(),
            Node {
                file: opts.filename.clone(),
                drv: opts.driver.clone(),
                ro: opts.read_only,
            },
        );
        Ok(())
    }

    fn netdev_add(&mut self, id: &str, fds: &[String]) -> Result<(), MonitorError> {
        self.check("netdev_add", id)?;
        if self.netdevs.contains_key(id) || fds.is_empty() {
            return Err(rejected("netdev_add", format!("cannot create {id}")));
        }
        self.netdevs.insert(id.to_string(), fds.to_vec());
        Ok(())
    }

    fn device_add(&mut self, dev: &DeviceAdd) -> Result<(), MonitorError> {
        self.check("device_add", &dev.id)?;
        if self.device(&dev.id).is_some() {
            return Err(rejected(
                "device_add",
                format!("Duplicate device ID '{}'", dev.id),
            ));
        }
        let prop = |name: &str| {
            dev.props.get(name).and_then(Value::as_str).map(str::to_string)
        };
        let netdev = prop("netdev");
        if netdev.as_ref().is_some_and(|n| !self.netdevs.contains_key(n)) {
            return Err(rejected("device_add", "netdev not found".to_string()));
        }
        let mut new = Device::new(&dev.id, &dev.driver);
        new.netdev = netdev;
        new.mac = prop("mac");
        new.drive = prop("drive");
        self.devices.push(new);
        Ok(())
    }

    fn device_del(&mut self, id: &str) -> Result<(), MonitorError> {
        self.check("device_del", id)?;
        let before = self.devices.len();
        let target = self.device(id).map(|d| d.id.clone());
        self.devices.retain(|d| Some(&d.id) != target.as_ref());
        if self.devices.len() == before {
            return Err(rejected("device_del", format!("Device '{id}' not found")));
        }
        Ok(())
    }

    fn set_link(&mut self, name: &str, up: bool) -> Result<(), MonitorError> {
        self.check("set_link", name)?;
        let dev = self
            .device_mut(name)
            .ok_or_else(|| rejected("set_link", format!("Device '{name}' not found")))?;
        dev.link_up = up;
        Ok(())
    }

    fn human_monitor_command(
        &mut self,
        command_line: &str,
    ) -> Result<String, MonitorError> {
        self.check("human-monitor-command", command_line)?;
        match command_line {
            "info network" => Ok(self.info_network()),
            other => Ok(format!("unknown command: '{other}'\r\n")),
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn locked_reopen_is_refused() {
        let mut vm = FakeMachine::new();
        vm.add_disk("incus_root", 3);
        let inserted = BlockInserted {
            node_name: "incus_root".to_string(),
            file: "/dev/fdset/3".to_string(),
            drv: "raw".to_string(),
            ro: false,
        };
        let mut opts = BlockdevOptions::reopen("fdset3", &inserted);
        opts.locking = BlockdevLocking::On;
        assert!(vm.blockdev_add(&opts).is_err());
        opts.locking = BlockdevLocking::Off;
        vm.blockdev_add(&opts).unwrap();
        assert_eq!(
            vm.qom_get("/machine/peripheral/incus_root", "drive").unwrap(),
            json!("incus_root")
        );
    }
}
