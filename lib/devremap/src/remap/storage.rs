// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving a live disk onto a placeholder slot.

use devremap_config::StorageConfig;
use serde_json::json;
use slog::info;
use thiserror::Error;

use super::Remapper;
use crate::allocator::Slot;
use crate::qmp::{BlockInfo, BlockdevOptions, Monitor, MonitorError};

#[derive(Debug, Error)]
pub enum StorageRemapError {
    #[error("block device {0:?} has no inserted medium")]
    NoMedia(String),

    #[error("block device {0:?} has no frontend device")]
    NoFrontend(String),

    #[error("cannot open backing node {node}")]
    CreateBacking {
        node: String,
        #[source]
        source: MonitorError,
    },

    #[error("cannot attach backing node {node} to {slot}")]
    Attach {
        node: String,
        slot: String,
        #[source]
        source: MonitorError,
    },

    #[error("cannot unplug {qdev}")]
    Unplug {
        qdev: String,
        #[source]
        source: MonitorError,
    },
}

/// A disk now served through a placeholder slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageSwap {
    /// The device that was unplugged.
    pub original: String,
    /// Backing node created for the slot. It stays behind for the lifetime
    /// of the instance; nothing deletes it.
    pub node_name: String,
    pub slot: Slot,
}

/// Whether `dev` is a guest disk managed by the instance manager.
///
/// Devices with a tray are optical drives and are left alone, as are disks
/// whose node was not created by the instance manager.
pub fn is_eligible(dev: &BlockInfo, config: &StorageConfig) -> bool {
    if dev.tray_open.is_some() {
        return false;
    }
    dev.inserted
        .as_ref()
        .is_some_and(|ins| ins.node_name.starts_with(&config.node_tag))
}

const FDSET_DIR: &str = "/dev/fdset/";

/// Node name for a second handle on `file`, taken over by `slot`.
///
/// Descriptor sets are numbered uniquely per instance, so `/dev/fdset/3`
/// becomes `fdset3`. Any other path may share its last component with
/// another disk, so the node is named after the slot instead.
pub fn backing_node_name(file: &str, slot: &Slot) -> String {
    match file.strip_prefix(FDSET_DIR) {
        Some(id) if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) => {
            format!("fdset{id}")
        }
        _ => format!("{}-backing", slot.name),
    }
}

impl<'a, M: Monitor + ?Sized> Remapper<'a, M> {
    /// Rebinds the data behind `dev` to the placeholder in `slot`, then
    /// unplugs `dev`.
    ///
    /// The original device is only unplugged once the placeholder is
    /// attached to the new node, so a failure before that leaves two
    /// frontends on the same data rather than none.
    pub fn remap_storage(
        &mut self,
        dev: &BlockInfo,
        slot: &Slot,
    ) -> Result<StorageSwap, StorageRemapError> {
        let inserted = dev
            .inserted
            .as_ref()
            .ok_or_else(|| StorageRemapError::NoMedia(dev.device.clone()))?;
        let qdev = dev
            .qdev
            .as_deref()
            .ok_or_else(|| StorageRemapError::NoFrontend(inserted.node_name.clone()))?;

        let node = backing_node_name(&inserted.file, slot);
        info!(self.log, "remapping disk";
            "node" => &inserted.node_name, "slot" => %slot, "backing" => &node);

        let opts = BlockdevOptions::reopen(node.clone(), inserted);
        self.mon.blockdev_add(&opts).map_err(|source| {
            StorageRemapError::CreateBacking { node: node.clone(), source }
        })?;

        let path = self.config.monitor.peripheral(&slot.name);
        self.mon.qom_set(&path, "drive", json!(node)).map_err(|source| {
            StorageRemapError::Attach {
                node: node.clone(),
                slot: slot.name.clone(),
                source,
            }
        })?;

        let frontend = qdev
            .strip_suffix(&self.config.storage.backend_suffix)
            .unwrap_or(qdev);
        info!(self.log, "unplugging disk"; "qdev" => frontend);
        self.mon.device_del(frontend).map_err(|source| {
            StorageRemapError::Unplug { qdev: frontend.to_string(), source }
        })?;

        Ok(StorageSwap {
            original: frontend.to_string(),
            node_name: node,
            slot: slot.clone(),
        })
    }
}

#[cfg(test)]
mod test {
    use devremap_config::HookConfig;
    use mockall::predicate::*;
    use mockall::Sequence;

    use super::*;
    use crate::allocator::OrdinalAllocator;
    use crate::qmp::{BlockInserted, MockMonitor};

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn disk(node: &str, fd: u32, qdev: &str) -> BlockInfo {
        BlockInfo {
            device: String::new(),
            qdev: Some(qdev.to_string()),
            removable: false,
            tray_open: None,
            inserted: Some(BlockInserted {
                node_name: node.to_string(),
                file: format!("/dev/fdset/{fd}"),
                drv: "raw".to_string(),
                ro: false,
            }),
        }
    }

    fn command_failed(command: &str) -> MonitorError {
        MonitorError::Command {
            command: command.to_string(),
            class: "GenericError".to_string(),
            desc: "injected".to_string(),
        }
    }

    #[test]
    fn eligibility() {
        let config = StorageConfig::default();
        assert!(is_eligible(
            &disk("incus_root", 3, "/machine/peripheral/incus_root/virtio-backend"),
            &config
        ));

        let mut cdrom = disk("incus_iso", 4, "incus_iso");
        cdrom.tray_open = Some(false);
        assert!(!is_eligible(&cdrom, &config));

        assert!(!is_eligible(&disk("drive-installer", 5, "installer"), &config));

        let mut empty = disk("incus_root", 3, "incus_root");
        empty.inserted = None;
        assert!(!is_eligible(&empty, &config));
    }

    #[test]
    fn backing_node_names() {
        let mut slots = OrdinalAllocator::new("sata");
        let (first, second) = (slots.next_slot(), slots.next_slot());
        assert_eq!(backing_node_name("/dev/fdset/3", &first), "fdset3");
        assert_eq!(backing_node_name("/dev/fdset/12", &second), "fdset12");

        // Same file name in two directories.
        let a = backing_node_name("/srv/pool-a/root.img", &first);
        let b = backing_node_name("/srv/pool-b/root.img", &second);
        assert_eq!(a, "sata0-backing");
        assert_eq!(b, "sata1-backing");
        assert_eq!(backing_node_name("/dev/fdset/", &first), "sata0-backing");
    }

    #[test]
    fn same_basename_gets_distinct_nodes() {
        let config = HookConfig::default();
        let mut mon = MockMonitor::new();
        let nodes = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = nodes.clone();
        mon.expect_blockdev_add().times(2).returning(move |opts| {
            seen.lock().unwrap().push(opts.node_name.clone());
            Ok(())
        });
        mon.expect_qom_set().times(2).returning(|_, _, _| Ok(()));
        mon.expect_device_del().times(2).returning(|_| Ok(()));

        let mut slots = OrdinalAllocator::new("sata");
        let mut remapper = Remapper::new(&mut mon, &config, test_logger());
        for (node, dir) in [("incus_root", "pool-a"), ("incus_data", "pool-b")] {
            let mut dev = disk(node, 0, node);
            if let Some(ins) = dev.inserted.as_mut() {
                ins.file = format!("/srv/{dir}/disk.img");
            }
            remapper.remap_storage(&dev, &slots.next_slot()).unwrap();
        }
        drop(remapper);

        let nodes = nodes.lock().unwrap();
        assert_eq!(*nodes, vec!["sata0-backing", "sata1-backing"]);
    }

    #[test]
    fn attach_precedes_unplug() {
        let config = HookConfig::default();
        let mut mon = MockMonitor::new();
        let mut seq = Sequence::new();

        mon.expect_blockdev_add()
            .withf(|opts| {
                opts.node_name == "fdset3"
                    && opts.filename == "/dev/fdset/3"
                    && opts.driver == "raw"
                    && !opts.read_only
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mon.expect_qom_set()
            .with(
                eq("/machine/peripheral/sata0"),
                eq("drive"),
                eq(json!("fdset3")),
            )
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        mon.expect_device_del()
            .with(eq("/machine/peripheral/incus_root"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let slot = OrdinalAllocator::new("sata").next_slot();
        let mut remapper = Remapper::new(&mut mon, &config, test_logger());
        let swap = remapper
            .remap_storage(
                &disk(
                    "incus_root",
                    3,
                    "/machine/peripheral/incus_root/virtio-backend",
                ),
                &slot,
            )
            .unwrap();
        assert_eq!(swap.original, "/machine/peripheral/incus_root");
        assert_eq!(swap.node_name, "fdset3");
        assert_eq!(swap.slot.name, "sata0");
    }

    #[test]
    fn qdev_without_backend_suffix_is_unplugged_as_is() {
        let config = HookConfig::default();
        let mut mon = MockMonitor::new();
        mon.expect_blockdev_add().returning(|_| Ok(()));
        mon.expect_qom_set().returning(|_, _, _| Ok(()));
        mon.expect_device_del()
            .with(eq("incus_data"))
            .times(1)
            .returning(|_| Ok(()));

        let slot = OrdinalAllocator::new("sata").next_slot();
        let mut remapper = Remapper::new(&mut mon, &config, test_logger());
        remapper
            .remap_storage(&disk("incus_data", 9, "incus_data"), &slot)
            .unwrap();
    }

    #[test]
    fn failed_backing_node_keeps_original() {
        let config = HookConfig::default();
        let mut mon = MockMonitor::new();
        mon.expect_blockdev_add()
            .times(1)
            .returning(|_| Err(command_failed("blockdev-add")));
        mon.expect_qom_set().never();
        mon.expect_device_del().never();

        let slot = OrdinalAllocator::new("sata").next_slot();
        let mut remapper = Remapper::new(&mut mon, &config, test_logger());
        let err = remapper
            .remap_storage(&disk("incus_root", 3, "incus_root"), &slot)
            .unwrap_err();
        assert!(matches!(
            err,
            StorageRemapError::CreateBacking { ref node, .. } if node == "fdset3"
        ));
    }

    #[test]
    fn failed_attach_keeps_original() {
        let config = HookConfig::default();
        let mut mon = MockMonitor::new();
        mon.expect_blockdev_add().times(1).returning(|_| Ok(()));
        mon.expect_qom_set()
            .times(1)
            .returning(|_, _, _| Err(command_failed("qom-set")));
        mon.expect_device_del().never();

        let slot = OrdinalAllocator::new("sata").next_slot();
        let mut remapper = Remapper::new(&mut mon, &config, test_logger());
        let err = remapper
            .remap_storage(&disk("incus_root", 3, "incus_root"), &slot)
            .unwrap_err();
        assert!(matches!(err, StorageRemapError::Attach { ref slot, .. } if slot == "sata0"));
    }

    #[test]
    fn missing_frontend_issues_nothing() {
        let config = HookConfig::default();
        let mut mon = MockMonitor::new();
        mon.expect_blockdev_add().never();

        let mut dev = disk("incus_root", 3, "incus_root");
        dev.qdev = None;
        let slot = OrdinalAllocator::new("sata").next_slot();
        let mut remapper = Remapper::new(&mut mon, &config, test_logger());
        assert!(matches!(
            remapper.remap_storage(&dev, &slot),
            Err(StorageRemapError::NoFrontend(_))
        ));
    }
}
