// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device remapping for macOS guests on QEMU.
//!
//! At launch, [patch] rewrites the static device configuration so that the
//! machine boots with placeholder disks.  Once the machine is running,
//! [remap] moves the real disks onto those placeholders and the network
//! adapters onto the USB bus, over the monitor protocol in [qmp].

pub use devremap_config as config;

pub mod allocator;
pub mod hook;
pub mod launch;
pub mod netinfo;
pub mod patch;
pub mod qmp;
pub mod remap;

#[cfg(test)]
mod fake;

pub use hook::{Hook, HookStage};
