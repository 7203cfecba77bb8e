// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entry points for the instance lifecycle stages the engine acts on.

use devremap_config::{ExpandedDevices, HookConfig};
use slog::{o, Logger};
use strum::{Display, EnumString, IntoStaticStr};

use crate::launch::LaunchConfig;
use crate::patch::{ConfigPatcher, PatchError, PatchSummary};
use crate::qmp::Monitor;
use crate::remap::{RemapError, RemapSummary, Remapper};

/// A lifecycle stage, named as the instance manager names it.
///
/// Each stage is entered once per instance start, `config` first.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum HookStage {
    /// Before launch, with the launch parameters still editable.
    Config,
    /// After the process is up, with the monitor reachable.
    PreStart,
}

pub struct Hook<'a> {
    config: &'a HookConfig,
    log: Logger,
}

impl<'a> Hook<'a> {
    pub fn new(config: &'a HookConfig, log: Logger) -> Self {
        Self { config, log }
    }

    fn stage_log(&self, stage: HookStage) -> Logger {
        let name: &'static str = stage.into();
        self.log.new(o!("stage" => name))
    }

    pub fn on_config(
        &self,
        launch: &mut dyn LaunchConfig,
        devices: &ExpandedDevices,
    ) -> Result<PatchSummary, PatchError> {
        let log = self.stage_log(HookStage::Config);
        ConfigPatcher::new(self.config, log).patch(launch, devices)
    }

    pub fn on_pre_start<M: Monitor + ?Sized>(
        &self,
        mon: &mut M,
    ) -> Result<RemapSummary, RemapError> {
        let log = self.stage_log(HookStage::PreStart);
        Remapper::new(mon, self.config, log).remap_devices()
    }
}
