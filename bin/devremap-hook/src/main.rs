// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use slog::{error, info, o, Drain};

use devremap::launch::LaunchDocument;
use devremap::qmp::QmpClient;
use devremap::remap::RemapError;
use devremap::{Hook, HookStage};
use devremap_config::{ExpandedDevices, HookConfig};

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Instance lifecycle hook remapping QEMU devices for macOS guests
struct Args {
    /// Hook configuration file; built-in defaults are used without one.
    #[clap(long, env = "DEVREMAP_CONFIG", action)]
    config: Option<PathBuf>,

    /// Logging level
    #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
    log_level: slog::Level,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Patches the launch parameters before the hypervisor starts.
    Config {
        /// JSON map of the instance's expanded devices.
        #[clap(long, action)]
        devices: PathBuf,

        /// JSON launch document, rewritten in place.
        #[clap(long, action)]
        launch: PathBuf,
    },
    /// Remaps the devices of the running hypervisor.
    PreStart {
        /// Path of the QMP socket.
        #[clap(long, action)]
        qmp: PathBuf,
    },
    /// Prints the effective configuration.
    DumpConfig,
}

fn build_log(level: slog::Level) -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let (drain, guard) = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

fn load_devices(path: &Path) -> anyhow::Result<ExpandedDevices> {
    let file = File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing devices from {}", path.display()))
}

fn run_config(
    hook: &Hook,
    devices: &Path,
    launch: &Path,
) -> anyhow::Result<()> {
    let devices = load_devices(devices)?;
    let mut doc = LaunchDocument::load(launch)?;
    hook.on_config(&mut doc, &devices)
        .context("Failed to patch configuration")?;
    doc.store(launch)?;
    Ok(())
}

fn run_pre_start(
    hook: &Hook,
    config: &HookConfig,
    qmp: &Path,
    log: &slog::Logger,
) -> anyhow::Result<()> {
    let mut mon =
        QmpClient::connect(qmp, config.monitor.timeout(), log.clone())
            .with_context(|| format!("connecting to {}", qmp.display()))?;
    match hook.on_pre_start(&mut mon) {
        Ok(_) => Ok(()),
        Err(RemapError::Incomplete { summary, failures }) => {
            for failure in &failures {
                error!(log, "device left in place"; "failure" => %failure);
            }
            bail!(
                "{} of {} device(s) could not be remapped",
                failures.len(),
                failures.len() + summary.storage.len() + summary.network.len()
            )
        }
        Err(e) => Err(e).context("Remap pass aborted"),
    }
}

fn main() -> anyhow::Result<()> {
    let Args { config, log_level, cmd } = Args::parse();

    let config = match config {
        Some(path) => devremap_config::parse(&path).with_context(|| {
            format!("loading configuration {}", path.display())
        })?,
        None => HookConfig::default(),
    };

    let (log, _log_async_guard) = build_log(log_level);
    let hook = Hook::new(&config, log.clone());

    match cmd {
        Command::Config { devices, launch } => {
            info!(log, "running hook"; "stage" => %HookStage::Config);
            run_config(&hook, &devices, &launch)
        }
        Command::PreStart { qmp } => {
            info!(log, "running hook"; "stage" => %HookStage::PreStart);
            run_pre_start(&hook, &config, &qmp, &log)
        }
        Command::DumpConfig => {
            print!("{}", toml::to_string(&config)?);
            Ok(())
        }
    }
}
