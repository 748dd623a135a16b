// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use slog::{info, o, Drain, Level, Logger};
use vmhw::clone::{build_clone_spec, CloneSettings};
use vmhw::inventory::{InventoryReader, StaticInventory};
use vmhw::resolve::StaticResolver;
use vmhw::{converge, DeclaredHardware, Reconciler};
use vmhw_config_toml::Config;

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Plans and applies VM hardware changes against an inventory snapshot
struct Opt {
    /// TOML file declaring the VM's hardware
    #[clap(short, long, action)]
    config: PathBuf,

    /// JSON inventory snapshot
    #[clap(short, long, action)]
    inventory: PathBuf,

    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the change specs that would converge the VM
    Plan {
        /// UUID of the VM
        #[clap(long, action)]
        vm: String,
    },

    /// Apply the change specs, then write back the snapshot and the
    /// config with recorded state
    Apply {
        /// UUID of the VM
        #[clap(long, action)]
        vm: String,
    },

    /// Print the clone spec for the config's clone source
    CloneSpec {
        /// Target datastore (defaults to the config's datastore_id)
        #[clap(long, action)]
        datastore: Option<String>,
    },
}

/// Create a top-level logger that outputs to stderr
fn create_logger(opt: &Opt) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let level = if opt.debug { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

fn reconciler<'a>(
    config: &Config,
    log: &Logger,
    inventory: &StaticInventory,
    resolver: &'a StaticResolver,
) -> Reconciler<'a> {
    let reconciler =
        Reconciler::new(log, resolver).with_api_type(inventory.api_type);
    match &config.datastore_id {
        Some(datastore) => reconciler.with_default_datastore(datastore.clone()),
        None => reconciler,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = create_logger(&opt);

    let mut config = vmhw_config_toml::parse(&opt.config).with_context(|| {
        format!("failed to read config {}", opt.config.display())
    })?;
    let declared = DeclaredHardware::try_from(&config)
        .with_context(|| anyhow!("invalid hardware in {}", opt.config.display()))?;
    let mut inventory = StaticInventory::load(&opt.inventory)?;
    let resolver = inventory.resolver.clone();
    let reconciler = reconciler(&config, &log, &inventory, &resolver);

    match opt.cmd {
        Command::Plan { vm } => {
            let props = inventory.vm_properties(&vm)?;
            let outcome = reconciler
                .reconcile(&declared, &props.devices)
                .context("failed to plan hardware changes")?;
            print_json(&outcome.changes)?;
        }
        Command::Apply { vm } => {
            let report = converge(&reconciler, &mut inventory, &vm, &declared)
                .with_context(|| format!("failed to converge VM {vm}"))?;
            inventory.save(&opt.inventory)?;

            config.record_state(&report.declared);
            let text = config
                .to_toml_string()
                .context("failed to serialize config")?;
            std::fs::write(&opt.config, text).with_context(|| {
                format!("failed to write config {}", opt.config.display())
            })?;
            info!(log, "converged"; "vm" => &vm, "changes" => report.changes.len());
            print_json(&report.changes)?;
        }
        Command::CloneSpec { datastore } => {
            let settings: CloneSettings = config
                .clone
                .as_ref()
                .map(CloneSettings::from)
                .ok_or_else(|| anyhow!("config has no [clone] section"))?;
            let datastore = datastore
                .or_else(|| config.datastore_id.clone())
                .ok_or_else(|| anyhow!("no target datastore"))?;
            let source = inventory.vm_properties(&settings.template_uuid)?;
            let spec = build_clone_spec(
                &reconciler,
                &source,
                &declared,
                &settings,
                &datastore,
            )
            .context("failed to build clone spec")?;
            print_json(&spec)?;
        }
    }

    Ok(())
}
