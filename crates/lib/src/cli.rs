//! # osdeploy command line
//!
//! Command line tool to manage deployments of the system root.

use std::ffi::OsString;
use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use clap::{Parser, Subcommand};
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::bootloader::select_bootloader;
use crate::config::load_config;
use crate::daemon::{self, DaemonHandle, DaemonState, DaemonStatus, JobContext};
use crate::deploy::{deploy, init_osname, prune, DeployContext, DeployOpts};
use crate::deployment::SysrootState;
use crate::kernel_cmdline::Cmdline;
use crate::origin::{Origin, Refspec};
use crate::status::{write_status, HostStatus, OutputFormat};
use crate::store::{RepoStore, RepoUpdateSource};

/// Perform a status operation
#[derive(Debug, clap::Args, PartialEq, Eq)]
pub struct StatusOpts {
    /// The output format; human-readable on a terminal, YAML otherwise.
    #[clap(long, value_enum)]
    pub format: Option<OutputFormat>,
}

/// Deploy a fetched commit
#[derive(Debug, clap::Args, PartialEq, Eq)]
pub struct DeployCmdOpts {
    /// The commit to deploy.
    pub commit: String,

    /// Deploy into this OS name instead of the booted one.
    #[clap(long = "os")]
    pub osname: Option<String>,

    /// Track this refspec (`remote:branch`) for future upgrades.
    #[clap(long)]
    pub refspec: Option<Refspec>,
}

/// Check for, fetch and apply an update
#[derive(Debug, clap::Args, PartialEq, Eq)]
pub struct UpgradeOpts {
    /// Only check whether an update is available.
    #[clap(long, conflicts_with = "reboot")]
    pub check: bool,

    /// Reboot into the update once it is applied.
    #[clap(long)]
    pub reboot: bool,
}

/// Create the directories for a new OS name
#[derive(Debug, clap::Args, PartialEq, Eq)]
pub struct OsInitOpts {
    /// The OS name.
    pub osname: String,
}

/// Deploy operating system trees and manage their boot entries.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "osdeploy", version, rename_all = "kebab-case")]
pub struct Opt {
    /// Operate on the system root at this path.
    #[clap(long, global = true, default_value = "/")]
    pub sysroot: Utf8PathBuf,

    /// The operation.
    #[clap(subcommand)]
    pub cmd: Command,
}

/// The operations.
#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Display the deployments of the system root.
    Status(StatusOpts),
    /// Deploy a commit and make it the default.
    Deploy(DeployCmdOpts),
    /// Check for, fetch and deploy an update of the booted refspec.
    Upgrade(UpgradeOpts),
    /// Remove unreferenced deployments and kernels.
    Prune,
    /// Create the directories for a new OS name.
    OsInit(OsInitOpts),
}

/// Whether `sysroot` is the running system, whose kernel command line
/// identifies the booted deployment.
fn is_live(sysroot: &Utf8Path) -> bool {
    sysroot.as_str() == "/"
}

#[context("Opening system root {sysroot}")]
fn open_sysroot(sysroot: &Utf8Path) -> Result<Dir> {
    Ok(Dir::open_ambient_dir(sysroot, cap_std::ambient_authority())?)
}

fn load_state(root: &Dir, sysroot: &Utf8Path) -> Result<SysrootState> {
    if is_live(sysroot) {
        let cmdline = Cmdline::from_proc()?;
        SysrootState::load(root, Some(&cmdline))
    } else {
        SysrootState::load(root, None)
    }
}

fn status(sysroot: &Utf8Path, opts: StatusOpts) -> Result<()> {
    let root = open_sysroot(sysroot)?;
    let state = load_state(&root, sysroot)?;
    let host = HostStatus::from(&state);
    let format = opts.format.unwrap_or(if std::io::stdout().is_terminal() {
        OutputFormat::HumanReadable
    } else {
        OutputFormat::Yaml
    });
    let out = std::io::stdout();
    let mut out = out.lock();
    write_status(&mut out, &host, format)
}

#[context("Deploying {}", opts.commit)]
fn deploy_commit(sysroot: &Utf8Path, opts: DeployCmdOpts) -> Result<()> {
    let root = open_sysroot(sysroot)?;
    let config = load_config(sysroot)?;
    let state = load_state(&root, sysroot)?;
    let bootloader = select_bootloader(&root, config.bootloader.backend)?;
    let store = RepoStore::open(&root)?;
    let cancel = CancellationToken::new();
    let ctx = DeployContext {
        cancel: &cancel,
        store: &store,
        bootloader: bootloader.as_ref(),
        config: &config,
    };
    let mut dopts = DeployOpts::new(&state, &opts.commit);
    dopts.osname = opts.osname.as_deref();
    dopts.origin = opts.refspec.clone().map(Origin::new_from_refspec);
    let r = deploy(&ctx, &root, dopts)?;
    match r.deployment.as_ref() {
        Some(d) => println!("Deployed {d}; boot version is now {}", r.bootversion),
        None => println!("Commit {} is already the default deployment", opts.commit),
    }
    Ok(())
}

async fn wait_idle(handle: &DaemonHandle) -> Result<DaemonStatus> {
    let mut rx = handle.subscribe();
    let status = rx
        .wait_for(|s| !s.state.is_busy())
        .await
        .context("Daemon exited")?
        .clone();
    if status.state == DaemonState::Error {
        anyhow::bail!("{} ({:?})", status.error_message, status.error_code);
    }
    Ok(status)
}

#[context("Upgrading")]
async fn upgrade(sysroot: &Utf8Path, opts: UpgradeOpts) -> Result<()> {
    let root = open_sysroot(sysroot)?;
    let ctx = JobContext {
        cancel: CancellationToken::new(),
        config: Arc::new(load_config(sysroot)?),
        store: Arc::new(RepoStore::open(&root)?),
        source: Arc::new(RepoUpdateSource::open(&root)?),
        root: Arc::new(root),
        // Not booted from a root we merely operate on
        cmdline: (!is_live(sysroot)).then(String::new),
    };
    let handle = daemon::spawn(ctx);

    handle.poll().await?;
    let status = wait_idle(&handle).await?;
    let Some(commit) = status.commit else {
        println!("No update available.");
        return Ok(());
    };
    if opts.check {
        println!("Update available: {commit}");
        return Ok(());
    }
    if status.state == DaemonState::UpdateAvailable {
        handle.fetch().await?;
        wait_idle(&handle).await?;
    }
    handle.apply().await?;
    let status = wait_idle(&handle).await?;
    for warning in status.warnings.iter() {
        eprintln!("warning: {warning}");
    }
    println!("Queued {commit} for next boot");
    tracing::debug!("Final state: {}", status.state);
    if opts.reboot {
        crate::reboot::reboot()?;
    }
    Ok(())
}

#[context("Pruning")]
fn prune_sysroot(sysroot: &Utf8Path) -> Result<()> {
    let root = open_sysroot(sysroot)?;
    let state = load_state(&root, sysroot)?;
    let stats = prune(&root, &state)?;
    println!(
        "Removed {} deployments and {} kernels",
        stats.deployments, stats.kernels
    );
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
async fn run_from_opt(opt: Opt) -> Result<()> {
    let sysroot = opt.sysroot.as_path();
    match opt.cmd {
        Command::Status(opts) => status(sysroot, opts),
        Command::Deploy(opts) => deploy_commit(sysroot, opts),
        Command::Upgrade(opts) => upgrade(sysroot, opts).await,
        Command::Prune => prune_sysroot(sysroot),
        Command::OsInit(opts) => {
            let root = open_sysroot(sysroot)?;
            init_osname(&root, &opts.osname)
        }
    }
}
