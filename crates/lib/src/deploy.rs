//! # Writing deployments
//!
//! A deploy never touches the active boot version. The new deployment
//! list is written in full to the inactive slot, made durable, and then
//! `boot/loader` is atomically swapped to point at it. Until that swap a
//! failure (or a crash) leaves the system booting exactly as before;
//! after it, the new list is complete.

use std::collections::HashSet;
use std::io::Read;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::bootloader::{write_slot_file, Bootloader};
use crate::config::Config;
use crate::deployment::{
    deployment_path, entry_filename, get_merge_deployment, kernel_dir, origin_path,
    osname_deploy_dir, osname_dir, ostree_karg_value, parse_deployment_dirname,
    require_deployment_or_osname, validate_osname, BootVersion, Deployment, SysrootState,
    BOOT_DIR, INITRAMFS, KERNELS_DIR, OSTREE_DIR, VMLINUZ,
};
use crate::error::Error;
use crate::kernel_cmdline::OSTREE_KARG;
use crate::origin::Origin;
use crate::parsers::bls_config::BLSConfig;
use crate::store::{validate_checksum, ContentStore};

/// Name of the boot version selector inside `boot/`.
const LOADER_NAME: &str = "loader";
/// Staging name for the new selector.
const LOADER_TMP: &str = "loader.tmp";
/// Per-OS name file recording the last deploy serial handed out.
const DEPLOY_SERIAL_FILE: &str = "deploy-serial";
/// Where a tree ships its kernels.
const MODULES_DIR: &str = "usr/lib/modules";

/// What a deploy runs against.
#[derive(Debug)]
pub struct DeployContext<'a> {
    /// Checked between steps up to the boot version swap.
    pub cancel: &'a CancellationToken,
    /// Where trees come from.
    pub store: &'a dyn ContentStore,
    /// The active bootloader backend.
    pub bootloader: &'a dyn Bootloader,
    /// Retention and default kernel arguments.
    pub config: &'a Config,
}

/// A deploy request.
#[derive(Debug)]
pub struct DeployOpts<'a> {
    /// The active boot version.
    pub current_boot_version: BootVersion,
    /// The deployments of the active boot version, in order.
    pub deployments: &'a [Deployment],
    /// OS name to deploy into; the booted one's if unset.
    pub osname: Option<&'a str>,
    /// The commit to deploy.
    pub commit: &'a str,
    /// Origin keys for the new deployment, layered over the merge
    /// deployment's origin.
    pub origin: Option<Origin>,
    /// The booted deployment; never pruned.
    pub booted: Option<&'a Deployment>,
    /// Overrides the computed merge deployment.
    pub merge: Option<&'a Deployment>,
}

impl<'a> DeployOpts<'a> {
    /// A request to deploy `commit` against a loaded system root.
    pub fn new(state: &'a SysrootState, commit: &'a str) -> Self {
        Self {
            current_boot_version: state.bootversion,
            deployments: &state.deployments,
            osname: None,
            commit,
            origin: None,
            booted: state.booted(),
            merge: None,
        }
    }
}

/// The outcome of a successful deploy.
#[derive(Debug)]
pub struct DeployResult {
    /// The boot version active afterwards.
    pub bootversion: BootVersion,
    /// The new deployment; `None` if the commit was already the default.
    pub deployment: Option<Deployment>,
    /// Problems after the swap; they do not undo the deploy.
    pub warnings: Vec<String>,
}

impl DeployResult {
    /// Whether a new boot version was activated.
    pub fn changed(&self) -> bool {
        self.deployment.is_some()
    }
}

/// Trees, origins and kernel directories removed by a prune.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Deployment trees (with their origins) removed.
    pub deployments: usize,
    /// Kernel directories removed.
    pub kernels: usize,
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled.into());
    }
    Ok(())
}

fn fsync_dir(dir: &Dir) -> Result<()> {
    // Can't call fsync on O_PATH fds, so re-open it as a non O_PATH fd
    let fd = dir.reopen_as_ownedfd().context("Reopening as owned fd")?;
    rustix::fs::fsync(fd).context("fsync")?;
    Ok(())
}

fn read_optional_string(root: &Dir, path: impl AsRef<std::path::Path>) -> Result<Option<String>> {
    let Some(mut f) = root.open_optional(path)? else {
        return Ok(None);
    };
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    Ok(Some(buf))
}

/// Create the directories for a new OS name.
#[context("Initializing OS name {osname}")]
pub fn init_osname(root: &Dir, osname: &str) -> Result<()> {
    validate_osname(osname)?;
    let deploy_dir = osname_deploy_dir(osname);
    root.create_dir_all(&deploy_dir)?;
    root.create_dir_all(osname_dir(osname).join("var"))?;
    fsync_dir(&root.open_dir(osname_dir(osname))?)?;
    tracing::info!("Initialized OS name {osname}");
    Ok(())
}

/// Hand out the next deploy serial for `osname`.
///
/// The last serial is persisted, so serials keep increasing even after the
/// deployments that used them are pruned; the serials still on disk bound
/// the result from below in case the counter is lost.
#[context("Allocating deploy serial")]
pub(crate) fn allocate_deployserial(root: &Dir, osname: &str) -> Result<u32> {
    let deploy_dir = osname_deploy_dir(osname);
    let counter_path = osname_dir(osname).join(DEPLOY_SERIAL_FILE);
    let persisted = match read_optional_string(root, &counter_path)? {
        Some(s) => Some(
            s.trim()
                .parse::<u32>()
                .with_context(|| format!("Parsing {counter_path}"))?,
        ),
        None => None,
    };
    let mut on_disk = None;
    if let Some(d) = root.open_dir_optional(&deploy_dir)? {
        for ent in d.entries()? {
            let name = ent?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some((_, serial)) = parse_deployment_dirname(name) {
                on_disk = on_disk.max(Some(serial));
            }
        }
    }
    let next = match persisted.max(on_disk) {
        Some(last) => last
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("Deploy serials exhausted for {osname}"))?,
        None => 0,
    };
    root.atomic_write(&counter_path, format!("{next}\n"))?;
    fsync_dir(&root.open_dir(osname_dir(osname))?)?;
    Ok(next)
}

/// Find the single kernel shipped in a tree, returning its directory
/// relative to the tree.
fn find_kernel(tree: &Dir) -> Result<Utf8PathBuf> {
    let modules = tree
        .open_dir_optional(MODULES_DIR)?
        .ok_or_else(|| anyhow::anyhow!("Tree has no {MODULES_DIR}"))?;
    let mut found = Vec::new();
    for ent in modules.entries()? {
        let ent = ent?;
        if !ent.file_type()?.is_dir() {
            continue;
        }
        let name = ent.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if ent.open_dir()?.try_exists(VMLINUZ)? {
            found.push(name.to_owned());
        }
    }
    match found.as_slice() {
        [kver] => Ok(Utf8PathBuf::from(MODULES_DIR).join(kver)),
        [] => anyhow::bail!("No kernel found in {MODULES_DIR}"),
        _ => anyhow::bail!("Multiple kernels found in {MODULES_DIR}: {}", found.join(", ")),
    }
}

/// Copy the kernel and initramfs of a tree to `boot/`, returning whether an
/// initramfs exists.
#[context("Installing kernel")]
fn install_kernel(root: &Dir, tree: &Dir, osname: &str, csum: &str) -> Result<bool> {
    let src_dir = tree.open_dir(find_kernel(tree)?)?;
    let boot = root.open_dir(BOOT_DIR)?;
    let dest = kernel_dir(osname, csum);
    // Deployments of the same commit share a kernel directory
    if boot.try_exists(&dest)? {
        tracing::debug!("Reusing {dest}");
        return Ok(boot.try_exists(dest.join(INITRAMFS))?);
    }
    let tmp = Utf8PathBuf::from(KERNELS_DIR).join(format!(".tmp-{osname}-{csum}"));
    boot.remove_all_optional(&tmp)?;
    boot.create_dir_all(&tmp)?;
    let tmp_dir = boot.open_dir(&tmp)?;
    src_dir.copy(VMLINUZ, &tmp_dir, VMLINUZ)?;
    let has_initramfs = src_dir.try_exists(INITRAMFS)?;
    if has_initramfs {
        src_dir.copy(INITRAMFS, &tmp_dir, INITRAMFS)?;
    }
    for name in [VMLINUZ, INITRAMFS] {
        if let Some(f) = tmp_dir.open_optional(name)? {
            f.sync_all()?;
        }
    }
    fsync_dir(&tmp_dir)?;
    boot.rename(&tmp, &boot, &dest)?;
    fsync_dir(&boot.open_dir(KERNELS_DIR)?)?;
    Ok(has_initramfs)
}

/// Build the loader entry of a new deployment.
pub(crate) fn new_bootconfig(
    osname: &str,
    csum: &str,
    deployserial: u32,
    kargs: &str,
    has_initramfs: bool,
) -> BLSConfig {
    let kdir = kernel_dir(osname, csum);
    let mut config = BLSConfig::default();
    config.linux = format!("/{kdir}/{VMLINUZ}");
    if has_initramfs {
        config.initrd = vec![format!("/{kdir}/{INITRAMFS}")];
    }
    let ostree = format!("{OSTREE_KARG}={}", ostree_karg_value(osname, csum, deployserial));
    let kargs = kargs.trim();
    config.options = Some(if kargs.is_empty() {
        ostree
    } else {
        format!("{kargs} {ostree}")
    });
    config
}

/// Renumber a deployment list and write its loader entries into the
/// (cleared) slot of `bootversion`.
#[context("Writing loader entries for boot version {bootversion}")]
pub(crate) fn write_bootconfigs(
    root: &Dir,
    bootversion: BootVersion,
    deployments: &mut [Deployment],
) -> Result<()> {
    let slot_path = bootversion.loader_dir();
    root.remove_all_optional(&slot_path)?;
    root.create_dir_all(bootversion.entries_dir())?;
    let entries = root.open_dir(bootversion.entries_dir())?;
    let n = deployments.len();
    for (index, deployment) in deployments.iter_mut().enumerate() {
        deployment.index = index;
        let config = &mut deployment.bootconfig;
        config.title = Some(format!(
            "{} {} (ostree:{index})",
            deployment.osname, deployment.csum
        ));
        config.set_version((n - index).to_string());
        let name = entry_filename(index, &deployment.osname);
        write_slot_file(&entries, &name, &config.to_string())?;
    }
    Ok(())
}

/// Make the slot of `bootversion` durable.
fn sync_slot(root: &Dir, bootversion: BootVersion, bootloader: &dyn Bootloader) -> Result<()> {
    fsync_dir(&root.open_dir(bootversion.entries_dir())?)?;
    fsync_dir(&root.open_dir(bootversion.loader_dir())?)?;
    let boot = root.open_dir(BOOT_DIR)?;
    if let Some(kernels) = boot.open_dir_optional(KERNELS_DIR)? {
        fsync_dir(&kernels)?;
    }
    if !bootloader.is_atomic() {
        tracing::debug!("syncfs for {}", bootloader.name());
        rustix::fs::syncfs(boot.reopen_as_ownedfd()?).context("syncfs")?;
    }
    fsync_dir(&boot)?;
    Ok(())
}

/// Atomically make `bootversion` the active one.
///
/// Once this returns successfully the swap has happened.
#[context("Swapping to boot version {bootversion}")]
pub(crate) fn swap_bootversion(root: &Dir, bootversion: BootVersion) -> Result<()> {
    let boot = root.open_dir(BOOT_DIR)?;
    boot.remove_file_optional(LOADER_TMP)?;
    boot.symlink(bootversion.loader_dir_name(), LOADER_TMP)?;
    boot.rename(LOADER_TMP, &boot, LOADER_NAME)?;
    Ok(())
}

/// Everything created for a new deployment before the swap, so it can be
/// removed again on failure.
#[derive(Debug)]
struct Staged {
    tree: Utf8PathBuf,
    origin: Utf8PathBuf,
    kernel: Option<Utf8PathBuf>,
    slot: BootVersion,
}

impl Staged {
    fn discard(&self, root: &Dir) {
        let mut r = root.remove_all_optional(&self.tree).map(drop);
        r = r.and(root.remove_file_optional(&self.origin).map(drop));
        if let Some(kernel) = self.kernel.as_ref() {
            r = r.and(root.remove_all_optional(Utf8PathBuf::from(BOOT_DIR).join(kernel)).map(drop));
        }
        r = r.and(root.remove_all_optional(self.slot.loader_dir()).map(drop));
        if let Err(e) = r {
            tracing::warn!("Failed to clean up after failed deploy: {e}");
        }
    }
}

/// Deploy a commit: check out its tree, write the new deployment list to
/// the inactive boot version and switch to it.
#[context("Deploying {}", opts.commit)]
pub fn deploy(ctx: &DeployContext<'_>, root: &Dir, opts: DeployOpts<'_>) -> Result<DeployResult> {
    validate_checksum(opts.commit)?;
    let osname = require_deployment_or_osname(root, opts.osname, opts.booted)?;
    let merge = opts
        .merge
        .or_else(|| get_merge_deployment(opts.deployments, &osname, opts.booted));
    let base_origin = merge.and_then(|m| m.origin.as_ref());
    let origin = match (opts.origin.as_ref(), base_origin) {
        (Some(o), Some(base)) => Some(o.merged_onto(base)),
        (Some(o), None) => Some(o.clone()),
        (None, base) => base.cloned(),
    };

    if let Some(default) = opts.deployments.iter().find(|d| d.osname == osname) {
        if default.csum == opts.commit && default.origin == origin {
            tracing::info!("{default} is already the default deployment");
            return Ok(DeployResult {
                bootversion: opts.current_boot_version,
                deployment: None,
                warnings: Vec::new(),
            });
        }
    }

    check_cancelled(ctx.cancel)?;
    let deployserial = allocate_deployserial(root, &osname)?;
    let new_bootversion = opts.current_boot_version.inactive();
    let kernel_shared = opts
        .deployments
        .iter()
        .any(|d| d.osname == osname && d.csum == opts.commit);
    let staged = Staged {
        tree: deployment_path(&osname, opts.commit, deployserial),
        origin: origin_path(&osname, opts.commit, deployserial),
        kernel: (!kernel_shared).then(|| kernel_dir(&osname, opts.commit)),
        slot: new_bootversion,
    };
    let kargs = match merge {
        Some(m) => m.bootconfig.kargs_without_ostree(),
        None => ctx.config.default_kargs(),
    };

    let prepared = prepare_boot_version(
        ctx,
        root,
        &opts,
        &osname,
        deployserial,
        origin,
        &kargs,
        new_bootversion,
    )
    .and_then(|list| {
        check_cancelled(ctx.cancel)?;
        swap_bootversion(root, new_bootversion)?;
        Ok(list)
    });
    let new_list = match prepared {
        Ok(list) => list,
        Err(e) => {
            staged.discard(root);
            return Err(e);
        }
    };
    tracing::info!(
        "Swapped to boot version {new_bootversion} with {} deployments",
        new_list.len()
    );

    // From here on the deploy has happened; problems are only reported.
    let mut warnings = Vec::new();
    let mut warn = |e: anyhow::Error| {
        tracing::warn!("{e:#}");
        warnings.push(format!("{e:#}"));
    };
    if let Err(e) = root.open_dir(BOOT_DIR).map_err(anyhow::Error::from).and_then(|d| fsync_dir(&d)) {
        warn(e);
    }
    if let Err(e) = ctx.bootloader.post_bls_sync(root, new_bootversion) {
        warn(e);
    }
    if let Err(e) = prune_unreferenced(root, &new_list, opts.booted, Some(opts.current_boot_version)) {
        warn(e);
    }
    let deployment = new_list.into_iter().next();
    Ok(DeployResult {
        bootversion: new_bootversion,
        deployment,
        warnings,
    })
}

/// Steps up to (not including) the swap.
#[allow(clippy::too_many_arguments)]
fn prepare_boot_version(
    ctx: &DeployContext<'_>,
    root: &Dir,
    opts: &DeployOpts<'_>,
    osname: &str,
    deployserial: u32,
    origin: Option<Origin>,
    kargs: &str,
    new_bootversion: BootVersion,
) -> Result<Vec<Deployment>> {
    let csum = opts.commit;
    let deploy_dir = root.open_dir(osname_deploy_dir(osname))?;
    let dirname = format!("{csum}.{deployserial}");
    ctx.store.materialize_tree(csum, &deploy_dir, &dirname)?;
    check_cancelled(ctx.cancel)?;

    if let Some(origin) = origin.as_ref() {
        deploy_dir.atomic_write(format!("{dirname}.origin"), origin.to_string())?;
    }
    let tree = deploy_dir.open_dir(&dirname)?;
    let has_initramfs = install_kernel(root, &tree, osname, csum)?;
    fsync_dir(&deploy_dir)?;
    check_cancelled(ctx.cancel)?;

    let new = Deployment {
        index: 0,
        osname: osname.to_owned(),
        csum: csum.to_owned(),
        deployserial,
        bootconfig: new_bootconfig(osname, csum, deployserial, kargs, has_initramfs),
        origin,
    };
    tracing::debug!("Created deployment {new}");

    let mut list = build_deployment_list(
        new,
        opts.deployments,
        opts.booted,
        ctx.config.retain(),
    );
    write_bootconfigs(root, new_bootversion, &mut list)?;
    ctx.bootloader
        .write_config(root, new_bootversion, &list)?;
    check_cancelled(ctx.cancel)?;
    sync_slot(root, new_bootversion, ctx.bootloader)?;
    Ok(list)
}

/// The new list: `new` first, then existing deployments in order, keeping
/// at most `retain` deployments of the new one's OS name plus the booted
/// deployment.
fn build_deployment_list(
    new: Deployment,
    existing: &[Deployment],
    booted: Option<&Deployment>,
    retain: usize,
) -> Vec<Deployment> {
    let mut same_os = 1;
    let mut list = vec![new];
    for d in existing {
        if d.osname == list[0].osname {
            let is_booted = booted.is_some_and(|b| b.same_as(d));
            if same_os >= retain && !is_booted {
                tracing::debug!("Dropping {d} beyond retention");
                continue;
            }
            same_os += 1;
        }
        list.push(d.clone());
    }
    list
}

/// Remove deployment trees, origins and kernel directories not used by
/// `keep` or `booted`, and the slot of `stale` if given.
#[context("Pruning")]
pub(crate) fn prune_unreferenced(
    root: &Dir,
    keep: &[Deployment],
    booted: Option<&Deployment>,
    stale: Option<BootVersion>,
) -> Result<PruneStats> {
    let mut stats = PruneStats::default();
    let referenced = keep.iter().chain(booted);
    let mut trees = HashSet::new();
    let mut kernels = HashSet::new();
    for d in referenced {
        trees.insert((d.osname.clone(), format!("{}.{}", d.csum, d.deployserial)));
        kernels.insert(format!("{}-{}", d.osname, d.csum));
    }

    let osnames_dir = Utf8PathBuf::from(OSTREE_DIR).join("deploy");
    if let Some(osnames) = root.open_dir_optional(&osnames_dir)? {
        for ent in osnames.entries()? {
            let ent = ent?;
            if !ent.file_type()?.is_dir() {
                continue;
            }
            let name = ent.file_name();
            let Some(osname) = name.to_str() else {
                continue;
            };
            let Some(deploy_dir) = root.open_dir_optional(osname_deploy_dir(osname))? else {
                continue;
            };
            let mut removed = false;
            for ent in deploy_dir.entries()? {
                let ent = ent?;
                let name = ent.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                let tree = name.strip_suffix(".origin").unwrap_or(name);
                if parse_deployment_dirname(tree).is_none() {
                    continue;
                }
                if trees.contains(&(osname.to_owned(), tree.to_owned())) {
                    continue;
                }
                if name == tree {
                    tracing::debug!("Removing deployment {osname} {tree}");
                    deploy_dir.remove_all_optional(name)?;
                    stats.deployments += 1;
                } else {
                    deploy_dir.remove_file_optional(name)?;
                }
                removed = true;
            }
            if removed {
                fsync_dir(&deploy_dir)?;
            }
        }
    }

    let boot = root.open_dir(BOOT_DIR)?;
    if let Some(kdir) = boot.open_dir_optional(KERNELS_DIR)? {
        let mut removed = false;
        for ent in kdir.entries()? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !ent.file_type()?.is_dir() || kernels.contains(name) {
                continue;
            }
            tracing::debug!("Removing kernel directory {name}");
            kdir.remove_all_optional(name)?;
            stats.kernels += 1;
            removed = true;
        }
        if removed {
            fsync_dir(&kdir)?;
        }
    }

    if let Some(stale) = stale {
        if root.remove_all_optional(stale.loader_dir())? {
            fsync_dir(&boot)?;
        }
    }
    tracing::debug!("Pruned: {stats:?}");
    Ok(stats)
}

/// Remove everything not referenced by the active boot version or the
/// booted deployment, including the inactive slot.
pub fn prune(root: &Dir, state: &SysrootState) -> Result<PruneStats> {
    prune_unreferenced(
        root,
        &state.deployments,
        state.booted(),
        Some(state.bootversion.inactive()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::{BootloaderKind, Grub2, Zipl};
    use crate::deployment::list_deployments;
    use crate::error::ErrorCode;
    use crate::kernel_cmdline::Cmdline;
    use crate::store::RepoStore;
    use crate::testutils::Fixture;

    /// Snapshot of everything a bootloader could read.
    fn boot_snapshot(fixture: &Fixture) -> Result<Vec<(String, String)>> {
        let bootversion = crate::deployment::read_current_bootversion(&fixture.root)?;
        let mut r = vec![(
            "loader".to_owned(),
            fixture
                .root
                .read_link_contents("boot/loader")?
                .to_string_lossy()
                .into_owned(),
        )];
        for dir in [bootversion.loader_dir(), bootversion.entries_dir()] {
            let dir = fixture.root.open_dir(dir)?;
            let mut files = Vec::new();
            for ent in dir.entries()? {
                let ent = ent?;
                if ent.file_type()?.is_file() {
                    files.push(ent.file_name().to_string_lossy().into_owned());
                }
            }
            files.sort();
            for name in files {
                let contents = dir.read_to_string(&name)?;
                r.push((name, contents));
            }
        }
        Ok(r)
    }

    /// A store that cancels the token while checking out, like a crash
    /// in the middle of a deploy.
    #[derive(Debug)]
    struct CancellingStore<'a> {
        inner: RepoStore,
        cancel: &'a CancellationToken,
    }

    impl ContentStore for CancellingStore<'_> {
        fn has_commit(&self, commit: &str) -> Result<bool> {
            self.inner.has_commit(commit)
        }

        fn materialize_tree(&self, commit: &str, dest: &Dir, name: &str) -> Result<()> {
            self.inner.materialize_tree(commit, dest, name)?;
            self.cancel.cancel();
            Ok(())
        }
    }

    /// A backend whose finalization always fails.
    #[derive(Debug)]
    struct FailingSync;

    impl Bootloader for FailingSync {
        fn query(&self, _root: &Dir) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &'static str {
            "failing"
        }

        fn write_config(
            &self,
            root: &Dir,
            bootversion: BootVersion,
            deployments: &[Deployment],
        ) -> Result<()> {
            Grub2.write_config(root, bootversion, deployments)
        }

        fn post_bls_sync(&self, _root: &Dir, _bootversion: BootVersion) -> Result<()> {
            anyhow::bail!("install failed")
        }
    }

    fn deploy_commit(
        fixture: &Fixture,
        bootloader: &dyn Bootloader,
        commit: &str,
        booted: Option<&str>,
    ) -> Result<DeployResult> {
        let cancel = CancellationToken::new();
        let store = RepoStore::open(&fixture.root)?;
        let config = Config::default();
        let ctx = DeployContext {
            cancel: &cancel,
            store: &store,
            bootloader,
            config: &config,
        };
        let cmdline = booted.map(Cmdline::from);
        let state = SysrootState::load(&fixture.root, cmdline.as_ref())?;
        let mut opts = DeployOpts::new(&state, commit);
        opts.osname = Some("core");
        deploy(&ctx, &fixture.root, opts)
    }

    fn ids(deployments: &[Deployment]) -> Vec<String> {
        deployments
            .iter()
            .map(|d| format!("{}.{}", d.csum, d.deployserial))
            .collect()
    }

    const BOOTED_C1: &str = "rw ostree=/ostree/deploy/core/deploy/c1.0";

    #[test]
    fn test_upgrade() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Grub2)?;
        fixture.install_deployments(BootVersion::Zero, &[("core", "c1", 0)])?;
        fixture.add_commit("c2")?;

        let r = deploy_commit(&fixture, &Grub2, "c2", Some(BOOTED_C1))?;
        assert!(r.changed());
        assert!(r.warnings.is_empty(), "{:?}", r.warnings);
        assert_eq!(r.bootversion, BootVersion::One);

        let (bootversion, deployments) = list_deployments(&fixture.root)?;
        assert_eq!(bootversion, BootVersion::One);
        assert_eq!(ids(&deployments), ["c2.1", "c1.0"]);
        let new = &deployments[0];
        // Origin and kernel arguments come from the merge deployment
        assert_eq!(
            new.refspec().map(|r| r.to_string()).as_deref(),
            Some("origin:core/stable")
        );
        assert_eq!(new.bootconfig.kargs_without_ostree(), "rw");
        assert_eq!(
            new.bootconfig.ostree_path().as_deref(),
            Some("/ostree/deploy/core/deploy/c2.1")
        );
        assert_eq!(
            fixture.root.read_to_string("boot/ostree/core-c2/vmlinuz")?,
            "kernel-c2"
        );
        assert!(fixture.root.try_exists("ostree/deploy/core/deploy/c2.1/usr")?);
        // The grub marker now resolves to the new menu
        let menu = fixture.root.read_to_string("boot/grub2/grub.cfg")?;
        assert!(menu.contains("menuentry \"core c2 (ostree:0)\""));
        // The old slot is gone
        assert!(!fixture.root.try_exists("boot/loader.0")?);
        assert!(!fixture.root.try_exists("boot/loader.tmp")?);
        Ok(())
    }

    #[test]
    fn test_redeploy_is_noop() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Grub2)?;
        fixture.install_deployments(BootVersion::Zero, &[("core", "c1", 0)])?;
        fixture.add_commit("c1")?;
        let before = boot_snapshot(&fixture)?;

        let r = deploy_commit(&fixture, &Grub2, "c1", Some(BOOTED_C1))?;
        assert!(!r.changed());
        assert_eq!(r.bootversion, BootVersion::Zero);
        similar_asserts::assert_eq!(boot_snapshot(&fixture)?, before);
        Ok(())
    }

    #[test]
    fn test_cancel_before_swap() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Grub2)?;
        fixture.install_deployments(BootVersion::Zero, &[("core", "c1", 0)])?;
        fixture.add_commit("c2")?;
        let before = boot_snapshot(&fixture)?;

        let cancel = CancellationToken::new();
        let store = CancellingStore {
            inner: RepoStore::open(&fixture.root)?,
            cancel: &cancel,
        };
        let config = Config::default();
        let ctx = DeployContext {
            cancel: &cancel,
            store: &store,
            bootloader: &Grub2,
            config: &config,
        };
        let state = SysrootState::load(&fixture.root, None)?;
        let mut opts = DeployOpts::new(&state, "c2");
        opts.osname = Some("core");
        let e = deploy(&ctx, &fixture.root, opts).unwrap_err();
        assert_eq!(ErrorCode::classify(&e), ErrorCode::Cancelled);

        similar_asserts::assert_eq!(boot_snapshot(&fixture)?, before);
        assert!(!fixture.root.try_exists("ostree/deploy/core/deploy/c2.1")?);
        assert!(!fixture.root.try_exists("boot/ostree/core-c2")?);
        assert!(!fixture.root.try_exists("boot/loader.1")?);
        Ok(())
    }

    #[test]
    fn test_missing_commit() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Grub2)?;
        fixture.install_deployments(BootVersion::Zero, &[("core", "c1", 0)])?;
        let before = boot_snapshot(&fixture)?;
        let e = deploy_commit(&fixture, &Grub2, "c9", None).unwrap_err();
        assert_eq!(ErrorCode::classify(&e), ErrorCode::NotFound);
        similar_asserts::assert_eq!(boot_snapshot(&fixture)?, before);
        Ok(())
    }

    #[test]
    fn test_post_swap_failure_is_a_warning() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Grub2)?;
        fixture.install_deployments(BootVersion::Zero, &[("core", "c1", 0)])?;
        fixture.add_commit("c2")?;

        let r = deploy_commit(&fixture, &FailingSync, "c2", Some(BOOTED_C1))?;
        assert!(r.changed());
        assert_eq!(r.warnings.len(), 1);
        assert!(r.warnings[0].contains("install failed"));
        let (bootversion, deployments) = list_deployments(&fixture.root)?;
        assert_eq!(bootversion, BootVersion::One);
        assert_eq!(ids(&deployments), ["c2.1", "c1.0"]);
        Ok(())
    }

    #[test]
    fn test_non_atomic_bootloader() -> Result<()> {
        const STAMP: &str = "boot/ostree-bootloader-update.stamp";
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Zipl)?;
        fixture.install_deployments(BootVersion::Zero, &[("core", "c1", 0)])?;
        fixture.add_commit("c2")?;

        let r = deploy_commit(&fixture, &Zipl::with_command("true"), "c2", Some(BOOTED_C1))?;
        assert!(r.warnings.is_empty(), "{:?}", r.warnings);
        assert_eq!(r.bootversion, BootVersion::One);
        let (bootversion, deployments) = list_deployments(&fixture.root)?;
        assert_eq!(bootversion, BootVersion::One);
        assert_eq!(ids(&deployments), ["c2.1", "c1.0"]);
        let conf = fixture.root.read_to_string("boot/loader/zipl.conf")?;
        assert!(conf.contains("image=/boot/ostree/core-c2/vmlinuz"), "{conf}");
        assert!(conf.contains("ostree=/ostree/deploy/core/deploy/c2.1"), "{conf}");
        assert!(conf.contains("[ostree-1]\nimage=/boot/ostree/core-c1/vmlinuz"), "{conf}");
        assert!(!fixture.root.try_exists(STAMP)?);

        // A failing zipl run does not undo the swap, and leaves the
        // config marked for the next sync.
        fixture.add_commit("c3")?;
        let r = deploy_commit(&fixture, &Zipl::with_command("false"), "c3", Some(BOOTED_C1))?;
        assert_eq!(r.bootversion, BootVersion::Zero);
        assert_eq!(r.warnings.len(), 1, "{:?}", r.warnings);
        assert!(r.warnings[0].contains("Installing zipl boot record"));
        assert!(fixture.root.try_exists(STAMP)?);
        let conf = fixture.root.read_to_string("boot/loader/zipl.conf")?;
        assert!(conf.contains("image=/boot/ostree/core-c3/vmlinuz"), "{conf}");
        Ok(())
    }

    #[test]
    fn test_serials_and_retention() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Grub2)?;
        fixture.install_deployments(BootVersion::Zero, &[("core", "c1", 0)])?;
        for c in ["c2", "c3"] {
            fixture.add_commit(c)?;
        }

        // Booted stays even though it is beyond retention
        deploy_commit(&fixture, &Grub2, "c2", Some(BOOTED_C1))?;
        deploy_commit(&fixture, &Grub2, "c3", Some(BOOTED_C1))?;
        let (_, deployments) = list_deployments(&fixture.root)?;
        assert_eq!(
            ids(&deployments),
            ["c3.2", "c2.1", "c1.0"]
        );

        // Not booted into anything: only the newest two are kept
        fixture.add_commit("c1")?;
        let r = deploy_commit(&fixture, &Grub2, "c1", None)?;
        assert_eq!(r.bootversion, BootVersion::One);
        let (_, deployments) = list_deployments(&fixture.root)?;
        assert_eq!(ids(&deployments), ["c1.3", "c3.2"]);
        assert!(!fixture.root.try_exists("ostree/deploy/core/deploy/c2.1")?);
        assert!(!fixture.root.try_exists("ostree/deploy/core/deploy/c1.0")?);
        assert!(!fixture.root.try_exists("ostree/deploy/core/deploy/c1.0.origin")?);
        assert!(!fixture.root.try_exists("boot/ostree/core-c2")?);
        assert!(fixture.root.try_exists("boot/ostree/core-c1")?);

        // Serials keep increasing after the trees that used them are gone
        assert_eq!(allocate_deployserial(&fixture.root, "core")?, 4);
        fixture
            .root
            .remove_file("ostree/deploy/core/deploy-serial")?;
        assert_eq!(allocate_deployserial(&fixture.root, "core")?, 4);
        Ok(())
    }

    #[test]
    fn test_other_osnames_untouched() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Grub2)?;
        fixture.install_deployments(
            BootVersion::Zero,
            &[("other", "x1", 0), ("core", "c1", 0), ("other", "x0", 0)],
        )?;
        fixture.add_commit("c2")?;
        let r = deploy_commit(&fixture, &Grub2, "c2", None)?;
        assert!(r.changed());
        let (_, deployments) = list_deployments(&fixture.root)?;
        let names = deployments
            .iter()
            .map(|d| format!("{} {}", d.osname, d.csum))
            .collect::<Vec<_>>();
        assert_eq!(names, ["core c2", "other x1", "core c1", "other x0"]);
        Ok(())
    }

    #[test]
    fn test_first_deploy() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Grub2)?;
        fixture.add_commit("c1")?;
        let cancel = CancellationToken::new();
        let store = RepoStore::open(&fixture.root)?;
        let mut config = Config::default();
        config.deploy.kargs = Some(vec!["root=LABEL=root".into(), "rw".into()]);
        let ctx = DeployContext {
            cancel: &cancel,
            store: &store,
            bootloader: &Grub2,
            config: &config,
        };
        let state = SysrootState::load(&fixture.root, None)?;
        let mut opts = DeployOpts::new(&state, "c1");
        opts.osname = Some("core");
        // The OS name must be initialized first
        let e = deploy(&ctx, &fixture.root, opts).unwrap_err();
        assert_eq!(ErrorCode::classify(&e), ErrorCode::NotFound);

        init_osname(&fixture.root, "core")?;
        let mut opts = DeployOpts::new(&state, "c1");
        opts.osname = Some("core");
        opts.origin = Some(Origin::new_from_refspec("core/stable".parse()?));
        let r = deploy(&ctx, &fixture.root, opts)?;
        assert_eq!(r.bootversion, BootVersion::One);
        let (_, deployments) = list_deployments(&fixture.root)?;
        assert_eq!(ids(&deployments), ["c1.0"]);
        assert_eq!(
            deployments[0].bootconfig.options.as_deref(),
            Some("root=LABEL=root rw ostree=/ostree/deploy/core/deploy/c1.0")
        );
        assert_eq!(
            deployments[0].bootconfig.initrd,
            ["/ostree/core-c1/initramfs.img"]
        );
        assert_eq!(
            fixture
                .root
                .read_to_string("ostree/deploy/core/deploy/c1.0.origin")?,
            "[origin]\nrefspec=core/stable\n"
        );
        Ok(())
    }

    #[test]
    fn test_prune() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_deployments(BootVersion::Zero, &[("core", "c2", 1), ("core", "c1", 0)])?;
        // Leftovers of an interrupted deploy
        fixture.root.create_dir_all("ostree/deploy/core/deploy/c3.2/usr")?;
        fixture.root.create_dir_all("boot/ostree/core-c3")?;
        fixture.root.create_dir_all("boot/loader.1/entries")?;

        let state = SysrootState::load(&fixture.root, None)?;
        let stats = prune(&fixture.root, &state)?;
        assert_eq!(
            stats,
            PruneStats {
                deployments: 1,
                kernels: 1
            }
        );
        assert!(!fixture.root.try_exists("ostree/deploy/core/deploy/c3.2")?);
        assert!(!fixture.root.try_exists("boot/loader.1")?);
        assert!(fixture.root.try_exists("ostree/deploy/core/deploy/c1.0")?);
        assert!(fixture.root.try_exists("boot/ostree/core-c1")?);
        // Nothing left to do
        assert_eq!(prune(&fixture.root, &state)?, PruneStats::default());
        Ok(())
    }
}
