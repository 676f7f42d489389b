//! The on-disk deployment model.
//!
//! A system root holds two boot versions (`boot/loader.0` and
//! `boot/loader.1`); the `boot/loader` symlink selects the active one.
//! Each boot version holds one loader entry per deployment, and the
//! entry's `ostree=` kernel argument points at the deployment tree
//! under `ostree/deploy/<osname>/deploy/<csum>.<serial>`.
//!
//! Everything in here is read-only; mutation lives in [`crate::deploy`].

use std::fmt::Display;
use std::io::Read;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use regex::Regex;

use crate::error::Error;
use crate::kernel_cmdline::{Cmdline, OSTREE_KARG};
use crate::origin::Origin;
use crate::parsers::bls_config::{parse_bls_config, BLSConfig};

/// The boot directory, relative to the system root.
pub const BOOT_DIR: &str = "boot";
/// The ostree directory, relative to the system root.
pub const OSTREE_DIR: &str = "ostree";
/// The symlink selecting the active boot version.
pub const LOADER_LINK: &str = "boot/loader";
/// Where kernels and initramfs images are copied, relative to `boot/`.
pub const KERNELS_DIR: &str = "ostree";
/// Name of the per-slot directory holding loader entries.
pub const ENTRIES_DIR: &str = "entries";
/// Kernel image name inside a deployment's kernel directory.
pub const VMLINUZ: &str = "vmlinuz";
/// Initramfs image name inside a deployment's kernel directory.
pub const INITRAMFS: &str = "initramfs.img";

/// One of the two double-buffered boot configuration slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BootVersion {
    /// `boot/loader.0`
    #[default]
    Zero,
    /// `boot/loader.1`
    One,
}

impl BootVersion {
    /// The other slot.
    pub fn inactive(self) -> Self {
        match self {
            BootVersion::Zero => BootVersion::One,
            BootVersion::One => BootVersion::Zero,
        }
    }

    /// Numeric value of this slot.
    pub fn as_u32(self) -> u32 {
        match self {
            BootVersion::Zero => 0,
            BootVersion::One => 1,
        }
    }

    /// Name of the slot directory, relative to `boot/`.
    pub fn loader_dir_name(self) -> &'static str {
        match self {
            BootVersion::Zero => "loader.0",
            BootVersion::One => "loader.1",
        }
    }

    /// Path of the slot directory, relative to the system root.
    pub fn loader_dir(self) -> Utf8PathBuf {
        Utf8Path::new(BOOT_DIR).join(self.loader_dir_name())
    }

    /// Path of the slot's loader entries, relative to the system root.
    pub fn entries_dir(self) -> Utf8PathBuf {
        self.loader_dir().join(ENTRIES_DIR)
    }

    fn from_loader_dir_name(name: &str) -> Option<Self> {
        match name {
            "loader.0" => Some(BootVersion::Zero),
            "loader.1" => Some(BootVersion::One),
            _ => None,
        }
    }
}

impl Display for BootVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// A deployment: a checked-out tree plus its origin and boot entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    /// Position in the boot version's list; 0 boots by default.
    pub index: usize,
    /// The OS name (stateroot).
    pub osname: String,
    /// Content checksum of the commit the tree was made from.
    pub csum: String,
    /// Disambiguates deployments of the same checksum.
    pub deployserial: u32,
    /// The loader entry.
    pub bootconfig: BLSConfig,
    /// How this deployment was produced, if recorded.
    pub origin: Option<Origin>,
}

impl Deployment {
    /// Whether `other` refers to the same tree on disk.
    pub fn same_as(&self, other: &Deployment) -> bool {
        self.osname == other.osname
            && self.csum == other.csum
            && self.deployserial == other.deployserial
    }

    /// The deployment tree, relative to the system root.
    pub fn path(&self) -> Utf8PathBuf {
        deployment_path(&self.osname, &self.csum, self.deployserial)
    }

    /// The origin file, relative to the system root.
    pub fn origin_path(&self) -> Utf8PathBuf {
        origin_path(&self.osname, &self.csum, self.deployserial)
    }

    /// The kernel directory, relative to `boot/`.
    pub fn kernel_dir(&self) -> Utf8PathBuf {
        kernel_dir(&self.osname, &self.csum)
    }

    /// The refspec recorded in the origin, if any.
    pub fn refspec(&self) -> Option<&crate::origin::Refspec> {
        self.origin.as_ref().and_then(|o| o.refspec())
    }
}

impl Display for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}.{}", self.osname, self.csum, self.deployserial)
    }
}

/// The deploy directory for an OS name, relative to the system root.
pub fn osname_dir(osname: &str) -> Utf8PathBuf {
    Utf8Path::new(OSTREE_DIR).join("deploy").join(osname)
}

/// The directory holding all trees for an OS name, relative to the system root.
pub fn osname_deploy_dir(osname: &str) -> Utf8PathBuf {
    osname_dir(osname).join("deploy")
}

/// A deployment tree, relative to the system root.
pub fn deployment_path(osname: &str, csum: &str, serial: u32) -> Utf8PathBuf {
    osname_deploy_dir(osname).join(format!("{csum}.{serial}"))
}

/// A deployment's origin file, relative to the system root.
pub fn origin_path(osname: &str, csum: &str, serial: u32) -> Utf8PathBuf {
    osname_deploy_dir(osname).join(format!("{csum}.{serial}.origin"))
}

/// A deployment's kernel directory, relative to `boot/`.
pub fn kernel_dir(osname: &str, csum: &str) -> Utf8PathBuf {
    Utf8Path::new(KERNELS_DIR).join(format!("{osname}-{csum}"))
}

/// Name of the loader entry for the deployment at `index`.
pub fn entry_filename(index: usize, osname: &str) -> String {
    format!("ostree-{}-{osname}.conf", index + 1)
}

/// The value of the `ostree=` kernel argument for a deployment.
pub fn ostree_karg_value(osname: &str, csum: &str, serial: u32) -> String {
    format!("/{}", deployment_path(osname, csum, serial))
}

/// Validate a name used as a path component for an OS name.
pub fn validate_osname(osname: &str) -> Result<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]*$").unwrap());
    if !re.is_match(osname) || osname == "." || osname == ".." {
        anyhow::bail!("Invalid OS name: {osname:?}");
    }
    Ok(())
}

/// Split a deployment directory name into checksum and serial.
pub fn parse_deployment_dirname(name: &str) -> Option<(&str, u32)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^([0-9A-Za-z]+)\.([0-9]+)$").unwrap());
    let caps = re.captures(name)?;
    let csum = caps.get(1)?.as_str();
    let serial = caps.get(2)?.as_str().parse().ok()?;
    Some((csum, serial))
}

/// Split an `ostree=` value into OS name, checksum and serial.
pub fn parse_ostree_karg(value: &str) -> Option<(&str, &str, u32)> {
    let rest = value.trim_end_matches('/').strip_prefix("/ostree/deploy/")?;
    let (osname, rest) = rest.split_once('/')?;
    let dirname = rest.strip_prefix("deploy/")?;
    if osname.is_empty() || dirname.contains('/') {
        return None;
    }
    let (csum, serial) = parse_deployment_dirname(dirname)?;
    Some((osname, csum, serial))
}

/// Read the active boot version from the `boot/loader` symlink.
///
/// A missing link means nothing was ever deployed, which is boot version 0.
#[context("Reading boot version")]
pub fn read_current_bootversion(root: &Dir) -> Result<BootVersion> {
    let Some(meta) = root.symlink_metadata_optional(LOADER_LINK)? else {
        return Ok(BootVersion::Zero);
    };
    if !meta.file_type().is_symlink() {
        return Err(Error::Configuration(format!("{LOADER_LINK} is not a symbolic link")).into());
    }
    let target = root.read_link(LOADER_LINK)?;
    target
        .to_str()
        .and_then(BootVersion::from_loader_dir_name)
        .ok_or_else(|| {
            Error::Configuration(format!("{LOADER_LINK} has unexpected target {target:?}")).into()
        })
}

fn read_origin(root: &Dir, path: &Utf8Path) -> Result<Option<Origin>> {
    let Some(mut f) = root.open_optional(path)? else {
        return Ok(None);
    };
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    let origin = Origin::parse(&buf).with_context(|| format!("Parsing {path}"))?;
    Ok(Some(origin))
}

fn deployment_from_bootconfig(root: &Dir, index: usize, bootconfig: BLSConfig) -> Result<Deployment> {
    let karg = bootconfig.ostree_path().ok_or_else(|| {
        Error::Configuration(format!("Boot entry {index} has no {OSTREE_KARG}= argument"))
    })?;
    let (osname, csum, deployserial) = parse_ostree_karg(&karg)
        .ok_or_else(|| Error::Configuration(format!("Invalid {OSTREE_KARG}={karg}")))?;
    let (osname, csum) = (osname.to_owned(), csum.to_owned());
    let origin = read_origin(root, &origin_path(&osname, &csum, deployserial))?;
    Ok(Deployment {
        index,
        osname,
        csum,
        deployserial,
        bootconfig,
        origin,
    })
}

/// Load the ordered loader entries of one boot version.
#[context("Reading loader entries for boot version {bootversion}")]
pub fn read_bootconfigs(root: &Dir, bootversion: BootVersion) -> Result<Vec<BLSConfig>> {
    let Some(entries) = root.open_dir_optional(bootversion.entries_dir())? else {
        return Ok(Vec::new());
    };
    let mut configs = Vec::new();
    for ent in entries.entries()? {
        let ent = ent?;
        let name = ent.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.ends_with(".conf") || !ent.file_type()?.is_file() {
            continue;
        }
        let buf = entries.read_to_string(name)?;
        let config = parse_bls_config(&buf).with_context(|| format!("Parsing {name}"))?;
        configs.push(config);
    }
    configs.sort();
    Ok(configs)
}

/// Return the active boot version and its ordered deployment list.
#[context("Listing deployments")]
pub fn list_deployments(root: &Dir) -> Result<(BootVersion, Vec<Deployment>)> {
    for d in [BOOT_DIR, OSTREE_DIR] {
        if !root.try_exists(d)? {
            return Err(Error::Configuration(format!("Missing {d}/ in system root")).into());
        }
    }
    let bootversion = read_current_bootversion(root)?;
    let deployments = read_bootconfigs(root, bootversion)?
        .into_iter()
        .enumerate()
        .map(|(i, config)| deployment_from_bootconfig(root, i, config))
        .collect::<Result<Vec<_>>>()?;
    tracing::debug!(
        "Boot version {bootversion} has {} deployments",
        deployments.len()
    );
    Ok((bootversion, deployments))
}

/// Find the deployment the running kernel was booted from.
pub fn find_booted_deployment<'d>(
    deployments: &'d [Deployment],
    cmdline: &Cmdline,
) -> Result<Option<&'d Deployment>> {
    let Some(karg) = cmdline.value_of_utf8(OSTREE_KARG) else {
        return Ok(None);
    };
    let (osname, csum, serial) = parse_ostree_karg(karg)
        .ok_or_else(|| Error::Configuration(format!("Invalid {OSTREE_KARG}={karg}")))?;
    deployments
        .iter()
        .find(|d| d.osname == osname && d.csum == csum && d.deployserial == serial)
        .map(Some)
        .ok_or_else(|| {
            Error::Configuration(format!("{OSTREE_KARG}={karg} is not a known deployment")).into()
        })
}

/// Pick the deployment whose local configuration seeds a new deploy of
/// `osname`: the booted one if it matches, else the first with that name.
pub fn get_merge_deployment<'d>(
    deployments: &'d [Deployment],
    osname: &str,
    booted: Option<&'d Deployment>,
) -> Option<&'d Deployment> {
    if let Some(booted) = booted.filter(|b| b.osname == osname) {
        return Some(booted);
    }
    deployments.iter().find(|d| d.osname == osname)
}

/// Resolve the OS name to operate on: the caller's, which must exist on
/// disk, or otherwise the booted deployment's.
pub fn require_deployment_or_osname(
    root: &Dir,
    osname: Option<&str>,
    booted: Option<&Deployment>,
) -> Result<String> {
    match (osname, booted) {
        (Some(osname), _) => {
            validate_osname(osname)?;
            if !root.try_exists(osname_dir(osname))? {
                return Err(Error::NotFound(format!("No such OS name: {osname}")).into());
            }
            Ok(osname.to_owned())
        }
        (None, Some(booted)) => Ok(booted.osname.clone()),
        (None, None) => Err(Error::NotFound(
            "Not booted into a deployment and no OS name specified".into(),
        )
        .into()),
    }
}

/// A snapshot of the system root.
#[derive(Debug)]
pub struct SysrootState {
    /// The active boot version.
    pub bootversion: BootVersion,
    /// Its ordered deployments.
    pub deployments: Vec<Deployment>,
    /// Index of the booted deployment in `deployments`.
    pub booted: Option<usize>,
}

impl SysrootState {
    /// Load the deployment list, matching the booted deployment against
    /// `cmdline` when one is given.
    pub fn load(root: &Dir, cmdline: Option<&Cmdline>) -> Result<Self> {
        let (bootversion, deployments) = list_deployments(root)?;
        let booted = match cmdline {
            Some(cmdline) => find_booted_deployment(&deployments, cmdline)?.map(|d| d.index),
            None => None,
        };
        Ok(Self {
            bootversion,
            deployments,
            booted,
        })
    }

    /// The booted deployment, if any.
    pub fn booted(&self) -> Option<&Deployment> {
        self.booted.and_then(|i| self.deployments.get(i))
    }
}
