//! Configuration loaded from TOML drop-in fragments.
//!
//! Fragments are `*.toml` files in `usr/lib/osdeploy/config.d` and
//! `etc/osdeploy/config.d` below the system root. They are merged in
//! lexical order of file name; a file in `etc` replaces a same-named file
//! in `usr/lib`, and for each key the last fragment setting it wins.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::bootloader::BootloaderKind;
use crate::error::Error;

/// Directories searched for fragments, relative to the system root, in
/// ascending priority.
const CONFIG_BASES: &[&str] = &["usr/lib", "etc"];
/// Shared subpath of each base directory.
const CONFIG_SUBDIR: &str = "osdeploy/config.d";

/// How many deployments of an OS name are kept by default, including the
/// new one.
pub const DEFAULT_RETAIN: usize = 2;

/// The `[deploy]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DeployConfig {
    /// Deployments of the same OS name kept after a deploy.
    pub retain: Option<usize>,
    /// Kernel arguments for a deployment with nothing to inherit from.
    pub kargs: Option<Vec<String>>,
}

/// The `[bootloader]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BootloaderConfig {
    /// Use this backend instead of probing the system root.
    pub backend: Option<BootloaderKind>,
}

/// The merged configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Deployment settings.
    #[serde(default)]
    pub deploy: DeployConfig,
    /// Bootloader settings.
    #[serde(default)]
    pub bootloader: BootloaderConfig,
}

impl Config {
    /// Apply every value set in `other` on top of `self`.
    fn merge(&mut self, other: Config) {
        let Config { deploy, bootloader } = other;
        if deploy.retain.is_some() {
            self.deploy.retain = deploy.retain;
        }
        if deploy.kargs.is_some() {
            self.deploy.kargs = deploy.kargs;
        }
        if bootloader.backend.is_some() {
            self.bootloader.backend = bootloader.backend;
        }
    }

    /// The effective retention count; never below 1.
    pub fn retain(&self) -> usize {
        self.deploy.retain.unwrap_or(DEFAULT_RETAIN).max(1)
    }

    /// The default kernel arguments, joined.
    pub fn default_kargs(&self) -> String {
        self.deploy.kargs.as_deref().unwrap_or_default().join(" ")
    }
}

/// Parse a single fragment.
pub fn parse_config(input: &str) -> Result<Config> {
    toml::from_str(input).map_err(|e| Error::Configuration(e.to_string()).into())
}

/// Load and merge all fragments below `sysroot`.
#[context("Loading configuration")]
pub fn load_config(sysroot: &Utf8Path) -> Result<Config> {
    let bases = CONFIG_BASES.iter().map(|b| sysroot.join(b));
    let fragments = liboverdrop::scan(bases, CONFIG_SUBDIR, &["toml"], true);
    let mut config = Config::default();
    for (_name, path) in fragments {
        let buf = std::fs::read_to_string(&path)
            .with_context(|| format!("Reading {}", path.display()))?;
        let fragment = parse_config(&buf).with_context(|| format!("Parsing {}", path.display()))?;
        tracing::debug!("Loaded config fragment {}", path.display());
        config.merge(fragment);
    }
    Ok(config)
}
