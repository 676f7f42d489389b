//! See <https://uapi-group.org/specifications/specs/boot_loader_specification/>
//!
//! Each boot version's `entries` directory holds one loader entry per
//! deployment; this module reads and writes them.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::iter::once;
use std::str::FromStr;

use anyhow::{Context, Result};
use uapi_version::Version;

use crate::kernel_cmdline::{Cmdline, OSTREE_KARG};

/// A loader entry file.
///
/// Entries sort by `sort-key`, then `machine-id`, each only when both sides
/// carry it, and finally by `version`, highest first.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct BLSConfig {
    /// Menu title.
    pub title: Option<String>,
    /// Raw version string; see [`Self::version()`].
    version: String,
    /// Kernel path, relative to the boot partition.
    pub linux: String,
    /// Initramfs paths, in load order.
    pub initrd: Vec<String>,
    /// Kernel command line.
    pub options: Option<String>,
    /// Machine ID of the installed OS.
    pub machine_id: Option<String>,
    /// Menu sort key.
    pub sort_key: Option<String>,
    /// Keys this crate does not interpret, kept for rendering.
    pub extra: BTreeMap<String, String>,
}

fn cmp_if_both(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

fn optional<'a>(key: &'a str, value: &'a Option<String>) -> Option<(&'a str, &'a str)> {
    value.as_deref().map(|v| (key, v))
}

impl PartialOrd for BLSConfig {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BLSConfig {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_if_both(&self.sort_key, &other.sort_key)
            .then_with(|| cmp_if_both(&self.machine_id, &other.machine_id))
            .then_with(|| other.version().cmp(&self.version()))
    }
}

impl BLSConfig {
    /// The parsed version of this entry.
    pub fn version(&self) -> Version {
        Version::from(&self.version)
    }

    /// Set the version; ordinal versions are used to encode list position.
    pub fn set_version(&mut self, version: impl Into<String>) {
        self.version = version.into();
    }

    /// The deployment path from the `ostree=` kernel argument.
    pub fn ostree_path(&self) -> Option<String> {
        let options = self.options.as_deref()?;
        let cmdline = Cmdline::from(options);
        let r = cmdline.value_of_utf8(OSTREE_KARG).map(ToOwned::to_owned);
        r
    }

    /// Kernel arguments excluding `ostree=`.
    pub fn kargs_without_ostree(&self) -> String {
        let options = self.options.as_deref().unwrap_or_default();
        let cmdline = Cmdline::from(options);
        let r = cmdline.without_key(OSTREE_KARG);
        r
    }

    /// Key/value lines in the order they are written out.
    fn lines(&self) -> impl Iterator<Item = (&str, &str)> {
        optional("title", &self.title)
            .into_iter()
            .chain(once(("version", self.version.as_str())))
            .chain(once(("linux", self.linux.as_str())))
            .chain(self.initrd.iter().map(|v| ("initrd", v.as_str())))
            .chain(optional("options", &self.options))
            .chain(optional("machine-id", &self.machine_id))
            .chain(optional("sort-key", &self.sort_key))
            .chain(self.extra.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

impl Display for BLSConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (key, value) in self.lines() {
            writeln!(f, "{key} {value}")?;
        }
        Ok(())
    }
}

impl FromStr for BLSConfig {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        let mut config = Self::default();
        let mut linux = None;
        let mut version = None;
        let pairs = input
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| line.split_once(char::is_whitespace));
        for (key, value) in pairs {
            let value = value.trim().to_owned();
            match key {
                "linux" => linux = Some(value),
                "version" => version = Some(value),
                "title" => config.title = Some(value),
                "initrd" => config.initrd.push(value),
                "options" => config.options = Some(value),
                "machine-id" => config.machine_id = Some(value),
                "sort-key" => config.sort_key = Some(value),
                _ => {
                    config.extra.insert(key.to_owned(), value);
                }
            }
        }
        config.linux = linux.context("Missing 'linux' value")?;
        config.version = version.context("Missing 'version' value")?;
        Ok(config)
    }
}

/// Parse the text of a loader entry.
pub fn parse_bls_config(input: &str) -> Result<BLSConfig> {
    input.parse()
}
