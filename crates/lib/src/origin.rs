//! The per-deployment origin document.
//!
//! This is a keyfile (`[section]` headers followed by `key=value` lines)
//! recording how a deployment was produced. Only `origin.refspec` is
//! interpreted; every other key is carried through untouched, in the
//! order it was read.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::{Context, Result};

/// The section holding the refspec.
pub const ORIGIN_SECTION: &str = "origin";
/// The refspec key inside [`ORIGIN_SECTION`].
pub const REFSPEC_KEY: &str = "refspec";

/// A `remote:branch` reference; the remote is optional.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Refspec {
    /// The remote name, if any.
    pub remote: Option<String>,
    /// The branch name.
    pub branch: String,
}

/// Refs are stored as paths below the repository, so every `/`-separated
/// component must name a regular entry.
fn valid_ref_path(s: &str) -> bool {
    s.split('/').all(|c| !matches!(c, "" | "." | ".."))
}

impl FromStr for Refspec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (remote, branch) = match s.split_once(':') {
            Some((remote, branch)) => {
                if remote.contains('/') || !valid_ref_path(remote) {
                    anyhow::bail!("Invalid refspec {s}: bad remote name");
                }
                (Some(remote.to_owned()), branch)
            }
            None => (None, s),
        };
        if !valid_ref_path(branch) {
            anyhow::bail!("Invalid refspec {s}: bad branch name");
        }
        Ok(Self {
            remote,
            branch: branch.to_owned(),
        })
    }
}

impl Display for Refspec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.remote.as_deref() {
            Some(remote) => write!(f, "{remote}:{}", self.branch),
            None => f.write_str(&self.branch),
        }
    }
}

/// A parsed origin document.
pub struct Origin {
    refspec: Option<Refspec>,
    /// The whole document, `origin.refspec` included.
    keyfile: tini::Ini,
}

/// Append every section and key of `from` onto `into`; keys already in
/// `into` are replaced in place.
fn layer(mut into: tini::Ini, from: &tini::Ini) -> tini::Ini {
    for (section, items) in from.iter() {
        into = into.section(section.to_string());
        for (key, value) in items.iter() {
            into = into.item(key.to_string(), value.to_string());
        }
    }
    into
}

impl Origin {
    /// Create an origin tracking the given refspec.
    pub fn new_from_refspec(refspec: Refspec) -> Self {
        let keyfile = tini::Ini::new()
            .section(ORIGIN_SECTION)
            .item(REFSPEC_KEY, refspec.to_string());
        Self {
            refspec: Some(refspec),
            keyfile,
        }
    }

    /// Parse keyfile text.
    pub fn parse(input: &str) -> Result<Self> {
        let keyfile = tini::Ini::from_string(input).context("Parsing origin keyfile")?;
        let refspec = keyfile
            .get::<String>(ORIGIN_SECTION, REFSPEC_KEY)
            .map(|r| r.parse::<Refspec>())
            .transpose()?;
        Ok(Self { refspec, keyfile })
    }

    /// The refspec updates are tracked from.
    pub fn refspec(&self) -> Option<&Refspec> {
        self.refspec.as_ref()
    }

    /// Look up a raw value.
    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        self.keyfile.get(section, key)
    }

    /// Set a raw value; `origin.refspec` is validated.
    pub fn set(&mut self, section: &str, key: &str, value: &str) -> Result<()> {
        if section == ORIGIN_SECTION && key == REFSPEC_KEY {
            self.refspec = Some(value.parse()?);
        }
        let keyfile = std::mem::replace(&mut self.keyfile, tini::Ini::new());
        self.keyfile = keyfile.section(section).item(key, value);
        Ok(())
    }

    /// Produce a new origin where every key set in `self` wins, and
    /// everything else is inherited from `base`.
    pub fn merged_onto(&self, base: &Origin) -> Origin {
        let keyfile = layer(layer(tini::Ini::new(), &base.keyfile), &self.keyfile);
        Origin {
            refspec: self.refspec.clone().or_else(|| base.refspec.clone()),
            keyfile,
        }
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self {
            refspec: None,
            keyfile: tini::Ini::new(),
        }
    }
}

impl Clone for Origin {
    fn clone(&self) -> Self {
        Self {
            refspec: self.refspec.clone(),
            keyfile: layer(tini::Ini::new(), &self.keyfile),
        }
    }
}

impl PartialEq for Origin {
    fn eq(&self, other: &Self) -> bool {
        self.refspec == other.refspec && self.to_string() == other.to_string()
    }
}

impl Eq for Origin {}

impl std::fmt::Debug for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Origin")
            .field("refspec", &self.refspec)
            .field("keyfile", &self.to_string())
            .finish()
    }
}

/// Written in keyfile style (`key=value`), sections separated by a blank line.
impl Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (section, items)) in self.keyfile.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{section}]")?;
            for (key, value) in items.iter() {
                writeln!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}
