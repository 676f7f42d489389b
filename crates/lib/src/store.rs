//! Commit content and refs.
//!
//! Fetching content is someone else's job; by the time a commit is
//! deployed its tree is expected under `ostree/repo/commits/<csum>`, and
//! refs under `ostree/repo/refs` name the commit each branch points at.

use std::ops::ControlFlow;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::{CapStdExtDirExt, WalkConfiguration};
use fn_error_context::context;
use regex::Regex;

use crate::error::Error;
use crate::origin::Refspec;

/// The repository, relative to the system root.
pub const REPO_DIR: &str = "ostree/repo";
const COMMITS_DIR: &str = "commits";
const REFS_HEADS: &str = "refs/heads";
const REFS_REMOTES: &str = "refs/remotes";

/// Source of deployable trees.
pub trait ContentStore: std::fmt::Debug + Send + Sync {
    /// Whether the content of `commit` is available locally.
    fn has_commit(&self, commit: &str) -> Result<bool>;

    /// Check out the tree of `commit` as the new directory `name` in `dest`.
    ///
    /// Fails with [`Error::NotFound`] if the commit was not fetched.
    fn materialize_tree(&self, commit: &str, dest: &Dir, name: &str) -> Result<()>;
}

/// Produces update candidates for the daemon.
pub trait UpdateSource: std::fmt::Debug + Send + Sync {
    /// The commit `refspec` currently points at, if it exists.
    fn poll(&self, refspec: &Refspec) -> Result<Option<String>>;

    /// Make the content of `commit` available to the [`ContentStore`].
    fn fetch(&self, commit: &str) -> Result<()>;
}

/// Validate a commit checksum before using it as a path component.
pub fn validate_checksum(csum: &str) -> Result<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[0-9A-Za-z]+$").unwrap());
    if !re.is_match(csum) {
        anyhow::bail!("Invalid commit checksum: {csum:?}");
    }
    Ok(())
}

/// Recursively copy the contents of `src` into `dest`.
///
/// Directory modes are applied last, deepest first, so read-only
/// directories can still be populated.
fn copy_tree(src: &Dir, dest: &Dir) -> Result<()> {
    let mut dir_modes = Vec::new();
    src.walk(&WalkConfiguration::default().noxdev(), |e| -> Result<_> {
        let path = e.path;
        if e.file_type.is_dir() {
            dest.create_dir(path)?;
            dir_modes.push((path.to_owned(), e.entry.metadata()?.permissions()));
        } else if e.file_type.is_symlink() {
            let target = e.dir.read_link_contents(e.filename)?;
            dest.symlink_contents(target, path)?;
        } else if e.file_type.is_file() {
            e.dir.copy(e.filename, dest, path)?;
        } else {
            tracing::debug!("Skipping special file {path:?}");
        }
        Ok(ControlFlow::Continue(()))
    })?;
    for (path, perms) in dir_modes.into_iter().rev() {
        dest.set_permissions(&path, perms)?;
    }
    Ok(())
}

/// A repository inside the system root.
#[derive(Debug)]
pub struct RepoStore {
    repo: Dir,
}

impl RepoStore {
    /// Open the repository of the system root.
    #[context("Opening repository")]
    pub fn open(root: &Dir) -> Result<Self> {
        let repo = root
            .open_dir_optional(REPO_DIR)?
            .ok_or_else(|| Error::Configuration(format!("Missing {REPO_DIR}")))?;
        Ok(Self { repo })
    }

    fn ref_path(refspec: &Refspec) -> Utf8PathBuf {
        match refspec.remote.as_deref() {
            Some(remote) => Utf8PathBuf::from(REFS_REMOTES).join(remote).join(&refspec.branch),
            None => Utf8PathBuf::from(REFS_HEADS).join(&refspec.branch),
        }
    }

    /// Resolve a refspec to a commit.
    #[context("Resolving {refspec}")]
    pub fn resolve_ref(&self, refspec: &Refspec) -> Result<Option<String>> {
        let path = Self::ref_path(refspec);
        let Some(mut f) = self.repo.open_optional(&path)? else {
            return Ok(None);
        };
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut f, &mut buf)?;
        let csum = buf.trim();
        validate_checksum(csum).with_context(|| format!("Reading {path}"))?;
        Ok(Some(csum.to_owned()))
    }

    /// Point `refspec` at `commit`.
    #[context("Writing ref {refspec}")]
    pub fn set_ref(&self, refspec: &Refspec, commit: &str) -> Result<()> {
        validate_checksum(commit)?;
        let path = Self::ref_path(refspec);
        if let Some(parent) = path.parent() {
            self.repo.create_dir_all(parent)?;
        }
        self.repo.atomic_write(&path, format!("{commit}\n"))?;
        Ok(())
    }
}

impl ContentStore for RepoStore {
    fn has_commit(&self, commit: &str) -> Result<bool> {
        validate_checksum(commit)?;
        let path = format!("{COMMITS_DIR}/{commit}");
        Ok(self.repo.symlink_metadata_optional(&path)?.is_some_and(|m| m.is_dir()))
    }

    #[context("Checking out {commit}")]
    fn materialize_tree(&self, commit: &str, dest: &Dir, name: &str) -> Result<()> {
        if !self.has_commit(commit)? {
            return Err(Error::NotFound(format!("Commit {commit} has not been fetched")).into());
        }
        let src = self.repo.open_dir(format!("{COMMITS_DIR}/{commit}"))?;
        // A leftover from an interrupted checkout
        dest.remove_all_optional(name)?;
        dest.create_dir(name)?;
        copy_tree(&src, &dest.open_dir(name)?)?;
        Ok(())
    }
}

/// An [`UpdateSource`] over the refs of a [`RepoStore`].
#[derive(Debug)]
pub struct RepoUpdateSource {
    store: RepoStore,
}

impl RepoUpdateSource {
    /// Use the repository of the system root.
    pub fn open(root: &Dir) -> Result<Self> {
        Ok(Self {
            store: RepoStore::open(root)?,
        })
    }
}

impl UpdateSource for RepoUpdateSource {
    fn poll(&self, refspec: &Refspec) -> Result<Option<String>> {
        self.store.resolve_ref(refspec)
    }

    fn fetch(&self, commit: &str) -> Result<()> {
        if !self.store.has_commit(commit)? {
            return Err(Error::NotFound(format!("Commit {commit} is not available")).into());
        }
        Ok(())
    }
}
