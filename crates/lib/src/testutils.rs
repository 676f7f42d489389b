//! Synthetic system roots for unit tests.

use std::sync::Arc;

use anyhow::Result;
use camino::Utf8PathBuf;
use cap_std_ext::cap_std::{self, fs::Dir};

use crate::bootloader::BootloaderKind;
use crate::config::Config;
use crate::daemon::JobContext;
use crate::deploy::{new_bootconfig, swap_bootversion, write_bootconfigs};
use crate::deployment::{
    deployment_path, kernel_dir, origin_path, osname_deploy_dir, BootVersion, Deployment,
    BOOT_DIR, INITRAMFS, VMLINUZ,
};
use crate::origin::{Origin, Refspec};
use crate::store::{RepoStore, RepoUpdateSource, REPO_DIR};

/// The refspec recorded in the origin of every installed deployment.
pub(crate) const FIXTURE_REFSPEC: &str = "origin:core/stable";

/// A system root in a temporary directory.
#[derive(Debug)]
pub(crate) struct Fixture {
    _tempdir: tempfile::TempDir,
    pub(crate) path: Utf8PathBuf,
    pub(crate) root: Dir,
}

impl Fixture {
    /// An empty root, as left by an installer before the first deploy.
    pub(crate) fn new() -> Result<Self> {
        let tempdir = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(tempdir.path().to_owned())?;
        let root = Dir::open_ambient_dir(&path, cap_std::ambient_authority())?;
        root.create_dir_all(BOOT_DIR)?;
        root.create_dir_all(format!("{REPO_DIR}/commits"))?;
        root.create_dir_all("ostree/deploy")?;
        Ok(Self {
            _tempdir: tempdir,
            path,
            root,
        })
    }

    /// Lay out deployments `(osname, csum, serial)` in list order and make
    /// `bootversion` active with them. Kernel arguments are `rw`.
    pub(crate) fn install_deployments(
        &self,
        bootversion: BootVersion,
        deployments: &[(&str, &str, u32)],
    ) -> Result<()> {
        let mut list = Vec::new();
        for &(osname, csum, serial) in deployments {
            self.root.create_dir_all(osname_deploy_dir(osname))?;
            self.root
                .create_dir_all(deployment_path(osname, csum, serial).join("usr"))?;
            let origin = Origin::new_from_refspec(FIXTURE_REFSPEC.parse()?);
            self.root
                .write(origin_path(osname, csum, serial), origin.to_string())?;
            let kdir = camino::Utf8Path::new(BOOT_DIR).join(kernel_dir(osname, csum));
            self.root.create_dir_all(&kdir)?;
            self.root.write(kdir.join(VMLINUZ), format!("kernel-{csum}"))?;
            self.root
                .write(kdir.join(INITRAMFS), format!("initramfs-{csum}"))?;
            list.push(Deployment {
                index: list.len(),
                osname: osname.to_owned(),
                csum: csum.to_owned(),
                deployserial: serial,
                bootconfig: new_bootconfig(osname, csum, serial, "rw", true),
                origin: Some(origin),
            });
        }
        write_bootconfigs(&self.root, bootversion, &mut list)?;
        swap_bootversion(&self.root, bootversion)?;
        Ok(())
    }

    /// Make the root look like `kind` was installed.
    pub(crate) fn install_bootloader(&self, kind: BootloaderKind) -> Result<()> {
        kind.install_marker(&self.root)
    }

    /// Add a fetched commit whose tree ships a single kernel.
    pub(crate) fn add_commit(&self, csum: &str) -> Result<()> {
        let modules = format!("{REPO_DIR}/commits/{csum}/usr/lib/modules/6.1.0");
        self.root.create_dir_all(&modules)?;
        self.root
            .write(format!("{modules}/{VMLINUZ}"), format!("kernel-{csum}"))?;
        self.root
            .write(format!("{modules}/{INITRAMFS}"), format!("initramfs-{csum}"))?;
        self.root.create_dir_all(format!("{REPO_DIR}/commits/{csum}/etc"))?;
        self.root
            .write(format!("{REPO_DIR}/commits/{csum}/etc/hostname"), "fixture\n")?;
        Ok(())
    }

    /// Point a ref at a commit.
    pub(crate) fn set_ref(&self, refspec: &Refspec, csum: &str) -> Result<()> {
        RepoStore::open(&self.root)?.set_ref(refspec, csum)
    }

    /// A job context over this root, booted with `cmdline`.
    pub(crate) fn job_context(&self, cmdline: &str) -> Result<JobContext> {
        Ok(JobContext {
            cancel: tokio_util::sync::CancellationToken::new(),
            root: Arc::new(self.root.try_clone()?),
            config: Arc::new(Config::default()),
            store: Arc::new(RepoStore::open(&self.root)?),
            source: Arc::new(RepoUpdateSource::open(&self.root)?),
            cmdline: Some(cmdline.to_owned()),
        })
    }
}
