//! zipl, the s390x boot loader.
//!
//! Unlike the other backends, zipl does not read its configuration at boot
//! time. The `zipl` tool has to be re-run against the active configuration
//! to rewrite the boot record, so this backend is not atomic: a stamp file
//! records that a configuration was written but not yet installed.

use std::process::Command;

use anyhow::Result;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::cmdext::CapStdExtCommandExt;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use osdeploy_utils::CommandRunExt;

use super::{open_slot, write_slot_file, Bootloader};
use crate::deployment::{BootVersion, Deployment, LOADER_LINK};

/// The marker directory, relative to the system root.
pub(crate) const ZIPL_DIR: &str = "boot/zipl";
/// The config file in each slot.
pub(crate) const ZIPL_CONF: &str = "zipl.conf";
/// Present while a written configuration awaits installation.
pub(crate) const ZIPL_STAMP: &str = "boot/ostree-bootloader-update.stamp";

/// The zipl backend.
#[derive(Debug, Clone)]
pub struct Zipl {
    command: String,
}

impl Default for Zipl {
    fn default() -> Self {
        Self {
            command: "zipl".into(),
        }
    }
}

impl Zipl {
    /// Use `command` instead of `zipl` to install the boot record.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

fn render_zipl_conf(deployments: &[Deployment]) -> String {
    let mut out = String::from("[defaultboot]\ndefaultauto\nprompt=1\ntimeout=5\ntarget=/boot\n");
    for deployment in deployments {
        let config = &deployment.bootconfig;
        out.push_str(&format!("\n[ostree-{}]\n", deployment.index));
        out.push_str(&format!("image=/boot{}\n", config.linux));
        if let Some(initrd) = config.initrd.first() {
            out.push_str(&format!("ramdisk=/boot{initrd}\n"));
        }
        if let Some(options) = config.options.as_deref() {
            out.push_str(&format!("parameters=\"{options}\"\n"));
        }
    }
    out
}

impl Bootloader for Zipl {
    fn query(&self, root: &Dir) -> Result<bool> {
        Ok(root
            .symlink_metadata_optional(ZIPL_DIR)?
            .is_some_and(|m| m.is_dir()))
    }

    fn name(&self) -> &'static str {
        "zipl"
    }

    #[context("Writing zipl config for boot version {bootversion}")]
    fn write_config(
        &self,
        root: &Dir,
        bootversion: BootVersion,
        deployments: &[Deployment],
    ) -> Result<()> {
        let slot = open_slot(root, bootversion)?;
        write_slot_file(&slot, ZIPL_CONF, &render_zipl_conf(deployments))?;
        root.atomic_write(ZIPL_STAMP, b"")?;
        Ok(())
    }

    #[context("Installing zipl boot record")]
    fn post_bls_sync(&self, root: &Dir, bootversion: BootVersion) -> Result<()> {
        if !root.try_exists(ZIPL_STAMP)? {
            tracing::debug!("No pending zipl update");
            return Ok(());
        }
        let config = format!("{LOADER_LINK}/{ZIPL_CONF}");
        tracing::debug!("Running {} for boot version {bootversion}", self.command);
        Command::new(&self.command)
            .args(["--config", config.as_str()])
            .cwd_dir(root.try_clone()?)
            .log_debug()
            .run()?;
        root.remove_file(ZIPL_STAMP)?;
        Ok(())
    }

    fn is_atomic(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::BootloaderKind;
    use crate::deployment::list_deployments;
    use crate::testutils::Fixture;

    #[test]
    fn test_write_and_sync() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Zipl)?;
        fixture.install_deployments(BootVersion::Zero, &[("core", "c1", 0)])?;
        let (_, deployments) = list_deployments(&fixture.root)?;

        let zipl = Zipl::with_command("true");
        zipl.write_config(&fixture.root, BootVersion::One, &deployments)?;
        let written = fixture.root.read_to_string("boot/loader.1/zipl.conf")?;
        similar_asserts::assert_eq!(
            written,
            indoc::indoc! { r#"
                [defaultboot]
                defaultauto
                prompt=1
                timeout=5
                target=/boot

                [ostree-0]
                image=/boot/ostree/core-c1/vmlinuz
                ramdisk=/boot/ostree/core-c1/initramfs.img
                parameters="rw ostree=/ostree/deploy/core/deploy/c1.0"
            "#}
        );
        assert!(fixture.root.try_exists(ZIPL_STAMP)?);

        zipl.post_bls_sync(&fixture.root, BootVersion::One)?;
        assert!(!fixture.root.try_exists(ZIPL_STAMP)?);
        // Nothing pending is a no-op
        Zipl::with_command("false").post_bls_sync(&fixture.root, BootVersion::One)?;
        Ok(())
    }

    #[test]
    fn test_failed_install_keeps_stamp() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Zipl)?;
        Zipl::default().write_config(&fixture.root, BootVersion::One, &[])?;
        let zipl = Zipl::with_command("false");
        assert!(zipl.post_bls_sync(&fixture.root, BootVersion::One).is_err());
        assert!(fixture.root.try_exists(ZIPL_STAMP)?);
        Ok(())
    }
}
