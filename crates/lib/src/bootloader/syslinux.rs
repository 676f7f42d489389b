//! syslinux/extlinux, driven by a generated `syslinux.cfg`.

use std::fmt::Write as _;

use anyhow::Result;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use super::{open_slot, write_slot_file, Bootloader};
use crate::deployment::{BootVersion, Deployment};

/// The path syslinux reads, relative to the system root.
pub(crate) const SYSLINUX_CFG_PATH: &str = "boot/syslinux/syslinux.cfg";
/// The config file in each slot.
pub(crate) const SYSLINUX_CFG: &str = "syslinux.cfg";

/// The syslinux backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct Syslinux;

fn label(index: usize) -> String {
    format!("ostree:{index}")
}

/// Render the configuration for a deployment list.
pub(crate) fn render_syslinux_cfg(deployments: &[Deployment]) -> Result<String> {
    let mut out = String::from("PROMPT 0\nTIMEOUT 50\n");
    if let Some(first) = deployments.first() {
        writeln!(out, "DEFAULT {}", label(first.index))?;
    }
    for deployment in deployments {
        let config = &deployment.bootconfig;
        writeln!(out)?;
        writeln!(out, "LABEL {}", label(deployment.index))?;
        if let Some(title) = config.title.as_deref() {
            writeln!(out, "\tMENU LABEL {title}")?;
        }
        writeln!(out, "\tKERNEL {}", config.linux)?;
        if !config.initrd.is_empty() {
            writeln!(out, "\tINITRD {}", config.initrd.join(","))?;
        }
        if let Some(options) = config.options.as_deref() {
            writeln!(out, "\tAPPEND {options}")?;
        }
    }
    Ok(out)
}

impl Bootloader for Syslinux {
    fn query(&self, root: &Dir) -> Result<bool> {
        Ok(root.symlink_metadata_optional(SYSLINUX_CFG_PATH)?.is_some())
    }

    fn name(&self) -> &'static str {
        "syslinux"
    }

    #[context("Writing syslinux config for boot version {bootversion}")]
    fn write_config(
        &self,
        root: &Dir,
        bootversion: BootVersion,
        deployments: &[Deployment],
    ) -> Result<()> {
        let contents = render_syslinux_cfg(deployments)?;
        let slot = open_slot(root, bootversion)?;
        write_slot_file(&slot, SYSLINUX_CFG, &contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::list_deployments;
    use crate::testutils::Fixture;

    #[test]
    fn test_write_config() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_deployments(BootVersion::One, &[("core", "c2", 1), ("other", "x1", 0)])?;
        let (_, deployments) = list_deployments(&fixture.root)?;

        Syslinux.write_config(&fixture.root, BootVersion::Zero, &deployments)?;
        let written = fixture.root.read_to_string("boot/loader.0/syslinux.cfg")?;
        let expected = indoc::indoc! { "
            PROMPT 0
            TIMEOUT 50
            DEFAULT ostree:0

            LABEL ostree:0
            \tMENU LABEL core c2 (ostree:0)
            \tKERNEL /ostree/core-c2/vmlinuz
            \tINITRD /ostree/core-c2/initramfs.img
            \tAPPEND rw ostree=/ostree/deploy/core/deploy/c2.1

            LABEL ostree:1
            \tMENU LABEL other x1 (ostree:1)
            \tKERNEL /ostree/other-x1/vmlinuz
            \tINITRD /ostree/other-x1/initramfs.img
            \tAPPEND rw ostree=/ostree/deploy/other/deploy/x1.0
        "};
        similar_asserts::assert_eq!(written, expected);
        Ok(())
    }

    #[test]
    fn test_empty() -> Result<()> {
        assert_eq!(render_syslinux_cfg(&[])?, "PROMPT 0\nTIMEOUT 50\n");
        Ok(())
    }
}
