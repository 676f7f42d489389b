//! GRUB 2: a generated menu with one `menuentry` per deployment.

use anyhow::{Context, Result};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use super::{open_slot, write_slot_file, Bootloader};
use crate::deployment::{BootVersion, Deployment};
use crate::parsers::grub_menuconfig::{parse_grub_menuentry_file, MenuEntry};

/// The path grub reads, relative to the system root; a symlink to
/// [`GRUB_CFG`] through `boot/loader`.
pub(crate) const GRUB2_CFG_PATH: &str = "boot/grub2/grub.cfg";
/// Directory holding per-vendor EFI grub configs.
const EFI_DIR: &str = "boot/efi/EFI";
/// The config file in each slot.
pub(crate) const GRUB_CFG: &str = "grub.cfg";

const HEADER: &str = indoc::indoc! { r#"
    # Generated by osdeploy; do not edit
    set default=0
    set timeout=5
    if [ -f ${config_directory}/user.cfg ]; then
      source ${config_directory}/user.cfg
    fi
"#};

/// The GRUB 2 backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct Grub2;

fn has_efi_grub_cfg(root: &Dir) -> Result<bool> {
    let Some(efi) = root.open_dir_optional(EFI_DIR)? else {
        return Ok(false);
    };
    for ent in efi.entries()? {
        let ent = ent?;
        if !ent.file_type()?.is_dir() {
            continue;
        }
        let vendor = ent.open_dir()?;
        if vendor.try_exists(GRUB_CFG)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Render the menu for a deployment list.
pub(crate) fn render_grub_cfg(deployments: &[Deployment]) -> String {
    let mut out = String::from(HEADER);
    for deployment in deployments {
        out.push('\n');
        out.push_str(&MenuEntry::for_deployment(deployment).to_string());
    }
    out
}

impl Bootloader for Grub2 {
    fn query(&self, root: &Dir) -> Result<bool> {
        if root.symlink_metadata_optional(GRUB2_CFG_PATH)?.is_some() {
            return Ok(true);
        }
        has_efi_grub_cfg(root)
    }

    fn name(&self) -> &'static str {
        "grub2"
    }

    #[context("Writing grub2 config for boot version {bootversion}")]
    fn write_config(
        &self,
        root: &Dir,
        bootversion: BootVersion,
        deployments: &[Deployment],
    ) -> Result<()> {
        let contents = render_grub_cfg(deployments);
        // Round-trip through the parser so a malformed menu never reaches a slot
        let entries = parse_grub_menuentry_file(&contents).context("Validating generated menu")?;
        if entries.len() != deployments.len() {
            anyhow::bail!(
                "Generated {} menu entries for {} deployments",
                entries.len(),
                deployments.len()
            );
        }
        let slot = open_slot(root, bootversion)?;
        write_slot_file(&slot, GRUB_CFG, &contents)?;
        tracing::debug!("Wrote {} grub menu entries", entries.len());
        Ok(())
    }
}
