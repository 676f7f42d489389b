//! Bootloader backends.
//!
//! Every backend writes its configuration into a boot version's slot
//! directory (`boot/loader.N`). Its well-known configuration path is a
//! symlink through `boot/loader`, so flipping that link switches the
//! bootloader to the new configuration in one step.

use anyhow::Result;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::deployment::{BootVersion, Deployment};
use crate::error::Error;

mod grub2;
pub use grub2::Grub2;
mod syslinux;
pub use syslinux::Syslinux;
mod zipl;
pub use zipl::Zipl;

/// A bootloader family that can be made to boot a deployment list.
pub trait Bootloader: std::fmt::Debug + Send + Sync {
    /// Whether this bootloader controls booting of `root`.
    ///
    /// Not being active is a normal result; only unexpected I/O fails.
    fn query(&self, root: &Dir) -> Result<bool>;

    /// Stable identifier, used in logs and configuration.
    fn name(&self) -> &'static str;

    /// Write the full configuration describing `deployments` into the
    /// slot of `bootversion`, which must not be the active one.
    fn write_config(
        &self,
        root: &Dir,
        bootversion: BootVersion,
        deployments: &[Deployment],
    ) -> Result<()>;

    /// Finalization run once `bootversion` has become active.
    fn post_bls_sync(&self, _root: &Dir, _bootversion: BootVersion) -> Result<()> {
        Ok(())
    }

    /// Whether [`Self::write_config`] plus the slot flip is crash-atomic
    /// on its own.
    fn is_atomic(&self) -> bool {
        true
    }
}

/// The known bootloader families.
#[derive(
    clap::ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum BootloaderKind {
    /// GRUB 2, via a generated menu
    Grub2,
    /// syslinux/extlinux
    Syslinux,
    /// The s390x zipl boot loader
    Zipl,
}

impl BootloaderKind {
    /// Every known family, in detection order.
    pub const ALL: [BootloaderKind; 3] = [
        BootloaderKind::Grub2,
        BootloaderKind::Syslinux,
        BootloaderKind::Zipl,
    ];

    /// Create the backend for this family.
    pub fn backend(self) -> Box<dyn Bootloader> {
        match self {
            BootloaderKind::Grub2 => Box::new(Grub2),
            BootloaderKind::Syslinux => Box::new(Syslinux),
            BootloaderKind::Zipl => Box::new(Zipl::default()),
        }
    }

    /// Set up `root` the way an installer for this family would.
    #[cfg(test)]
    pub(crate) fn install_marker(self, root: &Dir) -> Result<()> {
        let (path, target) = match self {
            BootloaderKind::Grub2 => (grub2::GRUB2_CFG_PATH, grub2::GRUB_CFG),
            BootloaderKind::Syslinux => (syslinux::SYSLINUX_CFG_PATH, syslinux::SYSLINUX_CFG),
            BootloaderKind::Zipl => {
                root.create_dir_all(zipl::ZIPL_DIR)?;
                return Ok(());
            }
        };
        let path = camino::Utf8Path::new(path);
        if let Some(parent) = path.parent() {
            root.create_dir_all(parent)?;
        }
        root.symlink(format!("../loader/{target}"), path)?;
        Ok(())
    }
}

/// Write `contents` to `name` in `slot` and make the file durable.
pub(crate) fn write_slot_file(slot: &Dir, name: &str, contents: &str) -> Result<()> {
    slot.atomic_write(name, contents.as_bytes())?;
    slot.open(name)?.sync_all()?;
    Ok(())
}

/// Open the slot directory of an inactive boot version, creating it.
pub(crate) fn open_slot(root: &Dir, bootversion: BootVersion) -> Result<Dir> {
    let path = bootversion.loader_dir();
    root.create_dir_all(&path)?;
    Ok(root.open_dir(&path)?)
}

/// Find the bootloader that controls `root`.
///
/// With `configured` set, that backend is used without probing.
/// Otherwise exactly one backend must report itself active.
#[context("Selecting bootloader")]
pub fn select_bootloader(
    root: &Dir,
    configured: Option<BootloaderKind>,
) -> Result<Box<dyn Bootloader>> {
    if let Some(kind) = configured {
        let backend = kind.backend();
        tracing::debug!("Using configured bootloader {}", backend.name());
        return Ok(backend);
    }
    let mut active = Vec::new();
    for kind in BootloaderKind::ALL {
        let backend = kind.backend();
        if backend.query(root)? {
            active.push(backend);
        }
    }
    match active.len() {
        0 => Err(Error::Configuration("No supported bootloader detected".into()).into()),
        1 => {
            let backend = active.remove(0);
            tracing::debug!("Detected bootloader {}", backend.name());
            Ok(backend)
        }
        _ => {
            let names = active.iter().map(|b| b.name()).collect::<Vec<_>>();
            Err(Error::Configuration(format!(
                "Multiple bootloaders detected: {}",
                names.join(", ")
            ))
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::testutils::Fixture;

    #[test]
    fn test_query_exclusive() -> Result<()> {
        for configured in BootloaderKind::ALL {
            let fixture = Fixture::new()?;
            fixture.install_bootloader(configured)?;
            for kind in BootloaderKind::ALL {
                assert_eq!(
                    kind.backend().query(&fixture.root)?,
                    kind == configured,
                    "{configured:?} root queried by {kind:?}"
                );
            }
            let selected = select_bootloader(&fixture.root, None)?;
            assert_eq!(selected.name(), configured.backend().name());
        }
        Ok(())
    }

    #[test]
    fn test_select_none_or_many() -> Result<()> {
        let fixture = Fixture::new()?;
        let e = select_bootloader(&fixture.root, None).unwrap_err();
        assert_eq!(ErrorCode::classify(&e), ErrorCode::Configuration);

        fixture.install_bootloader(BootloaderKind::Grub2)?;
        fixture.install_bootloader(BootloaderKind::Zipl)?;
        let e = select_bootloader(&fixture.root, None).unwrap_err();
        assert_eq!(ErrorCode::classify(&e), ErrorCode::Configuration);
        assert!(format!("{e:#}").contains("grub2, zipl"));

        // An explicit choice skips detection
        let b = select_bootloader(&fixture.root, Some(BootloaderKind::Syslinux))?;
        assert_eq!(b.name(), "syslinux");
        Ok(())
    }

    #[test]
    fn test_defaults() {
        assert!(Grub2.is_atomic());
        assert!(Syslinux.is_atomic());
        assert!(!Zipl::default().is_atomic());
    }
}
