//! # Transactional OS deployment manager
//!
//! This crate manages immutable operating system trees ("deployments")
//! on a system root and keeps the bootloader configuration in sync with
//! them, flipping between two boot versions so that a crash at any point
//! leaves either the old or the new deployment list bootable.

pub mod bootloader;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod deploy;
pub mod deployment;
pub mod error;
pub mod kernel_cmdline;
pub mod origin;
pub mod parsers;
mod reboot;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod testutils;
