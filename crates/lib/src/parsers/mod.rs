//! Parsers for boot configuration formats.

pub mod bls_config;
pub mod grub_menuconfig;
