//! Rendering the deployment list for `osdeploy status`.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use canon_json::CanonJsonSerialize;
use serde::{Deserialize, Serialize};

use crate::deployment::SysrootState;

const BLACK_CIRCLE: char = '●';

/// How status is written.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Aligned text for people.
    #[default]
    HumanReadable,
    /// YAML.
    Yaml,
    /// Canonical JSON.
    Json,
}

/// One deployment as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeploymentStatus {
    /// Position in the boot order; 0 boots by default.
    pub index: usize,
    /// The OS name the deployment belongs to.
    pub osname: String,
    /// The deployed commit.
    pub checksum: String,
    /// Distinguishes deployments of the same commit.
    pub deploy_serial: u32,
    /// Whether the running system was booted from this deployment.
    pub booted: bool,
    /// Where updates come from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refspec: Option<String>,
    /// Kernel arguments, minus the one selecting the deployment.
    pub kargs: String,
}

/// The state of the system root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HostStatus {
    /// The active boot version.
    pub bootversion: u32,
    /// Deployments in boot order.
    pub deployments: Vec<DeploymentStatus>,
}

impl From<&SysrootState> for HostStatus {
    fn from(state: &SysrootState) -> Self {
        let deployments = state
            .deployments
            .iter()
            .map(|d| DeploymentStatus {
                index: d.index,
                osname: d.osname.clone(),
                checksum: d.csum.clone(),
                deploy_serial: d.deployserial,
                booted: state.booted == Some(d.index),
                refspec: d.refspec().map(|r| r.to_string()),
                kargs: d.bootconfig.kargs_without_ostree(),
            })
            .collect();
        Self {
            bootversion: state.bootversion.as_u32(),
            deployments,
        }
    }
}

/// Output a row title, prefixed by spaces
fn write_row_name(mut out: impl Write, s: &str, prefix_len: usize) -> Result<()> {
    let n = prefix_len.saturating_sub(s.chars().count());
    let mut spaces = std::io::repeat(b' ').take(n as u64);
    std::io::copy(&mut spaces, &mut out)?;
    write!(out, "{s}: ")?;
    Ok(())
}

fn human_render_deployment(mut out: impl Write, d: &DeploymentStatus) -> Result<()> {
    let marker = if d.booted { BLACK_CIRCLE } else { ' ' };
    let prefix = format!("{marker} {}", d.osname);
    let prefix_len = prefix.chars().count();
    writeln!(out, "{prefix}: {}.{}", d.checksum, d.deploy_serial)?;
    if let Some(refspec) = d.refspec.as_deref() {
        write_row_name(&mut out, "Origin", prefix_len)?;
        writeln!(out, "{refspec}")?;
    }
    if !d.kargs.is_empty() {
        write_row_name(&mut out, "Kargs", prefix_len)?;
        writeln!(out, "{}", d.kargs)?;
    }
    Ok(())
}

fn human_readable_output(mut out: impl Write, host: &HostStatus) -> Result<()> {
    if host.deployments.is_empty() {
        writeln!(out, "No deployments.")?;
        return Ok(());
    }
    for (i, d) in host.deployments.iter().enumerate() {
        if i > 0 {
            writeln!(out)?;
        }
        human_render_deployment(&mut out, d)?;
    }
    Ok(())
}

/// Write `host` in `format`.
pub fn write_status(mut out: impl Write, host: &HostStatus, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => host
            .to_canon_json_writer(&mut out)
            .map_err(anyhow::Error::new),
        OutputFormat::Yaml => serde_yaml::to_writer(&mut out, host).map_err(anyhow::Error::new),
        OutputFormat::HumanReadable => human_readable_output(&mut out, host),
    }
    .context("Writing status")
}
