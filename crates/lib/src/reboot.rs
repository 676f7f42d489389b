//! Handling of system restarts/reboot

use std::{io::Write, process::Command};

use fn_error_context::context;
use osdeploy_utils::CommandRunExt;

/// Initiate a system reboot into the new default deployment.
/// This function will only return in case of error.
#[context("Initiating reboot")]
pub(crate) fn reboot() -> anyhow::Result<()> {
    // Flush output streams
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    Command::new("systemd-run")
        .args([
            "--quiet",
            "--",
            "systemctl",
            "reboot",
            "--message=Initiated by osdeploy",
        ])
        .log_debug()
        .run()?;
    // We expect to be terminated via SIGTERM here; exiting instead would
    // race with the caller seeing us get killed.
    tracing::debug!("Initiated reboot, sleeping");
    loop {
        std::thread::park();
    }
}
