//! Helpers intended for [`std::process::Command`].

use std::io::{Read, Seek};
use std::process::Command;

use anyhow::{Context, Result};

/// Render a command line in a form that could be pasted into a POSIX shell.
pub fn command_to_string(cmd: &Command) -> String {
    let args = std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    shlex::try_join(args.iter().map(|s| s.as_str())).unwrap_or_else(|_| args.join(" "))
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process; on failure the error includes
    /// the captured stderr.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process, returning its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;
}

fn stderr_excerpt(mut f: std::fs::File) -> String {
    const MAX_STDERR_BYTES: u64 = 1024;
    let mut buf = String::new();
    if f.seek(std::io::SeekFrom::Start(0)).is_ok() {
        let _ = f.take(MAX_STDERR_BYTES).read_to_string(&mut buf);
    }
    buf.trim_end().to_owned()
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", command_to_string(self));
        self
    }

    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile().context("Allocating stderr buffer")?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {}", command_to_string(self));
        let st = self.status()?;
        if !st.success() {
            let msg = stderr_excerpt(stderr);
            anyhow::bail!("Subprocess failed: {st:?}\n{msg}");
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        self.stdout(std::process::Stdio::piped());
        let stderr = tempfile::tempfile().context("Allocating stderr buffer")?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {}", command_to_string(self));
        let output = self.output()?;
        if !output.status.success() {
            let msg = stderr_excerpt(stderr);
            anyhow::bail!("Subprocess failed: {:?}\n{msg}", output.status);
        }
        String::from_utf8(output.stdout).context("Parsing subprocess output as UTF-8")
    }
}
