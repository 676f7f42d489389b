//! Running lifecycle jobs against the system root.

use std::sync::Arc;

use anyhow::Result;
use cap_std_ext::cap_std::fs::Dir;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use super::state::{Job, JobOutput, UpdateRecord};
use crate::bootloader::select_bootloader;
use crate::config::Config;
use crate::deploy::{deploy, DeployContext, DeployOpts};
use crate::deployment::SysrootState;
use crate::error::Error;
use crate::kernel_cmdline::Cmdline;
use crate::origin::Origin;
use crate::store::{ContentStore, UpdateSource};

/// Everything a job needs; cheap to clone.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Cancelled to stop the job at its next checkpoint.
    pub cancel: CancellationToken,
    /// The system root.
    pub root: Arc<Dir>,
    /// Loaded configuration.
    pub config: Arc<Config>,
    /// Where trees come from.
    pub store: Arc<dyn ContentStore>,
    /// Where updates come from.
    pub source: Arc<dyn UpdateSource>,
    /// Kernel command line identifying the booted deployment; read from
    /// `/proc/cmdline` when unset.
    pub cmdline: Option<String>,
}

impl JobContext {
    /// The same context with a fresh cancellation token.
    pub fn with_new_token(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            ..self.clone()
        }
    }

    fn load_state(&self) -> Result<SysrootState> {
        match self.cmdline.as_deref() {
            Some(cmdline) => SysrootState::load(&self.root, Some(&Cmdline::from(cmdline))),
            None => {
                let cmdline = Cmdline::from_proc()?;
                SysrootState::load(&self.root, Some(&cmdline))
            }
        }
    }
}

/// Look for a commit newer than the booted deployment (or the default one,
/// when not booted into a deployment).
#[context("Polling for updates")]
fn poll(ctx: &JobContext) -> Result<Option<UpdateRecord>> {
    let state = ctx.load_state()?;
    let current = state
        .booted()
        .or_else(|| state.deployments.first())
        .ok_or_else(|| Error::NotFound("No deployments".into()))?;
    let refspec = current
        .refspec()
        .ok_or_else(|| Error::Configuration(format!("{current} has no refspec in its origin")))?;
    let commit = ctx
        .source
        .poll(refspec)?
        .ok_or_else(|| Error::NotFound(format!("No such ref: {refspec}")))?;
    if ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled.into());
    }
    if commit == current.csum {
        tracing::info!("{current} is up to date");
        return Ok(None);
    }
    let id = uuid::Uuid::new_v4().to_string();
    tracing::info!("Found update {commit} for {refspec}");
    Ok(Some(UpdateRecord {
        id,
        commit,
        refspec: Some(refspec.clone()),
    }))
}

#[context("Applying update {}", update.commit)]
fn apply(ctx: &JobContext, update: &UpdateRecord) -> Result<JobOutput> {
    let state = ctx.load_state()?;
    let bootloader = select_bootloader(&ctx.root, ctx.config.bootloader.backend)?;
    let dctx = DeployContext {
        cancel: &ctx.cancel,
        store: ctx.store.as_ref(),
        bootloader: bootloader.as_ref(),
        config: &ctx.config,
    };
    let mut opts = DeployOpts::new(&state, &update.commit);
    if state.booted().is_none() {
        opts.osname = state.deployments.first().map(|d| d.osname.as_str());
    }
    opts.origin = update.refspec.clone().map(Origin::new_from_refspec);
    let r = deploy(&dctx, &ctx.root, opts)?;
    let changed = r.changed();
    Ok(JobOutput::Applied {
        bootversion: r.bootversion,
        changed,
        warnings: r.warnings,
    })
}

/// Run a job to completion.
pub async fn execute(job: Job, ctx: &JobContext) -> Result<JobOutput> {
    if ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled.into());
    }
    match job {
        Job::Poll => poll(ctx).map(JobOutput::Polled),
        Job::Fetch(update) => {
            ctx.source.fetch(&update.commit)?;
            if !ctx.store.has_commit(&update.commit)? {
                return Err(
                    Error::NotFound(format!("Commit {} missing after fetch", update.commit)).into(),
                );
            }
            Ok(JobOutput::Fetched)
        }
        Job::Apply(update) => apply(ctx, &update),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::BootloaderKind;
    use crate::deployment::{list_deployments, BootVersion};
    use crate::error::ErrorCode;
    use crate::testutils::{Fixture, FIXTURE_REFSPEC};

    #[tokio::test]
    async fn test_jobs() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Syslinux)?;
        fixture.install_deployments(BootVersion::Zero, &[("core", "c1", 0)])?;
        let ctx = fixture.job_context("ostree=/ostree/deploy/core/deploy/c1.0")?;

        let e = execute(Job::Poll, &ctx).await.unwrap_err();
        assert_eq!(ErrorCode::classify(&e), ErrorCode::NotFound);

        let refspec = FIXTURE_REFSPEC.parse()?;
        fixture.set_ref(&refspec, "c1")?;
        assert_eq!(execute(Job::Poll, &ctx).await?, JobOutput::Polled(None));

        fixture.set_ref(&refspec, "c2")?;
        let JobOutput::Polled(Some(update)) = execute(Job::Poll, &ctx).await? else {
            panic!("expected an update");
        };
        assert_eq!(update.commit, "c2");

        let e = execute(Job::Fetch(update.clone()), &ctx).await.unwrap_err();
        assert_eq!(ErrorCode::classify(&e), ErrorCode::NotFound);
        fixture.add_commit("c2")?;
        assert_eq!(
            execute(Job::Fetch(update.clone()), &ctx).await?,
            JobOutput::Fetched
        );

        let output = execute(Job::Apply(update.clone()), &ctx).await?;
        assert_eq!(
            output,
            JobOutput::Applied {
                bootversion: BootVersion::One,
                changed: true,
                warnings: Vec::new(),
            }
        );
        let (_, deployments) = list_deployments(&fixture.root)?;
        assert_eq!(deployments[0].csum, "c2");
        assert!(fixture
            .root
            .read_to_string("boot/loader.1/syslinux.cfg")?
            .contains("DEFAULT ostree:0"));

        // A cancelled job does nothing
        let ctx = ctx.with_new_token();
        ctx.cancel.cancel();
        let e = execute(Job::Poll, &ctx).await.unwrap_err();
        assert_eq!(ErrorCode::classify(&e), ErrorCode::Cancelled);
        Ok(())
    }
}
