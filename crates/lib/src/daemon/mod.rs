//! # The update daemon
//!
//! A single task owns the [`UpdateStateMachine`]. Clients talk to it
//! through a [`DaemonHandle`], which forwards requests over a channel and
//! exposes the latest [`DaemonStatus`]. Jobs run one at a time on a
//! dedicated thread with their own runtime, so filesystem work never
//! blocks the daemon task; each job reports back exactly once over a
//! oneshot channel.

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

mod job;
pub use job::{execute, JobContext};
mod state;
pub use state::{
    DaemonState, DaemonStatus, Job, JobKind, JobOutput, Submission, UpdateRecord,
    UpdateStateMachine,
};

use crate::error::{Error, PreconditionError};

/// Requests queued before the daemon task pushes back on clients.
const REQUEST_QUEUE: usize = 16;

/// What became of an accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A job with this submission id was started.
    Started(u64),
    /// Nothing to do, typically because a job is already running.
    Noop,
}

#[derive(Debug)]
enum Request {
    Submit {
        kind: JobKind,
        reply: oneshot::Sender<Result<Option<u64>, PreconditionError>>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Debug)]
struct Completion {
    id: u64,
    result: Result<JobOutput>,
}

#[derive(Debug)]
struct Running {
    id: u64,
    cancel: CancellationToken,
    rx: oneshot::Receiver<Completion>,
}

/// Start a job thread for `submission`.
fn start_job(ctx: &JobContext, submission: Submission) -> Result<Running> {
    let (tx, rx) = oneshot::channel();
    let ctx = ctx.with_new_token();
    let cancel = ctx.cancel.clone();
    let id = submission.id;
    std::thread::Builder::new()
        .name(format!("osdeploy-job-{id}"))
        .spawn(move || {
            let result = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Creating job runtime")
                .and_then(|rt| rt.block_on(execute(submission.job, &ctx)));
            // Only fails if the daemon loop is gone
            let _ = tx.send(Completion { id, result });
        })
        .context("Spawning job thread")?;
    Ok(Running { id, cancel, rx })
}

async fn next_completion(running: &mut Option<Running>) -> Completion {
    let Some(r) = running.as_mut() else {
        return std::future::pending().await;
    };
    match (&mut r.rx).await {
        Ok(completion) => completion,
        Err(_) => Completion {
            id: r.id,
            result: Err(anyhow::anyhow!("Job thread exited without a result")),
        },
    }
}

fn complete(machine: &mut UpdateStateMachine, id: u64, result: Result<JobOutput>) {
    if let Err(e) = machine.complete(id, result) {
        tracing::error!("{e}; state was {}", machine.state());
        std::process::abort();
    }
}

/// The daemon loop; returns once every [`DaemonHandle`] is gone and no job
/// is running.
async fn run(
    ctx: JobContext,
    mut requests: mpsc::Receiver<Request>,
    status: watch::Sender<DaemonStatus>,
) {
    let mut machine = UpdateStateMachine::new();
    let mut running: Option<Running> = None;
    let mut open = true;
    while open || running.is_some() {
        tokio::select! {
            req = requests.recv(), if open => {
                match req {
                    Some(Request::Submit { kind, reply }) => {
                        let r = machine.request(kind);
                        let r = match r {
                            Ok(Some(submission)) => {
                                let id = submission.id;
                                match start_job(&ctx, submission) {
                                    Ok(r) => running = Some(r),
                                    Err(e) => complete(&mut machine, id, Err(e)),
                                }
                                Ok(Some(id))
                            }
                            Ok(None) => Ok(None),
                            Err(e) => Err(e),
                        };
                        status.send_replace(machine.status());
                        let _ = reply.send(r);
                    }
                    Some(Request::Cancel { reply }) => {
                        let cancelled = running.as_ref().map(|r| r.cancel.cancel()).is_some();
                        if cancelled {
                            tracing::info!("Cancelling {} job", machine.state());
                        }
                        let _ = reply.send(cancelled);
                    }
                    None => open = false,
                }
            }
            completion = next_completion(&mut running) => {
                running = None;
                complete(&mut machine, completion.id, completion.result);
                status.send_replace(machine.status());
            }
        }
    }
    tracing::debug!("Daemon exiting");
}

/// Start the daemon on the current tokio runtime.
pub fn spawn(ctx: JobContext) -> DaemonHandle {
    let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
    let (status_tx, status) = watch::channel(DaemonStatus::default());
    tokio::spawn(run(ctx, rx, status_tx));
    DaemonHandle { tx, status }
}

/// A client of a running daemon.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<Request>,
    status: watch::Receiver<DaemonStatus>,
}

impl DaemonHandle {
    async fn submit(&self, kind: JobKind) -> Result<Dispatch> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Submit { kind, reply })
            .await
            .map_err(|_| anyhow::anyhow!("Daemon is not running"))?;
        let r = rx.await.context("Waiting for daemon")?;
        match r.map_err(Error::Precondition)? {
            Some(id) => Ok(Dispatch::Started(id)),
            None => Ok(Dispatch::Noop),
        }
    }

    /// Request the pending update be deployed.
    ///
    /// Returns once the request was accepted or refused; the deploy itself
    /// is tracked through [`Self::status`].
    pub async fn apply(&self) -> Result<Dispatch> {
        self.submit(JobKind::Apply).await
    }

    /// Request a check for a newer commit.
    pub async fn poll(&self) -> Result<Dispatch> {
        self.submit(JobKind::Poll).await
    }

    /// Request the pending update's content be made local.
    pub async fn fetch(&self) -> Result<Dispatch> {
        self.submit(JobKind::Fetch).await
    }

    /// Cancel the running job, if any; returns whether there was one.
    ///
    /// A deploy that already switched boot versions still completes.
    pub async fn cancel(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Cancel { reply })
            .await
            .map_err(|_| anyhow::anyhow!("Daemon is not running"))?;
        Ok(rx.await.context("Waiting for daemon")?)
    }

    /// The latest published status.
    pub fn status(&self) -> DaemonStatus {
        self.status.borrow().clone()
    }

    /// A receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<DaemonStatus> {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::bootloader::BootloaderKind;
    use crate::deployment::{list_deployments, BootVersion};
    use crate::error::ErrorCode;
    use crate::origin::Refspec;
    use crate::store::UpdateSource;
    use crate::testutils::{Fixture, FIXTURE_REFSPEC};

    static_assertions::assert_impl_all!(DaemonHandle: Send, Sync);

    const BOOTED: &str = "root=UUID=1234 ostree=/ostree/deploy/core/deploy/c1.0 rw";

    async fn wait_for(handle: &DaemonHandle, state: DaemonState) -> Result<DaemonStatus> {
        let mut rx = handle.subscribe();
        let status = tokio::time::timeout(
            Duration::from_secs(30),
            rx.wait_for(|s| s.state == state),
        )
        .await
        .with_context(|| format!("Timed out waiting for {state}"))??
        .clone();
        Ok(status)
    }

    #[tokio::test]
    async fn test_lifecycle() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_bootloader(BootloaderKind::Syslinux)?;
        fixture.install_deployments(BootVersion::Zero, &[("core", "c1", 0)])?;
        fixture.set_ref(&FIXTURE_REFSPEC.parse()?, "c2")?;
        let handle = spawn(fixture.job_context(BOOTED)?);
        assert_eq!(handle.status(), DaemonStatus::default());

        let e = handle.apply().await.unwrap_err();
        assert_eq!(ErrorCode::classify(&e), ErrorCode::WrongState);

        assert!(matches!(handle.poll().await?, Dispatch::Started(_)));
        let status = wait_for(&handle, DaemonState::UpdateAvailable).await?;
        assert_eq!(status.commit.as_deref(), Some("c2"));
        let update_id = status.update_id;
        assert!(update_id.is_some());

        // Not fetched yet; refused without a state change
        let e = handle.apply().await.unwrap_err();
        assert_eq!(ErrorCode::classify(&e), ErrorCode::NotInitialized);
        assert_eq!(handle.status().state, DaemonState::UpdateAvailable);

        // The commit is not in the repository, so the fetch fails
        handle.fetch().await?;
        let status = wait_for(&handle, DaemonState::Error).await?;
        assert_eq!(status.error_code, ErrorCode::NotFound);
        assert!(!status.error_message.is_empty());
        assert_eq!(status.update_id, update_id);

        // Polling recovers the same update
        fixture.add_commit("c2")?;
        handle.poll().await?;
        wait_for(&handle, DaemonState::UpdateAvailable).await?;
        handle.fetch().await?;
        wait_for(&handle, DaemonState::UpdateReady).await?;
        assert_eq!(handle.fetch().await?, Dispatch::Noop);

        assert!(matches!(handle.apply().await?, Dispatch::Started(_)));
        let status = wait_for(&handle, DaemonState::UpdateApplied).await?;
        assert_eq!(status.error_code, ErrorCode::Success);
        assert_eq!(status.update_id, update_id);
        let (bootversion, deployments) = list_deployments(&fixture.root)?;
        assert_eq!(bootversion, BootVersion::One);
        let ids = deployments
            .iter()
            .map(|d| format!("{}.{}", d.csum, d.deployserial))
            .collect::<Vec<_>>();
        assert_eq!(ids, ["c2.1", "c1.0"]);

        for e in [handle.apply().await, handle.poll().await] {
            assert_eq!(ErrorCode::classify(&e.unwrap_err()), ErrorCode::Busy);
        }
        assert!(!handle.cancel().await?);
        Ok(())
    }

    /// Blocks each poll until released.
    #[derive(Debug)]
    struct GatedSource {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl UpdateSource for GatedSource {
        fn poll(&self, _refspec: &Refspec) -> Result<Option<String>> {
            let gate = self.gate.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
            gate.recv()?;
            Ok(Some("c2".into()))
        }

        fn fetch(&self, _commit: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_inflight_and_cancel() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.install_deployments(BootVersion::Zero, &[("core", "c1", 0)])?;
        let (release, gate) = std::sync::mpsc::channel();
        let mut ctx = fixture.job_context(BOOTED)?;
        ctx.source = Arc::new(GatedSource {
            gate: Mutex::new(gate),
        });
        let handle = spawn(ctx);

        let first = handle.poll().await?;
        assert!(matches!(first, Dispatch::Started(_)));
        // Accepted synchronously
        assert_eq!(handle.status().state, DaemonState::Polling);
        for r in [handle.poll().await?, handle.apply().await?, handle.fetch().await?] {
            assert_eq!(r, Dispatch::Noop);
        }

        assert!(handle.cancel().await?);
        release.send(())?;
        let status = wait_for(&handle, DaemonState::Error).await?;
        assert_eq!(status.error_code, ErrorCode::Cancelled);

        // A fresh job gets a fresh token
        let second = handle.poll().await?;
        assert_ne!(first, second);
        release.send(())?;
        let status = wait_for(&handle, DaemonState::UpdateAvailable).await?;
        assert_eq!(status.commit.as_deref(), Some("c2"));
        Ok(())
    }
}
