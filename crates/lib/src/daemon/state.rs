//! The update lifecycle as a pure state machine.
//!
//! Nothing in here performs I/O; the daemon loop feeds requests and job
//! completions through [`UpdateStateMachine`] and runs whatever job it
//! hands back.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::deployment::BootVersion;
use crate::error::{Error, ErrorCode, PreconditionError};
use crate::origin::Refspec;

/// Where the daemon is in the update lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonState {
    /// Idle, no update known.
    #[default]
    Ready,
    /// Checking for an update.
    Polling,
    /// An update was found but its content is not local yet.
    UpdateAvailable,
    /// Making the update's content local.
    Fetching,
    /// The update can be applied.
    UpdateReady,
    /// Deploying the update.
    Applying,
    /// The update will boot next; nothing more happens until a reboot.
    UpdateApplied,
    /// The last job failed.
    Error,
}

impl DaemonState {
    /// Whether a job is running in this state.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            DaemonState::Polling | DaemonState::Fetching | DaemonState::Applying
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            DaemonState::Ready => "ready",
            DaemonState::Polling => "polling",
            DaemonState::UpdateAvailable => "update-available",
            DaemonState::Fetching => "fetching",
            DaemonState::UpdateReady => "update-ready",
            DaemonState::Applying => "applying",
            DaemonState::UpdateApplied => "update-applied",
            DaemonState::Error => "error",
        }
    }
}

impl Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An update being tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    /// Identifies this update to clients.
    pub id: String,
    /// The commit to deploy.
    pub commit: String,
    /// The refspec the commit was found on.
    pub refspec: Option<Refspec>,
}

/// The lifecycle operations a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Look for an update.
    Poll,
    /// Make an update's content local.
    Fetch,
    /// Deploy an update.
    Apply,
}

/// Work for a job thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Look for an update.
    Poll,
    /// Fetch this update.
    Fetch(UpdateRecord),
    /// Deploy this update.
    Apply(UpdateRecord),
}

/// A job handed out by [`UpdateStateMachine::request`]; its result must be
/// passed to [`UpdateStateMachine::complete`] exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Unique per state machine.
    pub id: u64,
    /// What to run.
    pub job: Job,
}

/// What a successful job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    /// The update found, or `None` if already up to date.
    Polled(Option<UpdateRecord>),
    /// The update content is local.
    Fetched,
    /// The deploy finished.
    Applied {
        /// The boot version active afterwards.
        bootversion: BootVersion,
        /// Whether a new boot version was activated.
        changed: bool,
        /// Problems after the swap; the update is applied regardless.
        warnings: Vec<String>,
    },
}

/// A snapshot of daemon state for clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonStatus {
    /// The lifecycle state.
    pub state: DaemonState,
    /// The tracked update, if any.
    pub update_id: Option<String>,
    /// The tracked update's commit, if any.
    pub commit: Option<String>,
    /// Outcome of the last job; [`ErrorCode::Success`] unless in [`DaemonState::Error`].
    pub error_code: ErrorCode,
    /// Empty on success.
    pub error_message: String,
    /// Non-fatal problems from applying the update.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// The update lifecycle.
#[derive(Debug, Default)]
pub struct UpdateStateMachine {
    state: DaemonState,
    update: Option<UpdateRecord>,
    fetched: bool,
    error: Option<(ErrorCode, String)>,
    warnings: Vec<String>,
    in_flight: Option<(u64, JobKind)>,
    last_submission: u64,
}

impl UpdateStateMachine {
    /// Start out ready with nothing tracked.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current state.
    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// The id of the job in flight, if any.
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight.map(|(id, _)| id)
    }

    /// A snapshot for clients.
    pub fn status(&self) -> DaemonStatus {
        let (error_code, error_message) = self.error.clone().unwrap_or_default();
        DaemonStatus {
            state: self.state,
            update_id: self.update.as_ref().map(|u| u.id.clone()),
            commit: self.update.as_ref().map(|u| u.commit.clone()),
            error_code,
            error_message,
            warnings: self.warnings.clone(),
        }
    }

    fn pending_update(&self) -> Result<UpdateRecord, PreconditionError> {
        self.update
            .clone()
            .ok_or(PreconditionError::NoUpdateAvailable)
    }

    /// Check a request against the current state.
    ///
    /// `Ok(None)` is a benign no-op, such as a request while a job is
    /// already running. `Ok(Some(_))` means the state moved to the
    /// matching in-progress state and the job must be run. Refusals leave
    /// the state untouched.
    pub fn request(&mut self, kind: JobKind) -> Result<Option<Submission>, PreconditionError> {
        use DaemonState as S;
        if self.state.is_busy() {
            tracing::info!("Ignoring {kind:?} request, already {}", self.state);
            return Ok(None);
        }
        let (job, next) = match (kind, self.state) {
            (_, S::UpdateApplied) => return Err(PreconditionError::AwaitingReboot),
            (JobKind::Poll, _) => (Job::Poll, S::Polling),
            (JobKind::Fetch, S::UpdateAvailable) => (Job::Fetch(self.pending_update()?), S::Fetching),
            (JobKind::Fetch, S::UpdateReady) => {
                tracing::info!("Update already fetched");
                return Ok(None);
            }
            (JobKind::Apply, S::UpdateReady) => (Job::Apply(self.pending_update()?), S::Applying),
            (JobKind::Apply, S::UpdateAvailable) => return Err(PreconditionError::NotFetched),
            (JobKind::Fetch | JobKind::Apply, _) => {
                return Err(PreconditionError::NoUpdateAvailable)
            }
        };
        self.last_submission += 1;
        let id = self.last_submission;
        tracing::info!("{} -> {next} (submission {id})", self.state);
        self.state = next;
        self.in_flight = Some((id, kind));
        self.warnings.clear();
        Ok(Some(Submission { id, job }))
    }

    /// Fold a job result back into the state.
    ///
    /// A completion that does not match the job in flight is a
    /// [`Error::ConsistencyFault`]; the state is left untouched.
    pub fn complete(&mut self, id: u64, result: anyhow::Result<JobOutput>) -> Result<(), Error> {
        let kind = match self.in_flight {
            Some((in_flight, kind)) if in_flight == id => kind,
            _ => return Err(Error::ConsistencyFault(id)),
        };
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let code = ErrorCode::classify(&e);
                tracing::warn!("{kind:?} failed: {e:#}");
                self.in_flight = None;
                self.state = DaemonState::Error;
                self.error = Some((code, format!("{e:#}")));
                return Ok(());
            }
        };
        let next = match (kind, output) {
            (JobKind::Poll, JobOutput::Polled(None)) => {
                self.update = None;
                self.fetched = false;
                DaemonState::Ready
            }
            (JobKind::Poll, JobOutput::Polled(Some(found))) => {
                match self.update.as_ref() {
                    Some(known) if known.commit == found.commit => {}
                    _ => {
                        self.update = Some(found);
                        self.fetched = false;
                    }
                }
                if self.fetched {
                    DaemonState::UpdateReady
                } else {
                    DaemonState::UpdateAvailable
                }
            }
            (JobKind::Fetch, JobOutput::Fetched) => {
                self.fetched = true;
                DaemonState::UpdateReady
            }
            (
                JobKind::Apply,
                JobOutput::Applied {
                    bootversion,
                    changed,
                    warnings,
                },
            ) => {
                if !changed {
                    tracing::info!("Boot version {bootversion} unchanged, update was already deployed");
                }
                self.warnings = warnings;
                DaemonState::UpdateApplied
            }
            _ => return Err(Error::ConsistencyFault(id)),
        };
        tracing::info!("{} -> {next} (submission {id})", self.state);
        self.in_flight = None;
        self.error = None;
        self.state = next;
        Ok(())
    }
}
