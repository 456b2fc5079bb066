//! Public API types for the in-process verification engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inventory::RecordInventory;
use crate::ledger::Ledger;
use crate::mailbox::MailboxClient;
use crate::provider::Provider;
use crate::proxy::ProxyPool;

/// Unique identifier of a verification job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of the user a job runs on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a submission chooses its candidate record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSelector {
    /// Claim the next available record.
    Any,
    /// Claim one specific record by identity key (`FIRST|LAST|start-date`).
    Key(String),
}

/// Lifecycle state of a verification job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Accepted; resources claimed, not yet submitted.
    Pending,
    /// Submitting the record to the provider.
    Submitting,
    /// Waiting for the provider's decision on the submission.
    AwaitingProviderDecision,
    /// Waiting for the out-of-band confirmation code.
    AwaitingOutOfBand,
    /// Relaying the confirmation code to the provider.
    Confirming,
    /// Terminal: the provider accepted the record.
    Succeeded,
    /// Terminal: failed (provider rejection or exhausted retries).
    Failed,
    /// Terminal: a phase deadline elapsed without a provider answer.
    TimedOut,
    /// Terminal: cancelled on external request.
    Cancelled,
}

impl JobState {
    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut | JobState::Cancelled
        )
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Submitting => "submitting",
            JobState::AwaitingProviderDecision => "awaiting provider decision",
            JobState::AwaitingOutOfBand => "awaiting out-of-band code",
            JobState::Confirming => "confirming",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed out",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// Terminal result of a verification job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TerminalResult {
    /// The provider accepted the record.
    Success,
    /// The job failed; the reason is preserved verbatim.
    Failed {
        /// Human-readable failure reason.
        reason: String,
    },
    /// A phase deadline elapsed before the provider answered.
    TimedOut {
        /// The phase whose deadline elapsed.
        phase: String,
    },
    /// The job was cancelled on external request.
    Cancelled,
}

impl TerminalResult {
    /// The terminal [`JobState`] this result maps to.
    pub fn state(&self) -> JobState {
        match self {
            TerminalResult::Success => JobState::Succeeded,
            TerminalResult::Failed { .. } => JobState::Failed,
            TerminalResult::TimedOut { .. } => JobState::TimedOut,
            TerminalResult::Cancelled => JobState::Cancelled,
        }
    }

    /// Human-readable one-line description.
    pub fn describe(&self) -> String {
        match self {
            TerminalResult::Success => "verification succeeded".to_string(),
            TerminalResult::Failed { reason } => format!("verification failed: {reason}"),
            TerminalResult::TimedOut { phase } => format!("timed out waiting for {phase}"),
            TerminalResult::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Point-in-time view of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Job identifier.
    pub job_id: JobId,
    /// Owning user.
    pub user_id: UserId,
    /// Identity key of the claimed record.
    pub record_key: String,
    /// Display name of the candidate.
    pub candidate: String,
    /// Current state.
    pub state: JobState,
    /// Optional state detail (tracking handle, failure reason, …).
    pub detail: Option<String>,
    /// `host:port` of the currently held proxy, if any.
    pub proxy: Option<String>,
    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
    /// When the job last transitioned.
    pub updated_at: DateTime<Utc>,
}

/// Result of a completed job, as published to consumers and the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Job identifier.
    pub job_id: JobId,
    /// Owning user.
    pub user_id: UserId,
    /// Identity key of the claimed record.
    pub record_key: String,
    /// Display name of the candidate.
    pub candidate: String,
    /// Terminal result.
    pub result: TerminalResult,
    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
    /// When the job reached its terminal state.
    pub completed_at: DateTime<Utc>,
    /// Total wall-clock duration (milliseconds).
    pub duration_ms: u64,
}

/// Engine event stream payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine started.
    Started,
    /// Engine is stopping (graceful shutdown requested).
    StopRequested,
    /// A submission passed admission and a record was claimed.
    JobAccepted {
        /// Job identifier.
        job_id: JobId,
        /// Owning user.
        user_id: UserId,
        /// Identity key of the claimed record.
        record_key: String,
    },
    /// A job moved to a new non-terminal state.
    JobTransition {
        /// Job identifier.
        job_id: JobId,
        /// Owning user.
        user_id: UserId,
        /// New state.
        state: JobState,
        /// Optional state detail.
        detail: Option<String>,
    },
    /// A job reached a terminal state. Published exactly once per job.
    JobFinished {
        /// Job outcome.
        outcome: JobOutcome,
    },
    /// A non-fatal problem (ledger write failure, job task panic, …).
    Warning {
        /// Warning message.
        message: String,
    },
    /// Engine stopped (no live jobs remain).
    Stopped,
}

/// Why a submission was rejected at admission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitRejected {
    /// The user already has a non-terminal job.
    #[error("user already has a running job ({job_id})")]
    UserBusy {
        /// The user's live job.
        job_id: JobId,
    },
    /// The global concurrency cap is reached.
    #[error("concurrency cap of {cap} reached")]
    CapacityExhausted {
        /// Configured cap.
        cap: usize,
    },
    /// No available records remain.
    #[error("record inventory is empty")]
    InventoryEmpty,
    /// The requested record is not available (unknown or already consumed).
    #[error("record {key:?} is not available")]
    RecordUnavailable {
        /// The requested identity key.
        key: String,
    },
    /// The user's daily quota is spent.
    #[error("daily quota of {limit} reached")]
    QuotaExhausted {
        /// Configured per-user daily limit.
        limit: u32,
    },
    /// The claimed record could not be durably marked consumed.
    #[error("inventory error: {0}")]
    Inventory(String),
    /// The engine is shutting down (or has stopped).
    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Current engine state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Whether the engine has been asked to stop.
    pub stop_requested: bool,
    /// Live (non-terminal) jobs, ordered by job id.
    pub live: Vec<JobSnapshot>,
    /// Recently completed jobs (newest last).
    pub recent: Vec<JobOutcome>,
}

/// Configuration for the in-process engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global concurrency cap: live jobs beyond this are rejected.
    pub parallel: usize,

    /// Per-user terminal jobs allowed per UTC day. `0` disables the check.
    pub daily_quota: u32,

    /// Submit-phase attempt cap.
    pub submit_attempts: u32,

    /// Decision-phase fault cap (transient errors and proxy rotations).
    pub poll_attempts: u32,

    /// Out-of-band phase mailbox transport fault cap.
    pub oob_attempts: u32,

    /// Base delay of the submit backoff schedule.
    pub backoff_base: Duration,

    /// Multiplier of the submit backoff schedule.
    pub backoff_multiplier: f64,

    /// Upper bound on a single backoff delay.
    pub backoff_cap: Duration,

    /// Interval between provider decision polls.
    pub poll_interval: Duration,

    /// Deadline for the provider decision phase.
    pub decision_deadline: Duration,

    /// Interval between mailbox polls.
    pub oob_poll_interval: Duration,

    /// Deadline for the out-of-band confirmation phase.
    pub oob_deadline: Duration,

    /// Maximum number of completed jobs retained in the snapshot.
    pub recent_jobs_max: usize,
}

impl EngineConfig {
    /// Default submit-phase attempt cap.
    pub const DEFAULT_SUBMIT_ATTEMPTS: u32 = 5;
    /// Default decision-phase fault cap.
    pub const DEFAULT_POLL_ATTEMPTS: u32 = 5;
    /// Default out-of-band transport fault cap.
    pub const DEFAULT_OOB_ATTEMPTS: u32 = 5;
    /// Default backoff base delay.
    pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);
    /// Default backoff multiplier.
    pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
    /// Default backoff delay cap.
    pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);
    /// Default decision poll interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
    /// Default decision-phase deadline.
    pub const DEFAULT_DECISION_DEADLINE: Duration = Duration::from_secs(120);
    /// Default mailbox poll interval.
    pub const DEFAULT_OOB_POLL_INTERVAL: Duration = Duration::from_secs(10);
    /// Default out-of-band deadline.
    pub const DEFAULT_OOB_DEADLINE: Duration = Duration::from_secs(300);
    /// Default size of the recent-jobs ring buffer.
    pub const DEFAULT_RECENT_JOBS_MAX: usize = 100;
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: 4,
            daily_quota: 0,
            submit_attempts: Self::DEFAULT_SUBMIT_ATTEMPTS,
            poll_attempts: Self::DEFAULT_POLL_ATTEMPTS,
            oob_attempts: Self::DEFAULT_OOB_ATTEMPTS,
            backoff_base: Self::DEFAULT_BACKOFF_BASE,
            backoff_multiplier: Self::DEFAULT_BACKOFF_MULTIPLIER,
            backoff_cap: Self::DEFAULT_BACKOFF_CAP,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            decision_deadline: Self::DEFAULT_DECISION_DEADLINE,
            oob_poll_interval: Self::DEFAULT_OOB_POLL_INTERVAL,
            oob_deadline: Self::DEFAULT_OOB_DEADLINE,
            recent_jobs_max: Self::DEFAULT_RECENT_JOBS_MAX,
        }
    }
}

/// Shared collaborators the engine drives. All are injected so tests can
/// substitute scripted fakes for the remote ones.
#[derive(Clone)]
pub struct EngineDeps {
    /// Verification provider adapter.
    pub provider: Arc<dyn Provider>,
    /// Mailbox the out-of-band retriever polls.
    pub mailbox: Arc<dyn MailboxClient>,
    /// Candidate record inventory.
    pub inventory: Arc<RecordInventory>,
    /// Egress proxy pool.
    pub proxies: Arc<ProxyPool>,
    /// Terminal-outcome ledger.
    pub ledger: Arc<Ledger>,
}

/// Handle to a running in-process engine instance.
pub struct EngineHandle {
    pub(crate) inner: Arc<crate::engine::EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start a new in-process engine instance.
pub fn start_engine(config: EngineConfig, deps: EngineDeps) -> EngineHandle {
    crate::engine::start_engine(config, deps)
}

impl EngineHandle {
    /// Submit a verification job for `user_id`.
    pub async fn submit(
        &self,
        user_id: UserId,
        selector: RecordSelector,
    ) -> Result<JobId, SubmitRejected> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        let cmd = crate::engine::EngineCommand::Submit {
            user_id,
            selector,
            reply,
        };
        if self.inner.cmd_tx.send(cmd).await.is_err() {
            return Err(SubmitRejected::ShuttingDown);
        }
        rx.await.unwrap_or(Err(SubmitRejected::ShuttingDown))
    }

    /// Request cooperative cancellation of a live job. Returns whether the
    /// job existed and was still running.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        let (reply, rx) = tokio::sync::oneshot::channel();
        let cmd = crate::engine::EngineCommand::Cancel { job_id, reply };
        if self.inner.cmd_tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Look up a job, live or recently completed.
    pub async fn status(&self, job_id: JobId) -> Option<JobSnapshot> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        let cmd = crate::engine::EngineCommand::Status { job_id, reply };
        if self.inner.cmd_tx.send(cmd).await.is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest engine snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Request a graceful shutdown: reject new submissions and cancel live
    /// jobs at their next suspension point.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the engine to stop, returning the engine task result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}
