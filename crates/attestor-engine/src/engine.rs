use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinSet;

use crate::api::{
    EngineConfig, EngineDeps, EngineEvent, EngineHandle, JobId, JobOutcome, JobSnapshot,
    JobState, RecordSelector, StatusSnapshot, SubmitRejected, TerminalResult, UserId,
};
use crate::job::{self, JobContext, JobUpdate};
use crate::ledger::LedgerEntry;
use attestor_core::record::CandidateRecord;

/// Cooperative cancellation flag, observed at suspension points.
pub(crate) struct CancelFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub(crate) fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    pub(crate) cmd_tx: mpsc::Sender<EngineCommand>,
    stop_requested: AtomicBool,
    notify: Notify,
}

impl EngineInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(EngineEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

pub(crate) enum EngineCommand {
    Submit {
        user_id: UserId,
        selector: RecordSelector,
        reply: oneshot::Sender<Result<JobId, SubmitRejected>>,
    },
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Status {
        job_id: JobId,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
}

struct LiveJob {
    user_id: UserId,
    record: CandidateRecord,
    state: JobState,
    detail: Option<String>,
    proxy: Option<String>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
    cancel: Arc<CancelFlag>,
}

struct EngineRuntime {
    cfg: Arc<EngineConfig>,
    deps: EngineDeps,

    live: HashMap<JobId, LiveJob>,
    by_user: HashMap<UserId, JobId>,
    next_job_id: u64,
    jobs: JoinSet<()>,
    task_jobs: HashMap<tokio::task::Id, JobId>,

    cmd_rx: mpsc::Receiver<EngineCommand>,
    updates_tx: mpsc::UnboundedSender<JobUpdate>,
    updates_rx: mpsc::UnboundedReceiver<JobUpdate>,

    recent: VecDeque<JobOutcome>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    inner: Arc<EngineInner>,
}

impl EngineRuntime {
    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn build_snapshot(&self) -> StatusSnapshot {
        let mut live: Vec<JobSnapshot> = self
            .live
            .iter()
            .map(|(job_id, job)| JobSnapshot {
                job_id: *job_id,
                user_id: job.user_id,
                record_key: job.record.key(),
                candidate: job.record.display_name(),
                state: job.state,
                detail: job.detail.clone(),
                proxy: job.proxy.clone(),
                created_at: job.created_at,
                updated_at: job.updated_at,
            })
            .collect();
        live.sort_by_key(|s| s.job_id);

        StatusSnapshot {
            stop_requested: self.inner.should_stop(),
            live,
            recent: self.recent.iter().cloned().collect(),
        }
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(self.build_snapshot());
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Submit {
                user_id,
                selector,
                reply,
            } => {
                let result = self.admit(user_id, selector).await;
                let _ = reply.send(result);
            }
            EngineCommand::Cancel { job_id, reply } => {
                let cancelled = match self.live.get(&job_id) {
                    Some(job) => {
                        job.cancel.cancel();
                        true
                    }
                    None => false,
                };
                let _ = reply.send(cancelled);
            }
            EngineCommand::Status { job_id, reply } => {
                let _ = reply.send(self.lookup(job_id));
            }
        }
    }

    fn lookup(&self, job_id: JobId) -> Option<JobSnapshot> {
        if let Some(job) = self.live.get(&job_id) {
            return Some(JobSnapshot {
                job_id,
                user_id: job.user_id,
                record_key: job.record.key(),
                candidate: job.record.display_name(),
                state: job.state,
                detail: job.detail.clone(),
                proxy: job.proxy.clone(),
                created_at: job.created_at,
                updated_at: job.updated_at,
            });
        }
        self.recent.iter().rev().find(|o| o.job_id == job_id).map(|o| JobSnapshot {
            job_id,
            user_id: o.user_id,
            record_key: o.record_key.clone(),
            candidate: o.candidate.clone(),
            state: o.result.state(),
            detail: Some(o.result.describe()),
            proxy: None,
            created_at: o.created_at,
            updated_at: o.completed_at,
        })
    }

    async fn admit(
        &mut self,
        user_id: UserId,
        selector: RecordSelector,
    ) -> Result<JobId, SubmitRejected> {
        if self.inner.should_stop() {
            return Err(SubmitRejected::ShuttingDown);
        }
        if let Some(existing) = self.by_user.get(&user_id) {
            return Err(SubmitRejected::UserBusy { job_id: *existing });
        }
        if self.cfg.daily_quota > 0 {
            let start_of_day = Utc::now().date_naive().and_time(chrono::NaiveTime::MIN).and_utc();
            let spent = self.deps.ledger.count_for_user_since(user_id, start_of_day);
            if spent >= self.cfg.daily_quota as usize {
                return Err(SubmitRejected::QuotaExhausted {
                    limit: self.cfg.daily_quota,
                });
            }
        }
        if self.live.len() >= self.cfg.parallel {
            return Err(SubmitRejected::CapacityExhausted {
                cap: self.cfg.parallel,
            });
        }

        let record = match selector {
            RecordSelector::Any => self
                .deps
                .inventory
                .claim()
                .await
                .map_err(|err| SubmitRejected::Inventory(err.to_string()))?
                .ok_or(SubmitRejected::InventoryEmpty)?,
            RecordSelector::Key(key) => self
                .deps
                .inventory
                .claim_key(&key)
                .await
                .map_err(|err| SubmitRejected::Inventory(err.to_string()))?
                .ok_or(SubmitRejected::RecordUnavailable { key })?,
        };

        let job_id = JobId(self.next_job_id);
        self.next_job_id += 1;
        let cancel = Arc::new(CancelFlag::new());
        let now = Utc::now();

        self.live.insert(
            job_id,
            LiveJob {
                user_id,
                record: record.clone(),
                state: JobState::Pending,
                detail: None,
                proxy: None,
                created_at: now,
                updated_at: now,
                cancel: cancel.clone(),
            },
        );
        self.by_user.insert(user_id, job_id);

        tracing::info!(job = %job_id, user = %user_id, record = %record.key(), "job accepted");
        self.emit(EngineEvent::JobAccepted {
            job_id,
            user_id,
            record_key: record.key(),
        });

        let ctx = JobContext {
            job_id,
            record,
            cfg: self.cfg.clone(),
            deps: self.deps.clone(),
            cancel,
            updates: self.updates_tx.clone(),
        };
        let task = self.jobs.spawn(job::drive(ctx));
        self.task_jobs.insert(task.id(), job_id);

        self.push_snapshot();
        Ok(job_id)
    }

    async fn handle_update(&mut self, update: JobUpdate) {
        match update {
            JobUpdate::Transition {
                job_id,
                state,
                detail,
                proxy,
            } => {
                let Some(job) = self.live.get_mut(&job_id) else {
                    return;
                };
                job.state = state;
                job.detail = detail.clone();
                job.proxy = proxy;
                job.updated_at = Utc::now();

                let user_id = job.user_id;
                self.emit(EngineEvent::JobTransition {
                    job_id,
                    user_id,
                    state,
                    detail,
                });
                self.push_snapshot();
            }
            JobUpdate::Finished { job_id, result } => {
                let Some(job) = self.live.remove(&job_id) else {
                    return;
                };
                if self.by_user.get(&job.user_id) == Some(&job_id) {
                    self.by_user.remove(&job.user_id);
                }

                let completed_at = Utc::now();
                let duration_ms = (completed_at - job.created_at).num_milliseconds().max(0) as u64;
                let outcome = JobOutcome {
                    job_id,
                    user_id: job.user_id,
                    record_key: job.record.key(),
                    candidate: job.record.display_name(),
                    result: result.clone(),
                    created_at: job.created_at,
                    completed_at,
                    duration_ms,
                };

                let entry = LedgerEntry {
                    job_id,
                    user_id: job.user_id,
                    record: job.record,
                    result,
                    created_at: job.created_at,
                    completed_at,
                    duration_ms,
                };
                if let Err(err) = self.deps.ledger.append(entry).await {
                    self.emit(EngineEvent::Warning {
                        message: format!("failed to append ledger entry for {job_id}: {err:#}"),
                    });
                }

                tracing::info!(
                    job = %job_id,
                    user = %outcome.user_id,
                    result = %outcome.result.describe(),
                    duration_ms,
                    "job finished"
                );
                self.recent.push_back(outcome.clone());
                while self.recent.len() > self.cfg.recent_jobs_max.max(1) {
                    self.recent.pop_front();
                }
                self.emit(EngineEvent::JobFinished { outcome });
                self.push_snapshot();
            }
        }
    }

    async fn run(mut self) -> anyhow::Result<()> {
        self.emit(EngineEvent::Started);
        self.push_snapshot();

        loop {
            if self.inner.should_stop() {
                for job in self.live.values() {
                    job.cancel.cancel();
                }
                if self.live.is_empty() {
                    break;
                }
            }

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    if let Some(cmd) = cmd {
                        self.handle_command(cmd).await;
                    }
                }
                Some(update) = self.updates_rx.recv() => {
                    self.handle_update(update).await;
                }
                _ = self.inner.notify.notified() => {}
                Some(res) = self.jobs.join_next_with_id(), if !self.jobs.is_empty() => {
                    match res {
                        Ok((task_id, ())) => {
                            self.task_jobs.remove(&task_id);
                        }
                        // A panicked job task never sends Finished; synthesize
                        // a terminal outcome so the user and the slot free up.
                        Err(err) => {
                            self.emit(EngineEvent::Warning {
                                message: format!("job task failed: {err}"),
                            });
                            if let Some(job_id) = self.task_jobs.remove(&err.id()) {
                                self.handle_update(JobUpdate::Finished {
                                    job_id,
                                    result: TerminalResult::Failed {
                                        reason: "job task failed unexpectedly".to_string(),
                                    },
                                })
                                .await;
                            }
                        }
                    }
                }
            }
        }

        while self.jobs.join_next().await.is_some() {}
        self.emit(EngineEvent::Stopped);
        self.push_snapshot();
        Ok(())
    }
}

pub(crate) fn start_engine(mut cfg: EngineConfig, deps: EngineDeps) -> EngineHandle {
    if cfg.parallel == 0 {
        cfg.parallel = 1;
    }
    if cfg.recent_jobs_max == 0 {
        cfg.recent_jobs_max = EngineConfig::DEFAULT_RECENT_JOBS_MAX;
    }
    if cfg.poll_interval.is_zero() {
        cfg.poll_interval = EngineConfig::DEFAULT_POLL_INTERVAL;
    }
    if cfg.oob_poll_interval.is_zero() {
        cfg.oob_poll_interval = EngineConfig::DEFAULT_OOB_POLL_INTERVAL;
    }

    let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot {
        stop_requested: false,
        live: Vec::new(),
        recent: Vec::new(),
    });
    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(64);
    let (updates_tx, updates_rx) = mpsc::unbounded_channel::<JobUpdate>();

    let inner = Arc::new(EngineInner {
        event_tx,
        snapshot_rx,
        cmd_tx,
        stop_requested: AtomicBool::new(false),
        notify: Notify::new(),
    });

    let runtime = EngineRuntime {
        cfg: Arc::new(cfg),
        deps,
        live: HashMap::new(),
        by_user: HashMap::new(),
        next_job_id: 1,
        jobs: JoinSet::new(),
        task_jobs: HashMap::new(),
        cmd_rx,
        updates_tx,
        updates_rx,
        recent: VecDeque::new(),
        snapshot_tx,
        inner: inner.clone(),
    };

    let join = tokio::spawn(runtime.run());
    EngineHandle { inner, join }
}
