//! Per-job state machine.
//!
//! Drives one claimed record through submit → poll → out-of-band
//! confirmation → finalize. Transitions within a job are strictly
//! sequential; every remote call and every delay suspends only this job's
//! task. Cancellation is cooperative: the flag is observed at poll and
//! backoff boundaries, never mid-call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::api::{EngineConfig, EngineDeps, JobId, JobState, TerminalResult};
use crate::backoff::backoff_delay;
use crate::engine::CancelFlag;
use crate::mailbox::{await_code, AwaitCode};
use crate::provider::{ConfirmOutcome, Decision, VerificationHandle};
use crate::proxy::{ProxyEndpoint, ProxyOutcome};
use attestor_core::record::CandidateRecord;

pub(crate) struct JobContext {
    pub(crate) job_id: JobId,
    pub(crate) record: CandidateRecord,
    pub(crate) cfg: Arc<EngineConfig>,
    pub(crate) deps: EngineDeps,
    pub(crate) cancel: Arc<CancelFlag>,
    pub(crate) updates: mpsc::UnboundedSender<JobUpdate>,
}

pub(crate) enum JobUpdate {
    Transition {
        job_id: JobId,
        state: JobState,
        detail: Option<String>,
        proxy: Option<String>,
    },
    Finished {
        job_id: JobId,
        result: TerminalResult,
    },
}

enum Step<T> {
    Continue(T),
    Done(TerminalResult),
}

/// Entry point for the engine's per-job task: run the state machine and
/// report the terminal result back to the runtime.
pub(crate) async fn drive(ctx: JobContext) {
    let result = run(&ctx).await;
    let _ = ctx.updates.send(JobUpdate::Finished {
        job_id: ctx.job_id,
        result,
    });
}

async fn run(ctx: &JobContext) -> TerminalResult {
    let mut proxy = ctx.deps.proxies.checkout();
    if proxy.is_none() && !ctx.deps.proxies.is_empty() {
        tracing::debug!(job = %ctx.job_id, "no proxy available; running direct");
    }

    let result = phases(ctx, &mut proxy).await;

    // Whatever terminal state we reached without a transport fault, the
    // proxy is not to blame: timeouts and rejections carry no penalty.
    if let Some(endpoint) = proxy.take() {
        ctx.deps.proxies.release(&endpoint, ProxyOutcome::Success);
    }
    result
}

async fn phases(ctx: &JobContext, proxy: &mut Option<ProxyEndpoint>) -> TerminalResult {
    transition(ctx, JobState::Submitting, None, proxy);
    let handle = match submit_phase(ctx, proxy).await {
        Step::Continue(handle) => handle,
        Step::Done(result) => return result,
    };

    transition(
        ctx,
        JobState::AwaitingProviderDecision,
        Some(format!("tracking {}", handle.id)),
        proxy,
    );
    let needs_code = match decision_phase(ctx, &handle, proxy).await {
        Step::Continue(needs_code) => needs_code,
        Step::Done(result) => return result,
    };
    if !needs_code {
        return TerminalResult::Success;
    }

    transition(ctx, JobState::AwaitingOutOfBand, None, proxy);
    let code = match oob_phase(ctx, &handle).await {
        Step::Continue(code) => code,
        Step::Done(result) => return result,
    };

    transition(ctx, JobState::Confirming, None, proxy);
    confirm_phase(ctx, &handle, &code, proxy).await
}

async fn submit_phase(
    ctx: &JobContext,
    proxy: &mut Option<ProxyEndpoint>,
) -> Step<VerificationHandle> {
    let attempts = ctx.cfg.submit_attempts.max(1);

    for attempt in 0..attempts {
        if ctx.cancel.is_cancelled() {
            return Step::Done(TerminalResult::Cancelled);
        }

        match ctx.deps.provider.submit(&ctx.record, proxy.as_ref()).await {
            Ok(handle) => return Step::Continue(handle),
            Err(err) if !err.is_retryable() => {
                return Step::Done(TerminalResult::Failed {
                    reason: err.to_string(),
                });
            }
            Err(err) => {
                tracing::debug!(job = %ctx.job_id, attempt, %err, "submit attempt failed");
                if err.penalizes_proxy() {
                    rotate_proxy(ctx, proxy);
                }
                if attempt + 1 < attempts {
                    let delay = backoff_delay(
                        ctx.cfg.backoff_base,
                        ctx.cfg.backoff_multiplier,
                        ctx.cfg.backoff_cap,
                        attempt,
                    );
                    if pause(ctx, delay).await {
                        return Step::Done(TerminalResult::Cancelled);
                    }
                }
            }
        }
    }

    Step::Done(TerminalResult::Failed {
        reason: "submit_exhausted".to_string(),
    })
}

/// Returns whether the provider requires the out-of-band step.
async fn decision_phase(
    ctx: &JobContext,
    handle: &VerificationHandle,
    proxy: &mut Option<ProxyEndpoint>,
) -> Step<bool> {
    let deadline = Instant::now() + ctx.cfg.decision_deadline;
    let fault_cap = ctx.cfg.poll_attempts.max(1);
    let mut faults = 0u32;

    loop {
        if ctx.cancel.is_cancelled() {
            return Step::Done(TerminalResult::Cancelled);
        }
        if Instant::now() >= deadline {
            return Step::Done(TerminalResult::TimedOut {
                phase: "provider decision".to_string(),
            });
        }

        match ctx.deps.provider.poll(handle, proxy.as_ref()).await {
            Ok(Decision::Approved) => return Step::Continue(false),
            Ok(Decision::NeedsCode) => return Step::Continue(true),
            Ok(Decision::Rejected { reason }) => {
                return Step::Done(TerminalResult::Failed { reason });
            }
            Ok(Decision::Pending) => {}
            Err(err) if !err.is_retryable() => {
                return Step::Done(TerminalResult::Failed {
                    reason: err.to_string(),
                });
            }
            Err(err) => {
                faults += 1;
                tracing::debug!(job = %ctx.job_id, faults, %err, "decision poll failed");
                if faults >= fault_cap {
                    return Step::Done(TerminalResult::Failed {
                        reason: format!("poll_exhausted: {err}"),
                    });
                }
                if err.penalizes_proxy() {
                    rotate_proxy(ctx, proxy);
                }
            }
        }

        let next = Instant::now() + ctx.cfg.poll_interval;
        if pause_until(ctx, next.min(deadline)).await {
            return Step::Done(TerminalResult::Cancelled);
        }
    }
}

async fn oob_phase(ctx: &JobContext, handle: &VerificationHandle) -> Step<String> {
    let started_at = Utc::now();
    let deadline = Instant::now() + ctx.cfg.oob_deadline;

    match await_code(
        &*ctx.deps.mailbox,
        &handle.id,
        started_at,
        deadline,
        ctx.cfg.oob_poll_interval,
        ctx.cfg.oob_attempts,
        &ctx.cancel,
    )
    .await
    {
        AwaitCode::Code(code) => Step::Continue(code),
        AwaitCode::TimedOut => Step::Done(TerminalResult::TimedOut {
            phase: "out-of-band confirmation".to_string(),
        }),
        AwaitCode::Cancelled => Step::Done(TerminalResult::Cancelled),
        AwaitCode::Failed(reason) => Step::Done(TerminalResult::Failed { reason }),
    }
}

async fn confirm_phase(
    ctx: &JobContext,
    handle: &VerificationHandle,
    code: &str,
    proxy: &mut Option<ProxyEndpoint>,
) -> TerminalResult {
    // The code is single-use: one call, its answer is authoritative, and
    // any failure is terminal.
    match ctx.deps.provider.confirm(handle, code, proxy.as_ref()).await {
        Ok(ConfirmOutcome::Approved) => TerminalResult::Success,
        Ok(ConfirmOutcome::Rejected { reason }) => TerminalResult::Failed { reason },
        Err(err) => {
            if err.penalizes_proxy() {
                if let Some(endpoint) = proxy.take() {
                    ctx.deps.proxies.release(&endpoint, ProxyOutcome::Failure);
                }
            }
            TerminalResult::Failed {
                reason: format!("confirm failed: {err}"),
            }
        }
    }
}

fn rotate_proxy(ctx: &JobContext, proxy: &mut Option<ProxyEndpoint>) {
    if let Some(endpoint) = proxy.take() {
        ctx.deps.proxies.release(&endpoint, ProxyOutcome::Failure);
    }
    *proxy = ctx.deps.proxies.checkout();
    match proxy {
        Some(endpoint) => {
            tracing::debug!(job = %ctx.job_id, proxy = %endpoint, "rotated to a new proxy")
        }
        None => tracing::debug!(job = %ctx.job_id, "proxy pool exhausted; continuing direct"),
    }
}

fn transition(
    ctx: &JobContext,
    state: JobState,
    detail: Option<String>,
    proxy: &Option<ProxyEndpoint>,
) {
    let _ = ctx.updates.send(JobUpdate::Transition {
        job_id: ctx.job_id,
        state,
        detail,
        proxy: proxy.as_ref().map(|p| p.spec.label()),
    });
}

/// Sleep for `delay`, returning `true` if cancellation was observed instead.
async fn pause(ctx: &JobContext, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = ctx.cancel.cancelled() => true,
    }
}

/// Sleep until `when`, returning `true` if cancellation was observed instead.
async fn pause_until(ctx: &JobContext, when: Instant) -> bool {
    tokio::select! {
        _ = tokio::time::sleep_until(when) => false,
        _ = ctx.cancel.cancelled() => true,
    }
}
