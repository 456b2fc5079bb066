//! End-to-end engine tests against scripted provider and mailbox fakes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use attestor_core::record::parse_record_line;
use attestor_engine::inventory::RecordInventory;
use attestor_engine::ledger::{Ledger, LedgerEntry};
use attestor_engine::mailbox::{MailMessage, MailboxClient, MailboxError};
use attestor_engine::provider::{
    ConfirmOutcome, Decision, Provider, ProviderError, VerificationHandle,
};
use attestor_engine::proxy::{ProxyEndpoint, ProxyPool, ProxyPoolConfig};
use attestor_engine::{
    start_engine, EngineConfig, EngineDeps, EngineEvent, EngineHandle, JobId, RecordSelector,
    SubmitRejected, TerminalResult, UserId,
};

const HANDLE_ID: &str = "VER-TEST";

#[derive(Clone, Copy)]
enum Script {
    Ok,
    Transport,
    Transient,
    Permanent,
}

impl Script {
    fn submit_result(self) -> Result<VerificationHandle, ProviderError> {
        match self {
            Script::Ok => Ok(VerificationHandle {
                id: HANDLE_ID.to_string(),
            }),
            Script::Transport => Err(ProviderError::Transport("connection reset".to_string())),
            Script::Transient => Err(ProviderError::Transient("http 502".to_string())),
            Script::Permanent => Err(ProviderError::Permanent("http 422: bad record".to_string())),
        }
    }
}

struct FakeProvider {
    submit_script: Mutex<VecDeque<Script>>,
    submit_default: Script,
    submit_calls: AtomicU32,
    submit_proxies: Mutex<Vec<Option<String>>>,
    default_decision: Decision,
    confirm_calls: AtomicU32,
    codes_seen: Mutex<Vec<String>>,
}

impl FakeProvider {
    fn approving() -> Self {
        Self::with_decision(Decision::Approved)
    }

    fn with_decision(decision: Decision) -> Self {
        Self {
            submit_script: Mutex::new(VecDeque::new()),
            submit_default: Script::Ok,
            submit_calls: AtomicU32::new(0),
            submit_proxies: Mutex::new(Vec::new()),
            default_decision: decision,
            confirm_calls: AtomicU32::new(0),
            codes_seen: Mutex::new(Vec::new()),
        }
    }

    fn always_failing_submit(script: Script) -> Self {
        Self {
            submit_default: script,
            ..Self::approving()
        }
    }

    fn script_submits(self, scripts: impl IntoIterator<Item = Script>) -> Self {
        self.submit_script.lock().unwrap().extend(scripts);
        self
    }

    fn submit_count(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn submit(
        &self,
        _record: &attestor_core::record::CandidateRecord,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<VerificationHandle, ProviderError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.submit_proxies
            .lock()
            .unwrap()
            .push(proxy.map(|p| p.spec.label()));
        let script = self
            .submit_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.submit_default);
        script.submit_result()
    }

    async fn poll(
        &self,
        _handle: &VerificationHandle,
        _proxy: Option<&ProxyEndpoint>,
    ) -> Result<Decision, ProviderError> {
        Ok(self.default_decision.clone())
    }

    async fn confirm(
        &self,
        _handle: &VerificationHandle,
        code: &str,
        _proxy: Option<&ProxyEndpoint>,
    ) -> Result<ConfirmOutcome, ProviderError> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        self.codes_seen.lock().unwrap().push(code.to_string());
        Ok(ConfirmOutcome::Approved)
    }
}

/// Mailbox fake that stamps arrival times at fetch, as a live store would.
struct FakeMailbox {
    messages: Mutex<Vec<(String, String, String)>>,
}

impl FakeMailbox {
    fn empty() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
        }
    }

    fn with_message(id: &str, subject: &str, body: &str) -> Self {
        Self {
            messages: Mutex::new(vec![(id.to_string(), subject.to_string(), body.to_string())]),
        }
    }
}

#[async_trait]
impl MailboxClient for FakeMailbox {
    async fn fetch_since(&self, _since: DateTime<Utc>) -> Result<Vec<MailMessage>, MailboxError> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|(id, subject, body)| MailMessage {
                id: id.clone(),
                recipient: "codes@example.net".to_string(),
                subject: subject.clone(),
                body: body.clone(),
                received_at: Utc::now(),
            })
            .collect())
    }

    async fn consume(&self, id: &str) -> Result<(), MailboxError> {
        self.messages.lock().unwrap().retain(|(mid, _, _)| mid != id);
        Ok(())
    }
}

struct TestRig {
    _dir: tempfile::TempDir,
    inventory: Arc<RecordInventory>,
    ledger: Arc<Ledger>,
    proxies: Arc<ProxyPool>,
}

fn rig(rows: &[&str], proxy_hosts: &[&str], proxy_health: u32) -> TestRig {
    let dir = tempfile::tempdir().unwrap();
    let records_path = dir.path().join("records.txt");
    std::fs::write(&records_path, rows.join("\n")).unwrap();

    let inventory = Arc::new(
        RecordInventory::load(records_path, dir.path().join("consumed.txt")).unwrap(),
    );
    let ledger = Arc::new(Ledger::load(dir.path().join("ledger.jsonl")).unwrap());
    let proxies = Arc::new(ProxyPool::new(
        ProxyPoolConfig {
            default_health: proxy_health,
            cooldown: Duration::from_secs(600),
        },
        proxy_hosts
            .iter()
            .map(|h| attestor_core::proxy::ProxySpec {
                host: h.to_string(),
                port: 8080,
                username: None,
                password: None,
            })
            .collect(),
    ));

    TestRig {
        _dir: dir,
        inventory,
        ledger,
        proxies,
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        parallel: 4,
        daily_quota: 0,
        submit_attempts: 3,
        poll_attempts: 3,
        oob_attempts: 3,
        backoff_base: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        backoff_cap: Duration::from_millis(20),
        poll_interval: Duration::from_millis(20),
        decision_deadline: Duration::from_secs(5),
        oob_poll_interval: Duration::from_millis(20),
        oob_deadline: Duration::from_millis(200),
        recent_jobs_max: 16,
    }
}

fn launch(
    cfg: EngineConfig,
    rig: &TestRig,
    provider: Arc<FakeProvider>,
    mailbox: Arc<FakeMailbox>,
) -> EngineHandle {
    start_engine(
        cfg,
        EngineDeps {
            provider,
            mailbox,
            inventory: rig.inventory.clone(),
            proxies: rig.proxies.clone(),
            ledger: rig.ledger.clone(),
        },
    )
}

async fn wait_for_outcome(
    events: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    job_id: JobId,
) -> attestor_engine::JobOutcome {
    loop {
        let evt = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for job outcome")
            .expect("event stream closed");
        if let EngineEvent::JobFinished { outcome } = evt {
            if outcome.job_id == job_id {
                return outcome;
            }
        }
    }
}

#[tokio::test]
async fn immediate_success_consumes_record_and_writes_ledger() {
    let rig = rig(&["JOHN|SMITH|Army|1990-05-15|2020-06-01"], &[], 3);
    let provider = Arc::new(FakeProvider::approving());
    let engine = launch(fast_config(), &rig, provider.clone(), Arc::new(FakeMailbox::empty()));
    let mut events = engine.subscribe();

    let job_id = engine
        .submit(UserId(1), RecordSelector::Any)
        .await
        .expect("submission accepted");
    let outcome = wait_for_outcome(&mut events, job_id).await;

    assert_eq!(outcome.result, TerminalResult::Success);
    assert_eq!(outcome.user_id, UserId(1));
    assert_eq!(rig.inventory.count_available(), 0);
    assert_eq!(provider.confirm_calls.load(Ordering::SeqCst), 0);

    let stats = rig.ledger.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.succeeded, 1);

    engine.request_stop();
    engine.wait().await.unwrap();
}

#[tokio::test]
async fn transient_submit_exhausts_after_exactly_the_configured_attempts() {
    let rig = rig(&["JOHN|SMITH|Army|1990-05-15"], &[], 3);
    let provider = Arc::new(FakeProvider::always_failing_submit(Script::Transient));
    let engine = launch(fast_config(), &rig, provider.clone(), Arc::new(FakeMailbox::empty()));
    let mut events = engine.subscribe();

    let job_id = engine.submit(UserId(1), RecordSelector::Any).await.unwrap();
    let outcome = wait_for_outcome(&mut events, job_id).await;

    assert_eq!(
        outcome.result,
        TerminalResult::Failed {
            reason: "submit_exhausted".to_string()
        }
    );
    assert_eq!(provider.submit_count(), 3);
    // The claim is irrevocable even though the job failed.
    assert_eq!(rig.inventory.count_available(), 0);

    engine.request_stop();
    engine.wait().await.unwrap();
}

#[tokio::test]
async fn permanent_rejection_fails_without_retry() {
    let rig = rig(&["JOHN|SMITH|Army|1990-05-15"], &[], 3);
    let provider = Arc::new(FakeProvider::always_failing_submit(Script::Permanent));
    let engine = launch(fast_config(), &rig, provider.clone(), Arc::new(FakeMailbox::empty()));
    let mut events = engine.subscribe();

    let job_id = engine.submit(UserId(1), RecordSelector::Any).await.unwrap();
    let outcome = wait_for_outcome(&mut events, job_id).await;

    assert!(matches!(outcome.result, TerminalResult::Failed { .. }));
    assert_eq!(provider.submit_count(), 1);

    engine.request_stop();
    engine.wait().await.unwrap();
}

#[tokio::test]
async fn transport_failures_rotate_proxies_within_the_same_phase() {
    let rig = rig(&["JOHN|SMITH|Army|1990-05-15"], &["alpha", "beta"], 3);
    let provider = Arc::new(
        FakeProvider::approving().script_submits([Script::Transport, Script::Transport, Script::Ok]),
    );
    let engine = launch(fast_config(), &rig, provider.clone(), Arc::new(FakeMailbox::empty()));
    let mut events = engine.subscribe();

    let job_id = engine.submit(UserId(1), RecordSelector::Any).await.unwrap();
    let outcome = wait_for_outcome(&mut events, job_id).await;
    assert_eq!(outcome.result, TerminalResult::Success);

    // Same phase, three attempts, a fresh egress path after each fault.
    let proxies_seen = provider.submit_proxies.lock().unwrap().clone();
    assert_eq!(
        proxies_seen,
        vec![
            Some("alpha:8080".to_string()),
            Some("beta:8080".to_string()),
            Some("alpha:8080".to_string()),
        ]
    );

    engine.request_stop();
    engine.wait().await.unwrap();
}

#[tokio::test]
async fn oob_deadline_times_out_without_penalizing_the_proxy() {
    // Health of 1: any failure penalty would quarantine the endpoint.
    let rig = rig(&["JOHN|SMITH|Army|1990-05-15"], &["alpha"], 1);
    let provider = Arc::new(FakeProvider::with_decision(Decision::NeedsCode));
    let engine = launch(fast_config(), &rig, provider, Arc::new(FakeMailbox::empty()));
    let mut events = engine.subscribe();

    let job_id = engine.submit(UserId(1), RecordSelector::Any).await.unwrap();
    let outcome = wait_for_outcome(&mut events, job_id).await;

    assert_eq!(
        outcome.result,
        TerminalResult::TimedOut {
            phase: "out-of-band confirmation".to_string()
        }
    );
    assert!(
        rig.proxies.checkout().is_some(),
        "timeout must not count against proxy health"
    );

    engine.request_stop();
    engine.wait().await.unwrap();
}

#[tokio::test]
async fn oob_code_is_retrieved_and_relayed() {
    let rig = rig(&["JOHN|SMITH|Army|1990-05-15"], &[], 3);
    let provider = Arc::new(FakeProvider::with_decision(Decision::NeedsCode));
    let mailbox = Arc::new(FakeMailbox::with_message(
        "m1",
        &format!("Verification {HANDLE_ID}"),
        "Your confirmation code is 654321.",
    ));
    let engine = launch(fast_config(), &rig, provider.clone(), mailbox);
    let mut events = engine.subscribe();

    let job_id = engine.submit(UserId(1), RecordSelector::Any).await.unwrap();
    let outcome = wait_for_outcome(&mut events, job_id).await;

    assert_eq!(outcome.result, TerminalResult::Success);
    assert_eq!(
        provider.codes_seen.lock().unwrap().clone(),
        vec!["654321".to_string()]
    );

    engine.request_stop();
    engine.wait().await.unwrap();
}

#[tokio::test]
async fn one_non_terminal_job_per_user() {
    let rig = rig(
        &["A|ONE|Army|1990-01-01", "B|TWO|Navy|1991-02-02", "C|THREE|Army|1992-03-03"],
        &[],
        3,
    );
    // Pending decisions keep the first job alive until cancelled.
    let provider = Arc::new(FakeProvider::with_decision(Decision::Pending));
    let engine = launch(fast_config(), &rig, provider, Arc::new(FakeMailbox::empty()));
    let mut events = engine.subscribe();

    let first = engine.submit(UserId(7), RecordSelector::Any).await.unwrap();

    let (second, third) = tokio::join!(
        engine.submit(UserId(7), RecordSelector::Any),
        engine.submit(UserId(7), RecordSelector::Any),
    );
    assert_eq!(second, Err(SubmitRejected::UserBusy { job_id: first }));
    assert_eq!(third, Err(SubmitRejected::UserBusy { job_id: first }));

    // Once the live job terminates, the user is free again.
    assert!(engine.cancel(first).await);
    let outcome = wait_for_outcome(&mut events, first).await;
    assert_eq!(outcome.result, TerminalResult::Cancelled);

    let again = engine.submit(UserId(7), RecordSelector::Any).await;
    assert!(again.is_ok());

    engine.request_stop();
    engine.wait().await.unwrap();
}

#[tokio::test]
async fn capacity_is_rejected_not_queued() {
    let rig = rig(&["A|ONE|Army|1990-01-01", "B|TWO|Navy|1991-02-02"], &[], 3);
    let provider = Arc::new(FakeProvider::with_decision(Decision::Pending));
    let cfg = EngineConfig {
        parallel: 1,
        ..fast_config()
    };
    let engine = launch(cfg, &rig, provider, Arc::new(FakeMailbox::empty()));
    let mut events = engine.subscribe();

    let first = engine.submit(UserId(1), RecordSelector::Any).await.unwrap();
    let second = engine.submit(UserId(2), RecordSelector::Any).await;
    assert_eq!(second, Err(SubmitRejected::CapacityExhausted { cap: 1 }));
    // The rejected submission consumed no record.
    assert_eq!(rig.inventory.count_available(), 1);

    engine.cancel(first).await;
    wait_for_outcome(&mut events, first).await;
    engine.request_stop();
    engine.wait().await.unwrap();
}

#[tokio::test]
async fn daily_quota_counts_ledger_entries() {
    let rig = rig(&["A|ONE|Army|1990-01-01", "B|TWO|Navy|1991-02-02"], &[], 3);
    let now = Utc::now();
    rig.ledger
        .append(LedgerEntry {
            job_id: JobId(99),
            user_id: UserId(7),
            record: parse_record_line("X|OLD|Army|1980-01-01").unwrap(),
            result: TerminalResult::Success,
            created_at: now,
            completed_at: now + TimeDelta::seconds(30),
            duration_ms: 1000,
        })
        .await
        .unwrap();

    let provider = Arc::new(FakeProvider::approving());
    let cfg = EngineConfig {
        daily_quota: 1,
        ..fast_config()
    };
    let engine = launch(cfg, &rig, provider, Arc::new(FakeMailbox::empty()));
    let mut events = engine.subscribe();

    let rejected = engine.submit(UserId(7), RecordSelector::Any).await;
    assert_eq!(rejected, Err(SubmitRejected::QuotaExhausted { limit: 1 }));

    // Another user is unaffected.
    let job_id = engine.submit(UserId(8), RecordSelector::Any).await.unwrap();
    let outcome = wait_for_outcome(&mut events, job_id).await;
    assert_eq!(outcome.result, TerminalResult::Success);

    engine.request_stop();
    engine.wait().await.unwrap();
}

#[tokio::test]
async fn selecting_a_specific_record_claims_only_that_record() {
    let rig = rig(&["A|ONE|Army|1990-01-01", "B|TWO|Navy|1991-02-02"], &[], 3);
    let provider = Arc::new(FakeProvider::approving());
    let engine = launch(fast_config(), &rig, provider, Arc::new(FakeMailbox::empty()));
    let mut events = engine.subscribe();

    let job_id = engine
        .submit(UserId(1), RecordSelector::Key("B|TWO|1991-02-02".to_string()))
        .await
        .unwrap();
    let outcome = wait_for_outcome(&mut events, job_id).await;
    assert_eq!(outcome.record_key, "B|TWO|1991-02-02");

    let missing = engine
        .submit(UserId(2), RecordSelector::Key("B|TWO|1991-02-02".to_string()))
        .await;
    assert_eq!(
        missing,
        Err(SubmitRejected::RecordUnavailable {
            key: "B|TWO|1991-02-02".to_string()
        })
    );

    engine.request_stop();
    engine.wait().await.unwrap();
}

#[tokio::test]
async fn every_job_reports_exactly_one_terminal_event() {
    let rig = rig(
        &["A|ONE|Army|1990-01-01", "B|TWO|Navy|1991-02-02", "C|THREE|Army|1992-03-03"],
        &[],
        3,
    );
    let provider = Arc::new(FakeProvider::approving());
    let engine = launch(fast_config(), &rig, provider, Arc::new(FakeMailbox::empty()));
    let mut events = engine.subscribe();

    let mut submitted = Vec::new();
    for user in 1..=3 {
        submitted.push(engine.submit(UserId(user), RecordSelector::Any).await.unwrap());
    }

    let mut finished = Vec::new();
    while finished.len() < submitted.len() {
        let evt = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("stream open");
        if let EngineEvent::JobFinished { outcome } = evt {
            finished.push(outcome.job_id);
        }
    }
    finished.sort();
    let mut expected = submitted.clone();
    expected.sort();
    assert_eq!(finished, expected);

    // Completion order across jobs is unordered; the snapshot ring holds all.
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.live.len(), 0);
    assert_eq!(snapshot.recent.len(), 3);

    engine.request_stop();
    engine.wait().await.unwrap();
}

#[tokio::test]
async fn status_reports_live_then_terminal_snapshots() {
    let rig = rig(&["A|ONE|Army|1990-01-01"], &[], 3);
    let provider = Arc::new(FakeProvider::with_decision(Decision::Pending));
    let engine = launch(fast_config(), &rig, provider, Arc::new(FakeMailbox::empty()));
    let mut events = engine.subscribe();

    let job_id = engine.submit(UserId(1), RecordSelector::Any).await.unwrap();
    let live = engine.status(job_id).await.expect("live job visible");
    assert!(!live.state.is_terminal());

    engine.cancel(job_id).await;
    wait_for_outcome(&mut events, job_id).await;

    let done = engine.status(job_id).await.expect("terminal job visible");
    assert!(done.state.is_terminal());
    assert_eq!(done.state, attestor_engine::JobState::Cancelled);

    assert!(engine.status(JobId(12345)).await.is_none());

    engine.request_stop();
    engine.wait().await.unwrap();
}
