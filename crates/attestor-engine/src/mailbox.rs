//! Out-of-band confirmation-code retrieval.
//!
//! The retriever polls a shared mailbox for the message carrying a job's
//! one-time code. Matching is correlation-token-based (several jobs may
//! share one mailbox concurrently, so "most recent message" is never good
//! enough), and a matched message is consumed so no other job can claim
//! the same code.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use tokio::time::Instant;

use crate::engine::CancelFlag;

/// One message as seen through the mail-retrieval session.
#[derive(Debug, Clone, Deserialize)]
pub struct MailMessage {
    /// Store-assigned message id.
    pub id: String,
    /// Addressed party.
    #[serde(alias = "to")]
    pub recipient: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
}

/// Failure of a mailbox operation.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    /// The message store could not be reached or answered abnormally.
    #[error("mailbox transport failure: {0}")]
    Transport(String),
}

/// A mail-retrieval session, consumed (not owned) by the retriever.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Messages that arrived at or after `since`.
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<MailMessage>, MailboxError>;

    /// Mark a message consumed so it cannot be matched again.
    async fn consume(&self, id: &str) -> Result<(), MailboxError>;
}

/// Outcome of waiting for a code.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AwaitCode {
    /// The code extracted from the matching message.
    Code(String),
    /// The deadline elapsed without a matching message.
    TimedOut,
    /// Cancellation was observed at a poll boundary.
    Cancelled,
    /// The mailbox transport fault cap was exceeded.
    Failed(String),
}

fn code_regex() -> &'static Regex {
    static CODE_RE: OnceLock<Regex> = OnceLock::new();
    CODE_RE.get_or_init(|| Regex::new(r"\b(\d{6})\b").expect("code pattern is valid"))
}

fn matches_token(message: &MailMessage, token: &str) -> bool {
    message.recipient.contains(token)
        || message.subject.contains(token)
        || message.body.contains(token)
}

fn extract_code(message: &MailMessage) -> Option<String> {
    let re = code_regex();
    re.captures(&message.body)
        .or_else(|| re.captures(&message.subject))
        .map(|caps| caps[1].to_string())
}

/// Poll the mailbox for a message matching `token` until `deadline`.
pub(crate) async fn await_code(
    client: &dyn MailboxClient,
    token: &str,
    started_at: DateTime<Utc>,
    deadline: Instant,
    poll_interval: Duration,
    fault_cap: u32,
    cancel: &CancelFlag,
) -> AwaitCode {
    let mut faults = 0u32;

    loop {
        if cancel.is_cancelled() {
            return AwaitCode::Cancelled;
        }
        if Instant::now() >= deadline {
            return AwaitCode::TimedOut;
        }

        match client.fetch_since(started_at).await {
            Ok(messages) => {
                let matched = messages
                    .iter()
                    .find(|m| m.received_at >= started_at && matches_token(m, token));
                if let Some(message) = matched {
                    if let Some(code) = extract_code(message) {
                        if let Err(err) = client.consume(&message.id).await {
                            tracing::warn!(%err, id = %message.id, "failed to consume matched message");
                        }
                        return AwaitCode::Code(code);
                    }
                    tracing::debug!(id = %message.id, "matched message carries no code; still waiting");
                }
            }
            Err(MailboxError::Transport(err)) => {
                faults += 1;
                if faults >= fault_cap.max(1) {
                    return AwaitCode::Failed(format!("mailbox unavailable: {err}"));
                }
                tracing::debug!(%err, faults, "mailbox fetch failed; retrying");
            }
        }

        let next = Instant::now() + poll_interval;
        tokio::select! {
            _ = tokio::time::sleep_until(next.min(deadline)) => {}
            _ = cancel.cancelled() => return AwaitCode::Cancelled,
        }
    }
}

/// JSON-over-HTTP mail-retrieval session.
pub struct HttpMailbox {
    base: Url,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpMailbox {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

    /// Build a session against `base`.
    pub fn new(base: Url, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            base,
            http: reqwest::Client::builder().build()?,
            timeout,
        })
    }
}

#[async_trait]
impl MailboxClient for HttpMailbox {
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<MailMessage>, MailboxError> {
        let url = self
            .base
            .join("api/messages")
            .map_err(|err| MailboxError::Transport(format!("bad mailbox url: {err}")))?;
        let res = self
            .http
            .get(url)
            .query(&[("since", since.to_rfc3339())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| MailboxError::Transport(err.to_string()))?;

        if !res.status().is_success() {
            return Err(MailboxError::Transport(format!("http {}", res.status())));
        }
        res.json()
            .await
            .map_err(|err| MailboxError::Transport(format!("malformed message list: {err}")))
    }

    async fn consume(&self, id: &str) -> Result<(), MailboxError> {
        let url = self
            .base
            .join(&format!("api/messages/{id}"))
            .map_err(|err| MailboxError::Transport(format!("bad mailbox url: {err}")))?;
        let res = self
            .http
            .delete(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| MailboxError::Transport(err.to_string()))?;

        if !res.status().is_success() {
            return Err(MailboxError::Transport(format!("http {}", res.status())));
        }
        Ok(())
    }
}
