//! Verification provider adapter.
//!
//! Stateless: three remote operations, each classified at this boundary
//! into transport, transient, or permanent failures. Nothing downstream
//! ever sees a raw HTTP error.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::proxy::ProxyEndpoint;
use attestor_core::record::CandidateRecord;

/// Classified failure of a provider operation.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transport-level failure (connect, timeout): attributable to the
    /// egress path, retried with proxy rotation.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Provider-side transient failure (5xx, rate limiting, malformed
    /// payload): retried without penalizing the proxy.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Semantic rejection (4xx): terminal, never retried.
    #[error("provider rejected request: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Whether the state machine may retry the operation.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Permanent(_))
    }

    /// Whether the failure counts against the proxy's health.
    pub fn penalizes_proxy(&self) -> bool {
        matches!(self, ProviderError::Transport(_))
    }
}

/// Tracking handle returned by a successful submission. Its id doubles as
/// the out-of-band correlation token: the provider echoes it in the
/// confirmation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationHandle {
    /// Provider-assigned verification id.
    pub id: String,
}

/// Provider's answer to a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Still reviewing; poll again later.
    Pending,
    /// Out-of-band confirmation required to proceed.
    NeedsCode,
    /// Accepted without an out-of-band step.
    Approved,
    /// Definitive rejection; the reason is preserved.
    Rejected {
        /// Provider-supplied rejection reason.
        reason: String,
    },
}

/// Provider's answer to a code confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The code was accepted; verification is complete.
    Approved,
    /// The code (or the underlying record) was rejected.
    Rejected {
        /// Provider-supplied rejection reason.
        reason: String,
    },
}

/// The three remote calls of the verification protocol. Implementations
/// must be stateless between calls.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Submit a record for verification, returning a tracking handle.
    async fn submit(
        &self,
        record: &CandidateRecord,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<VerificationHandle, ProviderError>;

    /// Ask for the provider's current decision on a submission.
    async fn poll(
        &self,
        handle: &VerificationHandle,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Decision, ProviderError>;

    /// Relay the out-of-band code. Callers must not retry this: the code is
    /// single-use.
    async fn confirm(
        &self,
        handle: &VerificationHandle,
        code: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<ConfirmOutcome, ProviderError>;
}

/// Per-operation request timeouts.
#[derive(Debug, Clone)]
pub struct ProviderTimeouts {
    /// Submit call timeout.
    pub submit: Duration,
    /// Poll call timeout.
    pub poll: Duration,
    /// Confirm call timeout.
    pub confirm: Duration,
}

impl Default for ProviderTimeouts {
    fn default() -> Self {
        Self {
            submit: Duration::from_secs(30),
            poll: Duration::from_secs(15),
            confirm: Duration::from_secs(30),
        }
    }
}

/// HTTP implementation of the provider protocol.
pub struct HttpProvider {
    base: Url,
    contact_email: String,
    operator_label: Option<String>,
    timeouts: ProviderTimeouts,
    direct: reqwest::Client,
    /// Connection reuse only; carries no protocol state.
    per_proxy: Mutex<HashMap<usize, reqwest::Client>>,
}

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    first_name: &'a str,
    last_name: &'a str,
    branch: &'a str,
    organization_id: u64,
    start_date: String,
    end_date: String,
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    operator: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SubmitAck {
    verification_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    current_step: String,
    #[serde(default)]
    reject_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConfirmBody<'a> {
    code: &'a str,
}

impl HttpProvider {
    /// Build an adapter against `base`. `contact_email` is the mailbox the
    /// provider delivers confirmation codes to.
    pub fn new(
        base: Url,
        contact_email: String,
        operator_label: Option<String>,
        timeouts: ProviderTimeouts,
    ) -> anyhow::Result<Self> {
        let direct = reqwest::Client::builder().build()?;
        Ok(Self {
            base,
            contact_email,
            operator_label,
            timeouts,
            direct,
            per_proxy: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<reqwest::Client, ProviderError> {
        let Some(endpoint) = proxy else {
            return Ok(self.direct.clone());
        };

        let mut cache = match self.per_proxy.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(client) = cache.get(&endpoint.id) {
            return Ok(client.clone());
        }

        let mut proxy = reqwest::Proxy::all(endpoint.spec.url())
            .map_err(|err| ProviderError::Transport(format!("invalid proxy: {err}")))?;
        if let (Some(user), Some(pass)) = (&endpoint.spec.username, &endpoint.spec.password) {
            proxy = proxy.basic_auth(user, pass);
        }
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .build()
            .map_err(|err| ProviderError::Transport(format!("proxy client build: {err}")))?;
        cache.insert(endpoint.id, client.clone());
        Ok(client)
    }

    fn join(&self, path: &str) -> Result<Url, ProviderError> {
        self.base
            .join(path)
            .map_err(|err| ProviderError::Transient(format!("bad provider url: {err}")))
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn submit(
        &self,
        record: &CandidateRecord,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<VerificationHandle, ProviderError> {
        let client = self.client_for(proxy)?;
        let url = self.join("api/verifications")?;
        let body = SubmitBody {
            first_name: &record.first_name,
            last_name: &record.last_name,
            branch: record.branch.label(),
            organization_id: record.branch.organization_id(),
            start_date: record.start_date.to_string(),
            end_date: record.end_date.to_string(),
            email: &self.contact_email,
            operator: self.operator_label.as_deref(),
        };

        let res = client
            .post(url)
            .timeout(self.timeouts.submit)
            .json(&body)
            .send()
            .await
            .map_err(classify_send_error)?;
        let ack: SubmitAck = read_json(res).await?;
        Ok(VerificationHandle {
            id: ack.verification_id,
        })
    }

    async fn poll(
        &self,
        handle: &VerificationHandle,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Decision, ProviderError> {
        let client = self.client_for(proxy)?;
        let url = self.join(&format!("api/verifications/{}", handle.id))?;

        let res = client
            .get(url)
            .timeout(self.timeouts.poll)
            .send()
            .await
            .map_err(classify_send_error)?;
        let status: StatusBody = read_json(res).await?;
        decision_from_step(&status)
    }

    async fn confirm(
        &self,
        handle: &VerificationHandle,
        code: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<ConfirmOutcome, ProviderError> {
        let client = self.client_for(proxy)?;
        let url = self.join(&format!("api/verifications/{}/code", handle.id))?;

        let res = client
            .post(url)
            .timeout(self.timeouts.confirm)
            .json(&ConfirmBody { code })
            .send()
            .await
            .map_err(classify_send_error)?;
        let status: StatusBody = read_json(res).await?;
        match status.current_step.as_str() {
            "success" => Ok(ConfirmOutcome::Approved),
            "emailLoop" => Ok(ConfirmOutcome::Rejected {
                reason: "confirmation code not accepted".to_string(),
            }),
            "rejected" | "error" => Ok(ConfirmOutcome::Rejected {
                reason: reject_reason(&status),
            }),
            other => Err(ProviderError::Transient(format!(
                "unrecognized confirmation step {other:?}"
            ))),
        }
    }
}

fn decision_from_step(status: &StatusBody) -> Result<Decision, ProviderError> {
    match status.current_step.as_str() {
        "pending" | "docReview" => Ok(Decision::Pending),
        "emailLoop" => Ok(Decision::NeedsCode),
        "success" => Ok(Decision::Approved),
        "rejected" | "error" => Ok(Decision::Rejected {
            reason: reject_reason(status),
        }),
        // Ambiguous answers are transient, never a rejection.
        other => Err(ProviderError::Transient(format!(
            "unrecognized step {other:?}"
        ))),
    }
}

fn reject_reason(status: &StatusBody) -> String {
    status
        .reject_reason
        .clone()
        .unwrap_or_else(|| "rejected by provider".to_string())
}

fn classify_send_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() {
        ProviderError::Transport(err.to_string())
    } else {
        ProviderError::Transient(err.to_string())
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(res: reqwest::Response) -> Result<T, ProviderError> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }
    res.json()
        .await
        .map_err(|err| ProviderError::Transient(format!("malformed response body: {err}")))
}

fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Transient(format!("http {status}: {body}"))
    } else {
        ProviderError::Permanent(format!("http {status}: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(step: &str, reason: Option<&str>) -> StatusBody {
        StatusBody {
            current_step: step.to_string(),
            reject_reason: reason.map(str::to_string),
        }
    }

    #[test]
    fn known_steps_map_to_decisions() {
        assert_eq!(decision_from_step(&status("pending", None)).unwrap(), Decision::Pending);
        assert_eq!(decision_from_step(&status("emailLoop", None)).unwrap(), Decision::NeedsCode);
        assert_eq!(decision_from_step(&status("success", None)).unwrap(), Decision::Approved);
        assert_eq!(
            decision_from_step(&status("rejected", Some("no match"))).unwrap(),
            Decision::Rejected { reason: "no match".to_string() }
        );
    }

    #[test]
    fn unknown_steps_are_transient_not_rejections() {
        let err = decision_from_step(&status("somethingNew", None)).unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.penalizes_proxy());
    }

    #[test]
    fn status_classification_splits_retryable_from_terminal() {
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, "").is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY, "").is_retryable());
    }
}
