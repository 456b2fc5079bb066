#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process verification job engine: record claiming, the provider
//! protocol (submit → poll → out-of-band confirmation → finalize), proxy
//! rotation, and the terminal-outcome ledger.

/// Public API for the engine crate.
pub mod api;

/// Record inventory (available/consumed candidate records).
pub mod inventory;
/// Append-only ledger of terminal job outcomes.
pub mod ledger;
/// Out-of-band confirmation-code retrieval.
pub mod mailbox;
/// Verification provider adapter.
pub mod provider;
/// Egress proxy pool with health tracking.
pub mod proxy;

mod backoff;
mod engine;
mod job;

pub use api::{
    start_engine, EngineConfig, EngineDeps, EngineEvent, EngineHandle, JobId, JobOutcome,
    JobSnapshot, JobState, RecordSelector, StatusSnapshot, SubmitRejected, TerminalResult,
    UserId,
};
