//! Aggregate error taxonomy for the core.
//!
//! Each subsystem defines its own `thiserror` enum; this module composes
//! them behind one `Error` so callers at the crate boundary can match on
//! a single type while subsystems keep precise, local error types.

use thiserror::Error;

use crate::kernel::KernelError;
use crate::wire::CodecError;

/// Notify message types a task can ask the engine to send back to the
/// peer when it fails. Numeric values match RFC 7296 section 3.10.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyType {
    NoProposalChosen = 14,
    InvalidSyntax = 7,
    AuthenticationFailed = 24,
    TsUnacceptable = 17,
    SinglePairRequired = 34,
    InternalAddressFailure = 36,
    ChildSaNotFound = 44,
}

/// A resource ceiling exceeded (half-open SAs, established SAs, or
/// queued jobs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ceiling {
    MaxHalfOpen,
    MaxEstablished,
    MaxQueuedJobs,
}

impl std::fmt::Display for Ceiling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Ceiling::MaxHalfOpen => "max half-open IKE_SAs",
            Ceiling::MaxEstablished => "max established IKE_SAs",
            Ceiling::MaxQueuedJobs => "max queued jobs",
        };
        f.write_str(s)
    }
}

/// Negotiation failed: no common proposal or no acceptable traffic
/// selector. This is a normal protocol outcome, not a bug; it is still
/// modeled as an error because it aborts the task that triggered it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationFailure {
    #[error("no proposal chosen")]
    NoProposalChosen,
    #[error("traffic selectors unacceptable")]
    TsUnacceptable,
}

/// Authentication or EAP failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("AUTH payload verification failed")]
    InvalidAuth,
    #[error("EAP method rejected the peer")]
    EapRejected,
    #[error("no credential found for identity {0:?}")]
    NoCredential(String),
}

/// Top-level error type returned across the crate boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("wire codec error: {0}")]
    Wire(#[from] CodecError),

    #[error("negotiation failure: {0}")]
    Negotiation(#[from] NegotiationFailure),

    #[error("authentication failure: {0}")]
    Auth(#[from] AuthFailure),

    #[error("kernel interface error: {0}")]
    Kernel(#[from] KernelError),

    #[error("retransmit budget exhausted")]
    Timeout,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(Ceiling),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
