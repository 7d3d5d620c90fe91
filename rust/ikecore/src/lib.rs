//! Core engine of an IKEv2 daemon.
//!
//! This crate implements the subsystems that embody the hard engineering
//! of an IKEv2 daemon, independent of socket I/O, configuration parsing,
//! and credential storage, all of which are external collaborators the
//! host application supplies:
//!
//! - [`manager`] — the sharded IKE_SA registry with exclusive checkout
//!   and cookie-based DoS mitigation.
//! - [`task`] — the retransmitting task engine driving one exchange.
//! - [`wire`] — the IKEv2 message codec, including SK payload handling
//!   and RFC 7383 fragment reassembly.
//! - [`proposal`] and [`ts`] — pure matching functions for crypto
//!   proposals and traffic selectors.
//! - [`scheduler`] — the job scheduler and worker pool.
//! - [`kernel`] — the refcounted kernel SA/policy cache.
//! - [`ike_sa`] and [`child_sa`] — per-association state and keying.
//! - [`crypto`] — injected cryptographic capability traits plus a
//!   software reference implementation.
//! - [`config`] — read-only configuration objects the core consumes.
//! - [`context`] — the explicitly constructed collaborator bundle that
//!   replaces a process-wide singleton.

pub mod child_sa;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod ike_sa;
pub mod kernel;
pub mod manager;
pub mod proposal;
pub mod scheduler;
pub mod task;
pub mod ts;
pub mod wire;

pub use error::{Error, Result};
pub use ike_sa::{IkeSa, IkeSaState, Role, SpiPair};
pub use manager::IkeSaManager;
pub use task::{Task, TaskKind, TaskResult};

/// Administrative IPC surface: the crate never opens a socket itself,
/// but defines the request/response shapes a host application can carry
/// over whichever transport it chooses.
pub mod admin {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub enum AdminRequest {
        Initiate { peer_config: String, child_config: String },
        Terminate { ike_id: Option<u64>, name: Option<String> },
        Status,
        Rekey { ike_id: Option<u64>, child_id: Option<u32> },
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub enum AdminResponse {
        Ok,
        Status(StatusSnapshot),
        Error { code: u32, message: String },
    }

    /// Aggregate counters exposed over the admin surface; each subsystem
    /// contributes its own `get_*`-style summary into one snapshot.
    #[derive(Debug, Clone, Serialize, Deserialize, Default)]
    pub struct StatusSnapshot {
        pub established_sa_count: usize,
        pub half_open_sa_count: u32,
        pub queued_job_count: usize,
        pub delayed_job_count: usize,
    }
}
