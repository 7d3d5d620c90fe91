//! Explicit application context.
//!
//! Rather than a process-wide daemon singleton, a `Context` value is
//! built once at startup and threaded into every subsystem explicitly.

use std::sync::Arc;

use crate::config::CredentialLookup;
use crate::crypto::CryptoProvider;
use crate::kernel::{KernelCache, KernelInterface};
use crate::manager::IkeSaManager;
use crate::scheduler::Scheduler;

/// Bundles every collaborator a subsystem needs. Constructed once by the
/// host application and passed by reference or `Arc` into whichever
/// subsystem needs it; no subsystem reaches for a global.
pub struct Context<K: KernelInterface> {
    pub manager: Arc<IkeSaManager>,
    pub scheduler: Arc<Scheduler>,
    pub kernel: Arc<KernelCache<K>>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub credentials: Arc<dyn CredentialLookup>,
}

impl<K: KernelInterface> Context<K> {
    pub fn new(
        manager: Arc<IkeSaManager>,
        scheduler: Arc<Scheduler>,
        kernel: Arc<KernelCache<K>>,
        crypto: Arc<dyn CryptoProvider>,
        credentials: Arc<dyn CredentialLookup>,
    ) -> Self {
        Context {
            manager,
            scheduler,
            kernel,
            crypto,
            credentials,
        }
    }
}
