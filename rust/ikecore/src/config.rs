//! Read-only configuration objects the core consumes but never parses.
//!
//! Configuration is authored and validated elsewhere (a file parser, a
//! control-plane API) and handed to the daemon core as an immutable,
//! `Arc`-shared value — this module only defines the shape the core
//! needs, not how it is produced.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::proposal::Proposal;
use crate::ts::TrafficSelector;

/// Configuration for one CHILD_SA definition within an `IkeCfg`.
#[derive(Debug, Clone)]
pub struct ChildCfg {
    pub name: String,
    pub proposals: Vec<Proposal>,
    pub local_ts: Vec<TrafficSelector>,
    pub remote_ts: Vec<TrafficSelector>,
    pub lifetime_soft: Duration,
    pub lifetime_hard: Duration,
    pub use_transport_mode: bool,
    /// When set, a CHILD_SA rekey reuses the parent IKE_SA's DH result
    /// instead of negotiating a fresh group (`Proposal::without_dh`).
    pub reuse_ike_dh: bool,
}

/// Identity used to look up credentials and to populate IDi/IDr.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Fqdn(String),
    Rfc822(String),
    IpAddr(IpAddr),
    KeyId(Vec<u8>),
}

/// Authentication method offered or required for one direction of an
/// exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Psk,
    RsaSignature,
    Eap,
}

/// Configuration for one IKE_SA peering: local/remote identities,
/// proposals, and the CHILD_SA configs it may bring up.
#[derive(Debug, Clone)]
pub struct IkeCfg {
    pub name: String,
    pub local_addr: IpAddr,
    pub remote_addr: Option<IpAddr>,
    pub local_id: Identity,
    pub remote_id: Option<Identity>,
    pub proposals: Vec<Proposal>,
    pub auth_method: AuthMethod,
    pub children: Vec<Arc<ChildCfg>>,
    pub dpd_interval: Duration,
    pub mobike_supported: bool,
}

impl IkeCfg {
    pub fn child_named(&self, name: &str) -> Option<&Arc<ChildCfg>> {
        self.children.iter().find(|c| c.name == name)
    }
}

/// Shared secret or certificate chain material for one identity.
#[derive(Debug, Clone)]
pub enum Credential {
    Psk(Vec<u8>),
    CertChain(Vec<Vec<u8>>),
}

/// Looks up credential material by identity. Implementations might read
/// from a flat file, an in-memory map (tests), or an external secrets
/// store; the core never assumes which.
pub trait CredentialLookup: Send + Sync {
    fn lookup(&self, identity: &Identity) -> Option<Credential>;
}

/// In-memory `CredentialLookup` used by tests.
#[derive(Default)]
pub struct StaticCredentialStore {
    entries: std::collections::HashMap<Identity, Credential>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        StaticCredentialStore::default()
    }

    pub fn with_psk(mut self, identity: Identity, secret: Vec<u8>) -> Self {
        self.entries.insert(identity, Credential::Psk(secret));
        self
    }
}

impl CredentialLookup for StaticCredentialStore {
    fn lookup(&self, identity: &Identity) -> Option<Credential> {
        self.entries.get(identity).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_named_finds_matching_config() {
        let child = Arc::new(ChildCfg {
            name: "net0".into(),
            proposals: vec![],
            local_ts: vec![],
            remote_ts: vec![],
            lifetime_soft: Duration::from_secs(3000),
            lifetime_hard: Duration::from_secs(3600),
            use_transport_mode: false,
            reuse_ike_dh: false,
        });
        let cfg = IkeCfg {
            name: "site-a".into(),
            local_addr: IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1)),
            remote_addr: None,
            local_id: Identity::Fqdn("gw.example.com".into()),
            remote_id: None,
            proposals: vec![],
            auth_method: AuthMethod::Psk,
            children: vec![child],
            dpd_interval: Duration::from_secs(30),
            mobike_supported: true,
        };
        assert!(cfg.child_named("net0").is_some());
        assert!(cfg.child_named("missing").is_none());
    }

    #[test]
    fn credential_store_looks_up_by_identity() {
        let id = Identity::Fqdn("peer.example.com".into());
        let store = StaticCredentialStore::new().with_psk(id.clone(), b"secret".to_vec());
        assert!(matches!(store.lookup(&id), Some(Credential::Psk(_))));
        assert!(store.lookup(&Identity::Fqdn("other".into())).is_none());
    }
}
