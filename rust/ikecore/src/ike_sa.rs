//! IKE_SA state: the long-lived control-plane association, its derived
//! keying material, message-id counters and owned CHILD_SAs.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::child_sa::ChildSa;
use crate::config::IkeCfg;
use crate::crypto::{CryptoProvider, CryptoResult, DhPrivate};
use crate::task::TaskManager;

/// SPI pair identifying one IKE_SA. Until the responder SPI is known the
/// value carries `responder: 0` and the SA is indexed as "half-open" by
/// initiator SPI plus remote address alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpiPair {
    pub initiator: u64,
    pub responder: u64,
}

impl SpiPair {
    pub fn is_half_open(&self) -> bool {
        self.responder == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Lifecycle state, driven exclusively by task outcomes and admin
/// commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkeSaState {
    Created,
    Connecting,
    Established,
    Rekeying,
    Deleting,
    Destroyed,
}

/// Derived keying material from IKE_SA_INIT (and refreshed on rekey).
/// `SKEYSEED = prf(Ni | Nr, g^ir)`; each `SK_*` is sliced from
/// `prf+(SKEYSEED, Ni | Nr | SPIi | SPIr)` in the fixed order
/// `SK_d, SK_ai, SK_ar, SK_ei, SK_er, SK_pi, SK_pr`.
pub struct DerivedKeys {
    pub sk_d: Vec<u8>,
    pub sk_ai: Vec<u8>,
    pub sk_ar: Vec<u8>,
    pub sk_ei: Vec<u8>,
    pub sk_er: Vec<u8>,
    pub sk_pi: Vec<u8>,
    pub sk_pr: Vec<u8>,
}

impl Drop for DerivedKeys {
    fn drop(&mut self) {
        self.sk_d.zeroize();
        self.sk_ai.zeroize();
        self.sk_ar.zeroize();
        self.sk_ei.zeroize();
        self.sk_er.zeroize();
        self.sk_pi.zeroize();
        self.sk_pr.zeroize();
    }
}

/// Key lengths required by the negotiated suite, used to slice the
/// `prf+` output into `DerivedKeys`.
pub struct KeyLengths {
    pub sk_d: usize,
    pub sk_a: usize,
    pub sk_e: usize,
    pub sk_p: usize,
}

/// `SKEYSEED = prf(Ni | Nr, shared_secret)`, then slice
/// `prf+(SKEYSEED, Ni | Nr | SPIi | SPIr)`.
pub fn derive_keys(
    provider: &dyn CryptoProvider,
    prf_algorithm: u16,
    ni: &[u8],
    nr: &[u8],
    spi_i: u64,
    spi_r: u64,
    shared_secret: &[u8],
    lengths: &KeyLengths,
) -> CryptoResult<DerivedKeys> {
    let prf = provider.prf(prf_algorithm)?;
    let mut nonce_concat = Vec::with_capacity(ni.len() + nr.len());
    nonce_concat.extend_from_slice(ni);
    nonce_concat.extend_from_slice(nr);

    debug!(spi_i = %format!("{:016x}", spi_i), spi_r = %format!("{:016x}", spi_r), prf_algorithm, "deriving SKEYSEED and SK_* key material");
    let skeyseed = prf.prf(&nonce_concat, shared_secret);

    let mut seed = nonce_concat;
    seed.extend_from_slice(&spi_i.to_be_bytes());
    seed.extend_from_slice(&spi_r.to_be_bytes());

    let total = lengths.sk_d + 2 * lengths.sk_a + 2 * lengths.sk_e + 2 * lengths.sk_p;
    let keymat = prf.prf_plus(&skeyseed, &seed, total);

    let mut offset = 0;
    let mut take = |n: usize| {
        let slice = keymat[offset..offset + n].to_vec();
        offset += n;
        slice
    };

    Ok(DerivedKeys {
        sk_d: take(lengths.sk_d),
        sk_ai: take(lengths.sk_a),
        sk_ar: take(lengths.sk_a),
        sk_ei: take(lengths.sk_e),
        sk_er: take(lengths.sk_e),
        sk_pi: take(lengths.sk_p),
        sk_pr: take(lengths.sk_p),
    })
}

/// `KEYMAT = prf+(SK_d, [g^ir_new |] Ni | Nr)`, sliced in the order
/// `encr_i, integ_i, encr_r, integ_r`.
pub fn derive_child_keymat(
    provider: &dyn CryptoProvider,
    prf_algorithm: u16,
    sk_d: &[u8],
    new_shared_secret: Option<&[u8]>,
    ni: &[u8],
    nr: &[u8],
    total_len: usize,
) -> CryptoResult<Vec<u8>> {
    let prf = provider.prf(prf_algorithm)?;
    let mut seed = Vec::new();
    if let Some(secret) = new_shared_secret {
        seed.extend_from_slice(secret);
    }
    seed.extend_from_slice(ni);
    seed.extend_from_slice(nr);
    Ok(prf.prf_plus(sk_d, &seed, total_len))
}

/// The long-lived control-plane association. `task_manager`, `children`
/// and the derived keys are all exclusively owned here; the only access
/// path is an exclusive checkout from the `manager` module, so no field
/// needs its own lock.
pub struct IkeSa {
    pub spis: SpiPair,
    pub name: String,
    pub state: IkeSaState,
    pub role: Role,
    pub local_addr: IpAddr,
    pub remote_addr: IpAddr,
    pub keys: Option<DerivedKeys>,
    pub expected_in: u32,
    pub expected_out: u32,
    pub window_size: u32,
    pub config: Arc<IkeCfg>,
    pub authenticated: bool,
    pub children: Vec<ChildSa>,
    pub task_manager: TaskManager,
    pub mobike_supported: bool,
    pub last_inbound_at: Instant,
    pub dpd_interval: Duration,
    /// DH scalar generated for the in-flight IKE_SA_INIT exchange, held
    /// between `build` (which emits the public share) and `process`
    /// (which needs the scalar to compute the shared secret). Cleared
    /// once SK_* keys are derived.
    pub pending_dh_private: Option<DhPrivate>,
    /// Local nonce generated for the in-flight IKE_SA_INIT exchange,
    /// held alongside `pending_dh_private` for the same reason.
    pub pending_local_nonce: Option<Vec<u8>>,
    /// CREATE_CHILD_SA-shaped negotiation in flight (a standalone rekey
    /// task, or the child-creation half of IKE_AUTH), bridging the call
    /// that selects terms and the call that finishes KEYMAT derivation.
    pub pending_child: Option<crate::task::PendingChildNegotiation>,
}

impl IkeSa {
    pub fn new_half_open(spi_initiator: u64, remote_addr: IpAddr, local_addr: IpAddr, config: Arc<IkeCfg>, role: Role) -> Self {
        let dpd_interval = config.dpd_interval;
        let mobike_supported = config.mobike_supported;
        let name = config.name.clone();
        IkeSa {
            spis: SpiPair { initiator: spi_initiator, responder: 0 },
            name,
            state: IkeSaState::Created,
            role,
            local_addr,
            remote_addr,
            keys: None,
            expected_in: 0,
            expected_out: 0,
            window_size: 1,
            config,
            authenticated: false,
            children: Vec::new(),
            task_manager: TaskManager::new(),
            mobike_supported,
            last_inbound_at: Instant::now(),
            dpd_interval,
            pending_dh_private: None,
            pending_local_nonce: None,
            pending_child: None,
        }
    }

    /// Learn the responder SPI once the peer's IKE_SA_INIT response (or
    /// request, on the responder side) is seen. The manager must
    /// re-index the SA under the full pair after this call.
    pub fn set_responder_spi(&mut self, responder_spi: u64) {
        debug!(spi_initiator = %format!("{:016x}", self.spis.initiator), spi_responder = %format!("{:016x}", responder_spi), "half-open IKE_SA learned responder SPI");
        self.spis.responder = responder_spi;
    }

    pub fn next_outbound_message_id(&mut self) -> u32 {
        let id = self.expected_out;
        self.expected_out += 1;
        id
    }

    /// Anything older than `expected_in - 1` is discarded; exactly
    /// `expected_in - 1` signals a retransmit of the cached response.
    pub fn classify_inbound(&self, message_id: u32) -> InboundClass {
        if message_id == self.expected_in {
            InboundClass::Fresh
        } else if self.expected_in > 0 && message_id == self.expected_in - 1 {
            debug!(name = %self.name, message_id, expected_in = self.expected_in, "inbound message is a retransmit");
            InboundClass::Retransmit
        } else {
            warn!(name = %self.name, message_id, expected_in = self.expected_in, "dropping stale/future inbound message-id");
            InboundClass::Stale
        }
    }

    pub fn advance_expected_in(&mut self) {
        self.expected_in += 1;
    }

    pub fn touch_inbound(&mut self) {
        self.last_inbound_at = Instant::now();
    }

    pub fn dpd_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_inbound_at) >= self.dpd_interval
    }

    pub fn child_with_reqid(&self, reqid: u32) -> Option<&ChildSa> {
        self.children.iter().find(|c| c.reqid == reqid)
    }

    pub fn child_with_reqid_mut(&mut self, reqid: u32) -> Option<&mut ChildSa> {
        self.children.iter_mut().find(|c| c.reqid == reqid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundClass {
    Fresh,
    Retransmit,
    Stale,
}
