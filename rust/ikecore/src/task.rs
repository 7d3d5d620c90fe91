//! Task engine: the ordered, retransmitting request/response driver that
//! composes one IKE exchange out of small reusable tasks.

use std::time::Duration;

use tracing::{debug, warn};

use crate::child_sa::{split_keymat, ChildSa, KeymatLengths, Mode, Protocol};
use crate::config::Identity;
use crate::crypto::CryptoProvider;
use crate::error::NotifyType;
use crate::ike_sa::{derive_child_keymat, derive_keys, IkeSa, KeyLengths, Role};
use crate::proposal::{select, Proposal, TransformType};
use crate::ts::{narrow, TrafficSelector};
use crate::wire::{PayloadType, RawPayload};

/// Outcome of a task's `build` or `process` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    NeedMore,
    Done,
    Failed(NotifyType),
}

/// The closed, small set of task kinds, modeled as a tagged union since
/// the set never grows at runtime. `IkeAuth` carries its
/// responder-spawned sub-tasks inline rather than as separate `Task`
/// entries, matching how an IKE_AUTH request is processed as one unit
/// that internally runs authentication then child creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    IkeSaInit,
    IkeAuth { authenticate_done: bool, child_create_done: bool },
    CreateChildSa { is_ike_rekey: bool },
    Informational,
    Dpd,
    Mobike,
}

impl TaskKind {
    /// Canonical ordering of task `build` calls within one exchange:
    /// SA_INIT-shaped payloads first, then KE, then nonce, then
    /// NAT-detect, then CERTREQ.
    fn build_priority(&self) -> u8 {
        match self {
            TaskKind::IkeSaInit => 0,
            TaskKind::IkeAuth { .. } => 1,
            TaskKind::CreateChildSa { .. } => 2,
            TaskKind::Informational => 3,
            TaskKind::Dpd => 4,
            TaskKind::Mobike => 5,
        }
    }
}

/// Material a CREATE_CHILD_SA-shaped exchange (a standalone
/// `CreateChildSa` task or the child-creation half of `IkeAuth`) needs to
/// carry between the call that proposes/selects terms and the call that
/// finishes KEYMAT derivation. Populated lazily by whichever of
/// `build`/`process` runs first for a given task.
pub struct PendingChildNegotiation {
    pub proposal: Proposal,
    pub local_ts: Vec<TrafficSelector>,
    pub remote_ts: Vec<TrafficSelector>,
    pub nonce: Vec<u8>,
    pub reqid: u32,
}

pub struct Task {
    pub kind: TaskKind,
    pub role: Role,
}

impl Task {
    pub fn new(kind: TaskKind, role: Role) -> Self {
        Task { kind, role }
    }

    /// Emit this task's outbound payload contribution into `out`.
    /// Returns `NeedMore` when a response to this material is still
    /// awaited (always true for an initiator-built request), `Done` when
    /// nothing further is needed from this task (a responder-built
    /// reply), or `Failed` if local state makes that impossible (e.g. no
    /// matching local configuration to offer).
    pub fn build(&mut self, sa: &mut IkeSa, provider: &dyn CryptoProvider, out: &mut Vec<RawPayload>) -> TaskResult {
        match &self.kind {
            TaskKind::IkeSaInit => build_ike_sa_init(sa, provider, out, self.role),
            TaskKind::IkeAuth { .. } => build_ike_auth(sa, provider, out, self.role),
            TaskKind::CreateChildSa { is_ike_rekey } => build_create_child_sa(sa, provider, out, self.role, *is_ike_rekey),
            TaskKind::Informational => build_informational(sa, out, self.role),
            TaskKind::Dpd => build_dpd(out, self.role),
            TaskKind::Mobike => build_mobike(sa, out, self.role),
        }
    }

    /// Consume the peer's payload chain for this task's exchange.
    pub fn process(&mut self, sa: &mut IkeSa, provider: &dyn CryptoProvider, inbound: &[RawPayload]) -> TaskResult {
        match &mut self.kind {
            TaskKind::IkeSaInit => process_ike_sa_init(sa, provider, inbound),
            TaskKind::IkeAuth { authenticate_done, child_create_done } => {
                process_ike_auth(sa, provider, inbound, authenticate_done, child_create_done)
            }
            TaskKind::CreateChildSa { is_ike_rekey } => process_create_child_sa(sa, provider, inbound, *is_ike_rekey),
            TaskKind::Informational => process_informational(sa),
            TaskKind::Dpd => process_dpd(sa),
            TaskKind::Mobike => process_mobike(sa, inbound),
        }
    }

    /// Re-home this task onto the opposite role after a simultaneous
    /// rekey/create collision resolves in the peer's favor. Any
    /// per-exchange material generated under the old role is invalidated
    /// since it is no longer meaningful once the direction of the
    /// exchange flips.
    pub fn migrate(&mut self, ike_sa: &mut IkeSa) {
        debug!(kind = ?self.kind, old_role = ?self.role, "migrating task to opposite role after collision resolution");
        self.role = match self.role {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        };
        ike_sa.pending_dh_private = None;
        ike_sa.pending_local_nonce = None;
        ike_sa.pending_child = None;
    }

    /// Release this task without letting it reach `Done`, e.g. when its
    /// owning IKE_SA is torn down mid-exchange.
    pub fn destroy(&mut self) {
        debug!(kind = ?self.kind, "destroying task before completion");
    }
}

fn find_payload<'a>(payloads: &'a [RawPayload], ty: PayloadType) -> Option<&'a [u8]> {
    payloads.iter().find(|p| p.payload_type == ty).map(|p| p.body.as_slice())
}

// --- SA-proposal and traffic-selector wire encoding ---------------------
//
// `proposal::Proposal` and `ts::TrafficSelector` have no wire
// (de)serialization of their own; this task engine is their only caller
// that needs one, so small shadow structs are defined here rather than
// growing those modules' public surface.

#[derive(serde::Serialize, serde::Deserialize)]
struct WireAlgorithm {
    id: u16,
    key_size: u16,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WireTransform {
    transform_type: u8,
    algorithms: Vec<WireAlgorithm>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WireProposal {
    protocol: u8,
    spi: Vec<u8>,
    transforms: Vec<WireTransform>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WireTs {
    protocol: u8,
    from_addr: String,
    to_addr: String,
    from_port: u16,
    to_port: u16,
    dynamic: bool,
}

fn transform_type_tag(ty: TransformType) -> u8 {
    match ty {
        TransformType::Encryption => 1,
        TransformType::Prf => 2,
        TransformType::Integrity => 3,
        TransformType::DiffieHellman => 4,
        TransformType::ExtendedSequenceNumbers => 5,
    }
}

fn transform_type_from_tag(tag: u8) -> Option<TransformType> {
    Some(match tag {
        1 => TransformType::Encryption,
        2 => TransformType::Prf,
        3 => TransformType::Integrity,
        4 => TransformType::DiffieHellman,
        5 => TransformType::ExtendedSequenceNumbers,
        _ => return None,
    })
}

fn protocol_id_tag(id: crate::proposal::ProtocolId) -> u8 {
    use crate::proposal::ProtocolId;
    match id {
        ProtocolId::Ike => 1,
        ProtocolId::Ah => 2,
        ProtocolId::Esp => 3,
    }
}

fn protocol_id_from_tag(tag: u8) -> Option<crate::proposal::ProtocolId> {
    use crate::proposal::ProtocolId;
    Some(match tag {
        1 => ProtocolId::Ike,
        2 => ProtocolId::Ah,
        3 => ProtocolId::Esp,
        _ => return None,
    })
}

fn encode_proposals(proposals: &[Proposal]) -> Vec<u8> {
    let wire: Vec<WireProposal> = proposals
        .iter()
        .map(|p| WireProposal {
            protocol: protocol_id_tag(p.protocol),
            spi: p.spi.clone(),
            transforms: p
                .transforms
                .iter()
                .map(|(ty, algos)| WireTransform {
                    transform_type: transform_type_tag(*ty),
                    algorithms: algos.iter().map(|a| WireAlgorithm { id: a.id, key_size: a.key_size }).collect(),
                })
                .collect(),
        })
        .collect();
    serde_json::to_vec(&wire).expect("proposal list serializes")
}

fn decode_proposals(bytes: &[u8]) -> Option<Vec<Proposal>> {
    let wire: Vec<WireProposal> = serde_json::from_slice(bytes).ok()?;
    let mut out = Vec::with_capacity(wire.len());
    for w in wire {
        let protocol = protocol_id_from_tag(w.protocol)?;
        let mut proposal = Proposal::new(protocol);
        proposal.spi = w.spi;
        for t in w.transforms {
            let ty = transform_type_from_tag(t.transform_type)?;
            let algos = t
                .algorithms
                .into_iter()
                .map(|a| crate::proposal::Algorithm::new(a.id, a.key_size))
                .collect();
            proposal.transforms.insert(ty, algos);
        }
        out.push(proposal);
    }
    Some(out)
}

fn encode_ts(selectors: &[TrafficSelector]) -> Vec<u8> {
    let wire: Vec<WireTs> = selectors
        .iter()
        .map(|ts| WireTs {
            protocol: ts.protocol,
            from_addr: ts.from_addr.to_string(),
            to_addr: ts.to_addr.to_string(),
            from_port: ts.from_port,
            to_port: ts.to_port,
            dynamic: ts.dynamic,
        })
        .collect();
    serde_json::to_vec(&wire).expect("traffic selector list serializes")
}

fn decode_ts(bytes: &[u8]) -> Option<Vec<TrafficSelector>> {
    let wire: Vec<WireTs> = serde_json::from_slice(bytes).ok()?;
    wire.into_iter()
        .map(|w| {
            Some(TrafficSelector {
                protocol: w.protocol,
                from_addr: w.from_addr.parse().ok()?,
                to_addr: w.to_addr.parse().ok()?,
                from_port: w.from_port,
                to_port: w.to_port,
                dynamic: w.dynamic,
            })
        })
        .collect()
}

fn dh_group_for(proposal: &Proposal) -> u16 {
    proposal
        .transforms
        .get(&TransformType::DiffieHellman)
        .and_then(|algos| algos.first())
        .map(|a| a.id)
        .unwrap_or(31)
}

fn prf_algorithm_id(proposal: &Proposal) -> u16 {
    proposal.transforms.get(&TransformType::Prf).and_then(|algos| algos.first()).map(|a| a.id).unwrap_or(5)
}

fn encryption_key_bytes(proposal: &Proposal) -> usize {
    proposal
        .transforms
        .get(&TransformType::Encryption)
        .and_then(|algos| algos.first())
        .map(|a| if a.key_size > 0 { (a.key_size / 8) as usize } else { 32 })
        .unwrap_or(32)
}

fn key_lengths_for(proposal: &Proposal) -> KeyLengths {
    KeyLengths { sk_d: 32, sk_a: 32, sk_e: encryption_key_bytes(proposal), sk_p: 32 }
}

fn identity_bytes(identity: &Identity) -> Vec<u8> {
    match identity {
        Identity::Fqdn(s) | Identity::Rfc822(s) => s.as_bytes().to_vec(),
        Identity::IpAddr(addr) => addr.to_string().into_bytes(),
        Identity::KeyId(bytes) => bytes.clone(),
    }
}

/// `AUTH = prf(SK_p<role>, identity octets)`. A simplified stand-in for
/// RFC 7296 section 2.15's full signed-octets construction (which also
/// covers the peer's first message and nonce); adequate for a PSK-keyed
/// deployment where both ends derive the same `SK_p*`.
fn compute_auth(sa: &IkeSa, provider: &dyn CryptoProvider, role: Role, identity: &[u8]) -> Option<Vec<u8>> {
    let keys = sa.keys.as_ref()?;
    let sk_p = match role {
        Role::Initiator => &keys.sk_pi,
        Role::Responder => &keys.sk_pr,
    };
    let prf = provider.prf(5).ok()?;
    Some(prf.prf(sk_p, identity))
}

fn peer_role(role: Role) -> Role {
    match role {
        Role::Initiator => Role::Responder,
        Role::Responder => Role::Initiator,
    }
}

// --- IKE_SA_INIT ----------------------------------------------------------

fn build_ike_sa_init(sa: &mut IkeSa, provider: &dyn CryptoProvider, out: &mut Vec<RawPayload>, role: Role) -> TaskResult {
    let proposals = sa.config.proposals.clone();
    if proposals.is_empty() {
        return TaskResult::Failed(NotifyType::NoProposalChosen);
    }
    out.push(RawPayload { payload_type: PayloadType::Sa, critical: false, body: encode_proposals(&proposals) });

    let dh_group = dh_group_for(&proposals[0]);
    let dh = match provider.dh(dh_group) {
        Ok(d) => d,
        Err(_) => return TaskResult::Failed(NotifyType::NoProposalChosen),
    };
    let (public, private) = dh.generate_keypair();
    let mut ke_body = Vec::with_capacity(2 + public.len());
    ke_body.extend_from_slice(&dh_group.to_be_bytes());
    ke_body.extend_from_slice(&public);
    out.push(RawPayload { payload_type: PayloadType::Ke, critical: false, body: ke_body });

    let nonce = provider.random_bytes(32);
    out.push(RawPayload { payload_type: PayloadType::Nonce, critical: false, body: nonce.clone() });

    sa.pending_dh_private = Some(private);
    sa.pending_local_nonce = Some(nonce);

    if role == Role::Initiator {
        TaskResult::NeedMore
    } else {
        TaskResult::Done
    }
}

fn process_ike_sa_init(sa: &mut IkeSa, provider: &dyn CryptoProvider, inbound: &[RawPayload]) -> TaskResult {
    let remote_proposals = match find_payload(inbound, PayloadType::Sa).and_then(decode_proposals) {
        Some(p) => p,
        None => return TaskResult::Failed(NotifyType::InvalidSyntax),
    };
    let matched = match select(&sa.config.proposals, &remote_proposals) {
        Some(m) => m,
        None => return TaskResult::Failed(NotifyType::NoProposalChosen),
    };

    let ke_body = match find_payload(inbound, PayloadType::Ke) {
        Some(b) if b.len() > 2 => b,
        _ => return TaskResult::Failed(NotifyType::InvalidSyntax),
    };
    let peer_public = &ke_body[2..];
    let dh_group = dh_group_for(&matched);
    let dh = match provider.dh(dh_group) {
        Ok(d) => d,
        Err(_) => return TaskResult::Failed(NotifyType::NoProposalChosen),
    };

    let private = match sa.pending_dh_private.take() {
        Some(p) => p,
        None => {
            warn!("IKE_SA_INIT response processed with no local DH scalar pending");
            return TaskResult::Failed(NotifyType::InvalidSyntax);
        }
    };
    let shared = match dh.shared_secret(&private, peer_public) {
        Ok(s) => s,
        Err(_) => return TaskResult::Failed(NotifyType::NoProposalChosen),
    };

    let peer_nonce = match find_payload(inbound, PayloadType::Nonce) {
        Some(n) => n.to_vec(),
        None => return TaskResult::Failed(NotifyType::InvalidSyntax),
    };
    let local_nonce = match sa.pending_local_nonce.take() {
        Some(n) => n,
        None => return TaskResult::Failed(NotifyType::InvalidSyntax),
    };
    let (ni, nr) = match sa.role {
        Role::Initiator => (local_nonce, peer_nonce),
        Role::Responder => (peer_nonce, local_nonce),
    };

    let lengths = key_lengths_for(&matched);
    let prf_id = prf_algorithm_id(&matched);
    let keys = match derive_keys(provider, prf_id, &ni, &nr, sa.spis.initiator, sa.spis.responder, &shared, &lengths) {
        Ok(k) => k,
        Err(_) => return TaskResult::Failed(NotifyType::NoProposalChosen),
    };
    sa.keys = Some(keys);
    TaskResult::Done
}

// --- CREATE_CHILD_SA (standalone or embedded in IKE_AUTH) ------------------

fn build_create_child_sa(
    sa: &mut IkeSa,
    provider: &dyn CryptoProvider,
    out: &mut Vec<RawPayload>,
    role: Role,
    is_ike_rekey: bool,
) -> TaskResult {
    let cfg = match sa.config.children.first() {
        Some(c) => c.clone(),
        None => return TaskResult::Failed(NotifyType::TsUnacceptable),
    };

    if sa.pending_child.is_none() {
        let proposals: Vec<Proposal> = if is_ike_rekey {
            cfg.proposals.iter().map(|p| p.without_dh()).collect()
        } else {
            cfg.proposals.clone()
        };
        let proposal = match proposals.into_iter().next() {
            Some(p) => p,
            None => return TaskResult::Failed(NotifyType::NoProposalChosen),
        };
        sa.pending_child = Some(PendingChildNegotiation {
            proposal,
            local_ts: cfg.local_ts.clone(),
            remote_ts: cfg.remote_ts.clone(),
            nonce: provider.random_bytes(32),
            reqid: sa.children.len() as u32 + 1,
        });
    }
    let pending = sa.pending_child.as_ref().expect("just populated above");

    out.push(RawPayload { payload_type: PayloadType::Sa, critical: false, body: encode_proposals(&[pending.proposal.clone()]) });
    out.push(RawPayload { payload_type: PayloadType::TsI, critical: false, body: encode_ts(&pending.local_ts) });
    out.push(RawPayload { payload_type: PayloadType::TsR, critical: false, body: encode_ts(&pending.remote_ts) });
    out.push(RawPayload { payload_type: PayloadType::Nonce, critical: false, body: pending.nonce.clone() });

    if role == Role::Initiator {
        TaskResult::NeedMore
    } else {
        TaskResult::Done
    }
}

fn process_create_child_sa(sa: &mut IkeSa, provider: &dyn CryptoProvider, inbound: &[RawPayload], is_ike_rekey: bool) -> TaskResult {
    let remote_proposals = match find_payload(inbound, PayloadType::Sa).and_then(decode_proposals) {
        Some(p) => p,
        None => return TaskResult::Failed(NotifyType::InvalidSyntax),
    };
    let remote_ts_i = match find_payload(inbound, PayloadType::TsI).and_then(decode_ts) {
        Some(t) => t,
        None => return TaskResult::Failed(NotifyType::InvalidSyntax),
    };
    let remote_ts_r = match find_payload(inbound, PayloadType::TsR).and_then(decode_ts) {
        Some(t) => t,
        None => return TaskResult::Failed(NotifyType::InvalidSyntax),
    };
    let remote_nonce = match find_payload(inbound, PayloadType::Nonce) {
        Some(n) => n.to_vec(),
        None => return TaskResult::Failed(NotifyType::InvalidSyntax),
    };

    if sa.pending_child.is_none() {
        // Responding to a fresh request: select and narrow now, then
        // leave the result pending for `build` to answer with.
        let cfg = match sa.config.children.first() {
            Some(c) => c.clone(),
            None => return TaskResult::Failed(NotifyType::TsUnacceptable),
        };
        let local_proposals: Vec<Proposal> = if is_ike_rekey {
            cfg.proposals.iter().map(|p| p.without_dh()).collect()
        } else {
            cfg.proposals.clone()
        };
        let matched = match select(&local_proposals, &remote_proposals) {
            Some(m) => m,
            None => return TaskResult::Failed(NotifyType::NoProposalChosen),
        };
        let narrowed_local = narrow(&cfg.local_ts, &remote_ts_r);
        let narrowed_remote = narrow(&cfg.remote_ts, &remote_ts_i);
        if narrowed_local.is_empty() || narrowed_remote.is_empty() {
            return TaskResult::Failed(NotifyType::TsUnacceptable);
        }
        sa.pending_child = Some(PendingChildNegotiation {
            proposal: matched,
            local_ts: narrowed_local,
            remote_ts: narrowed_remote,
            nonce: provider.random_bytes(32),
            reqid: sa.children.len() as u32 + 1,
        });
        return TaskResult::NeedMore;
    }

    let pending = sa.pending_child.take().expect("checked above");
    let matched = match select(&[pending.proposal.clone()], &remote_proposals) {
        Some(m) => m,
        None => return TaskResult::Failed(NotifyType::NoProposalChosen),
    };

    let sk_d = match &sa.keys {
        Some(k) => k.sk_d.clone(),
        None => return TaskResult::Failed(NotifyType::NoProposalChosen),
    };
    let lengths = KeymatLengths { encr_key_bytes: encryption_key_bytes(&matched), integ_key_bytes: 32 };
    let total_len = 2 * (lengths.encr_key_bytes + lengths.integ_key_bytes);
    let prf_id = prf_algorithm_id(&matched);

    let (ni, nr) = match sa.role {
        Role::Initiator => (pending.nonce.clone(), remote_nonce),
        Role::Responder => (remote_nonce, pending.nonce.clone()),
    };
    let keymat = match derive_child_keymat(provider, prf_id, &sk_d, None, &ni, &nr, total_len) {
        Ok(k) => k,
        Err(_) => return TaskResult::Failed(NotifyType::NoProposalChosen),
    };
    let descriptor = match split_keymat(&keymat, &lengths) {
        Some(d) => d,
        None => return TaskResult::Failed(NotifyType::NoProposalChosen),
    };
    drop(descriptor); // key bytes consumed by kernel SA installation, not tracked on ChildSa

    let cfg_lifetimes = sa.config.children.first().map(|c| (c.lifetime_soft.as_secs(), c.lifetime_hard.as_secs())).unwrap_or((0, 0));

    sa.children.push(ChildSa {
        reqid: pending.reqid,
        spi_in: 0,
        spi_out: 0,
        protocol: Protocol::Esp,
        mode: Mode::Tunnel,
        proposal: matched,
        local_ts: pending.local_ts,
        remote_ts: pending.remote_ts,
        lifetime_soft_secs: cfg_lifetimes.0,
        lifetime_hard_secs: cfg_lifetimes.1,
        rekey_jitter_secs: 0,
        installed: false,
    });
    TaskResult::Done
}

// --- IKE_AUTH --------------------------------------------------------------

fn build_ike_auth(sa: &mut IkeSa, provider: &dyn CryptoProvider, out: &mut Vec<RawPayload>, role: Role) -> TaskResult {
    let id_bytes = identity_bytes(&sa.config.local_id);
    let id_type = match role {
        Role::Initiator => PayloadType::IdI,
        Role::Responder => PayloadType::IdR,
    };
    out.push(RawPayload { payload_type: id_type, critical: false, body: id_bytes.clone() });

    let auth = match compute_auth(sa, provider, role, &id_bytes) {
        Some(a) => a,
        None => return TaskResult::Failed(NotifyType::AuthenticationFailed),
    };
    out.push(RawPayload { payload_type: PayloadType::Auth, critical: false, body: auth });

    match build_create_child_sa(sa, provider, out, role, false) {
        TaskResult::Failed(notify) => return TaskResult::Failed(notify),
        _ => {}
    }

    if role == Role::Initiator {
        TaskResult::NeedMore
    } else {
        TaskResult::Done
    }
}

fn process_ike_auth(
    sa: &mut IkeSa,
    provider: &dyn CryptoProvider,
    inbound: &[RawPayload],
    authenticate_done: &mut bool,
    child_create_done: &mut bool,
) -> TaskResult {
    if !*authenticate_done {
        let peer = peer_role(sa.role);
        let id_type = match peer {
            Role::Initiator => PayloadType::IdI,
            Role::Responder => PayloadType::IdR,
        };
        let peer_id = match find_payload(inbound, id_type) {
            Some(id) => id.to_vec(),
            None => return TaskResult::Failed(NotifyType::InvalidSyntax),
        };
        let received_auth = match find_payload(inbound, PayloadType::Auth) {
            Some(a) => a,
            None => return TaskResult::Failed(NotifyType::InvalidSyntax),
        };
        let expected_auth = match compute_auth(sa, provider, peer, &peer_id) {
            Some(a) => a,
            None => return TaskResult::Failed(NotifyType::AuthenticationFailed),
        };
        use subtle::ConstantTimeEq;
        if expected_auth.ct_eq(received_auth).unwrap_u8() != 1 {
            warn!("AUTH payload verification failed");
            return TaskResult::Failed(NotifyType::AuthenticationFailed);
        }
        *authenticate_done = true;
        sa.authenticated = true;
    }

    if !*child_create_done {
        match process_create_child_sa(sa, provider, inbound, false) {
            TaskResult::Done => *child_create_done = true,
            TaskResult::Failed(notify) => return TaskResult::Failed(notify),
            TaskResult::NeedMore => {}
        }
    }

    if *authenticate_done && *child_create_done {
        TaskResult::Done
    } else {
        TaskResult::NeedMore
    }
}

// --- INFORMATIONAL / DPD / MOBIKE ------------------------------------------

fn build_informational(sa: &mut IkeSa, out: &mut Vec<RawPayload>, role: Role) -> TaskResult {
    let _ = (sa, out); // a bare INFORMATIONAL exchange carries no mandatory payloads
    if role == Role::Initiator {
        TaskResult::NeedMore
    } else {
        TaskResult::Done
    }
}

fn process_informational(sa: &mut IkeSa) -> TaskResult {
    sa.touch_inbound();
    TaskResult::Done
}

fn build_dpd(out: &mut Vec<RawPayload>, role: Role) -> TaskResult {
    let _ = out; // liveness probe/ack carries no payloads
    if role == Role::Initiator {
        TaskResult::NeedMore
    } else {
        TaskResult::Done
    }
}

fn process_dpd(sa: &mut IkeSa) -> TaskResult {
    sa.touch_inbound();
    TaskResult::Done
}

fn build_mobike(sa: &mut IkeSa, out: &mut Vec<RawPayload>, role: Role) -> TaskResult {
    out.push(RawPayload {
        payload_type: PayloadType::Notify,
        critical: false,
        body: sa.local_addr.to_string().into_bytes(),
    });
    if role == Role::Initiator {
        TaskResult::NeedMore
    } else {
        TaskResult::Done
    }
}

fn process_mobike(sa: &mut IkeSa, inbound: &[RawPayload]) -> TaskResult {
    if let Some(body) = find_payload(inbound, PayloadType::Notify) {
        if let Ok(addr_str) = std::str::from_utf8(body) {
            if let Ok(addr) = addr_str.parse() {
                debug!(old = %sa.remote_addr, new = %addr, "MOBIKE updating peer address");
                sa.remote_addr = addr;
            }
        }
    }
    TaskResult::Done
}

/// Retransmit backoff schedule: `d0, d0*r, d0*r^2, ..` for `n` attempts
/// (defaults: d0=4s, r=1.8, n=5).
#[derive(Debug, Clone, Copy)]
pub struct RetransmitSchedule {
    pub initial: Duration,
    pub factor: f64,
    pub max_attempts: u32,
}

impl Default for RetransmitSchedule {
    fn default() -> Self {
        RetransmitSchedule {
            initial: Duration::from_secs(4),
            factor: 1.8,
            max_attempts: 5,
        }
    }
}

impl RetransmitSchedule {
    /// Delay before retransmit attempt number `attempt` (1-indexed). The
    /// caller declares the SA dead once `attempt > max_attempts`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let seconds = self.initial.as_secs_f64() * self.factor.powi(attempt as i32 - 1);
        Duration::from_secs_f64(seconds)
    }
}

/// Task-manager lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    WaitingForResponse,
    Processing,
    Dead,
}

/// Per-SA engine holding the active and queued task lists, and the
/// retransmit bookkeeping for the in-flight request.
pub struct TaskManager {
    pub state: ManagerState,
    pub active: Vec<Task>,
    pub queued: Vec<Task>,
    pub retransmit_attempt: u32,
    pub schedule: RetransmitSchedule,
    pub cached_response: Option<Vec<u8>>,
    pub cached_response_for_message_id: Option<u32>,
}

impl TaskManager {
    pub fn new() -> Self {
        TaskManager {
            state: ManagerState::Idle,
            active: Vec::new(),
            queued: Vec::new(),
            retransmit_attempt: 0,
            schedule: RetransmitSchedule::default(),
            cached_response: None,
            cached_response_for_message_id: None,
        }
    }

    pub fn enqueue(&mut self, task: Task) {
        self.queued.push(task);
    }

    /// Move all queued tasks into `active`, sorted into canonical build
    /// order, and transition to `WaitingForResponse`.
    pub fn activate_queued(&mut self) {
        self.active.append(&mut self.queued);
        self.active.sort_by_key(|t| t.kind.build_priority());
        self.retransmit_attempt = 0;
        debug!(active_tasks = self.active.len(), "activating queued tasks, waiting for response");
        self.state = ManagerState::WaitingForResponse;
    }

    /// Run `build` on every active task in order, collecting their
    /// payloads into one chain and rolling up the strictest result
    /// (`Failed` beats `NeedMore` beats `Done`).
    pub fn build_active(&mut self, sa: &mut IkeSa, provider: &dyn CryptoProvider) -> (Vec<RawPayload>, TaskResult) {
        let mut out = Vec::new();
        let mut overall = TaskResult::Done;
        for task in &mut self.active {
            let result = task.build(sa, provider, &mut out);
            overall = combine_results(overall, result);
        }
        (out, overall)
    }

    /// Run `process` on every active task against the same inbound
    /// payload chain, then apply the collected results via
    /// `apply_results`.
    pub fn process_active(&mut self, sa: &mut IkeSa, provider: &dyn CryptoProvider, inbound: &[RawPayload]) -> Option<NotifyType> {
        let results: Vec<TaskResult> = self.active.iter_mut().map(|task| task.process(sa, provider, inbound)).collect();
        self.apply_results(&results)
    }

    /// Records a sent response so a retransmitted request (message-id =
    /// expected_in - 1) can be answered without re-running `process`.
    pub fn cache_response(&mut self, message_id: u32, bytes: Vec<u8>) {
        self.cached_response_for_message_id = Some(message_id);
        self.cached_response = Some(bytes);
    }

    pub fn cached_response_for(&self, message_id: u32) -> Option<&[u8]> {
        if self.cached_response_for_message_id == Some(message_id) {
            self.cached_response.as_deref()
        } else {
            None
        }
    }

    /// One retransmit attempt elapsed without a response. Returns the
    /// delay to the *next* attempt, or `None` once the budget is
    /// exhausted (the caller should then transition to `Dead`).
    pub fn note_retransmit_timeout(&mut self) -> Option<Duration> {
        self.retransmit_attempt += 1;
        if self.retransmit_attempt > self.schedule.max_attempts {
            warn!(attempts = self.retransmit_attempt, "retransmit budget exhausted, declaring IKE_SA dead");
            self.state = ManagerState::Dead;
            None
        } else {
            let delay = self.schedule.delay_for_attempt(self.retransmit_attempt);
            debug!(attempt = self.retransmit_attempt, delay_secs = delay.as_secs(), "scheduling retransmit");
            Some(delay)
        }
    }

    /// A matching response arrived: cancel retransmit and move to
    /// `Processing`.
    pub fn on_response_matched(&mut self) {
        self.retransmit_attempt = 0;
        self.state = ManagerState::Processing;
    }

    /// Apply task outcomes collected during `process`. Tasks reporting
    /// `Done` are dropped; any `Failed` is returned to the caller so it
    /// can decide between an INFORMATIONAL delete and an SA destroy —
    /// this module never makes that call itself.
    pub fn apply_results(&mut self, results: &[TaskResult]) -> Option<NotifyType> {
        let mut failure = None;
        let mut keep = Vec::with_capacity(self.active.len());
        for (task, result) in self.active.drain(..).zip(results.iter()) {
            match result {
                TaskResult::Done => {}
                TaskResult::NeedMore => keep.push(task),
                TaskResult::Failed(notify) => failure = failure.or(Some(*notify)),
            }
        }
        self.active = keep;

        if let Some(notify) = failure {
            warn!(?notify, "task failed, exchange not completing cleanly");
            return failure;
        }
        self.state = if self.active.is_empty() {
            ManagerState::Idle
        } else {
            ManagerState::WaitingForResponse
        };
        failure
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        TaskManager::new()
    }
}

fn combine_results(a: TaskResult, b: TaskResult) -> TaskResult {
    match (a, b) {
        (TaskResult::Failed(n), _) | (_, TaskResult::Failed(n)) => TaskResult::Failed(n),
        (TaskResult::NeedMore, _) | (_, TaskResult::NeedMore) => TaskResult::NeedMore,
        _ => TaskResult::Done,
    }
}

/// Lexicographic (big-endian byte-wise) nonce comparison used to resolve
/// simultaneous rekey collisions: the lower nonce wins.
pub fn lower_nonce_wins(local_nonce: &[u8], remote_nonce: &[u8]) -> CollisionOutcome {
    match local_nonce.cmp(remote_nonce) {
        std::cmp::Ordering::Less => CollisionOutcome::LocalWins,
        std::cmp::Ordering::Greater => CollisionOutcome::RemoteWins,
        std::cmp::Ordering::Equal => CollisionOutcome::LocalWins,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionOutcome {
    LocalWins,
    RemoteWins,
}

/// Delete-vs-rekey collision always favors the delete.
pub fn resolve_delete_vs_rekey() -> CollisionOutcome {
    CollisionOutcome::RemoteWins
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    use crate::config::{AuthMethod, IkeCfg, Identity};
    use crate::crypto::SoftwareProvider;
    use crate::proposal::{Algorithm, ProtocolId};

    #[test]
    fn retransmit_schedule_matches_default_sequence() {
        let schedule = RetransmitSchedule::default();
        let delays: Vec<u64> = (1..=5).map(|a| schedule.delay_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![4, 7, 12, 23, 41]);
    }

    #[test]
    fn manager_declares_dead_after_budget_exhausted() {
        let mut tm = TaskManager::new();
        for _ in 0..5 {
            assert!(tm.note_retransmit_timeout().is_some());
        }
        assert!(tm.note_retransmit_timeout().is_none());
        assert_eq!(tm.state, ManagerState::Dead);
    }

    #[test]
    fn activate_queued_sorts_into_canonical_order() {
        let mut tm = TaskManager::new();
        tm.enqueue(Task::new(TaskKind::CreateChildSa { is_ike_rekey: false }, Role::Initiator));
        tm.enqueue(Task::new(TaskKind::IkeSaInit, Role::Initiator));
        tm.activate_queued();
        assert_eq!(tm.active[0].kind, TaskKind::IkeSaInit);
        assert_eq!(tm.state, ManagerState::WaitingForResponse);
    }

    #[test]
    fn apply_results_reports_first_failure() {
        let mut tm = TaskManager::new();
        tm.enqueue(Task::new(TaskKind::IkeSaInit, Role::Initiator));
        tm.enqueue(Task::new(TaskKind::CreateChildSa { is_ike_rekey: false }, Role::Initiator));
        tm.activate_queued();
        let failure = tm.apply_results(&[TaskResult::Done, TaskResult::Failed(NotifyType::NoProposalChosen)]);
        assert_eq!(failure, Some(NotifyType::NoProposalChosen));
    }

    #[test]
    fn apply_results_returns_to_idle_when_all_done() {
        let mut tm = TaskManager::new();
        tm.enqueue(Task::new(TaskKind::IkeSaInit, Role::Initiator));
        tm.activate_queued();
        tm.apply_results(&[TaskResult::Done]);
        assert_eq!(tm.state, ManagerState::Idle);
    }

    #[test]
    fn retransmit_is_answered_from_cache() {
        let mut tm = TaskManager::new();
        tm.cache_response(4, vec![1, 2, 3]);
        assert_eq!(tm.cached_response_for(4), Some([1u8, 2, 3].as_slice()));
        assert_eq!(tm.cached_response_for(5), None);
    }

    #[test]
    fn lower_nonce_numerically_wins_collision() {
        let a = vec![0u8; 15].into_iter().chain([1]).collect::<Vec<u8>>();
        let b = vec![0u8; 15].into_iter().chain([2]).collect::<Vec<u8>>();
        assert_eq!(lower_nonce_wins(&a, &b), CollisionOutcome::LocalWins);
        assert_eq!(lower_nonce_wins(&b, &a), CollisionOutcome::RemoteWins);
    }

    #[test]
    fn delete_always_wins_over_rekey() {
        assert_eq!(resolve_delete_vs_rekey(), CollisionOutcome::RemoteWins);
    }

    fn ike_proposal() -> Proposal {
        Proposal::new(ProtocolId::Ike)
            .with_transform(TransformType::Encryption, vec![Algorithm::new(20, 256)])
            .with_transform(TransformType::Prf, vec![Algorithm::new(5, 0)])
            .with_transform(TransformType::Integrity, vec![Algorithm::new(12, 0)])
            .with_transform(TransformType::DiffieHellman, vec![Algorithm::new(31, 0)])
    }

    fn cfg(proposals: Vec<Proposal>) -> Arc<IkeCfg> {
        Arc::new(IkeCfg {
            name: "test".into(),
            local_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            remote_addr: None,
            local_id: Identity::Fqdn("a.example.com".into()),
            remote_id: None,
            proposals,
            auth_method: AuthMethod::Psk,
            children: vec![],
            dpd_interval: Duration::from_secs(30),
            mobike_supported: true,
        })
    }

    #[test]
    fn ike_sa_init_build_then_process_agree_on_keys() {
        let provider = SoftwareProvider::new();
        let shared_cfg = cfg(vec![ike_proposal()]);
        let spi_i = 0x1111_1111_1111_1111u64;
        let spi_r = 0x2222_2222_2222_2222u64;
        let addr = shared_cfg.local_addr;

        let mut initiator = crate::ike_sa::IkeSa::new_half_open(spi_i, addr, addr, shared_cfg.clone(), Role::Initiator);
        initiator.spis.responder = spi_r;
        let mut responder = crate::ike_sa::IkeSa::new_half_open(spi_i, addr, addr, shared_cfg, Role::Responder);
        responder.spis.responder = spi_r;

        let mut init_task = Task::new(TaskKind::IkeSaInit, Role::Initiator);
        let mut resp_task = Task::new(TaskKind::IkeSaInit, Role::Responder);

        let mut request = Vec::new();
        assert_eq!(init_task.build(&mut initiator, &provider, &mut request), TaskResult::NeedMore);
        let mut response = Vec::new();
        assert_eq!(resp_task.build(&mut responder, &provider, &mut response), TaskResult::Done);

        assert_eq!(init_task.process(&mut initiator, &provider, &response), TaskResult::Done);
        assert_eq!(resp_task.process(&mut responder, &provider, &request), TaskResult::Done);

        let initiator_sk_d = initiator.keys.as_ref().unwrap().sk_d.clone();
        let responder_sk_d = responder.keys.as_ref().unwrap().sk_d.clone();
        assert_eq!(initiator_sk_d, responder_sk_d);
        assert!(initiator.pending_dh_private.is_none());
        assert!(initiator.pending_local_nonce.is_none());
    }

    #[test]
    fn ike_sa_init_build_rejects_when_no_proposals_configured() {
        let provider = SoftwareProvider::new();
        let shared_cfg = cfg(vec![]);
        let addr = shared_cfg.local_addr;
        let mut sa = crate::ike_sa::IkeSa::new_half_open(1, addr, addr, shared_cfg, Role::Initiator);
        let mut task = Task::new(TaskKind::IkeSaInit, Role::Initiator);
        let mut out = Vec::new();
        assert_eq!(task.build(&mut sa, &provider, &mut out), TaskResult::Failed(NotifyType::NoProposalChosen));
    }

    #[test]
    fn migrate_flips_role_and_clears_pending_state() {
        let mut task = Task::new(TaskKind::CreateChildSa { is_ike_rekey: false }, Role::Initiator);
        let shared_cfg = cfg(vec![ike_proposal()]);
        let addr = shared_cfg.local_addr;
        let mut sa = crate::ike_sa::IkeSa::new_half_open(1, addr, addr, shared_cfg, Role::Initiator);
        sa.pending_local_nonce = Some(vec![1, 2, 3]);

        task.migrate(&mut sa);
        assert_eq!(task.role, Role::Responder);
        assert!(sa.pending_local_nonce.is_none());
    }
}
