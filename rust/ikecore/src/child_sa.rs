//! CHILD_SA state: the pair of unidirectional IPsec SAs negotiated under
//! an IKE_SA, plus the traffic selectors and lifetimes that govern them.

use tracing::debug;
use zeroize::Zeroize;

use crate::proposal::Proposal;
use crate::ts::TrafficSelector;

/// IPsec protocol a CHILD_SA negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Protocol {
    Esp,
    Ah,
}

/// Encapsulation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Mode {
    Tunnel,
    Transport,
}

/// Direction a kernel policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Direction {
    In,
    Out,
    Forward,
}

/// Key material and parameters needed to install one CHILD_SA generation
/// into the kernel; constructed from KEYMAT slices.
#[derive(Clone)]
pub struct ChildSaDescriptor {
    pub protocol: Protocol,
    pub mode: Mode,
    pub encap: bool,
    pub encr_key_i: Vec<u8>,
    pub encr_key_r: Vec<u8>,
    pub integ_key_i: Vec<u8>,
    pub integ_key_r: Vec<u8>,
    pub lifetime_soft_secs: u64,
    pub lifetime_hard_secs: u64,
}

impl Drop for ChildSaDescriptor {
    fn drop(&mut self) {
        self.encr_key_i.zeroize();
        self.encr_key_r.zeroize();
        self.integ_key_i.zeroize();
        self.integ_key_r.zeroize();
    }
}

/// KEYMAT is sliced in the fixed order encr_i, integ_i, encr_r, integ_r,
/// each slice sized by the chosen transforms' `Algorithm::key_size` (and
/// a fixed integrity key length when the negotiated integrity algorithm
/// is combined/implicit).
pub struct KeymatLengths {
    pub encr_key_bytes: usize,
    pub integ_key_bytes: usize,
}

pub fn split_keymat(keymat: &[u8], lengths: &KeymatLengths) -> Option<ChildSaDescriptor> {
    let unit = lengths.encr_key_bytes + lengths.integ_key_bytes;
    if keymat.len() < unit * 2 {
        debug!(got = keymat.len(), need = unit * 2, "KEYMAT too short to slice into CHILD_SA keys");
        return None;
    }
    let mut offset = 0;
    let mut take = |n: usize| {
        let slice = keymat[offset..offset + n].to_vec();
        offset += n;
        slice
    };
    let encr_key_i = take(lengths.encr_key_bytes);
    let integ_key_i = take(lengths.integ_key_bytes);
    let encr_key_r = take(lengths.encr_key_bytes);
    let integ_key_r = take(lengths.integ_key_bytes);

    Some(ChildSaDescriptor {
        protocol: Protocol::Esp,
        mode: Mode::Tunnel,
        encap: false,
        encr_key_i,
        encr_key_r,
        integ_key_i,
        integ_key_r,
        lifetime_soft_secs: 0,
        lifetime_hard_secs: 0,
    })
}

/// An IPsec child security association: the daemon-side record of one
/// CHILD_SA generation, independent of whichever kernel entries currently
/// back it (those live in [`crate::kernel::KernelCache`]).
pub struct ChildSa {
    pub reqid: u32,
    pub spi_in: u32,
    pub spi_out: u32,
    pub protocol: Protocol,
    pub mode: Mode,
    pub proposal: Proposal,
    pub local_ts: Vec<TrafficSelector>,
    pub remote_ts: Vec<TrafficSelector>,
    pub lifetime_soft_secs: u64,
    pub lifetime_hard_secs: u64,
    /// Random jitter subtracted from the soft lifetime so that both ends
    /// of a long-lived SA don't rekey at the exact same instant.
    pub rekey_jitter_secs: u64,
    pub installed: bool,
}

impl ChildSa {
    pub fn soft_rekey_at_secs(&self) -> u64 {
        self.lifetime_soft_secs.saturating_sub(self.rekey_jitter_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keymat_split_respects_fixed_order() {
        let lengths = KeymatLengths {
            encr_key_bytes: 4,
            integ_key_bytes: 2,
        };
        let mut keymat = Vec::new();
        keymat.extend_from_slice(&[1, 1, 1, 1]); // encr_i
        keymat.extend_from_slice(&[2, 2]); // integ_i
        keymat.extend_from_slice(&[3, 3, 3, 3]); // encr_r
        keymat.extend_from_slice(&[4, 4]); // integ_r

        let descriptor = split_keymat(&keymat, &lengths).unwrap();
        assert_eq!(descriptor.encr_key_i, vec![1, 1, 1, 1]);
        assert_eq!(descriptor.integ_key_i, vec![2, 2]);
        assert_eq!(descriptor.encr_key_r, vec![3, 3, 3, 3]);
        assert_eq!(descriptor.integ_key_r, vec![4, 4]);
    }

    #[test]
    fn keymat_too_short_returns_none() {
        let lengths = KeymatLengths {
            encr_key_bytes: 16,
            integ_key_bytes: 20,
        };
        assert!(split_keymat(&[0u8; 10], &lengths).is_none());
    }

    #[test]
    fn soft_rekey_time_subtracts_jitter() {
        let child = ChildSa {
            reqid: 1,
            spi_in: 1,
            spi_out: 2,
            protocol: Protocol::Esp,
            mode: Mode::Tunnel,
            proposal: Proposal::new(crate::proposal::ProtocolId::Esp),
            local_ts: vec![],
            remote_ts: vec![],
            lifetime_soft_secs: 3000,
            lifetime_hard_secs: 3600,
            rekey_jitter_secs: 120,
            installed: false,
        };
        assert_eq!(child.soft_rekey_at_secs(), 2880);
    }
}
