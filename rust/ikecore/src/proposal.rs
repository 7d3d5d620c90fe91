//! Proposal selection.
//!
//! A proposal is a set of transforms, one list per transform type; a
//! local, priority-ordered list of proposals is matched against a
//! remote offer by finding the first local entry with a non-empty
//! intersection, per transform type, against some remote entry.

use std::collections::BTreeMap;

/// IKEv2 transform types (RFC 7296 section 3.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransformType {
    Encryption,
    Prf,
    Integrity,
    DiffieHellman,
    ExtendedSequenceNumbers,
}

/// One (algorithm-id, key-size) pair within a transform type's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Algorithm {
    pub id: u16,
    /// Key size in bits; 0 when the algorithm has no variable key
    /// length attribute.
    pub key_size: u16,
}

impl Algorithm {
    pub fn new(id: u16, key_size: u16) -> Self {
        Algorithm { id, key_size }
    }
}

/// Protocol a proposal applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    Ike,
    Esp,
    Ah,
}

/// Ordered lists, per transform type, of candidate algorithms, plus a
/// protocol tag and an SPI slot. Invariant: within a proposal the
/// per-type lists are priority-ordered (first = most preferred), though
/// that ordering does not affect proposal-vs-proposal selection, only
/// which single algorithm is considered "chosen" for a type that the
/// matcher found a match in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub protocol: ProtocolId,
    pub spi: Vec<u8>,
    pub transforms: BTreeMap<TransformType, Vec<Algorithm>>,
}

impl Proposal {
    pub fn new(protocol: ProtocolId) -> Self {
        Proposal {
            protocol,
            spi: Vec::new(),
            transforms: BTreeMap::new(),
        }
    }

    pub fn with_transform(mut self, ty: TransformType, algos: Vec<Algorithm>) -> Self {
        self.transforms.insert(ty, algos);
        self
    }

    /// Remove the Diffie-Hellman transform, used when a CHILD_SA rekey
    /// reuses the parent IKE_SA's DH and the group should not be part of
    /// the comparison.
    pub fn without_dh(&self) -> Proposal {
        let mut p = self.clone();
        p.transforms.remove(&TransformType::DiffieHellman);
        p
    }

    /// Intersect this proposal's transforms against `other`'s, per
    /// transform type. A transform type absent from both sides is
    /// treated as a match (the "null algorithm" convention). Returns
    /// `None` if any transform type present in `self` fails to find a
    /// match in `other`.
    fn intersect(&self, other: &Proposal) -> Option<Proposal> {
        if self.protocol != other.protocol {
            return None;
        }

        let mut matched = BTreeMap::new();
        for (ty, algos) in &self.transforms {
            match other.transforms.get(ty) {
                None => {
                    if !algos.is_empty() {
                        return None;
                    }
                    matched.insert(*ty, Vec::new());
                }
                Some(remote_algos) => {
                    let common: Vec<Algorithm> = algos
                        .iter()
                        .copied()
                        .filter(|a| remote_algos.contains(a))
                        .collect();
                    if common.is_empty() && !(algos.is_empty() && remote_algos.is_empty()) {
                        return None;
                    }
                    matched.insert(*ty, common);
                }
            }
        }

        // Any transform type present only in `other` (absent in self)
        // also requires the null-algorithm convention to hold.
        for (ty, remote_algos) in &other.transforms {
            if !self.transforms.contains_key(ty) && !remote_algos.is_empty() {
                return None;
            }
        }

        Some(Proposal {
            protocol: self.protocol,
            spi: other.spi.clone(),
            transforms: matched,
        })
    }
}

/// Select the first entry of `local` (priority-ordered) that has a
/// non-empty intersection, per transform type, with some entry of
/// `remote`. The selected proposal inherits the matching remote entry's
/// SPI. "No match" is a normal empty result, not an error.
pub fn select(local: &[Proposal], remote: &[Proposal]) -> Option<Proposal> {
    for l in local {
        for r in remote {
            if let Some(matched) = l.intersect(r) {
                return Some(matched);
            }
        }
    }
    None
}
