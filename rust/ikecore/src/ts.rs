//! Traffic selector narrowing.
//!
//! A traffic selector is a protocol/address-range/port-range tuple, and
//! the interesting operation is a componentwise greatest common subset
//! (`intersect`) plus `is_contained_in` (used to drop redundant entries
//! after narrowing a whole list).

use std::net::IpAddr;

/// Protocol/address-range/port-range tuple identifying packets an SA
/// protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSelector {
    /// 0 acts as a wildcard (matches any protocol).
    pub protocol: u8,
    pub from_addr: IpAddr,
    pub to_addr: IpAddr,
    pub from_port: u16,
    pub to_port: u16,
    /// Address binding deferred until a virtual IP is known.
    pub dynamic: bool,
}

impl TrafficSelector {
    /// A selector covering a single host and single protocol/port.
    pub fn host(addr: IpAddr, protocol: u8, port: u16) -> Self {
        TrafficSelector {
            protocol,
            from_addr: addr,
            to_addr: addr,
            from_port: port,
            to_port: port,
            dynamic: false,
        }
    }

    /// A selector covering all addresses, protocols and ports of one
    /// family — used for site-to-site "any" selectors.
    pub fn wildcard(family_example: IpAddr) -> Self {
        let (from, to) = match family_example {
            IpAddr::V4(_) => (
                IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
                IpAddr::V4(std::net::Ipv4Addr::new(255, 255, 255, 255)),
            ),
            IpAddr::V6(_) => (
                IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
                IpAddr::V6(std::net::Ipv6Addr::new(
                    0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff,
                )),
            ),
        };
        TrafficSelector {
            protocol: 0,
            from_addr: from,
            to_addr: to,
            from_port: 0,
            to_port: 65535,
            dynamic: false,
        }
    }

    fn family_matches(&self, other: &TrafficSelector) -> bool {
        matches!(
            (self.from_addr, other.from_addr),
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
        )
    }

    /// Componentwise greatest common subset of `self` and `other`, or
    /// `None` if the intersection is empty in any dimension.
    pub fn intersect(&self, other: &TrafficSelector) -> Option<TrafficSelector> {
        if !self.family_matches(other) {
            return None;
        }

        let protocol = match (self.protocol, other.protocol) {
            (0, p) => p,
            (p, 0) => p,
            (a, b) if a == b => a,
            _ => return None,
        };

        let from_addr = std::cmp::max(self.from_addr, other.from_addr);
        let to_addr = std::cmp::min(self.to_addr, other.to_addr);
        if from_addr > to_addr {
            return None;
        }

        let from_port = self.from_port.max(other.from_port);
        let to_port = self.to_port.min(other.to_port);
        if from_port > to_port {
            return None;
        }

        Some(TrafficSelector {
            protocol,
            from_addr,
            to_addr,
            from_port,
            to_port,
            dynamic: self.dynamic && other.dynamic,
        })
    }

    /// `true` if `self` is completely covered by `other`.
    pub fn is_contained_in(&self, other: &TrafficSelector) -> bool {
        if !self.family_matches(other) {
            return false;
        }
        let protocol_ok = other.protocol == 0 || other.protocol == self.protocol;
        protocol_ok
            && other.from_addr <= self.from_addr
            && self.to_addr <= other.to_addr
            && other.from_port <= self.from_port
            && self.to_port <= other.to_port
    }
}

/// Narrow `local` (priority-ordered) against `received`: compute every
/// non-empty pairwise intersection, preserving `local`'s order, then drop
/// any result strictly contained in another result of the same list.
///
/// "No match" is a normal, non-error empty result.
pub fn narrow(local: &[TrafficSelector], received: &[TrafficSelector]) -> Vec<TrafficSelector> {
    let mut candidates = Vec::new();
    for l in local {
        for r in received {
            if let Some(ts) = l.intersect(r) {
                candidates.push(ts);
            }
        }
    }

    let mut result = Vec::with_capacity(candidates.len());
    'outer: for (i, candidate) in candidates.iter().enumerate() {
        for (j, other) in candidates.iter().enumerate() {
            if i == j {
                continue;
            }
            if candidate != other && candidate.is_contained_in(other) {
                continue 'outer;
            }
        }
        result.push(*candidate);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: [u8; 4]) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(a))
    }

    #[test]
    fn intersect_overlapping_ranges() {
        let a = TrafficSelector {
            protocol: 0,
            from_addr: v4([10, 0, 0, 0]),
            to_addr: v4([10, 0, 0, 255]),
            from_port: 0,
            to_port: 65535,
            dynamic: false,
        };
        let b = TrafficSelector {
            protocol: 6,
            from_addr: v4([10, 0, 0, 100]),
            to_addr: v4([10, 0, 1, 0]),
            from_port: 80,
            to_port: 80,
            dynamic: false,
        };
        let got = a.intersect(&b).unwrap();
        assert_eq!(got.from_addr, v4([10, 0, 0, 100]));
        assert_eq!(got.to_addr, v4([10, 0, 0, 255]));
        assert_eq!(got.protocol, 6);
        assert_eq!(got.from_port, 80);
        assert_eq!(got.to_port, 80);
    }

    #[test]
    fn intersect_disjoint_is_none() {
        let a = TrafficSelector::host(v4([10, 0, 0, 1]), 0, 0);
        let b = TrafficSelector::host(v4([10, 0, 0, 2]), 0, 0);
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn narrow_drops_strict_subsets() {
        let wide = TrafficSelector {
            protocol: 0,
            from_addr: v4([10, 0, 0, 0]),
            to_addr: v4([10, 0, 0, 255]),
            from_port: 0,
            to_port: 65535,
            dynamic: false,
        };
        let narrow_one = TrafficSelector::host(v4([10, 0, 0, 5]), 6, 443);
        let local = vec![wide, narrow_one];
        let received = vec![wide];

        let result = narrow(&local, &received);
        // wide ∩ wide = wide; narrow_one ∩ wide = narrow_one, which is
        // strictly contained in wide, so only `wide` survives.
        assert_eq!(result.len(), 1);
        assert_eq!(result[0], wide);
    }

    #[test]
    fn no_match_is_empty_not_error() {
        let a = TrafficSelector::host(v4([10, 0, 0, 1]), 0, 0);
        let b = TrafficSelector::host(v4([192, 168, 0, 1]), 0, 0);
        assert!(narrow(&[a], &[b]).is_empty());
    }

    #[test]
    fn contained_in_respects_protocol_wildcard() {
        let specific = TrafficSelector::host(v4([10, 0, 0, 1]), 6, 443);
        let wildcard_proto = TrafficSelector {
            protocol: 0,
            from_addr: v4([10, 0, 0, 0]),
            to_addr: v4([10, 0, 0, 255]),
            from_port: 0,
            to_port: 65535,
            dynamic: false,
        };
        assert!(specific.is_contained_in(&wildcard_proto));
    }

    proptest::proptest! {
        /// Idempotence law: narrowing an already-narrowed result against
        /// itself must return the same selector, for arbitrary host/port
        /// pairs within a fixed /24.
        #[test]
        fn narrow_is_idempotent_for_arbitrary_hosts(
            last_octet in 1u8..254,
            port in 1u16..65535,
        ) {
            let host = TrafficSelector::host(v4([10, 0, 0, last_octet]), 6, port);
            let once = narrow(&[host], &[host]);
            proptest::prop_assert_eq!(once.len(), 1);
            let twice = narrow(&once, &once);
            proptest::prop_assert_eq!(once, twice);
        }

        /// Every selector returned by `narrow` must be contained in both
        /// of its inputs (the intersection is never wider than either
        /// side).
        #[test]
        fn narrow_result_is_contained_in_both_inputs(
            a_last in 1u8..254,
            b_last in 1u8..254,
        ) {
            let a = TrafficSelector::host(v4([10, 0, 0, a_last]), 0, 0);
            let b = TrafficSelector::host(v4([10, 0, 0, b_last]), 0, 0);
            for ts in narrow(&[a], &[b]) {
                proptest::prop_assert!(ts.is_contained_in(&a));
                proptest::prop_assert!(ts.is_contained_in(&b));
            }
        }
    }
}
