//! Kernel interface abstraction: a reference-counted SA/policy cache
//! bridging CHILD_SA lifecycle with an underlying IPsec kernel primitive.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::child_sa::{ChildSaDescriptor, Direction, Mode};
use crate::ts::TrafficSelector;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("kernel call failed: {0}")]
    Failed(i32),
}

pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Events the kernel bridge pushes to the daemon, consumed by the job
/// scheduler's inbound event port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    Acquire { reqid: u32 },
    Expire { spi: u32, proto: u8, hard: bool },
    Mapping { spi: u32, proto: u8, new_remote: IpAddr },
    Migrate { reqid: u32, new_local: IpAddr, new_remote: IpAddr },
    RoamingHint,
}

/// Identity of an installed kernel SA: `(dst, spi, proto)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaKey {
    pub dst: IpAddr,
    pub spi: u32,
    pub proto: u8,
}

/// Identity of an installed kernel policy: `(src_ts, dst_ts, direction)`.
/// Identity is structural, not pointer — two equal tuples refer to the
/// same kernel object and share one refcount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    pub src_ts: TrafficSelector,
    pub dst_ts: TrafficSelector,
    pub direction: Direction,
}

/// Abstract boundary to the OS-specific kernel bridge (netlink / PF_KEY /
/// BSD PF_KEY2). The core never assumes a concrete backend; it is always
/// used through [`KernelCache`], which adds refcounting on top.
pub trait KernelInterface: Send + Sync {
    fn allocate_spi(&self, src: IpAddr, dst: IpAddr, proto: u8, reqid: u32) -> KernelResult<u32>;
    fn install_sa(&self, key: SaKey, descriptor: &ChildSaDescriptor) -> KernelResult<()>;
    fn update_sa_endpoints(
        &self,
        key: SaKey,
        old_src: IpAddr,
        old_dst: IpAddr,
        new_src: IpAddr,
        new_dst: IpAddr,
        encap: bool,
    ) -> KernelResult<()>;
    fn delete_sa(&self, key: SaKey) -> KernelResult<()>;
    fn install_policy(
        &self,
        key: PolicyKey,
        reqid: u32,
        mode: Mode,
        priority_high: bool,
    ) -> KernelResult<()>;
    fn remove_policy(&self, key: PolicyKey) -> KernelResult<()>;
    fn query_sa_use_time(&self, key: SaKey) -> KernelResult<u64>;

    /// Every address currently configured on the host, optionally
    /// filtered to the family of `family_hint` (used to restrict MOBIKE
    /// address enumeration to the families a peer can actually reach).
    fn enumerate_addresses(&self, family_hint: Option<IpAddr>) -> KernelResult<Vec<IpAddr>>;

    /// The source address the kernel's routing table would pick for
    /// traffic toward `dst`, used to detect a local address change
    /// without waiting for a `RoamingHint` event.
    fn default_route_source(&self, dst: IpAddr) -> KernelResult<IpAddr>;

    /// Attach a virtual IP to the host's outbound interface. Distinct
    /// from the virtual-IP *pool* that hands out leases to peers; this is
    /// the local side binding an address a remote pool assigned to it.
    fn attach_virtual_ip(&self, addr: IpAddr) -> KernelResult<()>;

    fn detach_virtual_ip(&self, addr: IpAddr) -> KernelResult<()>;
}

/// A policy/SA record keyed by its identity, with a reference count. The
/// kernel sees exactly one copy; releasing the last reference removes it.
struct PolicyEntry {
    refcount: usize,
    reqid: u32,
    mode: Mode,
}

struct SaEntry {
    refcount: usize,
}

struct VipEntry {
    refcount: usize,
}

/// Reference-counted SA/policy installation cache. During a CHILD_SA
/// rekey two generations briefly coexist and reference identical
/// policies; most kernels refuse duplicate policy installation, so the
/// cache ensures the kernel sees exactly one copy while the daemon's view
/// is "two SAs share this policy".
pub struct KernelCache<K: KernelInterface> {
    backend: Arc<K>,
    policies: DashMap<PolicyKey, PolicyEntry>,
    sas: DashMap<SaKey, SaEntry>,
    virtual_ips: DashMap<IpAddr, VipEntry>,
}

impl<K: KernelInterface> KernelCache<K> {
    pub fn new(backend: Arc<K>) -> Self {
        KernelCache {
            backend,
            policies: DashMap::new(),
            sas: DashMap::new(),
            virtual_ips: DashMap::new(),
        }
    }

    pub fn allocate_spi(&self, src: IpAddr, dst: IpAddr, proto: u8, reqid: u32) -> KernelResult<u32> {
        self.backend.allocate_spi(src, dst, proto, reqid)
    }

    /// Install an SA, incrementing its refcount if the kernel reports
    /// `AlreadyExists` for a matching key.
    pub fn install_sa(&self, key: SaKey, descriptor: &ChildSaDescriptor) -> KernelResult<()> {
        match self.backend.install_sa(key, descriptor) {
            Ok(()) => {
                self.sas.insert(key, SaEntry { refcount: 1 });
                debug!(?key, "kernel SA installed");
                Ok(())
            }
            Err(KernelError::AlreadyExists) => {
                self.sas.entry(key).and_modify(|e| e.refcount += 1).or_insert(SaEntry { refcount: 1 });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn update_sa_endpoints(
        &self,
        key: SaKey,
        old_src: IpAddr,
        old_dst: IpAddr,
        new_src: IpAddr,
        new_dst: IpAddr,
        encap: bool,
    ) -> KernelResult<()> {
        self.backend
            .update_sa_endpoints(key, old_src, old_dst, new_src, new_dst, encap)
    }

    pub fn delete_sa(&self, key: SaKey) -> KernelResult<()> {
        let should_delete = match self.sas.get_mut(&key) {
            Some(mut entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => true,
        };
        if should_delete {
            self.sas.remove(&key);
            self.backend.delete_sa(key)
        } else {
            Ok(())
        }
    }

    /// Install a policy. `AlreadyExists` with a matching reqid is treated
    /// as an increment of the existing entry.
    pub fn install_policy(
        &self,
        key: PolicyKey,
        reqid: u32,
        mode: Mode,
        priority_high: bool,
    ) -> KernelResult<()> {
        if let Some(mut entry) = self.policies.get_mut(&key) {
            if entry.reqid == reqid {
                entry.refcount += 1;
                debug!(?key, refcount = entry.refcount, "policy refcount incremented");
                return Ok(());
            }
            return Err(KernelError::AlreadyExists);
        }

        match self.backend.install_policy(key, reqid, mode, priority_high) {
            Ok(()) => {
                self.policies.insert(key, PolicyEntry { refcount: 1, reqid, mode });
                Ok(())
            }
            Err(KernelError::AlreadyExists) => {
                self.policies.insert(key, PolicyEntry { refcount: 1, reqid, mode });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Decrement the policy's refcount; actually remove only at zero.
    pub fn remove_policy(&self, key: PolicyKey) -> KernelResult<()> {
        let should_remove = match self.policies.get_mut(&key) {
            Some(mut entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => {
                warn!(?key, "remove_policy on unknown key");
                return Err(KernelError::NotFound);
            }
        };
        if should_remove {
            self.policies.remove(&key);
            self.backend.remove_policy(key)
        } else {
            Ok(())
        }
    }

    pub fn query_sa_use_time(&self, key: SaKey) -> KernelResult<u64> {
        self.backend.query_sa_use_time(key)
    }

    pub fn enumerate_addresses(&self, family_hint: Option<IpAddr>) -> KernelResult<Vec<IpAddr>> {
        self.backend.enumerate_addresses(family_hint)
    }

    pub fn default_route_source(&self, dst: IpAddr) -> KernelResult<IpAddr> {
        self.backend.default_route_source(dst)
    }

    /// Attach a virtual IP, incrementing its refcount if already attached
    /// (a CHILD_SA rekey can briefly hold two references to the same
    /// address, same as policies and SAs above).
    pub fn attach_virtual_ip(&self, addr: IpAddr) -> KernelResult<()> {
        if let Some(mut entry) = self.virtual_ips.get_mut(&addr) {
            entry.refcount += 1;
            return Ok(());
        }
        self.backend.attach_virtual_ip(addr)?;
        self.virtual_ips.insert(addr, VipEntry { refcount: 1 });
        Ok(())
    }

    /// Decrement the virtual IP's refcount; actually detach only at zero.
    pub fn detach_virtual_ip(&self, addr: IpAddr) -> KernelResult<()> {
        let should_detach = match self.virtual_ips.get_mut(&addr) {
            Some(mut entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => {
                warn!(%addr, "detach_virtual_ip on unattached address");
                return Err(KernelError::NotFound);
            }
        };
        if should_detach {
            self.virtual_ips.remove(&addr);
            self.backend.detach_virtual_ip(addr)
        } else {
            Ok(())
        }
    }

    pub fn virtual_ip_refcount(&self, addr: &IpAddr) -> usize {
        self.virtual_ips.get(addr).map(|e| e.refcount).unwrap_or(0)
    }

    pub fn policy_refcount(&self, key: &PolicyKey) -> usize {
        self.policies.get(key).map(|e| e.refcount).unwrap_or(0)
    }

    pub fn sa_refcount(&self, key: &SaKey) -> usize {
        self.sas.get(key).map(|e| e.refcount).unwrap_or(0)
    }

    pub fn stats(&self) -> KernelCacheStats {
        KernelCacheStats {
            policy_count: self.policies.len(),
            sa_count: self.sas.len(),
            virtual_ip_count: self.virtual_ips.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct KernelCacheStats {
    pub policy_count: usize,
    pub sa_count: usize,
    pub virtual_ip_count: usize,
}

/// In-memory kernel backend used by tests in place of a real netlink/
/// PF_KEY bridge; records calls instead of touching the OS.
#[derive(Default)]
pub struct NullKernel {
    next_spi: parking_lot::Mutex<u32>,
}

impl NullKernel {
    pub fn new() -> Self {
        NullKernel {
            next_spi: parking_lot::Mutex::new(0xc000_0001),
        }
    }
}

impl KernelInterface for NullKernel {
    fn allocate_spi(&self, _src: IpAddr, _dst: IpAddr, _proto: u8, _reqid: u32) -> KernelResult<u32> {
        let mut next = self.next_spi.lock();
        let spi = *next;
        *next = next.wrapping_add(1);
        Ok(spi)
    }

    fn install_sa(&self, _key: SaKey, _descriptor: &ChildSaDescriptor) -> KernelResult<()> {
        Ok(())
    }

    fn update_sa_endpoints(
        &self,
        _key: SaKey,
        _old_src: IpAddr,
        _old_dst: IpAddr,
        _new_src: IpAddr,
        _new_dst: IpAddr,
        _encap: bool,
    ) -> KernelResult<()> {
        Ok(())
    }

    fn delete_sa(&self, _key: SaKey) -> KernelResult<()> {
        Ok(())
    }

    fn install_policy(&self, _key: PolicyKey, _reqid: u32, _mode: Mode, _priority_high: bool) -> KernelResult<()> {
        Ok(())
    }

    fn remove_policy(&self, _key: PolicyKey) -> KernelResult<()> {
        Ok(())
    }

    fn query_sa_use_time(&self, _key: SaKey) -> KernelResult<u64> {
        Ok(0)
    }

    fn enumerate_addresses(&self, _family_hint: Option<IpAddr>) -> KernelResult<Vec<IpAddr>> {
        Ok(Vec::new())
    }

    fn default_route_source(&self, dst: IpAddr) -> KernelResult<IpAddr> {
        Ok(match dst {
            IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        })
    }

    fn attach_virtual_ip(&self, _addr: IpAddr) -> KernelResult<()> {
        Ok(())
    }

    fn detach_virtual_ip(&self, _addr: IpAddr) -> KernelResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child_sa::Protocol;
    use std::net::Ipv4Addr;

    fn ts(addr: [u8; 4]) -> TrafficSelector {
        TrafficSelector::host(IpAddr::V4(Ipv4Addr::from(addr)), 0, 0)
    }

    fn descriptor() -> ChildSaDescriptor {
        ChildSaDescriptor {
            protocol: Protocol::Esp,
            mode: Mode::Tunnel,
            encap: false,
            encr_key_i: vec![0u8; 16],
            encr_key_r: vec![0u8; 16],
            integ_key_i: vec![0u8; 20],
            integ_key_r: vec![0u8; 20],
            lifetime_soft_secs: 3000,
            lifetime_hard_secs: 3600,
        }
    }

    #[test]
    fn policy_refcount_tracks_two_generations() {
        let cache = KernelCache::new(Arc::new(NullKernel::new()));
        let key = PolicyKey {
            src_ts: ts([10, 0, 0, 1]),
            dst_ts: ts([10, 0, 0, 2]),
            direction: Direction::Out,
        };
        cache.install_policy(key, 7, Mode::Tunnel, false).unwrap();
        cache.install_policy(key, 7, Mode::Tunnel, false).unwrap();
        assert_eq!(cache.policy_refcount(&key), 2);

        cache.remove_policy(key).unwrap();
        assert_eq!(cache.policy_refcount(&key), 1);
        cache.remove_policy(key).unwrap();
        assert_eq!(cache.policy_refcount(&key), 0);
    }

    #[test]
    fn sa_install_increments_on_already_exists() {
        struct AlwaysExists;
        impl KernelInterface for AlwaysExists {
            fn allocate_spi(&self, _: IpAddr, _: IpAddr, _: u8, _: u32) -> KernelResult<u32> {
                Ok(1)
            }
            fn install_sa(&self, _: SaKey, _: &ChildSaDescriptor) -> KernelResult<()> {
                Err(KernelError::AlreadyExists)
            }
            fn update_sa_endpoints(
                &self,
                _: SaKey,
                _: IpAddr,
                _: IpAddr,
                _: IpAddr,
                _: IpAddr,
                _: bool,
            ) -> KernelResult<()> {
                Ok(())
            }
            fn delete_sa(&self, _: SaKey) -> KernelResult<()> {
                Ok(())
            }
            fn install_policy(&self, _: PolicyKey, _: u32, _: Mode, _: bool) -> KernelResult<()> {
                Ok(())
            }
            fn remove_policy(&self, _: PolicyKey) -> KernelResult<()> {
                Ok(())
            }
            fn query_sa_use_time(&self, _: SaKey) -> KernelResult<u64> {
                Ok(0)
            }
            fn enumerate_addresses(&self, _: Option<IpAddr>) -> KernelResult<Vec<IpAddr>> {
                Ok(Vec::new())
            }
            fn default_route_source(&self, dst: IpAddr) -> KernelResult<IpAddr> {
                Ok(dst)
            }
            fn attach_virtual_ip(&self, _: IpAddr) -> KernelResult<()> {
                Ok(())
            }
            fn detach_virtual_ip(&self, _: IpAddr) -> KernelResult<()> {
                Ok(())
            }
        }

        let cache = KernelCache::new(Arc::new(AlwaysExists));
        let key = SaKey {
            dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            spi: 0xc0000001,
            proto: 50,
        };
        cache.install_sa(key, &descriptor()).unwrap();
        assert_eq!(cache.sa_refcount(&key), 1);
    }
}
