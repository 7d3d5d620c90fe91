//! IKE_SA manager: a sharded, thread-safe registry handing out exclusive
//! working references, enforcing unique SPI-pair identity, and mitigating
//! half-open floods with cookies.
//!
//! Each shard is a plain `Mutex<HashMap<..>>` rather than a concurrent
//! map, because every entry also needs its own `Condvar` for the
//! checkout wait, which a lock-free concurrent map has no room for.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::{Condvar, Mutex};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::ike_sa::{IkeSa, SpiPair};

const SHARD_COUNT: usize = 32;

/// One entry's mutex-plus-condvar checkout mechanism: a worker blocks on
/// `condvar` until `busy` is false, then claims the entry.
struct Entry {
    sa: Mutex<Option<IkeSa>>,
    busy: Mutex<bool>,
    condvar: Condvar,
}

impl Entry {
    fn new(sa: IkeSa) -> Arc<Entry> {
        Arc::new(Entry {
            sa: Mutex::new(Some(sa)),
            busy: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }
}

struct Shard {
    by_spi: Mutex<HashMap<SpiPair, Arc<Entry>>>,
    by_init_spi: Mutex<HashMap<u64, Arc<Entry>>>,
    by_name: Mutex<HashMap<String, Arc<Entry>>>,
}

impl Shard {
    fn new() -> Self {
        Shard {
            by_spi: Mutex::new(HashMap::new()),
            by_init_spi: Mutex::new(HashMap::new()),
            by_name: Mutex::new(HashMap::new()),
        }
    }
}

/// A worker's exclusive handle on one IKE_SA. The entry is re-marked free
/// and waiters are notified when this is handed back via
/// [`IkeSaManager::checkin`].
pub struct Checkout {
    entry: Arc<Entry>,
    sa: Option<IkeSa>,
}

impl std::ops::Deref for Checkout {
    type Target = IkeSa;
    fn deref(&self) -> &IkeSa {
        self.sa.as_ref().expect("checkout holds its SA until checked in")
    }
}

impl std::ops::DerefMut for Checkout {
    fn deref_mut(&mut self) -> &mut IkeSa {
        self.sa.as_mut().expect("checkout holds its SA until checked in")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutError {
    NotFound,
}

/// Per-remote-address half-open accounting used for cookie/block
/// thresholds.
#[derive(Default)]
struct RemoteCounters {
    half_open: AtomicU32,
}

/// Rotating cookie secret: `cookie = MAC(secret, Ni | IPi | SPIi)`, with
/// the previous secret honored for one rotation so a cookie issued just
/// before a rotation still verifies.
struct CookieSecrets {
    current: Mutex<Vec<u8>>,
    previous: Mutex<Option<Vec<u8>>>,
    rotated_at: Mutex<Instant>,
    rotation_period: Duration,
}

type HmacSha256 = Hmac<Sha256>;

impl CookieSecrets {
    fn new(rotation_period: Duration, initial_secret: Vec<u8>) -> Self {
        CookieSecrets {
            current: Mutex::new(initial_secret),
            previous: Mutex::new(None),
            rotated_at: Mutex::new(Instant::now()),
            rotation_period,
        }
    }

    fn rotate_if_due(&self, new_secret: impl FnOnce() -> Vec<u8>) {
        let mut rotated_at = self.rotated_at.lock();
        if rotated_at.elapsed() < self.rotation_period {
            return;
        }
        let mut current = self.current.lock();
        let mut previous = self.previous.lock();
        *previous = Some(std::mem::replace(&mut *current, new_secret()));
        *rotated_at = Instant::now();
    }

    fn mac(secret: &[u8], ni: &[u8], ip_i: IpAddr, spi_i: u64) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(ni);
        match ip_i {
            IpAddr::V4(v4) => mac.update(&v4.octets()),
            IpAddr::V6(v6) => mac.update(&v6.octets()),
        }
        mac.update(&spi_i.to_be_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn generate(&self, ni: &[u8], ip_i: IpAddr, spi_i: u64) -> Vec<u8> {
        let current = self.current.lock();
        Self::mac(&current, ni, ip_i, spi_i)
    }

    fn verify(&self, cookie: &[u8], ni: &[u8], ip_i: IpAddr, spi_i: u64) -> bool {
        let current = self.current.lock();
        if cookie == Self::mac(&current, ni, ip_i, spi_i) {
            return true;
        }
        if let Some(previous) = self.previous.lock().as_ref() {
            if cookie == Self::mac(previous, ni, ip_i, spi_i) {
                return true;
            }
        }
        false
    }
}

/// Decision returned to the caller deciding how to answer an inbound
/// IKE_SA_INIT, based on the current half-open/cookie/block thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Proceed,
    RequireCookie,
    Drop,
}

pub struct IkeSaManager {
    shards: Vec<Shard>,
    cookie_secrets: CookieSecrets,
    remote_counters: Mutex<HashMap<IpAddr, Arc<RemoteCounters>>>,
    half_open_total: AtomicU32,
    cookie_threshold: u32,
    block_threshold: u32,
    next_spi: AtomicU64,
}

impl IkeSaManager {
    pub fn new(cookie_threshold: u32, block_threshold: u32, cookie_rotation: Duration, initial_secret: Vec<u8>) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Shard::new()).collect();
        IkeSaManager {
            shards,
            cookie_secrets: CookieSecrets::new(cookie_rotation, initial_secret),
            remote_counters: Mutex::new(HashMap::new()),
            half_open_total: AtomicU32::new(0),
            cookie_threshold,
            block_threshold,
            next_spi: AtomicU64::new(1),
        }
    }

    fn shard_for(&self, spi: u64) -> &Shard {
        let idx = (spi as usize).wrapping_mul(2654435761) % self.shards.len();
        &self.shards[idx]
    }

    pub fn allocate_spi(&self) -> u64 {
        self.next_spi.fetch_add(1, Ordering::Relaxed)
    }

    /// Decide how to treat an inbound IKE_SA_INIT from `remote`, per the
    /// half-open/cookie/block thresholds.
    pub fn admit(&self, remote: IpAddr) -> AdmissionDecision {
        let counters = self.counters_for(remote);
        let remote_half_open = counters.half_open.load(Ordering::Acquire);
        if remote_half_open >= self.block_threshold {
            return AdmissionDecision::Drop;
        }
        if self.half_open_total.load(Ordering::Acquire) >= self.cookie_threshold {
            return AdmissionDecision::RequireCookie;
        }
        AdmissionDecision::Proceed
    }

    fn counters_for(&self, remote: IpAddr) -> Arc<RemoteCounters> {
        let mut map = self.remote_counters.lock();
        Arc::clone(map.entry(remote).or_insert_with(|| Arc::new(RemoteCounters::default())))
    }

    pub fn generate_cookie(&self, ni: &[u8], ip_i: IpAddr, spi_i: u64) -> Vec<u8> {
        self.cookie_secrets.rotate_if_due(|| {
            let mut buf = vec![0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut buf);
            buf
        });
        self.cookie_secrets.generate(ni, ip_i, spi_i)
    }

    pub fn verify_cookie(&self, cookie: &[u8], ni: &[u8], ip_i: IpAddr, spi_i: u64) -> bool {
        self.cookie_secrets.verify(cookie, ni, ip_i, spi_i)
    }

    /// Insert a new half-open SA, indexed by initiator SPI and remote
    /// address only (the responder SPI isn't known yet).
    pub fn create_half_open(&self, sa: IkeSa) -> Checkout {
        let init_spi = sa.spis.initiator;
        let remote = sa.remote_addr;
        let entry = Entry::new(sa);

        let shard = self.shard_for(init_spi);
        shard.by_init_spi.lock().insert(init_spi, Arc::clone(&entry));

        self.counters_for(remote).half_open.fetch_add(1, Ordering::AcqRel);
        self.half_open_total.fetch_add(1, Ordering::AcqRel);

        *entry.busy.lock() = true;
        let sa = entry.sa.lock().take();
        debug!(init_spi, "half-open IKE_SA created");
        Checkout { entry, sa }
    }

    /// Re-index a half-open SA once the responder SPI is known. Called
    /// with the checkout already held by the caller.
    pub fn promote_to_full_pair(&self, checkout: &Checkout) {
        let pair = checkout.spis;
        let shard = self.shard_for(pair.initiator);
        shard.by_spi.lock().insert(pair, Arc::clone(&checkout.entry));
    }

    fn checkout_from_entry(&self, entry: Arc<Entry>) -> Checkout {
        let mut busy = entry.busy.lock();
        while *busy {
            entry.condvar.wait(&mut busy);
        }
        *busy = true;
        drop(busy);
        let sa = entry.sa.lock().take();
        Checkout { entry, sa }
    }

    pub fn checkout(&self, spis: SpiPair) -> Result<Checkout, CheckoutError> {
        let shard = self.shard_for(spis.initiator);
        let entry = shard.by_spi.lock().get(&spis).cloned().ok_or(CheckoutError::NotFound)?;
        Ok(self.checkout_from_entry(entry))
    }

    pub fn checkout_by_init_spi(&self, init_spi: u64) -> Result<Checkout, CheckoutError> {
        let shard = self.shard_for(init_spi);
        let entry = shard.by_init_spi.lock().get(&init_spi).cloned().ok_or(CheckoutError::NotFound)?;
        Ok(self.checkout_from_entry(entry))
    }

    pub fn checkout_by_name(&self, name: &str) -> Result<Checkout, CheckoutError> {
        for shard in &self.shards {
            if let Some(entry) = shard.by_name.lock().get(name).cloned() {
                return Ok(self.checkout_from_entry(entry));
            }
        }
        Err(CheckoutError::NotFound)
    }

    pub fn register_name(&self, checkout: &Checkout) {
        let shard = self.shard_for(checkout.spis.initiator);
        shard.by_name.lock().insert(checkout.name.clone(), Arc::clone(&checkout.entry));
    }

    /// Release a checkout. If `destroy` is set, the SA is removed from
    /// every index and waiters are woken to observe `NotFound` on their
    /// next lookup.
    pub fn checkin(&self, mut checkout: Checkout, destroy: bool) {
        let remote = checkout.sa.as_ref().map(|sa| sa.remote_addr);
        let was_half_open = checkout.sa.as_ref().map(|sa| sa.spis.is_half_open()).unwrap_or(false);
        let pair = checkout.sa.as_ref().map(|sa| sa.spis);

        if destroy {
            if let Some(pair) = pair {
                let shard = self.shard_for(pair.initiator);
                shard.by_spi.lock().remove(&pair);
                shard.by_init_spi.lock().remove(&pair.initiator);
                if let Some(sa) = &checkout.sa {
                    shard.by_name.lock().remove(&sa.name);
                }
            }
            if was_half_open {
                self.half_open_total.fetch_sub(1, Ordering::AcqRel);
                if let Some(remote) = remote {
                    if let Some(counters) = self.remote_counters.lock().get(&remote) {
                        counters.half_open.fetch_sub(1, Ordering::AcqRel);
                    }
                }
            }
            info!(?pair, "IKE_SA destroyed");
            *checkout.entry.sa.lock() = None;
        } else {
            *checkout.entry.sa.lock() = checkout.sa.take();
        }

        *checkout.entry.busy.lock() = false;
        checkout.entry.condvar.notify_all();
    }

    /// Snapshot every live SPI pair under shard locks, then check each
    /// out individually, to avoid holding any shard lock across a
    /// blocking checkout.
    pub fn checkout_all(&self) -> Vec<Checkout> {
        let mut pairs = Vec::new();
        for shard in &self.shards {
            pairs.extend(shard.by_spi.lock().keys().copied());
        }
        pairs
            .into_iter()
            .filter_map(|pair| self.checkout(pair).ok())
            .collect()
    }

    pub fn half_open_count(&self) -> u32 {
        self.half_open_total.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMethod, Identity, IkeCfg};
    use crate::ike_sa::Role;
    use std::net::Ipv4Addr;

    fn cfg() -> Arc<IkeCfg> {
        Arc::new(IkeCfg {
            name: "peer".into(),
            local_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            remote_addr: None,
            local_id: Identity::Fqdn("a".into()),
            remote_id: None,
            proposals: vec![],
            auth_method: AuthMethod::Psk,
            children: vec![],
            dpd_interval: Duration::from_secs(30),
            mobike_supported: false,
        })
    }

    fn manager() -> IkeSaManager {
        IkeSaManager::new(10, 20, Duration::from_secs(300), vec![0u8; 32])
    }

    #[test]
    fn checkin_releases_entry_for_later_checkout() {
        let mgr = manager();
        let sa = IkeSa::new_half_open(1, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), cfg().local_addr, cfg(), Role::Responder);
        let checkout = mgr.create_half_open(sa);
        mgr.promote_to_full_pair(&checkout);
        let pair = checkout.spis;

        mgr.checkin(checkout, false);

        let reacquired = mgr.checkout(pair);
        assert!(reacquired.is_ok());
        mgr.checkin(reacquired.unwrap(), false);
    }

    #[test]
    fn checkout_blocks_until_checked_in() {
        let mgr = Arc::new(manager());
        let sa = IkeSa::new_half_open(3, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), cfg().local_addr, cfg(), Role::Responder);
        let checkout = mgr.create_half_open(sa);
        mgr.promote_to_full_pair(&checkout);
        let pair = checkout.spis;

        let mgr2 = Arc::clone(&mgr);
        let waiter = std::thread::spawn(move || {
            let second = mgr2.checkout(pair).unwrap();
            mgr2.checkin(second, false);
        });

        std::thread::sleep(Duration::from_millis(50));
        mgr.checkin(checkout, false);
        waiter.join().unwrap();
    }

    #[test]
    fn checkin_with_destroy_removes_from_indices() {
        let mgr = manager();
        let sa = IkeSa::new_half_open(5, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), cfg().local_addr, cfg(), Role::Responder);
        let checkout = mgr.create_half_open(sa);
        mgr.promote_to_full_pair(&checkout);
        let pair = checkout.spis;
        mgr.checkin(checkout, true);
        assert!(matches!(mgr.checkout(pair), Err(CheckoutError::NotFound)));
    }

    #[test]
    fn half_open_count_tracks_creation_and_destruction() {
        let mgr = manager();
        let remote = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let sa = IkeSa::new_half_open(9, remote, cfg().local_addr, cfg(), Role::Responder);
        let checkout = mgr.create_half_open(sa);
        assert_eq!(mgr.half_open_count(), 1);
        mgr.checkin(checkout, true);
        assert_eq!(mgr.half_open_count(), 0);
    }

    #[test]
    fn admission_requires_cookie_past_threshold() {
        let mgr = IkeSaManager::new(1, 20, Duration::from_secs(300), vec![1u8; 32]);
        let remote = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(mgr.admit(remote), AdmissionDecision::Proceed);
        let sa = IkeSa::new_half_open(1, remote, cfg().local_addr, cfg(), Role::Responder);
        let _checkout = mgr.create_half_open(sa);
        assert_eq!(mgr.admit(remote), AdmissionDecision::RequireCookie);
    }

    #[test]
    fn admission_drops_past_block_threshold() {
        let mgr = IkeSaManager::new(100, 1, Duration::from_secs(300), vec![1u8; 32]);
        let remote = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));
        let sa = IkeSa::new_half_open(2, remote, cfg().local_addr, cfg(), Role::Responder);
        let _checkout = mgr.create_half_open(sa);
        assert_eq!(mgr.admit(remote), AdmissionDecision::Drop);
    }

    #[test]
    fn cookie_verifies_under_current_secret() {
        let mgr = manager();
        let ni = vec![1u8; 16];
        let ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        let cookie = mgr.generate_cookie(&ni, ip, 42);
        assert!(mgr.verify_cookie(&cookie, &ni, ip, 42));
        assert!(!mgr.verify_cookie(&cookie, &ni, ip, 43));
    }
}
