//! Sequential address allocation over the dynamic range.
//!
//! The [`Allocator`] turns "give me an address for this MAC" into a concrete
//! IPv4 address:
//!
//! 1. An existing lease for the MAC is returned (renewed when required)
//! 2. A preferred address inside the range is granted if it is free
//! 3. Otherwise the range is scanned upward from the last issued address,
//!    wrapping to the start once, with an aggressive purge at the wrap
//!
//! Steps 1 and 2 run without the cursor lock and lean on the store's atomic
//! insert-or-conflict. Step 3 holds the cursor lock for its whole duration.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, Range};
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseStore, MacAddress, add_duration};

/// Where the next scan starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Nothing issued yet; the next scan starts at this address.
    Seed(Ipv4Addr),
    /// The most recently issued address; the next scan starts after it.
    Issued(Ipv4Addr),
}

impl Cursor {
    /// The first candidate of the next scan, or `None` past `255.255.255.255`.
    fn next(self) -> Option<Ipv4Addr> {
        match self {
            Cursor::Seed(first) => Some(first),
            Cursor::Issued(last) => u32::from(last).checked_add(1).map(Ipv4Addr::from),
        }
    }

    fn issued(self) -> Option<Ipv4Addr> {
        match self {
            Cursor::Seed(_) => None,
            Cursor::Issued(last) => Some(last),
        }
    }
}

/// Allocates addresses from one dynamic range.
///
/// Safe to share between concurrent callers (wrap it in an [`Arc`]); one
/// allocator per address pool.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use dhcpalloc::{Allocator, Config, JsonLeaseStore};
///
/// # async fn example() -> dhcpalloc::Result<()> {
/// let config = Config::default();
/// let store = Arc::new(JsonLeaseStore::open(&config.db_file).await?);
/// let allocator = Allocator::new(store, &config, None)?;
///
/// let mac = "aa:bb:cc:dd:ee:ff".parse()?;
/// let ip = allocator.allocate(mac, false, None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Allocator {
    store: Arc<dyn LeaseStore>,
    range: Range,
    lease_duration: Duration,
    grace_period: Duration,
    cursor: Mutex<Cursor>,
}

impl Allocator {
    /// Creates an allocator whose first scan starts at `initial`
    /// (the range's lower bound when `None`).
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not validate.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        config: &Config,
        initial: Option<Ipv4Addr>,
    ) -> Result<Self> {
        config.validate()?;

        let range = config.dynamic_range;
        let initial = initial.unwrap_or(range.from);

        info!("Allocating from {} ({} addresses)", range, range.size());

        Ok(Self {
            store,
            range,
            lease_duration: config.lease.duration,
            grace_period: config.lease.grace_period,
            cursor: Mutex::new(Cursor::Seed(initial)),
        })
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// The most recently issued scan address, `None` until a scan succeeds.
    pub async fn last_ip(&self) -> Option<Ipv4Addr> {
        self.cursor.lock().await.issued()
    }

    /// Lease end and grace end for a lease starting at `now`.
    fn expiry(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let lease_end = add_duration(now, self.lease_duration);
        (lease_end, add_duration(lease_end, self.grace_period))
    }

    /// Returns an address for `mac`, creating or renewing its lease.
    ///
    /// # Allocation Priority
    ///
    /// 1. Existing lease for this MAC. It is renewed when `renew` is set and
    ///    either expiry has passed, and always when the lease is persistent.
    /// 2. `preferred`, if it lies in the dynamic range and is not bound.
    /// 3. The next free address after the last one issued, wrapping once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RangeExhausted`] if no address is free after one
    /// aggressive purge, or a wrapped store error naming the MAC and IP
    /// being processed.
    pub async fn allocate(
        &self,
        mac: MacAddress,
        renew: bool,
        preferred: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr> {
        let now = Utc::now();

        let existing = self
            .store
            .get_lease(mac)
            .await
            .map_err(|error| error.context(format!("could not look up lease for mac [{}]", mac)))?;

        if let Some(lease) = existing {
            return self.refresh(lease, renew, now).await;
        }

        let (lease_end, grace_end) = self.expiry(now);

        if let Some(preferred) = preferred
            && self.range.contains(preferred)
        {
            info!(
                "Preferred IP ({}) supplied; will attempt leasing that for [{}]",
                preferred, mac
            );
            let lease = Lease::new(mac, preferred, lease_end, grace_end).with_reserved(true);
            match self.store.set_lease(lease).await {
                Ok(()) => return Ok(preferred),
                Err(error) if error.is_conflict() => {
                    warn!(
                        "[{}] Lease for preferred IP ({}) was rejected: {}",
                        mac, preferred, error
                    );
                }
                Err(error) => {
                    return Err(error.context(format!(
                        "could not lease preferred ip [{}] for mac [{}]",
                        preferred, mac
                    )));
                }
            }
        }

        self.scan(mac, lease_end, grace_end).await
    }

    async fn refresh(&self, lease: Lease, renew: bool, now: DateTime<Utc>) -> Result<Ipv4Addr> {
        let lapsed = lease.is_expired(now) || lease.is_grace_expired(now);
        if !(renew && lapsed) && !lease.persistent {
            return Ok(lease.ip);
        }

        let (lease_end, grace_end) = self.expiry(now);
        let renewed = self
            .store
            .renew_lease(lease.mac, lease_end, grace_end)
            .await
            .map_err(|error| {
                error.context(format!(
                    "could not renew lease for mac [{}] ip [{}]",
                    lease.mac, lease.ip
                ))
            })?;

        debug!("Renewed lease {} for {}", renewed.ip, renewed.mac);
        Ok(renewed.ip)
    }

    /// Scans the range for a free address. Holds the cursor lock throughout.
    async fn scan(
        &self,
        mac: MacAddress,
        lease_end: DateTime<Utc>,
        grace_end: DateTime<Utc>,
    ) -> Result<Ipv4Addr> {
        let mut cursor = self.cursor.lock().await;
        let mut candidate = cursor.next();
        let mut wrapped = false;

        loop {
            let ip = match candidate {
                Some(ip) if self.range.contains(ip) => ip,
                _ => {
                    if wrapped {
                        warn!("IP range {} exhausted, cannot lease to {}", self.range, mac);
                        return Err(Error::RangeExhausted);
                    }
                    wrapped = true;

                    let purged = self
                        .store
                        .purge_leases(true)
                        .await
                        .map_err(|error| error.context("trying to clean up lease table"))?;
                    if purged > 0 {
                        info!("Reclaimed {} expired lease(s) while scanning for {}", purged, mac);
                    }

                    self.range.from
                }
            };

            let lease = Lease::new(mac, ip, lease_end, grace_end);
            match self.store.set_lease(lease).await {
                Ok(()) => {
                    *cursor = Cursor::Issued(ip);
                    return Ok(ip);
                }
                Err(error) if error.is_conflict() => {
                    debug!("{} is taken, continuing scan for {}", ip, mac);
                    candidate = Cursor::Issued(ip).next();
                }
                Err(error) => {
                    return Err(error.context(format!(
                        "could not lease ip [{}] for mac [{}]",
                        ip, mac
                    )));
                }
            }
        }
    }
}
