//! Lease records and persistent lease storage.
//!
//! This module holds the lease table the allocator writes through:
//!
//! - [`MacAddress`] and [`Lease`], one record per hardware address
//! - [`LeaseStore`], the storage interface the [`Allocator`](crate::Allocator)
//!   depends on, with an atomic insert-or-conflict primitive on the bound IP
//! - [`JsonLeaseStore`], a write-through store persisted to a JSON file
//! - [`spawn_purge_sweeper`], a background task for routine reclamation
//!
//! # Thread Safety
//!
//! [`JsonLeaseStore`] keeps its table behind a [`RwLock`]. Lookups share the
//! read lock; every mutation takes the write lock, persists the new table and
//! only then publishes it, so the unique-IP check and the insert are one step.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A 48-bit hardware address.
///
/// Parsing and formatting are those of [`MacAddr6`]: `aa:bb:cc:dd:ee:ff`,
/// `AA-BB-CC-DD-EE-FF` and `aabb.ccdd.eeff` are accepted, and the address
/// displays as uppercase, colon-separated hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacAddress(MacAddr6);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(MacAddr6::from(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0.into_array()
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(MacAddr6::from(octets))
    }
}

impl From<MacAddr6> for MacAddress {
    fn from(mac: MacAddr6) -> Self {
        Self(mac)
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        input
            .trim()
            .parse::<MacAddr6>()
            .map(Self)
            .map_err(|error| Error::InvalidMacAddress(format!("{}: {}", input, error)))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Returns `at + duration`, saturating at the latest representable time.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A binding between a hardware address and an IPv4 address.
///
/// MAC and IP never change once the row exists; renewal only moves the
/// two expiry timestamps forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,

    /// Created by explicit request (preferred IP or direct insertion)
    /// rather than by the sequential scan.
    #[serde(default)]
    pub reserved: bool,

    /// Exempt from purging and refreshed on every allocation.
    #[serde(default)]
    pub persistent: bool,

    /// After this point the address may be reclaimed by an aggressive purge.
    pub lease_end: DateTime<Utc>,

    /// After this point the address may be reclaimed by a routine purge.
    pub lease_grace_end: DateTime<Utc>,
}

impl Lease {
    /// Creates a scan-style lease (neither reserved nor persistent).
    pub fn new(
        mac: MacAddress,
        ip: Ipv4Addr,
        lease_end: DateTime<Utc>,
        lease_grace_end: DateTime<Utc>,
    ) -> Self {
        Self {
            mac,
            ip,
            reserved: false,
            persistent: false,
            lease_end,
            lease_grace_end,
        }
    }

    /// Creates a lease ending `duration` from now with `grace_period` on top.
    pub fn starting_now(
        mac: MacAddress,
        ip: Ipv4Addr,
        duration: Duration,
        grace_period: Duration,
    ) -> Self {
        let lease_end = add_duration(Utc::now(), duration);
        Self::new(mac, ip, lease_end, add_duration(lease_end, grace_period))
    }

    pub fn with_reserved(mut self, reserved: bool) -> Self {
        self.reserved = reserved;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Returns true if `lease_end` has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_end < now
    }

    /// Returns true if `lease_grace_end` has passed.
    pub fn is_grace_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_grace_end < now
    }

    /// Returns seconds remaining until `lease_end`, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        let remaining = self.lease_end - Utc::now();
        remaining.num_seconds().max(0)
    }

    fn purgeable(&self, now: DateTime<Utc>, aggressive: bool) -> bool {
        if self.persistent {
            return false;
        }
        if aggressive {
            self.is_expired(now)
        } else {
            self.is_grace_expired(now)
        }
    }

    fn check_timestamps(&self) -> Result<()> {
        if self.lease_grace_end < self.lease_end {
            return Err(Error::InvalidLease(format!(
                "grace end {} precedes lease end {} for {}",
                self.lease_grace_end, self.lease_end, self.mac
            )));
        }
        Ok(())
    }
}

/// Storage backend for the lease table.
///
/// Rows are keyed by MAC, and the bound IP is unique across all rows that
/// have not been purged. [`set_lease`](LeaseStore::set_lease) must check and
/// insert atomically: the allocator relies on it to settle races between
/// concurrent callers.
#[async_trait]
pub trait LeaseStore: Send + Sync + fmt::Debug {
    /// Point lookup. A missing row is `Ok(None)`, not an error.
    async fn get_lease(&self, mac: MacAddress) -> Result<Option<Lease>>;

    /// Creates or overwrites the row for `lease.mac`.
    ///
    /// Fails with [`Error::Conflict`] when `lease.ip` is bound to a
    /// different MAC.
    async fn set_lease(&self, lease: Lease) -> Result<()>;

    /// Moves the expiry timestamps of an existing row.
    ///
    /// Fails with [`Error::LeaseNotFound`] if `mac` has no row.
    async fn renew_lease(
        &self,
        mac: MacAddress,
        lease_end: DateTime<Utc>,
        lease_grace_end: DateTime<Utc>,
    ) -> Result<Lease>;

    /// Deletes non-persistent rows whose grace end (or, when `aggressive`,
    /// whose lease end) has passed. Returns how many rows were removed.
    async fn purge_leases(&self, aggressive: bool) -> Result<usize>;

    /// Deletes the row for `mac`, returning it if there was one.
    async fn remove_lease(&self, mac: MacAddress) -> Result<Option<Lease>>;

    /// Returns every row, ordered by IP.
    async fn list_leases(&self) -> Result<Vec<Lease>>;

    /// Flushes and releases the backing storage. Later calls fail with
    /// [`Error::StoreClosed`].
    async fn close(&self) -> Result<()>;
}

/// On-disk format of the lease file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseFile {
    leases: Vec<Lease>,
}

/// Lease rows plus the reverse IP index that enforces uniqueness.
#[derive(Debug, Clone, Default)]
struct Table {
    leases: HashMap<MacAddress, Lease>,
    ip_to_mac: HashMap<Ipv4Addr, MacAddress>,
}

impl Table {
    fn from_rows(rows: Vec<Lease>) -> Result<Self> {
        let mut table = Table::default();
        for lease in rows {
            lease.check_timestamps()?;
            if table.leases.contains_key(&lease.mac) {
                return Err(Error::InvalidLease(format!(
                    "duplicate rows for {}",
                    lease.mac
                )));
            }
            if let Some(holder) = table.ip_to_mac.get(&lease.ip) {
                return Err(Error::InvalidLease(format!(
                    "{} is bound to both {} and {}",
                    lease.ip, holder, lease.mac
                )));
            }
            table.insert(lease);
        }
        Ok(table)
    }

    fn insert(&mut self, lease: Lease) {
        let (mac, ip) = (lease.mac, lease.ip);
        if let Some(old) = self.leases.insert(mac, lease)
            && old.ip != ip
        {
            self.ip_to_mac.remove(&old.ip);
        }
        self.ip_to_mac.insert(ip, mac);
    }

    fn remove(&mut self, mac: &MacAddress) -> Option<Lease> {
        let lease = self.leases.remove(mac)?;
        self.ip_to_mac.remove(&lease.ip);
        Some(lease)
    }

    fn sorted_rows(&self) -> Vec<Lease> {
        let mut rows: Vec<Lease> = self.leases.values().cloned().collect();
        rows.sort_by_key(|lease| lease.ip);
        rows
    }
}

#[derive(Debug)]
struct InternalState {
    table: Table,
    closed: bool,
}

/// Lease store persisted to a JSON file.
///
/// Every mutation rewrites the file (temp file + rename) before it returns,
/// so an acknowledged binding survives a restart. A store created with
/// [`in_memory`](JsonLeaseStore::in_memory) has no file and loses its table
/// on drop.
///
/// # Example
///
/// ```no_run
/// use dhcpalloc::{JsonLeaseStore, LeaseStore};
///
/// # async fn example() -> dhcpalloc::Result<()> {
/// let store = JsonLeaseStore::open("leases.json").await?;
/// let purged = store.purge_leases(false).await?;
/// store.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct JsonLeaseStore {
    state: RwLock<InternalState>,
    path: Option<PathBuf>,
}

impl JsonLeaseStore {
    /// Opens the lease file at `path`, starting empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if two of its rows share a MAC or an IP.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let table = Self::load_table(&path).await?;

        info!(
            "Loaded {} lease(s) from {}",
            table.leases.len(),
            path.display()
        );

        Ok(Self {
            state: RwLock::new(InternalState {
                table,
                closed: false,
            }),
            path: Some(path),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(InternalState {
                table: Table::default(),
                closed: false,
            }),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn load_table(path: &Path) -> Result<Table> {
        if !path.exists() {
            return Ok(Table::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let file: LeaseFile = serde_json::from_str(&content)?;
        Table::from_rows(file.leases)
            .map_err(|error| error.context(format!("loading {}", path.display())))
    }

    async fn persist(&self, table: &Table) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(&LeaseFile {
            leases: table.sorted_rows(),
        })?;

        let mut temp_path = path.clone().into_os_string();
        temp_path.push(".tmp");
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }

    /// Applies `mutate` to a copy of the table, persists it, then publishes it.
    ///
    /// A failed write leaves the in-memory table untouched.
    async fn commit<T>(
        &self,
        state: &mut InternalState,
        mutate: impl FnOnce(&mut Table) -> T,
    ) -> Result<T> {
        let mut next = state.table.clone();
        let output = mutate(&mut next);
        self.persist(&next).await?;
        state.table = next;
        Ok(output)
    }
}

fn ensure_open(state: &InternalState) -> Result<()> {
    if state.closed {
        Err(Error::StoreClosed)
    } else {
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for JsonLeaseStore {
    async fn get_lease(&self, mac: MacAddress) -> Result<Option<Lease>> {
        let state = self.state.read().await;
        ensure_open(&state)?;
        Ok(state.table.leases.get(&mac).cloned())
    }

    async fn set_lease(&self, lease: Lease) -> Result<()> {
        lease.check_timestamps()?;

        let mut state = self.state.write().await;
        ensure_open(&state)?;

        if let Some(holder) = state.table.ip_to_mac.get(&lease.ip)
            && *holder != lease.mac
        {
            return Err(Error::Conflict {
                ip: lease.ip,
                holder: *holder,
            });
        }

        self.commit(&mut state, |table| table.insert(lease)).await
    }

    async fn renew_lease(
        &self,
        mac: MacAddress,
        lease_end: DateTime<Utc>,
        lease_grace_end: DateTime<Utc>,
    ) -> Result<Lease> {
        let mut state = self.state.write().await;
        ensure_open(&state)?;

        let mut lease = state
            .table
            .leases
            .get(&mac)
            .cloned()
            .ok_or(Error::LeaseNotFound(mac))?;
        lease.lease_end = lease_end;
        lease.lease_grace_end = lease_grace_end;
        lease.check_timestamps()?;

        let renewed = lease.clone();
        self.commit(&mut state, |table| table.insert(lease)).await?;
        Ok(renewed)
    }

    async fn purge_leases(&self, aggressive: bool) -> Result<usize> {
        let mut state = self.state.write().await;
        ensure_open(&state)?;

        let now = Utc::now();
        let expired: Vec<MacAddress> = state
            .table
            .leases
            .values()
            .filter(|lease| lease.purgeable(now, aggressive))
            .map(|lease| lease.mac)
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        let count = expired.len();
        self.commit(&mut state, |table| {
            for mac in &expired {
                table.remove(mac);
            }
        })
        .await?;

        debug!("Purged {} lease(s) (aggressive: {})", count, aggressive);
        Ok(count)
    }

    async fn remove_lease(&self, mac: MacAddress) -> Result<Option<Lease>> {
        let mut state = self.state.write().await;
        ensure_open(&state)?;

        if !state.table.leases.contains_key(&mac) {
            return Ok(None);
        }
        self.commit(&mut state, |table| table.remove(&mac)).await
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        let state = self.state.read().await;
        ensure_open(&state)?;
        Ok(state.table.sorted_rows())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.closed {
            return Ok(());
        }
        self.persist(&state.table).await?;
        state.closed = true;
        Ok(())
    }
}

/// Spawns a task that runs a routine (non-aggressive) purge every `period`.
///
/// Store errors are logged and the sweep continues; the task ends once the
/// store reports it has been closed.
pub fn spawn_purge_sweeper(store: Arc<dyn LeaseStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match store.purge_leases(false).await {
                Ok(0) => {}
                Ok(count) => info!("Lease sweep reclaimed {} address(es)", count),
                Err(error) if matches!(error.root(), Error::StoreClosed) => {
                    debug!("Lease store closed, stopping sweeper");
                    break;
                }
                Err(error) => warn!("Lease sweep failed: {}", error),
            }
        }
    })
}
