//! # dhcpalloc
//!
//! The address-lease core of a DHCPv4 server: binds hardware addresses to
//! IPv4 addresses drawn from a configured range, tracks lease lifetime and a
//! post-expiry grace period, and persists bindings across restarts.
//!
//! ## Features
//!
//! - Sequential allocation with wraparound and a fair round-robin cursor
//! - Preferred-address hints honored when free and in range
//! - Two-tier expiry: routine purges respect the grace period, aggressive
//!   purges (used when the range is full) ignore it
//! - Persistent (pinned) leases that are never purged
//! - Unique-IP enforcement in the store, safe under concurrent callers
//! - Write-through JSON persistence
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use dhcpalloc::{Allocator, Config, JsonLeaseStore, LeaseStore};
//!
//! #[tokio::main]
//! async fn main() -> dhcpalloc::Result<()> {
//!     let config = Config::load("dhcpalloc.yaml")?;
//!     let store = Arc::new(JsonLeaseStore::open(&config.db_file).await?);
//!     let allocator = Allocator::new(store.clone(), &config, None)?;
//!
//!     let ip = allocator.allocate("aa:bb:cc:dd:ee:ff".parse()?, false, None).await?;
//!     println!("leased {}", ip);
//!
//!     store.close().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Dynamic range, lease timing, DNS/gateway values
//! - [`Allocator`] - Turns a MAC into an address, scanning the range
//! - [`LeaseStore`] - Lease table interface with insert-or-conflict semantics
//! - [`JsonLeaseStore`] - File-backed [`LeaseStore`]

pub mod allocator;
pub mod config;
pub mod error;
pub mod lease;

pub use allocator::Allocator;
pub use config::{Config, LeaseConfig, Range};
pub use error::{Error, Result};
pub use lease::{JsonLeaseStore, Lease, LeaseStore, MacAddress, spawn_purge_sweeper};
