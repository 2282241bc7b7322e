//! Error types for the lease allocator.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv4Addr;

use crate::lease::MacAddress;

/// Errors that can occur while allocating or storing leases.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system I/O error (lease file or configuration file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (lease file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error (configuration file).
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) when the
    /// configuration contains invalid values (e.g., range `from` > `to`).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A hardware address string could not be parsed.
    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),

    /// A lease record or lease file violates the table's invariants
    /// (grace end before lease end, duplicate MAC or IP rows).
    #[error("Invalid lease: {0}")]
    InvalidLease(String),

    /// The dynamic range has no free address, even after an aggressive purge.
    ///
    /// Terminal for the allocation that returned it. The allocator never
    /// retries internally.
    #[error("IP range exhausted")]
    RangeExhausted,

    /// No lease exists for the specified MAC.
    ///
    /// Returned when attempting to renew or remove a lease that doesn't exist.
    #[error("no lease for {0}")]
    LeaseNotFound(MacAddress),

    /// The address is already bound to a different MAC.
    #[error("{ip} is already leased to {holder}")]
    Conflict { ip: Ipv4Addr, holder: MacAddress },

    /// The store was used after [`LeaseStore::close`](crate::LeaseStore::close).
    #[error("lease store is closed")]
    StoreClosed,

    /// Another error, annotated with what was being processed.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps this error with a description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping any [`Error::Context`] layers.
    pub fn root(&self) -> &Error {
        let mut error = self;
        while let Error::Context { source, .. } = error {
            error = source;
        }
        error
    }

    /// True if this is a unique-IP conflict, however deeply wrapped.
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict { .. })
    }

    /// True if the range was exhausted, however deeply wrapped.
    pub fn is_range_exhausted(&self) -> bool {
        matches!(self.root(), Error::RangeExhausted)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::LeaseNotFound(_))
    }
}

/// A specialized Result type for lease operations.
pub type Result<T> = std::result::Result<T, Error>;
