use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_DB_FILE: &str = "leases.json";
const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    pub gateway: Ipv4Addr,
    #[serde(default = "default_db_file")]
    pub db_file: PathBuf,
    pub dynamic_range: Range,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default = "default_sweep_interval", with = "duration_str")]
    pub sweep_interval: Duration,
}

/// Inclusive IPv4 interval addresses are scanned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub from: Ipv4Addr,
    pub to: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default, with = "duration_str")]
    pub duration: Duration,
    #[serde(default, with = "duration_str")]
    pub grace_period: Duration,
}

fn default_db_file() -> PathBuf {
    PathBuf::from(DEFAULT_DB_FILE)
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: DEFAULT_LEASE_DURATION,
            grace_period: Duration::ZERO,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dns_servers: Vec::new(),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            db_file: default_db_file(),
            dynamic_range: Range::new(
                Ipv4Addr::new(192, 168, 1, 100),
                Ipv4Addr::new(192, 168, 1, 200),
            ),
            lease: LeaseConfig::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl Range {
    pub fn new(from: Ipv4Addr, to: Ipv4Addr) -> Self {
        Self { from, to }
    }

    pub fn validate(&self) -> Result<()> {
        if self.from > self.to {
            return Err(Error::InvalidConfig(format!(
                "IPs are improperly specified in range: {}",
                self
            )));
        }
        Ok(())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip >= self.from && ip <= self.to
    }

    /// Number of addresses in the range, both ends included.
    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.to)).saturating_sub(u64::from(u32::from(self.from))) + 1
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

impl Config {
    /// Loads the configuration at `path`, writing the defaults there first
    /// if the file does not exist.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parses YAML, fills in defaults for zero-valued fields and validates.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(content)?;
        if config.lease.duration.is_zero() {
            config.lease.duration = DEFAULT_LEASE_DURATION;
        }
        if config.db_file.as_os_str().is_empty() {
            config.db_file = default_db_file();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.dynamic_range
            .validate()
            .map_err(|error| error.context("could not validate dynamic range"))?;

        if self.lease.duration.is_zero() {
            return Err(Error::InvalidConfig(
                "lease duration must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "sweep_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parses a duration such as `"100ms"`, `"1h 30m"` or a bare `"0"`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    humantime::parse_duration(input)
        .map_err(|error| Error::InvalidConfig(format!("invalid duration {:?}: {}", input, error)))
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
