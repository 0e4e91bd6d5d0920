//! Where the socket transport finds each bus, and its timing knobs.
//!
//! Environment:
//! - `SHMBUS_SESSION_BUS_ADDRESS`, `SHMBUS_SYSTEM_BUS_ADDRESS`: broker socket paths
//! - `SHMBUS_STARTER_BUS_ADDRESS`: starter bus socket, falls back to the session bus
//! - `SHMBUS_REQUEST_TIMEOUT`: seconds to wait for a broker reply (fractional allowed)

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::{BusType, MAX_CONTENT_LEN};

pub const SESSION_ADDRESS_ENV: &str = "SHMBUS_SESSION_BUS_ADDRESS";
pub const SYSTEM_ADDRESS_ENV: &str = "SHMBUS_SYSTEM_BUS_ADDRESS";
pub const STARTER_ADDRESS_ENV: &str = "SHMBUS_STARTER_BUS_ADDRESS";
pub const REQUEST_TIMEOUT_ENV: &str = "SHMBUS_REQUEST_TIMEOUT";

const SYSTEM_ADDRESS: &str = "/run/shmbus/system.sock";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    pub session_address: PathBuf,
    pub system_address: PathBuf,
    /// `None` means the session address.
    pub starter_address: Option<PathBuf>,
    pub receive_buffer: usize,
    pub request_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset or empty values use defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let runtime_dir = var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        Self {
            session_address: var(SESSION_ADDRESS_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| runtime_dir.join("shmbus").join("session.sock")),
            system_address: var(SYSTEM_ADDRESS_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(SYSTEM_ADDRESS)),
            starter_address: var(STARTER_ADDRESS_ENV).map(PathBuf::from),
            receive_buffer: MAX_CONTENT_LEN,
            request_timeout: var(REQUEST_TIMEOUT_ENV)
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|s| *s > 0.0)
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    pub fn address(&self, bus_type: BusType) -> &Path {
        match bus_type {
            BusType::Session => &self.session_address,
            BusType::System => &self.system_address,
            BusType::Starter => self
                .starter_address
                .as_deref()
                .unwrap_or(self.session_address.as_path()),
        }
    }

    /// Point one bus type at `path`.
    pub fn with_address(mut self, bus_type: BusType, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match bus_type {
            BusType::Session => self.session_address = path,
            BusType::System => self.system_address = path,
            BusType::Starter => self.starter_address = Some(path),
        }
        self
    }

    pub fn with_receive_buffer(mut self, size: usize) -> Self {
        self.receive_buffer = size;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
