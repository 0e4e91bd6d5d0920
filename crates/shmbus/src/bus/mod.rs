//! Method-call bus: connections, name ownership, fire-and-forget calls and a
//! blocking listen.
//!
//! # Architecture
//!
//! - **connection**: `BusConnection` session handle (initialize/open/enqueue/listen/close)
//! - **nonblocking**: `AsyncBusConnection`, the same handle driven from the tokio blocking pool
//! - **transport**: `BusTransport`/`BusLink` traits every transport implements
//! - **router**: connection registry, well-known name table, call routing
//! - **local**: in-process transport over a shared router
//! - **socket** / **broker**: Unix-socket client and the broker it talks to
//! - **wire**: frame types and the length-delimited JSON codec

pub mod broker;
pub mod connection;
pub mod local;
pub mod message;
pub mod nonblocking;
pub mod router;
pub mod socket;
pub mod transport;
pub mod wire;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use broker::Broker;
pub use connection::BusConnection;
pub use local::LocalBus;
pub use message::{CallAddress, CallFilter, MethodCall, ReceivedCall};
pub use nonblocking::AsyncBusConnection;
pub use router::{RequestNameReply, RouteError, Router};
pub use socket::SocketTransport;
pub use transport::{BusLink, BusTransport, TransportError};

/// Largest content carried by one method call, in bytes.
pub const MAX_CONTENT_LEN: usize = 4096;

/// Application-defined tag distinguishing call kinds without parsing the payload.
pub type CmdType = u8;

/// Which bus a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BusType {
    Session = 0,
    System = 1,
    /// The bus that started this process; resolves like the session bus unless
    /// configured otherwise.
    Starter = 2,
}

impl BusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::System => "system",
            Self::Starter => "starter",
        }
    }
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for BusType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Session),
            1 => Ok(Self::System),
            2 => Ok(Self::Starter),
            other => Err(other),
        }
    }
}

impl FromStr for BusType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            "starter" => Ok(Self::Starter),
            other => Err(format!("unknown bus type '{other}'")),
        }
    }
}

bitflags::bitflags! {
    /// Policy applied when claiming a well-known name that may already be owned.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NameFlags: u32 {
        /// Let a later requester with `REPLACE_EXISTING` take the name from us.
        const ALLOW_REPLACEMENT = 0x1;
        /// Take the name from an owner that allows replacement.
        const REPLACE_EXISTING = 0x2;
        /// Fail instead of waiting in the queue for the name.
        const DO_NOT_QUEUE = 0x4;
    }
}

impl Default for NameFlags {
    fn default() -> Self {
        Self::REPLACE_EXISTING
    }
}
