//! shmbus: named shared-memory segments and a method-call bus for
//! cross-process messaging.

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
#[cfg(unix)]
pub mod shm;

pub use bus::{
    AsyncBusConnection, BusConnection, BusType, CallAddress, CmdType, LocalBus, MAX_CONTENT_LEN,
    NameFlags, ReceivedCall, SocketTransport,
};
pub use codec::{Content, Encoding, Payload};
pub use config::BusConfig;
pub use error::{IpcError, Result};
#[cfg(unix)]
pub use shm::{Mode, SEGMENT_NAME_MAX, SharedMemory};
