//! Transport seam between `BusConnection` and whatever carries its calls.
//!
//! Implementations:
//! - **LocalBus**: in-process router, one per bus type
//! - **SocketTransport**: Unix-socket client talking to `shmbus-busd`

use std::io;
use std::time::Duration;

use super::message::{CallFilter, MethodCall};
use super::router::{RequestNameReply, RouteError};
use super::{BusType, MAX_CONTENT_LEN, NameFlags};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("name not acquired: {0:?}")]
    NameNotAcquired(RequestNameReply),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("receive buffer of {size} bytes is below {required}")]
    BufferTooSmall { size: usize, required: usize },

    #[error("not connected")]
    Disconnected,

    #[error("timed out")]
    TimedOut,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Numeric status reported through `IpcError`.
    pub fn code(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(-1),
            Self::NameNotAcquired(reply) => *reply as i32,
            Self::Route(e) => e.code(),
            Self::BufferTooSmall { .. } => 1,
            Self::Disconnected => 2,
            Self::TimedOut => 3,
            Self::Protocol(_) => 5,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// One live connection to a bus.
pub trait BusLink: Send {
    /// Unique name assigned by the bus (`:1.N`).
    fn unique_name(&self) -> &str;

    fn request_name(&mut self, name: &str, flags: NameFlags) -> TransportResult<RequestNameReply>;

    /// Queue `call` for delivery. Does not wait for the receiver.
    fn send_call(&mut self, call: MethodCall) -> TransportResult<()>;

    /// Wait for the next call matching `filter`, discarding others.
    ///
    /// `timeout` of `None` waits indefinitely, `Some(Duration::ZERO)` only
    /// drains what has already arrived. `max_len` below [`MAX_CONTENT_LEN`]
    /// fails with `BufferTooSmall` before anything is read.
    fn receive_call(
        &mut self,
        filter: &CallFilter,
        max_len: usize,
        timeout: Option<Duration>,
    ) -> TransportResult<MethodCall>;

    fn disconnect(&mut self) -> TransportResult<()>;
}

/// Factory for [`BusLink`]s.
pub trait BusTransport: Send + Sync {
    fn connect_anonymous(&self, bus_type: BusType) -> TransportResult<Box<dyn BusLink>>;

    /// Connect and claim `name`. Succeeds only if the link ends up primary owner.
    fn connect_named(
        &self,
        bus_type: BusType,
        name: &str,
        flags: NameFlags,
    ) -> TransportResult<Box<dyn BusLink>> {
        let mut link = self.connect_anonymous(bus_type)?;
        let reply = match link.request_name(name, flags) {
            Ok(reply) => reply,
            Err(e) => {
                let _ = link.disconnect();
                return Err(e);
            }
        };
        if !reply.is_owner() {
            tracing::debug!(name, ?reply, "Name not acquired, dropping link");
            let _ = link.disconnect();
            return Err(TransportError::NameNotAcquired(reply));
        }
        Ok(link)
    }

    /// Receive buffer size handed to new connections.
    fn receive_buffer(&self) -> usize {
        MAX_CONTENT_LEN
    }
}

pub(crate) fn check_buffer(max_len: usize) -> TransportResult<()> {
    if max_len < MAX_CONTENT_LEN {
        return Err(TransportError::BufferTooSmall {
            size: max_len,
            required: MAX_CONTENT_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_listen_status() {
        assert_eq!(TransportError::BufferTooSmall { size: 1, required: 4096 }.code(), 1);
        assert_eq!(TransportError::Disconnected.code(), 2);
        assert_eq!(TransportError::NameNotAcquired(RequestNameReply::Exists).code(), 3);
        assert_eq!(
            TransportError::Io(io::Error::from_raw_os_error(111)).code(),
            111
        );
    }

    #[test]
    fn buffer_check() {
        assert!(check_buffer(MAX_CONTENT_LEN).is_ok());
        assert!(matches!(
            check_buffer(16),
            Err(TransportError::BufferTooSmall { size: 16, required: 4096 })
        ));
    }
}
