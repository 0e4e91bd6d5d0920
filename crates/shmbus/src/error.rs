use std::time::Duration;

use thiserror::Error;

use crate::codec::Encoding;

/// Errors surfaced by shared-memory and bus session operations.
///
/// Every variant carries enough context (operation, subject, native status code)
/// for the caller to decide on retry. Nothing is retried internally.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("shared memory name '{name}' is {len} bytes, limit is {limit}")]
    NameTooLong {
        name: String,
        len: usize,
        limit: usize,
    },

    #[error("could not create shared memory {name}: {code}")]
    CreateFailed { name: String, code: i32 },

    #[error("could not open shared memory {name}: {code}")]
    OpenFailed { name: String, code: i32 },

    #[error("{op} on {subject}: data size ({size}) exceeded maximum shared memory size ({capacity})")]
    SizeExceeded {
        op: &'static str,
        subject: String,
        size: usize,
        capacity: usize,
    },

    #[error("could not unlink shared memory {name}: {code}")]
    UnlinkFailed { name: String, code: i32 },

    #[error("shared memory {name} is mapped read-only")]
    ReadOnly { name: String },

    #[error("data buffer size ({size}) is less than maximum content size ({required})")]
    BufferTooSmall { size: usize, required: usize },

    #[error("data size ({size}) exceeded maximum msg content size ({limit})")]
    ContentTooLarge { size: usize, limit: usize },

    #[error("could not initialize bus connection {}: {code}", .service.as_deref().unwrap_or("<anonymous>"))]
    ConnectFailed { service: Option<String>, code: i32 },

    #[error("could not call {target} {method}: {code}")]
    DispatchFailed {
        target: String,
        method: String,
        code: i32,
    },

    #[error("not connected anymore ({subject})")]
    ConnectionLost { subject: String },

    #[error("could not listen to method call on {subject}: {code}")]
    ListenFailed { subject: String, code: i32 },

    #[error("no matching method call on {subject} within {timeout:?}")]
    ListenTimedOut { subject: String, timeout: Duration },

    #[error("could not close {subject}: {code}")]
    CloseFailed { subject: String, code: i32 },

    #[error("{op} on closed handle {subject}")]
    Closed { op: &'static str, subject: String },

    #[error("{subject} is already closed")]
    AlreadyClosed { subject: String },

    #[error("invalid {encoding} input: {reason}")]
    Encoding { encoding: Encoding, reason: String },

    #[error("{op} was interrupted before completing")]
    Interrupted { op: &'static str },
}

impl IpcError {
    /// Native status code reported by the layer below, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::CreateFailed { code, .. }
            | Self::OpenFailed { code, .. }
            | Self::UnlinkFailed { code, .. }
            | Self::ConnectFailed { code, .. }
            | Self::DispatchFailed { code, .. }
            | Self::ListenFailed { code, .. }
            | Self::CloseFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, IpcError>;
