//! Frames exchanged between `SocketTransport` clients and the broker.
//!
//! # Architecture
//!
//! - **protocol**: frame types (`ClientFrame`, `BrokerFrame`)
//! - **codec**: length-prefixed JSON framing, usable over blocking and async streams

pub mod codec;
pub mod protocol;

pub use codec::JsonCodec;
pub use protocol::{BrokerFrame, ClientFrame};
