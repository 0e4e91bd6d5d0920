//! Broker wire protocol.
//!
//! A client opens with `Hello` and gets `Welcome` carrying its unique name.
//! Every later request is answered in order (`NameReply`, `Sent` or
//! `Rejected`); `Deliver` frames for incoming calls may interleave at any point.
//! `Goodbye` is acknowledged with `Farewell` before the broker closes the stream.

use serde::{Deserialize, Serialize};

use crate::bus::message::MethodCall;
use crate::bus::router::{RequestNameReply, RouteError};

/// Client to broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame on a new stream.
    Hello,

    RequestName {
        name: String,
        /// `NameFlags` bits.
        flags: u32,
    },

    Call {
        call: MethodCall,
    },

    Goodbye,
}

/// Broker to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerFrame {
    Welcome {
        unique_name: String,
    },

    NameReply {
        reply: RequestNameReply,
    },

    /// The call was handed to its destination.
    Sent,

    Deliver {
        call: MethodCall,
    },

    Rejected {
        error: RouteError,
    },

    Farewell,
}

impl BrokerFrame {
    /// Whether this frame answers a request, as opposed to an unsolicited delivery.
    pub fn is_reply(&self) -> bool {
        !matches!(self, Self::Deliver { .. })
    }
}
