//! Connection registry, well-known name table and call routing.
//!
//! Name ownership follows the `RequestName` rules of a D-Bus daemon:
//! - unowned name: requester becomes primary owner
//! - owner allows replacement and requester asks to replace: requester takes over,
//!   old owner is queued first (dropped instead if it asked not to queue)
//! - requester asked not to queue: `Exists`
//! - otherwise the requester waits in the queue
//!
//! Dropping a connection hands each name it owned to the next queued connection.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::message::MethodCall;
use super::{MAX_CONTENT_LEN, NameFlags};

pub type ConnectionId = u64;

const UNIQUE_PREFIX: &str = ":1.";
const NAME_MAX: usize = 255;

/// Where the router hands delivered calls for one connection.
pub trait Deliver {
    /// Returns `false` once the peer can no longer receive.
    fn deliver(&self, call: MethodCall) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

impl RequestNameReply {
    pub fn is_owner(&self) -> bool {
        matches!(self, Self::PrimaryOwner | Self::AlreadyOwner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteError {
    #[error("invalid bus name '{name}'")]
    InvalidName { name: String },

    #[error("no connection owns '{name}'")]
    ServiceUnknown { name: String },

    #[error("unknown connection {id}")]
    UnknownConnection { id: ConnectionId },

    #[error("content of {size} bytes exceeds {limit}")]
    ContentTooLarge { size: usize, limit: usize },
}

impl RouteError {
    pub fn code(&self) -> i32 {
        match self {
            Self::ContentTooLarge { .. } => 1,
            Self::InvalidName { .. } => 16,
            Self::ServiceUnknown { .. } => 17,
            Self::UnknownConnection { .. } => 18,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NameClaim {
    conn: ConnectionId,
    flags: NameFlags,
}

struct Peer<D> {
    unique_name: String,
    sink: D,
}

pub struct Router<D> {
    next_id: ConnectionId,
    peers: HashMap<ConnectionId, Peer<D>>,
    /// Front of each queue is the primary owner.
    names: HashMap<String, VecDeque<NameClaim>>,
}

impl<D> Default for Router<D> {
    fn default() -> Self {
        Self {
            next_id: 1,
            peers: HashMap::new(),
            names: HashMap::new(),
        }
    }
}

impl<D: Deliver> Router<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and assign its unique name.
    pub fn connect(&mut self, sink: D) -> (ConnectionId, String) {
        let id = self.next_id;
        self.next_id += 1;
        let unique_name = format!("{UNIQUE_PREFIX}{id}");
        self.peers.insert(
            id,
            Peer {
                unique_name: unique_name.clone(),
                sink,
            },
        );
        tracing::debug!(conn = id, %unique_name, "Connection registered");
        (id, unique_name)
    }

    pub fn request_name(
        &mut self,
        conn: ConnectionId,
        name: &str,
        flags: NameFlags,
    ) -> Result<RequestNameReply, RouteError> {
        if !self.peers.contains_key(&conn) {
            return Err(RouteError::UnknownConnection { id: conn });
        }
        if !is_valid_well_known_name(name) {
            return Err(RouteError::InvalidName {
                name: name.to_string(),
            });
        }

        let claim = NameClaim { conn, flags };
        let queue = self.names.entry(name.to_string()).or_default();
        let Some(owner) = queue.front().copied() else {
            queue.push_back(claim);
            tracing::debug!(conn, name, "Name acquired");
            return Ok(RequestNameReply::PrimaryOwner);
        };

        if owner.conn == conn {
            queue[0].flags = flags;
            return Ok(RequestNameReply::AlreadyOwner);
        }

        let queued_at = queue.iter().position(|c| c.conn == conn);

        let reply = if owner.flags.contains(NameFlags::ALLOW_REPLACEMENT)
            && flags.contains(NameFlags::REPLACE_EXISTING)
        {
            if let Some(i) = queued_at {
                queue.remove(i);
            }
            queue.pop_front();
            queue.push_front(claim);
            if !owner.flags.contains(NameFlags::DO_NOT_QUEUE) {
                queue.insert(1, owner);
            }
            tracing::debug!(conn, previous = owner.conn, name, "Name replaced");
            RequestNameReply::PrimaryOwner
        } else if flags.contains(NameFlags::DO_NOT_QUEUE) {
            if let Some(i) = queued_at {
                queue.remove(i);
            }
            RequestNameReply::Exists
        } else {
            match queued_at {
                Some(i) => queue[i].flags = flags,
                None => queue.push_back(claim),
            }
            RequestNameReply::InQueue
        };
        Ok(reply)
    }

    /// Remove a connection, promoting queued owners of every name it held.
    ///
    /// Returns `false` for an unknown connection.
    pub fn disconnect(&mut self, conn: ConnectionId) -> bool {
        let Some(peer) = self.peers.remove(&conn) else {
            return false;
        };

        self.names.retain(|name, queue| {
            let was_owner = queue.front().is_some_and(|c| c.conn == conn);
            queue.retain(|c| c.conn != conn);
            if was_owner && let Some(next) = queue.front() {
                tracing::debug!(name = %name, conn = next.conn, "Name passed to queued connection");
            }
            !queue.is_empty()
        });

        tracing::debug!(conn, unique_name = %peer.unique_name, "Connection removed");
        true
    }

    /// Deliver `call` from `from` to the connection owning `call.target`.
    pub fn route(&mut self, from: ConnectionId, mut call: MethodCall) -> Result<(), RouteError> {
        let sender = self
            .peers
            .get(&from)
            .map(|p| p.unique_name.clone())
            .ok_or(RouteError::UnknownConnection { id: from })?;

        if call.content.len() > MAX_CONTENT_LEN {
            return Err(RouteError::ContentTooLarge {
                size: call.content.len(),
                limit: MAX_CONTENT_LEN,
            });
        }

        let dest = self
            .resolve(&call.target)
            .ok_or_else(|| RouteError::ServiceUnknown {
                name: call.target.clone(),
            })?;

        tracing::trace!(
            from = %sender,
            to = dest,
            target = %call.target,
            interface = %call.interface,
            method = %call.method,
            cmd_type = call.cmd_type,
            "Routing method call"
        );
        call.sender = Some(sender);

        let delivered = self
            .peers
            .get(&dest)
            .is_some_and(|peer| peer.sink.deliver(call.clone()));
        if !delivered {
            tracing::debug!(conn = dest, "Destination gone, dropping connection");
            self.disconnect(dest);
            return Err(RouteError::ServiceUnknown { name: call.target });
        }
        Ok(())
    }

    /// Resolve a unique (`:1.N`) or well-known name to a live connection.
    pub fn resolve(&self, name: &str) -> Option<ConnectionId> {
        match name.strip_prefix(UNIQUE_PREFIX) {
            Some(id) => id.parse().ok().filter(|id| self.peers.contains_key(id)),
            None => self.names.get(name).and_then(|q| q.front()).map(|c| c.conn),
        }
    }

    /// Unique name of the primary owner of `name`.
    pub fn owner(&self, name: &str) -> Option<&str> {
        let conn = self.names.get(name)?.front()?.conn;
        self.peers.get(&conn).map(|p| p.unique_name.as_str())
    }

    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }
}

/// At least two dot-separated elements of `[A-Za-z0-9_-]`, none empty or
/// starting with a digit, 255 bytes at most.
pub fn is_valid_well_known_name(name: &str) -> bool {
    if name.is_empty() || name.len() > NAME_MAX || name.starts_with(':') {
        return false;
    }
    let mut elements = 0;
    for element in name.split('.') {
        elements += 1;
        let valid = !element.is_empty()
            && !element.starts_with(|c: char| c.is_ascii_digit())
            && element
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return false;
        }
    }
    elements >= 2
}
