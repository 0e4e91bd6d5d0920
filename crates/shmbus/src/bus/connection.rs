//! `BusConnection`: one session on a bus, optionally owning a well-known name.
//!
//! States: live after `initialize`/`open`, closed after `close` or drop. Every
//! operation on a closed handle fails with `IpcError::Closed` instead of
//! touching the transport.

use std::time::Duration;

use super::message::{CallAddress, CallFilter, ReceivedCall};
use super::transport::{BusLink, BusTransport, TransportError};
use super::{BusType, CmdType, LocalBus, MAX_CONTENT_LEN, NameFlags, SocketTransport};
use crate::codec::{self, Encoding, Payload};
use crate::error::{IpcError, Result};

pub struct BusConnection {
    link: Option<Box<dyn BusLink>>,
    bus_type: BusType,
    service_name: Option<String>,
    flags: NameFlags,
    unique_name: String,
    receive_buffer: usize,
}

impl BusConnection {
    /// Connect to `bus_type` through the broker configured in the environment
    /// and claim `service_name` as primary owner.
    pub fn initialize(service_name: &str, bus_type: BusType, flags: Option<NameFlags>) -> Result<Self> {
        Self::initialize_with(&SocketTransport::from_env(), service_name, bus_type, flags)
    }

    pub fn initialize_with(
        transport: &dyn BusTransport,
        service_name: &str,
        bus_type: BusType,
        flags: Option<NameFlags>,
    ) -> Result<Self> {
        let flags = flags.unwrap_or_default();
        let link = transport
            .connect_named(bus_type, service_name, flags)
            .map_err(|e| {
                tracing::debug!(service_name, bus = %bus_type, error = %e, "Bus initialize failed");
                IpcError::ConnectFailed {
                    service: Some(service_name.to_string()),
                    code: e.code(),
                }
            })?;

        tracing::debug!(
            service_name,
            bus = %bus_type,
            unique_name = link.unique_name(),
            flags = flags.bits(),
            "Bus connection initialized"
        );
        Ok(Self::live(link, bus_type, Some(service_name.to_string()), flags, transport))
    }

    /// Anonymous connection through the environment-configured broker.
    pub fn open(bus_type: BusType) -> Result<Self> {
        Self::open_with(&SocketTransport::from_env(), bus_type)
    }

    pub fn open_with(transport: &dyn BusTransport, bus_type: BusType) -> Result<Self> {
        let link = transport
            .connect_anonymous(bus_type)
            .map_err(|e| IpcError::ConnectFailed {
                service: None,
                code: e.code(),
            })?;

        tracing::debug!(bus = %bus_type, unique_name = link.unique_name(), "Bus connection opened");
        Ok(Self::live(link, bus_type, None, NameFlags::empty(), transport))
    }

    /// In-process bus; handy for tests and single-process setups.
    pub fn open_local(bus: &LocalBus, bus_type: BusType) -> Result<Self> {
        Self::open_with(bus, bus_type)
    }

    fn live(
        link: Box<dyn BusLink>,
        bus_type: BusType,
        service_name: Option<String>,
        flags: NameFlags,
        transport: &dyn BusTransport,
    ) -> Self {
        Self {
            unique_name: link.unique_name().to_string(),
            link: Some(link),
            bus_type,
            service_name,
            flags,
            receive_buffer: transport.receive_buffer(),
        }
    }

    pub fn bus_type(&self) -> BusType {
        self.bus_type
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn flags(&self) -> NameFlags {
        self.flags
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_none()
    }

    pub fn receive_buffer(&self) -> usize {
        self.receive_buffer
    }

    /// Size of the buffer incoming content is received into. Listening with
    /// less than [`MAX_CONTENT_LEN`] fails with `BufferTooSmall`.
    pub fn set_receive_buffer(&mut self, size: usize) {
        self.receive_buffer = size;
    }

    fn subject(&self) -> String {
        subject_of(self.service_name.as_deref(), &self.unique_name)
    }

    fn link_mut(&mut self, op: &'static str) -> Result<&mut Box<dyn BusLink>> {
        let Self {
            link,
            service_name,
            unique_name,
            ..
        } = self;
        link.as_mut().ok_or_else(|| IpcError::Closed {
            op,
            subject: subject_of(service_name.as_deref(), unique_name),
        })
    }

    /// Send one method call. Returns once the bus accepted it; there is no reply.
    pub fn enqueue_call<'a>(
        &mut self,
        address: &CallAddress,
        cmd_type: CmdType,
        content: impl Into<Payload<'a>>,
        encoding: Option<Encoding>,
    ) -> Result<()> {
        let link = self.link_mut("enqueue_call")?;

        let bytes = codec::encode(content, encoding)?;
        if bytes.len() > MAX_CONTENT_LEN {
            return Err(IpcError::ContentTooLarge {
                size: bytes.len(),
                limit: MAX_CONTENT_LEN,
            });
        }

        let call = address.to_call(cmd_type, bytes.into_owned());
        tracing::trace!(
            target = %call.target,
            object = %call.object,
            interface = %call.interface,
            method = %call.method,
            cmd_type,
            len = call.content.len(),
            "Enqueueing method call"
        );

        link.send_call(call).map_err(|e| match e {
            TransportError::Disconnected => IpcError::ConnectionLost {
                subject: address.target.clone(),
            },
            e => IpcError::DispatchFailed {
                target: address.target.clone(),
                method: address.method.clone(),
                code: e.code(),
            },
        })
    }

    /// Block until a call for `method` (and `interface`, when given and
    /// non-empty) arrives. Other calls are discarded.
    pub fn listen_call(
        &mut self,
        interface: Option<&str>,
        method: &str,
        encoding: Option<Encoding>,
    ) -> Result<ReceivedCall> {
        self.receive(interface, method, encoding, None)
    }

    /// Like [`listen_call`](Self::listen_call), failing with `ListenTimedOut`
    /// once `timeout` passes without a match.
    pub fn listen_call_timeout(
        &mut self,
        interface: Option<&str>,
        method: &str,
        encoding: Option<Encoding>,
        timeout: Duration,
    ) -> Result<ReceivedCall> {
        self.receive(interface, method, encoding, Some(timeout))
    }

    /// Take a matching call that has already arrived, without waiting.
    pub fn try_listen_call(
        &mut self,
        interface: Option<&str>,
        method: &str,
        encoding: Option<Encoding>,
    ) -> Result<Option<ReceivedCall>> {
        match self.receive(interface, method, encoding, Some(Duration::ZERO)) {
            Ok(call) => Ok(Some(call)),
            Err(IpcError::ListenTimedOut { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn receive(
        &mut self,
        interface: Option<&str>,
        method: &str,
        encoding: Option<Encoding>,
        timeout: Option<Duration>,
    ) -> Result<ReceivedCall> {
        let subject = self.subject();
        let max_len = self.receive_buffer;
        let link = self.link_mut("listen_call")?;
        let filter = CallFilter::new(interface, method);

        let call = link.receive_call(&filter, max_len, timeout).map_err(|e| match e {
            TransportError::BufferTooSmall { size, required } => IpcError::BufferTooSmall { size, required },
            TransportError::Disconnected => IpcError::ConnectionLost { subject },
            TransportError::TimedOut => IpcError::ListenTimedOut {
                subject,
                timeout: timeout.unwrap_or_default(),
            },
            e => IpcError::ListenFailed {
                subject,
                code: e.code(),
            },
        })?;

        tracing::trace!(
            sender = ?call.sender,
            method = %call.method,
            cmd_type = call.cmd_type,
            len = call.content.len(),
            "Received method call"
        );
        let mut content = call.content;
        if encoding.is_none() && content.len() < max_len {
            // Raw content comes back as the whole zero-filled receive buffer.
            content.resize(max_len, 0);
        }
        Ok(ReceivedCall {
            cmd_type: call.cmd_type,
            content: codec::decode(content, encoding),
            sender: call.sender,
            object: call.object,
            interface: call.interface,
            method: call.method,
        })
    }

    /// Release the connection and any name it owns. The handle is closed even
    /// when teardown fails.
    pub fn close(&mut self) -> Result<()> {
        let mut link = self.link.take().ok_or_else(|| IpcError::AlreadyClosed {
            subject: self.subject(),
        })?;

        tracing::debug!(unique_name = %self.unique_name, service_name = ?self.service_name, "Closing bus connection");
        link.disconnect().map_err(|e| IpcError::CloseFailed {
            subject: self.subject(),
            code: e.code(),
        })
    }
}

/// Errors name the connection by its service name, else its unique name.
fn subject_of(service_name: Option<&str>, unique_name: &str) -> String {
    service_name.unwrap_or(unique_name).to_string()
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        if self.link.is_some()
            && let Err(e) = self.close()
        {
            tracing::warn!(unique_name = %self.unique_name, error = %e, "Failed to close bus connection on drop");
        }
    }
}

impl std::fmt::Debug for BusConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConnection")
            .field("bus_type", &self.bus_type)
            .field("service_name", &self.service_name)
            .field("unique_name", &self.unique_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Content;

    const SERVICE: &str = "com.example.Conn";

    fn pair(bus: &LocalBus) -> (BusConnection, BusConnection) {
        let server = BusConnection::initialize_with(bus, SERVICE, BusType::Session, None).unwrap();
        let client = BusConnection::open_local(bus, BusType::Session).unwrap();
        (server, client)
    }

    #[test]
    fn call_reaches_listener_with_defaults() {
        let bus = LocalBus::new();
        let (mut server, mut client) = pair(&bus);

        client
            .enqueue_call(&CallAddress::new(SERVICE, "set"), 4, "hello", None)
            .unwrap();
        let got = server.listen_call(None, "set", Some(Encoding::Utf8)).unwrap();
        assert_eq!(got.cmd_type, 4);
        assert_eq!(got.content, Content::Text("hello".to_string()));
        assert_eq!(got.object, "/com/example/Conn");
        assert_eq!(got.interface, SERVICE);
        assert_eq!(got.sender.as_deref(), Some(client.unique_name()));
        assert_eq!(server.flags(), NameFlags::REPLACE_EXISTING);
    }

    #[test]
    fn oversized_content_is_rejected_locally() {
        let bus = LocalBus::new();
        let (_server, mut client) = pair(&bus);
        let content = vec![0u8; MAX_CONTENT_LEN + 1];
        assert!(matches!(
            client.enqueue_call(&CallAddress::new(SERVICE, "set"), 0, &content, None),
            Err(IpcError::ContentTooLarge { size: 4097, limit: 4096 })
        ));
    }

    #[test]
    fn call_to_unowned_name_fails_dispatch() {
        let bus = LocalBus::new();
        let mut client = BusConnection::open_local(&bus, BusType::Session).unwrap();
        let err = client
            .enqueue_call(&CallAddress::new("com.example.Nobody", "set"), 0, "x", None)
            .unwrap_err();
        assert!(matches!(err, IpcError::DispatchFailed { .. }));
    }

    #[test]
    fn taken_name_fails_initialize_with_reply_code() {
        let bus = LocalBus::new();
        let _owner = BusConnection::initialize_with(&bus, SERVICE, BusType::Session, None).unwrap();
        let err = BusConnection::initialize_with(&bus, SERVICE, BusType::Session, None).unwrap_err();
        assert!(matches!(err, IpcError::ConnectFailed { code: 2, .. }));

        let err = BusConnection::initialize_with(&bus, SERVICE, BusType::Session, Some(NameFlags::DO_NOT_QUEUE))
            .unwrap_err();
        assert!(matches!(err, IpcError::ConnectFailed { code: 3, .. }));
    }

    #[test]
    fn small_receive_buffer_fails_listen() {
        let bus = LocalBus::new();
        let (mut server, _client) = pair(&bus);
        server.set_receive_buffer(1024);
        assert!(matches!(
            server.listen_call(None, "set", None),
            Err(IpcError::BufferTooSmall { size: 1024, required: 4096 })
        ));
    }

    #[test]
    fn severed_connection_is_reported() {
        let bus = LocalBus::new();
        let (mut server, _client) = pair(&bus);
        bus.sever(BusType::Session, &server.unique_name().to_string());
        assert!(matches!(
            server.listen_call(None, "set", None),
            Err(IpcError::ConnectionLost { .. })
        ));
    }

    #[test]
    fn timeouts_and_polling() {
        let bus = LocalBus::new();
        let (mut server, mut client) = pair(&bus);

        assert!(server.try_listen_call(None, "set", None).unwrap().is_none());
        assert!(matches!(
            server.listen_call_timeout(None, "set", None, Duration::from_millis(20)),
            Err(IpcError::ListenTimedOut { .. })
        ));

        client
            .enqueue_call(&CallAddress::new(SERVICE, "set"), 1, &[1u8, 2, 3], None)
            .unwrap();
        let got = server.try_listen_call(None, "set", None).unwrap().unwrap();
        let mut expected = vec![0u8; MAX_CONTENT_LEN];
        expected[..3].copy_from_slice(&[1, 2, 3]);
        assert_eq!(got.content, Content::Bytes(expected));
    }

    #[test]
    fn raw_content_fills_receive_buffer() {
        let bus = LocalBus::new();
        let (mut server, mut client) = pair(&bus);
        server.set_receive_buffer(MAX_CONTENT_LEN * 2);

        client
            .enqueue_call(&CallAddress::new(SERVICE, "set"), 0, "hi", None)
            .unwrap();
        client
            .enqueue_call(&CallAddress::new(SERVICE, "set"), 0, "hi", None)
            .unwrap();

        let Content::Bytes(raw) = server.listen_call(None, "set", None).unwrap().content else {
            panic!("expected raw bytes");
        };
        assert_eq!(raw.len(), MAX_CONTENT_LEN * 2);
        assert_eq!(&raw[..2], b"hi");
        assert!(raw[2..].iter().all(|&b| b == 0));

        // Text decoding drops the fill again.
        let got = server.listen_call(None, "set", Some(Encoding::Utf8)).unwrap();
        assert_eq!(got.content, Content::Text("hi".to_string()));
    }

    #[test]
    fn unbounded_listen_timeout_waits() {
        let bus = LocalBus::new();
        let (mut server, mut client) = pair(&bus);
        client
            .enqueue_call(&CallAddress::new(SERVICE, "set"), 6, "x", None)
            .unwrap();
        let got = server
            .listen_call_timeout(None, "set", None, Duration::MAX)
            .unwrap();
        assert_eq!(got.cmd_type, 6);
    }

    #[test]
    fn close_releases_name_and_blocks_further_use() {
        let bus = LocalBus::new();
        let (mut server, mut client) = pair(&bus);

        server.close().unwrap();
        assert!(server.is_closed());
        assert_eq!(bus.owner(BusType::Session, SERVICE), None);
        assert!(matches!(
            server.listen_call(None, "set", None),
            Err(IpcError::Closed { op: "listen_call", .. })
        ));
        assert!(matches!(server.close(), Err(IpcError::AlreadyClosed { .. })));

        client.close().unwrap();
        assert!(matches!(
            client.enqueue_call(&CallAddress::new(SERVICE, "set"), 0, "x", None),
            Err(IpcError::Closed { op: "enqueue_call", .. })
        ));
    }
}
