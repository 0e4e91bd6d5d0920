//! Blocking client for `shmbus-busd`.
//!
//! One `UnixStream` per link, frames encoded with [`JsonCodec`]. Replies to our
//! requests arrive in order, but the broker may push `Deliver` frames at any
//! time; those seen while waiting for a reply are parked until the next
//! `receive_call`.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::message::{CallFilter, MethodCall};
use super::router::RequestNameReply;
use super::transport::{BusLink, BusTransport, TransportError, TransportResult, check_buffer};
use super::wire::{BrokerFrame, ClientFrame, JsonCodec};
use super::{BusType, NameFlags};
use crate::config::BusConfig;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Default)]
pub struct SocketTransport {
    config: BusConfig,
}

impl SocketTransport {
    pub fn new(config: BusConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(BusConfig::from_env())
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }
}

impl BusTransport for SocketTransport {
    fn connect_anonymous(&self, bus_type: BusType) -> TransportResult<Box<dyn BusLink>> {
        let path = self.config.address(bus_type);
        tracing::debug!(bus = %bus_type, path = %path.display(), "Connecting to broker");
        let stream = UnixStream::connect(path)?;

        let mut link = SocketLink {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            encoder: JsonCodec::new(),
            decoder: JsonCodec::new(),
            pending: VecDeque::new(),
            unique_name: String::new(),
            request_timeout: self.config.request_timeout,
            connected: true,
        };

        link.write_frame(ClientFrame::Hello)?;
        match link.await_reply()? {
            BrokerFrame::Welcome { unique_name } => link.unique_name = unique_name,
            other => return Err(unexpected(&other)),
        }
        tracing::debug!(bus = %bus_type, unique_name = %link.unique_name, "Broker link established");
        Ok(Box::new(link))
    }

    fn receive_buffer(&self) -> usize {
        self.config.receive_buffer
    }
}

struct SocketLink {
    stream: UnixStream,
    buf: BytesMut,
    encoder: JsonCodec<ClientFrame>,
    decoder: JsonCodec<BrokerFrame>,
    /// Deliveries that arrived while a request was outstanding.
    pending: VecDeque<MethodCall>,
    unique_name: String,
    request_timeout: Duration,
    connected: bool,
}

impl SocketLink {
    fn ensure_connected(&self) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: ClientFrame) -> TransportResult<()> {
        let mut out = BytesMut::new();
        self.encoder.encode(frame, &mut out)?;
        self.stream.set_nonblocking(false)?;
        self.stream.write_all(&out).map_err(|e| self.io_failure(e))
    }

    /// Pull more bytes off the stream. `Ok(false)` means the wait ran out.
    ///
    /// `Some(Duration::ZERO)` reads only what is already buffered in the kernel.
    fn read_more(&mut self, wait: Option<Duration>) -> TransportResult<bool> {
        match wait {
            Some(wait) if wait.is_zero() => self.stream.set_nonblocking(true)?,
            wait => {
                self.stream.set_nonblocking(false)?;
                self.stream.set_read_timeout(wait)?;
            }
        }

        let mut chunk = [0u8; READ_CHUNK];
        match self.stream.read(&mut chunk) {
            Ok(0) => {
                self.connected = false;
                Err(TransportError::Disconnected)
            }
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
            Err(e) => Err(self.io_failure(e)),
        }
    }

    fn next_frame(&mut self, deadline: Option<Instant>) -> TransportResult<BrokerFrame> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf)? {
                return Ok(frame);
            }
            let wait = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if !self.read_more(wait)? {
                return Err(TransportError::TimedOut);
            }
        }
    }

    /// Next reply frame, parking deliveries.
    ///
    /// A reply that misses `request_timeout` would otherwise be read as the
    /// answer to the next request, so the link is dropped instead.
    fn await_reply(&mut self) -> TransportResult<BrokerFrame> {
        let deadline = Instant::now().checked_add(self.request_timeout);
        loop {
            let frame = match self.next_frame(deadline) {
                Err(TransportError::TimedOut) => {
                    tracing::warn!(
                        unique_name = %self.unique_name,
                        timeout = ?self.request_timeout,
                        "Broker reply timed out, dropping link"
                    );
                    self.sever();
                    return Err(TransportError::Disconnected);
                }
                other => other?,
            };
            if frame.is_reply() {
                return Ok(frame);
            }
            if let BrokerFrame::Deliver { call } = frame {
                self.pending.push_back(call);
            }
        }
    }

    fn sever(&mut self) {
        self.connected = false;
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn io_failure(&mut self, e: io::Error) -> TransportError {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => {
                self.connected = false;
                TransportError::Disconnected
            }
            _ => TransportError::Io(e),
        }
    }

    fn say_goodbye(&mut self) -> TransportResult<()> {
        self.write_frame(ClientFrame::Goodbye)?;
        match self.await_reply()? {
            BrokerFrame::Farewell => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

impl BusLink for SocketLink {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn request_name(&mut self, name: &str, flags: NameFlags) -> TransportResult<RequestNameReply> {
        self.ensure_connected()?;
        self.write_frame(ClientFrame::RequestName {
            name: name.to_string(),
            flags: flags.bits(),
        })?;
        match self.await_reply()? {
            BrokerFrame::NameReply { reply } => Ok(reply),
            BrokerFrame::Rejected { error } => Err(error.into()),
            other => Err(unexpected(&other)),
        }
    }

    fn send_call(&mut self, call: MethodCall) -> TransportResult<()> {
        self.ensure_connected()?;
        self.write_frame(ClientFrame::Call { call })?;
        match self.await_reply()? {
            BrokerFrame::Sent => Ok(()),
            BrokerFrame::Rejected { error } => Err(error.into()),
            other => Err(unexpected(&other)),
        }
    }

    fn receive_call(
        &mut self,
        filter: &CallFilter,
        max_len: usize,
        timeout: Option<Duration>,
    ) -> TransportResult<MethodCall> {
        check_buffer(max_len)?;

        while let Some(call) = self.pending.pop_front() {
            if filter.matches(&call) {
                return Ok(call);
            }
            tracing::trace!(method = %call.method, "Discarding parked call not matching filter");
        }
        self.ensure_connected()?;

        // A timeout too large for `Instant` waits indefinitely.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            match self.next_frame(deadline)? {
                BrokerFrame::Deliver { call } if filter.matches(&call) => return Ok(call),
                BrokerFrame::Deliver { call } => {
                    tracing::trace!(
                        interface = %call.interface,
                        method = %call.method,
                        "Discarding call not matching filter"
                    );
                }
                other => return Err(unexpected(&other)),
            }
        }
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        if !self.connected {
            return Ok(());
        }
        let result = match self.say_goodbye() {
            Err(TransportError::Disconnected) => Ok(()),
            other => other,
        };
        self.sever();
        tracing::debug!(unique_name = %self.unique_name, "Broker link closed");
        result
    }
}

impl Drop for SocketLink {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            tracing::warn!(unique_name = %self.unique_name, error = %e, "Failed to close broker link");
        }
    }
}

fn unexpected(frame: &BrokerFrame) -> TransportError {
    TransportError::Protocol(format!("unexpected frame {frame:?}"))
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;
    use std::thread::{self, JoinHandle};

    use super::*;
    use crate::bus::BusConnection;
    use crate::bus::message::CallAddress;
    use crate::error::IpcError;

    /// Broker end of a single client stream, driven by hand.
    struct ScriptedPeer {
        stream: UnixStream,
        buf: BytesMut,
        decoder: JsonCodec<ClientFrame>,
        encoder: JsonCodec<BrokerFrame>,
    }

    impl ScriptedPeer {
        fn recv(&mut self) -> Option<ClientFrame> {
            loop {
                if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                    return Some(frame);
                }
                let mut chunk = [0u8; 1024];
                match self.stream.read(&mut chunk) {
                    Ok(0) | Err(_) => return None,
                    Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                }
            }
        }

        fn send(&mut self, frame: BrokerFrame) -> io::Result<()> {
            let mut out = BytesMut::new();
            self.encoder.encode(frame, &mut out)?;
            self.stream.write_all(&out)
        }

        fn welcome(&mut self) {
            assert_eq!(self.recv(), Some(ClientFrame::Hello));
            self.send(BrokerFrame::Welcome {
                unique_name: ":1.1".to_string(),
            })
            .unwrap();
        }
    }

    /// Serve one client with `script` on a fresh socket.
    fn scripted_broker<T: Send + 'static>(
        script: impl FnOnce(ScriptedPeer) -> T + Send + 'static,
    ) -> (BusConfig, JoinHandle<T>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            script(ScriptedPeer {
                stream,
                buf: BytesMut::new(),
                decoder: JsonCodec::new(),
                encoder: JsonCodec::new(),
            })
        });
        let config = BusConfig::default().with_address(BusType::Session, path);
        (config, handle, dir)
    }

    #[test]
    fn late_reply_drops_link_instead_of_shifting_replies() {
        let (config, peer, _dir) = scripted_broker(|mut peer| {
            peer.welcome();
            assert!(matches!(peer.recv(), Some(ClientFrame::Call { .. })));
            thread::sleep(Duration::from_millis(300));
            let _ = peer.send(BrokerFrame::Rejected {
                error: crate::bus::RouteError::ServiceUnknown {
                    name: "com.example.Slow".to_string(),
                },
            });
            let _ = peer.send(BrokerFrame::Sent);
            // The client hung up instead of sending a second call.
            peer.recv()
        });
        let transport = SocketTransport::new(config.with_request_timeout(Duration::from_millis(100)));
        let mut conn = BusConnection::open_with(&transport, BusType::Session).unwrap();
        let address = CallAddress::new("com.example.Slow", "m");

        assert!(matches!(
            conn.enqueue_call(&address, 0, "first", None),
            Err(IpcError::ConnectionLost { .. })
        ));
        assert!(matches!(
            conn.enqueue_call(&address, 0, "second", None),
            Err(IpcError::ConnectionLost { .. })
        ));
        assert_eq!(peer.join().unwrap(), None);
    }

    #[test]
    fn oversized_timeouts_wait_without_deadline() {
        let (config, peer, _dir) = scripted_broker(|mut peer| {
            peer.welcome();
            peer.send(BrokerFrame::Deliver {
                call: CallAddress::new("com.example.Svc", "ping").to_call(5, b"x".to_vec()),
            })
            .unwrap();
            assert_eq!(peer.recv(), Some(ClientFrame::Goodbye));
            peer.send(BrokerFrame::Farewell).unwrap();
        });
        let transport = SocketTransport::new(config.with_request_timeout(Duration::MAX));
        let mut link = transport.connect_anonymous(BusType::Session).unwrap();

        let filter = CallFilter::new(None, "ping");
        let call = link
            .receive_call(&filter, crate::bus::MAX_CONTENT_LEN, Some(Duration::MAX))
            .unwrap();
        assert_eq!(call.cmd_type, 5);

        link.disconnect().unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn missing_broker_surfaces_os_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = BusConfig::default().with_address(BusType::Session, dir.path().join("none.sock"));
        let err = SocketTransport::new(config)
            .connect_anonymous(BusType::Session)
            .err()
            .unwrap();
        assert_eq!(err.code(), nix::errno::Errno::ENOENT as i32);
    }

    #[test]
    fn receive_buffer_comes_from_config() {
        let transport = SocketTransport::new(BusConfig::default().with_receive_buffer(10));
        assert_eq!(transport.receive_buffer(), 10);
    }
}
