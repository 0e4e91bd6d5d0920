//! In-process bus. Every clone of a `LocalBus` shares the same routers, so
//! connections made from different threads see each other's names.

use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::message::{CallFilter, MethodCall};
use super::router::{ConnectionId, Deliver, RequestNameReply, Router};
use super::transport::{BusLink, BusTransport, TransportError, TransportResult, check_buffer};
use super::{BusType, NameFlags};

type SharedRouter = Arc<Mutex<Router<LocalSink>>>;

fn lock(router: &SharedRouter) -> MutexGuard<'_, Router<LocalSink>> {
    router.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LocalSink(mpsc::Sender<MethodCall>);

impl Deliver for LocalSink {
    fn deliver(&self, call: MethodCall) -> bool {
        self.0.send(call).is_ok()
    }
}

/// Session and system routers living in this process. The starter bus
/// resolves to the session router.
#[derive(Clone, Default)]
pub struct LocalBus {
    session: SharedRouter,
    system: SharedRouter,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn router(&self, bus_type: BusType) -> &SharedRouter {
        match bus_type {
            BusType::Session | BusType::Starter => &self.session,
            BusType::System => &self.system,
        }
    }

    /// Unique name of the connection currently owning `name`.
    pub fn owner(&self, bus_type: BusType, name: &str) -> Option<String> {
        lock(self.router(bus_type)).owner(name).map(str::to_string)
    }

    /// Drop a connection from the bus side, as a daemon would on failure.
    pub fn sever(&self, bus_type: BusType, unique_name: &str) -> bool {
        let mut router = lock(self.router(bus_type));
        match router.resolve(unique_name) {
            Some(id) => router.disconnect(id),
            None => false,
        }
    }
}

impl BusTransport for LocalBus {
    fn connect_anonymous(&self, bus_type: BusType) -> TransportResult<Box<dyn BusLink>> {
        let router = Arc::clone(self.router(bus_type));
        let (tx, rx) = mpsc::channel();
        let (id, unique_name) = lock(&router).connect(LocalSink(tx));
        tracing::debug!(bus = %bus_type, %unique_name, "Local link connected");
        Ok(Box::new(LocalLink {
            router,
            id,
            unique_name,
            rx,
            connected: true,
        }))
    }
}

struct LocalLink {
    router: SharedRouter,
    id: ConnectionId,
    unique_name: String,
    rx: mpsc::Receiver<MethodCall>,
    connected: bool,
}

impl LocalLink {
    fn ensure_connected(&self) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    fn next_call(&self, deadline: Option<Instant>) -> TransportResult<MethodCall> {
        let Some(deadline) = deadline else {
            return self.rx.recv().map_err(|_| TransportError::Disconnected);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return self.rx.try_recv().map_err(|e| match e {
                TryRecvError::Empty => TransportError::TimedOut,
                TryRecvError::Disconnected => TransportError::Disconnected,
            });
        }
        self.rx.recv_timeout(remaining).map_err(|e| match e {
            RecvTimeoutError::Timeout => TransportError::TimedOut,
            RecvTimeoutError::Disconnected => TransportError::Disconnected,
        })
    }
}

impl BusLink for LocalLink {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn request_name(&mut self, name: &str, flags: NameFlags) -> TransportResult<RequestNameReply> {
        self.ensure_connected()?;
        Ok(lock(&self.router).request_name(self.id, name, flags)?)
    }

    fn send_call(&mut self, call: MethodCall) -> TransportResult<()> {
        self.ensure_connected()?;
        lock(&self.router).route(self.id, call)?;
        Ok(())
    }

    fn receive_call(
        &mut self,
        filter: &CallFilter,
        max_len: usize,
        timeout: Option<Duration>,
    ) -> TransportResult<MethodCall> {
        check_buffer(max_len)?;
        self.ensure_connected()?;

        // A timeout too large for `Instant` waits indefinitely.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let call = self.next_call(deadline)?;
            if filter.matches(&call) {
                return Ok(call);
            }
            tracing::trace!(
                conn = %self.unique_name,
                interface = %call.interface,
                method = %call.method,
                "Discarding call not matching filter"
            );
        }
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        if std::mem::replace(&mut self.connected, false) {
            lock(&self.router).disconnect(self.id);
            tracing::debug!(unique_name = %self.unique_name, "Local link disconnected");
        }
        Ok(())
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
