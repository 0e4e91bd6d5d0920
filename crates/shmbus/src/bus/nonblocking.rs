//! `AsyncBusConnection`: a `BusConnection` driven from tokio's blocking pool.
//!
//! Listening runs in short `listen_call_timeout` slices. The connection lock
//! is released between slices, so `close` from another task gets through and
//! the pending listen ends with `Closed` rather than blocking forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinError;

use super::connection::BusConnection;
use super::message::{CallAddress, ReceivedCall};
use super::CmdType;
use crate::codec::{self, Encoding, Payload};
use crate::error::{IpcError, Result};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn lock(inner: &StdMutex<BusConnection>) -> MutexGuard<'_, BusConnection> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct AsyncBusConnection {
    inner: Arc<StdMutex<BusConnection>>,
    closing: Arc<AtomicBool>,
    unique_name: String,
    poll_interval: Duration,
}

impl AsyncBusConnection {
    pub fn new(connection: BusConnection) -> Self {
        Self {
            unique_name: connection.unique_name().to_string(),
            closing: Arc::new(AtomicBool::new(connection.is_closed())),
            inner: Arc::new(StdMutex::new(connection)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How long one listen slice holds the connection.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub async fn enqueue_call<'a>(
        &self,
        address: CallAddress,
        cmd_type: CmdType,
        content: impl Into<Payload<'a>>,
        encoding: Option<Encoding>,
    ) -> Result<()> {
        let bytes = codec::encode(content, encoding)?.into_owned();
        let inner = Arc::clone(&self.inner);

        let result = tokio::task::spawn_blocking(move || {
            lock(&inner).enqueue_call(&address, cmd_type, &bytes, None)
        })
        .await;
        joined(result, "enqueue_call")
    }

    /// Wait for a matching call without tying up a runtime worker.
    pub async fn listen_call(
        &self,
        interface: Option<&str>,
        method: &str,
        encoding: Option<Encoding>,
    ) -> Result<ReceivedCall> {
        let inner = Arc::clone(&self.inner);
        let closing = Arc::clone(&self.closing);
        let interface = interface.map(str::to_string);
        let method = method.to_string();
        let slice = self.poll_interval;
        let subject = self.unique_name.clone();

        let result = tokio::task::spawn_blocking(move || {
            loop {
                if closing.load(Ordering::Acquire) {
                    return Err(IpcError::Closed {
                        op: "listen_call",
                        subject,
                    });
                }
                let mut conn = lock(&inner);
                match conn.listen_call_timeout(interface.as_deref(), &method, encoding, slice) {
                    Err(IpcError::ListenTimedOut { .. }) => continue,
                    other => return other,
                }
            }
        })
        .await;
        joined(result, "listen_call")
    }

    /// Close the connection. A listen running on another task returns `Closed`
    /// within one poll interval.
    pub async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::Release);
        let inner = Arc::clone(&self.inner);

        let result = tokio::task::spawn_blocking(move || lock(&inner).close()).await;
        joined(result, "close")
    }
}

fn joined<T>(result: std::result::Result<Result<T>, JoinError>, op: &'static str) -> Result<T> {
    result.unwrap_or_else(|e| {
        tracing::error!(op, error = %e, "Blocking bus task failed");
        Err(IpcError::Interrupted { op })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusType, LocalBus};
    use crate::codec::Content;

    const SERVICE: &str = "com.example.Async";

    #[tokio::test]
    async fn listen_receives_call_from_other_task() {
        let bus = LocalBus::new();
        let server = AsyncBusConnection::new(
            BusConnection::initialize_with(&bus, SERVICE, BusType::Session, None).unwrap(),
        );
        let client = AsyncBusConnection::new(BusConnection::open_local(&bus, BusType::Session).unwrap());

        let listener = {
            let server = server.clone();
            tokio::spawn(async move { server.listen_call(None, "set", Some(Encoding::Utf8)).await })
        };
        client
            .enqueue_call(CallAddress::new(SERVICE, "set"), 2, "hi", None)
            .await
            .unwrap();

        let got = listener.await.unwrap().unwrap();
        assert_eq!(got.cmd_type, 2);
        assert_eq!(got.content, Content::Text("hi".to_string()));
    }

    #[tokio::test]
    async fn close_interrupts_pending_listen() {
        let bus = LocalBus::new();
        let server = AsyncBusConnection::new(
            BusConnection::initialize_with(&bus, SERVICE, BusType::Session, None).unwrap(),
        )
        .with_poll_interval(Duration::from_millis(10));

        let listener = {
            let server = server.clone();
            tokio::spawn(async move { server.listen_call(None, "set", None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        server.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(IpcError::Closed { .. })));
        assert!(server.is_closed());
        assert_eq!(bus.owner(BusType::Session, SERVICE), None);
    }

    #[tokio::test]
    async fn encoding_errors_surface_before_dispatch() {
        let bus = LocalBus::new();
        let _server = BusConnection::initialize_with(&bus, SERVICE, BusType::Session, None).unwrap();
        let client = AsyncBusConnection::new(BusConnection::open_local(&bus, BusType::Session).unwrap());

        let err = client
            .enqueue_call(CallAddress::new(SERVICE, "set"), 0, "zz-not-hex", Some(Encoding::Hex))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Encoding { encoding: Encoding::Hex, .. }));
    }
}
