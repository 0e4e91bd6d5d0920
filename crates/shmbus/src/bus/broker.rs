//! Broker serving `SocketTransport` clients over a Unix listener.
//!
//! Flow per client:
//! 1. Read `Hello`, register with the router, answer `Welcome`
//! 2. Serve `RequestName` / `Call` until `Goodbye`, EOF or shutdown
//! 3. Drop the connection from the router (queued owners get promoted)
//!
//! Each client has one writer task fed by a bounded channel. Replies and
//! deliveries from other clients share that channel, so a client sees them in
//! the order the router produced them. A client that lets more than
//! `backlog` frames pile up is disconnected; calls routed to it then fail
//! with `ServiceUnknown`.

use std::io;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::NameFlags;
use super::message::MethodCall;
use super::router::{Deliver, Router};
use super::wire::{BrokerFrame, ClientFrame, JsonCodec};

/// Frames a client may have queued before it counts as stuck.
pub const DEFAULT_BACKLOG: usize = 1024;

/// Outgoing frame queue of one client.
#[derive(Clone)]
pub struct BrokerSink {
    tx: mpsc::Sender<BrokerFrame>,
    /// Fired when the queue overflows; ends the client's session.
    overflow: CancellationToken,
}

impl BrokerSink {
    fn push(&self, frame: BrokerFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(backlog = self.tx.max_capacity(), "Client is not reading, disconnecting");
                self.overflow.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl Deliver for BrokerSink {
    fn deliver(&self, call: MethodCall) -> bool {
        self.push(BrokerFrame::Deliver { call })
    }
}

type SharedRouter = Arc<StdMutex<Router<BrokerSink>>>;

fn lock(router: &SharedRouter) -> MutexGuard<'_, Router<BrokerSink>> {
    router.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One bus worth of routing state. Cheap to clone; clones share the router.
#[derive(Clone)]
pub struct Broker {
    router: SharedRouter,
    backlog: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            router: SharedRouter::default(),
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames queued for one client before it is disconnected.
    pub fn with_backlog(mut self, frames: usize) -> Self {
        self.backlog = frames.max(1);
        self
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.router).connection_count()
    }

    pub fn owner(&self, name: &str) -> Option<String> {
        lock(&self.router).owner(name).map(str::to_string)
    }

    /// Accept clients until `shutdown` fires, then wait for their tasks to end.
    pub async fn serve(&self, listener: UnixListener, shutdown: CancellationToken) -> io::Result<()> {
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("Broker shutting down");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let router = Arc::clone(&self.router);
                            let shutdown = shutdown.child_token();
                            clients.spawn(serve_client(stream, router, self.backlog, shutdown));
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to accept client"),
                    }
                }

                Some(_) = clients.join_next(), if !clients.is_empty() => {}
            }
        }

        while clients.join_next().await.is_some() {}
        Ok(())
    }
}

async fn serve_client(
    stream: UnixStream,
    router: SharedRouter,
    backlog: usize,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<ClientFrame>::new());
    let mut writer = FramedWrite::new(write_half, JsonCodec::<BrokerFrame>::new());

    match reader.next().await {
        Some(Ok(ClientFrame::Hello)) => {}
        Some(Ok(frame)) => {
            tracing::warn!(?frame, "Client did not open with hello");
            return;
        }
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Failed to read client hello");
            return;
        }
        None => return,
    }

    let (tx, mut rx) = mpsc::channel(backlog);
    let sink = BrokerSink {
        tx,
        overflow: CancellationToken::new(),
    };
    let (conn, unique_name) = lock(&router).connect(sink.clone());
    sink.push(BrokerFrame::Welcome {
        unique_name: unique_name.clone(),
    });

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let last = matches!(frame, BrokerFrame::Farewell);
            if let Err(e) = writer.send(frame).await {
                tracing::debug!(error = %e, "Client write failed");
                break;
            }
            if last {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = sink.overflow.cancelled() => break,

            frame = reader.next() => {
                let reply = match frame {
                    Some(Ok(ClientFrame::RequestName { name, flags })) => {
                        let flags = NameFlags::from_bits_truncate(flags);
                        match lock(&router).request_name(conn, &name, flags) {
                            Ok(reply) => {
                                tracing::debug!(%unique_name, %name, ?reply, "Name requested");
                                BrokerFrame::NameReply { reply }
                            }
                            Err(error) => BrokerFrame::Rejected { error },
                        }
                    }
                    Some(Ok(ClientFrame::Call { call })) => match lock(&router).route(conn, call) {
                        Ok(()) => BrokerFrame::Sent,
                        Err(error) => BrokerFrame::Rejected { error },
                    },
                    Some(Ok(ClientFrame::Goodbye)) => {
                        lock(&router).disconnect(conn);
                        sink.push(BrokerFrame::Farewell);
                        break;
                    }
                    Some(Ok(ClientFrame::Hello)) => {
                        tracing::warn!(%unique_name, "Repeated hello ignored");
                        continue;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(%unique_name, error = %e, "Client stream error");
                        break;
                    }
                    None => break,
                };
                if !sink.push(reply) {
                    break;
                }
            }
        }
    }

    lock(&router).disconnect(conn);
    if sink.overflow.is_cancelled() {
        // The writer may be stuck on a peer that stopped reading.
        writer_task.abort();
    }
    drop(sink);
    let _ = writer_task.await;
    tracing::debug!(%unique_name, "Client gone");
}
