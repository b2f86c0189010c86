//! One persistent broker connection.
//!
//! [`Connection::accept`] runs the `open` handshake on an inbound stream and
//! then hands the read half to a background task that routes frames:
//! 1. `attached` completes the pending [`Connection::attach_sender`] or
//!    [`Connection::attach_dynamic_receiver`] call for that handle
//! 2. `transfer` is queued on the receiver registered for the handle
//! 3. `detach` of a pending attach refuses it; `detach` of an established
//!    link ends the connection, since the link's owner cannot work without it
//! 4. `close`, EOF or an undecodable frame ends the connection
//!
//! Writes go through a shared sink guarded by an async mutex.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::error::{LinkError, LinkResult};
use crate::protocol::{Frame, FrameCodec, Handle, Message, Role};

/// Container id the scheduler announces in its `open` reply.
pub const DEFAULT_CONTAINER_ID: &str = "queue-scheduler";

type FrameSink = Pin<Box<dyn Sink<Frame, Error = io::Error> + Send>>;
type AttachReply = Result<Option<String>, String>;

/// Identity a broker presented when it connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Broker id announced in `open`.
    pub container_id: String,
    pub group_id: Option<String>,
    /// Subject of the client certificate, when the stream is mutual TLS.
    pub identity: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub container_id: String,
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            container_id: DEFAULT_CONTAINER_ID.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct Routes {
    /// Attaches awaiting the peer's `attached`.
    pending_attach: HashMap<Handle, oneshot::Sender<AttachReply>>,
    /// Message queues of receiving links.
    receivers: HashMap<Handle, mpsc::UnboundedSender<Message>>,
    /// Links the peer accepted and we have not detached.
    established: HashSet<Handle>,
}

pub struct Connection {
    peer: PeerInfo,
    /// Write half; every frame goes through this lock.
    sink: tokio::sync::Mutex<FrameSink>,
    /// Shared with the reader task.
    routes: Arc<Mutex<Routes>>,
    next_handle: AtomicU32,
    /// Flipped to true once, by whichever side ends the connection first.
    closed: Arc<watch::Sender<bool>>,
    /// Set once `close` has sent our `close` frame.
    close_sent: AtomicBool,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Wait for the peer's `open`, answer with our own and start routing.
    ///
    /// `identity` is the authenticated peer identity established by the
    /// transport, if any.
    pub async fn accept<S>(
        io: S,
        config: &HandshakeConfig,
        identity: Option<String>,
    ) -> LinkResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = Framed::new(io, FrameCodec::new()).split();

        let first = timeout(config.timeout, stream.next())
            .await
            .map_err(|_| LinkError::HandshakeTimeout(config.timeout))?;
        let (container_id, group_id) = match first {
            Some(Ok(Frame::Open {
                container_id,
                group_id,
            })) => (container_id, group_id),
            Some(Ok(other)) => {
                return Err(LinkError::Protocol(format!(
                    "expected open, got {}",
                    other.kind()
                )));
            }
            Some(Err(e)) => return Err(LinkError::Io(e)),
            None => return Err(LinkError::Disconnected),
        };

        sink.send(Frame::Open {
            container_id: config.container_id.clone(),
            group_id: None,
        })
        .await?;

        let peer = PeerInfo {
            container_id,
            group_id,
            identity,
        };
        debug!(broker = %peer.container_id, group = ?peer.group_id, "connection opened");

        let routes = Arc::new(Mutex::new(Routes::default()));
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let reader = tokio::spawn(read_frames(
            stream,
            peer.container_id.clone(),
            routes.clone(),
            closed.clone(),
        ));

        Ok(Self {
            peer,
            sink: tokio::sync::Mutex::new(Box::pin(sink)),
            routes,
            next_handle: AtomicU32::new(0),
            closed,
            close_sent: AtomicBool::new(false),
            reader,
        })
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has ended, from either side.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Open a sending link to `address`.
    pub async fn attach_sender(&self, address: &str, wait: Duration) -> LinkResult<Handle> {
        let handle = self.next_handle();
        self.attach(handle, Role::Sender, Some(address), wait).await?;
        Ok(handle)
    }

    /// Open a receiving link on an address the peer assigns.
    ///
    /// Returns the handle, the assigned address and the queue of messages
    /// delivered on the link.
    pub async fn attach_dynamic_receiver(
        &self,
        wait: Duration,
    ) -> LinkResult<(Handle, String, mpsc::UnboundedReceiver<Message>)> {
        let handle = self.next_handle();
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes().receivers.insert(handle, tx);

        match self.attach(handle, Role::Receiver, None, wait).await {
            Ok(Some(address)) => Ok((handle, address, rx)),
            Ok(None) => {
                self.routes().receivers.remove(&handle);
                let _ = self.detach(handle).await;
                Err(LinkError::Protocol(
                    "dynamic receiver attached without an address".to_string(),
                ))
            }
            Err(e) => {
                self.routes().receivers.remove(&handle);
                Err(e)
            }
        }
    }

    pub async fn send_transfer(&self, handle: Handle, message: Message) -> LinkResult<()> {
        self.send(Frame::Transfer { handle, message }).await
    }

    pub async fn detach(&self, handle: Handle) -> LinkResult<()> {
        {
            let mut routes = self.routes();
            routes.receivers.remove(&handle);
            routes.established.remove(&handle);
        }
        self.send(Frame::Detach {
            handle,
            error: None,
        })
        .await
    }

    /// Send `close`, shut the write half and stop routing.
    ///
    /// Also sent when the reader already stopped, so a peer that only
    /// detached a link learns the connection is gone.
    pub async fn close(&self) {
        if !self.close_sent.swap(true, Ordering::AcqRel) {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(Frame::Close { error: None }).await {
                debug!(broker = %self.peer.container_id, error = %e, "close frame not sent");
            }
            let _ = sink.close().await;
        }
        self.reader.abort();
        self.shut_down();
    }

    async fn attach(
        &self,
        handle: Handle,
        role: Role,
        address: Option<&str>,
        wait: Duration,
    ) -> LinkResult<Option<String>> {
        let target = address.unwrap_or("<dynamic>").to_string();
        let (tx, rx) = oneshot::channel();
        self.routes().pending_attach.insert(handle, tx);

        let frame = Frame::Attach {
            handle,
            role,
            address: address.map(str::to_string),
            dynamic: address.is_none(),
        };
        if let Err(e) = self.send(frame).await {
            self.routes().pending_attach.remove(&handle);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(Ok(assigned))) => Ok(assigned),
            Ok(Ok(Err(reason))) => Err(LinkError::AttachRefused {
                address: target,
                reason,
            }),
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => {
                self.routes().pending_attach.remove(&handle);
                // The peer may still bind the handle after we gave up on it.
                let _ = self.detach(handle).await;
                Err(LinkError::AttachTimeout { address: target })
            }
        }
    }

    async fn send(&self, frame: Frame) -> LinkResult<()> {
        if self.is_closed() {
            return Err(LinkError::Disconnected);
        }
        self.sink.lock().await.send(frame).await?;
        Ok(())
    }

    fn next_handle(&self) -> Handle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().expect("connection routes lock")
    }

    fn shut_down(&self) {
        let mut routes = self.routes();
        routes.pending_attach.clear();
        routes.receivers.clear();
        routes.established.clear();
        drop(routes);
        self.closed.send_replace(true);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_frames<St>(
    mut stream: St,
    broker: String,
    routes: Arc<Mutex<Routes>>,
    closed: Arc<watch::Sender<bool>>,
) where
    St: Stream<Item = io::Result<Frame>> + Unpin,
{
    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(%broker, error = %e, "dropping connection on unreadable frame");
                break;
            }
            None => {
                debug!(%broker, "connection reached EOF");
                break;
            }
        };

        let mut table = routes.lock().expect("connection routes lock");
        match frame {
            Frame::Attached {
                handle,
                address,
                error,
            } => {
                let reply = match error {
                    Some(reason) => Err(reason),
                    None => Ok(address),
                };
                match table.pending_attach.remove(&handle) {
                    Some(tx) => {
                        if reply.is_ok() {
                            table.established.insert(handle);
                        }
                        let _ = tx.send(reply);
                    }
                    None => debug!(%broker, handle, "attached for unknown handle"),
                }
            }
            Frame::Transfer { handle, message } => match table.receivers.get(&handle) {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => debug!(%broker, handle, "transfer on unknown handle dropped"),
            },
            Frame::Detach { handle, error } => {
                table.receivers.remove(&handle);
                if let Some(tx) = table.pending_attach.remove(&handle) {
                    let _ = tx.send(Err(error.clone().unwrap_or_else(|| "detached".to_string())));
                }
                if table.established.remove(&handle) {
                    warn!(%broker, handle, error = ?error, "established link detached by peer, dropping connection");
                    break;
                }
                debug!(%broker, handle, error = ?error, "link detached by peer");
            }
            Frame::Close { error } => {
                info!(%broker, error = ?error, "connection closed by peer");
                break;
            }
            other => warn!(%broker, frame = other.kind(), "unexpected frame ignored"),
        }
    }

    let mut table = routes.lock().expect("connection routes lock");
    table.pending_attach.clear();
    table.receivers.clear();
    table.established.clear();
    drop(table);
    closed.send_replace(true);
}
