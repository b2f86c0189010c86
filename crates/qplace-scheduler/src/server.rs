//! Listener for inbound broker connections.
//!
//! Each accepted stream runs in its own task through these states:
//! 1. TLS handshake, when mutual TLS is configured
//! 2. `open` handshake, which names the broker and its group
//! 3. management link establishment, with retries
//! 4. registration through the scheduler worker (`broker_added`)
//! 5. wait for the connection to close, then `broker_removed`
//!
//! A failure anywhere before step 4 closes the stream and never reaches the
//! placement engine.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use qplace_core::{Endpoint, QplaceConfig};
use qplace_link::{BrokerLink, Connection, HandshakeConfig, LinkConfig, ManagedBroker};
use qplace_placement::BrokerHandle;

use crate::error::{SchedulerError, SchedulerResult};
use crate::tls;
use crate::worker::SchedulerHandle;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub handshake: HandshakeConfig,
    pub link: LinkConfig,
    /// Endpoint deployed queues are connected to.
    pub messaging: Endpoint,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&QplaceConfig::default())
    }
}

impl ServerConfig {
    pub fn from_config(config: &QplaceConfig) -> Self {
        Self {
            handshake: HandshakeConfig {
                timeout: config.link.handshake_timeout(),
                ..HandshakeConfig::default()
            },
            link: LinkConfig::from(&config.link),
            messaging: config.messaging.endpoint(),
        }
    }
}

pub struct SchedulerServer {
    config: Arc<ServerConfig>,
    scheduler: SchedulerHandle,
    tls: Option<TlsAcceptor>,
}

/// What a connection task shares with the server.
struct ConnectionContext {
    config: Arc<ServerConfig>,
    scheduler: SchedulerHandle,
    tls: Option<TlsAcceptor>,
    remote: SocketAddr,
}

/// A broker that made it into the engine.
struct Registered {
    connection: Arc<Connection>,
    group_id: String,
    broker_id: String,
}

impl SchedulerServer {
    pub fn new(config: ServerConfig, scheduler: SchedulerHandle) -> Self {
        Self {
            config: Arc::new(config),
            scheduler,
            tls: None,
        }
    }

    /// Require mutual TLS on every inbound connection.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn is_mutual_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Accept brokers until `shutdown` turns true (or its sender is dropped),
    /// then close every live connection and wait for the connection tasks.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> SchedulerResult<()> {
        let local = listener.local_addr()?;
        info!(%local, mutual_tls = self.is_mutual_tls(), "scheduler server listening");

        let mut connections = JoinSet::new();
        while !*shutdown.borrow() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "broker connection accepted");
                        let ctx = ConnectionContext {
                            config: self.config.clone(),
                            scheduler: self.scheduler.clone(),
                            tls: self.tls.clone(),
                            remote,
                        };
                        connections.spawn(run_connection(ctx, stream, shutdown.clone()));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                }
            }
        }

        drop(listener);
        info!(connections = connections.len(), "scheduler server stopping");
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "connection task failed");
            }
        }
        info!("scheduler server stopped");
        Ok(())
    }
}

async fn run_connection(ctx: ConnectionContext, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
    let remote = ctx.remote;
    let mut accepted = None;
    let registered = tokio::select! {
        result = register_stream(&ctx, stream, &mut accepted) => result,
        _ = shutdown_signalled(&mut shutdown) => {
            debug!(%remote, "shutdown during broker registration");
            // The worker may already hold this broker; its link goes down with us.
            if let Some(connection) = accepted {
                connection.close().await;
            }
            return;
        }
    };

    let registered = match registered {
        Ok(registered) => registered,
        Err(e) if e.is_duplicate_registration() => {
            warn!(%remote, error = %e, "duplicate broker registration, closing new connection");
            return;
        }
        Err(e) => {
            warn!(%remote, error = %e, "broker connection rejected");
            return;
        }
    };

    let Registered {
        connection,
        group_id,
        broker_id,
    } = registered;

    tokio::select! {
        _ = connection.closed() => {
            info!(%remote, %group_id, %broker_id, "broker disconnected");
        }
        _ = shutdown_signalled(&mut shutdown) => {
            debug!(%remote, %group_id, %broker_id, "closing broker connection for shutdown");
            connection.close().await;
            return;
        }
    }

    connection.close().await;
    if let Err(e) = ctx.scheduler.broker_removed(&group_id, &broker_id).await {
        warn!(%group_id, %broker_id, error = %e, "broker removal left the group unsettled");
    }
}

/// `accepted` receives the connection as soon as the `open` handshake
/// completes, so the caller can close it if registration is abandoned.
async fn register_stream(
    ctx: &ConnectionContext,
    stream: TcpStream,
    accepted: &mut Option<Arc<Connection>>,
) -> SchedulerResult<Registered> {
    let Some(acceptor) = &ctx.tls else {
        return register(ctx, stream, None, accepted).await;
    };

    let tls_stream = timeout(ctx.config.handshake.timeout, acceptor.accept(stream))
        .await
        .map_err(|_| SchedulerError::Tls(std::io::ErrorKind::TimedOut.into()))?
        .map_err(SchedulerError::Tls)?;
    let identity = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(tls::peer_identity);
    debug!(remote = %ctx.remote, identity = ?identity, "TLS client authenticated");
    register(ctx, tls_stream, identity, accepted).await
}

async fn register<S>(
    ctx: &ConnectionContext,
    io: S,
    identity: Option<String>,
    accepted: &mut Option<Arc<Connection>>,
) -> SchedulerResult<Registered>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection = Arc::new(Connection::accept(io, &ctx.config.handshake, identity).await?);
    *accepted = Some(connection.clone());
    let peer = connection.peer().clone();
    let broker_id = peer.container_id.clone();

    let Some(group_id) = peer.group_id.clone() else {
        connection.close().await;
        return Err(SchedulerError::MissingGroup { broker_id });
    };

    let link = match BrokerLink::establish(connection.clone(), ctx.config.link.clone()).await {
        Ok(link) => link,
        Err(e) => {
            connection.close().await;
            return Err(e.into());
        }
    };
    let broker: BrokerHandle = Arc::new(ManagedBroker::new(link, ctx.config.messaging.clone()));

    match ctx.scheduler.broker_added(&group_id, &broker_id, broker).await {
        Ok(()) => {}
        Err(e) if e.is_duplicate_registration() || matches!(e, SchedulerError::WorkerStopped) => {
            connection.close().await;
            return Err(e);
        }
        // Registration stands; the next event retries the unfinished pass.
        Err(e) => warn!(%group_id, %broker_id, error = %e, "initial placement for broker failed"),
    }

    info!(
        remote = %ctx.remote,
        %group_id,
        %broker_id,
        identity = ?peer.identity,
        "broker registered"
    );
    Ok(Registered {
        connection,
        group_id,
        broker_id,
    })
}

async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
