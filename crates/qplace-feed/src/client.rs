//! Reconnecting desired-state subscriber.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

use qplace_core::config::FeedSettings;
use qplace_core::{DesiredState, Endpoint};

use crate::decode::decode_snapshot;

/// Longest accepted snapshot line.
pub const MAX_SNAPSHOT_LENGTH: usize = 16 * 1024 * 1024;

/// Receives every decoded snapshot, in order. The next line is not read
/// until the returned future completes.
pub type DesiredStateCallback = Arc<dyn Fn(DesiredState) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub endpoint: Endpoint,
    pub reconnect_delay: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::from(&FeedSettings::default())
    }
}

impl From<&FeedSettings> for FeedConfig {
    fn from(settings: &FeedSettings) -> Self {
        Self {
            endpoint: settings.endpoint(),
            reconnect_delay: settings.reconnect_delay(),
        }
    }
}

pub struct DesiredStateClient {
    config: FeedConfig,
}

impl DesiredStateClient {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }

    /// Follow the feed until `shutdown` turns true (or its sender is
    /// dropped). Connection failures, end of stream and undecodable
    /// snapshots are logged and followed by a reconnect after
    /// `reconnect_delay`.
    pub async fn run(&self, callback: DesiredStateCallback, mut shutdown: watch::Receiver<bool>) {
        let host = &self.config.endpoint.host;
        let port = self.config.endpoint.port;

        while !*shutdown.borrow() {
            let outcome = tokio::select! {
                outcome = self.follow(&callback) => outcome,
                _ = shutdown_signalled(&mut shutdown) => break,
            };
            match outcome {
                Ok(()) => warn!(%host, port, "desired-state feed closed by peer"),
                Err(e) => warn!(%host, port, error = %format!("{e:#}"), "desired-state feed failed"),
            }

            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
        info!(%host, port, "desired-state feed stopped");
    }

    async fn follow(&self, callback: &DesiredStateCallback) -> anyhow::Result<()> {
        let endpoint = &self.config.endpoint;
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .with_context(|| format!("connecting to {}:{}", endpoint.host, endpoint.port))?;
        info!(host = %endpoint.host, port = endpoint.port, "desired-state feed connected");

        let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_SNAPSHOT_LENGTH));
        while let Some(line) = lines.next().await {
            let line = line.context("reading snapshot")?;
            if line.trim().is_empty() {
                continue;
            }
            let state = decode_snapshot(&line).context("decoding snapshot")?;
            debug!(groups = state.len(), "desired state received");
            callback(state).await;
        }
        Ok(())
    }
}

async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    struct Feed {
        listener: TcpListener,
        states: mpsc::UnboundedReceiver<DesiredState>,
        stop: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    async fn start() -> Feed {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = DesiredStateClient::new(FeedConfig {
            endpoint: Endpoint::new("127.0.0.1", port),
            reconnect_delay: Duration::from_millis(50),
        });

        let (tx, states) = mpsc::unbounded_channel();
        let callback: DesiredStateCallback = Arc::new(move |state: DesiredState| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(state);
            }
            .boxed()
        });
        let (stop, rx) = watch::channel(false);
        let task = tokio::spawn(async move { client.run(callback, rx).await });
        Feed {
            listener,
            states,
            stop,
            task,
        }
    }

    async fn accept(listener: &TcpListener) -> TcpStream {
        let (socket, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        socket
    }

    async fn next_state(feed: &mut Feed) -> DesiredState {
        timeout(Duration::from_secs(5), feed.states.recv())
            .await
            .unwrap()
            .unwrap()
    }

    const SNAPSHOT: &str = "[{\"name\":\"q1\",\"type\":\"queue\",\"plan\":\"pooled-inmemory\"},\
                            {\"name\":\"orders\",\"type\":\"queue\",\"plan\":\"sharded\"}]\n";

    #[tokio::test]
    async fn snapshots_reach_the_callback_grouped() {
        let mut feed = start().await;
        let mut socket = accept(&feed.listener).await;

        socket.write_all(SNAPSHOT.as_bytes()).await.unwrap();
        socket.write_all(b"[]\n").await.unwrap();

        let first = next_state(&mut feed).await;
        assert_eq!(
            first.keys().cloned().collect::<Vec<_>>(),
            vec!["orders".to_string(), "pooled-inmemory".to_string()]
        );
        assert!(next_state(&mut feed).await.is_empty());
    }

    #[tokio::test]
    async fn reconnects_after_peer_closes() {
        let mut feed = start().await;
        let socket = accept(&feed.listener).await;
        drop(socket);

        let mut socket = accept(&feed.listener).await;
        socket.write_all(SNAPSHOT.as_bytes()).await.unwrap();
        assert_eq!(next_state(&mut feed).await.len(), 2);
    }

    #[tokio::test]
    async fn undecodable_snapshot_forces_reconnect() {
        let mut feed = start().await;
        let mut socket = accept(&feed.listener).await;
        socket.write_all(b"{not json\n").await.unwrap();

        let mut socket2 = accept(&feed.listener).await;
        socket2.write_all(b"[]\n").await.unwrap();

        assert!(next_state(&mut feed).await.is_empty());
        drop(socket);
    }

    #[tokio::test]
    async fn shutdown_stops_a_connected_feed() {
        let feed = start().await;
        let _socket = accept(&feed.listener).await;

        feed.stop.send(true).unwrap();
        timeout(Duration::from_secs(5), feed.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreachable_feed_keeps_retrying_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = DesiredStateClient::new(FeedConfig {
            endpoint: Endpoint::new("127.0.0.1", port),
            reconnect_delay: Duration::from_millis(20),
        });
        let callback: DesiredStateCallback = Arc::new(|_: DesiredState| async {}.boxed());
        let (stop, rx) = watch::channel(false);
        let task = tokio::spawn(async move { client.run(callback, rx).await });

        sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());
        stop.send(true).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
