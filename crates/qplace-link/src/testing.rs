//! In-process broker peer for exercising links and the scheduler server.
//!
//! [`SimulatedBroker`] speaks the broker side of the connection protocol:
//! it sends `open`, accepts a sender on the management address and dynamic
//! receivers, and executes the management operations the scheduler issues
//! against an in-memory queue set. Knobs on the running peer inject refused
//! attaches, silence, slow replies, stray replies and links detached
//! mid-session.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::protocol::{
    Frame, FrameCodec, Handle, MANAGEMENT_ADDRESS, Message, PROP_OPERATION_NAME,
    PROP_OPERATION_SUCCEEDED, Role,
};

#[derive(Debug, Clone)]
pub struct SimulatedBrokerConfig {
    pub container_id: String,
    pub group_id: Option<String>,
    /// Queues present before the scheduler connects.
    pub queues: Vec<String>,
    /// Number of `attach` frames to refuse before accepting any.
    pub refuse_attaches: u32,
}

impl SimulatedBrokerConfig {
    pub fn new(container_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            group_id: Some(group_id.into()),
            queues: Vec::new(),
            refuse_attaches: 0,
        }
    }

    /// A peer whose `open` carries no group id.
    pub fn without_group(mut self) -> Self {
        self.group_id = None;
        self
    }

    pub fn with_queues<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn refuse_attaches(mut self, n: u32) -> Self {
        self.refuse_attaches = n;
        self
    }
}

#[derive(Debug, Default)]
struct SimState {
    queues: BTreeSet<String>,
    reply_addresses: BTreeSet<String>,
    connectors: BTreeMap<String, Value>,
    operations: Vec<String>,
    refuse_attaches: u32,
    unresponsive: bool,
    reply_delay: Option<Duration>,
    stray_replies: bool,
    opened: bool,
}

enum Command {
    Disconnect,
    DetachReplyLinks,
}

enum SimLink {
    Management,
    Reply(String),
}

pub struct SimulatedBroker {
    state: Arc<Mutex<SimState>>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl SimulatedBroker {
    /// Run the broker side of the protocol on `io`.
    pub fn spawn<S>(io: S, config: SimulatedBrokerConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let state = Arc::new(Mutex::new(SimState {
            queues: config.queues.iter().cloned().collect(),
            refuse_attaches: config.refuse_attaches,
            ..SimState::default()
        }));
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve(io, config, state.clone(), rx));
        Self {
            state,
            commands,
            task,
        }
    }

    /// Dial a scheduler listening on `addr`.
    pub async fn connect(addr: SocketAddr, config: SimulatedBrokerConfig) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::spawn(stream, config))
    }

    /// Queues hosted, without the dynamic reply addresses.
    pub fn queue_names(&self) -> BTreeSet<String> {
        let state = self.lock();
        state
            .queues
            .difference(&state.reply_addresses)
            .cloned()
            .collect()
    }

    /// Connector service parameters by name.
    pub fn connectors(&self) -> BTreeMap<String, Value> {
        self.lock().connectors.clone()
    }

    /// Management operation names received, in order.
    pub fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// Whether the scheduler answered our `open`.
    pub fn is_open(&self) -> bool {
        self.lock().opened
    }

    /// Stop answering management requests.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.lock().unresponsive = unresponsive;
    }

    pub fn set_reply_delay(&self, delay: Option<Duration>) {
        self.lock().reply_delay = delay;
    }

    /// Precede every reply with one carrying an unrelated correlation id.
    pub fn set_stray_replies(&self, stray: bool) {
        self.lock().stray_replies = stray;
    }

    /// Send `close` and drop the connection.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Detach every dynamic reply link while keeping the connection open.
    pub fn detach_reply_links(&self) {
        let _ = self.commands.send(Command::DetachReplyLinks);
    }

    /// Whether the peer's connection task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("simulated broker lock")
    }
}

impl Drop for SimulatedBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<S>(
    io: S,
    config: SimulatedBrokerConfig,
    state: Arc<Mutex<SimState>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(io, FrameCodec::new());
    let open = Frame::Open {
        container_id: config.container_id.clone(),
        group_id: config.group_id.clone(),
    };
    if framed.send(open).await.is_err() {
        return;
    }

    let mut links: HashMap<Handle, SimLink> = HashMap::new();
    loop {
        let frame = tokio::select! {
            command = commands.recv() => match command {
                Some(Command::DetachReplyLinks) => {
                    let detached = detach_reply_links(&state, &mut links);
                    for handle in detached {
                        let frame = Frame::Detach { handle, error: None };
                        if framed.send(frame).await.is_err() {
                            return;
                        }
                    }
                    continue;
                }
                Some(Command::Disconnect) | None => {
                    let _ = framed.send(Frame::Close { error: None }).await;
                    return;
                }
            },
            frame = framed.next() => frame,
        };
        let Some(Ok(frame)) = frame else {
            return;
        };

        match frame {
            Frame::Open { .. } => lock(&state).opened = true,
            Frame::Attach {
                handle,
                role,
                address,
                dynamic,
            } => {
                let reply = attach(&state, &mut links, handle, role, address, dynamic);
                if framed.send(reply).await.is_err() {
                    return;
                }
            }
            Frame::Transfer { handle, message } => {
                if !matches!(links.get(&handle), Some(SimLink::Management)) {
                    continue;
                }
                let (unresponsive, delay, stray) = {
                    let s = lock(&state);
                    (s.unresponsive, s.reply_delay, s.stray_replies)
                };
                if unresponsive {
                    continue;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }

                let reply = execute(&mut lock(&state), &message);
                let Some(reply_handle) = reply_handle(&links, message.reply_to.as_deref()) else {
                    continue;
                };
                if stray {
                    let stray = Message {
                        correlation_id: Some(Uuid::new_v4().to_string()),
                        body: Some("[]".into()),
                        ..Message::default()
                    };
                    let _ = framed
                        .send(Frame::Transfer {
                            handle: reply_handle,
                            message: stray,
                        })
                        .await;
                }
                let frame = Frame::Transfer {
                    handle: reply_handle,
                    message: reply,
                };
                if framed.send(frame).await.is_err() {
                    return;
                }
            }
            Frame::Detach { handle, .. } => {
                if let Some(SimLink::Reply(address)) = links.remove(&handle) {
                    let mut s = lock(&state);
                    s.queues.remove(&address);
                    s.reply_addresses.remove(&address);
                }
            }
            Frame::Close { .. } => return,
            Frame::Attached { .. } => {}
        }
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().expect("simulated broker lock")
}

fn attach(
    state: &Mutex<SimState>,
    links: &mut HashMap<Handle, SimLink>,
    handle: Handle,
    role: Role,
    address: Option<String>,
    dynamic: bool,
) -> Frame {
    let mut s = lock(state);
    if s.refuse_attaches > 0 {
        s.refuse_attaches -= 1;
        return Frame::Attached {
            handle,
            address,
            error: Some("amqp:resource-limit-exceeded".to_string()),
        };
    }

    let management = address.as_deref() == Some(MANAGEMENT_ADDRESS);
    match (role, management, dynamic) {
        (Role::Sender, true, _) => {
            links.insert(handle, SimLink::Management);
            Frame::Attached {
                handle,
                address,
                error: None,
            }
        }
        (Role::Receiver, _, true) => {
            let assigned = format!("reply-{}", Uuid::new_v4());
            s.queues.insert(assigned.clone());
            s.reply_addresses.insert(assigned.clone());
            links.insert(handle, SimLink::Reply(assigned.clone()));
            Frame::Attached {
                handle,
                address: Some(assigned),
                error: None,
            }
        }
        _ => Frame::Attached {
            handle,
            address,
            error: Some("amqp:not-found".to_string()),
        },
    }
}

fn detach_reply_links(state: &Mutex<SimState>, links: &mut HashMap<Handle, SimLink>) -> Vec<Handle> {
    let handles: Vec<Handle> = links
        .iter()
        .filter(|(_, link)| matches!(link, SimLink::Reply(_)))
        .map(|(handle, _)| *handle)
        .collect();
    let mut s = lock(state);
    for handle in &handles {
        if let Some(SimLink::Reply(address)) = links.remove(handle) {
            s.queues.remove(&address);
            s.reply_addresses.remove(&address);
        }
    }
    handles
}

fn reply_handle(links: &HashMap<Handle, SimLink>, reply_to: Option<&str>) -> Option<Handle> {
    let reply_to = reply_to?;
    links.iter().find_map(|(handle, link)| match link {
        SimLink::Reply(address) if address == reply_to => Some(*handle),
        _ => None,
    })
}

fn execute(state: &mut SimState, request: &Message) -> Message {
    let operation = request
        .property_str(PROP_OPERATION_NAME)
        .unwrap_or_default()
        .to_string();
    state.operations.push(operation.clone());

    let args: Vec<Value> = request
        .body
        .as_deref()
        .and_then(|body| serde_json::from_str(body).ok())
        .unwrap_or_default();
    let name = args.first().and_then(Value::as_str).map(str::to_string);

    let outcome: Result<Value, String> = match (operation.as_str(), name) {
        ("createQueue", Some(name)) => {
            if state.queues.insert(name.clone()) {
                Ok(Value::Null)
            } else {
                Err(format!("AMQ229019: Queue {name} already exists"))
            }
        }
        ("destroyQueue", Some(name)) => {
            state.queues.remove(&name);
            Ok(Value::Null)
        }
        ("createConnectorService", Some(name)) => {
            let params = args.get(2).cloned().unwrap_or(Value::Null);
            state.connectors.insert(name, params);
            Ok(Value::Null)
        }
        ("destroyConnectorService", Some(name)) => {
            state.connectors.remove(&name);
            Ok(Value::Null)
        }
        ("getQueueNames", _) => Ok(json!([state.queues.iter().collect::<Vec<_>>()])),
        _ => Err(format!("unsupported operation {operation}")),
    };

    let (succeeded, body) = match outcome {
        Ok(Value::Null) => (true, None),
        Ok(value) => (true, Some(value.to_string())),
        Err(reason) => (false, Some(reason)),
    };
    Message {
        correlation_id: request.message_id.clone(),
        to: request.reply_to.clone(),
        body,
        ..Message::default()
    }
    .with_property(PROP_OPERATION_SUCCEEDED, succeeded)
}
