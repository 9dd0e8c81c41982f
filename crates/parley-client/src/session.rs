use std::collections::VecDeque;
use std::future::{Future, pending};
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use parley_types::api::{ConversationResponse, MessageResponse};
use parley_types::events::{MessagePush, PING_FRAME, SendEnvelope, ServerEnvelope};
use parley_types::models::{ConversationId, UserId};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::machine::{Action, ConnectionState, Input, SessionMachine};
use crate::reconciler::{DisplayedMessage, OptimisticReconciler, Slot};
use crate::rest::RestClient;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type SharedView = Arc<RwLock<OptimisticReconciler>>;

/// Everything the UI needs to re-render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    State(ConnectionState),
    Conversations,
    Transcript(Slot),
    /// Transient, user-visible; never implies local state was discarded.
    Notice(String),
}

#[derive(Debug)]
enum Command {
    Send(SendEnvelope),
    Select(Option<Slot>),
    RefreshConversations,
    Delete(ConversationId),
    Shutdown,
}

/// Result of a REST call made on the session's behalf.
enum Outcome {
    /// Carries the list epoch at request time.
    Conversations(u64, Result<Vec<ConversationResponse>, ClientError>),
    Transcript(ConversationId, Result<Vec<MessageResponse>, ClientError>),
    Deleted(ConversationId, Result<(), ClientError>),
}

pub struct SessionManager;

impl SessionManager {
    /// Spawn the session driver and connect immediately.
    pub fn start(config: ClientConfig) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let view: SharedView = Arc::new(RwLock::new(OptimisticReconciler::new(config.user_id)));
        let rest = RestClient::new(config.base_url.clone()).with_token(config.token.clone());

        let driver = Driver {
            machine: SessionMachine::new(config.backoff),
            config,
            view: view.clone(),
            state: state_tx,
            events: events_tx.clone(),
            rest,
            selected: None,
            list_epoch: 0,
            transport: None,
            connecting: None,
            heartbeat: None,
            reconnect: None,
            requests: JoinSet::new(),
        };
        let task = tokio::spawn(driver.run(commands_rx));

        let handle = SessionHandle {
            commands: commands_tx,
            events: events_tx,
            state: state_rx,
            view,
            task,
        };
        (handle, events_rx)
    }
}

/// Caller side of a running session. Dropping it shuts the session down.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Receiver<ConnectionState>,
    view: SharedView,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn wait_for_state(&self, wanted: ConnectionState) -> Result<(), ClientError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == wanted)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::SessionClosed)
    }

    /// Show the message right away, then hand it to the gateway. Returns
    /// the slot the pending entry was placed in.
    pub fn send_message(&self, to: UserId, content: &str) -> Result<Slot, ClientError> {
        if content.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if self.commands.is_closed() {
            return Err(ClientError::SessionClosed);
        }

        let slot = {
            let mut view = write_view(&self.view);
            let slot = view.slot_for_peer(to);
            view.add_pending(slot, content);
            slot
        };
        let _ = self.events.send(SessionEvent::Transcript(slot));

        let conversation_id = match slot {
            Slot::Conversation(id) => Some(id),
            Slot::Draft(_) => None,
        };
        self.command(Command::Send(SendEnvelope {
            to,
            conversation_id,
            content: content.to_string(),
        }))?;
        Ok(slot)
    }

    /// Focus a transcript. Selecting a conversation pulls it from the server.
    pub fn select(&self, slot: Option<Slot>) -> Result<(), ClientError> {
        self.command(Command::Select(slot))
    }

    pub fn refresh_conversations(&self) -> Result<(), ClientError> {
        self.command(Command::RefreshConversations)
    }

    pub fn delete_conversation(&self, conversation: ConversationId) -> Result<(), ClientError> {
        self.command(Command::Delete(conversation))
    }

    pub fn transcript(&self, slot: Slot) -> Vec<DisplayedMessage> {
        read_view(&self.view).transcript(slot).to_vec()
    }

    pub fn conversations(&self) -> Vec<ConversationResponse> {
        read_view(&self.view).conversations().to_vec()
    }

    /// Close the transport, cancel timers and in-flight requests, and wait
    /// for the driver to exit. No events are emitted afterwards.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Session task ended abnormally: {}", e);
        }
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::SessionClosed)
    }
}

struct Driver {
    config: ClientConfig,
    machine: SessionMachine,
    view: SharedView,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    rest: RestClient,
    selected: Option<Slot>,
    /// Bumped whenever a push or delete changes the conversation list, so a
    /// list pulled before the change is not applied over it.
    list_epoch: u64,
    transport: Option<WsStream>,
    connecting: Option<BoxFuture<Result<WsStream, ClientError>>>,
    heartbeat: Option<Interval>,
    reconnect: Option<BoxFuture<bool>>,
    requests: JoinSet<Outcome>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("Starting session for user {}", self.config.user_id);
        self.dispatch(Input::Start).await;

        while !self.machine.is_finished() {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => self.dispatch(Input::Shutdown).await,
                    Some(command) => self.on_command(command).await,
                },
                result = poll_slot(&mut self.connecting) => {
                    self.connecting = None;
                    match result {
                        Ok(ws) => {
                            self.transport = Some(ws);
                            self.dispatch(Input::TransportOpened).await;
                        }
                        Err(e) => self.dispatch(Input::TransportFailed(e.to_string())).await,
                    }
                }
                frame = next_frame(&mut self.transport) => self.on_frame(frame).await,
                _ = tick(&mut self.heartbeat) => self.dispatch(Input::HeartbeatDue).await,
                fired = poll_slot(&mut self.reconnect) => {
                    self.reconnect = None;
                    if fired {
                        self.dispatch(Input::ReconnectDue).await;
                    }
                }
                Some(joined) = self.requests.join_next() => match joined {
                    Ok(outcome) => self.on_outcome(outcome),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!("Session request task failed: {}", e),
                },
            }
        }

        self.requests.abort_all();
        info!("Session for user {} shut down", self.config.user_id);
    }

    /// Feed an input to the machine and perform the resulting actions.
    /// Actions that complete synchronously may produce follow-up inputs.
    async fn dispatch(&mut self, input: Input) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            for action in self.machine.handle(input) {
                if let Some(next) = self.perform(action).await {
                    queue.push_back(next);
                }
            }
        }
    }

    async fn perform(&mut self, action: Action) -> Option<Input> {
        match action {
            Action::OpenTransport => {
                debug!("Connecting to gateway");
                self.connecting = Some(connect(self.config.ws_url(), self.config.connect_timeout));
            }
            Action::AbortConnect => self.connecting = None,
            Action::CloseTransport => {
                if let Some(mut ws) = self.transport.take() {
                    if let Err(e) = ws.close(None).await {
                        debug!("Close handshake failed: {}", e);
                    }
                }
                return Some(Input::TransportClosed(None));
            }
            Action::StartHeartbeat => {
                let period = self.config.heartbeat_interval;
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(interval);
            }
            Action::StopHeartbeat => self.heartbeat = None,
            Action::SendPing => {
                if let Err(e) = self.write(PING_FRAME.to_string()).await {
                    self.transport = None;
                    return Some(Input::TransportClosed(Some(e.to_string())));
                }
            }
            Action::ScheduleReconnect { delay, token } => {
                self.reconnect = Some(Box::pin(async move {
                    tokio::select! {
                        _ = token.cancelled() => false,
                        _ = tokio::time::sleep(delay) => true,
                    }
                }));
            }
            Action::CancelReconnect => self.reconnect = None,
            Action::Resync => {
                self.pull_conversations();
                if let Some(Slot::Conversation(id)) = self.selected {
                    self.pull_transcript(id);
                }
            }
            Action::Deliver(push) => self.deliver(push),
            Action::Notice(detail) => self.emit(SessionEvent::Notice(detail)),
            Action::StateChanged(state) => {
                self.state.send_replace(state);
                self.emit(SessionEvent::State(state));
            }
        }
        None
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Send(envelope) => {
                if self.machine.state() != ConnectionState::Open {
                    self.emit(SessionEvent::Notice(ClientError::NotConnected.to_string()));
                    return;
                }
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode send envelope: {}", e);
                        return;
                    }
                };
                if let Err(e) = self.write(text).await {
                    self.transport = None;
                    self.dispatch(Input::TransportClosed(Some(e.to_string()))).await;
                }
            }
            Command::Select(slot) => {
                self.selected = slot;
                if let Some(Slot::Conversation(id)) = slot {
                    self.pull_transcript(id);
                }
            }
            Command::RefreshConversations => self.pull_conversations(),
            Command::Delete(id) => {
                let rest = self.rest.clone();
                self.requests
                    .spawn(async move { Outcome::Deleted(id, rest.delete_conversation(id).await) });
            }
            Command::Shutdown => self.dispatch(Input::Shutdown).await,
        }
    }

    async fn on_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEnvelope>(text.as_str()) {
                Ok(envelope) => self.dispatch(Input::Frame(envelope)).await,
                Err(e) => warn!("Ignoring undecodable frame: {}", e),
            },
            Some(Ok(Message::Close(frame))) => {
                self.transport = None;
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|reason| !reason.is_empty());
                self.dispatch(Input::TransportClosed(reason)).await;
            }
            // Control frames are answered by tungstenite.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                self.transport = None;
                self.dispatch(Input::TransportClosed(Some(e.to_string()))).await;
            }
            None => {
                self.transport = None;
                self.dispatch(Input::TransportClosed(None)).await;
            }
        }
    }

    fn on_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Conversations(epoch, Ok(_)) if epoch != self.list_epoch => {
                debug!("Conversation list changed while pulling, pulling again");
                self.pull_conversations();
            }
            Outcome::Conversations(_, Ok(conversations)) => {
                write_view(&self.view).replace_conversations(conversations);
                if let Some(Slot::Conversation(id)) = self.selected {
                    if !read_view(&self.view).conversations().iter().any(|c| c.id == id) {
                        self.selected = None;
                    }
                }
                self.emit(SessionEvent::Conversations);
            }
            Outcome::Transcript(id, Ok(messages)) => {
                write_view(&self.view).replace_transcript(id, messages);
                self.emit(SessionEvent::Transcript(Slot::Conversation(id)));
            }
            Outcome::Transcript(id, Err(e)) | Outcome::Deleted(id, Err(e)) if e.is_not_found() => self.forget(id),
            Outcome::Deleted(id, Ok(())) => self.forget(id),
            Outcome::Conversations(_, Err(e)) | Outcome::Transcript(_, Err(e)) | Outcome::Deleted(_, Err(e)) => {
                warn!("Session request failed: {}", e);
                self.emit(SessionEvent::Notice(e.to_string()));
            }
        }
    }

    fn deliver(&mut self, push: MessagePush) {
        let outcome = write_view(&self.view).apply_push(push);
        if let Some(peer) = outcome.promoted_draft {
            if self.selected == Some(Slot::Draft(peer)) {
                self.selected = Some(outcome.slot);
            }
        }
        if outcome.new_conversation {
            self.list_epoch += 1;
            self.emit(SessionEvent::Conversations);
        }
        self.emit(SessionEvent::Transcript(outcome.slot));

        // A push is authoritative for its conversation: settle any pending
        // entries left beside it, selected or not.
        if self.selected == Some(outcome.slot) || outcome.needs_pull {
            if let Slot::Conversation(id) = outcome.slot {
                self.pull_transcript(id);
            }
        }
    }

    /// The server no longer has this conversation.
    fn forget(&mut self, id: ConversationId) {
        write_view(&self.view).remove_conversation(id);
        self.list_epoch += 1;
        if self.selected == Some(Slot::Conversation(id)) {
            self.selected = None;
        }
        self.emit(SessionEvent::Conversations);
        self.emit(SessionEvent::Transcript(Slot::Conversation(id)));
    }

    fn pull_conversations(&mut self) {
        let rest = self.rest.clone();
        let me = self.config.user_id;
        let epoch = self.list_epoch;
        self.requests
            .spawn(async move { Outcome::Conversations(epoch, rest.list_conversations(me).await) });
    }

    fn pull_transcript(&mut self, id: ConversationId) {
        let rest = self.rest.clone();
        self.requests
            .spawn(async move { Outcome::Transcript(id, rest.list_messages(id).await) });
    }

    async fn write(&mut self, text: String) -> Result<(), ClientError> {
        match self.transport.as_mut() {
            Some(ws) => Ok(ws.send(Message::Text(text.into())).await?),
            None => Err(ClientError::NotConnected),
        }
    }

    fn emit(&self, event: SessionEvent) {
        // The UI may have stopped listening; the session keeps running.
        let _ = self.events.send(event);
    }
}

fn connect(url: String, timeout: Duration) -> BoxFuture<Result<WsStream, ClientError>> {
    Box::pin(async move {
        match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(ClientError::WebSocket(e)),
            Err(_) => Err(ClientError::Timeout),
        }
    })
}

async fn poll_slot<T>(slot: &mut Option<BoxFuture<T>>) -> T {
    match slot {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_frame(transport: &mut Option<WsStream>) -> Option<Result<Message, tungstenite::Error>> {
    match transport {
        Some(ws) => ws.next().await,
        None => pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

fn read_view(view: &SharedView) -> RwLockReadGuard<'_, OptimisticReconciler> {
    view.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_view(view: &SharedView) -> RwLockWriteGuard<'_, OptimisticReconciler> {
    view.write().unwrap_or_else(PoisonError::into_inner)
}
