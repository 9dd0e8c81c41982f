//! Connection state machine for a client session.
//!
//! The machine is pure: it consumes [`Input`]s and returns the [`Action`]s
//! the driver must perform. All timers and sockets live in the driver.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use parley_types::events::{MessagePush, ServerEnvelope};

use crate::backoff::{BackoffPolicy, ReconnectScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    /// Disconnected with a reconnect timer armed.
    Reconnecting,
}

#[derive(Debug)]
pub enum Input {
    Start,
    ReconnectDue,
    TransportOpened,
    TransportFailed(String),
    TransportClosed(Option<String>),
    HeartbeatDue,
    Frame(ServerEnvelope),
    Shutdown,
}

#[derive(Debug)]
pub enum Action {
    OpenTransport,
    AbortConnect,
    CloseTransport,
    StartHeartbeat,
    StopHeartbeat,
    SendPing,
    ScheduleReconnect { delay: Duration, token: CancellationToken },
    CancelReconnect,
    /// Pull conversations and the selected transcript over REST.
    Resync,
    Deliver(MessagePush),
    Notice(String),
    StateChanged(ConnectionState),
}

#[derive(Debug)]
pub struct SessionMachine {
    state: ConnectionState,
    scheduler: ReconnectScheduler,
    heartbeat_running: bool,
    finished: bool,
}

impl SessionMachine {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            scheduler: ReconnectScheduler::new(backoff),
            heartbeat_running: false,
            finished: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once shutdown completed; no input produces actions afterwards.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.scheduler.attempt()
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        use ConnectionState::*;

        let mut actions = Vec::new();
        if self.finished {
            trace!("Session finished, ignoring {:?}", input);
            return actions;
        }

        match (self.state, input) {
            (Disconnected, Input::Start) => {
                self.enter(Connecting, &mut actions);
                actions.push(Action::OpenTransport);
            }
            (Reconnecting, Input::ReconnectDue) => {
                self.scheduler.fired();
                self.enter(Connecting, &mut actions);
                actions.push(Action::OpenTransport);
            }
            (Connecting, Input::TransportOpened) => {
                self.scheduler.reset();
                self.enter(Open, &mut actions);
                self.start_heartbeat(&mut actions);
                actions.push(Action::Resync);
            }
            (Connecting, Input::TransportFailed(reason)) => {
                actions.push(Action::Notice(format!("Connection failed: {reason}")));
                self.schedule_reconnect(&mut actions);
            }
            (Open, Input::TransportClosed(reason)) => {
                self.stop_heartbeat(&mut actions);
                let notice = match reason {
                    Some(reason) => format!("Connection lost: {reason}"),
                    None => "Connection lost".to_string(),
                };
                actions.push(Action::Notice(notice));
                self.schedule_reconnect(&mut actions);
            }
            (Open, Input::HeartbeatDue) => actions.push(Action::SendPing),
            (Open, Input::Frame(envelope)) => match envelope {
                ServerEnvelope::Message(push) => actions.push(Action::Deliver(push)),
                ServerEnvelope::Error(notice) => actions.push(Action::Notice(notice.detail)),
                ServerEnvelope::Control(_) => {}
            },
            (Open, Input::Shutdown) => {
                self.stop_heartbeat(&mut actions);
                self.enter(Closing, &mut actions);
                actions.push(Action::CloseTransport);
            }
            (Closing, Input::TransportClosed(_)) => self.finish(&mut actions),
            (Connecting, Input::Shutdown) => {
                actions.push(Action::AbortConnect);
                self.finish(&mut actions);
            }
            (Disconnected | Reconnecting, Input::Shutdown) => {
                if self.scheduler.cancel() {
                    actions.push(Action::CancelReconnect);
                }
                self.finish(&mut actions);
            }
            (state, input) => trace!("Ignoring {:?} while {:?}", input, state),
        }

        actions
    }

    fn enter(&mut self, next: ConnectionState, actions: &mut Vec<Action>) {
        if self.state != next {
            trace!("Session {:?} -> {:?}", self.state, next);
            self.state = next;
            actions.push(Action::StateChanged(next));
        }
    }

    fn start_heartbeat(&mut self, actions: &mut Vec<Action>) {
        if !self.heartbeat_running {
            self.heartbeat_running = true;
            actions.push(Action::StartHeartbeat);
        }
    }

    fn stop_heartbeat(&mut self, actions: &mut Vec<Action>) {
        if self.heartbeat_running {
            self.heartbeat_running = false;
            actions.push(Action::StopHeartbeat);
        }
    }

    fn schedule_reconnect(&mut self, actions: &mut Vec<Action>) {
        let scheduled = self.scheduler.schedule();
        self.enter(ConnectionState::Reconnecting, actions);
        actions.push(Action::ScheduleReconnect {
            delay: scheduled.delay,
            token: scheduled.token,
        });
    }

    fn finish(&mut self, actions: &mut Vec<Action>) {
        self.enter(ConnectionState::Disconnected, actions);
        self.finished = true;
    }
}
