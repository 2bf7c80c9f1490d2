//! Outgoing telemetry transports.
//!
//! A transport only reports whether one message was delivered; durability
//! and retry belong to [`crate::Tele`]. Incoming commands are handed out as
//! an `mpsc::Receiver<Command>` when the transport is created.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;
use vender_protocol::tele::{Command, Response, State, Telemetry};

use crate::slim::SlimTransport;

pub const COMMAND_CAPACITY: usize = 16;

pub trait Transport: Send + Sync + 'static {
    fn send_state(&self, state: State) -> impl Future<Output = bool> + Send;

    fn send_telemetry(&self, telemetry: Telemetry) -> impl Future<Output = bool> + Send;

    /// `topic` is the full response topic, already prefixed with the
    /// machine identity.
    fn send_command_response(
        &self,
        topic: String,
        response: Response,
    ) -> impl Future<Output = bool> + Send;

    fn close(&self);
}

/// Closed set of transports the telemetry client can run over.
#[derive(Debug)]
pub enum TransportDriver {
    Slim(SlimTransport),
    Mock(MockTransport),
}

impl Transport for TransportDriver {
    async fn send_state(&self, state: State) -> bool {
        match self {
            Self::Slim(t) => t.send_state(state).await,
            Self::Mock(t) => t.send_state(state).await,
        }
    }

    async fn send_telemetry(&self, telemetry: Telemetry) -> bool {
        match self {
            Self::Slim(t) => t.send_telemetry(telemetry).await,
            Self::Mock(t) => t.send_telemetry(telemetry).await,
        }
    }

    async fn send_command_response(&self, topic: String, response: Response) -> bool {
        match self {
            Self::Slim(t) => t.send_command_response(topic, response).await,
            Self::Mock(t) => t.send_command_response(topic, response).await,
        }
    }

    fn close(&self) {
        match self {
            Self::Slim(t) => t.close(),
            Self::Mock(t) => t.close(),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    online: bool,
    attempts: usize,
    states: Vec<State>,
    telemetry: Vec<Telemetry>,
    responses: Vec<(String, Response)>,
    closed: bool,
}

/// In-memory transport. Offline by default so tests opt into delivery.
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Clone)]
pub struct MockTransportHandle {
    state: Arc<Mutex<MockState>>,
    commands: mpsc::Sender<Command>,
}

impl MockTransport {
    pub fn new() -> (Self, MockTransportHandle, mpsc::Receiver<Command>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        (
            Self {
                state: Arc::clone(&state),
            },
            MockTransportHandle {
                state,
                commands: tx,
            },
            rx,
        )
    }

    fn deliver(&self, f: impl FnOnce(&mut MockState)) -> bool {
        let mut st = lock(&self.state);
        st.attempts += 1;
        if !st.online || st.closed {
            return false;
        }
        f(&mut st);
        true
    }
}

impl Transport for MockTransport {
    async fn send_state(&self, state: State) -> bool {
        debug!(?state, "mock transport state");
        self.deliver(|st| st.states.push(state))
    }

    async fn send_telemetry(&self, telemetry: Telemetry) -> bool {
        self.deliver(|st| st.telemetry.push(telemetry))
    }

    async fn send_command_response(&self, topic: String, response: Response) -> bool {
        self.deliver(|st| st.responses.push((topic, response)))
    }

    fn close(&self) {
        lock(&self.state).closed = true;
    }
}

impl MockTransportHandle {
    pub fn set_online(&self, online: bool) {
        lock(&self.state).online = online;
    }

    /// Every send call, delivered or not.
    pub fn attempts(&self) -> usize {
        lock(&self.state).attempts
    }

    pub fn states(&self) -> Vec<State> {
        lock(&self.state).states.clone()
    }

    pub fn telemetry(&self) -> Vec<Telemetry> {
        lock(&self.state).telemetry.clone()
    }

    pub fn responses(&self) -> Vec<(String, Response)> {
        lock(&self.state).responses.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Deliver a command as if it came from the server.
    pub async fn command(&self, command: Command) {
        let _ = self.commands.send(command).await;
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
