//! Telemetry client.
//!
//! ```text
//! state(s) ──watch──> state worker ───────────────┐
//! error/transaction/report/reply ──> Queue ──> queue worker ──> Transport
//!                                   (journal)                     │
//! handler <── dispatch (deadline, Ping, Report) <── commands ─────┘
//! ```
//!
//! State is coalesced: only the latest value matters, it is sent on change,
//! every `state_interval`, and retried after [`STATE_RETRY`] when a send
//! fails. Telemetry and command responses go through the durable queue and
//! are delivered at least once: an entry is deleted only after the
//! transport confirmed it, otherwise it moves to the tail and the worker
//! backs off.
//!
//! Queue entries are one kind byte followed by JSON: [`KIND_RESPONSE`] or
//! [`KIND_TELEMETRY`].

use std::error::Error as StdError;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use vender_core::config::TeleConfig;
use vender_protocol::tele::{
    Command, CommandTask, Response, Stat, State, TeleErrorReport, Telemetry, Transaction,
    topic_response,
};
use vender_storage::{Entry, Queue, StorageError};

use crate::error::{Result, TeleError};
use crate::slim::{SlimOptions, SlimTransport};
use crate::transport::{Transport, TransportDriver};
use crate::unix_nanos;

pub const KIND_RESPONSE: u8 = 1;
pub const KIND_TELEMETRY: u8 = 2;
pub const STATE_RETRY: Duration = Duration::from_secs(17);
pub const QUEUE_RETRY: Duration = Duration::from_secs(5);

/// Fills inventory and money sections of a report.
pub type Reporter = Arc<dyn Fn(&mut Telemetry) + Send + Sync>;

/// Machine side of telemetry. Calls never block on the network.
pub trait Teler: Send + Sync {
    fn state(&self, state: State);

    fn error(&self, err: &(dyn StdError + 'static));

    fn stat_modify(&self, f: &mut dyn FnMut(&mut Stat));

    fn transaction(&self, transaction: Transaction);

    /// Queue a full report; `service` marks reports made from the service
    /// menu.
    fn report(&self, service: bool) -> Result<()>;

    fn command_reply_err(&self, command: &Command, err: Option<&str>);

    fn set_reporter(&self, _reporter: Reporter) {}

    fn close(&self);
}

/// Executes commands the client does not answer by itself.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(
        &self,
        command: &Command,
    ) -> impl Future<Output = std::result::Result<(), String>> + Send;
}

#[derive(Debug, Clone)]
pub struct TeleOptions {
    pub vm_id: i32,
    pub state_interval: Duration,
    pub log_debug: bool,
}

#[derive(Serialize, Deserialize)]
struct QueuedResponse {
    topic: String,
    response: Response,
}

pub struct Tele {
    options: TeleOptions,
    queue: Arc<Queue>,
    transport: Arc<TransportDriver>,
    state_tx: watch::Sender<State>,
    stat: Mutex<Stat>,
    reporter: RwLock<Option<Reporter>>,
    commands: Mutex<Option<mpsc::Receiver<Command>>>,
    stop: CancellationToken,
}

impl std::fmt::Debug for Tele {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tele")
            .field("vm_id", &self.options.vm_id)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl Tele {
    /// Spawn the state and queue workers. Must be called within a tokio
    /// runtime.
    pub fn start(
        options: TeleOptions,
        queue: Queue,
        transport: TransportDriver,
        commands: mpsc::Receiver<Command>,
        stop: CancellationToken,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(State::Invalid);
        let queue = Arc::new(queue);
        let transport = Arc::new(transport);
        tokio::spawn(state_worker(
            Arc::clone(&transport),
            state_rx,
            options.state_interval,
            stop.clone(),
        ));
        tokio::spawn(queue_worker(
            Arc::clone(&transport),
            Arc::clone(&queue),
            stop.clone(),
        ));
        info!(vm_id = options.vm_id, queued = queue.len(), "tele started");
        Arc::new(Self {
            options,
            queue,
            transport,
            state_tx,
            stat: Mutex::new(Stat::default()),
            reporter: RwLock::new(None),
            commands: Mutex::new(Some(commands)),
            stop,
        })
    }

    /// Build the configured client. `Ok(None)` when telemetry is disabled.
    ///
    /// # Errors
    ///
    /// Unknown transport, invalid slim options or an unusable queue
    /// journal under `persist_root`.
    pub fn from_config(
        config: &TeleConfig,
        persist_root: &str,
        stop: &CancellationToken,
    ) -> Result<Option<Arc<Self>>> {
        if !config.enable {
            return Ok(None);
        }
        if config.transport != "slim" {
            return Err(TeleError::config(format!(
                "tele.transport={} unsupported",
                config.transport
            )));
        }
        let slim = SlimOptions::from_config(config)?;
        let dir = Path::new(persist_root).join("tele");
        std::fs::create_dir_all(&dir)?;
        let queue = Queue::open(dir.join("queue"))?;
        let stop = stop.child_token();
        let options = TeleOptions {
            vm_id: slim.vm_id,
            state_interval: Duration::from_secs(config.state_interval_sec.max(1)),
            log_debug: config.log_debug,
        };
        let (transport, commands) = SlimTransport::start(slim, stop.clone());
        Ok(Some(Self::start(
            options,
            queue,
            TransportDriver::Slim(transport),
            commands,
            stop,
        )))
    }

    pub fn vm_id(&self) -> i32 {
        self.options.vm_id
    }

    /// Entries waiting for delivery.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Take the incoming command stream and dispatch each command on its
    /// own task. `None` when already serving.
    pub fn serve_commands<H: CommandHandler>(
        self: &Arc<Self>,
        handler: Arc<H>,
    ) -> Option<JoinHandle<()>> {
        let mut rx = lock(&self.commands).take()?;
        let tele = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    _ = tele.stop.cancelled() => break,
                    c = rx.recv() => match c {
                        Some(c) => c,
                        None => break,
                    },
                };
                let tele = Arc::clone(&tele);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { tele.dispatch(handler.as_ref(), command).await });
            }
            debug!("tele command loop stopped");
        }))
    }

    /// Check the deadline, run the command and queue the response.
    pub async fn dispatch<H: CommandHandler>(&self, handler: &H, command: Command) {
        info!(id = command.id, task = command.task.name(), "tele command");
        let result = if command.deadline != 0 && unix_nanos() > command.deadline {
            Err("command deadline expired".to_string())
        } else {
            match &command.task {
                CommandTask::Ping => Ok(()),
                CommandTask::Report => self.report(false).map_err(|e| e.to_string()),
                _ => handler.handle(&command).await,
            }
        };
        if let Err(e) = &result {
            error!(id = command.id, task = command.task.name(), error = %e, "tele command failed");
        }
        self.command_reply_err(&command, result.err().as_deref());
    }

    fn push(&self, kind: u8, body: Vec<u8>) -> Result<()> {
        let mut data = Vec::with_capacity(body.len() + 1);
        data.push(kind);
        data.extend(body);
        let id = self.queue.push(&data)?;
        if self.options.log_debug {
            debug!(id, kind, len = data.len(), "tele queued");
        }
        Ok(())
    }

    fn push_telemetry(&self, mut t: Telemetry) -> Result<()> {
        t.vm_id = self.options.vm_id;
        t.time = unix_nanos();
        t.build_version = vender_core::VERSION.to_string();
        let mut stat = lock(&self.stat);
        if !stat.is_empty() {
            t.stat = Some(stat.clone());
        }
        self.push(KIND_TELEMETRY, serde_json::to_vec(&t)?)?;
        stat.reset();
        Ok(())
    }

    fn log_push(&self, what: &str, result: Result<()>) {
        if let Err(e) = result {
            error!(what, error = %e, "tele push failed");
        }
    }
}

impl Teler for Tele {
    fn state(&self, state: State) {
        if self.options.log_debug {
            debug!(?state, "tele state");
        }
        self.state_tx.send_replace(state);
    }

    fn error(&self, err: &(dyn StdError + 'static)) {
        let t = Telemetry {
            error: Some(TeleErrorReport {
                message: err.to_string(),
                code: 0,
                count: 1,
            }),
            ..Default::default()
        };
        self.log_push("error", self.push_telemetry(t));
    }

    fn stat_modify(&self, f: &mut dyn FnMut(&mut Stat)) {
        f(&mut lock(&self.stat));
    }

    fn transaction(&self, transaction: Transaction) {
        let t = Telemetry {
            transaction: Some(transaction),
            ..Default::default()
        };
        self.log_push("transaction", self.push_telemetry(t));
    }

    fn report(&self, service: bool) -> Result<()> {
        let mut t = Telemetry {
            at_service: service,
            ..Default::default()
        };
        let reporter = self
            .reporter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(f) = reporter {
            f(&mut t);
        }
        self.push_telemetry(t)
    }

    fn command_reply_err(&self, command: &Command, err: Option<&str>) {
        let queued = QueuedResponse {
            topic: topic_response(self.options.vm_id, &command.reply_topic),
            response: Response {
                command_id: command.id,
                error: err.unwrap_or_default().to_string(),
                reply_topic: String::new(),
            },
        };
        let result = serde_json::to_vec(&queued)
            .map_err(TeleError::from)
            .and_then(|body| self.push(KIND_RESPONSE, body));
        self.log_push("response", result);
    }

    fn set_reporter(&self, reporter: Reporter) {
        *self
            .reporter
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(reporter);
    }

    fn close(&self) {
        info!(queued = self.queue.len(), "tele closing");
        self.stop.cancel();
        self.queue.close();
        self.transport.close();
    }
}

/// Telemetry disabled: everything is logged and dropped.
#[derive(Debug, Default)]
pub struct NoopTele;

impl Teler for NoopTele {
    fn state(&self, state: State) {
        debug!(?state, "tele disabled, state");
    }

    fn error(&self, err: &(dyn StdError + 'static)) {
        debug!(error = %err, "tele disabled, error");
    }

    fn stat_modify(&self, f: &mut dyn FnMut(&mut Stat)) {
        f(&mut Stat::default());
    }

    fn transaction(&self, transaction: Transaction) {
        debug!(code = %transaction.code, price = transaction.price, "tele disabled, transaction");
    }

    fn report(&self, _service: bool) -> Result<()> {
        Ok(())
    }

    fn command_reply_err(&self, command: &Command, err: Option<&str>) {
        debug!(id = command.id, ?err, "tele disabled, response");
    }

    fn close(&self) {}
}

async fn state_worker(
    transport: Arc<TransportDriver>,
    mut rx: watch::Receiver<State>,
    interval: Duration,
    stop: CancellationToken,
) {
    loop {
        let state = *rx.borrow_and_update();
        let delay = if state == State::Invalid || transport.send_state(state).await {
            interval
        } else {
            debug!(?state, "tele state not delivered, retry");
            STATE_RETRY
        };
        tokio::select! {
            _ = stop.cancelled() => break,
            changed = rx.changed() => if changed.is_err() { break },
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("tele state worker stopped");
}

async fn queue_worker(transport: Arc<TransportDriver>, queue: Arc<Queue>, stop: CancellationToken) {
    loop {
        let entry = tokio::select! {
            _ = stop.cancelled() => break,
            e = queue.peek() => match e {
                Ok(e) => e,
                Err(StorageError::Closed) => break,
                Err(e) => {
                    error!(error = %e, "tele queue peek failed");
                    if sleep_or_stop(QUEUE_RETRY, &stop).await {
                        break;
                    }
                    continue;
                }
            },
        };
        let id = entry.id;
        match send_entry(transport.as_ref(), &entry).await {
            Ok(true) => {
                if let Err(e) = queue.delete(id) {
                    error!(id, error = %e, "tele queue delete failed");
                }
            }
            Ok(false) => {
                debug!(id, "tele entry not delivered, moved to tail");
                if let Err(e) = queue.delete_push(id, &entry.data) {
                    error!(id, error = %e, "tele queue requeue failed");
                }
                if sleep_or_stop(QUEUE_RETRY, &stop).await {
                    break;
                }
            }
            Err(e) => {
                error!(id, error = %e, "tele queue entry invalid, dropped");
                let _ = queue.delete(id);
            }
        }
    }
    debug!("tele queue worker stopped");
}

async fn send_entry(transport: &TransportDriver, entry: &Entry) -> Result<bool> {
    let (&kind, body) = entry
        .data
        .split_first()
        .ok_or_else(|| TeleError::protocol("empty queue entry"))?;
    match kind {
        KIND_RESPONSE => {
            let q: QueuedResponse = serde_json::from_slice(body)?;
            Ok(transport.send_command_response(q.topic, q.response).await)
        }
        KIND_TELEMETRY => {
            let t: Telemetry = serde_json::from_slice(body)?;
            Ok(transport.send_telemetry(t).await)
        }
        other => Err(TeleError::protocol(format!("queue entry kind={other}"))),
    }
}

/// `true` when stopped during the sleep.
async fn sleep_or_stop(d: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(d) => false,
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
