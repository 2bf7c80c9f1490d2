use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use vender_network::tele::STATE_RETRY;
use vender_network::{
    CommandHandler, MockTransport, MockTransportHandle, Tele, TeleOptions, Teler, TransportDriver,
    unix_nanos,
};
use vender_protocol::tele::{Command, CommandTask, State};
use vender_storage::Queue;

fn start(dir: &TempDir) -> (Arc<Tele>, MockTransportHandle) {
    let (t, handle, commands) = MockTransport::new();
    let queue = Queue::open(dir.path().join("queue")).unwrap();
    let tele = Tele::start(
        TeleOptions {
            vm_id: 1,
            state_interval: Duration::from_secs(300),
            log_debug: false,
        },
        queue,
        TransportDriver::Mock(t),
        commands,
        CancellationToken::new(),
    );
    (tele, handle)
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl CommandHandler for Recorder {
    async fn handle(&self, command: &Command) -> Result<(), String> {
        self.seen
            .lock()
            .unwrap()
            .push(command.task.name().to_string());
        match &command.task {
            CommandTask::Exec { scenario, .. } if scenario == "bad" => {
                Err("action=bad not resolved".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_state_coalesced_latest_delivered() {
    let dir = TempDir::new().unwrap();
    let (tele, handle) = start(&dir);
    tele.state(State::Boot);
    tele.state(State::Nominal);
    tele.state(State::Lock);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(handle.states().is_empty());
    assert!(handle.attempts() >= 1);

    handle.set_online(true);
    tokio::time::sleep(STATE_RETRY + Duration::from_secs(1)).await;
    assert_eq!(handle.states(), vec![State::Lock]);

    tele.state(State::Service);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.states(), vec![State::Lock, State::Service]);
}

#[tokio::test(start_paused = true)]
async fn test_state_resent_every_interval() {
    let dir = TempDir::new().unwrap();
    let (tele, handle) = start(&dir);
    handle.set_online(true);
    tele.state(State::Nominal);
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(handle.states(), vec![State::Nominal, State::Nominal]);
}

#[tokio::test(start_paused = true)]
async fn test_commands_dispatched_with_responses() {
    let dir = TempDir::new().unwrap();
    let (tele, handle) = start(&dir);
    handle.set_online(true);
    let recorder = Arc::new(Recorder::default());
    assert!(tele.serve_commands(Arc::clone(&recorder)).is_some());
    assert!(tele.serve_commands(Arc::clone(&recorder)).is_none());

    let commands = [
        Command {
            id: 1,
            reply_topic: "cr".to_string(),
            task: CommandTask::Ping,
            ..Default::default()
        },
        Command {
            id: 2,
            reply_topic: "cr".to_string(),
            task: CommandTask::Exec {
                scenario: "bad".to_string(),
                lock: false,
            },
            ..Default::default()
        },
        Command {
            id: 3,
            reply_topic: "cr".to_string(),
            deadline: unix_nanos() - 1_000_000_000,
            task: CommandTask::Abort,
            ..Default::default()
        },
        Command {
            id: 4,
            reply_topic: "cr".to_string(),
            task: CommandTask::Report,
            ..Default::default()
        },
    ];
    for c in commands {
        handle.command(c).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut responses = handle.responses();
    responses.sort_by_key(|(_, r)| r.command_id);
    let errors: Vec<(u32, &str)> = responses
        .iter()
        .map(|(topic, r)| {
            assert_eq!(topic, "vm1/cr");
            (r.command_id, r.error.as_str())
        })
        .collect();
    assert_eq!(
        errors,
        vec![
            (1, ""),
            (2, "action=bad not resolved"),
            (3, "command deadline expired"),
            (4, ""),
        ]
    );
    assert_eq!(*recorder.seen.lock().unwrap(), vec!["exec".to_string()]);
    assert_eq!(handle.telemetry().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let (tele, _handle) = start(&dir);
        tele.report(false).unwrap();
        tele.close();
    }
    let (tele, handle) = start(&dir);
    handle.set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.telemetry().len(), 1);
    assert_eq!(tele.queued(), 0);
}
