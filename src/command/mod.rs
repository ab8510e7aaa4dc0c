//! Command IPC
//!
//! Commands arrive through a filesystem queue (small JSON files dropped
//! into `pending/`, renamed into `in-flight/` before parsing, deleted on
//! completion) and through an in-process channel from the chat
//! transport. Responses are written per command id for the CLI to poll.
//! Orphaned in-flight files older than five minutes are returned to the
//! queue at boot.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// How long an in-flight file may sit before boot recovery requeues it
pub const ORPHAN_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Recognized command verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVerb {
    Status,
    Portfolio,
    Defcon,
    Hold,
    Resume,
    Yes,
    No,
    Refresh,
    Shutdown,
    Estop,
    Mode,
    Interval,
}

impl CommandVerb {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim_start_matches('/').to_lowercase().as_str() {
            "status" => Some(CommandVerb::Status),
            "portfolio" => Some(CommandVerb::Portfolio),
            "defcon" => Some(CommandVerb::Defcon),
            "hold" => Some(CommandVerb::Hold),
            "resume" => Some(CommandVerb::Resume),
            "yes" => Some(CommandVerb::Yes),
            "no" => Some(CommandVerb::No),
            "refresh" => Some(CommandVerb::Refresh),
            "shutdown" => Some(CommandVerb::Shutdown),
            "estop" => Some(CommandVerb::Estop),
            "mode" => Some(CommandVerb::Mode),
            "interval" => Some(CommandVerb::Interval),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandVerb::Status => "status",
            CommandVerb::Portfolio => "portfolio",
            CommandVerb::Defcon => "defcon",
            CommandVerb::Hold => "hold",
            CommandVerb::Resume => "resume",
            CommandVerb::Yes => "yes",
            CommandVerb::No => "no",
            CommandVerb::Refresh => "refresh",
            CommandVerb::Shutdown => "shutdown",
            CommandVerb::Estop => "estop",
            CommandVerb::Mode => "mode",
            CommandVerb::Interval => "interval",
        }
    }
}

/// Wire format of a dropped command file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    /// Raw verb string; unknown verbs are answered with exit code 3
    pub verb: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl Command {
    pub fn verb(&self) -> Option<CommandVerb> {
        CommandVerb::parse(&self.verb)
    }
}

/// Response written back for the CLI; `code` mirrors the process exit
/// code contract (0 accepted, 2 invalid state, 3 unknown verb)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub ok: bool,
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandResponse {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            code: 0,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            ok: true,
            code: 0,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            code: 2,
            message: message.into(),
            data: None,
        }
    }

    pub fn unknown_verb(verb: &str) -> Self {
        Self {
            ok: false,
            code: 3,
            message: format!("unknown verb: {}", verb),
            data: None,
        }
    }
}

/// Where a consumed command came from; file-backed commands are deleted
/// on completion
#[derive(Debug)]
pub enum Delivery {
    File(PathBuf),
    Channel,
}

#[derive(Debug)]
pub struct ConsumedCommand {
    pub command: Command,
    pub delivery: Delivery,
}

impl ConsumedCommand {
    /// Delete the in-flight file once processing succeeded
    pub fn complete(self) {
        if let Delivery::File(path) = self.delivery {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "in-flight cleanup failed");
            }
        }
    }
}

/// Filesystem command queue with crash recovery
pub struct CommandQueue {
    pending: PathBuf,
    in_flight: PathBuf,
    failed: PathBuf,
    responses: PathBuf,
}

impl CommandQueue {
    pub fn new(base: &Path) -> Result<Self> {
        let queue = Self {
            pending: base.join("pending"),
            in_flight: base.join("in-flight"),
            failed: base.join("failed"),
            responses: base.join("responses"),
        };
        for dir in [&queue.pending, &queue.in_flight, &queue.failed, &queue.responses] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating command dir {}", dir.display()))?;
        }
        Ok(queue)
    }

    /// Return in-flight files older than `max_age` to the pending queue
    /// (crash recovery at boot)
    pub fn recover_orphans(&self, max_age: Duration) -> Result<usize> {
        let mut recovered = 0;
        for entry in fs::read_dir(&self.in_flight)? {
            let entry = entry?;
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok());
            let old_enough = age.map(|a| a >= max_age).unwrap_or(true);
            if old_enough {
                let target = self.pending.join(entry.file_name());
                if fs::rename(entry.path(), &target).is_ok() {
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "orphaned in-flight commands requeued");
        }
        Ok(recovered)
    }

    /// Consume every pending command file: rename into `in-flight/`
    /// before parsing so readers never observe partial files. Parse
    /// failures are quarantined in `failed/`.
    pub fn poll(&self) -> Vec<ConsumedCommand> {
        let entries = match fs::read_dir(&self.pending) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "pending dir unreadable");
                return Vec::new();
            }
        };

        let mut names: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        names.sort();

        let mut consumed = Vec::new();
        for path in names {
            let Some(file_name) = path.file_name() else {
                continue;
            };
            let in_flight = self.in_flight.join(file_name);
            if fs::rename(&path, &in_flight).is_err() {
                // Another consumer (or a crash mid-rename) won the race
                continue;
            }

            match fs::read_to_string(&in_flight)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str::<Command>(&raw).map_err(|e| e.to_string()))
            {
                Ok(command) => consumed.push(ConsumedCommand {
                    command,
                    delivery: Delivery::File(in_flight),
                }),
                Err(err) => {
                    warn!(file = %in_flight.display(), error = %err, "command parse failed");
                    let failed = self.failed.join(file_name);
                    let _ = fs::rename(&in_flight, &failed);
                    let note = failed.with_extension("error");
                    let _ = fs::write(note, &err);
                }
            }
        }
        consumed
    }

    /// Write the response for a command id (atomic tmp + rename)
    pub fn respond(&self, command_id: &str, response: &CommandResponse) {
        let target = self.responses.join(format!("{}.json", command_id));
        let payload = match serde_json::to_vec_pretty(response) {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "response serialization failed");
                return;
            }
        };
        if let Err(err) = write_atomic(&target, &payload) {
            warn!(path = %target.display(), error = %err, "response write failed");
        }
    }

    // ── Client side (used by the CLI sender) ────────────────────

    /// Drop a command into the queue: create in tmp, rename into
    /// `pending/` so the consumer never sees a partial file.
    pub fn drop_command(&self, command: &Command) -> Result<()> {
        let target = self.pending.join(format!("{}.json", command.id));
        let payload = serde_json::to_vec_pretty(command)?;
        write_atomic(&target, &payload)
    }

    /// Poll for the response to a command id
    pub fn take_response(&self, command_id: &str) -> Option<CommandResponse> {
        let path = self.responses.join(format!("{}.json", command_id));
        let raw = fs::read_to_string(&path).ok()?;
        let response = serde_json::from_str(&raw).ok()?;
        let _ = fs::remove_file(&path);
        Some(response)
    }
}

fn write_atomic(target: &Path, payload: &[u8]) -> Result<()> {
    let tmp = target.with_extension("tmp");
    fs::write(&tmp, payload)?;
    fs::rename(&tmp, target)?;
    Ok(())
}

/// Command feed for the orchestrator. The filesystem queue is pumped by
/// a separate lightweight task into a bounded channel; the chat
/// transport submits into the same channel. The main task only drains.
///
/// An estop verb additionally raises a watch signal at intake, before
/// the main task gets around to draining the channel. The orchestrator
/// races its in-cycle I/O against that signal, which is what lets an
/// emergency stop cancel HTTP that is already in flight.
pub struct CommandBus {
    queue: std::sync::Arc<CommandQueue>,
    rx: tokio::sync::Mutex<mpsc::Receiver<ConsumedCommand>>,
    tx: mpsc::Sender<ConsumedCommand>,
    estop_tx: watch::Sender<bool>,
    estop_rx: watch::Receiver<bool>,
}

impl CommandBus {
    pub fn new(queue: CommandQueue) -> std::sync::Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        let (estop_tx, estop_rx) = watch::channel(false);
        std::sync::Arc::new(Self {
            queue: std::sync::Arc::new(queue),
            rx: tokio::sync::Mutex::new(rx),
            tx,
            estop_tx,
            estop_rx,
        })
    }

    /// Spawn the file-queue poller task
    pub fn start_file_poller(
        self: std::sync::Arc<Self>,
        tick: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let bus = self;
        tokio::spawn(async move {
            loop {
                bus.pump_files().await;
                tokio::time::sleep(tick).await;
            }
        })
    }

    /// One pump pass: consume pending files into the channel
    pub async fn pump_files(&self) {
        for consumed in self.queue.poll() {
            self.flag_estop(&consumed.command);
            if self.tx.send(consumed).await.is_err() {
                return;
            }
        }
    }

    /// Submit a command from the chat transport
    pub async fn submit(&self, command: Command) {
        self.flag_estop(&command);
        let _ = self
            .tx
            .send(ConsumedCommand {
                command,
                delivery: Delivery::Channel,
            })
            .await;
    }

    fn flag_estop(&self, command: &Command) {
        if command.verb() == Some(CommandVerb::Estop) {
            warn!("estop observed at intake, raising cancellation signal");
            let _ = self.estop_tx.send(true);
        }
    }

    /// Receiver for the emergency-stop signal. The signal stays raised
    /// until the orchestrator clears it after applying the command.
    pub fn estop_signal(&self) -> watch::Receiver<bool> {
        self.estop_rx.clone()
    }

    /// Lower the signal once the estop command has been applied
    pub fn clear_estop(&self) {
        let _ = self.estop_tx.send(false);
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Drain whatever has arrived without blocking
    pub async fn drain(&self) -> Vec<ConsumedCommand> {
        let mut commands = Vec::new();
        let mut rx = self.rx.lock().await;
        while let Ok(command) = rx.try_recv() {
            commands.push(command);
        }
        commands
    }

    pub fn respond(&self, command_id: &str, response: &CommandResponse) {
        self.queue.respond(command_id, response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_command(id: &str, verb: &str) -> Command {
        Command {
            id: id.to_string(),
            verb: verb.to_string(),
            args: Vec::new(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_drop_poll_complete_lifecycle() {
        let dir = tempdir().unwrap();
        let queue = CommandQueue::new(dir.path()).unwrap();

        queue.drop_command(&make_command("c1", "status")).unwrap();
        queue.drop_command(&make_command("c2", "hold")).unwrap();

        let consumed = queue.poll();
        assert_eq!(consumed.len(), 2);
        // Pending is drained; files now live in in-flight
        assert!(queue.poll().is_empty());
        assert_eq!(fs::read_dir(dir.path().join("in-flight")).unwrap().count(), 2);

        for cmd in consumed {
            cmd.complete();
        }
        assert_eq!(fs::read_dir(dir.path().join("in-flight")).unwrap().count(), 0);
    }

    #[test]
    fn test_parse_failure_quarantined() {
        let dir = tempdir().unwrap();
        let queue = CommandQueue::new(dir.path()).unwrap();

        fs::write(dir.path().join("pending/bad.json"), "{not json").unwrap();
        queue.drop_command(&make_command("good", "status")).unwrap();

        let consumed = queue.poll();
        assert_eq!(consumed.len(), 1);
        assert_eq!(consumed[0].command.id, "good");

        let failed: Vec<_> = fs::read_dir(dir.path().join("failed"))
            .unwrap()
            .filter_map(std::result::Result::ok)
            .map(|e| e.file_name().into_string().unwrap())
            .collect();
        assert!(failed.contains(&"bad.json".to_string()));
        assert!(failed.contains(&"bad.error".to_string()));
    }

    #[test]
    fn test_orphan_recovery_requeues_in_flight() {
        let dir = tempdir().unwrap();
        let queue = CommandQueue::new(dir.path()).unwrap();

        queue.drop_command(&make_command("c1", "refresh")).unwrap();
        let consumed = queue.poll();
        assert_eq!(consumed.len(), 1);
        drop(consumed); // crash: in-flight file never completed

        // Nothing young enough to reclaim under the real threshold
        assert_eq!(queue.recover_orphans(ORPHAN_MAX_AGE).unwrap(), 0);
        // Boot recovery with a zero threshold requeues it
        assert_eq!(queue.recover_orphans(Duration::ZERO).unwrap(), 1);

        let consumed = queue.poll();
        assert_eq!(consumed.len(), 1);
        assert_eq!(consumed[0].command.id, "c1");
    }

    #[test]
    fn test_response_round_trip() {
        let dir = tempdir().unwrap();
        let queue = CommandQueue::new(dir.path()).unwrap();

        assert!(queue.take_response("c9").is_none());
        queue.respond("c9", &CommandResponse::invalid_state("no pending decision"));

        let response = queue.take_response("c9").unwrap();
        assert!(!response.ok);
        assert_eq!(response.code, 2);
        // Response is consumed on read
        assert!(queue.take_response("c9").is_none());
    }

    #[test]
    fn test_verb_parsing() {
        assert_eq!(CommandVerb::parse("status"), Some(CommandVerb::Status));
        assert_eq!(CommandVerb::parse("/estop"), Some(CommandVerb::Estop));
        assert_eq!(CommandVerb::parse("INTERVAL"), Some(CommandVerb::Interval));
        assert_eq!(CommandVerb::parse("dance"), None);
    }

    #[tokio::test]
    async fn test_estop_raises_signal_at_intake() {
        let dir = tempdir().unwrap();
        let bus = CommandBus::new(CommandQueue::new(dir.path()).unwrap());

        let mut signal = bus.estop_signal();
        assert!(!*signal.borrow());

        // File-dropped estop raises the signal during the pump, before
        // anything drains the channel
        bus.queue().drop_command(&make_command("e1", "estop")).unwrap();
        bus.pump_files().await;
        assert!(*signal.borrow());
        signal.changed().await.unwrap();

        bus.clear_estop();
        assert!(!*bus.estop_signal().borrow());

        // Channel-submitted estop raises it too; other verbs do not
        bus.submit(make_command("e2", "estop")).await;
        assert!(*bus.estop_signal().borrow());
        bus.clear_estop();
        bus.submit(make_command("h1", "hold")).await;
        assert!(!*bus.estop_signal().borrow());
    }

    #[tokio::test]
    async fn test_bus_merges_channel_and_files() {
        let dir = tempdir().unwrap();
        let bus = CommandBus::new(CommandQueue::new(dir.path()).unwrap());

        bus.queue().drop_command(&make_command("f1", "status")).unwrap();
        bus.submit(make_command("ch1", "hold")).await;
        bus.pump_files().await;

        let commands = bus.drain().await;
        let ids: Vec<&str> = commands.iter().map(|c| c.command.id.as_str()).collect();
        assert!(ids.contains(&"f1"));
        assert!(ids.contains(&"ch1"));
        assert!(bus.drain().await.is_empty());
    }
}
