//! Serialized command dispatch.
//!
//! All traffic to the robot goes through one task that owns the transport. Callers
//! hand it commands through an unbounded queue and get a [`CommandHandle`] back
//! immediately; the task validates each command against the tracked mode, keeps
//! the minimum spacing between writes, retries transient faults and completes the
//! handle with the result.

use crate::codec::{self, Command, ProtocolError, SensorPacket};
use crate::mode::{self, LinkState, ModeTracker, StateError};
use crate::transport::{Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// Minimum gap after any write; the OI drops bytes that arrive faster than this
pub const DEFAULT_COMMAND_SPACING_MS: u64 = 20;
// After Start/Safe/Full/Clean/... the robot needs longer before it listens again
pub const DEFAULT_MODE_SETTLE_MS: u64 = 50;
pub const DEFAULT_BAUD_SETTLE_MS: u64 = 100;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 25;

const STATE_QUEUED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_CANCELLED: u8 = 2;

/// Timing and retry knobs of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub command_spacing: Duration,
    pub mode_settle: Duration,
    pub baud_settle: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            command_spacing: Duration::from_millis(DEFAULT_COMMAND_SPACING_MS),
            mode_settle: Duration::from_millis(DEFAULT_MODE_SETTLE_MS),
            baud_settle: Duration::from_millis(DEFAULT_BAUD_SETTLE_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
        }
    }
}

impl DispatchSettings {
    /// Quiet time required after `command` before the next write.
    pub fn settle_after(&self, command: &Command) -> Duration {
        match command {
            Command::Baud(_) => self.baud_settle,
            c if mode::mode_after(c).is_some() => self.mode_settle,
            _ => self.command_spacing,
        }
    }

    /// Delay before retry number `attempt` (0-based): base, 2x base, 4x base...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << attempt.min(16))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CommandOutcome {
    /// The frame went out. No response is expected.
    Sent {
        #[serde(with = "serde_bytes")]
        frame: Vec<u8>,
    },
    Sensor(SensorPacket),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Active,
    /// A fatal fault closed the transport; only `reconnect` brings it back.
    Invalidated { reason: String },
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub commands_sent: u64,
    pub commands_rejected: u64,
    pub commands_failed: u64,
    pub commands_cancelled: u64,
    pub retries: u64,
    pub bytes_written: u64,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

type Completion = oneshot::Sender<Result<CommandOutcome, DispatchError>>;

pub struct PendingCommand {
    seq: u64,
    command: Command,
    state: Arc<AtomicU8>,
    completion: Completion,
}

impl PendingCommand {
    /// Queued -> Started. Fails if the caller cancelled first.
    fn try_start(&self) -> bool {
        self.state
            .compare_exchange(STATE_QUEUED, STATE_STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn complete(self, result: Result<CommandOutcome, DispatchError>) {
        // The caller may have dropped its handle; nothing to report then
        let _ = self.completion.send(result);
    }
}

/// Caller side of a submitted command.
#[derive(Debug)]
pub struct CommandHandle {
    seq: u64,
    state: Arc<AtomicU8>,
    completion: oneshot::Receiver<Result<CommandOutcome, DispatchError>>,
}

impl CommandHandle {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Withdraws the command if dispatch has not started. Returns false when it is
    /// too late; the command then runs to completion.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(STATE_QUEUED, STATE_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_STARTED
    }

    pub async fn wait(self) -> Result<CommandOutcome, DispatchError> {
        match self.completion.await {
            Ok(result) => result,
            // Dispatcher went away without answering
            Err(_) => Err(DispatchError::ConnectionLost),
        }
    }
}

enum Request {
    Command(PendingCommand),
    Reconnect(oneshot::Sender<Result<(), DispatchError>>),
    Shutdown,
}

/// Cloneable front end of the dispatcher task.
#[derive(Clone)]
pub struct DispatcherHandle {
    queue: mpsc::UnboundedSender<Request>,
    // Held while enqueuing so sequence numbers follow queue order
    next_seq: Arc<Mutex<u64>>,
    link: watch::Receiver<LinkState>,
    status: watch::Receiver<ConnectionStatus>,
    stats: watch::Receiver<DispatchStats>,
}

impl DispatcherHandle {
    /// Enqueues `command` without waiting.
    pub fn submit(&self, command: Command) -> CommandHandle {
        let state = Arc::new(AtomicU8::new(STATE_QUEUED));
        let (completion, receiver) = oneshot::channel();

        let (seq, sent) = {
            let mut next_seq = self.next_seq.lock().unwrap_or_else(PoisonError::into_inner);
            let seq = *next_seq;
            *next_seq += 1;
            let pending = PendingCommand {
                seq,
                command,
                state: Arc::clone(&state),
                completion,
            };
            (seq, self.queue.send(Request::Command(pending)))
        };
        if let Err(mpsc::error::SendError(Request::Command(pending))) = sent {
            pending.complete(Err(DispatchError::ConnectionLost));
        }

        CommandHandle {
            seq,
            state,
            completion: receiver,
        }
    }

    pub async fn execute(&self, command: Command) -> Result<CommandOutcome, DispatchError> {
        self.submit(command).wait().await
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    pub fn watch_link(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.borrow().clone()
    }

    /// Reopens the transport. Queued ahead of anything submitted after it.
    pub async fn reconnect(&self) -> Result<(), DispatchError> {
        let (reply, receiver) = oneshot::channel();
        self.queue
            .send(Request::Reconnect(reply))
            .map_err(|_| DispatchError::ConnectionLost)?;
        receiver.await.unwrap_or(Err(DispatchError::ConnectionLost))
    }

    pub fn shutdown(&self) {
        let _ = self.queue.send(Request::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

enum ExchangeError {
    Transport(TransportError),
    Protocol(ProtocolError),
}

impl From<TransportError> for ExchangeError {
    fn from(err: TransportError) -> Self {
        ExchangeError::Transport(err)
    }
}

impl From<ProtocolError> for ExchangeError {
    fn from(err: ProtocolError) -> Self {
        ExchangeError::Protocol(err)
    }
}

pub struct Dispatcher<T: Transport> {
    transport: Option<T>,
    transport_config: T::Config,
    settings: DispatchSettings,
    modes: ModeTracker,
    queue: mpsc::UnboundedReceiver<Request>,
    status: watch::Sender<ConnectionStatus>,
    stats: watch::Sender<DispatchStats>,
    next_write_at: Option<Instant>,
}

impl<T: Transport> Dispatcher<T> {
    /// Wraps an already opened transport. `transport_config` is kept for reconnects.
    pub fn new(
        transport: T,
        transport_config: T::Config,
        settings: DispatchSettings,
    ) -> (Self, DispatcherHandle) {
        let (sender, queue) = mpsc::unbounded_channel();
        let (modes, link) = ModeTracker::new();
        let (status, status_rx) = watch::channel(ConnectionStatus::Active);
        let (stats, stats_rx) = watch::channel(DispatchStats::default());

        let dispatcher = Self {
            transport: Some(transport),
            transport_config,
            settings,
            modes,
            queue,
            status,
            stats,
            next_write_at: None,
        };
        let handle = DispatcherHandle {
            queue: sender,
            next_seq: Arc::new(Mutex::new(1)),
            link,
            status: status_rx,
            stats: stats_rx,
        };
        (dispatcher, handle)
    }

    pub async fn run(mut self) {
        info!(
            "Dispatcher running on {}",
            self.transport.as_ref().map_or_else(|| "nothing".to_string(), T::describe)
        );

        while let Some(request) = self.queue.recv().await {
            match request {
                Request::Command(pending) => self.handle(pending).await,
                Request::Reconnect(reply) => {
                    let result = self.reconnect().await;
                    let _ = reply.send(result);
                }
                Request::Shutdown => break,
            }
        }

        self.queue.close();
        while let Ok(request) = self.queue.try_recv() {
            match request {
                Request::Command(pending) => pending.complete(Err(DispatchError::ConnectionLost)),
                Request::Reconnect(reply) => {
                    let _ = reply.send(Err(DispatchError::ConnectionLost));
                }
                Request::Shutdown => {}
            }
        }

        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.modes.rollback();
        self.status.send_replace(ConnectionStatus::Closed);
        info!("Dispatcher stopped");
    }

    async fn handle(&mut self, pending: PendingCommand) {
        if !pending.try_start() {
            debug!("Command #{} ({}) cancelled before dispatch", pending.seq, pending.command.name());
            self.stats.send_modify(|s| s.commands_cancelled += 1);
            pending.complete(Err(DispatchError::Cancelled));
            return;
        }

        let result = self.execute(&pending.command).await;
        match &result {
            Ok(_) => debug!("Command #{} ({}) done", pending.seq, pending.command.name()),
            Err(DispatchError::State(err)) => {
                debug!("Command #{} rejected: {}", pending.seq, err);
                self.stats.send_modify(|s| s.commands_rejected += 1);
            }
            Err(err) => {
                warn!("Command #{} ({}) failed: {}", pending.seq, pending.command.name(), err);
                let message = err.to_string();
                self.stats.send_modify(|s| {
                    s.commands_failed += 1;
                    s.last_error = Some(message);
                });
            }
        }
        pending.complete(result);
    }

    async fn execute(&mut self, command: &Command) -> Result<CommandOutcome, DispatchError> {
        if self.transport.is_none() {
            return Err(DispatchError::ConnectionLost);
        }
        self.modes.validate(command)?;

        if let Some(prefix) = mode::transition_prefix(command, self.modes.current()) {
            debug!("Sending Start ahead of {}", command.name());
            self.transmit(&prefix).await?;
            self.modes.apply(&prefix);
        }

        let outcome = self.transmit(command).await?;
        self.modes.apply(command);

        match (&outcome, command) {
            (CommandOutcome::Sensor(packet), _) => {
                if let Some(reported) = packet.readings.oi_mode {
                    self.modes.reconcile(reported);
                }
            }
            (CommandOutcome::Sent { .. }, Command::Baud(rate)) => {
                let switched = match self.transport.as_mut() {
                    Some(transport) => transport.set_baud_rate(rate.bits_per_second()).await,
                    None => Ok(()),
                };
                if let Err(err) = switched {
                    return Err(self.fail(err));
                }
            }
            _ => {}
        }

        Ok(outcome)
    }

    /// Writes one command, retrying transient faults with exponential backoff.
    ///
    /// The assumed mode is only rolled back when a fault ends the dispatch. A fault
    /// that a retry recovers from leaves it untouched.
    async fn transmit(&mut self, command: &Command) -> Result<CommandOutcome, DispatchError> {
        let frame = command.encode();
        let mut attempt: u32 = 0;

        loop {
            if let Some(at) = self.next_write_at {
                tokio::time::sleep_until(at).await;
            }

            let result = self.exchange(command, &frame).await;
            self.next_write_at = Some(Instant::now() + self.settings.settle_after(command));

            match result {
                Ok(outcome) => {
                    let written = frame.len() as u64;
                    self.stats.send_modify(|s| {
                        s.commands_sent += 1;
                        s.bytes_written += written;
                    });
                    return Ok(outcome);
                }
                Err(ExchangeError::Protocol(err)) => {
                    // Resync before the next read; a retry could misread just as well
                    self.discard_input().await;
                    return Err(DispatchError::Protocol(err));
                }
                Err(ExchangeError::Transport(err)) if !err.is_retryable() => {
                    return Err(self.fail(err));
                }
                Err(ExchangeError::Transport(err)) if attempt < self.settings.max_retries => {
                    let delay = self.settings.backoff(attempt);
                    attempt += 1;
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        command.name(),
                        err,
                        attempt,
                        self.settings.max_retries,
                        delay
                    );
                    self.stats.send_modify(|s| s.retries += 1);
                    tokio::time::sleep(delay).await;
                    self.discard_input().await;
                }
                Err(ExchangeError::Transport(last)) => {
                    let attempts = attempt + 1;
                    error!("{} failed after {} attempts: {}", command.name(), attempts, last);
                    self.invalidate(format!("retries exhausted: {last}"));
                    return Err(DispatchError::TransportExhausted { attempts, last });
                }
            }
        }
    }

    async fn exchange(&mut self, command: &Command, frame: &[u8]) -> Result<CommandOutcome, ExchangeError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(ExchangeError::Transport(TransportError::IoFault))?;

        transport.write(frame, self.settings.write_timeout).await?;

        match command {
            Command::RequestSensor(packet) => {
                let bytes = transport
                    .read(packet.response_len(), self.settings.read_timeout)
                    .await?;
                Ok(CommandOutcome::Sensor(codec::decode(&bytes, *packet)?))
            }
            _ => Ok(CommandOutcome::Sent { frame: frame.to_vec() }),
        }
    }

    async fn discard_input(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            if let Err(err) = transport.discard_input().await {
                debug!("Discarding input failed: {}", err);
            }
        }
    }

    fn fail(&mut self, err: TransportError) -> DispatchError {
        error!("Fatal transport fault: {}", err);
        self.invalidate(format!("transport fault: {err}"));
        DispatchError::Transport(err)
    }

    // Anything still queued fails with ConnectionLost when it reaches the front,
    // since the transport is gone.
    fn invalidate(&mut self, reason: String) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.modes.rollback();
        self.next_write_at = None;
        self.status.send_replace(ConnectionStatus::Invalidated { reason });
    }

    async fn reconnect(&mut self) -> Result<(), DispatchError> {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.modes.rollback();
        self.next_write_at = None;

        match T::open(&self.transport_config).await {
            Ok(transport) => {
                info!("Reconnected to {}", transport.describe());
                self.transport = Some(transport);
                self.status.send_replace(ConnectionStatus::Active);
                self.stats.send_modify(|s| s.reconnects += 1);
                Ok(())
            }
            Err(err) => {
                warn!("Reconnect failed: {}", err);
                self.status.send_replace(ConnectionStatus::Invalidated {
                    reason: format!("reconnect failed: {err}"),
                });
                Err(DispatchError::Transport(err))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport fault: {0}")]
    Transport(TransportError),
    #[error("gave up after {attempts} attempts, last fault: {last}")]
    TransportExhausted { attempts: u32, last: TransportError },
    #[error("connection lost")]
    ConnectionLost,
    #[error("cancelled before dispatch")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BaudRate, PacketId};
    use crate::mode::RobotMode;

    #[test]
    fn test_settle_times() {
        let settings = DispatchSettings::default();
        assert_eq!(settings.settle_after(&Command::Stop), Duration::from_millis(20));
        assert_eq!(
            settings.settle_after(&Command::SetMode(RobotMode::Safe)),
            Duration::from_millis(50)
        );
        assert_eq!(settings.settle_after(&Command::Clean), Duration::from_millis(50));
        assert_eq!(
            settings.settle_after(&Command::Baud(BaudRate::Baud57600)),
            Duration::from_millis(100)
        );
        assert_eq!(
            settings.settle_after(&Command::RequestSensor(PacketId::VOLTAGE)),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let settings = DispatchSettings::default();
        assert_eq!(settings.backoff(0), Duration::from_millis(25));
        assert_eq!(settings.backoff(1), Duration::from_millis(50));
        assert_eq!(settings.backoff(2), Duration::from_millis(100));
    }

    #[test]
    fn test_cancel_only_before_start() {
        let (completion, receiver) = oneshot::channel();
        let state = Arc::new(AtomicU8::new(STATE_QUEUED));
        let pending = PendingCommand {
            seq: 1,
            command: Command::Stop,
            state: Arc::clone(&state),
            completion,
        };
        let handle = CommandHandle { seq: 1, state, completion: receiver };

        assert!(pending.try_start());
        assert!(handle.is_started());
        assert!(!handle.cancel());
    }
}
