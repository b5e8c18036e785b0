//! Block-programming bridge.
//!
//! Turns JSON requests from the Scratch extension into robot commands and the
//! dispatcher's results back into JSON responses. One request line in, one
//! response line out.

use crate::codec::{
    BaudRate, CleaningSchedule, Command, LedIndicators, LedState, MotorFlags, Note, PacketId,
    Radius, SensorPacket, SensorReadings, Song, Weekday, MAX_VELOCITY_MM_S,
    TURN_IN_PLACE_VELOCITY_MM_S,
};
use crate::connection::Connection;
use crate::dispatcher::{CommandOutcome, ConnectionStatus, DispatchError, DispatchStats, DispatcherHandle};
use crate::mode::{LinkState, RobotMode};
use crate::telemetry::{SnapshotEntry, Telemetry, TelemetryMetrics, TelemetrySnapshot};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const MAX_REQUEST_SIZE: usize = 512;
// Longest a single composite block may keep the wheels turning
pub const MAX_BLOCK_DURATION_MS: u64 = 60_000;

pub type RequestBuffer = ArrayString<MAX_REQUEST_SIZE>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub id: u32,
    pub action: BlockAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub day: Weekday,
    pub hour: u8,
    pub minute: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BlockAction {
    SetMode { mode: RobotMode },
    SetBaud { baud: BaudRate },
    Drive { velocity: i16, radius: i16 },
    DriveDirect { left: i16, right: i16 },
    DrivePwm { left: i16, right: i16 },
    Stop,
    SetMotors {
        main_brush: bool,
        side_brush: bool,
        vacuum: bool,
        #[serde(default)]
        side_brush_clockwise: bool,
        #[serde(default)]
        main_brush_outward: bool,
    },
    SetMotorSpeeds { main_brush: i8, side_brush: i8, vacuum: u8 },
    SetLeds {
        #[serde(default)]
        debris: bool,
        #[serde(default)]
        spot: bool,
        #[serde(default)]
        dock: bool,
        #[serde(default)]
        check_robot: bool,
        power_color: u8,
        power_intensity: u8,
    },
    DefineSong { number: u8, notes: Vec<u8>, durations: Vec<u8> },
    PlaySong { number: u8 },
    /// DefineSong followed by PlaySong.
    Sing { number: u8, notes: Vec<u8>, durations: Vec<u8> },
    /// Drive, wait, stop.
    DriveFor { velocity: i16, radius: i16, duration_ms: u64 },
    TurnInPlace {
        clockwise: bool,
        #[serde(default)]
        velocity: Option<i16>,
        duration_ms: u64,
    },
    Clean,
    Spot,
    MaxClean,
    SeekDock,
    PowerDown,
    SetSchedule { entries: Vec<ScheduleEntry> },
    SetClock { day: Weekday, hour: u8, minute: u8 },
    ReadSensor { packet: PacketId },
    Subscribe { packet: PacketId },
    Unsubscribe { packet: PacketId },
    Latest { packet: PacketId },
    Snapshot,
    Status,
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    NegativeAck,     // Rejected before anything was written
    ExecutionFailed, // Written, or attempted, and failed
    ConnectionLost,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidRequest,
    IllegalInMode,
    Malformed,
    Transport,
    TransportExhausted,
    ConnectionLost,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub link: LinkState,
    pub connection: ConnectionStatus,
    pub dispatch: DispatchStats,
    pub telemetry: TelemetryMetrics,
    pub polled: Vec<PacketId>,
}

#[derive(Debug, Clone, Serialize)]
pub enum BridgeResult {
    Sent {
        #[serde(with = "serde_bytes")]
        frame: Vec<u8>,
    },
    /// A composite block finished; `commands` frames went out.
    Completed { commands: usize },
    Sensor(SensorPacket),
    Latest(Option<SnapshotEntry>),
    Snapshot {
        snapshot: TelemetrySnapshot,
        merged: SensorReadings,
    },
    Polling { packets: Vec<PacketId> },
    Status(StatusReport),
    Reconnected,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeResponse {
    pub id: u32,
    pub timestamp: u64,
    pub status: ResponseStatus,
    pub result: Option<BridgeResult>,
    pub error: Option<ErrorReport>,
}

impl BridgeResponse {
    fn success(id: u32, result: BridgeResult) -> Self {
        Self {
            id,
            timestamp: timestamp_ms(),
            status: ResponseStatus::Success,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: u32, status: ResponseStatus, kind: ErrorKind, message: String) -> Self {
        Self {
            id,
            timestamp: timestamp_ms(),
            status,
            result: None,
            error: Some(ErrorReport { kind, message }),
        }
    }

    fn from_dispatch_error(id: u32, err: &DispatchError) -> Self {
        let (status, kind) = match err {
            DispatchError::State(_) => (ResponseStatus::NegativeAck, ErrorKind::IllegalInMode),
            DispatchError::Protocol(_) => (ResponseStatus::ExecutionFailed, ErrorKind::Malformed),
            DispatchError::Transport(_) => (ResponseStatus::ExecutionFailed, ErrorKind::Transport),
            DispatchError::TransportExhausted { .. } => {
                (ResponseStatus::ExecutionFailed, ErrorKind::TransportExhausted)
            }
            DispatchError::ConnectionLost => (ResponseStatus::ConnectionLost, ErrorKind::ConnectionLost),
            DispatchError::Cancelled => (ResponseStatus::Cancelled, ErrorKind::Cancelled),
        };
        Self::failure(id, status, kind, err.to_string())
    }

    fn invalid(id: u32, err: &BridgeError) -> Self {
        Self::failure(id, ResponseStatus::NegativeAck, ErrorKind::InvalidRequest, err.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// One unit of work of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Send(Command),
    Wait(Duration),
}

fn song_from(number: u8, notes: &[u8], durations: &[u8]) -> Result<Song, BridgeError> {
    if notes.len() != durations.len() {
        return Err(BridgeError::InvalidParameter("notes and durations differ in length"));
    }
    let notes: Vec<Note> = notes
        .iter()
        .zip(durations)
        .map(|(&pitch, &duration)| Note::new(pitch, duration))
        .collect();
    Song::new(number, &notes).map_err(|_| {
        if notes.is_empty() {
            BridgeError::InvalidParameter("at least one note must be provided")
        } else {
            BridgeError::InvalidParameter("a song holds at most 16 notes")
        }
    })
}

fn block_duration(duration_ms: u64) -> Result<Duration, BridgeError> {
    if duration_ms > MAX_BLOCK_DURATION_MS {
        return Err(BridgeError::InvalidParameter("duration exceeds 60 s"));
    }
    Ok(Duration::from_millis(duration_ms))
}

impl BlockAction {
    /// Robot commands this block turns into, in order. `None` for blocks served
    /// from host state alone.
    pub fn steps(&self) -> Result<Option<Vec<Step>>, BridgeError> {
        let single = |command: Command| -> Result<Option<Vec<Step>>, BridgeError> {
            Ok(Some(vec![Step::Send(command)]))
        };

        match self {
            BlockAction::SetMode { mode } => single(Command::SetMode(*mode)),
            BlockAction::SetBaud { baud } => single(Command::Baud(*baud)),
            BlockAction::Drive { velocity, radius } => single(Command::drive(*velocity, *radius)),
            BlockAction::DriveDirect { left, right } => single(Command::direct_drive(*left, *right)),
            BlockAction::DrivePwm { left, right } => single(Command::drive_pwm(*left, *right)),
            BlockAction::Stop => single(Command::Stop),
            BlockAction::SetMotors {
                main_brush,
                side_brush,
                vacuum,
                side_brush_clockwise,
                main_brush_outward,
            } => single(Command::Motors(MotorFlags {
                side_brush: *side_brush,
                vacuum: *vacuum,
                main_brush: *main_brush,
                side_brush_clockwise: *side_brush_clockwise,
                main_brush_outward: *main_brush_outward,
            })),
            BlockAction::SetMotorSpeeds { main_brush, side_brush, vacuum } => {
                single(Command::pwm_motors(*main_brush, *side_brush, *vacuum))
            }
            BlockAction::SetLeds {
                debris,
                spot,
                dock,
                check_robot,
                power_color,
                power_intensity,
            } => single(Command::Leds(LedState {
                indicators: LedIndicators {
                    debris: *debris,
                    spot: *spot,
                    dock: *dock,
                    check_robot: *check_robot,
                },
                power_color: *power_color,
                power_intensity: *power_intensity,
            })),
            BlockAction::DefineSong { number, notes, durations } => {
                single(Command::Song(song_from(*number, notes, durations)?))
            }
            BlockAction::PlaySong { number } => single(Command::play_song(*number)),
            BlockAction::Sing { number, notes, durations } => {
                let song = song_from(*number, notes, durations)?;
                let number = song.number();
                Ok(Some(vec![
                    Step::Send(Command::Song(song)),
                    Step::Send(Command::play_song(number)),
                ]))
            }
            BlockAction::DriveFor { velocity, radius, duration_ms } => Ok(Some(vec![
                Step::Send(Command::drive(*velocity, *radius)),
                Step::Wait(block_duration(*duration_ms)?),
                Step::Send(Command::Stop),
            ])),
            BlockAction::TurnInPlace { clockwise, velocity, duration_ms } => {
                let speed = velocity
                    .unwrap_or(TURN_IN_PLACE_VELOCITY_MM_S)
                    .clamp(-MAX_VELOCITY_MM_S, MAX_VELOCITY_MM_S);
                let radius = if *clockwise {
                    Radius::TurnClockwise
                } else {
                    Radius::TurnCounterClockwise
                };
                Ok(Some(vec![
                    Step::Send(Command::Drive { velocity: speed, radius }),
                    Step::Wait(block_duration(*duration_ms)?),
                    Step::Send(Command::Stop),
                ]))
            }
            BlockAction::Clean => single(Command::Clean),
            BlockAction::Spot => single(Command::Spot),
            BlockAction::MaxClean => single(Command::MaxClean),
            BlockAction::SeekDock => single(Command::SeekDock),
            BlockAction::PowerDown => single(Command::PowerDown),
            BlockAction::SetSchedule { entries } => {
                let mut schedule = CleaningSchedule::new();
                for entry in entries {
                    if entry.hour > 23 || entry.minute > 59 {
                        return Err(BridgeError::InvalidParameter("schedule time out of range"));
                    }
                    schedule.set(entry.day, entry.hour, entry.minute);
                }
                single(Command::Schedule(schedule))
            }
            BlockAction::SetClock { day, hour, minute } => {
                if *hour > 23 || *minute > 59 {
                    return Err(BridgeError::InvalidParameter("clock time out of range"));
                }
                single(Command::set_clock(*day, *hour, *minute))
            }
            BlockAction::ReadSensor { packet } => single(Command::RequestSensor(*packet)),
            BlockAction::Subscribe { .. }
            | BlockAction::Unsubscribe { .. }
            | BlockAction::Latest { .. }
            | BlockAction::Snapshot
            | BlockAction::Status
            | BlockAction::Reconnect => Ok(None),
        }
    }
}

// Packets one client asked to have polled. Released when the last adapter
// sharing it goes away.
struct ClientSubscriptions {
    telemetry: Telemetry,
    packets: Mutex<Vec<PacketId>>,
}

impl ClientSubscriptions {
    fn new(telemetry: Telemetry) -> Arc<Self> {
        Arc::new(Self { telemetry, packets: Mutex::new(Vec::new()) })
    }

    fn add(&self, packet: PacketId) {
        self.telemetry.watch(packet);
        self.packets.lock().unwrap_or_else(PoisonError::into_inner).push(packet);
    }

    fn remove(&self, packet: PacketId) -> bool {
        let mut packets = self.packets.lock().unwrap_or_else(PoisonError::into_inner);
        match packets.iter().position(|p| *p == packet) {
            Some(index) => {
                packets.swap_remove(index);
                self.telemetry.unwatch(packet)
            }
            None => false,
        }
    }
}

impl Drop for ClientSubscriptions {
    fn drop(&mut self) {
        let packets = self.packets.get_mut().unwrap_or_else(PoisonError::into_inner);
        for packet in packets.drain(..) {
            self.telemetry.unwatch(packet);
        }
    }
}

/// Serves bridge requests against one connection.
///
/// Clones share the same subscriptions; use [`BridgeAdapter::client`] to get an
/// adapter for a new client. Packets a client subscribed to stop being polled
/// once its last adapter is dropped.
#[derive(Clone)]
pub struct BridgeAdapter {
    dispatcher: DispatcherHandle,
    telemetry: Telemetry,
    subscriptions: Arc<ClientSubscriptions>,
}

impl BridgeAdapter {
    pub fn new(connection: &Connection) -> Self {
        Self::from_parts(connection.dispatcher().clone(), connection.telemetry().clone())
    }

    pub fn from_parts(dispatcher: DispatcherHandle, telemetry: Telemetry) -> Self {
        let subscriptions = ClientSubscriptions::new(telemetry.clone());
        Self { dispatcher, telemetry, subscriptions }
    }

    /// Adapter on the same connection with its own, empty, subscription list.
    pub fn client(&self) -> Self {
        Self::from_parts(self.dispatcher.clone(), self.telemetry.clone())
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn parse_request(line: &str) -> Result<BridgeRequest, BridgeError> {
        let mut buffer = RequestBuffer::new();
        buffer
            .try_push_str(line.trim())
            .map_err(|_| BridgeError::MessageTooLarge)?;

        serde_json::from_str::<BridgeRequest>(&buffer).map_err(|_| BridgeError::InvalidJson)
    }

    /// Handles one request line and returns the serialized response.
    pub async fn handle_line(&self, line: &str) -> String {
        let response = match Self::parse_request(line) {
            Ok(request) => self.handle(request).await,
            Err(err) => {
                debug!("Rejected request: {}", err);
                BridgeResponse::invalid(0, &err)
            }
        };

        serde_json::to_string(&response).unwrap_or_else(|err| {
            warn!("Failed to serialize response {}: {}", response.id, err);
            format!(
                r#"{{"id":{},"status":"ExecutionFailed","result":null,"error":{{"kind":"InvalidRequest","message":"serialization failed"}}}}"#,
                response.id
            )
        })
    }

    pub async fn handle(&self, request: BridgeRequest) -> BridgeResponse {
        let id = request.id;
        match request.action.steps() {
            Ok(Some(steps)) => self.run_steps(id, steps).await,
            Ok(None) => self.handle_local(id, &request.action).await,
            Err(err) => BridgeResponse::invalid(id, &err),
        }
    }

    // Each step is its own PendingCommand; the first failure ends the block.
    async fn run_steps(&self, id: u32, steps: Vec<Step>) -> BridgeResponse {
        let composite = steps.len() > 1;
        let mut sent = 0;
        let mut last = None;

        for step in steps {
            match step {
                Step::Wait(duration) => tokio::time::sleep(duration).await,
                Step::Send(command) => match self.dispatcher.execute(command).await {
                    Ok(outcome) => {
                        sent += 1;
                        last = Some(outcome);
                    }
                    Err(err) => return BridgeResponse::from_dispatch_error(id, &err),
                },
            }
        }

        let result = match last {
            _ if composite => BridgeResult::Completed { commands: sent },
            Some(CommandOutcome::Sensor(packet)) => BridgeResult::Sensor(packet),
            Some(CommandOutcome::Sent { frame }) => BridgeResult::Sent { frame },
            None => BridgeResult::Completed { commands: 0 },
        };
        BridgeResponse::success(id, result)
    }

    async fn handle_local(&self, id: u32, action: &BlockAction) -> BridgeResponse {
        let result = match action {
            BlockAction::Subscribe { packet } => {
                self.subscriptions.add(*packet);
                BridgeResult::Polling { packets: self.telemetry.polled_packets() }
            }
            BlockAction::Unsubscribe { packet } => {
                if !self.subscriptions.remove(*packet) {
                    return BridgeResponse::invalid(id, &BridgeError::NotSubscribed(*packet));
                }
                BridgeResult::Polling { packets: self.telemetry.polled_packets() }
            }
            BlockAction::Latest { packet } => BridgeResult::Latest(self.telemetry.latest(*packet)),
            BlockAction::Snapshot => {
                let snapshot = self.telemetry.snapshot();
                let merged = snapshot.merged();
                BridgeResult::Snapshot { snapshot, merged }
            }
            BlockAction::Status => BridgeResult::Status(StatusReport {
                link: self.dispatcher.link_state(),
                connection: self.dispatcher.status(),
                dispatch: self.dispatcher.stats(),
                telemetry: self.telemetry.metrics(),
                polled: self.telemetry.polled_packets(),
            }),
            BlockAction::Reconnect => match self.dispatcher.reconnect().await {
                Ok(()) => BridgeResult::Reconnected,
                Err(err) => return BridgeResponse::from_dispatch_error(id, &err),
            },
            _ => {
                return BridgeResponse::invalid(id, &BridgeError::InvalidParameter("not a host-side block"))
            }
        };
        BridgeResponse::success(id, result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    InvalidJson,
    MessageTooLarge,
    InvalidParameter(&'static str),
    NotSubscribed(PacketId),
}

impl core::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BridgeError::InvalidJson => write!(f, "Invalid JSON format"),
            BridgeError::MessageTooLarge => write!(f, "Message exceeds {MAX_REQUEST_SIZE} bytes"),
            BridgeError::InvalidParameter(what) => write!(f, "Invalid parameter: {what}"),
            BridgeError::NotSubscribed(packet) => write!(f, "Packet {packet} is not subscribed"),
        }
    }
}

impl std::error::Error for BridgeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sing_is_two_commands() {
        let action = BlockAction::Sing { number: 1, notes: vec![60, 64], durations: vec![32, 32] };
        let steps = action.steps().unwrap().unwrap();
        assert_eq!(steps.len(), 2);
        assert!(matches!(&steps[0], Step::Send(Command::Song(song)) if song.number() == 1));
        assert_eq!(steps[1], Step::Send(Command::PlaySong(1)));
    }

    #[test]
    fn test_song_validation() {
        let mismatched = BlockAction::DefineSong { number: 0, notes: vec![60], durations: vec![] };
        assert!(matches!(mismatched.steps(), Err(BridgeError::InvalidParameter(_))));

        let empty = BlockAction::DefineSong { number: 0, notes: vec![], durations: vec![] };
        assert!(empty.steps().is_err());

        let long = BlockAction::DefineSong { number: 0, notes: vec![60; 17], durations: vec![8; 17] };
        assert!(long.steps().is_err());
    }

    #[test]
    fn test_drive_for_ends_with_stop() {
        let action = BlockAction::DriveFor { velocity: 200, radius: 0, duration_ms: 500 };
        let steps = action.steps().unwrap().unwrap();
        assert_eq!(
            steps,
            vec![
                Step::Send(Command::Drive { velocity: 200, radius: Radius::Straight }),
                Step::Wait(Duration::from_millis(500)),
                Step::Send(Command::Stop),
            ]
        );
    }

    #[test]
    fn test_host_side_blocks_have_no_steps() {
        assert!(BlockAction::Status.steps().unwrap().is_none());
        assert!(BlockAction::Latest { packet: PacketId::VOLTAGE }.steps().unwrap().is_none());
    }

    #[test]
    fn test_parse_request() {
        let request = BridgeAdapter::parse_request(
            r#"{"id": 7, "action": {"DriveDirect": {"left": 200, "right": 200}}}"#,
        )
        .unwrap();
        assert_eq!(request.id, 7);
        assert!(matches!(request.action, BlockAction::DriveDirect { left: 200, right: 200 }));

        assert!(matches!(BridgeAdapter::parse_request("{nope"), Err(BridgeError::InvalidJson)));
        let huge = format!(r#"{{"id":1,"action":"Stop","pad":"{}"}}"#, "x".repeat(600));
        assert!(matches!(BridgeAdapter::parse_request(&huge), Err(BridgeError::MessageTooLarge)));
    }
}
