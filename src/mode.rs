//! Robot OI mode tracking and the command legality table.

use crate::codec::Command;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Operating mode reported by the robot in sensor packet 35.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RobotMode {
    Off,
    Passive,
    Safe,
    Full,
}

impl RobotMode {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(RobotMode::Off),
            1 => Some(RobotMode::Passive),
            2 => Some(RobotMode::Safe),
            3 => Some(RobotMode::Full),
            _ => None,
        }
    }

    pub fn wire_value(self) -> u8 {
        match self {
            RobotMode::Off => 0,
            RobotMode::Passive => 1,
            RobotMode::Safe => 2,
            RobotMode::Full => 3,
        }
    }
}

impl core::fmt::Display for RobotMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RobotMode::Off => write!(f, "Off"),
            RobotMode::Passive => write!(f, "Passive"),
            RobotMode::Safe => write!(f, "Safe"),
            RobotMode::Full => write!(f, "Full"),
        }
    }
}

/// What the host believes about the link. `Disconnected` is never a robot mode,
/// it means the host has no trustworthy knowledge of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Mode(RobotMode),
}

impl LinkState {
    pub fn mode(self) -> Option<RobotMode> {
        match self {
            LinkState::Disconnected => None,
            LinkState::Mode(mode) => Some(mode),
        }
    }
}

impl core::fmt::Display for LinkState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Mode(mode) => write!(f, "{mode}"),
        }
    }
}

const CONFIG_MODES: &[RobotMode] = &[RobotMode::Passive, RobotMode::Safe, RobotMode::Full];
const ACTUATION_MODES: &[RobotMode] = &[RobotMode::Safe, RobotMode::Full];

/// Modes in which a command may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Legality {
    /// Legal in every mode, including before the link is established.
    Always,
    Modes(&'static [RobotMode]),
}

pub fn legality(command: &Command) -> Legality {
    match command {
        // Start is how the link is established, so it is always accepted
        Command::SetMode(RobotMode::Passive) => Legality::Always,
        // Stop OI has to get through whatever the host believes
        Command::SetMode(RobotMode::Off) => Legality::Always,
        Command::SetMode(_)
        | Command::Baud(_)
        | Command::PowerDown
        | Command::Spot
        | Command::Clean
        | Command::MaxClean
        | Command::SeekDock
        | Command::Song(_)
        | Command::RequestSensor(_)
        | Command::Schedule(_)
        | Command::SetClock { .. } => Legality::Modes(CONFIG_MODES),
        Command::Drive { .. }
        | Command::DirectDrive { .. }
        | Command::DrivePwm { .. }
        | Command::Stop
        | Command::Motors(_)
        | Command::PwmMotors { .. }
        | Command::Leds(_)
        | Command::PlaySong(_) => Legality::Modes(ACTUATION_MODES),
    }
}

/// Same table as [`legality`], except that a request for Safe or Full from Off or
/// Disconnected is accepted because the dispatcher prefixes a Start.
pub fn is_legal(command: &Command, state: LinkState) -> bool {
    if transition_prefix(command, state).is_some() {
        return true;
    }
    match (legality(command), state) {
        (Legality::Always, _) => true,
        (Legality::Modes(_), LinkState::Disconnected) => false,
        (Legality::Modes(modes), LinkState::Mode(mode)) => modes.contains(&mode),
    }
}

pub fn check(command: &Command, state: LinkState) -> Result<(), StateError> {
    if is_legal(command, state) {
        Ok(())
    } else {
        Err(StateError::IllegalInMode { command: command.name(), state })
    }
}

/// Mode the robot enters once `command` has been written.
pub fn mode_after(command: &Command) -> Option<RobotMode> {
    match command {
        Command::SetMode(mode) => Some(*mode),
        Command::PowerDown
        | Command::Spot
        | Command::Clean
        | Command::MaxClean
        | Command::SeekDock => Some(RobotMode::Passive),
        _ => None,
    }
}

/// Command that must go out first to make `command` legal, if any.
pub fn transition_prefix(command: &Command, state: LinkState) -> Option<Command> {
    match (command, state) {
        (
            Command::SetMode(RobotMode::Safe | RobotMode::Full),
            LinkState::Disconnected | LinkState::Mode(RobotMode::Off),
        ) => Some(Command::SetMode(RobotMode::Passive)),
        _ => None,
    }
}

/// Host-side view of the robot mode. Owned by the dispatcher; everyone else
/// observes it through the watch channel.
#[derive(Debug)]
pub struct ModeTracker {
    current: LinkState,
    publisher: watch::Sender<LinkState>,
}

impl ModeTracker {
    pub fn new() -> (Self, watch::Receiver<LinkState>) {
        let (publisher, receiver) = watch::channel(LinkState::Disconnected);
        (
            Self {
                current: LinkState::Disconnected,
                publisher,
            },
            receiver,
        )
    }

    pub fn current(&self) -> LinkState {
        self.current
    }

    pub fn validate(&self, command: &Command) -> Result<(), StateError> {
        check(command, self.current)
    }

    /// Records the transition caused by a successfully written command.
    pub fn apply(&mut self, command: &Command) {
        if let Some(mode) = mode_after(command) {
            self.set(LinkState::Mode(mode));
        }
    }

    /// The robot reported its actual mode; that wins over what we assumed.
    pub fn reconcile(&mut self, reported: RobotMode) {
        let state = LinkState::Mode(reported);
        if self.current != state {
            warn!(
                "Robot reported mode {}, host assumed {}; reconciling",
                reported, self.current
            );
            self.set(state);
        }
    }

    pub fn rollback(&mut self) {
        if self.current != LinkState::Disconnected {
            info!("Link fault, forgetting assumed mode {}", self.current);
        }
        self.set(LinkState::Disconnected);
    }

    fn set(&mut self, state: LinkState) {
        if self.current != state {
            debug!("Mode {} -> {}", self.current, state);
        }
        self.current = state;
        self.publisher.send_replace(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("{command} is not allowed while the robot is {state}")]
    IllegalInMode { command: &'static str, state: LinkState },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PacketId;

    #[test]
    fn test_tracker_publishes_transitions() {
        let (mut tracker, receiver) = ModeTracker::new();
        assert_eq!(*receiver.borrow(), LinkState::Disconnected);

        tracker.apply(&Command::SetMode(RobotMode::Passive));
        tracker.apply(&Command::SetMode(RobotMode::Safe));
        assert_eq!(*receiver.borrow(), LinkState::Mode(RobotMode::Safe));

        // Non-mode commands leave it alone
        tracker.apply(&Command::direct_drive(100, 100));
        assert_eq!(tracker.current(), LinkState::Mode(RobotMode::Safe));

        tracker.apply(&Command::Clean);
        assert_eq!(tracker.current(), LinkState::Mode(RobotMode::Passive));

        tracker.rollback();
        assert_eq!(*receiver.borrow(), LinkState::Disconnected);
    }

    #[test]
    fn test_reconcile_overrides_assumption() {
        let (mut tracker, _receiver) = ModeTracker::new();
        tracker.apply(&Command::SetMode(RobotMode::Full));
        tracker.reconcile(RobotMode::Passive);
        assert_eq!(tracker.current(), LinkState::Mode(RobotMode::Passive));
        assert!(tracker.validate(&Command::Stop).is_err());
        assert!(tracker.validate(&Command::RequestSensor(PacketId::VOLTAGE)).is_ok());
    }
}
