//! Roomba Open Interface wire codec.
//!
//! Pure encode/decode of OI command frames and sensor responses. Nothing in here
//! touches a transport, so every function is safe to call from any task.
//!
//! All multi-byte values are big-endian. Units follow the OI: millimeters,
//! millimeters per second, degrees, millivolts, milliamps, milliamp-hours and
//! degrees Celsius.

use crate::mode::RobotMode;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::ops::RangeInclusive;
use thiserror::Error;

pub mod opcode {
    pub const START: u8 = 128;
    pub const BAUD: u8 = 129;
    pub const CONTROL: u8 = 130;
    pub const SAFE: u8 = 131;
    pub const FULL: u8 = 132;
    pub const POWER: u8 = 133;
    pub const SPOT: u8 = 134;
    pub const CLEAN: u8 = 135;
    pub const MAX: u8 = 136;
    pub const DRIVE: u8 = 137;
    pub const MOTORS: u8 = 138;
    pub const LEDS: u8 = 139;
    pub const SONG: u8 = 140;
    pub const PLAY: u8 = 141;
    pub const SENSORS: u8 = 142;
    pub const SEEK_DOCK: u8 = 143;
    pub const PWM_MOTORS: u8 = 144;
    pub const DRIVE_DIRECT: u8 = 145;
    pub const DRIVE_PWM: u8 = 146;
    pub const SCHEDULE: u8 = 167;
    pub const SET_DAY_TIME: u8 = 168;
    pub const STOP: u8 = 173;
}

pub const MAX_VELOCITY_MM_S: i16 = 500;
pub const MAX_RADIUS_MM: i16 = 2000;
pub const MAX_WHEEL_PWM: i16 = 255;
pub const MAX_BRUSH_PWM: i8 = 127;
pub const MAX_VACUUM_PWM: u8 = 127;
pub const MAX_SONG_NUMBER: u8 = 4;
pub const MAX_SONG_NOTES: usize = 16;
// Speed used when a block asks to spin without giving a velocity
pub const TURN_IN_PLACE_VELOCITY_MM_S: i16 = 500;

const RADIUS_STRAIGHT: i16 = i16::MIN; // 0x8000
const RADIUS_STRAIGHT_ALT: i16 = i16::MAX; // 0x7FFF
const RADIUS_TURN_CLOCKWISE: i16 = -1;
const RADIUS_TURN_COUNTER_CLOCKWISE: i16 = 1;

macro_rules! bit_fields {
    ($(#[$meta:meta])* $name:ident { $($field:ident = $bit:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            $(pub $field: bool,)+
        }

        impl $name {
            pub fn from_bits(bits: u8) -> Self {
                Self {
                    $($field: bits & (1 << $bit) != 0,)+
                }
            }

            pub fn bits(self) -> u8 {
                0 $(| (u8::from(self.$field) << $bit))+
            }
        }
    };
}

bit_fields!(
    /// Packet 7
    BumpsAndWheelDrops { bump_right = 0, bump_left = 1, wheel_drop_right = 2, wheel_drop_left = 3 }
);
bit_fields!(
    /// Packet 14. Bit 1 is reserved.
    WheelOvercurrents { side_brush = 0, main_brush = 2, right_wheel = 3, left_wheel = 4 }
);
bit_fields!(
    /// Packet 18
    Buttons { clean = 0, spot = 1, dock = 2, minute = 3, hour = 4, day = 5, schedule = 6, clock = 7 }
);
bit_fields!(
    /// Packet 34
    ChargingSources { internal_charger = 0, home_base = 1 }
);
bit_fields!(
    /// Packet 45
    LightBumper { left = 0, front_left = 1, center_left = 2, center_right = 3, front_right = 4, right = 5 }
);
bit_fields!(
    /// Payload of opcode 138 (Motors)
    MotorFlags { side_brush = 0, vacuum = 1, main_brush = 2, side_brush_clockwise = 3, main_brush_outward = 4 }
);
bit_fields!(
    LedIndicators { debris = 0, spot = 1, dock = 2, check_robot = 3 }
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudRate {
    Baud300,
    Baud600,
    Baud1200,
    Baud2400,
    Baud4800,
    Baud9600,
    Baud14400,
    Baud19200,
    Baud28800,
    Baud38400,
    Baud57600,
    Baud115200,
}

impl BaudRate {
    const ALL: [BaudRate; 12] = [
        BaudRate::Baud300,
        BaudRate::Baud600,
        BaudRate::Baud1200,
        BaudRate::Baud2400,
        BaudRate::Baud4800,
        BaudRate::Baud9600,
        BaudRate::Baud14400,
        BaudRate::Baud19200,
        BaudRate::Baud28800,
        BaudRate::Baud38400,
        BaudRate::Baud57600,
        BaudRate::Baud115200,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::Baud300 => 300,
            BaudRate::Baud600 => 600,
            BaudRate::Baud1200 => 1200,
            BaudRate::Baud2400 => 2400,
            BaudRate::Baud4800 => 4800,
            BaudRate::Baud9600 => 9600,
            BaudRate::Baud14400 => 14400,
            BaudRate::Baud19200 => 19200,
            BaudRate::Baud28800 => 28800,
            BaudRate::Baud38400 => 38400,
            BaudRate::Baud57600 => 57600,
            BaudRate::Baud115200 => 115_200,
        }
    }

    pub fn from_bits_per_second(bps: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|rate| rate.bits_per_second() == bps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Weekday {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Sunday,
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }
}

/// Turning radius of a Drive command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Radius {
    Straight,
    TurnClockwise,
    TurnCounterClockwise,
    Arc(i16),
}

impl Radius {
    /// Clamps to ±2000 mm and maps the OI special values.
    pub fn arc(radius_mm: i16) -> Self {
        match radius_mm.clamp(-MAX_RADIUS_MM, MAX_RADIUS_MM) {
            0 => Radius::Straight,
            RADIUS_TURN_CLOCKWISE => Radius::TurnClockwise,
            RADIUS_TURN_COUNTER_CLOCKWISE => Radius::TurnCounterClockwise,
            r => Radius::Arc(r),
        }
    }

    pub fn to_wire(self) -> i16 {
        match self {
            Radius::Straight => RADIUS_STRAIGHT,
            Radius::TurnClockwise => RADIUS_TURN_CLOCKWISE,
            Radius::TurnCounterClockwise => RADIUS_TURN_COUNTER_CLOCKWISE,
            Radius::Arc(r) => r,
        }
    }

    pub fn from_wire(value: i16) -> Self {
        match value {
            RADIUS_STRAIGHT | RADIUS_STRAIGHT_ALT => Radius::Straight,
            RADIUS_TURN_CLOCKWISE => Radius::TurnClockwise,
            RADIUS_TURN_COUNTER_CLOCKWISE => Radius::TurnCounterClockwise,
            r => Radius::Arc(r),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedState {
    pub indicators: LedIndicators,
    /// 0 = green, 255 = red
    pub power_color: u8,
    pub power_intensity: u8,
}

/// One note of a song. Pitch is a MIDI note number (31..=127, anything else is a
/// rest), duration is in 1/64 s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub pitch: u8,
    pub duration: u8,
}

impl Note {
    pub fn new(pitch: u8, duration: u8) -> Self {
        Self { pitch, duration }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    number: u8,
    notes: heapless::Vec<Note, MAX_SONG_NOTES>,
}

impl Song {
    /// Song slots are 0..=4; out-of-range numbers are clamped.
    pub fn new(number: u8, notes: &[Note]) -> Result<Self, ProtocolError> {
        if notes.is_empty() {
            return Err(ProtocolError::InvalidArgument("at least one note must be provided"));
        }
        let notes = heapless::Vec::from_slice(notes)
            .map_err(|()| ProtocolError::InvalidArgument("a song holds at most 16 notes"))?;

        Ok(Self {
            number: number.min(MAX_SONG_NUMBER),
            notes,
        })
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    /// Playback length in 1/64 s units.
    pub fn duration_ticks(&self) -> u32 {
        self.notes.iter().map(|n| u32::from(n.duration)).sum()
    }
}

/// Weekly cleaning schedule (opcode 167). Days without an entry are cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningSchedule {
    days: [Option<(u8, u8)>; 7],
}

impl CleaningSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hours wrap at 24 and minutes at 60.
    pub fn set(&mut self, day: Weekday, hour: u8, minute: u8) -> &mut Self {
        self.days[day.index() as usize] = Some((hour % 24, minute % 60));
        self
    }

    pub fn get(&self, day: Weekday) -> Option<(u8, u8)> {
        self.days[day.index() as usize]
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mask = self
            .days
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_some())
            .fold(0u8, |mask, (i, _)| mask | (1 << i));
        out.push(mask);
        for entry in &self.days {
            let (hour, minute) = entry.unwrap_or((0, 0));
            out.push(hour);
            out.push(minute);
        }
    }

    fn decode(payload: &[u8]) -> Self {
        let mask = payload[0];
        let mut schedule = Self::new();
        for (i, slot) in schedule.days.iter_mut().enumerate() {
            if mask & (1 << i) != 0 {
                *slot = Some((payload[1 + i * 2], payload[2 + i * 2]));
            }
        }
        schedule
    }
}

/// Commands understood by the robot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetMode(RobotMode),
    Baud(BaudRate),
    PowerDown,
    Spot,
    Clean,
    MaxClean,
    SeekDock,
    Drive { velocity: i16, radius: Radius },
    DirectDrive { left: i16, right: i16 },
    DrivePwm { left: i16, right: i16 },
    /// Halts both wheels.
    Stop,
    Motors(MotorFlags),
    PwmMotors { main_brush: i8, side_brush: i8, vacuum: u8 },
    Leds(LedState),
    Song(Song),
    PlaySong(u8),
    RequestSensor(PacketId),
    Schedule(CleaningSchedule),
    SetClock { day: Weekday, hour: u8, minute: u8 },
}

impl Command {
    /// Builds a Drive command the way a block would: clamps velocity to ±500 mm/s and
    /// radius to ±2000 mm. A zero radius drives straight; a zero velocity with a
    /// signed radius spins in place.
    pub fn drive(velocity: i16, radius: i16) -> Self {
        let velocity = velocity.clamp(-MAX_VELOCITY_MM_S, MAX_VELOCITY_MM_S);
        let radius = radius.clamp(-MAX_RADIUS_MM, MAX_RADIUS_MM);

        match (velocity, radius) {
            (_, 0) => Command::Drive { velocity, radius: Radius::Straight },
            (0, r) if r > 0 => Command::Drive {
                velocity: TURN_IN_PLACE_VELOCITY_MM_S,
                radius: Radius::TurnCounterClockwise,
            },
            (0, _) => Command::Drive {
                velocity: TURN_IN_PLACE_VELOCITY_MM_S,
                radius: Radius::TurnClockwise,
            },
            (v, r) => Command::Drive { velocity: v, radius: Radius::arc(r) },
        }
    }

    pub fn direct_drive(left: i16, right: i16) -> Self {
        Command::DirectDrive {
            left: left.clamp(-MAX_VELOCITY_MM_S, MAX_VELOCITY_MM_S),
            right: right.clamp(-MAX_VELOCITY_MM_S, MAX_VELOCITY_MM_S),
        }
    }

    pub fn drive_pwm(left: i16, right: i16) -> Self {
        Command::DrivePwm {
            left: left.clamp(-MAX_WHEEL_PWM, MAX_WHEEL_PWM),
            right: right.clamp(-MAX_WHEEL_PWM, MAX_WHEEL_PWM),
        }
    }

    pub fn pwm_motors(main_brush: i8, side_brush: i8, vacuum: u8) -> Self {
        Command::PwmMotors {
            main_brush: main_brush.clamp(-MAX_BRUSH_PWM, MAX_BRUSH_PWM),
            side_brush: side_brush.clamp(-MAX_BRUSH_PWM, MAX_BRUSH_PWM),
            vacuum: vacuum.min(MAX_VACUUM_PWM),
        }
    }

    pub fn play_song(number: u8) -> Self {
        Command::PlaySong(number.min(MAX_SONG_NUMBER))
    }

    pub fn set_clock(day: Weekday, hour: u8, minute: u8) -> Self {
        Command::SetClock { day, hour: hour % 24, minute: minute % 60 }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::SetMode(RobotMode::Off) => opcode::STOP,
            Command::SetMode(RobotMode::Passive) => opcode::START,
            Command::SetMode(RobotMode::Safe) => opcode::SAFE,
            Command::SetMode(RobotMode::Full) => opcode::FULL,
            Command::Baud(_) => opcode::BAUD,
            Command::PowerDown => opcode::POWER,
            Command::Spot => opcode::SPOT,
            Command::Clean => opcode::CLEAN,
            Command::MaxClean => opcode::MAX,
            Command::SeekDock => opcode::SEEK_DOCK,
            Command::Drive { .. } => opcode::DRIVE,
            Command::DirectDrive { .. } | Command::Stop => opcode::DRIVE_DIRECT,
            Command::DrivePwm { .. } => opcode::DRIVE_PWM,
            Command::Motors(_) => opcode::MOTORS,
            Command::PwmMotors { .. } => opcode::PWM_MOTORS,
            Command::Leds(_) => opcode::LEDS,
            Command::Song(_) => opcode::SONG,
            Command::PlaySong(_) => opcode::PLAY,
            Command::RequestSensor(_) => opcode::SENSORS,
            Command::Schedule(_) => opcode::SCHEDULE,
            Command::SetClock { .. } => opcode::SET_DAY_TIME,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::SetMode(_) => "SetMode",
            Command::Baud(_) => "Baud",
            Command::PowerDown => "PowerDown",
            Command::Spot => "Spot",
            Command::Clean => "Clean",
            Command::MaxClean => "MaxClean",
            Command::SeekDock => "SeekDock",
            Command::Drive { .. } => "Drive",
            Command::DirectDrive { .. } => "DirectDrive",
            Command::DrivePwm { .. } => "DrivePwm",
            Command::Stop => "Stop",
            Command::Motors(_) => "Motors",
            Command::PwmMotors { .. } => "PwmMotors",
            Command::Leds(_) => "Leds",
            Command::Song(_) => "Song",
            Command::PlaySong(_) => "PlaySong",
            Command::RequestSensor(_) => "RequestSensor",
            Command::Schedule(_) => "Schedule",
            Command::SetClock { .. } => "SetClock",
        }
    }

    /// Number of bytes the robot sends back after this command.
    pub fn response_len(&self) -> usize {
        match self {
            Command::RequestSensor(packet) => packet.response_len(),
            _ => 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(4);
        frame.push(self.opcode());

        match self {
            Command::SetMode(_)
            | Command::PowerDown
            | Command::Spot
            | Command::Clean
            | Command::MaxClean
            | Command::SeekDock => {}
            Command::Baud(rate) => frame.push(rate.code()),
            Command::Drive { velocity, radius } => {
                frame.extend_from_slice(&velocity.to_be_bytes());
                frame.extend_from_slice(&radius.to_wire().to_be_bytes());
            }
            // Right wheel goes first on the wire
            Command::DirectDrive { left, right } | Command::DrivePwm { left, right } => {
                frame.extend_from_slice(&right.to_be_bytes());
                frame.extend_from_slice(&left.to_be_bytes());
            }
            Command::Stop => frame.extend_from_slice(&[0, 0, 0, 0]),
            Command::Motors(flags) => frame.push(flags.bits()),
            Command::PwmMotors { main_brush, side_brush, vacuum } => {
                frame.extend_from_slice(&main_brush.to_be_bytes());
                frame.extend_from_slice(&side_brush.to_be_bytes());
                frame.push(*vacuum);
            }
            Command::Leds(leds) => {
                frame.push(leds.indicators.bits());
                frame.push(leds.power_color);
                frame.push(leds.power_intensity);
            }
            Command::Song(song) => {
                frame.push(song.number);
                frame.push(song.notes.len() as u8);
                for note in &song.notes {
                    frame.push(note.pitch);
                    frame.push(note.duration);
                }
            }
            Command::PlaySong(number) => frame.push(*number),
            Command::RequestSensor(packet) => frame.push(packet.id()),
            Command::Schedule(schedule) => schedule.encode_into(&mut frame),
            Command::SetClock { day, hour, minute } => {
                frame.extend_from_slice(&[day.index(), *hour, *minute]);
            }
        }

        frame
    }

    /// Parses exactly one command frame. Used for echo verification and by the
    /// simulated robot.
    pub fn decode(frame: &[u8]) -> Result<Command, ProtocolError> {
        let (&op, payload) = frame.split_first().ok_or(ProtocolError::Truncated {
            opcode: 0,
            expected: 1,
            actual: 0,
        })?;

        let expect = |len: usize| -> Result<(), ProtocolError> {
            if payload.len() == len {
                Ok(())
            } else {
                Err(ProtocolError::Truncated { opcode: op, expected: len, actual: payload.len() })
            }
        };
        let word = |at: usize| i16::from_be_bytes([payload[at], payload[at + 1]]);

        let command = match op {
            opcode::START => {
                expect(0)?;
                Command::SetMode(RobotMode::Passive)
            }
            opcode::CONTROL | opcode::SAFE => {
                expect(0)?;
                Command::SetMode(RobotMode::Safe)
            }
            opcode::FULL => {
                expect(0)?;
                Command::SetMode(RobotMode::Full)
            }
            opcode::STOP => {
                expect(0)?;
                Command::SetMode(RobotMode::Off)
            }
            opcode::BAUD => {
                expect(1)?;
                Command::Baud(BaudRate::from_code(payload[0]).ok_or(
                    ProtocolError::InvalidArgument("baud code must be 0..=11"),
                )?)
            }
            opcode::POWER => {
                expect(0)?;
                Command::PowerDown
            }
            opcode::SPOT => {
                expect(0)?;
                Command::Spot
            }
            opcode::CLEAN => {
                expect(0)?;
                Command::Clean
            }
            opcode::MAX => {
                expect(0)?;
                Command::MaxClean
            }
            opcode::SEEK_DOCK => {
                expect(0)?;
                Command::SeekDock
            }
            opcode::DRIVE => {
                expect(4)?;
                Command::Drive { velocity: word(0), radius: Radius::from_wire(word(2)) }
            }
            opcode::DRIVE_DIRECT => {
                expect(4)?;
                Command::DirectDrive { right: word(0), left: word(2) }
            }
            opcode::DRIVE_PWM => {
                expect(4)?;
                Command::DrivePwm { right: word(0), left: word(2) }
            }
            opcode::MOTORS => {
                expect(1)?;
                Command::Motors(MotorFlags::from_bits(payload[0]))
            }
            opcode::PWM_MOTORS => {
                expect(3)?;
                Command::PwmMotors {
                    main_brush: payload[0] as i8,
                    side_brush: payload[1] as i8,
                    vacuum: payload[2],
                }
            }
            opcode::LEDS => {
                expect(3)?;
                Command::Leds(LedState {
                    indicators: LedIndicators::from_bits(payload[0]),
                    power_color: payload[1],
                    power_intensity: payload[2],
                })
            }
            opcode::SONG => {
                if payload.len() < 2 {
                    return Err(ProtocolError::Truncated { opcode: op, expected: 2, actual: payload.len() });
                }
                let count = payload[1] as usize;
                expect(2 + count * 2)?;
                let notes: Vec<Note> = payload[2..]
                    .chunks_exact(2)
                    .map(|pair| Note::new(pair[0], pair[1]))
                    .collect();
                Command::Song(Song::new(payload[0], &notes)?)
            }
            opcode::PLAY => {
                expect(1)?;
                Command::PlaySong(payload[0])
            }
            opcode::SENSORS => {
                expect(1)?;
                Command::RequestSensor(PacketId::new(payload[0])?)
            }
            opcode::SCHEDULE => {
                expect(15)?;
                Command::Schedule(CleaningSchedule::decode(payload))
            }
            opcode::SET_DAY_TIME => {
                expect(3)?;
                Command::SetClock {
                    day: Weekday::from_index(payload[0])
                        .ok_or(ProtocolError::InvalidArgument("day must be 0..=6"))?,
                    hour: payload[1],
                    minute: payload[2],
                }
            }
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };

        Ok(command)
    }
}

/// Sensor packet id: a single packet (7..=58) or a group (0..=6, 100, 101, 106, 107).
///
/// Every id covers a contiguous run of single packets, which is what makes the
/// response length and decode order fixed per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PacketId(u8);

impl PacketId {
    pub const GROUP_0: PacketId = PacketId(0);
    pub const GROUP_1: PacketId = PacketId(1);
    pub const GROUP_2: PacketId = PacketId(2);
    pub const GROUP_3: PacketId = PacketId(3);
    pub const GROUP_4: PacketId = PacketId(4);
    pub const GROUP_5: PacketId = PacketId(5);
    pub const GROUP_6: PacketId = PacketId(6);
    pub const GROUP_ALL: PacketId = PacketId(100);
    pub const GROUP_101: PacketId = PacketId(101);
    pub const GROUP_LIGHT_BUMP_SIGNALS: PacketId = PacketId(106);
    pub const GROUP_MOTOR_CURRENTS: PacketId = PacketId(107);

    pub const BUMPS_AND_WHEEL_DROPS: PacketId = PacketId(7);
    pub const WALL: PacketId = PacketId(8);
    pub const CLIFF_LEFT: PacketId = PacketId(9);
    pub const CLIFF_FRONT_LEFT: PacketId = PacketId(10);
    pub const CLIFF_FRONT_RIGHT: PacketId = PacketId(11);
    pub const CLIFF_RIGHT: PacketId = PacketId(12);
    pub const BUTTONS: PacketId = PacketId(18);
    pub const DISTANCE: PacketId = PacketId(19);
    pub const ANGLE: PacketId = PacketId(20);
    pub const CHARGING_STATE: PacketId = PacketId(21);
    pub const VOLTAGE: PacketId = PacketId(22);
    pub const CURRENT: PacketId = PacketId(23);
    pub const TEMPERATURE: PacketId = PacketId(24);
    pub const BATTERY_CHARGE: PacketId = PacketId(25);
    pub const BATTERY_CAPACITY: PacketId = PacketId(26);
    pub const OI_MODE: PacketId = PacketId(35);
    pub const LIGHT_BUMPER: PacketId = PacketId(45);
    pub const STASIS: PacketId = PacketId(58);

    pub fn new(id: u8) -> Result<Self, ProtocolError> {
        match span_of(id) {
            Some(_) => Ok(PacketId(id)),
            None => Err(ProtocolError::UnknownPacket(id)),
        }
    }

    pub const fn id(self) -> u8 {
        self.0
    }

    pub fn is_group(self) -> bool {
        self.0 < 7 || self.0 > 58
    }

    /// Single packet ids covered by this id, in wire order.
    pub fn span(self) -> RangeInclusive<u8> {
        match span_of(self.0) {
            Some((first, last)) => first..=last,
            // Unreachable for a constructed id; an empty range keeps this total.
            None => 1..=0,
        }
    }

    /// Fixed length of the robot's response to a request for this id.
    pub const fn response_len(self) -> usize {
        let (first, last) = match span_of(self.0) {
            Some(span) => span,
            None => return 0,
        };
        let mut id = first;
        let mut total = 0;
        while id <= last {
            total += single_len(id);
            id += 1;
        }
        total
    }

    pub fn contains(self, single: u8) -> bool {
        self.span().contains(&single)
    }
}

impl TryFrom<u8> for PacketId {
    type Error = ProtocolError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        PacketId::new(id)
    }
}

impl From<PacketId> for u8 {
    fn from(packet: PacketId) -> u8 {
        packet.0
    }
}

impl core::fmt::Display for PacketId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const fn span_of(id: u8) -> Option<(u8, u8)> {
    match id {
        0 => Some((7, 26)),
        1 => Some((7, 16)),
        2 => Some((17, 20)),
        3 => Some((21, 26)),
        4 => Some((27, 34)),
        5 => Some((35, 42)),
        6 => Some((7, 42)),
        7..=58 => Some((id, id)),
        100 => Some((7, 58)),
        101 => Some((43, 58)),
        106 => Some((46, 51)),
        107 => Some((54, 58)),
        _ => None,
    }
}

const fn single_len(id: u8) -> usize {
    match id {
        19 | 20 | 22 | 23 | 25..=31 | 33 | 39..=44 | 46..=51 | 54..=57 => 2,
        _ => 1,
    }
}

const_assert_eq!(PacketId::GROUP_0.response_len(), 26);
const_assert_eq!(PacketId::GROUP_1.response_len(), 10);
const_assert_eq!(PacketId::GROUP_2.response_len(), 6);
const_assert_eq!(PacketId::GROUP_3.response_len(), 10);
const_assert_eq!(PacketId::GROUP_4.response_len(), 14);
const_assert_eq!(PacketId::GROUP_5.response_len(), 12);
const_assert_eq!(PacketId::GROUP_6.response_len(), 52);
const_assert_eq!(PacketId::GROUP_ALL.response_len(), 80);
const_assert_eq!(PacketId::GROUP_101.response_len(), 28);
const_assert_eq!(PacketId::GROUP_LIGHT_BUMP_SIGNALS.response_len(), 12);
const_assert_eq!(PacketId::GROUP_MOTOR_CURRENTS.response_len(), 9);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingState {
    NotCharging,
    ReconditioningCharging,
    FullCharging,
    TrickleCharging,
    Waiting,
    ChargingFault,
}

impl ChargingState {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChargingState::NotCharging),
            1 => Some(ChargingState::ReconditioningCharging),
            2 => Some(ChargingState::FullCharging),
            3 => Some(ChargingState::TrickleCharging),
            4 => Some(ChargingState::Waiting),
            5 => Some(ChargingState::ChargingFault),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Decoded sensor values. A field is `Some` only when the packet it came from
/// covers it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReadings {
    pub bumps_and_wheel_drops: Option<BumpsAndWheelDrops>,
    pub wall: Option<bool>,
    pub cliff_left: Option<bool>,
    pub cliff_front_left: Option<bool>,
    pub cliff_front_right: Option<bool>,
    pub cliff_right: Option<bool>,
    pub virtual_wall: Option<bool>,
    pub wheel_overcurrents: Option<WheelOvercurrents>,
    pub dirt_detect: Option<u8>,
    pub ir_omni: Option<u8>,
    pub buttons: Option<Buttons>,
    pub distance_mm: Option<i16>,
    pub angle_deg: Option<i16>,
    pub charging_state: Option<ChargingState>,
    pub voltage_mv: Option<u16>,
    pub current_ma: Option<i16>,
    pub temperature_c: Option<i8>,
    pub battery_charge_mah: Option<u16>,
    pub battery_capacity_mah: Option<u16>,
    pub wall_signal: Option<u16>,
    pub cliff_left_signal: Option<u16>,
    pub cliff_front_left_signal: Option<u16>,
    pub cliff_front_right_signal: Option<u16>,
    pub cliff_right_signal: Option<u16>,
    pub charging_sources: Option<ChargingSources>,
    pub oi_mode: Option<RobotMode>,
    pub song_number: Option<u8>,
    pub song_playing: Option<bool>,
    pub stream_packets: Option<u8>,
    pub requested_velocity_mm_s: Option<i16>,
    pub requested_radius_mm: Option<i16>,
    pub requested_right_velocity_mm_s: Option<i16>,
    pub requested_left_velocity_mm_s: Option<i16>,
    pub left_encoder_counts: Option<u16>,
    pub right_encoder_counts: Option<u16>,
    pub light_bumper: Option<LightBumper>,
    pub light_bump_left_signal: Option<u16>,
    pub light_bump_front_left_signal: Option<u16>,
    pub light_bump_center_left_signal: Option<u16>,
    pub light_bump_center_right_signal: Option<u16>,
    pub light_bump_front_right_signal: Option<u16>,
    pub light_bump_right_signal: Option<u16>,
    pub ir_left: Option<u8>,
    pub ir_right: Option<u8>,
    pub left_motor_current_ma: Option<i16>,
    pub right_motor_current_ma: Option<i16>,
    pub main_brush_current_ma: Option<i16>,
    pub side_brush_current_ma: Option<i16>,
    pub stasis: Option<bool>,
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_i16(bytes: &[u8]) -> i16 {
    i16::from_be_bytes([bytes[0], bytes[1]])
}

impl SensorReadings {
    fn apply(&mut self, packet: PacketId, single: u8, b: &[u8]) -> Result<(), ProtocolError> {
        let flag = b[0] != 0;
        match single {
            7 => self.bumps_and_wheel_drops = Some(BumpsAndWheelDrops::from_bits(b[0])),
            8 => self.wall = Some(flag),
            9 => self.cliff_left = Some(flag),
            10 => self.cliff_front_left = Some(flag),
            11 => self.cliff_front_right = Some(flag),
            12 => self.cliff_right = Some(flag),
            13 => self.virtual_wall = Some(flag),
            14 => self.wheel_overcurrents = Some(WheelOvercurrents::from_bits(b[0])),
            15 => self.dirt_detect = Some(b[0]),
            17 => self.ir_omni = Some(b[0]),
            18 => self.buttons = Some(Buttons::from_bits(b[0])),
            19 => self.distance_mm = Some(be_i16(b)),
            20 => self.angle_deg = Some(be_i16(b)),
            21 => {
                let state = ChargingState::from_byte(b[0]).ok_or(ProtocolError::Malformed {
                    packet: packet.id(),
                    reason: MalformedReason::OutOfRange { field: "charging_state", value: b[0] },
                })?;
                self.charging_state = Some(state);
            }
            22 => self.voltage_mv = Some(be_u16(b)),
            23 => self.current_ma = Some(be_i16(b)),
            24 => self.temperature_c = Some(b[0] as i8),
            25 => self.battery_charge_mah = Some(be_u16(b)),
            26 => self.battery_capacity_mah = Some(be_u16(b)),
            27 => self.wall_signal = Some(be_u16(b)),
            28 => self.cliff_left_signal = Some(be_u16(b)),
            29 => self.cliff_front_left_signal = Some(be_u16(b)),
            30 => self.cliff_front_right_signal = Some(be_u16(b)),
            31 => self.cliff_right_signal = Some(be_u16(b)),
            34 => self.charging_sources = Some(ChargingSources::from_bits(b[0])),
            35 => {
                let mode = RobotMode::from_wire(b[0]).ok_or(ProtocolError::Malformed {
                    packet: packet.id(),
                    reason: MalformedReason::OutOfRange { field: "oi_mode", value: b[0] },
                })?;
                self.oi_mode = Some(mode);
            }
            36 => self.song_number = Some(b[0]),
            37 => self.song_playing = Some(flag),
            38 => self.stream_packets = Some(b[0]),
            39 => self.requested_velocity_mm_s = Some(be_i16(b)),
            40 => self.requested_radius_mm = Some(be_i16(b)),
            41 => self.requested_right_velocity_mm_s = Some(be_i16(b)),
            42 => self.requested_left_velocity_mm_s = Some(be_i16(b)),
            43 => self.left_encoder_counts = Some(be_u16(b)),
            44 => self.right_encoder_counts = Some(be_u16(b)),
            45 => self.light_bumper = Some(LightBumper::from_bits(b[0])),
            46 => self.light_bump_left_signal = Some(be_u16(b)),
            47 => self.light_bump_front_left_signal = Some(be_u16(b)),
            48 => self.light_bump_center_left_signal = Some(be_u16(b)),
            49 => self.light_bump_center_right_signal = Some(be_u16(b)),
            50 => self.light_bump_front_right_signal = Some(be_u16(b)),
            51 => self.light_bump_right_signal = Some(be_u16(b)),
            52 => self.ir_left = Some(b[0]),
            53 => self.ir_right = Some(b[0]),
            54 => self.left_motor_current_ma = Some(be_i16(b)),
            55 => self.right_motor_current_ma = Some(be_i16(b)),
            56 => self.main_brush_current_ma = Some(be_i16(b)),
            57 => self.side_brush_current_ma = Some(be_i16(b)),
            58 => self.stasis = Some(flag),
            // 16, 32 and 33 are unused padding
            _ => {}
        }
        Ok(())
    }

    // Absent fields go out as zeros.
    fn write(&self, single: u8, out: &mut Vec<u8>) {
        let flag = |v: Option<bool>| u8::from(v.unwrap_or(false));
        let word_u = |v: Option<u16>| v.unwrap_or(0).to_be_bytes();
        let word_i = |v: Option<i16>| v.unwrap_or(0).to_be_bytes();

        match single {
            7 => out.push(self.bumps_and_wheel_drops.unwrap_or_default().bits()),
            8 => out.push(flag(self.wall)),
            9 => out.push(flag(self.cliff_left)),
            10 => out.push(flag(self.cliff_front_left)),
            11 => out.push(flag(self.cliff_front_right)),
            12 => out.push(flag(self.cliff_right)),
            13 => out.push(flag(self.virtual_wall)),
            14 => out.push(self.wheel_overcurrents.unwrap_or_default().bits()),
            15 => out.push(self.dirt_detect.unwrap_or(0)),
            17 => out.push(self.ir_omni.unwrap_or(0)),
            18 => out.push(self.buttons.unwrap_or_default().bits()),
            19 => out.extend_from_slice(&word_i(self.distance_mm)),
            20 => out.extend_from_slice(&word_i(self.angle_deg)),
            21 => out.push(self.charging_state.map_or(0, ChargingState::to_byte)),
            22 => out.extend_from_slice(&word_u(self.voltage_mv)),
            23 => out.extend_from_slice(&word_i(self.current_ma)),
            24 => out.push(self.temperature_c.unwrap_or(0) as u8),
            25 => out.extend_from_slice(&word_u(self.battery_charge_mah)),
            26 => out.extend_from_slice(&word_u(self.battery_capacity_mah)),
            27 => out.extend_from_slice(&word_u(self.wall_signal)),
            28 => out.extend_from_slice(&word_u(self.cliff_left_signal)),
            29 => out.extend_from_slice(&word_u(self.cliff_front_left_signal)),
            30 => out.extend_from_slice(&word_u(self.cliff_front_right_signal)),
            31 => out.extend_from_slice(&word_u(self.cliff_right_signal)),
            33 => out.extend_from_slice(&[0, 0]),
            34 => out.push(self.charging_sources.unwrap_or_default().bits()),
            35 => out.push(self.oi_mode.map_or(0, RobotMode::wire_value)),
            36 => out.push(self.song_number.unwrap_or(0)),
            37 => out.push(flag(self.song_playing)),
            38 => out.push(self.stream_packets.unwrap_or(0)),
            39 => out.extend_from_slice(&word_i(self.requested_velocity_mm_s)),
            40 => out.extend_from_slice(&word_i(self.requested_radius_mm)),
            41 => out.extend_from_slice(&word_i(self.requested_right_velocity_mm_s)),
            42 => out.extend_from_slice(&word_i(self.requested_left_velocity_mm_s)),
            43 => out.extend_from_slice(&word_u(self.left_encoder_counts)),
            44 => out.extend_from_slice(&word_u(self.right_encoder_counts)),
            45 => out.push(self.light_bumper.unwrap_or_default().bits()),
            46 => out.extend_from_slice(&word_u(self.light_bump_left_signal)),
            47 => out.extend_from_slice(&word_u(self.light_bump_front_left_signal)),
            48 => out.extend_from_slice(&word_u(self.light_bump_center_left_signal)),
            49 => out.extend_from_slice(&word_u(self.light_bump_center_right_signal)),
            50 => out.extend_from_slice(&word_u(self.light_bump_front_right_signal)),
            51 => out.extend_from_slice(&word_u(self.light_bump_right_signal)),
            52 => out.push(self.ir_left.unwrap_or(0)),
            53 => out.push(self.ir_right.unwrap_or(0)),
            54 => out.extend_from_slice(&word_i(self.left_motor_current_ma)),
            55 => out.extend_from_slice(&word_i(self.right_motor_current_ma)),
            56 => out.extend_from_slice(&word_i(self.main_brush_current_ma)),
            57 => out.extend_from_slice(&word_i(self.side_brush_current_ma)),
            58 => out.push(flag(self.stasis)),
            _ => out.push(0),
        }
    }

    /// Copies every field that is `Some` in `newer` over this record.
    pub fn merge(&mut self, newer: &SensorReadings) {
        macro_rules! take_some {
            ($($field:ident),+ $(,)?) => {
                $(if newer.$field.is_some() { self.$field = newer.$field; })+
            };
        }
        take_some!(
            bumps_and_wheel_drops, wall, cliff_left, cliff_front_left, cliff_front_right,
            cliff_right, virtual_wall, wheel_overcurrents, dirt_detect, ir_omni, buttons,
            distance_mm, angle_deg, charging_state, voltage_mv, current_ma, temperature_c,
            battery_charge_mah, battery_capacity_mah, wall_signal, cliff_left_signal,
            cliff_front_left_signal, cliff_front_right_signal, cliff_right_signal,
            charging_sources, oi_mode, song_number, song_playing, stream_packets,
            requested_velocity_mm_s, requested_radius_mm, requested_right_velocity_mm_s,
            requested_left_velocity_mm_s, left_encoder_counts, right_encoder_counts,
            light_bumper, light_bump_left_signal, light_bump_front_left_signal,
            light_bump_center_left_signal, light_bump_center_right_signal,
            light_bump_front_right_signal, light_bump_right_signal, ir_left, ir_right,
            left_motor_current_ma, right_motor_current_ma, main_brush_current_ma,
            side_brush_current_ma, stasis,
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorPacket {
    pub packet: PacketId,
    pub readings: SensorReadings,
}

impl SensorPacket {
    /// Robot-side encoding of this packet, exactly `packet.response_len()` bytes.
    pub fn encode_response(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packet.response_len());
        for single in self.packet.span() {
            self.readings.write(single, &mut out);
        }
        out
    }
}

/// Decodes the robot's response to a sensor request for `packet`.
pub fn decode(bytes: &[u8], packet: PacketId) -> Result<SensorPacket, ProtocolError> {
    let expected = packet.response_len();
    if bytes.len() != expected {
        return Err(ProtocolError::Malformed {
            packet: packet.id(),
            reason: MalformedReason::Length { expected, actual: bytes.len() },
        });
    }

    let mut readings = SensorReadings::default();
    let mut offset = 0;
    for single in packet.span() {
        let len = single_len(single);
        readings.apply(packet, single, &bytes[offset..offset + len])?;
        offset += len;
    }

    Ok(SensorPacket { packet, readings })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MalformedReason {
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("{field} value {value} out of range")]
    OutOfRange { field: &'static str, value: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed sensor packet {packet}: {reason}")]
    Malformed { packet: u8, reason: MalformedReason },
    #[error("unknown sensor packet id {0}")]
    UnknownPacket(u8),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("opcode {opcode} expects {expected} payload bytes, got {actual}")]
    Truncated { opcode: u8, expected: usize, actual: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_spans_are_contiguous() {
        assert_eq!(PacketId::GROUP_0.span(), 7..=26);
        assert_eq!(PacketId::GROUP_6.span(), 7..=42);
        assert_eq!(PacketId::GROUP_ALL.span(), 7..=58);
        assert_eq!(PacketId::VOLTAGE.span(), 22..=22);
    }

    #[test]
    fn test_single_packet_lengths() {
        assert_eq!(PacketId::BUMPS_AND_WHEEL_DROPS.response_len(), 1);
        assert_eq!(PacketId::DISTANCE.response_len(), 2);
        assert_eq!(PacketId::TEMPERATURE.response_len(), 1);
        assert_eq!(PacketId::new(33).unwrap().response_len(), 2);
        assert_eq!(PacketId::STASIS.response_len(), 1);
    }

    #[test]
    fn test_unknown_packet_ids_rejected() {
        assert_eq!(PacketId::new(59), Err(ProtocolError::UnknownPacket(59)));
        assert_eq!(PacketId::new(99), Err(ProtocolError::UnknownPacket(99)));
        assert!(PacketId::new(107).is_ok());
        assert!(PacketId::new(108).is_err());
    }

    #[test]
    fn test_packet_id_serde_validates() {
        let id: PacketId = serde_json::from_str("22").unwrap();
        assert_eq!(id, PacketId::VOLTAGE);
        assert!(serde_json::from_str::<PacketId>("77").is_err());
    }

    #[test]
    fn test_bit_fields() {
        let bumps = BumpsAndWheelDrops::from_bits(0b0000_0101);
        assert!(bumps.bump_right);
        assert!(!bumps.bump_left);
        assert!(bumps.wheel_drop_right);
        assert_eq!(bumps.bits(), 0b0000_0101);

        // Reserved bit 1 is dropped
        assert_eq!(WheelOvercurrents::from_bits(0xFF).bits(), 0b0001_1101);
    }

    #[test]
    fn test_radius_special_values() {
        assert_eq!(Radius::from_wire(0x7FFF), Radius::Straight);
        assert_eq!(Radius::arc(5000), Radius::Arc(2000));
        assert_eq!(Radius::arc(-1), Radius::TurnClockwise);
        assert_eq!(Radius::Straight.to_wire().to_be_bytes(), [0x80, 0x00]);
    }

    #[test]
    fn test_merge_keeps_older_fields() {
        let mut merged = SensorReadings { voltage_mv: Some(15_000), ..Default::default() };
        let newer = SensorReadings { current_ma: Some(-250), ..Default::default() };
        merged.merge(&newer);
        assert_eq!(merged.voltage_mv, Some(15_000));
        assert_eq!(merged.current_ma, Some(-250));
    }
}
