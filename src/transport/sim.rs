//! In-process simulated robot.
//!
//! Good enough to drive the bridge without hardware: it follows the OI mode
//! rules, remembers songs, integrates wheel motion into odometry and answers
//! every sensor packet with a correctly sized response.

use super::{Transport, TransportError};
use crate::codec::{
    ChargingState, Command, PacketId, Radius, SensorPacket, SensorReadings, Song, MAX_WHEEL_PWM,
    MAX_VELOCITY_MM_S,
};
use crate::mode::{self, Legality, RobotMode};
use heapless::HistoryBuffer;
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// Create 2 geometry
const WHEEL_BASE_MM: f64 = 235.0;
const COUNTS_PER_MM: f64 = 508.8 / (72.0 * PI);

pub const FRAME_LOG_CAPACITY: usize = 256;
pub const IGNORED_LOG_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct SimRobot {
    mode: RobotMode,
    readings: SensorReadings,
    left_velocity: i16,
    right_velocity: i16,
    last_tick: Instant,
    distance_mm: f64,
    angle_deg: f64,
    left_counts: f64,
    right_counts: f64,
    songs: [Option<Song>; 5],
    frames: HistoryBuffer<Vec<u8>, FRAME_LOG_CAPACITY>,
    ignored: HistoryBuffer<Command, IGNORED_LOG_CAPACITY>,
    attached: bool,
}

impl Default for SimRobot {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRobot {
    pub fn new() -> Self {
        let readings = SensorReadings {
            charging_state: Some(ChargingState::NotCharging),
            voltage_mv: Some(16_200),
            current_ma: Some(-180),
            temperature_c: Some(24),
            battery_charge_mah: Some(2_450),
            battery_capacity_mah: Some(2_696),
            ..Default::default()
        };

        Self {
            mode: RobotMode::Off,
            readings,
            left_velocity: 0,
            right_velocity: 0,
            last_tick: Instant::now(),
            distance_mm: 0.0,
            angle_deg: 0.0,
            left_counts: 0.0,
            right_counts: 0.0,
            songs: Default::default(),
            frames: HistoryBuffer::new(),
            ignored: HistoryBuffer::new(),
            attached: false,
        }
    }

    pub fn mode(&self) -> RobotMode {
        self.mode
    }

    /// The most recent frames written to the robot, oldest first.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.oldest_ordered().cloned().collect()
    }

    /// Recent frames that decoded but were not legal in the robot's mode.
    pub fn ignored(&self) -> Vec<Command> {
        self.ignored.oldest_ordered().cloned().collect()
    }

    /// (left, right) in mm/s
    pub fn wheel_velocities(&self) -> (i16, i16) {
        (self.left_velocity, self.right_velocity)
    }

    pub fn song(&self, number: u8) -> Option<&Song> {
        self.songs.get(number as usize).and_then(Option::as_ref)
    }

    /// Direct access for scripting sensor conditions.
    pub fn readings_mut(&mut self) -> &mut SensorReadings {
        &mut self.readings
    }

    /// Picks the robot up. In Safe mode the wheel drop sends it back to Passive.
    pub fn lift(&mut self) {
        let mut bumps = self.readings.bumps_and_wheel_drops.unwrap_or_default();
        bumps.wheel_drop_left = true;
        bumps.wheel_drop_right = true;
        self.readings.bumps_and_wheel_drops = Some(bumps);
        if self.mode == RobotMode::Safe {
            debug!("Sim: wheel drop in Safe mode, falling back to Passive");
            self.mode = RobotMode::Passive;
            self.set_wheels(0, 0);
        }
    }

    /// Feeds one command frame to the robot and returns its response bytes.
    pub fn receive(&mut self, frame: &[u8]) -> Vec<u8> {
        self.frames.write(frame.to_vec());
        self.advance();

        let command = match Command::decode(frame) {
            Ok(command) => command,
            Err(err) => {
                debug!("Sim: dropping undecodable frame {:?}: {}", frame, err);
                return Vec::new();
            }
        };

        let accepted = match mode::legality(&command) {
            Legality::Always => true,
            Legality::Modes(modes) => modes.contains(&self.mode),
        };
        if !accepted {
            debug!("Sim: ignoring {} in {} mode", command.name(), self.mode);
            self.ignored.write(command);
            return Vec::new();
        }

        trace!("Sim: {:?}", command);
        match command {
            Command::RequestSensor(packet) => return self.respond(packet),
            Command::Drive { velocity, radius } => self.drive(velocity, radius),
            Command::DirectDrive { left, right } => self.set_wheels(left, right),
            Command::DrivePwm { left, right } => {
                let scale = |pwm: i16| {
                    (i32::from(pwm) * i32::from(MAX_VELOCITY_MM_S) / i32::from(MAX_WHEEL_PWM)) as i16
                };
                self.set_wheels(scale(left), scale(right));
            }
            Command::Stop => self.set_wheels(0, 0),
            Command::Song(song) => {
                let slot = song.number() as usize;
                self.songs[slot] = Some(song);
            }
            Command::PlaySong(number) => {
                if self.song(number).is_some() {
                    self.readings.song_number = Some(number);
                    self.readings.song_playing = Some(true);
                }
            }
            other => {
                if let Some(next) = mode::mode_after(&other) {
                    if next != RobotMode::Safe && next != RobotMode::Full {
                        self.set_wheels(0, 0);
                    }
                    self.mode = next;
                }
            }
        }
        Vec::new()
    }

    fn drive(&mut self, velocity: i16, radius: Radius) {
        let (left, right) = match radius {
            Radius::Straight => (velocity, velocity),
            Radius::TurnClockwise => (velocity, -velocity),
            Radius::TurnCounterClockwise => (-velocity, velocity),
            Radius::Arc(r) => {
                let (v, r) = (f64::from(velocity), f64::from(r));
                let half = WHEEL_BASE_MM / 2.0;
                ((v * (r - half) / r) as i16, (v * (r + half) / r) as i16)
            }
        };
        self.set_wheels(left, right);
        self.readings.requested_velocity_mm_s = Some(velocity);
        self.readings.requested_radius_mm = Some(radius.to_wire());
    }

    fn set_wheels(&mut self, left: i16, right: i16) {
        self.advance();
        self.left_velocity = left;
        self.right_velocity = right;
        self.readings.requested_left_velocity_mm_s = Some(left);
        self.readings.requested_right_velocity_mm_s = Some(right);
    }

    fn advance(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;

        let left_mm = f64::from(self.left_velocity) * dt;
        let right_mm = f64::from(self.right_velocity) * dt;
        self.distance_mm += (left_mm + right_mm) / 2.0;
        self.angle_deg += ((right_mm - left_mm) / WHEEL_BASE_MM).to_degrees();
        self.left_counts += left_mm * COUNTS_PER_MM;
        self.right_counts += right_mm * COUNTS_PER_MM;
    }

    fn respond(&mut self, packet: PacketId) -> Vec<u8> {
        let mut readings = self.readings.clone();
        readings.oi_mode = Some(self.mode);
        readings.distance_mm = Some(self.distance_mm.round() as i16);
        readings.angle_deg = Some(self.angle_deg.round() as i16);
        // Encoders wrap at 16 bits
        readings.left_encoder_counts = Some(self.left_counts.rem_euclid(65_536.0) as u16);
        readings.right_encoder_counts = Some(self.right_counts.rem_euclid(65_536.0) as u16);

        // Distance and angle are reported since the last request that included them
        if packet.contains(PacketId::DISTANCE.id()) {
            self.distance_mm = 0.0;
        }
        if packet.contains(PacketId::ANGLE.id()) {
            self.angle_deg = 0.0;
        }

        SensorPacket { packet, readings }.encode_response()
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub robot: Arc<Mutex<SimRobot>>,
    /// Delay applied to every write, roughly what a 115200 baud link adds.
    pub latency: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            robot: Arc::new(Mutex::new(SimRobot::new())),
            latency: Duration::from_millis(1),
        }
    }
}

impl SimConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct SimTransport {
    robot: Arc<Mutex<SimRobot>>,
    pending: VecDeque<u8>,
    latency: Duration,
    open: bool,
}

impl SimTransport {
    pub fn robot(&self) -> Arc<Mutex<SimRobot>> {
        Arc::clone(&self.robot)
    }
}

impl Transport for SimTransport {
    type Config = SimConfig;

    async fn open(config: &SimConfig) -> Result<Self, TransportError> {
        {
            let mut robot = config.robot.lock().map_err(|_| TransportError::IoFault)?;
            if robot.attached {
                return Err(TransportError::IoFault);
            }
            robot.attached = true;
        }

        debug!("Simulated robot attached");
        Ok(Self {
            robot: Arc::clone(&config.robot),
            pending: VecDeque::new(),
            latency: config.latency,
            open: true,
        })
    }

    async fn write(&mut self, bytes: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::IoFault);
        }
        let response = {
            let mut robot = self.robot.lock().map_err(|_| TransportError::IoFault)?;
            robot.receive(bytes)
        };
        self.pending.extend(response);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(())
    }

    async fn read(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::IoFault);
        }
        if self.pending.len() < len {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout);
        }
        Ok(self.pending.drain(..len).collect())
    }

    async fn discard_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.pending.clear();
        if let Ok(mut robot) = self.robot.lock() {
            robot.attached = false;
        }
        debug!("Simulated robot detached");
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.close();
    }
}
