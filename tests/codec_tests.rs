use oibus::codec::*;
use oibus::mode::RobotMode;

#[test]
fn test_drive_encoding() {
    assert_eq!(Command::drive(200, 0).encode(), vec![137, 0, 200, 0x80, 0x00]);
    assert_eq!(Command::drive(-200, 500).encode(), vec![137, 0xFF, 0x38, 0x01, 0xF4]);
}

#[test]
fn test_drive_clamps_and_spins() {
    // Out-of-range values are clamped, not rejected
    assert_eq!(Command::drive(1000, 3000).encode(), vec![137, 0x01, 0xF4, 0x07, 0xD0]);

    // Zero velocity with a radius turns in place
    assert_eq!(Command::drive(0, 1).encode(), vec![137, 0x01, 0xF4, 0x00, 0x01]);
    assert_eq!(Command::drive(0, -5).encode(), vec![137, 0x01, 0xF4, 0xFF, 0xFF]);
    assert_eq!(
        Command::drive(0, 250),
        Command::Drive { velocity: 500, radius: Radius::TurnCounterClockwise }
    );
}

#[test]
fn test_direct_drive_right_wheel_first() {
    assert_eq!(Command::direct_drive(200, 200).encode(), vec![145, 0, 200, 0, 200]);
    assert_eq!(
        Command::direct_drive(-100, 300).encode(),
        vec![145, 0x01, 0x2C, 0xFF, 0x9C]
    );
    assert_eq!(
        Command::direct_drive(-900, 900),
        Command::DirectDrive { left: -500, right: 500 }
    );
}

#[test]
fn test_stop_is_zero_direct_drive() {
    assert_eq!(Command::Stop.encode(), vec![145, 0, 0, 0, 0]);
}

#[test]
fn test_drive_pwm_clamps() {
    assert_eq!(
        Command::drive_pwm(300, -300),
        Command::DrivePwm { left: 255, right: -255 }
    );
    assert_eq!(Command::drive_pwm(255, -255).encode(), vec![146, 0xFF, 0x01, 0x00, 0xFF]);
}

#[test]
fn test_mode_opcodes() {
    assert_eq!(Command::SetMode(RobotMode::Passive).encode(), vec![128]);
    assert_eq!(Command::SetMode(RobotMode::Safe).encode(), vec![131]);
    assert_eq!(Command::SetMode(RobotMode::Full).encode(), vec![132]);
    assert_eq!(Command::SetMode(RobotMode::Off).encode(), vec![173]);
    assert_eq!(Command::PowerDown.encode(), vec![133]);
    assert_eq!(Command::Clean.encode(), vec![135]);
    assert_eq!(Command::SeekDock.encode(), vec![143]);
}

#[test]
fn test_actuator_encoding() {
    let motors = MotorFlags { main_brush: true, vacuum: true, ..Default::default() };
    assert_eq!(Command::Motors(motors).encode(), vec![138, 6]);

    assert_eq!(Command::pwm_motors(-127, 64, 200).encode(), vec![144, 0x81, 64, 127]);

    let leds = LedState {
        indicators: LedIndicators { debris: true, dock: true, ..Default::default() },
        power_color: 128,
        power_intensity: 255,
    };
    assert_eq!(Command::Leds(leds).encode(), vec![139, 0b101, 128, 255]);
}

#[test]
fn test_song_encoding() {
    let song = Song::new(1, &[Note::new(60, 32), Note::new(64, 16)]).unwrap();
    assert_eq!(song.duration_ticks(), 48);
    assert_eq!(Command::Song(song).encode(), vec![140, 1, 2, 60, 32, 64, 16]);

    assert_eq!(Command::play_song(9).encode(), vec![141, 4]);
}

#[test]
fn test_song_limits() {
    assert!(Song::new(0, &[]).is_err());

    let notes = vec![Note::new(72, 8); 17];
    assert_eq!(
        Song::new(0, &notes),
        Err(ProtocolError::InvalidArgument("a song holds at most 16 notes"))
    );

    let song = Song::new(7, &notes[..16]).unwrap();
    assert_eq!(song.number(), 4);
    assert_eq!(song.notes().len(), 16);
}

#[test]
fn test_sensor_and_baud_requests() {
    assert_eq!(Command::RequestSensor(PacketId::GROUP_ALL).encode(), vec![142, 100]);
    assert_eq!(Command::RequestSensor(PacketId::GROUP_ALL).response_len(), 80);
    assert_eq!(Command::Baud(BaudRate::Baud57600).encode(), vec![129, 10]);
    assert_eq!(BaudRate::from_bits_per_second(115_200), Some(BaudRate::Baud115200));
    assert_eq!(BaudRate::from_bits_per_second(12345), None);
}

#[test]
fn test_schedule_and_clock_encoding() {
    let mut schedule = CleaningSchedule::new();
    schedule.set(Weekday::Monday, 9, 30).set(Weekday::Friday, 17, 5);

    assert_eq!(
        Command::Schedule(schedule).encode(),
        vec![167, 0b0010_0010, 0, 0, 9, 30, 0, 0, 0, 0, 0, 0, 17, 5, 0, 0]
    );
    assert_eq!(
        Command::set_clock(Weekday::Wednesday, 14, 45).encode(),
        vec![168, 3, 14, 45]
    );
    assert_eq!(
        Command::set_clock(Weekday::Sunday, 25, 61),
        Command::SetClock { day: Weekday::Sunday, hour: 1, minute: 1 }
    );
}

#[test]
fn test_command_decode() {
    let commands = [
        Command::SetMode(RobotMode::Safe),
        Command::drive(-300, 750),
        Command::direct_drive(-100, 300),
        Command::pwm_motors(-20, 30, 40),
        Command::Song(Song::new(2, &[Note::new(67, 10)]).unwrap()),
        Command::RequestSensor(PacketId::VOLTAGE),
        Command::set_clock(Weekday::Saturday, 8, 0),
    ];
    for command in commands {
        assert_eq!(Command::decode(&command.encode()), Ok(command));
    }
}

#[test]
fn test_command_decode_errors() {
    assert_eq!(Command::decode(&[200]), Err(ProtocolError::UnknownOpcode(200)));
    assert_eq!(
        Command::decode(&[145, 0, 0]),
        Err(ProtocolError::Truncated { opcode: 145, expected: 4, actual: 2 })
    );
    assert_eq!(Command::decode(&[142, 77]), Err(ProtocolError::UnknownPacket(77)));
}

#[test]
fn test_decode_battery_group() {
    let bytes = [2, 0x3E, 0x80, 0xFE, 0x0C, 0xE7, 0x0A, 0x28, 0x0B, 0xB8];
    let packet = decode(&bytes, PacketId::GROUP_3).unwrap();
    let r = &packet.readings;

    assert_eq!(r.charging_state, Some(ChargingState::FullCharging));
    assert_eq!(r.voltage_mv, Some(16_000));
    assert_eq!(r.current_ma, Some(-500));
    assert_eq!(r.temperature_c, Some(-25));
    assert_eq!(r.battery_charge_mah, Some(2600));
    assert_eq!(r.battery_capacity_mah, Some(3000));
    // Nothing outside the group is filled in
    assert_eq!(r.distance_mm, None);
    assert_eq!(r.oi_mode, None);
}

#[test]
fn test_decode_single_packets() {
    let mode = decode(&[2], PacketId::OI_MODE).unwrap();
    assert_eq!(mode.readings.oi_mode, Some(RobotMode::Safe));

    let distance = decode(&[0xFF, 0x9C], PacketId::DISTANCE).unwrap();
    assert_eq!(distance.readings.distance_mm, Some(-100));

    let bumps = decode(&[0b11], PacketId::BUMPS_AND_WHEEL_DROPS).unwrap();
    let bumps = bumps.readings.bumps_and_wheel_drops.unwrap();
    assert!(bumps.bump_left && bumps.bump_right);
    assert!(!bumps.wheel_drop_left);
}

#[test]
fn test_decode_rejects_wrong_length() {
    assert_eq!(
        decode(&[0x3E], PacketId::VOLTAGE),
        Err(ProtocolError::Malformed {
            packet: 22,
            reason: MalformedReason::Length { expected: 2, actual: 1 },
        })
    );
    assert!(decode(&[0; 79], PacketId::GROUP_ALL).is_err());
}

#[test]
fn test_decode_rejects_out_of_range_values() {
    assert_eq!(
        decode(&[7], PacketId::OI_MODE),
        Err(ProtocolError::Malformed {
            packet: 35,
            reason: MalformedReason::OutOfRange { field: "oi_mode", value: 7 },
        })
    );

    let bytes = [9, 0x3E, 0x80, 0, 0, 20, 0, 0, 0, 0];
    assert!(matches!(
        decode(&bytes, PacketId::GROUP_3),
        Err(ProtocolError::Malformed {
            packet: 3,
            reason: MalformedReason::OutOfRange { field: "charging_state", .. },
        })
    ));
}

#[test]
fn test_robot_side_encoding_decodes_back() {
    let readings = SensorReadings {
        voltage_mv: Some(14_200),
        oi_mode: Some(RobotMode::Full),
        light_bump_right_signal: Some(1234),
        stasis: Some(true),
        ..Default::default()
    };
    let packet = SensorPacket { packet: PacketId::GROUP_ALL, readings };
    let bytes = packet.encode_response();
    assert_eq!(bytes.len(), 80);

    let decoded = decode(&bytes, PacketId::GROUP_ALL).unwrap();
    assert_eq!(decoded.readings.voltage_mv, Some(14_200));
    assert_eq!(decoded.readings.oi_mode, Some(RobotMode::Full));
    assert_eq!(decoded.readings.light_bump_right_signal, Some(1234));
    assert_eq!(decoded.readings.stasis, Some(true));
    assert_eq!(decoded.readings.wall, Some(false));
}

#[test]
fn test_group_membership() {
    assert!(PacketId::GROUP_ALL.contains(35));
    assert!(PacketId::GROUP_5.contains(35));
    assert!(!PacketId::GROUP_3.contains(35));
    assert!(PacketId::GROUP_3.is_group());
    assert!(!PacketId::VOLTAGE.is_group());
}
