mod common;

use common::{fast_settings, start_dispatcher, MockHandle};
use oibus::codec::{BaudRate, Command, MalformedReason, PacketId, ProtocolError};
use oibus::dispatcher::{CommandOutcome, ConnectionStatus, DispatchError, DispatcherHandle};
use oibus::mode::{LinkState, RobotMode, StateError};
use oibus::transport::TransportError;
use std::time::Duration;

async fn safe_link(mock: &MockHandle) -> DispatcherHandle {
    let handle = start_dispatcher(mock, fast_settings()).await;
    handle.execute(Command::SetMode(RobotMode::Safe)).await.unwrap();
    handle
}

async fn wait_for_status(handle: &DispatcherHandle, expected: ConnectionStatus) {
    for _ in 0..100 {
        if handle.status() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("status never became {expected:?}, still {:?}", handle.status());
}

#[tokio::test]
async fn test_safe_from_disconnected_sends_start_first() {
    let mock = MockHandle::new();
    let handle = start_dispatcher(&mock, fast_settings()).await;
    assert_eq!(handle.link_state(), LinkState::Disconnected);

    let outcome = handle.execute(Command::SetMode(RobotMode::Safe)).await.unwrap();
    assert_eq!(outcome, CommandOutcome::Sent { frame: vec![131] });
    assert_eq!(mock.writes(), vec![vec![128], vec![131]]);
    assert_eq!(handle.link_state(), LinkState::Mode(RobotMode::Safe));
}

#[tokio::test]
async fn test_commands_written_in_submission_order() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;

    let first = handle.submit(Command::direct_drive(100, 100));
    let second = handle.submit(Command::Stop);
    let third = handle.submit(Command::drive(50, 0));
    assert!(first.seq() < second.seq() && second.seq() < third.seq());

    third.wait().await.unwrap();
    first.wait().await.unwrap();
    second.wait().await.unwrap();

    assert_eq!(
        mock.writes()[2..].to_vec(),
        vec![
            vec![145, 0, 100, 0, 100],
            vec![145, 0, 0, 0, 0],
            vec![137, 0, 50, 0x80, 0x00],
        ]
    );
    assert_eq!(handle.stats().commands_sent, 5);
    assert_eq!(handle.stats().bytes_written, 1 + 1 + 5 + 5 + 5);
}

#[tokio::test]
async fn test_fifo_across_caller_tasks() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;

    let callers: Vec<_> = (1..=4i16)
        .map(|caller| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut submitted = Vec::new();
                for step in 1..=5i16 {
                    let command = Command::direct_drive(caller * 100, step);
                    let pending = handle.submit(command.clone());
                    submitted.push((pending.seq(), command.encode()));
                    pending.wait().await.unwrap();
                    tokio::task::yield_now().await;
                }
                submitted
            })
        })
        .collect();

    let mut submitted = Vec::new();
    for caller in callers {
        let own = caller.await.unwrap();
        // A caller's own commands keep their order
        assert!(own.windows(2).all(|pair| pair[0].0 < pair[1].0));
        submitted.extend(own);
    }
    submitted.sort_by_key(|(seq, _)| *seq);

    let expected: Vec<Vec<u8>> = submitted.into_iter().map(|(_, frame)| frame).collect();
    assert_eq!(mock.writes()[2..].to_vec(), expected);
    assert_eq!(handle.stats().commands_sent, 2 + 20);
}

#[tokio::test]
async fn test_illegal_command_rejected_without_write() {
    let mock = MockHandle::new();
    let handle = start_dispatcher(&mock, fast_settings()).await;

    let result = handle.execute(Command::Stop).await;
    assert_eq!(
        result,
        Err(DispatchError::State(StateError::IllegalInMode {
            command: "Stop",
            state: LinkState::Disconnected,
        }))
    );
    assert!(mock.writes().is_empty());
    assert_eq!(handle.stats().commands_rejected, 1);
    assert_eq!(handle.status(), ConnectionStatus::Active);
}

#[tokio::test]
async fn test_stop_oi_accepted_while_disconnected() {
    let mock = MockHandle::new();
    let handle = start_dispatcher(&mock, fast_settings()).await;

    let outcome = handle.execute(Command::SetMode(RobotMode::Off)).await.unwrap();
    assert_eq!(outcome, CommandOutcome::Sent { frame: vec![173] });
    assert_eq!(mock.writes(), vec![vec![173]]);
    assert_eq!(handle.link_state(), LinkState::Mode(RobotMode::Off));

    // And again from Off
    handle.execute(Command::SetMode(RobotMode::Off)).await.unwrap();
    assert_eq!(mock.writes(), vec![vec![173], vec![173]]);
}

#[tokio::test]
async fn test_drive_rejected_in_passive() {
    let mock = MockHandle::new();
    let handle = start_dispatcher(&mock, fast_settings()).await;
    handle.execute(Command::SetMode(RobotMode::Passive)).await.unwrap();

    assert!(matches!(
        handle.execute(Command::direct_drive(200, 200)).await,
        Err(DispatchError::State(_))
    ));
    assert_eq!(mock.writes(), vec![vec![128]]);
}

#[tokio::test]
async fn test_off_then_full_resends_start() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;

    handle.execute(Command::SetMode(RobotMode::Off)).await.unwrap();
    assert_eq!(handle.link_state(), LinkState::Mode(RobotMode::Off));

    handle.execute(Command::SetMode(RobotMode::Full)).await.unwrap();
    assert_eq!(mock.writes()[2..].to_vec(), vec![vec![173], vec![128], vec![132]]);
    assert_eq!(handle.link_state(), LinkState::Mode(RobotMode::Full));
}

#[tokio::test]
async fn test_drive_refused_after_off() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;

    handle.execute(Command::direct_drive(200, 200)).await.unwrap();
    handle.execute(Command::SetMode(RobotMode::Off)).await.unwrap();
    assert_eq!(
        handle.execute(Command::direct_drive(200, 200)).await,
        Err(DispatchError::State(StateError::IllegalInMode {
            command: "DirectDrive",
            state: LinkState::Mode(RobotMode::Off),
        }))
    );
    assert_eq!(
        mock.writes(),
        vec![vec![128], vec![131], vec![145, 0, 200, 0, 200], vec![173]]
    );
}

#[tokio::test]
async fn test_transient_faults_are_retried() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;

    mock.fail_writes([TransportError::Timeout, TransportError::IoFault]);
    let outcome = handle.execute(Command::direct_drive(200, 200)).await.unwrap();
    assert_eq!(outcome, CommandOutcome::Sent { frame: vec![145, 0, 200, 0, 200] });

    // Two failed attempts and the one that went through
    assert_eq!(mock.writes().len(), 2 + 3);
    assert_eq!(handle.stats().retries, 2);
    assert_eq!(mock.discards(), 2);
    assert_eq!(handle.status(), ConnectionStatus::Active);
    assert_eq!(handle.link_state(), LinkState::Mode(RobotMode::Safe));
}

#[tokio::test]
async fn test_recovered_fault_keeps_assumed_mode() {
    let mock = MockHandle::new();
    let handle = start_dispatcher(&mock, fast_settings()).await;
    handle.execute(Command::SetMode(RobotMode::Full)).await.unwrap();

    mock.fail_writes([TransportError::Timeout]);
    mock.queue_read(&[0x3E, 0x80]);
    handle.execute(Command::RequestSensor(PacketId::VOLTAGE)).await.unwrap();

    assert_eq!(handle.stats().retries, 1);
    assert_eq!(handle.link_state(), LinkState::Mode(RobotMode::Full));
    assert_eq!(handle.status(), ConnectionStatus::Active);
}

#[tokio::test]
async fn test_exhausted_retries_invalidate_connection() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;

    mock.fail_writes([TransportError::IoFault; 4]);
    let doomed = handle.submit(Command::direct_drive(200, 200));
    let queued_one = handle.submit(Command::Stop);
    let queued_two = handle.submit(Command::RequestSensor(PacketId::VOLTAGE));

    assert_eq!(
        doomed.wait().await,
        Err(DispatchError::TransportExhausted { attempts: 4, last: TransportError::IoFault })
    );
    assert_eq!(queued_one.wait().await, Err(DispatchError::ConnectionLost));
    assert_eq!(queued_two.wait().await, Err(DispatchError::ConnectionLost));

    assert_eq!(mock.writes().len(), 2 + 4);
    assert_eq!(mock.closes(), 1);
    assert_eq!(handle.link_state(), LinkState::Disconnected);
    assert!(matches!(handle.status(), ConnectionStatus::Invalidated { .. }));
    assert_eq!(handle.stats().commands_failed, 3);
}

#[tokio::test]
async fn test_missing_device_is_not_retried() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;

    mock.fail_writes([TransportError::NotFound]);
    assert_eq!(
        handle.execute(Command::Stop).await,
        Err(DispatchError::Transport(TransportError::NotFound))
    );
    assert_eq!(mock.writes().len(), 3);
    assert_eq!(handle.stats().retries, 0);
    assert_eq!(handle.link_state(), LinkState::Disconnected);
    assert!(matches!(handle.status(), ConnectionStatus::Invalidated { .. }));
}

#[tokio::test]
async fn test_cancel_before_dispatch() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;
    mock.set_write_delay(Duration::from_millis(40));

    let slow = handle.submit(Command::direct_drive(100, 100));
    let withdrawn = handle.submit(Command::drive(300, 0));
    assert!(withdrawn.cancel());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(slow.is_started());
    assert!(!slow.cancel());

    assert!(slow.wait().await.is_ok());
    assert_eq!(withdrawn.wait().await, Err(DispatchError::Cancelled));
    assert_eq!(mock.writes().len(), 3);
    assert_eq!(handle.stats().commands_cancelled, 1);
}

#[tokio::test]
async fn test_spacing_between_writes() {
    let mock = MockHandle::new();
    let mut settings = fast_settings();
    settings.command_spacing = Duration::from_millis(30);
    settings.mode_settle = Duration::from_millis(60);
    let handle = start_dispatcher(&mock, settings).await;

    handle.execute(Command::SetMode(RobotMode::Safe)).await.unwrap();
    handle.execute(Command::direct_drive(100, 100)).await.unwrap();
    handle.execute(Command::Stop).await.unwrap();

    let times = mock.write_times();
    assert_eq!(times.len(), 4);
    // Start and Safe need the longer settle time
    assert!(times[1] - times[0] >= Duration::from_millis(60));
    assert!(times[2] - times[1] >= Duration::from_millis(60));
    assert!(times[3] - times[2] >= Duration::from_millis(30));
}

#[tokio::test]
async fn test_sensor_response_reconciles_mode() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;

    mock.queue_read(&[3]);
    let outcome = handle.execute(Command::RequestSensor(PacketId::OI_MODE)).await.unwrap();
    match outcome {
        CommandOutcome::Sensor(packet) => {
            assert_eq!(packet.packet, PacketId::OI_MODE);
            assert_eq!(packet.readings.oi_mode, Some(RobotMode::Full));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(handle.link_state(), LinkState::Mode(RobotMode::Full));
}

#[tokio::test]
async fn test_malformed_response_discards_without_retry() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;

    mock.queue_read(&[9]);
    assert_eq!(
        handle.execute(Command::RequestSensor(PacketId::OI_MODE)).await,
        Err(DispatchError::Protocol(ProtocolError::Malformed {
            packet: 35,
            reason: MalformedReason::OutOfRange { field: "oi_mode", value: 9 },
        }))
    );
    assert_eq!(mock.writes().len(), 3);
    assert_eq!(mock.discards(), 1);
    assert_eq!(handle.status(), ConnectionStatus::Active);
    assert_eq!(handle.link_state(), LinkState::Mode(RobotMode::Safe));
}

#[tokio::test]
async fn test_read_timeout_retries_request() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;

    mock.queue_read_error(TransportError::Timeout);
    mock.queue_read(&[0x3E, 0x80]);
    let outcome = handle.execute(Command::RequestSensor(PacketId::VOLTAGE)).await.unwrap();
    assert!(matches!(
        outcome,
        CommandOutcome::Sensor(ref packet) if packet.readings.voltage_mv == Some(16_000)
    ));
    assert_eq!(mock.writes()[2..].to_vec(), vec![vec![142, 22], vec![142, 22]]);
    assert_eq!(handle.stats().retries, 1);
}

#[tokio::test]
async fn test_baud_switches_host_side() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;

    handle.execute(Command::Baud(BaudRate::Baud57600)).await.unwrap();
    assert_eq!(mock.writes()[2], vec![129, 10]);
    assert_eq!(mock.baud_changes(), vec![57_600]);
}

#[tokio::test]
async fn test_reconnect_after_invalidation() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;
    mock.fail_writes([TransportError::NotFound]);
    assert!(handle.execute(Command::Stop).await.is_err());

    handle.reconnect().await.unwrap();
    assert_eq!(handle.status(), ConnectionStatus::Active);
    assert_eq!(handle.link_state(), LinkState::Disconnected);
    assert_eq!(mock.opens(), 2);
    assert_eq!(handle.stats().reconnects, 1);

    handle.execute(Command::SetMode(RobotMode::Safe)).await.unwrap();
    assert_eq!(mock.writes()[3..].to_vec(), vec![vec![128], vec![131]]);
}

#[tokio::test]
async fn test_failed_reconnect_stays_invalidated() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;
    mock.fail_opens([TransportError::PermissionDenied]);

    assert_eq!(
        handle.reconnect().await,
        Err(DispatchError::Transport(TransportError::PermissionDenied))
    );
    assert!(matches!(handle.status(), ConnectionStatus::Invalidated { .. }));
    assert_eq!(handle.execute(Command::Stop).await, Err(DispatchError::ConnectionLost));
}

#[tokio::test]
async fn test_shutdown_closes_transport() {
    let mock = MockHandle::new();
    let handle = safe_link(&mock).await;

    handle.shutdown();
    wait_for_status(&handle, ConnectionStatus::Closed).await;

    assert_eq!(mock.closes(), 1);
    assert_eq!(handle.link_state(), LinkState::Disconnected);
    assert_eq!(handle.execute(Command::Stop).await, Err(DispatchError::ConnectionLost));
    assert!(handle.is_closed());
}
