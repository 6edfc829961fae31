//! Host engine against the simulated controller, without any I/O

use std::time::{Duration, Instant};

use ayabd_core::pattern::{PatternQueue, PatternSource};
use ayabd_core::protocol::{
    unpack_row, AyabEngine, EngineOutput, HostMessage, KnitRow, ProtocolError, RowSource,
    SessionState, SimulatedDevice,
};
use image::{GrayImage, Luma};
use pretty_assertions::assert_eq;

/// Shuttle bytes between engine and device until both are quiet.
/// Returns the host frames sent and the non-transmit outputs.
fn pump(
    engine: &mut AyabEngine,
    device: &mut SimulatedDevice,
    now: Instant,
    rows: &mut dyn RowSource,
) -> (Vec<Vec<u8>>, Vec<EngineOutput>) {
    let mut frames = Vec::new();
    let mut events = Vec::new();
    loop {
        let mut progressed = false;
        while let Some(output) = engine.poll_output() {
            progressed = true;
            match output {
                EngineOutput::Transmit(bytes) => {
                    device.receive(&bytes);
                    frames.push(bytes);
                }
                other => events.push(other),
            }
        }
        if device.has_output() {
            progressed = true;
            let bytes = device.take_output();
            engine.handle_input(&bytes, now, rows);
        }
        if !progressed {
            return (frames, events);
        }
    }
}

fn diagonal(rows: u32, width: usize) -> impl FnMut(u32) -> Option<KnitRow> {
    move |n| {
        (n < rows).then(|| {
            let mut row = KnitRow::new(width);
            row.set(n as usize % width, true);
            row
        })
    }
}

#[test]
fn test_full_job_with_simulated_device() {
    let now = Instant::now();
    let mut engine = AyabEngine::new();
    let mut device = SimulatedDevice::new();
    let mut rows = diagonal(10, 20);

    engine.transport_connected();
    assert_eq!(engine.state(), SessionState::Connected);
    engine.start_job(90, 20, now).unwrap();

    let (frames, events) = pump(&mut engine, &mut device, now, &mut rows);
    assert_eq!(frames, vec![vec![0x03], vec![0x01, 90, 109]]);
    assert!(events.is_empty());
    assert_eq!(engine.state(), SessionState::Knitting);
    assert!(device.is_knitting());
    assert_eq!(engine.firmware().unwrap().api_version, 4);

    for n in 0..10u32 {
        assert!(device.request_row());
        let (frames, events) = pump(&mut engine, &mut device, now, &mut rows);
        assert!(events.is_empty());
        assert_eq!(frames.len(), 1);

        let Some((HostMessage::LineResponse(line), 29)) = HostMessage::decode(&frames[0]) else {
            panic!("not a line response: {:02X?}", frames[0]);
        };
        assert_eq!(line.row_number, n as u8);
        assert!(!line.last_line);
        let knitted = unpack_row(&line.needles, 90, 20);
        assert_eq!(knitted.needles().iter().filter(|b| **b).count(), 1);
        assert!(knitted.get(n as usize));
    }

    // one request more than there are rows
    assert!(device.request_row());
    let (frames, events) = pump(&mut engine, &mut device, now, &mut rows);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].len(), 29);
    assert_eq!(frames[0][27], 0x01);
    assert!(matches!(events[..], [EngineOutput::JobCompleted { rows: 10 }]));

    assert_eq!(engine.state(), SessionState::Ready);
    // the request answered with the end frame counts too
    assert_eq!(engine.row_count(), 11);
    assert!(!device.is_knitting());
    assert_eq!(device.lines_received(), 11);
}

#[test]
fn test_full_job_from_pattern_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("diag.png");
    // 10 rows long, 20 needles wide
    GrayImage::from_fn(10, 20, |x, y| if x == y { Luma([0]) } else { Luma([255]) })
        .save(&path)
        .unwrap();
    let mut queue = PatternQueue::new();
    queue
        .append(PatternSource::File {
            path,
            web_url: String::new(),
        })
        .unwrap();
    assert_eq!(queue.width(), 20);
    assert_eq!(queue.total_length(), 10);

    let now = Instant::now();
    let mut engine = AyabEngine::new();
    let mut device = SimulatedDevice::new();
    engine.transport_connected();
    engine.start_job(90, 20, now).unwrap();
    pump(&mut engine, &mut device, now, &mut queue);
    assert_eq!(engine.state(), SessionState::Knitting);

    for n in 0..10usize {
        assert!(device.request_row());
        let (frames, _) = pump(&mut engine, &mut device, now, &mut queue);
        let Some((HostMessage::LineResponse(line), 29)) = HostMessage::decode(&frames[0]) else {
            panic!("not a line response: {:02X?}", frames[0]);
        };
        assert!(!line.last_line);
        let knitted = unpack_row(&line.needles, 90, 20);
        let active: Vec<usize> = (0..20).filter(|i| knitted.get(*i)).collect();
        assert_eq!(active, vec![n]);
    }

    assert!(device.request_row());
    let (frames, events) = pump(&mut engine, &mut device, now, &mut queue);
    assert_eq!(frames[0][27], 0x01);
    assert!(matches!(events[..], [EngineOutput::JobCompleted { rows: 10 }]));
    assert!(queue.end_of_pattern());
    assert_eq!(queue.cursor_position(), 10);
}

#[test]
fn test_stray_hash_before_line_requests() {
    let now = Instant::now();
    let mut engine = AyabEngine::new();
    let mut device = SimulatedDevice::new();
    let mut rows = diagonal(20, 20);

    engine.transport_connected();
    engine.start_job(90, 20, now).unwrap();
    pump(&mut engine, &mut device, now, &mut rows);

    engine.handle_input(b"#", now, &mut rows);
    let mut answered = 0;
    for n in 0..12u8 {
        engine.handle_input(&[0x82, n], now, &mut rows);
        while let Some(output) = engine.poll_output() {
            if let EngineOutput::Transmit(frame) = output {
                assert_eq!(frame[1], n);
                answered += 1;
            }
        }
    }
    assert_eq!(answered, 12);
}

#[test]
fn test_second_job_restarts_row_numbers() {
    let now = Instant::now();
    let mut engine = AyabEngine::new();
    let mut device = SimulatedDevice::new();
    let mut rows = diagonal(2, 10);

    engine.transport_connected();
    engine.start_job(95, 10, now).unwrap();
    pump(&mut engine, &mut device, now, &mut rows);
    for _ in 0..3 {
        device.request_row();
        pump(&mut engine, &mut device, now, &mut rows);
    }
    assert_eq!(engine.state(), SessionState::Ready);

    let mut rows = diagonal(5, 10);
    engine.start_job(95, 10, now).unwrap();
    pump(&mut engine, &mut device, now, &mut rows);
    assert_eq!(engine.state(), SessionState::Knitting);
    assert_eq!(engine.row_count(), 0);
    assert_eq!(engine.next_request_row(), 0);
}

#[test]
fn test_firmware_version_gate() {
    let now = Instant::now();
    let mut engine = AyabEngine::new();
    engine.transport_connected();
    engine.start_job(90, 20, now).unwrap();
    while engine.poll_output().is_some() {}

    let mut rows = diagonal(1, 20);
    engine.handle_input(&[0x43, 5, 1, 0], now, &mut rows);

    let Some(EngineOutput::JobFailed(error)) = engine.poll_output() else {
        panic!("job should fail");
    };
    assert!(matches!(
        error,
        ProtocolError::VersionMismatch {
            expected: 4,
            actual: 5
        }
    ));
    // no START after a rejected version
    assert!(engine.poll_output().is_none());
    assert_eq!(engine.state(), SessionState::Connected);
}

#[test]
fn test_unanswered_info_times_out() {
    let now = Instant::now();
    let mut engine = AyabEngine::with_timing(Duration::from_secs(1), Duration::from_millis(100));
    engine.transport_connected();
    engine.start_job(90, 20, now).unwrap();
    while engine.poll_output().is_some() {}

    let deadline = engine.poll_timeout().unwrap();
    assert_eq!(deadline, now + Duration::from_secs(1));
    engine.handle_timeout(now + Duration::from_millis(500));
    assert!(engine.poll_output().is_none());

    engine.handle_timeout(deadline);
    assert!(matches!(
        engine.poll_output(),
        Some(EngineOutput::JobFailed(ProtocolError::Timeout))
    ));
    assert!(engine.poll_timeout().is_none());
    // another attempt is possible right away
    engine.start_job(90, 20, deadline).unwrap();
}

#[test]
fn test_garbage_between_messages() {
    let now = Instant::now();
    let mut engine = AyabEngine::new();
    let mut device = SimulatedDevice::new();
    let mut rows = diagonal(3, 20);

    engine.transport_connected();
    engine.start_job(90, 20, now).unwrap();
    pump(&mut engine, &mut device, now, &mut rows);

    // noise, a debug line and a state indication ahead of the row request
    let mut input = vec![0x00, 0x17, 0xFF];
    input.extend_from_slice(b"#hello\r\n");
    input.extend_from_slice(&[0x84, 1, 0x01, 0x02, 0x03, 0x04, 1, 42]);
    input.extend_from_slice(&[0x82, 0]);
    engine.handle_input(&input, now, &mut rows);

    let Some(EngineOutput::Transmit(frame)) = engine.poll_output() else {
        panic!("row expected");
    };
    assert_eq!(frame[0], 0x42);
    let machine = engine.machine_state().unwrap();
    assert!(machine.ready);
    assert_eq!(machine.hall_left, 0x0102);
    assert_eq!(machine.needle, 42);
}

#[test]
fn test_connection_loss_while_knitting() {
    let now = Instant::now();
    let mut engine = AyabEngine::new();
    let mut device = SimulatedDevice::new();
    let mut rows = diagonal(3, 20);

    engine.transport_connected();
    engine.start_job(90, 20, now).unwrap();
    pump(&mut engine, &mut device, now, &mut rows);

    engine.transport_lost();
    assert_eq!(engine.state(), SessionState::Offline);
    assert!(matches!(
        engine.poll_output(),
        Some(EngineOutput::JobFailed(ProtocolError::ConnectionLost))
    ));
    assert!(matches!(
        engine.start_job(90, 20, now),
        Err(ProtocolError::NotConnected)
    ));
}

#[test]
fn test_restart_sequence() {
    let now = Instant::now();
    let settle = Duration::from_millis(100);
    let mut engine = AyabEngine::with_timing(Duration::from_secs(1), settle);
    engine.transport_connected();

    engine.restart(now);
    assert!(matches!(
        engine.poll_output(),
        Some(EngineOutput::SetResetLine(true))
    ));
    assert_eq!(engine.state(), SessionState::Offline);
    assert!(engine.is_resetting());
    assert!(matches!(
        engine.start_job(90, 20, now),
        Err(ProtocolError::NotConnected)
    ));

    engine.handle_timeout(now + settle);
    assert!(matches!(
        engine.poll_output(),
        Some(EngineOutput::SetResetLine(false))
    ));
    engine.handle_timeout(now + settle * 2);
    assert!(matches!(
        engine.poll_output(),
        Some(EngineOutput::RestartComplete)
    ));
    assert_eq!(engine.state(), SessionState::Connected);
    assert!(!engine.is_resetting());
}
