//! Integration tests for the input session lifecycle against the mock driver.

#![cfg(feature = "mock")]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rust_midi::driver::mock::{MockDriver, MockOperation};
use rust_midi::receiver::ReceivedEvent;
use rust_midi::{
    DeviceSession, DriverStatus, MidiError, RecordingReceiver, SessionState, ShortMessage,
};

fn open_session(driver: &Arc<MockDriver>) -> (DeviceSession, Arc<RecordingReceiver>) {
    let receiver = Arc::new(RecordingReceiver::new());
    let session = DeviceSession::open_device(driver.clone(), 0, receiver.clone())
        .expect("mock input device should open");
    (session, receiver)
}

/// Poll `condition` for up to two seconds.
fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn sysex(index: usize) -> Vec<u8> {
    vec![0xF0, 0x7D, (index & 0x7F) as u8, 0xF7]
}

#[test]
fn test_reclamation_follows_submission_order() {
    let driver = Arc::new(MockDriver::new());
    let (mut session, receiver) = open_session(&driver);
    let handle = session.handle().unwrap();

    let ids: Vec<_> = (0..8).map(|_| session.add_sysex_buffer(32).unwrap()).collect();
    session.start_streaming().unwrap();

    for index in 0..5 {
        assert!(driver.complete_input(handle, &sysex(index), index as u32));
    }
    session.stop_streaming().unwrap();

    // Completed buffers, then the ones returned by the reset, oldest first.
    assert_eq!(driver.unprepared_log(), ids);
    assert_eq!(
        receiver.long_messages(),
        (0..5).map(sysex).collect::<Vec<_>>()
    );
}

#[test]
fn test_registry_empty_after_stop() {
    let driver = Arc::new(MockDriver::new());
    let (mut session, _) = open_session(&driver);
    let handle = session.handle().unwrap();

    for _ in 0..4 {
        session.add_sysex_buffer(64).unwrap();
    }
    session.start_streaming().unwrap();
    assert!(driver.complete_input(handle, &sysex(0), 0));

    session.stop_streaming().unwrap();
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(session.pending_buffers(), 0);
    assert_eq!(driver.prepared_count(handle), 0);
    assert!(!session.worker_running());

    let stats = session.stats();
    assert_eq!(stats.submitted, 4);
    assert_eq!(stats.reclaimed, 4);
    assert_eq!(stats.unprepare_failures, 0);
}

#[test]
fn test_reopen_closes_previous_handle() {
    let driver = Arc::new(MockDriver::with_devices(2, 0));
    let (mut session, _) = open_session(&driver);
    let first = session.handle().unwrap();
    let queued = session.add_sysex_buffer(16).unwrap();
    session.start_streaming().unwrap();

    session.open(1).unwrap();

    assert_eq!(driver.open_handle_count(), 1);
    let second = session.handle().unwrap();
    assert_ne!(first, second);
    assert_eq!(driver.device_of(second), Some(1));
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(session.pending_buffers(), 0);
    assert_eq!(driver.unprepared_log(), vec![queued]);
}

#[test]
fn test_rejected_start_leaves_session_open() {
    let driver = Arc::new(MockDriver::new());
    let (mut session, _) = open_session(&driver);
    session.add_sysex_buffer(16).unwrap();
    driver.fail_next(MockOperation::Start, DriverStatus::NotReady);

    let err = session.start_streaming().unwrap_err();
    assert!(matches!(err, MidiError::DriverStart(_)));
    assert_eq!(session.state(), SessionState::Open);
    assert!(!session.worker_running());

    // A second attempt succeeds with the buffer still queued.
    session.start_streaming().unwrap();
    assert!(session.is_streaming());
    assert_eq!(session.pending_buffers(), 1);
}

#[test]
fn test_start_requires_open_session() {
    let driver = Arc::new(MockDriver::new());
    let mut session = DeviceSession::new(driver, Arc::new(RecordingReceiver::new()));
    let err = session.start_streaming().unwrap_err();
    assert!(err.is_invalid_state());
    assert_eq!(session.state(), SessionState::Closed);
}

fn completions_then_close(count: usize) {
    let driver = Arc::new(MockDriver::new());
    let (mut session, _) = open_session(&driver);
    let handle = session.handle().unwrap();

    for _ in 0..count {
        session.add_sysex_buffer(16).unwrap();
    }
    session.start_streaming().unwrap();

    let payloads = (0..count).map(sysex).collect();
    let completer = driver.spawn_input_completions(handle, payloads).unwrap();

    let started = Instant::now();
    session.close().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.pending_buffers(), 0);
    assert!(!session.worker_running());
    assert_eq!(driver.open_handle_count(), 0);
    assert_eq!(session.stats().reclaimed, count as u64);

    let delivered = completer.join().unwrap();
    assert!(delivered <= count);
}

#[test]
fn test_close_after_no_completions() {
    completions_then_close(0);
}

#[test]
fn test_close_after_one_completion() {
    completions_then_close(1);
}

#[test]
fn test_close_after_hundred_completions() {
    completions_then_close(100);
}

#[test]
fn test_completions_from_driver_thread_reach_receiver() {
    let driver = Arc::new(MockDriver::new());
    let (mut session, receiver) = open_session(&driver);
    let handle = session.handle().unwrap();

    for _ in 0..10 {
        session.add_sysex_buffer(16).unwrap();
    }
    session.start_streaming().unwrap();

    let payloads: Vec<_> = (0..10).map(sysex).collect();
    let completer = driver
        .spawn_input_completions(handle, payloads.clone())
        .unwrap();
    assert_eq!(completer.join().unwrap(), 10);

    assert_eq!(receiver.long_messages(), payloads);
    // The worker reclaims at most one buffer per wake; wakes may coalesce.
    assert!(wait_until(|| session.pending_buffers() < 10));

    session.stop_streaming().unwrap();
    assert_eq!(session.pending_buffers(), 0);
    assert_eq!(driver.unprepared_log().len(), 10);
}

#[test]
fn test_short_messages_and_errors_are_dispatched() {
    let driver = Arc::new(MockDriver::new());
    let (session, receiver) = open_session(&driver);
    let handle = session.handle().unwrap();
    let clock = ShortMessage::pack(0xF8, 0, 0);
    let garbled = ShortMessage::from_raw(0x00FF_FFFF);

    assert!(driver.deliver_short(handle, clock, 10));
    assert!(driver.deliver_short_error(handle, garbled, 11));

    assert_eq!(
        receiver.events(),
        vec![
            ReceivedEvent::Short {
                message: clock,
                timestamp: 10,
            },
            ReceivedEvent::ShortError {
                message: garbled,
                timestamp: 11,
            },
        ]
    );
}

#[test]
fn test_long_error_is_reported_and_reclaimed() {
    let driver = Arc::new(MockDriver::new());
    let (mut session, receiver) = open_session(&driver);
    let handle = session.handle().unwrap();
    session.add_sysex_buffer(8).unwrap();
    session.start_streaming().unwrap();

    assert!(driver.complete_input_error(handle, &[0xF0, 0x01], 5));
    assert!(wait_until(|| session.pending_buffers() == 0));

    assert_eq!(
        receiver.events(),
        vec![ReceivedEvent::LongError {
            bytes: vec![0xF0, 0x01],
            timestamp: 5,
        }]
    );
    session.close().unwrap();
}

#[test]
fn test_buffer_added_while_streaming_is_used() {
    let driver = Arc::new(MockDriver::new());
    let (mut session, receiver) = open_session(&driver);
    let handle = session.handle().unwrap();
    session.start_streaming().unwrap();

    assert!(!driver.complete_input(handle, &sysex(1), 0));
    session.add_sysex_buffer(16).unwrap();
    assert!(driver.complete_input(handle, &sysex(1), 0));

    assert_eq!(receiver.long_messages(), vec![sysex(1)]);
    session.close().unwrap();
}

#[test]
fn test_submit_exhaustion_rolls_back_prepare() {
    let driver = Arc::new(MockDriver::new());
    let (session, _) = open_session(&driver);
    let handle = session.handle().unwrap();
    driver.fail_next(MockOperation::Submit, DriverStatus::NoMemory);

    let err = session.add_sysex_buffer(16).unwrap_err();
    assert!(err.is_resource_exhausted());
    assert!(matches!(err, MidiError::ResourceExhausted { .. }));
    assert_eq!(driver.prepared_count(handle), 0);
    assert_eq!(session.pending_buffers(), 0);
}

#[test]
fn test_unprepare_failure_is_counted_not_fatal() {
    let driver = Arc::new(MockDriver::new());
    let (mut session, _) = open_session(&driver);
    session.add_sysex_buffer(16).unwrap();
    session.add_sysex_buffer(16).unwrap();
    session.start_streaming().unwrap();
    driver.fail_next(MockOperation::Unprepare, DriverStatus::InvalidHandle);

    session.stop_streaming().unwrap();

    let stats = session.stats();
    assert_eq!(stats.reclaimed, 2);
    assert_eq!(stats.unprepare_failures, 1);
    assert_eq!(session.pending_buffers(), 0);
}

#[test]
fn test_close_failure_still_closes_session() {
    let driver = Arc::new(MockDriver::new());
    let (mut session, _) = open_session(&driver);
    driver.fail_next(MockOperation::Close, DriverStatus::InvalidHandle);

    let err = session.close().unwrap_err();
    assert!(matches!(err, MidiError::DeviceClose(_)));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.handle().is_none());
    // Nothing left to do.
    session.close().unwrap();
}
