//! Card listener behaviour against the simulated service

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use cardbridge::{
    BridgeError, CardBridge, ErrorKind, ListenerEvent, ListenerPhase, ServiceError, SimulatedCard,
};
use common::*;

#[test]
fn test_one_uid_per_insertion() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    let events = bridge.start_listening_channel(READER).unwrap();

    service.insert_card(READER, SimulatedCard::new([0x04, 0xA2, 0x2B, 0x1A]));
    assert_eq!(next_event(&events), ListenerEvent::Uid("04A22B1A".into()));
    // steady presence across many polls
    assert_quiet(&events, Duration::from_millis(200));

    service.remove_card(READER);
    assert_quiet(&events, Duration::from_millis(100));

    service.insert_card(READER, SimulatedCard::new([0x04, 0xA2, 0x2B, 0x1A]));
    assert_eq!(next_event(&events), ListenerEvent::Uid("04A22B1A".into()));
    assert_quiet(&events, Duration::from_millis(100));
}

#[test]
fn test_uid_is_even_length_hex() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    let events = bridge.start_listening_channel(READER).unwrap();

    service.insert_card(READER, SimulatedCard::new([0x0A, 0xBC, 0x01]));
    let uid = next_uid(&events);
    assert!(!uid.is_empty());
    assert_eq!(uid.len() % 2, 0);
    assert!(uid.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_card_present_at_start_is_identified_once() {
    let service = two_reader_service();
    service.insert_card(READER, SimulatedCard::new([0x11, 0x22]));
    let bridge = bridge(&service);

    let events = bridge.start_listening_channel(READER).unwrap();
    assert_eq!(next_uid(&events), "1122");
    assert_quiet(&events, Duration::from_millis(150));
}

#[test]
fn test_only_the_target_reader_is_watched() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    let events = bridge.start_listening_channel(READER).unwrap();

    service.insert_card(OTHER_READER, SimulatedCard::new([0x99]));
    assert_quiet(&events, Duration::from_millis(150));
}

#[test]
fn test_mute_card_is_not_identified_until_it_answers() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    let events = bridge.start_listening_channel(READER).unwrap();

    service.insert_card(READER, SimulatedCard::new([0x42]).mute());
    assert_quiet(&events, Duration::from_millis(150));

    service.insert_card(READER, SimulatedCard::new([0x42]));
    assert_eq!(next_event(&events), ListenerEvent::Uid("42".into()));
}

#[test]
fn test_identification_failure_is_reported_and_listening_continues() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    let events = bridge.start_listening_channel(READER).unwrap();

    service.insert_card(READER, SimulatedCard::new(Vec::new()));
    let message = next_event(&events).error().map(str::to_string).unwrap();
    assert!(message.starts_with("Error: Card communication failed"));
    assert!(message.contains("empty UID"));
    // no retry while the same card stays in the reader
    assert_quiet(&events, Duration::from_millis(150));

    service.remove_card(READER);
    thread::sleep(Duration::from_millis(50));
    service.insert_card(READER, SimulatedCard::new([0x07]));
    assert_eq!(next_uid(&events), "07");
    assert_eq!(bridge.listener_phase(), ListenerPhase::Running);
}

#[test]
fn test_exchange_failure_is_reported() {
    let service = two_reader_service();
    service.fail_exchanges(READER, Some(ServiceError::Timeout));
    let bridge = bridge(&service);
    let events = bridge.start_listening_channel(READER).unwrap();

    service.insert_card(READER, SimulatedCard::new([0x01]));
    let event = next_event(&events);
    assert!(event.error().is_some_and(|m| m.contains("operation timed out")));
}

#[test]
fn test_status_failures_do_not_end_the_session() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    let events = bridge.start_listening_channel(READER).unwrap();

    service.fail_status(READER, Some(ServiceError::ReaderUnavailable));
    let message = next_event(&events).error().map(str::to_string).unwrap();
    assert!(message.contains("reader unavailable"));

    service.fail_status(READER, None);
    service.insert_card(READER, SimulatedCard::new([0x0F, 0xF0]));
    assert_eq!(next_uid(&events), "0FF0");
}

#[test]
fn test_second_start_keeps_the_first_session() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    let uids = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&uids);
    bridge
        .start_listening(
            READER,
            move |_uid| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_message| {},
        )
        .unwrap();

    let err = bridge.start_listening_channel(OTHER_READER).unwrap_err();
    assert_eq!(err, BridgeError::AlreadyListening);

    service.insert_card(READER, SimulatedCard::new([0x01]));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(uids.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unlisted_reader_is_rejected() {
    let service = two_reader_service();
    let bridge = bridge(&service);

    let err = bridge.start_listening_channel("ACS ACR122 7").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReaderNotFound);
    assert_eq!(bridge.listener_phase(), ListenerPhase::Idle);

    let err = bridge.start_listening_channel("").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[test]
fn test_no_events_after_stop_returns() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    let calls = Arc::new(AtomicUsize::new(0));
    let on_uid = Arc::clone(&calls);
    let on_error = Arc::clone(&calls);
    bridge
        .start_listening(
            READER,
            move |_| {
                on_uid.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                on_error.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

    bridge.stop_listening();
    assert_eq!(bridge.listener_phase(), ListenerPhase::Idle);

    service.insert_card(READER, SimulatedCard::new([0x01]));
    service.fail_status(READER, Some(ServiceError::ReaderUnavailable));
    thread::sleep(Duration::from_millis(150));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stop_from_another_thread() {
    let service = two_reader_service();
    let bridge = Arc::new(bridge(&service));
    let events = bridge.start_listening_channel(READER).unwrap();

    let stopper = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || bridge.stop_listening())
    };
    stopper.join().unwrap();

    assert_eq!(bridge.listener_phase(), ListenerPhase::Idle);
    assert!(events.recv_timeout(PROMPT).is_err());
}

#[test]
fn test_concurrent_stops_both_return() {
    let service = two_reader_service();
    let bridge = Arc::new(bridge(&service));
    let _events = bridge.start_listening_channel(READER).unwrap();

    let stoppers = (0..4)
        .map(|_| {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.stop_listening())
        })
        .collect::<Vec<_>>();
    for stopper in stoppers {
        stopper.join().unwrap();
    }
    assert_eq!(bridge.listener_phase(), ListenerPhase::Idle);
}

#[test]
fn test_listen_then_stop_then_listen_on_other_reader() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    drop(bridge.start_listening_channel(READER).unwrap());
    bridge.stop_listening();

    let events = bridge.start_listening_channel(OTHER_READER).unwrap();
    service.insert_card(OTHER_READER, SimulatedCard::new([0xAB, 0xCD]));
    assert_eq!(next_uid(&events), "ABCD");
}

#[test]
fn test_events_keep_insertion_order() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    let events = bridge.start_listening_channel(READER).unwrap();

    for uid in [[0x01u8], [0x02], [0x03]] {
        service.insert_card(READER, SimulatedCard::new(uid));
        assert_eq!(next_uid(&events), hex::encode_upper(uid));
        service.remove_card(READER);
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_listener_recovers_after_service_restart() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    let events = bridge.start_listening_channel(READER).unwrap();
    thread::sleep(Duration::from_millis(50));

    service.invalidate_contexts();
    let message = next_event(&events).error().map(str::to_string).unwrap();
    assert!(message.starts_with("Error: Card service context lost"));

    service.insert_card(READER, SimulatedCard::new([0xAB, 0xCD]));
    assert_eq!(next_uid(&events), "ABCD");
    assert_eq!(bridge.listener_phase(), ListenerPhase::Running);
    assert_eq!(service.established_contexts(), 2);
}

#[test]
fn test_listener_recovers_after_service_outage() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    let events = bridge.start_listening_channel(READER).unwrap();
    thread::sleep(Duration::from_millis(50));

    service.set_available(false);
    let message = next_event(&events).error().map(str::to_string).unwrap();
    assert!(message.contains("context lost"));

    service.set_available(true);
    service.insert_card(READER, SimulatedCard::new([0x12, 0x34]));
    assert_eq!(next_uid(&events), "1234");
}

#[test]
fn test_stop_interrupts_error_backoff() {
    let service = two_reader_service();
    let config = fast_config().with_error_backoff(Duration::from_secs(30));
    let bridge = CardBridge::with_service(service.clone(), config);
    let events = bridge.start_listening_channel(READER).unwrap();

    service.fail_status(READER, Some(ServiceError::ReaderUnavailable));
    assert!(next_event(&events).error().is_some());

    let started = Instant::now();
    bridge.stop_listening();
    assert!(started.elapsed() < PROMPT);
    assert_eq!(bridge.listener_phase(), ListenerPhase::Idle);
}

#[test]
fn test_card_swapped_during_identification_is_identified() {
    let service = two_reader_service();
    service.set_latency(Duration::from_millis(200));
    let bridge = bridge(&service);
    let events = bridge.start_listening_channel(READER).unwrap();
    thread::sleep(Duration::from_millis(50));

    service.insert_card(READER, SimulatedCard::new([0x0A]));
    // swap while the identification exchange of the first card is running
    thread::sleep(Duration::from_millis(50));
    service.remove_card(READER);
    service.insert_card(READER, SimulatedCard::new([0x0B]));

    assert_eq!(next_uid(&events), "0A");
    assert_eq!(next_uid(&events), "0B");
    assert_quiet(&events, Duration::from_millis(150));
}

#[test]
fn test_repeated_stops_return_promptly() {
    let service = two_reader_service();
    let bridge = bridge(&service);
    for _ in 0..10 {
        let _events = bridge.start_listening_channel(READER).unwrap();
        let started = Instant::now();
        bridge.stop_listening();
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
