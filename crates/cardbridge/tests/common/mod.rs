//! Common test utilities
#![allow(dead_code)]

use std::time::{Duration, Instant};

use cardbridge::{
    BridgeConfig, CardBridge, ListenerEvent, ListenerEventReceiver, MemoryService, SimulatedCard,
};
use tracing_subscriber::EnvFilter;

pub const READER: &str = "ACS ACR122 0";
pub const OTHER_READER: &str = "ACS ACR122 1";

/// Upper bound for anything the worker threads should do promptly
pub const PROMPT: Duration = Duration::from_secs(2);

/// Install a test-friendly subscriber once; `RUST_LOG` controls the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A simulated service with the two scenario readers plugged in
pub fn two_reader_service() -> MemoryService {
    init_tracing();
    MemoryService::new()
        .with_reader(READER)
        .with_reader(OTHER_READER)
}

/// Configuration with short waits so tests run fast
pub fn fast_config() -> BridgeConfig {
    BridgeConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_error_backoff(Duration::from_millis(10))
}

pub fn bridge(service: &MemoryService) -> CardBridge<MemoryService> {
    CardBridge::with_service(service.clone(), fast_config())
}

/// A card whose responder echoes the command followed by `90 00`
pub fn echo_card(uid: &[u8]) -> SimulatedCard {
    SimulatedCard::new(uid).with_responder(|command| {
        let mut response = command.to_vec();
        response.extend_from_slice(&[0x90, 0x00]);
        response
    })
}

/// Next event, failing the test if none arrives promptly
pub fn next_event(events: &ListenerEventReceiver) -> ListenerEvent {
    match events.recv_timeout(PROMPT) {
        Ok(event) => event,
        Err(e) => panic!("no listener event: {e}"),
    }
}

/// Next UID event, skipping error events
pub fn next_uid(events: &ListenerEventReceiver) -> String {
    let deadline = Instant::now() + PROMPT;
    loop {
        match events.recv_deadline(deadline) {
            Ok(ListenerEvent::Uid(uid)) => return uid,
            Ok(ListenerEvent::Error(_)) => continue,
            Err(e) => panic!("no UID event: {e}"),
        }
    }
}

/// Assert that nothing is delivered for `period`
pub fn assert_quiet(events: &ListenerEventReceiver, period: Duration) {
    if let Ok(event) = events.recv_timeout(period) {
        panic!("unexpected listener event: {event:?}");
    }
}
