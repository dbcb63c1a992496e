use std::thread;
use std::time::Duration;

use cardbridge::{MemoryService, SimulatedCard};

/// Readers offered in simulation mode
pub const READERS: [&str; 2] = ["Simulated Reader 0", "Simulated Reader 1"];

/// A card answering `90 00` to anything it does not know
fn card(uid: u32) -> SimulatedCard {
    SimulatedCard::new(uid.to_be_bytes()).with_responder(|_| vec![0x90, 0x00])
}

/// Two readers, a card in the first
pub fn service() -> MemoryService {
    let service = READERS
        .iter()
        .fold(MemoryService::new(), |service, name| service.with_reader(*name));
    service.insert_card(READERS[0], card(0x04A2_2B1A));
    service
}

/// Keep taking cards out of the first reader and tapping new ones
pub fn start_tapping(service: MemoryService) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut uid = 0x04A2_2B1A_u32;
        loop {
            thread::sleep(Duration::from_secs(2));
            service.remove_card(READERS[0]);
            thread::sleep(Duration::from_secs(1));
            uid = uid.wrapping_add(0x0101);
            service.insert_card(READERS[0], card(uid));
        }
    })
}
