//! Example printing the UID of every card tapped on a reader
//!
//! Usage: `cargo run --example watch_uid [reader]`. Press Enter to stop.

use std::io::{self, BufRead};

use cardbridge::{BridgeConfig, CardBridge, ListenerEvent};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let bridge = CardBridge::new(BridgeConfig::default());
    let reader = match std::env::args().nth(1) {
        Some(reader) => reader,
        None => match bridge.list_readers()?.into_iter().next() {
            Some(reader) => reader,
            None => {
                println!("No readers found");
                return Ok(());
            }
        },
    };

    let events = bridge.start_listening_channel(&reader)?;
    println!("Listening on {reader}, press Enter to stop");

    let printer = std::thread::spawn(move || {
        for event in events {
            match event {
                ListenerEvent::Uid(uid) => println!("Card UID: {uid}"),
                ListenerEvent::Error(message) => eprintln!("{message}"),
            }
        }
    });

    io::stdin().lock().lines().next();
    bridge.stop_listening();
    let _ = printer.join();

    Ok(())
}
