//! Example showing how to enumerate connected card readers

use cardbridge::{BridgeConfig, CardBridge};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let bridge = CardBridge::new(BridgeConfig::default());

    let readers = bridge.readers()?;
    println!("Found {} readers:", readers.len());

    for (i, reader) in readers.iter().enumerate() {
        println!("{}. Reader: {}", i + 1, reader.name());
        if reader.has_card() {
            println!("   Card present ({})", reader.status());
        } else {
            println!("   No card present");
        }
    }

    Ok(())
}
