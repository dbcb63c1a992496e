use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread;

use cardbridge::{CardBridge, CardService, ListenerEvent};
use colored::Colorize;

/// List all available readers
pub fn list_command<S: CardService>(
    bridge: &CardBridge<S>,
) -> Result<(), Box<dyn std::error::Error>> {
    let readers = bridge.readers()?;

    if readers.is_empty() {
        println!("No readers found!");
        return Ok(());
    }

    println!("Available readers:");
    for (i, reader) in readers.iter().enumerate() {
        println!("{}. {} ({})", i + 1, reader.name(), reader.status());
    }

    Ok(())
}

/// Show the status of one reader
pub fn status_command<S: CardService>(
    bridge: &CardBridge<S>,
    reader: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = bridge.reader_status(reader)?;
    println!("{}: {}", reader, status);
    Ok(())
}

/// Print card UIDs until Enter is pressed or `count` cards were seen
pub fn listen_command<S: CardService>(
    bridge: CardBridge<S>,
    reader: &str,
    count: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let bridge = Arc::new(bridge);
    let events = bridge.start_listening_channel(reader)?;
    println!("Listening on {}, press Enter to stop", reader.bold());

    {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || {
            io::stdin().lock().lines().next();
            bridge.stop_listening();
        });
    }

    let mut seen = 0;
    for event in events {
        match event {
            ListenerEvent::Uid(uid) => {
                println!("{} {}", "Card UID:".green(), uid.bold());
                seen += 1;
                if count.is_some_and(|count| seen >= count) {
                    break;
                }
            }
            ListenerEvent::Error(message) => eprintln!("{}", message.red()),
        }
    }

    bridge.stop_listening();
    Ok(())
}

/// Send one APDU and print the response
pub fn transmit_command<S: CardService>(
    bridge: &CardBridge<S>,
    reader: &str,
    apdu: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let compact = apdu.split_whitespace().collect::<String>();
    let command = hex::decode(&compact).map_err(|e| format!("Invalid APDU hex: {}", e))?;

    println!("{} {}", ">>".cyan(), hex::encode_upper(&command));
    let response = bridge.transmit(reader, command).wait()?;

    match response.split_last_chunk::<2>() {
        Some((data, sw)) => {
            let status = format!("{:02X}{:02X}", sw[0], sw[1]);
            let status = if *sw == [0x90, 0x00] {
                status.green()
            } else {
                status.yellow()
            };
            println!("{} {} {}", "<<".cyan(), hex::encode_upper(data), status);
        }
        None => println!("{} {}", "<<".cyan(), hex::encode_upper(&response)),
    }

    Ok(())
}
