//! Smart-card reader bridge over PC/SC
//!
//! This crate enumerates readers, listens for card insertions on a reader in
//! the background and exchanges raw APDUs with cards without blocking the
//! caller. Everything hardware-facing goes through the [`CardService`] trait;
//! [`PcscService`] talks to the system PC/SC resource manager and
//! [`MemoryService`] simulates readers in process.
//!
//! # Examples
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use cardbridge::{BridgeConfig, CardBridge};
//!
//! let bridge = CardBridge::new(BridgeConfig::default());
//!
//! let readers = bridge.list_readers()?;
//! let Some(reader) = readers.first() else {
//!     println!("No readers found");
//!     return Ok(());
//! };
//!
//! // Print the UID of every card tapped on the first reader
//! bridge.start_listening(
//!     reader,
//!     |uid| println!("card: {uid}"),
//!     |message| eprintln!("{message}"),
//! )?;
//!
//! // Send a SELECT command and wait for the response
//! let response = bridge
//!     .transmit(reader, vec![0x00, 0xA4, 0x04, 0x00, 0x00])
//!     .wait()?;
//! println!("Response: {}", hex::encode_upper(&response));
//!
//! bridge.stop_listening();
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]

pub mod backend;
mod bridge;
mod config;
mod context;
mod error;
pub mod event;
mod listener;
mod pipeline;
mod reader;
pub mod report;

pub use backend::{
    CardService, MemoryService, PcscService, ReaderStatus, ServiceContext, SimulatedCard,
};
pub use bridge::CardBridge;
pub use config::{BridgeConfig, ContextScope, ExchangeOptions, GET_UID_COMMAND, ShareMode};
pub use context::ContextManager;
pub use error::{BridgeError, ErrorKind, Result, ServiceError};
pub use event::{ListenerEvent, ListenerEventHandler, ListenerEventReceiver, ListenerPhase};
pub use listener::CardListener;
pub use pipeline::{TransmitHandle, TransmitPipeline};
pub use reader::{Reader, ReaderEnumerator};

// Re-export for callers handling responses
pub use bytes::Bytes;
