//! Listener events and the ways to receive them

pub mod callback;
pub use callback::*;

pub mod channel;
pub use channel::*;

/// Event emitted by the card listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// A card was inserted and identified; the UID as upper-case hex
    Uid(String),
    /// A runtime failure while listening; the session keeps running
    Error(String),
}

impl ListenerEvent {
    /// The UID, if this is a UID event
    pub fn uid(&self) -> Option<&str> {
        match self {
            Self::Uid(uid) => Some(uid),
            Self::Error(_) => None,
        }
    }

    /// The error message, if this is an error event
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            Self::Uid(_) => None,
        }
    }
}

/// Lifecycle phase of the card listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerPhase {
    /// No session
    Idle,
    /// A start request is validating input and spawning the worker
    Starting,
    /// The worker is polling
    Running,
    /// A stop request is waiting for the worker to finish
    Stopping,
}
