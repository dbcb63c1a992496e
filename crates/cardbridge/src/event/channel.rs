//! Channel-based event handling for the card listener

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::event::ListenerEvent;

/// Sender for listener events
pub type ListenerEventSender = Sender<ListenerEvent>;
/// Receiver for listener events
pub type ListenerEventReceiver = Receiver<ListenerEvent>;

/// Create an unbounded channel for listener events
pub fn listener_event_channel() -> (ListenerEventSender, ListenerEventReceiver) {
    unbounded()
}
