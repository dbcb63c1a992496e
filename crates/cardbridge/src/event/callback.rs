//! Callback-based event handling for the card listener

use crate::event::ListenerEvent;

/// Trait for handling listener events
///
/// Handlers run on the listener worker thread, one event at a time.
pub trait ListenerEventHandler {
    /// Handle a listener event
    fn handle_event(&mut self, event: ListenerEvent);
}

// Implement handlers for closures
impl<F> ListenerEventHandler for F
where
    F: FnMut(ListenerEvent),
{
    fn handle_event(&mut self, event: ListenerEvent) {
        self(event)
    }
}

/// Handler splitting events over a UID sink and an error sink
#[allow(missing_debug_implementations)]
pub struct SplitHandler<U, E> {
    on_uid: U,
    on_error: E,
}

impl<U, E> SplitHandler<U, E>
where
    U: FnMut(String),
    E: FnMut(String),
{
    /// Create a handler from the two sinks
    pub const fn new(on_uid: U, on_error: E) -> Self {
        Self { on_uid, on_error }
    }
}

impl<U, E> ListenerEventHandler for SplitHandler<U, E>
where
    U: FnMut(String),
    E: FnMut(String),
{
    fn handle_event(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Uid(uid) => (self.on_uid)(uid),
            ListenerEvent::Error(message) => (self.on_error)(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_handler_routes_events() {
        let mut uids = Vec::new();
        let mut errors = Vec::new();
        {
            let mut handler = SplitHandler::new(|u| uids.push(u), |e| errors.push(e));
            handler.handle_event(ListenerEvent::Uid("04A2".into()));
            handler.handle_event(ListenerEvent::Error("boom".into()));
            handler.handle_event(ListenerEvent::Uid("04A3".into()));
        }
        assert_eq!(uids, vec!["04A2", "04A3"]);
        assert_eq!(errors, vec!["boom"]);
    }
}
