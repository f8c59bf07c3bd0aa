//! Routes both channels into a [`Session`].

use serde_json::Value;

use crate::error::{DecodeError, FatalRunError};
use crate::marker::MarkerParser;
use crate::session::Session;
use crate::wire::{TestEvent, WireMessage};

/// Feeds socket messages and raw stdout lines into one session.
///
/// Socket messages are decoded and applied as they come. Raw lines go
/// through the marker parser and only count while the socket has not
/// delivered anything this session.
#[derive(Debug, Default)]
pub struct EventRouter {
    parser: MarkerParser,
    raw_lines: usize,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget parser state and counters for a new run.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Number of raw stdout lines seen this run.
    pub fn raw_lines(&self) -> usize {
        self.raw_lines
    }

    /// Decode one `(type, data)` pair and merge it.
    pub fn consume_message(&mut self, session: &mut Session, kind: &str, data: &Value) -> Result<(), DecodeError> {
        let event = TestEvent::decode(kind, data)?;
        session.apply_socket(&event);
        Ok(())
    }

    pub fn consume_wire(&mut self, session: &mut Session, msg: &WireMessage) -> Result<(), DecodeError> {
        self.consume_message(session, &msg.kind, &msg.data)
    }

    /// Feed one stdout line. Returns how many marker events were applied
    /// (zero once the socket is trusted).
    pub fn consume_raw_line(&mut self, session: &mut Session, line: &str) -> usize {
        self.raw_lines += 1;
        let events = self.parser.feed(line);
        apply_markers(session, &events)
    }

    /// Close the marker stream and decide whether the run failed silently:
    /// unsuccessful exit, no stdout at all and no socket traffic.
    pub fn finish(&mut self, session: &mut Session, exit_code: Option<i32>) -> Result<(), FatalRunError> {
        let events = self.parser.finish();
        apply_markers(session, &events);

        let succeeded = exit_code == Some(0);
        if !succeeded && self.raw_lines == 0 && session.socket_messages() == 0 {
            return Err(FatalRunError::Silent { exit_code });
        }
        Ok(())
    }
}

fn apply_markers(session: &mut Session, events: &[TestEvent]) -> usize {
    events.iter().filter(|event| session.apply_marker(event)).count()
}
