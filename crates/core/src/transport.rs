//! Line transport: the blocking handoff between the generation thread and
//! its caller.
//!
//! Each direction holds at most one unread line. A sender blocks until the
//! previous line in its direction has been taken; a receiver blocks until a
//! line arrives or the transport closes. Every line that crosses is appended
//! to a transcript.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Caller to generation loop.
    Input,
    /// Generation loop to caller.
    Output,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::Input => 0,
            Direction::Output => 1,
        }
    }
}

/// Result of a blocking receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Line(String),
    Closed,
}

impl Received {
    pub fn into_line(self) -> Option<String> {
        match self {
            Received::Line(line) => Some(line),
            Received::Closed => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub direction: Direction,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    slots: [Option<String>; 2],
    closed: bool,
    transcript: Vec<TranscriptEntry>,
}

/// A pair of single-slot blocking channels plus a transcript.
///
/// Safe for one producer and one consumer per direction. After [`close`],
/// a line already sitting in a slot is still delivered; every other receive
/// returns [`Received::Closed`] and every send fails with
/// [`Error::SessionClosed`].
///
/// [`close`]: LineTransport::close
#[derive(Default)]
pub struct LineTransport {
    state: Mutex<State>,
    filled: [Condvar; 2],
    drained: [Condvar; 2],
}

impl LineTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `line`, first waiting for any unread line in `direction`.
    pub fn send(&self, direction: Direction, line: impl Into<String>) -> Result<()> {
        let idx = direction.index();
        let mut state = self.state.lock();
        while state.slots[idx].is_some() && !state.closed {
            self.drained[idx].wait(&mut state);
        }
        if state.closed {
            return Err(Error::SessionClosed);
        }

        let line = line.into();
        state.transcript.push(TranscriptEntry {
            direction,
            line: line.clone(),
            timestamp: Utc::now(),
        });
        state.slots[idx] = Some(line);
        self.filled[idx].notify_one();
        Ok(())
    }

    /// Take the next line in `direction`, waiting until one arrives or the
    /// transport closes.
    pub fn receive(&self, direction: Direction) -> Received {
        let idx = direction.index();
        let mut state = self.state.lock();
        loop {
            if let Some(line) = state.slots[idx].take() {
                self.drained[idx].notify_one();
                return Received::Line(line);
            }
            if state.closed {
                return Received::Closed;
            }
            self.filled[idx].wait(&mut state);
        }
    }

    /// Take the pending line in `direction` without waiting.
    pub fn try_receive(&self, direction: Direction) -> Option<Received> {
        let idx = direction.index();
        let mut state = self.state.lock();
        if let Some(line) = state.slots[idx].take() {
            self.drained[idx].notify_one();
            return Some(Received::Line(line));
        }
        state.closed.then_some(Received::Closed)
    }

    /// Close both directions and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        for cv in self.filled.iter().chain(self.drained.iter()) {
            cv.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Every line sent so far, in order.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.state.lock().transcript.clone()
    }
}

impl std::fmt::Debug for LineTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LineTransport")
            .field("closed", &state.closed)
            .field("transcript_len", &state.transcript.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn send_then_receive_delivers_line() {
        let transport = LineTransport::new();
        transport.send(Direction::Input, "hello").unwrap();
        assert_eq!(
            transport.receive(Direction::Input),
            Received::Line("hello".into())
        );
    }

    #[test]
    fn directions_are_independent() {
        let transport = LineTransport::new();
        transport.send(Direction::Input, "to engine").unwrap();
        transport.send(Direction::Output, "to caller").unwrap();
        assert_eq!(
            transport.receive(Direction::Output).into_line().as_deref(),
            Some("to caller")
        );
        assert_eq!(
            transport.receive(Direction::Input).into_line().as_deref(),
            Some("to engine")
        );
    }

    #[test]
    fn second_send_waits_for_receive() {
        let transport = Arc::new(LineTransport::new());
        transport.send(Direction::Output, "first").unwrap();

        let (sent_tx, sent_rx) = mpsc::channel();
        let sender = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                transport.send(Direction::Output, "second").unwrap();
                sent_tx.send(()).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(sent_rx.try_recv().is_err(), "send must block while the slot is full");

        assert_eq!(
            transport.receive(Direction::Output),
            Received::Line("first".into())
        );
        sent_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        sender.join().unwrap();
        assert_eq!(
            transport.receive(Direction::Output),
            Received::Line("second".into())
        );
    }

    #[test]
    fn close_releases_blocked_receiver() {
        let transport = Arc::new(LineTransport::new());
        let (done_tx, done_rx) = mpsc::channel();
        let receiver = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                let got = transport.receive(Direction::Input);
                done_tx.send(got).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(20));
        transport.close();
        let got = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, Received::Closed);
        receiver.join().unwrap();
    }

    #[test]
    fn close_releases_blocked_sender() {
        let transport = Arc::new(LineTransport::new());
        transport.send(Direction::Output, "unread").unwrap();
        let sender = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || transport.send(Direction::Output, "never"))
        };
        thread::sleep(Duration::from_millis(20));
        transport.close();
        assert!(matches!(sender.join().unwrap(), Err(Error::SessionClosed)));
    }

    #[test]
    fn pending_line_survives_close() {
        let transport = LineTransport::new();
        transport.send(Direction::Output, "last words").unwrap();
        transport.close();
        transport.close();
        assert_eq!(
            transport.receive(Direction::Output),
            Received::Line("last words".into())
        );
        assert_eq!(transport.receive(Direction::Output), Received::Closed);
        assert!(transport.send(Direction::Input, "late").is_err());
    }

    #[test]
    fn transcript_records_both_directions_in_order() {
        let transport = LineTransport::new();
        transport.send(Direction::Input, "question").unwrap();
        transport.receive(Direction::Input);
        transport.send(Direction::Output, "answer").unwrap();

        let transcript = transport.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].direction, Direction::Input);
        assert_eq!(transcript[0].line, "question");
        assert_eq!(transcript[1].direction, Direction::Output);
        assert_eq!(transcript[1].line, "answer");
    }

    #[test]
    fn try_receive_does_not_block() {
        let transport = LineTransport::new();
        assert_eq!(transport.try_receive(Direction::Input), None);
        transport.close();
        assert_eq!(transport.try_receive(Direction::Input), Some(Received::Closed));
    }
}
