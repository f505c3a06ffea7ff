//! Serial radio bridge: single-key driving and the pin status echo.
//!
//! The radio module raises a presence line while a peer is paired. Keys are
//! honoured only while it is asserted, and the status echo written after
//! each duty change is skipped (never queued) while it is low.

use core::fmt::Write as _;

use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::String;

use crate::actuator::{MotorStatus, PinDuties};
use crate::dispatch::{Command, CommandQueue, DutyObserver, SubmitError, Verb};

/// Hold parameter attached to key commands: drive until the next key.
pub const CONTINUOUS_HOLD: i32 = -1;

/// Longest echo line, `(1023, 1023, 1023, 1023)\n` plus slack.
const ECHO_LINE_LEN: usize = 32;

/// Reads the radio module's pairing indicator.
pub trait PresenceGate {
    fn is_present(&self) -> bool;
}

/// Fire-and-forget byte sink toward the radio module.
pub trait SerialWrite {
    fn write_bytes(&mut self, bytes: &[u8]);
}

/// Gate that is always asserted, for wired links.
#[derive(Copy, Clone, Debug, Default)]
pub struct AlwaysPresent;

impl PresenceGate for AlwaysPresent {
    fn is_present(&self) -> bool {
        true
    }
}

/// Maps a key to its verb. Keys are lower case; the radio's own upper-case
/// `AT` responses fall through as noise.
pub fn key_verb(byte: u8) -> Option<Verb> {
    match byte {
        b'w' => Some(Verb::Forward),
        b'a' => Some(Verb::RotateLeft),
        b's' => Some(Verb::Backward),
        b'd' => Some(Verb::RotateRight),
        b'h' => Some(Verb::Stop),
        _ => None,
    }
}

/// Builds the queued command for a key.
pub fn key_command(byte: u8) -> Option<Command> {
    let verb = key_verb(byte)?;
    let param = verb.motion().map(|_| CONTINUOUS_HOLD);
    Some(Command::new(verb, param))
}

/// Outcome counts for a chunk of received bytes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FeedReport {
    pub submitted: usize,
    pub ignored: usize,
    pub dropped: usize,
}

/// Turns received bytes into queued commands while the peer is present.
pub struct SerialBridge<G> {
    gate: G,
}

impl<G: PresenceGate> SerialBridge<G> {
    pub const fn new(gate: G) -> Self {
        Self { gate }
    }

    pub fn gate(&self) -> &G {
        &self.gate
    }

    /// Returns the command for `byte`, or `None` if it is not a key or the
    /// peer is absent.
    pub fn on_byte(&self, byte: u8) -> Option<Command> {
        if !self.gate.is_present() {
            return None;
        }
        key_command(byte)
    }

    /// Submits every key in `bytes`. A full queue drops the key.
    pub fn feed<M: RawMutex, const N: usize>(
        &self,
        bytes: &[u8],
        queue: &CommandQueue<M, N>,
    ) -> FeedReport {
        let mut report = FeedReport::default();
        for &byte in bytes {
            match self.on_byte(byte).map(|command| queue.submit(command)) {
                Some(Ok(())) => report.submitted += 1,
                Some(Err(SubmitError::Full)) => report.dropped += 1,
                None => report.ignored += 1,
            }
        }
        report
    }
}

/// Writes the raw pin status line after every duty change, if present.
pub struct PresenceEcho<G, W> {
    gate: G,
    writer: W,
    written: usize,
    skipped: usize,
}

impl<G: PresenceGate, W: SerialWrite> PresenceEcho<G, W> {
    pub const fn new(gate: G, writer: W) -> Self {
        Self {
            gate,
            writer,
            written: 0,
            skipped: 0,
        }
    }

    pub const fn written(&self) -> usize {
        self.written
    }

    pub const fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }
}

impl<G: PresenceGate, W: SerialWrite> DutyObserver for PresenceEcho<G, W> {
    fn duty_changed(&mut self, pins: PinDuties, _status: MotorStatus) {
        if !self.gate.is_present() {
            self.skipped += 1;
            return;
        }
        let mut line: String<ECHO_LINE_LEN> = String::new();
        let _ = writeln!(line, "{pins}");
        self.writer.write_bytes(line.as_bytes());
        self.written += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::vec::Vec;

    #[derive(Clone, Default)]
    struct Pin(Rc<Cell<bool>>);

    impl PresenceGate for Pin {
        fn is_present(&self) -> bool {
            self.0.get()
        }
    }

    #[derive(Default)]
    struct Sink(Vec<u8>);

    impl SerialWrite for Sink {
        fn write_bytes(&mut self, bytes: &[u8]) {
            self.0.extend_from_slice(bytes);
        }
    }

    #[test]
    fn keys_map_to_continuous_motion() {
        assert_eq!(
            key_command(b'w'),
            Some(Command::new(Verb::Forward, Some(CONTINUOUS_HOLD)))
        );
        assert_eq!(
            key_command(b'd'),
            Some(Command::new(Verb::RotateRight, Some(CONTINUOUS_HOLD)))
        );
        assert_eq!(key_command(b'A'), None);
        assert_eq!(key_command(b'h'), Some(Command::new(Verb::Stop, None)));
        assert_eq!(key_command(b'\r'), None);
        assert_eq!(key_command(b'K'), None);
    }

    #[test]
    fn absent_peer_keys_are_ignored() {
        let pin = Pin::default();
        let bridge = SerialBridge::new(pin.clone());
        let queue: CommandQueue<NoopRawMutex, 4> = CommandQueue::new(Default::default());

        let report = bridge.feed(b"wasd", &queue);
        assert_eq!(report.ignored, 4);
        assert!(queue.is_empty());

        pin.0.set(true);
        let report = bridge.feed(b"AT\r\nw", &queue);
        assert_eq!(report.submitted, 1);
        assert_eq!(report.ignored, 4);
        assert_eq!(queue.pop().map(|c| c.verb), Some(Verb::Forward));
    }

    #[test]
    fn full_queue_drops_keys() {
        let bridge = SerialBridge::new(AlwaysPresent);
        let queue: CommandQueue<NoopRawMutex, 2> = CommandQueue::new(Default::default());
        let report = bridge.feed(b"wsh", &queue);
        assert_eq!(
            report,
            FeedReport {
                submitted: 2,
                ignored: 0,
                dropped: 1
            }
        );
    }

    #[test]
    fn echo_is_skipped_while_absent() {
        let pin = Pin::default();
        let mut echo = PresenceEcho::new(pin.clone(), Sink::default());
        let pins = PinDuties([0, 700, 0, 700]);
        let status = MotorStatus { m1: 700, m2: 700 };

        echo.duty_changed(pins, status);
        assert!(echo.writer().0.is_empty());
        assert_eq!(echo.skipped(), 1);

        pin.0.set(true);
        echo.duty_changed(pins, status);
        assert_eq!(echo.writer().0, b"(0, 700, 0, 700)\n");
        assert_eq!(echo.written(), 1);
    }
}
