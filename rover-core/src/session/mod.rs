//! Exclusive session admission for the logical network channels.
//!
//! The registry owns one slot per [`ChannelName`]. A join either installs the
//! transport into an empty slot (and greets it with a HELLO frame) or rejects
//! it, notifying both the challenger and the incumbent. All slot reads and
//! writes, and the frames that announce them, happen under one blocking mutex
//! so the order of "who got installed" and "who was told" cannot interleave.
//! Transport sends are fire-and-forget enqueues, so holding the lock across
//! them stays short.
//!
//! [`SessionHandle`] is the weak reference handed to the rest of the system:
//! it carries the slot generation and stops resolving once that session is
//! gone, even if a newer session occupies the same channel.

use core::cell::RefCell;
use core::fmt::{self, Write as _};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::String;

/// Maximum stored length of a peer address (`ip:port` or a port label).
pub const PEER_ADDRESS_LEN: usize = 48;

/// Capacity of handshake frames.
pub const HANDSHAKE_FRAME_LEN: usize = PEER_ADDRESS_LEN + 16;

/// Peer address as reported by the transport collaborator.
pub type PeerAddress = String<PEER_ADDRESS_LEN>;

/// Logical channels that admit at most one session each.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ChannelName {
    /// Discrete command channel (`/controller_ws`).
    Control,
    /// Motor teleoperation channel (`/motors_ws`).
    Telemetry,
}

impl ChannelName {
    pub const ALL: [ChannelName; 2] = [ChannelName::Control, ChannelName::Telemetry];

    const fn index(self) -> usize {
        match self {
            ChannelName::Control => 0,
            ChannelName::Telemetry => 1,
        }
    }

    /// Request path a network client uses to reach the channel.
    pub const fn path(self) -> &'static str {
        match self {
            ChannelName::Control => "/controller_ws",
            ChannelName::Telemetry => "/motors_ws",
        }
    }

    /// Resolves a request path, ignoring ASCII case and surrounding whitespace.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.trim();
        Self::ALL
            .into_iter()
            .find(|channel| channel.path().eq_ignore_ascii_case(path))
    }

    pub const fn label(self) -> &'static str {
        match self {
            ChannelName::Control => "control",
            ChannelName::Telemetry => "telemetry",
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Failure reported by a transport send.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportError {
    /// The peer has gone away.
    Closed,
    /// The outbound queue cannot take another frame.
    Full,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => f.write_str("transport closed"),
            TransportError::Full => f.write_str("transport queue full"),
        }
    }
}

/// Opaque bidirectional message channel provided by the network collaborator.
///
/// Both calls must be non-blocking enqueues; they run under the registry lock.
pub trait Transport {
    /// Queues a text frame for the peer.
    fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Requests the transport to close. Closing twice is harmless.
    fn close(&self);
}

/// Weak reference to a session.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SessionHandle {
    pub channel: ChannelName,
    pub generation: u32,
}

/// Result of a join attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JoinOutcome {
    Accepted(SessionHandle),
    Rejected,
}

impl JoinOutcome {
    pub const fn handle(self) -> Option<SessionHandle> {
        match self {
            JoinOutcome::Accepted(handle) => Some(handle),
            JoinOutcome::Rejected => None,
        }
    }
}

/// Failure while sending to a session through its handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplyError {
    /// The session behind the handle no longer occupies its channel.
    Stale,
    /// The transport refused the frame.
    Transport(TransportError),
}

impl From<TransportError> for ReplyError {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyError::Stale => f.write_str("session no longer active"),
            ReplyError::Transport(error) => error.fmt(f),
        }
    }
}

/// Live occupant of a channel.
pub struct Session<T> {
    channel: ChannelName,
    generation: u32,
    peer: PeerAddress,
    transport: T,
}

impl<T> Session<T> {
    pub const fn channel(&self) -> ChannelName {
        self.channel
    }

    pub fn peer(&self) -> &str {
        self.peer.as_str()
    }

    pub const fn handle(&self) -> SessionHandle {
        SessionHandle {
            channel: self.channel,
            generation: self.generation,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

struct Slots<T> {
    sessions: [Option<Session<T>>; 2],
    next_generation: u32,
}

impl<T> Slots<T> {
    fn slot_mut(&mut self, channel: ChannelName) -> &mut Option<Session<T>> {
        &mut self.sessions[channel.index()]
    }

    fn slot(&self, channel: ChannelName) -> Option<&Session<T>> {
        self.sessions[channel.index()].as_ref()
    }

    fn resolve(&self, handle: SessionHandle) -> Option<&Session<T>> {
        self.slot(handle.channel)
            .filter(|session| session.generation == handle.generation)
    }

    fn allocate_generation(&mut self) -> u32 {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        generation
    }
}

/// Arbitrates the Control and Telemetry slots.
pub struct SessionRegistry<M: RawMutex, T> {
    slots: Mutex<M, RefCell<Slots<T>>>,
}

impl<M: RawMutex, T> SessionRegistry<M, T> {
    /// Creates a registry with both channels free.
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(RefCell::new(Slots {
                sessions: [None, None],
                next_generation: 1,
            })),
        }
    }

    /// Returns `true` when a session currently occupies the channel.
    pub fn is_occupied(&self, channel: ChannelName) -> bool {
        self.slots
            .lock(|slots| slots.borrow().slot(channel).is_some())
    }

    /// Returns the handle of the current occupant, if any.
    pub fn handle(&self, channel: ChannelName) -> Option<SessionHandle> {
        self.slots
            .lock(|slots| slots.borrow().slot(channel).map(Session::handle))
    }

    /// Returns the peer address of the current occupant, if any.
    pub fn peer(&self, channel: ChannelName) -> Option<PeerAddress> {
        self.slots.lock(|slots| {
            slots
                .borrow()
                .slot(channel)
                .map(|session| session.peer.clone())
        })
    }

    /// Returns `true` while the handle still resolves to its session.
    pub fn is_live(&self, handle: SessionHandle) -> bool {
        self.slots
            .lock(|slots| slots.borrow().resolve(handle).is_some())
    }

    /// Clears the slot if, and only if, it still holds the session behind
    /// `handle`. Returns `true` when the slot was cleared.
    pub fn leave(&self, handle: SessionHandle) -> bool {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let slot = slots.slot_mut(handle.channel);
            match slot {
                Some(session) if session.generation == handle.generation => {
                    *slot = None;
                    true
                }
                _ => false,
            }
        })
    }
}

impl<M: RawMutex, T: Transport> SessionRegistry<M, T> {
    /// Attempts to occupy `channel` with a newly accepted transport.
    pub fn join(&self, channel: ChannelName, transport: T, peer: &str) -> JoinOutcome {
        let peer = peer_address(peer);

        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();

            if let Some(incumbent) = slots.slot(channel) {
                let frame = handshake_frame("REJECTED", &peer);
                let _ = transport.send_text(&frame);
                let _ = incumbent.transport.send_text(&frame);
                transport.close();
                return JoinOutcome::Rejected;
            }

            let generation = slots.allocate_generation();
            let session = Session {
                channel,
                generation,
                peer,
                transport,
            };
            let _ = session
                .transport
                .send_text(&handshake_frame("HELLO", &session.peer));
            let handle = session.handle();
            *slots.slot_mut(channel) = Some(session);
            JoinOutcome::Accepted(handle)
        })
    }

    /// Sends a frame to the session behind `handle`.
    pub fn send(&self, handle: SessionHandle, text: &str) -> Result<(), ReplyError> {
        self.slots.lock(|slots| {
            let slots = slots.borrow();
            let session = slots.resolve(handle).ok_or(ReplyError::Stale)?;
            session.transport.send_text(text)?;
            Ok(())
        })
    }

    /// Closes and removes the current occupant of `channel`.
    pub fn evict(&self, channel: ChannelName) -> Option<SessionHandle> {
        self.slots.lock(|slots| {
            let session = slots.borrow_mut().slot_mut(channel).take()?;
            session.transport.close();
            Some(session.handle())
        })
    }
}

impl<M: RawMutex, T> Default for SessionRegistry<M, T> {
    fn default() -> Self {
        Self::new()
    }
}

fn peer_address(peer: &str) -> PeerAddress {
    let mut address = PeerAddress::new();
    for ch in peer.chars() {
        if address.push(ch).is_err() {
            break;
        }
    }
    address
}

/// Builds `# <TAG> <peer>` handshake frames.
pub fn handshake_frame(tag: &str, peer: &str) -> String<HANDSHAKE_FRAME_LEN> {
    let mut frame = String::new();
    // The capacity covers the longest tag plus a full-length peer address.
    let _ = write!(frame, "# {tag} <{peer}>");
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;
    use std::string::String as StdString;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        frames: Rc<StdRefCell<Vec<StdString>>>,
        closed: Rc<StdRefCell<bool>>,
    }

    impl RecordingTransport {
        fn frames(&self) -> Vec<StdString> {
            self.frames.borrow().clone()
        }

        fn is_closed(&self) -> bool {
            *self.closed.borrow()
        }
    }

    impl Transport for RecordingTransport {
        fn send_text(&self, text: &str) -> Result<(), TransportError> {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            self.frames.borrow_mut().push(text.to_string());
            Ok(())
        }

        fn close(&self) {
            *self.closed.borrow_mut() = true;
        }
    }

    type Registry = SessionRegistry<NoopRawMutex, RecordingTransport>;

    #[test]
    fn join_on_empty_slot_sends_hello() {
        let registry = Registry::new();
        let transport = RecordingTransport::default();

        let outcome = registry.join(ChannelName::Control, transport.clone(), "10.0.0.7:5123");

        assert!(matches!(outcome, JoinOutcome::Accepted(_)));
        assert_eq!(transport.frames(), ["# HELLO <10.0.0.7:5123>"]);
        assert!(registry.is_occupied(ChannelName::Control));
        assert!(!registry.is_occupied(ChannelName::Telemetry));
    }

    #[test]
    fn conflicting_join_notifies_both_and_keeps_incumbent() {
        let registry = Registry::new();
        let incumbent = RecordingTransport::default();
        let challenger = RecordingTransport::default();

        let first = registry
            .join(ChannelName::Control, incumbent.clone(), "10.0.0.7:5123")
            .handle()
            .expect("first join accepted");
        let second = registry.join(ChannelName::Control, challenger.clone(), "10.0.0.9:6000");

        assert_eq!(second, JoinOutcome::Rejected);
        assert_eq!(challenger.frames(), ["# REJECTED <10.0.0.9:6000>"]);
        assert_eq!(
            incumbent.frames(),
            ["# HELLO <10.0.0.7:5123>", "# REJECTED <10.0.0.9:6000>"]
        );
        assert!(challenger.is_closed());
        assert!(!incumbent.is_closed());
        assert_eq!(registry.handle(ChannelName::Control), Some(first));
    }

    #[test]
    fn channels_are_independent() {
        let registry = Registry::new();
        let control = registry.join(ChannelName::Control, RecordingTransport::default(), "a");
        let telemetry = registry.join(ChannelName::Telemetry, RecordingTransport::default(), "b");
        assert!(matches!(control, JoinOutcome::Accepted(_)));
        assert!(matches!(telemetry, JoinOutcome::Accepted(_)));
    }

    #[test]
    fn leave_frees_the_slot_for_a_new_join() {
        let registry = Registry::new();
        let handle = registry
            .join(ChannelName::Telemetry, RecordingTransport::default(), "a")
            .handle()
            .unwrap();

        assert!(registry.leave(handle));
        assert!(!registry.is_occupied(ChannelName::Telemetry));

        let rejoin = registry.join(ChannelName::Telemetry, RecordingTransport::default(), "b");
        assert!(matches!(rejoin, JoinOutcome::Accepted(_)));
    }

    #[test]
    fn stale_leave_keeps_new_occupant() {
        let registry = Registry::new();
        let old = registry
            .join(ChannelName::Control, RecordingTransport::default(), "a")
            .handle()
            .unwrap();
        assert!(registry.leave(old));

        let new = registry
            .join(ChannelName::Control, RecordingTransport::default(), "b")
            .handle()
            .unwrap();

        assert!(!registry.leave(old));
        assert_eq!(registry.handle(ChannelName::Control), Some(new));
        assert_eq!(registry.peer(ChannelName::Control).as_deref(), Some("b"));
    }

    #[test]
    fn send_through_stale_handle_is_refused() {
        let registry = Registry::new();
        let transport = RecordingTransport::default();
        let handle = registry
            .join(ChannelName::Control, transport.clone(), "a")
            .handle()
            .unwrap();

        assert_eq!(registry.send(handle, "{\"result\": \"ok\"}"), Ok(()));
        registry.leave(handle);
        assert_eq!(registry.send(handle, "late"), Err(ReplyError::Stale));
        assert_eq!(transport.frames().len(), 2);
    }

    #[test]
    fn evict_closes_the_occupant() {
        let registry = Registry::new();
        let transport = RecordingTransport::default();
        let handle = registry
            .join(ChannelName::Control, transport.clone(), "a")
            .handle()
            .unwrap();

        assert_eq!(registry.evict(ChannelName::Control), Some(handle));
        assert!(transport.is_closed());
        assert!(!registry.is_live(handle));
        assert_eq!(registry.evict(ChannelName::Control), None);
    }

    #[test]
    fn paths_resolve_case_insensitively() {
        assert_eq!(
            ChannelName::from_path("/Controller_WS"),
            Some(ChannelName::Control)
        );
        assert_eq!(
            ChannelName::from_path("/motors_ws\r\n"),
            Some(ChannelName::Telemetry)
        );
        assert_eq!(ChannelName::from_path("/"), None);
    }

    #[test]
    fn long_peer_addresses_are_truncated() {
        let registry = Registry::new();
        let transport = RecordingTransport::default();
        let peer = "p".repeat(PEER_ADDRESS_LEN + 10);
        registry.join(ChannelName::Control, transport.clone(), &peer);

        let stored = registry.peer(ChannelName::Control).unwrap();
        assert_eq!(stored.len(), PEER_ADDRESS_LEN);
        assert!(transport.frames()[0].ends_with('>'));
    }
}
