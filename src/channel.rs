//! Channel abstraction between the state machine and the transport.
//!
//! The connection state machine owns exactly one live [`Channel`] at a time
//! and replaces it wholesale on every reconnect attempt. Each channel
//! instance carries a generation number; events tagged with a superseded
//! generation are discarded, so a socket that was already replaced can
//! never drive the current state machine.

use tokio::sync::mpsc;

use crate::error::Result;

/// Monotonic identifier for one channel instance within a session.
pub type ChannelGen = u64;

/// Events delivered by a channel to its owning state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The transport finished its handshake and is ready for frames.
    Opened,
    /// One inbound payload, framed JSON or raw shell output.
    Message(String),
    /// Transport-level failure; a close usually follows.
    Error(String),
    /// The transport is gone.
    Closed,
}

/// A [`ChannelEvent`] tagged with the generation of the channel that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub gen: ChannelGen,
    pub event: ChannelEvent,
}

impl TaggedEvent {
    pub fn new(gen: ChannelGen, event: ChannelEvent) -> Self {
        Self { gen, event }
    }
}

/// Sender half used by channel implementations to deliver events.
pub type EventSender = mpsc::UnboundedSender<TaggedEvent>;

/// Receiver half drained by the session driver.
pub type EventReceiver = mpsc::UnboundedReceiver<TaggedEvent>;

/// One live bidirectional transport instance.
pub trait Channel: Send {
    /// Send one encoded frame. Fails if the transport is gone.
    fn send(&mut self, text: &str) -> Result<()>;

    /// Whether the transport is currently open and ready for frames.
    fn is_open(&self) -> bool;

    /// Close the transport. Safe to call more than once.
    fn close(&mut self);
}

/// Opens new channels for a session.
///
/// `open` must return a handle immediately; the handshake completes in the
/// background and is reported with a [`ChannelEvent::Opened`] event tagged
/// with `gen`. A failed handshake reports `Error` followed by `Closed`.
pub trait ChannelFactory: Send {
    fn open(&mut self, gen: ChannelGen, events: EventSender) -> Box<dyn Channel>;
}
