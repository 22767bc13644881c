//! Scriptable mock transport and surface for tests.
//!
//! Kept in the library (hidden from docs) so the unit tests and the
//! integration tests in `tests/` drive the exact same mocks. Both mocks
//! are cheap clones around shared state, letting a test hold a handle
//! while the connection owns the boxed trait object.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::{Channel, ChannelEvent, ChannelFactory, ChannelGen, EventSender, TaggedEvent};
use crate::error::{Error, Result};
use crate::surface::RenderSurface;

#[derive(Default)]
struct TransportState {
    opens: usize,
    last_gen: ChannelGen,
    auto_open: bool,
    fail_sends: bool,
    sent: Vec<(ChannelGen, String)>,
    open_flags: HashMap<ChannelGen, bool>,
    closes: HashMap<ChannelGen, usize>,
    senders: HashMap<ChannelGen, EventSender>,
}

/// Factory whose channels record traffic and replay scripted events.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every opened channel complete its handshake immediately.
    pub fn with_auto_open(self) -> Self {
        self.lock().auto_open = true;
        self
    }

    /// Make every send fail, as a closed socket would.
    pub fn fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Number of channels opened so far.
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Generation of the most recently opened channel.
    pub fn current_gen(&self) -> ChannelGen {
        self.lock().last_gen
    }

    /// Flip the open flag of one channel without emitting an event.
    pub fn set_open(&self, gen: ChannelGen, open: bool) {
        self.lock().open_flags.insert(gen, open);
    }

    /// Everything sent so far, tagged by channel generation.
    pub fn sent(&self) -> Vec<(ChannelGen, String)> {
        self.lock().sent.clone()
    }

    /// How many times `close` ran on the given channel.
    pub fn close_count(&self, gen: ChannelGen) -> usize {
        self.lock().closes.get(&gen).copied().unwrap_or(0)
    }

    /// Deliver an event as if the channel of generation `gen` produced it.
    ///
    /// `Opened` and `Closed` also flip the open flag the way a real
    /// transport would.
    pub fn emit(&self, gen: ChannelGen, event: ChannelEvent) {
        let mut state = self.lock();
        match event {
            ChannelEvent::Opened => {
                state.open_flags.insert(gen, true);
            }
            ChannelEvent::Closed => {
                state.open_flags.insert(gen, false);
            }
            _ => {}
        }
        if let Some(sender) = state.senders.get(&gen) {
            let _ = sender.send(TaggedEvent::new(gen, event));
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ChannelFactory for MockTransport {
    fn open(&mut self, gen: ChannelGen, events: EventSender) -> Box<dyn Channel> {
        let mut state = self.lock();
        state.opens += 1;
        state.last_gen = gen;
        state.senders.insert(gen, events.clone());
        let auto_open = state.auto_open;
        state.open_flags.insert(gen, auto_open);
        drop(state);
        if auto_open {
            let _ = events.send(TaggedEvent::new(gen, ChannelEvent::Opened));
        }
        Box::new(MockChannel {
            gen,
            state: Arc::clone(&self.state),
        })
    }
}

struct MockChannel {
    gen: ChannelGen,
    state: Arc<Mutex<TransportState>>,
}

impl MockChannel {
    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Channel for MockChannel {
    fn send(&mut self, text: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_sends {
            return Err(Error::ConnectionClosed);
        }
        state.sent.push((self.gen, text.to_string()));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open_flags.get(&self.gen).copied().unwrap_or(false)
    }

    fn close(&mut self) {
        let mut state = self.lock();
        *state.closes.entry(self.gen).or_insert(0) += 1;
        state.open_flags.insert(self.gen, false);
    }
}

#[derive(Default)]
struct SurfaceState {
    rows: u16,
    cols: u16,
    written: Vec<u8>,
    resizes: usize,
    disposes: usize,
}

/// Surface that records everything written to it.
#[derive(Clone)]
pub struct MockSurface {
    state: Arc<Mutex<SurfaceState>>,
}

impl MockSurface {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(SurfaceState {
                rows,
                cols,
                ..Default::default()
            })),
        }
    }

    /// Change the size reported after the next `resize_to_fit`.
    pub fn set_size(&self, rows: u16, cols: u16) {
        let mut state = self.lock();
        state.rows = rows;
        state.cols = cols;
    }

    /// All bytes written so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn resize_count(&self) -> usize {
        self.lock().resizes
    }

    pub fn dispose_count(&self) -> usize {
        self.lock().disposes
    }

    fn lock(&self) -> MutexGuard<'_, SurfaceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RenderSurface for MockSurface {
    fn write(&mut self, data: &[u8]) {
        self.lock().written.extend_from_slice(data);
    }

    fn resize_to_fit(&mut self) {
        self.lock().resizes += 1;
    }

    fn rows(&self) -> u16 {
        self.lock().rows
    }

    fn cols(&self) -> u16 {
        self.lock().cols
    }

    fn dispose(&mut self) {
        self.lock().disposes += 1;
    }
}
