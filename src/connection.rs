//! Connection state machine for one terminal session.
//!
//! An explicit struct owning {channel, status, reconnect state} with one
//! method per external stimulus. The machine performs no I/O of its own
//! beyond channel writes and surface writes, and it never touches a clock
//! or a runtime, so it can be constructed and driven synchronously in
//! tests with mock collaborators.
//!
//! Transitions:
//! - `Connecting` -> `Connected` on channel open
//! - `Connected`/`Connecting` -> `Reconnecting` on channel close while the
//!   attempt budget lasts; the backoff delay is armed here and the driver
//!   turns it into a timer
//! - `Reconnecting` -> `Connecting` when that timer fires
//! - any -> `Error` on channel error, or terminally once retries exhaust
//! - any -> `Connecting` on manual reconnect (attempt counter resets)
//! - any -> `Disconnected` on teardown, which suppresses every retry path

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelEvent, ChannelFactory, ChannelGen, EventSender, TaggedEvent};
use crate::constants::MAX_RECONNECT_ATTEMPTS;
use crate::policy::ReconnectState;
use crate::protocol::{Frame, FrameCodec, Inbound};
use crate::surface::RenderSurface;

/// Connection status as surfaced to the embedding UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// A channel is being opened.
    #[default]
    Connecting,
    /// The channel is open and the session is live.
    Connected,
    /// The session was intentionally closed.
    Disconnected,
    /// A channel error occurred, or retries are exhausted.
    Error,
    /// Waiting out a backoff delay before reopening.
    Reconnecting,
}

impl Status {
    /// True while the session may still make progress on its own.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Status::Connecting | Status::Connected | Status::Reconnecting
        )
    }

    /// True for the stable end states that only a manual reconnect or a
    /// fresh session can leave.
    pub fn is_settled(&self) -> bool {
        matches!(self, Status::Disconnected | Status::Error)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Disconnected => "disconnected",
            Status::Error => "error",
            Status::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// State machine owning the channel, status, and reconnect bookkeeping
/// for one session.
pub struct Connection {
    server_id: String,
    status: Status,
    channel: Option<Box<dyn Channel>>,
    channel_gen: ChannelGen,
    reconnect: ReconnectState,
    pending_retry: Option<Duration>,
    torn_down: bool,
    factory: Box<dyn ChannelFactory>,
    surface: Box<dyn RenderSurface>,
    events: EventSender,
}

impl Connection {
    /// Create a machine for `server_id`. No channel exists until [`open`]
    /// is called.
    ///
    /// [`open`]: Connection::open
    pub fn new(
        server_id: impl Into<String>,
        factory: Box<dyn ChannelFactory>,
        surface: Box<dyn RenderSurface>,
        events: EventSender,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            status: Status::Connecting,
            channel: None,
            channel_gen: 0,
            reconnect: ReconnectState::new(),
            pending_retry: None,
            torn_down: false,
            factory,
            surface,
            events,
        }
    }

    /// Open the initial channel.
    pub fn open(&mut self) {
        self.open_channel();
    }

    /// Apply one channel event. Events from a superseded channel are
    /// dropped.
    pub fn handle_event(&mut self, ev: TaggedEvent) {
        if ev.gen != self.channel_gen {
            debug!(
                gen = ev.gen,
                current = self.channel_gen,
                "dropping stale channel event"
            );
            return;
        }
        match ev.event {
            ChannelEvent::Opened => self.on_open(),
            ChannelEvent::Message(text) => self.on_message(&text),
            ChannelEvent::Error(message) => self.on_error(&message),
            ChannelEvent::Closed => self.on_close(),
        }
    }

    /// The armed backoff delay, if any. At most one exists at a time.
    ///
    /// The machine holds no clock; the driver turns this delay into a
    /// timer deadline and reports back through [`retry_elapsed`].
    ///
    /// [`retry_elapsed`]: Connection::retry_elapsed
    pub fn pending_retry(&self) -> Option<Duration> {
        self.pending_retry
    }

    /// The armed backoff delay has elapsed; open a fresh channel.
    ///
    /// A no-op when nothing is armed, so a late timer fire after a manual
    /// reconnect or teardown cannot open a duplicate channel.
    pub fn retry_elapsed(&mut self) {
        if self.torn_down || self.pending_retry.is_none() {
            return;
        }
        self.pending_retry = None;
        debug!(
            server_id = %self.server_id,
            attempt = self.reconnect.attempt,
            "backoff elapsed, reopening channel"
        );
        self.open_channel();
    }

    /// Manual reconnect: cancel any armed retry, reset the attempt
    /// counter, close a stale channel if present, and open a fresh one.
    ///
    /// Ignored after teardown; a closed session stays closed.
    pub fn reconnect(&mut self) {
        if self.torn_down {
            warn!(server_id = %self.server_id, "reconnect requested after teardown, ignoring");
            return;
        }
        info!(server_id = %self.server_id, "manual reconnect");
        self.pending_retry = None;
        self.reconnect.reset();
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.open_channel();
    }

    /// Tear the session down. Idempotent.
    ///
    /// The order is an invariant: suppress reconnection first, then disarm
    /// the retry deadline, close the live channel, and release the
    /// surface. Reversing it would race a fresh reconnect attempt against
    /// the teardown.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        info!(server_id = %self.server_id, "session teardown");
        self.torn_down = true;
        self.pending_retry = None;
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.surface.dispose();
        self.status = Status::Disconnected;
    }

    /// Whether teardown has run.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Forward keystrokes from the surface.
    ///
    /// Silently dropped while the channel is not open; there is no
    /// buffering or replay across reconnection windows.
    pub fn send_input(&mut self, data: &str) {
        if !self.channel_open() {
            debug!(
                server_id = %self.server_id,
                len = data.len(),
                "dropping input while disconnected"
            );
            return;
        }
        self.send_frame(&Frame::Input {
            data: data.to_string(),
        });
    }

    /// Report a new surface size to the remote side, only while open.
    pub fn send_resize(&mut self, rows: u16, cols: u16) {
        if !self.channel_open() {
            return;
        }
        self.send_frame(&Frame::Resize { rows, cols });
    }

    /// Whether the live channel reports itself open and ready.
    pub fn channel_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Reconnection bookkeeping, for display and tests.
    pub fn reconnect_state(&self) -> &ReconnectState {
        &self.reconnect
    }

    /// The rendering surface, for resize passes.
    pub fn surface_mut(&mut self) -> &mut dyn RenderSurface {
        self.surface.as_mut()
    }

    fn open_channel(&mut self) {
        self.channel_gen += 1;
        debug!(
            server_id = %self.server_id,
            gen = self.channel_gen,
            "opening channel"
        );
        let channel = self.factory.open(self.channel_gen, self.events.clone());
        self.channel = Some(channel);
        self.status = Status::Connecting;
    }

    fn on_open(&mut self) {
        if self.torn_down {
            return;
        }
        info!(
            server_id = %self.server_id,
            reconnects = self.reconnect.attempt,
            "channel connected"
        );
        self.status = Status::Connected;
        self.reconnect.reset();
        self.pending_retry = None;
        self.send_frame(&Frame::Start {
            server_id: self.server_id.clone(),
        });
    }

    fn on_message(&mut self, text: &str) {
        match FrameCodec::decode(text) {
            Inbound::Frame(Frame::Data { data }) => self.surface.write(data.as_bytes()),
            Inbound::Frame(Frame::Error { message }) => {
                warn!(server_id = %self.server_id, message = %message, "remote terminal error");
                self.write_advisory(&format!("terminal error: {message}"));
            }
            Inbound::Frame(Frame::Closed { message }) => {
                info!(server_id = %self.server_id, message = %message, "remote terminal closed");
                self.write_advisory(&message);
            }
            Inbound::Frame(Frame::Connected { message }) => {
                self.write_advisory(&message);
            }
            Inbound::Frame(frame) => {
                // Outbound-only frame echoed back; nothing to route.
                debug!(?frame, "ignoring echoed outbound frame");
            }
            Inbound::Ignored => {}
            Inbound::Raw(raw) => self.surface.write(raw.as_bytes()),
        }
    }

    fn on_error(&mut self, message: &str) {
        if self.torn_down {
            return;
        }
        warn!(server_id = %self.server_id, error = %message, "channel error");
        // Marking only; the close event that follows decides whether a
        // retry is scheduled.
        self.status = Status::Error;
    }

    fn on_close(&mut self) {
        // A close for a channel we no longer hold is a duplicate report
        // on the current generation and must not consume retry budget.
        if self.channel.take().is_none() {
            debug!(server_id = %self.server_id, "ignoring close with no channel held");
            return;
        }
        if self.torn_down {
            self.status = Status::Disconnected;
            return;
        }
        match self.reconnect.schedule() {
            Some(delay) => {
                info!(
                    server_id = %self.server_id,
                    attempt = self.reconnect.attempt,
                    max_attempts = MAX_RECONNECT_ATTEMPTS,
                    delay_ms = delay.as_millis() as u64,
                    "channel closed, reconnect scheduled"
                );
                self.pending_retry = Some(delay);
                self.status = Status::Reconnecting;
                self.write_advisory(&format!(
                    "connection lost, retrying in {}s (attempt {}/{})",
                    delay.as_secs(),
                    self.reconnect.attempt,
                    MAX_RECONNECT_ATTEMPTS
                ));
            }
            None => {
                warn!(
                    server_id = %self.server_id,
                    attempts = self.reconnect.attempt,
                    "reconnect attempts exhausted"
                );
                self.pending_retry = None;
                self.status = Status::Error;
                self.write_advisory("connection lost, reconnect attempts exhausted");
            }
        }
    }

    fn send_frame(&mut self, frame: &Frame) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        match FrameCodec::encode(frame) {
            Ok(text) => {
                if let Err(e) = channel.send(&text) {
                    warn!(server_id = %self.server_id, error = %e, "channel send failed");
                }
            }
            Err(e) => warn!(server_id = %self.server_id, error = %e, "frame encode failed"),
        }
    }

    // Advisory lines ride the output stream itself, next to the status
    // value the UI shows.
    fn write_advisory(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let line = format!("\r\n[{text}]\r\n");
        self.surface.write(line.as_bytes());
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server_id", &self.server_id)
            .field("status", &self.status)
            .field("channel_gen", &self.channel_gen)
            .field("reconnect", &self.reconnect)
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockSurface, MockTransport};
    use crate::channel::EventReceiver;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        conn: Connection,
        transport: MockTransport,
        surface: MockSurface,
        #[allow(dead_code)]
        events: EventReceiver,
    }

    fn fixture(server_id: &str) -> Fixture {
        let (event_tx, events) = mpsc::unbounded_channel();
        let transport = MockTransport::new();
        let surface = MockSurface::new(24, 80);
        let conn = Connection::new(
            server_id,
            Box::new(transport.clone()),
            Box::new(surface.clone()),
            event_tx,
        );
        Fixture {
            conn,
            transport,
            surface,
            events,
        }
    }

    fn ev(gen: ChannelGen, event: ChannelEvent) -> TaggedEvent {
        TaggedEvent::new(gen, event)
    }

    /// Open the channel and walk it to connected.
    fn connect(f: &mut Fixture) {
        f.conn.open();
        let gen = f.transport.current_gen();
        f.transport.set_open(gen, true);
        f.conn.handle_event(ev(gen, ChannelEvent::Opened));
    }

    #[test]
    fn initial_open_is_connecting() {
        let mut f = fixture("h1");
        f.conn.open();
        assert_eq!(f.conn.status(), Status::Connecting);
        assert_eq!(f.transport.open_count(), 1);
    }

    #[test]
    fn open_event_sends_start_frame() {
        let mut f = fixture("h1");
        connect(&mut f);

        assert_eq!(f.conn.status(), Status::Connected);
        let sent = f.transport.sent();
        assert_eq!(sent.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(value["type"], "terminal:start");
        assert_eq!(value["serverId"], "h1");
    }

    #[test]
    fn connected_resets_attempt_counter() {
        let mut f = fixture("h1");
        connect(&mut f);
        f.conn.handle_event(ev(1, ChannelEvent::Closed));
        assert_eq!(f.conn.reconnect_state().attempt, 1);

        f.conn.retry_elapsed();
        let gen = f.transport.current_gen();
        f.transport.set_open(gen, true);
        f.conn.handle_event(ev(gen, ChannelEvent::Opened));

        assert_eq!(f.conn.reconnect_state().attempt, 0);
        assert_eq!(f.conn.status(), Status::Connected);
    }

    #[test]
    fn data_frame_written_verbatim() {
        let mut f = fixture("h1");
        connect(&mut f);

        f.conn.handle_event(ev(
            1,
            ChannelEvent::Message(r#"{"type":"terminal:data","data":"total 4\r\n"}"#.into()),
        ));
        assert_eq!(f.surface.written(), b"total 4\r\n");
    }

    #[test]
    fn raw_payload_written_verbatim() {
        let mut f = fixture("h1");
        connect(&mut f);

        f.conn
            .handle_event(ev(1, ChannelEvent::Message("plain $ ls\r\n".into())));
        assert_eq!(f.surface.written(), b"plain $ ls\r\n");
    }

    #[test]
    fn unknown_frame_type_is_dropped() {
        let mut f = fixture("h1");
        connect(&mut f);

        f.conn.handle_event(ev(
            1,
            ChannelEvent::Message(r#"{"type":"terminal:metrics","cpu":1}"#.into()),
        ));
        assert!(f.surface.written().is_empty());
    }

    #[test]
    fn advisory_frames_write_status_lines() {
        let mut f = fixture("h1");
        connect(&mut f);

        f.conn.handle_event(ev(
            1,
            ChannelEvent::Message(r#"{"type":"terminal:error","message":"shell died"}"#.into()),
        ));
        let text = String::from_utf8(f.surface.written()).unwrap();
        assert!(text.contains("terminal error: shell died"));
        // Advisory, not control flow: status is untouched.
        assert_eq!(f.conn.status(), Status::Connected);
    }

    #[test]
    fn close_schedules_first_retry_at_one_second() {
        let mut f = fixture("h1");
        connect(&mut f);

        f.conn.handle_event(ev(1, ChannelEvent::Closed));

        assert_eq!(f.conn.status(), Status::Reconnecting);
        assert!(f.conn.pending_retry().is_some());
        assert_eq!(
            f.conn.reconnect_state().last_delay,
            Some(Duration::from_millis(1000))
        );
        // Reopen happens only when the deadline fires.
        assert_eq!(f.transport.open_count(), 1);
    }

    #[test]
    fn duplicate_close_on_current_generation_keeps_budget() {
        let mut f = fixture("h1");
        connect(&mut f);

        f.conn.handle_event(ev(1, ChannelEvent::Closed));
        assert_eq!(f.conn.reconnect_state().attempt, 1);

        // The generation only advances when the retry fires, so a second
        // close report for the same socket passes the staleness filter.
        // It must not consume another attempt or disturb the armed delay.
        f.conn.handle_event(ev(1, ChannelEvent::Closed));
        assert_eq!(f.conn.reconnect_state().attempt, 1);
        assert_eq!(f.conn.status(), Status::Reconnecting);
        assert_eq!(f.conn.pending_retry(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn five_failed_reopens_end_in_terminal_error() {
        let mut f = fixture("h1");
        connect(&mut f);

        let expected_delays = [1000u64, 2000, 4000, 8000, 16_000];
        f.conn.handle_event(ev(1, ChannelEvent::Closed));

        for (i, expected) in expected_delays.iter().enumerate() {
            assert_eq!(f.conn.status(), Status::Reconnecting, "attempt {}", i + 1);
            assert_eq!(
                f.conn.reconnect_state().last_delay,
                Some(Duration::from_millis(*expected))
            );
            f.conn.retry_elapsed();
            assert_eq!(f.conn.status(), Status::Connecting);
            let gen = f.transport.current_gen();
            f.conn.handle_event(ev(gen, ChannelEvent::Closed));
        }

        // Budget exhausted: terminal error, nothing armed, no sixth reopen.
        assert_eq!(f.conn.status(), Status::Error);
        assert!(f.conn.pending_retry().is_none());
        assert_eq!(f.transport.open_count(), 6); // initial + 5 reopens
        f.conn.retry_elapsed();
        assert_eq!(f.transport.open_count(), 6);
    }

    #[test]
    fn error_event_marks_status_but_close_still_retries() {
        let mut f = fixture("h1");
        connect(&mut f);

        f.conn
            .handle_event(ev(1, ChannelEvent::Error("reset by peer".into())));
        assert_eq!(f.conn.status(), Status::Error);

        f.conn.handle_event(ev(1, ChannelEvent::Closed));
        assert_eq!(f.conn.status(), Status::Reconnecting);
    }

    #[test]
    fn manual_reconnect_cancels_pending_retry() {
        let mut f = fixture("h1");
        connect(&mut f);
        f.conn.handle_event(ev(1, ChannelEvent::Closed));
        assert!(f.conn.pending_retry().is_some());

        f.conn.reconnect();

        assert_eq!(f.conn.status(), Status::Connecting);
        assert!(f.conn.pending_retry().is_none());
        assert_eq!(f.conn.reconnect_state().attempt, 0);
        assert_eq!(f.transport.open_count(), 2);

        // A stale timer fire after the cancel must not open a duplicate.
        f.conn.retry_elapsed();
        assert_eq!(f.transport.open_count(), 2);
    }

    #[test]
    fn manual_reconnect_closes_stale_channel() {
        let mut f = fixture("h1");
        connect(&mut f);

        f.conn.reconnect();

        assert_eq!(f.transport.close_count(1), 1);
        assert_eq!(f.transport.open_count(), 2);
    }

    #[test]
    fn manual_reconnect_recovers_from_terminal_error() {
        let mut f = fixture("h1");
        connect(&mut f);
        f.conn.handle_event(ev(1, ChannelEvent::Closed));
        for _ in 0..5 {
            f.conn.retry_elapsed();
            let gen = f.transport.current_gen();
            f.conn.handle_event(ev(gen, ChannelEvent::Closed));
        }
        assert_eq!(f.conn.status(), Status::Error);

        f.conn.reconnect();
        let gen = f.transport.current_gen();
        f.transport.set_open(gen, true);
        f.conn.handle_event(ev(gen, ChannelEvent::Opened));
        assert_eq!(f.conn.status(), Status::Connected);
    }

    #[test]
    fn stale_generation_events_are_dropped() {
        let mut f = fixture("h1");
        connect(&mut f);
        f.conn.reconnect(); // now at gen 2

        // Events from the replaced gen-1 socket arrive late.
        f.conn.handle_event(ev(1, ChannelEvent::Closed));
        assert_eq!(f.conn.status(), Status::Connecting);
        assert!(f.conn.pending_retry().is_none());

        f.conn
            .handle_event(ev(1, ChannelEvent::Message("ghost output".into())));
        assert!(f.surface.written().is_empty());
    }

    #[test]
    fn input_sent_while_open_wrapped_in_frame() {
        let mut f = fixture("h1");
        connect(&mut f);

        f.conn.send_input("ls\r");

        let sent = f.transport.sent();
        let value: serde_json::Value = serde_json::from_str(&sent.last().unwrap().1).unwrap();
        assert_eq!(value["type"], "terminal:input");
        assert_eq!(value["data"], "ls\r");
    }

    #[test]
    fn input_dropped_while_disconnected() {
        let mut f = fixture("h1");
        connect(&mut f);
        f.transport.set_open(1, false);

        f.conn.send_input("echo lost\r");

        // Only the start frame was ever sent.
        assert_eq!(f.transport.sent().len(), 1);
    }

    #[test]
    fn resize_sent_only_while_open() {
        let mut f = fixture("h1");
        f.conn.open();
        f.conn.send_resize(50, 120);
        assert!(f.transport.sent().is_empty());

        f.transport.set_open(1, true);
        f.conn.handle_event(ev(1, ChannelEvent::Opened));
        f.conn.send_resize(50, 120);

        let sent = f.transport.sent();
        let value: serde_json::Value = serde_json::from_str(&sent.last().unwrap().1).unwrap();
        assert_eq!(value["type"], "terminal:resize");
        assert_eq!(value["rows"], 50);
        assert_eq!(value["cols"], 120);
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut f = fixture("h1");
        connect(&mut f);

        f.conn.teardown();
        assert_eq!(f.conn.status(), Status::Disconnected);
        assert_eq!(f.transport.close_count(1), 1);
        assert_eq!(f.surface.dispose_count(), 1);

        f.conn.teardown();
        assert_eq!(f.transport.close_count(1), 1);
        assert_eq!(f.surface.dispose_count(), 1);
        assert!(f.conn.pending_retry().is_none());
    }

    #[test]
    fn teardown_suppresses_reconnect_path() {
        let mut f = fixture("h1");
        connect(&mut f);
        f.conn.teardown();

        // The close event for the channel we just closed arrives afterwards.
        f.conn.handle_event(ev(1, ChannelEvent::Closed));
        assert_eq!(f.conn.status(), Status::Disconnected);
        assert!(f.conn.pending_retry().is_none());
        assert_eq!(f.transport.open_count(), 1);

        // And a manual reconnect on a closed session is refused.
        f.conn.reconnect();
        assert_eq!(f.conn.status(), Status::Disconnected);
        assert_eq!(f.transport.open_count(), 1);
    }

    #[test]
    fn teardown_while_reconnecting_disarms_timer() {
        let mut f = fixture("h1");
        connect(&mut f);
        f.conn.handle_event(ev(1, ChannelEvent::Closed));
        assert!(f.conn.pending_retry().is_some());

        f.conn.teardown();
        assert!(f.conn.pending_retry().is_none());

        f.conn.retry_elapsed();
        assert_eq!(f.transport.open_count(), 1);
    }

    #[test]
    fn status_predicates() {
        assert!(Status::Connecting.is_live());
        assert!(Status::Connected.is_live());
        assert!(Status::Reconnecting.is_live());
        assert!(!Status::Error.is_live());

        assert!(Status::Error.is_settled());
        assert!(Status::Disconnected.is_settled());
        assert!(!Status::Connected.is_settled());
    }
}
