//! Session controller: the async driver around one connection.
//!
//! The state machine in [`crate::connection`] is synchronous; this module
//! gives it a runtime. One spawned task per session owns the machine and
//! multiplexes four inputs with `select!`:
//!
//! - commands from the [`SessionHandle`]
//! - channel events from the transport
//! - keystroke chunks from the rendering surface
//! - the single armed retry deadline, when one exists
//!
//! Status is published through a `watch` channel so any number of
//! observers can read the latest value or await transitions.

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::{debug, info};

use crate::channel::{ChannelFactory, EventReceiver};
use crate::connection::{Connection, Status};
use crate::constants::{DEFAULT_COLS, DEFAULT_ROWS};
use crate::surface::{InputReceiver, RenderSurface};

/// Identity of one terminal session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Backend identifier sent in the start frame.
    pub server_id: String,
    /// Human-readable name, for logs and titles.
    pub server_name: String,
}

impl Session {
    pub fn new(server_id: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            server_name: server_name.into(),
        }
    }
}

enum Command {
    Reconnect,
    Resize,
    ToggleFullscreen,
    Close,
}

/// Owner's handle to a running session.
///
/// Dropping the handle closes the session.
pub struct SessionHandle {
    session: Session,
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<Status>,
}

impl SessionHandle {
    /// The session's identity.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Latest published status.
    pub fn status(&self) -> Status {
        *self.status_rx.borrow()
    }

    /// A receiver observing every status transition.
    pub fn status_stream(&self) -> watch::Receiver<Status> {
        self.status_rx.clone()
    }

    /// Drop the current channel and dial a fresh one, resetting the
    /// attempt counter.
    pub fn reconnect(&self) {
        let _ = self.cmd_tx.send(Command::Reconnect);
    }

    /// Re-fit the surface to its container and report the new size.
    pub fn resize(&self) {
        let _ = self.cmd_tx.send(Command::Resize);
    }

    /// Toggle fullscreen presentation, re-fitting the surface.
    pub fn toggle_fullscreen(&self) {
        let _ = self.cmd_tx.send(Command::ToggleFullscreen);
    }

    /// Close the session. Idempotent; dropping the handle does the same.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

/// Spawns and wires session driver tasks.
pub struct SessionController;

impl SessionController {
    /// Open a session: fit the surface, dial the first channel, and spawn
    /// the driver task. Returns immediately; progress is observable on
    /// the handle's status stream.
    pub fn open(
        session: Session,
        factory: Box<dyn ChannelFactory>,
        mut surface: Box<dyn RenderSurface>,
        input_rx: InputReceiver,
    ) -> SessionHandle {
        info!(
            server_id = %session.server_id,
            server_name = %session.server_name,
            "opening session"
        );
        surface.resize_to_fit();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let mut conn = Connection::new(session.server_id.clone(), factory, surface, event_tx);
        conn.open();
        let (status_tx, status_rx) = watch::channel(conn.status());

        tokio::spawn(drive(conn, cmd_rx, event_rx, input_rx, status_tx));

        SessionHandle {
            session,
            cmd_tx,
            status_rx,
        }
    }
}

async fn drive(
    mut conn: Connection,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut event_rx: EventReceiver,
    mut input_rx: InputReceiver,
    status_tx: watch::Sender<Status>,
) {
    let mut fullscreen = false;
    let mut input_open = true;
    let mut retry_at: Option<TokioInstant> = None;

    loop {
        // The machine holds only the backoff duration; the deadline lives
        // here, on the runtime clock, and is armed once per scheduled
        // retry.
        match conn.pending_retry() {
            Some(delay) if retry_at.is_none() => {
                retry_at = Some(TokioInstant::now() + delay);
            }
            Some(_) => {}
            None => retry_at = None,
        }

        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Reconnect) => conn.reconnect(),
                Some(Command::Resize) => resize_pass(&mut conn),
                Some(Command::ToggleFullscreen) => {
                    fullscreen = !fullscreen;
                    debug!(fullscreen, "fullscreen toggled");
                    resize_pass(&mut conn);
                }
                // All handles gone counts as an intentional close.
                Some(Command::Close) | None => conn.teardown(),
            },

            Some(ev) = event_rx.recv() => {
                let was_connected = conn.status() == Status::Connected;
                conn.handle_event(ev);
                // Report the current size as soon as the shell attaches.
                if !was_connected && conn.status() == Status::Connected {
                    resize_pass(&mut conn);
                }
            },

            chunk = input_rx.recv(), if input_open => match chunk {
                Some(bytes) => conn.send_input(&String::from_utf8_lossy(&bytes)),
                None => input_open = false,
            },

            _ = sleep_until(retry_at.unwrap_or_else(TokioInstant::now)), if retry_at.is_some() => {
                conn.retry_elapsed();
            }
        }

        let status = conn.status();
        status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if conn.is_torn_down() {
            break;
        }
    }
    debug!("session driver finished");
}

fn resize_pass(conn: &mut Connection) {
    let surface = conn.surface_mut();
    surface.resize_to_fit();
    // A surface that has not been laid out yet reports zero.
    let rows = match surface.rows() {
        0 => DEFAULT_ROWS,
        rows => rows,
    };
    let cols = match surface.cols() {
        0 => DEFAULT_COLS,
        cols => cols,
    };
    conn.send_resize(rows, cols);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::input_pipe;
    use crate::test_support::{MockSurface, MockTransport};

    fn open_session(transport: &MockTransport, surface: &MockSurface) -> SessionHandle {
        let (_input_tx, input_rx) = input_pipe();
        SessionController::open(
            Session::new("h1", "web-1"),
            Box::new(transport.clone()),
            Box::new(surface.clone()),
            input_rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn open_publishes_connected_status() {
        let transport = MockTransport::new().with_auto_open();
        let surface = MockSurface::new(24, 80);
        let handle = open_session(&transport, &surface);

        let mut status = handle.status_stream();
        status.wait_for(|s| *s == Status::Connected).await.unwrap();
        assert_eq!(transport.open_count(), 1);
        // Surface was fitted at open and again when the shell attached.
        assert!(surface.resize_count() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_tears_down_and_publishes_disconnected() {
        let transport = MockTransport::new().with_auto_open();
        let surface = MockSurface::new(24, 80);
        let handle = open_session(&transport, &surface);

        let mut status = handle.status_stream();
        status.wait_for(|s| *s == Status::Connected).await.unwrap();

        handle.close();
        status
            .wait_for(|s| *s == Status::Disconnected)
            .await
            .unwrap();
        assert_eq!(surface.dispose_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsized_surface_falls_back_to_default_geometry() {
        let transport = MockTransport::new().with_auto_open();
        let surface = MockSurface::new(0, 0);
        let handle = open_session(&transport, &surface);

        let mut status = handle.status_stream();
        status.wait_for(|s| *s == Status::Connected).await.unwrap();

        let sent = transport.sent();
        let (_, last) = sent.last().unwrap();
        let value: serde_json::Value = serde_json::from_str(last).unwrap();
        assert_eq!(value["type"], "terminal:resize");
        assert_eq!(value["rows"], 24);
        assert_eq!(value["cols"], 80);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_closes_the_session() {
        let transport = MockTransport::new().with_auto_open();
        let surface = MockSurface::new(24, 80);
        let handle = open_session(&transport, &surface);

        let mut status = handle.status_stream();
        status.wait_for(|s| *s == Status::Connected).await.unwrap();

        drop(handle);
        status
            .wait_for(|s| *s == Status::Disconnected)
            .await
            .unwrap();
        assert_eq!(surface.dispose_count(), 1);
    }
}
