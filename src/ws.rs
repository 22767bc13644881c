//! WebSocket transport implementing the channel contract.
//!
//! Each opened channel spawns one socket task owning the whole connect,
//! read, write, close lifecycle. The [`Channel`] handle returned to the
//! state machine is just an outbound queue plus an open flag; the task
//! reports everything else through generation-tagged channel events, so
//! a socket that outlives its replacement cannot confuse the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, ChannelEvent, ChannelFactory, ChannelGen, EventSender, TaggedEvent};
use crate::constants::TERMINAL_WS_PATH;
use crate::error::{Error, Result};

/// Where and how to reach the console backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// HTTP origin of the console, e.g. `https://console.example.com`.
    pub origin: String,
    /// Bearer token passed as a query parameter during the handshake.
    pub token: String,
}

impl Endpoint {
    pub fn new(origin: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            token: token.into(),
        }
    }

    /// Derive the terminal WebSocket URL from the HTTP origin.
    ///
    /// `https` maps to `wss` and `http` to `ws`; anything else is
    /// rejected rather than guessed at.
    pub fn ws_url(&self) -> Result<String> {
        let origin = self.origin.trim_end_matches('/');
        let ws_base = if let Some(rest) = origin.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = origin.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(Error::InvalidEndpoint {
                message: format!("origin must be http(s), got {origin:?}"),
            });
        };
        Ok(format!("{ws_base}{TERMINAL_WS_PATH}?token={}", self.token))
    }
}

enum Outbound {
    Text(String),
    Close,
}

/// Opens one WebSocket per channel generation.
pub struct WsChannelFactory {
    endpoint: Endpoint,
}

impl WsChannelFactory {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

impl ChannelFactory for WsChannelFactory {
    fn open(&mut self, gen: ChannelGen, events: EventSender) -> Box<dyn Channel> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let url = self.endpoint.ws_url();
        tokio::spawn(run_socket(url, gen, events, out_rx, Arc::clone(&open)));
        Box::new(WsChannel { out_tx, open })
    }
}

struct WsChannel {
    out_tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl Channel for WsChannel {
    fn send(&mut self, text: &str) -> Result<()> {
        self.out_tx
            .send(Outbound::Text(text.to_string()))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::Release);
        let _ = self.out_tx.send(Outbound::Close);
    }
}

/// Socket task: connect, then pump frames both ways until either side
/// ends. Always finishes with a `Closed` event.
async fn run_socket(
    url: Result<String>,
    gen: ChannelGen,
    events: EventSender,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    open: Arc<AtomicBool>,
) {
    let report = |event: ChannelEvent| {
        let _ = events.send(TaggedEvent::new(gen, event));
    };

    let url = match url {
        Ok(url) => url,
        Err(e) => {
            report(ChannelEvent::Error(e.to_string()));
            report(ChannelEvent::Closed);
            return;
        }
    };

    debug!(gen, "connecting websocket");
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!(gen, error = %e, "websocket connect failed");
            report(ChannelEvent::Error(e.to_string()));
            report(ChannelEvent::Closed);
            return;
        }
    };

    open.store(true, Ordering::Release);
    report(ChannelEvent::Opened);

    let (mut sink, mut reader) = stream.split();
    loop {
        tokio::select! {
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    trace!(gen, len = text.len(), "websocket text");
                    report(ChannelEvent::Message(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    report(ChannelEvent::Message(
                        String::from_utf8_lossy(&data).into_owned(),
                    ));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong handled by the library
                Some(Err(e)) => {
                    warn!(gen, error = %e, "websocket read failed");
                    report(ChannelEvent::Error(e.to_string()));
                    break;
                }
            },
            outbound = out_rx.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(gen, error = %e, "websocket write failed");
                        report(ChannelEvent::Error(e.to_string()));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    open.store(false, Ordering::Release);
    debug!(gen, "websocket closed");
    report(ChannelEvent::Closed);
}
