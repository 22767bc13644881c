//! Terminal session plumbing for a server management console.
//!
//! Connects an embedded terminal widget to a console backend over a
//! WebSocket carrying a small JSON frame protocol, and keeps that link
//! alive through network trouble:
//!
//! - [`protocol`]: the JSON frame codec, with raw passthrough for
//!   unframed shell output
//! - [`policy`]: exponential backoff with a bounded attempt budget
//! - [`connection`]: the per-session state machine
//! - [`session`]: the async driver task and the owner-facing handle
//! - [`ws`]: the WebSocket transport behind the channel traits
//!
//! Rendering is delegated to the embedder through [`RenderSurface`];
//! this crate never draws anything itself.

pub mod channel;
pub mod connection;
pub mod constants;
pub mod error;
pub mod logging;
pub mod policy;
pub mod protocol;
pub mod session;
pub mod surface;
pub mod ws;

#[doc(hidden)]
pub mod test_support;

pub use channel::{Channel, ChannelEvent, ChannelFactory, ChannelGen, TaggedEvent};
pub use connection::{Connection, Status};
pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
pub use policy::{next_delay, should_retry, ReconnectState};
pub use protocol::{Frame, FrameCodec, Inbound};
pub use session::{Session, SessionController, SessionHandle};
pub use surface::{input_pipe, InputReceiver, InputSender, RenderSurface};
pub use ws::{Endpoint, WsChannelFactory};
