//! Contract with the external terminal-rendering surface.
//!
//! The surface is the widget that turns bytes into glyphs and keystrokes
//! into bytes; rendering itself is out of scope here. The session driver
//! writes output through this trait, and keystrokes flow the other way as
//! an `mpsc` stream of byte chunks handed to the controller at open time.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Narrow interface to the terminal widget backing a session.
pub trait RenderSurface: Send {
    /// Display raw terminal output verbatim.
    fn write(&mut self, data: &[u8]);

    /// Re-measure the containing element and adopt its size.
    fn resize_to_fit(&mut self);

    /// Current row count.
    fn rows(&self) -> u16;

    /// Current column count.
    fn cols(&self) -> u16;

    /// Release the widget. Called exactly once, during session teardown.
    fn dispose(&mut self);
}

/// Sender half for keystroke chunks produced by the surface.
pub type InputSender = mpsc::UnboundedSender<Bytes>;

/// Receiver half consumed by the session driver.
pub type InputReceiver = mpsc::UnboundedReceiver<Bytes>;

/// Create the keystroke pipe wiring a surface to a session.
pub fn input_pipe() -> (InputSender, InputReceiver) {
    mpsc::unbounded_channel()
}
