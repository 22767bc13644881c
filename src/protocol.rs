//! JSON frame protocol for console terminal sessions.
//!
//! Every frame is a single JSON object tagged by a `type` field, with
//! camelCase payload fields on the wire. The framing is deliberately
//! dual-mode: inbound payloads that fail JSON parsing are legitimate
//! unframed shell output and must be forwarded to the rendering surface
//! verbatim, never treated as an error.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A typed message exchanged over the channel.
///
/// Outbound frames are `Start`, `Input`, and `Resize`; the remaining
/// variants arrive from the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Ask the remote side to attach a shell for the given host.
    #[serde(rename = "terminal:start")]
    Start {
        #[serde(rename = "serverId")]
        server_id: String,
    },

    /// Raw keystrokes from the rendering surface.
    #[serde(rename = "terminal:input")]
    Input { data: String },

    /// The local surface changed size.
    #[serde(rename = "terminal:resize")]
    Resize { rows: u16, cols: u16 },

    /// Shell output to display verbatim.
    #[serde(rename = "terminal:data")]
    Data {
        #[serde(default)]
        data: String,
    },

    /// Advisory: the remote shell reported an error.
    #[serde(rename = "terminal:error")]
    Error {
        #[serde(default)]
        message: String,
    },

    /// Advisory: the remote shell ended.
    #[serde(rename = "terminal:closed")]
    Closed {
        #[serde(default)]
        message: String,
    },

    /// Advisory: the remote side confirmed the session.
    #[serde(rename = "connected")]
    Connected {
        #[serde(default)]
        message: String,
    },
}

/// Result of decoding one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A well-formed frame with a known `type`.
    Frame(Frame),
    /// Valid JSON with an unknown or missing `type`; dropped so newer
    /// servers can add frame types without breaking older clients.
    Ignored,
    /// Not JSON: raw terminal bytes, forwarded unmodified.
    Raw(String),
}

/// Codec for the JSON frame protocol.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame to its wire text.
    pub fn encode(frame: &Frame) -> Result<String> {
        serde_json::to_string(frame).map_err(|e| Error::Codec {
            message: format!("frame serialization failed: {e}"),
        })
    }

    /// Decode one inbound payload.
    ///
    /// Never fails: anything that does not parse as JSON is raw output.
    pub fn decode(text: &str) -> Inbound {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => match Frame::deserialize(&value) {
                Ok(frame) => Inbound::Frame(frame),
                Err(_) => Inbound::Ignored,
            },
            Err(_) => Inbound::Raw(text.to_string()),
        }
    }
}
