//! Core domain types shared by both ends of a bridge

use bytes::Bytes;
use std::fmt;

/// WebSocket close code for a normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code for an unexpected condition on the server
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Type tag carried by every relayed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Text,
    Binary,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Text => write!(f, "text"),
            FrameKind::Binary => write!(f, "binary"),
        }
    }
}

/// A payload together with its type tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    pub kind: FrameKind,
}

impl Frame {
    /// Create a binary frame
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            kind: FrameKind::Binary,
        }
    }

    /// Create a text frame
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            payload: Bytes::from(payload.into()),
            kind: FrameKind::Text,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Close code and reason attached to a WebSocket close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    /// A normal closure with no reason text
    pub fn normal() -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: String::new(),
        }
    }

    /// Whether this close signals an orderly shutdown
    pub fn is_normal(&self) -> bool {
        self.code == CLOSE_NORMAL
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.reason)
        }
    }
}

/// One item of a message-stream connection, independent of the WebSocket
/// library on either side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Data(Frame),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseReason>),
}

impl WsMessage {
    /// Whether this message ends the stream abnormally
    ///
    /// A close without a code counts as normal.
    pub fn is_abnormal_close(&self) -> bool {
        match self {
            WsMessage::Close(Some(reason)) => !reason.is_normal(),
            _ => false,
        }
    }
}

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        WsMessage::Data(frame)
    }
}
