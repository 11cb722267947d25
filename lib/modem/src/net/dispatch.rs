//! The seam between the protocol core and the application-layer token
//! handlers. The core decodes frames and stream groupings; everything that
//! understands what a token *means* lives behind this trait.

use crate::net::frame::Token;
use crate::net::handshake::SessionState;

/// One decoded application message: the token, the stream it arrived on (if
/// any) and the raw frames that carried it, in arrival order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TokenMessage {
    pub token: Token,
    pub stream_id: Option<u16>,
    pub frames: Vec<Vec<u8>>,
}

/// A frame the collaborator wants sent. Priority frames jump the pacer
/// queue; everything else drains in FIFO order under the window rules.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OutboundFrame {
    pub bytes: Vec<u8>,
    pub label: &'static str,
    pub priority: bool,
}

impl OutboundFrame {
    #[inline]
    pub fn new(bytes: Vec<u8>, label: &'static str) -> OutboundFrame {
        OutboundFrame {
            bytes,
            label,
            priority: false,
        }
    }

    #[inline]
    pub fn priority(bytes: Vec<u8>, label: &'static str) -> OutboundFrame {
        OutboundFrame {
            bytes,
            label,
            priority: true,
        }
    }
}

/// The single capability the core requires of the application layer.
pub trait TokenHandler {
    /// Handles one decoded message, returning the frames to transmit in
    /// response.
    fn handle_token(&mut self, message: TokenMessage, session: &SessionState) -> Vec<OutboundFrame>;

    /// Invoked once while the channel is closing, so the collaborator can
    /// emit a best-effort goodbye. The frame is restamped and flushed if the
    /// transport still accepts writes.
    fn goodbye(&mut self, _session: &SessionState) -> Option<OutboundFrame> {
        None
    }
}

/// Dispatcher that drops every message. Used in tests and as a placeholder
/// while wiring a server together.
pub struct NullDispatcher;

impl TokenHandler for NullDispatcher {
    fn handle_token(&mut self, _message: TokenMessage, _session: &SessionState) -> Vec<OutboundFrame> {
        Vec::new()
    }
}
