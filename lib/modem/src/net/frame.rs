//! P3 wire-format constants and field access over raw frame bytes.
//!
//! Frame layout: magic (0), CRC-16 big-endian (1-2), declared length (3-4),
//! TX sequence (5), RX sequence (6), type (7). Full frames carry a two-byte
//! token at 8-9 and, depending on the token, an embedded stream identifier
//! from offset 10. An optional single 0x0D terminator may trail the frame.

use byteorder::{BigEndian, ByteOrder};
use std::cmp;
use std::fmt;

pub const MAGIC: u8 = 0x5A;
pub const TERMINATOR: u8 = 0x0D;

pub const HEADER_SIZE: usize = 8;
pub const SHORT_FRAME_SIZE: usize = 9;
pub const TOKEN_OFFSET: usize = 8;
pub const STREAM_ID_OFFSET: usize = 10;
pub const EXT_HEADER_SIZE: usize = 12;

pub const TYPE_DATA: u8 = 0x20;
pub const TYPE_SS: u8 = 0x21;
pub const TYPE_SSR: u8 = 0x22;
pub const TYPE_INIT: u8 = 0x23;
pub const TYPE_ACK: u8 = 0x24;
pub const TYPE_NAK: u8 = 0x25;
pub const TYPE_HEARTBEAT: u8 = 0x26;

// Client-side short control family.
pub const CTL_INIT: u8 = 0xA3;
pub const CTL_WINDOW_OPEN: u8 = 0xA4;
pub const CTL_KEEPALIVE: u8 = 0xA5;
pub const CTL_WINDOW_OPEN_NO_RESPONSE: u8 = 0xA6;

/// Two ASCII-range bytes identifying the application command family.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Token(pub [u8; 2]);

impl Token {
    #[inline]
    pub fn as_u16(self) -> u16 {
        u16::from(self.0[0]) << 8 | u16::from(self.0[1])
    }

    /// Number of stream-identifier bytes embedded ahead of the application
    /// payload, derived from the case pattern of the two token characters.
    #[inline]
    pub fn embedded_id_bytes(self) -> usize {
        match (self.0[0].is_ascii_uppercase(), self.0[1].is_ascii_uppercase()) {
            (true, true) => 2,
            (true, false) => 3,
            (false, false) => 4,
            (false, true) => 0,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.iter().all(|byte| byte.is_ascii_graphic()) {
            write!(f, "{}{}", self.0[0] as char, self.0[1] as char)
        } else {
            write!(f, "{:02x}{:02x}", self.0[0], self.0[1])
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FrameKind {
    ShortControl(u8),
    Init,
    Data(Token),
    Other(u8),
}

#[inline]
pub fn is_control_family(frame_type: u8) -> bool {
    frame_type & 0xF0 == 0xA0
}

#[inline]
pub fn declared_len(frame: &[u8]) -> usize {
    if frame.len() < 5 {
        return 0;
    }

    BigEndian::read_u16(&frame[3..5]) as usize
}

#[inline]
pub fn tx(frame: &[u8]) -> u8 {
    frame[5]
}

#[inline]
pub fn rx(frame: &[u8]) -> u8 {
    frame[6]
}

#[inline]
pub fn frame_type(frame: &[u8]) -> u8 {
    frame[7]
}

#[inline]
pub fn token(frame: &[u8]) -> Option<Token> {
    if frame.len() >= TOKEN_OFFSET + 2 {
        Some(Token([frame[TOKEN_OFFSET], frame[TOKEN_OFFSET + 1]]))
    } else {
        None
    }
}

/// End of the declared frame body; excludes a trailing terminator that sits
/// beyond the declared length.
#[inline]
pub fn body_end(frame: &[u8]) -> usize {
    cmp::min(6 + declared_len(frame), frame.len())
}

/// The application payload of a full frame (everything after the type byte,
/// within the declared length).
#[inline]
pub fn app_payload(frame: &[u8]) -> &[u8] {
    let end = body_end(frame);

    if end <= TOKEN_OFFSET {
        return &[];
    }

    &frame[TOKEN_OFFSET..end]
}

/// Stream identifier of a data frame whose token embeds `id_bytes` bytes of
/// stream addressing: the low 16 bits of the embedded field.
#[inline]
pub fn stream_id(frame: &[u8], id_bytes: usize) -> Option<u16> {
    if id_bytes < 2 {
        return None;
    }

    let end = STREAM_ID_OFFSET + id_bytes;

    if body_end(frame) < end {
        return None;
    }

    Some(BigEndian::read_u16(&frame[end - 2..end]))
}

/// The payload that follows any embedded stream identifier. Without one the
/// token bytes count as payload content, by wire convention.
#[inline]
pub fn stream_payload(frame: &[u8], id_bytes: usize) -> &[u8] {
    let start = if id_bytes == 0 {
        TOKEN_OFFSET
    } else {
        STREAM_ID_OFFSET + id_bytes
    };
    let end = body_end(frame);

    if end <= start {
        return &[];
    }

    &frame[start..end]
}

/// Coarse routing decision for one parsed frame.
pub fn classify(frame: &[u8]) -> FrameKind {
    if frame.len() < HEADER_SIZE {
        return FrameKind::Other(0);
    }

    let ty = frame_type(frame);

    if frame.len() == SHORT_FRAME_SIZE && is_control_family(ty) && ty != CTL_INIT {
        return FrameKind::ShortControl(ty);
    }

    if ty == CTL_INIT {
        return FrameKind::Init;
    }

    match token(frame) {
        Some(tok) if ty == TYPE_DATA => FrameKind::Data(tok),
        _ => FrameKind::Other(ty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_case_matrix() {
        assert_eq!(Token(*b"AT").embedded_id_bytes(), 2);
        assert_eq!(Token(*b"At").embedded_id_bytes(), 3);
        assert_eq!(Token(*b"at").embedded_id_bytes(), 4);
        assert_eq!(Token(*b"aT").embedded_id_bytes(), 0);
    }

    #[test]
    fn test_token_display() {
        assert_eq!(format!("{}", Token(*b"AT")), "AT");
        assert_eq!(format!("{}", Token([0x0C, 0x03])), "0c03");
    }

    #[test]
    fn test_classify_short_control() {
        let frame = [MAGIC, 0, 0, 0, 3, 0x10, 0x10, CTL_WINDOW_OPEN, TERMINATOR];
        assert_eq!(classify(&frame), FrameKind::ShortControl(CTL_WINDOW_OPEN));
    }

    #[test]
    fn test_classify_init() {
        let mut frame = vec![MAGIC, 0, 0, 0, 54, 0x17, 0x10, CTL_INIT];
        frame.extend_from_slice(&[0; 52]);
        assert_eq!(classify(&frame), FrameKind::Init);
    }

    #[test]
    fn test_classify_data() {
        let frame = [MAGIC, 0, 0, 0, 8, 0x11, 0x10, TYPE_DATA, b'A', b'T', 0x12, 0x34, 0x01, TERMINATOR];
        assert_eq!(classify(&frame), FrameKind::Data(Token(*b"AT")));
    }

    #[test]
    fn test_classify_unknown_type_discarded() {
        let frame = [MAGIC, 0, 0, 0, 8, 0x11, 0x10, TYPE_SS, b'A', b'T', 0x12, 0x34, 0x01, TERMINATOR];
        assert_eq!(classify(&frame), FrameKind::Other(TYPE_SS));
    }

    #[test]
    fn test_stream_id_extraction() {
        // Token "AT": two embedded id bytes at offsets 10-11; the trailing
        // terminator sits beyond the declared length.
        let frame = [MAGIC, 0, 0, 0, 7, 0x11, 0x10, TYPE_DATA, b'A', b'T', 0x12, 0x34, 0x01, TERMINATOR];
        assert_eq!(stream_id(&frame, 2), Some(0x1234));
        assert_eq!(stream_payload(&frame, 2), &[0x01]);
    }

    #[inline]
    fn extended_frame(token: [u8; 2], id_field: &[u8], payload: &[u8]) -> Vec<u8> {
        let body_len = 2 + 2 + id_field.len() + payload.len();
        let mut frame = vec![MAGIC, 0, 0, 0, body_len as u8, 0x11, 0x10, TYPE_DATA];
        frame.extend_from_slice(&token);
        frame.extend_from_slice(id_field);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_stream_id_wide_forms() {
        // "At": three embedded bytes, identifier is the low 16 bits.
        let frame = extended_frame(*b"At", &[0x01, 0x12, 0x34], &[0xFF]);
        assert_eq!(stream_id(&frame, 3), Some(0x1234));
        assert_eq!(stream_payload(&frame, 3), &[0xFF]);

        // "at": four embedded bytes.
        let frame = extended_frame(*b"at", &[0x00, 0x01, 0x12, 0x34], &[0xFF]);
        assert_eq!(stream_id(&frame, 4), Some(0x1234));
        assert_eq!(stream_payload(&frame, 4), &[0xFF]);
    }

    #[test]
    fn test_stream_id_absent() {
        let frame = extended_frame(*b"aT", &[], &[0x01, 0x02]);
        assert_eq!(stream_id(&frame, 0), None);
        assert_eq!(stream_payload(&frame, 0), &[b'a', b'T', 0x01, 0x02]);
    }

    #[test]
    fn test_app_payload_excludes_unaccounted_terminator() {
        // Declared length 4 covers rx, type and two payload bytes; the
        // trailing terminator sits beyond it.
        let frame = [MAGIC, 0, 0, 0, 4, 0x11, 0x10, TYPE_DATA, 0x01, 0x02, TERMINATOR];
        assert_eq!(app_payload(&frame), &[0x01, 0x02]);
    }
}
