//! Splits a raw byte stream into complete P3 frames and builds outbound
//! frames. Frame boundaries do not align with TCP segment boundaries, so the
//! scanner must stop at any incomplete frame and leave the tail to the
//! reassembler.

use crate::net::crc;
use crate::net::frame::{
    self, Token, CTL_INIT, HEADER_SIZE, MAGIC, SHORT_FRAME_SIZE, TERMINATOR, TYPE_DATA,
};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

/// Scans `bytes` for complete frames. Returns the frames as owned copies
/// together with the number of bytes consumed; anything past the consumed
/// prefix belongs to an incomplete frame and must be retained by the caller.
///
/// Bytes that do not start a parseable frame are skipped one at a time so a
/// desynchronized stream can recover at the next magic byte.
pub fn split(bytes: &[u8]) -> (Vec<Vec<u8>>, usize) {
    let mut frames = Vec::new();
    let mut cursor = 0;

    while cursor < bytes.len() {
        if bytes[cursor] != MAGIC {
            cursor += 1;
            continue;
        }

        let available = bytes.len() - cursor;

        if available < HEADER_SIZE {
            break;
        }

        let declared = frame::declared_len(&bytes[cursor..]);
        let frame_type = bytes[cursor + 7];

        if declared < 3 {
            // Too short for either frame shape; not a real frame start.
            cursor += 1;
            continue;
        }

        if declared == 3 && frame::is_control_family(frame_type) && frame_type != CTL_INIT {
            if available < SHORT_FRAME_SIZE {
                break;
            }

            frames.push(bytes[cursor..cursor + SHORT_FRAME_SIZE].to_vec());
            cursor += SHORT_FRAME_SIZE;
            continue;
        }

        let total = 6 + declared;

        if available < total {
            break;
        }

        frames.push(bytes[cursor..cursor + total].to_vec());
        cursor += total;

        // An optional single terminator beyond the declared length is a
        // pure separator: consumed, never part of the frame. Appending it
        // would make the emitted frame depend on whether the terminator
        // landed in this TCP segment or the next one.
        if cursor < bytes.len() && bytes[cursor] == TERMINATOR {
            cursor += 1;
        }
    }

    (frames, cursor)
}

/// Builds a data frame around an opaque application payload. Length and CRC
/// are placeholders until `finalize` (or a sequence restamp) fills them.
pub fn encode_data(token: Token, stream_id: Option<u16>, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frame::EXT_HEADER_SIZE + payload.len() + 1);

    bytes.push(MAGIC);
    bytes.extend_from_slice(&[0, 0]); // crc
    bytes.extend_from_slice(&[0, 0]); // length
    bytes.push(0); // tx
    bytes.push(0); // rx
    bytes.push(TYPE_DATA);
    bytes.extend_from_slice(&token.0);

    if let Some(id) = stream_id {
        bytes
            .write_u16::<BigEndian>(id)
            .expect("Error writing stream id");
    }

    bytes.extend_from_slice(payload);

    if payload.last() != Some(&TERMINATOR) {
        bytes.push(TERMINATOR);
    }

    bytes
}

/// Builds a 9-byte short control frame with placeholder sequence bytes.
pub fn make_short_control(frame_type: u8) -> Vec<u8> {
    let mut bytes = vec![MAGIC, 0, 0, 0, 3, 0, 0, frame_type, TERMINATOR];
    finalize(&mut bytes);
    bytes
}

/// Writes the declared length and CRC of a fully assembled frame.
pub fn finalize(frame: &mut [u8]) {
    let declared = (frame.len() - 6) as u16;

    BigEndian::write_u16(&mut frame[3..5], declared);

    let checksum = crc::checksum(&frame[3..]);
    BigEndian::write_u16(&mut frame[1..3], checksum);
}

/// Validates the CRC over the declared region of a frame.
pub fn verify(frame: &[u8]) -> bool {
    if frame.len() < HEADER_SIZE {
        return false;
    }

    let end = 6 + frame::declared_len(frame);

    if frame.len() < end {
        return false;
    }

    crc::checksum(&frame[3..end]) == BigEndian::read_u16(&frame[1..3])
}
