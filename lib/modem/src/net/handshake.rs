//! Startup-probe handling: parsing the INIT packet the client opens with,
//! deciding which platform is dialing in, and the fixed handshake frames the
//! server answers with.

use crate::net::codec;
use crate::net::frame::{self, Token, MAGIC, TERMINATOR, TYPE_ACK};
use byteorder::{BigEndian, ByteOrder};
use lazy_static::lazy_static;

/// The well-known token carried by Mac startup probes.
pub const MAC_INIT_TOKEN: u16 = 0x0C03;
/// Length of the full 32-bit Windows INIT payload.
pub const WINDOWS_INIT_PAYLOAD_LEN: usize = 52;

const TIER1_LEN: usize = 6;
const TIER2_LEN: usize = 22;
const TIER3_LEN: usize = WINDOWS_INIT_PAYLOAD_LEN;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Platform {
    Unknown,
    Windows,
    Mac,
    Dos,
}

impl Platform {
    /// Maps the raw platform byte of the INIT record.
    #[inline]
    pub fn from_probe(byte: u8) -> Platform {
        match byte {
            1 => Platform::Windows,
            2 => Platform::Mac,
            3 => Platform::Dos,
            byte if byte >= 127 => Platform::Mac,
            _ => Platform::Unknown,
        }
    }
}

/// The INIT packet record. Multi-byte integers are big-endian on the wire.
/// Short payloads are tier-parsed: whatever fields fit are filled, the rest
/// stay at their zero defaults and `fully_parsed` reports the difference.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct InitPacket {
    pub platform: u8,
    pub version_major: u8,
    pub version_minor: u8,
    pub machine_memory: u8,
    pub app_memory: u8,
    pub pc_type: u16,
    pub release_month: u8,
    pub release_day: u8,
    pub customer_class: u16,
    pub udo_timestamp: u32,
    pub dos_version: u16,
    pub session_flags: u16,
    pub video_type: u8,
    pub processor_type: u8,
    pub media_type: u32,
    pub windows_version: u32,
    pub memory_mode: u8,
    pub horizontal_res: u16,
    pub vertical_res: u16,
    pub num_colors: u16,
    pub region: u16,
    pub language: [u16; 4],
    pub connect_speed: u8,
    pub fully_parsed: bool,
}

/// Parses as much of the INIT payload as is present. A truncated probe is a
/// handshake anomaly, not an error; the caller decides what to do with a
/// record that is not fully parsed.
pub fn parse_init(payload: &[u8]) -> InitPacket {
    let mut packet = InitPacket::default();

    if payload.len() >= TIER1_LEN {
        packet.platform = payload[0x00];
        packet.version_major = payload[0x01];
        packet.version_minor = payload[0x02];
        // 0x03 reserved
        packet.machine_memory = payload[0x04];
        packet.app_memory = payload[0x05];
    }

    if payload.len() >= TIER2_LEN {
        packet.pc_type = BigEndian::read_u16(&payload[0x06..0x08]);
        packet.release_month = payload[0x08];
        packet.release_day = payload[0x09];
        packet.customer_class = BigEndian::read_u16(&payload[0x0A..0x0C]);
        packet.udo_timestamp = BigEndian::read_u32(&payload[0x0C..0x10]);
        packet.dos_version = BigEndian::read_u16(&payload[0x10..0x12]);
        packet.session_flags = BigEndian::read_u16(&payload[0x12..0x14]);
        packet.video_type = payload[0x14];
        packet.processor_type = payload[0x15];
    }

    if payload.len() >= TIER3_LEN {
        packet.media_type = BigEndian::read_u32(&payload[0x16..0x1A]);
        packet.windows_version = BigEndian::read_u32(&payload[0x1A..0x1E]);
        packet.memory_mode = payload[0x1E];
        packet.horizontal_res = BigEndian::read_u16(&payload[0x1F..0x21]);
        packet.vertical_res = BigEndian::read_u16(&payload[0x21..0x23]);
        packet.num_colors = BigEndian::read_u16(&payload[0x23..0x25]);
        // 0x25 filler
        packet.region = BigEndian::read_u16(&payload[0x26..0x28]);
        for slot in 0..4 {
            let offset = 0x28 + slot * 2;
            packet.language[slot] = BigEndian::read_u16(&payload[offset..offset + 2]);
        }
        packet.connect_speed = payload[0x30];
        packet.fully_parsed = true;
    }

    packet
}

/// Decides the client platform from the startup probe: the Mac token wins,
/// then the exact Windows payload size; everything else stays unknown.
pub fn detect_platform(probe: &[u8]) -> Platform {
    if frame::token(probe).map(|token| token.as_u16()) == Some(MAC_INIT_TOKEN) {
        return Platform::Mac;
    }

    if frame::app_payload(probe).len() == WINDOWS_INIT_PAYLOAD_LEN {
        return Platform::Windows;
    }

    Platform::Unknown
}

/// Minimal session state the core keeps per connection. User identity and
/// everything above the token layer belong to the collaborators.
pub struct SessionState {
    pub platform: Platform,
    pub init: Option<InitPacket>,
    pub sequence_seeded: bool,
}

impl SessionState {
    #[inline]
    pub fn new() -> SessionState {
        SessionState {
            platform: Platform::Unknown,
            init: None,
            sequence_seeded: false,
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.platform = Platform::Unknown;
        self.init = None;
        self.sequence_seeded = false;
    }
}

fn short_control(frame_type: u8, tx: u8, rx: u8) -> Vec<u8> {
    let mut bytes = vec![MAGIC, 0, 0, 0, 3, tx, rx, frame_type, TERMINATOR];
    codec::finalize(&mut bytes);
    bytes
}

fn handshake_frame(token: [u8; 2], body: &[u8], tx: u8, rx: u8) -> Vec<u8> {
    let mut bytes = codec::encode_data(Token(token), None, body);
    bytes[5] = tx;
    bytes[6] = rx;
    codec::finalize(&mut bytes);
    bytes
}

// The reference-capture handshake frames, replayed byte-identically on every
// connection. They bypass the pacer queue and are never restamped.
lazy_static! {
    pub static ref WINDOWS_KEEPALIVE_PONG: Vec<u8> = short_control(TYPE_ACK, 0x10, 0x10);
    pub static ref WINDOWS_HANDSHAKE: Vec<u8> =
        handshake_frame(*b"Dd", &[0x01, 0x01, 0x00, 0x03, 0x01, 0x00], 0x10, 0x10);
    pub static ref MAC_KEEPALIVE_PONG: Vec<u8> = short_control(TYPE_ACK, 0x10, 0x11);
    pub static ref MAC_HANDSHAKE: Vec<u8> =
        handshake_frame(*b"Dd", &[0x02, 0x01, 0x00, 0x03, 0x01, 0x00], 0x10, 0x11);
}
