//! The networking modules handle all P3 communication between vintage
//! clients and the server: byte-level reassembly, frame parsing, the
//! sliding-window sequence engine, outbound pacing, and multi-frame stream
//! assembly.

pub mod shared;
pub mod crc;
pub mod buffer;
pub mod frame;
pub mod codec;
pub mod sequence;
pub mod assembler;
pub mod handshake;
pub mod dispatch;
pub mod pacer;
pub mod channel;
pub mod endpoint;
