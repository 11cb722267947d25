//! The wrapped TX/RX sequence ring and the outstanding-window accounting.
//!
//! Sequence values live in [0x10, 0x7F]. Data frames advance the server TX;
//! control frames always carry the last data TX so the peer's window view
//! stays coherent. The peer acknowledges by echoing the last server TX it
//! saw in the RX byte of whatever frame it sends next.

use crate::net::codec;
use crate::net::frame::{self, CTL_INIT, MAGIC};
use quartz::logging::{self, Logger};

pub const RING_FLOOR: u8 = 0x10;
pub const RING_CEIL: u8 = 0x7F;
pub const RING_SIZE: u32 = 0x70;

/// Maps any integer into the ring. Values below the floor clamp to it.
#[inline]
pub fn wrap(value: u32) -> u8 {
    if value < u32::from(RING_FLOOR) {
        return RING_FLOOR;
    }

    RING_FLOOR + ((value - u32::from(RING_FLOOR)) % RING_SIZE) as u8
}

/// Ring-order distance from `from` to `to`.
#[inline]
pub fn ring_distance(from: u8, to: u8) -> u32 {
    (i32::from(to) - i32::from(from)).rem_euclid(RING_SIZE as i32) as u32
}

pub struct SequenceEngine {
    last_client_tx: u8,
    last_acked_server_tx: u8,
    last_sent_server_data_tx: u8,
    last_stamped_control_tx: u8,
    startup_seeded: bool,
    have_sent_first_data: bool,
    log: Logger,
}

impl SequenceEngine {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> SequenceEngine {
        SequenceEngine {
            last_client_tx: RING_FLOOR,
            last_acked_server_tx: RING_FLOOR,
            last_sent_server_data_tx: RING_FLOOR,
            last_stamped_control_tx: RING_FLOOR,
            startup_seeded: false,
            have_sent_first_data: false,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn last_client_tx(&self) -> u8 {
        self.last_client_tx
    }

    #[inline]
    pub fn last_acked_server_tx(&self) -> u8 {
        self.last_acked_server_tx
    }

    #[inline]
    pub fn last_sent_server_data_tx(&self) -> u8 {
        self.last_sent_server_data_tx
    }

    #[inline]
    pub fn startup_seeded(&self) -> bool {
        self.startup_seeded
    }

    #[inline]
    pub fn have_sent_first_data(&self) -> bool {
        self.have_sent_first_data
    }

    /// The TX value the next advancing data frame will carry.
    #[inline]
    pub fn next_data_tx(&self) -> u8 {
        wrap(u32::from(self.last_sent_server_data_tx) + 1)
    }

    /// Server data frames sent but not yet acknowledged by the client.
    #[inline]
    pub fn outstanding(&self) -> u32 {
        ring_distance(self.last_acked_server_tx, self.last_sent_server_data_tx)
    }

    /// Folds one incoming frame into the engine state: tracks the client TX,
    /// advances the acknowledged server TX when the RX byte is ring-ahead,
    /// and seeds the server TX from the startup probe exactly once.
    pub fn observe_incoming(&mut self, bytes: &[u8]) {
        if bytes.len() < 6 || bytes[0] != MAGIC {
            return;
        }

        self.last_client_tx = frame::tx(bytes);

        if bytes.len() >= 7 {
            let rx = frame::rx(bytes);

            if rx >= RING_FLOOR && rx <= RING_CEIL {
                let ahead = ring_distance(self.last_acked_server_tx, rx);
                let sendable =
                    ring_distance(self.last_acked_server_tx, self.last_sent_server_data_tx);

                // An acknowledgment can only cover frames that were actually
                // sent; anything further is a stale or corrupt RX byte.
                if ahead > 0 && ahead <= sendable {
                    self.last_acked_server_tx = rx;
                }
            }
        }

        if !self.startup_seeded && !self.have_sent_first_data && is_init_probe(bytes) {
            // The probe's RX byte tells us what the client expects next.
            // Re-seeding later in the session from a racing RX byte corrupts
            // the window accounting; the flags above make this a one-shot.
            let seed = wrap(u32::from(frame::rx(bytes)));

            self.last_sent_server_data_tx = seed;
            self.last_acked_server_tx = seed;
            self.startup_seeded = true;

            logging::debug!(self.log, "sequence engine seeded from client probe";
                            "context" => "observe",
                            "seed" => seed);
        }
    }

    /// Explicit notification that incoming traffic freed window slots. The
    /// engine already derived the new state in `observe_incoming`; this is
    /// informational.
    #[inline]
    pub fn on_piggyback_ack(&mut self, freed_slots: u32) {
        logging::trace!(self.log, "piggyback ack released window slots";
                        "context" => "piggyback",
                        "freed" => freed_slots,
                        "outstanding" => self.outstanding());
    }

    /// Rewrites the sequence bytes, length and CRC of an outbound frame.
    ///
    /// Data frames take a fresh TX when `advance` is set and mark the
    /// engine as having transmitted data. Control frames always carry the
    /// last data TX; stamping anything else would corrupt the peer's view
    /// of the window.
    pub fn restamp(&mut self, bytes: &mut [u8], is_data: bool, advance: bool) {
        if bytes.len() < frame::HEADER_SIZE {
            return;
        }

        if is_data {
            if advance {
                let tx = self.next_data_tx();
                bytes[5] = tx;
                self.last_sent_server_data_tx = tx;
                self.have_sent_first_data = true;
            }
            bytes[6] = self.last_client_tx;
        } else {
            bytes[5] = self.last_sent_server_data_tx;
            bytes[6] = self.last_client_tx;
            self.last_stamped_control_tx = bytes[5];

            if self.last_stamped_control_tx != self.last_sent_server_data_tx {
                logging::error!(self.log, "control frame stamped with a fresh tx";
                                "context" => "restamp",
                                "stamped" => self.last_stamped_control_tx,
                                "last_sent" => self.last_sent_server_data_tx);
            }
        }

        codec::finalize(bytes);
    }

    /// Resets the engine for channel reuse.
    pub fn reset(&mut self) {
        self.last_client_tx = RING_FLOOR;
        self.last_acked_server_tx = RING_FLOOR;
        self.last_sent_server_data_tx = RING_FLOOR;
        self.last_stamped_control_tx = RING_FLOOR;
        self.startup_seeded = false;
        self.have_sent_first_data = false;
    }
}

/// The startup probe: type 0xA3 carrying the well-known init token or the
/// 52-byte platform record.
fn is_init_probe(bytes: &[u8]) -> bool {
    if bytes.len() < frame::HEADER_SIZE || frame::frame_type(bytes) != CTL_INIT {
        return false;
    }

    if frame::token(bytes).map(|token| token.as_u16()) == Some(0x0C03) {
        return true;
    }

    frame::app_payload(bytes).len() == 52
}
