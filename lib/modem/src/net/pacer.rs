//! Outbound frame scheduler. Queues frames from the application layer and
//! drains them under the peer's flow-control limits: never more than 16
//! unacknowledged data frames, and no new data once 8 are outstanding. The
//! headroom is deliberate; driving the window to its hard edge crashes some
//! client platforms when acknowledgments race the next burst.

use crate::net::buffer::Buffer;
use crate::net::codec;
use crate::net::frame::{MAGIC, TYPE_DATA, TYPE_HEARTBEAT};
use crate::net::sequence::SequenceEngine;
use quartz::logging::{self, Logger};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Stop starting new data frames at this many outstanding.
pub const SOFT_THROTTLE: u32 = 8;
/// The peer's absolute window; exceeding it is a protocol violation.
pub const HARD_WINDOW: u32 = 16;

#[derive(Debug, Clone)]
pub struct PacerConfig {
    pub max_burst_frames: usize,
    pub inter_frame_delay: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_max_attempts: u32,
}

impl Default for PacerConfig {
    fn default() -> PacerConfig {
        PacerConfig {
            max_burst_frames: 10,
            inter_frame_delay: Duration::from_millis(5),
            heartbeat_interval: Duration::from_secs(12),
            heartbeat_max_attempts: 10,
        }
    }
}

/// Borrowed view of the connection state a drain needs: the sequence engine
/// for restamping and the write buffer standing in for the transport.
pub struct DrainCtx<'a> {
    pub sequence: &'a mut SequenceEngine,
    pub sink: &'a mut Buffer,
    pub now: Instant,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacerStatus {
    Idle,
    HeartbeatSent,
    /// The heartbeat budget is exhausted with no acknowledgment; closing
    /// the connection is the orchestrator's call.
    PeerSilent,
}

struct PendingChunk {
    bytes: Vec<u8>,
    label: &'static str,
}

enum Brake {
    Window,
    Backpressure,
    Delay,
}

pub struct Pacer {
    queue: VecDeque<PendingChunk>,
    config: PacerConfig,
    drains_deferred: bool,
    need_ack: bool,
    need_resume: bool,
    next_send_at: Option<Instant>,
    heartbeat_at: Option<Instant>,
    heartbeat_attempts: u32,
    log: Logger,
}

impl Pacer {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: PacerConfig, log: L) -> Pacer {
        Pacer {
            queue: VecDeque::new(),
            config,
            drains_deferred: false,
            need_ack: false,
            need_resume: false,
            next_send_at: None,
            heartbeat_at: None,
            heartbeat_attempts: 0,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn config(&self) -> &PacerConfig {
        &self.config
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    #[inline]
    pub fn pending_frames(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_waiting_for_ack(&self) -> bool {
        self.need_ack
    }

    #[inline]
    pub fn needs_resume(&self) -> bool {
        self.need_resume
    }

    #[inline]
    pub fn heartbeat_attempts(&self) -> u32 {
        self.heartbeat_attempts
    }

    /// While set, `drain` calls return without sending. The orchestrator
    /// defers drains for the duration of a read batch so every frame of a
    /// TCP chunk is processed before anything goes out.
    #[inline]
    pub fn set_drains_deferred(&mut self, deferred: bool) {
        self.drains_deferred = deferred;
    }

    /// Queues a frame for ordered transmission. No bytes move here.
    pub fn enqueue(&mut self, bytes: Vec<u8>, label: &'static str) {
        logging::trace!(self.log, "frame queued";
                        "context" => "enqueue",
                        "label" => label,
                        "pending" => self.queue.len() + 1);

        self.queue.push_back(PendingChunk { bytes, label });
    }

    /// Queues a control frame at the head of the line.
    pub fn enqueue_priority(&mut self, bytes: Vec<u8>, label: &'static str) {
        logging::trace!(self.log, "priority frame queued";
                        "context" => "enqueue",
                        "label" => label,
                        "pending" => self.queue.len() + 1);

        self.queue.push_front(PendingChunk { bytes, label });
    }

    /// Signals that the transport refused a write outside the pacer's own
    /// bookkeeping (for example during the raw handshake).
    #[inline]
    pub fn note_backpressure(&mut self) {
        self.need_resume = true;
    }

    /// Drains as much of the queue as the window, the burst limit and the
    /// transport allow.
    pub fn drain(&mut self, ctx: &mut DrainCtx<'_>) {
        self.drain_limited(ctx, usize::max_value());
    }

    pub fn drain_limited(&mut self, ctx: &mut DrainCtx<'_>, max_frames: usize) {
        if self.drains_deferred || self.queue.is_empty() {
            return;
        }

        if let Some(at) = self.next_send_at {
            if ctx.now < at {
                return;
            }
            self.next_send_at = None;
        }

        if ctx.sink.free_capacity() == 0 {
            self.need_resume = true;
            return;
        }

        let outstanding = ctx.sequence.outstanding();

        if outstanding >= SOFT_THROTTLE {
            // Do not start a burst into a half-full window; wait for an ack.
            self.flag_window_limit(ctx.now);
            return;
        }

        let window_budget = (SOFT_THROTTLE - outstanding) as usize;
        let effective_max = max_frames.min(window_budget);

        let mut sent = 0;
        let mut brake = None;

        while sent < effective_max {
            let chunk = match self.queue.pop_front() {
                Some(chunk) => chunk,
                None => break,
            };

            let is_p3 = chunk.bytes.first() == Some(&MAGIC);
            let is_data = is_p3 && chunk.bytes.len() >= 8 && chunk.bytes[7] == TYPE_DATA;

            if is_data && ctx.sequence.outstanding() + 1 > HARD_WINDOW {
                // Emergency brake. The soft throttle should make this
                // unreachable; hitting it means the accounting raced.
                logging::warn!(self.log, "hard window reached mid-drain";
                               "context" => "drain",
                               "outstanding" => ctx.sequence.outstanding());
                self.queue.push_front(chunk);
                brake = Some(Brake::Window);
                break;
            }

            if chunk.bytes.len() > ctx.sink.free_capacity() {
                self.queue.push_front(chunk);
                brake = Some(Brake::Backpressure);
                break;
            }

            let mut bytes = chunk.bytes;

            if is_p3 {
                ctx.sequence.restamp(&mut bytes, is_data, is_data);
            }

            ctx.sink.push(&bytes);
            sent += 1;

            logging::trace!(self.log, "frame drained";
                            "context" => "drain",
                            "label" => chunk.label,
                            "data" => is_data,
                            "outstanding" => ctx.sequence.outstanding());

            if is_data
                && self.config.inter_frame_delay > Duration::from_millis(0)
                && !self.queue.is_empty()
            {
                self.next_send_at = Some(ctx.now + self.config.inter_frame_delay);
                brake = Some(Brake::Delay);
                break;
            }
        }

        match brake {
            Some(Brake::Window) => self.flag_window_limit(ctx.now),
            Some(Brake::Backpressure) => self.need_resume = true,
            Some(Brake::Delay) | None => {
                // Ran to the limit: if the window clamp (not the caller's
                // burst cap) is what stopped us, an ack must free slots
                // before anything more goes out.
                if !self.queue.is_empty() && sent == effective_max && window_budget <= max_frames {
                    self.flag_window_limit(ctx.now);
                }
            }
        }
    }

    /// Re-drains after the transport reported writability again.
    pub fn resume(&mut self, ctx: &mut DrainCtx<'_>) {
        if self.need_resume {
            self.need_resume = false;
            self.drain(ctx);
        }
    }

    /// The peer sent a bare window-open control. Clears the ack wait but
    /// leaves draining to the caller.
    pub fn on_window_open_short_ack(&mut self) {
        self.need_ack = false;
        self.cancel_heartbeat();
    }

    /// An ordinary incoming frame freed window slots.
    pub fn on_piggyback_ack(&mut self, freed_slots: u32, ctx: &mut DrainCtx<'_>) {
        self.need_ack = false;
        self.cancel_heartbeat();
        ctx.sequence.on_piggyback_ack(freed_slots);
        self.drain(ctx);
    }

    /// Writes a control frame ahead of the queue and outside the window
    /// accounting. Used for heartbeats, forced acks and the goodbye.
    pub fn send_control_immediately(
        &mut self,
        ctx: &mut DrainCtx<'_>,
        mut bytes: Vec<u8>,
        label: &'static str,
    ) {
        if bytes.first() == Some(&MAGIC) {
            ctx.sequence.restamp(&mut bytes, false, false);
        }

        if !ctx.sink.push(&bytes) {
            self.need_resume = true;
            self.queue.push_front(PendingChunk { bytes, label });
            return;
        }

        logging::trace!(self.log, "control frame sent";
                        "context" => "send_control",
                        "label" => label);
    }

    /// Advances the pacer clock: resumes a delayed drain and probes a silent
    /// peer while an ack is owed.
    pub fn tick(&mut self, ctx: &mut DrainCtx<'_>) -> PacerStatus {
        if let Some(at) = self.next_send_at {
            if ctx.now >= at {
                self.drain(ctx);
            }
        }

        if !self.need_ack {
            return PacerStatus::Idle;
        }

        let due = match self.heartbeat_at {
            Some(at) => ctx.now >= at,
            None => false,
        };

        if !due {
            return PacerStatus::Idle;
        }

        if self.heartbeat_attempts >= self.config.heartbeat_max_attempts {
            return PacerStatus::PeerSilent;
        }

        self.heartbeat_attempts += 1;
        self.heartbeat_at = Some(ctx.now + self.config.heartbeat_interval);

        let probe = codec::make_short_control(TYPE_HEARTBEAT);
        self.send_control_immediately(ctx, probe, "heartbeat");

        logging::debug!(self.log, "heartbeat probe sent";
                        "context" => "tick",
                        "attempt" => self.heartbeat_attempts);

        PacerStatus::HeartbeatSent
    }

    /// Releases every queued frame and resets the flow-control flags.
    /// Returns the number of chunks released.
    pub fn clear_pending(&mut self) -> usize {
        let released = self.queue.len();

        self.queue.clear();
        self.need_ack = false;
        self.need_resume = false;
        self.next_send_at = None;
        self.cancel_heartbeat();

        released
    }

    #[inline]
    pub fn close(&mut self) -> usize {
        self.clear_pending()
    }

    fn flag_window_limit(&mut self, now: Instant) {
        self.need_ack = true;

        if self.heartbeat_at.is_none() {
            self.heartbeat_at = Some(now + self.config.heartbeat_interval);
        }
    }

    fn cancel_heartbeat(&mut self) {
        self.heartbeat_at = None;
        self.heartbeat_attempts = 0;
    }
}
