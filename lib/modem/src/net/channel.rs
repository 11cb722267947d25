//! The per-connection orchestrator. Each TCP chunk flows through the
//! reassembler, is split into frames, folded into the sequence engine,
//! classified and routed; only after the whole read batch is processed does
//! the pacer get to drain.

use crate::net::assembler::{self, EndMarkerScan, StreamAssembler};
use crate::net::buffer::{Buffer, TcpReassembler};
use crate::net::codec;
use crate::net::dispatch::{TokenHandler, TokenMessage};
use crate::net::frame::{
    self, FrameKind, Token, CTL_KEEPALIVE, CTL_WINDOW_OPEN, CTL_WINDOW_OPEN_NO_RESPONSE, MAGIC,
};
use crate::net::handshake::{
    self, Platform, SessionState, MAC_HANDSHAKE, MAC_KEEPALIVE_PONG, WINDOWS_HANDSHAKE,
    WINDOWS_KEEPALIVE_PONG,
};
use crate::net::pacer::{DrainCtx, Pacer, PacerConfig, PacerStatus, HARD_WINDOW};
use crate::net::sequence::SequenceEngine;
use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use mio::net::TcpStream;
use quartz::logging::{self, Logger};
use std::io::{self, Read};
use std::net::Shutdown;
use std::time::{Duration, Instant};

const READ_CHUNK_SIZE: usize = 8192;
// Write buffer should be 512k
const WRITE_BUF_SIZE: usize = 8 * 65536;

/// Consecutive CRC-invalid frames tolerated before the stream is considered
/// unrecoverable.
const CRC_FAILURE_BUDGET: u32 = 8;

pub type ChannelId = usize;

/// What the orchestrator does when an invariant trips that the protocol can
/// technically limp through.
#[derive(Debug, Clone, Copy)]
pub struct ClosePolicy {
    pub close_on_peer_silence: bool,
    pub close_on_window_violation: bool,
}

impl Default for ClosePolicy {
    fn default() -> ClosePolicy {
        ClosePolicy {
            close_on_peer_silence: true,
            close_on_window_violation: false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Handshake(Instant),
    Connected(Platform),
}

/// Represents a P3 conversation with a single client.
pub struct Channel {
    id: Option<ChannelId>,

    stream: Option<TcpStream>,
    state: ChannelState,

    session: SessionState,
    reassembler: TcpReassembler,
    sequence: SequenceEngine,
    pacer: Pacer,
    assembler: StreamAssembler,
    write_buffer: Buffer,

    policy: ClosePolicy,
    crc_failures: u32,
    drain_after_batch: bool,

    // Communication Timestamps
    last_egress: Instant,
    last_ingress: Instant,

    // Log
    log: Logger,
}

impl Channel {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        pacer_config: PacerConfig,
        policy: ClosePolicy,
        log: L,
    ) -> Channel {
        let now = Instant::now();
        let channel_log = logging::child(log);

        Channel {
            id: None,
            stream: None,
            state: ChannelState::Disconnected,
            session: SessionState::new(),
            reassembler: TcpReassembler::new(),
            sequence: SequenceEngine::new(&channel_log),
            pacer: Pacer::new(pacer_config, &channel_log),
            assembler: StreamAssembler::new(),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            policy,
            crc_failures: 0,
            drain_after_batch: false,
            last_egress: now,
            last_ingress: now,
            log: channel_log,
        }
    }

    /// Opens the channel using a new underlying stream. The channel must be
    /// closed for this operation to succeed.
    pub fn open(&mut self, id: ChannelId, stream: TcpStream, now: Instant) {
        if self.state != ChannelState::Disconnected {
            panic!("Attempted to open an already open channel");
        }

        self.id = Some(id);
        self.state = ChannelState::Handshake(now);
        self.stream = Some(stream);
        self.last_egress = now;
        self.last_ingress = now;

        logging::debug!(self.log, "channel opened"; "context" => "open", "channel_id" => self.id);
    }

    /// Closes the channel, the underlying stream and all per-connection
    /// state. The release order matters: the goodbye attempt first, then the
    /// heartbeat and pending chunks, then the assembly and reassembly
    /// buffers.
    pub fn close<D: TokenHandler>(&mut self, notify: bool, dispatcher: &mut D) {
        logging::debug!(self.log, "closing channel";
                        "context" => "close",
                        "channel_id" => self.id,
                        "state" => ?self.state,
                        "pending" => self.pacer.pending_frames(),
                        "streams" => self.assembler.size(),
                        "write_size" => self.write_buffer.len());

        if notify {
            if let ChannelState::Connected(_) = self.state {
                if let Some(goodbye) = dispatcher.goodbye(&self.session) {
                    let mut bytes = goodbye.bytes;

                    if bytes.first() == Some(&MAGIC) {
                        self.sequence.restamp(&mut bytes, false, false);
                    }

                    self.write_buffer.push(&bytes);
                }

                // Best effort; the peer may already be gone.
                drop(self.flush_raw());
            }
        }

        let released = self.pacer.close();
        self.assembler.clear_all();
        let discarded = self.reassembler.clear();
        self.write_buffer.clear();

        self.sequence.reset();
        self.session.reset();
        self.crc_failures = 0;
        self.drain_after_batch = false;
        self.state = ChannelState::Disconnected;
        self.id = None;

        if let Some(stream) = self.stream.take() {
            drop(stream.shutdown(Shutdown::Both));
        }

        logging::debug!(self.log, "channel closed";
                        "context" => "close",
                        "released_chunks" => released,
                        "discarded_tcp_bytes" => discarded);
    }

    #[inline]
    pub fn get_state(&self) -> ChannelState {
        self.state
    }

    #[inline]
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Returns true if there is outgoing data waiting for the socket.
    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    #[inline]
    pub fn last_egress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_egress)
    }

    #[inline]
    pub fn last_ingress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_ingress)
    }

    /// Registers this channel on the supplied poll.
    pub fn register(&self, id: ChannelId, poll: &mio::Poll) -> NetworkResult<()> {
        poll.register(
            self.stream.as_ref().expect("Can't register disconnected channel"),
            id.into(),
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )
        .map_err(Into::into)
    }

    /// Deregisters this channel from the supplied poll.
    pub fn deregister(&self, poll: &mio::Poll) -> NetworkResult<()> {
        poll.deregister(
            self.stream
                .as_ref()
                .expect("Can't deregister disconnected channel"),
        )
        .map_err(Into::into)
    }

    /// Reads everything the socket currently has and runs each chunk
    /// through the frame pipeline.
    pub fn receive<D: TokenHandler>(
        &mut self,
        now: Instant,
        dispatcher: &mut D,
    ) -> NetworkResult<usize> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            let count = {
                let mut stream = self.stream.as_ref().expect("Channel must have valid stream");

                match stream.read(&mut chunk) {
                    Ok(0) => return Err(NetworkError::Fatal(ErrorType::PeerClosed)),
                    Ok(count) => count,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(err.into()),
                }
            };

            total += count;
            self.last_ingress = now;
            self.handle_chunk(&chunk[..count], now, dispatcher)?;
        }

        Ok(total)
    }

    /// Flushes buffered output to the socket.
    pub fn send(&mut self, now: Instant) -> NetworkResult<usize> {
        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let sent = self.flush_raw().map_err(NetworkError::from)?;

        if sent > 0 {
            self.last_egress = now;
        }

        Ok(sent)
    }

    /// The transport became writable again; let the pacer pick up where
    /// backpressure stopped it.
    pub fn resume_writes(&mut self, now: Instant) {
        let mut ctx = DrainCtx {
            sequence: &mut self.sequence,
            sink: &mut self.write_buffer,
            now,
        };

        self.pacer.resume(&mut ctx);
    }

    /// Advances pacer timers: delayed sends and heartbeat probes.
    pub fn tick(&mut self, now: Instant) -> PacerStatus {
        let mut ctx = DrainCtx {
            sequence: &mut self.sequence,
            sink: &mut self.write_buffer,
            now,
        };

        self.pacer.tick(&mut ctx)
    }

    /// Queues application frames for transmission.
    pub fn enqueue(&mut self, bytes: Vec<u8>, label: &'static str) {
        self.pacer.enqueue(bytes, label);
    }

    /// Drains the pacer outside a read batch, bounded by the burst limit.
    pub fn pump(&mut self, now: Instant) {
        let burst = self.pacer.config().max_burst_frames;
        let mut ctx = DrainCtx {
            sequence: &mut self.sequence,
            sink: &mut self.write_buffer,
            now,
        };

        self.pacer.drain_limited(&mut ctx, burst);
    }

    /// Processes one received TCP chunk: reassemble, split, route each
    /// frame, then drain the pacer once the batch is done.
    fn handle_chunk<D: TokenHandler>(
        &mut self,
        chunk: &[u8],
        now: Instant,
        dispatcher: &mut D,
    ) -> NetworkResult<()> {
        self.pacer.set_drains_deferred(true);
        let outcome = self.process_batch(chunk, now, dispatcher);
        self.pacer.set_drains_deferred(false);

        outcome?;

        if self.sequence.outstanding() > HARD_WINDOW {
            logging::error!(self.log, "outstanding window exceeded the hard limit";
                            "context" => "handle_chunk",
                            "channel_id" => self.id,
                            "outstanding" => self.sequence.outstanding());

            if self.policy.close_on_window_violation {
                return Err(NetworkError::Fatal(ErrorType::WindowViolation));
            }
        }

        if self.drain_after_batch {
            self.drain_after_batch = false;

            let mut ctx = DrainCtx {
                sequence: &mut self.sequence,
                sink: &mut self.write_buffer,
                now,
            };
            self.pacer.drain(&mut ctx);
        } else if !self.pacer.is_waiting_for_ack() && self.pacer.has_pending() {
            let burst = self.pacer.config().max_burst_frames;
            let mut ctx = DrainCtx {
                sequence: &mut self.sequence,
                sink: &mut self.write_buffer,
                now,
            };
            self.pacer.drain_limited(&mut ctx, burst);
        }

        Ok(())
    }

    fn process_batch<D: TokenHandler>(
        &mut self,
        chunk: &[u8],
        now: Instant,
        dispatcher: &mut D,
    ) -> NetworkResult<()> {
        let (frames, consumed) = {
            let combined = self.reassembler.prepare(chunk)?;
            codec::split(combined)
        };

        for bytes in frames {
            self.process_frame(bytes, now, dispatcher)?;
        }

        self.reassembler.remainder(consumed)
    }

    fn process_frame<D: TokenHandler>(
        &mut self,
        bytes: Vec<u8>,
        now: Instant,
        dispatcher: &mut D,
    ) -> NetworkResult<()> {
        if !codec::verify(&bytes) {
            self.crc_failures += 1;

            logging::warn!(self.log, "frame failed crc validation";
                           "context" => "process_frame",
                           "channel_id" => self.id,
                           "failures" => self.crc_failures);

            if self.crc_failures > CRC_FAILURE_BUDGET {
                return Err(NetworkError::Fatal(ErrorType::CrcBudgetExhausted));
            }

            return Ok(());
        }

        self.crc_failures = 0;

        let before = self.sequence.outstanding();
        self.sequence.observe_incoming(&bytes);
        let after = self.sequence.outstanding();

        if after < before {
            let mut ctx = DrainCtx {
                sequence: &mut self.sequence,
                sink: &mut self.write_buffer,
                now,
            };
            self.pacer.on_piggyback_ack(before - after, &mut ctx);
        }

        match frame::classify(&bytes) {
            FrameKind::ShortControl(control) => self.handle_short_control(control),
            FrameKind::Init => self.handle_init(&bytes, now),
            FrameKind::Data(token) => self.handle_data(token, bytes, now, dispatcher),
            FrameKind::Other(other) => {
                logging::debug!(self.log, "frame type discarded";
                                "context" => "process_frame",
                                "channel_id" => self.id,
                                "frame_type" => other);
            }
        }

        Ok(())
    }

    fn handle_short_control(&mut self, control: u8) {
        match control {
            CTL_WINDOW_OPEN => self.pacer.on_window_open_short_ack(),
            CTL_KEEPALIVE => {
                // Keep-alives refresh the ingress timestamp upstream and
                // trigger no drain.
            }
            CTL_WINDOW_OPEN_NO_RESPONSE => {
                self.pacer.on_window_open_short_ack();
                self.drain_after_batch = true;
            }
            other => {
                logging::debug!(self.log, "unhandled short control";
                                "context" => "short_control",
                                "channel_id" => self.id,
                                "frame_type" => other);
            }
        }
    }

    fn handle_init(&mut self, bytes: &[u8], now: Instant) {
        let payload = frame::app_payload(bytes);
        let packet = handshake::parse_init(payload);
        let platform = handshake::detect_platform(bytes);

        logging::info!(self.log, "client probe received";
                       "context" => "handshake",
                       "channel_id" => self.id,
                       "platform" => ?platform,
                       "payload_len" => payload.len(),
                       "fully_parsed" => packet.fully_parsed);

        self.session.init = Some(packet);
        self.session.platform = platform;
        self.session.sequence_seeded = self.sequence.startup_seeded();

        // The capture templates go out raw, ahead of the pacer queue, and
        // are never restamped.
        let (pong, shake): (&[u8], &[u8]) = match platform {
            Platform::Mac => (&MAC_KEEPALIVE_PONG, &MAC_HANDSHAKE),
            _ => (&WINDOWS_KEEPALIVE_PONG, &WINDOWS_HANDSHAKE),
        };

        if !self.write_buffer.push(pong) || !self.write_buffer.push(shake) {
            self.pacer.note_backpressure();
        }

        self.state = ChannelState::Connected(platform);
        self.last_ingress = now;
    }

    fn handle_data<D: TokenHandler>(
        &mut self,
        token: Token,
        bytes: Vec<u8>,
        now: Instant,
        dispatcher: &mut D,
    ) {
        let id_bytes = token.embedded_id_bytes();
        let stream_id = frame::stream_id(&bytes, id_bytes);

        if id_bytes > 0 && stream_id.is_none() {
            // The token promises an embedded stream id the frame is too
            // short to carry.
            logging::debug!(self.log, "frame too short for its token, skipped";
                            "context" => "handle_data",
                            "channel_id" => self.id,
                            "token" => %token,
                            "frame_len" => bytes.len());
            return;
        }

        match stream_id {
            Some(id) => {
                let payload = frame::stream_payload(&bytes, id_bytes);

                match assembler::find_end_marker(payload) {
                    EndMarkerScan::Found(pattern) => {
                        if pattern > 0 {
                            logging::debug!(self.log, "alternate end-of-stream marker matched";
                                            "context" => "handle_data",
                                            "channel_id" => self.id,
                                            "pattern" => pattern);
                        }

                        let mut frames = self.assembler.take(id).unwrap_or_default();
                        frames.push(bytes);

                        self.deliver(
                            TokenMessage {
                                token,
                                stream_id: Some(id),
                                frames,
                            },
                            dispatcher,
                        );
                    }
                    EndMarkerScan::Continuation | EndMarkerScan::NotFound => {
                        if !self.assembler.accept(id, &bytes, now) {
                            logging::warn!(self.log, "stream table full, frame dropped";
                                           "context" => "handle_data",
                                           "channel_id" => self.id,
                                           "stream_id" => id);
                        }
                    }
                }
            }
            None => {
                // Tokens without stream addressing deliver frame by frame.
                self.deliver(
                    TokenMessage {
                        token,
                        stream_id: None,
                        frames: vec![bytes],
                    },
                    dispatcher,
                );
            }
        }
    }

    fn deliver<D: TokenHandler>(&mut self, message: TokenMessage, dispatcher: &mut D) {
        logging::debug!(self.log, "dispatching token message";
                        "context" => "deliver",
                        "channel_id" => self.id,
                        "token" => %message.token,
                        "stream_id" => message.stream_id,
                        "frames" => message.frames.len());

        for outbound in dispatcher.handle_token(message, &self.session) {
            if outbound.priority {
                self.pacer.enqueue_priority(outbound.bytes, outbound.label);
            } else {
                self.pacer.enqueue(outbound.bytes, outbound.label);
            }
        }
    }

    fn flush_raw(&mut self) -> io::Result<usize> {
        match self.stream.as_ref() {
            Some(stream) => self.write_buffer.egress(stream),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::dispatch::{NullDispatcher, OutboundFrame};
    use crate::net::frame::{CTL_INIT, TERMINATOR, TYPE_ACK, TYPE_DATA};
    use crate::net::handshake::WINDOWS_INIT_PAYLOAD_LEN;
    use crate::net::pacer::SOFT_THROTTLE;

    struct Recorder {
        messages: Vec<TokenMessage>,
        replies: Vec<OutboundFrame>,
    }

    impl Recorder {
        fn new() -> Recorder {
            Recorder {
                messages: Vec::new(),
                replies: Vec::new(),
            }
        }
    }

    impl TokenHandler for Recorder {
        fn handle_token(
            &mut self,
            message: TokenMessage,
            _session: &SessionState,
        ) -> Vec<OutboundFrame> {
            self.messages.push(message);
            self.replies.drain(..).collect()
        }
    }

    fn channel() -> Channel {
        let mut config = PacerConfig::default();
        config.inter_frame_delay = Duration::from_millis(0);

        let mut channel = Channel::new(config, ClosePolicy::default(), None);
        channel.state = ChannelState::Handshake(Instant::now());
        channel
    }

    fn windows_init_frame(rx: u8) -> Vec<u8> {
        let mut bytes = vec![MAGIC, 0, 0, 0, 0, 0x21, rx, CTL_INIT];
        let mut payload = vec![0u8; WINDOWS_INIT_PAYLOAD_LEN];
        payload[0x00] = 1;
        payload[0x01] = 3;
        bytes.extend_from_slice(&payload);
        codec::finalize(&mut bytes);
        bytes
    }

    fn mac_init_frame(rx: u8) -> Vec<u8> {
        let mut bytes = vec![MAGIC, 0, 0, 0, 0, 0x21, rx, CTL_INIT, 0x0C, 0x03, 0x00, 0x00];
        codec::finalize(&mut bytes);
        bytes
    }

    fn stream_data_frame(tx: u8, rx: u8, stream_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = codec::encode_data(Token(*b"AT"), Some(stream_id), payload);
        bytes[5] = tx;
        bytes[6] = rx;
        codec::finalize(&mut bytes);
        bytes
    }

    fn short_control_frame(control: u8, tx: u8, rx: u8) -> Vec<u8> {
        let mut bytes = vec![MAGIC, 0, 0, 0, 3, tx, rx, control, TERMINATOR];
        codec::finalize(&mut bytes);
        bytes
    }

    fn sent_frames(channel: &mut Channel) -> Vec<Vec<u8>> {
        let (frames, consumed) = codec::split(channel.write_buffer.read_slice());
        assert_eq!(consumed, channel.write_buffer.read_slice().len());
        channel.write_buffer.clear();
        frames
    }

    #[test]
    fn test_windows_handshake_scenario() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        channel
            .handle_chunk(&windows_init_frame(0x42), now, &mut dispatcher)
            .unwrap();

        assert_eq!(channel.get_state(), ChannelState::Connected(Platform::Windows));
        assert_eq!(channel.session.platform, Platform::Windows);
        assert!(channel.session.init.as_ref().unwrap().fully_parsed);
        assert!(channel.session.sequence_seeded);
        assert_eq!(channel.sequence.last_sent_server_data_tx(), 0x42);

        let sent = sent_frames(&mut channel);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], *WINDOWS_KEEPALIVE_PONG);
        assert_eq!(sent[1], *WINDOWS_HANDSHAKE);
    }

    #[test]
    fn test_mac_handshake_scenario() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        channel
            .handle_chunk(&mac_init_frame(0x30), now, &mut dispatcher)
            .unwrap();

        assert_eq!(channel.get_state(), ChannelState::Connected(Platform::Mac));
        assert!(!channel.session.init.as_ref().unwrap().fully_parsed);

        let sent = sent_frames(&mut channel);
        assert_eq!(sent, vec![MAC_KEEPALIVE_PONG.clone(), MAC_HANDSHAKE.clone()]);
    }

    #[test]
    fn test_tcp_fragmentation_scenario() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        // A 120-byte data frame carrying the end marker, delivered in the
        // chunk sizes from the field capture: 5, 2, 100, 13.
        let mut payload = vec![0x11; 107];
        payload[103..107].copy_from_slice(&[0x00, 0x03, 0x01, 0x00]);
        let frame = stream_data_frame(0x21, 0x10, 0x0007, &payload);
        assert_eq!(frame.len(), 120);

        let mut offset = 0;
        for size in &[5usize, 2, 100, 13] {
            channel
                .handle_chunk(&frame[offset..offset + size], now, &mut dispatcher)
                .unwrap();
            offset += size;
        }

        assert_eq!(dispatcher.messages.len(), 1);
        let message = &dispatcher.messages[0];
        assert_eq!(message.token, Token(*b"AT"));
        assert_eq!(message.stream_id, Some(0x0007));
        assert_eq!(message.frames, vec![frame]);
    }

    #[test]
    fn test_multi_frame_reassembly_scenario() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        let first = stream_data_frame(0x21, 0x10, 9, &[0x40, 0x41]);
        let second = stream_data_frame(0x22, 0x10, 9, &[0x42, 0x43]);
        let third = stream_data_frame(0x23, 0x10, 9, &[0x00, 0x03, 0x01, 0x00]);

        channel.handle_chunk(&first, now, &mut dispatcher).unwrap();
        channel.handle_chunk(&second, now, &mut dispatcher).unwrap();

        assert!(dispatcher.messages.is_empty());
        assert!(channel.assembler.has(9));

        channel.handle_chunk(&third, now, &mut dispatcher).unwrap();

        assert_eq!(dispatcher.messages.len(), 1);
        assert_eq!(dispatcher.messages[0].frames, vec![first, second, third]);
        assert!(channel.assembler.is_empty());
    }

    #[test]
    fn test_interleaved_streams_group_independently() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        channel
            .handle_chunk(&stream_data_frame(0x21, 0x10, 1, &[0xAA]), now, &mut dispatcher)
            .unwrap();
        channel
            .handle_chunk(&stream_data_frame(0x22, 0x10, 2, &[0xBB]), now, &mut dispatcher)
            .unwrap();
        channel
            .handle_chunk(
                &stream_data_frame(0x23, 0x10, 2, &[0x00, 0x03, 0x01, 0x00]),
                now,
                &mut dispatcher,
            )
            .unwrap();

        assert_eq!(dispatcher.messages.len(), 1);
        assert_eq!(dispatcher.messages[0].stream_id, Some(2));
        assert_eq!(dispatcher.messages[0].frames.len(), 2);
        assert!(channel.assembler.has(1));
    }

    #[test]
    fn test_window_saturation_and_ack_release_scenario() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        channel
            .handle_chunk(&windows_init_frame(0x20), now, &mut dispatcher)
            .unwrap();
        sent_frames(&mut channel);

        for index in 0..32 {
            let mut bytes = codec::encode_data(Token(*b"AT"), Some(1), &[index as u8]);
            codec::finalize(&mut bytes);
            channel.enqueue(bytes, "bulk");
        }

        channel.pump(now);

        assert_eq!(sent_frames(&mut channel).len(), SOFT_THROTTLE as usize);
        assert!(channel.pacer.is_waiting_for_ack());
        assert_eq!(channel.sequence.outstanding(), SOFT_THROTTLE);

        // A bare window-open control acknowledging the burst releases the
        // next one.
        let ack = short_control_frame(CTL_WINDOW_OPEN, 0x30, channel.sequence.last_sent_server_data_tx());
        channel.handle_chunk(&ack, now, &mut dispatcher).unwrap();

        assert!(!channel.pacer.is_waiting_for_ack());
        assert_eq!(sent_frames(&mut channel).len(), SOFT_THROTTLE as usize);
    }

    #[test]
    fn test_keepalive_triggers_no_drain() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        channel
            .handle_chunk(&windows_init_frame(0x20), now, &mut dispatcher)
            .unwrap();
        sent_frames(&mut channel);

        let mut bytes = codec::encode_data(Token(*b"AT"), Some(1), &[1]);
        codec::finalize(&mut bytes);
        channel.enqueue(bytes, "reply");

        // Saturate so the batch-end drain stays inhibited.
        for _ in 0..SOFT_THROTTLE {
            let mut filler = codec::encode_data(Token(*b"AT"), Some(1), &[0]);
            codec::finalize(&mut filler);
            channel.enqueue(filler, "filler");
        }
        channel.pump(now);
        sent_frames(&mut channel);
        assert!(channel.pacer.is_waiting_for_ack());

        let keepalive = short_control_frame(CTL_KEEPALIVE, 0x30, 0x00);
        channel.handle_chunk(&keepalive, now, &mut dispatcher).unwrap();

        assert!(sent_frames(&mut channel).is_empty());
        assert!(channel.pacer.is_waiting_for_ack());
    }

    #[test]
    fn test_window_open_no_response_drains_after_batch() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        channel
            .handle_chunk(&windows_init_frame(0x20), now, &mut dispatcher)
            .unwrap();
        sent_frames(&mut channel);

        for _ in 0..SOFT_THROTTLE + 2 {
            let mut bytes = codec::encode_data(Token(*b"AT"), Some(1), &[0]);
            codec::finalize(&mut bytes);
            channel.enqueue(bytes, "bulk");
        }
        channel.pump(now);
        sent_frames(&mut channel);
        assert!(channel.pacer.is_waiting_for_ack());

        let open = short_control_frame(
            CTL_WINDOW_OPEN_NO_RESPONSE,
            0x30,
            channel.sequence.last_sent_server_data_tx(),
        );
        channel.handle_chunk(&open, now, &mut dispatcher).unwrap();

        assert_eq!(sent_frames(&mut channel).len(), 2);
    }

    #[test]
    fn test_streamless_token_delivers_immediately() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        // "aT" carries no embedded stream id.
        let mut bytes = codec::encode_data(Token(*b"aT"), None, &[0x55, 0x56]);
        bytes[5] = 0x21;
        bytes[6] = 0x10;
        codec::finalize(&mut bytes);

        channel.handle_chunk(&bytes, now, &mut dispatcher).unwrap();

        assert_eq!(dispatcher.messages.len(), 1);
        assert_eq!(dispatcher.messages[0].stream_id, None);
        assert_eq!(dispatcher.messages[0].frames.len(), 1);
    }

    #[test]
    fn test_dispatcher_replies_are_sent() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        channel
            .handle_chunk(&windows_init_frame(0x20), now, &mut dispatcher)
            .unwrap();
        sent_frames(&mut channel);

        let mut reply = codec::encode_data(Token(*b"AT"), Some(3), &[0x01]);
        codec::finalize(&mut reply);
        dispatcher.replies.push(OutboundFrame::new(reply, "reply"));

        let inbound = stream_data_frame(0x22, 0x10, 3, &[0x00, 0x03, 0x01, 0x00]);
        channel.handle_chunk(&inbound, now, &mut dispatcher).unwrap();

        // The reply drained at the end of the read batch with a fresh TX.
        let sent = sent_frames(&mut channel);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][7], TYPE_DATA);
        assert_eq!(sent[0][5], 0x21);
        assert!(codec::verify(&sent[0]));
    }

    #[test]
    fn test_corrupt_crc_is_skipped_until_budget() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        let mut corrupt = stream_data_frame(0x21, 0x10, 1, &[1, 2, 3]);
        corrupt[1] ^= 0xFF;

        for _ in 0..CRC_FAILURE_BUDGET {
            channel.handle_chunk(&corrupt, now, &mut dispatcher).unwrap();
        }

        assert!(dispatcher.messages.is_empty());

        let result = channel.handle_chunk(&corrupt, now, &mut dispatcher);
        assert_eq!(
            result,
            Err(NetworkError::Fatal(ErrorType::CrcBudgetExhausted))
        );
    }

    #[test]
    fn test_valid_frame_resets_crc_budget() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        let mut corrupt = stream_data_frame(0x21, 0x10, 1, &[1, 2, 3]);
        corrupt[1] ^= 0xFF;

        for _ in 0..CRC_FAILURE_BUDGET {
            channel.handle_chunk(&corrupt, now, &mut dispatcher).unwrap();
        }

        channel
            .handle_chunk(&stream_data_frame(0x22, 0x10, 1, &[4]), now, &mut dispatcher)
            .unwrap();
        assert_eq!(channel.crc_failures, 0);

        channel.handle_chunk(&corrupt, now, &mut dispatcher).unwrap();
        assert_eq!(channel.crc_failures, 1);
    }

    #[test]
    fn test_reassembler_overflow_is_fatal() {
        let mut channel = channel();
        let mut dispatcher = NullDispatcher;
        let now = Instant::now();

        // An endless frame: valid header promising more than the cap.
        let mut stall = vec![MAGIC, 0, 0, 0xFF, 0xFF, 0x21, 0x10, TYPE_DATA];
        stall.resize(60_000, 0);

        channel.handle_chunk(&stall, now, &mut dispatcher).unwrap();

        let result = channel.handle_chunk(&[0u8; 10_000], now, &mut dispatcher);

        match result {
            Err(NetworkError::Fatal(ErrorType::BufferOverflow { .. })) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_sequence_wrap_scenario() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        channel
            .handle_chunk(&windows_init_frame(0x7F), now, &mut dispatcher)
            .unwrap();
        sent_frames(&mut channel);

        let mut bytes = codec::encode_data(Token(*b"AT"), Some(1), &[1]);
        codec::finalize(&mut bytes);
        channel.enqueue(bytes, "wrap");
        channel.pump(now);

        let sent = sent_frames(&mut channel);
        assert_eq!(sent[0][5], 0x10);
    }

    #[test]
    fn test_window_overshoot_closes_under_strict_policy() {
        let mut policy = ClosePolicy::default();
        policy.close_on_window_violation = true;

        let mut config = PacerConfig::default();
        config.inter_frame_delay = Duration::from_millis(0);

        let mut channel = Channel::new(config, policy, None);
        channel.state = ChannelState::Handshake(Instant::now());

        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        channel
            .handle_chunk(&windows_init_frame(0x20), now, &mut dispatcher)
            .unwrap();
        sent_frames(&mut channel);

        // Synthetic race: stamp data frames past the hard window with no
        // acknowledgment in between.
        for _ in 0..HARD_WINDOW + 1 {
            let mut bytes = codec::encode_data(Token(*b"AT"), Some(1), &[0]);
            channel.sequence.restamp(&mut bytes, true, true);
        }
        assert!(channel.sequence.outstanding() > HARD_WINDOW);

        let keepalive = short_control_frame(CTL_KEEPALIVE, 0x30, 0x00);
        let result = channel.handle_chunk(&keepalive, now, &mut dispatcher);

        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::WindowViolation)));
    }

    #[test]
    fn test_window_overshoot_tolerated_by_default() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        channel
            .handle_chunk(&windows_init_frame(0x20), now, &mut dispatcher)
            .unwrap();
        sent_frames(&mut channel);

        for _ in 0..HARD_WINDOW + 1 {
            let mut bytes = codec::encode_data(Token(*b"AT"), Some(1), &[0]);
            channel.sequence.restamp(&mut bytes, true, true);
        }

        let keepalive = short_control_frame(CTL_KEEPALIVE, 0x30, 0x00);
        channel.handle_chunk(&keepalive, now, &mut dispatcher).unwrap();

        // The pacer halts until the peer frees the window.
        let mut bytes = codec::encode_data(Token(*b"AT"), Some(1), &[7]);
        codec::finalize(&mut bytes);
        channel.enqueue(bytes, "stalled");
        channel.pump(now);

        assert!(sent_frames(&mut channel).is_empty());
        assert!(channel.pacer.is_waiting_for_ack());
    }

    #[test]
    fn test_close_releases_everything() {
        let mut channel = channel();
        let mut dispatcher = Recorder::new();
        let now = Instant::now();

        channel
            .handle_chunk(&stream_data_frame(0x21, 0x10, 5, &[1]), now, &mut dispatcher)
            .unwrap();
        channel.handle_chunk(&[MAGIC, 0x00], now, &mut dispatcher).unwrap();

        let mut bytes = codec::encode_data(Token(*b"AT"), Some(1), &[1]);
        codec::finalize(&mut bytes);
        channel.enqueue(bytes, "stuck");

        channel.close(false, &mut dispatcher);

        assert_eq!(channel.get_state(), ChannelState::Disconnected);
        assert!(!channel.pacer.has_pending());
        assert!(channel.assembler.is_empty());
        assert_eq!(channel.reassembler.buffered_len(), 0);
        assert!(channel.write_buffer.is_empty());
        assert!(!channel.sequence.startup_seeded());
    }

    #[test]
    fn test_goodbye_frame_on_notify_close() {
        struct Goodbyer;

        impl TokenHandler for Goodbyer {
            fn handle_token(
                &mut self,
                _message: TokenMessage,
                _session: &SessionState,
            ) -> Vec<OutboundFrame> {
                Vec::new()
            }

            fn goodbye(&mut self, _session: &SessionState) -> Option<OutboundFrame> {
                Some(OutboundFrame::priority(
                    codec::make_short_control(TYPE_ACK),
                    "goodbye",
                ))
            }
        }

        let mut channel = channel();
        let mut dispatcher = Goodbyer;
        let now = Instant::now();

        channel
            .handle_chunk(&windows_init_frame(0x20), now, &mut dispatcher)
            .unwrap();
        sent_frames(&mut channel);

        // No stream attached, so the goodbye lands in the write buffer and
        // the raw flush is skipped.
        channel.close(true, &mut dispatcher);

        assert_eq!(channel.get_state(), ChannelState::Disconnected);
    }
}
