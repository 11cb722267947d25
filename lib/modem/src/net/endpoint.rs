//! Connection factory and event loop. Owns the listener, a pool of reusable
//! channels and the polls that drive them. New connections sit on the
//! handshake poll until their startup probe identifies a platform; only then
//! do they graduate to the live poll.

use crate::net::channel::{Channel, ChannelId, ChannelState, ClosePolicy};
use crate::net::dispatch::TokenHandler;
use crate::net::handshake::Platform;
use crate::net::pacer::{PacerConfig, PacerStatus};
use crate::net::shared::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
use indexmap::IndexSet;
use mio::net::TcpListener;
use quartz::logging::{self, Logger};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Describes a change in the connectivity status of a channel.
#[derive(Debug, Copy, Clone)]
pub enum ConnectionChange {
    Connected(Platform, ChannelId),
    Disconnected(ChannelId),
}

/// Handles all connection management and network transmission.
pub struct Endpoint<D: TokenHandler> {
    server: TcpListener,

    server_poll: mio::Poll,
    handshake_poll: mio::Poll,
    live_poll: mio::Poll,
    events: mio::Events,

    channels: Vec<Channel>,
    free: Vec<ChannelId>,
    open: IndexSet<ChannelId>,

    changes: Vec<ConnectionChange>,

    dispatcher: D,
    pacer_config: PacerConfig,
    policy: ClosePolicy,
    max_clients: usize,

    housekeeping_time: Instant,

    log: Logger,
}

impl<D: TokenHandler> Endpoint<D> {
    const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    const INGRESS_TIMEOUT: Duration = Duration::from_secs(30);
    const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3);
    const ZERO_TIME: Duration = Duration::from_secs(0);
    const SERVER_POLL_TOKEN: mio::Token = mio::Token(0);

    /// Constructs a new `Endpoint` bound to `address`
    /// (`<ip_or_domain>:<port>`).
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        address: &str,
        dispatcher: D,
        pacer_config: PacerConfig,
        policy: ClosePolicy,
        max_clients: usize,
        log: L,
    ) -> NetworkResult<Endpoint<D>> {
        let endpoint_log = logging::child(log);

        let socket_address = address
            .parse::<SocketAddr>()
            .map_err(|_| NetworkError::Fatal(ErrorType::Io(io::ErrorKind::InvalidInput)))?;

        let server_poll = mio::Poll::new()?;
        let server = TcpListener::bind(&socket_address)?;

        server_poll.register(
            &server,
            Self::SERVER_POLL_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        Ok(Endpoint {
            server,
            server_poll,
            handshake_poll: mio::Poll::new()?,
            live_poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(8192),
            channels: Vec::new(),
            free: Vec::new(),
            open: IndexSet::new(),
            changes: Vec::new(),
            dispatcher,
            pacer_config,
            policy,
            max_clients,
            housekeeping_time: Instant::now(),
            log: endpoint_log,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    #[inline]
    pub fn open_channels(&self) -> usize {
        self.open.len()
    }

    #[inline]
    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    /// Queues application frames on a channel; they drain under the pacer's
    /// window rules on subsequent syncs.
    pub fn push(&mut self, channel_id: ChannelId, bytes: Vec<u8>, label: &'static str) {
        self.channels[channel_id].enqueue(bytes, label);
    }

    /// Runs one scheduling pass: housekeeping, pacer timers, egress
    /// flushing, accepting and event processing.
    pub fn sync(&mut self, now: Instant) {
        if now.duration_since(self.housekeeping_time) >= Self::HOUSEKEEPING_INTERVAL {
            self.housekeeping(now);
            self.housekeeping_time = now;
        }

        self.tick_channels(now);
        self.pump_channels(now);
        self.flush_channels(now);
        self.accept_connections(now);
        self.poll_handshake(now);
        self.poll_live(now);
    }

    /// Drains all the changes accumulated since the last `sync`.
    #[inline]
    pub fn changes(&mut self) -> impl Iterator<Item = ConnectionChange> + '_ {
        self.changes.drain(..)
    }

    fn housekeeping(&mut self, now: Instant) {
        let ids: Vec<ChannelId> = self.open.iter().copied().collect();

        for id in ids {
            let timed_out = match self.channels[id].get_state() {
                ChannelState::Handshake(since) => {
                    now.duration_since(since) >= Self::HANDSHAKE_TIMEOUT
                }
                ChannelState::Connected(_) => {
                    self.channels[id].last_ingress_elapsed(now) >= Self::INGRESS_TIMEOUT
                }
                ChannelState::Disconnected => false,
            };

            if timed_out {
                logging::debug!(self.log, "channel timed out";
                                "context" => "housekeeping",
                                "channel_id" => id,
                                "state" => ?self.channels[id].get_state());
                self.close_channel(id, false);
            }
        }
    }

    fn tick_channels(&mut self, now: Instant) {
        let ids: Vec<ChannelId> = self.open.iter().copied().collect();

        for id in ids {
            if self.channels[id].tick(now) == PacerStatus::PeerSilent
                && self.policy.close_on_peer_silence
            {
                logging::warn!(self.log, "peer silent through the full heartbeat budget";
                               "context" => "tick",
                               "channel_id" => id);
                self.close_channel(id, false);
            }
        }
    }

    fn pump_channels(&mut self, now: Instant) {
        let ids: Vec<ChannelId> = self.open.iter().copied().collect();

        for id in ids {
            self.channels[id].pump(now);
        }
    }

    fn flush_channels(&mut self, now: Instant) {
        let ids: Vec<ChannelId> = self.open.iter().copied().collect();

        for id in ids {
            if !self.channels[id].has_egress() {
                continue;
            }

            if self.channels[id].send(now).has_failed() {
                self.close_channel(id, false);
            }
        }
    }

    fn accept_connections(&mut self, now: Instant) {
        self.server_poll
            .poll(&mut self.events, Some(Self::ZERO_TIME))
            .expect("Listen poll failed");

        let ready = self
            .events
            .iter()
            .any(|event| event.token() == Self::SERVER_POLL_TOKEN);

        if !ready {
            return;
        }

        loop {
            match self.server.accept() {
                Ok((stream, address)) => {
                    if self.open.len() >= self.max_clients {
                        logging::warn!(self.log, "connection refused, at capacity";
                                       "context" => "accept",
                                       "peer" => %address,
                                       "open" => self.open.len());
                        drop(stream);
                        continue;
                    }

                    let id = match self.free.pop() {
                        Some(id) => id,
                        None => {
                            let id = self.channels.len();
                            self.channels.push(Channel::new(
                                self.pacer_config.clone(),
                                self.policy,
                                &self.log,
                            ));
                            id
                        }
                    };

                    self.channels[id].open(id, stream, now);

                    if self.channels[id].register(id, &self.handshake_poll).has_failed() {
                        self.close_channel(id, false);
                        continue;
                    }

                    self.open.insert(id);

                    logging::debug!(self.log, "connection accepted";
                                    "context" => "accept",
                                    "channel_id" => id,
                                    "peer" => %address);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::error!(self.log, "failure accepting connection";
                                    "context" => "accept",
                                    "error" => %err);
                    break;
                }
            }
        }
    }

    fn poll_handshake(&mut self, now: Instant) {
        self.handshake_poll
            .poll(&mut self.events, Some(Self::ZERO_TIME))
            .expect("Handshake poll failed");

        let ready = Self::collect_ready(&self.events);

        for (id, readable, writable) in ready {
            if !self.open.contains(&id) {
                continue;
            }

            let result = {
                let channel = &mut self.channels[id];
                let dispatcher = &mut self.dispatcher;

                let mut outcome: NetworkResult<usize> = Ok(0);

                if readable {
                    outcome = channel.receive(now, dispatcher);
                }

                if writable && !outcome.has_failed() && channel.has_egress() {
                    let sent = channel.send(now);
                    if sent.has_failed() {
                        outcome = sent;
                    }
                }

                outcome
            };

            if result.has_failed() {
                self.close_channel(id, false);
                continue;
            }

            // Platform detected: graduate to the live poll.
            if let ChannelState::Connected(platform) = self.channels[id].get_state() {
                drop(self.channels[id].deregister(&self.handshake_poll));

                if self.channels[id].register(id, &self.live_poll).has_failed() {
                    self.close_channel(id, false);
                    continue;
                }

                // Push the handshake reply out right away.
                drop(self.channels[id].send(now));

                self.changes.push(ConnectionChange::Connected(platform, id));

                logging::info!(self.log, "handshake complete";
                               "context" => "handshake",
                               "channel_id" => id,
                               "platform" => ?platform);
            }
        }
    }

    fn poll_live(&mut self, now: Instant) {
        self.live_poll
            .poll(&mut self.events, Some(Self::ZERO_TIME))
            .expect("Live poll failed");

        let ready = Self::collect_ready(&self.events);

        for (id, readable, writable) in ready {
            if !self.open.contains(&id) {
                continue;
            }

            let result = {
                let channel = &mut self.channels[id];
                let dispatcher = &mut self.dispatcher;

                let mut outcome: NetworkResult<usize> = Ok(0);

                if readable {
                    outcome = channel.receive(now, dispatcher);
                }

                if !outcome.has_failed() {
                    if writable {
                        channel.resume_writes(now);
                    }

                    if channel.has_egress() {
                        let sent = channel.send(now);
                        if sent.has_failed() {
                            outcome = sent;
                        }
                    }
                }

                outcome
            };

            if result.has_failed() {
                self.close_channel(id, true);
            }
        }
    }

    fn collect_ready(events: &mio::Events) -> Vec<(ChannelId, bool, bool)> {
        events
            .iter()
            .map(|event| {
                (
                    event.token().into(),
                    event.readiness().is_readable(),
                    event.readiness().is_writable(),
                )
            })
            .collect()
    }

    fn close_channel(&mut self, id: ChannelId, notify: bool) {
        let channel = &mut self.channels[id];

        if channel.get_state() == ChannelState::Disconnected {
            return;
        }

        // The channel may sit on either poll; deregistration of the other
        // one fails harmlessly.
        drop(channel.deregister(&self.handshake_poll));
        drop(channel.deregister(&self.live_poll));

        channel.close(notify, &mut self.dispatcher);

        self.open.swap_remove(&id);
        self.free.push(id);
        self.changes.push(ConnectionChange::Disconnected(id));
    }
}
