//! A stand-in token dispatcher. The real application handlers (chat, mail,
//! keywords, file transfer) plug in through the same trait; this one logs
//! what the core decoded and waves sessions goodbye.

use modem::net::codec;
use modem::net::dispatch::{OutboundFrame, TokenHandler, TokenMessage};
use modem::net::frame::TYPE_ACK;
use modem::net::handshake::SessionState;
use quartz::logging::{self, Logger};

pub struct LoggingDispatcher {
    log: Logger,
}

impl LoggingDispatcher {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> LoggingDispatcher {
        LoggingDispatcher {
            log: logging::child(log),
        }
    }
}

impl TokenHandler for LoggingDispatcher {
    fn handle_token(&mut self, message: TokenMessage, session: &SessionState) -> Vec<OutboundFrame> {
        let payload_bytes: usize = message.frames.iter().map(Vec::len).sum();

        logging::info!(self.log, "token message decoded";
                       "context" => "dispatch",
                       "token" => %message.token,
                       "stream_id" => message.stream_id,
                       "frames" => message.frames.len(),
                       "bytes" => payload_bytes,
                       "platform" => ?session.platform);

        Vec::new()
    }

    fn goodbye(&mut self, session: &SessionState) -> Option<OutboundFrame> {
        logging::debug!(self.log, "sending goodbye";
                        "context" => "dispatch",
                        "platform" => ?session.platform);

        Some(OutboundFrame::priority(
            codec::make_short_control(TYPE_ACK),
            "goodbye",
        ))
    }
}
