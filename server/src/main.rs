use std::env;
use std::thread;
use std::time::{Duration, Instant};

use modem::net::endpoint::Endpoint;
use quartz::logging;
use quartz::time;

mod config;
mod tokens;

use crate::config::ServerConfig;
use crate::tokens::LoggingDispatcher;

fn main() {
    let config = match env::args().nth(1) {
        Some(path) => ServerConfig::load(path),
        None => ServerConfig::default(),
    };

    let log = logging::init(&config.server.log_level);
    let address = config.address();

    let dispatcher = LoggingDispatcher::new(&log);

    let mut endpoint = Endpoint::new(
        &address,
        dispatcher,
        config.pacer_config(),
        config.close_policy(),
        config.server.max_clients as usize,
        &log,
    )
    .expect("Error starting endpoint");

    logging::info!(log, "listening for vintage clients";
                   "context" => "main",
                   "address" => %address,
                   "max_clients" => config.server.max_clients,
                   "started_at" => time::timestamp_secs());

    loop {
        endpoint.sync(Instant::now());

        for change in endpoint.changes() {
            logging::info!(log, "connection change";
                           "context" => "main",
                           "change" => ?change);
        }

        thread::sleep(Duration::from_millis(1));
    }
}
