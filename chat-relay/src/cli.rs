use std::{net::SocketAddr, time::Duration};

use clap::{Parser, builder::RangedU64ValueParser};

use crate::{
    relay::{MAX_HISTORY, MAX_READ_CHUNK, MAX_TEXT_CHARS, RelayConfig},
    session::MAX_QUEUE_DEPTH,
};

/// Relay server for the terminal (raw-stream) and browser (web-socket) chat clients.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address for terminal clients. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8888")]
    pub raw_listen: SocketAddr,

    /// Socket address for browser clients. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8765")]
    pub web_listen: SocketAddr,

    /// Recent chat messages replayed to browser clients when they connect (0 disables).
    #[arg(
        long,
        default_value_t = 50,
        value_parser = RangedU64ValueParser::<usize>::new().range(0..=MAX_HISTORY as u64)
    )]
    pub history: usize,

    /// Longest chat text accepted from browser clients, in characters.
    #[arg(
        long,
        default_value_t = 500,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..=MAX_TEXT_CHARS as u64)
    )]
    pub max_text_chars: usize,

    /// Largest single read from a terminal client, in bytes.
    #[arg(
        long,
        default_value_t = 1024,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..=MAX_READ_CHUNK as u64)
    )]
    pub read_chunk: usize,

    /// Outbound messages buffered per client before it is disconnected as too slow.
    #[arg(
        long,
        default_value_t = 256,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..=MAX_QUEUE_DEPTH as u64)
    )]
    pub queue_depth: usize,

    /// Close clients that send nothing for this many seconds.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Do not announce departures to the remaining clients.
    #[arg(long)]
    pub no_leave_notice: bool,
}

impl Cli {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            history: self.history,
            max_text_chars: self.max_text_chars,
            read_chunk: self.read_chunk,
            queue_depth: self.queue_depth,
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            leave_notice: !self.no_leave_notice,
        }
    }
}
