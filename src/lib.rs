//! `netbloat` measures end-to-end throughput and bufferbloat between two
//! peers over TCP or UDP: it calibrates an unloaded RTT, then saturates
//! the path in one direction while tracking RTT growth, throughput, and
//! (for UDP) packet loss.

pub mod aggregator;
pub mod calibration;
pub mod config;
pub mod control;
pub mod graph;
pub mod phase;
pub mod receiver;
pub mod sender;
pub mod session;

use anyhow::Result;
use config::Cli;

/// Dispatches to the client or server role per the parsed CLI flags.
/// `Cli::into_run_config` enforces that exactly one of `-s`/`-c` is set.
pub async fn run(cli: Cli) -> Result<()> {
    if cli.server {
        session::run_server(cli).await
    } else {
        session::run_client(cli).await
    }
}
