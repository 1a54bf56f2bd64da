use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 5301;
pub const DEFAULT_DURATION_SECS: u64 = 20;
pub const CALIBRATION_PAYLOAD_LEN: usize = 1024;
pub const TCP_RUN_PAYLOAD_LEN: usize = 4096;
pub const UDP_RUN_PAYLOAD_LEN: usize = 1024;

/// `netbloat` measures end-to-end throughput and bufferbloat between two
/// peers over TCP or UDP.
#[derive(Parser, Debug, Clone)]
#[command(name = "netbloat", version, about)]
pub struct Cli {
    /// Run as server.
    #[arg(short = 's', long = "server")]
    pub server: bool,

    /// Run as client, connecting to the given server address.
    #[arg(short = 'c', long = "client", value_name = "IP")]
    pub client: Option<IpAddr>,

    /// Server port.
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Download direction (server -> client). Default is upload.
    #[arg(short = 'R', long = "reverse")]
    pub reverse: bool,

    /// Test duration in seconds.
    #[arg(short = 't', long = "time", default_value_t = DEFAULT_DURATION_SECS)]
    pub duration_secs: u64,

    /// Use UDP instead of TCP.
    #[arg(short = 'u', long = "udp")]
    pub udp: bool,

    /// Bandwidth cap, e.g. "1M" (bits/sec) or "500pps" (packets/sec).
    #[arg(short = 'b', long = "bandwidth", value_name = "RATE")]
    pub bandwidth: Option<String>,

    /// Generate a graph of the run via gnuplot.
    #[arg(short = 'g', long = "graph")]
    pub graph: bool,

    /// Keep the temporary data files instead of deleting them.
    #[arg(short = 'k', long = "keep")]
    pub keep: bool,

    /// Increase verbosity (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

impl Cli {
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    /// Validates the flag combination and lowers the CLI into a `RunConfig`.
    /// Only meaningful on the client; the server derives its `RunConfig`
    /// from the handshake JSON instead.
    pub fn into_run_config(self) -> Result<RunConfig> {
        if self.server == self.client.is_some() {
            bail!("exactly one of -s or -c <ip> must be given");
        }

        let bandwidth_cap = self
            .bandwidth
            .as_deref()
            .map(parse_bandwidth_cap)
            .transpose()
            .context("invalid -b value")?;

        Ok(RunConfig {
            transport: if self.udp { Transport::Udp } else { Transport::Tcp },
            direction: if self.reverse { Direction::Download } else { Direction::Upload },
            duration_secs: self.duration_secs,
            server_port: self.port,
            bandwidth_cap,
            verbosity: self.verbosity,
            graph: self.graph,
            keep: self.keep,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "kebab-case")]
pub enum BandwidthCap {
    BitsPerSecond(f64),
    PacketsPerSecond(f64),
}

impl BandwidthCap {
    pub fn as_bits_per_second(&self) -> Option<f64> {
        match self {
            Self::BitsPerSecond(v) => Some(*v),
            Self::PacketsPerSecond(_) => None,
        }
    }

    pub fn as_packets_per_second(&self) -> Option<f64> {
        match self {
            Self::PacketsPerSecond(v) => Some(*v),
            Self::BitsPerSecond(_) => None,
        }
    }
}

/// Parses `-b` values such as `1M`, `500k`, `2g`, or `500pps`.
fn parse_bandwidth_cap(raw: &str) -> Result<BandwidthCap> {
    let raw = raw.trim();
    if let Some(digits) = raw.strip_suffix("pps") {
        let value: f64 = digits.parse().context("expected a number before 'pps'")?;
        return Ok(BandwidthCap::PacketsPerSecond(value));
    }

    let (digits, multiplier) = match raw.chars().last() {
        Some('k') | Some('K') => (&raw[..raw.len() - 1], 1_000.0),
        Some('m') | Some('M') => (&raw[..raw.len() - 1], 1_000_000.0),
        Some('g') | Some('G') => (&raw[..raw.len() - 1], 1_000_000_000.0),
        _ => (raw, 1.0),
    };

    let value: f64 = digits.parse().context("expected a number in -b")?;
    Ok(BandwidthCap::BitsPerSecond(value * multiplier))
}

/// Immutable once the handshake completes; carried over the control
/// channel as JSON so client and server agree on the parameters of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub transport: Transport,
    pub direction: Direction,
    pub duration_secs: u64,
    pub server_port: u16,
    pub bandwidth_cap: Option<BandwidthCap>,
    pub verbosity: u8,
    pub graph: bool,
    pub keep: bool,
}

impl RunConfig {
    pub fn calibration_payload_len(&self) -> usize {
        CALIBRATION_PAYLOAD_LEN
    }

    pub fn run_payload_len(&self) -> usize {
        match self.transport {
            Transport::Tcp => TCP_RUN_PAYLOAD_LEN,
            Transport::Udp => UDP_RUN_PAYLOAD_LEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_megabit_cap() {
        let cap = parse_bandwidth_cap("1M").unwrap();
        assert_eq!(cap, BandwidthCap::BitsPerSecond(1_000_000.0));
    }

    #[test]
    fn parses_packets_per_second_cap() {
        let cap = parse_bandwidth_cap("500pps").unwrap();
        assert_eq!(cap, BandwidthCap::PacketsPerSecond(500.0));
    }

    #[test]
    fn parses_plain_bits_per_second() {
        let cap = parse_bandwidth_cap("2000").unwrap();
        assert_eq!(cap, BandwidthCap::BitsPerSecond(2000.0));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bandwidth_cap("lots").is_err());
    }

    #[test]
    fn run_payload_len_depends_on_transport() {
        let mut cfg = RunConfig {
            transport: Transport::Tcp,
            direction: Direction::Upload,
            duration_secs: 1,
            server_port: DEFAULT_PORT,
            bandwidth_cap: None,
            verbosity: 0,
            graph: false,
            keep: false,
        };
        assert_eq!(cfg.run_payload_len(), TCP_RUN_PAYLOAD_LEN);
        cfg.transport = Transport::Udp;
        assert_eq!(cfg.run_payload_len(), UDP_RUN_PAYLOAD_LEN);
    }
}
