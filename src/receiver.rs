//! Reads `SenderRecord`s off the data channel, measures reception per
//! 100 ms interval, and forwards enriched `IntervalFeedback` over the
//! control channel.

use std::time::Duration;

use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use wire::{IntervalFeedback, SenderRecord};

use crate::control::UDP_STOP_SIGNAL;

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const INTERVAL_WINDOW: Duration = Duration::from_millis(100);
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(20);

/// Abstracts over the two transports so the boundary-crossing and
/// feedback logic below is written once, matching the source tool's
/// single socket-type-agnostic receive loop.
pub enum DataSocket<'a> {
    Tcp(&'a mut TcpStream),
    Udp(&'a UdpSocket),
}

enum RecvOutcome {
    Data(usize),
    TimedOut,
    PeerClosed,
}

impl DataSocket<'_> {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<RecvOutcome> {
        let fut = async {
            match self {
                DataSocket::Tcp(stream) => Ok(stream.read(buf).await?),
                DataSocket::Udp(socket) => Ok(socket.recv(buf).await?),
            }
        };

        match tokio::time::timeout(READ_TIMEOUT, fut).await {
            Ok(Ok(0)) => Ok(RecvOutcome::PeerClosed),
            Ok(Ok(n)) => Ok(RecvOutcome::Data(n)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(RecvOutcome::TimedOut),
        }
    }
}

struct ReceiveAccumulator {
    window_start: Instant,
    packets: u64,
    bytes: u64,
    total_packets: u64,
}

impl ReceiveAccumulator {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            packets: 0,
            bytes: 0,
            total_packets: 0,
        }
    }

    /// Records one received packet; returns the closed window (duration,
    /// packets, bytes) if this packet crossed the 100 ms boundary.
    fn record(&mut self, now: Instant, len: u64) -> Option<(f64, u64, u64)> {
        self.packets += 1;
        self.bytes += len;
        self.total_packets += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= INTERVAL_WINDOW {
            let closed = (elapsed.as_secs_f64(), self.packets, self.bytes);
            self.window_start = now;
            self.packets = 0;
            self.bytes = 0;
            Some(closed)
        } else {
            None
        }
    }
}

/// Drives the receive loop until the peer closes, the UDP stop sentinel
/// arrives, or the watchdog trips.
pub async fn run(mut socket: DataSocket<'_>, feedback_tx: mpsc::Sender<Bytes>) -> Result<()> {
    let mut buf = vec![0u8; 8192];
    let mut accumulator = ReceiveAccumulator::new(Instant::now());
    let mut last_success = Instant::now();

    loop {
        match socket.recv(&mut buf).await? {
            RecvOutcome::TimedOut => {
                if last_success.elapsed() >= WATCHDOG_TIMEOUT {
                    bail!("data socket read timeout");
                }
                continue;
            }
            RecvOutcome::PeerClosed => return Ok(()),
            RecvOutcome::Data(n) => {
                last_success = Instant::now();

                if &buf[..n] == UDP_STOP_SIGNAL.as_bytes() {
                    return Ok(());
                }

                if let Some((duration, packets, bytes)) = accumulator.record(Instant::now(), n as u64) {
                    if let Some(block) = SenderRecord::find_block(&buf[..n]) {
                        let feedback = IntervalFeedback {
                            echoed_block: Bytes::copy_from_slice(block),
                            receiver_interval_duration: duration,
                            receiver_interval_packets: packets,
                            receiver_interval_bytes: bytes,
                            receiver_total_packets: accumulator.total_packets,
                        };
                        let mut out = BytesMut::new();
                        feedback.encode(&mut out);
                        // A full channel only happens if the control
                        // forwarder has died; in that case the run is
                        // ending anyway, so drop silently.
                        let _ = feedback_tx.try_send(out.freeze());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_closes_window_only_past_100ms() {
        let start = Instant::now();
        let mut acc = ReceiveAccumulator::new(start);
        assert!(acc.record(start + Duration::from_millis(30), 512).is_none());
        let closed = acc.record(start + Duration::from_millis(110), 512);
        assert_eq!(closed, Some((0.110, 2, 1024)));
        assert_eq!(acc.total_packets, 2);
    }

    #[test]
    fn total_packets_keeps_accumulating_across_windows() {
        let start = Instant::now();
        let mut acc = ReceiveAccumulator::new(start);
        acc.record(start + Duration::from_millis(110), 100);
        acc.record(start + Duration::from_millis(250), 100);
        assert_eq!(acc.total_packets, 2);
    }
}
