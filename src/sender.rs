//! Emits `SenderRecord`s on the data channel at the phase-appropriate
//! cadence, honoring an optional rate cap.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use wire::{RecordKind, SenderRecord};

use crate::config::{BandwidthCap, RunConfig, Transport};
use crate::control::UDP_STOP_SIGNAL;
use crate::phase::{Phase, PhaseCell};

const CALIBRATION_INTERVAL: Duration = Duration::from_millis(200);
const INTERVAL_WINDOW: Duration = Duration::from_millis(100);
const TCP_BATCH_SIZE: usize = 5;
const UDP_BATCH_SIZE: usize = 20;

/// Outcome of attempting to send one record.
enum SendOutcome {
    Sent,
    /// The peer is gone (reset or broken pipe); the caller should stop
    /// issuing further sends rather than treating this as success.
    PeerGone,
}

/// Bookkeeping the sender folds into each outgoing record: the counts
/// and duration of the *previous* 100 ms window, frozen at the boundary.
struct IntervalAccumulator {
    window_start: Instant,
    send_count: u64,
    bytes_sent: u64,
    frozen_duration: f64,
    frozen_count: u64,
    frozen_bytes: u64,
}

impl IntervalAccumulator {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            send_count: 0,
            bytes_sent: 0,
            frozen_duration: 0.0,
            frozen_count: 0,
            frozen_bytes: 0,
        }
    }

    fn record_send(&mut self, now: Instant, payload_len: u64) {
        self.send_count += 1;
        self.bytes_sent += payload_len;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= INTERVAL_WINDOW {
            self.frozen_duration = elapsed.as_secs_f64();
            self.frozen_count = self.send_count;
            self.frozen_bytes = self.bytes_sent;
            self.window_start = now;
            self.send_count = 0;
            self.bytes_sent = 0;
        }
    }
}

struct Pacing {
    batch_size: usize,
    batch_interval: Duration,
}

fn compute_pacing(cap: &BandwidthCap, transport: Transport, payload_len: usize) -> Pacing {
    let (default_batch_size, sends_per_second) = match (transport, cap) {
        (Transport::Udp, BandwidthCap::BitsPerSecond(bps)) => {
            // 1024-byte payloads, so packets/sec = (bps/8) bytes-per-sec / 1024.
            (UDP_BATCH_SIZE, (bps / 8.0) / 1024.0)
        }
        (Transport::Udp, BandwidthCap::PacketsPerSecond(pps)) => (UDP_BATCH_SIZE, *pps),
        (Transport::Tcp, BandwidthCap::BitsPerSecond(bps)) => {
            // Convert via a nominal 1400-byte MTU packet rate, then rescale
            // to the actual 4 KiB payload per send.
            let mtu_packets_per_second = (bps / 8.0) / 1400.0;
            (
                TCP_BATCH_SIZE,
                mtu_packets_per_second * (1400.0 / payload_len as f64),
            )
        }
        (Transport::Tcp, BandwidthCap::PacketsPerSecond(pps)) => (TCP_BATCH_SIZE, *pps),
    };

    let batch_size = if sends_per_second / default_batch_size as f64 < 1.0 {
        1
    } else {
        default_batch_size
    };
    let batches_per_second = sends_per_second / batch_size as f64;
    let batch_interval = Duration::from_secs_f64(1.0 / batches_per_second.max(f64::MIN_POSITIVE));

    Pacing {
        batch_size,
        batch_interval,
    }
}

/// Shared driver: calls `send_one` for every record and returns when the
/// deadline or a Stopping phase observation ends the run.
async fn drive<F, Fut>(
    phase: &PhaseCell,
    config: &RunConfig,
    deadline: Instant,
    mut send_one: F,
) -> Result<u64>
where
    F: FnMut(SenderRecord, usize) -> Fut,
    Fut: std::future::Future<Output = Result<SendOutcome>>,
{
    let mut counter = AtomicU64::new(0);
    let mut accumulator = IntervalAccumulator::new(Instant::now());
    let mut batch_remaining: usize = 0;
    // `None` until the first batch is seeded; thereafter only ever
    // advanced by a nominal `+= batch_interval`, never reset to
    // `Instant::now()`, so a slow batch can't push the effective rate
    // below the cap.
    let mut batch_deadline: Option<Instant> = None;

    loop {
        let now = Instant::now();
        if now >= deadline || phase.load() == Phase::Stopping {
            break;
        }

        let (kind, payload_len) = match phase.load() {
            Phase::Calibrating => (RecordKind::Cal, config.calibration_payload_len()),
            _ => (RecordKind::Run, config.run_payload_len()),
        };

        let send_counter = counter.fetch_add(1, Ordering::Relaxed);
        let record = SenderRecord {
            kind,
            send_time: unix_time_now(),
            interval_duration: accumulator.frozen_duration,
            interval_send_count: accumulator.frozen_count,
            interval_bytes_sent: accumulator.frozen_bytes,
            send_counter,
        };

        match send_one(record, payload_len).await? {
            SendOutcome::Sent => {}
            SendOutcome::PeerGone => break,
        }
        accumulator.record_send(Instant::now(), payload_len as u64);

        match phase.load() {
            Phase::Calibrating => tokio::time::sleep(CALIBRATION_INTERVAL).await,
            _ => {
                if let Some(cap) = &config.bandwidth_cap {
                    let pacing = compute_pacing(cap, config.transport, payload_len);
                    if batch_remaining == 0 {
                        batch_remaining = pacing.batch_size;
                        if batch_deadline.is_none() {
                            batch_deadline = Some(Instant::now() + pacing.batch_interval);
                        }
                    }
                    batch_remaining -= 1;
                    if batch_remaining == 0 {
                        let target = batch_deadline.expect("seeded above");
                        let now = Instant::now();
                        if now < target {
                            tokio::time::sleep(target - now).await;
                        }
                        // Drift-compensating: next deadline is nominal, not
                        // measured from "now", so a slow batch does not push
                        // the effective rate below the cap.
                        batch_deadline = Some(target + pacing.batch_interval);
                    }
                }
            }
        }
    }

    Ok(*counter.get_mut())
}

fn unix_time_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub async fn run_tcp(
    stream: &mut TcpStream,
    phase: Arc<PhaseCell>,
    config: Arc<RunConfig>,
    deadline: Instant,
) -> Result<()> {
    drive(&phase, &config, deadline, |record, payload_len| {
        let stream = &mut *stream;
        async move {
            let mut buf = BytesMut::new();
            record.encode(payload_len, &mut buf);
            match stream.write_all(&buf).await {
                Ok(()) => Ok(SendOutcome::Sent),
                Err(e) if is_graceful_close(&e) => {
                    log::info!("data channel closed by peer ({e}), ending run");
                    Ok(SendOutcome::PeerGone)
                }
                Err(e) => Err(e.into()),
            }
        }
    })
    .await?;
    Ok(())
}

pub async fn run_udp(
    socket: &UdpSocket,
    peer: SocketAddr,
    phase: Arc<PhaseCell>,
    config: Arc<RunConfig>,
    deadline: Instant,
) -> Result<()> {
    drive(&phase, &config, deadline, |record, payload_len| async move {
        let mut buf = BytesMut::new();
        record.encode(payload_len, &mut buf);
        match socket.send_to(&buf, peer).await {
            Ok(_) => Ok(SendOutcome::Sent),
            Err(e) if is_graceful_close(&e) => {
                log::info!("data channel closed by peer ({e}), ending run");
                Ok(SendOutcome::PeerGone)
            }
            Err(e) => Err(e.into()),
        }
    })
    .await?;

    let _ = socket.send_to(UDP_STOP_SIGNAL.as_bytes(), peer).await;
    Ok(())
}

/// Blocks until the server-side UDP sender learns the client's address
/// from its "data <session-id>" ping.
pub async fn discover_udp_peer(socket: &UdpSocket, session_id: &str) -> Result<SocketAddr> {
    let expected = format!("data {session_id}");
    let mut buf = [0u8; 256];
    loop {
        let (n, addr) = socket.recv_from(&mut buf).await?;
        if &buf[..n] == expected.as_bytes() {
            return Ok(addr);
        }
    }
}

fn is_graceful_close(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_bps_cap_converts_to_packets_per_second() {
        let pacing = compute_pacing(&BandwidthCap::BitsPerSecond(1_000_000.0), Transport::Udp, 1024);
        // (1e6/8)/1024 ~= 122 pps, batch of 20 -> ~6.1 batches/sec.
        let expected_batches_per_sec = ((1_000_000.0 / 8.0) / 1024.0) / UDP_BATCH_SIZE as f64;
        let expected_interval = Duration::from_secs_f64(1.0 / expected_batches_per_sec);
        assert!((pacing.batch_interval.as_secs_f64() - expected_interval.as_secs_f64()).abs() < 1e-6);
    }

    #[test]
    fn udp_pps_cap_used_directly() {
        let pacing = compute_pacing(&BandwidthCap::PacketsPerSecond(500.0), Transport::Udp, 1024);
        let expected_batches_per_sec = 500.0 / UDP_BATCH_SIZE as f64;
        assert!((1.0 / pacing.batch_interval.as_secs_f64() - expected_batches_per_sec).abs() < 1e-6);
    }

    #[test]
    fn low_rate_cap_degrades_batch_size_to_one() {
        let pacing = compute_pacing(&BandwidthCap::PacketsPerSecond(3.0), Transport::Udp, 1024);
        assert_eq!(pacing.batch_size, 1);
    }

    #[test]
    fn interval_accumulator_freezes_only_after_window_elapses() {
        let start = Instant::now();
        let mut acc = IntervalAccumulator::new(start);
        acc.record_send(start + Duration::from_millis(10), 1024);
        assert_eq!(acc.frozen_count, 0);
        acc.record_send(start + Duration::from_millis(110), 1024);
        assert_eq!(acc.frozen_count, 2);
        assert_eq!(acc.frozen_bytes, 2048);
    }
}
