//! Joins control-channel `IntervalFeedback` with local receive timestamps,
//! computes derived metrics, drives the calibration-to-running phase
//! transition, and persists both a graph data file and a raw record file.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::time::Instant;
use wire::{IntervalFeedback, RecordKind, SenderRecord};

use crate::calibration::CalibrationOracle;
use crate::config::{RunConfig, Transport};
use crate::phase::{Phase, PhaseCell};

const STDOUT_RATE_LIMIT: Duration = Duration::from_secs(1);
const FEEDBACK_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Default)]
pub struct RunMetrics {
    pub t_seconds: f64,
    pub sender_mbps: f64,
    pub receiver_mbps: f64,
    pub rtt_ms: f64,
    pub unloaded_rtt_ms: f64,
    pub bdp_bytes: f64,
    pub buffered_bytes: f64,
    pub bloat_factor: f64,
    pub sender_pps: Option<f64>,
    pub receiver_pps: Option<f64>,
    pub packets_dropped: Option<u64>,
    pub drop_percent: Option<f64>,
}

pub struct OutputAggregator {
    phase: Arc<PhaseCell>,
    calibration: Arc<CalibrationOracle>,
    config: Arc<RunConfig>,
    run_origin: Option<f64>,
    last_stdout: Instant,
    previous_total_dropped: u64,
    header_written: bool,
    run_record_count: u64,
    graph_file: NamedTempFile,
    raw_file: NamedTempFile,
}

impl OutputAggregator {
    pub fn new(
        phase: Arc<PhaseCell>,
        calibration: Arc<CalibrationOracle>,
        config: Arc<RunConfig>,
    ) -> Result<Self> {
        // Port-qualified so concurrent runs on one host (and tests) can find
        // their own files instead of colliding on a bare prefix.
        let port = config.server_port;
        Ok(Self {
            phase,
            calibration,
            config,
            run_origin: None,
            last_stdout: Instant::now() - STDOUT_RATE_LIMIT,
            previous_total_dropped: 0,
            header_written: false,
            run_record_count: 0,
            graph_file: tempfile::Builder::new()
                .prefix(&format!("netbloat-{port}-graph-"))
                .tempfile()?,
            raw_file: tempfile::Builder::new()
                .prefix(&format!("netbloat-{port}-raw-"))
                .tempfile()?,
        })
    }

    /// Drains feedback until the channel closes (all upstream workers
    /// done) or the configured duration elapses. `relay` optionally
    /// receives every formatted display line, for the peer that is not
    /// colocated with this aggregator to show live progress.
    pub async fn run(
        mut self,
        mut feedback_rx: mpsc::Receiver<Bytes>,
        relay: Option<mpsc::Sender<String>>,
    ) -> Result<FinishedRun> {
        loop {
            let next = tokio::time::timeout(FEEDBACK_POLL, feedback_rx.recv()).await;
            let bytes = match next {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(_) => {
                    if self.phase.load() == Phase::Stopping {
                        break;
                    }
                    continue;
                }
            };

            let (sender, feedback) = match IntervalFeedback::decode(&bytes) {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("dropping malformed feedback record: {e}");
                    continue;
                }
            };

            self.raw_file.write_all(&bytes)?;
            self.raw_file.write_all(b"\n")?;

            let recv_time = unix_time_now();
            let rtt = recv_time - sender.send_time;
            let origin = *self.run_origin.get_or_insert(recv_time);
            let t_seconds = recv_time - origin;

            match sender.kind {
                RecordKind::Cal => self.handle_calibration(rtt, &relay),
                RecordKind::Run => self.handle_run(t_seconds, &sender, &feedback, rtt, &relay)?,
            }
        }

        Ok(FinishedRun {
            graph_file: self.graph_file,
            raw_file: self.raw_file,
            run_record_count: self.run_record_count,
        })
    }

    fn handle_calibration(&mut self, rtt: f64, relay: &Option<mpsc::Sender<String>>) {
        self.calibration.observe(rtt);

        if self.phase.load() == Phase::Calibrating && self.calibration.should_transition() {
            self.calibration.mark_calibrated();
            self.phase.store(Phase::Running);
        }

        if self.last_stdout.elapsed() >= STDOUT_RATE_LIMIT {
            self.last_stdout = Instant::now();
            let line = format!(
                "calibrating... rtt={:.2}ms samples={}",
                rtt * 1000.0,
                self.calibration.sample_count()
            );
            println!("{line}");
            relay_line(relay, line);
        }
    }

    fn handle_run(
        &mut self,
        t_seconds: f64,
        sender: &SenderRecord,
        feedback: &IntervalFeedback,
        rtt: f64,
        relay: &Option<mpsc::Sender<String>>,
    ) -> Result<()> {
        let metrics = compute_run_metrics(
            t_seconds,
            sender,
            feedback,
            rtt,
            self.calibration.unloaded_rtt(),
            self.config.transport,
            &mut self.previous_total_dropped,
        );

        if !self.header_written {
            writeln!(self.graph_file, "{}", graph_header(self.config.transport))?;
            self.header_written = true;
        }
        writeln!(self.graph_file, "{}", graph_row(&metrics, self.config.transport))?;
        self.run_record_count += 1;

        if self.last_stdout.elapsed() >= STDOUT_RATE_LIMIT {
            self.last_stdout = Instant::now();
            let line = format_run_line(&metrics, self.config.transport);
            println!("{line}");
            relay_line(relay, line);
        }

        Ok(())
    }
}

pub struct FinishedRun {
    pub graph_file: NamedTempFile,
    pub raw_file: NamedTempFile,
    pub run_record_count: u64,
}

fn relay_line(relay: &Option<mpsc::Sender<String>>, line: String) {
    if let Some(tx) = relay {
        let _ = tx.try_send(line);
    }
}

fn compute_run_metrics(
    t_seconds: f64,
    sender: &SenderRecord,
    feedback: &IntervalFeedback,
    rtt: f64,
    unloaded_rtt: f64,
    transport: Transport,
    previous_total_dropped: &mut u64,
) -> RunMetrics {
    let sender_mbps = mbps(sender.interval_bytes_sent, sender.interval_duration);
    let receiver_mbps = mbps(feedback.receiver_interval_bytes, feedback.receiver_interval_duration);

    let receiver_bytes_per_sec = safe_div(
        feedback.receiver_interval_bytes as f64,
        feedback.receiver_interval_duration,
    );
    let bdp_bytes = receiver_bytes_per_sec * unloaded_rtt;
    let buffered_bytes = receiver_bytes_per_sec * rtt;
    let bloat_factor = if bdp_bytes > 0.0 { buffered_bytes / bdp_bytes } else { 0.0 };

    let mut metrics = RunMetrics {
        t_seconds,
        sender_mbps,
        receiver_mbps,
        rtt_ms: rtt * 1000.0,
        unloaded_rtt_ms: unloaded_rtt * 1000.0,
        bdp_bytes,
        buffered_bytes,
        bloat_factor,
        sender_pps: None,
        receiver_pps: None,
        packets_dropped: None,
        drop_percent: None,
    };

    if transport == Transport::Udp {
        let sender_pps = safe_div(sender.interval_send_count as f64, sender.interval_duration);
        let receiver_pps = safe_div(
            feedback.receiver_interval_packets as f64,
            feedback.receiver_interval_duration,
        );

        let sender_total = sender.send_counter + 1;
        let receiver_total = feedback.receiver_total_packets;
        let total_dropped_so_far = sender_total.saturating_sub(receiver_total);
        let dropped_this_interval = total_dropped_so_far.saturating_sub(*previous_total_dropped);
        *previous_total_dropped = total_dropped_so_far;

        let drop_percent = safe_div(dropped_this_interval as f64 * 100.0, sender.interval_send_count as f64);

        metrics.sender_pps = Some(sender_pps);
        metrics.receiver_pps = Some(receiver_pps);
        metrics.packets_dropped = Some(dropped_this_interval);
        metrics.drop_percent = Some(drop_percent);
    }

    metrics
}

fn mbps(bytes: u64, duration_secs: f64) -> f64 {
    safe_div(bytes as f64 * 8.0, duration_secs) / 1_000_000.0
}

fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

fn unix_time_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn graph_header(transport: Transport) -> &'static str {
    match transport {
        Transport::Tcp => "t_seconds sender_mbps receiver_mbps rtt_ms unloaded_rtt_ms bdp_bytes buffered_bytes bloat_factor",
        Transport::Udp => "t_seconds sender_mbps receiver_mbps rtt_ms unloaded_rtt_ms bdp_bytes buffered_bytes bloat_factor sender_pps receiver_pps packets_dropped drop_percent",
    }
}

fn graph_row(m: &RunMetrics, transport: Transport) -> String {
    let base = format!(
        "{:.3} {:.3} {:.3} {:.3} {:.3} {:.1} {:.1} {:.3}",
        m.t_seconds,
        m.sender_mbps,
        m.receiver_mbps,
        m.rtt_ms,
        m.unloaded_rtt_ms,
        m.bdp_bytes,
        m.buffered_bytes,
        m.bloat_factor
    );
    match transport {
        Transport::Tcp => base,
        Transport::Udp => format!(
            "{base} {:.1} {:.1} {} {:.2}",
            m.sender_pps.unwrap_or(0.0),
            m.receiver_pps.unwrap_or(0.0),
            m.packets_dropped.unwrap_or(0),
            m.drop_percent.unwrap_or(0.0)
        ),
    }
}

fn format_run_line(m: &RunMetrics, transport: Transport) -> String {
    let base = format!(
        "t={:>6.2}s  sender={:>7.2} Mbps  receiver={:>7.2} Mbps  rtt={:>7.2}ms  bloat={:>5.2}x",
        m.t_seconds, m.sender_mbps, m.receiver_mbps, m.rtt_ms, m.bloat_factor
    );
    match transport {
        Transport::Tcp => base,
        Transport::Udp => format!(
            "{base}  drop={:>5.1}%",
            m.drop_percent.unwrap_or(0.0)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::RecordKind;

    fn sender(interval_bytes: u64, interval_duration: f64, send_counter: u64, interval_send_count: u64) -> SenderRecord {
        SenderRecord {
            kind: RecordKind::Run,
            send_time: 100.0,
            interval_duration,
            interval_send_count,
            interval_bytes_sent: interval_bytes,
            send_counter,
        }
    }

    fn feedback(interval_bytes: u64, interval_duration: f64, interval_packets: u64, total_packets: u64) -> IntervalFeedback {
        IntervalFeedback {
            echoed_block: Bytes::from_static(b" a run 100.0 0.1 1 1 1 b "),
            receiver_interval_duration: interval_duration,
            receiver_interval_packets: interval_packets,
            receiver_interval_bytes: interval_bytes,
            receiver_total_packets: total_packets,
        }
    }

    #[test]
    fn bloat_factor_is_one_at_unloaded_rtt() {
        let s = sender(125_000, 0.1, 9, 100);
        let f = feedback(125_000, 0.1, 100, 100);
        let mut prev_dropped = 0;
        let m = compute_run_metrics(1.0, &s, &f, 0.020, 0.020, Transport::Tcp, &mut prev_dropped);
        assert!((m.bloat_factor - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bloat_factor_is_zero_when_bdp_is_zero() {
        let s = sender(125_000, 0.1, 0, 100);
        let f = feedback(125_000, 0.1, 100, 100);
        let mut prev_dropped = 0;
        let m = compute_run_metrics(1.0, &s, &f, 0.020, 0.0, Transport::Tcp, &mut prev_dropped);
        assert_eq!(m.bloat_factor, 0.0);
    }

    #[test]
    fn udp_drop_count_is_incremental_and_clamped() {
        let s = sender(1024 * 100, 0.1, 499, 100);
        let f = feedback(1024 * 95, 0.1, 95, 480);
        let mut prev_dropped = 15;
        let m = compute_run_metrics(1.0, &s, &f, 0.020, 0.020, Transport::Udp, &mut prev_dropped);
        // sender_total = 500, receiver_total = 480 -> total_dropped_so_far = 20
        // minus previously counted 15 -> 5 new drops this interval.
        assert_eq!(m.packets_dropped, Some(5));
        assert_eq!(prev_dropped, 20);
    }

    #[test]
    fn udp_drop_count_never_goes_negative() {
        let s = sender(1024 * 100, 0.1, 499, 100);
        let f = feedback(1024 * 100, 0.1, 100, 500);
        let mut prev_dropped = 0;
        let m = compute_run_metrics(1.0, &s, &f, 0.020, 0.020, Transport::Udp, &mut prev_dropped);
        assert_eq!(m.packets_dropped, Some(0));
    }

    #[test]
    fn tcp_metrics_have_no_packet_fields() {
        let s = sender(125_000, 0.1, 9, 100);
        let f = feedback(125_000, 0.1, 100, 100);
        let mut prev_dropped = 0;
        let m = compute_run_metrics(1.0, &s, &f, 0.020, 0.020, Transport::Tcp, &mut prev_dropped);
        assert!(m.sender_pps.is_none());
        assert!(m.packets_dropped.is_none());
    }
}
