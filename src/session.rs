//! Establishes both channels, exchanges configuration, coordinates
//! direction, drives phase transitions, and tears down at the end of a
//! run.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::aggregator::{FinishedRun, OutputAggregator};
use crate::calibration::CalibrationOracle;
use crate::config::{Cli, Direction, RunConfig, Transport};
use crate::control::{self, RecordReader, SETUP_COMPLETE, START_SIGNAL};
use crate::graph;
use crate::phase::{Phase, PhaseCell};
use crate::receiver::{self, DataSocket};
use crate::sender;

const UDP_PING_INTERVAL: Duration = Duration::from_millis(100);
const FEEDBACK_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Whether this process holds the Data Sender + Output Aggregator for a
/// run. RTT is only meaningful measured on one host's clock, so the
/// aggregator always runs alongside the sender; see DESIGN.md for why
/// the distilled spec's "client always runs Control Receiver" wording is
/// read as "client always sees output", not "client always aggregates".
fn is_measuring_side(role: Role, direction: Direction) -> bool {
    matches!(
        (role, direction),
        (Role::Client, Direction::Upload) | (Role::Server, Direction::Download)
    )
}

enum DataChannel {
    Tcp(TcpStream),
    Udp(Arc<UdpSocket>, Option<SocketAddr>),
}

pub async fn run_client(cli: Cli) -> Result<()> {
    let addr = cli.client.context("client mode requires -c <ip>")?;
    let run_config = Arc::new(cli.clone().into_run_config()?);
    let session_id = Uuid::new_v4().to_string();

    let mut control_stream = TcpStream::connect(SocketAddr::new(addr, run_config.server_port))
        .await
        .context("connecting control channel")?;
    log::info!("connected control channel to {addr}:{}", run_config.server_port);

    control::write_frame(&mut control_stream, format!("control {session_id}").as_bytes()).await?;
    control::write_frame(&mut control_stream, &serde_json::to_vec(&*run_config)?).await?;

    let stop_ping = Arc::new(AtomicBool::new(false));
    let data_channel = match run_config.transport {
        Transport::Tcp => {
            let mut stream = TcpStream::connect(SocketAddr::new(addr, run_config.server_port))
                .await
                .context("connecting data channel")?;
            stream.write_all(format!("data {session_id}").as_bytes()).await?;
            DataChannel::Tcp(stream)
        }
        Transport::Udp => {
            let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
            socket.connect(SocketAddr::new(addr, run_config.server_port)).await?;
            spawn_udp_ping(socket.clone(), session_id.clone(), stop_ping.clone());
            DataChannel::Udp(socket, None)
        }
    };

    control::expect_literal(&mut control_stream, SETUP_COMPLETE).await?;
    stop_ping.store(true, Ordering::Relaxed);
    log::info!("setup complete, session {session_id}");

    if run_config.direction == Direction::Download {
        control::write_literal(&mut control_stream, START_SIGNAL).await?;
    }

    run_session(Role::Client, run_config, control_stream, data_channel).await
}

pub async fn run_server(cli: Cli) -> Result<()> {
    let listener = Arc::new(TcpListener::bind(SocketAddr::new(IpAddr::from([0, 0, 0, 0]), cli.port)).await?);
    let udp_socket = Arc::new(UdpSocket::bind(SocketAddr::new(IpAddr::from([0, 0, 0, 0]), cli.port)).await?);
    log::info!("listening on 0.0.0.0:{}", cli.port);

    loop {
        let (control_stream, peer) = listener.accept().await?;
        log::info!("accepted control connection from {peer}");
        let listener = listener.clone();
        let udp_socket = udp_socket.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_session(control_stream, listener, udp_socket).await {
                log::error!("session with {peer} ended with error: {e:#}");
            }
        });
    }
}

async fn handle_session(
    mut control_stream: TcpStream,
    listener: Arc<TcpListener>,
    udp_socket: Arc<UdpSocket>,
) -> Result<()> {
    let first = control::read_frame(&mut control_stream).await?;
    let text = String::from_utf8(first).context("control handshake was not valid utf-8")?;
    let session_id = text
        .strip_prefix("control ")
        .context("expected 'control <session-id>' as the first control frame")?
        .to_string();

    let run_config: RunConfig = serde_json::from_slice(&control::read_frame(&mut control_stream).await?)
        .context("decoding handshake RunConfig")?;
    let run_config = Arc::new(run_config);
    log::info!("session {session_id}: {:?} {:?}", run_config.transport, run_config.direction);

    let data_channel = match run_config.transport {
        Transport::Tcp => {
            let (mut stream, _) = listener.accept().await.context("accepting data connection")?;
            let expected = format!("data {session_id}");
            let mut prefix = vec![0u8; expected.len()];
            stream.read_exact(&mut prefix).await?;
            if prefix != expected.as_bytes() {
                bail!("data connection did not present the expected session id");
            }
            DataChannel::Tcp(stream)
        }
        Transport::Udp => DataChannel::Udp(udp_socket, None),
    };

    control::write_literal(&mut control_stream, SETUP_COMPLETE).await?;

    if run_config.direction == Direction::Download {
        control::expect_literal(&mut control_stream, START_SIGNAL).await?;
    }

    let data_channel = if let (Transport::Udp, DataChannel::Udp(socket, _)) = (run_config.transport, &data_channel) {
        // The server always connects its data socket to the peer learned
        // from the "data <uuid>" ping, whether it ends up sending (download)
        // or receiving (upload) — `recv`/`send` both require a connected
        // socket, and a shared unconnected listener socket can't otherwise
        // be handed to `tokio::net::UdpSocket::recv`.
        let peer = sender::discover_udp_peer(socket, &session_id).await?;
        socket.connect(peer).await?;
        DataChannel::Udp(socket.clone(), Some(peer))
    } else {
        data_channel
    };

    run_session(Role::Server, run_config, control_stream, data_channel).await
}

async fn run_session(
    role: Role,
    run_config: Arc<RunConfig>,
    control_stream: TcpStream,
    data_channel: DataChannel,
) -> Result<()> {
    let phase = Arc::new(PhaseCell::new());
    let calibration = Arc::new(CalibrationOracle::new());
    let deadline = Instant::now() + Duration::from_secs(run_config.duration_secs);
    let (control_read, control_write) = control_stream.into_split();

    if is_measuring_side(role, run_config.direction) {
        run_measuring_side(role, run_config, phase, calibration, control_read, control_write, data_channel, deadline)
            .await
    } else {
        run_receiving_side(role, run_config, control_read, control_write, data_channel).await
    }
}

async fn run_measuring_side(
    role: Role,
    run_config: Arc<RunConfig>,
    phase: Arc<PhaseCell>,
    calibration: Arc<CalibrationOracle>,
    control_read: OwnedReadHalf,
    mut control_write: OwnedWriteHalf,
    data_channel: DataChannel,
    deadline: Instant,
) -> Result<()> {
    let (feedback_tx, feedback_rx) = mpsc::channel::<Bytes>(FEEDBACK_CHANNEL_CAPACITY);
    let (relay_tx, mut relay_rx) = mpsc::channel::<String>(64);

    // In download mode the aggregator runs on the server, but the user
    // watches the client; relay each formatted line back so the client
    // can show live progress without recomputing metrics itself.
    let needs_relay = role == Role::Server && run_config.direction == Direction::Download;

    let control_receiver = tokio::spawn(forward_feedback(control_read, feedback_tx));

    let relay_forwarder = if needs_relay {
        Some(tokio::spawn(async move {
            while let Some(line) = relay_rx.recv().await {
                if control_write.write_all(line.as_bytes()).await.is_err()
                    || control_write.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
        }))
    } else {
        drop(relay_rx);
        drop(control_write);
        None
    };

    let sender_phase = phase.clone();
    let sender_config = run_config.clone();
    let sender_task: tokio::task::JoinHandle<Result<()>> = match data_channel {
        DataChannel::Tcp(mut stream) => {
            tokio::spawn(async move { sender::run_tcp(&mut stream, sender_phase, sender_config, deadline).await })
        }
        DataChannel::Udp(socket, peer) => {
            let peer = peer.or_else(|| socket.peer_addr().ok()).context("udp sender has no peer")?;
            tokio::spawn(async move { sender::run_udp(&socket, peer, sender_phase, sender_config, deadline).await })
        }
    };

    let aggregator = OutputAggregator::new(phase.clone(), calibration, run_config.clone())?;
    let relay = if needs_relay { Some(relay_tx) } else { None };
    // The aggregator's feedback-poll loop only breaks on a closed channel
    // or an observed Phase::Stopping; run it as its own task so it keeps
    // draining feedback while the sender is still active.
    let aggregator_task = tokio::spawn(aggregator.run(feedback_rx, relay));

    let sender_outcome = sender_task.await;
    // The sender has stopped emitting records, either because the run's
    // duration elapsed or the peer went away. Announce that to the rest
    // of the session before tearing anything else down, so the aggregator
    // notices on its next feedback-poll timeout instead of waiting
    // indefinitely on the control channel to close on its own.
    phase.store(Phase::Stopping);
    sender_outcome??;

    let finished = aggregator_task.await??;
    control_receiver.abort();
    if let Some(handle) = relay_forwarder {
        handle.abort();
    }

    teardown(finished, &run_config)
}

async fn run_receiving_side(
    role: Role,
    run_config: Arc<RunConfig>,
    control_read: OwnedReadHalf,
    mut control_write: OwnedWriteHalf,
    data_channel: DataChannel,
) -> Result<()> {
    let (feedback_tx, mut feedback_rx) = mpsc::channel::<Bytes>(FEEDBACK_CHANNEL_CAPACITY);

    let needs_display_relay = role == Role::Client && run_config.direction == Direction::Download;

    let forwarder = tokio::spawn(async move {
        while let Some(bytes) = feedback_rx.recv().await {
            if control_write.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let display_relay = if needs_display_relay {
        Some(tokio::spawn(async move {
            let mut reader = RecordReader::new(control_read);
            while let Ok(Some(line)) = reader.next_record(b"\n").await {
                print!("{}", String::from_utf8_lossy(&line));
            }
        }))
    } else {
        drop(control_read);
        None
    };

    let receiver_result = match data_channel {
        DataChannel::Tcp(mut stream) => receiver::run(DataSocket::Tcp(&mut stream), feedback_tx).await,
        DataChannel::Udp(socket, _peer) => receiver::run(DataSocket::Udp(&socket), feedback_tx).await,
    };

    if let Some(handle) = display_relay {
        handle.abort();
    }
    let _ = forwarder.await;

    receiver_result
}

fn teardown(finished: FinishedRun, run_config: &RunConfig) -> Result<()> {
    log::info!("run complete: {} run records", finished.run_record_count);

    if run_config.graph {
        if let Err(e) = graph::render(finished.graph_file.path(), run_config.transport, run_config.verbosity) {
            log::warn!("graph generation failed: {e:#}");
        }
    }

    if run_config.keep {
        let (_, graph_path) = finished.graph_file.keep().context("keeping graph data file")?;
        let (_, raw_path) = finished.raw_file.keep().context("keeping raw data file")?;
        log::info!("kept data files: {} {}", graph_path.display(), raw_path.display());
    }

    Ok(())
}

async fn forward_feedback(control_read: OwnedReadHalf, feedback_tx: mpsc::Sender<Bytes>) {
    let mut reader = RecordReader::new(control_read);
    loop {
        match reader.next_record(b" c ").await {
            Ok(Some(record)) => {
                if feedback_tx.send(record.freeze()).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("control channel read error: {e:#}");
                break;
            }
        }
    }
}

fn spawn_udp_ping(socket: Arc<UdpSocket>, session_id: String, stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let payload = format!("data {session_id}");
        while !stop.load(Ordering::Relaxed) {
            let _ = socket.send(payload.as_bytes()).await;
            tokio::time::sleep(UDP_PING_INTERVAL).await;
        }
    });
}
