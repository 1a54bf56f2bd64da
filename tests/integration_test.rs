//! End-to-end smoke tests that drive a client against a locally spawned
//! server over loopback, for each transport/direction combination, and
//! confirm the run actually reaches the Running phase (not just that the
//! process exits cleanly) by inspecting the kept graph data file.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use netbloat::config::Cli;

// Calibration can take up to `calibration::MAX_CALIBRATION_SECS` (20s) in
// the worst case before the phase machine transitions to Running, so the
// run has to be long enough to clear that cap with room to spare for at
// least one 100ms Running-phase interval to close and get written out.
const TEST_DURATION_SECS: u64 = 22;
const TEST_TIMEOUT: Duration = Duration::from_secs(35);

fn cli(server: bool, client: Option<IpAddr>, port: u16, udp: bool, reverse: bool) -> Cli {
    Cli {
        server,
        client,
        port,
        reverse,
        duration_secs: TEST_DURATION_SECS,
        udp,
        bandwidth: None,
        graph: false,
        keep: true,
        verbosity: 0,
    }
}

/// Locates the kept graph data file for a run on `port`. Whichever side
/// is the measuring side (see `session::is_measuring_side`) is the one
/// that wrote it; the prefix is port-qualified so concurrent tests don't
/// collide on a shared temp directory.
fn find_graph_file(port: u16) -> Result<PathBuf> {
    let prefix = format!("netbloat-{port}-graph-");
    for entry in std::fs::read_dir(std::env::temp_dir())? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            return Ok(entry.path());
        }
    }
    anyhow::bail!("no kept graph data file found for port {port}")
}

async fn run_pair(port: u16, udp: bool, reverse: bool) -> Result<()> {
    let server_cli = cli(true, None, port, udp, reverse);
    let server = tokio::spawn(async move { netbloat::run(server_cli).await });

    // Give the listener a moment to bind before the client connects.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client_cli = cli(false, Some(IpAddr::from([127, 0, 0, 1])), port, udp, reverse);
    let client_result = tokio::time::timeout(TEST_TIMEOUT, netbloat::run(client_cli)).await;

    // In the reverse/download scenarios the measuring side is the server,
    // whose teardown runs in a detached per-connection task; give it a
    // moment to finish writing its kept files after the client side (the
    // receiving side) observes the connection close and returns.
    tokio::time::sleep(Duration::from_millis(300)).await;
    server.abort();

    match client_result {
        Ok(inner) => inner?,
        Err(_) => anyhow::bail!("client run timed out"),
    }

    let graph_path = find_graph_file(port)?;
    let contents = std::fs::read_to_string(&graph_path)
        .with_context(|| format!("reading kept graph file {graph_path:?}"))?;
    let line_count = contents.lines().count();
    anyhow::ensure!(
        line_count >= 2,
        "expected a header plus at least one Running-phase row in {graph_path:?}, got {line_count} line(s)"
    );

    let _ = std::fs::remove_file(&graph_path);
    Ok(())
}

#[tokio::test]
async fn tcp_upload_completes() -> Result<()> {
    run_pair(15401, false, false).await
}

#[tokio::test]
async fn tcp_download_completes() -> Result<()> {
    run_pair(15402, false, true).await
}

#[tokio::test]
async fn udp_upload_completes() -> Result<()> {
    run_pair(15403, true, false).await
}

#[tokio::test]
async fn udp_download_completes() -> Result<()> {
    run_pair(15404, true, true).await
}
