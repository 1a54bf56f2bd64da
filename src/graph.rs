//! Shells out to `gnuplot` against a bundled script, mirroring the
//! source tool's `subprocess.run(["gnuplot", "-e", ...])` invocation.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

use crate::config::Transport;

/// Generates a PNG from `data_file` using the bundled TCP/UDP gnuplot
/// script. Logs gnuplot's stdout/stderr on non-zero exit or at `-vv`+.
pub fn render(data_file: &Path, transport: Transport, verbosity: u8) -> Result<()> {
    let script_name = match transport {
        Transport::Tcp => "tcp-graph.gp",
        Transport::Udp => "udp-graph.gp",
    };
    let script_path = assets_dir().join(script_name);

    let gnuplot_script = format!(
        "datafile1 = \"{}\" ; load \"{}\"",
        data_file.display(),
        script_path.display()
    );

    let output = Command::new("gnuplot")
        .arg("-e")
        .arg(&gnuplot_script)
        .output()
        .context("failed to spawn gnuplot (is it installed?)")?;

    if verbosity > 0 || !output.status.success() {
        log::info!("gnuplot -e {gnuplot_script}");
        log::info!("returncode: {:?}", output.status.code());
        log::info!("stdout: {}", String::from_utf8_lossy(&output.stdout));
        log::info!("stderr: {}", String::from_utf8_lossy(&output.stderr));
    }

    Ok(())
}

fn assets_dir() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("assets")
}
