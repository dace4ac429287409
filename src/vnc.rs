//! Per-VM websockify supervision: a WebSocket-to-TCP relay in front of the
//! VM's VNC server so browsers can reach the console.
//!
//! websockify instances are addressed by their listen port, so start/stop
//! match processes with `pkill`/`pgrep` rather than tracking pids.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::Error;
use crate::hypervisor::log_tail;

/// The relay for VNC port p listens on p + 1000.
pub const WS_PORT_OFFSET: u16 = 1000;

const NOVNC_WEB_ROOT: &str = "/usr/share/novnc";
const START_SETTLE: Duration = Duration::from_secs(1);
const VERIFY_DELAY: Duration = Duration::from_secs(2);

pub fn ws_port(vnc_port: u16) -> u16 {
    vnc_port + WS_PORT_OFFSET
}

fn port_pattern(vnc_port: u16) -> String {
    format!("websockify.*:{}", ws_port(vnc_port))
}

fn bridge_log_path(log_dir: &Path, vnc_port: u16) -> PathBuf {
    log_dir.join(format!("websockify-{}.log", ws_port(vnc_port)))
}

/// Launch the relay for one VM, replacing any prior instance on the same
/// port, and verify it is listening.
pub async fn start(vnc_port: u16, log_dir: &Path) -> Result<(), Error> {
    // Clear out a leftover relay from a previous VM on this port.
    pkill(&port_pattern(vnc_port)).await;
    tokio::time::sleep(START_SETTLE).await;

    let log_path = bridge_log_path(log_dir, vnc_port);
    let log = std::fs::File::create(&log_path)?;
    let log_err = log.try_clone()?;

    let mut child = Command::new("websockify")
        .arg("--verbose")
        .arg(ws_port(vnc_port).to_string())
        .arg(format!("localhost:{vnc_port}"))
        .args(["--web", NOVNC_WEB_ROOT])
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .map_err(|e| Error::Tool { tool: "websockify", detail: format!("spawn: {e}") })?;

    // Reap the child whenever it exits; its lifetime is managed by port.
    tokio::spawn(async move {
        if let Ok(status) = child.wait().await {
            debug!(%status, "websockify exited");
        }
    });

    tokio::time::sleep(VERIFY_DELAY).await;
    if !pgrep(&port_pattern(vnc_port)).await {
        return Err(Error::Tool {
            tool: "websockify",
            detail: format!("not listening after start; logs: {}", log_tail(&log_path)),
        });
    }

    info!(vnc_port, ws_port = ws_port(vnc_port), "vnc bridge up");
    Ok(())
}

/// Terminate the relay for a VNC port. Idempotent.
pub async fn stop(vnc_port: u16) {
    pkill(&port_pattern(vnc_port)).await;
}

/// Synchronous variant for the shutdown/panic reaper.
pub fn stop_blocking(vnc_port: u16) {
    let _ = std::process::Command::new("pkill")
        .args(["-f", &port_pattern(vnc_port)])
        .status();
}

async fn pkill(pattern: &str) {
    let _ = Command::new("pkill").args(["-f", pattern]).status().await;
}

async fn pgrep(pattern: &str) -> bool {
    Command::new("pgrep")
        .args(["-f", pattern])
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_port_is_offset_from_vnc_port() {
        assert_eq!(ws_port(5900), 6900);
        assert_eq!(ws_port(5923), 6923);
    }

    #[test]
    fn patterns_match_by_listen_port() {
        assert_eq!(port_pattern(5901), "websockify.*:6901");
    }

    #[test]
    fn bridge_logs_live_under_the_log_dir() {
        assert_eq!(
            bridge_log_path(Path::new("/data/logs"), 5900),
            PathBuf::from("/data/logs/websockify-6900.log")
        );
    }
}
