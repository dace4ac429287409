//! QEMU process supervision: spawn, pidfile discovery, liveness
//! verification, forced kill.
//!
//! QEMU runs with `-daemonize`, so the spawned child is only the
//! foreground launcher; the real VM pid comes from the pidfile and is then
//! verified against the process command line before it is trusted.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::info;

use crate::error::Error;
use crate::procfs;

pub const QEMU_BIN: &str = "qemu-system-x86_64";
/// Substring a verified QEMU command line must contain.
pub const PROCESS_TAG: &str = "qemu-system";

/// Guest memory in MiB.
pub const RAM_SIZE_MIB: u64 = 4096;

const PIDFILE_TIMEOUT: Duration = Duration::from_secs(30);
const PIDFILE_POLL: Duration = Duration::from_millis(500);
const VERIFY_RETRIES: u32 = 3;
const VERIFY_BACKOFF: Duration = Duration::from_secs(1);
const LOG_TAIL_BYTES: u64 = 2048;

/// Everything needed to build one VM's QEMU argument vector. The same spec
/// is used for the initial boot and for later cold starts, so the monitor
/// socket path stays stable across the VM's life.
pub struct QemuSpec<'a> {
    pub name: &'a str,
    pub disk: &'a Path,
    pub cidata: &'a Path,
    /// VNC display number (port minus 5900).
    pub vnc_display: u16,
    pub ssh_port: u16,
    pub mac: String,
    pub monitor_socket: &'a Path,
    pub pidfile: &'a Path,
}

fn args(spec: &QemuSpec<'_>) -> Vec<String> {
    vec![
        "-name".into(),
        format!("guest={},debug-threads=on", spec.name),
        "-machine".into(),
        "pc,accel=kvm,usb=off,vmport=off".into(),
        "-cpu".into(),
        "host".into(),
        "-m".into(),
        RAM_SIZE_MIB.to_string(),
        "-smp".into(),
        "2,sockets=2,cores=1,threads=1".into(),
        "-drive".into(),
        format!("file={},format=qcow2", spec.disk.display()),
        "-drive".into(),
        format!("file={},format=raw", spec.cidata.display()),
        "-vnc".into(),
        format!("0.0.0.0:{}", spec.vnc_display),
        "-device".into(),
        format!("virtio-net-pci,netdev=net0,mac={}", spec.mac),
        "-netdev".into(),
        format!("user,id=net0,hostfwd=tcp:0.0.0.0:{}-:22", spec.ssh_port),
        "-qmp".into(),
        format!("unix:{},server,nowait", spec.monitor_socket.display()),
        "-pidfile".into(),
        spec.pidfile.display().to_string(),
        "-daemonize".into(),
        "-enable-kvm".into(),
    ]
}

/// Deterministic MAC from a VM id: the locally-administered QEMU prefix
/// plus the id's first three bytes (dashes stripped, zero-padded).
pub fn mac_for_id(id: &str) -> String {
    let mut hex: String = id.chars().filter(|c| *c != '-').collect();
    while hex.len() < 6 {
        hex.push('0');
    }
    format!("52:54:00:{}:{}:{}", &hex[0..2], &hex[2..4], &hex[4..6])
}

/// Launch QEMU and return the daemonized pid once it is verified.
///
/// Stdout/stderr go to `log_path`; on failure the log tail rides in the
/// error so the creation pipeline can surface it.
pub async fn spawn(spec: &QemuSpec<'_>, log_path: &Path) -> Result<i32, Error> {
    let log = std::fs::File::create(log_path)?;
    let log_err = log.try_clone()?;

    let mut child = Command::new(QEMU_BIN)
        .args(args(spec))
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .map_err(|e| Error::Tool { tool: QEMU_BIN, detail: format!("spawn: {e}") })?;

    // -daemonize: the launcher exits immediately; nonzero means QEMU never
    // forked a VM.
    let status = child.wait().await?;
    if !status.success() {
        return Err(Error::Tool {
            tool: QEMU_BIN,
            detail: format!("{}; logs: {}", status, log_tail(log_path)),
        });
    }

    let pid = wait_for_pidfile(spec.pidfile, log_path).await?;
    verify_with_retries(pid, log_path).await?;

    info!(name = spec.name, pid, "qemu started");
    Ok(pid)
}

async fn wait_for_pidfile(pidfile: &Path, log_path: &Path) -> Result<i32, Error> {
    let deadline = tokio::time::Instant::now() + PIDFILE_TIMEOUT;
    loop {
        if let Some(pid) = procfs::pidfile_pid(pidfile) {
            return Ok(pid);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "waiting for QEMU to start; logs: {}",
                log_tail(log_path)
            )));
        }
        tokio::time::sleep(PIDFILE_POLL).await;
    }
}

async fn verify_with_retries(pid: i32, log_path: &Path) -> Result<(), Error> {
    for attempt in 1..=VERIFY_RETRIES {
        if verify(pid).is_ok() {
            return Ok(());
        }
        if attempt == VERIFY_RETRIES {
            break;
        }
        tokio::time::sleep(VERIFY_BACKOFF).await;
    }
    Err(Error::Tool {
        tool: QEMU_BIN,
        detail: format!(
            "process verification failed after {VERIFY_RETRIES} retries; logs: {}",
            log_tail(log_path)
        ),
    })
}

/// A pid counts as this service's QEMU only if it answers signal 0 and its
/// command line carries the QEMU tag.
pub fn verify(pid: i32) -> Result<(), Error> {
    if !procfs::is_alive(pid) {
        return Err(Error::Internal(format!("process {pid} is not running")));
    }
    let cmdline = procfs::cmdline(pid)
        .map_err(|e| Error::Internal(format!("read cmdline of {pid}: {e}")))?;
    if !cmdline.contains(PROCESS_TAG) {
        return Err(Error::Internal(format!("process {pid} is not a QEMU process")));
    }
    Ok(())
}

pub fn is_alive(pid: i32) -> bool {
    procfs::is_alive(pid)
}

/// SIGKILL, best effort.
pub fn force_kill(pid: i32) {
    if pid > 0 {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

/// Last couple of KiB of a QEMU log, for error messages.
pub fn log_tail(path: &Path) -> String {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(_) => return String::from("<no log>"),
    };
    let start = data.len().saturating_sub(LOG_TAIL_BYTES as usize);
    String::from_utf8_lossy(&data[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn mac_uses_first_three_id_bytes() {
        assert_eq!(
            mac_for_id("eacb4a3e-91f0-4a7c-8bda-000000000000"),
            "52:54:00:ea:cb:4a"
        );
    }

    #[test]
    fn mac_pads_short_ids() {
        assert_eq!(mac_for_id("ab"), "52:54:00:ab:00:00");
        assert_eq!(mac_for_id(""), "52:54:00:00:00:00");
    }

    #[test]
    fn args_carry_ports_and_paths() {
        let spec = QemuSpec {
            name: "n1",
            disk: Path::new("/data/disks/x/disk.qcow2"),
            cidata: Path::new("/data/disks/x/cloud-init.iso"),
            vnc_display: 3,
            ssh_port: 2203,
            mac: mac_for_id("deadbeef"),
            monitor_socket: Path::new("/data/disks/x/qemu-monitor.sock"),
            pidfile: Path::new("/data/disks/x/qemu.pid"),
        };
        let args = args(&spec);
        let joined = args.join(" ");
        assert!(joined.contains("-vnc 0.0.0.0:3"));
        assert!(joined.contains("hostfwd=tcp:0.0.0.0:2203-:22"));
        assert!(joined.contains("mac=52:54:00:de:ad:be"));
        assert!(joined.contains("unix:/data/disks/x/qemu-monitor.sock,server,nowait"));
        assert!(joined.contains("-daemonize"));
        assert!(joined.contains("-enable-kvm"));
        assert!(joined.contains("file=/data/disks/x/cloud-init.iso,format=raw"));
    }

    #[test]
    fn log_tail_truncates_to_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("qemu.log");
        std::fs::write(&path, "x".repeat(5000) + "TAIL").unwrap();
        let tail = log_tail(&path);
        assert!(tail.len() <= 2048);
        assert!(tail.ends_with("TAIL"));
        assert_eq!(log_tail(Path::new("/nonexistent/log")), "<no log>");
    }

    #[test]
    fn verify_rejects_dead_pids() {
        assert!(verify(-1).is_err());
    }
}
