//! VM lifecycle controller: the record store, port allocation, the staged
//! asynchronous creation pipeline, start/stop/restart/delete orchestration
//! and scheduled expiry.
//!
//! The controller owns all VM records. State lives behind one RwLock which
//! is never held across an await point, a child-process spawn or slow file
//! I/O: operations copy out what they need, act, then re-lock briefly to
//! publish the result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cloudinit;
use crate::error::Error;
use crate::hypervisor::{self, QemuSpec};
use crate::images::ImageLibrary;
use crate::metrics::MetricsStore;
use crate::qmp;
use crate::templates::{self, Template};
use crate::vnc;

/// Every VM lives exactly this long from creation.
pub const VPS_LIFETIME: Duration = Duration::from_secs(15 * 60);

pub const VNC_PORT_BASE: u16 = 5900;
pub const SSH_PORT_BASE: u16 = 2200;

const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(120);
const GRACEFUL_POLL: Duration = Duration::from_secs(5);
const RESET_SETTLE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Creating,
    Running,
    Stopping,
    Stopped,
    Starting,
    Restarting,
    Failed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    CreatingDisk,
    PreparingCloudInit,
    StartingQemu,
    ConfiguringVnc,
    /// Part of the wire vocabulary; template installation currently rides
    /// inside the cloud-init payload so the pipeline never reports it.
    InstallingTemplate,
    Completed,
    Failed,
}

/// One VM record. Identity fields are fixed at creation; `status`, `stage`,
/// `progress`, `qemu_pid` and `error` change over the VM's life.
#[derive(Debug, Clone, Serialize)]
pub struct Vps {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub image_type: String,
    pub template: String,
    pub status: Status,
    #[serde(skip_serializing_if = "pid_is_zero")]
    pub qemu_pid: i32,
    pub vnc_port: u16,
    pub ssh_port: u16,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub disk_path: PathBuf,
    pub cloud_init_path: PathBuf,
    pub password: String,
    pub stage: Stage,
    pub progress: u8,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

fn pid_is_zero(pid: &i32) -> bool {
    *pid <= 0
}

impl Vps {
    /// True while the record's status implies a live QEMU process.
    fn claims_live_process(&self) -> bool {
        matches!(
            self.status,
            Status::Running | Status::Stopping | Status::Starting | Status::Restarting
        )
    }
}

#[derive(Debug, Serialize)]
pub struct Progress {
    pub stage: Stage,
    pub progress: u8,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// On-disk layout under the service data directory.
#[derive(Debug, Clone)]
pub struct DataDirs {
    root: PathBuf,
}

impl DataDirs {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn base(&self) -> PathBuf {
        self.root.join("base")
    }

    pub fn disks(&self) -> PathBuf {
        self.root.join("disks")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn instance_dir(&self, vm_id: &str) -> PathBuf {
        self.disks().join(vm_id)
    }

    pub fn disk_path(&self, vm_id: &str) -> PathBuf {
        self.instance_dir(vm_id).join("disk.qcow2")
    }

    pub fn cloud_init_path(&self, vm_id: &str) -> PathBuf {
        self.instance_dir(vm_id).join("cloud-init.iso")
    }

    pub fn pidfile(&self, vm_id: &str) -> PathBuf {
        self.instance_dir(vm_id).join("qemu.pid")
    }

    pub fn monitor_socket(&self, vm_id: &str) -> PathBuf {
        self.instance_dir(vm_id).join("qemu-monitor.sock")
    }

    pub fn log_path(&self, vm_id: &str) -> PathBuf {
        self.logs().join(format!("{vm_id}.log"))
    }
}

struct Inner {
    vms: HashMap<String, Vps>,
    /// client address -> VM id; at most one non-expired VM per client.
    clients: HashMap<String, String>,
    next_vnc_port: u16,
    next_ssh_port: u16,
}

pub struct VpsManager {
    dirs: DataDirs,
    images: ImageLibrary,
    templates: Vec<Template>,
    metrics: MetricsStore,
    inner: RwLock<Inner>,
    /// Self-handle so lifecycle operations can hand a clone of the manager
    /// to the background tasks they spawn.
    weak: Weak<VpsManager>,
}

pub struct CreateParams {
    pub name: String,
    pub hostname: String,
    pub image_type: String,
    pub template: String,
}

impl VpsManager {
    pub fn new(dirs: DataDirs) -> Arc<Self> {
        let images = ImageLibrary::new(dirs.base());
        Arc::new_cyclic(|weak| Self {
            dirs,
            images,
            templates: templates::builtin(),
            metrics: MetricsStore::new(),
            inner: RwLock::new(Inner {
                vms: HashMap::new(),
                clients: HashMap::new(),
                next_vnc_port: VNC_PORT_BASE,
                next_ssh_port: SSH_PORT_BASE,
            }),
            weak: weak.clone(),
        })
    }

    /// Strong self-handle for background tasks. `None` only during teardown.
    fn handle(&self) -> Option<Arc<Self>> {
        self.weak.upgrade()
    }

    pub fn images(&self) -> &ImageLibrary {
        &self.images
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // ── Create ───────────────────────────────────────────────────────────

    /// Validate the request, allocate ports and the record, and kick off
    /// the asynchronous pipeline. Returns the record in `creating`.
    pub fn create(&self, params: CreateParams, client_addr: &str) -> Result<Vps, Error> {
        if !self.images.supports(&params.image_type) {
            return Err(Error::InvalidInput(format!(
                "unsupported image type: {}",
                params.image_type
            )));
        }
        let template = templates::find(&self.templates, &params.template).ok_or_else(|| {
            Error::InvalidInput(format!("unsupported template: {}", params.template))
        })?;
        if !template.supports_image(&params.image_type) {
            return Err(Error::InvalidInput(format!(
                "template {} does not support OS {}",
                params.template, params.image_type
            )));
        }
        cloudinit::validate_hostname(&params.hostname)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let vps = {
            let mut inner = self.write();

            if let Some(existing_id) = inner.clients.get(client_addr) {
                if let Some(existing) = inner.vms.get(existing_id) {
                    if now < existing.expires_at {
                        return Err(Error::Conflict(format!(
                            "client {client_addr} already has an active VM ({existing_id})"
                        )));
                    }
                }
            }

            // Monotonic allocation: ports are never reused in this process.
            let vnc_port = inner.next_vnc_port;
            let ssh_port = inner.next_ssh_port;
            inner.next_vnc_port += 1;
            inner.next_ssh_port += 1;

            let vps = Vps {
                id: id.clone(),
                name: params.name,
                hostname: params.hostname,
                image_type: params.image_type,
                template: params.template,
                status: Status::Creating,
                qemu_pid: 0,
                vnc_port,
                ssh_port,
                created_at: now,
                expires_at: now + VPS_LIFETIME,
                disk_path: self.dirs.disk_path(&id),
                cloud_init_path: self.dirs.cloud_init_path(&id),
                password: generate_password(),
                stage: Stage::Init,
                progress: 0,
                error_msg: None,
            };
            inner.vms.insert(id.clone(), vps.clone());
            inner.clients.insert(client_addr.to_string(), id.clone());
            vps
        };

        info!(vm = %id, name = %vps.name, image = %vps.image_type, template = %vps.template,
              "vm creation started");

        if let Some(manager) = self.handle() {
            tokio::spawn(async move {
                if let Err(e) = manager.run_create(&id).await {
                    warn!(vm = %id, "vm creation failed: {e}");
                    manager.fail_create(&id, e.to_string());
                }
            });
        }

        Ok(vps)
    }

    async fn run_create(&self, id: &str) -> Result<(), Error> {
        let record = self.get(id)?;

        self.set_stage(id, Stage::Init, 10)?;

        self.set_stage(id, Stage::Init, 20)?;
        self.images
            .prepare(&record.image_type)
            .await
            .map_err(|e| Error::Tool { tool: "image", detail: format!("image not available: {e}") })?;

        tokio::fs::create_dir_all(self.dirs.instance_dir(id)).await?;

        self.set_stage(id, Stage::CreatingDisk, 40)?;
        self.create_overlay(&record).await?;

        self.set_stage(id, Stage::PreparingCloudInit, 60)?;
        let template = templates::find(&self.templates, &record.template)
            .ok_or_else(|| Error::Internal(format!("template {} vanished", record.template)))?;
        cloudinit::build_iso(
            &record.cloud_init_path,
            &record.password,
            &record.image_type,
            &record.hostname,
            template,
        )
        .await?;

        self.set_stage(id, Stage::StartingQemu, 80)?;
        let pid = self.spawn_qemu(&record).await?;
        let removed_mid_flight = {
            let mut inner = self.write();
            match inner.vms.get_mut(id) {
                Some(vps) => {
                    vps.qemu_pid = pid;
                    false
                }
                None => true,
            }
        };
        if removed_mid_flight {
            // Deleted while QEMU was coming up; nothing owns this pid now.
            hypervisor::force_kill(pid);
            return Err(Error::NotFound(format!("VM {id} removed during creation")));
        }

        self.set_stage(id, Stage::ConfiguringVnc, 90)?;
        if let Err(e) = vnc::start(record.vnc_port, &self.dirs.logs()).await {
            // The VM is reachable over SSH either way; no web console only.
            warn!(vm = %id, "vnc bridge failed to start: {e}");
        }

        let removed_mid_flight = {
            let mut inner = self.write();
            match inner.vms.get_mut(id) {
                Some(vps) => {
                    vps.stage = Stage::Completed;
                    vps.progress = vps.progress.max(100);
                    vps.status = Status::Running;
                    false
                }
                None => true,
            }
        };
        if removed_mid_flight {
            vnc::stop(record.vnc_port).await;
            hypervisor::force_kill(pid);
            return Err(Error::NotFound(format!("VM {id} removed during creation")));
        }
        info!(vm = %id, pid, "vm running");

        self.schedule_expiry(id.to_string(), record.expires_at);
        Ok(())
    }

    /// Thin qcow2 overlay on top of the read-only prepared base.
    async fn create_overlay(&self, record: &Vps) -> Result<(), Error> {
        let base = self.images.base_path(&record.image_type);
        let output = tokio::process::Command::new("qemu-img")
            .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
            .arg(&base)
            .arg(&record.disk_path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Tool { tool: "qemu-img", detail: format!("spawn: {e}") })?;
        if !output.status.success() {
            return Err(Error::Tool {
                tool: "qemu-img",
                detail: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }

    async fn spawn_qemu(&self, record: &Vps) -> Result<i32, Error> {
        let monitor_socket = self.dirs.monitor_socket(&record.id);
        let pidfile = self.dirs.pidfile(&record.id);
        let spec = QemuSpec {
            name: &record.name,
            disk: &record.disk_path,
            cidata: &record.cloud_init_path,
            vnc_display: record.vnc_port - VNC_PORT_BASE,
            ssh_port: record.ssh_port,
            mac: hypervisor::mac_for_id(&record.id),
            monitor_socket: &monitor_socket,
            pidfile: &pidfile,
        };
        hypervisor::spawn(&spec, &self.dirs.log_path(&record.id)).await
    }

    /// Publish a pipeline stage. Progress only moves forward; an `Err`
    /// means the record was deleted mid-flight and the pipeline must stop.
    fn set_stage(&self, id: &str, stage: Stage, progress: u8) -> Result<(), Error> {
        let mut inner = self.write();
        let vps = inner
            .vms
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("VM {id} removed during creation")))?;
        vps.stage = stage;
        vps.progress = vps.progress.max(progress);
        Ok(())
    }

    fn fail_create(&self, id: &str, message: String) {
        let mut inner = self.write();
        if let Some(vps) = inner.vms.get_mut(id) {
            vps.status = Status::Failed;
            vps.stage = Stage::Failed;
            vps.error_msg = Some(message);
        }
    }

    fn schedule_expiry(&self, id: String, expires_at: DateTime<Utc>) {
        let Some(manager) = self.handle() else { return };
        tokio::spawn(async move {
            let remaining = (expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining).await;

            {
                let mut inner = manager.write();
                match inner.vms.get_mut(&id) {
                    Some(vps) => vps.status = Status::Expired,
                    None => return, // already deleted
                }
            }
            info!(vm = %id, "lifetime elapsed, reclaiming");
            if let Err(e) = manager.delete(&id).await {
                warn!(vm = %id, "expiry cleanup failed: {e}");
            }
        });
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Result<Vps, Error> {
        self.read()
            .vms
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("VM {id}")))
    }

    /// All records, oldest first. Records claiming a live process whose pid
    /// no longer verifies as QEMU are corrected to `stopped` on the way.
    pub fn list(&self) -> Vec<Vps> {
        let candidates: Vec<(String, i32)> = {
            self.read()
                .vms
                .values()
                .filter(|v| v.claims_live_process())
                .map(|v| (v.id.clone(), v.qemu_pid))
                .collect()
        };
        // Process probes happen outside the store lock.
        let stale: Vec<String> = candidates
            .into_iter()
            .filter(|(_, pid)| hypervisor::verify(*pid).is_err())
            .map(|(id, _)| id)
            .collect();

        if !stale.is_empty() {
            let mut inner = self.write();
            for id in stale {
                if let Some(vps) = inner.vms.get_mut(&id) {
                    if vps.claims_live_process() {
                        warn!(vm = %id, "qemu process gone, marking stopped");
                        vps.status = Status::Stopped;
                        vps.qemu_pid = 0;
                    }
                }
            }
        }

        let mut vms: Vec<Vps> = self.read().vms.values().cloned().collect();
        vms.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        vms
    }

    pub fn progress(&self, id: &str) -> Result<Progress, Error> {
        let vps = self.get(id)?;
        Ok(Progress {
            stage: vps.stage,
            progress: vps.progress,
            status: vps.status,
            error: vps.error_msg,
        })
    }

    pub fn metrics_history(&self, id: &str) -> Result<Vec<crate::metrics::ResourceSample>, Error> {
        self.metrics
            .history(id)
            .ok_or_else(|| Error::NotFound(format!("no metrics available for VM {id}")))
    }

    /// Snapshot of (id, pid, monitor socket) for every running VM; the
    /// collector iterates this without touching the store lock again.
    pub fn running_vms(&self) -> Vec<(String, i32, PathBuf)> {
        self.read()
            .vms
            .values()
            .filter(|v| v.status == Status::Running && v.qemu_pid > 0)
            .map(|v| (v.id.clone(), v.qemu_pid, self.dirs.monitor_socket(&v.id)))
            .collect()
    }

    // ── Stop / start / restart ───────────────────────────────────────────

    /// Graceful power-off: ACPI powerdown via QMP, then a watcher that
    /// downgrades to SIGKILL after two minutes.
    pub async fn stop(&self, id: &str) -> Result<(), Error> {
        let vps = self.get(id)?;
        if vps.status == Status::Stopped {
            return Err(Error::Conflict("VM is already stopped".into()));
        }
        if vps.qemu_pid <= 0 {
            return Err(Error::Conflict("VM does not have a running process".into()));
        }

        let monitor_socket = self.dirs.monitor_socket(id);
        qmp::execute_simple(&monitor_socket, "system_powerdown").await?;

        {
            let mut inner = self.write();
            if let Some(v) = inner.vms.get_mut(id) {
                v.status = Status::Stopping;
            }
        }

        let Some(manager) = self.handle() else {
            return Ok(());
        };
        let id = id.to_string();
        let pid = vps.qemu_pid;
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + GRACEFUL_TIMEOUT;
            loop {
                tokio::time::sleep(GRACEFUL_POLL).await;
                if !hypervisor::is_alive(pid) {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(vm = %id, pid, "graceful shutdown timed out, killing");
                    hypervisor::force_kill(pid);
                    break;
                }
            }
            let mut inner = manager.write();
            if let Some(v) = inner.vms.get_mut(&id) {
                if v.status == Status::Stopping {
                    v.status = Status::Stopped;
                    v.qemu_pid = 0;
                    info!(vm = %id, "vm stopped");
                }
            }
        });

        Ok(())
    }

    /// Cold start of a stopped VM: same argument vector, fresh pid.
    pub async fn start(&self, id: &str) -> Result<Vps, Error> {
        let vps = self.get(id)?;
        if vps.status == Status::Running {
            return Err(Error::Conflict("VM is already running".into()));
        }
        if vps.status != Status::Stopped {
            return Err(Error::Conflict(format!(
                "VM cannot be started while {}",
                status_name(vps.status)
            )));
        }

        // A leftover socket from the previous run would block the listener.
        let monitor_socket = self.dirs.monitor_socket(id);
        let _ = tokio::fs::remove_file(&monitor_socket).await;

        {
            let mut inner = self.write();
            if let Some(v) = inner.vms.get_mut(id) {
                v.status = Status::Starting;
            }
        }

        let pid = match self.spawn_qemu(&vps).await {
            Ok(pid) => pid,
            Err(e) => {
                let mut inner = self.write();
                if let Some(v) = inner.vms.get_mut(id) {
                    v.status = Status::Stopped;
                }
                return Err(e);
            }
        };

        let updated = {
            let mut inner = self.write();
            inner.vms.get_mut(id).map(|vps| {
                vps.qemu_pid = pid;
                vps.status = Status::Running;
                vps.clone()
            })
        };
        match updated {
            Some(vps) => {
                info!(vm = %id, pid, "vm started");
                Ok(vps)
            }
            None => {
                // Deleted while QEMU was coming up.
                hypervisor::force_kill(pid);
                Err(Error::NotFound(format!("VM {id}")))
            }
        }
    }

    /// Warm reboot via QMP `system_reset`; the guest settles back to
    /// `running` after a bounded delay.
    pub async fn restart(&self, id: &str) -> Result<(), Error> {
        let vps = self.get(id)?;
        if vps.status != Status::Running {
            return Err(Error::Conflict("VM must be running to restart".into()));
        }
        if vps.qemu_pid <= 0 {
            return Err(Error::Conflict("VM does not have a running process".into()));
        }

        let monitor_socket = self.dirs.monitor_socket(id);
        qmp::execute_simple(&monitor_socket, "system_reset").await?;

        {
            let mut inner = self.write();
            if let Some(v) = inner.vms.get_mut(id) {
                v.status = Status::Restarting;
            }
        }

        let Some(manager) = self.handle() else {
            return Ok(());
        };
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(RESET_SETTLE).await;
            let mut inner = manager.write();
            if let Some(v) = inner.vms.get_mut(&id) {
                if v.status == Status::Restarting {
                    v.status = Status::Running;
                }
            }
        });

        Ok(())
    }

    // ── Delete ───────────────────────────────────────────────────────────

    /// Remove the record and reclaim everything it owns. Tolerates
    /// partially-built VMs; a second call returns 404.
    pub async fn delete(&self, id: &str) -> Result<(), Error> {
        let vps = {
            let mut inner = self.write();
            let vps = inner
                .vms
                .remove(id)
                .ok_or_else(|| Error::NotFound(format!("VM {id}")))?;
            inner.clients.retain(|_, vm_id| vm_id.as_str() != id);
            vps
        };

        vnc::stop(vps.vnc_port).await;
        if vps.qemu_pid > 0 {
            hypervisor::force_kill(vps.qemu_pid);
        }
        self.metrics.remove(id);

        let instance_dir = self.dirs.instance_dir(id);
        if let Err(e) = tokio::fs::remove_dir_all(&instance_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(vm = %id, "failed to remove instance dir: {e}");
            }
        }
        // The per-VM log stays behind for post-mortems.

        info!(vm = %id, "vm deleted");
        Ok(())
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Reap every VM: bridge down, QEMU killed, instance directory gone.
    ///
    /// Synchronous so it can run from both the signal task and the panic
    /// hook; per-VM work fans out across scoped threads.
    pub fn cleanup_all(&self) {
        let vms: Vec<Vps> = {
            let mut inner = self.write();
            inner.clients.clear();
            inner.vms.drain().map(|(_, v)| v).collect()
        };
        if vms.is_empty() {
            return;
        }
        info!(count = vms.len(), "reaping all vms");

        std::thread::scope(|scope| {
            for vps in &vms {
                scope.spawn(|| {
                    vnc::stop_blocking(vps.vnc_port);
                    if vps.qemu_pid > 0 {
                        hypervisor::force_kill(vps.qemu_pid);
                    }
                    let _ = std::fs::remove_dir_all(self.dirs.instance_dir(&vps.id));
                    info!(vm = %vps.id, "reaped");
                });
            }
        });
    }
}

fn status_name(status: Status) -> &'static str {
    match status {
        Status::Creating => "creating",
        Status::Running => "running",
        Status::Stopping => "stopping",
        Status::Stopped => "stopped",
        Status::Starting => "starting",
        Status::Restarting => "restarting",
        Status::Failed => "failed",
        Status::Expired => "expired",
    }
}

/// Short throwaway root password from fresh UUID bytes.
fn generate_password() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
