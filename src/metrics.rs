//! Per-VM resource sampling with a bounded history window.
//!
//! A single background task ticks every two seconds, snapshots the running
//! VMs and samples each from host-side process accounting plus one QMP
//! probe. Rates are derivatives against the previous sample. Network
//! counters come from the QEMU process's own interface statistics when QMP
//! exposes nothing, which under user-mode networking only approximates
//! guest traffic; they are best-effort and fall back to zero.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::error::Error;
use crate::hypervisor::RAM_SIZE_MIB;
use crate::procfs;
use crate::qmp;
use crate::vm::VpsManager;

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);
/// 300 samples at 2 s cadence: ten minutes of history.
pub const HISTORY_LIMIT: usize = 300;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CpuMetrics {
    /// Percentage of one host, 0-100.
    pub usage: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryMetrics {
    pub used: u64,
    pub total: u64,
    pub cache: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DiskMetrics {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    /// Bytes per second, derived from the previous sample.
    pub read_speed: f64,
    pub write_speed: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NetworkMetrics {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    /// Bytes per second, derived from the previous sample.
    pub rx_speed: f64,
    pub tx_speed: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceSample {
    pub time: DateTime<Utc>,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub network: NetworkMetrics,
}

#[derive(Default)]
struct VmCache {
    last_update: Option<DateTime<Utc>>,
    last_disk: DiskMetrics,
    last_net: NetworkMetrics,
    history: VecDeque<ResourceSample>,
}

/// Thread-safe metrics cache, cheaply cloneable.
#[derive(Clone, Default)]
pub struct MetricsStore(Arc<RwLock<HashMap<String, VmCache>>>);

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a raw sample into the cache: derive rates against the previous
    /// baselines, append to the bounded history, advance the baselines.
    pub fn record(&self, vm_id: &str, mut sample: ResourceSample) {
        let mut inner = self.0.write().unwrap_or_else(|e| e.into_inner());
        let cache = inner.entry(vm_id.to_string()).or_default();

        if let Some(prev) = cache.last_update {
            let elapsed = (sample.time - prev).num_milliseconds() as f64 / 1000.0;
            if elapsed > 0.0 {
                sample.disk.read_speed =
                    delta(sample.disk.read_bytes, cache.last_disk.read_bytes) / elapsed;
                sample.disk.write_speed =
                    delta(sample.disk.write_bytes, cache.last_disk.write_bytes) / elapsed;
                sample.network.rx_speed =
                    delta(sample.network.rx_bytes, cache.last_net.rx_bytes) / elapsed;
                sample.network.tx_speed =
                    delta(sample.network.tx_bytes, cache.last_net.tx_bytes) / elapsed;
            }
        }

        cache.last_update = Some(sample.time);
        cache.last_disk = sample.disk;
        cache.last_net = sample.network;

        cache.history.push_back(sample);
        while cache.history.len() > HISTORY_LIMIT {
            cache.history.pop_front();
        }
    }

    /// Snapshot of one VM's history, or `None` when nothing was collected.
    pub fn history(&self, vm_id: &str) -> Option<Vec<ResourceSample>> {
        let inner = self.0.read().unwrap_or_else(|e| e.into_inner());
        inner.get(vm_id).map(|c| c.history.iter().copied().collect())
    }

    pub fn remove(&self, vm_id: &str) {
        let mut inner = self.0.write().unwrap_or_else(|e| e.into_inner());
        inner.remove(vm_id);
    }
}

fn delta(current: u64, previous: u64) -> f64 {
    current.saturating_sub(previous) as f64
}

/// Start the collection loop. One failure only skips that VM for that tick.
pub fn spawn_collector(manager: Arc<VpsManager>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for (id, pid, monitor_socket) in manager.running_vms() {
                match collect_sample(pid, &monitor_socket).await {
                    Ok(sample) => manager.metrics().record(&id, sample),
                    Err(e) => debug!(vm = %id, "metrics sample skipped: {e}"),
                }
            }
        }
    });
}

async fn collect_sample(pid: i32, monitor_socket: &Path) -> Result<ResourceSample, Error> {
    let mut sample = ResourceSample {
        time: Utc::now(),
        cpu: CpuMetrics::default(),
        memory: MemoryMetrics::default(),
        disk: DiskMetrics::default(),
        network: NetworkMetrics::default(),
    };

    let stat = procfs::read_stat(pid)?;
    let uptime = procfs::read_uptime()?;
    if let (Some(ticks), Some(uptime_secs)) =
        (procfs::parse_cpu_ticks(&stat), procfs::parse_uptime(&uptime))
    {
        if uptime_secs > 0.0 {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1) as f64;
            sample.cpu.usage = ticks as f64 / uptime_secs * (100.0 / cpus);
        }
    }

    let status = procfs::read_status(pid)?;
    let (vm_size, rss) = procfs::parse_memory(&status);
    sample.memory = MemoryMetrics {
        used: rss,
        total: RAM_SIZE_MIB * 1024 * 1024,
        cache: vm_size.saturating_sub(rss),
    };

    let io = procfs::read_io(pid)?;
    let counters = procfs::parse_io(&io);
    sample.disk = DiskMetrics {
        read_bytes: counters.read_bytes,
        write_bytes: counters.write_bytes,
        read_ops: counters.read_ops,
        write_ops: counters.write_ops,
        read_speed: 0.0,
        write_speed: 0.0,
    };

    sample.network = network_counters(pid, monitor_socket).await;

    Ok(sample)
}

/// Network counters: try QMP netdev introspection first, then the QEMU
/// process's `/proc/<pid>/net/dev`; zeros when neither source matches.
async fn network_counters(pid: i32, monitor_socket: &Path) -> NetworkMetrics {
    if let Ok(response) = qmp::execute(monitor_socket, json!({ "execute": "query-netdev" })).await {
        if let Some(net) = netdev_counters(&response) {
            return net;
        }
    }

    match procfs::read_net_dev(pid).map(|content| procfs::parse_net_dev(&content)) {
        Ok(Some(c)) => NetworkMetrics {
            rx_bytes: c.rx_bytes,
            tx_bytes: c.tx_bytes,
            rx_packets: c.rx_packets,
            tx_packets: c.tx_packets,
            rx_speed: 0.0,
            tx_speed: 0.0,
        },
        _ => NetworkMetrics::default(),
    }
}

/// Sum per-netdev byte/packet counters if the QMP response carries any.
/// Current QEMU reports netdev configuration without counters here, so
/// this usually yields `None` and the caller falls back to procfs.
fn netdev_counters(response: &serde_json::Value) -> Option<NetworkMetrics> {
    let entries = response.get("return")?.as_array()?;
    let mut net = NetworkMetrics::default();
    let mut found = false;
    for entry in entries {
        let stats = match entry.get("stats") {
            Some(s) => s,
            None => continue,
        };
        found = true;
        net.rx_bytes += stats.get("rx-bytes").and_then(|v| v.as_u64()).unwrap_or(0);
        net.tx_bytes += stats.get("tx-bytes").and_then(|v| v.as_u64()).unwrap_or(0);
        net.rx_packets += stats.get("rx-packets").and_then(|v| v.as_u64()).unwrap_or(0);
        net.tx_packets += stats.get("tx-packets").and_then(|v| v.as_u64()).unwrap_or(0);
    }
    found.then_some(net)
}
