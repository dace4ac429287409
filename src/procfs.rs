//! Parsers for the host-side process accounting files under `/proc`.
//!
//! The parsing functions are pure (they take the file text) so they can be
//! tested without a live process; thin readers wrap them per pid.

use std::io;
use std::path::Path;

/// Cumulative I/O counters from `/proc/<pid>/io`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
}

/// Cumulative interface counters from `/proc/<pid>/net/dev`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Process command line with NUL separators flattened to spaces.
pub fn cmdline(pid: i32) -> io::Result<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline"))?;
    Ok(raw
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect::<Vec<_>>()
        .join(" "))
}

pub fn read_stat(pid: i32) -> io::Result<String> {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
}

pub fn read_status(pid: i32) -> io::Result<String> {
    std::fs::read_to_string(format!("/proc/{pid}/status"))
}

pub fn read_io(pid: i32) -> io::Result<String> {
    std::fs::read_to_string(format!("/proc/{pid}/io"))
}

pub fn read_net_dev(pid: i32) -> io::Result<String> {
    std::fs::read_to_string(format!("/proc/{pid}/net/dev"))
}

pub fn read_uptime() -> io::Result<String> {
    std::fs::read_to_string("/proc/uptime")
}

/// Sum of utime and stime clock ticks from a `/proc/<pid>/stat` line.
///
/// The comm field may itself contain spaces or parentheses, so fields are
/// counted from the last `)` rather than from the start of the line.
pub fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest starts at field 3 (state); utime/stime are fields 14/15 overall.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Seconds of system uptime from `/proc/uptime`.
pub fn parse_uptime(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// `(VmSize, VmRSS)` in bytes from `/proc/<pid>/status`.
pub fn parse_memory(status: &str) -> (u64, u64) {
    let mut vm_size = 0u64;
    let mut rss = 0u64;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmSize:") {
            vm_size = parse_kib(rest);
        } else if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss = parse_kib(rest);
        }
    }
    (vm_size, rss)
}

fn parse_kib(rest: &str) -> u64 {
    rest.split_whitespace()
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|kib| kib * 1024)
        .unwrap_or(0)
}

/// Byte and syscall counters from `/proc/<pid>/io`.
pub fn parse_io(content: &str) -> IoCounters {
    let mut counters = IoCounters::default();
    for line in content.lines() {
        let mut parts = line.split(':');
        let key = parts.next().unwrap_or("");
        let value: u64 = parts
            .next()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        match key {
            "read_bytes" => counters.read_bytes = value,
            "write_bytes" => counters.write_bytes = value,
            "syscr" => counters.read_ops = value,
            "syscw" => counters.write_ops = value,
            _ => {}
        }
    }
    counters
}

/// Counters for the first interface named `eth0` or `ens3` in a
/// `/proc/<pid>/net/dev` listing, or `None` when neither is present.
pub fn parse_net_dev(content: &str) -> Option<NetCounters> {
    for line in content.lines() {
        let (iface, rest) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let iface = iface.trim();
        if iface != "eth0" && iface != "ens3" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        return Some(NetCounters {
            rx_bytes: fields[0].parse().unwrap_or(0),
            rx_packets: fields[1].parse().unwrap_or(0),
            tx_bytes: fields[8].parse().unwrap_or(0),
            tx_packets: fields[9].parse().unwrap_or(0),
        });
    }
    None
}

/// True when a process with this pid exists (signal 0 probe).
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // kill -0 checks existence without sending a signal.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// True when `path` exists and the pid looks valid.
pub fn pidfile_pid(path: &Path) -> Option<i32> {
    let content = std::fs::read_to_string(path).ok()?;
    let pid: i32 = content.trim().parse().ok()?;
    (pid > 0).then_some(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_ticks_sum_utime_and_stime() {
        let stat = "1234 (qemu-system-x86) S 1 1234 1234 0 -1 4194560 \
                    1000 0 0 0 250 125 0 0 20 0 4 0 12345 0 0";
        assert_eq!(parse_cpu_ticks(stat), Some(375));
    }

    #[test]
    fn cpu_ticks_handle_spaces_in_comm() {
        let stat = "99 (my odd (name)) R 1 99 99 0 -1 0 \
                    0 0 0 0 10 20 0 0 20 0 1 0 100 0 0";
        assert_eq!(parse_cpu_ticks(stat), Some(30));
    }

    #[test]
    fn cpu_ticks_reject_short_lines() {
        assert_eq!(parse_cpu_ticks("1 (x) S 1 2"), None);
        assert_eq!(parse_cpu_ticks(""), None);
    }

    #[test]
    fn uptime_first_field() {
        assert_eq!(parse_uptime("12345.67 54321.00\n"), Some(12345.67));
        assert_eq!(parse_uptime("garbage"), None);
    }

    #[test]
    fn memory_fields_scale_to_bytes() {
        let status = "Name:\tqemu-system-x86\nVmSize:\t  4200000 kB\nVmRSS:\t  1048576 kB\n";
        let (vm_size, rss) = parse_memory(status);
        assert_eq!(vm_size, 4_200_000 * 1024);
        assert_eq!(rss, 1_048_576 * 1024);
    }

    #[test]
    fn io_counters_pick_bytes_and_syscalls() {
        let io = "rchar: 100\nwchar: 200\nsyscr: 31\nsyscw: 17\n\
                  read_bytes: 4096\nwrite_bytes: 8192\ncancelled_write_bytes: 0\n";
        let c = parse_io(io);
        assert_eq!(
            c,
            IoCounters { read_bytes: 4096, write_bytes: 8192, read_ops: 31, write_ops: 17 }
        );
    }

    #[test]
    fn net_dev_matches_known_interfaces() {
        let content = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0
  eth0:  555000    4321    0    0    0     0          0         0   222000    1234    0    0    0     0       0          0
";
        let c = parse_net_dev(content).unwrap();
        assert_eq!(c.rx_bytes, 555_000);
        assert_eq!(c.rx_packets, 4321);
        assert_eq!(c.tx_bytes, 222_000);
        assert_eq!(c.tx_packets, 1234);
    }

    #[test]
    fn net_dev_none_without_candidate_interface() {
        let content = "    lo:  1 1 0 0 0 0 0 0  1 1 0 0 0 0 0 0\n";
        assert!(parse_net_dev(content).is_none());
    }

    #[test]
    fn negative_and_zero_pids_are_never_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(-5));
    }
}
