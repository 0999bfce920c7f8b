//! Host metric collectors feeding the snapshot store.
//!
//! All collectors are parse-only readers of `/proc` and `/sys`; they refresh
//! the store on their own schedule and never run on a session's send path.
//! Parse failures are logged and skipped, never fatal.
use serde_json::{Value, json};
use skiff_common::channels;
use skiff_stream::MetricStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

// Alert thresholds; crossing one publishes on the matching alert channel.
const TEMPERATURE_ALERT_C: f64 = 80.0;
const CPU_ALERT_PERCENT: f64 = 95.0;
const MEMORY_ALERT_PERCENT: f64 = 90.0;

/// Cumulative CPU counters from the aggregate `cpu` line of `/proc/stat`,
/// kept across refreshes so usage can be computed as a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

pub fn parse_proc_stat(contents: &str) -> Option<CpuTimes> {
    let line = contents.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|field| field.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait both count as idle time.
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        total: fields.iter().sum(),
        idle,
    })
}

pub fn cpu_percent(prev: CpuTimes, current: CpuTimes) -> Option<f64> {
    let total = current.total.checked_sub(prev.total)?;
    let idle = current.idle.checked_sub(prev.idle)?;
    if total == 0 {
        return None;
    }
    Some(100.0 * (total - idle) as f64 / total as f64)
}

pub fn parse_loadavg(contents: &str) -> Option<(f64, f64, f64)> {
    let mut fields = contents.split_whitespace();
    let one = fields.next()?.parse().ok()?;
    let five = fields.next()?.parse().ok()?;
    let fifteen = fields.next()?.parse().ok()?;
    Some((one, five, fifteen))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemInfo {
    pub fn used_percent(&self) -> f64 {
        if self.total_kb == 0 {
            return 0.0;
        }
        100.0 * (self.total_kb.saturating_sub(self.available_kb)) as f64 / self.total_kb as f64
    }
}

pub fn parse_meminfo(contents: &str) -> Option<MemInfo> {
    let mut total_kb = None;
    let mut available_kb = None;
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("MemTotal:") => total_kb = fields.next()?.parse().ok(),
            Some("MemAvailable:") => available_kb = fields.next()?.parse().ok(),
            _ => {}
        }
    }
    Some(MemInfo {
        total_kb: total_kb?,
        available_kb: available_kb?,
    })
}

pub fn parse_uptime(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse().ok()
}

/// One mounted filesystem from `/proc/mounts`. Pseudo filesystems (devices
/// that are not paths) are filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub device: String,
    pub mount_point: String,
    pub fstype: String,
}

pub fn parse_mounts(contents: &str) -> Vec<Mount> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next()?;
            if !device.starts_with('/') {
                return None;
            }
            Some(Mount {
                device: device.to_string(),
                mount_point: mount_point.to_string(),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

// /sys/class/thermal zone temperatures are reported in millidegrees.
pub fn parse_millidegrees(contents: &str) -> Option<f64> {
    let raw: i64 = contents.trim().parse().ok()?;
    Some(raw as f64 / 1000.0)
}

fn read_thermal_zones() -> Vec<f64> {
    let Ok(entries) = std::fs::read_dir("/sys/class/thermal") else {
        return Vec::new();
    };
    let mut temps = Vec::new();
    for entry in entries.flatten() {
        if !entry
            .file_name()
            .to_string_lossy()
            .starts_with("thermal_zone")
        {
            continue;
        }
        if let Ok(contents) = std::fs::read_to_string(entry.path().join("temp"))
            && let Some(celsius) = parse_millidegrees(&contents)
        {
            temps.push(celsius);
        }
    }
    temps
}

pub fn system_stats_payload(
    cpu_percent: Option<f64>,
    load: Option<(f64, f64, f64)>,
    memory: Option<MemInfo>,
    uptime_secs: Option<f64>,
) -> Value {
    json!({
        "cpu_percent": cpu_percent,
        "load": load.map(|(one, five, fifteen)| json!({
            "one": one,
            "five": five,
            "fifteen": fifteen,
        })),
        "memory": memory.map(|mem| json!({
            "total_kb": mem.total_kb,
            "available_kb": mem.available_kb,
            "used_percent": mem.used_percent(),
        })),
        "uptime_secs": uptime_secs,
    })
}

pub fn storage_status_payload(mounts: &[Mount]) -> Value {
    json!({
        "mounts": mounts
            .iter()
            .map(|mount| json!({
                "device": mount.device,
                "mount_point": mount.mount_point,
                "fstype": mount.fstype,
            }))
            .collect::<Vec<_>>(),
    })
}

fn read_proc(path: &str) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(err) => {
            tracing::debug!(path, error = %err, "collector read failed");
            None
        }
    }
}

fn refresh_once(store: &MetricStore, prev_cpu: &mut Option<CpuTimes>) {
    let current_cpu = read_proc("/proc/stat").and_then(|contents| parse_proc_stat(&contents));
    let usage = match (*prev_cpu, current_cpu) {
        (Some(prev), Some(current)) => cpu_percent(prev, current),
        _ => None,
    };
    if current_cpu.is_some() {
        *prev_cpu = current_cpu;
    }
    let load = read_proc("/proc/loadavg").and_then(|contents| parse_loadavg(&contents));
    let memory = read_proc("/proc/meminfo").and_then(|contents| parse_meminfo(&contents));
    let uptime = read_proc("/proc/uptime").and_then(|contents| parse_uptime(&contents));
    store.publish(
        channels::SYSTEM_STATS,
        system_stats_payload(usage, load, memory, uptime),
    );

    if let Some(contents) = read_proc("/proc/mounts") {
        store.publish(
            channels::STORAGE_STATUS,
            storage_status_payload(&parse_mounts(&contents)),
        );
    }

    let temps = read_thermal_zones();
    if let Some(max_temp) = temps.iter().copied().reduce(f64::max)
        && max_temp >= TEMPERATURE_ALERT_C
    {
        store.publish(
            channels::TEMPERATURE_ALERT,
            json!({
                "max_celsius": max_temp,
                "threshold_celsius": TEMPERATURE_ALERT_C,
            }),
        );
    }
    publish_resource_alert(store, usage, memory);
}

fn publish_resource_alert(store: &MetricStore, cpu: Option<f64>, memory: Option<MemInfo>) {
    let cpu_high = cpu.is_some_and(|value| value >= CPU_ALERT_PERCENT);
    let mem_high = memory.is_some_and(|mem| mem.used_percent() >= MEMORY_ALERT_PERCENT);
    if !cpu_high && !mem_high {
        return;
    }
    store.publish(
        channels::RESOURCE_ALERT,
        json!({
            "cpu_percent": cpu,
            "memory_used_percent": memory.map(|mem| mem.used_percent()),
            "cpu_threshold": CPU_ALERT_PERCENT,
            "memory_threshold": MEMORY_ALERT_PERCENT,
        }),
    );
}

/// Background refresher: publishes host snapshots on a fixed period until the
/// task is aborted at shutdown.
pub async fn run_collectors(store: Arc<MetricStore>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut prev_cpu = None;
    loop {
        ticker.tick().await;
        refresh_once(&store, &mut prev_cpu);
    }
}
