use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_unix: i64,
    pub last_collect_timestamp_seconds: i64,
    pub snapshot: Option<Snapshot>,
}

/// One poll worth of metrics. Every field is populated by its own probe and may be
/// empty or `None` independently of the others.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct Snapshot {
    pub cpu_percents: Vec<f64>,
    pub cpu_freqs: Vec<f64>,
    pub cpu_temps: BTreeMap<u32, f64>,
    pub cpu_package_temp: Option<f64>,
    pub gpu: GpuStats,
    pub cuda_available: bool,
    pub memory: Option<MemoryStats>,
    pub disk_io: Option<DiskIoStats>,
    pub disk_usage: Option<DiskUsageStats>,
    pub network: Option<NetworkStats>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct GpuStats {
    pub temp: Option<i64>,
    pub power_draw: Option<f64>,
    pub power_limit: Option<f64>,
    pub mem_used: Option<u64>,
    pub mem_total: Option<u64>,
}

impl GpuStats {
    pub fn is_empty(&self) -> bool {
        self.temp.is_none()
            && self.power_draw.is_none()
            && self.power_limit.is_none()
            && self.mem_used.is_none()
            && self.mem_total.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub percent: f64,
}

/// Cumulative megabytes since boot, not a per-interval rate.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DiskIoStats {
    pub read_mb: f64,
    pub write_mb: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DiskUsageStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct NetworkStats {
    pub upload_kbs: f64,
    pub download_kbs: f64,
    pub interface: String,
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn update_collected(&mut self, now_unix: i64, snapshot: Snapshot) {
        self.last_collect_timestamp_seconds = now_unix;
        self.snapshot = Some(snapshot);
    }
}

pub(crate) fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64) * 100.0
}
