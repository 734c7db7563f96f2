use crate::state::State;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub cpu_usage_percent: GaugeVec,
    pub cpu_frequency_mhz: GaugeVec,
    pub cpu_core_temperature_celsius: GaugeVec,
    pub cpu_package_temperature_celsius: GaugeVec,
    pub gpu_temperature_celsius: GaugeVec,
    pub gpu_power_draw_watts: GaugeVec,
    pub gpu_power_limit_watts: GaugeVec,
    pub gpu_memory_used_mib: GaugeVec,
    pub gpu_memory_total_mib: GaugeVec,
    pub cuda_available: Gauge,
    pub memory_total_bytes: GaugeVec,
    pub memory_used_bytes: GaugeVec,
    pub memory_available_bytes: GaugeVec,
    pub memory_usage_percent: GaugeVec,
    pub disk_read_mb_total: GaugeVec,
    pub disk_write_mb_total: GaugeVec,
    pub disk_total_bytes: GaugeVec,
    pub disk_used_bytes: GaugeVec,
    pub disk_free_bytes: GaugeVec,
    pub disk_usage_percent: GaugeVec,
    pub net_upload_kbs: GaugeVec,
    pub net_download_kbs: GaugeVec,
    pub uptime_seconds: Gauge,
    pub scrape_count_total: Counter,
    pub collect_errors_total: CounterVec,
    pub last_collect_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let cpu_usage_percent = GaugeVec::new(
            opts!("sysmond_cpu_usage_percent", "Usage per logical CPU in percent"),
            &["cpu"],
        )?;
        let cpu_frequency_mhz = GaugeVec::new(
            opts!("sysmond_cpu_frequency_mhz", "Clock speed per logical CPU in MHz"),
            &["cpu"],
        )?;
        let cpu_core_temperature_celsius = GaugeVec::new(
            opts!(
                "sysmond_cpu_core_temperature_celsius",
                "Temperature per physical core in Celsius"
            ),
            &["core"],
        )?;
        let cpu_package_temperature_celsius = optional_gauge(
            "sysmond_cpu_package_temperature_celsius",
            "CPU package temperature in Celsius",
        )?;
        let gpu_temperature_celsius =
            optional_gauge("sysmond_gpu_temperature_celsius", "GPU temperature in Celsius")?;
        let gpu_power_draw_watts =
            optional_gauge("sysmond_gpu_power_draw_watts", "GPU power draw in W")?;
        let gpu_power_limit_watts =
            optional_gauge("sysmond_gpu_power_limit_watts", "GPU power limit in W")?;
        let gpu_memory_used_mib =
            optional_gauge("sysmond_gpu_memory_used_mib", "GPU memory used in MiB")?;
        let gpu_memory_total_mib =
            optional_gauge("sysmond_gpu_memory_total_mib", "GPU memory total in MiB")?;
        let cuda_available = Gauge::with_opts(opts!(
            "sysmond_cuda_available",
            "1 when the CUDA runtime reports at least one device"
        ))?;
        let memory_total_bytes =
            optional_gauge("sysmond_memory_total_bytes", "Total memory in bytes")?;
        let memory_used_bytes =
            optional_gauge("sysmond_memory_used_bytes", "Used memory in bytes")?;
        let memory_available_bytes =
            optional_gauge("sysmond_memory_available_bytes", "Available memory in bytes")?;
        let memory_usage_percent =
            optional_gauge("sysmond_memory_usage_percent", "Memory usage in percent")?;
        let disk_read_mb_total =
            optional_gauge("sysmond_disk_read_mb_total", "Megabytes read from disks since boot")?;
        let disk_write_mb_total =
            optional_gauge("sysmond_disk_write_mb_total", "Megabytes written to disks since boot")?;
        let disk_total_bytes =
            optional_gauge("sysmond_disk_total_bytes", "Total bytes of the watched filesystem")?;
        let disk_used_bytes =
            optional_gauge("sysmond_disk_used_bytes", "Used bytes of the watched filesystem")?;
        let disk_free_bytes =
            optional_gauge("sysmond_disk_free_bytes", "Free bytes of the watched filesystem")?;
        let disk_usage_percent = optional_gauge(
            "sysmond_disk_usage_percent",
            "Usage of the watched filesystem in percent",
        )?;
        let net_upload_kbs = GaugeVec::new(
            opts!("sysmond_net_upload_kbs", "Upload rate in KB/s"),
            &["iface"],
        )?;
        let net_download_kbs = GaugeVec::new(
            opts!("sysmond_net_download_kbs", "Download rate in KB/s"),
            &["iface"],
        )?;
        let uptime_seconds =
            Gauge::with_opts(opts!("sysmond_uptime_seconds", "Collector uptime in seconds"))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "sysmond_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let collect_errors_total = CounterVec::new(
            opts!(
                "sysmond_collect_errors_total",
                "Polls in which a probe contributed nothing"
            ),
            &["probe"],
        )?;
        let last_collect_timestamp_seconds = Gauge::with_opts(opts!(
            "sysmond_last_collect_timestamp_seconds",
            "Unix time of the last snapshot"
        ))?;

        register(&registry, &cpu_usage_percent)?;
        register(&registry, &cpu_frequency_mhz)?;
        register(&registry, &cpu_core_temperature_celsius)?;
        register(&registry, &cpu_package_temperature_celsius)?;
        register(&registry, &gpu_temperature_celsius)?;
        register(&registry, &gpu_power_draw_watts)?;
        register(&registry, &gpu_power_limit_watts)?;
        register(&registry, &gpu_memory_used_mib)?;
        register(&registry, &gpu_memory_total_mib)?;
        register(&registry, &cuda_available)?;
        register(&registry, &memory_total_bytes)?;
        register(&registry, &memory_used_bytes)?;
        register(&registry, &memory_available_bytes)?;
        register(&registry, &memory_usage_percent)?;
        register(&registry, &disk_read_mb_total)?;
        register(&registry, &disk_write_mb_total)?;
        register(&registry, &disk_total_bytes)?;
        register(&registry, &disk_used_bytes)?;
        register(&registry, &disk_free_bytes)?;
        register(&registry, &disk_usage_percent)?;
        register(&registry, &net_upload_kbs)?;
        register(&registry, &net_download_kbs)?;
        register(&registry, &uptime_seconds)?;
        register(&registry, &scrape_count_total)?;
        register(&registry, &collect_errors_total)?;
        register(&registry, &last_collect_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            cpu_usage_percent,
            cpu_frequency_mhz,
            cpu_core_temperature_celsius,
            cpu_package_temperature_celsius,
            gpu_temperature_celsius,
            gpu_power_draw_watts,
            gpu_power_limit_watts,
            gpu_memory_used_mib,
            gpu_memory_total_mib,
            cuda_available,
            memory_total_bytes,
            memory_used_bytes,
            memory_available_bytes,
            memory_usage_percent,
            disk_read_mb_total,
            disk_write_mb_total,
            disk_total_bytes,
            disk_used_bytes,
            disk_free_bytes,
            disk_usage_percent,
            net_upload_kbs,
            net_download_kbs,
            uptime_seconds,
            scrape_count_total,
            collect_errors_total,
            last_collect_timestamp_seconds,
        }))
    }

    /// Mirrors the latest snapshot. An absent value removes its series instead of exporting 0.
    pub fn update_from_state(&self, state: &State) {
        self.last_collect_timestamp_seconds
            .set(state.last_collect_timestamp_seconds as f64);
        let now = now_unix();
        self.uptime_seconds
            .set(now.saturating_sub(state.started_at_unix) as f64);

        self.cpu_usage_percent.reset();
        self.cpu_frequency_mhz.reset();
        self.cpu_core_temperature_celsius.reset();
        self.net_upload_kbs.reset();
        self.net_download_kbs.reset();

        let Some(snapshot) = &state.snapshot else {
            for gauge in self.optional_gauges() {
                gauge.reset();
            }
            return;
        };

        for (idx, pct) in snapshot.cpu_percents.iter().enumerate() {
            self.cpu_usage_percent
                .with_label_values(&[&idx.to_string()])
                .set(*pct);
        }
        for (idx, mhz) in snapshot.cpu_freqs.iter().enumerate() {
            self.cpu_frequency_mhz
                .with_label_values(&[&idx.to_string()])
                .set(*mhz);
        }
        for (core, celsius) in &snapshot.cpu_temps {
            self.cpu_core_temperature_celsius
                .with_label_values(&[&core.to_string()])
                .set(*celsius);
        }
        set_optional(
            &self.cpu_package_temperature_celsius,
            snapshot.cpu_package_temp,
        );

        let gpu = &snapshot.gpu;
        set_optional(&self.gpu_temperature_celsius, gpu.temp.map(|v| v as f64));
        set_optional(&self.gpu_power_draw_watts, gpu.power_draw);
        set_optional(&self.gpu_power_limit_watts, gpu.power_limit);
        set_optional(&self.gpu_memory_used_mib, gpu.mem_used.map(|v| v as f64));
        set_optional(&self.gpu_memory_total_mib, gpu.mem_total.map(|v| v as f64));
        self.cuda_available
            .set(if snapshot.cuda_available { 1.0 } else { 0.0 });

        let mem = snapshot.memory.as_ref();
        set_optional(&self.memory_total_bytes, mem.map(|m| m.total as f64));
        set_optional(&self.memory_used_bytes, mem.map(|m| m.used as f64));
        set_optional(&self.memory_available_bytes, mem.map(|m| m.available as f64));
        set_optional(&self.memory_usage_percent, mem.map(|m| m.percent));

        let io = snapshot.disk_io.as_ref();
        set_optional(&self.disk_read_mb_total, io.map(|io| io.read_mb));
        set_optional(&self.disk_write_mb_total, io.map(|io| io.write_mb));

        let usage = snapshot.disk_usage.as_ref();
        set_optional(&self.disk_total_bytes, usage.map(|u| u.total as f64));
        set_optional(&self.disk_used_bytes, usage.map(|u| u.used as f64));
        set_optional(&self.disk_free_bytes, usage.map(|u| u.free as f64));
        set_optional(&self.disk_usage_percent, usage.map(|u| u.percent));

        if let Some(net) = &snapshot.network {
            self.net_upload_kbs
                .with_label_values(&[&net.interface])
                .set(net.upload_kbs);
            self.net_download_kbs
                .with_label_values(&[&net.interface])
                .set(net.download_kbs);
        }
    }

    fn optional_gauges(&self) -> [&GaugeVec; 16] {
        [
            &self.cpu_package_temperature_celsius,
            &self.gpu_temperature_celsius,
            &self.gpu_power_draw_watts,
            &self.gpu_power_limit_watts,
            &self.gpu_memory_used_mib,
            &self.gpu_memory_total_mib,
            &self.memory_total_bytes,
            &self.memory_used_bytes,
            &self.memory_available_bytes,
            &self.memory_usage_percent,
            &self.disk_read_mb_total,
            &self.disk_write_mb_total,
            &self.disk_total_bytes,
            &self.disk_used_bytes,
            &self.disk_free_bytes,
            &self.disk_usage_percent,
        ]
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn inc_collect_error(&self, probe: &str) {
        self.collect_errors_total
            .with_label_values(&[probe])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

/// Label-less vector: a series exists only while the value is known.
fn optional_gauge(name: &str, help: &str) -> Result<GaugeVec, prometheus::Error> {
    GaugeVec::new(opts!(name, help), &[])
}

fn set_optional(gauge: &GaugeVec, value: Option<f64>) {
    match value {
        Some(v) => gauge.with_label_values(&[]).set(v),
        None => gauge.reset(),
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{GpuStats, NetworkStats, Snapshot};
    use std::collections::BTreeMap;

    fn encoded(metrics: &Metrics) -> String {
        String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8")
    }

    fn has_series(text: &str, name: &str) -> bool {
        text.lines()
            .any(|line| line.split([' ', '{']).next() == Some(name))
    }

    #[test]
    fn snapshot_values_are_exported() {
        let metrics = Metrics::new().expect("metrics init");
        let mut state = State::new(0);
        state.update_collected(
            10,
            Snapshot {
                cpu_percents: vec![12.5, 50.0],
                cpu_temps: BTreeMap::from([(3, 61.0)]),
                network: Some(NetworkStats {
                    upload_kbs: 1.0,
                    download_kbs: 2.0,
                    interface: "eno1".to_string(),
                }),
                ..Snapshot::default()
            },
        );
        metrics.update_from_state(&state);

        let text = encoded(&metrics);
        assert!(text.contains("sysmond_cpu_usage_percent{cpu=\"1\"} 50"));
        assert!(text.contains("sysmond_cpu_core_temperature_celsius{core=\"3\"} 61"));
        assert!(text.contains("sysmond_net_download_kbs{iface=\"eno1\"} 2"));
        assert!(text.contains("sysmond_last_collect_timestamp_seconds 10"));
    }

    #[test]
    fn missing_interface_drops_stale_labels() {
        let metrics = Metrics::new().expect("metrics init");
        let mut state = State::new(0);
        state.update_collected(
            1,
            Snapshot {
                network: Some(NetworkStats {
                    upload_kbs: 5.0,
                    download_kbs: 5.0,
                    interface: "eno1".to_string(),
                }),
                ..Snapshot::default()
            },
        );
        metrics.update_from_state(&state);
        assert!(encoded(&metrics).contains("iface=\"eno1\""));

        state.update_collected(2, Snapshot::default());
        metrics.update_from_state(&state);
        assert!(!encoded(&metrics).contains("iface=\"eno1\""));
    }

    #[test]
    fn absent_readings_are_not_exported_as_zero() {
        let metrics = Metrics::new().expect("metrics init");
        let mut state = State::new(0);
        state.update_collected(
            1,
            Snapshot {
                cpu_package_temp: Some(48.0),
                gpu: GpuStats {
                    temp: Some(0),
                    ..GpuStats::default()
                },
                ..Snapshot::default()
            },
        );
        metrics.update_from_state(&state);
        let text = encoded(&metrics);
        assert!(text.contains("sysmond_cpu_package_temperature_celsius 48"));
        assert!(text.contains("sysmond_gpu_temperature_celsius 0"));
        assert!(!has_series(&text, "sysmond_gpu_power_draw_watts"));
        assert!(!has_series(&text, "sysmond_disk_usage_percent"));

        state.update_collected(2, Snapshot::default());
        metrics.update_from_state(&state);
        let text = encoded(&metrics);
        assert!(!has_series(&text, "sysmond_cpu_package_temperature_celsius"));
        assert!(!has_series(&text, "sysmond_gpu_temperature_celsius"));
        assert!(text.contains("sysmond_cuda_available 0"));
    }

    #[test]
    fn collect_errors_are_counted_per_probe() {
        let metrics = Metrics::new().expect("metrics init");
        metrics.inc_collect_error("gpu");
        metrics.inc_collect_error("gpu");
        assert!(encoded(&metrics).contains("sysmond_collect_errors_total{probe=\"gpu\"} 2"));
    }
}
