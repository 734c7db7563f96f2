pub mod command;
pub mod cpu;
pub mod gpu;
pub mod network;
pub mod system;

use crate::collectors::command::{CommandRunner, ProbeError};
use crate::collectors::network::{NetCounters, NetworkProbe};
use crate::config::Config;
use crate::state::{MemoryStats, Snapshot};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use sysinfo::{System, SystemExt};
use tracing::debug;

/// Everything read from the shared `sysinfo::System` in one refresh.
struct SystemSample {
    cpu_percents: Vec<f64>,
    memory: Option<MemoryStats>,
    net_counters: BTreeMap<String, NetCounters>,
}

pub struct Collector {
    system: Mutex<System>,
    runner: Arc<dyn CommandRunner>,
    network: NetworkProbe,
    disk_path: PathBuf,
    command_timeout: Duration,
    sensors_command: String,
    gpu_command: String,
    cuda_library: String,
    cpuinfo_path: PathBuf,
    package_temp_path: PathBuf,
    diskstats_path: PathBuf,
}

impl Collector {
    pub fn new(cfg: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        let mut system = System::new();
        system.refresh_networks_list();
        Self {
            system: Mutex::new(system),
            runner,
            network: NetworkProbe::new(cfg.net_interface.clone()),
            disk_path: PathBuf::from(&cfg.disk_path),
            command_timeout: cfg.probes.command_timeout(),
            sensors_command: cfg.probes.sensors_command.clone(),
            gpu_command: cfg.probes.gpu_command.clone(),
            cuda_library: cfg.probes.cuda_library.clone(),
            cpuinfo_path: PathBuf::from(&cfg.probes.cpuinfo_path),
            package_temp_path: PathBuf::from(&cfg.probes.package_temp_path),
            diskstats_path: PathBuf::from(&cfg.probes.diskstats_path),
        }
    }

    /// Builds one snapshot. Never fails: a probe that errors only leaves its own field empty.
    /// Must not be called concurrently with itself, the network rate depends on call order.
    pub async fn collect(&self) -> Snapshot {
        let sample = self.sample_system();
        let network = self.network.sample(&sample.net_counters, Instant::now());

        let cuda_library = self.cuda_library.clone();
        let (cpu_temps, gpu, cuda_available) = tokio::join!(
            cpu::collect_core_temps(
                self.runner.as_ref(),
                &self.sensors_command,
                self.command_timeout
            ),
            gpu::collect_gpu_stats(self.runner.as_ref(), &self.gpu_command, self.command_timeout),
            run_blocking_bounded("cuda", self.command_timeout, move || {
                gpu::cuda_available(&cuda_library)
            }),
        );

        Snapshot {
            cpu_percents: sample.cpu_percents,
            cpu_freqs: absent_on_error("cpu_freq", cpu::read_cpu_freqs(&self.cpuinfo_path))
                .unwrap_or_default(),
            cpu_temps: absent_on_error("cpu_temp", cpu_temps).unwrap_or_default(),
            cpu_package_temp: absent_on_error(
                "cpu_package_temp",
                cpu::read_package_temp(&self.package_temp_path),
            ),
            gpu,
            cuda_available: cuda_available.unwrap_or(false),
            memory: sample.memory,
            disk_io: absent_on_error("disk_io", system::read_disk_io(&self.diskstats_path)),
            disk_usage: absent_on_error(
                "disk_usage",
                system::collect_disk_usage(&self.disk_path),
            ),
            network,
        }
    }

    fn sample_system(&self) -> SystemSample {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_networks_list();
        system.refresh_networks();

        SystemSample {
            cpu_percents: cpu::collect_cpu_percents(&system),
            memory: system::collect_memory(&system),
            net_counters: network::read_counters(&system),
        }
    }
}

/// Runs `probe` on the blocking pool. A probe still running after `timeout` is abandoned
/// and counts as absent; its thread finishes in the background.
async fn run_blocking_bounded<T, F>(name: &'static str, timeout: Duration, probe: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(probe)).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            debug!(probe = name, error = %err, "probe task failed");
            None
        }
        Err(_) => {
            debug!(
                probe = name,
                timeout_ms = timeout.as_millis() as u64,
                "probe timed out"
            );
            None
        }
    }
}

fn absent_on_error<T>(probe: &'static str, result: Result<T, ProbeError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(probe, error = %err, "probe yielded nothing");
            None
        }
    }
}

/// Names of probes that contributed nothing to `snapshot`.
pub fn empty_probes(snapshot: &Snapshot) -> BTreeSet<&'static str> {
    let checks = [
        ("cpu_percent", snapshot.cpu_percents.is_empty()),
        ("cpu_freq", snapshot.cpu_freqs.is_empty()),
        ("cpu_temp", snapshot.cpu_temps.is_empty()),
        ("cpu_package_temp", snapshot.cpu_package_temp.is_none()),
        ("gpu", snapshot.gpu.is_empty()),
        ("cuda", !snapshot.cuda_available),
        ("memory", snapshot.memory.is_none()),
        ("disk_io", snapshot.disk_io.is_none()),
        ("disk_usage", snapshot.disk_usage.is_none()),
        ("network", snapshot.network.is_none()),
    ];
    checks
        .into_iter()
        .filter(|(_, empty)| *empty)
        .map(|(name, _)| name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::command::fake::FakeRunner;
    use crate::config::test_config;
    use std::io::Write;

    fn broken_config() -> Config {
        let mut cfg = test_config();
        cfg.disk_path = "/nonexistent-sysmond-mount".to_string();
        cfg.probes.cuda_library = "libsysmond-no-such-cudart.so".to_string();
        cfg.probes.cpuinfo_path = "/nonexistent/sysmond/cpuinfo".to_string();
        cfg.probes.package_temp_path = "/nonexistent/sysmond/temp".to_string();
        cfg.probes.diskstats_path = "/nonexistent/sysmond/diskstats".to_string();
        cfg
    }

    #[tokio::test]
    async fn failing_probes_leave_other_fields_intact() {
        let mut cpuinfo = tempfile::NamedTempFile::new().expect("temp file");
        write!(cpuinfo, "cpu MHz\t\t: 2100.000\ncpu MHz\t\t: 2200.000\n").expect("write cpuinfo");

        let mut cfg = broken_config();
        cfg.probes.cpuinfo_path = cpuinfo.path().display().to_string();

        let runner = FakeRunner::default()
            .reply(
                "nvidia-smi --query-gpu=temperature.gpu --format=csv,noheader,nounits",
                "64\n",
            )
            .fail("nvidia-smi --query-gpu=power.draw,power.limit --format=csv,noheader,nounits");
        let collector = Collector::new(&cfg, Arc::new(runner));

        let snapshot = collector.collect().await;
        assert_eq!(snapshot.cpu_freqs, vec![2100.0, 2200.0]);
        assert!(snapshot.cpu_temps.is_empty());
        assert_eq!(snapshot.cpu_package_temp, None);
        assert_eq!(snapshot.gpu.temp, Some(64));
        assert_eq!(snapshot.gpu.power_draw, None);
        assert_eq!(snapshot.gpu.mem_total, None);
        assert!(!snapshot.cuda_available);
        assert_eq!(snapshot.disk_io, None);
        assert_eq!(snapshot.disk_usage, None);
    }

    #[tokio::test]
    async fn sensor_output_reaches_snapshot() {
        let runner = FakeRunner::default().reply("sensors", "Core 1: +50.0°C  (high = +80.0°C)\n");
        let collector = Collector::new(&broken_config(), Arc::new(runner));

        let snapshot = collector.collect().await;
        assert_eq!(snapshot.cpu_temps, BTreeMap::from([(1, 50.0)]));
        assert!(snapshot.cpu_freqs.is_empty());
        assert!(snapshot.gpu.is_empty());
    }

    #[tokio::test]
    async fn repeated_collection_keeps_network_interface() {
        let collector = Collector::new(&broken_config(), Arc::new(FakeRunner::default()));
        let first = collector.collect().await;
        let second = collector.collect().await;
        if let (Some(a), Some(b)) = (first.network, second.network) {
            assert_eq!(a.interface, b.interface);
            assert_eq!(a.upload_kbs, 0.0);
            assert!(b.upload_kbs >= 0.0 && b.download_kbs >= 0.0);
        }
    }

    #[tokio::test]
    async fn stuck_blocking_probe_is_abandoned_after_timeout() {
        let started = Instant::now();
        let result = run_blocking_bounded("cuda", Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_secs(1));
            true
        })
        .await;
        assert_eq!(result, None);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn fast_blocking_probe_returns_value() {
        let result = run_blocking_bounded("cuda", Duration::from_secs(2), || true).await;
        assert_eq!(result, Some(true));
    }

    #[test]
    fn empty_probes_lists_missing_fields() {
        let empty = empty_probes(&Snapshot::default());
        assert_eq!(empty.len(), 10);

        let snapshot = Snapshot {
            cpu_percents: vec![1.0],
            cuda_available: true,
            ..Snapshot::default()
        };
        let empty = empty_probes(&snapshot);
        assert!(!empty.contains("cpu_percent"));
        assert!(!empty.contains("cuda"));
        assert!(empty.contains("network"));
    }
}
