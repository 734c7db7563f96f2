use crate::collectors::command::ProbeError;
use crate::state::{percent, DiskIoStats, DiskUsageStats, MemoryStats};
use std::fs;
use std::path::Path;
use sysinfo::{System, SystemExt};

const SECTOR_SIZE: u64 = 512;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const SYS_BLOCK: &str = "/sys/block";

pub fn collect_memory(system: &System) -> Option<MemoryStats> {
    let total = system.total_memory();
    if total == 0 {
        return None;
    }
    let available = system.available_memory();
    Some(MemoryStats {
        total,
        used: system.used_memory(),
        available,
        percent: percent(total.saturating_sub(available), total),
    })
}

/// Usage of the filesystem holding `path`, read with `statvfs` on the path itself.
#[cfg(unix)]
pub fn collect_disk_usage(path: &Path) -> Result<DiskUsageStats, ProbeError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let io_error = |source: std::io::Error| ProbeError::Io {
        path: path.display().to_string(),
        source,
    };
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io_error(std::io::Error::new(std::io::ErrorKind::InvalidInput, err)))?;

    // SAFETY: `c_path` is NUL-terminated and `stat` is a plain C struct written by the call.
    let stat = unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(io_error(std::io::Error::last_os_error()));
        }
        stat
    };

    usage_from_blocks(
        stat.f_frsize as u64,
        stat.f_blocks as u64,
        stat.f_bfree as u64,
        stat.f_bavail as u64,
    )
    .ok_or_else(|| ProbeError::Parse(format!("{} reports zero size", path.display())))
}

#[cfg(not(unix))]
pub fn collect_disk_usage(path: &Path) -> Result<DiskUsageStats, ProbeError> {
    Err(ProbeError::Parse(format!(
        "filesystem usage for {} is only supported on unix",
        path.display()
    )))
}

/// Blocks reserved for root count neither as used nor as free, so the percentage is
/// taken over `used + free` and rounded to one decimal.
pub fn usage_from_blocks(
    fragment_size: u64,
    blocks: u64,
    free_blocks: u64,
    available_blocks: u64,
) -> Option<DiskUsageStats> {
    let total = blocks.saturating_mul(fragment_size);
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(free_blocks.saturating_mul(fragment_size));
    let free = available_blocks.saturating_mul(fragment_size);
    let percent = (percent(used, used.saturating_add(free)) * 10.0).round() / 10.0;
    Some(DiskUsageStats {
        total,
        used,
        free,
        percent,
    })
}

pub fn read_disk_io(path: &Path) -> Result<DiskIoStats, ProbeError> {
    let content = fs::read_to_string(path).map_err(|source| ProbeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    disk_io_from_diskstats(&content, |device| Path::new(SYS_BLOCK).join(device).exists())
        .ok_or_else(|| ProbeError::Parse(format!("no disks in {}", path.display())))
}

pub fn disk_io_from_diskstats(
    content: &str,
    is_whole_disk: impl Fn(&str) -> bool,
) -> Option<DiskIoStats> {
    let (read_bytes, write_bytes) = sum_diskstats(content, is_whole_disk)?;
    Some(DiskIoStats {
        read_mb: read_bytes as f64 / BYTES_PER_MB,
        write_mb: write_bytes as f64 / BYTES_PER_MB,
    })
}

/// Sums read/written bytes over whole disks in /proc/diskstats text.
/// Partitions are left out by `is_whole_disk` so their traffic is not counted twice.
pub fn sum_diskstats(content: &str, is_whole_disk: impl Fn(&str) -> bool) -> Option<(u64, u64)> {
    let mut found = false;
    let mut read_bytes = 0_u64;
    let mut write_bytes = 0_u64;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue;
        }

        let device = parts[2];
        if device.starts_with("loop") || device.starts_with("ram") || !is_whole_disk(device) {
            continue;
        }

        let (Ok(sectors_read), Ok(sectors_written)) =
            (parts[5].parse::<u64>(), parts[9].parse::<u64>())
        else {
            continue;
        };

        found = true;
        read_bytes = read_bytes.saturating_add(sectors_read.saturating_mul(SECTOR_SIZE));
        write_bytes = write_bytes.saturating_add(sectors_written.saturating_mul(SECTOR_SIZE));
    }

    found.then_some((read_bytes, write_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DISKSTATS: &str = "\
   7       0 loop0 100 0 2048 10 0 0 0 0 0 10 10 0 0 0 0
   8       0 sda 5000 100 2048 300 4000 50 4096 200 0 500 500 0 0 0 0
   8       1 sda1 4000 90 2000 250 3900 40 4000 190 0 450 450 0 0 0 0
 259       0 nvme0n1 1 0 1024 1 1 0 2048 1 0 1 1 0 0 0 0
 259       1 nvme0n1p1 bogus line
";

    fn whole_disk(device: &str) -> bool {
        matches!(device, "sda" | "nvme0n1" | "loop0")
    }

    #[test]
    fn diskstats_sums_whole_disks_only() {
        let (read, write) = sum_diskstats(DISKSTATS, whole_disk).expect("disks present");
        assert_eq!(read, (2048 + 1024) * 512);
        assert_eq!(write, (4096 + 2048) * 512);
    }

    #[test]
    fn diskstats_without_disks_is_none() {
        assert_eq!(sum_diskstats("", whole_disk), None);
        assert_eq!(sum_diskstats(DISKSTATS, |_| false), None);
    }

    #[test]
    fn disk_io_reports_cumulative_megabytes() {
        // sda: 2048 + nvme0n1: 1024 sectors read, 4096 + 2048 written
        let io = disk_io_from_diskstats(DISKSTATS, whole_disk).expect("disks present");
        assert_eq!(io.read_mb, 1.5);
        assert_eq!(io.write_mb, 3.0);
    }

    #[test]
    fn unreadable_diskstats_is_an_error() {
        let err = read_disk_io(Path::new("/nonexistent/sysmond/diskstats")).expect_err("missing");
        assert!(matches!(err, ProbeError::Io { .. }));

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "garbage").expect("write diskstats");
        assert!(matches!(read_disk_io(file.path()), Err(ProbeError::Parse(_))));
    }

    #[test]
    fn usage_excludes_reserved_blocks() {
        // 1000 blocks of 4 KiB: 400 free, of which 50 are reserved for root
        let usage = usage_from_blocks(4096, 1000, 400, 350).expect("non-empty filesystem");
        assert_eq!(
            usage,
            DiskUsageStats {
                total: 4_096_000,
                used: 2_457_600,
                free: 1_433_600,
                percent: 63.2,
            }
        );
    }

    #[test]
    fn usage_of_empty_filesystem_is_zero_percent() {
        let usage = usage_from_blocks(4096, 100, 100, 100).expect("non-empty filesystem");
        assert_eq!(usage.used, 0);
        assert_eq!(usage.percent, 0.0);
        assert_eq!(usage_from_blocks(4096, 0, 0, 0), None);
    }

    #[cfg(unix)]
    #[test]
    fn missing_disk_path_is_an_error() {
        let err = collect_disk_usage(Path::new("/nonexistent-sysmond-mount")).expect_err("missing");
        assert!(matches!(err, ProbeError::Io { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn usage_reports_the_filesystem_of_the_path_itself() {
        use std::os::unix::fs::MetadataExt;

        // /dev/shm is a tmpfs that the root filesystem figures must not leak into
        let shm = Path::new("/dev/shm");
        let root = Path::new("/");
        let (Ok(shm_usage), Ok(root_usage)) = (collect_disk_usage(shm), collect_disk_usage(root))
        else {
            return;
        };
        let shm_meta = fs::metadata(shm).expect("shm metadata");
        let root_meta = fs::metadata(root).expect("root metadata");
        if shm_meta.dev() != root_meta.dev() {
            assert_ne!(shm_usage.total, root_usage.total);
        }
        assert!(shm_usage.used <= shm_usage.total);
        assert!((0.0..=100.0).contains(&shm_usage.percent));
    }

    #[cfg(unix)]
    #[test]
    fn usage_is_stable_for_static_filesystem() {
        let first = collect_disk_usage(Path::new("/")).expect("root usage");
        let second = collect_disk_usage(Path::new("/")).expect("root usage");
        assert_eq!(first.total, second.total);
    }

    #[test]
    fn memory_from_live_system() {
        let mut system = System::new();
        system.refresh_memory();
        if let Some(mem) = collect_memory(&system) {
            assert!(mem.total > 0);
            assert!(mem.available <= mem.total);
            assert!((0.0..=100.0).contains(&mem.percent));
        }
    }
}
