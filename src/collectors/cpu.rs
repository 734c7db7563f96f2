use crate::collectors::command::{CommandRunner, ProbeError};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use sysinfo::{CpuExt, System, SystemExt};

const DEGREE_MARKER: &str = "°C";

/// Per-logical-thread usage since the previous refresh. The very first call reports zeros.
pub fn collect_cpu_percents(system: &System) -> Vec<f64> {
    system
        .cpus()
        .iter()
        .map(|c| c.cpu_usage() as f64)
        .collect()
}

pub fn read_cpu_freqs(path: &Path) -> Result<Vec<f64>, ProbeError> {
    let text = fs::read_to_string(path).map_err(|source| ProbeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_cpu_freqs(&text))
}

/// Collects every `cpu MHz : <value>` entry in order, skipping lines that do not parse.
pub fn parse_cpu_freqs(text: &str) -> Vec<f64> {
    text.lines()
        .filter(|line| line.contains("cpu MHz"))
        .filter_map(|line| {
            let (_, value) = line.split_once(':')?;
            value.trim().parse::<f64>().ok()
        })
        .collect()
}

pub async fn collect_core_temps(
    runner: &dyn CommandRunner,
    program: &str,
    timeout: Duration,
) -> Result<BTreeMap<u32, f64>, ProbeError> {
    let output = runner.run(program, &[], timeout).await?;
    Ok(parse_core_temps(&output))
}

/// Parses `Core N: +NN.N°C ...` lines from the sensors report into core id -> Celsius.
pub fn parse_core_temps(text: &str) -> BTreeMap<u32, f64> {
    text.lines()
        .filter(|line| line.contains("Core") && line.contains(DEGREE_MARKER))
        .filter_map(parse_core_temp_line)
        .collect()
}

fn parse_core_temp_line(line: &str) -> Option<(u32, f64)> {
    let (label, rest) = line.split_once(':')?;
    let core = label.trim().strip_prefix("Core")?.trim().parse::<u32>().ok()?;
    let (reading, _) = rest.split_once(DEGREE_MARKER)?;
    let celsius = reading.trim().trim_start_matches('+').parse::<f64>().ok()?;
    Some((core, celsius))
}

pub fn read_package_temp(path: &Path) -> Result<f64, ProbeError> {
    let raw = fs::read_to_string(path).map_err(|source| ProbeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let millidegrees = raw
        .trim()
        .parse::<i64>()
        .map_err(|err| ProbeError::Parse(format!("{}: {err}", path.display())))?;
    Ok(millidegrees as f64 / 1000.0)
}
