use crate::collectors::command::{CommandRunner, ProbeError};
use crate::state::GpuStats;
use std::time::Duration;
use tracing::debug;

const CSV_FORMAT: &str = "--format=csv,noheader,nounits";
const TEMP_QUERY: &str = "--query-gpu=temperature.gpu";
const POWER_QUERY: &str = "--query-gpu=power.draw,power.limit";
const MEMORY_QUERY: &str = "--query-gpu=memory.used,memory.total";

/// Runs the three GPU queries concurrently. Each one only fills its own fields.
pub async fn collect_gpu_stats(
    runner: &dyn CommandRunner,
    program: &str,
    timeout: Duration,
) -> GpuStats {
    let (temp, power, memory) = tokio::join!(
        run_query(runner, program, TEMP_QUERY, timeout),
        run_query(runner, program, POWER_QUERY, timeout),
        run_query(runner, program, MEMORY_QUERY, timeout),
    );

    let mut stats = GpuStats::default();

    match temp {
        Ok(fields) => stats.temp = fields.first().and_then(|v| v.parse::<i64>().ok()),
        Err(err) => debug!(query = "temperature", error = %err, "gpu query failed"),
    }
    match power {
        Ok(fields) => {
            stats.power_draw = fields.first().and_then(|v| v.parse::<f64>().ok());
            stats.power_limit = fields.get(1).and_then(|v| v.parse::<f64>().ok());
        }
        Err(err) => debug!(query = "power", error = %err, "gpu query failed"),
    }
    match memory {
        Ok(fields) => {
            stats.mem_used = fields.first().and_then(|v| v.parse::<u64>().ok());
            stats.mem_total = fields.get(1).and_then(|v| v.parse::<u64>().ok());
        }
        Err(err) => debug!(query = "memory", error = %err, "gpu query failed"),
    }

    stats
}

async fn run_query(
    runner: &dyn CommandRunner,
    program: &str,
    query: &str,
    timeout: Duration,
) -> Result<Vec<String>, ProbeError> {
    let output = runner.run(program, &[query, CSV_FORMAT], timeout).await?;
    split_first_row(&output)
        .ok_or_else(|| ProbeError::Parse(format!("empty {program} output for {query}")))
}

/// First non-empty line of CSV output, split into trimmed fields. Only the first GPU is reported.
fn split_first_row(output: &str) -> Option<Vec<String>> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    Some(line.split(',').map(|v| v.trim().to_string()).collect())
}

pub fn cuda_available(library: &str) -> bool {
    match cuda_device_count(library) {
        Ok(count) => count > 0,
        Err(err) => {
            debug!(error = %err, "cuda runtime unavailable");
            false
        }
    }
}

#[cfg(unix)]
pub fn cuda_device_count(library: &str) -> Result<i32, ProbeError> {
    use std::ffi::{CStr, CString};
    use std::os::raw::{c_char, c_int};

    type GetDeviceCount = unsafe extern "C" fn(*mut c_int) -> c_int;

    let lib_error = |reason: String| ProbeError::Library {
        library: library.to_string(),
        reason,
    };
    let name = CString::new(library).map_err(|err| lib_error(err.to_string()))?;

    // SAFETY: dlopen/dlsym receive NUL-terminated strings; the symbol is only called when
    // non-null and has the cudaGetDeviceCount(int*) -> cudaError_t signature.
    unsafe {
        let handle = libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL);
        if handle.is_null() {
            let reason = libc::dlerror();
            let reason = if reason.is_null() {
                "dlopen failed".to_string()
            } else {
                CStr::from_ptr(reason).to_string_lossy().into_owned()
            };
            return Err(lib_error(reason));
        }

        // The handle is kept open: cudart installs process exit hooks.
        let symbol = libc::dlsym(
            handle,
            b"cudaGetDeviceCount\0".as_ptr() as *const c_char,
        );
        if symbol.is_null() {
            return Err(lib_error("cudaGetDeviceCount not exported".to_string()));
        }

        let get_device_count: GetDeviceCount = std::mem::transmute(symbol);
        let mut count: c_int = 0;
        let rc = get_device_count(&mut count);
        if rc != 0 {
            return Err(lib_error(format!("cudaGetDeviceCount returned {rc}")));
        }
        Ok(count)
    }
}

#[cfg(not(unix))]
pub fn cuda_device_count(library: &str) -> Result<i32, ProbeError> {
    Err(ProbeError::Library {
        library: library.to_string(),
        reason: "dynamic loading is only supported on unix".to_string(),
    })
}
