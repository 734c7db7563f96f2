use crate::state::NetworkStats;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use sysinfo::{NetworkExt, NetworksExt, System, SystemExt};

const LOOPBACK: &str = "lo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

#[derive(Debug, Clone)]
struct NetSample {
    interface: String,
    counters: NetCounters,
    at: Instant,
}

/// Previous counter sample for one interface. Empty until the first successful read.
#[derive(Debug, Default)]
pub struct NetRateTracker {
    prev: Option<NetSample>,
}

impl NetRateTracker {
    /// Rate since the stored sample in KB/s, then remembers `counters` for the next call.
    /// Without a usable prior sample (first call, interface switch, clock not advanced)
    /// both rates are zero.
    pub fn observe(&mut self, interface: &str, counters: NetCounters, at: Instant) -> NetworkStats {
        let (upload_kbs, download_kbs) = match &self.prev {
            Some(prev) if prev.interface == interface => {
                let elapsed = at
                    .checked_duration_since(prev.at)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                if elapsed > 0.0 {
                    (
                        kb_per_sec(prev.counters.bytes_sent, counters.bytes_sent, elapsed),
                        kb_per_sec(prev.counters.bytes_recv, counters.bytes_recv, elapsed),
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            _ => (0.0, 0.0),
        };

        self.prev = Some(NetSample {
            interface: interface.to_string(),
            counters,
            at,
        });

        NetworkStats {
            upload_kbs,
            download_kbs,
            interface: interface.to_string(),
        }
    }
}

fn kb_per_sec(prev: u64, current: u64, elapsed_secs: f64) -> f64 {
    // counters reset on interface restart; never report a negative rate
    current.saturating_sub(prev) as f64 / elapsed_secs / 1024.0
}

/// The configured interface if present, otherwise the first non-loopback one by name.
pub fn select_interface<'a>(
    counters: &'a BTreeMap<String, NetCounters>,
    preferred: &str,
) -> Option<(&'a str, NetCounters)> {
    if let Some((name, c)) = counters.get_key_value(preferred) {
        return Some((name.as_str(), *c));
    }
    counters
        .iter()
        .find(|(name, _)| name.as_str() != LOOPBACK)
        .map(|(name, c)| (name.as_str(), *c))
}

pub fn read_counters(system: &System) -> BTreeMap<String, NetCounters> {
    system
        .networks()
        .iter()
        .map(|(iface, data)| {
            (
                iface.to_string(),
                NetCounters {
                    bytes_sent: data.total_transmitted(),
                    bytes_recv: data.total_received(),
                },
            )
        })
        .collect()
}

pub struct NetworkProbe {
    interface: String,
    tracker: Mutex<NetRateTracker>,
}

impl NetworkProbe {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            tracker: Mutex::new(NetRateTracker::default()),
        }
    }

    /// `None` when no interface qualifies; the stored sample is then left untouched.
    pub fn sample(
        &self,
        counters: &BTreeMap<String, NetCounters>,
        at: Instant,
    ) -> Option<NetworkStats> {
        let (interface, current) = select_interface(counters, &self.interface)?;
        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        Some(tracker.observe(interface, current, at))
    }
}
