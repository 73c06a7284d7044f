//! Host collectors backed by `sysinfo`
//!
//! These are what the `pulse-relay` binary registers. Each source keeps its
//! own `System` handle so CPU usage is measured between two consecutive
//! polls.

use std::collections::HashMap;

use serde::Deserialize;
use sysinfo::{Disks, System};
use tracing::warn;

use super::{Collector, Readings, adaptor, point, set};

/// Where a configured collector takes its readings from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Global CPU usage in percent
    Cpu,
    /// Memory `used`, `total` (bytes) and `percent`
    Ram,
    /// Swap `used`, `total` (bytes) and `percent`
    Swap,
    /// Disk `used`, `total` (bytes) and `percent` across all mounts
    Disk,
    /// Uniform random value in `[0, 1)`, for exercising a deployment
    Random,
}

/// Optional smoothing applied to point sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Smoothing {
    Average,
    RunningAverage { window: usize },
    MutedAverage { window: usize },
}

impl Source {
    /// Whether the source yields a single reading (and can be smoothed)
    pub fn is_point(&self) -> bool {
        matches!(self, Source::Cpu | Source::Random)
    }

    /// Build a collector for this source.
    pub fn collector(self, smoothing: Option<Smoothing>) -> Box<dyn Collector> {
        match self {
            Source::Cpu => smoothed(cpu_usage(), smoothing),
            Source::Random => smoothed(rand::random::<f64>, smoothing),
            other => {
                if smoothing.is_some() {
                    warn!("smoothing is only supported on point sources, ignoring it for {other:?}");
                }
                match other {
                    Source::Ram => set(memory_usage()),
                    Source::Swap => set(swap_usage()),
                    _ => set(disk_usage),
                }
            }
        }
    }
}

fn smoothed<F>(sample: F, smoothing: Option<Smoothing>) -> Box<dyn Collector>
where
    F: FnMut() -> f64 + Send + 'static,
{
    match smoothing {
        None => point(sample),
        Some(Smoothing::Average) => point(adaptor::average(sample)),
        Some(Smoothing::RunningAverage { window }) => {
            point(adaptor::running_average(sample, window))
        }
        Some(Smoothing::MutedAverage { window }) => point(adaptor::muted_average(sample, window)),
    }
}

fn cpu_usage() -> impl FnMut() -> f64 + Send + 'static {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    move || {
        sys.refresh_cpu_usage();
        sys.global_cpu_usage() as f64
    }
}

fn memory_usage() -> impl FnMut() -> Readings + Send + 'static {
    let mut sys = System::new();
    move || {
        sys.refresh_memory();
        usage(sys.used_memory(), sys.total_memory())
    }
}

fn swap_usage() -> impl FnMut() -> Readings + Send + 'static {
    let mut sys = System::new();
    move || {
        sys.refresh_memory();
        usage(sys.used_swap(), sys.total_swap())
    }
}

fn disk_usage() -> Readings {
    let disks = Disks::new_with_refreshed_list();
    let (used, total) = disks.list().iter().fold((0u64, 0u64), |(used, total), disk| {
        (
            used + disk.total_space().saturating_sub(disk.available_space()),
            total + disk.total_space(),
        )
    });
    usage(used, total)
}

fn usage(used: u64, total: u64) -> Readings {
    let percent = if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    };

    HashMap::from([
        ("used".to_string(), used as f64),
        ("total".to_string(), total as f64),
        ("percent".to_string(), percent),
    ])
}
