use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Nearest-rank percentile, `pct` in 0..=100.
pub(crate) fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

/// Process-wide metrics sampled by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMetric {
    CpuPercent,
    ResidentMemoryMb,
    MemoryPercent,
    ThreadCount,
    ErrorRate,
    QueueDepth,
}

impl SystemMetric {
    pub const ALL: [SystemMetric; 6] = [
        SystemMetric::CpuPercent,
        SystemMetric::ResidentMemoryMb,
        SystemMetric::MemoryPercent,
        SystemMetric::ThreadCount,
        SystemMetric::ErrorRate,
        SystemMetric::QueueDepth,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SystemMetric::CpuPercent => "cpu_percent",
            SystemMetric::ResidentMemoryMb => "resident_memory_mb",
            SystemMetric::MemoryPercent => "memory_percent",
            SystemMetric::ThreadCount => "thread_count",
            SystemMetric::ErrorRate => "error_rate",
            SystemMetric::QueueDepth => "queue_depth",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricSummary {
    pub count: usize,
    pub latest: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
}

/// Bounded sample history per metric; the oldest sample is evicted first.
///
/// Each metric's buffer is locked independently.
pub struct MetricHistory {
    capacity: usize,
    buffers: DashMap<SystemMetric, Mutex<VecDeque<MetricSample>>>,
}

impl MetricHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: DashMap::new(),
        }
    }

    pub fn record(&self, metric: SystemMetric, value: f64) {
        self.record_labeled(metric, value, BTreeMap::new());
    }

    pub fn record_labeled(&self, metric: SystemMetric, value: f64, labels: BTreeMap<String, String>) {
        let sample = MetricSample {
            timestamp: Utc::now(),
            value,
            labels,
        };
        let buffer = self
            .buffers
            .entry(metric)
            .or_insert_with(|| Mutex::new(VecDeque::with_capacity(self.capacity)));
        let mut buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(sample);
    }

    fn values(&self, metric: SystemMetric) -> Vec<f64> {
        self.buffers
            .get(&metric)
            .map(|buffer| {
                let buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
                buf.iter().map(|s| s.value).collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, metric: SystemMetric) -> usize {
        self.buffers
            .get(&metric)
            .map(|buffer| {
                let buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
                buf.len()
            })
            .unwrap_or(0)
    }

    pub fn latest(&self, metric: SystemMetric) -> Option<MetricSample> {
        let buffer = self.buffers.get(&metric)?;
        let buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
        let latest = buf.back().cloned();
        latest
    }

    pub fn percentile(&self, metric: SystemMetric, pct: f64) -> Option<f64> {
        percentile(&self.values(metric), pct)
    }

    pub fn summary(&self, metric: SystemMetric) -> Option<MetricSummary> {
        let values = self.values(metric);
        let latest = *values.last()?;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        Some(MetricSummary {
            count: values.len(),
            latest,
            min,
            max,
            avg,
            p50: percentile(&values, 50.0).unwrap_or(latest),
            p95: percentile(&values, 95.0).unwrap_or(latest),
        })
    }
}

/// One reading of process resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub cpu_percent: f64,
    pub resident_memory_mb: f64,
    /// Resident memory as a share of physical memory.
    pub memory_percent: f64,
    pub thread_count: usize,
}

pub trait SystemProbe: Send + Sync {
    fn sample(&self) -> SystemSnapshot;
}

/// sysinfo-backed probe for the current process.
pub struct SysinfoProbe {
    system: Mutex<sysinfo::System>,
    pid: Option<sysinfo::Pid>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SystemProbe for SysinfoProbe {
    fn sample(&self) -> SystemSnapshot {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();
        let total = system.total_memory();

        let (cpu_percent, rss) = match self.pid {
            Some(pid) if system.refresh_process(pid) => system
                .process(pid)
                .map(|p| (p.cpu_usage() as f64, p.memory()))
                .unwrap_or((0.0, 0)),
            _ => (0.0, 0),
        };

        SystemSnapshot {
            cpu_percent,
            resident_memory_mb: rss as f64 / (1024.0 * 1024.0),
            memory_percent: if total == 0 {
                0.0
            } else {
                rss as f64 / total as f64 * 100.0
            },
            thread_count: thread_count(),
        }
    }
}

fn thread_count() -> usize {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| crate::memory::parse_status_kb(&status, "Threads:"))
            .map(|n| n as usize)
            .unwrap_or(1)
    }

    #[cfg(not(target_os = "linux"))]
    {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 50.0), Some(50.0));
        assert_eq!(percentile(&values, 95.0), Some(95.0));
        assert_eq!(percentile(&values, 100.0), Some(100.0));
        assert_eq!(percentile(&[7.0], 95.0), Some(7.0));
        assert_eq!(percentile(&[], 95.0), None);
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let history = MetricHistory::new(3);
        for v in 1..=5 {
            history.record(SystemMetric::CpuPercent, v as f64);
        }
        assert_eq!(history.len(SystemMetric::CpuPercent), 3);
        let summary = history.summary(SystemMetric::CpuPercent).unwrap();
        assert_eq!(summary.min, 3.0);
        assert_eq!(summary.max, 5.0);
        assert_eq!(summary.latest, 5.0);
        assert_eq!(summary.avg, 4.0);
        assert_eq!(summary.p50, 4.0);
    }

    #[test]
    fn test_metrics_are_independent() {
        let history = MetricHistory::new(10);
        history.record(SystemMetric::ErrorRate, 0.5);
        assert_eq!(history.len(SystemMetric::ErrorRate), 1);
        assert_eq!(history.len(SystemMetric::QueueDepth), 0);
        assert!(history.summary(SystemMetric::QueueDepth).is_none());
        assert_eq!(history.latest(SystemMetric::ErrorRate).unwrap().value, 0.5);
    }

    #[test]
    fn test_labels_are_kept() {
        let history = MetricHistory::new(10);
        let labels = BTreeMap::from([("session".to_string(), "s1".to_string())]);
        history.record_labeled(SystemMetric::QueueDepth, 3.0, labels);
        let sample = history.latest(SystemMetric::QueueDepth).unwrap();
        assert_eq!(sample.labels.get("session").map(String::as_str), Some("s1"));
    }

    #[test]
    fn test_sysinfo_probe_reads_something() {
        let snapshot = SysinfoProbe::new().sample();
        assert!(snapshot.thread_count >= 1);
        assert!(snapshot.memory_percent >= 0.0);
    }
}
