use std::collections::VecDeque;
use std::path::PathBuf;

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    MemoryLeak,
    HighMemory,
    HighCpu,
    LowDisk,
    ThreadLeak,
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: IssueSeverity,
    pub description: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub timestamp_secs: i64,
    pub memory_rss_bytes: u64,
    pub memory_percent: f64,
    pub cpu_process_percent: f64,
    pub cpu_system_percent: f64,
    pub thread_count: usize,
}

#[derive(Debug, Clone)]
pub struct ResourceThresholds {
    pub leak_threshold_mb_per_hour: f64,
    pub high_memory_threshold: f64,
    pub high_cpu_threshold: f64,
    pub low_disk_threshold: f64,
    pub thread_leak_threshold: usize,
    pub monitored_paths: Vec<PathBuf>,
    pub max_history: usize,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            leak_threshold_mb_per_hour: 50.0,
            high_memory_threshold: 85.0,
            high_cpu_threshold: 90.0,
            low_disk_threshold: 10.0,
            thread_leak_threshold: 500,
            monitored_paths: vec![PathBuf::from("/")],
            max_history: 1000,
        }
    }
}

/// Backend abstraction over process/system introspection so the analyzer's
/// detection rules run unchanged whether `resource-introspection` is on or
/// off (§4.7, Design Notes §9).
trait ResourceBackend: Send + Sync {
    fn sample(&mut self) -> ResourceSample;
    fn disk_free_percent(&self, path: &std::path::Path) -> Option<f64>;
}

#[cfg(feature = "resource-introspection")]
struct SysinfoBackend {
    system: sysinfo::System,
    pid: sysinfo::Pid,
    started_at: std::time::Instant,
}

#[cfg(feature = "resource-introspection")]
impl SysinfoBackend {
    fn new() -> Self {
        let mut system = sysinfo::System::new_all();
        system.refresh_all();
        let pid = sysinfo::get_current_pid().unwrap_or_else(|_| sysinfo::Pid::from(0));
        Self {
            system,
            pid,
            started_at: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "resource-introspection")]
impl ResourceBackend for SysinfoBackend {
    fn sample(&mut self) -> ResourceSample {
        self.system.refresh_all();
        let total_memory = self.system.total_memory().max(1);
        let (memory_rss_bytes, cpu_process_percent, thread_count) = self
            .system
            .process(self.pid)
            .map(|p| (p.memory(), p.cpu_usage() as f64, 1usize))
            .unwrap_or((0, 0.0, 1));

        let cpu_system_percent = self.system.global_cpu_usage() as f64;
        let memory_percent = (memory_rss_bytes as f64 / total_memory as f64) * 100.0;

        ResourceSample {
            timestamp_secs: self.started_at.elapsed().as_secs() as i64,
            memory_rss_bytes,
            memory_percent,
            cpu_process_percent,
            cpu_system_percent,
            thread_count,
        }
    }

    fn disk_free_percent(&self, path: &std::path::Path) -> Option<f64> {
        sysinfo::Disks::new_with_refreshed_list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| (d.available_space() as f64 / d.total_space().max(1) as f64) * 100.0)
    }
}

/// Degraded backend used when `resource-introspection` is disabled: reports
/// zeroed system figures so the growth-rate leak detector still has a
/// (flat) series to operate on, per Design Notes §9.
struct CounterOnlyBackend {
    started_at: std::time::Instant,
    samples_taken: u64,
}

impl CounterOnlyBackend {
    fn new() -> Self {
        Self {
            started_at: std::time::Instant::now(),
            samples_taken: 0,
        }
    }
}

impl ResourceBackend for CounterOnlyBackend {
    fn sample(&mut self) -> ResourceSample {
        self.samples_taken += 1;
        ResourceSample {
            timestamp_secs: self.started_at.elapsed().as_secs() as i64,
            memory_rss_bytes: 0,
            memory_percent: 0.0,
            cpu_process_percent: 0.0,
            cpu_system_percent: 0.0,
            thread_count: 0,
        }
    }

    fn disk_free_percent(&self, _path: &std::path::Path) -> Option<f64> {
        None
    }
}

/// Periodic collector of process/system resource figures with bounded
/// histories and leak/threshold detection rules (§4.7).
pub struct ResourceAnalyzer {
    thresholds: ResourceThresholds,
    backend: RwLock<Box<dyn ResourceBackend>>,
    memory_history: RwLock<VecDeque<ResourceSample>>,
    thread_history: RwLock<VecDeque<usize>>,
}

impl ResourceAnalyzer {
    #[cfg(feature = "resource-introspection")]
    pub fn new(thresholds: ResourceThresholds) -> Self {
        Self {
            thresholds,
            backend: RwLock::new(Box::new(SysinfoBackend::new())),
            memory_history: RwLock::new(VecDeque::new()),
            thread_history: RwLock::new(VecDeque::new()),
        }
    }

    #[cfg(not(feature = "resource-introspection"))]
    pub fn new(thresholds: ResourceThresholds) -> Self {
        Self {
            thresholds,
            backend: RwLock::new(Box::new(CounterOnlyBackend::new())),
            memory_history: RwLock::new(VecDeque::new()),
            thread_history: RwLock::new(VecDeque::new()),
        }
    }

    /// Takes one sample, appends it to the bounded histories (evicting the
    /// oldest beyond `max_history`), and returns it.
    pub async fn collect(&self) -> ResourceSample {
        let sample = self.backend.write().await.sample();

        let mut memory_history = self.memory_history.write().await;
        memory_history.push_back(sample);
        while memory_history.len() > self.thresholds.max_history {
            memory_history.pop_front();
        }

        let mut thread_history = self.thread_history.write().await;
        thread_history.push_back(sample.thread_count);
        while thread_history.len() > self.thresholds.max_history {
            thread_history.pop_front();
        }

        sample
    }

    /// Regression-estimated memory growth rate in MB/hour from the current
    /// history, via a simple least-squares slope over (time, RSS).
    async fn memory_growth_mb_per_hour(&self) -> f64 {
        let history = self.memory_history.read().await;
        if history.len() < 2 {
            return 0.0;
        }

        let n = history.len() as f64;
        let (sum_t, sum_m, sum_tt, sum_tm) = history.iter().fold((0.0, 0.0, 0.0, 0.0), |acc, s| {
            let t = s.timestamp_secs as f64;
            let m = s.memory_rss_bytes as f64 / (1024.0 * 1024.0);
            (acc.0 + t, acc.1 + m, acc.2 + t * t, acc.3 + t * m)
        });

        let denom = n * sum_tt - sum_t * sum_t;
        if denom.abs() < f64::EPSILON {
            return 0.0;
        }
        let slope_mb_per_sec = (n * sum_tm - sum_t * sum_m) / denom;
        slope_mb_per_sec * 3600.0
    }

    /// Runs every detection rule against the current sample and history,
    /// returning any `Issue`s found.
    pub async fn detect_issues(&self, latest: ResourceSample) -> Vec<Issue> {
        let mut issues = Vec::new();

        let growth = self.memory_growth_mb_per_hour().await;
        if growth > self.thresholds.leak_threshold_mb_per_hour {
            issues.push(Issue {
                kind: IssueKind::MemoryLeak,
                severity: IssueSeverity::High,
                description: format!("memory growing at {:.1} MB/hour", growth),
                recommendations: vec!["inspect for unbounded caches or retained handles".to_string()],
            });
        }

        if latest.memory_percent > self.thresholds.high_memory_threshold {
            issues.push(Issue {
                kind: IssueKind::HighMemory,
                severity: IssueSeverity::Medium,
                description: format!("process memory at {:.1}% of system total", latest.memory_percent),
                recommendations: vec!["reduce cache sizes or scale out".to_string()],
            });
        }

        if latest.cpu_process_percent > self.thresholds.high_cpu_threshold {
            issues.push(Issue {
                kind: IssueKind::HighCpu,
                severity: IssueSeverity::Medium,
                description: format!("process CPU at {:.1}%", latest.cpu_process_percent),
                recommendations: vec!["profile hot paths or add concurrency limits".to_string()],
            });
        }

        let backend = self.backend.read().await;
        for path in &self.thresholds.monitored_paths {
            if let Some(free_percent) = backend.disk_free_percent(path) {
                if free_percent < self.thresholds.low_disk_threshold {
                    issues.push(Issue {
                        kind: IssueKind::LowDisk,
                        severity: IssueSeverity::Critical,
                        description: format!("{} has {:.1}% free", path.display(), free_percent),
                        recommendations: vec!["clear stale cache or results_store files".to_string()],
                    });
                }
            }
        }
        drop(backend);

        let thread_history = self.thread_history.read().await;
        let last_ten: Vec<usize> = thread_history.iter().rev().take(10).copied().collect();
        let monotonically_increasing = last_ten.len() == 10 && last_ten.windows(2).all(|w| w[0] >= w[1]);
        if monotonically_increasing || latest.thread_count > self.thresholds.thread_leak_threshold {
            issues.push(Issue {
                kind: IssueKind::ThreadLeak,
                severity: IssueSeverity::High,
                description: format!("thread count at {}, trending upward", latest.thread_count),
                recommendations: vec!["check for unjoined spawned tasks".to_string()],
            });
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_bounds_history_to_max_samples() {
        let mut thresholds = ResourceThresholds::default();
        thresholds.max_history = 3;
        let analyzer = ResourceAnalyzer::new(thresholds);
        for _ in 0..10 {
            analyzer.collect().await;
        }
        assert_eq!(analyzer.memory_history.read().await.len(), 3);
    }

    #[tokio::test]
    async fn high_memory_sample_produces_issue() {
        let analyzer = ResourceAnalyzer::new(ResourceThresholds::default());
        let sample = ResourceSample {
            timestamp_secs: 0,
            memory_rss_bytes: 0,
            memory_percent: 99.0,
            cpu_process_percent: 0.0,
            cpu_system_percent: 0.0,
            thread_count: 1,
        };
        let issues = analyzer.detect_issues(sample).await;
        assert!(issues.iter().any(|i| i.kind == IssueKind::HighMemory));
    }

    #[tokio::test]
    async fn thread_count_under_threshold_with_flat_history_has_no_leak_issue() {
        let analyzer = ResourceAnalyzer::new(ResourceThresholds::default());
        for _ in 0..5 {
            analyzer.thread_history.write().await.push_back(4);
        }
        let sample = ResourceSample {
            timestamp_secs: 0,
            memory_rss_bytes: 0,
            memory_percent: 0.0,
            cpu_process_percent: 0.0,
            cpu_system_percent: 0.0,
            thread_count: 4,
        };
        let issues = analyzer.detect_issues(sample).await;
        assert!(!issues.iter().any(|i| i.kind == IssueKind::ThreadLeak));
    }
}
