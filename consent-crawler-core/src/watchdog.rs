use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, Signal, System};
use tracing::{info, warn};

/// Counts from one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub matched: usize,
    pub signalled: usize,
    pub killed: usize,
    pub zombies: usize,
}

/// Best-effort cleanup of leftover browser processes, run between batches.
pub trait ProcessSweeper: Send + Sync {
    fn sweep(&self) -> SweepReport;
}

/// Terminates browser processes by name, optionally restricted to those whose
/// command line contains a marker (the run's profile root) and to those older
/// than a maximum age.
#[derive(Debug, Clone)]
pub struct ProcessWatchdog {
    name_pattern: String,
    cmdline_marker: Option<String>,
    max_age: Option<Duration>,
    settle: Duration,
}

impl Default for ProcessWatchdog {
    fn default() -> Self {
        Self {
            name_pattern: "chrome".to_string(),
            cmdline_marker: None,
            max_age: None,
            settle: Duration::from_secs(2),
        }
    }
}

impl ProcessWatchdog {
    pub fn new(name_pattern: impl Into<String>) -> Self {
        Self {
            name_pattern: name_pattern.into(),
            ..Default::default()
        }
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.cmdline_marker = Some(marker.into());
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Only processes running at least this long are touched.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// `age` is `None` when the start time of the process is unknown; such
    /// processes never match once a maximum age is configured.
    pub fn matches(&self, name: &str, cmd: &[String], age: Option<Duration>) -> bool {
        if !name.to_lowercase().contains(&self.name_pattern.to_lowercase()) {
            return false;
        }
        if let Some(marker) = &self.cmdline_marker {
            if !cmd.iter().any(|arg| arg.contains(marker.as_str())) {
                return false;
            }
        }
        match (self.max_age, age) {
            (None, _) => true,
            (Some(max_age), Some(age)) => age >= max_age,
            (Some(_), None) => false,
        }
    }
}

/// Running time of a process that started at `start_time` (unix seconds).
fn process_age(start_time: u64, now: u64) -> Option<Duration> {
    if start_time == 0 {
        return None;
    }
    Some(Duration::from_secs(now.saturating_sub(start_time)))
}

impl ProcessSweeper for ProcessWatchdog {
    fn sweep(&self) -> SweepReport {
        let mut system = System::new();
        system.refresh_processes();

        let now = Utc::now().timestamp().max(0) as u64;
        let mut report = SweepReport::default();
        let mut matched: HashSet<Pid> = HashSet::new();

        for (pid, process) in system.processes() {
            let age = process_age(process.start_time(), now);
            if !self.matches(process.name(), process.cmd(), age) {
                continue;
            }
            report.matched += 1;
            matched.insert(*pid);

            let started = DateTime::<Utc>::from_timestamp(process.start_time() as i64, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            info!(pid = pid.as_u32(), "Leftover browser process {} started {}", process.name(), started);

            if process.status() != ProcessStatus::Zombie
                && process.kill_with(Signal::Term).unwrap_or(false)
            {
                report.signalled += 1;
            }
        }

        if report.matched == 0 {
            return report;
        }

        std::thread::sleep(self.settle);
        system.refresh_processes();

        for (pid, process) in system.processes() {
            if !matched.contains(pid) {
                continue;
            }
            if process.status() == ProcessStatus::Zombie {
                // Reaping is left to the parent or init
                warn!(pid = pid.as_u32(), "Browser process {} is a zombie", process.name());
                report.zombies += 1;
            } else if process.kill_with(Signal::Kill).unwrap_or(false) {
                warn!(pid = pid.as_u32(), "Browser process {} ignored SIGTERM, killed", process.name());
                report.killed += 1;
            }
        }

        info!(
            "Watchdog sweep: {} matched, {} signalled, {} killed, {} zombies",
            report.matched, report.signalled, report.killed, report.zombies
        );
        report
    }
}
