//! Per-thread CPU load from `/proc/stat` deltas

use crate::error::Result;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Cumulative jiffies of one `cpuN` line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Times {
    idle: u64,
    total: u64,
}

impl Times {
    fn from_fields(fields: &[u64]) -> Option<Self> {
        if fields.len() < 4 {
            return None;
        }
        // idle + iowait
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        // guest time is already folded into user/nice
        let total = fields.iter().take(8).sum();
        Some(Self { idle, total })
    }
}

fn parse_proc_stat(content: &str) -> Vec<(String, Vec<u64>)> {
    let mut cpu_times = Vec::new();
    for line in content.lines() {
        if !line.starts_with("cpu") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        let times: Vec<u64> = parts[1..].iter().filter_map(|s| s.parse().ok()).collect();
        cpu_times.push((parts[0].to_string(), times));
    }
    cpu_times
}

/// Load tracker for a set of logical processors
#[derive(Debug)]
pub struct CpuLoad {
    stat_path: PathBuf,
    previous: HashMap<usize, Times>,
}

impl CpuLoad {
    /// `proc_root` is normally `/proc`
    pub fn new(proc_root: &Path) -> Self {
        Self {
            stat_path: proc_root.join("stat"),
            previous: HashMap::new(),
        }
    }

    /// Whether the kernel statistics file is readable
    pub fn is_available(&self) -> bool {
        self.stat_path.exists()
    }

    /// Load percentage per logical processor since the previous call
    ///
    /// The first call only primes the baseline and returns an empty map.
    pub fn update(&mut self) -> Result<HashMap<usize, f32>> {
        let content = fs::read_to_string(&self.stat_path)?;
        Ok(self.update_from(&content))
    }

    fn update_from(&mut self, content: &str) -> HashMap<usize, f32> {
        let mut loads = HashMap::new();
        for (name, fields) in parse_proc_stat(content) {
            let Some(thread) = name.strip_prefix("cpu").and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            let Some(now) = Times::from_fields(&fields) else {
                continue;
            };
            if let Some(prev) = self.previous.insert(thread, now) {
                let total = now.total.saturating_sub(prev.total);
                let idle = now.idle.saturating_sub(prev.idle);
                if total > 0 {
                    let load = 100.0 * (1.0 - idle as f32 / total as f32);
                    loads.insert(thread, load.clamp(0.0, 100.0));
                }
            }
        }
        loads
    }
}
