use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// One reading of process-wide resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Host CPU usage in percent.
    pub cpu_percent: f64,
    /// Memory used as a percent of total.
    pub memory_percent: f64,
    /// Memory used in bytes.
    pub memory_used_bytes: u64,
}

/// Source of resource readings for the monitor's background loop.
pub trait ResourceSampler: Send {
    /// Take one reading.
    fn sample(&mut self) -> ResourceSample;
}

/// Samples host CPU and memory through `sysinfo`.
pub struct SystemSampler {
    system: System,
}

impl SystemSampler {
    /// Sampler with CPU and memory refresh enabled.
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self { system }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&mut self) -> ResourceSample {
        // CPU usage is a delta between refreshes; the first reading is 0.
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let used = self.system.used_memory();
        let total = self.system.total_memory();
        ResourceSample {
            cpu_percent: f64::from(self.system.global_cpu_usage()).clamp(0.0, 100.0),
            memory_percent: if total > 0 {
                (used as f64 / total as f64) * 100.0
            } else {
                0.0
            },
            memory_used_bytes: used,
        }
    }
}

/// Replays a fixed sequence of readings, repeating the last one.
#[cfg(test)]
pub(crate) struct ScriptedSampler {
    samples: Vec<ResourceSample>,
    next: usize,
}

#[cfg(test)]
impl ScriptedSampler {
    pub(crate) fn new(samples: Vec<ResourceSample>) -> Self {
        Self { samples, next: 0 }
    }

    pub(crate) fn constant(cpu_percent: f64, memory_percent: f64) -> Self {
        Self::new(vec![ResourceSample {
            cpu_percent,
            memory_percent,
            memory_used_bytes: 0,
        }])
    }
}

#[cfg(test)]
impl ResourceSampler for ScriptedSampler {
    fn sample(&mut self) -> ResourceSample {
        let Some(last) = self.samples.len().checked_sub(1) else {
            return ResourceSample::default();
        };
        let sample = self.samples[self.next.min(last)];
        self.next += 1;
        sample
    }
}
