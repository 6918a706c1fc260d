//! Standard metrics about the benchmark process itself.
//!
//! The values are read from the operating system each time the metrics are encoded. On
//! platforms other than Linux the gauges are registered but stay at zero.

use std::sync::atomic::AtomicU64;

use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Debug, Default)]
pub(super) struct ProcessMetrics {
    cpu_seconds: Gauge<f64, AtomicU64>,
    resident_memory: Gauge,
    virtual_memory: Gauge,
    open_fds: Gauge,
    max_fds: Gauge,
    start_time: Gauge<f64, AtomicU64>,
}

impl ProcessMetrics {
    /// Registers the process gauges into the given (already prefixed) registry.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "cpu_seconds_total",
            "Total user and system CPU time spent in seconds",
            metrics.cpu_seconds.clone(),
        );
        registry.register(
            "resident_memory_bytes",
            "Resident memory size in bytes",
            metrics.resident_memory.clone(),
        );
        registry.register(
            "virtual_memory_bytes",
            "Virtual memory size in bytes",
            metrics.virtual_memory.clone(),
        );
        registry.register(
            "open_fds",
            "Number of open file descriptors",
            metrics.open_fds.clone(),
        );
        registry.register(
            "max_fds",
            "Maximum number of open file descriptors",
            metrics.max_fds.clone(),
        );
        registry.register(
            "start_time_seconds",
            "Start time of the process since unix epoch in seconds",
            metrics.start_time.clone(),
        );

        metrics
    }

    /// Reads the current process stats into the gauges. Call before encoding.
    pub fn refresh(&self) {
        #[cfg(target_os = "linux")]
        if let Err(error) = self.read_procfs() {
            tracing::debug!(
                error = &error as &dyn std::error::Error,
                "failed to read process stats"
            );
        }
    }

    #[cfg(target_os = "linux")]
    fn read_procfs(&self) -> procfs::ProcResult<()> {
        use procfs::process::{LimitValue, Process};

        let process = Process::myself()?;
        let stat = process.stat()?;
        let ticks = procfs::ticks_per_second() as f64;

        self.cpu_seconds.set((stat.utime + stat.stime) as f64 / ticks);
        self.resident_memory.set((stat.rss * procfs::page_size()) as i64);
        self.virtual_memory.set(stat.vsize as i64);
        self.start_time
            .set(procfs::boot_time_secs()? as f64 + stat.starttime as f64 / ticks);
        self.open_fds.set(process.fd_count()? as i64);

        if let LimitValue::Value(max) = process.limits()?.max_open_files.soft_limit {
            self.max_fds.set(max as i64);
        }

        Ok(())
    }
}
