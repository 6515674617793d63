//! Benchmark summary and latency percentiles

use std::fmt;
use std::time::Duration;

/// Clock ticks per second used by `/proc/<pid>/stat` (`USER_HZ`)
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

const PERCENTILES: [u32; 9] = [50, 66, 75, 80, 90, 95, 98, 99, 100];

/// User and system CPU time consumed by this process, in clock ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub system: u64,
}

impl CpuTimes {
    /// Read the current process's CPU times; `None` where `/proc` is unavailable
    pub fn read() -> Option<Self> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        Self::parse(&stat)
    }

    fn parse(stat: &str) -> Option<Self> {
        // The command name may contain spaces, so count fields from its closing paren
        let (_, fields) = stat.rsplit_once(')')?;
        let mut fields = fields.split_whitespace().skip(11);
        Some(CpuTimes {
            user: fields.next()?.parse().ok()?,
            system: fields.next()?.parse().ok()?,
        })
    }
}

/// Outcome of a benchmark run
#[derive(Debug, Clone)]
pub struct Report {
    pub host: String,
    pub port: u16,
    pub concurrency: usize,
    pub reconnect_rate: Option<u64>,
    pub elapsed: Duration,
    pub allowed: u64,
    pub denied: u64,
    pub faults: u64,
    pub failures: u64,
    /// Latency of every finished request in milliseconds, sorted ascending
    pub latencies_ms: Vec<f64>,
    pub cpu_start: Option<CpuTimes>,
    pub cpu_end: Option<CpuTimes>,
}

impl Report {
    /// Requests answered with a decision
    pub fn complete(&self) -> u64 {
        self.allowed + self.denied
    }

    pub fn errors(&self) -> u64 {
        self.faults + self.failures
    }

    pub fn total(&self) -> u64 {
        self.complete() + self.errors()
    }

    pub fn requests_per_second(&self) -> f64 {
        self.total() as f64 / self.elapsed.as_secs_f64()
    }

    pub fn mean(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64
    }

    /// Population standard deviation of latencies
    pub fn std_dev(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let squares: f64 = self.latencies_ms.iter().map(|x| (x - mean).powi(2)).sum();
        (squares / self.latencies_ms.len() as f64).sqrt()
    }

    /// Latency below which `pct` percent of requests finished
    pub fn percentile(&self, pct: u32) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let rank = (f64::from(pct) / 100.0 * self.latencies_ms.len() as f64).round() as usize;
        let index = rank.clamp(1, self.latencies_ms.len()) - 1;
        Some(self.latencies_ms[index])
    }

    /// CPU use over the run as percentages of one core (user, system)
    pub fn cpu_percent(&self) -> Option<(f64, f64)> {
        let (start, end) = (self.cpu_start?, self.cpu_end?);
        let seconds = self.elapsed.as_secs_f64();
        if seconds <= 0.0 {
            return None;
        }
        let percent = |ticks: u64| ticks as f64 / CLOCK_TICKS_PER_SEC / seconds * 100.0;
        Some((
            percent(end.user.saturating_sub(start.user)),
            percent(end.system.saturating_sub(start.system)),
        ))
    }

    fn write_summary(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = |f: &mut fmt::Formatter<'_>, key: &str, value: String| {
            writeln!(f, "{:<24}{}", format!("{key}:"), value)
        };

        writeln!(f)?;
        line(f, "Server hostname", self.host.clone())?;
        line(f, "Server port", self.port.to_string())?;
        line(f, "Concurrency level", self.concurrency.to_string())?;
        line(
            f,
            "Auto reconnect rate",
            match self.reconnect_rate {
                Some(rate) => format!("every {rate} requests"),
                None => "N/A".to_string(),
            },
        )?;
        line(
            f,
            "Time taken for tests",
            format!("{:.3} seconds", self.elapsed.as_secs_f64()),
        )?;
        line(f, "Complete requests", self.complete().to_string())?;
        line(f, "Denied requests", self.denied.to_string())?;
        line(f, "Errors", self.errors().to_string())?;
        line(f, "Server faults", self.faults.to_string())?;
        line(
            f,
            "Requests per second",
            format!("{:.3} per second (mean)", self.requests_per_second()),
        )?;
        line(f, "Time per request", format!("{:.3} ms (mean)", self.mean()))?;
        line(f, "Standard deviation", format!("{:.3} ms", self.std_dev()))?;
        if let Some((user, system)) = self.cpu_percent() {
            line(f, "User CPU consumed", format!("{user:.1}%"))?;
            line(f, "System CPU consumed", format!("{system:.1}%"))?;
        }
        Ok(())
    }

    fn write_percentiles(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Percentage of requests served within a certain time:")?;
        for pct in PERCENTILES {
            if let Some(ms) = self.percentile(pct) {
                let suffix = if pct == 100 { " (longest request)" } else { "" };
                writeln!(f, "{pct:>3}% {:>10} ms{suffix}", format!("{ms:.3}"))?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total() > 0 {
            self.write_summary(f)?;
        }
        if self.latencies_ms.len() > 1 {
            self.write_percentiles(f)?;
        }
        Ok(())
    }
}
