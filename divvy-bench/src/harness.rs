//! Load generator driving one shared divvy client

use anyhow::Result;
use divvy_client::{ClientError, DivvyClient};
use parking_lot::Mutex;
use rand::Rng;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::config::Args;
use crate::report::{CpuTimes, Report};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub struct BenchStats {
    pub allowed: AtomicU64,
    pub denied: AtomicU64,
    pub faults: AtomicU64,
    pub failures: AtomicU64,
    latencies_ms: Mutex<Vec<f64>>,
}

impl BenchStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, result: &Result<divvy_client::Decision, ClientError>, latency: Duration) {
        let counter = match result {
            Ok(decision) if decision.is_allowed => &self.allowed,
            Ok(_) => &self.denied,
            Err(ClientError::ServerFault { .. }) => &self.faults,
            Err(e) => {
                tracing::debug!("Request failed: {}", e);
                &self.failures
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.latencies_ms.lock().push(latency.as_secs_f64() * 1000.0);
    }

    pub fn finished(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
            + self.denied.load(Ordering::Relaxed)
            + self.faults.load(Ordering::Relaxed)
            + self.failures.load(Ordering::Relaxed)
    }
}

/// Prints a line each time another tenth of the requests has finished
struct Progress {
    interval: u64,
    next: u64,
}

impl Progress {
    fn new(total: u64) -> Self {
        let interval = if total > 10 {
            (total as f64 / 10.0).round() as u64
        } else {
            total + 1
        };
        Self {
            interval,
            next: interval,
        }
    }

    fn update(&mut self, finished: u64) {
        while finished >= self.next {
            println!("Completed {} requests", self.next);
            self.next += self.interval;
        }
    }
}

pub struct Benchmark {
    args: Args,
    client: DivvyClient,
    stats: Arc<BenchStats>,
    /// Requests not yet claimed by a worker; zeroed to stop early
    remaining: Arc<AtomicU64>,
    ips: Arc<Vec<String>>,
}

impl Benchmark {
    pub fn new(args: Args, client: DivvyClient) -> Self {
        let mut rng = rand::thread_rng();
        let ips = (0..args.ip_pool_size())
            .map(|_| Ipv4Addr::from(rng.r#gen::<u32>()).to_string())
            .collect();

        Self {
            remaining: Arc::new(AtomicU64::new(args.requests)),
            stats: Arc::new(BenchStats::new()),
            ips: Arc::new(ips),
            args,
            client,
        }
    }

    /// Stop handing out requests; those in flight still finish
    pub fn abort(&self) {
        self.remaining.store(0, Ordering::Release);
    }

    pub async fn run(self) -> Result<Report> {
        let cpu_start = CpuTimes::read();
        let start = Instant::now();

        let mut workers = JoinSet::new();
        for _ in 0..self.args.concurrency {
            workers.spawn(worker(
                self.client.clone(),
                self.stats.clone(),
                self.remaining.clone(),
                self.ips.clone(),
                self.args.request_timeout(),
            ));
        }

        let deadline = self
            .args
            .time_limit
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
        let mut progress = Progress::new(self.args.requests);
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);

        while !workers.is_empty() {
            tokio::select! {
                Some(result) = workers.join_next() => result?,
                _ = ticker.tick() => progress.update(self.stats.finished()),
                _ = sleep_until_opt(deadline), if self.remaining.load(Ordering::Acquire) > 0 => {
                    tracing::info!("Time limit reached, stopping");
                    self.abort();
                }
                _ = tokio::signal::ctrl_c(), if self.remaining.load(Ordering::Acquire) > 0 => {
                    println!("Interrupted, waiting for requests in flight");
                    self.abort();
                }
            }
        }
        progress.update(self.stats.finished());

        let elapsed = start.elapsed();
        let cpu_end = CpuTimes::read();
        self.client.close().await;

        let mut latencies_ms = std::mem::take(&mut *self.stats.latencies_ms.lock());
        latencies_ms.sort_by(f64::total_cmp);

        Ok(Report {
            host: self.args.host.clone(),
            port: self.args.port,
            concurrency: self.args.concurrency,
            reconnect_rate: self.args.reconnect_rate,
            elapsed,
            allowed: self.stats.allowed.load(Ordering::Relaxed),
            denied: self.stats.denied.load(Ordering::Relaxed),
            faults: self.stats.faults.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            latencies_ms,
            cpu_start,
            cpu_end,
        })
    }
}

async fn worker(
    client: DivvyClient,
    stats: Arc<BenchStats>,
    remaining: Arc<AtomicU64>,
    ips: Arc<Vec<String>>,
    timeout: Duration,
) {
    while remaining
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
    {
        let ip = &ips[rand::thread_rng().gen_range(0..ips.len())];
        let start = Instant::now();
        let result = client
            .check_rate_limit_with_timeout([("type", "benchmark"), ("ip", ip.as_str())], timeout)
            .await;
        stats.record(&result, start.elapsed());
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
