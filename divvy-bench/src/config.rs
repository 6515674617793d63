//! Benchmark configuration and CLI argument parsing
//!
//! Every option can also be set with a `DIVVY_BENCH_` environment variable.
//! CLI arguments take precedence over environment variables.
//!
//! ```bash
//! # 10000 requests over 16 concurrent workers, recycling every 500 requests
//! divvy-bench localhost 8321 -n 10000 -c 16 -r 500
//!
//! # Run for at most 30 seconds
//! export DIVVY_BENCH_TIME_LIMIT=30
//! divvy-bench divvy.internal -n 1000000
//! ```

use anyhow::{Result, anyhow};
use clap::Parser;
use divvy_client::config::MAX_TIMEOUT;
use std::time::Duration;

/// Command-line arguments for the benchmark
#[derive(Parser, Debug, Clone)]
#[command(
    name = "divvy-bench",
    about = "Benchmarks a divvy rate limiting server",
    long_about = "Sends HIT requests to a divvy server over one pipelined connection and reports throughput and latency.\n\nEnvironment variables with DIVVY_BENCH_ prefix are supported. CLI arguments take precedence over environment variables."
)]
pub struct Args {
    #[arg(help = "Divvy server hostname", env = "DIVVY_BENCH_HOST")]
    pub host: String,
    #[arg(
        help = "Divvy server port",
        default_value_t = divvy_client::config::DEFAULT_PORT,
        env = "DIVVY_BENCH_PORT"
    )]
    pub port: u16,

    #[arg(
        short = 'n',
        value_name = "REQUESTS",
        help = "Number of requests to perform",
        default_value_t = 1000,
        env = "DIVVY_BENCH_REQUESTS"
    )]
    pub requests: u64,
    #[arg(
        short = 'c',
        value_name = "CONCURRENCY",
        help = "Number of requests to keep in flight at a time",
        default_value_t = 4,
        env = "DIVVY_BENCH_CONCURRENCY"
    )]
    pub concurrency: usize,
    #[arg(
        short = 'r',
        value_name = "REQUESTS",
        help = "Cycle the connection after this many requests",
        env = "DIVVY_BENCH_RECONNECT_RATE"
    )]
    pub reconnect_rate: Option<u64>,
    #[arg(
        short = 't',
        value_name = "SECS",
        help = "Max seconds to spend on benchmarking",
        env = "DIVVY_BENCH_TIME_LIMIT"
    )]
    pub time_limit: Option<u64>,
    #[arg(
        short = 's',
        value_name = "SECS",
        help = "Max seconds to wait for each response",
        default_value_t = 1.0,
        env = "DIVVY_BENCH_TIMEOUT"
    )]
    pub timeout: f64,
    #[arg(
        long,
        value_name = "N",
        help = "Number of distinct client IPs to send (default: requests / 10)",
        env = "DIVVY_BENCH_UNIQUE_IPS"
    )]
    pub unique_ips: Option<usize>,
    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level: error, warn, info, debug, trace",
        default_value = "warn",
        env = "DIVVY_BENCH_LOG_LEVEL"
    )]
    pub log_level: String,
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow!("Concurrency must be at least 1"));
        }
        if self.reconnect_rate == Some(0) {
            return Err(anyhow!("Reconnect rate must be at least 1"));
        }
        if self.time_limit == Some(0) {
            return Err(anyhow!("Time limit must be at least 1 second"));
        }
        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            return Err(anyhow!("Timeout must be a positive number of seconds"));
        }
        if self.timeout > MAX_TIMEOUT.as_secs_f64() {
            return Err(anyhow!(
                "Timeout must not exceed {} seconds",
                MAX_TIMEOUT.as_secs()
            ));
        }
        if self.unique_ips == Some(0) {
            return Err(anyhow!("Unique IP count must be at least 1"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// Size of the pool of client IPs requests are drawn from
    pub fn ip_pool_size(&self) -> usize {
        self.unique_ips
            .unwrap_or((self.requests / 10) as usize)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_positional_and_short_flags() {
        let args = Args::try_parse_from([
            "divvy-bench",
            "localhost",
            "9000",
            "-n",
            "500",
            "-c",
            "8",
            "-r",
            "100",
            "-s",
            "0.25",
        ])
        .unwrap();

        assert_eq!(args.host, "localhost");
        assert_eq!(args.port, 9000);
        assert_eq!(args.requests, 500);
        assert_eq!(args.concurrency, 8);
        assert_eq!(args.reconnect_rate, Some(100));
        assert_eq!(args.request_timeout(), Duration::from_millis(250));
        assert_eq!(args.ip_pool_size(), 50);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["divvy-bench", "localhost"]).unwrap();
        assert_eq!(args.port, 8321);
        assert_eq!(args.requests, 1000);
        assert_eq!(args.concurrency, 4);
        assert_eq!(args.reconnect_rate, None);
        assert_eq!(args.time_limit, None);
        assert_eq!(args.request_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_validation() {
        let args = Args::try_parse_from(["divvy-bench", "localhost", "-n", "5"]).unwrap();
        assert_eq!(args.ip_pool_size(), 1);

        for flags in [
            ["-c", "0"],
            ["-r", "0"],
            ["-s", "0"],
            ["-s", "1e30"],
            ["-t", "0"],
        ] {
            let args =
                Args::try_parse_from(["divvy-bench", "localhost", flags[0], flags[1]]).unwrap();
            assert!(args.validate().is_err(), "{flags:?} should be rejected");
        }
    }
}
