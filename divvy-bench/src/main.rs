mod config;
mod harness;
mod report;

use anyhow::Result;
use clap::Parser;
use divvy_client::DivvyClient;

use crate::config::Args;
use crate::harness::Benchmark;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.validate()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("divvy_client={}", args.log_level).parse()?)
                .add_directive(format!("divvy_bench={}", args.log_level).parse()?),
        )
        .init();

    println!(
        "Benchmarking {} requests to Divvy at {}:{}, using {} {}",
        args.requests,
        args.host,
        args.port,
        args.concurrency,
        if args.concurrency > 1 { "workers" } else { "worker" }
    );

    let mut builder = DivvyClient::builder()
        .host(args.host.clone())
        .port(args.port)
        .request_timeout(args.request_timeout());
    if let Some(rate) = args.reconnect_rate {
        builder = builder.reconnect_after(rate);
    }
    let client = builder.connect().await?;

    let report = Benchmark::new(args, client).run().await?;
    print!("{report}");

    Ok(())
}
