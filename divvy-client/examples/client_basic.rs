//! Basic example of using the divvy client
//!
//! Expects a divvy server on localhost:8321.

use divvy_client::{ClientError, DivvyClient, HitRequest, NotReadyPolicy};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("divvy_client=debug")
        .init();

    // Connect to divvy server with default configuration
    println!("Connecting to divvy server...");
    let client = DivvyClient::connect("127.0.0.1", 8321).await?;

    // Example 1: Basic rate limit check
    println!("\n=== Basic Rate Limit Check ===");
    let decision = client
        .check_rate_limit([("method", "GET"), ("path", "/")])
        .await?;

    println!("Allowed: {}", decision.is_allowed);
    println!("Credit left: {}", decision.current_credit);
    println!("Reset in: {} seconds", decision.next_reset_seconds);

    // Example 2: Field values are coerced to strings
    println!("\n=== Coerced Field Values ===");
    let request = HitRequest::new()
        .field("type", "login")
        .field("user_id", 123)
        .field("mfa", true);
    let decision = client.check_rate_limit(&request).await?;
    println!("{decision}");

    // Example 3: Invalid fields never reach the server
    println!("\n=== Invalid Field ===");
    match client.check_rate_limit([("user name", "bob")]).await {
        Err(ClientError::InvalidField(reason)) => println!("Rejected: {reason}"),
        other => println!("Unexpected: {other:?}"),
    }

    // Example 4: Concurrent requests share one pipelined connection
    println!("\n=== Concurrent Requests ===");
    let mut handles = vec![];
    for i in 0..10 {
        let client = client.clone();
        let handle = tokio::spawn(async move {
            let name = format!("client-{i}");
            client
                .check_rate_limit([("type", "api"), ("client", name.as_str())])
                .await
        });
        handles.push(handle);
    }

    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await? {
            Ok(decision) => println!("client-{i}: allowed={}", decision.is_allowed),
            Err(e) => println!("client-{i}: error={e}"),
        }
    }
    println!("Stats: {:?}", client.stats().await?);
    client.close().await;

    // Example 5: Advanced configuration
    println!("\n=== Advanced Configuration ===");
    let client = DivvyClient::builder()
        .host("127.0.0.1")
        .port(8321)
        .connect_timeout(Duration::from_secs(2))
        .request_timeout(Duration::from_millis(250))
        .reconnect_after(1000)
        .not_ready_policy(NotReadyPolicy::FailFast)
        .connect()
        .await?;

    let decision = client
        .check_rate_limit_with_timeout([("type", "report")], Duration::from_secs(2))
        .await?;
    println!("Report allowed: {}", decision.is_allowed);
    client.close().await;

    Ok(())
}
