//! Async client library for the divvy rate limiting server
//!
//! divvy speaks a line-oriented text protocol over TCP. This crate keeps one
//! connection to the server, pipelines requests from any number of tasks over
//! it, and reconnects with exponential backoff when the connection is lost.
//!
//! ```no_run
//! use divvy_client::{DivvyClient, HitRequest};
//!
//! # async fn run() -> divvy_client::Result<()> {
//! let client = DivvyClient::connect("localhost", 8321).await?;
//!
//! let decision = client
//!     .check_rate_limit(HitRequest::new().field("method", "GET").field("path", "/"))
//!     .await?;
//! if !decision.is_allowed {
//!     println!("slow down, retry in {}s", decision.next_reset_seconds);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
mod ledger;
mod manager;
pub mod protocol;
mod session;

pub use client::{ClientBuilder, DivvyClient};
pub use config::{ClientConfig, NotReadyPolicy};
pub use error::{ClientError, Result};
pub use manager::{ClientStats, ConnectionState};
pub use protocol::{Decision, FaultCode, HitRequest, ServerFault};
