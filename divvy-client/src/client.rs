use std::time::Duration;

use crate::config::{ClientConfig, NotReadyPolicy};
use crate::error::{ClientError, Result};
use crate::manager::{ClientStats, ConnectionManager, ManagerHandle};
use crate::protocol::{self, Decision, HitRequest};

/// Builder for creating a DivvyClient
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration
    pub fn from_config(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Set the server host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the server port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the default request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the protocol text encoding (only UTF-8 is accepted)
    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.config.encoding = encoding.into();
        self
    }

    /// Replace the connection after this many requests
    pub fn reconnect_after(mut self, requests: u64) -> Self {
        self.config.reconnect_after = Some(requests);
        self
    }

    /// Log every frame sent and received at debug level
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Choose what happens to requests made while no connection is ready
    pub fn not_ready_policy(mut self, policy: NotReadyPolicy) -> Self {
        self.config.not_ready_policy = policy;
        self
    }

    /// Set the bounds of the delay between reconnect attempts
    pub fn reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.config.reconnect_backoff_min = min;
        self.config.reconnect_backoff_max = max;
        self
    }

    /// Enable or disable TCP nodelay
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Enable or disable TCP keepalive
    pub fn tcp_keepalive(mut self, keepalive: bool) -> Self {
        self.config.tcp_keepalive = keepalive;
        self
    }

    /// Build the client and start connecting in the background
    ///
    /// Must be called within a Tokio runtime.
    pub fn build(self) -> Result<DivvyClient> {
        self.config.validate()?;

        let request_timeout = self.config.request_timeout;
        let manager = ConnectionManager::spawn(self.config);

        Ok(DivvyClient {
            manager,
            request_timeout,
        })
    }

    /// Build the client and wait for its first connection
    pub async fn connect(self) -> Result<DivvyClient> {
        let client = self.build()?;

        if let Err(e) = client.manager.wait_ready().await {
            client.close().await;
            return Err(e);
        }
        Ok(client)
    }
}

/// Async client for a divvy rate limiting server
///
/// Clones share one connection, and any number of tasks may check quotas
/// through it at the same time; requests are pipelined and replies matched
/// to them in order.
#[derive(Clone)]
pub struct DivvyClient {
    manager: ManagerHandle,
    request_timeout: Duration,
}

impl DivvyClient {
    /// Connect to `host:port` with default configuration
    pub async fn connect(host: impl Into<String>, port: u16) -> Result<Self> {
        ClientBuilder::new().host(host).port(port).connect().await
    }

    /// Create a new client builder for advanced configuration
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Ask the server whether the operation described by `request` is allowed
    ///
    /// A `Decision` with `is_allowed == false` is a successful answer, not an
    /// error.
    pub async fn check_rate_limit(&self, request: impl Into<HitRequest>) -> Result<Decision> {
        self.check_rate_limit_with_timeout(request, self.request_timeout)
            .await
    }

    /// Like [`check_rate_limit`](Self::check_rate_limit) with an explicit timeout
    ///
    /// A zero timeout is rejected with `InvalidConfig`. Timeouts longer than
    /// [`MAX_TIMEOUT`](crate::config::MAX_TIMEOUT), including `Duration::MAX`,
    /// are shortened to it.
    pub async fn check_rate_limit_with_timeout(
        &self,
        request: impl Into<HitRequest>,
        timeout: Duration,
    ) -> Result<Decision> {
        if timeout.is_zero() {
            return Err(ClientError::InvalidConfig(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        // Invalid fields fail here, before anything reaches the connection
        let frame = protocol::encode(&request.into())?;
        self.manager.submit(frame, timeout).await
    }

    /// Current connection state and request counts
    pub async fn stats(&self) -> Result<ClientStats> {
        self.manager.stats().await
    }

    /// Shut the client down
    ///
    /// Every outstanding request, and every request made afterwards through
    /// any clone, fails with `ClientClosed`.
    pub async fn close(&self) {
        self.manager.close().await;
    }
}
