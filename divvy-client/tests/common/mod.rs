//! In-process stand-in for a divvy server

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use divvy_client::protocol::{self, HitRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

/// What the mock server does with one request line
pub enum Action {
    Reply(String),
    /// Answer after a delay, holding up later requests on the connection
    ReplyAfter(Duration, String),
    /// Read the request and never answer it
    Ignore,
    /// Drop the connection without answering
    Close,
}

pub type Handler = Arc<dyn Fn(&HitRequest) -> Action + Send + Sync>;

struct Shared {
    handler: Handler,
    connections: AtomicUsize,
    received: Mutex<Vec<String>>,
    /// Line written unprompted as soon as the first connection is accepted
    greeting: Option<String>,
}

pub struct MockServer {
    pub port: u16,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(handler: impl Fn(&HitRequest) -> Action + Send + Sync + 'static) -> Self {
        Self::listen(0, None, handler).await
    }

    /// Listen on a specific port, or any free port when `port` is 0
    pub async fn start_on(
        port: u16,
        handler: impl Fn(&HitRequest) -> Action + Send + Sync + 'static,
    ) -> Self {
        Self::listen(port, None, handler).await
    }

    /// Send `greeting` on the first connection before any request arrives
    pub async fn start_with_greeting(
        greeting: &str,
        handler: impl Fn(&HitRequest) -> Action + Send + Sync + 'static,
    ) -> Self {
        Self::listen(0, Some(greeting.to_string()), handler).await
    }

    async fn listen(
        port: u16,
        greeting: Option<String>,
        handler: impl Fn(&HitRequest) -> Action + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared {
            handler: Arc::new(handler),
            connections: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            greeting,
        });

        let task = tokio::spawn({
            let shared = shared.clone();
            async move {
                // Dropping the set on abort closes every open connection
                let mut connections = JoinSet::new();
                while let Ok((socket, _)) = listener.accept().await {
                    let first = shared.connections.fetch_add(1, Ordering::SeqCst) == 0;
                    connections.spawn(serve(socket, shared.clone(), first));
                }
            }
        });

        MockServer { port, shared, task }
    }

    /// Number of connections accepted so far
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Every request line received, without line terminators
    pub fn received(&self) -> Vec<String> {
        self.shared.received.lock().unwrap().clone()
    }

    /// Stop listening and drop every connection
    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(socket: TcpStream, shared: Arc<Shared>, first: bool) {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    if let Some(greeting) = shared.greeting.as_ref().filter(|_| first) {
        if write_half.write_all(format!("{greeting}\n").as_bytes()).await.is_err() {
            return;
        }
    }

    while let Ok(Some(line)) = lines.next_line().await {
        shared.received.lock().unwrap().push(line.clone());

        let action = match protocol::parse_hit(line.as_bytes()) {
            Some(request) => (shared.handler)(&request),
            None => Action::Reply("ERR unknown-command \"Unknown command\"".to_string()),
        };

        match action {
            Action::Reply(reply) => {
                if write_half.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    return;
                }
            }
            Action::ReplyAfter(delay, reply) => {
                tokio::time::sleep(delay).await;
                if write_half.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    return;
                }
            }
            Action::Ignore => {}
            Action::Close => return,
        }
    }
}

/// Always allow, with a fixed credit
pub fn allow_all(_request: &HitRequest) -> Action {
    Action::Reply("OK true 575 60".to_string())
}

/// Reply with the request's `n` field as the credit, so callers can tell
/// which reply they were given
pub fn echo_n(request: &HitRequest) -> Action {
    match request.get("n") {
        Some(n) => Action::Reply(format!("OK true {n} 60")),
        None => Action::Reply("ERR unknown \"missing n\"".to_string()),
    }
}

/// A port with nothing listening on it
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
