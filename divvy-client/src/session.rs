//! One TCP connection to a divvy server
//!
//! A [`Session`] runs its socket on a background task and reports back to the
//! connection manager through [`SessionEvent`]s: `Ready` once connected, one
//! `Line` per reply in the order received, and at most one `Closed` carrying
//! whatever ended the connection. After `Closed` the session never touches the
//! socket again.
//!
//! Events carry the session id so that the manager can drop late events from a
//! session it has already replaced.

use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{ClientError, Result};

/// Longest reply line accepted before the stream is considered out of sync
pub const MAX_REPLY_LENGTH: usize = 1024;

const READ_BUFFER_SIZE: usize = 4096;
const WRITE_BUFFER_SIZE: usize = 4096;

pub type SessionId = u64;

#[derive(Debug)]
pub enum SessionEvent {
    Ready(SessionId),
    Line(SessionId, Bytes),
    Closed(SessionId, ClientError),
}

impl SessionEvent {
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::Ready(id) | SessionEvent::Line(id, _) | SessionEvent::Closed(id, _) => {
                *id
            }
        }
    }
}

/// Socket settings for a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: bool,
    /// Log every frame written and every line read
    pub debug: bool,
}

pub struct Session {
    id: SessionId,
    frames: mpsc::UnboundedSender<Bytes>,
    ready: bool,
    task: JoinHandle<()>,
}

impl Session {
    /// Start connecting to `addr` in the background
    pub fn spawn(
        id: SessionId,
        addr: String,
        options: SessionOptions,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(id, addr, options, frames_rx, events));

        Session {
            id,
            frames: frames_tx,
            ready: false,
            task,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Record that the `Ready` event for this session has been seen
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    /// Queue a complete request line for writing
    pub fn send_frame(&self, frame: Bytes) -> Result<()> {
        if !self.ready {
            return Err(ClientError::NotConnected);
        }
        self.frames
            .send(frame)
            .map_err(|_| ClientError::ConnectionLost("session has stopped writing".to_string()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_session(
    id: SessionId,
    addr: String,
    options: SessionOptions,
    frames: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let stream = match timeout(options.connect_timeout, open_stream(&addr, &options)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _ = events.send(SessionEvent::Closed(id, connect_failed(&addr, e.to_string())));
            return;
        }
        Err(_) => {
            let reason = format!("timed out after {:?}", options.connect_timeout);
            let _ = events.send(SessionEvent::Closed(id, connect_failed(&addr, reason)));
            return;
        }
    };

    tracing::debug!(session = id, "Connected to {}", addr);
    if events.send(SessionEvent::Ready(id)).is_err() {
        return;
    }

    let (reader, writer) = stream.into_split();

    // Whichever half fails first ends the session; the other is dropped with it
    let cause = tokio::select! {
        cause = read_lines(id, reader, &events, options.debug) => cause,
        cause = write_frames(id, writer, frames, options.debug) => cause,
    };

    if let Some(cause) = cause {
        tracing::debug!(session = id, "Session to {} ended: {}", addr, cause);
        let _ = events.send(SessionEvent::Closed(id, cause));
    }
}

fn connect_failed(addr: &str, reason: String) -> ClientError {
    ClientError::ConnectFailed {
        addr: addr.to_string(),
        reason,
    }
}

/// Try every address the host resolves to, in order
async fn open_stream(addr: &str, options: &SessionOptions) -> io::Result<TcpStream> {
    let mut last_error = None;

    for socket_addr in lookup_host(addr).await? {
        let socket = if socket_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if options.tcp_keepalive {
            socket.set_keepalive(true)?;
        }

        match socket.connect(socket_addr).await {
            Ok(stream) => {
                if options.tcp_nodelay {
                    stream.set_nodelay(true)?;
                }
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "address lookup returned no results")
    }))
}

/// Split incoming bytes into lines and forward them in order
///
/// Returns `None` only when the manager has gone away.
async fn read_lines(
    id: SessionId,
    mut reader: OwnedReadHalf,
    events: &mpsc::UnboundedSender<SessionEvent>,
    debug: bool,
) -> Option<ClientError> {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        while let Some(end) = buffer.iter().position(|&b| b == b'\n') {
            let line = buffer.split_to(end + 1).freeze();
            if debug {
                tracing::debug!(session = id, "<- {}", String::from_utf8_lossy(&line).trim_end());
            }
            if events.send(SessionEvent::Line(id, line)).is_err() {
                return None;
            }
        }

        if buffer.len() > MAX_REPLY_LENGTH {
            return Some(ClientError::MalformedReply(format!(
                "reply exceeds {MAX_REPLY_LENGTH} bytes without a line terminator"
            )));
        }

        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                return Some(ClientError::ConnectionLost(
                    "connection closed by server".to_string(),
                ));
            }
            Ok(_) => {}
            Err(e) => return Some(ClientError::ConnectionLost(e.to_string())),
        }
    }
}

/// Write queued frames, coalescing whatever is already waiting into one write
///
/// Returns `None` when the session handle was dropped.
async fn write_frames(
    id: SessionId,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    debug: bool,
) -> Option<ClientError> {
    let mut batch = BytesMut::with_capacity(WRITE_BUFFER_SIZE);

    while let Some(frame) = frames.recv().await {
        batch.extend_from_slice(&frame);
        while batch.len() < WRITE_BUFFER_SIZE {
            match frames.try_recv() {
                Ok(frame) => batch.extend_from_slice(&frame),
                Err(_) => break,
            }
        }

        if debug {
            for line in String::from_utf8_lossy(&batch).lines() {
                tracing::debug!(session = id, "-> {}", line);
            }
        }

        if let Err(e) = writer.write_all(&batch).await {
            return Some(ClientError::ConnectionLost(e.to_string()));
        }
        batch.clear();
    }

    let _ = writer.shutdown().await;
    None
}
