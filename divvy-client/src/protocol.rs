//! Divvy line protocol
//!
//! Every request and every reply is a single `\n`-terminated line of text.
//!
//! # Request
//!
//! ```text
//! HIT "ip"="10.0.0.5" "type"="benchmark"\n
//! ```
//!
//! `HIT` is followed by zero or more `"key"="value"` pairs separated by single
//! spaces. Keys are written in lexicographic order so the same field set always
//! produces the same bytes. Keys and values must be non-empty and may not
//! contain a double quote, `=` or whitespace.
//!
//! # Reply
//!
//! ```text
//! OK <true|false> <credit> <reset_seconds>\n
//! ERR <unknown|unknown-command> "<message>"\n
//! ```
//!
//! Any other line means the client and server no longer agree on the
//! protocol and is reported as [`ClientError::MalformedReply`].

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;
use std::str;

use crate::error::{ClientError, Result};

const HIT_COMMAND: &[u8] = b"HIT";

/// Fields of a quota check
///
/// Values are coerced to strings when they are added, so anything that
/// implements [`fmt::Display`] can be used:
///
/// ```
/// use divvy_client::HitRequest;
///
/// let request = HitRequest::new()
///     .field("type", "login")
///     .field("ip", "10.0.0.5")
///     .field("attempt", 3);
/// assert_eq!(request.get("attempt"), Some("3"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HitRequest {
    fields: BTreeMap<String, String>,
}

impl HitRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, replacing any previous value for the same key
    pub fn field(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl fmt::Display) {
        self.fields.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields in wire order (sorted by key)
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for HitRequest
where
    K: Into<String>,
    V: fmt::Display,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut request = HitRequest::new();
        for (key, value) in iter {
            request.insert(key, value);
        }
        request
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for HitRequest
where
    K: Into<String>,
    V: fmt::Display,
{
    fn from(fields: [(K, V); N]) -> Self {
        fields.into_iter().collect()
    }
}

impl From<&HitRequest> for HitRequest {
    fn from(request: &HitRequest) -> Self {
        request.clone()
    }
}

/// Outcome of a successful quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether quota was available
    pub is_allowed: bool,
    /// Credit left after this check
    pub current_credit: u64,
    /// Seconds until the credit next resets
    pub next_reset_seconds: u64,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OK {} {} {}",
            self.is_allowed, self.current_credit, self.next_reset_seconds
        )
    }
}

/// Error codes a divvy server can answer with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    Unknown,
    UnknownCommand,
}

impl FaultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCode::Unknown => "unknown",
            FaultCode::UnknownCommand => "unknown-command",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(FaultCode::Unknown),
            "unknown-command" => Some(FaultCode::UnknownCommand),
            _ => None,
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reply sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFault {
    pub code: FaultCode,
    pub message: String,
}

impl fmt::Display for ServerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERR {} \"{}\"", self.code, self.message)
    }
}

impl From<ServerFault> for ClientError {
    fn from(fault: ServerFault) -> Self {
        ClientError::ServerFault {
            code: fault.code,
            message: fault.message,
        }
    }
}

/// A decoded reply line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Decision(Decision),
    Fault(ServerFault),
}

impl Reply {
    pub fn into_result(self) -> Result<Decision> {
        match self {
            Reply::Decision(decision) => Ok(decision),
            Reply::Fault(fault) => Err(fault.into()),
        }
    }
}

fn is_valid_token(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(|c| c == '"' || c == '=' || c.is_whitespace())
}

/// Build a `HIT` command line for the request
pub fn encode(request: &HitRequest) -> Result<Bytes> {
    let payload: usize = request.iter().map(|(k, v)| k.len() + v.len() + 6).sum();
    let mut buffer = BytesMut::with_capacity(HIT_COMMAND.len() + payload + 1);

    buffer.put_slice(HIT_COMMAND);
    for (key, value) in request.iter() {
        if !is_valid_token(key) {
            return Err(ClientError::InvalidField(format!("invalid key {key:?}")));
        }
        if !is_valid_token(value) {
            return Err(ClientError::InvalidField(format!(
                "invalid value {value:?} for key {key:?}"
            )));
        }
        buffer.put_slice(b" \"");
        buffer.put_slice(key.as_bytes());
        buffer.put_slice(b"\"=\"");
        buffer.put_slice(value.as_bytes());
        buffer.put_u8(b'"');
    }
    buffer.put_u8(b'\n');

    Ok(buffer.freeze())
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_uint(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_decision(rest: &str) -> Option<Decision> {
    let mut parts = rest.split(' ');
    let is_allowed = match parts.next()? {
        "true" => true,
        "false" => false,
        _ => return None,
    };
    let current_credit = parse_uint(parts.next()?)?;
    let next_reset_seconds = parse_uint(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }

    Some(Decision {
        is_allowed,
        current_credit,
        next_reset_seconds,
    })
}

fn parse_fault(rest: &str) -> Option<ServerFault> {
    let (code, message) = rest.split_once(' ')?;
    let code = FaultCode::parse(code)?;

    // Quotes around the message are optional
    let message = message.strip_prefix('"').unwrap_or(message);
    let message = message.strip_suffix('"').unwrap_or(message);
    if message.is_empty() || message.contains('"') {
        return None;
    }

    Some(ServerFault {
        code,
        message: message.to_string(),
    })
}

/// Parse one reply line (with or without its line terminator)
pub fn decode(line: &[u8]) -> Result<Reply> {
    let line = strip_line_ending(line);
    let text = str::from_utf8(line)
        .map_err(|_| ClientError::MalformedReply(format!("reply is not UTF-8: {line:?}")))?;

    let reply = if let Some(rest) = text.strip_prefix("OK ") {
        parse_decision(rest).map(Reply::Decision)
    } else if let Some(rest) = text.strip_prefix("ERR ") {
        parse_fault(rest).map(Reply::Fault)
    } else {
        None
    };

    reply.ok_or_else(|| ClientError::MalformedReply(format!("unable to parse reply: {text:?}")))
}

/// Parse a `HIT` command line back into its fields
///
/// This is the server side of [`encode`]; returns `None` when the line is not
/// a well formed `HIT` command.
pub fn parse_hit(line: &[u8]) -> Option<HitRequest> {
    let text = str::from_utf8(strip_line_ending(line)).ok()?;
    let mut rest = text.strip_prefix("HIT")?;
    let mut request = HitRequest::new();

    while !rest.is_empty() {
        rest = rest.strip_prefix(" \"")?;
        let (key, tail) = rest.split_once("\"=\"")?;
        let (value, tail) = tail.split_once('"')?;
        if !is_valid_token(key) || !is_valid_token(value) {
            return None;
        }
        request.insert(key, value);
        rest = tail;
    }

    Some(request)
}
