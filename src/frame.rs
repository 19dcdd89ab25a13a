use std::fmt;

use crate::error::StompError;

/// Well-known STOMP 1.2 header names.
///
/// Headers are open-ended strings on the wire; this closed set covers the
/// names the protocol machinery itself reads and writes.
pub mod headers {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const ACK: &str = "ack";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const LOGIN: &str = "login";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const PASSCODE: &str = "passcode";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SERVER: &str = "server";
    pub const SESSION: &str = "session";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const TRANSACTION: &str = "transaction";
    pub const VERSION: &str = "version";
}

/// Subscription acknowledgement modes as defined by STOMP 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Parse an `ack` header value.
    pub fn parse(value: &str) -> Result<AckMode, StompError> {
        match value {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(StompError::ProtocolFrame(format!(
                "invalid ack mode '{other}'"
            ))),
        }
    }
}

impl Default for AckMode {
    fn default() -> Self {
        AckMode::Auto
    }
}

/// A single STOMP frame: command, ordered headers, and raw body bytes.
///
/// Header order is preserved as given; the wire encoder sorts headers by
/// name so serialization is deterministic. When a decoded frame carried a
/// repeated header name only the first occurrence is kept, per STOMP 1.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// STOMP command (e.g. CONNECT, SEND, MESSAGE)
    pub command: String,
    /// Headers as (name, value) pairs
    pub headers: Vec<(String, String)>,
    /// Raw body bytes, possibly empty
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a new frame with the given command and empty headers/body.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Add a header (builder style).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the frame body (builder style).
    pub fn set_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Get the value of a header by name.
    ///
    /// Returns the first header value matching the given name, or `None`.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header with the given name is present.
    pub fn has_header(&self, name: &str) -> bool {
        self.get_header(name).is_some()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Command: {}", self.command)?;
        for (n, v) in &self.headers {
            writeln!(f, "{}: {}", n, v)?;
        }
        writeln!(f, "Body ({} bytes)", self.body.len())
    }
}
