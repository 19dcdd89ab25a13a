//! Command classification and per-command header enforcement.
//!
//! Every frame entering or leaving the broker and the client passes through
//! [`validate`], which checks the command against the declared direction and
//! the headers against the command's required/optional sets.

use std::fmt;

use crate::error::{Result, StompError};
use crate::frame::{headers, Frame};

/// The closed set of STOMP 1.2 commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // client-originated
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    // server-originated
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// Map command text to the closed enum; unknown text is a protocol error.
    pub fn parse(text: &str) -> Result<Command> {
        match text {
            "CONNECT" => Ok(Command::Connect),
            "STOMP" => Ok(Command::Stomp),
            "SEND" => Ok(Command::Send),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "ACK" => Ok(Command::Ack),
            "NACK" => Ok(Command::Nack),
            "BEGIN" => Ok(Command::Begin),
            "COMMIT" => Ok(Command::Commit),
            "ABORT" => Ok(Command::Abort),
            "DISCONNECT" => Ok(Command::Disconnect),
            "CONNECTED" => Ok(Command::Connected),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            other => Err(StompError::ProtocolFrame(format!(
                "unknown command '{other}'"
            ))),
        }
    }

    pub fn is_client_command(&self) -> bool {
        !self.is_server_command()
    }

    pub fn is_server_command(&self) -> bool {
        matches!(
            self,
            Command::Connected | Command::Message | Command::Receipt | Command::Error
        )
    }

    /// MESSAGE, SEND, and ERROR frames may carry arbitrary custom headers.
    fn allows_custom_headers(&self) -> bool {
        matches!(self, Command::Message | Command::Send | Command::Error)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which peer produced a frame; selects the command set used by [`validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Client,
    Server,
}

/// Required and optional header names for each command.
fn header_rules(cmd: Command) -> (&'static [&'static str], &'static [&'static str]) {
    use headers::*;
    match cmd {
        Command::Connect | Command::Stomp => {
            (&[HOST, ACCEPT_VERSION], &[LOGIN, PASSCODE, HEART_BEAT])
        }
        Command::Connected => (&[VERSION], &[SESSION, SERVER, HEART_BEAT]),
        Command::Send => (&[DESTINATION], &[TRANSACTION]),
        Command::Subscribe => (&[DESTINATION, ID], &[ACK]),
        Command::Unsubscribe => (&[ID], &[]),
        Command::Ack | Command::Nack => (&[ID], &[TRANSACTION]),
        Command::Begin | Command::Commit | Command::Abort => (&[TRANSACTION], &[]),
        Command::Disconnect => (&[], &[RECEIPT]),
        Command::Message => (&[DESTINATION, MESSAGE_ID, SUBSCRIPTION], &[ACK]),
        Command::Receipt => (&[RECEIPT_ID], &[]),
        Command::Error => (&[], &[MESSAGE]),
    }
}

/// Reject strings whose backslash sequences are anything other than the
/// STOMP 1.2 set: `\\`, `\n`, `\r`, `\c`.
fn valid_escapes(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            match bytes.get(i + 1) {
                Some(b'\\') | Some(b'n') | Some(b'r') | Some(b'c') => i += 2,
                _ => return false,
            }
        } else {
            i += 1;
        }
    }
    true
}

/// Validate a frame against the command set for `source` and the
/// per-command header table.
///
/// Returns the classified [`Command`] so callers can dispatch on it without
/// re-parsing the command text.
pub fn validate(frame: &Frame, source: FrameSource) -> Result<Command> {
    let cmd = Command::parse(&frame.command)?;

    match source {
        FrameSource::Client if !cmd.is_client_command() => {
            return Err(StompError::ProtocolFrame(format!(
                "'{cmd}' is not a valid client command"
            )));
        }
        FrameSource::Server if !cmd.is_server_command() => {
            return Err(StompError::ProtocolFrame(format!(
                "'{cmd}' is not a valid server command"
            )));
        }
        _ => {}
    }

    let (required, optional) = header_rules(cmd);

    for (name, value) in &frame.headers {
        let known =
            required.contains(&name.as_str()) || optional.contains(&name.as_str());
        if !known && !cmd.allows_custom_headers() {
            return Err(StompError::ProtocolFrame(format!(
                "invalid header '{name}' for command '{cmd}'"
            )));
        }
        if !valid_escapes(name) || !valid_escapes(value) {
            return Err(StompError::ProtocolFrame(format!(
                "invalid escape sequence in header '{name}:{value}' for command '{cmd}'"
            )));
        }
    }

    for name in required {
        if !frame.has_header(name) {
            return Err(StompError::ProtocolFrame(format!(
                "missing required header '{name}' for command '{cmd}'"
            )));
        }
    }

    Ok(cmd)
}
