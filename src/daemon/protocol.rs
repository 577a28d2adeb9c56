//! Universal variable wire protocol
//!
//! Newline-terminated UTF-8 text lines, used both on the daemon socket and
//! in the persisted variables file:
//!
//! ```text
//! SET <name>:<escaped-value>\n
//! SET_EXPORT <name>:<escaped-value>\n
//! ERASE <name>\n
//! BARRIER\n
//! BARRIER_REPLY\n
//! #<comment>\n
//! ```
//!
//! Values are escaped so that only `[A-Za-z0-9/]` travel verbatim; every
//! other character becomes `\xHH`, `\uHHHH` or `\UHHHHHHHH` depending on the
//! width of its code point.
//!
//! A [`Message`] owns its encoded bytes behind an `Arc`, so queueing one
//! message on many connections shares a single allocation that is released
//! when the last queue lets go of it.

use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

use crate::error::{is_name_char, is_valid_name, validate_name, Result};

pub const SET_CMD: &str = "SET";
pub const SET_EXPORT_CMD: &str = "SET_EXPORT";
pub const ERASE_CMD: &str = "ERASE";
pub const BARRIER_CMD: &str = "BARRIER";
pub const BARRIER_REPLY_CMD: &str = "BARRIER_REPLY";

/// The kind of a protocol line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Set,
    SetExport,
    Erase,
    Barrier,
    BarrierReply,
    /// `#` line; greetings and file headers
    Comment,
}

impl MessageKind {
    /// Wire keyword (comments have none)
    pub fn keyword(self) -> &'static str {
        match self {
            MessageKind::Set => SET_CMD,
            MessageKind::SetExport => SET_EXPORT_CMD,
            MessageKind::Erase => ERASE_CMD,
            MessageKind::Barrier => BARRIER_CMD,
            MessageKind::BarrierReply => BARRIER_REPLY_CMD,
            MessageKind::Comment => "#",
        }
    }
}

/// A decoded protocol event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Set {
        name: String,
        value: String,
        exported: bool,
    },
    Erase {
        name: String,
    },
    Barrier,
    BarrierReply,
}

impl Event {
    pub fn kind(&self) -> MessageKind {
        match self {
            Event::Set { exported: true, .. } => MessageKind::SetExport,
            Event::Set { exported: false, .. } => MessageKind::Set,
            Event::Erase { .. } => MessageKind::Erase,
            Event::Barrier => MessageKind::Barrier,
            Event::BarrierReply => MessageKind::BarrierReply,
        }
    }

    /// Variable the event refers to, if any
    pub fn name(&self) -> Option<&str> {
        match self {
            Event::Set { name, .. } | Event::Erase { name } => Some(name),
            Event::Barrier | Event::BarrierReply => None,
        }
    }
}

/// Decode failures. These drop one line; the connection carries on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unable to parse universal variable message: '{0}'")]
    Unrecognized(String),

    #[error("Missing ':' in universal variable message: '{0}'")]
    MissingSeparator(String),

    #[error("Missing variable name in universal variable message: '{0}'")]
    MissingName(String),

    #[error("Illegal variable name in universal variable message: '{0}'")]
    InvalidName(String),

    #[error("Invalid escape sequence in universal variable message: '{0}'")]
    BadEscape(String),

    #[error("Could not convert message to text: '{0}'")]
    InvalidUtf8(String),
}

/// An encoded, immutable, shareable protocol line
#[derive(Debug, Clone)]
pub struct Message {
    kind: MessageKind,
    body: Arc<[u8]>,
}

impl Message {
    /// Encode a message of `kind`.
    ///
    /// `name` is required for updates and validated; `value` defaults to the
    /// empty string for `Set`/`SetExport`.
    pub fn encode(kind: MessageKind, name: Option<&str>, value: Option<&str>) -> Result<Self> {
        let mut body = String::new();
        match kind {
            MessageKind::Set | MessageKind::SetExport => {
                let name = name.unwrap_or_default();
                validate_name(name)?;
                body.push_str(kind.keyword());
                body.push(' ');
                body.push_str(name);
                body.push(':');
                body.push_str(&escape(value.unwrap_or_default()));
            }
            MessageKind::Erase => {
                let name = name.unwrap_or_default();
                validate_name(name)?;
                body.push_str(ERASE_CMD);
                body.push(' ');
                body.push_str(name);
            }
            MessageKind::Barrier | MessageKind::BarrierReply => {
                body.push_str(kind.keyword());
            }
            MessageKind::Comment => return Ok(Self::comment(value.unwrap_or_default())),
        }
        body.push('\n');
        Ok(Self {
            kind,
            body: Arc::from(body.into_bytes()),
        })
    }

    pub fn set(name: &str, value: &str, exported: bool) -> Result<Self> {
        let kind = if exported {
            MessageKind::SetExport
        } else {
            MessageKind::Set
        };
        Self::encode(kind, Some(name), Some(value))
    }

    pub fn erase(name: &str) -> Result<Self> {
        Self::encode(MessageKind::Erase, Some(name), None)
    }

    pub fn barrier() -> Self {
        Self::bare(MessageKind::Barrier)
    }

    pub fn barrier_reply() -> Self {
        Self::bare(MessageKind::BarrierReply)
    }

    /// A `#` line. Newlines in `text` are replaced so the comment stays one line.
    pub fn comment(text: &str) -> Self {
        let text = text.replace('\n', " ");
        let mut body = Vec::with_capacity(text.len() + 2);
        body.push(b'#');
        body.extend_from_slice(text.as_bytes());
        body.push(b'\n');
        Self {
            kind: MessageKind::Comment,
            body: Arc::from(body),
        }
    }

    pub fn from_event(event: &Event) -> Result<Self> {
        match event {
            Event::Set {
                name,
                value,
                exported,
            } => Self::set(name, value, *exported),
            Event::Erase { name } => Self::erase(name),
            Event::Barrier => Ok(Self::barrier()),
            Event::BarrierReply => Ok(Self::barrier_reply()),
        }
    }

    /// Wrap an already-encoded line (with or without its newline) for
    /// relaying byte-for-byte.
    pub fn from_line(kind: MessageKind, line: &[u8]) -> Self {
        let mut body = Vec::with_capacity(line.len() + 1);
        body.extend_from_slice(line);
        if body.last() != Some(&b'\n') {
            body.push(b'\n');
        }
        Self {
            kind,
            body: Arc::from(body),
        }
    }

    fn bare(kind: MessageKind) -> Self {
        let mut body = Vec::with_capacity(kind.keyword().len() + 1);
        body.extend_from_slice(kind.keyword().as_bytes());
        body.push(b'\n');
        Self {
            kind,
            body: Arc::from(body),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Encoded bytes, including the trailing newline
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Number of live handles on this message (queues plus the caller's)
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.body)
    }
}

/// Characters that may be written without escaping
fn is_safe_to_encode_directly(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '/'
}

/// Escape a value for the wire
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if is_safe_to_encode_directly(c) {
            out.push(c);
            continue;
        }
        let cp = c as u32;
        // Writing to a String cannot fail.
        let _ = if cp < 0x100 {
            write!(out, "\\x{:02x}", cp)
        } else if cp < 0x10000 {
            write!(out, "\\u{:04x}", cp)
        } else {
            write!(out, "\\U{:08x}", cp)
        };
    }
    out
}

/// Reverse [`escape`]. Also accepts the usual C-style backslash escapes so
/// hand-edited files still load. Returns `None` on a malformed sequence.
pub fn unescape(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let decoded = match chars.next()? {
            'x' => read_hex(&mut chars, 2)?,
            'u' => read_hex(&mut chars, 4)?,
            'U' => read_hex(&mut chars, 8)?,
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'a' => '\x07',
            'b' => '\x08',
            'e' => '\x1b',
            'f' => '\x0c',
            'v' => '\x0b',
            other => other,
        };
        out.push(decoded);
    }
    Some(out)
}

fn read_hex(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, max_digits: usize) -> Option<char> {
    let mut cp: u32 = 0;
    let mut digits = 0;
    while digits < max_digits {
        let Some(d) = chars.peek().and_then(|c| c.to_digit(16)) else {
            break;
        };
        cp = cp.checked_mul(16)?.checked_add(d)?;
        chars.next();
        digits += 1;
    }
    if digits == 0 {
        return None;
    }
    char::from_u32(cp)
}

/// If `msg` starts with `cmd` (case-insensitively) followed by end of line
/// or whitespace, return the remainder.
fn match_command<'a>(msg: &'a str, cmd: &str) -> Option<&'a str> {
    let head = msg.get(..cmd.len())?;
    if !head.eq_ignore_ascii_case(cmd) {
        return None;
    }
    let rest = &msg[cmd.len()..];
    match rest.chars().next() {
        None | Some(' ') | Some('\t') => Some(rest),
        _ => None,
    }
}

fn skip_blanks(s: &str) -> &str {
    s.trim_start_matches([' ', '\t'])
}

fn parse_set(msg: &str, rest: &str, exported: bool) -> std::result::Result<Event, ProtocolError> {
    let rest = skip_blanks(rest);
    let (name, escaped) = rest
        .split_once(':')
        .ok_or_else(|| ProtocolError::MissingSeparator(msg.to_string()))?;
    if !is_valid_name(name) {
        return Err(ProtocolError::InvalidName(msg.to_string()));
    }
    let value = unescape(escaped).ok_or_else(|| ProtocolError::BadEscape(msg.to_string()))?;
    Ok(Event::Set {
        name: name.to_string(),
        value,
        exported,
    })
}

fn parse_erase(msg: &str, rest: &str) -> std::result::Result<Event, ProtocolError> {
    let rest = skip_blanks(rest);
    let end = rest
        .char_indices()
        .find(|&(_, c)| !is_name_char(c))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    if end == 0 {
        return Err(ProtocolError::MissingName(msg.to_string()));
    }
    Ok(Event::Erase {
        name: rest[..end].to_string(),
    })
}

/// Decode one line (without its newline).
///
/// Returns `Ok(None)` for comments and blank lines.
pub fn decode(msg: &str) -> std::result::Result<Option<Event>, ProtocolError> {
    if msg.starts_with('#') || msg.trim().is_empty() {
        return Ok(None);
    }

    // SET_EXPORT and BARRIER_REPLY share prefixes with SET and BARRIER, but
    // match_command requires a separator after the verb so order is free.
    if let Some(rest) = match_command(msg, SET_CMD) {
        return parse_set(msg, rest, false).map(Some);
    }
    if let Some(rest) = match_command(msg, SET_EXPORT_CMD) {
        return parse_set(msg, rest, true).map(Some);
    }
    if let Some(rest) = match_command(msg, ERASE_CMD) {
        return parse_erase(msg, rest).map(Some);
    }
    if match_command(msg, BARRIER_CMD).is_some() {
        return Ok(Some(Event::Barrier));
    }
    if match_command(msg, BARRIER_REPLY_CMD).is_some() {
        return Ok(Some(Event::BarrierReply));
    }
    Err(ProtocolError::Unrecognized(msg.to_string()))
}

/// Decode one raw line, transcoding it from UTF-8 first
pub fn decode_bytes(line: &[u8]) -> std::result::Result<Option<Event>, ProtocolError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::InvalidUtf8(String::from_utf8_lossy(line).into_owned()))?;
    decode(text)
}
