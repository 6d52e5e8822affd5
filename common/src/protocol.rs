//! Line-oriented wire protocol shared by the client layer and the engine.
//!
//! The channel carries ASCII lines terminated by LF. Server-to-client lines
//! fall into six classes: `OK`/`ERR` terminals, `S` status lines, `D`
//! percent-escaped data lines, `INQUIRE` requests and `#` comments.
//! Client-to-server lines are command lines plus the `D`/`END`/`CAN` replies
//! used to answer an inquiry.

use crate::error::{Error, Result};

/// Maximum wire line length in bytes, including the LF terminator.
pub const MAX_LINE_LEN: usize = 1002;

/// Numeric codes carried on `ERR` terminal lines.
pub mod codes {
    pub const GENERAL_ERROR: u32 = 1;
    pub const NOT_IMPLEMENTED: u32 = 100;
    pub const UNKNOWN_COMMAND: u32 = 103;
    pub const SYNTAX_ERROR: u32 = 104;
    pub const LINE_TOO_LONG: u32 = 107;
    pub const CANCELED: u32 = 111;
    pub const INQUIRE_ERROR: u32 = 121;
}

/// One server-to-client line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Terminal success line, with optional trailing text.
    Ok(Option<String>),
    /// Terminal failure line with a numeric code and description.
    Err { code: u32, message: String },
    /// Status line: `S <keyword> [args]`.
    Status { keyword: String, args: String },
    /// Inline data chunk, percent-decoded.
    Data(Vec<u8>),
    /// Mid-command request for client-supplied data.
    Inquire { keyword: String, params: String },
    /// Comment line, ignored by the protocol state machine.
    Comment(String),
}

impl Response {
    /// True for the `OK`/`ERR` lines that end a command cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Response::Ok(_) | Response::Err { .. })
    }
}

/// One client-to-server line, classified. Used by the acceptor side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A command line: first word is the command name.
    Command { name: String, args: String },
    /// Inline data chunk answering an inquiry, percent-decoded.
    Data(Vec<u8>),
    /// End of inquiry data.
    End,
    /// Inquiry cancelled by the client.
    Can,
    /// Comment line.
    Comment(String),
}

/// Classify one server-to-client line (without its LF terminator).
pub fn parse_response(line: &str) -> Result<Response> {
    if let Some(rest) = line.strip_prefix('#') {
        return Ok(Response::Comment(rest.trim().to_string()));
    }
    if line == "OK" {
        return Ok(Response::Ok(None));
    }
    if let Some(rest) = line.strip_prefix("OK ") {
        return Ok(Response::Ok(Some(rest.to_string())));
    }
    if let Some(rest) = line.strip_prefix("ERR ") {
        let mut parts = rest.splitn(2, ' ');
        let code = parts
            .next()
            .and_then(|c| c.parse::<u32>().ok())
            .ok_or_else(|| Error::protocol(format!("bad ERR line: {line:?}")))?;
        let message = parts.next().unwrap_or("").to_string();
        return Ok(Response::Err { code, message });
    }
    if let Some(rest) = line.strip_prefix("D ") {
        return Ok(Response::Data(unescape_data(rest)?));
    }
    if let Some(rest) = line.strip_prefix("S ") {
        let mut parts = rest.splitn(2, ' ');
        let keyword = parts.next().unwrap_or("").to_string();
        if keyword.is_empty() {
            return Err(Error::protocol(format!("status line without keyword: {line:?}")));
        }
        let args = parts.next().unwrap_or("").to_string();
        return Ok(Response::Status { keyword, args });
    }
    if let Some(rest) = line.strip_prefix("INQUIRE ") {
        let mut parts = rest.splitn(2, ' ');
        let keyword = parts.next().unwrap_or("").to_string();
        if keyword.is_empty() {
            return Err(Error::protocol(format!("inquire line without keyword: {line:?}")));
        }
        let params = parts.next().unwrap_or("").to_string();
        return Ok(Response::Inquire { keyword, params });
    }
    Err(Error::protocol(format!("unrecognized line class: {line:?}")))
}

/// Classify one client-to-server line (without its LF terminator).
pub fn parse_request(line: &str) -> Result<Request> {
    if let Some(rest) = line.strip_prefix('#') {
        return Ok(Request::Comment(rest.trim().to_string()));
    }
    if let Some(rest) = line.strip_prefix("D ") {
        return Ok(Request::Data(unescape_data(rest)?));
    }
    if line == "END" {
        return Ok(Request::End);
    }
    if line == "CAN" {
        return Ok(Request::Can);
    }
    if line.is_empty() {
        return Err(Error::protocol("empty command line"));
    }
    let mut parts = line.splitn(2, ' ');
    let name = parts.next().unwrap_or("").to_string();
    let args = parts.next().unwrap_or("").to_string();
    Ok(Request::Command { name, args })
}

/// Validate a command line before it is put on the wire.
pub fn check_command_line(line: &str) -> Result<()> {
    if line.is_empty() {
        return Err(Error::protocol("empty command line"));
    }
    if line.bytes().any(|b| b == b'\n' || b == b'\r') {
        return Err(Error::protocol("command line contains a line terminator"));
    }
    if line.len() + 1 > MAX_LINE_LEN {
        return Err(Error::protocol(format!(
            "command line of {} bytes exceeds the {} byte limit",
            line.len() + 1,
            MAX_LINE_LEN
        )));
    }
    Ok(())
}

/// Percent-escape a data payload for transmission on a `D` line.
///
/// Only `%`, CR and LF need escaping; everything else passes through.
pub fn escape_data(payload: &[u8]) -> String {
    let mut out = String::with_capacity(payload.len());
    for &b in payload {
        match b {
            b'%' => out.push_str("%25"),
            b'\r' => out.push_str("%0D"),
            b'\n' => out.push_str("%0A"),
            _ => out.push(b as char),
        }
    }
    out
}

/// Reverse [`escape_data`]. Fails on truncated or non-hex escapes.
pub fn unescape_data(escaped: &str) -> Result<Vec<u8>> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).copied();
            let lo = bytes.get(i + 2).copied();
            match (hi.and_then(hex_val), lo.and_then(hex_val)) {
                (Some(h), Some(l)) => {
                    out.push((h << 4) | l);
                    i += 3;
                }
                _ => {
                    return Err(Error::protocol(format!(
                        "malformed percent escape in data line at byte {i}"
                    )))
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Split a payload into `D ` lines that each fit the wire limit.
///
/// Escaping happens per byte so a chunk never ends inside an escape sequence.
pub fn data_lines(payload: &[u8]) -> Vec<String> {
    // "D " prefix plus LF leave this much room for escaped payload bytes.
    let capacity = MAX_LINE_LEN - 3;
    let mut lines = Vec::new();
    let mut current = String::from("D ");
    let mut used = 0;
    for &b in payload {
        let escaped: &str = match b {
            b'%' => "%25",
            b'\r' => "%0D",
            b'\n' => "%0A",
            _ => "",
        };
        let cost = if escaped.is_empty() { 1 } else { escaped.len() };
        if used + cost > capacity {
            lines.push(current);
            current = String::from("D ");
            used = 0;
        }
        if escaped.is_empty() {
            current.push(b as char);
        } else {
            current.push_str(escaped);
        }
        used += cost;
    }
    if used > 0 || lines.is_empty() {
        lines.push(current);
    }
    lines
}
