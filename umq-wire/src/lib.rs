#![deny(unsafe_code)]

//! Wire dialect for the UMQ peer protocol.
//!
//! Every text frame on the channel is one envelope:
//!
//! ```text
//! [ 'A' <count36> ':' ] <cmd> <id36> ':' <rest>
//! ```
//!
//! The optional `A<count36>:` prefix announces that the next `count36`
//! binary frames belong to the envelope that follows it. `cmd` is a single
//! ASCII letter from the closed set below, `id36` is a base-36 number
//! (digits `0-9A-Z`, empty string meaning zero), and exactly one `:`
//! separates the header from the body. The body is carried verbatim; no
//! escaping is applied at this layer.
//!
//! Binary frames have no header at all: their bytes are the attachment
//! payload, matched FIFO against previously announced slots.

/// Protocol version, carried as the id field of `H` and `W` frames.
pub const PROTOCOL_VERSION: u64 = 1;

/// Wire-level error codes, used in `F` payloads and in the
/// `"<code> <message>"` convention for `E` and `!` bodies.
pub mod codes {
    /// Peer rejected the connection.
    pub const REJECTED: u64 = 1;
    /// Callback id was not found.
    pub const CALLBACK_NOT_FOUND: u64 = 2;
    /// Malformed message.
    pub const PROTOCOL_ERROR: u64 = 3;
    /// Command letter outside the closed set.
    pub const UNSUPPORTED_COMMAND: u64 = 4;
    /// Peer's protocol version is too old.
    pub const UNSUPPORTED_VERSION: u64 = 5;
    /// RPC request arrived but nobody serves RPC.
    pub const NO_RPC_SERVER: u64 = 6;
    /// RPC request could not be routed.
    pub const RPC_ROUTE_ERROR: u64 = 7;
    /// RPC service exists but is temporarily unavailable.
    pub const RPC_TEMPORARILY_UNAVAILABLE: u64 = 8;
}

/// Human-readable text for a wire error code.
pub fn code_message(code: u64) -> &'static str {
    match code {
        codes::REJECTED => "Client rejected",
        codes::CALLBACK_NOT_FOUND => "Callback not found",
        codes::PROTOCOL_ERROR => "Protocol format error",
        codes::UNSUPPORTED_COMMAND => "Unsupported command",
        codes::UNSUPPORTED_VERSION => "Unsupported version",
        codes::NO_RPC_SERVER => "No RPC server",
        codes::RPC_ROUTE_ERROR => "RPC route error",
        codes::RPC_TEMPORARILY_UNAVAILABLE => "RPC temporarily unavailable",
        _ => "Unknown error code",
    }
}

/// Format an error payload as `"<code> <message>"` with the standard
/// message for the code.
pub fn format_error(code: u64) -> String {
    format!("{} {}", code, code_message(code))
}

/// Split an error payload of the form `"<code> <message>"`.
///
/// Returns code 0 and the whole payload when no leading decimal number is
/// present, mirroring how the protocol treats free-form error text.
pub fn parse_error(payload: &str) -> (u64, &str) {
    let digits = payload.len() - payload.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return (0, payload);
    }
    let Ok(code) = payload[..digits].parse::<u64>() else {
        return (0, payload);
    };
    match payload[digits..].strip_prefix(' ') {
        Some(rest) => (code, rest),
        None if payload.len() == digits => (code, ""),
        None => (0, payload),
    }
}

/// Command letters of the protocol. The set is closed: anything else on
/// the wire is a fatal `UNSUPPORTED_COMMAND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cmd {
    /// `A`: announces binary attachments for the envelope that follows.
    Attachment,
    /// `-`: rejects the next pending inbound attachment slot.
    AttachmentError,
    /// `H`: hello; the id field carries the sender's protocol version.
    Hello,
    /// `W`: welcome; the id field carries the sender's protocol version.
    Welcome,
    /// `F`: fatal error; body is `"<code> <message>"`.
    Fatal,
    /// `C`: RPC call (or callback invocation, body `"<cb36>:<rest>"`).
    RpcCall,
    /// `B`: callback invocation on a reserved, unambiguous path.
    CallbackCall,
    /// `R`: RPC result.
    RpcResult,
    /// `E`: RPC exception.
    RpcException,
    /// `!`: RPC execute error (routing/dispatch failed).
    RpcError,
    /// `T`: topic update.
    TopicUpdate,
    /// `D`: topic close, sent by the publisher.
    TopicClose,
    /// `U`: topic unsubscribe, sent by the subscriber.
    TopicUnsubscribe,
    /// `S`: attribute set; body is `"<name>=<value>"`.
    AttributeSet,
    /// `X`: attribute reset; body is the attribute name.
    AttributeReset,
}

impl Cmd {
    /// The wire letter for this command.
    pub const fn letter(self) -> char {
        match self {
            Cmd::Attachment => 'A',
            Cmd::AttachmentError => '-',
            Cmd::Hello => 'H',
            Cmd::Welcome => 'W',
            Cmd::Fatal => 'F',
            Cmd::RpcCall => 'C',
            Cmd::CallbackCall => 'B',
            Cmd::RpcResult => 'R',
            Cmd::RpcException => 'E',
            Cmd::RpcError => '!',
            Cmd::TopicUpdate => 'T',
            Cmd::TopicClose => 'D',
            Cmd::TopicUnsubscribe => 'U',
            Cmd::AttributeSet => 'S',
            Cmd::AttributeReset => 'X',
        }
    }

    /// Look up a command by its wire letter.
    pub const fn from_letter(c: char) -> Option<Cmd> {
        Some(match c {
            'A' => Cmd::Attachment,
            '-' => Cmd::AttachmentError,
            'H' => Cmd::Hello,
            'W' => Cmd::Welcome,
            'F' => Cmd::Fatal,
            'C' => Cmd::RpcCall,
            'B' => Cmd::CallbackCall,
            'R' => Cmd::RpcResult,
            'E' => Cmd::RpcException,
            '!' => Cmd::RpcError,
            'T' => Cmd::TopicUpdate,
            'D' => Cmd::TopicClose,
            'U' => Cmd::TopicUnsubscribe,
            'S' => Cmd::AttributeSet,
            'X' => Cmd::AttributeReset,
            _ => return None,
        })
    }
}

/// Error from parsing a text envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// No `:` between header and body.
    MissingSeparator,
    /// Empty header (no command letter).
    EmptyHeader,
    /// Command letter outside the closed set.
    UnknownCommand(char),
    /// Id field contains a byte outside `0-9A-Z`, or overflows.
    InvalidId,
}

impl ParseError {
    /// The wire error code to report this failure with.
    pub fn wire_code(&self) -> u64 {
        match self {
            ParseError::UnknownCommand(_) => codes::UNSUPPORTED_COMMAND,
            _ => codes::PROTOCOL_ERROR,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::MissingSeparator => write!(f, "missing ':' separator"),
            ParseError::EmptyHeader => write!(f, "empty envelope header"),
            ParseError::UnknownCommand(c) => write!(f, "unknown command letter {c:?}"),
            ParseError::InvalidId => write!(f, "invalid message id format"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Encode an id in base 36 using `0-9A-Z`, appending to `out`.
///
/// Zero encodes as the empty string.
pub fn encode_id(mut id: u64, out: &mut String) {
    let mut digits = [0u8; 13];
    let mut n = 0;
    while id != 0 {
        let d = (id % 36) as u8;
        id /= 36;
        digits[n] = if d < 10 { b'0' + d } else { b'A' + (d - 10) };
        n += 1;
    }
    while n != 0 {
        n -= 1;
        out.push(digits[n] as char);
    }
}

/// Base-36 encode an id into a fresh string.
pub fn id_to_string(id: u64) -> String {
    let mut s = String::new();
    encode_id(id, &mut s);
    s
}

/// Decode a base-36 id. The empty string decodes to zero.
pub fn decode_id(text: &str) -> Result<u64, ParseError> {
    let mut accum: u64 = 0;
    for c in text.bytes() {
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'A'..=b'Z' => c - b'A' + 10,
            _ => return Err(ParseError::InvalidId),
        };
        accum = accum
            .checked_mul(36)
            .and_then(|a| a.checked_add(digit as u64))
            .ok_or(ParseError::InvalidId)?;
    }
    Ok(accum)
}

/// One parsed text envelope.
///
/// An `A<count36>:` prefix parses as `cmd == Cmd::Attachment` with the
/// announced count in `id` and the inner envelope, unparsed, in `body`;
/// callers peel prefixes until a non-`A` command appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub cmd: Cmd,
    pub id: u64,
    pub body: &'a str,
}

impl<'a> Envelope<'a> {
    /// Parse one envelope header off a text frame.
    pub fn parse(line: &'a str) -> Result<Self, ParseError> {
        let sep = line.find(':').ok_or(ParseError::MissingSeparator)?;
        let (header, body) = (&line[..sep], &line[sep + 1..]);
        let mut chars = header.chars();
        let letter = chars.next().ok_or(ParseError::EmptyHeader)?;
        let cmd = Cmd::from_letter(letter).ok_or(ParseError::UnknownCommand(letter))?;
        let id = decode_id(chars.as_str())?;
        Ok(Envelope { cmd, id, body })
    }
}

/// Encode a text envelope, with an `A<count36>:` prefix when
/// `attachments` is nonzero.
pub fn encode_envelope(attachments: usize, cmd: Cmd, id: u64, body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 20);
    if attachments != 0 {
        out.push(Cmd::Attachment.letter());
        encode_id(attachments as u64, &mut out);
        out.push(':');
    }
    out.push(cmd.letter());
    encode_id(id, &mut out);
    out.push(':');
    out.push_str(body);
    out
}
