//! Provides the wire codec of the cache protocol.
//!
//! Callisto speaks RESP framing (the "REdis Serialization Protocol") on its TCP
//! port: a request is an array of bulk strings (`*2\r\n$8\r\nSYS.PING\r\n...`), a
//! response is a simple string, an error or a single bulk string carrying the raw
//! value bytes. Sticking to RESP means every Redis client and `redis-cli` can
//! talk to a node, which is invaluable for debugging a cache cluster.
//!
//! As requests arrive via the network, the parser has to cope with partial data:
//! [Frame::parse](Frame::parse) returns `Ok(None)` until a complete frame is
//! buffered and only fails on actually malformed input. The same contract holds
//! for [Reply::parse](Reply::parse), which the peer client uses to read
//! responses.
//!
//! # Examples
//!
//! Parsing a complete request:
//! ```
//! # use bytes::BytesMut;
//! # use callisto::protocol::Frame;
//! let buffer = BytesMut::from("*2\r\n$8\r\nSYS.PING\r\n$4\r\ntest\r\n");
//! let frame = Frame::parse(&buffer).unwrap().unwrap();
//!
//! assert_eq!(frame.command(), "SYS.PING");
//! assert_eq!(frame.arg_count(), 1);
//! assert_eq!(frame.str_arg(0).unwrap(), "test");
//! ```
//!
//! Parsing a partial request:
//! ```
//! # use bytes::BytesMut;
//! # use callisto::protocol::Frame;
//! let buffer = BytesMut::from("*2\r\n$8\r\nSYS.PI");
//! assert_eq!(Frame::parse(&buffer).unwrap().is_none(), true);
//! ```
use anyhow::{anyhow, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};

const ASTERISK: u8 = b'*';
const DOLLAR: u8 = b'$';
const PLUS: u8 = b'+';
const MINUS: u8 = b'-';
const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// A parsed request frame: a command followed by its arguments.
pub struct Frame {
    len: usize,
    args: Vec<Bytes>,
}

impl Frame {
    /// Tries to parse a request frame from the given buffer.
    ///
    /// Returns `Ok(None)` while the buffer only holds a partial frame and an
    /// **Err** for malformed data. On success, [len](Frame::len) reports how many
    /// bytes of the buffer were consumed.
    pub fn parse(buffer: &BytesMut) -> Result<Option<Frame>> {
        if buffer.is_empty() {
            return Ok(None);
        }
        if buffer[0] != ASTERISK {
            return Err(anyhow!("A request must be an array of bulk strings!"));
        }

        let (num_args, mut offset) = match read_decimal(buffer, 1)? {
            Some(result) => result,
            None => return Ok(None),
        };
        if num_args == 0 {
            return Err(anyhow!("A request must contain at least a command!"));
        }

        let mut ranges = Vec::with_capacity(num_args);
        for _ in 0..num_args {
            match read_bulk(buffer, offset)? {
                Some((range, next_offset)) => {
                    ranges.push(range);
                    offset = next_offset;
                }
                None => return Ok(None),
            }
        }

        let data = buffer.clone().freeze();
        Ok(Some(Frame {
            len: offset,
            args: ranges
                .into_iter()
                .map(|(start, end)| data.slice(start..end))
                .collect(),
        }))
    }

    /// Returns the command of this frame (its first element).
    ///
    /// A command which isn't valid UTF-8 is reported as empty and will simply be
    /// rejected as unknown by the dispatcher.
    pub fn command(&self) -> &str {
        std::str::from_utf8(&self.args[0]).unwrap_or("")
    }

    /// Returns the number of arguments (not counting the command itself).
    pub fn arg_count(&self) -> usize {
        self.args.len() - 1
    }

    /// Returns the n-th argument (not counting the command).
    pub fn arg(&self, index: usize) -> Result<Bytes> {
        self.args
            .get(index + 1)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "Invalid argument index {} (only {} are present)",
                    index,
                    self.arg_count()
                )
            })
    }

    /// Returns the n-th argument as UTF-8 string.
    pub fn str_arg(&self, index: usize) -> Result<&str> {
        let arg = self
            .args
            .get(index + 1)
            .ok_or_else(|| {
                anyhow!(
                    "Invalid argument index {} (only {} are present)",
                    index,
                    self.arg_count()
                )
            })?;

        std::str::from_utf8(arg)
            .with_context(|| format!("Argument {} is not a valid UTF-8 string!", index))
    }

    /// Returns the total number of consumed bytes for this frame.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Determines if the frame consumed no bytes (never the case for parsed
    /// frames, provided for completeness).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A single response value.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// A short status line, e.g. `PONG`.
    Simple(String),
    /// An error line. By convention the message starts with an upper-case error
    /// kind (`CLIENT:`, `SERVER:`, `NOTFOUND:`, `BADREQUEST:`).
    Error(String),
    /// The raw bytes of a cache value.
    Bulk(Bytes),
}

impl Reply {
    /// Serializes this reply into the given buffer.
    ///
    /// Line breaks within simple and error strings would break the framing and
    /// are replaced by blanks.
    pub fn encode(&self, buffer: &mut BytesMut) {
        match self {
            Reply::Simple(message) => {
                buffer.put_u8(PLUS);
                buffer.put_slice(sanitize_line(message).as_bytes());
                buffer.put_slice(b"\r\n");
            }
            Reply::Error(message) => {
                buffer.put_u8(MINUS);
                buffer.put_slice(sanitize_line(message).as_bytes());
                buffer.put_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                buffer.put_u8(DOLLAR);
                buffer.put_slice(data.len().to_string().as_bytes());
                buffer.put_slice(b"\r\n");
                buffer.put_slice(data);
                buffer.put_slice(b"\r\n");
            }
        }
    }

    /// Tries to parse a reply from the given buffer.
    ///
    /// Returns the reply and the number of consumed bytes, `Ok(None)` for partial
    /// data and an **Err** for malformed data.
    pub fn parse(buffer: &BytesMut) -> Result<Option<(Reply, usize)>> {
        if buffer.is_empty() {
            return Ok(None);
        }

        match buffer[0] {
            PLUS => Ok(read_line(buffer, 1)?
                .map(|(message, offset)| (Reply::Simple(message), offset))),
            MINUS => Ok(read_line(buffer, 1)?
                .map(|(message, offset)| (Reply::Error(message), offset))),
            DOLLAR => match read_bulk(buffer, 0)? {
                Some(((start, end), offset)) => Ok(Some((
                    Reply::Bulk(buffer.clone().freeze().slice(start..end)),
                    offset,
                ))),
                None => Ok(None),
            },
            other => Err(anyhow!("Unexpected reply marker: 0x{:02x}", other)),
        }
    }
}

/// Serializes a request (a command with arguments) into the given buffer.
///
/// This is the client-side counterpart of [Frame::parse](Frame::parse).
///
/// # Example
/// ```
/// # use bytes::BytesMut;
/// # use callisto::protocol::{encode_command, Frame};
/// let mut buffer = BytesMut::new();
/// encode_command(&[b"CACHE.GET", b"assets", b"logo.png"], &mut buffer);
///
/// let frame = Frame::parse(&buffer).unwrap().unwrap();
/// assert_eq!(frame.command(), "CACHE.GET");
/// assert_eq!(frame.str_arg(0).unwrap(), "assets");
/// assert_eq!(frame.str_arg(1).unwrap(), "logo.png");
/// ```
pub fn encode_command(args: &[&[u8]], buffer: &mut BytesMut) {
    buffer.put_u8(ASTERISK);
    buffer.put_slice(args.len().to_string().as_bytes());
    buffer.put_slice(b"\r\n");

    for arg in args {
        buffer.put_u8(DOLLAR);
        buffer.put_slice(arg.len().to_string().as_bytes());
        buffer.put_slice(b"\r\n");
        buffer.put_slice(arg);
        buffer.put_slice(b"\r\n");
    }
}

/// Replaces line breaks so that a message fits on a single protocol line.
fn sanitize_line(message: &str) -> String {
    message.replace(['\r', '\n'], " ")
}

/// Reads a decimal number terminated by CRLF.
///
/// Returns the number and the offset behind the CRLF, or **None** if the buffer
/// ends before the terminator.
fn read_decimal(buffer: &BytesMut, offset: usize) -> Result<Option<(usize, usize)>> {
    let mut value: usize = 0;
    let mut index = offset;

    while index < buffer.len() {
        match buffer[index] {
            digit @ b'0'..=b'9' => {
                value = value
                    .checked_mul(10)
                    .and_then(|value| value.checked_add((digit - b'0') as usize))
                    .ok_or_else(|| anyhow!("Malformed integer at position {}", index))?;
                index += 1;
            }
            CR => {
                if index == offset {
                    return Err(anyhow!("Malformed integer at position {}", index));
                }
                return if index + 1 < buffer.len() {
                    if buffer[index + 1] != LF {
                        Err(anyhow!("Expected LF after CR at position {}", index + 1))
                    } else {
                        Ok(Some((value, index + 2)))
                    }
                } else {
                    Ok(None)
                };
            }
            _ => return Err(anyhow!("Malformed integer at position {}", index)),
        }
    }

    Ok(None)
}

/// Reads a bulk string (`$<len>\r\n<data>\r\n`) starting at the given offset.
///
/// Returns the data range and the offset behind the trailing CRLF, or **None**
/// for partial data.
fn read_bulk(buffer: &BytesMut, offset: usize) -> Result<Option<((usize, usize), usize)>> {
    if offset >= buffer.len() {
        return Ok(None);
    }
    if buffer[offset] != DOLLAR {
        return Err(anyhow!("Expected a bulk string at position {}", offset));
    }

    let (length, data_start) = match read_decimal(buffer, offset + 1)? {
        Some(result) => result,
        None => return Ok(None),
    };

    let data_end = data_start + length;
    if buffer.len() < data_end + 2 {
        return Ok(None);
    }
    if buffer[data_end] != CR || buffer[data_end + 1] != LF {
        return Err(anyhow!("Bulk string at position {} is not terminated", offset));
    }

    Ok(Some(((data_start, data_end), data_end + 2)))
}

/// Reads a line terminated by CRLF as UTF-8 string.
fn read_line(buffer: &BytesMut, offset: usize) -> Result<Option<(String, usize)>> {
    let mut index = offset;
    while index + 1 < buffer.len() {
        if buffer[index] == CR && buffer[index + 1] == LF {
            let line = std::str::from_utf8(&buffer[offset..index])
                .context("A protocol line is not valid UTF-8!")?;
            return Ok(Some((line.to_owned(), index + 2)));
        }
        index += 1;
    }

    Ok(None)
}
