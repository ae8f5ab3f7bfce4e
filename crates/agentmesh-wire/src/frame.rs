//! Bridge wire framing.
//!
//! Bridges exchange JSON arrays over a TCP stream:
//!
//! ```text
//! ["JOIN", channel]
//! ["LEAVE", channel]
//! ["SHOUT", sender, channel, payload]
//! ```
//!
//! Each array is framed as an ASCII decimal byte count, a newline, then
//! exactly that many bytes of JSON. Stream sockets carry no message
//! boundaries, so readers must collect the header up to the newline and then
//! read the body in full, however the bytes arrive.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single frame body size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Longest accepted length header, in digits.
const MAX_HEADER_DIGITS: usize = 20;

/// Errors from reading or writing bridge frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Invalid length header: {0}")]
    InvalidHeader(String),
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// One record relayed between bridges.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeFrame {
    /// A local peer joined `channel` for the first time.
    Join { channel: String },
    /// The last local peer left `channel`.
    Leave { channel: String },
    /// `sender` broadcast `payload` on `channel`.
    Shout {
        sender: String,
        channel: String,
        payload: Value,
    },
}

impl BridgeFrame {
    /// The leading tag of the JSON array.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "JOIN",
            Self::Leave { .. } => "LEAVE",
            Self::Shout { .. } => "SHOUT",
        }
    }

    /// Render as the JSON array carried on the wire.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Join { channel } | Self::Leave { channel } => {
                Value::Array(vec![self.kind().into(), channel.as_str().into()])
            }
            Self::Shout {
                sender,
                channel,
                payload,
            } => Value::Array(vec![
                self.kind().into(),
                sender.as_str().into(),
                channel.as_str().into(),
                payload.clone(),
            ]),
        }
    }

    /// Parse the JSON array carried on the wire.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Array(mut items) = value else {
            return Err(FrameError::Malformed("expected a JSON array".into()));
        };
        let kind = match items.first() {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(FrameError::Malformed("missing frame kind".into())),
        };
        let text = |v: &Value, what: &str| -> Result<String, FrameError> {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| FrameError::Malformed(format!("{kind}: {what} must be a string")))
        };

        match (kind.as_str(), items.len()) {
            ("JOIN", 2) => Ok(Self::Join {
                channel: text(&items[1], "channel")?,
            }),
            ("LEAVE", 2) => Ok(Self::Leave {
                channel: text(&items[1], "channel")?,
            }),
            ("SHOUT", 4) => {
                let payload = items.pop().unwrap_or(Value::Null);
                Ok(Self::Shout {
                    sender: text(&items[1], "sender")?,
                    channel: text(&items[2], "channel")?,
                    payload,
                })
            }
            (other, n) => Err(FrameError::Malformed(format!(
                "unexpected frame {other} with {n} elements"
            ))),
        }
    }
}

impl Serialize for BridgeFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BridgeFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        BridgeFrame::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Prefix `body` with its decimal length header.
pub fn encode_raw(body: &[u8]) -> Vec<u8> {
    let header = format!("{}\n", body.len());
    let mut bytes = Vec::with_capacity(header.len() + body.len());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(body);
    bytes
}

/// Encode a frame to bytes (decimal length + newline + JSON).
pub fn encode_frame(frame: &BridgeFrame) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(frame)?;
    Ok(encode_raw(&json))
}

/// Parse a JSON body into a frame.
pub fn decode_frame(body: &[u8]) -> Result<BridgeFrame, FrameError> {
    let value: Value = serde_json::from_slice(body)?;
    BridgeFrame::from_value(value)
}

/// Parse the digits of a length header (without the newline).
pub fn parse_length(digits: &[u8]) -> Result<usize, FrameError> {
    let shown = || String::from_utf8_lossy(digits).into_owned();
    if digits.is_empty() || digits.len() > MAX_HEADER_DIGITS {
        return Err(FrameError::InvalidHeader(shown()));
    }
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::InvalidHeader(shown()));
    }
    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FrameError::InvalidHeader(shown()))?;
    if len == 0 {
        return Err(FrameError::InvalidHeader(shown()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len)
}

/// Read one framed body from a stream.
///
/// End of stream before the first header byte is [`FrameError::ConnectionClosed`];
/// end of stream anywhere later is an I/O error.
pub async fn read_frame_body<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut digits = Vec::with_capacity(8);
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && digits.is_empty() => {
                return Err(FrameError::ConnectionClosed);
            }
            Err(e) => return Err(FrameError::Io(e)),
        };
        if byte == b'\n' {
            break;
        }
        if !byte.is_ascii_digit() || digits.len() >= MAX_HEADER_DIGITS {
            digits.push(byte);
            return Err(FrameError::InvalidHeader(
                String::from_utf8_lossy(&digits).into_owned(),
            ));
        }
        digits.push(byte);
    }

    let len = parse_length(&digits)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Read and decode one frame from a stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<BridgeFrame, FrameError> {
    let body = read_frame_body(reader).await?;
    decode_frame(&body)
}

/// Write a pre-serialized JSON body as one frame.
pub async fn write_raw<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), FrameError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&encode_raw(body)).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &BridgeFrame,
) -> Result<(), FrameError> {
    let json = serde_json::to_vec(frame)?;
    write_raw(writer, &json).await
}

/// Finds frame boundaries in a byte stream without decoding the JSON.
///
/// Bytes are pushed as they arrive from a socket; complete frames come back
/// out exactly as received, header included.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buf: Vec<u8>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete raw frame, if one has fully arrived.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(newline) = self.buf.iter().position(|b| *b == b'\n') else {
            if self.buf.len() > MAX_HEADER_DIGITS || !self.buf.iter().all(u8::is_ascii_digit) {
                return Err(FrameError::InvalidHeader(
                    String::from_utf8_lossy(&self.buf).into_owned(),
                ));
            }
            return Ok(None);
        };
        let len = parse_length(&self.buf[..newline])?;
        let total = newline + 1 + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let rest = self.buf.split_off(total);
        Ok(Some(std::mem::replace(&mut self.buf, rest)))
    }
}
