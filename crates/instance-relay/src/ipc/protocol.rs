//! Message payloads and wire framing for the stream transport.
//!
//! A frame is a 4-byte little-endian length prefix followed by exactly that many
//! payload bytes:
//!
//! ```text
//! [u32 LE: len][payload bytes of len]
//! ```
//!
//! The payload is either JSON (`{"processid": 42, "args": ["--foo"]}`) or a compact
//! binary layout; see [`PacketEncoding`]. Both decode to [`NextInstanceMessage`].

use crate::config::{PacketEncoding, RelayConfig};
use crate::error::{RelayError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// One follower launch, as seen by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextInstanceMessage {
    #[serde(rename = "processid")]
    pub process_id: i32,
    #[serde(rename = "args", default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
}

impl NextInstanceMessage {
    pub fn new(process_id: i32, arguments: Vec<String>) -> Self {
        Self {
            process_id,
            arguments,
        }
    }

    /// Encode the message as a payload (without the length prefix).
    pub fn encode(&self, encoding: PacketEncoding) -> Result<Vec<u8>> {
        match encoding {
            PacketEncoding::Json => Ok(serde_json::to_vec(self)?),
            PacketEncoding::Binary => self.encode_binary(),
        }
    }

    /// Decode a payload. Any structural problem is a [`RelayError::MalformedPacket`].
    pub fn decode(payload: &[u8], encoding: PacketEncoding) -> Result<Self> {
        match encoding {
            PacketEncoding::Json => serde_json::from_slice(payload)
                .map_err(|e| RelayError::malformed(format!("invalid JSON payload: {}", e))),
            PacketEncoding::Binary => Self::decode_binary(payload),
        }
    }

    fn encode_binary(&self) -> Result<Vec<u8>> {
        let count = i32::try_from(self.arguments.len())
            .map_err(|_| RelayError::Other("too many arguments to encode".to_string()))?;

        let body_len: usize = self.arguments.iter().map(|a| a.len() + 5).sum();
        let mut buf = BytesMut::with_capacity(8 + body_len);
        buf.put_i32_le(self.process_id);
        buf.put_i32_le(count);
        for arg in &self.arguments {
            put_varint(&mut buf, arg.len());
            buf.put_slice(arg.as_bytes());
        }
        Ok(buf.to_vec())
    }

    fn decode_binary(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < 8 {
            return Err(RelayError::malformed("binary header is truncated"));
        }
        let process_id = buf.get_i32_le();
        let count = buf.get_i32_le();
        if count < 0 {
            return Err(RelayError::malformed(format!(
                "negative argument count {}",
                count
            )));
        }
        let count = count as usize;
        // Every argument takes at least its one-byte length
        if count > buf.remaining() {
            return Err(RelayError::malformed(format!(
                "argument count {} exceeds payload size",
                count
            )));
        }

        let mut arguments = Vec::with_capacity(count);
        for index in 0..count {
            let len = get_varint(&mut buf)?;
            if len > buf.remaining() {
                return Err(RelayError::malformed(format!(
                    "argument {} is truncated",
                    index
                )));
            }
            let text = std::str::from_utf8(&buf[..len]).map_err(|e| {
                RelayError::malformed(format!("argument {} is not UTF-8: {}", index, e))
            })?;
            arguments.push(text.to_string());
            buf.advance(len);
        }

        if buf.has_remaining() {
            return Err(RelayError::malformed(format!(
                "{} trailing bytes after message",
                buf.remaining()
            )));
        }

        Ok(Self {
            process_id,
            arguments,
        })
    }
}

/// Write a 7-bit variable-length integer, low bits first.
fn put_varint(buf: &mut BytesMut, mut value: usize) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(buf: &mut &[u8]) -> Result<usize> {
    let mut value: u32 = 0;
    for shift in (0..35).step_by(7) {
        if !buf.has_remaining() {
            return Err(RelayError::malformed("string length is truncated"));
        }
        let byte = buf.get_u8();
        if shift == 28 && byte > 0x0f {
            return Err(RelayError::malformed("string length overflows 32 bits"));
        }
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value as usize);
        }
    }
    Err(RelayError::malformed("string length overflows 32 bits"))
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` when the peer closes before sending any byte. A prefix or
/// payload cut short by EOF is a malformed packet, never a partial success.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let first = reader.read(&mut len_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    if first < len_buf.len() {
        read_exact_or_malformed(reader, &mut len_buf[first..], "length prefix is truncated")
            .await?;
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > RelayConfig::MAX_PACKET_SIZE {
        return Err(RelayError::PacketTooLarge {
            size: len,
            max: RelayConfig::MAX_PACKET_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    read_exact_or_malformed(reader, &mut payload, "payload is shorter than declared").await?;

    Ok(Some(payload))
}

async fn read_exact_or_malformed<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    reason: &str,
) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(RelayError::malformed(reason))
        }
        Err(e) => Err(e.into()),
    }
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > RelayConfig::MAX_PACKET_SIZE {
        return Err(RelayError::PacketTooLarge {
            size: payload.len(),
            max: RelayConfig::MAX_PACKET_SIZE,
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
