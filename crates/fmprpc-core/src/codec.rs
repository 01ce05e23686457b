//! Length-prefixed msgpack framing.
//!
//! A frame is a msgpack-encoded unsigned integer holding the body length,
//! followed by exactly that many body bytes. The body decodes to a
//! [`WireMessage`].

use bytes::{BufMut, Bytes, BytesMut};
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RpcError};
use crate::message::WireMessage;

/// Default bound on a single frame body.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 100 * 1024 * 1024;

/// Encodes a message into `[length-prefix][body]`.
pub fn encode_frame(msg: &WireMessage) -> Result<Bytes> {
    let body = value_to_bytes(&msg.to_value())?;
    let mut prefix = Vec::with_capacity(9);
    rmp::encode::write_uint(&mut prefix, body.len() as u64)
        .map_err(|e| RpcError::Encode(e.to_string()))?;
    let mut frame = BytesMut::with_capacity(prefix.len() + body.len());
    frame.put_slice(&prefix);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Msgpack encoding of a single value.
pub fn value_to_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value).map_err(|e| RpcError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a single msgpack value. Empty input decodes to nil.
pub fn value_from_bytes(bytes: &[u8]) -> Result<Value> {
    if bytes.is_empty() {
        return Ok(Value::Nil);
    }
    let mut cursor = bytes;
    rmpv::decode::read_value(&mut cursor).map_err(|e| RpcError::FieldDecode {
        index: 0,
        reason: e.to_string(),
    })
}

/// Reads frames from the receive half of a stream.
pub struct FrameReader<R> {
    inner: R,
    max_frame_length: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_length: usize) -> Self {
        Self {
            inner,
            max_frame_length,
        }
    }

    /// Reads one frame body, returning the decoded value and its declared
    /// length. A clean end of stream before the prefix is [`RpcError::Eof`];
    /// anything cut short after that is a framing error.
    pub async fn read_frame(&mut self) -> Result<(Value, usize)> {
        let len = self.read_length().await?;
        if len > self.max_frame_length {
            return Err(RpcError::FrameTooLarge {
                len,
                max: self.max_frame_length,
            });
        }
        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                RpcError::framing(format!("truncated frame body: expected {} bytes", len))
            } else {
                RpcError::from(e)
            }
        })?;
        let mut cursor = &body[..];
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| RpcError::framing(format!("malformed message body: {}", e)))?;
        match value {
            Value::Array(_) => Ok((value, len)),
            _ => Err(RpcError::framing("malformed array length byte")),
        }
    }

    /// Reads and decodes one message.
    pub async fn read_message(&mut self) -> Result<(WireMessage, usize)> {
        let (value, len) = self.read_frame().await?;
        Ok((WireMessage::from_value(value)?, len))
    }

    async fn read_length(&mut self) -> Result<usize> {
        let marker = match self.inner.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(RpcError::Eof),
            Err(e) => return Err(e.into()),
        };
        let (width, signed) = match marker {
            0x00..=0x7f => return Ok(marker as usize),
            0xcc => (1, false),
            0xcd => (2, false),
            0xce => (4, false),
            0xcf => (8, false),
            0xd0 => (1, true),
            0xd1 => (2, true),
            0xd2 => (4, true),
            0xd3 => (8, true),
            other => {
                return Err(RpcError::framing(format!(
                    "malformed length prefix byte 0x{:02x}",
                    other
                )))
            }
        };
        let mut buf = [0u8; 8];
        self.inner
            .read_exact(&mut buf[8 - width..])
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    RpcError::framing("truncated length prefix")
                } else {
                    RpcError::from(e)
                }
            })?;
        let raw = u64::from_be_bytes(buf);
        if signed {
            let shift = 64 - 8 * width as u32;
            let value = ((raw << shift) as i64) >> shift;
            if value < 0 {
                return Err(RpcError::framing(format!("negative frame length {}", value)));
            }
            return Ok(value as usize);
        }
        usize::try_from(raw).map_err(|_| RpcError::FrameTooLarge {
            len: usize::MAX,
            max: self.max_frame_length,
        })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes already encoded frames to the send half of a stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CompressionType;

    fn reader(bytes: Vec<u8>) -> FrameReader<std::io::Cursor<Vec<u8>>> {
        FrameReader::new(std::io::Cursor::new(bytes), DEFAULT_MAX_FRAME_LENGTH)
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let msg = WireMessage::Call {
            seq: 1,
            method: "abc.hello".to_string(),
            arg: Value::Map(vec![]),
            tags: None,
        };
        let frame = encode_frame(&msg).unwrap();
        let (decoded, len) = reader(frame.to_vec()).read_message().await.unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(len + 1, frame.len());
    }

    #[tokio::test]
    async fn test_consecutive_frames() {
        let first = WireMessage::Cancel {
            seq: 3,
            method: "a.b".to_string(),
        };
        let second = WireMessage::CallCompressed {
            seq: 4,
            compression: CompressionType::Gzip,
            method: "a.c".to_string(),
            arg: vec![0u8; 300],
            tags: None,
        };
        let mut bytes = encode_frame(&first).unwrap().to_vec();
        bytes.extend_from_slice(&encode_frame(&second).unwrap());
        let mut r = reader(bytes);
        assert_eq!(r.read_message().await.unwrap().0, first);
        assert_eq!(r.read_message().await.unwrap().0, second);
        assert!(matches!(r.read_message().await, Err(RpcError::Eof)));
    }

    #[tokio::test]
    async fn test_wide_length_prefixes_accepted() {
        let body = value_to_bytes(&Value::Array(vec![
            Value::from(3),
            Value::from(1),
            Value::from("a.b"),
        ]))
        .unwrap();
        for prefix in [
            vec![0xce, 0, 0, 0, body.len() as u8],
            vec![0xcd, 0, body.len() as u8],
            vec![0xd2, 0, 0, 0, body.len() as u8],
        ] {
            let mut bytes = prefix;
            bytes.extend_from_slice(&body);
            let (msg, _) = reader(bytes).read_message().await.unwrap();
            assert!(matches!(msg, WireMessage::Cancel { seq: 1, .. }));
        }
    }

    #[tokio::test]
    async fn test_truncated_body_is_framing_error() {
        let msg = WireMessage::Notify {
            method: "a.b".to_string(),
            arg: Value::from("payload"),
            tags: None,
        };
        let mut bytes = encode_frame(&msg).unwrap().to_vec();
        bytes.truncate(bytes.len() - 2);
        let err = reader(bytes).read_frame().await.unwrap_err();
        assert!(matches!(err, RpcError::Framing { .. }));
        assert!(err.to_string().contains("truncated frame body"));
    }

    #[tokio::test]
    async fn test_malformed_prefix() {
        let err = reader(vec![0xa3, b'a', b'b', b'c']).read_frame().await.unwrap_err();
        assert!(err.is_fatal_framing());
        let err = reader(vec![0xd0, 0xff]).read_frame().await.unwrap_err();
        assert!(err.to_string().contains("negative frame length"));
        let err = reader(vec![0xcd, 0x01]).read_frame().await.unwrap_err();
        assert!(err.to_string().contains("truncated length prefix"));
    }

    #[tokio::test]
    async fn test_frame_exceeding_max_length() {
        let msg = WireMessage::Notify {
            method: "a.b".to_string(),
            arg: Value::Binary(vec![7u8; 64]),
            tags: None,
        };
        let bytes = encode_frame(&msg).unwrap().to_vec();
        let mut r = FrameReader::new(std::io::Cursor::new(bytes), 16);
        let err = r.read_frame().await.unwrap_err();
        assert!(matches!(err, RpcError::FrameTooLarge { max: 16, .. }));
    }

    #[tokio::test]
    async fn test_body_must_be_array() {
        let body = value_to_bytes(&Value::from(5)).unwrap();
        let mut bytes = vec![body.len() as u8];
        bytes.extend_from_slice(&body);
        let err = reader(bytes).read_frame().await.unwrap_err();
        assert!(err.to_string().contains("malformed array length byte"));
    }

    #[test]
    fn test_empty_bytes_decode_to_nil() {
        assert_eq!(value_from_bytes(&[]).unwrap(), Value::Nil);
    }
}
