//! Wire message model.
//!
//! Every frame body is a msgpack array whose first element is the integer
//! message type. The remaining fields depend on the type:
//!
//! | type             | fields                                             |
//! |------------------|----------------------------------------------------|
//! | `Call`           | `[0, seq, method, arg, tags?]`                     |
//! | `Response`       | `[1, seq, error, result]`                          |
//! | `Notify`         | `[2, method, arg, tags?]`                          |
//! | `Cancel`         | `[3, seq, method]`                                 |
//! | `CallCompressed` | `[4, seq, compression, method, compressed, tags?]` |

use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Per-transport call correlation number.
pub type SeqNumber = u64;

/// Tags propagated alongside a call for cross-process context.
pub type RpcTags = BTreeMap<String, Value>;

/// Leading integer tag of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Request expecting a response.
    Call = 0,
    /// Reply to a `Call` or `CallCompressed`.
    Response = 1,
    /// Fire-and-forget request.
    Notify = 2,
    /// Caller abandoned a call.
    Cancel = 3,
    /// `Call` with a compressed argument.
    CallCompressed = 4,
}

impl MessageType {
    /// Minimum body length, counting the type tag itself.
    pub fn min_fields(self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::Response => 4,
            MessageType::Notify => 3,
            MessageType::Cancel => 3,
            MessageType::CallCompressed => 5,
        }
    }
}

impl TryFrom<i64> for MessageType {
    type Error = RpcError;

    fn try_from(raw: i64) -> Result<Self> {
        match raw {
            0 => Ok(MessageType::Call),
            1 => Ok(MessageType::Response),
            2 => Ok(MessageType::Notify),
            3 => Ok(MessageType::Cancel),
            4 => Ok(MessageType::CallCompressed),
            other => Err(RpcError::InvalidMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Call => "call",
            MessageType::Response => "response",
            MessageType::Notify => "notify",
            MessageType::Cancel => "cancel",
            MessageType::CallCompressed => "call-compressed",
        };
        f.write_str(name)
    }
}

/// Payload compression selected per call by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompressionType {
    /// Payload sent as-is.
    #[default]
    None,
    /// gzip stream.
    Gzip,
    /// msgpack-aware map key compaction.
    Msgpackzip,
}

impl CompressionType {
    /// Wire identifier.
    pub fn as_i64(self) -> i64 {
        match self {
            CompressionType::None => 0,
            CompressionType::Gzip => 1,
            CompressionType::Msgpackzip => 2,
        }
    }

    /// Parses a wire identifier.
    pub fn from_i64(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Gzip),
            2 => Some(CompressionType::Msgpackzip),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Msgpackzip => "msgpackzip",
        };
        f.write_str(name)
    }
}

/// One decoded frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Call {
        seq: SeqNumber,
        method: String,
        arg: Value,
        tags: Option<RpcTags>,
    },
    CallCompressed {
        seq: SeqNumber,
        compression: CompressionType,
        method: String,
        /// Compressed msgpack encoding of the argument. Empty means absent.
        arg: Vec<u8>,
        tags: Option<RpcTags>,
    },
    Response {
        seq: SeqNumber,
        error: Value,
        result: Value,
    },
    Notify {
        method: String,
        arg: Value,
        tags: Option<RpcTags>,
    },
    Cancel {
        seq: SeqNumber,
        method: String,
    },
}

impl WireMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            WireMessage::Call { .. } => MessageType::Call,
            WireMessage::CallCompressed { .. } => MessageType::CallCompressed,
            WireMessage::Response { .. } => MessageType::Response,
            WireMessage::Notify { .. } => MessageType::Notify,
            WireMessage::Cancel { .. } => MessageType::Cancel,
        }
    }

    /// Method name, for every kind except `Response`.
    pub fn method(&self) -> Option<&str> {
        match self {
            WireMessage::Call { method, .. }
            | WireMessage::CallCompressed { method, .. }
            | WireMessage::Notify { method, .. }
            | WireMessage::Cancel { method, .. } => Some(method),
            WireMessage::Response { .. } => None,
        }
    }

    /// Builds the msgpack array for this message.
    pub fn to_value(&self) -> Value {
        let kind = Value::from(self.message_type() as u8);
        let mut fields = match self {
            WireMessage::Call {
                seq, method, arg, ..
            } => vec![
                kind,
                Value::from(*seq),
                Value::from(method.as_str()),
                arg.clone(),
            ],
            WireMessage::CallCompressed {
                seq,
                compression,
                method,
                arg,
                ..
            } => vec![
                kind,
                Value::from(*seq),
                Value::from(compression.as_i64()),
                Value::from(method.as_str()),
                Value::Binary(arg.clone()),
            ],
            WireMessage::Response { seq, error, result } => {
                vec![kind, Value::from(*seq), error.clone(), result.clone()]
            }
            WireMessage::Notify { method, arg, .. } => {
                vec![kind, Value::from(method.as_str()), arg.clone()]
            }
            WireMessage::Cancel { seq, method } => {
                vec![kind, Value::from(*seq), Value::from(method.as_str())]
            }
        };
        let tags = match self {
            WireMessage::Call { tags, .. }
            | WireMessage::CallCompressed { tags, .. }
            | WireMessage::Notify { tags, .. } => tags.as_ref(),
            _ => None,
        };
        if let Some(tags) = tags {
            fields.push(tags_to_value(tags));
        }
        Value::Array(fields)
    }

    /// Decodes a frame body.
    ///
    /// A malformed envelope (not an array, unknown type, too few fields) is a
    /// framing error. A field that fails to decode is reported as a
    /// [`RpcError::MessageDecode`] carrying the field index, with whatever
    /// context (seq, method, compression) was decoded before it.
    pub fn from_value(body: Value) -> Result<WireMessage> {
        let mut fields = match body {
            Value::Array(fields) => fields,
            other => {
                return Err(RpcError::framing(format!(
                    "message body is not an array: {}",
                    value_kind(&other)
                )))
            }
        };
        let len = fields.len();
        let raw_type = fields
            .first()
            .ok_or_else(|| RpcError::framing("empty message body"))?
            .as_i64()
            .ok_or_else(|| RpcError::framing("message type is not an integer"))?;
        let kind = MessageType::try_from(raw_type)?;
        if len < kind.min_fields() {
            return Err(RpcError::ShortMessage {
                kind,
                len,
                min: kind.min_fields(),
            });
        }

        let mut cx = DecodeContext {
            kind,
            len,
            seq: None,
            method: None,
            compression: CompressionType::None,
        };
        match kind {
            MessageType::Call => {
                let seq = cx.seq(&fields, 1)?;
                let method = cx.method(&fields, 2)?;
                let arg = take(&mut fields, 3);
                let tags = cx.tags(&fields, 4)?;
                Ok(WireMessage::Call {
                    seq,
                    method,
                    arg,
                    tags,
                })
            }
            MessageType::CallCompressed => {
                let seq = cx.seq(&fields, 1)?;
                let compression = cx.compression(&fields, 2)?;
                let method = cx.method(&fields, 3)?;
                let arg = cx.binary(&mut fields, 4)?;
                let tags = cx.tags(&fields, 5)?;
                Ok(WireMessage::CallCompressed {
                    seq,
                    compression,
                    method,
                    arg,
                    tags,
                })
            }
            MessageType::Response => {
                let seq = cx.seq(&fields, 1)?;
                let error = take(&mut fields, 2);
                let result = take(&mut fields, 3);
                Ok(WireMessage::Response { seq, error, result })
            }
            MessageType::Notify => {
                let method = cx.method(&fields, 1)?;
                let arg = take(&mut fields, 2);
                let tags = cx.tags(&fields, 3)?;
                Ok(WireMessage::Notify { method, arg, tags })
            }
            MessageType::Cancel => {
                let seq = cx.seq(&fields, 1)?;
                let method = cx.method(&fields, 2)?;
                Ok(WireMessage::Cancel { seq, method })
            }
        }
    }
}

/// Tracks what has been decoded so far so field errors carry context.
struct DecodeContext {
    kind: MessageType,
    len: usize,
    seq: Option<SeqNumber>,
    method: Option<String>,
    compression: CompressionType,
}

impl DecodeContext {
    fn fail(&self, index: usize, reason: impl Into<String>) -> RpcError {
        RpcError::MessageDecode {
            kind: self.kind,
            seq: self.seq,
            method: self.method.clone(),
            len: self.len,
            compression: self.compression,
            source: Box::new(RpcError::FieldDecode {
                index,
                reason: reason.into(),
            }),
        }
    }

    fn seq(&mut self, fields: &[Value], index: usize) -> Result<SeqNumber> {
        let seq = fields[index]
            .as_u64()
            .ok_or_else(|| self.fail(index, format!("sequence number is {}", value_kind(&fields[index]))))?;
        self.seq = Some(seq);
        Ok(seq)
    }

    fn method(&mut self, fields: &[Value], index: usize) -> Result<String> {
        let method = fields[index]
            .as_str()
            .ok_or_else(|| self.fail(index, format!("method name is {}", value_kind(&fields[index]))))?
            .to_string();
        self.method = Some(method.clone());
        Ok(method)
    }

    fn compression(&mut self, fields: &[Value], index: usize) -> Result<CompressionType> {
        let raw = fields[index]
            .as_i64()
            .ok_or_else(|| self.fail(index, format!("compression type is {}", value_kind(&fields[index]))))?;
        let compression = CompressionType::from_i64(raw)
            .ok_or_else(|| self.fail(index, format!("unknown compression type {}", raw)))?;
        self.compression = compression;
        Ok(compression)
    }

    fn binary(&self, fields: &mut [Value], index: usize) -> Result<Vec<u8>> {
        match take(fields, index) {
            Value::Binary(bytes) => Ok(bytes),
            Value::Nil => Ok(Vec::new()),
            other => Err(self.fail(index, format!("compressed payload is {}", value_kind(&other)))),
        }
    }

    fn tags(&self, fields: &[Value], index: usize) -> Result<Option<RpcTags>> {
        match fields.get(index) {
            None | Some(Value::Nil) => Ok(None),
            Some(Value::Map(entries)) => {
                let mut tags = RpcTags::new();
                for (key, value) in entries {
                    let key = key
                        .as_str()
                        .ok_or_else(|| self.fail(index, format!("tag key is {}", value_kind(key))))?;
                    tags.insert(key.to_string(), value.clone());
                }
                Ok(Some(tags))
            }
            Some(other) => Err(self.fail(index, format!("tags are {}", value_kind(other)))),
        }
    }
}

fn take(fields: &mut [Value], index: usize) -> Value {
    std::mem::replace(&mut fields[index], Value::Nil)
}

fn tags_to_value(tags: &RpcTags) -> Value {
    Value::Map(
        tags.iter()
            .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
            .collect(),
    )
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "a boolean",
        Value::Integer(_) => "an integer",
        Value::F32(_) | Value::F64(_) => "a float",
        Value::String(_) => "a string",
        Value::Binary(_) => "binary",
        Value::Array(_) => "an array",
        Value::Map(_) => "a map",
        Value::Ext(..) => "an extension",
    }
}

/// Serializes any serde value into a msgpack value.
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    rmpv::ext::to_value(value).map_err(|e| RpcError::Encode(e.to_string()))
}

/// Deserializes a msgpack value into a typed destination.
pub fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    rmpv::ext::from_value(value).map_err(|e| RpcError::FieldDecode {
        index: 0,
        reason: e.to_string(),
    })
}
