//! ---
//! relay_section: "02-messaging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Envelope wire codec."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! Envelope wire codec.
//!
//! Every envelope is written as `{"msg_type": <int>, "uid": <string>,
//! "contents": {...}}`. Decoding reads the discriminator first and then
//! deserializes `contents` into the matching variant, keeping the uid found on
//! the wire.
//!
//! Round trips are lossless with one exception: an async envelope whose wire
//! form has no `timestamp` gets the decode time as its timestamp.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use relay_common::WireFormat;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::envelope::{
    AsyncMessage, Command, CommandReply, Envelope, ErrorMessage, KwArgs, MsgType, Payload, Uid,
};
use crate::error::{DecodeError, MessagingError, Result};

#[derive(Serialize)]
struct WireEnvelope<'a, C> {
    msg_type: u8,
    uid: &'a Uid,
    contents: C,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    msg_type: Option<JsonValue>,
    #[serde(default)]
    uid: Option<JsonValue>,
    #[serde(default)]
    contents: JsonValue,
}

#[derive(Serialize, Deserialize)]
struct AsyncContents {
    topic: String,
    #[serde(default)]
    value: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct CommandContents {
    command: String,
    #[serde(default)]
    args: Vec<Payload>,
    #[serde(default)]
    kwargs: KwArgs,
}

#[derive(Serialize, Deserialize)]
struct ReplyContents {
    command: String,
    #[serde(default)]
    args: Vec<Payload>,
    #[serde(default)]
    kwargs: KwArgs,
    #[serde(default)]
    result: Payload,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    ended_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct ErrorContents {
    message: String,
}

/// Encoder/decoder bound to a [`WireFormat`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvelopeCodec {
    format: WireFormat,
}

impl EnvelopeCodec {
    /// Codec for the given wire format.
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    /// JSON codec, the default wire format.
    pub fn json() -> Self {
        Self::new(WireFormat::Json)
    }

    /// Wire format used by this codec.
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Serialize an envelope.
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes> {
        let uid = envelope.uid();
        let msg_type = envelope.msg_type().code();
        match envelope {
            Envelope::Async(msg) => self.write(&WireEnvelope {
                msg_type,
                uid,
                contents: AsyncContents {
                    topic: msg.topic.clone(),
                    value: msg.value.clone(),
                    timestamp: Some(msg.timestamp),
                },
            }),
            Envelope::Command(cmd) => self.write(&WireEnvelope {
                msg_type,
                uid,
                contents: CommandContents {
                    command: cmd.name.clone(),
                    args: cmd.args.clone(),
                    kwargs: cmd.kwargs.clone(),
                },
            }),
            Envelope::CommandReply(reply) => self.write(&WireEnvelope {
                msg_type,
                uid,
                contents: ReplyContents {
                    command: reply.name.clone(),
                    args: reply.args.clone(),
                    kwargs: reply.kwargs.clone(),
                    result: reply.result.clone(),
                    error: reply.error.clone(),
                    started_at: reply.started_at,
                    ended_at: reply.ended_at,
                },
            }),
            Envelope::Error(err) => self.write(&WireEnvelope {
                msg_type,
                uid,
                contents: ErrorContents {
                    message: err.message.clone(),
                },
            }),
        }
    }

    /// Deserialize an envelope, dispatching on its `msg_type`.
    pub fn decode(&self, bytes: &[u8]) -> std::result::Result<Envelope, DecodeError> {
        let raw: RawEnvelope = match self.format {
            WireFormat::Json => serde_json::from_slice(bytes).map_err(|err| DecodeError::Malformed {
                format: self.format,
                reason: err.to_string(),
            })?,
            WireFormat::Cbor => serde_cbor::from_slice(bytes).map_err(|err| DecodeError::Malformed {
                format: self.format,
                reason: err.to_string(),
            })?,
        };

        let code = raw
            .msg_type
            .as_ref()
            .and_then(JsonValue::as_i64)
            .ok_or(DecodeError::MissingField("msg_type"))?;
        let msg_type = MsgType::from_code(code).ok_or(DecodeError::UnknownMessageType(code))?;
        let uid = match raw.uid {
            Some(JsonValue::String(uid)) => Uid::from(uid),
            _ => return Err(DecodeError::MissingField("uid")),
        };

        let envelope = match msg_type {
            MsgType::Async => {
                let contents: AsyncContents = contents(msg_type, raw.contents)?;
                Envelope::Async(AsyncMessage {
                    uid,
                    topic: contents.topic,
                    value: contents.value,
                    timestamp: contents.timestamp.unwrap_or_else(Utc::now),
                })
            }
            MsgType::Command => {
                let contents: CommandContents = contents(msg_type, raw.contents)?;
                Envelope::Command(Command {
                    uid,
                    name: contents.command,
                    args: contents.args,
                    kwargs: contents.kwargs,
                })
            }
            MsgType::CommandReply => {
                let contents: ReplyContents = contents(msg_type, raw.contents)?;
                Envelope::CommandReply(CommandReply {
                    uid,
                    name: contents.command,
                    args: contents.args,
                    kwargs: contents.kwargs,
                    result: contents.result,
                    error: contents.error,
                    started_at: contents.started_at,
                    ended_at: contents.ended_at,
                })
            }
            MsgType::Error => {
                let contents: ErrorContents = contents(msg_type, raw.contents)?;
                Envelope::Error(ErrorMessage {
                    uid,
                    message: contents.message,
                })
            }
        };
        Ok(envelope)
    }

    fn write<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        let bytes = match self.format {
            WireFormat::Json => {
                serde_json::to_vec(value).map_err(|err| MessagingError::Encode(err.to_string()))?
            }
            WireFormat::Cbor => {
                serde_cbor::to_vec(value).map_err(|err| MessagingError::Encode(err.to_string()))?
            }
        };
        Ok(Bytes::from(bytes))
    }
}

fn contents<T: DeserializeOwned>(
    msg_type: MsgType,
    value: JsonValue,
) -> std::result::Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|err| DecodeError::InvalidContents {
        kind: msg_type.as_str(),
        reason: err.to_string(),
    })
}

/// Serialize an envelope as JSON.
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    EnvelopeCodec::json().encode(envelope)
}

/// Decode a JSON envelope.
pub fn decode(bytes: &[u8]) -> std::result::Result<Envelope, DecodeError> {
    EnvelopeCodec::json().decode(bytes)
}
