//! ---
//! relay_section: "02-messaging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Envelope model shared by the codec, channel and correlator."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Opaque payload carried by async notifications and command results.
pub type Payload = JsonValue;

/// Keyword arguments attached to a command, kept in insertion order.
pub type KwArgs = IndexMap<String, JsonValue>;

/// Envelope identifier.
///
/// Fresh identifiers are hex-encoded UUID v4 values; identifiers received from
/// the wire are kept verbatim, whatever their shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    /// Generate a new random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Uid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Uid {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for Uid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Uuid> for Uid {
    fn from(value: Uuid) -> Self {
        Self(value.simple().to_string())
    }
}

/// Wire discriminator for each envelope variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Topic notification.
    Async = 1,
    /// Request expecting a reply.
    Command = 2,
    /// Reply to a previously sent command.
    CommandReply = 3,
    /// Out-of-band failure report.
    Error = 4,
}

impl MsgType {
    /// Numeric discriminator written to the wire.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Resolve a wire discriminator, `None` for unknown values.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(MsgType::Async),
            2 => Some(MsgType::Command),
            3 => Some(MsgType::CommandReply),
            4 => Some(MsgType::Error),
            _ => None,
        }
    }

    /// Lowercase name used in logs and metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::Async => "async",
            MsgType::Command => "command",
            MsgType::CommandReply => "command_reply",
            MsgType::Error => "error",
        }
    }
}

/// Notification published on a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncMessage {
    pub(crate) uid: Uid,
    /// Topic the value belongs to.
    pub topic: String,
    /// Published value.
    pub value: Payload,
    /// Creation time of the notification.
    pub timestamp: DateTime<Utc>,
}

impl AsyncMessage {
    /// Build a notification with a fresh identifier, stamped now.
    pub fn new(topic: impl Into<String>, value: Payload) -> Self {
        Self {
            uid: Uid::generate(),
            topic: topic.into(),
            value,
            timestamp: Utc::now(),
        }
    }

    /// Build a notification with a caller-supplied identifier and timestamp.
    pub fn with_uid(
        uid: impl Into<Uid>,
        topic: impl Into<String>,
        value: Payload,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            uid: uid.into(),
            topic: topic.into(),
            value,
            timestamp,
        }
    }

    /// Identifier assigned at construction.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }
}

/// Named request with positional and keyword arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub(crate) uid: Uid,
    /// Command name resolved by the responder.
    pub name: String,
    /// Positional arguments in call order.
    pub args: Vec<Payload>,
    /// Keyword arguments.
    pub kwargs: KwArgs,
}

impl Command {
    /// Build a command with a fresh identifier and no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_uid(Uid::generate(), name)
    }

    /// Build a command with a caller-supplied identifier.
    pub fn with_uid(uid: impl Into<Uid>, name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            args: Vec::new(),
            kwargs: KwArgs::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Payload>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Replace the positional arguments.
    pub fn args(mut self, args: Vec<Payload>) -> Self {
        self.args = args;
        self
    }

    /// Insert a keyword argument, replacing any previous value for the key.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Payload>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Replace the keyword arguments.
    pub fn kwargs(mut self, kwargs: KwArgs) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Identifier assigned at construction.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }
}

/// Reply to a [`Command`], carrying the originating identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub(crate) uid: Uid,
    /// Name of the command being answered.
    pub name: String,
    /// Positional arguments echoed from the command.
    pub args: Vec<Payload>,
    /// Keyword arguments echoed from the command.
    pub kwargs: KwArgs,
    /// Value produced by the handler (`null` when it failed).
    pub result: Payload,
    /// Failure description; `Some` means the command failed remotely.
    pub error: Option<String>,
    /// When the responder started handling the command.
    pub started_at: Option<DateTime<Utc>>,
    /// When the responder finished handling the command.
    pub ended_at: Option<DateTime<Utc>>,
}

impl CommandReply {
    /// Start a reply for `command`, copying its identifier and arguments.
    pub fn from_command(command: &Command) -> Self {
        Self {
            uid: command.uid.clone(),
            name: command.name.clone(),
            args: command.args.clone(),
            kwargs: command.kwargs.clone(),
            result: Payload::Null,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }

    /// Set the handler result.
    pub fn with_result(mut self, result: Payload) -> Self {
        self.result = result;
        self
    }

    /// Mark the reply as failed.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Record when handling started and finished.
    pub fn with_timing(mut self, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self.ended_at = Some(ended_at);
        self
    }

    /// Identifier copied from the originating command.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// Whether the responder reported a failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Handling time reported by the responder, if both timestamps are present.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Failure report that is not tied to a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub(crate) uid: Uid,
    /// Human readable description.
    pub message: String,
}

impl ErrorMessage {
    /// Build an error report with a fresh identifier.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_uid(Uid::generate(), message)
    }

    /// Build an error report about a specific envelope identifier.
    pub fn with_uid(uid: impl Into<Uid>, message: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            message: message.into(),
        }
    }

    /// Identifier assigned at construction.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }
}

/// Unit of exchange on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Topic notification.
    Async(AsyncMessage),
    /// Request expecting a reply.
    Command(Command),
    /// Reply to a command.
    CommandReply(CommandReply),
    /// Failure report.
    Error(ErrorMessage),
}

impl Envelope {
    /// Identifier of the wrapped message.
    pub fn uid(&self) -> &Uid {
        match self {
            Envelope::Async(msg) => &msg.uid,
            Envelope::Command(cmd) => &cmd.uid,
            Envelope::CommandReply(reply) => &reply.uid,
            Envelope::Error(err) => &err.uid,
        }
    }

    /// Wire discriminator of the variant.
    pub fn msg_type(&self) -> MsgType {
        match self {
            Envelope::Async(_) => MsgType::Async,
            Envelope::Command(_) => MsgType::Command,
            Envelope::CommandReply(_) => MsgType::CommandReply,
            Envelope::Error(_) => MsgType::Error,
        }
    }

    /// Convenience accessor returning the variant name.
    pub fn kind(&self) -> &'static str {
        self.msg_type().as_str()
    }

    /// Command name for command and reply envelopes.
    pub fn command_name(&self) -> Option<&str> {
        match self {
            Envelope::Command(cmd) => Some(&cmd.name),
            Envelope::CommandReply(reply) => Some(&reply.name),
            _ => None,
        }
    }
}

impl From<AsyncMessage> for Envelope {
    fn from(value: AsyncMessage) -> Self {
        Envelope::Async(value)
    }
}

impl From<Command> for Envelope {
    fn from(value: Command) -> Self {
        Envelope::Command(value)
    }
}

impl From<CommandReply> for Envelope {
    fn from(value: CommandReply) -> Self {
        Envelope::CommandReply(value)
    }
}

impl From<ErrorMessage> for Envelope {
    fn from(value: ErrorMessage) -> Self {
        Envelope::Error(value)
    }
}
