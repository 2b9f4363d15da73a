//! ---
//! relay_section: "02-messaging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Error taxonomy for the messaging core."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::time::Duration;

use relay_common::WireFormat;

use crate::envelope::Uid;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Reasons a wire payload could not be turned into an [`crate::Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The bytes are not a valid document in the configured wire format.
    #[error("payload is not valid {format}: {reason}")]
    Malformed {
        /// Wire format the payload was decoded as.
        format: WireFormat,
        /// Parser message.
        reason: String,
    },
    /// A required top-level field is absent or has the wrong type.
    #[error("envelope field `{0}` is missing or invalid")]
    MissingField(&'static str),
    /// The `msg_type` discriminator does not name a known variant.
    #[error("unknown message type discriminator {0}")]
    UnknownMessageType(i64),
    /// The `contents` object does not match the variant's shape.
    #[error("invalid contents for {kind} envelope: {reason}")]
    InvalidContents {
        /// Variant named by the discriminator.
        kind: &'static str,
        /// Deserializer message.
        reason: String,
    },
}

/// Errors surfaced by channels, correlators and brokers.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// A wire payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// An envelope could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),
    /// The transport could not establish, confirm or tear down a session.
    #[error("connection error: {0}")]
    Connection(String),
    /// No reply arrived before the caller's deadline.
    #[error("command {uid} timed out after {after:?}")]
    Timeout {
        /// Identifier of the command that timed out.
        uid: Uid,
        /// Deadline that elapsed.
        after: Duration,
    },
    /// The responder reported a failure for the command.
    #[error("command '{command}' ({uid}) failed remotely: {message}")]
    Remote {
        /// Identifier of the failed command.
        uid: Uid,
        /// Command name.
        command: String,
        /// Error text carried by the reply.
        message: String,
    },
    /// The caller cancelled the wait before a reply arrived.
    #[error("command {uid} was cancelled")]
    Cancelled {
        /// Identifier of the cancelled command.
        uid: Uid,
    },
    /// Too many commands are already waiting for replies.
    #[error("too many commands awaiting replies (limit {limit})")]
    TooManyPending {
        /// Configured upper bound.
        limit: usize,
    },
    /// The channel that owned the pending reply went away.
    #[error("channel closed before a reply for {uid} arrived")]
    Closed {
        /// Identifier of the abandoned command.
        uid: Uid,
    },
    /// Broker-specific failure that is not a connection problem.
    #[error("broker error: {0}")]
    Broker(String),
}

impl MessagingError {
    /// Whether the error is a connection failure.
    pub fn is_connection(&self) -> bool {
        matches!(self, MessagingError::Connection(_))
    }

    /// Whether the error is a reply timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MessagingError::Timeout { .. })
    }
}
