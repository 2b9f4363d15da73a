//! ---
//! relay_section: "02-messaging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Correlated pub/sub messaging core."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Correlated pub/sub messaging core.
//!
//! Typed envelopes travel over a topic broker through a
//! [`SubscriptionChannel`]. Notifications fan out to a [`ListenerRegistry`];
//! commands sent with a [`Correlator`] are matched to their replies by uid and
//! answered on the serving side by a [`CommandResponder`].

pub mod broker;
pub mod channel;
pub mod codec;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod registry;
pub mod responder;

pub use broker::{
    Broker, BrokerEvent, BrokerFault, BrokerLink, BrokerStatus, ClientId, InMemoryBroker,
};
pub use channel::{
    ChannelBuilder, ChannelEvent, ChannelState, SubscriptionChannel, SubscriptionState,
};
pub use codec::{decode, encode, EnvelopeCodec};
pub use correlator::{CommandRequest, Correlator};
pub use envelope::{
    AsyncMessage, Command, CommandReply, Envelope, ErrorMessage, KwArgs, MsgType, Payload, Uid,
};
pub use error::{DecodeError, MessagingError, Result};
pub use logging::{log_envelope, MessageDirection, MessagingMetricsExporter};
pub use registry::{DispatchReport, ListenerFn, ListenerHandle, ListenerId, ListenerRegistry};
pub use responder::{handler_fn, CommandHandler, CommandResponder, FnHandler};
