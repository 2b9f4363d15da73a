//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Shared configuration and tracing primitives."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! Shared primitives for the Relay workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the messaging core and the daemon.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BrokerConfig, ChannelConfig, CorrelatorConfig, LoadedAppConfig, LoggingConfig,
    WireFormat,
};
pub use logging::{init_tracing, LogFormat};
