//! ---
//! relay_section: "03-logging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Structured logging context and macros."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Structured logging helpers shared by the messaging crates.
//!
//! Every event carries the same four fields (`channel`, `topic`, `uid`,
//! `command`) so log pipelines can follow a single envelope across the
//! publish, delivery and reply paths.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber for tests and small tools.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer().with_test_writer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Channel name that observed the event.
    pub channel: Option<&'a str>,
    /// Topic the envelope travelled on.
    pub topic: Option<&'a str>,
    /// Envelope identifier.
    pub uid: Option<&'a str>,
    /// Command name for command and reply envelopes.
    pub command: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a channel name.
    pub fn with_channel(mut self, channel: &'a str) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Attach a topic.
    pub fn with_topic(mut self, topic: &'a str) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Attach an envelope identifier.
    pub fn with_uid(mut self, uid: &'a str) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Attach a command name.
    pub fn with_command(mut self, command: &'a str) -> Self {
        self.command = Some(command);
        self
    }
}

/// Outcome attached to lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The transition completed as requested.
    Success,
    /// The transition was forced by a failure.
    Fault,
}

impl LifecycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event (connect, disconnect, state changes).
///
/// Faults are logged at `WARN`; successful transitions at `INFO`.
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    match outcome {
        LifecycleOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            channel = ctx.channel.unwrap_or(""),
            topic = ctx.topic.unwrap_or(""),
            message = %message
        ),
        LifecycleOutcome::Fault => tracing::warn!(
            event,
            outcome = outcome.as_str(),
            channel = ctx.channel.unwrap_or(""),
            topic = ctx.topic.unwrap_or(""),
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new()
            .with_channel("device-state")
            .with_topic("humidity")
            .with_uid("1234");
        relay_info!(context = ctx.clone(), "listener registered");
        relay_debug!("debug message");
        relay_warn!(context = ctx.clone().with_command("ping"), "late reply");
        relay_error!(context = ctx, "listener failed: {}", "boom");
    }

    #[test]
    fn lifecycle_helper_emits() {
        init();
        let ctx = LogContext::new().with_channel("device-state");
        log_lifecycle_event(
            Some(&ctx),
            "channel.state",
            "connecting -> connected",
            LifecycleOutcome::Success,
        );
        log_lifecycle_event(
            None,
            "channel.state",
            "broker dropped the session",
            LifecycleOutcome::Fault,
        );
    }
}
