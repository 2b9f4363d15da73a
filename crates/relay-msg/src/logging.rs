//! ---
//! relay_section: "02-messaging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Envelope activity logging and Prometheus metrics."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tracing::debug;

use crate::envelope::Envelope;

/// Direction of the envelope movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Envelope handed to the broker.
    Outbound,
    /// Envelope received from the broker.
    Inbound,
}

/// Emit a structured log entry for envelope activity.
pub fn log_envelope(direction: MessageDirection, channel: &str, topic: &str, envelope: &Envelope) {
    debug!(
        channel,
        topic,
        uid = %envelope.uid(),
        kind = envelope.kind(),
        command = envelope.command_name().unwrap_or(""),
        direction = ?direction,
        "messaging activity"
    );
}

/// Prometheus metric handles for channel and correlator activity.
#[derive(Clone)]
pub struct MessagingMetricsExporter {
    published: IntCounterVec,
    received: IntCounterVec,
    decode_failures: IntCounter,
    listener_failures: IntCounter,
    unmatched_replies: IntCounter,
    command_timeouts: IntCounter,
    pending_replies: IntGauge,
    command_latency: Histogram,
}

impl MessagingMetricsExporter {
    /// Register messaging metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let published = IntCounterVec::new(
            Opts::new("relay_envelopes_published_total", "Envelopes handed to the broker"),
            &["kind"],
        )?;
        let received = IntCounterVec::new(
            Opts::new("relay_envelopes_received_total", "Envelopes decoded from the broker"),
            &["kind"],
        )?;
        let decode_failures = IntCounter::with_opts(Opts::new(
            "relay_decode_failures_total",
            "Inbound payloads that could not be decoded",
        ))?;
        let listener_failures = IntCounter::with_opts(Opts::new(
            "relay_listener_failures_total",
            "Listener invocations that returned an error or panicked",
        ))?;
        let unmatched_replies = IntCounter::with_opts(Opts::new(
            "relay_unmatched_replies_total",
            "Replies that arrived with no waiting command",
        ))?;
        let command_timeouts = IntCounter::with_opts(Opts::new(
            "relay_command_timeouts_total",
            "Commands that received no reply before their deadline",
        ))?;
        let pending_replies = IntGauge::with_opts(Opts::new(
            "relay_pending_replies",
            "Commands currently awaiting a reply",
        ))?;
        let command_latency = Histogram::with_opts(HistogramOpts::new(
            "relay_command_roundtrip_seconds",
            "Time between publishing a command and receiving its reply",
        ))?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(decode_failures.clone()))?;
        registry.register(Box::new(listener_failures.clone()))?;
        registry.register(Box::new(unmatched_replies.clone()))?;
        registry.register(Box::new(command_timeouts.clone()))?;
        registry.register(Box::new(pending_replies.clone()))?;
        registry.register(Box::new(command_latency.clone()))?;

        Ok(Self {
            published,
            received,
            decode_failures,
            listener_failures,
            unmatched_replies,
            command_timeouts,
            pending_replies,
            command_latency,
        })
    }

    pub(crate) fn observe_published(&self, envelope: &Envelope) {
        self.published.with_label_values(&[envelope.kind()]).inc();
    }

    pub(crate) fn observe_received(&self, envelope: &Envelope) {
        self.received.with_label_values(&[envelope.kind()]).inc();
    }

    pub(crate) fn observe_decode_failure(&self) {
        self.decode_failures.inc();
    }

    pub(crate) fn observe_listener_failures(&self, count: usize) {
        self.listener_failures.inc_by(count as u64);
    }

    pub(crate) fn observe_unmatched_reply(&self) {
        self.unmatched_replies.inc();
    }

    pub(crate) fn observe_timeout(&self) {
        self.command_timeouts.inc();
    }

    pub(crate) fn set_pending(&self, pending: usize) {
        self.pending_replies.set(pending as i64);
    }

    pub(crate) fn observe_latency(&self, duration: Duration) {
        self.command_latency.observe(duration.as_secs_f64());
    }
}
