//! ---
//! relay_section: "02-messaging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Command/reply correlation with timeout and cancellation."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! Command/reply correlation.
//!
//! Every command gets a fresh uid and a pending slot keyed by it. The
//! channel's delivery task resolves slots as replies arrive; the waiting
//! caller owns a guard that frees the slot on success, timeout, error or when
//! the future is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relay_logging::{relay_debug, LogContext};
use tokio::sync::oneshot;

use crate::channel::SubscriptionChannel;
use crate::envelope::{Command, CommandReply, Envelope, ErrorMessage, KwArgs, Payload, Uid};
use crate::logging::MessagingMetricsExporter;
use crate::{MessagingError, Result};

/// What the delivery task hands to a waiting caller.
#[derive(Debug)]
pub(crate) enum ReplyOutcome {
    Reply(CommandReply),
    Failed(ErrorMessage),
}

/// Pending-reply slots shared by a channel and its correlators.
pub(crate) struct PendingReplies {
    slots: Mutex<HashMap<Uid, oneshot::Sender<ReplyOutcome>>>,
    max_pending: usize,
    metrics: Option<MessagingMetricsExporter>,
}

impl PendingReplies {
    pub(crate) fn new(max_pending: usize, metrics: Option<MessagingMetricsExporter>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            max_pending,
            metrics,
        }
    }

    /// Open a slot for `uid`. The returned guard frees it when dropped.
    pub(crate) fn register(
        self: &Arc<Self>,
        uid: Uid,
    ) -> Result<(PendingGuard, oneshot::Receiver<ReplyOutcome>)> {
        let (sender, receiver) = oneshot::channel();
        let mut slots = self.slots.lock();
        if slots.len() >= self.max_pending {
            return Err(MessagingError::TooManyPending {
                limit: self.max_pending,
            });
        }
        slots.insert(uid.clone(), sender);
        let pending = slots.len();
        drop(slots);

        self.observe_pending(pending);
        Ok((
            PendingGuard {
                uid,
                pending: Arc::clone(self),
            },
            receiver,
        ))
    }

    /// Hand `reply` to its waiter. Returns `false` when nobody is waiting.
    pub(crate) fn resolve(&self, reply: CommandReply) -> bool {
        let uid = reply.uid().clone();
        self.complete(&uid, ReplyOutcome::Reply(reply))
    }

    /// Fail the waiter whose command shares the error's uid.
    pub(crate) fn fail(&self, error: ErrorMessage) -> bool {
        let uid = error.uid().clone();
        self.complete(&uid, ReplyOutcome::Failed(error))
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn complete(&self, uid: &Uid, outcome: ReplyOutcome) -> bool {
        let sender = self.slots.lock().remove(uid);
        match sender {
            // A closed receiver means the waiter gave up between lookup and send.
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    fn release(&self, uid: &Uid) {
        let mut slots = self.slots.lock();
        slots.remove(uid);
        let pending = slots.len();
        drop(slots);
        self.observe_pending(pending);
    }

    fn observe_pending(&self, pending: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_pending(pending);
        }
    }
}

/// Frees a pending slot when the waiting future finishes or is dropped.
pub(crate) struct PendingGuard {
    uid: Uid,
    pending: Arc<PendingReplies>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.release(&self.uid);
    }
}

/// Command to send through [`Correlator::send_and_wait`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Command name resolved by the responder.
    pub name: String,
    /// Positional arguments.
    pub args: Vec<Payload>,
    /// Keyword arguments.
    pub kwargs: KwArgs,
    /// Reply deadline; the correlator default applies when `None`.
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    /// Request for `name` with no arguments and the default deadline.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: KwArgs::new(),
            timeout: None,
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Payload>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Replace the positional arguments.
    pub fn with_args(mut self, args: Vec<Payload>) -> Self {
        self.args = args;
        self
    }

    /// Insert a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Payload>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Replace the keyword arguments.
    pub fn with_kwargs(mut self, kwargs: KwArgs) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Override the reply deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn into_command(self) -> Command {
        Command::new(self.name).args(self.args).kwargs(self.kwargs)
    }
}

/// Sends commands over a channel and waits for their replies.
///
/// Obtained from [`SubscriptionChannel::correlator`]. Replies are only
/// observed while the channel is connected, since that is when its reply
/// topic is subscribed.
#[derive(Clone)]
pub struct Correlator {
    channel: SubscriptionChannel,
    pending: Arc<PendingReplies>,
    command_topic: String,
    default_timeout: Duration,
    metrics: Option<MessagingMetricsExporter>,
}

impl Correlator {
    pub(crate) fn new(
        channel: SubscriptionChannel,
        pending: Arc<PendingReplies>,
        command_topic: String,
        default_timeout: Duration,
        metrics: Option<MessagingMetricsExporter>,
    ) -> Self {
        Self {
            channel,
            pending,
            command_topic,
            default_timeout,
            metrics,
        }
    }

    /// Topic commands are published on.
    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    /// Deadline applied when a request carries none.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Commands currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    /// Publish a command and wait for the reply carrying its uid.
    ///
    /// A reply whose `error` is set becomes [`MessagingError::Remote`]. When
    /// the deadline elapses the slot is released and any later reply is
    /// discarded by the channel.
    pub async fn send_and_wait(&self, request: CommandRequest) -> Result<CommandReply> {
        self.send_and_wait_cancellable(request, std::future::pending::<()>())
            .await
    }

    /// Like [`send_and_wait`](Self::send_and_wait), but gives up with
    /// [`MessagingError::Cancelled`] as soon as `cancel` completes.
    pub async fn send_and_wait_cancellable<C>(
        &self,
        request: CommandRequest,
        cancel: C,
    ) -> Result<CommandReply>
    where
        C: Future<Output = ()>,
    {
        let wait = request.timeout.unwrap_or(self.default_timeout);
        let command = request.into_command();
        let uid = command.uid().clone();
        let name = command.name.clone();

        let (guard, receiver) = self.pending.register(uid.clone())?;
        let started = Instant::now();
        self.channel
            .publish_envelope(&self.command_topic, Envelope::from(command))
            .await?;

        tokio::pin!(cancel);
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(wait, receiver) => outcome,
            _ = &mut cancel => {
                drop(guard);
                let ctx = LogContext::new().with_uid(uid.as_str()).with_command(&name);
                relay_debug!(context = ctx, "wait cancelled by caller");
                return Err(MessagingError::Cancelled { uid });
            }
        };
        drop(guard);

        match outcome {
            Err(_) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_timeout();
                }
                Err(MessagingError::Timeout { uid, after: wait })
            }
            Ok(Err(_)) => Err(MessagingError::Closed { uid }),
            Ok(Ok(ReplyOutcome::Reply(reply))) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_latency(started.elapsed());
                }
                match reply.error {
                    Some(message) => Err(MessagingError::Remote {
                        uid,
                        command: reply.name,
                        message,
                    }),
                    None => Ok(reply),
                }
            }
            Ok(Ok(ReplyOutcome::Failed(error))) => Err(MessagingError::Remote {
                uid,
                command: name,
                message: error.message,
            }),
        }
    }
}
