//! ---
//! relay_section: "02-messaging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Serving side of command/reply: named command handlers."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::envelope::{Command, CommandReply, Payload};

/// Handler for one named command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Produce the reply result, or an error that is reported to the caller.
    async fn handle(&self, command: &Command) -> anyhow::Result<Payload>;
}

/// Adapter turning an async closure into a [`CommandHandler`].
pub struct FnHandler<F>(F);

/// Wrap a closure taking the command by value.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    async fn handle(&self, command: &Command) -> anyhow::Result<Payload> {
        (self.0)(command.clone()).await
    }
}

/// Table of command handlers attached to a serving channel.
#[derive(Clone, Default)]
pub struct CommandResponder {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl fmt::Debug for CommandResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandResponder")
            .field("commands", &self.commands())
            .finish()
    }
}

impl CommandResponder {
    /// Responder with no commands.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register(mut self, name: impl Into<String>, handler: impl CommandHandler + 'static) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `command` and build its reply.
    ///
    /// The handler runs in its own task so a panic becomes an error reply
    /// instead of tearing down the caller.
    pub async fn respond(&self, command: &Command) -> CommandReply {
        let started_at = Utc::now();
        let reply = CommandReply::from_command(command);
        let Some(handler) = self.handlers.get(&command.name).cloned() else {
            return reply
                .with_error(format!("unknown command: {}", command.name))
                .with_timing(started_at, Utc::now());
        };

        let owned = command.clone();
        let outcome = tokio::spawn(async move { handler.handle(&owned).await }).await;
        let reply = match outcome {
            Ok(Ok(result)) => reply.with_result(result),
            Ok(Err(err)) => reply.with_error(format!("{err:#}")),
            Err(join) if join.is_panic() => reply.with_error("command handler panicked"),
            Err(_) => reply.with_error("command handler was cancelled"),
        };
        reply.with_timing(started_at, Utc::now())
    }
}
