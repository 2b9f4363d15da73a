//! ---
//! relay_section: "04-daemon"
//! relay_subsection: "binary"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Binary entrypoint for the relay daemon."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use prometheus::{Encoder, Registry, TextEncoder};
use relay_common::config::AppConfig;
use relay_common::logging::{init_tracing, LogFormat};
use relay_msg::{
    handler_fn, Broker, Command, CommandRequest, CommandResponder, Envelope, InMemoryBroker,
    MessagingMetricsExporter, SubscriptionChannel,
};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Relay pub/sub daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured log format")]
    log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    StructuredJson,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::StructuredJson => LogFormat::StructuredJson,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Serve commands and log notifications until terminated")]
    Run,
    #[command(about = "Publish, read history and call a command, then exit")]
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mut config, source) = load_config(cli.config.as_ref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    init_tracing("relayd", &config.logging)?;
    match &source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => warn!("no configuration file found; using defaults"),
    }

    let metrics = Registry::new();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, &metrics).await,
        Commands::Demo => run_demo(config, &metrics).await,
    }
}

fn load_config(explicit: Option<&PathBuf>) -> Result<(AppConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        let loaded = AppConfig::load_with_source(&[path])?;
        return Ok((loaded.config, Some(loaded.source)));
    }
    let candidates = [
        PathBuf::from("configs/relay.toml"),
        PathBuf::from("configs/relay.example.toml"),
    ];
    let env_override = std::env::var_os(AppConfig::ENV_CONFIG_PATH).is_some();
    if env_override || candidates.iter().any(|c| c.exists()) {
        let loaded = AppConfig::load_with_source(&candidates)?;
        return Ok((loaded.config, Some(loaded.source)));
    }
    Ok((AppConfig::default(), None))
}

fn builtin_commands() -> CommandResponder {
    CommandResponder::new()
        .register("ping", handler_fn(|_| async { Ok(json!("pong")) }))
        .register(
            "echo",
            handler_fn(|command: Command| async move {
                Ok(json!({ "args": command.args, "kwargs": command.kwargs }))
            }),
        )
        .register(
            "time",
            handler_fn(|_| async { Ok(json!(chrono::Utc::now().to_rfc3339())) }),
        )
}

struct Node {
    server: SubscriptionChannel,
    client: SubscriptionChannel,
}

async fn start_node(config: &AppConfig, metrics: &Registry) -> Result<Node> {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(&config.broker));
    let exporter = MessagingMetricsExporter::register(metrics)
        .context("failed to register messaging metrics")?;
    info!(broker = broker.name(), "broker ready");

    let mut server_config = config.channel.clone();
    server_config.name = format!("{}-responder", config.channel.name);
    server_config.subscriptions.clear();
    let server = SubscriptionChannel::builder(Arc::clone(&broker))
        .config(server_config)
        .correlator(config.correlator.clone())
        .responder(builtin_commands())
        .build();
    server.connect().await.context("responder channel failed to connect")?;

    let client = SubscriptionChannel::builder(broker)
        .config(config.channel.clone())
        .correlator(config.correlator.clone())
        .metrics(exporter)
        .build();
    for topic in &config.channel.subscriptions {
        let label = topic.clone();
        client
            .add_listener(topic.clone(), move |message| {
                info!(topic = %label, uid = %message.uid(), value = %message.value, "notification");
                Ok(())
            })
            .await?;
    }
    client.connect().await.context("client channel failed to connect")?;
    Ok(Node { server, client })
}

async fn stop_node(node: Node) {
    for channel in [&node.client, &node.server] {
        if let Err(err) = channel.disconnect().await {
            warn!(channel = channel.name(), error = %err, "disconnect did not complete cleanly");
        }
    }
}

async fn run_daemon(config: AppConfig, metrics: &Registry) -> Result<()> {
    let node = start_node(&config, metrics).await?;
    info!(
        channel = node.client.name(),
        subscriptions = ?config.channel.subscriptions,
        "daemon running; waiting for termination signal"
    );
    shutdown_signal().await;
    info!("termination signal received; shutting down");
    stop_node(node).await;
    Ok(())
}

async fn run_demo(config: AppConfig, metrics: &Registry) -> Result<()> {
    let node = start_node(&config, metrics).await?;

    let uid = node.client.publish("humidity", json!(58.9)).await?;
    println!("published humidity=58.9 uid={uid}");

    for envelope in node.client.history("humidity", 5).await? {
        if let Envelope::Async(message) = envelope {
            println!(
                "history {} value={} at {}",
                message.uid(),
                message.value,
                message.timestamp.to_rfc3339()
            );
        }
    }

    let correlator = node.client.correlator();
    let reply = correlator
        .send_and_wait(CommandRequest::new("ping"))
        .await
        .context("ping failed")?;
    println!("ping -> {} (uid {})", reply.result, reply.uid());
    let reply = correlator
        .send_and_wait(CommandRequest::new("echo").arg("hello").kwarg("loud", true))
        .await
        .context("echo failed")?;
    println!("echo -> {}", reply.result);
    match correlator.send_and_wait(CommandRequest::new("reboot")).await {
        Ok(reply) => println!("reboot -> {}", reply.result),
        Err(err) => println!("reboot -> {err}"),
    }

    stop_node(node).await;

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metrics.gather(), &mut buffer)
        .context("failed to encode metrics")?;
    println!("{}", String::from_utf8_lossy(&buffer));
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = ctrl_c() => {},
        _ = terminate() => {},
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            warn!(?err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
