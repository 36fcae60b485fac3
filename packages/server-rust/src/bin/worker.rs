//! `switchboard-worker`: runs a worker group against an in-memory layer.
//!
//! Registers a demo deployment (an echo consumer on `chat`, a WebSocket echo
//! endpoint and a 404 fallback on `http.request`) and dispatches until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{ArgAction, Parser};
use serde_json::json;
use switchboard_core::{content_from, ChannelLayer, InMemoryChannelLayer, InMemoryConfig, Message};
use switchboard_server::generic::{Frame, WebsocketConsumer, WebsocketContext, WebsocketHandler};
use switchboard_server::logging::{init_logging, LogFormat};
use switchboard_server::{
    consumer_fn, ConsumeResult, ConsumerRegistry, Kwargs, MiddlewareChain, Outcome, WorkerConfig,
    WorkerGroup,
};
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(name = "switchboard-worker", version, about = "Run switchboard workers")]
struct Cli {
    /// Number of worker tasks.
    #[arg(long, env = "SWITCHBOARD_THREADS", default_value_t = 1)]
    threads: usize,

    /// Only poll channels matching these globs (comma separated).
    #[arg(long, value_delimiter = ',')]
    only_channels: Vec<String>,

    /// Never poll channels matching these globs (comma separated).
    #[arg(long, value_delimiter = ',')]
    exclude_channels: Vec<String>,

    /// Increase log verbosity (-v info, -vv debug and per-message tracing, -vvv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Log line format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, env = "SWITCHBOARD_LOG_FORMAT")]
    log_format: LogFormat,

    /// Default per-channel queue capacity of the in-memory layer.
    #[arg(long, default_value_t = 100)]
    capacity: usize,

    /// Milliseconds a stop waits for in-flight messages.
    #[arg(long, default_value_t = 30_000)]
    drain_timeout_ms: u64,

    /// Abort in-flight messages on Ctrl-C instead of draining them.
    #[arg(long)]
    no_graceful_stop: bool,

    /// Put a few demo messages on the layer before starting.
    #[arg(long)]
    seed_demo: bool,
}

struct EchoSocket;

#[async_trait]
impl WebsocketHandler for EchoSocket {
    fn connection_groups(&self, _kwargs: &Kwargs) -> Vec<String> {
        vec!["echo".to_string()]
    }

    async fn receive(&self, ctx: &WebsocketContext<'_>, frame: Frame) -> ConsumeResult {
        match frame {
            Frame::Text(text) => ctx.group_send_text("echo", text).await?,
            Frame::Bytes(bytes) => ctx.group_send_bytes("echo", bytes).await?,
        }
        Ok(Outcome::Processed)
    }
}

fn build_registry() -> anyhow::Result<ConsumerRegistry> {
    let registry = ConsumerRegistry::new();

    let echo = consumer_fn("chat.echo", |message: Message, _kwargs| async move {
        if let Some(reply) = message.reply_channel() {
            reply.send(message.content().clone()).await?;
        }
        Ok(Outcome::Processed)
    });
    registry.add_consumer(echo, ["chat"])?;

    WebsocketConsumer::new(EchoSocket).register(&registry)?;

    let not_found = consumer_fn("http.not_found", |message: Message, _kwargs| async move {
        if let Some(reply) = message.reply_channel() {
            reply
                .send(content_from(json!({
                    "status": 404,
                    "headers": [["Content-Type", "text/plain"]],
                    "content": "Not Found",
                })))
                .await?;
        }
        Ok(Outcome::Processed)
    });
    registry.check_default(not_found)?;

    Ok(registry)
}

async fn seed_demo(layer: &InMemoryChannelLayer) -> anyhow::Result<()> {
    let reply = layer.new_channel("websocket.send!").await?;
    layer
        .send("chat", content_from(json!({"reply_channel": reply, "text": "hello"})))
        .await?;
    layer
        .send(
            "websocket.connect",
            content_from(json!({"reply_channel": reply, "path": "/echo/"})),
        )
        .await?;
    layer
        .send(
            "websocket.receive",
            content_from(json!({"reply_channel": reply, "path": "/echo/", "text": "ping"})),
        )
        .await?;
    info!(reply_channel = %reply, "seeded demo messages");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format)?;

    let layer = Arc::new(InMemoryChannelLayer::new(InMemoryConfig {
        capacity: cli.capacity,
        ..InMemoryConfig::default()
    })?);
    let registry = Arc::new(build_registry()?);

    if cli.seed_demo {
        seed_demo(&layer).await?;
    }

    let config = WorkerConfig {
        threads: cli.threads,
        only_channels: cli.only_channels,
        exclude_channels: cli.exclude_channels,
        stop_gracefully: !cli.no_graceful_stop,
        drain_timeout: Duration::from_millis(cli.drain_timeout_ms),
        ..WorkerConfig::default()
    };
    let mut group = WorkerGroup::new(layer, registry, MiddlewareChain::new(), config)?;
    if cli.verbose > 1 {
        group = group.with_callback(|channel, message| {
            debug!(channel, keys = ?message.content().keys().collect::<Vec<_>>(), "dispatching");
            Ok(())
        });
    }

    info!(threads = group.workers().len(), "starting workers");
    group.run_until_signal().await?;
    info!("workers stopped");
    Ok(())
}
