use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runstate::{RunState, RunStateConfig, TagOptions};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runstate")]
#[command(about = "Tag index and live state streaming for durable runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the stream and state endpoints over HTTP
    Serve {
        #[arg(long, env = "RUNSTATE_BIND")]
        bind: Option<String>,
        #[arg(long, env = "RUNSTATE_PREFIX")]
        prefix: Option<String>,
        #[arg(long, env = "RUNSTATE_QUIESCENCE_MS")]
        quiescence_ms: Option<u64>,
        #[arg(long, env = "RUNSTATE_KEEPALIVE_SECS")]
        keepalive_secs: Option<u64>,
        /// Start a heartbeat run publishing on stream `lobby`
        #[arg(long)]
        demo: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            bind,
            prefix,
            quiescence_ms,
            keepalive_secs,
            demo,
        } => {
            let mut config = RunStateConfig::from_env().context("reading configuration")?;
            if let Some(bind) = bind {
                config = config.bind_addr(&bind);
            }
            if let Some(prefix) = prefix {
                config = config.key_prefix(&prefix);
            }
            if let Some(ms) = quiescence_ms {
                config = config.quiescence(Duration::from_millis(ms));
            }
            if let Some(secs) = keepalive_secs {
                config = config.keepalive_interval(Duration::from_secs(secs));
            }
            config.validate().context("invalid configuration")?;

            serve(config, demo).await
        }
    }
}

async fn serve(config: RunStateConfig, demo: bool) -> Result<()> {
    let rs = RunState::in_memory(config)?;
    if demo {
        start_heartbeat(&rs).await?;
    }

    let listener = tokio::net::TcpListener::bind(&rs.config().bind_addr)
        .await
        .with_context(|| format!("binding {}", rs.config().bind_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, rs.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn start_heartbeat(rs: &RunState) -> Result<()> {
    let run = rs.host().start_run()?;
    rs.tags()
        .set_tag_for_run(&run, "stream:lobby", None, TagOptions::unique())
        .await?;
    rs.tags().add_run_to_tag("auth:public", &run).await?;

    let mut channel = rs.channel(&run, json!({"beats": 0}))?;
    channel.commit().await?;
    info!(run_id = %run, "demo run publishing on stream 'lobby'");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;
        for beat in 1u64.. {
            ticker.tick().await;
            channel.state_mut()["beats"] = json!(beat);
            if let Err(err) = channel.commit().await {
                warn!(error = %err, "demo heartbeat stopped");
                break;
            }
        }
    });
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}
