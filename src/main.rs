use clap::Parser;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use smarthome_mcp::client::HomeAssistantClient;
use smarthome_mcp::config::{Cli, TransportKind};
use smarthome_mcp::server::SmartHomeServer;
use smarthome_mcp::session::{self, HttpState};
use smarthome_mcp::tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();

    // Logs go to stderr; stdout carries the stdio transport.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(error) = dotenv {
        tracing::debug!(%error, "no .env file loaded");
    }

    let cli = Cli::parse();
    let config = cli.home_assistant()?;
    let client = HomeAssistantClient::new(&config)?;
    let server = SmartHomeServer::new(ToolRegistry::new(client));

    tracing::info!(url = %config.url, transport = %cli.transport, "Home Assistant MCP server starting");

    match cli.transport {
        TransportKind::Stdio => {
            let running = server
                .serve(stdio())
                .await
                .inspect_err(|error| tracing::error!(%error, "Error serving"))?;
            running.waiting().await?;
        }
        TransportKind::Http => {
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutting down");
                }
                signal.cancel();
            });

            session::serve(
                HttpState::new(server),
                cli.bind_addr()?,
                cli.session_idle_timeout(),
                shutdown,
            )
            .await?;
        }
    }

    Ok(())
}
