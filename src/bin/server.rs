// Switchyard platform server
// Run with: cargo run --bin server

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use switchyard::config::PlatformConfig;
use switchyard::server::Application;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchyard-server")]
#[command(about = "Switchyard workflow automation server")]
#[command(version)]
struct Cli {
    /// Override the HTTP listen port.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Override the bind host.
    #[arg(long, env = "HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = PlatformConfig::from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }

    info!(
        port = config.port,
        region = %config.default_organization_region,
        git_sha = %config.git_sha,
        "starting switchyard"
    );

    let app = Application::build(config).await?;
    app.run().await?;
    Ok(())
}
