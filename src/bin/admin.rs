//! Switchyard Admin CLI
//!
//! Operator tool against a running server: outbox inspection and replay,
//! trigger listener management, usage exports, queue health, and session
//! token minting for service accounts.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dotenv::dotenv;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use switchyard::api::auth::issue_token;
use switchyard::connectors::slack::SlackClient;
use switchyard::engine::{ConnectorManifest, ConnectorRegistry};
use switchyard::models::MemberRole;

#[derive(Parser)]
#[command(name = "switchyard-admin")]
#[command(about = "Switchyard Admin CLI - operate a running platform instance")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the running server.
    #[arg(long, env = "SWITCHYARD_URL", default_value = "http://localhost:4000")]
    url: String,

    /// Bearer token for authenticated endpoints.
    #[arg(long, env = "SWITCHYARD_TOKEN")]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Liveness and queue health.
    Health,

    /// List registered trigger listeners.
    Listeners,

    /// Deactivate one trigger listener.
    Deactivate {
        /// Trigger id.
        id: String,
    },

    /// Delete one trigger listener.
    Delete {
        /// Trigger id.
        id: String,

        /// Confirm the deletion.
        #[arg(long)]
        confirm: bool,
    },

    /// Inspect and replay webhook outbox rows.
    Outbox {
        #[command(subcommand)]
        command: OutboxCommands,
    },

    /// Verify manifest/client parity without booting a server.
    ///
    /// Loads the manifest, binds the same clients the server would
    /// (concrete bindings plus the generic HTTP client), and runs the
    /// startup parity rule. Exits non-zero on violations.
    Parity {
        /// Path to a connector manifest JSON file.
        #[arg(long)]
        manifest: PathBuf,

        /// Skip generic auto-binding, mirroring GENERIC_EXECUTOR_ENABLED=0.
        #[arg(long)]
        skip_generic: bool,
    },

    /// Download a usage export.
    Export {
        /// csv or json.
        #[arg(long, default_value = "csv")]
        format: String,

        /// Restrict to one plan tier.
        #[arg(long)]
        plan: Option<String>,

        /// Month selector, YYYY-MM-DD (any day in the month).
        #[arg(long)]
        start_date: Option<String>,
    },

    /// Mint a session token from the shared JWT secret.
    Token {
        #[arg(long)]
        user: String,

        #[arg(long)]
        organization: String,

        /// owner | admin | member | viewer
        #[arg(long, default_value = "admin")]
        role: String,

        #[arg(long, env = "JWT_SECRET", default_value = "switchyard-dev-secret")]
        secret: String,

        /// Token lifetime in hours.
        #[arg(long, default_value = "24")]
        ttl_hours: i64,
    },
}

#[derive(Subcommand)]
enum OutboxCommands {
    /// List outbox rows.
    List {
        /// pending | dispatched | failed
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Replay one failed row (failed -> pending, attempts reset).
    Replay {
        /// Outbox row id.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Health => {
            let body: Value = client
                .get(format!("{}/health/app", cli.url))
                .send()
                .await
                .context("health request failed")?
                .json()
                .await?;
            println!("{}", "server health".bold());
            println!("  status:  {}", render(&body["status"]).green());
            println!("  git sha: {}", render(&body["git_sha"]));
            println!(
                "  queue:   {} (durable: {}, depth: {})",
                render(&body["queue"]["driver"]),
                render(&body["queue"]["durable"]),
                render(&body["queue"]["depth"])
            );
        }

        Commands::Listeners => {
            let body: Value = authed(&client, &cli, "GET", "/api/webhooks/admin/listeners")?
                .send()
                .await?
                .error_for_status()
                .context("listener list failed")?
                .json()
                .await?;
            let listeners = body["listeners"].as_array().cloned().unwrap_or_default();
            println!("{} listener(s)", listeners.len().to_string().bold());
            for l in listeners {
                let flag = if l["active"].as_bool().unwrap_or(false) {
                    "active".green()
                } else {
                    "inactive".red()
                };
                println!(
                    "  {} [{}] workflow={} org={} {}",
                    render(&l["id"]).bold(),
                    render(&l["kind"]),
                    render(&l["workflow_id"]),
                    render(&l["organization_id"]),
                    flag
                );
            }
        }

        Commands::Deactivate { ref id } => {
            authed(
                &client,
                &cli,
                "POST",
                &format!("/api/webhooks/admin/listeners/{id}/deactivate"),
            )?
            .send()
            .await?
            .error_for_status()
            .context("deactivate failed")?;
            println!("{} {}", "deactivated".yellow(), id);
        }

        Commands::Delete { ref id, confirm } => {
            if !confirm {
                bail!("refusing to delete without --confirm");
            }
            authed(
                &client,
                &cli,
                "DELETE",
                &format!("/api/webhooks/admin/listeners/{id}"),
            )?
            .send()
            .await?
            .error_for_status()
            .context("delete failed")?;
            println!("{} {}", "deleted".red(), id);
        }

        Commands::Outbox { ref command } => match command {
            OutboxCommands::List { status, limit } => {
                let mut path = format!("/api/webhooks/admin/outbox?limit={limit}");
                if let Some(status) = status {
                    path.push_str(&format!("&status={status}"));
                }
                let body: Value = authed(&client, &cli, "GET", &path)?
                    .send()
                    .await?
                    .error_for_status()
                    .context("outbox list failed")?
                    .json()
                    .await?;
                let rows = body["outbox"].as_array().cloned().unwrap_or_default();
                println!("{} outbox row(s)", rows.len().to_string().bold());
                for row in rows {
                    let status = match row["status"].as_str().unwrap_or("") {
                        "pending" => "pending".yellow(),
                        "dispatched" => "dispatched".green(),
                        other => other.red(),
                    };
                    println!(
                        "  {} {} attempts={} workflow={} org={}",
                        render(&row["id"]).bold(),
                        status,
                        render(&row["attempts"]),
                        render(&row["workflow_id"]),
                        render(&row["organization_id"])
                    );
                    if let Some(error) = row["last_error"].as_str() {
                        println!("    last error: {}", error.red());
                    }
                }
            }
            OutboxCommands::Replay { id } => {
                authed(
                    &client,
                    &cli,
                    "POST",
                    &format!("/api/webhooks/admin/outbox/{id}/replay"),
                )?
                .send()
                .await?
                .error_for_status()
                .context("outbox replay failed")?;
                println!("{} {}", "replayed".green(), id);
            }
        },

        Commands::Parity {
            manifest,
            skip_generic,
        } => {
            let manifest = ConnectorManifest::from_file(&manifest)
                .map_err(|e| anyhow::anyhow!("manifest load failed: {e}"))?;
            let connector_count = manifest.connectors.len();
            let mut registry = ConnectorRegistry::new(manifest);
            registry.bind_client(Arc::new(SlackClient::new()));
            if !skip_generic {
                registry.auto_bind_generic();
            }
            match registry.verify_parity() {
                Ok(()) => println!(
                    "{} {} connector(s), every stable claim has a client",
                    "parity ok".green().bold(),
                    connector_count
                ),
                Err(e) => {
                    eprintln!("{} {e}", "parity violation".red().bold());
                    bail!("parity check failed");
                }
            }
        }

        Commands::Export {
            ref format,
            ref plan,
            ref start_date,
        } => {
            let mut path = format!("/api/usage/export?format={format}");
            if let Some(plan) = plan {
                path.push_str(&format!("&plan={plan}"));
            }
            if let Some(start) = start_date {
                path.push_str(&format!("&start_date={start}"));
            }
            let body = authed(&client, &cli, "GET", &path)?
                .send()
                .await?
                .error_for_status()
                .context("export failed")?
                .text()
                .await?;
            println!("{body}");
        }

        Commands::Token {
            user,
            organization,
            role,
            secret,
            ttl_hours,
        } => {
            let role = match role.as_str() {
                "owner" => MemberRole::Owner,
                "admin" => MemberRole::Admin,
                "member" => MemberRole::Member,
                "viewer" => MemberRole::Viewer,
                other => bail!("unknown role: {other}"),
            };
            let token = issue_token(&secret, &user, &organization, role, ttl_hours)
                .map_err(|e| anyhow::anyhow!("token minting failed: {}", e.message))?;
            println!("{token}");
        }
    }

    Ok(())
}

fn authed(
    client: &reqwest::Client,
    cli: &Cli,
    method: &str,
    path: &str,
) -> Result<reqwest::RequestBuilder> {
    let token = cli
        .token
        .as_deref()
        .context("this command needs --token or SWITCHYARD_TOKEN")?;
    let url = format!("{}{}", cli.url, path);
    let request = match method {
        "GET" => client.get(url),
        "POST" => client.post(url),
        "DELETE" => client.delete(url),
        other => bail!("unsupported method {other}"),
    };
    Ok(request.bearer_auth(token))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
