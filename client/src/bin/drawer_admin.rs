//! Admin CLI for the MIAM drawer.
//!
//! Usage:
//!   cargo run --bin drawer-admin -- --url http://localhost:8080 status
//!   ADMIN_PASSWORD=... cargo run --bin drawer-admin -- draw --redraw
//!
//! Admin commands log in with `--password` (or ADMIN_PASSWORD env) and log out afterwards.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use miam_client::Client;
use miam_types::api::RegisterRequest;
use miam_types::ParticipantId;
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "MIAM drawer admin tool")]
struct Args {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Admin password (or ADMIN_PASSWORD env).
    #[arg(short, long)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the public drawer status.
    Status,
    /// Register a participant.
    Register {
        name: String,
        surname: String,
        email: String,
    },
    /// List participants with their emails.
    Participants,
    /// Remove a participant (registration phase only).
    Remove { id: u64 },
    /// Change a participant's email.
    UpdateEmail { id: u64, email: String },
    /// Set the registration deadline (RFC 3339, e.g. 2025-12-20T18:00:00Z).
    SetDeadline { deadline: DateTime<Utc> },
    /// Remove the registration deadline.
    ClearDeadline,
    /// Clear participants and assignments.
    Reset,
    /// Perform the draw and email every giver.
    Draw {
        /// Overwrite an existing draw.
        #[arg(long)]
        redraw: bool,
    },
    /// Show the current assignments.
    Assignments,
    /// Email the current assignments again.
    Notify,
    /// Show server metrics.
    Metrics {
        /// Metrics token (or METRICS_AUTH_TOKEN env).
        #[arg(long)]
        token: Option<String>,
    },
}

impl Command {
    fn needs_admin(&self) -> bool {
        !matches!(
            self,
            Command::Status | Command::Register { .. } | Command::Metrics { .. }
        )
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(client: &Client, command: Command) -> Result<()> {
    match command {
        Command::Status => print_json(&client.status().await?),
        Command::Register {
            name,
            surname,
            email,
        } => print_json(
            &client
                .register(&RegisterRequest {
                    name,
                    surname,
                    email,
                })
                .await?,
        ),
        Command::Participants => print_json(&client.participants().await?),
        Command::Remove { id } => print_json(&client.remove_participant(ParticipantId(id)).await?),
        Command::UpdateEmail { id, email } => {
            print_json(&client.update_email(ParticipantId(id), &email).await?)
        }
        Command::SetDeadline { deadline } => {
            client.set_deadline(deadline).await?;
            info!(deadline = %deadline.to_rfc3339(), "deadline set");
            Ok(())
        }
        Command::ClearDeadline => {
            client.clear_deadline().await?;
            info!("deadline cleared");
            Ok(())
        }
        Command::Reset => {
            client.reset().await?;
            info!("drawer reset");
            Ok(())
        }
        Command::Draw { redraw } => {
            let draw = client.draw(redraw).await?;
            info!(
                attempts = draw.attempts,
                sent = draw.notifications.sent,
                failed = draw.notifications.failed,
                "draw completed"
            );
            print_json(&draw.assignments)
        }
        Command::Assignments => print_json(&client.assignments().await?),
        Command::Notify => print_json(&client.notify().await?),
        Command::Metrics { token } => {
            let token = token.or_else(|| std::env::var("METRICS_AUTH_TOKEN").ok());
            print_json(&client.metrics(token.as_deref()).await?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut client = Client::new(&args.url).context("invalid server url")?;

    let needs_admin = args.command.needs_admin();
    if needs_admin {
        let password = args
            .password
            .or_else(|| std::env::var("ADMIN_PASSWORD").ok())
            .ok_or_else(|| anyhow!("admin password required (--password or ADMIN_PASSWORD)"))?;
        client.login(&password).await.context("admin login failed")?;
    }

    let result = run(&client, args.command).await;

    if needs_admin {
        if let Err(err) = client.logout().await {
            tracing::warn!("logout failed: {err}");
        }
    }
    result
}
