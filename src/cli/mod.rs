//! Command-line interface
//!
//! `coil run` drives a single inference turn from the terminal: it
//! streams assistant text as the store publishes message updates, answers
//! permission prompts on stdin, and exits when the run completes.

use crate::agent::{Agent, AgentEvent};
use crate::bus::{Bus, EventKind};
use crate::config::Config;
use crate::db::Store;
use crate::message::Role;
use crate::permission::{Decision, PermissionGate};
use crate::provider::{models, ProviderRegistry};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "coil", version, about = "Terminal AI coding assistant")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Send a prompt and stream the assistant's response
    Run(RunArgs),
    /// List stored sessions
    Sessions,
    /// List known models
    Models,
}

#[derive(Args)]
pub struct RunArgs {
    /// The user message
    pub prompt: String,

    /// Continue an existing session instead of starting a new one
    #[arg(long)]
    pub session: Option<String>,
}

pub async fn execute(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Command::Run(args) => run(args, config).await,
        Command::Sessions => sessions(config).await,
        Command::Models => {
            for model in models::catalogue() {
                println!(
                    "{:32} {:24} {:>8} ctx  ${:.2}/M in  ${:.2}/M out",
                    model.id,
                    model.display_name,
                    model.context_window,
                    model.input_cost_per_million,
                    model.output_cost_per_million,
                );
            }
            Ok(())
        }
    }
}

async fn run(args: RunArgs, config: Config) -> Result<()> {
    let config = Arc::new(config);
    let bus = Arc::new(Bus::new());
    let store = Arc::new(Store::open(&config.database_path(), bus.clone()).await?);
    let gate = Arc::new(PermissionGate::new(
        store.clone(),
        bus.clone(),
        config.permissions.allow.clone(),
    ));
    let providers = Arc::new(ProviderRegistry::new(config.clone()));
    let root = std::env::current_dir().context("Failed to resolve working directory")?;
    let agent = Agent::new(
        config.clone(),
        store.clone(),
        bus.clone(),
        gate.clone(),
        providers,
        None,
        root,
    );

    let session = match &args.session {
        Some(id) => store
            .get_session(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Session {id} not found"))?,
        None => store.create_session(None).await?,
    };

    spawn_stream_printer(&bus);
    spawn_permission_prompter(&bus, gate);

    let mut events = agent
        .run(&session.id, args.prompt, Vec::new())
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    match events.recv().await {
        Some(AgentEvent::Response(_)) => {
            println!();
            tracing::debug!(session_id = %session.id, "Run complete");
        }
        Some(AgentEvent::Error(err)) => {
            println!();
            eprintln!("error: {err}");
        }
        None => {}
    }
    println!("session: {}", session.id);
    Ok(())
}

/// Print assistant text incrementally as message update events arrive.
fn spawn_stream_printer(bus: &Arc<Bus>) {
    let mut messages = bus.messages.subscribe();
    tokio::spawn(async move {
        let mut printed: HashMap<String, usize> = HashMap::new();
        while let Ok(event) = messages.recv().await {
            if event.payload.role != Role::Assistant {
                continue;
            }
            let text = event.payload.text();
            let seen = printed.entry(event.payload.id.clone()).or_insert(0);
            if text.len() > *seen {
                print!("{}", &text[*seen..]);
                let _ = std::io::stdout().flush();
                *seen = text.len();
            }
        }
    });
}

/// Answer permission requests interactively on stdin.
fn spawn_permission_prompter(bus: &Arc<Bus>, gate: Arc<PermissionGate>) {
    let mut permissions = bus.permissions.subscribe();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(event) = permissions.recv().await {
            if event.kind != EventKind::Created {
                continue;
            }
            let request = event.payload;
            println!(
                "\n{} wants to {} {}",
                request.tool,
                request.action,
                request.path.as_deref().unwrap_or("")
            );
            print!("allow? [y]es / [a]lways for session / [N]o: ");
            let _ = std::io::stdout().flush();
            let decision = match lines.next_line().await {
                Ok(Some(line)) => match line.trim().to_lowercase().as_str() {
                    "y" | "yes" => Decision::AllowOnce,
                    "a" | "always" => Decision::AllowSession,
                    _ => Decision::Deny,
                },
                _ => Decision::Deny,
            };
            gate.resolve(&request.id, decision);
        }
    });
}

async fn sessions(config: Config) -> Result<()> {
    let bus = Arc::new(Bus::new());
    let store = Store::open(&config.database_path(), bus).await?;
    let sessions = store.list_sessions().await?;
    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  {:40}  {:>4} msgs  {:>7} tok  ${:.4}",
            session.id,
            if session.title.is_empty() { "(untitled)" } else { session.title.as_str() },
            session.message_count,
            session.prompt_tokens + session.completion_tokens,
            session.cost,
        );
    }
    Ok(())
}
