use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{load_settings, ChatClient, ClientError, ClientEvent};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod prompt;
mod view;

use prompt::{parse_line, PromptCommand, USAGE};
use view::{status_line, Transcript};

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from the config file and environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    entry: Entry,
}

#[derive(Subcommand, Debug)]
enum Entry {
    Login {
        #[arg(long)]
        id: String,
        #[arg(long)]
        password: String,
    },
    Register {
        #[arg(long)]
        id: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        display_name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let client = ChatClient::start(&settings)?;
    let printer = tokio::spawn(print_events(client.subscribe_events()));

    let signed_in = match &args.entry {
        Entry::Login { id, password } => client.login(id, password).await,
        Entry::Register {
            id,
            password,
            display_name,
        } => client.register(id, password, display_name.as_deref()).await,
    };
    if let Err(err) = signed_in {
        client.shutdown().await;
        printer.abort();
        return Err(err).context("sign-in failed");
    }

    println!("{USAGE}");
    let outcome = run_prompt(&client).await;

    client.shutdown().await;
    if let Err(err) = printer.await {
        warn!(%err, "event printer ended abnormally");
    }
    outcome
}

async fn run_prompt(client: &ChatClient) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let Some(command) = parse_line(&line) else {
            continue;
        };
        match command {
            PromptCommand::Peer(peer) => report(client.select_peer(&peer).await.map(|_| ())),
            PromptCommand::Login { id, password } => {
                report(client.login(&id, &password).await.map(|_| ()))
            }
            PromptCommand::Logout => report(client.logout().await),
            PromptCommand::Status => match client.snapshot().await {
                Ok(snapshot) => println!("{}", status_line(&snapshot)),
                Err(err) => println!("error: {err}"),
            },
            PromptCommand::Say(text) => report(client.send_message(&text).await),
            PromptCommand::Usage => println!("{USAGE}"),
            PromptCommand::Quit => break,
        }
    }
    Ok(())
}

fn report(outcome: Result<(), ClientError>) {
    if let Err(err) = outcome {
        println!("error: {err}");
    }
}

/// Runs until the client shuts down and the event channel closes.
async fn print_events(mut events: broadcast::Receiver<ClientEvent>) {
    let mut transcript = Transcript::default();
    loop {
        match events.recv().await {
            Ok(event) => {
                for line in transcript.render(&event) {
                    println!("{line}");
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
