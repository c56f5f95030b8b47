//! convene: terminal client for a Convene topic.
//!
//! Joins one topic over the multiplexed socket, prints the roster and chat
//! as they arrive, and sends each typed line as stored text.
//!
//! ```text
//! /more   load the next page of history
//! /who    print the roster
//! /quit   log out and exit
//! ```

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use convene_collab::{
    ChatEntry, ChatLog, ClientConfig, ClientEvent, ConnectionManager, FileMarkerStore,
    HttpTicketIssuer, MarkerStore, MemoryMarkerStore, Roster, SessionEvent, TopicSession,
};
use convene_core::{SocketEvent, TextMessage};
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "convene")]
#[command(about = "Join a Convene topic from the terminal")]
struct Cli {
    /// Server `host[:port]`
    #[arg(long, env = "CONVENE_HOST")]
    host: String,

    /// Topic to join, e.g. `exchange/1:session42`
    #[arg(long, env = "CONVENE_TOPIC")]
    topic: String,

    /// Bearer token for the ticket endpoint
    #[arg(long, env = "CONVENE_TOKEN")]
    token: Option<String>,

    /// Keep the on-call marker in this file across restarts
    #[arg(long, env = "CONVENE_MARKER_FILE")]
    marker_file: Option<String>,

    /// Use http/ws instead of https/wss
    #[arg(long)]
    insecure: bool,

    /// Backlog page size
    #[arg(long, default_value_t = 10)]
    page_size: u32,
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(&self.host);
        config.history_page_size = self.page_size;
        if self.insecure {
            config = config.insecure();
        }
        if let Some(token) = &self.token {
            config = config.with_bearer_token(token);
        }
        config
    }

    fn marker_store(&self) -> Arc<dyn MarkerStore> {
        match &self.marker_file {
            Some(path) => Arc::new(FileMarkerStore::new(path)),
            None => Arc::new(MemoryMarkerStore::new()),
        }
    }
}

fn print_entry(entry: &ChatEntry) {
    let when = entry
        .timestamp
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());
    let who = if entry.name.is_empty() { entry.sender.as_str() } else { entry.name.as_str() };
    let marker = if entry.historical { "·" } else { " " };
    println!("{marker}[{when}] {who}: {}", entry.message);
}

fn print_roster(roster: &Roster) {
    for participant in roster.iter() {
        let status = if participant.online { "online" } else { "away" };
        println!("  {} ({status})", participant.name);
    }
}

async fn wait_connected(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> anyhow::Result<String> {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Connected { connection_id } => return Ok(connection_id),
            ClientEvent::Notice(notice) if notice.persistent => bail!("{}", notice.message),
            ClientEvent::Notice(notice) => eprintln!("{:?}: {}", notice.kind, notice.message),
            other => debug!("before connect: {other:?}"),
        }
    }
    bail!("connection manager stopped")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.client_config();
    let page_size = config.history_page_size;
    let issuer = Arc::new(HttpTicketIssuer::new(&config));

    let (manager, mut client_events) = ConnectionManager::new(config, issuer, cli.marker_store());
    manager.connect();
    let connection_id = wait_connected(&mut client_events)
        .await
        .with_context(|| format!("connecting to {}", cli.host))?;
    info!("connected as {connection_id}");

    let (session, mut session_events) = TopicSession::open(&manager, cli.topic.as_str(), page_size);
    let mut log = ChatLog::new();
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = session_events.recv() => {
                let Some(event) = event else { break };
                let changed = log.apply(&event, &session.roster());
                match &event {
                    SessionEvent::Subscribed => println!("joined {}", cli.topic),
                    SessionEvent::RosterUpdated(roster) => {
                        println!("{} in topic", roster.len());
                        print_roster(roster);
                    }
                    SessionEvent::ParticipantLeft { scid } => {
                        let name = session.participant(scid).map(|p| p.name).unwrap_or_else(|| scid.clone());
                        println!("{name} left");
                    }
                    SessionEvent::MoreHistory => println!("(older messages available: /more)"),
                    SessionEvent::Message(message) if changed => {
                        // Backlog lands on top, live lines at the bottom.
                        let entry = if message.historical { log.entries().next() } else { log.entries().last() };
                        if let Some(entry) = entry {
                            print_entry(entry);
                        }
                    }
                    SessionEvent::Message(_) => {}
                }
            }
            event = client_events.recv() => match event {
                Some(ClientEvent::Notice(notice)) => eprintln!("{:?}: {}", notice.kind, notice.message),
                Some(ClientEvent::Connected { connection_id }) => info!("reconnected as {connection_id}"),
                Some(other) => debug!("{other:?}"),
                None => break,
            },
            line = input.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/who" => print_roster(&session.roster()),
                    "/more" => {
                        if session.more_available() {
                            log.clear_more();
                            session.load_more();
                        } else {
                            println!("(no older messages)");
                        }
                    }
                    text => {
                        if !session.store(&SocketEvent::Text(TextMessage::written(text))) {
                            eprintln!("not connected, message not sent");
                        }
                    }
                }
            }
        }
    }

    session.close();
    manager.logout().await;
    Ok(())
}
