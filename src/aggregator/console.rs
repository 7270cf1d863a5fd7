//! Line-oriented operator console
//!
//! A thin presentation layer over [`Aggregator`]: renders connection,
//! telemetry and log events as text and turns stdin lines into control
//! operations.

use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::aggregator::events::ServerEvent;
use crate::aggregator::listener::Aggregator;
use crate::aggregator::registry::RegistryStats;
use crate::error::Result;
use crate::protocol::{describe, Command, Message};

const HELP: &str = "\
commands:
  listen                          start listening
  shutdown                        stop listening and drop all clients
  start | stop                    broadcast START / STOP to all clients
  config <latency_ms> <loss>      broadcast thresholds to all clients
  send <client_id> start|stop     command a single client
  clients                         show the client table
  quit                            stop and exit";

/// A parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Listen,
    Shutdown,
    Broadcast(Command),
    Configure { crit_latency_ms: i64, crit_packet_loss: f64 },
    Send { id: String, command: Command },
    Clients,
    Help,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["listen"] => Ok(Self::Listen),
            ["shutdown"] => Ok(Self::Shutdown),
            ["start"] => Ok(Self::Broadcast(Command::Start)),
            ["stop"] => Ok(Self::Broadcast(Command::Stop)),
            ["config", latency, loss] => {
                let crit_latency_ms = latency
                    .parse::<i64>()
                    .map_err(|_| format!("invalid latency '{}'", latency))?;
                let crit_packet_loss = loss
                    .parse::<f64>()
                    .ok()
                    .filter(|pl| (0.0..=1.0).contains(pl))
                    .ok_or_else(|| format!("packet loss must be in 0..1, got '{}'", loss))?;
                Ok(Self::Configure {
                    crit_latency_ms,
                    crit_packet_loss,
                })
            }
            ["send", id, command] => {
                let command = Command::try_from(command.to_string())?;
                Ok(Self::Send {
                    id: id.to_string(),
                    command,
                })
            }
            ["clients"] => Ok(Self::Clients),
            ["help"] | ["?"] => Ok(Self::Help),
            ["quit"] | ["exit"] => Ok(Self::Quit),
            [] => Err("empty command".to_string()),
            _ => Err(format!("unknown command '{}' (try 'help')", line.trim())),
        }
    }
}

/// One row of the client table
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRow {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub connected: bool,
}

/// Client table as displayed to the operator; disconnected clients stay
/// listed with their status changed
#[derive(Debug, Default)]
pub struct ClientTable {
    rows: Vec<ClientRow>,
}

impl ClientTable {
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::ConnectionOpened { id, ip, port } => self.rows.push(ClientRow {
                id: id.clone(),
                ip: ip.to_string(),
                port: *port,
                connected: true,
            }),
            ServerEvent::ConnectionClosed { id } => {
                if let Some(row) = self.rows.iter_mut().find(|r| &r.id == id) {
                    row.connected = false;
                }
            }
            _ => {}
        }
    }

    pub fn rows(&self) -> &[ClientRow] {
        &self.rows
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn render(&self) -> String {
        let mut out = format!("{:<38} {:<16} {:>6}  {}\n", "Client ID", "IP", "Port", "Status");
        for row in &self.rows {
            out.push_str(&format!(
                "{:<38} {:<16} {:>6}  {}\n",
                row.id,
                row.ip,
                row.port,
                if row.connected { "Connected" } else { "Disconnected" }
            ));
        }
        out
    }
}

pub fn connected_summary(stats: &RegistryStats) -> String {
    match stats.connection_count {
        1 => "1 client connected".to_string(),
        n => format!("{} clients connected", n),
    }
}

/// Render one event as a console line
pub fn render_event(event: &ServerEvent) -> String {
    let time = Local::now().format("%H:%M:%S");
    match event {
        ServerEvent::ConnectionOpened { id, ip, port } => {
            format!("{} Connected: {} ({}:{})", time, id, ip, port)
        }
        ServerEvent::ConnectionClosed { id } => format!("{} Client disconnected: {}", time, id),
        ServerEvent::DataReceived { id, message } => {
            let (kind, content) = describe(message);
            format!("{} {} {:<14} {}", time, id, kind, content)
        }
        ServerEvent::Log { level, text } => format!("{} [{}] {}", time, level, text),
    }
}

/// Run the console until `quit`, end of input or Ctrl-C.
pub async fn run(
    aggregator: Aggregator,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    port: u16,
    listen_now: bool,
) -> Result<()> {
    let mut table = ClientTable::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    if listen_now {
        // Failure is already reported through the event stream
        let _ = aggregator.start_listening(port).await;
    }
    println!("{}", HELP);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                table.apply(&event);
                println!("{}", render_event(&event));
            }

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => execute(&aggregator, &mut table, command, port).await,
                    Err(e) => println!("{}", e),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!("Failed to read console input: {}", e);
                    stdin_open = false;
                }
            },

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    aggregator.stop_listening().await;
    Ok(())
}

async fn execute(aggregator: &Aggregator, table: &mut ClientTable, command: ConsoleCommand, port: u16) {
    let needs_server = matches!(
        command,
        ConsoleCommand::Broadcast(_) | ConsoleCommand::Configure { .. } | ConsoleCommand::Send { .. }
    );
    if needs_server && !aggregator.is_listening() {
        println!("Server not running");
        return;
    }

    match command {
        ConsoleCommand::Listen => {
            if aggregator.is_listening() {
                println!("Server is already running.");
            } else {
                let _ = aggregator.start_listening(port).await;
            }
        }
        ConsoleCommand::Shutdown => {
            if !aggregator.is_listening() {
                println!("Server is not running.");
                return;
            }
            aggregator.stop_listening().await;
            table.clear();
        }
        ConsoleCommand::Broadcast(command) => {
            match aggregator.broadcast(&Message::command(command)) {
                Ok(n) => println!("Sent {} to {} clients", command, n),
                Err(e) => println!("Broadcast failed: {}", e),
            }
        }
        ConsoleCommand::Configure {
            crit_latency_ms,
            crit_packet_loss,
        } => match aggregator.broadcast(&Message::config(crit_latency_ms, crit_packet_loss)) {
            Ok(_) => println!(
                "Sent config: latency={} ms, packet_loss={}",
                crit_latency_ms, crit_packet_loss
            ),
            Err(e) => println!("Broadcast failed: {}", e),
        },
        ConsoleCommand::Send { id, command } => match aggregator.unicast(&id, &Message::command(command)) {
            Ok(true) => println!("Sent {} to {}", command, id),
            Ok(false) => println!("No connected client {}", id),
            Err(e) => println!("Send failed: {}", e),
        },
        ConsoleCommand::Clients => {
            print!("{}", table.render());
            println!("{}", connected_summary(&aggregator.stats()));
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
}
