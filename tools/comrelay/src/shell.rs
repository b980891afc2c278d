//! Administrative commands read from stdin

use colored::Colorize;
use comrelay_bridge::osc::parse_osc_arg;
use comrelay_relay::Relay;
use comrelay_transport::Endpoint;
use rosc::OscType;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    List { json: bool },
    SendTcp { id: String, message: String },
    SendUdp { id: String, message: String },
    SendOsc { id: String, address: String, args: Vec<OscType> },
    SendMidi { id: String, message: String },
    Broadcast { message: String },
    AddTcp { id: String, endpoint: Endpoint },
    RemoveTcp { id: String },
    Help,
    Quit,
    /// Recognized command with bad arguments
    Usage(&'static str),
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

impl Command {
    /// Parse one input line; `None` for blank lines
    pub fn parse(line: &str) -> Option<Command> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let (&name, rest) = words.split_first()?;
        let joined = |from: usize| rest[from..].join(" ");

        let command = match name {
            "list" => match rest {
                [] => Command::List { json: false },
                ["--json"] => Command::List { json: true },
                _ => Command::Usage("list [--json]"),
            },
            "send_tcp" if rest.len() >= 2 => Command::SendTcp {
                id: rest[0].to_string(),
                message: joined(1),
            },
            "send_tcp" => Command::Usage("send_tcp <id> <msg>"),
            "send_udp" if rest.len() >= 2 => Command::SendUdp {
                id: rest[0].to_string(),
                message: joined(1),
            },
            "send_udp" => Command::Usage("send_udp <id> <msg>"),
            "send_osc" if rest.len() >= 2 => Command::SendOsc {
                id: rest[0].to_string(),
                address: rest[1].to_string(),
                args: rest[2..].iter().map(|t| parse_osc_arg(t)).collect(),
            },
            "send_osc" => Command::Usage("send_osc <id> <address> [args...]"),
            "send_midi" if rest.len() >= 2 => Command::SendMidi {
                id: rest[0].to_string(),
                message: joined(1),
            },
            "send_midi" => Command::Usage("send_midi <id> <msg>"),
            "broadcast" if !rest.is_empty() => Command::Broadcast { message: joined(0) },
            "broadcast" => Command::Usage("broadcast <msg>"),
            "add_tcp" => match rest {
                [id, host, port] => match port.parse::<u16>() {
                    Ok(port) => Command::AddTcp {
                        id: id.to_string(),
                        endpoint: Endpoint::new(*host, port),
                    },
                    Err(_) => Command::Usage("add_tcp <id> <host> <port>"),
                },
                _ => Command::Usage("add_tcp <id> <host> <port>"),
            },
            "remove_tcp" => match rest {
                [id] => Command::RemoveTcp { id: id.to_string() },
                _ => Command::Usage("remove_tcp <id>"),
            },
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => Command::Unknown(other.to_string()),
        };
        Some(command)
    }
}

pub fn print_help() {
    println!("{}", "Commands:".green());
    println!("  list [--json]                       List every client");
    println!("  send_tcp <id> <msg>                 Send to one TCP client");
    println!("  send_udp <id> <msg>                 Send from one UDP client to its remote");
    println!("  send_osc <id> <address> [args...]   Send an OSC message");
    println!("  send_midi <id> <msg>                MIDI output (not implemented)");
    println!("  broadcast <msg>                     Send to every TCP client");
    println!("  add_tcp <id> <host> <port>          Connect a new TCP client");
    println!("  remove_tcp <id>                     Disconnect and forget a TCP client");
    println!("  help                                Show this list");
    println!("  quit                                Stop everything and exit");
}

fn report(what: &str, result: Result<(), impl std::fmt::Display>) {
    match result {
        Ok(()) => println!("{} {}", "OK".green().bold(), what),
        Err(e) => println!("{} {}: {}", "ERROR".red(), what, e),
    }
}

pub async fn execute(relay: &Relay, command: Command) -> Flow {
    match command {
        Command::List { json: true } => print_json(relay),
        Command::List { json: false } => print_list(relay),
        Command::SendTcp { id, message } => {
            report(&format!("sent to '{}'", id), relay.streams().send(&id, &message));
        }
        Command::SendUdp { id, message } => {
            report(
                &format!("sent from '{}'", id),
                relay.datagrams().send(&id, &message, None).await,
            );
        }
        Command::SendOsc { id, address, args } => {
            report(
                &format!("sent {} from '{}'", address, id),
                relay.osc().send(&id, &address, args).await,
            );
        }
        Command::SendMidi { id, message } => {
            info!("[MIDI:{}] (send not implemented): {}", id, message);
            println!("{} MIDI output is not implemented", "WARN".yellow());
        }
        Command::Broadcast { message } => {
            let report = relay.streams().broadcast(&message);
            println!(
                "{} delivered to [{}]",
                "OK".green().bold(),
                report.delivered().join(", ")
            );
            if !report.failed().is_empty() {
                println!("{} failed for [{}]", "ERROR".red(), report.failed().join(", "));
            }
        }
        Command::AddTcp { id, endpoint } => {
            let what = format!("added '{}' for {}", id, endpoint);
            report(&what, relay.streams().add(&id, endpoint).await);
        }
        Command::RemoveTcp { id } => {
            report(&format!("removed '{}'", id), relay.streams().remove(&id));
        }
        Command::Help => print_help(),
        Command::Quit => return Flow::Quit,
        Command::Usage(usage) => println!("{} {}", "Usage:".yellow(), usage),
        Command::Unknown(name) => {
            println!("{}", format!("Unknown command: {}. Type 'help'.", name).red());
        }
    }
    Flow::Continue
}

fn print_list(relay: &Relay) {
    println!("{}", "TCP clients:".green());
    for c in relay.streams().list() {
        println!("  {} {} ({})", c.id.cyan(), c.endpoint, c.state);
    }
    println!("{}", "UDP clients:".green());
    for c in relay.datagrams().list() {
        let listen = c
            .local_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {} -> {} (listening on {})", c.id.cyan(), c.remote, listen);
    }
    println!("{}", "OSC clients:".green());
    for c in relay.osc().list() {
        let listen = c
            .listen_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {} -> {} (listening on {})", c.id.cyan(), c.send, listen);
    }
    println!("{}", "MIDI clients:".green());
    for c in relay.midi().list() {
        let device = c.device_name.as_deref().unwrap_or("?");
        println!("  {} device {}: {}", c.id.cyan(), c.device_index, device);
    }
}

fn print_json(relay: &Relay) {
    let listing = serde_json::json!({
        "tcp": relay.streams().list(),
        "udp": relay.datagrams().list(),
        "osc": relay.osc().list(),
        "midi": relay.midi().list(),
        "stats": relay.stats(),
    });
    match serde_json::to_string_pretty(&listing) {
        Ok(text) => println!("{}", text),
        Err(e) => println!("{} {}", "ERROR".red(), e),
    }
}
