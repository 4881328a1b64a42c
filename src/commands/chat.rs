//! Chat command for encrypted one-to-one messaging over TCP.
//!
//! Runs a line-mode session: every line typed is sent as a message, lines
//! starting with `/` are commands. Your peer ID is the address the listener
//! bound to; give it to the other side so they can `--connect` to it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};

use peerchat::chat::transport::TcpProvider;
use peerchat::chat::{ChatConfig, ChatEntry, Notice, PeerSession, Sender};

use super::CommandExecutor;

/// Start a chat session.
#[derive(Args, Debug)]
pub struct ChatCommand {
    /// Display name announced to the peer
    #[arg(short, long)]
    pub name: Option<String>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Peer ID (address) to connect to on startup
    #[arg(short, long)]
    pub connect: Option<String>,

    /// Path to a config file (default: <config dir>/peerchat/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CommandExecutor for ChatCommand {
    fn execute(&self) -> Result<()> {
        let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
        rt.block_on(self.run())
    }
}

/// Parsed slash command.
#[derive(Debug, PartialEq, Eq)]
enum LineCommand<'a> {
    Quit,
    Help,
    Status,
    Disconnect,
    Connect(&'a str),
    Name(&'a str),
    Unknown(&'a str),
}

/// Whether the input loop should keep going.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

fn parse_command(line: &str) -> Option<LineCommand<'_>> {
    let line = line.trim();
    if !line.starts_with('/') {
        return None;
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    Some(match word {
        "/quit" | "/q" | "/exit" => LineCommand::Quit,
        "/help" | "/h" | "/?" => LineCommand::Help,
        "/status" | "/s" => LineCommand::Status,
        "/disconnect" | "/d" => LineCommand::Disconnect,
        "/connect" | "/c" => LineCommand::Connect(rest),
        "/name" | "/n" => LineCommand::Name(rest),
        other => LineCommand::Unknown(other),
    })
}

impl ChatCommand {
    fn load_config(&self) -> Result<ChatConfig> {
        let mut config = match &self.config {
            Some(path) => ChatConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ChatConfig::load_default().context("Failed to load config")?,
        };
        if let Some(name) = &self.name {
            config.display_name = Some(name.clone());
        }
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        Ok(config)
    }

    async fn run(&self) -> Result<()> {
        let config = self.load_config()?;
        let provider = TcpProvider::new(config.bind_addr.clone());
        let mut session = PeerSession::new(provider, config).context("Invalid chat configuration")?;

        session.open().await.context("Failed to start listener")?;
        while session.peer_id().is_none() {
            session.process_next().await;
        }
        if let Some(id) = session.peer_id() {
            println!("Your peer ID: {}", id);
        }
        println!("Type /help for commands.");

        if let Some(remote) = &self.connect {
            session
                .connect(remote)
                .await
                .with_context(|| format!("Failed to connect to {}", remote))?;
        }

        let mut printer = Printer::default();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            printer.flush(&mut session);

            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read input")? else {
                        break;
                    };
                    if handle_line(&mut session, &line).await == Flow::Quit {
                        break;
                    }
                }
                _ = session.process_next() => {}
            }
        }

        session.destroy();
        printer.flush(&mut session);
        Ok(())
    }
}

async fn handle_line(session: &mut PeerSession<TcpProvider>, line: &str) -> Flow {
    let Some(command) = parse_command(line) else {
        if line.trim().is_empty() {
            return Flow::Continue;
        }
        if let Err(e) = session.send_message(line) {
            eprintln!("Send failed: {}", e);
        }
        return Flow::Continue;
    };

    match command {
        LineCommand::Quit => return Flow::Quit,
        LineCommand::Help => {
            println!("Commands:");
            println!("  /connect <id>  - Connect to a peer");
            println!("  /disconnect    - Close the connection");
            println!("  /name <name>   - Set your display name");
            println!("  /status, /s    - Show connection status");
            println!("  /quit, /q      - Exit chat");
            println!("  /help, /h      - Show this help");
        }
        LineCommand::Status => {
            println!("Status: {}", session.state().display());
            if let Some(id) = session.peer_id() {
                println!("Your peer ID: {}", id);
            }
            if let Some(remote) = session.remote_peer() {
                println!("Connected to: {}", remote);
            }
            println!("Encryption key: {}", if session.has_key() { "ready" } else { "missing" });
        }
        LineCommand::Disconnect => {
            if let Err(e) = session.disconnect() {
                eprintln!("Disconnect failed: {}", e);
            }
        }
        LineCommand::Connect(remote) => {
            if let Err(e) = session.connect(remote).await {
                eprintln!("Connect failed: {}", e);
            }
        }
        LineCommand::Name(name) => {
            if let Err(e) = session.set_display_name(name) {
                eprintln!("Invalid name: {}", e);
            }
        }
        LineCommand::Unknown(word) => {
            println!("Unknown command: {}", word);
            println!("Type /help for available commands");
        }
    }
    Flow::Continue
}

/// Prints log entries, notices and typing changes as they appear.
#[derive(Default)]
struct Printer {
    shown: usize,
    remote_typing: bool,
}

impl Printer {
    fn flush(&mut self, session: &mut PeerSession<TcpProvider>) {
        for entry in session.log().since(self.shown) {
            println!("{}", format_entry(session, entry));
        }
        self.shown = session.log().len();

        for notice in session.take_notices() {
            match notice {
                // The log line already shows these.
                Notice::NewMessage | Notice::ConnectionClosed | Notice::Error(_) => {}
                other => eprintln!("* {}", other),
            }
        }

        let typing = session.presence().is_remote_typing;
        if typing && !self.remote_typing {
            println!("{} is typing...", remote_name(session));
        }
        self.remote_typing = typing;
    }
}

fn remote_name(session: &PeerSession<TcpProvider>) -> String {
    session
        .presence()
        .remote_display_name
        .clone()
        .unwrap_or_else(|| session.config().remote_placeholder.clone())
}

fn format_entry(session: &PeerSession<TcpProvider>, entry: &ChatEntry) -> String {
    let who = match entry.sender {
        Sender::Local => session.display_name().unwrap_or("You").to_string(),
        Sender::Remote => remote_name(session),
        Sender::System => "*".to_string(),
    };
    format!("[{}] {}: {}", entry.formatted_time(), who, entry.text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_commands() {
        assert_eq!(parse_command("/quit"), Some(LineCommand::Quit));
        assert_eq!(parse_command("/q"), Some(LineCommand::Quit));
        assert_eq!(parse_command("  /exit  "), Some(LineCommand::Quit));
    }

    #[test]
    fn test_commands_with_arguments() {
        assert_eq!(
            parse_command("/connect 127.0.0.1:4000"),
            Some(LineCommand::Connect("127.0.0.1:4000"))
        );
        assert_eq!(parse_command("/name  Alice  "), Some(LineCommand::Name("Alice")));
        assert_eq!(parse_command("/connect"), Some(LineCommand::Connect("")));
    }

    #[test]
    fn test_plain_text_is_not_a_command() {
        assert_eq!(parse_command("hello /quit"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(parse_command("/dance now"), Some(LineCommand::Unknown("/dance")));
    }
}
