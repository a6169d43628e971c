//! Line-oriented operator console.
//!
//! Reads one command per line and drives the local node:
//!
//!   true | false   set the shared value
//!   toggle         flip the shared value
//!   status         print value, timestamp and peer count
//!   peers          list registered peers
//!   quit           stop the node

use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Set(bool),
    Toggle,
    Status,
    Peers,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "1" => Ok(Command::Set(true)),
            "false" | "off" | "0" => Ok(Command::Set(false)),
            "toggle" | "t" => Ok(Command::Toggle),
            "status" | "s" => Ok(Command::Status),
            "peers" | "p" => Ok(Command::Peers),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" | "q" => Ok(Command::Quit),
            other => Err(ConsoleError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsoleError {
    #[error("unknown command: {0:?} (try `help`)")]
    UnknownCommand(String),
}

/// How the console stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// Operator asked to stop the node.
    Quit,
    /// Input ended.
    Eof,
}

const HELP: &str = "commands: true | false | toggle | status | peers | quit\n";

/// Render the shared value as shown to operators.
pub fn describe(value: bool) -> &'static str {
    if value {
        "Actual: True"
    } else {
        "Actual: False"
    }
}

/// Serve commands from `input` until `quit` or end of input.
pub async fn run<R, W>(node: &Node, input: R, mut output: W) -> std::io::Result<ConsoleExit>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match line.parse::<Command>() {
            Ok(Command::Quit) => return Ok(ConsoleExit::Quit),
            Ok(command) => execute(node, command).await,
            Err(e) => format!("{e}\n"),
        };
        output.write_all(reply.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(ConsoleExit::Eof)
}

async fn execute(node: &Node, command: Command) -> String {
    match command {
        Command::Set(value) => set(node, value).await,
        Command::Toggle => set(node, !node.state()).await,
        Command::Status => format!(
            "{} (ts {}) peers {}\n",
            describe(node.state()),
            node.timestamp().as_nanos(),
            node.peer_count()
        ),
        Command::Peers => {
            let mut peers = node.peers();
            peers.sort();
            if peers.is_empty() {
                return "no peers\n".to_string();
            }
            peers.iter().map(|p| format!("{p}\n")).collect()
        }
        Command::Help => HELP.to_string(),
        Command::Quit => String::new(),
    }
}

async fn set(node: &Node, value: bool) -> String {
    if node.set_state(value).await {
        format!("{}\n", describe(value))
    } else {
        format!("unchanged, {}\n", describe(node.state()))
    }
}
