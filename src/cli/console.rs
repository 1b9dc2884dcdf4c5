//! Interactive console of a running daemon

use crate::node::Node;
use crate::sync::{ConnectionState, SyncEvent};
use crate::tasks::TaskEvent;
use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

/// One line typed by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    Peers,
    Candidates,
    Pair(String),
    Verify(String),
    Token { peer: String, token: String },
    Resolve(Option<String>),
    Remove(String),
    Block(String),
    Unblock(String),
    PullIcon { peer: String, key: String },
    PullFile { peer: String, resource: String },
    Tasks,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            return Err("empty command".to_string());
        };

        let one = |name: &str| -> Result<String, String> {
            match args {
                [arg] => Ok(arg.to_string()),
                _ => Err(format!("usage: {} <device-id>", name)),
            }
        };
        let two = |usage: &str| -> Result<(String, String), String> {
            match args {
                [a, b] => Ok((a.to_string(), b.to_string())),
                _ => Err(format!("usage: {}", usage)),
            }
        };

        match command {
            "help" | "?" => Ok(Self::Help),
            "peers" => Ok(Self::Peers),
            "candidates" => Ok(Self::Candidates),
            "pair" => one("pair").map(Self::Pair),
            "verify" => one("verify").map(Self::Verify),
            "token" => two("token <device-id> <token>")
                .map(|(peer, token)| Self::Token { peer, token }),
            "resolve" => match args {
                [] => Ok(Self::Resolve(None)),
                [peer] => Ok(Self::Resolve(Some(peer.to_string()))),
                _ => Err("usage: resolve [device-id]".to_string()),
            },
            "remove" => one("remove").map(Self::Remove),
            "block" => one("block").map(Self::Block),
            "unblock" => one("unblock").map(Self::Unblock),
            "pull-icon" => {
                two("pull-icon <device-id> <key>").map(|(peer, key)| Self::PullIcon { peer, key })
            }
            "pull-file" => two("pull-file <device-id> <resource>")
                .map(|(peer, resource)| Self::PullFile { peer, resource }),
            "tasks" => Ok(Self::Tasks),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command '{}', try 'help'", other)),
        }
    }
}

const HELP: &str = "\
Commands:
  peers                          tracked devices and their state
  candidates                     discovered devices not yet paired
  pair <device-id>               start tracking a discovered device
  verify <device-id>             ask the device to show its pairing token
  token <device-id> <token>      confirm the token shown on the device
  resolve [device-id]            check one or all devices now
  remove <device-id>             forget a device
  block <device-id>              forget a device and ignore it
  unblock <device-id>            stop ignoring a device
  pull-icon <device-id> <key>    fetch an icon
  pull-file <device-id> <name>   fetch a shared file
  tasks                          background pulls
  quit                           notify devices and exit";

fn state_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connected => "connected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Unverified => "waiting for pairing token",
        ConnectionState::Unmatched => "session rejected, rebuilding",
    }
}

/// Print sync and task events as they happen
pub fn spawn_event_printer(
    mut sync: broadcast::Receiver<SyncEvent>,
    mut tasks: broadcast::Receiver<TaskEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = sync.recv() => match event {
                    Ok(SyncEvent::StateChanged { peer_id, state }) => {
                        println!("[{}] {}", peer_id, state_label(state));
                    }
                    Ok(SyncEvent::ShowToken { requested_by, token }) => {
                        println!();
                        println!("  Pairing request from {}", requested_by);
                        println!("  Enter this token on that device: {}", token);
                        println!();
                    }
                    Ok(SyncEvent::PeerRemoved { peer_id }) => println!("[{}] removed", peer_id),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = tasks.recv() => match event {
                    Ok(TaskEvent::Finished { task_id, task_type, status, error }) => {
                        match error {
                            Some(e) => println!("{} {} {}: {}", task_type, task_id, status, e),
                            None => println!("{} {} {}", task_type, task_id, status),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Read commands from stdin until `quit`, EOF or Ctrl+C
pub async fn run(node: &Node) -> Result<()> {
    println!("Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        if let Err(e) = execute(node, command).await {
            println!("Error: {}", e);
        }
    }
    Ok(())
}

async fn execute(node: &Node, command: ConsoleCommand) -> Result<()> {
    let manager = node.manager();
    match command {
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Peers => {
            let peers = manager.peers().await;
            if peers.is_empty() {
                println!("No tracked devices");
            }
            for peer in peers {
                let address = peer
                    .connect_address()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {} - {} ({}) {} {}",
                    peer.instance_id,
                    peer.device_name,
                    peer.platform,
                    state_label(peer.state),
                    address
                );
            }
        }
        ConsoleCommand::Candidates => {
            let candidates = manager.pairing_candidates();
            if candidates.is_empty() {
                println!("No unpaired devices found");
            }
            for record in candidates {
                println!(
                    "  {} - {} ({}, v{})",
                    record.instance_id, record.device_name, record.platform, record.app_version
                );
            }
        }
        ConsoleCommand::Pair(peer) => {
            manager.add_peer(&peer).await?;
            println!("Pairing with {}", peer);
        }
        ConsoleCommand::Verify(peer) => {
            manager.verify(&peer).await?;
            println!("Asked {} to show its token", peer);
        }
        ConsoleCommand::Token { peer, token } => {
            let state = manager.trust_by_token(&peer, &token).await?;
            println!("{} is {}", peer, state_label(state));
        }
        ConsoleCommand::Resolve(Some(peer)) => {
            let state = manager.resolve_sync(&peer).await?;
            println!("{} is {}", peer, state_label(state));
        }
        ConsoleCommand::Resolve(None) => {
            for (peer, state) in manager.resolve_all().await {
                println!("{} is {}", peer, state_label(state));
            }
        }
        ConsoleCommand::Remove(peer) => {
            manager.remove_handler(&peer).await?;
            println!("Removed {}", peer);
        }
        ConsoleCommand::Block(peer) => {
            manager.block(&peer).await?;
            println!("Blocked {}", peer);
        }
        ConsoleCommand::Unblock(peer) => {
            if manager.unblock(&peer).await? {
                println!("Unblocked {}", peer);
            } else {
                println!("{} was not blocked", peer);
            }
        }
        ConsoleCommand::PullIcon { peer, key } => {
            let task_id = node.pull_icon(&peer, &key).await?;
            println!("Queued icon pull {}", task_id);
        }
        ConsoleCommand::PullFile { peer, resource } => {
            let task_id = node.pull_file(&peer, &resource).await?;
            println!("Queued file pull {}", task_id);
        }
        ConsoleCommand::Tasks => {
            for task in node.executor().tasks().await? {
                println!(
                    "  {} {} {} ({} attempt(s))",
                    task.task_id,
                    task.task_type,
                    task.status,
                    task.history.len()
                );
            }
        }
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("peers", ConsoleCommand::Peers)]
    #[case("  pair  laptop ", ConsoleCommand::Pair("laptop".into()))]
    #[case("token laptop 123456", ConsoleCommand::Token { peer: "laptop".into(), token: "123456".into() })]
    #[case("resolve", ConsoleCommand::Resolve(None))]
    #[case("resolve laptop", ConsoleCommand::Resolve(Some("laptop".into())))]
    #[case("pull-file laptop notes.txt", ConsoleCommand::PullFile { peer: "laptop".into(), resource: "notes.txt".into() })]
    #[case("exit", ConsoleCommand::Quit)]
    fn test_parse(#[case] line: &str, #[case] expected: ConsoleCommand) {
        assert_eq!(ConsoleCommand::parse(line).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("pair")]
    #[case("token laptop")]
    #[case("resolve a b")]
    #[case("sync")]
    fn test_parse_rejects(#[case] line: &str) {
        assert!(ConsoleCommand::parse(line).is_err());
    }
}
