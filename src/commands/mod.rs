// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Host command parsing and execution.
//!
//! Maps lines typed on stdin to role coordinator calls.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::bluetooth::{Role, RoleCoordinator};
use crate::state::AppState;

/// Commands accepted on the host console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    SetRole(Role),
    StartScan(Option<Duration>),
    StopScan,
    StartAdvertising,
    StopAdvertising,
    Connect(String),
    DisconnectAll,
    /// Text plus optional target filter (identifiers, names or addresses).
    Send {
        text: String,
        targets: Option<Vec<String>>,
    },
    Identifier(String),
    Image(PathBuf),
    Peers,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  role <idle|central|peripheral>
  scan [seconds]            stop-scan
  advertise                 stop-advertise
  connect <id|address|name> disconnect
  send [@target,...] <text>
  id <digits>               image <path>
  peers  status  help  quit";

impl HostCommand {
    /// Parse a command line. Returns `None` for an empty line.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "role" => Self::SetRole(rest.parse().map_err(|e: String| anyhow!(e))?),
            "scan" => {
                let timeout = if rest.is_empty() {
                    None
                } else {
                    Some(Duration::from_secs(rest.parse()?))
                };
                Self::StartScan(timeout)
            }
            "stop-scan" => Self::StopScan,
            "advertise" | "adv" => Self::StartAdvertising,
            "stop-advertise" | "stop-adv" => Self::StopAdvertising,
            "connect" => Self::Connect(required(rest, "connect <id|address|name>")?),
            "disconnect" => Self::DisconnectAll,
            "send" => Self::parse_send(rest)?,
            "id" => {
                let identifier = required(rest, "id <digits>")?;
                if !identifier.chars().all(|c| c.is_ascii_digit()) {
                    return Err(anyhow!("identifier must be digits: {}", identifier));
                }
                Self::Identifier(identifier)
            }
            "image" => Self::Image(PathBuf::from(required(rest, "image <path>")?)),
            "peers" => Self::Peers,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(anyhow!("unknown command: {}", other)),
        };
        Ok(Some(command))
    }

    fn parse_send(rest: &str) -> Result<Self> {
        let (targets, text) = match rest.strip_prefix('@') {
            Some(tail) => {
                let (list, text) = tail
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("usage: send [@target,...] <text>"))?;
                let targets = list
                    .split(',')
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
                (Some(targets), text.trim())
            }
            None => (None, rest),
        };
        Ok(Self::Send {
            text: required(text, "send [@target,...] <text>")?,
            targets,
        })
    }
}

fn required(value: &str, usage: &str) -> Result<String> {
    if value.is_empty() {
        Err(anyhow!("usage: {}", usage))
    } else {
        Ok(value.to_string())
    }
}

/// What the console loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Execute a command against the coordinator, printing query results.
pub async fn execute(
    command: HostCommand,
    coordinator: &RoleCoordinator,
    state: &AppState,
) -> Result<Flow> {
    debug!("Executing command: {:?}", command);

    match command {
        HostCommand::SetRole(role) => coordinator.set_role(role).await,
        HostCommand::StartScan(timeout) => coordinator.start_scan(timeout)?,
        HostCommand::StopScan => coordinator.stop_scan(),
        HostCommand::StartAdvertising => coordinator.start_advertising().await?,
        HostCommand::StopAdvertising => coordinator.stop_advertising(),
        HostCommand::Connect(key) => coordinator.connect(&key)?,
        HostCommand::DisconnectAll => coordinator.disconnect_all(),
        HostCommand::Send { text, targets } => {
            let report = coordinator.send_message(&text, targets.as_deref(), false)?;
            println!("queued for {} peer(s)", report.queued.len());
        }
        HostCommand::Identifier(identifier) => {
            coordinator.send_identifier(&identifier)?;
        }
        HostCommand::Image(path) => {
            let bytes = tokio::fs::read(&path).await?;
            info!("Sending image {} ({} bytes)", path.display(), bytes.len());
            let chunks = coordinator.send_image(&bytes).await?;
            println!("image sent in {} chunks", chunks);
        }
        HostCommand::Peers => {
            for peer in coordinator.discovered() {
                println!(
                    "found  {}  id={}  rssi={}",
                    peer.identity,
                    peer.identifier.as_deref().unwrap_or("-"),
                    peer.rssi.map_or("-".to_string(), |r| r.to_string())
                );
            }
            for peer in coordinator.client().peers() {
                println!(
                    "linked {}  connected={}  ready={}  id={}",
                    peer.identity,
                    peer.connected,
                    peer.ready,
                    peer.identifier.as_deref().unwrap_or("-")
                );
            }
            for client in coordinator.server().clients() {
                println!("client {}", client.identity);
            }
        }
        HostCommand::Status => {
            println!("{}", state.summary());
            println!(
                "role={} scanning={} advertising={} identifier={}",
                coordinator.role(),
                coordinator.is_scanning(),
                coordinator.is_advertising(),
                coordinator.identity().identifier()
            );
            if let Some(message) = state.get_last_message() {
                println!("last message from {}: {}", message.sender, message.text);
            }
            if let Some(error) = state.get_last_error() {
                println!("last error: {}", error);
            }
            for line in state.recent_log(5) {
                println!("  {}", line);
            }
        }
        HostCommand::Help => println!("{}", HELP),
        HostCommand::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_commands() {
        assert_eq!(HostCommand::parse("").unwrap(), None);
        assert_eq!(
            HostCommand::parse("role central").unwrap(),
            Some(HostCommand::SetRole(Role::Central))
        );
        assert_eq!(
            HostCommand::parse("ROLE p").unwrap(),
            Some(HostCommand::SetRole(Role::Peripheral))
        );
        assert_eq!(
            HostCommand::parse("scan 15").unwrap(),
            Some(HostCommand::StartScan(Some(Duration::from_secs(15))))
        );
        assert_eq!(
            HostCommand::parse("scan").unwrap(),
            Some(HostCommand::StartScan(None))
        );
        assert_eq!(HostCommand::parse("quit").unwrap(), Some(HostCommand::Quit));
    }

    #[test]
    fn test_parse_send_with_targets() {
        assert_eq!(
            HostCommand::parse("send @01012345678,phone hello there").unwrap(),
            Some(HostCommand::Send {
                text: "hello there".to_string(),
                targets: Some(vec!["01012345678".to_string(), "phone".to_string()]),
            })
        );
        assert_eq!(
            HostCommand::parse("send hi").unwrap(),
            Some(HostCommand::Send {
                text: "hi".to_string(),
                targets: None,
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(HostCommand::parse("role sideways").is_err());
        assert!(HostCommand::parse("connect").is_err());
        assert!(HostCommand::parse("send @phone").is_err());
        assert!(HostCommand::parse("id 12ab").is_err());
        assert!(HostCommand::parse("scan soon").is_err());
        assert!(HostCommand::parse("launch").is_err());
    }
}
