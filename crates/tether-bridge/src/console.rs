//! Operator console on stdin.

use std::io::BufRead;

use anyhow::Context;
use tether_core::{ControlError, MachineHandle, SequenceKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const HELP: &str = "commands: start | stop | status | say <text> | emerald | accept | help | quit";

/// One console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Status,
    Say(String),
    Sequence(SequenceKind),
    Help,
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    ///
    /// # Errors
    /// Returns a message for unknown commands or a `say` without text.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (head, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(h, r)| (h, r.trim()));

        let command = match head.to_ascii_lowercase().as_str() {
            "start" | "connect" => Self::Start,
            "stop" => Self::Stop,
            "status" => Self::Status,
            "say" if rest.is_empty() => return Err("usage: say <text>".into()),
            "say" => Self::Say(rest.to_string()),
            "emerald" | "accept" => Self::Sequence(head.to_ascii_lowercase().parse()?),
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command: {other} ({HELP})")),
        };
        Ok(Some(command))
    }
}

/// Whether the console keeps reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Run one command and return the text to print.
pub async fn execute(handle: &MachineHandle, command: Command) -> anyhow::Result<(Flow, String)> {
    let reply = match command {
        Command::Start => {
            handle.request_connect()?;
            "connect requested".to_string()
        }
        Command::Stop => {
            handle.request_manual_stop().await?;
            "stopped".to_string()
        }
        Command::Status => {
            serde_json::to_string_pretty(&handle.status()).context("failed to render status")?
        }
        Command::Say(text) => match handle.say(text).await {
            Ok(()) => "sent".to_string(),
            Err(ControlError::NotReady) => "not ready".to_string(),
            Err(e) => return Err(e.into()),
        },
        Command::Sequence(kind) => match handle.run_interaction_sequence(kind).await {
            Ok(()) => format!("{kind} sequence started"),
            Err(ControlError::NotReady) => "not ready".to_string(),
            Err(e) => return Err(e.into()),
        },
        Command::Help => HELP.to_string(),
        Command::Quit => return Ok((Flow::Quit, "bye".to_string())),
    };
    Ok((Flow::Continue, reply))
}

/// Read commands from stdin until `quit` or end of input.
///
/// Returns [`Flow::Quit`] only when the operator asked to quit.
pub async fn run(handle: MachineHandle) -> anyhow::Result<Flow> {
    let mut lines = spawn_stdin_reader()?;
    info!("{HELP}");

    while let Some(line) = lines.recv().await {
        let command = match Command::parse(&line) {
            Ok(Some(c)) => c,
            Ok(None) => continue,
            Err(msg) => {
                println!("{msg}");
                continue;
            }
        };
        match execute(&handle, command).await {
            Ok((flow, reply)) => {
                println!("{reply}");
                if flow == Flow::Quit {
                    return Ok(Flow::Quit);
                }
            }
            Err(e) => warn!(error = %e, "Command failed"),
        }
    }
    info!("Console input closed");
    Ok(Flow::Continue)
}

/// Read stdin lines on a plain thread; runtime shutdown never waits on it.
fn spawn_stdin_reader() -> anyhow::Result<mpsc::UnboundedReceiver<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("tether-console".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin");
                        break;
                    }
                }
            }
        })
        .context("failed to start console thread")?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(Command::parse("start"), Ok(Some(Command::Start)));
        assert_eq!(Command::parse("  STOP "), Ok(Some(Command::Stop)));
        assert_eq!(Command::parse("status"), Ok(Some(Command::Status)));
        assert_eq!(Command::parse("exit"), Ok(Some(Command::Quit)));
        assert_eq!(Command::parse(""), Ok(None));
    }

    #[test]
    fn say_keeps_the_rest_of_the_line() {
        assert_eq!(
            Command::parse("say /pay Steve 1k"),
            Ok(Some(Command::Say("/pay Steve 1k".into())))
        );
        assert!(Command::parse("say").is_err());
        assert!(Command::parse("say   ").is_err());
    }

    #[test]
    fn sequence_commands() {
        assert_eq!(
            Command::parse("emerald"),
            Ok(Some(Command::Sequence(SequenceKind::Emerald)))
        );
        assert_eq!(
            Command::parse("Accept"),
            Ok(Some(Command::Sequence(SequenceKind::Accept)))
        );
    }

    #[test]
    fn unknown_command_lists_help() {
        let err = Command::parse("teleport home").unwrap_err();
        assert!(err.contains("teleport"));
        assert!(err.contains("status"));
    }

    fn machine() -> MachineHandle {
        let transport = tether_testkit::MockTransport::new();
        let (handle, _task) = tether_core::MachineBuilder::new(
            tether_core::TetherConfig::default(),
            std::sync::Arc::new(transport),
        )
        .without_monitor()
        .spawn();
        handle
    }

    #[tokio::test]
    async fn status_renders_json() {
        let handle = machine();
        let (flow, text) = execute(&handle, Command::Status).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["state"], "idle");
    }

    #[tokio::test]
    async fn commands_report_not_ready() {
        let handle = machine();
        let (_, text) = execute(&handle, Command::Say("hi".into())).await.unwrap();
        assert_eq!(text, "not ready");
        let (_, text) = execute(&handle, Command::Sequence(SequenceKind::Emerald))
            .await
            .unwrap();
        assert_eq!(text, "not ready");
    }

    #[tokio::test]
    async fn quit_stops_the_loop() {
        let handle = machine();
        let (flow, _) = execute(&handle, Command::Quit).await.unwrap();
        assert_eq!(flow, Flow::Quit);
    }
}
