//! Operator console shared by the bridge client and server.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

/// A line typed on the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Quit,
    Help,
    Unrecognized(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "quit" => Self::Quit,
            "help" => Self::Help,
            other => Self::Unrecognized(other.to_string()),
        }
    }
}

/// Forward stdin lines into a channel until EOF.
pub fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
        debug!("Console input closed");
    });
    rx
}

/// Receive the next console line, or wait forever if there is no console.
///
/// Returns `None` once the console has been closed; callers then stop polling it.
pub(crate) async fn next_line(console: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match console {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(ConsoleCommand::parse("quit"), ConsoleCommand::Quit);
        assert_eq!(ConsoleCommand::parse("  help\n"), ConsoleCommand::Help);
        assert_eq!(
            ConsoleCommand::parse("exit"),
            ConsoleCommand::Unrecognized("exit".to_string())
        );
    }

    #[tokio::test]
    async fn test_closed_console_yields_none() {
        let (tx, rx) = mpsc::channel(1);
        let mut console = Some(rx);
        tx.send("help".to_string()).await.unwrap();
        drop(tx);
        assert_eq!(next_line(&mut console).await.as_deref(), Some("help"));
        assert_eq!(next_line(&mut console).await, None);
    }
}
