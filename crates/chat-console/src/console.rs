//! Line-oriented command loop over stdin.

use centrifuge_client::{Client, Subscription};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info};

use crate::chat::ChatMessage;

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Subscribe,
    Unsubscribe,
    Disconnect,
    Connect,
    Close,
    Publish(ChatMessage),
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<ConsoleCommand> {
    match line.trim() {
        "#subscribe" => Some(ConsoleCommand::Subscribe),
        "#unsubscribe" => Some(ConsoleCommand::Unsubscribe),
        "#disconnect" => Some(ConsoleCommand::Disconnect),
        "#connect" => Some(ConsoleCommand::Connect),
        "#close" => Some(ConsoleCommand::Close),
        other => ChatMessage::from_line(other).map(ConsoleCommand::Publish),
    }
}

/// Read commands from `input` until `#close`, end of input, or the client
/// being closed elsewhere. Command failures are logged and the loop goes on.
pub async fn run_console<R>(input: R, client: Client, sub: Subscription)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = client.closed() => return,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("input closed, no more commands will be read");
                return;
            }
            Err(e) => {
                error!("failed to read input: {e}");
                return;
            }
        };
        let Some(command) = parse_command(&line) else {
            continue;
        };
        if execute(command, &client, &sub).await {
            return;
        }
    }
}

/// Run one command. Returns `true` when the loop should stop.
async fn execute(command: ConsoleCommand, client: &Client, sub: &Subscription) -> bool {
    let result = match command {
        ConsoleCommand::Subscribe => sub.subscribe(),
        ConsoleCommand::Unsubscribe => sub.unsubscribe(),
        ConsoleCommand::Disconnect => client.disconnect().await,
        ConsoleCommand::Connect => client.connect(),
        ConsoleCommand::Close => {
            client.close().await;
            return true;
        }
        ConsoleCommand::Publish(msg) => {
            let data = match msg.encode() {
                Ok(data) => data,
                Err(e) => {
                    error!("Error publish: {e}");
                    return false;
                }
            };
            match sub.publish(&data).await {
                Ok(ack) => {
                    info!(offset = ack.offset, "published");
                    return false;
                }
                Err(e) => {
                    error!("Error publish: {e}");
                    return false;
                }
            }
        }
    };
    if let Err(e) = result {
        error!("{e}");
    }
    false
}
