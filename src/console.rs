//! Line oriented front end: reads commands, prints events.
use crate::client::PhoneHandle;
use crate::error::PhoneError;
use crate::event::{ClientEvent, Command};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub const HELP: &str = "commands: dial <number> | accept | reject | hangup | mute | unmute | \
toggle | transfer <agent> | next | click | help | quit";

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(Command),
    Help,
    Quit,
    Empty,
}

pub fn parse_line(line: &str) -> Result<ConsoleInput, PhoneError> {
    let mut parts = line.split_whitespace();
    let verb = match parts.next() {
        Some(verb) => verb.to_ascii_lowercase(),
        None => return Ok(ConsoleInput::Empty),
    };
    let arg = parts.collect::<Vec<_>>().join(" ");
    let command = match verb.as_str() {
        "dial" | "call" => Command::Dial { number: arg },
        "accept" | "answer" => Command::Accept,
        "reject" => Command::Reject,
        "hangup" | "bye" => Command::HangUp,
        "mute" => Command::SetMute { muted: true },
        "unmute" => Command::SetMute { muted: false },
        "toggle" => Command::ToggleMute,
        "transfer" => Command::TransferTo { agent: arg },
        "next" => Command::CycleRingGroup,
        "click" => Command::UserInteraction,
        "help" | "?" => return Ok(ConsoleInput::Help),
        "quit" | "exit" => return Ok(ConsoleInput::Quit),
        other => {
            return Err(PhoneError::UserInput(format!(
                "unknown command: {}",
                other
            )))
        }
    };
    Ok(ConsoleInput::Command(command))
}

pub fn render_event(event: &ClientEvent) -> String {
    match event {
        ClientEvent::Log { message } => format!("> {}", message),
        ClientEvent::Error { message } => format!("! {}", message),
        ClientEvent::DeviceStateChanged { state } => format!("device {}", state),
        ClientEvent::CallIncoming { remote_address } => {
            format!("incoming call from {} (accept/reject)", remote_address)
        }
        ClientEvent::CallRinging { remote_address } => format!("ringing {}", remote_address),
        ClientEvent::CallConnected { remote_address, .. } => {
            format!("connected with {}", remote_address)
        }
        ClientEvent::CallEnded {
            remote_address,
            reason,
        } => format!(
            "call with {} ended ({})",
            remote_address,
            format!("{:?}", reason).to_lowercase()
        ),
        ClientEvent::MuteStateChanged { muted: true } => "muted".to_string(),
        ClientEvent::MuteStateChanged { muted: false } => "unmuted".to_string(),
        ClientEvent::TransferResult {
            success: true,
            detail,
        } => format!("transfer ok: {}", detail),
        ClientEvent::TransferResult {
            success: false,
            detail,
        } => format!("transfer failed: {}", detail),
    }
}

/// Runs until `quit`, end of input or the session stopping. Only `quit`
/// stops the session; end of input leaves it serving.
pub async fn run<R, W>(handle: PhoneHandle, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut events = handle.subscribe();
    writer.write_all(format!("{}\n", HELP).as_bytes()).await?;
    writer.flush().await?;

    loop {
        select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                match parse_line(&line) {
                    Ok(ConsoleInput::Command(command)) => {
                        // every key press counts as a user gesture
                        if command != Command::UserInteraction {
                            handle.send(Command::UserInteraction)?;
                        }
                        handle.send(command)?;
                    }
                    Ok(ConsoleInput::Help) => {
                        writer.write_all(format!("{}\n", HELP).as_bytes()).await?;
                    }
                    Ok(ConsoleInput::Quit) => {
                        handle.stop();
                        break;
                    }
                    Ok(ConsoleInput::Empty) => {}
                    Err(e) => {
                        writer.write_all(format!("! {}\n", e).as_bytes()).await?;
                    }
                }
                writer.flush().await?;
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        writer.write_all(format!("{}\n", render_event(&event)).as_bytes()).await?;
                        writer.flush().await?;
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "console lagged behind events"),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    info!("console closed");
    Ok(())
}
