use crate::call::{CallDirection, EndReason};
use crate::device::DeviceState;
use serde::{Deserialize, Serialize};

/// ClientEvent is what the core tells the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    DeviceStateChanged { state: DeviceState },

    /// An inbound call is ringing and waits for accept or reject
    #[serde(rename_all = "camelCase")]
    CallIncoming { remote_address: String },

    /// The far end of an outbound call is ringing
    #[serde(rename_all = "camelCase")]
    CallRinging { remote_address: String },

    #[serde(rename_all = "camelCase")]
    CallConnected {
        remote_address: String,
        direction: CallDirection,
    },

    /// Dismiss every call related overlay
    #[serde(rename_all = "camelCase")]
    CallEnded {
        remote_address: String,
        reason: EndReason,
    },

    #[serde(rename_all = "camelCase")]
    MuteStateChanged { muted: bool },

    #[serde(rename_all = "camelCase")]
    TransferResult { success: bool, detail: String },

    /// Non-fatal error the user should see
    #[serde(rename_all = "camelCase")]
    Error { message: String },

    /// Line for the activity log panel
    #[serde(rename_all = "camelCase")]
    Log { message: String },
}

impl ClientEvent {
    pub fn log(message: impl Into<String>) -> Self {
        ClientEvent::Log {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ClientEvent::Error {
            message: message.into(),
        }
    }
}

/// Command is what the presentation layer asks the core to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    Dial { number: String },
    Accept,
    Reject,
    HangUp,
    ToggleMute,
    SetMute { muted: bool },
    TransferTo { agent: String },
    CycleRingGroup,
    /// Any click or key press; browsers only let audio play after one.
    UserInteraction,
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<ClientEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<ClientEvent>;

pub type CommandSender = tokio::sync::mpsc::UnboundedSender<Command>;
pub type CommandReceiver = tokio::sync::mpsc::UnboundedReceiver<Command>;
