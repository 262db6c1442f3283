//! Contract of the telephony signaling service.
//!
//! The core only issues [`SignalingCommand`]s and reacts to
//! [`SignalingEvent`]s; the transport behind them is pluggable. [`ws`] holds
//! the WebSocket implementation used by the binary.
use crate::token::Credential;
use async_trait::async_trait;
use thiserror::Error;

pub mod ws;

/// Handle of one call on the signaling layer. Outbound calls get an id from
/// the core, inbound ones from the signaling service.
pub type CallId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    pub call_id: CallId,
    /// Caller address as presented by the network
    pub from: String,
    /// CallSid of the inbound leg, needed for backend call control
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingCommand {
    /// Create the registration. Issued only when none exists.
    Register(Credential),
    /// Rotate the token of the existing registration in place.
    UpdateToken(Credential),
    Connect {
        call_id: CallId,
        to: String,
    },
    Accept {
        call_id: CallId,
    },
    Reject {
        call_id: CallId,
    },
    Disconnect {
        call_id: CallId,
    },
    DisconnectAll,
    SetMuted {
        call_id: CallId,
        muted: bool,
    },
    SetOutputDevice(String),
    Unregister,
}

impl SignalingCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SignalingCommand::Register(_) => "register",
            SignalingCommand::UpdateToken(_) => "updateToken",
            SignalingCommand::Connect { .. } => "connect",
            SignalingCommand::Accept { .. } => "accept",
            SignalingCommand::Reject { .. } => "reject",
            SignalingCommand::Disconnect { .. } => "disconnect",
            SignalingCommand::DisconnectAll => "disconnectAll",
            SignalingCommand::SetMuted { .. } => "mute",
            SignalingCommand::SetOutputDevice(_) => "setOutputDevice",
            SignalingCommand::Unregister => "unregister",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Registered,
    Unregistered,
    Error(SignalingError),
    TokenWillExpire,
    TokenExpired,
    Incoming(Invite),
    /// Far end of an outbound call is ringing
    Ringing {
        call_id: CallId,
    },
    /// Media is flowing; carries the CallSid once the network assigned one
    Accepted {
        call_id: CallId,
        correlation_id: Option<String>,
    },
    /// Call is gone, whichever side hung up
    Disconnected {
        call_id: CallId,
    },
    CallError {
        call_id: CallId,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Credential,
    Other,
}

pub const TRANSPORT_ERROR_CODE: u32 = 31009;
pub const TRANSPORT_ERROR_MESSAGE: &str = "WSTransport socket error";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("signaling error {code}: {message}")]
pub struct SignalingError {
    pub code: u32,
    pub message: String,
}

impl SignalingError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn transport() -> Self {
        Self::new(TRANSPORT_ERROR_CODE, TRANSPORT_ERROR_MESSAGE)
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code {
            31000..=31009 | 53000..=53999 => return ErrorKind::Transport,
            20101..=20107 | 31204 | 31205 => return ErrorKind::Credential,
            _ => {}
        }
        let message = self.message.to_ascii_lowercase();
        if message.contains("wstransport socket error") || message.contains("transport") {
            ErrorKind::Transport
        } else if message.contains("token")
            && (message.contains("expired") || message.contains("invalid"))
        {
            ErrorKind::Credential
        } else {
            ErrorKind::Other
        }
    }
}

pub type SignalingEventSender = tokio::sync::broadcast::Sender<SignalingEvent>;
pub type SignalingEventReceiver = tokio::sync::broadcast::Receiver<SignalingEvent>;

#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// One subscription per session, held for its whole life.
    fn subscribe(&self) -> SignalingEventReceiver;

    /// Whether the connection object can mute the microphone itself.
    fn supports_local_mute(&self) -> bool {
        true
    }

    async fn execute(&self, command: SignalingCommand) -> Result<(), SignalingError>;
}
