use crate::event::ClientEvent;
use crate::signaling::{CallId, SignalingCommand};
use std::time::Duration;

/// Side effect requested by a state handler. Handlers only return actions;
/// the client session performs them and reports results back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Signal(SignalingCommand),
    /// Fetch a fresh credential, optionally after a delay.
    FetchToken {
        delay: Option<Duration>,
    },
    /// Mute locally when the signaling layer can, via the backend otherwise.
    RequestMute {
        call_id: CallId,
        correlation_id: Option<String>,
        muted: bool,
    },
    RequestTransfer {
        call_id: CallId,
        correlation_id: String,
        target: String,
    },
    StartRingTimer {
        call_id: CallId,
        timeout: Duration,
    },
    /// Resume the playback context if it is suspended.
    EnsurePlayback,
    ArmPlaybackResume,
    LogInputDevices,
    Emit(ClientEvent),
}

impl Action {
    pub fn log(message: impl Into<String>) -> Self {
        Action::Emit(ClientEvent::log(message))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Action::Emit(ClientEvent::error(message))
    }
}
