//! Call session controller.
//!
//! Holds at most one [`CallSession`]. Every operation is a pure transition
//! that returns the [`Action`]s to perform; results of asynchronous actions
//! come back through the `on_*_result` handlers, which drop anything that no
//! longer matches the active call.
use crate::action::Action;
use crate::error::{PhoneError, Result};
use crate::event::ClientEvent;
use crate::signaling::{CallId, Invite, SignalingCommand};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod ring_group;
pub use ring_group::{RingGroup, RingGroupCursor};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Ringing,
    Connected,
    Muted,
    Transferring,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local side hung up
    Hangup,
    /// Signaling reported the call gone
    Disconnected,
    Rejected,
    Transferred,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingTransfer {
    target: String,
    resume_state: CallState,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: CallId,
    pub direction: CallDirection,
    pub state: CallState,
    pub remote_address: String,
    /// CallSid of an answered call, used for backend call control
    pub correlation_id: Option<String>,
    /// CallSid announced with an inbound invite that is not answered yet
    offered_correlation_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    mute_pending: Option<bool>,
    transfer: Option<PendingTransfer>,
}

impl CallSession {
    fn new(call_id: CallId, direction: CallDirection, remote_address: String) -> Self {
        Self {
            call_id,
            direction,
            state: CallState::Ringing,
            remote_address,
            correlation_id: None,
            offered_correlation_id: None,
            started_at: Utc::now(),
            answered_at: None,
            mute_pending: None,
            transfer: None,
        }
    }

    pub fn is_muted(&self) -> bool {
        match &self.transfer {
            Some(t) => t.resume_state == CallState::Muted,
            None => self.state == CallState::Muted,
        }
    }

    pub fn mute_pending(&self) -> Option<bool> {
        self.mute_pending
    }

    pub fn transfer_target(&self) -> Option<&str> {
        self.transfer.as_ref().map(|t| t.target.as_str())
    }

    fn is_connected(&self) -> bool {
        matches!(self.state, CallState::Connected | CallState::Muted)
    }

    fn is_ringing_inbound(&self) -> bool {
        self.state == CallState::Ringing && self.direction == CallDirection::Inbound
    }

    fn set_connected_state(&mut self, muted: bool) {
        let state = if muted {
            CallState::Muted
        } else {
            CallState::Connected
        };
        match self.transfer.as_mut() {
            Some(t) => t.resume_state = state,
            None => self.state = state,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallControllerOption {
    pub ring_group: Vec<String>,
    pub backup_agent: Option<String>,
    /// Unanswered inbound calls go to the backup agent after this long
    pub ring_timeout: Option<Duration>,
}

pub struct CallController {
    session: Option<CallSession>,
    ring_group: RingGroup,
    backup_agent: Option<String>,
    ring_timeout: Option<Duration>,
}

impl CallController {
    pub fn new(option: CallControllerOption) -> Self {
        Self {
            session: None,
            ring_group: RingGroup::new(option.ring_group),
            backup_agent: option.backup_agent,
            ring_timeout: option.ring_timeout.filter(|t| !t.is_zero()),
        }
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.session.is_none()
    }

    pub fn ring_group(&self) -> &RingGroup {
        &self.ring_group
    }

    pub fn dial(&mut self, number: &str, device_ready: bool) -> Result<Vec<Action>> {
        let number = number.trim();
        if number.is_empty() {
            return Err(PhoneError::UserInput("phone number is required".to_string()));
        }
        if !device_ready {
            return Err(PhoneError::NotReady);
        }
        if self.session.is_some() {
            return Err(PhoneError::InvalidState(
                "a call is already in progress".to_string(),
            ));
        }
        let call_id = Uuid::new_v4().to_string();
        info!(call_id, number, "dialing");
        self.session = Some(CallSession::new(
            call_id.clone(),
            CallDirection::Outbound,
            number.to_string(),
        ));
        Ok(vec![
            Action::EnsurePlayback,
            Action::log(format!("Calling {}...", number)),
            Action::Signal(SignalingCommand::Connect {
                call_id,
                to: number.to_string(),
            }),
        ])
    }

    pub fn on_incoming(&mut self, invite: Invite) -> Vec<Action> {
        if let Some(active) = &self.session {
            info!(
                call_id = invite.call_id,
                active_call_id = active.call_id,
                "busy, rejecting incoming call"
            );
            return vec![
                Action::log(format!("Busy: rejected call from {}", invite.from)),
                Action::Signal(SignalingCommand::Reject {
                    call_id: invite.call_id,
                }),
            ];
        }
        info!(call_id = invite.call_id, from = invite.from, "incoming call");
        let mut session = CallSession::new(
            invite.call_id.clone(),
            CallDirection::Inbound,
            invite.from.clone(),
        );
        session.offered_correlation_id = invite.correlation_id;
        self.session = Some(session);

        let mut actions = vec![
            Action::log(format!("Incoming connection from {}", invite.from)),
            Action::Emit(ClientEvent::CallIncoming {
                remote_address: invite.from,
            }),
        ];
        if let Some(timeout) = self.ring_timeout {
            actions.push(Action::StartRingTimer {
                call_id: invite.call_id,
                timeout,
            });
        }
        actions
    }

    pub fn accept(&mut self) -> Result<Vec<Action>> {
        let session = match self.session.as_mut() {
            Some(s) if s.is_ringing_inbound() => s,
            Some(s) if s.state == CallState::Transferring => {
                return Err(PhoneError::InvalidState(
                    "call is being transferred".to_string(),
                ));
            }
            _ => {
                return Err(PhoneError::InvalidState(
                    "no incoming call to accept".to_string(),
                ));
            }
        };
        session.state = CallState::Connected;
        session.answered_at = Some(Utc::now());
        session.correlation_id = session.offered_correlation_id.take();
        info!(
            call_id = session.call_id,
            correlation_id = ?session.correlation_id,
            "accepted call"
        );
        Ok(vec![
            Action::EnsurePlayback,
            Action::Signal(SignalingCommand::Accept {
                call_id: session.call_id.clone(),
            }),
            Action::log("Accepted call..."),
            Action::Emit(ClientEvent::CallConnected {
                remote_address: session.remote_address.clone(),
                direction: session.direction,
            }),
        ])
    }

    pub fn reject(&mut self) -> Result<Vec<Action>> {
        let call_id = match &self.session {
            Some(s) if s.is_ringing_inbound() => s.call_id.clone(),
            _ => {
                return Err(PhoneError::InvalidState(
                    "no incoming call to reject".to_string(),
                ));
            }
        };
        let mut actions = vec![
            Action::Signal(SignalingCommand::Reject { call_id }),
            Action::log("Rejected call..."),
        ];
        actions.extend(self.end(EndReason::Rejected));
        Ok(actions)
    }

    /// Idempotent: without an active call this only tells the UI so.
    pub fn hang_up(&mut self) -> Result<Vec<Action>> {
        let call_id = match &self.session {
            None => return Ok(vec![Action::log("No active call to hang up")]),
            Some(s) if s.is_ringing_inbound() => {
                return Err(PhoneError::InvalidState(
                    "incoming call is ringing, reject it instead".to_string(),
                ));
            }
            Some(s) => s.call_id.clone(),
        };
        let mut actions = vec![
            Action::log("Hanging up..."),
            Action::Signal(SignalingCommand::Disconnect { call_id }),
        ];
        actions.extend(self.end(EndReason::Hangup));
        Ok(actions)
    }

    pub fn toggle_mute(&mut self) -> Result<Vec<Action>> {
        let muted = match &self.session {
            Some(s) if s.mute_pending.is_some() => {
                return Err(PhoneError::InvalidState(
                    "mute change already in progress".to_string(),
                ));
            }
            Some(s) => s.is_muted(),
            None => return Err(PhoneError::InvalidState("no connected call".to_string())),
        };
        self.set_mute(!muted)
    }

    /// Local state only changes once the request is confirmed; the UI is
    /// told the new value right away and reverted on failure.
    pub fn set_mute(&mut self, muted: bool) -> Result<Vec<Action>> {
        let session = match self.session.as_mut() {
            Some(s) if s.is_connected() => s,
            _ => return Err(PhoneError::InvalidState("no connected call".to_string())),
        };
        match session.mute_pending {
            Some(pending) if pending == muted => {
                debug!(call_id = session.call_id, muted, "mute request already pending");
                return Ok(vec![]);
            }
            Some(_) => {
                return Err(PhoneError::InvalidState(
                    "mute change already in progress".to_string(),
                ));
            }
            None => {}
        }
        if session.is_muted() == muted {
            return Ok(vec![Action::Emit(ClientEvent::MuteStateChanged { muted })]);
        }
        session.mute_pending = Some(muted);
        Ok(vec![
            Action::log(if muted {
                "Muting call..."
            } else {
                "Unmuting call..."
            }),
            Action::Emit(ClientEvent::MuteStateChanged { muted }),
            Action::RequestMute {
                call_id: session.call_id.clone(),
                correlation_id: session.correlation_id.clone(),
                muted,
            },
        ])
    }

    pub fn on_mute_result(
        &mut self,
        call_id: &str,
        correlation_id: Option<&str>,
        muted: bool,
        result: Result<Option<String>>,
    ) -> Vec<Action> {
        let session = match self.session.as_mut() {
            Some(s)
                if s.call_id == call_id
                    && s.correlation_id.as_deref() == correlation_id
                    && s.mute_pending == Some(muted) =>
            {
                s
            }
            _ => {
                debug!(call_id, muted, "stale mute result ignored");
                return vec![];
            }
        };
        session.mute_pending = None;
        match result {
            Ok(_) => {
                session.set_connected_state(muted);
                info!(call_id, muted, "mute state confirmed");
                vec![Action::log(if muted {
                    "Call muted successfully"
                } else {
                    "Call unmuted successfully"
                })]
            }
            Err(e) => {
                warn!(call_id, muted, "mute request failed: {}", e);
                let verb = if muted { "Mute" } else { "Unmute" };
                vec![
                    Action::log(format!("{} failed: {}", verb, e)),
                    Action::Emit(ClientEvent::MuteStateChanged {
                        muted: session.is_muted(),
                    }),
                ]
            }
        }
    }

    /// Blind transfer through the backend. Allowed on a connected call and
    /// on an inbound call that is still ringing.
    pub fn transfer(&mut self, target: &str) -> Result<Vec<Action>> {
        let target = target.trim();
        if target.is_empty() {
            return Err(PhoneError::UserInput("no agent selected".to_string()));
        }
        let session = match self.session.as_mut() {
            Some(s) => s,
            None => {
                return Err(PhoneError::InvalidState(
                    "no active call to transfer".to_string(),
                ));
            }
        };
        let correlation_id = match session.state {
            CallState::Connected | CallState::Muted => session.correlation_id.clone(),
            CallState::Ringing if session.direction == CallDirection::Inbound => {
                session.offered_correlation_id.clone()
            }
            CallState::Transferring => {
                return Err(PhoneError::InvalidState(
                    "transfer already in progress".to_string(),
                ));
            }
            _ => {
                return Err(PhoneError::InvalidState(
                    "call is not connected".to_string(),
                ));
            }
        };
        let correlation_id = correlation_id.ok_or_else(|| {
            PhoneError::InvalidState("call has no CallSid to transfer".to_string())
        })?;

        info!(
            call_id = session.call_id,
            correlation_id, target, "transferring call"
        );
        session.transfer = Some(PendingTransfer {
            target: target.to_string(),
            resume_state: session.state,
        });
        session.state = CallState::Transferring;
        Ok(vec![
            Action::log(format!("Transferring call to {}", target)),
            Action::RequestTransfer {
                call_id: session.call_id.clone(),
                correlation_id,
                target: target.to_string(),
            },
        ])
    }

    pub fn on_transfer_result(
        &mut self,
        call_id: &str,
        correlation_id: &str,
        target: &str,
        result: Result<Option<String>>,
    ) -> Vec<Action> {
        let session = match self.session.as_mut() {
            Some(s)
                if s.call_id == call_id
                    && s.transfer_target() == Some(target)
                    && (s.correlation_id.as_deref() == Some(correlation_id)
                        || s.offered_correlation_id.as_deref() == Some(correlation_id)) =>
            {
                s
            }
            _ => {
                debug!(call_id, correlation_id, target, "stale transfer result ignored");
                return vec![];
            }
        };
        let pending = match session.transfer.take() {
            Some(pending) => pending,
            None => return vec![],
        };
        match result {
            Ok(message) => {
                let detail = message.unwrap_or_else(|| "Call transferred successfully".to_string());
                info!(call_id, target, "transfer accepted by backend");
                let mut actions = vec![
                    Action::log(format!("Call transferred successfully to {}", target)),
                    Action::Emit(ClientEvent::TransferResult {
                        success: true,
                        detail,
                    }),
                    Action::Signal(SignalingCommand::Disconnect {
                        call_id: call_id.to_string(),
                    }),
                ];
                actions.extend(self.end(EndReason::Transferred));
                actions
            }
            Err(e) => {
                warn!(call_id, target, "transfer failed: {}", e);
                session.state = pending.resume_state;
                vec![
                    Action::log(format!("Transfer failed: {}", e)),
                    Action::Emit(ClientEvent::TransferResult {
                        success: false,
                        detail: e.to_string(),
                    }),
                ]
            }
        }
    }

    /// Round-robin escalation to the next agent of the ring group.
    pub fn cycle_ring_group(&mut self) -> Result<Vec<Action>> {
        match &self.session {
            Some(s) if s.is_connected() && s.correlation_id.is_some() => {}
            Some(s) if s.state == CallState::Transferring => {
                return Err(PhoneError::InvalidState(
                    "transfer already in progress".to_string(),
                ));
            }
            Some(s) if s.is_connected() => {
                return Err(PhoneError::InvalidState(
                    "call has no CallSid to transfer".to_string(),
                ));
            }
            _ => return Err(PhoneError::InvalidState("no connected call".to_string())),
        }
        let target = match self.ring_group.advance() {
            Some(agent) => agent.to_string(),
            None => return Err(PhoneError::UserInput("ring group is empty".to_string())),
        };
        debug!(index = self.ring_group.cursor().index, target, "next agent");
        self.transfer(&target)
    }

    pub fn on_ringing(&mut self, call_id: &str) -> Vec<Action> {
        match &self.session {
            Some(s)
                if s.call_id == call_id
                    && s.direction == CallDirection::Outbound
                    && s.state == CallState::Ringing =>
            {
                vec![
                    Action::log("Ringing..."),
                    Action::Emit(ClientEvent::CallRinging {
                        remote_address: s.remote_address.clone(),
                    }),
                ]
            }
            _ => vec![],
        }
    }

    pub fn on_accepted(&mut self, call_id: &str, correlation_id: Option<String>) -> Vec<Action> {
        let session = match self.session.as_mut() {
            Some(s) if s.call_id == call_id => s,
            _ => {
                debug!(call_id, "accept for unknown call ignored");
                return vec![];
            }
        };
        if session.correlation_id.is_none() {
            let offered = session.offered_correlation_id.take();
            session.correlation_id = correlation_id.or(offered);
        }
        if session.state != CallState::Ringing {
            return vec![];
        }
        session.state = CallState::Connected;
        session.answered_at = Some(Utc::now());
        info!(
            call_id,
            correlation_id = ?session.correlation_id,
            "call established"
        );
        vec![
            Action::log("Successfully established call!"),
            Action::Emit(ClientEvent::CallConnected {
                remote_address: session.remote_address.clone(),
                direction: session.direction,
            }),
        ]
    }

    pub fn on_disconnected(&mut self, call_id: &str) -> Vec<Action> {
        match &self.session {
            Some(s) if s.call_id == call_id => {
                let mut actions = vec![Action::log("Call ended.")];
                actions.extend(self.end(EndReason::Disconnected));
                actions
            }
            _ => {
                debug!(call_id, "disconnect for unknown call ignored");
                vec![]
            }
        }
    }

    pub fn on_call_error(&mut self, call_id: &str, message: &str) -> Vec<Action> {
        match &self.session {
            Some(s) if s.call_id == call_id => {
                warn!(call_id, "call error: {}", message);
                let mut actions = vec![Action::log(format!("Call error: {}", message))];
                actions.extend(self.end(EndReason::Failed));
                actions
            }
            _ => vec![],
        }
    }

    /// Unanswered inbound call: hand it to the backup agent.
    pub fn on_ring_timeout(&mut self, call_id: &str) -> Vec<Action> {
        let still_ringing = matches!(
            &self.session,
            Some(s) if s.call_id == call_id && s.is_ringing_inbound()
        );
        if !still_ringing {
            return vec![];
        }
        let backup = match &self.backup_agent {
            Some(agent) => agent.clone(),
            None => return vec![Action::log("Incoming call not answered")],
        };
        info!(call_id, backup, "ring timeout, escalating to backup agent");
        match self.transfer(&backup) {
            Ok(mut actions) => {
                actions.insert(
                    0,
                    Action::log(format!("No answer, transferring to {}", backup)),
                );
                actions
            }
            Err(e) => vec![Action::log(format!("Auto-transfer failed: {}", e))],
        }
    }

    /// Ended then idle: drop the session and everything tied to it.
    fn end(&mut self, reason: EndReason) -> Vec<Action> {
        let mut session = match self.session.take() {
            Some(s) => s,
            None => return vec![],
        };
        let was_muted = session.is_muted() || session.mute_pending == Some(true);
        session.state = CallState::Ended;
        self.ring_group.reset();
        info!(
            call_id = session.call_id,
            ?reason,
            duration = (Utc::now() - session.started_at).num_seconds(),
            "call ended"
        );
        let mut actions = vec![];
        if was_muted {
            actions.push(Action::Emit(ClientEvent::MuteStateChanged { muted: false }));
        }
        actions.push(Action::Emit(ClientEvent::CallEnded {
            remote_address: session.remote_address,
            reason,
        }));
        actions
    }
}
