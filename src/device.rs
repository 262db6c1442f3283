//! Device lifecycle: registration state, token rotation and the
//! reconnect policy.
//!
//! `Unregistered -> Registering -> Ready`, `Ready <-> Error`, and any state
//! moves to `Registering` when a fresh credential has to create a
//! registration. `Error` is never terminal; every failure schedules a new
//! token fetch.
use crate::action::Action;
use crate::error::PhoneError;
use crate::event::ClientEvent;
use crate::signaling::{ErrorKind, SignalingCommand, SignalingError, SignalingEvent};
use crate::token::Credential;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Unregistered,
    Registering,
    Ready,
    Error,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceState::Unregistered => "unregistered",
            DeviceState::Registering => "registering",
            DeviceState::Ready => "ready",
            DeviceState::Error => "error",
        };
        f.write_str(name)
    }
}

/// The client's registration with the signaling service.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub state: DeviceState,
    pub credential: Option<Credential>,
    /// A registration exists on the signaling side; new credentials update
    /// it instead of creating another one.
    pub registered: bool,
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self {
            state: DeviceState::Unregistered,
            credential: None,
            registered: false,
        }
    }
}

pub struct DeviceManager {
    session: DeviceSession,
    retry_interval: Duration,
    output_device: String,
    fetch_pending: bool,
    /// The pending fetch is waiting out the retry interval.
    fetch_delayed: bool,
    stopped: bool,
}

impl DeviceManager {
    pub fn new(retry_interval: Duration, output_device: String) -> Self {
        Self {
            session: DeviceSession::default(),
            retry_interval,
            output_device,
            fetch_pending: false,
            fetch_delayed: false,
            stopped: false,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.session.state
    }

    pub fn is_ready(&self) -> bool {
        self.session.state == DeviceState::Ready
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn fetch_pending(&self) -> bool {
        self.fetch_pending
    }

    /// First token fetch. Media has been acquired by the caller.
    pub fn start(&mut self) -> Vec<Action> {
        self.stopped = false;
        self.request_token(None)
    }

    pub fn stop(&mut self) -> Vec<Action> {
        self.stopped = true;
        let mut actions = vec![];
        if self.session.registered {
            self.session.registered = false;
            actions.push(Action::Signal(SignalingCommand::Unregister));
        }
        self.set_state(DeviceState::Unregistered, &mut actions);
        actions
    }

    pub fn on_token(&mut self, result: Result<Credential, PhoneError>) -> Vec<Action> {
        self.fetch_pending = false;
        self.fetch_delayed = false;
        if self.stopped {
            return vec![];
        }
        let mut actions = vec![];
        match result {
            Ok(credential) => {
                info!(identity = ?credential.identity, "got a token");
                actions.push(Action::log("Got a token."));
                self.session.credential = Some(credential.clone());
                if self.session.registered {
                    actions.push(Action::Signal(SignalingCommand::UpdateToken(credential)));
                    if self.session.state != DeviceState::Ready {
                        self.set_state(DeviceState::Registering, &mut actions);
                    }
                } else {
                    self.session.registered = true;
                    actions.push(Action::Signal(SignalingCommand::Register(credential)));
                    self.set_state(DeviceState::Registering, &mut actions);
                }
            }
            Err(e) => {
                warn!("token fetch failed: {}", e);
                actions.push(Action::log(
                    "Could not get a token from server! Retrying...",
                ));
                actions.extend(self.request_token(Some(self.retry_interval)));
            }
        }
        actions
    }

    /// Handles the device-level signaling events; call events are ignored.
    pub fn on_event(&mut self, event: &SignalingEvent) -> Vec<Action> {
        if self.stopped {
            return vec![];
        }
        let mut actions = vec![];
        match event {
            SignalingEvent::Registered => {
                self.set_state(DeviceState::Ready, &mut actions);
                actions.push(Action::log("Device ready!"));
                actions.push(Action::Signal(SignalingCommand::SetOutputDevice(
                    self.output_device.clone(),
                )));
                actions.push(Action::ArmPlaybackResume);
                actions.push(Action::LogInputDevices);
            }
            SignalingEvent::Unregistered => {
                self.session.registered = false;
                self.set_state(DeviceState::Unregistered, &mut actions);
                actions.extend(self.request_token(Some(self.retry_interval)));
            }
            SignalingEvent::Error(err) => return self.on_error(err),
            SignalingEvent::TokenWillExpire | SignalingEvent::TokenExpired => {
                info!(state = %self.session.state, "token expiring, refreshing");
                actions.push(Action::log("Token expiring, refreshing..."));
                actions.extend(self.request_token(None));
            }
            _ => {}
        }
        actions
    }

    pub fn on_error(&mut self, err: &SignalingError) -> Vec<Action> {
        if self.stopped {
            return vec![];
        }
        let mut actions = vec![];
        match err.kind() {
            ErrorKind::Transport => {
                warn!(code = err.code, "transport fault: {}", err.message);
                self.session.registered = false;
                self.set_state(DeviceState::Error, &mut actions);
                actions.push(Action::log(format!(
                    "Connection error detected. Retrying in {} seconds...",
                    self.retry_interval.as_secs()
                )));
                actions.extend(self.request_token(Some(self.retry_interval)));
            }
            ErrorKind::Credential => {
                warn!(code = err.code, "credential fault: {}", err.message);
                // the service dropped the registration along with the token
                self.session.registered = false;
                self.set_state(DeviceState::Error, &mut actions);
                actions.push(Action::log("Token rejected, fetching a new one..."));
                actions.extend(self.request_token(None));
            }
            ErrorKind::Other => {
                info!(code = err.code, "device error: {}", err.message);
                actions.push(Action::error(err.message.clone()));
            }
        }
        actions
    }

    fn request_token(&mut self, delay: Option<Duration>) -> Vec<Action> {
        if self.fetch_pending {
            if !(self.fetch_delayed && delay.is_none()) {
                debug!("token fetch already pending");
                return vec![];
            }
            // an immediate fetch replaces the one waiting out the backoff
            debug!("superseding delayed token fetch");
        }
        self.fetch_pending = true;
        self.fetch_delayed = delay.is_some();
        vec![Action::FetchToken { delay }]
    }

    fn set_state(&mut self, state: DeviceState, actions: &mut Vec<Action>) {
        if self.session.state == state {
            return;
        }
        info!(from = %self.session.state, to = %state, "device state changed");
        self.session.state = state;
        actions.push(Action::Emit(ClientEvent::DeviceStateChanged { state }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> DeviceManager {
        DeviceManager::new(Duration::from_secs(5), "default".to_string())
    }

    fn has_signal(actions: &[Action], name: &str) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, Action::Signal(cmd) if cmd.name() == name))
    }

    fn fetch_delay(actions: &[Action]) -> Option<Option<Duration>> {
        actions.iter().find_map(|a| match a {
            Action::FetchToken { delay } => Some(*delay),
            _ => None,
        })
    }

    fn registered_manager() -> DeviceManager {
        let mut device = manager();
        device.start();
        device.on_token(Ok(Credential::new("t1", None)));
        device.on_event(&SignalingEvent::Registered);
        device
    }

    #[test]
    fn test_start_registers_once() {
        let mut device = manager();
        assert_eq!(fetch_delay(&device.start()), Some(None));
        // a second request while one is pending is coalesced
        assert!(device.on_event(&SignalingEvent::TokenExpired).iter().all(|a| !matches!(a, Action::FetchToken { .. })));

        let actions = device.on_token(Ok(Credential::new("t1", None)));
        assert!(has_signal(&actions, "register"));
        assert_eq!(device.state(), DeviceState::Registering);
        assert!(actions.contains(&Action::Emit(ClientEvent::DeviceStateChanged {
            state: DeviceState::Registering
        })));

        let actions = device.on_event(&SignalingEvent::Registered);
        assert!(device.is_ready());
        assert!(actions.contains(&Action::Signal(SignalingCommand::SetOutputDevice(
            "default".to_string()
        ))));
        assert!(actions.contains(&Action::ArmPlaybackResume));
    }

    #[test]
    fn test_token_rotation_updates_in_place() {
        let mut device = registered_manager();
        let actions = device.on_event(&SignalingEvent::TokenWillExpire);
        assert_eq!(fetch_delay(&actions), Some(None));

        let actions = device.on_token(Ok(Credential::new("t2", None)));
        assert!(has_signal(&actions, "updateToken"));
        assert!(!has_signal(&actions, "register"));
        assert!(device.is_ready());
        assert_eq!(
            device.session().credential.as_ref().map(|c| c.token.as_str()),
            Some("t2")
        );
    }

    #[test]
    fn test_transport_fault_reregisters_after_backoff() {
        let mut device = registered_manager();
        let actions = device.on_event(&SignalingEvent::Error(SignalingError::transport()));
        assert_eq!(device.state(), DeviceState::Error);
        assert_eq!(fetch_delay(&actions), Some(Some(Duration::from_secs(5))));

        let actions = device.on_token(Ok(Credential::new("t2", None)));
        assert!(has_signal(&actions, "register"));
        assert_eq!(device.state(), DeviceState::Registering);

        device.on_event(&SignalingEvent::Registered);
        assert!(device.is_ready());
    }

    #[test]
    fn test_credential_fault_refetches_immediately() {
        let mut device = registered_manager();
        let actions =
            device.on_event(&SignalingEvent::Error(SignalingError::new(20104, "expired")));
        assert_eq!(device.state(), DeviceState::Error);
        assert_eq!(fetch_delay(&actions), Some(None));

        let actions = device.on_token(Ok(Credential::new("t2", None)));
        assert!(has_signal(&actions, "register"));
        assert!(!has_signal(&actions, "updateToken"));
        assert_eq!(device.state(), DeviceState::Registering);

        device.on_event(&SignalingEvent::Registered);
        assert!(device.is_ready());
    }

    #[test]
    fn test_credential_fault_supersedes_delayed_fetch() {
        let mut device = registered_manager();
        let actions = device.on_event(&SignalingEvent::Error(SignalingError::transport()));
        assert_eq!(fetch_delay(&actions), Some(Some(Duration::from_secs(5))));

        let actions =
            device.on_event(&SignalingEvent::Error(SignalingError::new(20104, "expired")));
        assert_eq!(fetch_delay(&actions), Some(None));
        assert!(device.fetch_pending());

        // nothing replaces an immediate fetch
        let actions = device.on_event(&SignalingEvent::Error(SignalingError::transport()));
        assert_eq!(fetch_delay(&actions), None);
        let actions = device.on_event(&SignalingEvent::TokenExpired);
        assert_eq!(fetch_delay(&actions), None);

        let actions = device.on_token(Ok(Credential::new("t2", None)));
        assert!(has_signal(&actions, "register"));
        assert!(!device.fetch_pending());
    }

    #[test]
    fn test_other_error_is_surfaced() {
        let mut device = registered_manager();
        let actions = device.on_event(&SignalingEvent::Error(SignalingError::new(
            31208,
            "microphone denied",
        )));
        assert!(device.is_ready());
        assert_eq!(actions, vec![Action::error("microphone denied")]);
    }

    #[test]
    fn test_token_failures_retry_forever() {
        let mut device = manager();
        device.start();
        for _ in 0..20 {
            let actions = device.on_token(Err(PhoneError::Token("503".to_string())));
            assert_eq!(fetch_delay(&actions), Some(Some(Duration::from_secs(5))));
            assert_eq!(device.state(), DeviceState::Unregistered);
        }
    }

    #[test]
    fn test_stop_unregisters() {
        let mut device = registered_manager();
        let actions = device.stop();
        assert!(has_signal(&actions, "unregister"));
        assert_eq!(device.state(), DeviceState::Unregistered);
        assert!(device.on_token(Ok(Credential::new("late", None))).is_empty());
        assert!(device.on_event(&SignalingEvent::TokenExpired).is_empty());
    }
}
