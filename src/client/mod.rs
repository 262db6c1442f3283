//! The client session ties the device lifecycle, the call controller and the
//! media gate to their collaborators.
//!
//! Everything runs on one task: commands from the presentation layer,
//! signaling events and the results of spawned work are handled one at a
//! time, so the state machines never see concurrent mutation. Spawned work
//! (token fetches, backend requests, timers) reports back through a
//! [`Completion`] and is checked against the active call before it applies.
use crate::action::Action;
use crate::backend::CallControl;
use crate::call::{CallController, CallControllerOption};
use crate::config::Config;
use crate::device::{DeviceManager, DeviceState};
use crate::error::{PhoneError, Result};
use crate::event::{ClientEvent, Command, CommandReceiver, CommandSender, EventReceiver, EventSender};
use crate::media::{HeadlessMedia, MediaBackend, MediaConstraints, MediaGate};
use crate::signaling::{
    CallId, SignalingClient, SignalingCommand, SignalingError, SignalingEvent,
    SignalingEventReceiver,
};
use crate::token::{Credential, TokenSupplier};
use anyhow::anyhow;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

/// Result of work spawned off the session task.
#[derive(Debug)]
enum Completion {
    Token(Result<Credential>),
    Register(std::result::Result<(), SignalingError>),
    Mute {
        call_id: CallId,
        correlation_id: Option<String>,
        muted: bool,
        result: Result<Option<String>>,
    },
    Transfer {
        call_id: CallId,
        correlation_id: String,
        target: String,
        result: Result<Option<String>>,
    },
    RingTimeout {
        call_id: CallId,
    },
}

pub struct ClientSessionBuilder {
    pub config: Option<Config>,
    pub cancel_token: Option<CancellationToken>,
    pub token_supplier: Option<Arc<dyn TokenSupplier>>,
    pub call_control: Option<Arc<dyn CallControl>>,
    pub signaling: Option<Arc<dyn SignalingClient>>,
    pub media: Option<Arc<dyn MediaBackend>>,
}

impl ClientSessionBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cancel_token: None,
            token_supplier: None,
            call_control: None,
            signaling: None,
            media: None,
        }
    }

    pub fn with_config(mut self, config: Option<Config>) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_token_supplier(mut self, supplier: Arc<dyn TokenSupplier>) -> Self {
        self.token_supplier = Some(supplier);
        self
    }

    pub fn with_call_control(mut self, control: Arc<dyn CallControl>) -> Self {
        self.call_control = Some(control);
        self
    }

    pub fn with_signaling(mut self, signaling: Arc<dyn SignalingClient>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaBackend>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn build(mut self) -> anyhow::Result<ClientSession> {
        let config = self.config.take().unwrap_or_default();
        let token = self.cancel_token.take().unwrap_or_default();
        let token_supplier = self
            .token_supplier
            .take()
            .ok_or_else(|| anyhow!("token supplier is required"))?;
        let call_control = self
            .call_control
            .take()
            .ok_or_else(|| anyhow!("call control is required"))?;
        let signaling = self
            .signaling
            .take()
            .ok_or_else(|| anyhow!("signaling client is required"))?;
        let media_backend = self
            .media
            .take()
            .unwrap_or_else(|| Arc::new(HeadlessMedia::new()));

        let constraints = MediaConstraints {
            echo_cancellation: config.media.echo_cancellation,
            noise_suppression: config.media.noise_suppression,
            sample_rate: config.media.sample_rate,
        };
        let device = DeviceManager::new(
            config.session.retry_interval(),
            config.media.output_device.clone(),
        );
        let calls = CallController::new(CallControllerOption {
            ring_group: config.ring_group.agents.clone(),
            backup_agent: config.ring_group.backup_agent.clone(),
            ring_timeout: config.session.ring_timeout(),
        });

        // subscribe before serving so nothing sent in between is lost
        let signaling_events = signaling.subscribe();
        let (event_sender, _) = broadcast::channel(128);
        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (completion_sender, completion_receiver) = mpsc::unbounded_channel();

        Ok(ClientSession {
            token,
            token_supplier,
            call_control,
            signaling,
            signaling_events,
            media: MediaGate::new(media_backend, constraints),
            device,
            calls,
            event_sender,
            command_sender,
            command_receiver,
            completion_sender,
            completion_receiver,
            token_fetch: None,
        })
    }
}

impl Default for ClientSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for the presentation layer: send commands, watch events.
#[derive(Clone)]
pub struct PhoneHandle {
    command_sender: CommandSender,
    event_sender: EventSender,
    token: CancellationToken,
}

impl PhoneHandle {
    pub fn send(&self, command: Command) -> Result<()> {
        self.command_sender
            .send(command)
            .map_err(|_| PhoneError::InvalidState("client session stopped".to_string()))
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_sender.subscribe()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct ClientSession {
    token: CancellationToken,
    token_supplier: Arc<dyn TokenSupplier>,
    call_control: Arc<dyn CallControl>,
    signaling: Arc<dyn SignalingClient>,
    signaling_events: SignalingEventReceiver,
    media: MediaGate,
    device: DeviceManager,
    calls: CallController,
    event_sender: EventSender,
    command_sender: CommandSender,
    command_receiver: CommandReceiver,
    completion_sender: mpsc::UnboundedSender<Completion>,
    completion_receiver: mpsc::UnboundedReceiver<Completion>,
    token_fetch: Option<CancellationToken>,
}

impl ClientSession {
    pub fn handle(&self) -> PhoneHandle {
        PhoneHandle {
            command_sender: self.command_sender.clone(),
            event_sender: self.event_sender.clone(),
            token: self.token.clone(),
        }
    }

    pub fn device_state(&self) -> DeviceState {
        self.device.state()
    }

    /// Runs until the cancel token fires. Fails only when the microphone
    /// cannot be acquired, which needs the user to act and is not retried.
    pub async fn serve(mut self) -> Result<()> {
        self.emit(ClientEvent::log("Requesting microphone access..."));
        if let Err(e) = self.media.acquire().await {
            error!("media unavailable: {}", e);
            self.emit(ClientEvent::error(e.to_string()));
            self.emit(ClientEvent::log(
                "Microphone access is required to make and receive calls.",
            ));
            return Err(e);
        }
        self.emit(ClientEvent::log("Requesting Access Token..."));
        let actions = self.device.start();
        self.perform(actions).await;

        loop {
            select! {
                _ = self.token.cancelled() => {
                    info!("client session cancelled");
                    break;
                }
                command = self.command_receiver.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = self.signaling_events.recv() => match event {
                    Ok(event) => self.handle_signaling_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "signaling events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("signaling event stream closed");
                        break;
                    }
                },
                Some(completion) = self.completion_receiver.recv() => {
                    self.handle_completion(completion).await;
                }
            }
        }
        self.shutdown().await;
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) {
        debug!(?command, "command received");
        let result = match command {
            Command::Dial { number } => self.calls.dial(&number, self.device.is_ready()),
            Command::Accept => self.calls.accept(),
            Command::Reject => self.calls.reject(),
            Command::HangUp => self.calls.hang_up(),
            Command::ToggleMute => self.calls.toggle_mute(),
            Command::SetMute { muted } => self.calls.set_mute(muted),
            Command::TransferTo { agent } => self.calls.transfer(&agent),
            Command::CycleRingGroup => self.calls.cycle_ring_group(),
            Command::UserInteraction => {
                self.on_user_interaction().await;
                Ok(vec![])
            }
        };
        match result {
            Ok(actions) => self.perform(actions).await,
            Err(e) => {
                info!("command rejected: {}", e);
                self.emit(ClientEvent::error(e.to_string()));
            }
        }
    }

    async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        debug!(?event, "signaling event");
        let actions = match &event {
            SignalingEvent::Registered
            | SignalingEvent::Unregistered
            | SignalingEvent::Error(_)
            | SignalingEvent::TokenWillExpire
            | SignalingEvent::TokenExpired => self.device.on_event(&event),
            SignalingEvent::Incoming(invite) => self.calls.on_incoming(invite.clone()),
            SignalingEvent::Ringing { call_id } => self.calls.on_ringing(call_id),
            SignalingEvent::Accepted {
                call_id,
                correlation_id,
            } => self.calls.on_accepted(call_id, correlation_id.clone()),
            SignalingEvent::Disconnected { call_id } => self.calls.on_disconnected(call_id),
            SignalingEvent::CallError { call_id, message } => {
                self.calls.on_call_error(call_id, message)
            }
        };
        self.perform(actions).await;
    }

    async fn handle_completion(&mut self, completion: Completion) {
        let actions = match completion {
            Completion::Token(result) => self.device.on_token(result),
            Completion::Register(Ok(())) => vec![],
            Completion::Register(Err(e)) => {
                warn!("registration failed: {}", e);
                self.device.on_error(&e)
            }
            Completion::Mute {
                call_id,
                correlation_id,
                muted,
                result,
            } => self
                .calls
                .on_mute_result(&call_id, correlation_id.as_deref(), muted, result),
            Completion::Transfer {
                call_id,
                correlation_id,
                target,
                result,
            } => self
                .calls
                .on_transfer_result(&call_id, &correlation_id, &target, result),
            Completion::RingTimeout { call_id } => self.calls.on_ring_timeout(&call_id),
        };
        self.perform(actions).await;
    }

    /// Actions may produce follow-up actions; they run in order until none
    /// are left.
    async fn perform(&mut self, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            queue.extend(self.execute(action).await);
        }
    }

    async fn execute(&mut self, action: Action) -> Vec<Action> {
        match action {
            Action::Signal(command) => self.signal(command).await,
            Action::FetchToken { delay } => {
                self.spawn_token_fetch(delay);
                vec![]
            }
            Action::RequestMute {
                call_id,
                correlation_id,
                muted,
            } => self.request_mute(call_id, correlation_id, muted).await,
            Action::RequestTransfer {
                call_id,
                correlation_id,
                target,
            } => {
                self.spawn_transfer(call_id, correlation_id, target);
                vec![]
            }
            Action::StartRingTimer { call_id, timeout } => {
                self.spawn_ring_timer(call_id, timeout);
                vec![]
            }
            Action::EnsurePlayback => match self.media.ensure_playback().await {
                Ok(true) => vec![Action::log("Audio context resumed")],
                Ok(false) => vec![],
                Err(e) => {
                    warn!("failed to resume playback: {}", e);
                    vec![Action::log(format!("Audio playback unavailable: {}", e))]
                }
            },
            Action::ArmPlaybackResume => {
                self.media.arm_resume_on_interaction();
                vec![]
            }
            Action::LogInputDevices => {
                let devices = self.media.input_devices();
                info!(?devices, "available input devices");
                if devices.is_empty() {
                    vec![Action::log("No audio input devices found")]
                } else {
                    vec![Action::log(format!(
                        "Available input devices: {}",
                        devices.join(", ")
                    ))]
                }
            }
            Action::Emit(event) => {
                self.emit(event);
                vec![]
            }
        }
    }

    async fn signal(&mut self, command: SignalingCommand) -> Vec<Action> {
        let name = command.name();
        let call_id = match &command {
            SignalingCommand::Connect { call_id, .. } | SignalingCommand::Accept { call_id } => {
                Some(call_id.clone())
            }
            _ => None,
        };
        debug!(command = name, "signaling command");
        if let SignalingCommand::Register(_) = command {
            // opening the connection may take a while; keep serving meanwhile
            let signaling = self.signaling.clone();
            let sender = self.completion_sender.clone();
            tokio::spawn(async move {
                let result = signaling.execute(command).await;
                sender.send(Completion::Register(result)).ok();
            });
            return vec![];
        }
        let update = matches!(command, SignalingCommand::UpdateToken(_));
        match self.signaling.execute(command).await {
            Ok(()) => vec![],
            Err(e) if update => {
                warn!(command = name, "registration failed: {}", e);
                self.device.on_error(&e)
            }
            Err(e) => match call_id {
                Some(call_id) => self.calls.on_call_error(&call_id, &e.message),
                None => {
                    warn!(command = name, "signaling command failed: {}", e);
                    vec![]
                }
            },
        }
    }

    /// A new fetch replaces whatever fetch is still outstanding.
    fn spawn_token_fetch(&mut self, delay: Option<Duration>) {
        if let Some(previous) = self.token_fetch.take() {
            previous.cancel();
        }
        let supplier = self.token_supplier.clone();
        let sender = self.completion_sender.clone();
        let token = self.token.child_token();
        self.token_fetch = Some(token.clone());
        tokio::spawn(async move {
            let fetch = async {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                supplier.fetch_token().await
            };
            select! {
                _ = token.cancelled() => {}
                result = fetch => {
                    sender.send(Completion::Token(result)).ok();
                }
            }
        });
    }

    /// Local mute when the signaling layer offers it, the backend otherwise.
    async fn request_mute(
        &mut self,
        call_id: CallId,
        correlation_id: Option<String>,
        muted: bool,
    ) -> Vec<Action> {
        if self.signaling.supports_local_mute() {
            let result = self
                .signaling
                .execute(SignalingCommand::SetMuted {
                    call_id: call_id.clone(),
                    muted,
                })
                .await
                .map(|_| None)
                .map_err(|e| PhoneError::Transport(e.message));
            return self
                .calls
                .on_mute_result(&call_id, correlation_id.as_deref(), muted, result);
        }

        let sid = match correlation_id {
            Some(sid) => sid,
            None => {
                return self.calls.on_mute_result(
                    &call_id,
                    None,
                    muted,
                    Err(PhoneError::InvalidState("call has no CallSid".to_string())),
                );
            }
        };
        let control = self.call_control.clone();
        let sender = self.completion_sender.clone();
        tokio::spawn(async move {
            let result = control.set_mute(&sid, muted).await;
            sender
                .send(Completion::Mute {
                    call_id,
                    correlation_id: Some(sid),
                    muted,
                    result,
                })
                .ok();
        });
        vec![]
    }

    fn spawn_transfer(&self, call_id: CallId, correlation_id: String, target: String) {
        let control = self.call_control.clone();
        let sender = self.completion_sender.clone();
        tokio::spawn(async move {
            let result = control.transfer(&correlation_id, &target).await;
            sender
                .send(Completion::Transfer {
                    call_id,
                    correlation_id,
                    target,
                    result,
                })
                .ok();
        });
    }

    fn spawn_ring_timer(&self, call_id: CallId, timeout: Duration) {
        let sender = self.completion_sender.clone();
        let token = self.token.child_token();
        tokio::spawn(async move {
            select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    sender.send(Completion::RingTimeout { call_id }).ok();
                }
            }
        });
    }

    async fn on_user_interaction(&mut self) {
        match self.media.on_user_interaction().await {
            Ok(true) => self.emit(ClientEvent::log("Audio context resumed")),
            Ok(false) => {}
            Err(e) => self.emit(ClientEvent::log(format!("Failed to resume audio: {}", e))),
        }
    }

    fn emit(&self, event: ClientEvent) {
        match &event {
            ClientEvent::Log { message } => debug!("> {}", message),
            ClientEvent::Error { message } => info!("error shown: {}", message),
            _ => debug!(?event, "client event"),
        }
        // no subscriber is not an error
        self.event_sender.send(event).ok();
    }

    async fn shutdown(&mut self) {
        info!(state = %self.device.state(), "shutting down client session");
        let mut actions = if self.calls.is_idle() {
            vec![]
        } else {
            match self.calls.hang_up() {
                Ok(actions) => actions,
                Err(_) => self.calls.reject().unwrap_or_default(),
            }
        };
        actions.extend(self.device.stop());
        self.perform(actions).await;
    }
}
