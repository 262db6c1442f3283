use super::*;
use crate::backend::MockCallControl;
use crate::call::EndReason;
use crate::signaling::{Invite, SignalingError, SignalingEventSender};
use crate::token::MockTokenSupplier;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Signaling service double: records commands, answers `register` with
/// `registered` and lets the test inject any other event.
struct FakeSignaling {
    sender: SignalingEventSender,
    commands: Mutex<Vec<SignalingCommand>>,
    local_mute: bool,
    register_delay: Option<Duration>,
}

impl FakeSignaling {
    fn new(local_mute: bool) -> Arc<Self> {
        let (sender, _) = broadcast::channel(64);
        Arc::new(Self {
            sender,
            commands: Mutex::new(vec![]),
            local_mute,
            register_delay: None,
        })
    }

    /// `register` hangs for `delay` before it answers, like a slow handshake.
    fn with_register_delay(delay: Duration) -> Arc<Self> {
        let (sender, _) = broadcast::channel(64);
        Arc::new(Self {
            sender,
            commands: Mutex::new(vec![]),
            local_mute: true,
            register_delay: Some(delay),
        })
    }

    fn inject(&self, event: SignalingEvent) {
        self.sender.send(event).ok();
    }

    fn commands(&self) -> Vec<SignalingCommand> {
        self.commands.lock().unwrap().clone()
    }

    fn count(&self, name: &str) -> usize {
        self.commands().iter().filter(|c| c.name() == name).count()
    }

    async fn wait_for(&self, name: &str, count: usize) -> SignalingCommand {
        timeout(Duration::from_secs(3), async {
            loop {
                let matching: Vec<_> = self
                    .commands()
                    .into_iter()
                    .filter(|c| c.name() == name)
                    .collect();
                if matching.len() >= count {
                    return matching[count - 1].clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("signaling command not issued")
    }
}

#[async_trait]
impl SignalingClient for FakeSignaling {
    fn subscribe(&self) -> SignalingEventReceiver {
        self.sender.subscribe()
    }

    fn supports_local_mute(&self) -> bool {
        self.local_mute
    }

    async fn execute(&self, command: SignalingCommand) -> std::result::Result<(), SignalingError> {
        let registered = matches!(command, SignalingCommand::Register(_));
        self.commands.lock().unwrap().push(command);
        if registered {
            if let Some(delay) = self.register_delay {
                tokio::time::sleep(delay).await;
            }
            self.inject(SignalingEvent::Registered);
        }
        Ok(())
    }
}

struct Harness {
    handle: PhoneHandle,
    events: EventReceiver,
    signaling: Arc<FakeSignaling>,
    task: JoinHandle<Result<()>>,
}

impl Harness {
    async fn next_event(&mut self, pred: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
        let events = &mut self.events;
        timeout(Duration::from_secs(3), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream failed: {:?}", e),
                }
            }
        })
        .await
        .expect("event not emitted")
    }

    async fn ready(&mut self) {
        self.next_event(|e| {
            matches!(
                e,
                ClientEvent::DeviceStateChanged {
                    state: DeviceState::Ready
                }
            )
        })
        .await;
    }

    async fn incoming_connected(&mut self, call_id: &str, sid: &str) {
        self.signaling.inject(SignalingEvent::Incoming(Invite {
            call_id: call_id.to_string(),
            from: "+15559876543".to_string(),
            correlation_id: Some(sid.to_string()),
        }));
        self.next_event(|e| matches!(e, ClientEvent::CallIncoming { .. }))
            .await;
        self.handle.send(Command::Accept).unwrap();
        self.next_event(|e| matches!(e, ClientEvent::CallConnected { .. }))
            .await;
    }

    async fn stop(self) -> Result<()> {
        self.handle.stop();
        timeout(Duration::from_secs(3), self.task)
            .await
            .expect("session did not stop")
            .expect("session task panicked")
    }
}

fn test_config(retry_interval_secs: u64, ring_timeout_secs: u64) -> Config {
    let mut config = Config::default();
    config.session.retry_interval_secs = retry_interval_secs;
    config.session.ring_timeout_secs = ring_timeout_secs;
    config
}

fn working_tokens() -> MockTokenSupplier {
    let mut tokens = MockTokenSupplier::new();
    let issued = AtomicUsize::new(0);
    tokens.expect_fetch_token().returning(move || {
        let n = issued.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Credential::new(format!("t{}", n), Some("alice".to_string())))
    });
    tokens
}

fn start(
    config: Config,
    tokens: MockTokenSupplier,
    control: MockCallControl,
    signaling: Arc<FakeSignaling>,
    media: Arc<dyn MediaBackend>,
) -> Harness {
    let session = ClientSessionBuilder::new()
        .with_config(Some(config))
        .with_token_supplier(Arc::new(tokens))
        .with_call_control(Arc::new(control))
        .with_signaling(signaling.clone())
        .with_media(media)
        .build()
        .unwrap();
    let handle = session.handle();
    let events = handle.subscribe();
    let task = tokio::spawn(session.serve());
    Harness {
        handle,
        events,
        signaling,
        task,
    }
}

fn start_default(signaling: Arc<FakeSignaling>, control: MockCallControl) -> Harness {
    start(
        test_config(5, 0),
        working_tokens(),
        control,
        signaling,
        Arc::new(HeadlessMedia::new()),
    )
}

#[test]
fn test_builder_requires_collaborators() {
    assert!(ClientSessionBuilder::new().build().is_err());
}

#[tokio::test]
async fn test_registers_and_becomes_ready() {
    let mut h = start_default(FakeSignaling::new(true), MockCallControl::new());
    h.ready().await;
    assert_eq!(h.signaling.count("register"), 1);
    h.signaling.wait_for("setOutputDevice", 1).await;
    assert!(h
        .signaling
        .commands()
        .contains(&SignalingCommand::SetOutputDevice("default".to_string())));
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_outbound_call_remote_hangup() {
    let mut h = start_default(FakeSignaling::new(true), MockCallControl::new());
    h.ready().await;

    h.handle
        .send(Command::Dial {
            number: "+15551234567".to_string(),
        })
        .unwrap();
    let call_id = match h.signaling.wait_for("connect", 1).await {
        SignalingCommand::Connect { call_id, to } => {
            assert_eq!(to, "+15551234567");
            call_id
        }
        other => panic!("unexpected command {:?}", other),
    };

    h.signaling.inject(SignalingEvent::Ringing {
        call_id: call_id.clone(),
    });
    h.next_event(|e| matches!(e, ClientEvent::CallRinging { .. }))
        .await;
    h.signaling.inject(SignalingEvent::Accepted {
        call_id: call_id.clone(),
        correlation_id: Some("CA100".to_string()),
    });
    h.next_event(|e| matches!(e, ClientEvent::CallConnected { .. }))
        .await;
    h.signaling.inject(SignalingEvent::Disconnected { call_id });
    let ended = h
        .next_event(|e| matches!(e, ClientEvent::CallEnded { .. }))
        .await;
    assert_eq!(
        ended,
        ClientEvent::CallEnded {
            remote_address: "+15551234567".to_string(),
            reason: EndReason::Disconnected,
        }
    );
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_dial_before_ready_is_rejected() {
    let mut tokens = MockTokenSupplier::new();
    tokens
        .expect_fetch_token()
        .returning(|| Err(PhoneError::Token("503 Service Unavailable".to_string())));
    let mut h = start(
        test_config(60, 0),
        tokens,
        MockCallControl::new(),
        FakeSignaling::new(true),
        Arc::new(HeadlessMedia::new()),
    );
    h.next_event(|e| {
        matches!(e, ClientEvent::Log { message } if message.starts_with("Could not get a token"))
    })
    .await;

    h.handle
        .send(Command::Dial {
            number: "+15551234567".to_string(),
        })
        .unwrap();
    let event = h
        .next_event(|e| matches!(e, ClientEvent::Error { .. }))
        .await;
    assert_eq!(event, ClientEvent::error(PhoneError::NotReady.to_string()));
    assert_eq!(h.signaling.count("connect"), 0);
    assert_eq!(h.signaling.count("register"), 0);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_token_expiry_keeps_active_call() {
    let mut h = start_default(FakeSignaling::new(true), MockCallControl::new());
    h.ready().await;
    h.incoming_connected("c1", "CA1").await;

    h.signaling.inject(SignalingEvent::TokenWillExpire);
    match h.signaling.wait_for("updateToken", 1).await {
        SignalingCommand::UpdateToken(credential) => assert_eq!(credential.token, "t2"),
        other => panic!("unexpected command {:?}", other),
    }
    assert_eq!(h.signaling.count("register"), 1);

    // call survived the rotation
    h.handle.send(Command::ToggleMute).unwrap();
    h.next_event(|e| matches!(e, ClientEvent::MuteStateChanged { muted: true }))
        .await;
    assert_eq!(
        h.signaling.wait_for("mute", 1).await,
        SignalingCommand::SetMuted {
            call_id: "c1".to_string(),
            muted: true
        }
    );

    h.handle.send(Command::HangUp).unwrap();
    let ended = h
        .next_event(|e| matches!(e, ClientEvent::CallEnded { .. }))
        .await;
    assert!(matches!(
        ended,
        ClientEvent::CallEnded {
            reason: EndReason::Hangup,
            ..
        }
    ));
    assert!(h.signaling.commands().contains(&SignalingCommand::Disconnect {
        call_id: "c1".to_string()
    }));
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_transfer_failure_keeps_call() {
    let mut control = MockCallControl::new();
    control
        .expect_transfer()
        .withf(|sid, target| sid == "CA1" && target == "agent9")
        .times(1)
        .returning(|_, _| Err(PhoneError::Rejected("no such agent".to_string())));
    let mut h = start_default(FakeSignaling::new(true), control);
    h.ready().await;
    h.incoming_connected("c1", "CA1").await;

    h.handle
        .send(Command::TransferTo {
            agent: "agent9".to_string(),
        })
        .unwrap();
    let result = h
        .next_event(|e| matches!(e, ClientEvent::TransferResult { .. }))
        .await;
    assert_eq!(
        result,
        ClientEvent::TransferResult {
            success: false,
            detail: "no such agent".to_string()
        }
    );
    assert_eq!(h.signaling.count("disconnect"), 0);

    // still connected: hang up works
    h.handle.send(Command::HangUp).unwrap();
    h.next_event(|e| matches!(e, ClientEvent::CallEnded { .. }))
        .await;
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_backend_mute_without_local_capability() {
    let mut control = MockCallControl::new();
    control
        .expect_set_mute()
        .withf(|sid, muted| sid == "CA1" && *muted)
        .times(1)
        .returning(|_, _| Ok(Some("Call CA1 muted".to_string())));
    control
        .expect_set_mute()
        .withf(|_, muted| !*muted)
        .times(1)
        .returning(|_, _| Err(PhoneError::Backend("500 Internal Server Error".to_string())));
    let mut h = start_default(FakeSignaling::new(false), control);
    h.ready().await;
    h.incoming_connected("c1", "CA1").await;

    h.handle.send(Command::SetMute { muted: true }).unwrap();
    h.next_event(|e| matches!(e, ClientEvent::Log { message } if message == "Call muted successfully"))
        .await;

    h.handle.send(Command::SetMute { muted: false }).unwrap();
    h.next_event(|e| matches!(e, ClientEvent::MuteStateChanged { muted: false }))
        .await;
    // failed unmute reverts the indicator
    h.next_event(|e| matches!(e, ClientEvent::MuteStateChanged { muted: true }))
        .await;
    assert_eq!(h.signaling.count("mute"), 0);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_ring_group_cycle() {
    let mut control = MockCallControl::new();
    control
        .expect_transfer()
        .withf(|sid, target| sid == "CA1" && target == "agent2")
        .times(1)
        .returning(|_, _| Ok(None));
    let mut h = start_default(FakeSignaling::new(true), control);
    h.ready().await;
    h.incoming_connected("c1", "CA1").await;

    h.handle.send(Command::CycleRingGroup).unwrap();
    h.next_event(|e| matches!(e, ClientEvent::TransferResult { success: true, .. }))
        .await;
    let ended = h
        .next_event(|e| matches!(e, ClientEvent::CallEnded { .. }))
        .await;
    assert!(matches!(
        ended,
        ClientEvent::CallEnded {
            reason: EndReason::Transferred,
            ..
        }
    ));
    h.signaling.wait_for("disconnect", 1).await;
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_unanswered_call_goes_to_backup_agent() {
    let mut control = MockCallControl::new();
    control
        .expect_transfer()
        .withf(|sid, target| sid == "CA7" && target == "agent8")
        .times(1)
        .returning(|_, _| Ok(Some("Call transferred successfully".to_string())));
    let mut h = start(
        test_config(5, 1),
        working_tokens(),
        control,
        FakeSignaling::new(true),
        Arc::new(HeadlessMedia::new()),
    );
    h.ready().await;
    h.signaling.inject(SignalingEvent::Incoming(Invite {
        call_id: "c7".to_string(),
        from: "+15550000007".to_string(),
        correlation_id: Some("CA7".to_string()),
    }));
    h.next_event(|e| matches!(e, ClientEvent::CallIncoming { .. }))
        .await;
    let ended = h
        .next_event(|e| matches!(e, ClientEvent::CallEnded { .. }))
        .await;
    assert!(matches!(
        ended,
        ClientEvent::CallEnded {
            reason: EndReason::Transferred,
            ..
        }
    ));
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_transport_fault_reregisters() {
    let mut h = start(
        test_config(0, 0),
        working_tokens(),
        MockCallControl::new(),
        FakeSignaling::new(true),
        Arc::new(HeadlessMedia::new()),
    );
    h.ready().await;
    h.signaling
        .inject(SignalingEvent::Error(SignalingError::transport()));
    h.next_event(|e| {
        matches!(
            e,
            ClientEvent::DeviceStateChanged {
                state: DeviceState::Error
            }
        )
    })
    .await;
    h.ready().await;
    match h.signaling.wait_for("register", 2).await {
        SignalingCommand::Register(credential) => assert_eq!(credential.token, "t2"),
        other => panic!("unexpected command {:?}", other),
    }
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_credential_fault_reregisters() {
    let mut h = start_default(FakeSignaling::new(true), MockCallControl::new());
    h.ready().await;
    h.signaling.inject(SignalingEvent::Error(SignalingError::new(
        20104,
        "Access Token expired",
    )));
    h.next_event(|e| {
        matches!(
            e,
            ClientEvent::DeviceStateChanged {
                state: DeviceState::Error
            }
        )
    })
    .await;
    h.ready().await;
    match h.signaling.wait_for("register", 2).await {
        SignalingCommand::Register(credential) => assert_eq!(credential.token, "t2"),
        other => panic!("unexpected command {:?}", other),
    }
    assert_eq!(h.signaling.count("updateToken"), 0);

    h.handle
        .send(Command::Dial {
            number: "+15551234567".to_string(),
        })
        .unwrap();
    match h.signaling.wait_for("connect", 1).await {
        SignalingCommand::Connect { to, .. } => assert_eq!(to, "+15551234567"),
        other => panic!("unexpected command {:?}", other),
    }
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_credential_fault_skips_pending_backoff() {
    let mut h = start(
        test_config(30, 0),
        working_tokens(),
        MockCallControl::new(),
        FakeSignaling::new(true),
        Arc::new(HeadlessMedia::new()),
    );
    h.ready().await;
    h.signaling
        .inject(SignalingEvent::Error(SignalingError::transport()));
    h.next_event(|e| matches!(e, ClientEvent::Log { message } if message.contains("Retrying in 30")))
        .await;
    h.signaling.inject(SignalingEvent::Error(SignalingError::new(
        20104,
        "Access Token expired",
    )));
    h.ready().await;
    assert_eq!(h.signaling.count("register"), 2);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_slow_registration_keeps_commands_flowing() {
    let mut h = start_default(
        FakeSignaling::with_register_delay(Duration::from_secs(10)),
        MockCallControl::new(),
    );
    h.signaling.wait_for("register", 1).await;
    h.handle
        .send(Command::Dial {
            number: "+15551234567".to_string(),
        })
        .unwrap();
    let event = h
        .next_event(|e| matches!(e, ClientEvent::Error { .. }))
        .await;
    assert_eq!(
        event,
        ClientEvent::Error {
            message: "device not ready".to_string()
        }
    );
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_busy_rejects_second_invite() {
    let mut h = start_default(FakeSignaling::new(true), MockCallControl::new());
    h.ready().await;
    h.incoming_connected("c1", "CA1").await;
    h.signaling.inject(SignalingEvent::Incoming(Invite {
        call_id: "c2".to_string(),
        from: "+15550000002".to_string(),
        correlation_id: None,
    }));
    assert_eq!(
        h.signaling.wait_for("reject", 1).await,
        SignalingCommand::Reject {
            call_id: "c2".to_string()
        }
    );
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_denied_microphone_is_fatal() {
    let mut tokens = MockTokenSupplier::new();
    tokens.expect_fetch_token().times(0);
    let mut h = start(
        test_config(5, 0),
        tokens,
        MockCallControl::new(),
        FakeSignaling::new(true),
        Arc::new(HeadlessMedia::denied()),
    );
    h.next_event(|e| matches!(e, ClientEvent::Error { .. }))
        .await;
    let result = timeout(Duration::from_secs(3), &mut h.task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(PhoneError::Media(_))));
    assert!(h.signaling.commands().is_empty());
}

#[tokio::test]
async fn test_stop_hangs_up_and_unregisters() {
    let mut h = start_default(FakeSignaling::new(true), MockCallControl::new());
    h.ready().await;
    h.incoming_connected("c1", "CA1").await;
    let signaling = h.signaling.clone();
    h.stop().await.unwrap();
    let commands = signaling.commands();
    assert!(commands.contains(&SignalingCommand::Disconnect {
        call_id: "c1".to_string()
    }));
    assert_eq!(commands.last(), Some(&SignalingCommand::Unregister));
}

#[tokio::test]
async fn test_user_interaction_resumes_playback() {
    let mut h = start_default(FakeSignaling::new(true), MockCallControl::new());
    h.ready().await;
    h.handle.send(Command::UserInteraction).unwrap();
    h.next_event(|e| matches!(e, ClientEvent::Log { message } if message == "Audio context resumed"))
        .await;
    h.stop().await.unwrap();
}
