use super::{
    CallId, Invite, SignalingClient, SignalingCommand, SignalingError, SignalingEvent,
    SignalingEventReceiver, SignalingEventSender, TRANSPORT_ERROR_CODE,
};
use crate::token::Credential;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::select;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Options sent along with every `register` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterOptions {
    pub codec_preferences: Vec<String>,
    pub enable_ringing_state: bool,
    #[serde(rename = "fakeLocalDTMF")]
    pub fake_local_dtmf: bool,
    pub debug: bool,
    pub device_info: DeviceInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub sdk_version: String,
    pub platform: String,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            codec_preferences: vec!["opus".to_string(), "pcmu".to_string()],
            enable_ringing_state: true,
            fake_local_dtmf: true,
            debug: false,
            device_info: DeviceInfo {
                sdk_version: format!("rs-{}", env!("CARGO_PKG_VERSION")),
                platform: std::env::consts::OS.to_string(),
            },
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Outbound<'a> {
    Register {
        token: &'a str,
        options: &'a RegisterOptions,
    },
    UpdateToken {
        token: &'a str,
    },
    #[serde(rename_all = "camelCase")]
    Connect {
        call_id: &'a str,
        params: ConnectParams<'a>,
    },
    #[serde(rename_all = "camelCase")]
    Accept { call_id: &'a str },
    #[serde(rename_all = "camelCase")]
    Reject { call_id: &'a str },
    #[serde(rename_all = "camelCase")]
    Disconnect { call_id: &'a str },
    DisconnectAll,
    #[serde(rename_all = "camelCase")]
    Mute { call_id: &'a str, muted: bool },
    #[serde(rename_all = "camelCase")]
    SetOutputDevice { device_id: &'a str },
    Unregister,
}

#[derive(Serialize)]
struct ConnectParams<'a> {
    #[serde(rename = "To")]
    to: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Inbound {
    Registered,
    Unregistered,
    Error {
        #[serde(default)]
        code: u32,
        #[serde(default)]
        message: String,
    },
    TokenWillExpire,
    TokenExpired,
    #[serde(rename_all = "camelCase")]
    Incoming {
        call_id: CallId,
        #[serde(default)]
        parameters: CallParameters,
    },
    #[serde(rename_all = "camelCase")]
    Ringing { call_id: CallId },
    #[serde(rename_all = "camelCase")]
    Accept {
        call_id: CallId,
        #[serde(default)]
        parameters: CallParameters,
    },
    #[serde(rename_all = "camelCase")]
    Disconnect { call_id: CallId },
    #[serde(rename_all = "camelCase")]
    CallError {
        call_id: CallId,
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct CallParameters {
    #[serde(rename = "From")]
    from: Option<String>,
    #[serde(rename = "CallSid")]
    call_sid: Option<String>,
}

impl From<Inbound> for SignalingEvent {
    fn from(inbound: Inbound) -> Self {
        match inbound {
            Inbound::Registered => SignalingEvent::Registered,
            Inbound::Unregistered => SignalingEvent::Unregistered,
            Inbound::Error { code, message } => {
                SignalingEvent::Error(SignalingError::new(code, message))
            }
            Inbound::TokenWillExpire => SignalingEvent::TokenWillExpire,
            Inbound::TokenExpired => SignalingEvent::TokenExpired,
            Inbound::Incoming {
                call_id,
                parameters,
            } => SignalingEvent::Incoming(Invite {
                call_id,
                from: parameters.from.unwrap_or_else(|| "Unknown".to_string()),
                correlation_id: parameters.call_sid,
            }),
            Inbound::Ringing { call_id } => SignalingEvent::Ringing { call_id },
            Inbound::Accept {
                call_id,
                parameters,
            } => SignalingEvent::Accepted {
                call_id,
                correlation_id: parameters.call_sid,
            },
            Inbound::Disconnect { call_id } => SignalingEvent::Disconnected { call_id },
            Inbound::CallError { call_id, message } => {
                SignalingEvent::CallError { call_id, message }
            }
        }
    }
}

struct Connection {
    sender: mpsc::UnboundedSender<Message>,
    token: CancellationToken,
}

/// Signaling over a single WebSocket. A `Register` opens the socket and a
/// later `Register` replaces it; `UpdateToken` reuses it.
pub struct WsSignalingClient {
    url: String,
    options: RegisterOptions,
    connect_timeout: Duration,
    events: SignalingEventSender,
    connection: Mutex<Option<Connection>>,
}

impl WsSignalingClient {
    pub fn new(url: String, options: RegisterOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            url,
            options,
            connect_timeout: Duration::from_secs(10),
            events,
            connection: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// The connection lock is not held while the handshake runs, so other
    /// commands fail fast instead of queueing behind it.
    async fn open(&self, credential: &Credential) -> Result<(), SignalingError> {
        if let Some(old) = self.connection.lock().await.take() {
            info!(url = self.url, "replacing existing signaling connection");
            old.token.cancel();
        }

        let ws_stream = match timeout(self.connect_timeout, connect_async(self.url.as_str())).await
        {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                warn!(url = self.url, "failed to connect signaling: {}", e);
                return Err(SignalingError::transport());
            }
            Err(_) => {
                warn!(
                    url = self.url,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "signaling connect timed out"
                );
                return Err(SignalingError::transport());
            }
        };
        info!(url = self.url, "signaling connected");

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let token = CancellationToken::new();
        let conn_token = token.clone();
        let events = self.events.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            let (mut write, mut read) = ws_stream.split();
            let dropped = loop {
                select! {
                    biased;
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = write.send(msg).await {
                                warn!(url, "failed to send signaling frame: {}", e);
                                break true;
                            }
                        }
                        None => break false,
                    },
                    _ = conn_token.cancelled() => break false,
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => dispatch(&events, text.as_str()),
                        Some(Ok(Message::Close(_))) | None => break true,
                        Some(Err(e)) => {
                            warn!(url, "signaling socket error: {}", e);
                            break true;
                        }
                        Some(Ok(_)) => {}
                    },
                }
            };
            write.send(Message::Close(None)).await.ok();
            if dropped && !conn_token.is_cancelled() {
                events
                    .send(SignalingEvent::Error(SignalingError::transport()))
                    .ok();
            }
            debug!(url, dropped, "signaling connection closed");
        });

        let frame = Outbound::Register {
            token: &credential.token,
            options: &self.options,
        };
        send_frame(&tx, &frame)?;
        let mut connection = self.connection.lock().await;
        if let Some(raced) = connection.replace(Connection { sender: tx, token }) {
            raced.token.cancel();
        }
        Ok(())
    }

    async fn send(&self, frame: &Outbound<'_>) -> Result<(), SignalingError> {
        let connection = self.connection.lock().await;
        match connection.as_ref() {
            Some(conn) => send_frame(&conn.sender, frame),
            None => Err(SignalingError::new(TRANSPORT_ERROR_CODE, "not connected")),
        }
    }

    async fn close(&self) -> Result<(), SignalingError> {
        let conn = match self.connection.lock().await.take() {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let result = send_frame(&conn.sender, &Outbound::Unregister);
        conn.token.cancel();
        result
    }
}

fn send_frame(
    sender: &mpsc::UnboundedSender<Message>,
    frame: &Outbound<'_>,
) -> Result<(), SignalingError> {
    let text = serde_json::to_string(frame)
        .map_err(|e| SignalingError::new(0, format!("failed to encode frame: {}", e)))?;
    sender
        .send(Message::Text(text.into()))
        .map_err(|_| SignalingError::new(TRANSPORT_ERROR_CODE, "connection closed"))
}

fn dispatch(events: &SignalingEventSender, text: &str) {
    match serde_json::from_str::<Inbound>(text) {
        Ok(inbound) => {
            debug!(?inbound, "signaling event");
            events.send(inbound.into()).ok();
        }
        Err(e) => {
            warn!("ignoring signaling frame: {} {}", e, text);
        }
    }
}

#[async_trait]
impl SignalingClient for WsSignalingClient {
    fn subscribe(&self) -> SignalingEventReceiver {
        self.events.subscribe()
    }

    async fn execute(&self, command: SignalingCommand) -> Result<(), SignalingError> {
        match &command {
            SignalingCommand::Register(credential) => self.open(credential).await,
            SignalingCommand::UpdateToken(credential) => {
                self.send(&Outbound::UpdateToken {
                    token: &credential.token,
                })
                .await
            }
            SignalingCommand::Connect { call_id, to } => {
                self.send(&Outbound::Connect {
                    call_id,
                    params: ConnectParams { to },
                })
                .await
            }
            SignalingCommand::Accept { call_id } => self.send(&Outbound::Accept { call_id }).await,
            SignalingCommand::Reject { call_id } => self.send(&Outbound::Reject { call_id }).await,
            SignalingCommand::Disconnect { call_id } => {
                self.send(&Outbound::Disconnect { call_id }).await
            }
            SignalingCommand::DisconnectAll => self.send(&Outbound::DisconnectAll).await,
            SignalingCommand::SetMuted { call_id, muted } => {
                self.send(&Outbound::Mute {
                    call_id,
                    muted: *muted,
                })
                .await
            }
            SignalingCommand::SetOutputDevice(device_id) => {
                self.send(&Outbound::SetOutputDevice { device_id }).await
            }
            SignalingCommand::Unregister => self.close().await,
        }
    }
}
