//! Session transport: the realtime channel to the hosted voice service.
//!
//! The contract is small: open a configured session, fire frames at it,
//! receive an event stream, close. The production implementation speaks
//! JSON envelopes over a websocket; tests substitute scripted transports
//! through the same traits.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, tungstenite};
use url::Url;
use uuid::Uuid;

use crate::config::Config;

/// Response modality requested at session setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

/// Session parameters sent in the setup message.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub response_modality: Modality,
    pub transcribe_input: bool,
    pub transcribe_output: bool,
    pub persona: String,
}

/// One outbound capture frame, transport-encoded.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub data: String,
    pub mime_type: String,
}

/// Server → client envelope. A single message may carry any combination of
/// these fields; absent fields mean "nothing of that kind this message".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerMessage {
    pub setup_complete: Option<bool>,
    pub audio: Option<String>,
    pub input_transcript: Option<String>,
    pub output_transcript: Option<String>,
    pub interrupted: Option<bool>,
    pub turn_complete: Option<bool>,
}

/// Inbound events the session consumes, one at a time.
#[derive(Debug)]
pub enum TransportEvent {
    Message(ServerMessage),
    Closed,
    Error(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server url: {0}")]
    Url(#[from] url::ParseError),
    #[error("malformed request: {0}")]
    Request(#[from] tungstenite::http::Error),
    #[error("websocket failure: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection closed during setup")]
    SetupClosed,
}

/// Handle to an open session. Frames are fire-and-forget; `close` is
/// idempotent.
#[async_trait]
pub trait SessionTransport: Send {
    async fn send_frame(&mut self, frame: OutboundFrame);
    async fn close(&mut self);
}

/// Opens transports. Resolves once the remote side is ready to receive
/// audio; the paired receiver carries the inbound event stream.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        config: SessionConfig,
    ) -> Result<(Box<dyn SessionTransport>, mpsc::Receiver<TransportEvent>), TransportError>;
}

// ======================== Websocket implementation ========================

#[derive(Serialize)]
struct SetupMessage<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    config: &'a SessionConfig,
}

#[derive(Serialize)]
struct AudioMessage {
    #[serde(rename = "type")]
    msg_type: &'static str,
    #[serde(flatten)]
    frame: OutboundFrame,
}

enum WsCommand {
    Send(String),
    Close,
}

pub struct WsConnector {
    url: String,
    token: String,
    client_id: String,
}

impl WsConnector {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.server_url.clone(),
            token: config.api_token.clone(),
            client_id: Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(
        &self,
        config: SessionConfig,
    ) -> Result<(Box<dyn SessionTransport>, mpsc::Receiver<TransportEvent>), TransportError> {
        let url = Url::parse(&self.url)?;
        let host = url.host_str().unwrap_or_default().to_string();

        let mut request = tungstenite::http::Request::builder()
            .method("GET")
            .uri(self.url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Client-Id", &self.client_id)
            .header("Protocol-Version", "1");
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.token));
        }
        let request = request.body(())?;

        tracing::info!(url = %self.url, "connecting to voice service");
        let (ws_stream, _) = connect_async(request).await?;
        let (mut write, mut read) = ws_stream.split();

        let setup = SetupMessage {
            msg_type: "setup",
            config: &config,
        };
        write
            .send(Message::Text(serde_json::to_string(&setup)?.into()))
            .await?;

        // The session is open only once the remote side acknowledges setup.
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(msg) = serde_json::from_str::<ServerMessage>(&text) {
                        if msg.setup_complete == Some(true) {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::SetupClosed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
        tracing::info!("session setup acknowledged");

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(100);
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(100);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerMessage>(&text) {
                                    Ok(parsed) => {
                                        if event_tx.send(TransportEvent::Message(parsed)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::debug!(error = %e, "skipping unparseable server message");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                tracing::info!(?frame, "server closed session");
                                let _ = event_tx.send(TransportEvent::Closed).await;
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                                break;
                            }
                            None => {
                                let _ = event_tx.send(TransportEvent::Closed).await;
                                break;
                            }
                        }
                    }
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(WsCommand::Send(text)) => {
                                if let Err(e) = write.send(Message::Text(text.into())).await {
                                    let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                                    break;
                                }
                            }
                            // Handle dropped without close: same cleanup.
                            Some(WsCommand::Close) | None => {
                                let _ = write.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
            tracing::debug!("transport task exited");
        });

        let transport = WsTransport { cmd: Some(cmd_tx) };
        Ok((Box::new(transport), event_rx))
    }
}

pub struct WsTransport {
    cmd: Option<mpsc::Sender<WsCommand>>,
}

#[async_trait]
impl SessionTransport for WsTransport {
    async fn send_frame(&mut self, frame: OutboundFrame) {
        let Some(cmd) = self.cmd.as_ref() else { return };
        let message = AudioMessage {
            msg_type: "audio",
            frame,
        };
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode outbound frame");
                return;
            }
        };
        // Fire-and-forget; a frame racing teardown is dropped.
        if cmd.send(WsCommand::Send(text)).await.is_err() {
            tracing::debug!("transport gone, dropping outbound frame");
        }
    }

    async fn close(&mut self) {
        if let Some(cmd) = self.cmd.take() {
            let _ = cmd.send(WsCommand::Close).await;
        }
    }
}
