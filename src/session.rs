//! The live session state machine.
//!
//! One `LiveSession` is one voice conversation: it owns the transport
//! handle, the capture source, the playback scheduler, and the transcript
//! state, and consumes explicit events (`handle_transport_event`,
//! `handle_capture_frame`, `poll_playback`). All transitions run to
//! completion on one task; the only other threads are the audio workers
//! behind the capture/sink seams, which never touch session state.

use std::fmt;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::audio::capture::{CaptureError, CaptureFrame, CaptureSource};
use crate::audio::codec;
use crate::audio::playback::{PlaybackScheduler, SinkError, SinkFactory};
use crate::config::Config;
use crate::transport::{
    Connector, Modality, OutboundFrame, SessionConfig, SessionTransport, TransportEvent,
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Listening,
    Speaking,
    /// Reserved for latency display; no transition enters it yet.
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One completed utterance. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("microphone access failed: {0}")]
    Microphone(#[source] CaptureError),
    #[error("audio output failed: {0}")]
    Output(#[source] SinkError),
    #[error("session start failed: {0}")]
    Start(#[source] crate::transport::TransportError),
}

/// Receivers the caller's event loop multiplexes. Returned by `start()`;
/// both close when the session tears down.
#[derive(Debug)]
pub struct SessionStreams {
    pub transport: mpsc::Receiver<TransportEvent>,
    pub frames: mpsc::Receiver<CaptureFrame>,
}

pub struct LiveSession {
    config: Config,
    connector: Box<dyn Connector>,
    capture: Box<dyn CaptureSource>,
    outputs: Box<dyn SinkFactory>,

    status: SessionStatus,
    transport: Option<Box<dyn SessionTransport>>,
    scheduler: Option<PlaybackScheduler>,
    turns: Vec<Turn>,
    input_buffer: String,
    output_buffer: String,
    last_error: Option<String>,
}

impl LiveSession {
    pub fn new(
        config: Config,
        connector: Box<dyn Connector>,
        capture: Box<dyn CaptureSource>,
        outputs: Box<dyn SinkFactory>,
    ) -> Self {
        Self {
            config,
            connector,
            capture,
            outputs,
            status: SessionStatus::Idle,
            transport: None,
            scheduler: None,
            turns: Vec::new(),
            input_buffer: String::new(),
            output_buffer: String::new(),
            last_error: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// In-progress user transcript, live before turn completion.
    pub fn input_transcript(&self) -> &str {
        &self.input_buffer
    }

    /// In-progress assistant transcript.
    pub fn output_transcript(&self) -> &str {
        &self.output_buffer
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Open the session: output device, transport, then microphone, in
    /// that order. Any failure releases whatever was already acquired and
    /// leaves the session idle.
    pub async fn start(&mut self) -> Result<SessionStreams, SessionError> {
        if self.transport.is_some() {
            self.stop().await;
        }
        self.turns.clear();
        self.input_buffer.clear();
        self.output_buffer.clear();

        let sink = match self.outputs.open_sink() {
            Ok(sink) => sink,
            Err(e) => {
                let error = SessionError::Output(e);
                self.last_error = Some(error.to_string());
                return Err(error);
            }
        };

        let session_config = SessionConfig {
            response_modality: Modality::Audio,
            transcribe_input: true,
            transcribe_output: true,
            persona: self.config.persona.clone(),
        };
        let (transport, transport_rx) = match self.connector.open(session_config).await {
            Ok(open) => open,
            Err(e) => {
                let mut sink = sink;
                sink.close();
                let error = SessionError::Start(e);
                self.last_error = Some(error.to_string());
                return Err(error);
            }
        };
        self.transport = Some(transport);

        // Capture only begins once the transport confirmed it is open.
        let (frame_tx, frame_rx) = mpsc::channel::<CaptureFrame>(100);
        if let Err(e) = self.capture.start(frame_tx) {
            if let Some(mut transport) = self.transport.take() {
                transport.close().await;
            }
            let mut sink = sink;
            sink.close();
            let error = SessionError::Microphone(e);
            self.last_error = Some(error.to_string());
            return Err(error);
        }

        self.scheduler = Some(PlaybackScheduler::new(sink));
        self.status = SessionStatus::Listening;
        self.last_error = None;
        tracing::info!("live session started");

        Ok(SessionStreams {
            transport: transport_rx,
            frames: frame_rx,
        })
    }

    /// Tear everything down and return to idle. Idempotent; safe from any
    /// state, including mid-transition.
    pub async fn stop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.capture.stop();
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.teardown();
        }
        if self.status != SessionStatus::Idle {
            tracing::info!("live session stopped");
        }
        self.status = SessionStatus::Idle;
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        // A message racing teardown is discarded.
        if self.transport.is_none() {
            return;
        }
        match event {
            TransportEvent::Message(message) => self.process_server_message(message),
            TransportEvent::Closed => {
                self.stop().await;
            }
            TransportEvent::Error(message) => {
                tracing::warn!(error = %message, "session transport failed");
                self.last_error = Some(message);
                self.stop().await;
            }
        }
    }

    fn process_server_message(&mut self, message: crate::transport::ServerMessage) {
        if let Some(payload) = message.audio {
            match codec::decode(&payload) {
                Ok(bytes) => {
                    let segment =
                        codec::decode_pcm16(&bytes, self.config.output_sample_rate, 1);
                    if let Some(scheduler) = self.scheduler.as_mut() {
                        if scheduler.schedule(&segment).is_some() {
                            self.status = SessionStatus::Speaking;
                        }
                    }
                }
                // A corrupt segment never ends an otherwise healthy session.
                Err(e) => tracing::warn!(error = %e, "dropping malformed audio segment"),
            }
        }

        if let Some(delta) = message.input_transcript {
            self.input_buffer.push_str(&delta);
        }
        if let Some(delta) = message.output_transcript {
            self.output_buffer.push_str(&delta);
        }

        if message.interrupted == Some(true) {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.interrupt();
            }
            self.status = SessionStatus::Listening;
        }

        if message.turn_complete == Some(true) {
            // Both roles are appended even when empty, so transcripts
            // reproduce exactly.
            let user_text = std::mem::take(&mut self.input_buffer);
            let assistant_text = std::mem::take(&mut self.output_buffer);
            tracing::info!(user = %user_text, assistant = %assistant_text, "turn complete");
            self.turns.push(Turn {
                role: Role::User,
                text: user_text,
            });
            self.turns.push(Turn {
                role: Role::Assistant,
                text: assistant_text,
            });
        }
    }

    /// Forward one capture frame. Frames produced while no transport is
    /// open are dropped, never queued.
    pub async fn handle_capture_frame(&mut self, frame: CaptureFrame) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let frame = OutboundFrame {
            data: codec::encode(&frame),
            mime_type: format!("audio/pcm;rate={}", self.config.input_sample_rate),
        };
        transport.send_frame(frame).await;
    }

    /// Earliest playback completion, for the event loop to sleep on.
    pub fn playback_deadline(&self) -> Option<Instant> {
        self.scheduler.as_ref()?.next_deadline()
    }

    /// Retire finished playback segments; a drained active set flips
    /// speaking back to listening.
    pub fn poll_playback(&mut self, now: Instant) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        if scheduler.complete_due(now) && self.status == SessionStatus::Speaking {
            self.status = SessionStatus::Listening;
            tracing::debug!("playback drained");
        }
    }
}

/// Multiplex one session's event sources until it returns to idle.
///
/// The select keeps every transition on this task; the branches are
/// disabled once their stream closes so teardown does not spin.
pub async fn run_session(session: &mut LiveSession, mut streams: SessionStreams) {
    let mut transport_open = true;
    let mut frames_open = true;

    while transport_open || !matches!(session.status(), SessionStatus::Idle) {
        let deadline = session.playback_deadline();
        tokio::select! {
            event = streams.transport.recv(), if transport_open => {
                match event {
                    Some(event) => {
                        session.handle_transport_event(event).await;
                        if session.status() == SessionStatus::Idle {
                            break;
                        }
                    }
                    None => {
                        transport_open = false;
                        break;
                    }
                }
            }
            frame = streams.frames.recv(), if frames_open => {
                match frame {
                    Some(frame) => session.handle_capture_frame(frame).await,
                    None => frames_open = false,
                }
            }
            _ = sleep_until_deadline(deadline) => {
                session.poll_playback(Instant::now());
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
