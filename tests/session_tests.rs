//! Session state machine tests over scripted transport, capture, and sink
//! seams; no hardware or network involved.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use livevoice::audio::capture::{CaptureError, CaptureFrame, CaptureSource};
use livevoice::audio::codec;
use livevoice::audio::playback::{OutputSink, SinkError, SinkFactory};
use livevoice::config::Config;
use livevoice::session::{LiveSession, Role, SessionStatus, run_session};
use livevoice::transport::{
    Connector, OutboundFrame, ServerMessage, SessionConfig, SessionTransport, TransportError,
    TransportEvent,
};

// ======================== Mock seams ========================

#[derive(Default)]
struct SinkLog {
    writes: Vec<usize>,
    cancels: usize,
    closes: usize,
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<SinkLog>>);

impl OutputSink for RecordingSink {
    fn write(&mut self, segment: &livevoice::audio::AudioBuffer) {
        self.0.lock().unwrap().writes.push(segment.frames());
    }
    fn cancel(&mut self) {
        self.0.lock().unwrap().cancels += 1;
    }
    fn close(&mut self) {
        self.0.lock().unwrap().closes += 1;
    }
}

struct RecordingOutput {
    log: Arc<Mutex<SinkLog>>,
}

impl SinkFactory for RecordingOutput {
    fn open_sink(&self) -> Result<Box<dyn OutputSink>, SinkError> {
        Ok(Box::new(RecordingSink(self.log.clone())))
    }
}

#[derive(Clone, Default)]
struct MockCapture {
    frames: Arc<Mutex<Option<mpsc::Sender<CaptureFrame>>>>,
    starts: Arc<Mutex<u32>>,
    stops: Arc<Mutex<u32>>,
}

impl CaptureSource for MockCapture {
    fn start(&mut self, frames: mpsc::Sender<CaptureFrame>) -> Result<(), CaptureError> {
        *self.frames.lock().unwrap() = Some(frames);
        *self.starts.lock().unwrap() += 1;
        Ok(())
    }
    fn stop(&mut self) {
        *self.frames.lock().unwrap() = None;
        *self.stops.lock().unwrap() += 1;
    }
}

struct FailingCapture;

impl CaptureSource for FailingCapture {
    fn start(&mut self, _frames: mpsc::Sender<CaptureFrame>) -> Result<(), CaptureError> {
        Err(CaptureError::Device(anyhow::anyhow!("permission denied")))
    }
    fn stop(&mut self) {}
}

struct MockTransport {
    sent: Arc<Mutex<Vec<OutboundFrame>>>,
    closed: Arc<Mutex<bool>>,
}

#[async_trait]
impl SessionTransport for MockTransport {
    async fn send_frame(&mut self, frame: OutboundFrame) {
        if !*self.closed.lock().unwrap() {
            self.sent.lock().unwrap().push(frame);
        }
    }
    async fn close(&mut self) {
        *self.closed.lock().unwrap() = true;
    }
}

#[derive(Clone)]
struct ScriptedConnector {
    event_tx: Arc<Mutex<Option<mpsc::Sender<TransportEvent>>>>,
    sent: Arc<Mutex<Vec<OutboundFrame>>>,
    closed: Arc<Mutex<bool>>,
    personas: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl ScriptedConnector {
    fn new(fail: bool) -> Self {
        Self {
            event_tx: Arc::default(),
            sent: Arc::default(),
            closed: Arc::default(),
            personas: Arc::default(),
            fail,
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(
        &self,
        config: SessionConfig,
    ) -> Result<(Box<dyn SessionTransport>, mpsc::Receiver<TransportEvent>), TransportError> {
        if self.fail {
            return Err(TransportError::SetupClosed);
        }
        self.personas.lock().unwrap().push(config.persona);
        let (tx, rx) = mpsc::channel(100);
        *self.event_tx.lock().unwrap() = Some(tx);
        *self.closed.lock().unwrap() = false;
        let transport = MockTransport {
            sent: self.sent.clone(),
            closed: self.closed.clone(),
        };
        Ok((Box::new(transport), rx))
    }
}

// ======================== Harness ========================

struct Harness {
    session: LiveSession,
    connector: ScriptedConnector,
    capture: MockCapture,
    sink_log: Arc<Mutex<SinkLog>>,
}

fn harness() -> Harness {
    harness_with(ScriptedConnector::new(false))
}

fn harness_with(connector: ScriptedConnector) -> Harness {
    let capture = MockCapture::default();
    let sink_log = Arc::new(Mutex::new(SinkLog::default()));
    let session = LiveSession::new(
        Config::default(),
        Box::new(connector.clone()),
        Box::new(capture.clone()),
        Box::new(RecordingOutput {
            log: sink_log.clone(),
        }),
    );
    Harness {
        session,
        connector,
        capture,
        sink_log,
    }
}

fn message(fill: impl FnOnce(&mut ServerMessage)) -> TransportEvent {
    let mut msg = ServerMessage::default();
    fill(&mut msg);
    TransportEvent::Message(msg)
}

/// An inbound audio payload of `secs` seconds of silence at the default
/// 24 kHz output rate.
fn audio_message(secs: f64) -> TransportEvent {
    let bytes = vec![0u8; (secs * 24000.0) as usize * 2];
    message(|m| m.audio = Some(codec::encode(&bytes)))
}

// ======================== Tests ========================

#[tokio::test]
async fn turn_accumulation_builds_one_pair() {
    let mut h = harness();
    let _streams = h.session.start().await.unwrap();

    for delta in ["Hel", "lo ", "there"] {
        h.session
            .handle_transport_event(message(|m| m.input_transcript = Some(delta.into())))
            .await;
    }
    h.session
        .handle_transport_event(message(|m| m.turn_complete = Some(true)))
        .await;

    let turns = h.session.turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].text, "Hello there");
    // The assistant side is appended even when empty.
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].text, "");
    assert_eq!(h.session.input_transcript(), "");
}

#[tokio::test]
async fn stop_is_idempotent() {
    let mut h = harness();
    let _streams = h.session.start().await.unwrap();

    h.session.stop().await;
    assert_eq!(h.session.status(), SessionStatus::Idle);
    h.session.stop().await;
    assert_eq!(h.session.status(), SessionStatus::Idle);

    assert!(*h.connector.closed.lock().unwrap());
    assert_eq!(*h.capture.stops.lock().unwrap(), 1);
    assert_eq!(h.sink_log.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn malformed_audio_is_skipped_without_teardown() {
    let mut h = harness();
    let _streams = h.session.start().await.unwrap();

    h.session
        .handle_transport_event(message(|m| m.audio = Some("not base64!".into())))
        .await;
    assert_eq!(h.session.status(), SessionStatus::Listening);
    assert!(h.sink_log.lock().unwrap().writes.is_empty());

    // The session keeps working afterwards.
    h.session.handle_transport_event(audio_message(0.1)).await;
    assert_eq!(h.session.status(), SessionStatus::Speaking);
    assert_eq!(h.sink_log.lock().unwrap().writes.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn interruption_cancels_playback_and_listens() {
    let mut h = harness();
    let _streams = h.session.start().await.unwrap();

    h.session.handle_transport_event(audio_message(5.0)).await;
    assert_eq!(h.session.status(), SessionStatus::Speaking);

    h.session
        .handle_transport_event(message(|m| m.interrupted = Some(true)))
        .await;
    assert_eq!(h.session.status(), SessionStatus::Listening);
    assert_eq!(h.sink_log.lock().unwrap().cancels, 1);
    assert!(h.session.playback_deadline().is_none());
}

#[tokio::test]
async fn transport_error_surfaces_once_and_tears_down() {
    let mut h = harness();
    let _streams = h.session.start().await.unwrap();

    h.session
        .handle_transport_event(TransportEvent::Error("connection reset".into()))
        .await;
    assert_eq!(h.session.status(), SessionStatus::Idle);
    assert_eq!(h.session.last_error(), Some("connection reset"));
    assert!(*h.connector.closed.lock().unwrap());
    assert_eq!(h.sink_log.lock().unwrap().closes, 1);

    // The message clears on the next successful start.
    let _streams = h.session.start().await.unwrap();
    assert!(h.session.last_error().is_none());
}

#[tokio::test]
async fn late_events_after_stop_are_discarded() {
    let mut h = harness();
    let _streams = h.session.start().await.unwrap();
    h.session.stop().await;

    h.session.handle_transport_event(audio_message(1.0)).await;
    h.session
        .handle_transport_event(message(|m| m.input_transcript = Some("late".into())))
        .await;
    h.session
        .handle_capture_frame(codec::pcm16_bytes(&[1, 2, 3]))
        .await;

    assert_eq!(h.session.status(), SessionStatus::Idle);
    assert_eq!(h.session.input_transcript(), "");
    assert!(h.sink_log.lock().unwrap().writes.is_empty());
    assert!(h.connector.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn frames_forward_in_order_with_transport_encoding() {
    let mut h = harness();

    // Produced before the transport is open: dropped, not queued.
    h.session
        .handle_capture_frame(codec::pcm16_bytes(&[9]))
        .await;
    assert!(h.connector.sent.lock().unwrap().is_empty());

    let _streams = h.session.start().await.unwrap();
    for value in [1i16, 2, 3] {
        h.session
            .handle_capture_frame(codec::pcm16_bytes(&[value]))
            .await;
    }

    let sent = h.connector.sent.lock().unwrap();
    assert_eq!(sent.len(), 3);
    for (i, frame) in sent.iter().enumerate() {
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
        let bytes = codec::decode(&frame.data).unwrap();
        assert_eq!(bytes, codec::pcm16_bytes(&[(i + 1) as i16]));
    }
}

#[tokio::test]
async fn microphone_failure_rolls_back_start() {
    let connector = ScriptedConnector::new(false);
    let sink_log = Arc::new(Mutex::new(SinkLog::default()));
    let mut session = LiveSession::new(
        Config::default(),
        Box::new(connector.clone()),
        Box::new(FailingCapture),
        Box::new(RecordingOutput {
            log: sink_log.clone(),
        }),
    );

    let err = session.start().await.unwrap_err();
    assert!(matches!(
        err,
        livevoice::session::SessionError::Microphone(_)
    ));
    assert_eq!(session.status(), SessionStatus::Idle);
    // Nothing stays acquired: transport closed, sink released.
    assert!(*connector.closed.lock().unwrap());
    assert_eq!(sink_log.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn connect_failure_leaves_session_idle() {
    let mut h = harness_with(ScriptedConnector::new(true));

    let err = h.session.start().await.unwrap_err();
    assert!(matches!(err, livevoice::session::SessionError::Start(_)));
    assert_eq!(h.session.status(), SessionStatus::Idle);
    assert_eq!(h.sink_log.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn setup_carries_configured_persona() {
    let mut h = harness();
    let _streams = h.session.start().await.unwrap();
    let personas = h.connector.personas.lock().unwrap();
    assert_eq!(personas.len(), 1);
    assert!(personas[0].contains("voice assistant"));
}

#[tokio::test(start_paused = true)]
async fn end_to_end_session_flow() {
    let mut h = harness();
    let _streams = h.session.start().await.unwrap();
    assert_eq!(h.session.status(), SessionStatus::Listening);

    // Three outbound frames, sent in capture order.
    for value in [10i16, 20, 30] {
        h.session
            .handle_capture_frame(codec::pcm16_bytes(&[value]))
            .await;
    }
    assert_eq!(h.connector.sent.lock().unwrap().len(), 3);

    // Inbound segment starts playback.
    h.session.handle_transport_event(audio_message(0.5)).await;
    assert_eq!(h.session.status(), SessionStatus::Speaking);

    // Segment finishes, the active set drains, back to listening.
    tokio::time::advance(Duration::from_millis(600)).await;
    h.session.poll_playback(Instant::now());
    assert_eq!(h.session.status(), SessionStatus::Listening);

    // Turn completion appends one pair.
    h.session
        .handle_transport_event(message(|m| m.input_transcript = Some("hi".into())))
        .await;
    h.session
        .handle_transport_event(message(|m| {
            m.output_transcript = Some("hello!".into());
            m.turn_complete = Some(true);
        }))
        .await;
    assert_eq!(h.session.turns().len(), 2);
    assert_eq!(h.session.turns()[0].text, "hi");
    assert_eq!(h.session.turns()[1].text, "hello!");

    h.session.stop().await;
    assert_eq!(h.session.status(), SessionStatus::Idle);
    assert!(*h.connector.closed.lock().unwrap());
    assert_eq!(*h.capture.stops.lock().unwrap(), 1);
    assert_eq!(h.sink_log.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn run_loop_drains_queued_events_then_exits() {
    let mut h = harness();
    let streams = h.session.start().await.unwrap();

    let events = h.connector.event_tx.lock().unwrap().clone().unwrap();
    events
        .send(message(|m| m.input_transcript = Some("shut ".into())))
        .await
        .unwrap();
    events
        .send(message(|m| {
            m.input_transcript = Some("down".into());
            m.turn_complete = Some(true);
        }))
        .await
        .unwrap();
    events.send(TransportEvent::Closed).await.unwrap();

    run_session(&mut h.session, streams).await;

    assert_eq!(h.session.status(), SessionStatus::Idle);
    assert_eq!(h.session.turns().len(), 2);
    assert_eq!(h.session.turns()[0].text, "shut down");
}
