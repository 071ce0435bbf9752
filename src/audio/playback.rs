//! Playback scheduling for inbound audio segments.
//!
//! Segments play gaplessly in arrival order against a monotonic playback
//! clock: each segment starts at `max(clock, now)` and advances the clock by
//! its own duration. Completion is polled cooperatively by the session loop
//! (`next_deadline` / `complete_due`) rather than delivered through
//! callbacks, so every state transition stays on one task.
//!
//! Audible output goes through [`OutputSink`]; the production sink is an
//! ALSA worker thread with a generation-tagged queue so interruption can
//! drop audio that has been queued but not yet sounded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use thiserror::Error;
use tokio::time::{Duration, Instant};

use super::codec::AudioBuffer;
use super::device;
use crate::config::Config;

/// Output device failure. Fatal to session start; never raised per-segment.
#[derive(Debug, Error)]
#[error("audio output unavailable: {0}")]
pub struct SinkError(#[source] pub anyhow::Error);

/// Destination for scheduled audio.
pub trait OutputSink: Send {
    /// Queue one segment's samples for audible output, behind everything
    /// already queued.
    fn write(&mut self, segment: &AudioBuffer);

    /// Drop everything queued or currently sounding.
    fn cancel(&mut self);

    /// Release the output device. Idempotent.
    fn close(&mut self);
}

/// Opens an [`OutputSink`]. The session acquires a fresh sink on every
/// `start()` so stop/start cycles release and re-acquire the device.
pub trait SinkFactory: Send {
    fn open_sink(&self) -> Result<Box<dyn OutputSink>, SinkError>;
}

struct ScheduledSegment {
    /// Segment end on the scheduler epoch, seconds.
    end: f64,
}

pub struct PlaybackScheduler {
    sink: Box<dyn OutputSink>,
    epoch: Instant,
    /// Next available start time, seconds since `epoch`. Monotonically
    /// non-decreasing except on interrupt.
    clock: f64,
    active: VecDeque<ScheduledSegment>,
    torn_down: bool,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn OutputSink>) -> Self {
        Self {
            sink,
            epoch: Instant::now(),
            clock: 0.0,
            active: VecDeque::new(),
            torn_down: false,
        }
    }

    fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Schedule a segment for gapless playback after everything already
    /// scheduled. Returns the computed start time (seconds on the
    /// scheduler epoch), or `None` after teardown: a decode that
    /// completes late is silently discarded.
    pub fn schedule(&mut self, segment: &AudioBuffer) -> Option<f64> {
        if self.torn_down {
            return None;
        }

        let start = self.clock.max(self.now_secs());
        let end = start + segment.duration_secs();
        self.sink.write(segment);
        self.clock = end;
        self.active.push_back(ScheduledSegment { end });

        tracing::trace!(start, end, "segment scheduled");
        Some(start)
    }

    /// Earliest scheduled segment end, for the session loop to sleep on.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active
            .front()
            .map(|seg| self.epoch + Duration::from_secs_f64(seg.end))
    }

    /// Retire every segment whose end has passed. Returns true when this
    /// call emptied the active set, i.e. the "drained" signal.
    pub fn complete_due(&mut self, now: Instant) -> bool {
        if self.active.is_empty() {
            return false;
        }
        let now_secs = now.saturating_duration_since(self.epoch).as_secs_f64();
        let mut finished = 0;
        while self.active.front().is_some_and(|seg| seg.end <= now_secs) {
            self.active.pop_front();
            finished += 1;
        }
        finished > 0 && self.active.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Barge-in: stop everything scheduled and reset the clock, so the
    /// next `schedule` starts fresh relative to real time.
    pub fn interrupt(&mut self) {
        self.sink.cancel();
        self.active.clear();
        self.clock = 0.0;
        tracing::debug!("playback interrupted");
    }

    /// Stop all segments, clear state, release the output device.
    /// Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.interrupt();
        self.sink.close();
        self.torn_down = true;
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ======================== ALSA sink ========================

enum SinkCommand {
    Play { generation: u64, samples: Vec<i16> },
}

/// Factory for the production ALSA sink.
pub struct AlsaOutput {
    device: String,
    sample_rate: u32,
}

impl AlsaOutput {
    pub fn new(config: &Config) -> Self {
        Self {
            device: config.playback_device.clone(),
            sample_rate: config.output_sample_rate,
        }
    }
}

impl SinkFactory for AlsaOutput {
    fn open_sink(&self) -> Result<Box<dyn OutputSink>, SinkError> {
        AlsaSink::open(&self.device, self.sample_rate).map(|sink| Box::new(sink) as Box<dyn OutputSink>)
    }
}

/// ALSA playback on a dedicated worker thread. Writes are tagged with a
/// generation counter; `cancel` bumps the counter and the worker drops
/// stale queue entries and aborts a stale in-progress write.
pub struct AlsaSink {
    tx: Option<std_mpsc::Sender<SinkCommand>>,
    generation: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaSink {
    pub fn open(device: &str, sample_rate: u32) -> Result<Self, SinkError> {
        let (pcm, params) = device::open_playback(device, sample_rate).map_err(SinkError)?;
        let (tx, rx) = std_mpsc::channel();
        let generation = Arc::new(AtomicU64::new(0));

        let handle = {
            let generation = generation.clone();
            thread::Builder::new()
                .name("livevoice-playback".into())
                .spawn(move || sink_thread(pcm, params.period_size, rx, &generation))
                .map_err(|e| SinkError(e.into()))?
        };

        Ok(Self {
            tx: Some(tx),
            generation,
            handle: Some(handle),
        })
    }
}

impl OutputSink for AlsaSink {
    fn write(&mut self, segment: &AudioBuffer) {
        let Some(tx) = self.tx.as_ref() else { return };
        let command = SinkCommand::Play {
            generation: self.generation.load(Ordering::Relaxed),
            samples: segment.interleaved_i16(),
        };
        if tx.send(command).is_err() {
            tracing::warn!("playback worker gone, dropping segment");
        }
    }

    fn cancel(&mut self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    fn close(&mut self) {
        self.cancel();
        // Dropping the sender ends the worker loop.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AlsaSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn sink_thread(
    pcm: PCM,
    period_size: usize,
    rx: std_mpsc::Receiver<SinkCommand>,
    generation: &AtomicU64,
) {
    let io = match pcm.io_i16() {
        Ok(io) => io,
        Err(e) => {
            tracing::error!(error = %e, "failed to map playback I/O");
            return;
        }
    };
    let chunk = period_size.max(256);

    while let Ok(SinkCommand::Play { generation: tag, samples }) = rx.recv() {
        if generation.load(Ordering::Relaxed) != tag {
            // Canceled before it sounded.
            continue;
        }

        // Write one period at a time so a cancel can cut in mid-segment.
        let mut written = 0;
        while written < samples.len() {
            if generation.load(Ordering::Relaxed) != tag {
                let _ = pcm.drop();
                let _ = pcm.prepare();
                break;
            }
            let end = (written + chunk).min(samples.len());
            match io.writei(&samples[written..end]) {
                Ok(n) => written += n,
                Err(e) => {
                    tracing::warn!(error = %e, "ALSA playback error, recovering");
                    if pcm.prepare().is_err() {
                        tracing::error!("failed to recover PCM playback");
                        return;
                    }
                }
            }
        }
    }

    let _ = pcm.drain();
    tracing::debug!("playback worker exited");
}
