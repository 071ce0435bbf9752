//! Microphone capture pipeline.
//!
//! A dedicated OS thread (not a tokio task, to keep real-time reads away
//! from async scheduling) pulls S16LE periods from ALSA, adapts the rate to
//! the configured frame rate when the hardware negotiates something else,
//! and emits fixed-size frames in strict temporal order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use super::codec;
use super::device::{self, NegotiatedParams};
use crate::config::Config;

/// One full capture window of mono 16-bit PCM, little-endian.
pub type CaptureFrame = Bytes;

/// Microphone acquisition failure. Fatal to session start.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("microphone unavailable: {0}")]
    Device(#[source] anyhow::Error),
    #[error("capture thread failed to start: {0}")]
    Thread(#[source] std::io::Error),
}

/// Source of outbound capture frames.
///
/// The production implementation owns an ALSA capture thread; tests
/// substitute a scripted source so the session runs without hardware.
pub trait CaptureSource: Send {
    /// Acquire the device and begin emitting frames on `frames`.
    /// Failure must leave nothing acquired.
    fn start(&mut self, frames: mpsc::Sender<CaptureFrame>) -> Result<(), CaptureError>;

    /// Release the device. No frame is emitted after this returns.
    /// Idempotent.
    fn stop(&mut self);
}

pub struct AlsaCapture {
    device: String,
    sample_rate: u32,
    frame_window: usize,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaCapture {
    pub fn new(config: &Config) -> Self {
        Self {
            device: config.capture_device.clone(),
            sample_rate: config.input_sample_rate,
            frame_window: config.frame_window,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl CaptureSource for AlsaCapture {
    fn start(&mut self, frames: mpsc::Sender<CaptureFrame>) -> Result<(), CaptureError> {
        // Open on the caller so acquisition failure is synchronous.
        let (pcm, params) =
            device::open_capture(&self.device, self.sample_rate).map_err(CaptureError::Device)?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let target_rate = self.sample_rate;
        let frame_window = self.frame_window;

        let handle = thread::Builder::new()
            .name("livevoice-capture".into())
            .spawn(move || {
                capture_thread(pcm, params, target_rate, frame_window, frames, &running);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                CaptureError::Thread(e)
            })?;

        self.handle = Some(handle);
        tracing::info!(rate = target_rate, window = frame_window, "capture started");
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            tracing::info!("capture stopped");
        }
    }
}

impl Drop for AlsaCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    pcm: PCM,
    params: NegotiatedParams,
    target_rate: u32,
    frame_window: usize,
    frames: mpsc::Sender<CaptureFrame>,
    running: &AtomicBool,
) {
    let io = match pcm.io_i16() {
        Ok(io) => io,
        Err(e) => {
            tracing::error!(error = %e, "failed to map capture I/O");
            return;
        }
    };

    let mut read_buf = vec![0i16; params.period_size];
    // Accumulates rate-adapted samples until a full window is available.
    let mut accum: Vec<i16> = Vec::with_capacity(frame_window * 2);

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(samples) => {
                if params.sample_rate == target_rate {
                    accum.extend_from_slice(&read_buf[..samples]);
                } else {
                    accum.extend(resample_linear(
                        &read_buf[..samples],
                        params.sample_rate,
                        target_rate,
                    ));
                }

                while accum.len() >= frame_window {
                    let frame = codec::pcm16_bytes(&accum[..frame_window]);
                    if frames.blocking_send(frame).is_err() {
                        // Receiver dropped: the session went away.
                        tracing::debug!("capture receiver dropped, exiting");
                        return;
                    }
                    accum.drain(..frame_window);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "ALSA capture error, recovering");
                if let Err(e2) = pcm.prepare() {
                    tracing::error!(error = %e2, "failed to recover PCM capture");
                    return;
                }
            }
        }
    }
}

/// Nearest-neighbour linear interpolation between capture and frame rates.
/// Only engaged when the hardware refuses the configured rate.
fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let out_len = (input.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            let s0 = input[idx.min(input.len() - 1)] as f64;
            let s1 = input[(idx + 1).min(input.len() - 1)] as f64;
            (s0 + (s1 - s0) * frac).round() as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_identity_when_rates_match() {
        let input = [1i16, 2, 3, 4];
        assert_eq!(resample_linear(&input, 16000, 16000), input);
    }

    #[test]
    fn resample_downsamples_proportionally() {
        let input = vec![100i16; 4800];
        let out = resample_linear(&input, 48000, 16000);
        assert_eq!(out.len(), 1600);
        assert!(out.iter().all(|&s| s == 100));
    }

    #[test]
    fn resample_interpolates_between_samples() {
        // 8k -> 16k doubles the length; midpoints land between neighbours.
        let input = [0i16, 100];
        let out = resample_linear(&input, 8000, 16000);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 50);
    }
}
