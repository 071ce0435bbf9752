//! audio - capture pipeline, playback scheduling, and the wire codec.
//!
//! Uses ALSA for device I/O; the wire format is base64-wrapped raw
//! little-endian 16-bit PCM.

pub mod capture;
pub mod codec;
mod device;
pub mod playback;

pub use capture::{AlsaCapture, CaptureFrame, CaptureSource};
pub use codec::{AudioBuffer, DecodeError};
pub use playback::{AlsaOutput, OutputSink, PlaybackScheduler, SinkFactory};
