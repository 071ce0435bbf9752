//! Wire codec for the live audio channel.
//!
//! The transport only accepts text payloads inside its message envelope, so
//! outbound frames are base64-wrapped raw PCM and inbound segments arrive the
//! same way. Decoding turns little-endian 16-bit PCM into normalized f32
//! sample buffers ready for the playback scheduler.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

const I16_SCALE: f32 = 32768.0;

/// Malformed inbound payload. The offending segment is dropped by the
/// session; this never escalates to teardown.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Encode a binary buffer into the text-safe transport form.
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Inverse of [`encode`]. Fails on invalid alphabet characters or
/// impossible padding.
pub fn decode(text: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(STANDARD.decode(text)?)
}

/// Pack mono i16 samples into the little-endian byte form an outbound
/// frame carries.
pub fn pcm16_bytes(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16_le(sample);
    }
    buf.freeze()
}

/// One decoded inbound audio segment: sample rate plus per-channel sample
/// arrays, normalized to [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channel_data: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channel_data.len()
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.channel_data.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channel_data[index]
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Re-quantize to interleaved i16 for the output device.
    pub fn interleaved_i16(&self) -> Vec<i16> {
        let channels = self.channels();
        let mut out = Vec::with_capacity(self.frames() * channels);
        for frame in 0..self.frames() {
            for ch in 0..channels {
                let scaled = (self.channel_data[ch][frame] * I16_SCALE)
                    .clamp(-I16_SCALE, I16_SCALE - 1.0);
                out.push(scaled as i16);
            }
        }
        out
    }
}

/// Interpret `bytes` as interleaved little-endian 16-bit signed PCM and
/// normalize into an [`AudioBuffer`].
///
/// A trailing partial sample is truncated; zero-length input yields a valid
/// empty buffer.
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32, channels: usize) -> AudioBuffer {
    let channels = channels.max(1);
    let frames = bytes.len() / 2 / channels;
    let mut channel_data: Vec<Vec<f32>> = (0..channels).map(|_| Vec::with_capacity(frames)).collect();

    for (i, pair) in bytes.chunks_exact(2).take(frames * channels).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        channel_data[i % channels].push(sample as f32 / I16_SCALE);
    }

    AudioBuffer {
        sample_rate,
        channel_data,
    }
}
