//! ALSA PCM device wrappers.
//!
//! The live channel is mono S16LE on both directions, so the open helpers
//! only negotiate the sample rate and report what the hardware actually
//! granted.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a mono PCM device for capture.
pub fn open_capture(device: &str, sample_rate: u32) -> Result<(PCM, NegotiatedParams)> {
    open_pcm(device, Direction::Capture, sample_rate)
}

/// Open a mono PCM device for playback.
pub fn open_playback(device: &str, sample_rate: u32) -> Result<(PCM, NegotiatedParams)> {
    open_pcm(device, Direction::Playback, sample_rate)
}

fn open_pcm(device: &str, direction: Direction, sample_rate: u32) -> Result<(PCM, NegotiatedParams)> {
    let dir_name = match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).context("failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(1)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    let (actual_rate, period_size) = {
        let hwp = pcm.hw_params_current()?;
        (hwp.get_rate()?, hwp.get_period_size()? as usize)
    };

    if actual_rate != sample_rate {
        tracing::warn!(
            device,
            requested = sample_rate,
            negotiated = actual_rate,
            "ALSA {} rate differs from requested",
            dir_name,
        );
    }
    tracing::debug!(
        device,
        rate = actual_rate,
        period = period_size,
        "ALSA {} device open",
        dir_name,
    );

    Ok((
        pcm,
        NegotiatedParams {
            sample_rate: actual_rate,
            period_size,
        },
    ))
}
