//! Microphone capture: a growable session buffer plus the level/ring state
//! shared with the rest of the pipeline.
//!
//! The cpal callback runs on a driver thread, so everything it touches lives
//! behind one mutex. Readers copy data out; nothing aliases the live buffer.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tracing::{info, warn};

use crate::vad::rms;

/// Ring buffer capacity for spectral visualization snapshots.
pub const RING_CAPACITY: usize = 2048;

/// EMA coefficient for the smoothed level display. High alpha keeps the
/// level responsive to speech onsets.
const RMS_ALPHA: f32 = 0.6;

// Wrapper struct to make the audio stream moveable between threads.
// cpal streams aren't Send/Sync by default; we only ever drop the stream
// from another thread, never drive it.
pub struct SendStream(pub Stream);
unsafe impl Send for SendStream {}
unsafe impl Sync for SendStream {}

/// Capture seam used by the session worker, so sessions can be driven by a
/// scripted source in tests. `AudioCaptureBuffer` is the real implementation.
pub trait Recorder: Send + Sync {
    fn start_recording(&self) -> Result<()>;
    /// Stop the stream and return accumulated samples, or `None` if nothing
    /// was captured. Clears internal state.
    fn stop_recording(&self) -> Option<Vec<f32>>;
    /// Return and clear accumulated samples without stopping the stream.
    fn drain_buffer(&self) -> Option<Vec<f32>>;
    fn current_rms(&self) -> f32;
    fn sample_rate(&self) -> u32;
    fn is_recording(&self) -> bool;
}

/// Buffer state shared between the driver callback and the rest of the app.
pub(crate) struct CaptureState {
    samples: Vec<f32>,
    recording: bool,
    smoothed_rms: f32,
    ring: Vec<f32>,
    ring_pos: usize,
    ring_len: usize,
}

impl CaptureState {
    fn new() -> Self {
        Self {
            samples: Vec::new(),
            recording: false,
            smoothed_rms: 0.0,
            ring: vec![0.0; RING_CAPACITY],
            ring_pos: 0,
            ring_len: 0,
        }
    }

    /// Called once per driver callback with a mono block.
    pub(crate) fn push_block(&mut self, block: &[f32]) {
        if block.is_empty() {
            return;
        }
        if self.recording {
            self.samples.extend_from_slice(block);
        }
        let instant = rms(block);
        self.smoothed_rms = RMS_ALPHA * instant + (1.0 - RMS_ALPHA) * self.smoothed_rms;
        for &sample in block {
            self.ring[self.ring_pos] = sample;
            self.ring_pos = (self.ring_pos + 1) % RING_CAPACITY;
        }
        self.ring_len = (self.ring_len + block.len()).min(RING_CAPACITY);
    }

    /// Most recent samples in chronological order.
    pub(crate) fn ring_snapshot(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.ring_len);
        let start = (self.ring_pos + RING_CAPACITY - self.ring_len) % RING_CAPACITY;
        for i in 0..self.ring_len {
            out.push(self.ring[(start + i) % RING_CAPACITY]);
        }
        out
    }
}

pub struct AudioCaptureBuffer {
    device: Device,
    config: StreamConfig,
    state: Arc<Mutex<CaptureState>>,
    stream: Mutex<Option<SendStream>>,
}

impl AudioCaptureBuffer {
    /// Open the configured (or default) input device. Missing devices are a
    /// startup-fatal condition for the host, hence the hard error here.
    pub fn new(preferred_device: Option<&str>, target_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = preferred_device {
            host.input_devices()
                .context("Failed to enumerate input devices")?
                .find(|d| d.name().ok().as_deref() == Some(name))
                .with_context(|| format!("Input device '{}' not found", name))?
        } else {
            host.default_input_device()
                .context("No input device available")?
        };
        info!(
            "Using input device: {}",
            device.name().unwrap_or_default()
        );

        let default_config = device
            .default_input_config()
            .context("Failed to get default input config")?;
        let mut config: StreamConfig = default_config.into();

        // Prefer the target rate when the device supports it; otherwise keep
        // the device default and report the actual rate downstream.
        let supports_target = device
            .supported_input_configs()
            .context("Failed to query supported input configs")?
            .any(|c| c.min_sample_rate().0 <= target_rate && c.max_sample_rate().0 >= target_rate);
        if supports_target {
            config.sample_rate = SampleRate(target_rate);
        } else {
            warn!(
                "Device does not support {}Hz, capturing at {}Hz",
                target_rate, config.sample_rate.0
            );
        }
        info!(
            "Capture config: {} channel(s) @ {}Hz",
            config.channels, config.sample_rate.0
        );

        Ok(Self {
            device,
            config,
            state: Arc::new(Mutex::new(CaptureState::new())),
            stream: Mutex::new(None),
        })
    }

    /// Copy of the visualization ring buffer, oldest sample first.
    pub fn spectrum_snapshot(&self) -> Vec<f32> {
        self.state.lock().unwrap().ring_snapshot()
    }
}

impl Recorder for AudioCaptureBuffer {
    fn start_recording(&self) -> Result<()> {
        let mut stream_slot = self.stream.lock().unwrap();
        if stream_slot.is_some() {
            return Ok(()); // Already recording
        }

        {
            let mut state = self.state.lock().unwrap();
            state.samples.clear();
            state.smoothed_rms = 0.0;
            state.recording = true;
        }

        let state = Arc::clone(&self.state);
        let channels = self.config.channels as usize;

        let err_fn = |err| warn!("Audio stream error: {}", err);

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Fold multi-channel input down to mono before buffering.
                    let Ok(mut state) = state.lock() else {
                        return;
                    };
                    if channels == 1 {
                        state.push_block(data);
                    } else {
                        let mono: Vec<f32> = data
                            .chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                            .collect();
                        state.push_block(&mono);
                    }
                },
                err_fn,
                None,
            )
            .context("Failed to build input stream")?;

        stream.play().context("Failed to start audio stream")?;
        *stream_slot = Some(SendStream(stream));
        info!("Recording started ({}Hz)", self.config.sample_rate.0);
        Ok(())
    }

    fn stop_recording(&self) -> Option<Vec<f32>> {
        if let Some(stream) = self.stream.lock().unwrap().take() {
            drop(stream);
        }
        let mut state = self.state.lock().unwrap();
        if !state.recording {
            return None;
        }
        state.recording = false;
        state.smoothed_rms = 0.0;
        let samples = std::mem::take(&mut state.samples);
        drop(state);

        if samples.is_empty() {
            return None;
        }
        info!(
            "Recording stopped: {:.2}s, {} samples",
            samples.len() as f32 / self.config.sample_rate.0 as f32,
            samples.len()
        );
        Some(samples)
    }

    fn drain_buffer(&self) -> Option<Vec<f32>> {
        let mut state = self.state.lock().unwrap();
        if state.samples.is_empty() {
            return None;
        }
        // Swap out the buffer instead of cloning; the stream keeps filling
        // the fresh one while the drained copy is transcribed.
        Some(std::mem::take(&mut state.samples))
    }

    fn current_rms(&self) -> f32 {
        self.state.lock().unwrap().smoothed_rms
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn is_recording(&self) -> bool {
        self.stream.lock().unwrap().is_some()
    }
}

impl Drop for AudioCaptureBuffer {
    fn drop(&mut self) {
        let _ = self.stop_recording();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_block_accumulates_only_while_recording() {
        let mut state = CaptureState::new();
        state.push_block(&[0.1; 100]);
        assert!(state.samples.is_empty());

        state.recording = true;
        state.push_block(&[0.1; 100]);
        state.push_block(&[0.2; 50]);
        assert_eq!(state.samples.len(), 150);
    }

    #[test]
    fn smoothed_rms_tracks_signal_level() {
        let mut state = CaptureState::new();
        for _ in 0..20 {
            state.push_block(&[0.5; 256]);
        }
        // EMA converges toward the instantaneous RMS of a steady signal.
        assert!((state.smoothed_rms - 0.5).abs() < 0.01);

        for _ in 0..20 {
            state.push_block(&[0.0; 256]);
        }
        assert!(state.smoothed_rms < 0.01);
    }

    #[test]
    fn ring_keeps_most_recent_samples_in_order() {
        let mut state = CaptureState::new();
        // Three thousand distinct samples; only the last 2048 survive.
        let block: Vec<f32> = (0..3000).map(|i| i as f32).collect();
        state.push_block(&block);

        let snapshot = state.ring_snapshot();
        assert_eq!(snapshot.len(), RING_CAPACITY);
        assert_eq!(snapshot[0], (3000 - RING_CAPACITY) as f32);
        assert_eq!(*snapshot.last().unwrap(), 2999.0);
    }

    #[test]
    fn ring_partial_fill_returns_short_snapshot() {
        let mut state = CaptureState::new();
        state.push_block(&[1.0; 100]);
        assert_eq!(state.ring_snapshot().len(), 100);
    }
}
