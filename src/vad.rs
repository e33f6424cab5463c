/// RMS (Root Mean Square) energy of a block of samples. Cheap
/// speech-presence proxy used by the progressive loop and the speaker
/// verifier's silence gate.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|&x| x * x).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Fixed chunk size for VAD classification: 512 samples at 16kHz (32ms).
pub const VAD_CHUNK_SIZE: usize = 512;

/// Voice activity classification over fixed-size chunks. Implementations may
/// keep state across chunks within one recording session; `reset` is called
/// at each session start.
pub trait VoiceActivityDetector: Send {
    fn is_speech(&mut self, chunk: &[f32]) -> bool;
    fn reset(&mut self);
}

/// Simple energy-based voice detection with a graded probability output.
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    pub fn new() -> Self {
        Self {
            threshold: 0.005, // Energy threshold - lowered for better speech detection
        }
    }

    pub fn with_threshold(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Speech probability for a chunk (0.0 = silence, 1.0 = definitely speech).
    /// Maps threshold..threshold*5 to 0.0..1.0 rather than a hard cutoff.
    pub fn speech_probability(&self, chunk: &[f32]) -> f32 {
        let energy = rms(chunk);
        if energy < self.threshold {
            0.0
        } else if energy > self.threshold * 5.0 {
            1.0
        } else {
            ((energy - self.threshold) / (self.threshold * 4.0)).min(1.0)
        }
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new()
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn is_speech(&mut self, chunk: &[f32]) -> bool {
        self.speech_probability(chunk) > 0.5
    }

    fn reset(&mut self) {
        // Energy detection carries no cross-chunk state.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0.0; 512]), 0.0);
    }

    #[test]
    fn rms_of_constant_signal() {
        let signal = vec![0.5f32; 1024];
        assert!((rms(&signal) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn energy_vad_classifies_loud_and_quiet() {
        let mut vad = EnergyVad::new();
        let quiet = vec![0.001f32; VAD_CHUNK_SIZE];
        let loud = vec![0.1f32; VAD_CHUNK_SIZE];
        assert!(!vad.is_speech(&quiet));
        assert!(vad.is_speech(&loud));
    }

    #[test]
    fn probability_is_graded_between_floors() {
        let vad = EnergyVad::with_threshold(0.01);
        let mid = vec![0.03f32; VAD_CHUNK_SIZE];
        let p = vad.speech_probability(&mid);
        assert!(p > 0.0 && p < 1.0, "expected graded probability, got {p}");
    }
}
