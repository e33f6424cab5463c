//! Two-tier speaker verification: a fast whole-utterance embedding check,
//! with a windowed re-segmentation pass for the ambiguous middle band.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::vad::rms;

pub const EMBEDDING_DIM: usize = 192;

// Slow-path analysis geometry. Tuned empirically; the exact values matter
// for behavior, so they live here as named constants.
const SLOW_WINDOW_SECS: f32 = 2.0;
const SLOW_HOP_SECS: f32 = 1.0;
const SLOW_SILENCE_FLOOR: f32 = 0.005;
const SLOW_MIN_TAIL_SECS: f32 = 0.5;

/// Extracts a fixed-size speaker embedding from raw audio. Implemented over
/// an ONNX session in production and by fakes in tests.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, audio: &[f32], sample_rate: u32) -> Result<Array1<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPath {
    Bypass,
    FastAccept,
    FastReject,
    SlowAccept,
    SlowReject,
}

/// Result of one verification call. `audio` carries the (possibly filtered)
/// signal on every accept path and is `None` on rejection.
pub struct VerifyResult {
    pub audio: Option<Vec<f32>>,
    pub is_user: bool,
    pub score: f32,
    pub path: VerifyPath,
}

/// Enrollment validation failure. The inconsistent-samples case is the one
/// place verification reports a structured, user-actionable error.
#[derive(Debug)]
pub enum EnrollError {
    ModelNotLoaded,
    Extraction(String),
    InconsistentSamples {
        first: usize,
        second: usize,
        score: f32,
    },
    Io(String),
}

impl fmt::Display for EnrollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrollError::ModelNotLoaded => write!(f, "embedding model not loaded"),
            EnrollError::Extraction(msg) => write!(f, "embedding extraction failed: {}", msg),
            EnrollError::InconsistentSamples {
                first,
                second,
                score,
            } => write!(
                f,
                "enrollment samples {} and {} are too different (similarity {:.2}); re-record them in the same conditions",
                first, second, score
            ),
            EnrollError::Io(msg) => write!(f, "failed to persist enrollment: {}", msg),
        }
    }
}

impl std::error::Error for EnrollError {}

#[derive(Serialize, Deserialize)]
struct EnrollMetadata {
    sample_count: usize,
    created: String,
    threshold: f32,
}

pub struct SpeakerVerifier {
    extractor: Option<Box<dyn EmbeddingExtractor>>,
    centroid: Option<Array1<f32>>,
    threshold: f32,
    high_threshold: f32,
    low_threshold: f32,
}

impl SpeakerVerifier {
    pub fn new() -> Self {
        Self {
            extractor: None,
            centroid: None,
            threshold: 0.25,
            high_threshold: 0.40,
            low_threshold: 0.10,
        }
    }

    pub fn set_extractor(&mut self, extractor: Box<dyn EmbeddingExtractor>) {
        self.extractor = Some(extractor);
    }

    pub fn is_ready(&self) -> bool {
        self.extractor.is_some()
    }

    pub fn is_enrolled(&self) -> bool {
        self.centroid.is_some()
    }

    /// Thresholds are runtime-adjustable without reloading the model.
    /// Invariant: `low <= mid <= high`.
    pub fn update_thresholds(&mut self, threshold: f32, high: f32, low: f32) {
        self.threshold = threshold;
        self.high_threshold = high;
        self.low_threshold = low;
    }

    /// Load the enrolled centroid from disk. Returns true if found.
    pub fn load_enrollment(&mut self, speaker_dir: &Path) -> bool {
        let centroid_path = speaker_dir.join("centroid.json");
        match std::fs::read_to_string(&centroid_path) {
            Ok(contents) => match serde_json::from_str::<Vec<f32>>(&contents) {
                Ok(values) if values.len() == EMBEDDING_DIM => {
                    self.centroid = Some(Array1::from(values));
                    info!("Loaded enrolled speaker centroid from {}", centroid_path.display());
                    true
                }
                _ => {
                    debug!("Centroid file at {} is malformed", centroid_path.display());
                    self.centroid = None;
                    false
                }
            },
            Err(_) => {
                self.centroid = None;
                false
            }
        }
    }

    // --- Enrollment ---

    /// Enroll a speaker from multiple audio samples. Every pairwise cosine
    /// similarity must reach `threshold`, otherwise the enrollment fails
    /// naming the offending pair and nothing is written.
    pub fn enroll(
        &mut self,
        audio_samples: &[Vec<f32>],
        sample_rate: u32,
        speaker_dir: &Path,
    ) -> Result<(), EnrollError> {
        let extractor = self.extractor.as_mut().ok_or(EnrollError::ModelNotLoaded)?;

        let mut embeddings: Vec<Array1<f32>> = Vec::with_capacity(audio_samples.len());
        for (i, audio) in audio_samples.iter().enumerate() {
            let emb = extractor
                .extract(audio, sample_rate)
                .map_err(|e| EnrollError::Extraction(e.to_string()))?;
            info!("Enrollment sample {}: embedding extracted", i + 1);
            embeddings.push(emb);
        }

        // Cross-validate before writing anything: one noisy sample would
        // otherwise poison the centroid for every future verification.
        for i in 0..embeddings.len() {
            for j in (i + 1)..embeddings.len() {
                let score = cosine_similarity(&embeddings[i], &embeddings[j]);
                info!("Enrollment pairwise similarity [{},{}]: {:.4}", i + 1, j + 1, score);
                if score < self.threshold {
                    return Err(EnrollError::InconsistentSamples {
                        first: i + 1,
                        second: j + 1,
                        score,
                    });
                }
            }
        }

        let stacked = Array2::from_shape_vec(
            (embeddings.len(), EMBEDDING_DIM),
            embeddings.iter().flat_map(|e| e.iter().copied()).collect(),
        )
        .map_err(|e| EnrollError::Extraction(e.to_string()))?;
        let centroid = stacked
            .mean_axis(Axis(0))
            .ok_or_else(|| EnrollError::Extraction("no samples".into()))?;

        std::fs::create_dir_all(speaker_dir).map_err(|e| EnrollError::Io(e.to_string()))?;
        let raw: Vec<Vec<f32>> = embeddings.iter().map(|e| e.to_vec()).collect();
        write_json_atomic(&speaker_dir.join("embeddings.json"), &raw)?;
        write_json_atomic(&speaker_dir.join("centroid.json"), &centroid.to_vec())?;
        write_json_atomic(
            &speaker_dir.join("metadata.json"),
            &EnrollMetadata {
                sample_count: audio_samples.len(),
                created: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                threshold: self.threshold,
            },
        )?;

        self.centroid = Some(centroid);
        info!("Speaker enrolled with {} samples", audio_samples.len());
        Ok(())
    }

    // --- Verification (two-tier) ---

    /// Fast path: whole-audio embedding against the centroid. Ambiguous
    /// scores fall through to windowed re-segmentation.
    pub fn verify(&mut self, audio: &[f32], sample_rate: u32) -> Result<VerifyResult> {
        let Some(centroid) = self.centroid.clone() else {
            return Ok(bypass(audio));
        };
        if self.extractor.is_none() {
            return Ok(bypass(audio));
        }

        let emb = self
            .extractor
            .as_mut()
            .unwrap()
            .extract(audio, sample_rate)
            .context("whole-audio embedding failed")?;
        let score = cosine_similarity(&emb, &centroid);
        info!(
            "Speaker verify fast path: score={:.4} (high={:.2}, low={:.2})",
            score, self.high_threshold, self.low_threshold
        );

        if score >= self.high_threshold {
            return Ok(VerifyResult {
                audio: Some(audio.to_vec()),
                is_user: true,
                score,
                path: VerifyPath::FastAccept,
            });
        }
        if score <= self.low_threshold {
            return Ok(VerifyResult {
                audio: None,
                is_user: false,
                score,
                path: VerifyPath::FastReject,
            });
        }

        info!("Speaker verify entering slow path (score={:.4} in ambiguous zone)", score);
        self.slow_path(audio, sample_rate, &centroid)
    }

    /// Slide a window across the audio, score each non-silent window, and
    /// keep only the sample ranges that match the enrolled speaker.
    fn slow_path(
        &mut self,
        audio: &[f32],
        sample_rate: u32,
        centroid: &Array1<f32>,
    ) -> Result<VerifyResult> {
        let threshold = self.threshold;
        let extractor = self.extractor.as_mut().expect("checked by caller");
        let window = (SLOW_WINDOW_SECS * sample_rate as f32) as usize;
        let hop = (SLOW_HOP_SECS * sample_rate as f32) as usize;
        let total = audio.len();

        if total < window {
            // Too short for windowed analysis; fall back to the whole-audio
            // score against the mid threshold.
            let emb = extractor
                .extract(audio, sample_rate)
                .context("short-audio embedding failed")?;
            let score = cosine_similarity(&emb, centroid);
            let is_user = score >= threshold;
            return Ok(VerifyResult {
                audio: is_user.then(|| audio.to_vec()),
                is_user,
                score,
                path: if is_user {
                    VerifyPath::SlowAccept
                } else {
                    VerifyPath::SlowReject
                },
            });
        }

        let mut user_mask = vec![false; total];
        let mut max_score = -1.0f32;

        let mut pos = 0;
        while pos + window <= total {
            let segment = &audio[pos..pos + window];

            // Near-silent windows carry no speaker information; skip them.
            if rms(segment) < SLOW_SILENCE_FLOOR {
                pos += hop;
                continue;
            }

            let emb = extractor
                .extract(segment, sample_rate)
                .context("window embedding failed")?;
            let score = cosine_similarity(&emb, centroid);
            debug!("Slow path segment [{}..{}] score={:.4}", pos, pos + window, score);

            if score >= threshold {
                user_mask[pos..pos + window].iter_mut().for_each(|m| *m = true);
            }
            max_score = max_score.max(score);
            pos += hop;
        }

        // Trailing partial window, if it carries enough signal.
        let min_tail = (SLOW_MIN_TAIL_SECS * sample_rate as f32) as usize;
        if pos < total && total - pos >= min_tail {
            let tail = &audio[pos..];
            if rms(tail) >= SLOW_SILENCE_FLOOR {
                let emb = extractor
                    .extract(tail, sample_rate)
                    .context("tail embedding failed")?;
                let score = cosine_similarity(&emb, centroid);
                if score >= threshold {
                    user_mask[pos..].iter_mut().for_each(|m| *m = true);
                }
                max_score = max_score.max(score);
            }
        }

        let kept: Vec<f32> = audio
            .iter()
            .zip(user_mask.iter())
            .filter_map(|(&s, &keep)| keep.then_some(s))
            .collect();

        if kept.is_empty() {
            info!("Slow path: no user segments found (max_score={:.4})", max_score);
            Ok(VerifyResult {
                audio: None,
                is_user: false,
                score: max_score,
                path: VerifyPath::SlowReject,
            })
        } else {
            info!(
                "Slow path: kept {}/{} samples ({:.1}%)",
                kept.len(),
                total,
                100.0 * kept.len() as f32 / total as f32
            );
            Ok(VerifyResult {
                audio: Some(kept),
                is_user: true,
                score: max_score,
                path: VerifyPath::SlowAccept,
            })
        }
    }
}

impl Default for SpeakerVerifier {
    fn default() -> Self {
        Self::new()
    }
}

fn bypass(audio: &[f32]) -> VerifyResult {
    VerifyResult {
        audio: Some(audio.to_vec()),
        is_user: true,
        score: 1.0,
        path: VerifyPath::Bypass,
    }
}

/// Cosine similarity, defined as 0.0 when either vector is degenerate
/// (guards silent/zero embeddings).
pub fn cosine_similarity(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    let norm_a = a.dot(a).sqrt();
    let norm_b = b.dot(b).sqrt();
    if norm_a < 1e-9 || norm_b < 1e-9 {
        return 0.0;
    }
    a.dot(b) / (norm_a * norm_b)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), EnrollError> {
    let contents = serde_json::to_string_pretty(value).map_err(|e| EnrollError::Io(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents).map_err(|e| EnrollError::Io(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| EnrollError::Io(e.to_string()))
}
