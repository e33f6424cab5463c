//! ASR engine boundary. The session worker only ever sees the trait; the
//! whisper implementation below is the default backend.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Speech-to-text engine contract. Implementations must tolerate audio that
/// was concatenated from non-adjacent stretches of the original signal (the
/// speaker filter produces such audio).
pub trait AsrEngine: Send {
    fn load_model(&mut self) -> Result<()>;
    /// Transcribe mono f32 samples. `context` is a free-form hint string
    /// (vocabulary terms) that may bias decoding; it can be empty.
    fn transcribe(&mut self, audio: &[f32], sample_rate: u32, context: &str) -> Result<String>;
    fn unload_model(&mut self);
    fn is_ready(&self) -> bool;
}

pub struct WhisperAsr {
    model_path: PathBuf,
    language: String,
    ctx: Option<WhisperContext>,
}

impl WhisperAsr {
    pub fn new(model_path: PathBuf, language: String) -> Self {
        Self {
            model_path,
            language,
            ctx: None,
        }
    }
}

impl AsrEngine for WhisperAsr {
    fn load_model(&mut self) -> Result<()> {
        if self.ctx.is_some() {
            return Ok(());
        }
        if !self.model_path.exists() {
            anyhow::bail!(
                "ASR model not found: {}\nDownload a ggml model from https://huggingface.co/ggerganov/whisper.cpp and place it there.",
                self.model_path.display()
            );
        }

        info!("Loading ASR model from {}", self.model_path.display());
        let ctx = WhisperContext::new_with_params(
            &self.model_path.to_string_lossy(),
            WhisperContextParameters::default(),
        )
        .context("Failed to load whisper model")?;
        self.ctx = Some(ctx);
        info!("ASR model loaded");
        Ok(())
    }

    fn transcribe(&mut self, audio: &[f32], sample_rate: u32, context: &str) -> Result<String> {
        let ctx = self.ctx.as_ref().context("ASR model not loaded")?;
        if sample_rate != 16_000 {
            anyhow::bail!("whisper backend requires 16kHz audio, got {}Hz", sample_rate);
        }

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        if !self.language.is_empty() && self.language != "auto" {
            params.set_language(Some(&self.language));
        }
        params.set_translate(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        // Keep annotations like [BLANK_AUDIO] and (coughs) out of the output.
        params.set_suppress_blank(true);
        params.set_suppress_non_speech_tokens(true);
        if !context.is_empty() {
            params.set_initial_prompt(context);
        }

        let mut state = ctx.create_state().context("Failed to create whisper state")?;
        state
            .full(params, audio)
            .context("Failed to run transcription")?;

        let num_segments = state
            .full_n_segments()
            .context("Failed to get segment count")?;
        let mut result = String::new();
        for i in 0..num_segments {
            let segment = state
                .full_get_segment_text(i)
                .context("Failed to get segment text")?;
            debug!("segment {}: {:?}", i, segment);
            result.push_str(&segment);
        }

        Ok(result.trim().to_string())
    }

    fn unload_model(&mut self) {
        if self.ctx.take().is_some() {
            info!("ASR model unloaded");
        }
    }

    fn is_ready(&self) -> bool {
        self.ctx.is_some()
    }
}
