//! Speaker embedding extraction via an ONNX model.
//!
//! Expects a raw-waveform export: input `[1, N]` f32 mono samples, output a
//! `[1, 192]` embedding. Input/output names are read from the model so
//! differently-named exports keep working.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ndarray::Array1;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::value::TensorRef;
use tracing::info;

use crate::verifier::{EmbeddingExtractor, EMBEDDING_DIM};

pub struct OnnxEmbeddingExtractor {
    session: Session,
    input_name: String,
    output_name: String,
}

impl OnnxEmbeddingExtractor {
    pub fn load(model_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            anyhow::bail!("embedding model not found: {}", model_path.display());
        }

        let session = SessionBuilder::new()
            .context("failed to create ONNX session builder")?
            .with_optimization_level(GraphOptimizationLevel::All)
            .context("failed to set optimization level")?
            .with_intra_threads(
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
                    .clamp(1, 8),
            )
            .context("failed to set thread count")?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load {}", model_path.display()))?;

        let input_name = session
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .ok_or_else(|| anyhow!("embedding model has no inputs"))?;
        let output_name = session
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .ok_or_else(|| anyhow!("embedding model has no outputs"))?;

        info!(
            "Embedding model loaded from {} (input={}, output={})",
            model_path.display(),
            input_name,
            output_name
        );

        Ok(Self {
            session,
            input_name,
            output_name,
        })
    }
}

impl EmbeddingExtractor for OnnxEmbeddingExtractor {
    fn extract(&mut self, audio: &[f32], _sample_rate: u32) -> Result<Array1<f32>> {
        if audio.is_empty() {
            anyhow::bail!("cannot embed empty audio");
        }

        let waveform = TensorRef::from_array_view(([1_i64, audio.len() as i64], audio))
            .context("failed to build input tensor")?;
        let inputs: Vec<(String, SessionInputValue)> = vec![(
            self.input_name.clone(),
            SessionInputValue::from(waveform),
        )];

        let outputs = self
            .session
            .run(inputs)
            .context("embedding inference failed")?;
        let (_, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .context("embedding output is not an f32 tensor")?;

        if data.len() != EMBEDDING_DIM {
            anyhow::bail!(
                "embedding model produced {} values, expected {}",
                data.len(),
                EMBEDDING_DIM
            );
        }
        Ok(Array1::from(data.to_vec()))
    }
}
