use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;

use crate::error::{Error, Result};

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Whether this build can run the model on an accelerator.
pub fn has_accelerator() -> bool {
    cfg!(any(feature = "cuda", feature = "metal"))
}

/// Manages the ColBERT model lifecycle, loading it on first use.
pub struct ModelManager {
    model: Option<ColBERT>,
    model_id: String,
}

impl ModelManager {
    pub fn new(model_id: &str) -> Self {
        Self {
            model: None,
            model_id: model_id.to_string(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Ensures the model is loaded, downloading from HuggingFace Hub if needed.
    fn ensure_loaded(&mut self) -> Result<&mut ColBERT> {
        if self.model.is_none() {
            let builder = ColBERT::from(&self.model_id).with_device(default_device());
            let colbert = ColBERT::try_from(builder).map_err(|e| {
                Error::ModelUnavailable(format!("{}: {e}", self.model_id))
            })?;
            self.model = Some(colbert);
        }

        self.model
            .as_mut()
            .ok_or_else(|| Error::ModelUnavailable(self.model_id.clone()))
    }

    /// Encode document texts into one pooled vector each.
    ///
    /// ColBERT yields one embedding per token; tokens are mean-pooled and the
    /// result L2-normalised. All-zero rows (padding added to equalise batch
    /// lengths) are excluded so a text pools to the same vector whatever it
    /// is batched with.
    pub fn encode_pooled(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.ensure_loaded()?;
        let embeddings: Tensor = model
            .encode(texts, false)
            .map_err(|e| Error::Embedding(e.to_string()))?;

        let (batch, _tokens, _dimension) = embeddings.dims3()?;
        let mut pooled = Vec::with_capacity(batch);
        for i in 0..batch {
            let rows: Vec<Vec<f32>> = embeddings.get(i)?.to_vec2()?;
            pooled.push(mean_pool(&rows));
        }
        Ok(pooled)
    }
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("model_id", &self.model_id)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

fn mean_pool(rows: &[Vec<f32>]) -> Vec<f32> {
    let dimension = rows.first().map_or(0, Vec::len);
    let mut sum = vec![0.0f32; dimension];
    let mut count = 0usize;

    for row in rows {
        if row.iter().all(|x| *x == 0.0) {
            continue;
        }
        for (acc, x) in sum.iter_mut().zip(row) {
            *acc += x;
        }
        count += 1;
    }

    if count > 0 {
        for acc in &mut sum {
            *acc /= count as f32;
        }
    }
    crate::embedding::l2_normalize(&mut sum);
    sum
}
