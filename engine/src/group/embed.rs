use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding failed: {0}")]
    Model(String),
}

/// Maps text to unit-length vectors compared by cosine distance. The vector
/// dimension is fixed by the configured model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// FastEmbed-backed embedder. The model is CPU-bound and not `Sync`, so
/// inference runs on the blocking pool behind a mutex.
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedder {
    pub fn new(model_name: &str) -> eyre::Result<Self> {
        let model = match model_name {
            "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
            "all-minilm-l12-v2" => EmbeddingModel::AllMiniLML12V2,
            "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
            other => eyre::bail!("unsupported embedding model `{other}`"),
        };
        tracing::info!(model = model_name, "Initializing embedding model");
        let model = TextEmbedding::try_new(InitOptions::new(model)).map_err(|err| eyre::eyre!(err))?;
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model.clone();
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| EmbedError::Model("embedding model lock poisoned".to_string()))?;
            let embeddings = model
                .embed(texts, None)
                .map_err(|err| EmbedError::Model(err.to_string()))?;
            Ok(embeddings.into_iter().map(unit_normalize).collect())
        })
        .await
        .map_err(|err| EmbedError::Model(err.to_string()))?
    }
}

/// Scales to unit length; a zero vector is returned unchanged rather than
/// divided by zero.
pub fn unit_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

/// `1 - cos(u, v)` for unit vectors.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    1.0 - dot
}
