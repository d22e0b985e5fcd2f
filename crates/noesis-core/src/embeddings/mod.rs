//! Local Semantic Embeddings (optional)
//!
//! fastembed-backed local inference behind the `embeddings` feature. The
//! model loads once per process; callers share it through [`EmbeddingService`].
//! Vectors are truncated to the first [`EMBEDDING_DIMENSIONS`] components
//! (Matryoshka representation — the first N dims are the N-dim embedding).

use std::sync::{Mutex, OnceLock};

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

/// Embedding dimensions after Matryoshka truncation
pub const EMBEDDING_DIMENSIONS: usize = 256;

/// Maximum text length submitted to the model
pub const MAX_TEXT_LENGTH: usize = 8192;

/// Embedding error types
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    /// Failed to initialize the embedding model
    #[error("Model initialization failed: {0}")]
    ModelInit(String),
    /// Failed to generate an embedding
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),
    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

static EMBEDDING_MODEL: OnceLock<Result<Mutex<TextEmbedding>, String>> = OnceLock::new();

fn cache_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("FASTEMBED_CACHE_PATH") {
        return std::path::PathBuf::from(path);
    }
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "noesis", "core") {
        return proj_dirs.cache_dir().join("fastembed");
    }
    std::path::PathBuf::from(".fastembed_cache")
}

fn model() -> Result<std::sync::MutexGuard<'static, TextEmbedding>, EmbeddingError> {
    let result = EMBEDDING_MODEL.get_or_init(|| {
        let cache = cache_dir();
        if let Err(e) = std::fs::create_dir_all(&cache) {
            tracing::warn!("Failed to create embedding cache dir {:?}: {}", cache, e);
        }
        let options = InitOptions::new(EmbeddingModel::NomicEmbedTextV15)
            .with_show_download_progress(false)
            .with_cache_dir(cache);
        TextEmbedding::try_new(options)
            .map(Mutex::new)
            .map_err(|e| format!("Failed to initialize embedding model: {}", e))
    });

    match result {
        Ok(m) => m
            .lock()
            .map_err(|e| EmbeddingError::ModelInit(format!("Lock poisoned: {}", e))),
        Err(e) => Err(EmbeddingError::ModelInit(e.clone())),
    }
}

/// Shared handle to the process-wide embedding model.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingService;

impl EmbeddingService {
    /// Create the service handle (the model itself loads lazily).
    pub fn new() -> Self {
        Self
    }

    /// Embed a single text, truncated to [`EMBEDDING_DIMENSIONS`] components.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".into()));
        }
        let clipped = if text.len() > MAX_TEXT_LENGTH {
            &text[..MAX_TEXT_LENGTH]
        } else {
            text
        };
        let mut guard = model()?;
        let mut vectors = guard
            .embed(vec![clipped], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;
        let mut vector = vectors
            .pop()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("empty batch result".into()))?;
        vector.truncate(EMBEDDING_DIMENSIONS);
        Ok(vector)
    }
}

/// Serialize an embedding to little-endian bytes for SQLite storage.
pub fn embedding_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Deserialize an embedding from the stored byte form.
pub fn embedding_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_byte_roundtrip() {
        let vector = vec![0.5f32, -1.25, 3.0];
        let bytes = embedding_to_bytes(&vector);
        assert_eq!(embedding_from_bytes(&bytes), Some(vector));
        assert_eq!(embedding_from_bytes(&[1, 2, 3]), None);
    }
}
