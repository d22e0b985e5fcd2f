//! HNSW Vector Index (optional)
//!
//! USearch-backed approximate nearest neighbor index for the memory store's
//! KNN candidate search. String keys map to internal u64 ids so callers work
//! with note ids directly.

use std::collections::HashMap;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

/// Embedding dimensions expected by the index
pub const DEFAULT_DIMENSIONS: usize = 256;

/// HNSW connectivity parameter
const DEFAULT_CONNECTIVITY: usize = 16;

/// Vector search error types
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorSearchError {
    /// Failed to create the index
    #[error("Index creation failed: {0}")]
    IndexCreation(String),
    /// Failed to add a vector
    #[error("Failed to add vector: {0}")]
    IndexAdd(String),
    /// Failed to search
    #[error("Search failed: {0}")]
    IndexSearch(String),
    /// Dimension mismatch
    #[error("Invalid dimensions: expected {0}, got {1}")]
    InvalidDimensions(usize, usize),
}

/// HNSW vector index with string keys
pub struct VectorIndex {
    index: Index,
    dimensions: usize,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

impl VectorIndex {
    /// Create an empty index with the default dimensionality.
    pub fn new() -> Result<Self, VectorSearchError> {
        Self::with_dimensions(DEFAULT_DIMENSIONS)
    }

    /// Create an empty index with the given dimensionality.
    pub fn with_dimensions(dimensions: usize) -> Result<Self, VectorSearchError> {
        let options = IndexOptions {
            dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::I8,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        let index =
            Index::new(&options).map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;
        Ok(Self {
            index,
            dimensions,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    /// Number of vectors in the index.
    pub fn len(&self) -> usize {
        self.index.size()
    }

    /// True when no vectors have been added.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add or replace a vector under a string key.
    pub fn add(&mut self, key: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        if vector.len() != self.dimensions {
            return Err(VectorSearchError::InvalidDimensions(
                self.dimensions,
                vector.len(),
            ));
        }

        if let Some(&existing) = self.key_to_id.get(key) {
            self.index
                .remove(existing)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            self.reserve_for_one()?;
            return self
                .index
                .add(existing, vector)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()));
        }

        self.reserve_for_one()?;
        let id = self.next_id;
        self.next_id += 1;
        self.index
            .add(id, vector)
            .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        Ok(())
    }

    /// Remove a key from the index, if present.
    pub fn remove(&mut self, key: &str) -> Result<(), VectorSearchError> {
        if let Some(id) = self.key_to_id.remove(key) {
            self.id_to_key.remove(&id);
            self.index
                .remove(id)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
        }
        Ok(())
    }

    /// K nearest neighbors as `(key, similarity)` pairs, best first.
    ///
    /// USearch returns cosine distance; similarity is `1 - distance`.
    pub fn search(
        &self,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>, VectorSearchError> {
        if vector.len() != self.dimensions {
            return Err(VectorSearchError::InvalidDimensions(
                self.dimensions,
                vector.len(),
            ));
        }
        let matches = self
            .index
            .search(vector, top_k)
            .map_err(|e| VectorSearchError::IndexSearch(e.to_string()))?;

        let mut results = Vec::with_capacity(matches.keys.len());
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            if let Some(name) = self.id_to_key.get(key) {
                results.push((name.clone(), 1.0 - distance));
            }
        }
        Ok(results)
    }

    // usearch segfaults if add() outruns reserved capacity
    fn reserve_for_one(&self) -> Result<(), VectorSearchError> {
        let capacity = self.index.capacity();
        let size = self.index.size();
        if size >= capacity {
            let new_capacity = std::cmp::max(capacity * 2, 16);
            self.index
                .reserve(new_capacity)
                .map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_search_remove() {
        let mut index = VectorIndex::with_dimensions(4).unwrap();
        index.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(results[0].0, "a");
        assert!(results[0].1 > results[1].1);

        index.remove("a").unwrap();
        let results = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert!(results.iter().all(|(k, _)| k != "a"));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = VectorIndex::with_dimensions(4).unwrap();
        assert!(matches!(
            index.add("a", &[1.0, 0.0]),
            Err(VectorSearchError::InvalidDimensions(4, 2))
        ));
    }
}
