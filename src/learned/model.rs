//! Learned-index state shared between the read path and the training path.
//!
//! The read path only ever asks two questions: is a trained model valid for
//! this file, and what position range does it predict for a key. Training
//! and registration belong to the write and compaction paths, which own a
//! `ModelRegistry` and hand the read path a shared reference.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::meta::FileMeta;

use super::plr::{PlrModel, Point};

/// Maps a user key to the model's input coordinate: the first eight key
/// bytes, big-endian, zero-padded on the right. Order-preserving for keys
/// that differ within their first eight bytes; keys that collide are caught
/// at training time, never at read time.
pub fn key_code(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = key.len().min(8);
    buf[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(buf)
}

/// A trained model bound to one incarnation of a table file.
#[derive(Debug, Clone)]
pub struct FileModel {
    pub file_number: u64,
    /// Version the model was trained at. A model never serves reads at a
    /// different version.
    pub version: u64,
    /// Entry count of the file the model was trained on.
    pub entry_count: u64,
    pub model: PlrModel,
}

impl FileModel {
    /// Trains a model from a file's keys in entry order. Key-code
    /// collisions surface as a non-ascending training input error.
    pub fn train(
        meta: &FileMeta,
        version: u64,
        gamma: f64,
        keys: impl IntoIterator<Item = Vec<u8>>,
    ) -> Result<FileModel> {
        let points: Vec<Point> = keys
            .into_iter()
            .enumerate()
            .map(|(position, key)| Point {
                x: key_code(&key) as f64,
                y: position as f64,
            })
            .collect();
        let model = PlrModel::train(gamma, &points)?;
        Ok(FileModel {
            file_number: meta.number,
            version,
            entry_count: points.len() as u64,
            model,
        })
    }
}

/// Read-side interface to per-file learned-index state.
pub trait LearnedIndexRegistry: Send + Sync {
    /// Whether a model trained at `version` covers this file.
    fn learned(&self, version: u64, meta: &FileMeta) -> bool;

    /// Inclusive position bounds for `user_key` in `file_number`. If the
    /// key is present in the file, its true position lies within the
    /// returned range.
    fn get_position(&self, user_key: &[u8], file_number: u64) -> Option<(u64, u64)>;
}

/// Process-wide registry mapping file numbers to trained models. Written
/// rarely (by compaction), read on every learned lookup.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<u64, Arc<FileModel>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, model: FileModel) {
        self.models
            .write()
            .unwrap()
            .insert(model.file_number, Arc::new(model));
    }

    pub fn remove(&self, file_number: u64) {
        self.models.write().unwrap().remove(&file_number);
    }

    pub fn get(&self, file_number: u64) -> Option<Arc<FileModel>> {
        self.models.read().unwrap().get(&file_number).cloned()
    }
}

impl LearnedIndexRegistry for ModelRegistry {
    fn learned(&self, version: u64, meta: &FileMeta) -> bool {
        match self.get(meta.number) {
            Some(model) => model.version == version && model.entry_count == meta.entry_count,
            None => false,
        }
    }

    fn get_position(&self, user_key: &[u8], file_number: u64) -> Option<(u64, u64)> {
        let model = self.get(file_number)?;
        model
            .model
            .position_range(key_code(user_key) as f64, model.entry_count)
    }
}
