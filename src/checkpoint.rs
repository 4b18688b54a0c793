use std::{
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, AppResult},
    model::ClassifiedComment,
};

/// Bumped whenever the persisted shape or label semantics change, so a stale
/// file can never silently resume an incompatible run.
const CHECKPOINT_FORMAT_VERSION: u32 = 1;

pub fn run_tag(model_id: &str) -> String {
    format!("{model_id}/v{CHECKPOINT_FORMAT_VERSION}")
}

/// Durable `{id -> result}` map for idempotent resume. Insertion order is the
/// processing order, which keeps resumed output stable.
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    run_tag: String,
    results: IndexMap<u64, ClassifiedComment>,
}

impl Checkpoint {
    pub fn new(run_tag: String) -> Self {
        Self {
            run_tag,
            results: IndexMap::new(),
        }
    }

    /// Loads an existing checkpoint. Absent file means a fresh run; a file
    /// with a different run tag is an error, not a silent restart.
    pub fn load(path: &Path, expected_tag: &str) -> AppResult<Self> {
        if !path.exists() {
            return Ok(Self::new(expected_tag.to_string()));
        }

        let raw = fs::read_to_string(path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&raw)
            .map_err(|e| AppError::Checkpoint(format!("unreadable checkpoint: {e}")))?;

        if checkpoint.run_tag != expected_tag {
            return Err(AppError::Checkpoint(format!(
                "checkpoint run tag '{}' does not match '{}'; delete it to start over",
                checkpoint.run_tag, expected_tag
            )));
        }

        Ok(checkpoint)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.results.contains_key(&id)
    }

    pub fn insert(&mut self, result: ClassifiedComment) {
        self.results.insert(result.id, result);
    }

    pub fn get(&self, id: u64) -> Option<&ClassifiedComment> {
        self.results.get(&id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn results(&self) -> impl Iterator<Item = &ClassifiedComment> {
        self.results.values()
    }

    /// Atomic write: temp file in the same directory, then rename, so a crash
    /// mid-flush never leaves a half-written checkpoint behind.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp: PathBuf = {
            let mut name = path.as_os_str().to_owned();
            name.push(".tmp");
            PathBuf::from(name)
        };

        let json = serde_json::to_string(self)
            .map_err(|e| AppError::Checkpoint(format!("serialize failed: {e}")))?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DecodeStatus, Label};

    fn result(id: u64, label: Label) -> ClassifiedComment {
        ClassifiedComment {
            id,
            label,
            confidence: 0.9,
            ambiguous: false,
            decode_status: DecodeStatus::Strict,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("stanceclerk-{name}-{}.json", std::process::id()))
    }

    #[test]
    fn test_save_load_round_trip() {
        let path = temp_path("roundtrip");
        let tag = run_tag("stance-classifier-1");

        let mut checkpoint = Checkpoint::new(tag.clone());
        checkpoint.insert(result(1, Label::Anti));
        checkpoint.insert(result(2, Label::Unrelated));
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path, &tag).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(1));
        assert_eq!(loaded.get(2).unwrap().label, Label::Unrelated);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_file_starts_fresh() {
        let loaded = Checkpoint::load(Path::new("/nonexistent/checkpoint.json"), "tag").unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_mismatched_run_tag_is_rejected() {
        let path = temp_path("tag-mismatch");

        let checkpoint = Checkpoint::new(run_tag("model-a"));
        checkpoint.save(&path).unwrap();

        let err = Checkpoint::load(&path, &run_tag("model-b")).unwrap_err();
        assert!(matches!(err, AppError::Checkpoint(_)));

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reinsert_overwrites_in_place() {
        let mut checkpoint = Checkpoint::new("tag".into());
        checkpoint.insert(result(7, Label::Pro));
        checkpoint.insert(result(7, Label::Anti));

        assert_eq!(checkpoint.len(), 1);
        assert_eq!(checkpoint.get(7).unwrap().label, Label::Anti);
    }
}
