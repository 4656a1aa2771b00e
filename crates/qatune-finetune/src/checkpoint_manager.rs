//! Rolling checkpoint retention and best-model tracking

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use qatune_model::{save_checkpoint, CheckpointMetadata, Seq2Seq};

/// Manages a directory of rolling checkpoints
///
/// Keeps at most `max_checkpoints` on disk, deleting the oldest first. The
/// checkpoint holding the best evaluation loss is pinned and never pruned.
pub struct CheckpointManager {
    checkpoints_dir: PathBuf,
    max_checkpoints: usize,
    saved: VecDeque<PathBuf>,
    best: Option<(f32, PathBuf)>,
}

impl CheckpointManager {
    /// Create a manager, creating the checkpoint directory if needed
    ///
    /// # Errors
    /// Returns an error if `max_checkpoints` is zero or the directory cannot
    /// be created.
    pub fn new<P: AsRef<Path>>(checkpoints_dir: P, max_checkpoints: usize) -> Result<Self> {
        if max_checkpoints == 0 {
            anyhow::bail!("Checkpoint limit must be at least 1");
        }

        let checkpoints_dir = checkpoints_dir.as_ref().to_path_buf();
        fs::create_dir_all(&checkpoints_dir).with_context(|| {
            format!(
                "Failed to create checkpoints directory: {}",
                checkpoints_dir.display()
            )
        })?;

        Ok(Self {
            checkpoints_dir,
            max_checkpoints,
            saved: VecDeque::new(),
            best: None,
        })
    }

    /// Save a checkpoint under `name`, pruning old ones past the limit
    ///
    /// # Returns
    /// The checkpoint path stem (extension-less; `.safetensors` and `.json`
    /// siblings exist on disk).
    pub fn save(
        &mut self,
        model: &Seq2Seq,
        name: &str,
        metadata: Option<CheckpointMetadata>,
    ) -> Result<PathBuf> {
        let path = self.checkpoints_dir.join(name);
        save_checkpoint(model, &path, metadata)
            .with_context(|| format!("Failed to save checkpoint: {}", path.display()))?;

        // Re-saving an existing name must not duplicate the retention entry
        if !self.saved.contains(&path) {
            self.saved.push_back(path.clone());
        }
        self.prune()?;

        Ok(path)
    }

    /// Record a checkpoint as the best seen if its eval loss improves
    ///
    /// # Returns
    /// `true` if the checkpoint became the new best.
    pub fn record_best(&mut self, eval_loss: f32, path: &Path) -> bool {
        match self.best {
            Some((best_loss, _)) if eval_loss >= best_loss => false,
            _ => {
                self.best = Some((eval_loss, path.to_path_buf()));
                true
            }
        }
    }

    /// Best checkpoint so far, if any epoch has been evaluated
    pub fn best(&self) -> Option<(f32, &Path)> {
        self.best.as_ref().map(|(loss, path)| (*loss, path.as_path()))
    }

    /// Number of checkpoints currently retained
    pub fn retained(&self) -> usize {
        self.saved.len()
    }

    /// Delete oldest checkpoints beyond the limit, skipping the pinned best
    fn prune(&mut self) -> Result<()> {
        while self.saved.len() > self.max_checkpoints {
            let is_best = |p: &PathBuf| {
                self.best
                    .as_ref()
                    .map(|(_, best)| best == p)
                    .unwrap_or(false)
            };

            let victim_idx = (0..self.saved.len()).find(|&i| !is_best(&self.saved[i]));
            let Some(idx) = victim_idx else {
                break;
            };
            let victim = self.saved.remove(idx).unwrap_or_default();

            for ext in ["safetensors", "json"] {
                let file = victim.with_extension(ext);
                if file.exists() {
                    fs::remove_file(&file).with_context(|| {
                        format!("Failed to delete old checkpoint file: {}", file.display())
                    })?;
                }
            }
        }
        Ok(())
    }
}
