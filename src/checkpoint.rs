// ============================================================================
// CHECKPOINT SERIALIZATION
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::autodiff::Graph;
use crate::config::SupervisorConfig;
use crate::error::{DcrnnError, Result};
use crate::model::{DcrnnModel, ParamSpec};

const VERSION: &str = "1.0-bin";

#[derive(Serialize, Deserialize, Clone)]
pub struct Checkpoint {
    pub version: String,
    pub timestamp: String,
    pub year: u32,
    pub epoch: usize,
    pub config: SupervisorConfig,
    pub specs: Vec<ParamSpec>,
    pub param_data: Vec<f32>,
}

impl Checkpoint {
    pub fn capture(model: &DcrnnModel, g: &Graph, config: &SupervisorConfig, year: u32, epoch: usize) -> Self {
        let specs = model.param_specs(g);
        let total: usize = specs.iter().map(ParamSpec::len).sum();
        let mut param_data = Vec::with_capacity(total);
        for t in model.param_ids() { param_data.extend_from_slice(g.data(t)); }
        Checkpoint {
            version: VERSION.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            year,
            epoch,
            config: config.clone(),
            specs,
            param_data,
        }
    }

    /// Copies the stored parameters into `model`. Every tensor must match by name and shape.
    pub fn restore_into(&self, model: &DcrnnModel, g: &mut Graph) -> Result<()> {
        let expected = model.param_specs(g);
        if expected.len() != self.specs.len() {
            return Err(DcrnnError::Shape(format!(
                "checkpoint holds {} tensors, model has {}", self.specs.len(), expected.len())));
        }
        for (want, have) in expected.iter().zip(self.specs.iter()) {
            if want != have {
                return Err(DcrnnError::Shape(format!(
                    "checkpoint tensor {} is {}x{}, model expects {} {}x{}",
                    have.name, have.rows, have.cols, want.name, want.rows, want.cols)));
            }
        }
        let total: usize = expected.iter().map(ParamSpec::len).sum();
        if total != self.param_data.len() {
            return Err(DcrnnError::Shape(format!(
                "checkpoint holds {} values, specs describe {}", self.param_data.len(), total)));
        }
        let mut off = 0;
        for t in model.param_ids() {
            let len = g.data(t).len();
            g.set_data(t, &self.param_data[off..off + len]);
            off += len;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| DcrnnError::io(parent, e))?;
        }
        let bytes = bincode::serialize(self)?;
        fs::write(path, &bytes).map_err(|e| DcrnnError::io(path, e))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DcrnnError::MissingCheckpoint(path.display().to_string()));
        }
        let bytes = fs::read(path).map_err(|e| DcrnnError::io(path, e))?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

pub fn year_dir(model_dir: &Path, year: u32) -> PathBuf {
    model_dir.join(year.to_string())
}

pub fn checkpoint_path(model_dir: &Path, year: u32, epoch: usize) -> PathBuf {
    year_dir(model_dir, year).join(format!("epo{}.bin", epoch))
}

fn parse_epoch(file_name: &str) -> Option<usize> {
    file_name.strip_prefix("epo")?.strip_suffix(".bin")?.parse().ok()
}

/// Checkpoint with the highest epoch in `dir`. Checkpoints are only written on
/// validation improvement, so this is the best model of that run.
pub fn latest_checkpoint(dir: &Path) -> Result<(usize, PathBuf)> {
    let entries = fs::read_dir(dir)
        .map_err(|_| DcrnnError::MissingCheckpoint(format!("no checkpoint directory {}", dir.display())))?;
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| DcrnnError::io(dir, e))?;
        let name = entry.file_name();
        if let Some(epoch) = name.to_str().and_then(parse_epoch) {
            if best.as_ref().map_or(true, |(e, _)| epoch > *e) {
                best = Some((epoch, entry.path()));
            }
        }
    }
    best.ok_or_else(|| DcrnnError::MissingCheckpoint(format!("no checkpoints in {}", dir.display())))
}
