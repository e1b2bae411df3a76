// ============================================================================
// SCALAR LOG: per-year JSON lines of training curves
// ============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DcrnnError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub value: f32,
    pub step: usize,
    pub wall_time: String,
}

/// Append-only JSON-lines log of `(tag, value, step)` scalars.
pub struct ScalarWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl ScalarWriter {
    pub fn open(log_dir: &Path, year: u32) -> Result<Self> {
        fs::create_dir_all(log_dir).map_err(|e| DcrnnError::io(log_dir, e))?;
        let path = log_dir.join(format!("{}_scalars.jsonl", year));
        let file = OpenOptions::new().create(true).append(true).open(&path)
            .map_err(|e| DcrnnError::io(&path, e))?;
        Ok(ScalarWriter { path, out: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()> {
        let rec = ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
            wall_time: chrono::Utc::now().to_rfc3339(),
        };
        let line = serde_json::to_string(&rec).map_err(|e| DcrnnError::json(&self.path, e))?;
        writeln!(self.out, "{}", line).map_err(|e| DcrnnError::io(&self.path, e))?;
        self.out.flush().map_err(|e| DcrnnError::io(&self.path, e))
    }
}

pub fn read_scalars(path: &Path) -> Result<Vec<ScalarRecord>> {
    let text = fs::read_to_string(path).map_err(|e| DcrnnError::io(path, e))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| DcrnnError::json(path, e)))
        .collect()
}
