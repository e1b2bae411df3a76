// ============================================================================
// CONFIGURATION
// ============================================================================

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DcrnnError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Laplacian,
    RandomWalk,
    DualRandomWalk,
}

impl FilterType {
    pub fn abbr(self) -> &'static str {
        match self {
            FilterType::Laplacian => "L",
            FilterType::RandomWalk => "R",
            FilterType::DualRandomWalk => "DR",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub batch_size: usize,
    pub val_batch_size: usize,
    pub test_batch_size: usize,
    pub dataset_dir: PathBuf,
    /// Directory holding `{year}_adj.json` files.
    pub graph_pkl_filename: PathBuf,
    pub begin_year: u32,
    pub end_year: u32,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            batch_size: 64,
            val_batch_size: 64,
            test_batch_size: 64,
            dataset_dir: PathBuf::from("data"),
            graph_pkl_filename: PathBuf::from("data/graph"),
            begin_year: 2011,
            end_year: 2017,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub cl_decay_steps: f32,
    pub filter_type: FilterType,
    pub horizon: usize,
    pub input_dim: usize,
    pub output_dim: usize,
    pub max_diffusion_step: usize,
    pub num_rnn_layers: usize,
    pub rnn_units: usize,
    pub seq_len: usize,
    pub use_curriculum_learning: bool,
    pub use_gc_for_ru: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            cl_decay_steps: 2000.0,
            filter_type: FilterType::DualRandomWalk,
            horizon: 12,
            input_dim: 1,
            output_dim: 1,
            max_diffusion_step: 2,
            num_rnn_layers: 2,
            rnn_units: 64,
            seq_len: 12,
            use_curriculum_learning: false,
            use_gc_for_ru: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub base_lr: f32,
    /// Epoch to resume from within the current year; 0 starts fresh.
    pub epoch: usize,
    pub epochs: usize,
    pub epsilon: f32,
    pub lr_decay_ratio: f32,
    pub max_grad_norm: f32,
    pub patience: usize,
    pub steps: Vec<usize>,
    pub test_every_n_epochs: usize,
    pub log_every: usize,
    pub save_model: bool,
    pub log_dir: Option<PathBuf>,
    pub model_dir: PathBuf,
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            base_lr: 0.01,
            epoch: 0,
            epochs: 100,
            epsilon: 1e-8,
            lr_decay_ratio: 0.1,
            max_grad_norm: 1.0,
            patience: 50,
            steps: vec![20, 30, 40, 50],
            test_every_n_epochs: 10,
            log_every: 1,
            save_model: true,
            log_dir: None,
            model_dir: PathBuf::from("models"),
            seed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub base_dir: PathBuf,
    pub log_level: String,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub train: TrainConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            base_dir: PathBuf::from("logs"),
            log_level: "info".to_string(),
            data: DataConfig::default(),
            model: ModelConfig::default(),
            train: TrainConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| DcrnnError::io(path, e))?;
        let config: SupervisorConfig = serde_json::from_str(&text).map_err(|e| DcrnnError::json(path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `section.key=value` overrides. Values are parsed as JSON first and
    /// fall back to plain strings.
    pub fn with_overrides(self, overrides: &[(String, String)]) -> Result<Self> {
        if overrides.is_empty() { return Ok(self); }
        let mut tree = serde_json::to_value(&self)
            .map_err(|e| DcrnnError::Config(format!("cannot serialize config: {}", e)))?;
        for (key, raw) in overrides {
            let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            let parts: Vec<&str> = key.split('.').collect();
            let (last, sections) = parts.split_last()
                .ok_or_else(|| DcrnnError::Config("empty override key".into()))?;
            let mut cursor = &mut tree;
            for part in sections {
                cursor = cursor.get_mut(*part)
                    .ok_or_else(|| DcrnnError::Config(format!("unknown config section in '{}'", key)))?;
            }
            let obj = cursor.as_object_mut()
                .ok_or_else(|| DcrnnError::Config(format!("'{}' is not inside a config section", key)))?;
            if !obj.contains_key(*last) {
                return Err(DcrnnError::Config(format!("unknown config key '{}'", key)));
            }
            obj.insert((*last).to_string(), value);
        }
        let config: SupervisorConfig = serde_json::from_value(tree)
            .map_err(|e| DcrnnError::Config(format!("bad override: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        let d = &self.data;
        let t = &self.train;
        let positive = [
            ("model.horizon", m.horizon),
            ("model.seq_len", m.seq_len),
            ("model.input_dim", m.input_dim),
            ("model.output_dim", m.output_dim),
            ("model.rnn_units", m.rnn_units),
            ("model.num_rnn_layers", m.num_rnn_layers),
            ("data.batch_size", d.batch_size),
            ("data.val_batch_size", d.val_batch_size),
            ("data.test_batch_size", d.test_batch_size),
            ("train.log_every", t.log_every),
            ("train.test_every_n_epochs", t.test_every_n_epochs),
        ];
        for (name, v) in positive {
            if v == 0 {
                return Err(DcrnnError::Config(format!("{} must be positive", name)));
            }
        }
        if d.begin_year > d.end_year {
            return Err(DcrnnError::Config(format!(
                "begin_year {} is after end_year {}", d.begin_year, d.end_year)));
        }
        if m.cl_decay_steps <= 0.0 {
            return Err(DcrnnError::Config("model.cl_decay_steps must be positive".into()));
        }
        if t.base_lr <= 0.0 {
            return Err(DcrnnError::Config("train.base_lr must be positive".into()));
        }
        Ok(())
    }

    /// Run id in the form `dcrnn_DR_2_h_12_64-64_lr_0.01_bs_64_1019074512/`.
    pub fn run_id(&self, timestamp: &str) -> String {
        let m = &self.model;
        let structure = vec![m.rnn_units.to_string(); m.num_rnn_layers].join("-");
        format!("dcrnn_{}_{}_h_{}_{}_lr_{}_bs_{}_{}/",
            m.filter_type.abbr(), m.max_diffusion_step, m.horizon,
            structure, self.train.base_lr, self.data.batch_size, timestamp)
    }

    /// `train.log_dir` when set, otherwise a fresh run directory under `base_dir`.
    /// The directory is created.
    pub fn resolve_log_dir(&self) -> Result<PathBuf> {
        let dir = match &self.train.log_dir {
            Some(d) => d.clone(),
            None => {
                let stamp = chrono::Local::now().format("%m%d%H%M%S").to_string();
                self.base_dir.join(self.run_id(&stamp))
            }
        };
        fs::create_dir_all(&dir).map_err(|e| DcrnnError::io(&dir, e))?;
        Ok(dir)
    }
}

// ============================================================================
// COMMAND LINE
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CliArgs {
    pub config_filename: Option<PathBuf>,
    pub use_cpu_only: bool,
    pub overrides: Vec<(String, String)>,
}

impl CliArgs {
    pub fn from_args() -> Self {
        Self::parse(env::args().skip(1))
    }

    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Self {
        let mut cli = CliArgs::default();
        for arg in args {
            let arg = arg.trim_start_matches("--");
            if let Some((key, value)) = arg.split_once('=') {
                match key {
                    "config_filename" => cli.config_filename = Some(PathBuf::from(value)),
                    "use_cpu_only" => cli.use_cpu_only = value == "true",
                    k if k.contains('.') => cli.overrides.push((k.to_string(), value.to_string())),
                    _ => {}
                }
            }
        }
        cli
    }
}
