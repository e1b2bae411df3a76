// ============================================================================
// SUPERVISOR: training, evaluation and checkpoint lifecycle for one year
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::autodiff::{Graph, TID};
use crate::checkpoint::{checkpoint_path, latest_checkpoint, year_dir, Checkpoint};
use crate::config::SupervisorConfig;
use crate::data::{load_dataset, Batch, Split, YearData};
use crate::error::{DcrnnError, Result};
use crate::loss::{masked_mae_loss, masked_mae_np, masked_mape_np, masked_rmse_np};
use crate::model::DcrnnModel;
use crate::optim::{clip_grad_norm, Adam, MultiStepLr, ParamSet};
use crate::results::{Metric, YearlyResults, HORIZONS};
use crate::scalars::ScalarWriter;
use crate::supports::Adjacency;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Ran every epoch up to `train.epochs`.
    Completed,
    EarlyStopped { epoch: usize },
}

#[derive(Clone, Debug)]
pub struct TrainSummary {
    pub best_val_loss: f32,
    pub epochs_run: usize,
    pub stop_reason: StopReason,
    pub batches_seen: usize,
    pub best_checkpoint: Option<PathBuf>,
}

/// Mean loss over a split plus per-step predictions and ground truth. Entry `t`
/// of either vector stacks every sample's `num_nodes * output_dim` values.
pub struct Evaluation {
    pub loss: f32,
    pub predictions: Vec<Vec<f32>>,
    pub truths: Vec<Vec<f32>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Improved,
    Waiting,
    Stop,
}

/// Patience counter over validation losses.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    pub min_val_loss: f32,
    wait: usize,
    patience: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        EarlyStopping { min_val_loss: f32::INFINITY, wait: 0, patience }
    }

    pub fn update(&mut self, val_loss: f32) -> Progress {
        if val_loss < self.min_val_loss {
            self.wait = 0;
            self.min_val_loss = val_loss;
            return Progress::Improved;
        }
        self.wait += 1;
        if self.wait == self.patience { Progress::Stop } else { Progress::Waiting }
    }
}

/// Time-major tensors for one batch: encoder inputs, label constants for
/// curriculum feeding, and the flat label buffer matching the stacked outputs.
struct PreparedBatch {
    inputs: Vec<TID>,
    labels: Vec<TID>,
    flat_labels: Vec<f32>,
}

pub struct DcrnnSupervisor {
    config: SupervisorConfig,
    year: u32,
    log_dir: PathBuf,
    num_nodes: usize,
    graph: Graph,
    model: DcrnnModel,
    params: ParamSet,
    data: YearData,
    scalars: ScalarWriter,
    results: YearlyResults,
    rng: StdRng,
}

impl DcrnnSupervisor {
    pub fn new(adj: &Adjacency, year: u32, config: &SupervisorConfig) -> Result<Self> {
        config.validate()?;
        let log_dir = config.resolve_log_dir()?;
        info!("[{}] log dir: {}", year, log_dir.display());

        let num_nodes = adj.num_nodes();
        let m = &config.model;
        let data = load_dataset(&config.data, year, m.input_dim, m.output_dim)?;
        data.check(num_nodes, m.seq_len, m.horizon)?;

        let mut rng = match config.train.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(year as u64)),
            None => StdRng::from_entropy(),
        };
        let mut graph = Graph::new();
        let model = DcrnnModel::new(adj, m, &mut graph, &mut rng);
        graph.freeze_params();
        let params = ParamSet::new(model.param_ids(), &graph);
        info!("[{}] model: {} nodes, {} supports ({:?}), {} parameters",
            year, num_nodes, model.num_supports(), m.filter_type, params.total_params(&graph));

        let scalars = ScalarWriter::open(&log_dir, year)?;
        let mut sup = DcrnnSupervisor {
            config: config.clone(),
            year,
            log_dir,
            num_nodes,
            graph,
            model,
            params,
            data,
            scalars,
            results: YearlyResults::new(),
            rng,
        };

        if year > config.data.begin_year {
            sup.load_best_model()?;
        }
        if config.train.epoch > 0 {
            sup.load_model()?;
        }
        Ok(sup)
    }

    pub fn year(&self) -> u32 { self.year }
    pub fn num_nodes(&self) -> usize { self.num_nodes }
    pub fn log_dir(&self) -> &Path { &self.log_dir }
    pub fn results(&self) -> &YearlyResults { &self.results }
    pub fn model(&self) -> &DcrnnModel { &self.model }
    pub fn graph(&self) -> &Graph { &self.graph }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub fn save_model(&self, epoch: usize) -> Result<PathBuf> {
        let path = checkpoint_path(&self.config.train.model_dir, self.year, epoch);
        Checkpoint::capture(&self.model, &self.graph, &self.config, self.year, epoch).save(&path)?;
        debug!("[{}] saved model at epoch {} to {}", self.year, epoch, path.display());
        Ok(path)
    }

    /// Resumes this year from `train.epoch`.
    pub fn load_model(&mut self) -> Result<()> {
        let epoch = self.config.train.epoch;
        let path = checkpoint_path(&self.config.train.model_dir, self.year, epoch);
        if !path.exists() {
            return Err(DcrnnError::MissingCheckpoint(format!(
                "weights at epoch {} not found: {}", epoch, path.display())));
        }
        Checkpoint::load(&path)?.restore_into(&self.model, &mut self.graph)?;
        info!("[{}] loaded model at epoch {}", self.year, epoch);
        Ok(())
    }

    /// Loads the best checkpoint of the previous year into this year's model.
    pub fn load_best_model(&mut self) -> Result<()> {
        let prev = self.year - 1;
        let dir = year_dir(&self.config.train.model_dir, prev);
        let (epoch, path) = latest_checkpoint(&dir)?;
        Checkpoint::load(&path)?.restore_into(&self.model, &mut self.graph)?;
        info!("[{}] transferred weights from year {} epoch {} ({})", self.year, prev, epoch, path.display());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batches and loss
    // ------------------------------------------------------------------

    fn prepare_data(&mut self, batch: &Batch) -> PreparedBatch {
        let m = self.model.config();
        let (input_dim, output_dim) = (m.input_dim, m.output_dim);
        let rows = batch.batch_size * self.num_nodes;
        let inputs = batch.inputs_time_major(input_dim).into_iter()
            .map(|x| self.graph.constant(x, rows, input_dim))
            .collect();
        let steps = batch.labels_time_major(output_dim);
        let flat_labels: Vec<f32> = steps.concat();
        let labels = steps.into_iter()
            .map(|y| self.graph.constant(y, rows, output_dim))
            .collect();
        PreparedBatch { inputs, labels, flat_labels }
    }

    fn compute_loss(&mut self, outputs: &[TID], labels: &[f32]) -> TID {
        masked_mae_loss(&mut self.graph, outputs, labels)
    }

    fn train_step(&mut self, batch: &Batch, batches_seen: usize, opt: &mut Adam) -> f32 {
        self.graph.zero_grad();
        let prep = self.prepare_data(batch);
        let outputs = self.model.forward(&prep.inputs, Some(&prep.labels), batches_seen,
                                         &mut self.graph, &mut self.rng);
        let loss = self.compute_loss(&outputs, &prep.flat_labels);
        let value = self.graph.data(loss)[0];
        self.graph.backward(loss);
        clip_grad_norm(&mut self.graph, &self.params.ids, self.config.train.max_grad_norm);
        opt.step(&mut self.graph, &mut self.params);
        self.graph.reset();
        value
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    pub fn evaluate(&mut self, split: Split, batches_seen: usize) -> Result<Evaluation> {
        let batches: Vec<Batch> = self.data.loader(split).iter(&mut self.rng).collect();
        let horizon = self.model.config().horizon;
        let mut predictions = vec![Vec::new(); horizon];
        let mut truths = vec![Vec::new(); horizon];
        let mut losses = Vec::with_capacity(batches.len());

        for batch in &batches {
            let prep = self.prepare_data(batch);
            let outputs = self.model.forward(&prep.inputs, None, batches_seen, &mut self.graph, &mut self.rng);
            let loss = self.compute_loss(&outputs, &prep.flat_labels);
            losses.push(self.graph.data(loss)[0]);
            let step_len = prep.flat_labels.len() / horizon;
            for (t, &out) in outputs.iter().enumerate() {
                predictions[t].extend_from_slice(self.graph.data(out));
                truths[t].extend_from_slice(&prep.flat_labels[t * step_len..(t + 1) * step_len]);
            }
            self.graph.reset();
        }

        let loss = losses.iter().sum::<f32>() / losses.len().max(1) as f32;
        self.scalars.add_scalar(&format!("loss/{}", split.name()), loss, batches_seen)?;
        Ok(Evaluation { loss, predictions, truths })
    }

    /// Masked MAE / RMSE / MAPE over the first `h` steps for each reported
    /// horizon. Returns the MAE of the longest one.
    pub fn metric(&mut self, truths: &[Vec<f32>], predictions: &[Vec<f32>]) -> f32 {
        let horizon = predictions.len();
        let mut horizons: Vec<usize> = HORIZONS.iter().map(|&h| h.min(horizon)).collect();
        horizons.dedup();
        let mut mae = 0.0;
        for h in horizons {
            let pred = predictions[..h].concat();
            let truth = truths[..h].concat();
            mae = masked_mae_np(&pred, &truth, 0.0);
            let rmse = masked_rmse_np(&pred, &truth, 0.0);
            let mape = masked_mape_np(&pred, &truth, 0.0);
            info!("[{}] T:{} MAE: {:.4} RMSE: {:.4} MAPE: {:.4}", self.year, h, mae, rmse, mape);
            self.results.record(h, Metric::Mae, self.year, mae);
            self.results.record(h, Metric::Rmse, self.year, rmse);
            self.results.record(h, Metric::Mape, self.year, mape);
        }
        mae
    }

    pub fn test_model(&mut self, split: Split, batches_seen: usize) -> Result<f32> {
        let eval = self.evaluate(split, batches_seen)?;
        Ok(self.metric(&eval.truths, &eval.predictions))
    }

    // ------------------------------------------------------------------
    // Training loop
    // ------------------------------------------------------------------

    pub fn train(&mut self) -> Result<TrainSummary> {
        let tc = self.config.train.clone();
        let year = self.year;
        let start_epoch = tc.epoch;

        let mut opt = Adam::new(tc.base_lr, tc.epsilon);
        let mut sched = MultiStepLr::new(tc.base_lr, &tc.steps, tc.lr_decay_ratio);
        sched.fast_forward(start_epoch);
        opt.lr = sched.last_lr();
        let mut stopper = EarlyStopping::new(tc.patience);

        let num_batches = self.data.train.num_batch();
        let mut batches_seen = num_batches * start_epoch;
        info!("[{}] start training: epochs {}..{}, {} batches per epoch, lr {}",
            year, start_epoch, tc.epochs, num_batches, opt.lr);

        let mut stop_reason = StopReason::Completed;
        let mut best_checkpoint = None;
        let mut epochs_run = 0;
        let mut total_secs = 0.0f64;

        for epoch in start_epoch..tc.epochs {
            let start = Instant::now();
            let batches: Vec<Batch> = self.data.train.iter(&mut self.rng).collect();
            let mut losses = Vec::with_capacity(batches.len());
            for batch in &batches {
                losses.push(self.train_step(batch, batches_seen, &mut opt));
                batches_seen += 1;
            }
            let train_loss = losses.iter().sum::<f32>() / losses.len().max(1) as f32;
            let secs = start.elapsed().as_secs_f64();
            total_secs += secs;
            epochs_run += 1;
            sched.step(&mut opt);

            debug!("[{}] epoch {} complete, evaluating", year, epoch);
            let val_loss = self.evaluate(Split::Val, batches_seen)?.loss;
            self.scalars.add_scalar("loss/train", train_loss, batches_seen)?;

            if epoch % tc.log_every == tc.log_every - 1 {
                info!("[{}] Epoch [{}/{}] ({}) train_mae: {:.4}, val_mae: {:.4}, lr: {:.6}, {:.1}s",
                    year, epoch, tc.epochs, batches_seen, train_loss, val_loss, sched.last_lr(), secs);
            }
            if epoch % tc.test_every_n_epochs == tc.test_every_n_epochs - 1 {
                self.test_model(Split::Test, batches_seen)?;
            }
            if epoch + 1 == tc.epochs {
                info!("[{}] total training time {:.1}s, average {:.2}s per epoch",
                    year, total_secs, total_secs / epochs_run as f64);
            }

            let previous = stopper.min_val_loss;
            match stopper.update(val_loss) {
                Progress::Improved => {
                    if tc.save_model {
                        let path = self.save_model(epoch)?;
                        info!("[{}] val loss decrease from {:.4} to {:.4}, saving to {}",
                            year, previous, val_loss, path.display());
                        best_checkpoint = Some(path);
                    }
                }
                Progress::Waiting => {}
                Progress::Stop => {
                    warn!("[{}] early stopping at epoch: {}", year, epoch);
                    stop_reason = StopReason::EarlyStopped { epoch };
                    break;
                }
            }
        }

        Ok(TrainSummary {
            best_val_loss: stopper.min_val_loss,
            epochs_run,
            stop_reason,
            batches_seen,
            best_checkpoint,
        })
    }
}
