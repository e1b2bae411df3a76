use std::fs;
use std::path::{Path, PathBuf};

use stream_dcrnn::checkpoint::{latest_checkpoint, Checkpoint};
use stream_dcrnn::config::FilterType;
use stream_dcrnn::data::Dataset;
use stream_dcrnn::results::Metric;
use stream_dcrnn::scalars::read_scalars;
use stream_dcrnn::{Adjacency, DcrnnError, DcrnnSupervisor, StopReason, SupervisorConfig};

const SEQ_LEN: usize = 3;
const HORIZON: usize = 2;

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("stream-dcrnn-it-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn ring(n: usize) -> Adjacency {
    let mut dense = vec![0.0; n * n];
    for i in 0..n {
        dense[i * n + (i + 1) % n] = 1.0;
        dense[i * n + (i + n - 1) % n] = 0.5;
    }
    Adjacency::from_dense(dense, n).unwrap()
}

/// Smooth positive series per node so no label is masked out.
fn split(samples: usize, nodes: usize, offset: usize) -> Dataset {
    let value = |s: usize, t: usize, n: usize| {
        let k = (s + offset + t) as f32 * 0.7 + n as f32 * 0.3;
        1.5 + k.sin()
    };
    let mut x = Vec::new();
    let mut y = Vec::new();
    for s in 0..samples {
        for t in 0..SEQ_LEN { for n in 0..nodes { x.push(value(s, t, n)); } }
        for t in 0..HORIZON { for n in 0..nodes { y.push(value(s, SEQ_LEN + t, n)); } }
    }
    Dataset::new(x, y, [samples, SEQ_LEN, nodes, 1], [samples, HORIZON, nodes, 1]).unwrap()
}

fn write_year(dataset_dir: &Path, year: u32, nodes: usize) {
    let dir = dataset_dir.join(year.to_string());
    split(10, nodes, 0).save(&dir.join("train.json")).unwrap();
    split(4, nodes, 20).save(&dir.join("val.json")).unwrap();
    split(4, nodes, 40).save(&dir.join("test.json")).unwrap();
}

fn config(root: &Path) -> SupervisorConfig {
    let mut cfg = SupervisorConfig::default();
    cfg.base_dir = root.join("logs");
    cfg.data.dataset_dir = root.join("data");
    cfg.data.batch_size = 4;
    cfg.data.val_batch_size = 4;
    cfg.data.test_batch_size = 4;
    cfg.data.begin_year = 2011;
    cfg.data.end_year = 2012;
    cfg.model.filter_type = FilterType::DualRandomWalk;
    cfg.model.max_diffusion_step = 1;
    cfg.model.num_rnn_layers = 1;
    cfg.model.rnn_units = 4;
    cfg.model.seq_len = SEQ_LEN;
    cfg.model.horizon = HORIZON;
    cfg.model.use_curriculum_learning = true;
    cfg.model.cl_decay_steps = 10.0;
    cfg.train.epochs = 2;
    cfg.train.test_every_n_epochs = 1;
    cfg.train.model_dir = root.join("models");
    cfg.train.log_dir = Some(root.join("logs").join("run"));
    cfg.train.seed = Some(7);
    cfg
}

fn flat_params(sup: &DcrnnSupervisor) -> Vec<f32> {
    sup.model().param_ids().into_iter().flat_map(|t| sup.graph().data(t).to_vec()).collect()
}

#[test]
fn weights_carry_over_to_a_larger_graph() {
    let root = scratch("transfer");
    write_year(&root.join("data"), 2011, 4);
    write_year(&root.join("data"), 2012, 6);
    let cfg = config(&root);

    let mut first = DcrnnSupervisor::new(&ring(4), 2011, &cfg).unwrap();
    let summary = first.train().unwrap();
    assert_eq!(summary.epochs_run, 2);
    assert_eq!(summary.stop_reason, StopReason::Completed);
    // 10 samples padded to 12, 3 batches per epoch
    assert_eq!(summary.batches_seen, 6);
    assert!(summary.best_val_loss.is_finite());
    assert!(summary.best_checkpoint.is_some());
    assert!(root.join("models/2011/epo0.bin").exists());
    assert!(first.results().get(HORIZON, Metric::Mae, 2011).is_some());

    let scalars = read_scalars(&first.log_dir().join("2011_scalars.jsonl")).unwrap();
    assert_eq!(scalars.iter().filter(|r| r.tag == "loss/train").count(), 2);
    assert_eq!(scalars.iter().filter(|r| r.tag == "loss/val").count(), 2);

    let second = DcrnnSupervisor::new(&ring(6), 2012, &cfg).unwrap();
    assert_eq!(second.num_nodes(), 6);
    let (_, best) = latest_checkpoint(&root.join("models/2011")).unwrap();
    let ckpt = Checkpoint::load(&best).unwrap();
    assert_eq!(ckpt.year, 2011);
    assert_eq!(flat_params(&second), ckpt.param_data);

    let mut second = second;
    let summary = second.train().unwrap();
    assert!(summary.best_val_loss.is_finite());
    assert!(second.results().get(HORIZON, Metric::Rmse, 2012).is_some());

    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn later_year_without_previous_checkpoints_fails() {
    let root = scratch("no-prev");
    write_year(&root.join("data"), 2012, 5);
    let cfg = config(&root);
    let err = DcrnnSupervisor::new(&ring(5), 2012, &cfg).err().unwrap();
    assert!(matches!(err, DcrnnError::MissingCheckpoint(_)));
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn resume_loads_the_requested_epoch() {
    let root = scratch("resume");
    write_year(&root.join("data"), 2011, 4);
    let mut cfg = config(&root);
    cfg.data.end_year = 2011;

    let mut sup = DcrnnSupervisor::new(&ring(4), 2011, &cfg).unwrap();
    let saved = sup.save_model(5).unwrap();
    assert_eq!(saved, root.join("models/2011/epo5.bin"));
    let expected = flat_params(&sup);

    cfg.train.epoch = 5;
    cfg.train.seed = Some(99);
    let resumed = DcrnnSupervisor::new(&ring(4), 2011, &cfg).unwrap();
    assert_eq!(flat_params(&resumed), expected);

    cfg.train.epoch = 6;
    let err = DcrnnSupervisor::new(&ring(4), 2011, &cfg).err().unwrap();
    assert!(matches!(err, DcrnnError::MissingCheckpoint(_)));
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn val_split_with_other_node_count_is_rejected() {
    let root = scratch("val-nodes");
    write_year(&root.join("data"), 2011, 4);
    split(4, 5, 20).save(&root.join("data/2011/val.json")).unwrap();
    let cfg = config(&root);
    let err = DcrnnSupervisor::new(&ring(4), 2011, &cfg).err().unwrap();
    assert!(matches!(err, DcrnnError::Data(_)), "{}", err);
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_split_with_longer_horizon_is_rejected() {
    let root = scratch("test-horizon");
    write_year(&root.join("data"), 2011, 4);
    let nodes = 4;
    let x = vec![1.0; 4 * SEQ_LEN * nodes];
    let y = vec![1.0; 4 * (HORIZON + 1) * nodes];
    Dataset::new(x, y, [4, SEQ_LEN, nodes, 1], [4, HORIZON + 1, nodes, 1]).unwrap()
        .save(&root.join("data/2011/test.json")).unwrap();
    let cfg = config(&root);
    let err = DcrnnSupervisor::new(&ring(4), 2011, &cfg).err().unwrap();
    assert!(matches!(err, DcrnnError::Data(_)), "{}", err);
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn flat_validation_loss_stops_early() {
    let root = scratch("early-stop");
    write_year(&root.join("data"), 2011, 4);
    // all-null labels keep the masked validation loss at exactly 0
    let flat = split(4, 4, 20);
    let zeros = vec![0.0; flat.y.len()];
    Dataset::new(flat.x.clone(), zeros, flat.x_shape, flat.y_shape).unwrap()
        .save(&root.join("data/2011/val.json")).unwrap();
    let mut cfg = config(&root);
    cfg.data.end_year = 2011;
    cfg.train.epochs = 5;
    cfg.train.patience = 1;

    let mut sup = DcrnnSupervisor::new(&ring(4), 2011, &cfg).unwrap();
    let summary = sup.train().unwrap();
    assert_eq!(summary.stop_reason, StopReason::EarlyStopped { epoch: 1 });
    assert_eq!(summary.epochs_run, 2);
    assert_eq!(summary.best_val_loss, 0.0);
    assert!(root.join("models/2011/epo0.bin").exists());
    assert!(!root.join("models/2011/epo1.bin").exists());
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn node_count_mismatch_is_a_data_error() {
    let root = scratch("mismatch");
    write_year(&root.join("data"), 2011, 4);
    let cfg = config(&root);
    let err = DcrnnSupervisor::new(&ring(5), 2011, &cfg).err().unwrap();
    assert!(matches!(err, DcrnnError::Data(_)));
    fs::remove_dir_all(&root).unwrap();
}
