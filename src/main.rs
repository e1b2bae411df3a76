// ============================================================================
// STREAM-DCRNN: yearly training driver
// ============================================================================

use std::fs;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use log::info;

use stream_dcrnn::logging::{self, YearLog};
use stream_dcrnn::{Adjacency, CliArgs, DcrnnSupervisor, StopReason, SupervisorConfig, YearlyResults};

fn run(cli: &CliArgs) -> Result<()> {
    let Some(path) = &cli.config_filename else {
        bail!("missing --config_filename=<path>");
    };
    let mut config = SupervisorConfig::load(path)
        .and_then(|c| c.with_overrides(&cli.overrides))
        .with_context(|| format!("loading config {}", path.display()))?;
    let year_log = YearLog::new();
    logging::init(&config.log_level, year_log.clone());

    // one run directory shared by every year
    let log_dir = config.resolve_log_dir().context("creating log dir")?;
    config.train.log_dir = Some(log_dir.clone());

    println!("\n{}\n   STREAM-DCRNN | DIFFUSION CONV RNN, YEARS {}..={}\n{}\n",
        "=".repeat(70), config.data.begin_year, config.data.end_year, "=".repeat(70));
    let m = &config.model;
    println!("Config: filter={:?} K={} layers={} units={} seq={} horizon={} lr={} epochs={} batch={}",
        m.filter_type, m.max_diffusion_step, m.num_rnn_layers, m.rnn_units, m.seq_len, m.horizon,
        config.train.base_lr, config.train.epochs, config.data.batch_size);
    if cli.use_cpu_only { info!("use_cpu_only set; the engine always runs on the CPU"); }

    let t0 = Instant::now();
    let mut results = YearlyResults::new();
    for year in config.data.begin_year..=config.data.end_year {
        let adj_path = config.data.graph_pkl_filename.join(format!("{}_adj.json", year));
        let adj = Adjacency::load(&adj_path)
            .with_context(|| format!("loading adjacency for {}", year))?;
        year_log.open_year(&log_dir, year)
            .with_context(|| format!("opening log file for {}", year))?;
        info!("[{}] graph with {} nodes", year, adj.num_nodes());

        let mut sup = DcrnnSupervisor::new(&adj, year, &config)
            .with_context(|| format!("setting up year {}", year))?;
        let summary = sup.train().with_context(|| format!("training year {}", year))?;
        let stop = match summary.stop_reason {
            StopReason::Completed => "completed".to_string(),
            StopReason::EarlyStopped { epoch } => format!("early stop at epoch {}", epoch),
        };
        println!("Year {} | best val MAE: {:.4} | epochs: {} | batches: {} | {}",
            year, summary.best_val_loss, summary.epochs_run, summary.batches_seen, stop);
        results.merge(sup.results());
    }
    year_log.close_year();

    if !results.is_empty() {
        info!("results by horizon and year:\n{}", results);
        let out = config.base_dir.join("results.json");
        fs::create_dir_all(&config.base_dir)
            .with_context(|| format!("creating {}", config.base_dir.display()))?;
        fs::write(&out, serde_json::to_string_pretty(&results)?)
            .with_context(|| format!("writing {}", out.display()))?;
    }
    println!("\nDone in {:.1}s\n", t0.elapsed().as_secs_f64());
    Ok(())
}

fn main() {
    let cli = CliArgs::from_args();
    println!("\nUsage: stream-dcrnn --config_filename=config.json [options]");
    println!("Options: --use_cpu_only=true --train.epochs=100 --data.batch_size=64 --model.rnn_units=64 etc.\n");

    if let Err(e) = run(&cli) {
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}
