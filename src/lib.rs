//! Year-over-year DCRNN traffic forecasting on an evolving sensor graph.
//!
//! Each year gets its own [`supervisor::DcrnnSupervisor`]: it trains a
//! diffusion-convolutional seq2seq model on that year's data and, from the
//! second year on, starts from the best checkpoint of the year before.

pub mod autodiff;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod loss;
pub mod model;
pub mod optim;
pub mod results;
pub mod scalars;
pub mod supervisor;
pub mod supports;

pub use config::{CliArgs, SupervisorConfig};
pub use error::{DcrnnError, Result};
pub use results::YearlyResults;
pub use supervisor::{DcrnnSupervisor, StopReason, TrainSummary};
pub use supports::Adjacency;
