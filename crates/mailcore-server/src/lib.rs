pub mod config;
pub mod diagnostic_logging;
pub mod duration;
pub mod echo;
pub mod panic;
pub mod start;
pub mod stdio;
pub mod store;
pub mod supervisor;
pub mod tls_helpers;
pub mod worker;

pub use config::Config;
pub use worker::{Outcome, Worker, WorkerState, WorkerTiming};
