pub mod codec;
pub mod commands;
pub mod config;
pub mod error;
pub mod job;
pub mod optimizer;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod worker;

pub use error::{JobError, PoolError};
pub use pipeline::{Orchestrator, ResultRecord};
pub use pool::{PoolConfig, WorkerPool};
