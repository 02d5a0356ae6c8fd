//! Per-client sessions and the shared computer-handle pool.

mod manager;
mod pool;

pub use manager::{ManagerOptions, RunRequest, SessionManager};
pub use pool::ComputerPool;
