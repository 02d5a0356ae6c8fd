//! # DeskPilot
//!
//! Orchestration core for computer-use agents: a language model looks at a
//! sandboxed desktop, decides what to do, and DeskPilot makes it happen.
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │         Proxy (HTTP/peer)        │
//!        └────────────────┬─────────────────┘
//!                         │
//!                         ▼
//!        ┌──────────────────────────────────┐
//!        │  SessionManager + ComputerPool   │
//!        └────────────────┬─────────────────┘
//!                         │
//!                         ▼
//!        ┌──────────────────────────────────┐
//!        │   Orchestrator (capture → ask    │
//!        │      → act → observe loop)       │
//!        └───────┬─────────────────┬────────┘
//!                │                 │
//!                ▼                 ▼
//!        ┌──────────────┐  ┌──────────────┐
//!        │ Agent loops  │  │ Computer port│
//!        │ (per model)  │  │  (sandbox)   │
//!        └──────────────┘  └──────────────┘
//! ```
//!
//! ## Run Flow
//! 1. A request arrives with a model string, a task, and computer kwargs
//! 2. The session manager leases a computer handle from the pool
//! 3. The model string resolves to an agent loop adapter (or a
//!    planner+grounder composite)
//! 4. The orchestrator loops: screenshot → model turn → dispatch actions →
//!    feed results back, under step/budget/time limits
//! 5. The structured result (messages, usage, status) returns to the caller
//!
//! ## Modules
//! - `schema`: canonical wire types for messages, actions, and usage
//! - `loops`: one adapter per model family, plus composites
//! - `callbacks`: middleware around every stage of a run
//! - `run`: the orchestrator state machine
//! - `session`: sessions, the computer pool, graceful shutdown
//! - `api`: HTTP and peer-channel proxy

pub mod api;
pub mod callbacks;
pub mod computer;
pub mod config;
pub mod env;
pub mod error;
pub mod llm;
pub mod loops;
pub mod run;
pub mod schema;
pub mod session;

pub use config::Config;
pub use error::{AgentError, RunStatus};
