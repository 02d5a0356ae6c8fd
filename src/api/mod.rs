//! The proxy surface.
//!
//! ## Endpoints
//!
//! - `POST /responses` - execute one run and return its output
//! - `GET /health` - pool-backed health probe
//! - `GET /peer` - peer data channel: one JSON message per request/response
//!
//! Both transports share one dispatcher; the proxy never raises run errors
//! as transport failures, it always answers with a structured response.

mod p2p;
mod routes;
mod types;

pub use routes::{router, serve, AppState, ServeMode};
pub use types::{AgentKwargs, HealthResponse, InputPayload, ResponsesRequest, ResponsesResponse};
