//! Gateway Enforcement Surface (§4.4): the three thin layers that sit in
//! front of the `caracal-core` evaluator and gate a downstream call.
//!
//! - [`wrapper`] — an in-process function decorator for direct calls.
//! - [`middleware`] — an `axum` request middleware for HTTP services.
//! - [`adapter`] — a template for wrapping a specific external vendor API.
//! - [`mcp`] — the MCP-shaped enforcement endpoints (§6) built on top of
//!   [`middleware`]'s evaluator plumbing.
//!
//! All four share the same evaluator call and the same denial-to-machine-code
//! mapping in [`codes`].

pub mod adapter;
pub mod codes;
pub mod mcp;
pub mod middleware;
pub mod wrapper;

pub use codes::denial_code;
pub use wrapper::{require_authority, AuthorityDenied};
