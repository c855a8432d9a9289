//! pipegate: serve a stdio JSON-RPC backend over an authenticated SSE
//! endpoint.
//!
//! The binary in `main.rs` is a thin shell around [`server::start`]; the
//! HTTP surface lives in [`front_door`] and the bridging logic in
//! `pipegate_core`.

pub mod cli;
pub mod error;
pub mod front_door;
pub mod server;
