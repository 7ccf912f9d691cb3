//! Postline pipeline runner: executes a pipeline's agent nodes one at a time
//! and keeps the run record the dashboard renders.

pub mod agent;
pub mod config;
pub mod events;
pub mod formatter;
pub mod models;
pub mod order;
pub mod runtime;
pub mod server;
pub mod simulator;
